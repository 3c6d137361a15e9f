//! Virtual time and clock-scale conversions.
//!
//! Simulation time is a signed 64-bit count of *ticks*. The meaning of a
//! tick is fixed when the [`Interface`](crate::Interface) is built, as the
//! base-10 logarithm of the number of ticks per simulated second (6 means
//! microseconds, 9 means nanoseconds). `-1` is the shared "no value"
//! sentinel; every user-facing time is non-negative.

/// Virtual time, in ticks.
pub type Tick = i64;

/// Sentinel for "no meaningful time value".
pub const NO_TIME: Tick = -1;

/// Clock scale of a simulation, with tick/float conversion helpers.
///
/// Conversions mirror the usual fixed-point idiom: a precomputed table of
/// powers of ten covers the common scale offsets, with a `powi` fallback
/// for extreme ones.
#[derive(Debug, Clone)]
pub struct TimeScale {
    log_ticks_per_sec: i32,
    pow: [f64; 36],
}

impl TimeScale {
    pub fn new(log_ticks_per_sec: i32) -> Self {
        let mut pow = [0.0; 36];
        for (i, p) in pow.iter_mut().enumerate() {
            *p = 10f64.powi(i as i32 - 18);
        }
        TimeScale {
            log_ticks_per_sec,
            pow,
        }
    }

    /// Base-10 logarithm of ticks per simulated second.
    pub fn log_ticks_per_sec(&self) -> i32 {
        self.log_ticks_per_sec
    }

    /// Ticks to float, where the float shares the clock's own units.
    pub fn t2d(&self, t: Tick) -> f64 {
        t as f64
    }

    /// Float to ticks, where the float shares the clock's own units.
    pub fn d2t(&self, d: f64) -> Tick {
        d as Tick
    }

    /// Ticks to float, where the float is in units of `10^s` per second.
    ///
    /// For example with a microsecond clock (`log_ticks_per_sec == 6`),
    /// `t2d_at(t, 3)` yields milliseconds.
    pub fn t2d_at(&self, t: Tick, s: i32) -> f64 {
        let scale = 18 + (s - self.log_ticks_per_sec);
        if (0..36).contains(&scale) {
            t as f64 * self.pow[scale as usize]
        } else {
            t as f64 * 10f64.powi(scale - 18)
        }
    }

    /// Float in units of `10^s` per second to ticks, rounded.
    pub fn d2t_at(&self, d: f64, s: i32) -> Tick {
        let scale = 18 + (self.log_ticks_per_sec - s);
        if (0..36).contains(&scale) {
            (d * self.pow[scale as usize]).round() as Tick
        } else {
            (d * 10f64.powi(scale - 18)).round() as Tick
        }
    }

    /// Ticks to simulated seconds.
    pub fn to_seconds(&self, t: Tick) -> f64 {
        self.t2d_at(t, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_unit_conversions_are_identity() {
        let ts = TimeScale::new(6);
        assert_eq!(ts.t2d(1500), 1500.0);
        assert_eq!(ts.d2t(1500.0), 1500);
    }

    #[test]
    fn test_scaled_conversions_microsecond_clock() {
        // microsecond clock: 2.5 ms == 2500 ticks
        let ts = TimeScale::new(6);
        assert_eq!(ts.d2t_at(2.5, 3), 2500);
        assert!((ts.t2d_at(2500, 3) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_scaled_conversion_rounds() {
        let ts = TimeScale::new(6);
        // 0.1 ms on a microsecond clock is 100 ticks, 0.0004 ms rounds away
        assert_eq!(ts.d2t_at(0.1004, 3), 100);
    }

    #[test]
    fn test_to_seconds() {
        let ts = TimeScale::new(6);
        assert!((ts.to_seconds(3_000_000) - 3.0).abs() < 1e-12);
    }
}
