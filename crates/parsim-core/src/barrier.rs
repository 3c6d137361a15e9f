//! Reducing barriers used for window synchronization.
//!
//! Every participant offers a time value on entry; non-negative offers are
//! folded into a `(min, max, sum)` reduction that all participants may read
//! after release. Exactly one participant (the last to arrive) gets `-1`
//! back from `wait`, the rest get `0`, so serial post-barrier work can be
//! assigned without further coordination.
//!
//! Two implementations sit behind one front: a mutex/condvar barrier and a
//! sense-reversing spin barrier. They are interchangeable; the spin flavor
//! trades wakeup latency for busy cycles.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crate::time::{NO_TIME, Tick};

/// Which barrier implementation a simulation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BarrierKind {
    /// Block arrivals on a condition variable.
    #[default]
    Mutex,
    /// Spin (with yields) on a generation counter.
    Spin,
}

/// Reduction triple produced by one barrier cycle.
#[derive(Debug, Clone, Copy)]
struct Reduction {
    min: Tick,
    max: Tick,
    sum: Tick,
}

impl Reduction {
    fn empty() -> Self {
        Reduction {
            min: NO_TIME,
            max: NO_TIME,
            sum: 0,
        }
    }

    fn offer(&mut self, t: Tick) {
        if t < 0 {
            return;
        }
        if self.min < 0 || t < self.min {
            self.min = t;
        }
        if self.max < 0 || t > self.max {
            self.max = t;
        }
        self.sum += t;
    }
}

/// Barrier front dispatching to the configured implementation.
pub(crate) enum Barrier {
    Mutex(MutexBarrier),
    Spin(SpinBarrier),
}

impl Barrier {
    pub fn new(kind: BarrierKind, parties: usize) -> Self {
        match kind {
            BarrierKind::Mutex => Barrier::Mutex(MutexBarrier::new(parties)),
            BarrierKind::Spin => Barrier::Spin(SpinBarrier::new(parties)),
        }
    }

    /// Wait for all parties. `who` identifies the caller (used by the spin
    /// flavor's per-party slots). Returns `-1` to the last arrival, `0` to
    /// everyone else.
    pub fn wait(&self, who: usize, offer: Tick) -> i32 {
        match self {
            Barrier::Mutex(b) => b.wait(offer),
            Barrier::Spin(b) => b.wait(who, offer),
        }
    }

    /// Minimum non-negative offer of the last completed cycle, or
    /// [`NO_TIME`] if every offer was negative.
    pub fn min(&self) -> Tick {
        match self {
            Barrier::Mutex(b) => b.min(),
            Barrier::Spin(b) => b.min(),
        }
    }

    /// Maximum non-negative offer of the last completed cycle, or
    /// [`NO_TIME`] if every offer was negative.
    pub fn max(&self) -> Tick {
        match self {
            Barrier::Mutex(b) => b.max(),
            Barrier::Spin(b) => b.max(),
        }
    }

    /// Sum of the non-negative offers of the last completed cycle. Part of
    /// the reduction triple even though the kernel's window protocol only
    /// consumes min and max.
    #[allow(dead_code)]
    pub fn sum(&self) -> Tick {
        match self {
            Barrier::Mutex(b) => b.sum(),
            Barrier::Spin(b) => b.sum(),
        }
    }
}

// ---------------------------------------------------------------------------
// Mutex + condvar flavor
// ---------------------------------------------------------------------------

struct MutexInner {
    arrived: usize,
    cycle: u64,
    acc: Reduction,
    done: Reduction,
}

pub(crate) struct MutexBarrier {
    parties: usize,
    inner: Mutex<MutexInner>,
    cv: Condvar,
}

impl MutexBarrier {
    fn new(parties: usize) -> Self {
        assert!(parties > 0);
        MutexBarrier {
            parties,
            inner: Mutex::new(MutexInner {
                arrived: 0,
                cycle: 0,
                acc: Reduction::empty(),
                done: Reduction::empty(),
            }),
            cv: Condvar::new(),
        }
    }

    fn wait(&self, offer: Tick) -> i32 {
        let mut inner = self.inner.lock().unwrap();
        let my_cycle = inner.cycle;
        inner.acc.offer(offer);
        inner.arrived += 1;
        if inner.arrived == self.parties {
            inner.done = inner.acc;
            inner.acc = Reduction::empty();
            inner.arrived = 0;
            inner.cycle += 1;
            self.cv.notify_all();
            -1
        } else {
            while inner.cycle == my_cycle {
                inner = self.cv.wait(inner).unwrap();
            }
            0
        }
    }

    fn min(&self) -> Tick {
        self.inner.lock().unwrap().done.min
    }

    fn max(&self) -> Tick {
        self.inner.lock().unwrap().done.max
    }

    #[allow(dead_code)]
    fn sum(&self) -> Tick {
        self.inner.lock().unwrap().done.sum
    }
}

// ---------------------------------------------------------------------------
// Sense-reversing spin flavor
// ---------------------------------------------------------------------------

pub(crate) struct SpinBarrier {
    parties: usize,
    arrived: AtomicUsize,
    generation: AtomicUsize,
    offers: Vec<AtomicI64>,
    done_min: AtomicI64,
    done_max: AtomicI64,
    done_sum: AtomicI64,
}

impl SpinBarrier {
    fn new(parties: usize) -> Self {
        assert!(parties > 0);
        SpinBarrier {
            parties,
            arrived: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
            offers: (0..parties).map(|_| AtomicI64::new(NO_TIME)).collect(),
            done_min: AtomicI64::new(NO_TIME),
            done_max: AtomicI64::new(NO_TIME),
            done_sum: AtomicI64::new(0),
        }
    }

    fn wait(&self, who: usize, offer: Tick) -> i32 {
        self.offers[who].store(offer, Ordering::Release);
        let gen_snapshot = self.generation.load(Ordering::Acquire);
        if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 == self.parties {
            let mut red = Reduction::empty();
            for slot in &self.offers {
                red.offer(slot.load(Ordering::Acquire));
            }
            self.done_min.store(red.min, Ordering::Release);
            self.done_max.store(red.max, Ordering::Release);
            self.done_sum.store(red.sum, Ordering::Release);
            self.arrived.store(0, Ordering::Release);
            self.generation.fetch_add(1, Ordering::Release);
            -1
        } else {
            while self.generation.load(Ordering::Acquire) == gen_snapshot {
                std::hint::spin_loop();
                std::thread::yield_now();
            }
            0
        }
    }

    fn min(&self) -> Tick {
        self.done_min.load(Ordering::Acquire)
    }

    fn max(&self) -> Tick {
        self.done_max.load(Ordering::Acquire)
    }

    #[allow(dead_code)]
    fn sum(&self) -> Tick {
        self.done_sum.load(Ordering::Acquire)
    }
}
