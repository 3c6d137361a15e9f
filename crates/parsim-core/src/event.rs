//! Scheduled events, tie-break priority encoding, and cancellation handles.
//!
//! An event is an immutable work item keyed on `(time, tie_break, seq)`.
//! The triple is a total order: `time` is the virtual-time key, `tie_break`
//! separates same-time events into deterministic bands, and `seq` (a
//! per-timeline enqueue counter) breaks the remaining ties first-come
//! first-served. The only mutation an enqueued event ever sees is its
//! cancel flag being raised.

use std::any::Any;
use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use crate::channel::InChannel;
use crate::process::Process;
use crate::time::Tick;
use crate::timeline::TimelineShared;

/// Payload attached to an event and delivered to the process body that runs
/// because of it. Reference-counted and immutable; a write that fans out to
/// several recipients shares one allocation.
pub type Activation = Arc<dyn Any + Send + Sync>;

/// Default user scheduling priority: the largest 16-bit value. As with
/// time, smaller values fire earlier.
pub const DEFAULT_PRIORITY: u32 = (1 << 16) - 1;

/// Tie-break value below every other priority; reserved for the kernel's
/// appointment bookkeeping events.
pub(crate) const MIN_SCHED_PRI: i32 = i32::MAX;

/// Tie-break for `Activate` deliveries: the reserved band below every
/// user tie-break, so an arrival's fan-out runs ahead of all same-time
/// user events and same-time arrivals keep their enqueue order.
pub(crate) const ACTIVATE_SCHED_PRI: i32 = -1;

/// Map a user priority into the tie-break key space, leaving bands above
/// and below the user range for kernel-internal events.
pub(crate) fn user_pri(p: u32) -> i32 {
    (((p as u64 + 1) << 8) & 0x00FF_FFFF) as i32
}

/// What to do when an event fires.
#[derive(Clone)]
pub(crate) enum EventKind {
    /// Run a process body; produced by `wait_for`.
    Timeout {
        process: Process,
        activation: Option<Activation>,
    },
    /// An activation arrived at an in-channel; fans out to the waiting list.
    Activate {
        channel: InChannel,
        activation: Option<Activation>,
    },
    /// Run one process body from an `Activate` fan-out.
    ExecActivate {
        process: Process,
        channel: InChannel,
        activation: Option<Activation>,
    },
    /// Publish the next appointment time to a peer timeline.
    MakeAppt { peer: usize },
    /// Check (and possibly wait for) a peer timeline's appointment.
    WaitAppt { peer: usize },
    /// Apply a bind/wait-on that was deferred to avoid self-activation.
    Bind {
        channel: InChannel,
        process: Process,
        bound: bool,
        /// Tie-break-encoded waiting-list priority.
        pri: i32,
    },
}

/// A scheduled event. Ordering compares only the `(time, key2, seq)` key,
/// so the heap never looks at the payload.
pub(crate) struct Event {
    pub time: Tick,
    pub key2: i32,
    pub seq: u64,
    pub kind: EventKind,
    /// Present only for events that handed out a [`Handle`].
    pub cancelled: Option<Arc<AtomicBool>>,
}

impl Event {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
            .as_ref()
            .is_some_and(|f| f.load(AtomicOrdering::Acquire))
    }

    fn key(&self) -> (Tick, i32, u64) {
        (self.time, self.key2, self.seq)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Cancellation token returned by the scheduling primitives.
///
/// Cancelling marks the event so its dequeue is a no-op; the event keeps
/// its heap slot. Cancellation is a best-effort logical flag: it succeeds
/// only while the target time is still in the home timeline's future.
pub struct Handle {
    pub(crate) flag: Arc<AtomicBool>,
    pub(crate) time: Tick,
    pub(crate) home: Arc<TimelineShared>,
}

impl Handle {
    /// The virtual time the event was scheduled for.
    pub fn time(&self) -> Tick {
        self.time
    }

    /// Cancel the scheduled event. Returns `true` iff the target time is
    /// still strictly ahead of the home timeline's clock, re-checked after
    /// the mark so a race with execution reports failure.
    pub fn cancel(&self) -> bool {
        if self.time <= self.home.clock() {
            return false;
        }
        self.flag.store(true, AtomicOrdering::Release);
        self.time > self.home.clock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(time: Tick, key2: i32, seq: u64) -> Event {
        Event {
            time,
            key2,
            seq,
            kind: EventKind::MakeAppt { peer: 0 },
            cancelled: None,
        }
    }

    #[test]
    fn test_ordering_is_time_then_priority_then_seq() {
        assert!(ev(5, 0, 9) < ev(6, 0, 0));
        assert!(ev(5, 100, 9) < ev(5, 200, 0));
        assert!(ev(5, 100, 1) < ev(5, 100, 2));
    }

    #[test]
    fn test_user_pri_bands() {
        assert_eq!(user_pri(0), 256);
        assert_eq!(user_pri(5), 6 << 8);
        assert!(user_pri(0) < user_pri(1));
        // the encoding is the documented mask; the top value wraps
        assert_eq!(user_pri(DEFAULT_PRIORITY), 0);
        // the delivery band sits below the entire user band, the
        // appointment band above it
        assert!(ACTIVATE_SCHED_PRI < user_pri(DEFAULT_PRIORITY));
        assert!(user_pri(0) < MIN_SCHED_PRI - 1);
    }

    #[test]
    fn test_cancel_flag_observed() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut e = ev(10, 0, 0);
        e.cancelled = Some(flag.clone());
        assert!(!e.is_cancelled());
        flag.store(true, AtomicOrdering::Release);
        assert!(e.is_cancelled());
    }
}
