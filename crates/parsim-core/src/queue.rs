//! Per-timeline event list: a min-heap on `(time, tie_break, seq)`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::event::Event;
use crate::time::{NO_TIME, Tick};

/// The event list owned by one timeline. Only the owning timeline touches
/// it; arrivals from other timelines go through the timeline's inbox or
/// appointment slots and are spliced in by the owner.
#[derive(Default)]
pub(crate) struct EventQueue {
    heap: BinaryHeap<Reverse<Event>>,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue {
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, ev: Event) {
        self.heap.push(Reverse(ev));
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.heap.pop().map(|Reverse(ev)| ev)
    }

    /// Timestamp of the earliest event, or [`NO_TIME`] when empty.
    pub fn peek_time(&self) -> Tick {
        self.heap.peek().map_or(NO_TIME, |Reverse(ev)| ev.time)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

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
    fn test_pops_in_total_order() {
        let mut q = EventQueue::new();
        q.push(ev(20, 256, 0));
        q.push(ev(10, 512, 1));
        q.push(ev(10, 256, 3));
        q.push(ev(10, 256, 2));

        let keys: Vec<_> = std::iter::from_fn(|| q.pop())
            .map(|e| (e.time, e.key2, e.seq))
            .collect();
        assert_eq!(keys, vec![(10, 256, 2), (10, 256, 3), (10, 512, 1), (20, 256, 0)]);
    }

    #[test]
    fn test_peek_time_sentinel() {
        let mut q = EventQueue::new();
        assert_eq!(q.peek_time(), NO_TIME);
        q.push(ev(7, 0, 0));
        assert_eq!(q.peek_time(), 7);
        q.pop();
        assert_eq!(q.peek_time(), NO_TIME);
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
    }
}
