//! Token ring: the minimal pipelined workload.
//!
//! N nodes in a directed cycle, each forwarding a token to its successor
//! over a fixed-delay link. With no randomness the hop times are exact,
//! which makes the ring the model of choice for checking delivery timing
//! and for benchmarking synchronization overhead against a workload whose
//! event count is known in closed form.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parsim_core::{Interface, Tick};

/// Shape of a token ring.
#[derive(Debug, Clone, Copy)]
pub struct RingParams {
    /// Number of nodes in the cycle.
    pub nodes: usize,
    /// Per-link transfer delay; each hop takes `link_delay + 1` ticks in
    /// total (the out-channels carry a minimum write delay of 1).
    pub link_delay: Tick,
    /// Number of tokens circulating, started on distinct nodes.
    pub tokens: usize,
}

impl Default for RingParams {
    fn default() -> Self {
        RingParams {
            nodes: 4,
            link_delay: 4,
            tokens: 1,
        }
    }
}

/// Handles into a built ring.
pub struct Ring {
    /// Forwarded-token count per node.
    pub hops: Vec<Arc<AtomicU64>>,
    /// Total virtual time one hop takes.
    pub hop_time: Tick,
}

impl Ring {
    pub fn total_hops(&self) -> u64 {
        self.hops.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }
}

/// Build a token ring on `sim`, round-robining nodes over its timelines.
/// Call before `init_model`.
pub fn build_ring(sim: &mut Interface, params: RingParams) -> Ring {
    assert!(params.nodes > 1, "a ring needs at least two nodes");
    assert!(params.tokens >= 1 && params.tokens <= params.nodes);
    assert!(params.link_delay >= 0);
    let n = params.nodes;
    let timelines = sim.num_timelines();
    log::debug!("building token ring: {n} nodes over {timelines} timelines");

    let mut hops = Vec::with_capacity(n);
    for id in 0..n {
        let entity = sim.create_entity(sim.get_timeline(id % timelines), Some(&format!("Ring-{id}")));
        let input = sim.create_in_channel(entity, Some("in"));
        let output = sim.create_out_channel(entity, 1);

        let count = Arc::new(AtomicU64::new(0));
        hops.push(count.clone());
        let forward = sim.create_process(entity, Some("forward"), id as u32, move |ctx, act| {
            count.fetch_add(1, Ordering::Relaxed);
            let token = act.expect("ring tokens always carry a payload");
            output.write_pri(ctx, token, id as u32);
        });
        sim.bind(input, forward);

        let starts_token = id < params.tokens;
        sim.set_init(entity, move |ctx| {
            let next = ctx
                .entity_by_name(&format!("Ring-{}", (id + 1) % n))
                .expect("ring successor exists");
            let next_in = ctx
                .in_channel_by_name(next, "in")
                .expect("ring successor port exists");
            output
                .mapto(ctx, next_in, params.link_delay)
                .expect("ring link is legal");
            if starts_token {
                output.write_pri(ctx, Arc::new(id as u64), id as u32);
            }
        });
    }

    Ring {
        hops,
        hop_time: params.link_delay + 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_counts_are_exact() {
        // One token, hop time 5: arrivals at t = 5, 10, ..., so a horizon
        // of T sees floor((T - 1) / 5) forwards.
        let mut sim = Interface::new(2, 6);
        let ring = build_ring(
            &mut sim,
            RingParams {
                nodes: 4,
                link_delay: 4,
                tokens: 1,
            },
        );
        sim.init_model();
        sim.advance(101);
        assert_eq!(ring.hop_time, 5);
        assert_eq!(ring.total_hops(), 20);
    }

    #[test]
    fn tokens_start_on_distinct_nodes() {
        let mut sim = Interface::new(1, 6);
        let ring = build_ring(
            &mut sim,
            RingParams {
                nodes: 3,
                link_delay: 9,
                tokens: 3,
            },
        );
        sim.init_model();
        sim.advance(100);
        // Three tokens, hop time 10: each hops at 10, 20, ..., 90.
        assert_eq!(ring.total_hops(), 27);
        for c in &ring.hops {
            assert_eq!(c.load(std::sync::atomic::Ordering::Relaxed), 9);
        }
    }
}
