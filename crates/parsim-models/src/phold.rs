//! PHOLD: a clique of message-bouncing nodes.
//!
//! Every node owns one in-channel port per peer (`IC-<sender>`, so sender
//! `j` always targets port `j`) and one out-channel per peer. A `listen`
//! process is bound to every port; on each arrival it samples an
//! exponential holding time and schedules the `talk` process, which writes
//! the activation to the next peer round-robin. Each node seeds the clique
//! with one message per port at init, so the message population stays
//! constant and every timeline keeps busy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use parsim_core::{Interface, Tick};

/// Shape of a PHOLD clique.
#[derive(Debug, Clone, Copy)]
pub struct PholdParams {
    /// Number of nodes (and ports per node: the graph is a full clique,
    /// self-loop included).
    pub nodes: usize,
    /// RNG seed; each node derives its own deterministic stream from it.
    pub seed: u64,
    /// Mean holding time in milliseconds.
    pub mean_hold_ms: f64,
    /// Per-write minimum delay on every out-channel.
    pub min_write_delay: Tick,
    /// Per-mapping transfer delay.
    pub transfer_delay: Tick,
}

impl Default for PholdParams {
    fn default() -> Self {
        PholdParams {
            nodes: 4,
            seed: 0x5eed,
            mean_hold_ms: 0.1,
            min_write_delay: 1,
            transfer_delay: 5,
        }
    }
}

/// Handles into a built clique, for inspection after the run.
pub struct PholdClique {
    /// Activations processed per node (listen and talk both count).
    pub received: Vec<Arc<AtomicU64>>,
}

impl PholdClique {
    /// Sum of all nodes' received counters.
    pub fn total_received(&self) -> u64 {
        self.received.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }
}

struct NodeState {
    rng: StdRng,
    next_out: usize,
}

/// Message bounced around the clique. The payload is opaque to the kernel;
/// nodes only forward it.
struct PholdMessage {
    #[allow(dead_code)]
    msg_id: u32,
}

/// Build a PHOLD clique on `sim`, round-robining nodes over its timelines.
/// Call before `init_model`.
pub fn build_clique(sim: &mut Interface, params: PholdParams) -> PholdClique {
    assert!(params.nodes > 0, "a clique needs at least one node");
    let n = params.nodes;
    let timelines = sim.num_timelines();
    log::debug!("building PHOLD clique: {n} nodes over {timelines} timelines");
    let mut received = Vec::with_capacity(n);

    for id in 0..n {
        let entity = sim.create_entity(sim.get_timeline(id % timelines), Some(&format!("Entity-{id}")));
        let in_channels: Vec<_> = (0..n)
            .map(|j| sim.create_in_channel(entity, Some(&format!("IC-{j}"))))
            .collect();
        let out_channels: Vec<_> = (0..n)
            .map(|_| sim.create_out_channel(entity, params.min_write_delay))
            .collect();

        let recvd = Arc::new(AtomicU64::new(0));
        received.push(recvd.clone());
        let state = Arc::new(Mutex::new(NodeState {
            rng: StdRng::seed_from_u64(params.seed.wrapping_add(id as u64)),
            next_out: (id + 1) % n,
        }));

        // talk: forward the activation to the next peer round-robin.
        let talk_state = state.clone();
        let talk_recvd = recvd.clone();
        let talk_outs = out_channels.clone();
        let talk = sim.create_process(entity, Some("talk"), id as u32, move |ctx, act| {
            talk_recvd.fetch_add(1, Ordering::Relaxed);
            let target = {
                let mut st = talk_state.lock().unwrap();
                let t = st.next_out % talk_outs.len();
                st.next_out += 1;
                t
            };
            let act = act.expect("phold messages always carry a payload");
            talk_outs[target].write_pri(ctx, act, id as u32);
        });

        // listen: sample a holding time, then hand off to talk.
        let listen_state = state.clone();
        let listen_recvd = recvd.clone();
        let listen = sim.create_process(entity, Some("listen"), id as u32, move |ctx, act| {
            listen_recvd.fetch_add(1, Ordering::Relaxed);
            let millis = {
                let mut st = listen_state.lock().unwrap();
                let u: f64 = st.rng.random();
                -params.mean_hold_ms * (1.0 - u).ln()
            };
            let ticks = ctx.scale().d2t_at(millis, 3) + 1;
            let act = act.expect("phold messages always carry a payload");
            entity.wait_for_full(ctx, talk, Some(act), ticks, id as u32);
        });

        for ic in &in_channels {
            sim.bind(*ic, listen);
        }

        // Wire the clique and seed one message per port once everything
        // exists.
        let outs = out_channels.clone();
        sim.set_init(entity, move |ctx| {
            for (peer, out) in outs.iter().enumerate() {
                let peer_entity = ctx
                    .entity_by_name(&format!("Entity-{peer}"))
                    .expect("clique peer exists");
                let port = ctx
                    .in_channel_by_name(peer_entity, &format!("IC-{id}"))
                    .expect("clique port exists");
                out.mapto(ctx, port, params.transfer_delay)
                    .expect("clique mapping is legal");
            }
            let seed_msg: parsim_core::Activation = Arc::new(PholdMessage {
                msg_id: (id as u32) << 8,
            });
            for out in &outs {
                out.write_pri(ctx, seed_msg.clone(), id as u32);
            }
        });
    }

    PholdClique { received }
}
