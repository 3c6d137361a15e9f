//! # parsim-core
//!
//! A conservative parallel discrete-event simulation kernel.
//!
//! Simulated entities are partitioned across worker threads called
//! *timelines*. Virtual time advances in *synchronization windows*: between
//! windows the timelines meet at a reducing barrier and agree on the next
//! horizon no cross-timeline event can penetrate; inside a window every
//! timeline executes its own event heap without locks. Channel pairs whose
//! lookahead is smaller than the window can instead synchronize pairwise
//! through *appointments* (composite synchronization).
//!
//! ## Quick start
//!
//! ```no_run
//! use parsim_core::{DEFAULT_PRIORITY, Interface};
//!
//! // two timelines, microsecond clock
//! let mut sim = Interface::new(2, 6);
//!
//! let node = sim.create_entity(sim.get_timeline(0), Some("node-0"));
//! let hello = sim.create_process(node, Some("hello"), DEFAULT_PRIORITY, |ctx, _act| {
//!     println!("hello at t={}", ctx.now());
//! });
//! sim.set_init(node, move |ctx| {
//!     node.wait_for_process(ctx, hello, 10);
//! });
//!
//! sim.init_model();
//! let reached = sim.advance(1_000);
//! assert_eq!(reached, 1_000);
//! println!("{}", sim.runtime_measurements());
//! ```
//!
//! ## Architecture
//!
//! Entities → Processes / Channels → Timelines → Windows
//!
//! - An [`Entity`] is aligned to exactly one timeline for its lifetime and
//!   owns processes, in-channels, and out-channels.
//! - [`OutChannel::write`] fans an [`Activation`] out over the channel
//!   mappings; each mapping accumulates the per-write minimum delay plus a
//!   transfer delay. [`InChannel`]s run their bound/waiting processes when
//!   the activation arrives.
//! - Ordering is total and deterministic: events fire in
//!   `(time, tie-break, sequence)` order on every timeline.
//! - The kernel never retries: failed deliveries and rejected mappings
//!   surface through return values at the call site.

mod barrier;
mod channel;
mod entity;
mod event;
mod interface;
mod process;
mod queue;
mod time;
mod timeline;

pub use barrier::BarrierKind;
pub use channel::{InChannel, MapError, OutChannel};
pub use entity::Entity;
pub use event::{Activation, DEFAULT_PRIORITY, Handle};
pub use interface::{
    Interface, RuntimeMeasurements, SimConfig, SyncPolicy, TimelineMeasurements,
};
pub use process::{Process, ProcessBody};
pub use time::{NO_TIME, Tick, TimeScale};
pub use timeline::{SimCtx, TimelineId};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
