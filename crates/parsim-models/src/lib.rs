//! # parsim-models
//!
//! Demo and benchmark models built on the `parsim-core` kernel. The main
//! resident is the classic PHOLD workload: a clique of nodes bouncing
//! messages with exponentially sampled holding times, the standard stress
//! test for parallel discrete-event synchronization. A deterministic token
//! ring complements it for exact-timing checks and overhead benchmarks.

pub mod phold;
pub mod ring;

pub use phold::{PholdClique, PholdParams, build_clique};
pub use ring::{Ring, RingParams, build_ring};
