//! Processes: named callables owned by entities.
//!
//! A process body runs to completion inside a single virtual-time instant;
//! there are no suspension points. Bodies re-enter the kernel through the
//! [`SimCtx`] they are handed (scheduling timeouts, writing channels,
//! binding), never by calling other bodies directly.

use std::sync::Mutex;

use crate::entity::Entity;
use crate::event::Activation;
use crate::timeline::SimCtx;

/// Handle to a process. Processes are created during model construction
/// and live for the whole simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Process(pub(crate) u32);

/// A process code body. Receives the dispatch context and the activation
/// (payload) that caused the invocation, if any.
pub type ProcessBody = Box<dyn FnMut(&mut SimCtx<'_>, Option<Activation>) + Send>;

pub(crate) struct ProcessRec {
    pub owner: Entity,
    pub timeline: usize,
    pub priority: u32,
    pub name: Option<String>,
    /// Interior mutability so the frozen world can hand out `FnMut` bodies;
    /// only the owning timeline ever takes the lock.
    pub body: Mutex<ProcessBody>,
}

impl Process {
    /// The entity that owns this process.
    pub fn owner(self, ctx: &SimCtx<'_>) -> Entity {
        ctx.world().process(self).owner
    }

    /// The per-entity name given at creation, if any.
    pub fn name(self, ctx: &SimCtx<'_>) -> Option<String> {
        ctx.world().process(self).name.clone()
    }

    /// The user priority given at creation, used to order activations when
    /// several processes wait on one in-channel.
    pub fn priority(self, ctx: &SimCtx<'_>) -> u32 {
        ctx.world().process(self).priority
    }
}
