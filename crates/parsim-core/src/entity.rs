//! Entities: simulation actors aligned to one timeline.
//!
//! An entity owns processes, in-channels, and out-channels, and its
//! alignment is fixed for its lifetime. The `wait_for` family schedules a
//! self-timeout on the owning timeline and returns a cancellation handle.

use std::collections::HashMap;

use crate::channel::{InChannel, OutChannel};
use crate::event::{Activation, DEFAULT_PRIORITY, Handle, user_pri};
use crate::process::Process;
use crate::time::Tick;
use crate::timeline::SimCtx;

/// Handle to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Entity(pub(crate) u32);

pub(crate) struct EntityRec {
    pub name: Option<String>,
    pub timeline: usize,
    pub in_channels: Vec<InChannel>,
    pub out_channels: Vec<OutChannel>,
    pub processes: Vec<Process>,
    pub in_channel_names: HashMap<String, InChannel>,
    pub process_names: HashMap<String, Process>,
}

impl Entity {
    /// The timeline this entity is aligned to.
    pub fn timeline(self, ctx: &SimCtx<'_>) -> usize {
        ctx.world().entity(self).timeline
    }

    /// The name given at creation, if any.
    pub fn name(self, ctx: &SimCtx<'_>) -> Option<String> {
        ctx.world().entity(self).name.clone()
    }

    /// The in-channels owned by this entity, in creation order.
    pub fn in_channels(self, ctx: &SimCtx<'_>) -> Vec<InChannel> {
        ctx.world().entity(self).in_channels.clone()
    }

    /// The out-channels owned by this entity, in creation order.
    pub fn out_channels(self, ctx: &SimCtx<'_>) -> Vec<OutChannel> {
        ctx.world().entity(self).out_channels.clone()
    }

    /// The processes owned by this entity, in creation order.
    pub fn processes(self, ctx: &SimCtx<'_>) -> Vec<Process> {
        ctx.world().entity(self).processes.clone()
    }

    /// Schedule the currently running process again after `delay` ticks,
    /// with no payload and the default priority.
    pub fn wait_for(self, ctx: &mut SimCtx<'_>, delay: Tick) -> Handle {
        let proc = ctx
            .current_process()
            .expect("wait_for without a process requires a running process body");
        self.wait_for_full(ctx, proc, None, delay, DEFAULT_PRIORITY)
    }

    /// Schedule `proc` after `delay` ticks with no payload and the default
    /// priority.
    pub fn wait_for_process(self, ctx: &mut SimCtx<'_>, proc: Process, delay: Tick) -> Handle {
        self.wait_for_full(ctx, proc, None, delay, DEFAULT_PRIORITY)
    }

    /// Schedule `proc` after `delay` ticks with an explicit tie-break
    /// priority and no payload.
    pub fn wait_for_pri(
        self,
        ctx: &mut SimCtx<'_>,
        proc: Process,
        delay: Tick,
        pri: u32,
    ) -> Handle {
        self.wait_for_full(ctx, proc, None, delay, pri)
    }

    /// Schedule `proc` after `delay` ticks, delivering `activation` to the
    /// body, tie-broken by `pri`. The full form of the family.
    pub fn wait_for_full(
        self,
        ctx: &mut SimCtx<'_>,
        proc: Process,
        activation: Option<Activation>,
        delay: Tick,
        pri: u32,
    ) -> Handle {
        let core = &mut *ctx.core;
        assert_eq!(
            core.world.entity(self).timeline,
            core.id,
            "wait_for on an entity aligned to a different timeline"
        );
        let at = core.clock + delay;
        core.schedule_timeout(proc, at, user_pri(pri), activation)
    }
}
