//! The channel graph: out-channels, in-channels, and their mappings.
//!
//! An out-channel carries a minimum per-write delay and a table of mappings
//! to in-channels; each mapping adds a transfer delay. A write materializes
//! `Activate` events at every mapped destination. In-channels keep an
//! ordered waiting list of processes to run when an activation arrives.
//!
//! Mapping mutations during a synchronization window are admitted only when
//! they cannot invalidate the window the timelines already agreed on;
//! otherwise they are deferred and applied by the owning timeline at the
//! window boundary.

use std::error::Error;
use std::fmt;
use std::sync::Mutex;

use crate::entity::Entity;
use crate::event::{ACTIVATE_SCHED_PRI, Activation, DEFAULT_PRIORITY, user_pri};
use crate::process::Process;
use crate::time::{NO_TIME, Tick};
use crate::timeline::{PendingDelay, PendingMap, SimCtx, TimelineState};

/// Handle to an in-channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InChannel(pub(crate) u32);

/// Handle to an out-channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutChannel(pub(crate) u32);

/// Why a mapping request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The endpoints are on different timelines and the total cross delay
    /// would be zero.
    ZeroDelayCrossTimeline,
    /// A mapping to the same in-channel already exists with a different
    /// transfer delay.
    DelayConflict,
    /// The named in-channel is not mapped to this out-channel.
    NotMapped,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::ZeroDelayCrossTimeline => {
                write!(f, "cross-timeline mapping with zero total delay")
            }
            MapError::DelayConflict => {
                write!(f, "in-channel already mapped with a different delay")
            }
            MapError::NotMapped => write!(f, "in-channel is not mapped to this out-channel"),
        }
    }
}

impl Error for MapError {}

/// One entry on an in-channel's waiting list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitEntry {
    pub process: Process,
    /// Bound entries survive activations; wait-on entries are one-shot.
    pub bound: bool,
    /// Tie-break-encoded priority.
    pub pri: i32,
}

/// Insert an entry immediately before the first existing entry with a
/// strictly larger priority, so equal priorities stay in insertion order.
pub(crate) fn insert_wait_entry(list: &mut Vec<WaitEntry>, entry: WaitEntry) {
    let pos = list
        .iter()
        .position(|e| e.pri > entry.pri)
        .unwrap_or(list.len());
    list.insert(pos, entry);
}

pub(crate) struct InChannelRec {
    pub owner: Entity,
    pub timeline: usize,
    pub name: Option<String>,
    pub waiting: Mutex<Vec<WaitEntry>>,
}

/// One mapping of an out-channel onto an in-channel.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MappedChannel {
    pub ic: InChannel,
    pub transfer_delay: Tick,
    /// True when the endpoints are aligned to different timelines.
    pub xtimeline: bool,
    /// True when the mapping's lookahead is below the window size and the
    /// pair synchronizes through appointments instead of the global window.
    pub asynchronous: bool,
}

pub(crate) struct OutChannelState {
    pub min_write_delay: Tick,
    pub mapped_to: Vec<MappedChannel>,
}

impl OutChannelState {
    pub fn total_delay(&self, m: &MappedChannel) -> Tick {
        self.min_write_delay + m.transfer_delay
    }

    /// Smallest transfer delay among cross-timeline mappings, or
    /// [`NO_TIME`] when there is none.
    pub fn min_xtransfer(&self) -> Tick {
        self.mapped_to
            .iter()
            .filter(|m| m.xtimeline)
            .map(|m| m.transfer_delay)
            .min()
            .unwrap_or(NO_TIME)
    }

    /// Smallest total cross delay at least `thrs`, or [`NO_TIME`]. The
    /// threshold excludes appointment-synchronized mappings from the
    /// global window computation.
    pub fn min_sync_cross_delay(&self, thrs: Tick) -> Tick {
        self.mapped_to
            .iter()
            .filter(|m| m.xtimeline)
            .map(|m| self.total_delay(m))
            .filter(|&d| d >= thrs)
            .min()
            .unwrap_or(NO_TIME)
    }

    /// Number of cross-timeline mappings whose total delay is exactly `d`.
    pub fn count_delay_crossings(&self, d: Tick) -> u32 {
        self.mapped_to
            .iter()
            .filter(|m| m.xtimeline && self.total_delay(m) == d)
            .count() as u32
    }
}

pub(crate) struct OutChannelRec {
    pub owner: Entity,
    pub timeline: usize,
    pub state: Mutex<OutChannelState>,
}

impl InChannel {
    /// The entity that owns this in-channel.
    pub fn owner(self, ctx: &SimCtx<'_>) -> Entity {
        ctx.world().in_channel(self).owner
    }

    /// The per-entity name given at creation, if any.
    pub fn name(self, ctx: &SimCtx<'_>) -> Option<String> {
        ctx.world().in_channel(self).name.clone()
    }

    /// Attach `proc` persistently: it runs on every activation until
    /// unbound.
    pub fn bind(self, ctx: &mut SimCtx<'_>, proc: Process) {
        self.insertion_gateway(ctx, proc, true);
    }

    /// Attach `proc` for the next activation only.
    pub fn wait_on(self, ctx: &mut SimCtx<'_>, proc: Process) {
        self.insertion_gateway(ctx, proc, false);
    }

    /// Detach a bound process. Returns whether it was found bound.
    pub fn unbind(self, ctx: &mut SimCtx<'_>, proc: Process) -> bool {
        self.remove_entry(ctx, proc, true)
    }

    /// Detach a one-shot waiter. Returns whether it was found waiting.
    pub fn unwait_on(self, ctx: &mut SimCtx<'_>, proc: Process) -> bool {
        self.remove_entry(ctx, proc, false)
    }

    /// Whether `proc` is attached persistently.
    pub fn is_bound(self, ctx: &SimCtx<'_>, proc: Process) -> bool {
        self.has_entry(ctx, proc, true)
    }

    /// Whether `proc` is attached as a one-shot waiter.
    pub fn is_waiting(self, ctx: &SimCtx<'_>, proc: Process) -> bool {
        self.has_entry(ctx, proc, false)
    }

    /// Attachments issued from a body triggered by this very channel are
    /// deferred behind a `Bind` event so an activation cannot re-arm itself
    /// into an endless same-instant loop.
    fn insertion_gateway(self, ctx: &mut SimCtx<'_>, proc: Process, bound: bool) {
        let core = &mut *ctx.core;
        let world = core.world.clone();
        let irec = world.in_channel(self);
        let prec = world.process(proc);
        assert_eq!(
            irec.timeline, core.id,
            "channel attachment from a foreign timeline"
        );
        assert_eq!(
            prec.timeline, irec.timeline,
            "process and in-channel must be co-aligned"
        );
        let pri = user_pri(prec.priority);
        if core.active_channel == Some(self) {
            core.schedule_bind(self, proc, bound, pri);
        } else {
            insert_wait_entry(
                &mut irec.waiting.lock().unwrap(),
                WaitEntry {
                    process: proc,
                    bound,
                    pri,
                },
            );
        }
    }

    fn remove_entry(self, ctx: &mut SimCtx<'_>, proc: Process, bound: bool) -> bool {
        let world = ctx.world();
        let mut list = world.in_channel(self).waiting.lock().unwrap();
        match list
            .iter()
            .position(|e| e.process == proc && e.bound == bound)
        {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    fn has_entry(self, ctx: &SimCtx<'_>, proc: Process, bound: bool) -> bool {
        ctx.world()
            .in_channel(self)
            .waiting
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.process == proc && e.bound == bound)
    }
}

impl OutChannel {
    /// The entity that owns this out-channel.
    pub fn owner(self, ctx: &SimCtx<'_>) -> Entity {
        ctx.world().out_channel(self).owner
    }

    /// Write with no extra delay and the default priority.
    pub fn write(self, ctx: &mut SimCtx<'_>, act: Activation) -> bool {
        self.write_delayed(ctx, act, 0, DEFAULT_PRIORITY)
    }

    /// Write with no extra delay and an explicit priority.
    pub fn write_pri(self, ctx: &mut SimCtx<'_>, act: Activation, pri: u32) -> bool {
        self.write_delayed(ctx, act, 0, pri)
    }

    /// Deliver `act` to every mapped in-channel, arriving `extra_delay`
    /// plus the per-write minimum plus the per-mapping transfer delay from
    /// now. A cross-timeline delivery that would land inside the current
    /// window on a globally synchronized mapping is dropped; the other
    /// deliveries still occur. Returns whether every delivery was made.
    ///
    /// Arrivals dispatch in the reserved band ahead of all same-time user
    /// events; the fan-out order at equal times follows the destination
    /// waiting lists, so `pri` does not reorder deliveries.
    pub fn write_delayed(
        self,
        ctx: &mut SimCtx<'_>,
        act: Activation,
        extra_delay: Tick,
        pri: u32,
    ) -> bool {
        let _ = pri;
        let core = &mut *ctx.core;
        let world = core.world.clone();
        let orec = world.out_channel(self);
        assert_eq!(orec.timeline, core.id, "write from a foreign timeline");

        let st = orec.state.lock().unwrap();
        let base = core.clock + extra_delay + st.min_write_delay;
        let horizon = core.horizon;
        let mut all_delivered = true;
        for m in &st.mapped_to {
            let arrival = base + m.transfer_delay;
            if !m.xtimeline || horizon <= arrival || m.asynchronous {
                core.schedule_activate(m.ic, arrival, ACTIVATE_SCHED_PRI, Some(act.clone()));
            } else {
                log::debug!(
                    "timeline {}: write dropped, arrival {} inside window ending {}",
                    core.id,
                    arrival,
                    horizon
                );
                all_delivered = false;
            }
        }
        all_delivered
    }

    /// Connect this out-channel to `ic` with the given transfer delay.
    ///
    /// Returns the simulated time at which the mapping takes effect: now if
    /// it could be applied immediately, the end of the current window if it
    /// had to be deferred. Duplicate requests with the same delay are
    /// idempotent; a different delay to an already-mapped in-channel is
    /// rejected.
    pub fn mapto(
        self,
        ctx: &mut SimCtx<'_>,
        ic: InChannel,
        transfer_delay: Tick,
    ) -> Result<Tick, MapError> {
        let core = &mut *ctx.core;
        let world = core.world.clone();
        let orec = world.out_channel(self);
        assert_eq!(orec.timeline, core.id, "mapto from a foreign timeline");
        let xtimeline = world.in_channel(ic).timeline != orec.timeline;

        let mut st = orec.state.lock().unwrap();
        if xtimeline && st.min_write_delay + transfer_delay == 0 {
            return Err(MapError::ZeroDelayCrossTimeline);
        }
        if let Some(m) = st.mapped_to.iter().find(|m| m.ic == ic) {
            return if m.transfer_delay != transfer_delay {
                Err(MapError::DelayConflict)
            } else {
                Ok(core.clock)
            };
        }
        if let Some(p) = core
            .channels_to_map
            .iter()
            .find(|p| p.oc == self && p.ic == ic)
        {
            return if p.transfer_delay != transfer_delay {
                Err(MapError::DelayConflict)
            } else {
                Ok(core.clock)
            };
        }

        if core.state != TimelineState::Running {
            st.mapped_to.push(MappedChannel {
                ic,
                transfer_delay,
                xtimeline,
                asynchronous: false,
            });
            Ok(core.clock)
        } else {
            drop(st);
            core.channels_to_map.push(PendingMap {
                oc: self,
                ic,
                transfer_delay,
            });
            Ok(core.horizon)
        }
    }

    /// Remove the mapping to `ic`, whether live or still pending. Returns
    /// whether a mapping was found.
    pub fn unmap(self, ctx: &mut SimCtx<'_>, ic: InChannel) -> bool {
        let core = &mut *ctx.core;
        let world = core.world.clone();
        let orec = world.out_channel(self);
        assert_eq!(orec.timeline, core.id, "unmap from a foreign timeline");

        let mut st = orec.state.lock().unwrap();
        if let Some(pos) = st.mapped_to.iter().position(|m| m.ic == ic) {
            let removed = st.mapped_to.swap_remove(pos);
            if removed.xtimeline
                && st.min_write_delay + removed.transfer_delay == core.min_cross_delay
            {
                core.channels_at_minimum = core.channels_at_minimum.saturating_sub(1);
                if core.channels_at_minimum == 0 {
                    core.recompute_min_delay = true;
                }
            }
            return true;
        }
        drop(st);
        if let Some(pos) = core
            .channels_to_map
            .iter()
            .position(|p| p.oc == self && p.ic == ic)
        {
            core.channels_to_map.swap_remove(pos);
            return true;
        }
        false
    }

    /// Change the transfer delay of the mapping to `ic`. An increase is
    /// always immediate; a decrease is immediate only while it cannot
    /// retro-invalidate the current window, and is otherwise applied at the
    /// window boundary. Returns the time the change takes effect.
    pub fn new_transfer_delay(
        self,
        ctx: &mut SimCtx<'_>,
        ic: InChannel,
        delay: Tick,
    ) -> Result<Tick, MapError> {
        let core = &mut *ctx.core;
        let world = core.world.clone();
        let orec = world.out_channel(self);
        assert_eq!(orec.timeline, core.id, "delay change from a foreign timeline");

        let mut st = orec.state.lock().unwrap();
        let Some(pos) = st.mapped_to.iter().position(|m| m.ic == ic) else {
            return Err(MapError::NotMapped);
        };
        let old = st.mapped_to[pos].transfer_delay;
        if delay == old {
            return Ok(core.clock);
        }
        if !st.mapped_to[pos].xtimeline || old < delay {
            st.mapped_to[pos].transfer_delay = delay;
            return Ok(core.clock);
        }

        // A cross-timeline decrease.
        let crossing = st.min_write_delay + delay;
        if crossing >= core.min_cross_delay {
            if crossing == core.min_cross_delay {
                core.channels_at_minimum += 1;
            }
            st.mapped_to[pos].transfer_delay = delay;
            return Ok(core.clock);
        }
        if core.state != TimelineState::Running || core.horizon <= core.clock + crossing {
            // Below the timeline minimum but unable to land inside the
            // current window; the minimum itself must move down with it.
            st.mapped_to[pos].transfer_delay = delay;
            core.min_cross_delay = crossing;
            core.channels_at_minimum = 1;
            return Ok(core.clock);
        }
        drop(st);
        core.delays_to_change.push(PendingDelay {
            oc: self,
            ic: Some(ic),
            delay,
        });
        core.recompute_min_delay = true;
        Ok(core.horizon)
    }

    /// Change this out-channel's minimum per-write delay, under the same
    /// admission rules as [`OutChannel::new_transfer_delay`]. Returns the
    /// time the change takes effect.
    pub fn new_min_write_delay(self, ctx: &mut SimCtx<'_>, mwd: Tick) -> Tick {
        let core = &mut *ctx.core;
        let world = core.world.clone();
        let orec = world.out_channel(self);
        assert_eq!(orec.timeline, core.id, "delay change from a foreign timeline");

        let mut st = orec.state.lock().unwrap();
        if st.min_write_delay <= mwd {
            st.min_write_delay = mwd;
            return core.clock;
        }
        let xtransfer = st.min_xtransfer();
        if xtransfer == NO_TIME {
            // No cross-timeline mappings; nothing to invalidate.
            st.min_write_delay = mwd;
            return core.clock;
        }
        let crossing = mwd + xtransfer;
        if crossing >= core.min_cross_delay {
            if crossing == core.min_cross_delay {
                core.channels_at_minimum += 1;
            }
            st.min_write_delay = mwd;
            return core.clock;
        }
        if core.state != TimelineState::Running || core.horizon <= core.clock + crossing {
            st.min_write_delay = mwd;
            core.min_cross_delay = crossing;
            core.channels_at_minimum = st.count_delay_crossings(crossing);
            return core.clock;
        }
        drop(st);
        core.delays_to_change.push(PendingDelay {
            oc: self,
            ic: None,
            delay: mwd,
        });
        core.recompute_min_delay = true;
        core.horizon
    }

    /// Whether `ic` is currently mapped to this out-channel.
    pub fn is_mapped(self, ctx: &SimCtx<'_>, ic: InChannel) -> bool {
        self.with_state(ctx, |st| st.mapped_to.iter().any(|m| m.ic == ic))
    }

    /// The in-channels currently mapped to this out-channel.
    pub fn mapped(self, ctx: &SimCtx<'_>) -> Vec<InChannel> {
        self.with_state(ctx, |st| st.mapped_to.iter().map(|m| m.ic).collect())
    }

    /// The transfer delay to `ic`, or [`NO_TIME`] if not mapped.
    pub fn transfer_delay(self, ctx: &SimCtx<'_>, ic: InChannel) -> Tick {
        self.with_state(ctx, |st| {
            st.mapped_to
                .iter()
                .find(|m| m.ic == ic)
                .map_or(NO_TIME, |m| m.transfer_delay)
        })
    }

    /// Smallest transfer delay among cross-timeline mappings, or
    /// [`NO_TIME`] when there is none.
    pub fn min_xtransfer_delay(self, ctx: &SimCtx<'_>) -> Tick {
        self.with_state(ctx, |st| st.min_xtransfer())
    }

    /// This out-channel's minimum per-write delay.
    pub fn min_write_delay(self, ctx: &SimCtx<'_>) -> Tick {
        self.with_state(ctx, |st| st.min_write_delay)
    }

    fn with_state<R>(self, ctx: &SimCtx<'_>, f: impl FnOnce(&OutChannelState) -> R) -> R {
        let st = ctx.world().out_channel(self).state.lock().unwrap();
        f(&st)
    }
}
