//! Timelines: the worker threads that advance virtual time.
//!
//! A timeline owns an event list, a clock, and a partition of the model's
//! entities. Worker threads rendezvous with the control thread at the
//! window barrier to start an epoch, then repeatedly agree on a
//! synchronization window through a min-reduction and execute all local
//! events inside it. Cross-timeline arrivals land in a mutex-guarded inbox
//! (future windows) or in per-peer appointment slots (sub-window traffic
//! under composite synchronization).
//!
//! Split of state:
//! - [`TimelineShared`] is the part other threads may touch, always under
//!   a mutex or through atomics: the inbox, appointment slots, the clock
//!   mirror read by cancellation handles, and the event counters.
//! - [`TimelineCore`] is owned by the worker thread (and by the control
//!   thread during model initialization): the heap, deferred graph
//!   mutations, and the window bookkeeping.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::channel::{InChannel, MappedChannel, OutChannel, insert_wait_entry};
use crate::entity::Entity;
use crate::event::{Activation, Event, EventKind, Handle, MIN_SCHED_PRI};
use crate::interface::{NEXT_ACTION_STOP_FUNCTION, World};
use crate::process::Process;
use crate::queue::EventQueue;
use crate::time::{NO_TIME, Tick, TimeScale};

/// Index of a timeline, `0..num_timelines`.
pub type TimelineId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimelineState {
    Initializing,
    Blocked,
    Running,
    Waiting,
}

/// Incoming appointment from one peer: the promise that the peer will not
/// send events timestamped earlier than `appointment`.
pub(crate) struct InApptState {
    pub appointment: Tick,
    pub waiting: bool,
}

pub(crate) struct InApptSlot {
    pub state: Mutex<InApptState>,
    pub cv: Condvar,
}

/// Outgoing side of an appointment pair: sub-window events deposited here
/// by the owner are spliced out by the peer when its `WaitAppt` fires.
pub(crate) struct OutApptSlot {
    pub events: Mutex<Vec<Event>>,
}

/// The externally visible block of one timeline.
pub(crate) struct TimelineShared {
    pub id: TimelineId,
    clock: AtomicI64,
    pub inbox: Mutex<Vec<Event>>,
    pub in_appt: Vec<InApptSlot>,
    pub out_appt: Vec<OutApptSlot>,
    pub executed: AtomicU64,
    pub work_executed: AtomicU64,
    pub sync_executed: AtomicU64,
    pub windows: AtomicU64,
}

impl TimelineShared {
    pub fn new(id: TimelineId, num_timelines: usize) -> Self {
        TimelineShared {
            id,
            clock: AtomicI64::new(0),
            inbox: Mutex::new(Vec::new()),
            in_appt: (0..num_timelines)
                .map(|_| InApptSlot {
                    state: Mutex::new(InApptState {
                        appointment: NO_TIME,
                        waiting: false,
                    }),
                    cv: Condvar::new(),
                })
                .collect(),
            out_appt: (0..num_timelines)
                .map(|_| OutApptSlot {
                    events: Mutex::new(Vec::new()),
                })
                .collect(),
            executed: AtomicU64::new(0),
            work_executed: AtomicU64::new(0),
            sync_executed: AtomicU64::new(0),
            windows: AtomicU64::new(0),
        }
    }

    /// The timeline's clock as last published by its worker.
    pub fn clock(&self) -> Tick {
        self.clock.load(Ordering::Acquire)
    }
}

/// A dynamic `mapto` waiting for the window boundary.
pub(crate) struct PendingMap {
    pub oc: OutChannel,
    pub ic: InChannel,
    pub transfer_delay: Tick,
}

/// A deferred delay change; `ic == None` targets the out-channel's minimum
/// per-write delay.
pub(crate) struct PendingDelay {
    pub oc: OutChannel,
    pub ic: Option<InChannel>,
    pub delay: Tick,
}

/// The worker-owned half of a timeline.
pub(crate) struct TimelineCore {
    pub id: TimelineId,
    pub world: Arc<World>,
    pub shared: Arc<TimelineShared>,
    pub events: EventQueue,
    pub clock: Tick,
    /// Exclusive upper edge of the current synchronization window.
    pub horizon: Tick,
    pub window_size: Tick,
    pub state: TimelineState,
    pub entities: Vec<Entity>,
    /// Smallest total delay over outgoing globally synchronized
    /// cross-timeline mappings, or [`NO_TIME`].
    pub min_cross_delay: Tick,
    /// How many mappings sit exactly at `min_cross_delay`; while nonzero,
    /// removals need no recomputation.
    pub channels_at_minimum: u32,
    pub recompute_min_delay: bool,
    pub channels_to_map: Vec<PendingMap>,
    pub delays_to_change: Vec<PendingDelay>,
    /// Per-peer appointment lookahead, [`NO_TIME`] where no cross mapping
    /// targets that peer.
    pub out_lookahead: Vec<Tick>,
    seq: u64,
    pub current_process: Option<Process>,
    pub active_channel: Option<InChannel>,
}

impl TimelineCore {
    pub fn new(id: TimelineId, world: Arc<World>) -> Self {
        let shared = world.timelines[id].clone();
        let n = world.num_timelines;
        TimelineCore {
            id,
            world,
            shared,
            events: EventQueue::new(),
            clock: 0,
            horizon: 0,
            window_size: 0,
            state: TimelineState::Initializing,
            entities: Vec::new(),
            min_cross_delay: NO_TIME,
            channels_at_minimum: 0,
            recompute_min_delay: false,
            channels_to_map: Vec::new(),
            delays_to_change: Vec::new(),
            out_lookahead: vec![NO_TIME; n],
            seq: 0,
            current_process: None,
            active_channel: None,
        }
    }

    fn next_seq(&mut self) -> u64 {
        let s = self.seq;
        self.seq += 1;
        s
    }

    pub fn set_clock(&mut self, t: Tick) {
        self.clock = t;
        self.shared.clock.store(t, Ordering::Release);
    }

    pub fn set_state(&mut self, s: TimelineState) {
        self.state = s;
    }

    // -----------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------

    /// Schedule a process timeout on this timeline and hand back a
    /// cancellation handle. The process must belong to an entity aligned
    /// here.
    pub fn schedule_timeout(
        &mut self,
        proc: Process,
        at: Tick,
        key2: i32,
        activation: Option<Activation>,
    ) -> Handle {
        assert_eq!(
            self.world.process(proc).timeline,
            self.id,
            "process scheduled on a timeline other than its owner's"
        );
        let flag = Arc::new(AtomicBool::new(false));
        let seq = self.next_seq();
        self.events.push(Event {
            time: at,
            key2,
            seq,
            kind: EventKind::Timeout {
                process: proc,
                activation,
            },
            cancelled: Some(flag.clone()),
        });
        Handle {
            flag,
            time: at,
            home: self.shared.clone(),
        }
    }

    /// Route an activation arrival to `ic` at time `at`. Same-timeline
    /// arrivals go straight onto the heap. Cross-timeline arrivals at or
    /// past this window's end go to the target's inbox; earlier ones are
    /// deposited in the outgoing appointment slot for the target to
    /// splice.
    pub fn schedule_activate(
        &mut self,
        ic: InChannel,
        at: Tick,
        key2: i32,
        activation: Option<Activation>,
    ) {
        let target = self.world.in_channel(ic).timeline;
        let seq = self.next_seq();
        let ev = Event {
            time: at,
            key2,
            seq,
            kind: EventKind::Activate {
                channel: ic,
                activation,
            },
            cancelled: None,
        };
        if target == self.id {
            self.events.push(ev);
        } else if self.horizon <= at {
            let shared = self.world.timelines[target].clone();
            shared.inbox.lock().unwrap().push(ev);
        } else {
            self.shared.out_appt[target].events.lock().unwrap().push(ev);
        }
    }

    /// Defer a waiting-list attachment behind a `Bind` event at the
    /// current instant.
    pub fn schedule_bind(&mut self, ic: InChannel, proc: Process, bound: bool, pri: i32) {
        let seq = self.next_seq();
        self.events.push(Event {
            time: self.clock,
            key2: pri,
            seq,
            kind: EventKind::Bind {
                channel: ic,
                process: proc,
                bound,
                pri,
            },
            cancelled: None,
        });
    }

    pub fn push_sync_event(&mut self, kind: EventKind, at: Tick, key2: i32) {
        let seq = self.next_seq();
        self.events.push(Event {
            time: at,
            key2,
            seq,
            kind,
            cancelled: None,
        });
    }

    // -----------------------------------------------------------------
    // Window execution
    // -----------------------------------------------------------------

    /// Splice the cross-timeline inbox into the local heap. Runs at the
    /// top of every window, before the horizon reduction.
    pub fn drain_inbox(&mut self) {
        let shared = self.shared.clone();
        let mut inbox = shared.inbox.lock().unwrap();
        for ev in inbox.drain(..) {
            self.events.push(ev);
        }
    }

    /// Execute every event with a timestamp strictly inside the window,
    /// then apply deferred graph mutations and advance the clock to the
    /// window's upper edge.
    pub fn sync_window(&mut self) {
        self.recompute_min_delay = false;
        self.shared.windows.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "timeline {}: window [{}, {}) with {} queued",
            self.id,
            self.clock,
            self.horizon,
            self.events.len()
        );

        loop {
            let nxt = self.events.peek_time();
            if nxt == NO_TIME || nxt >= self.horizon {
                break;
            }
            let ev = self.events.pop().expect("peeked event vanished");
            if ev.is_cancelled() {
                continue;
            }
            self.set_clock(ev.time);
            self.shared.executed.fetch_add(1, Ordering::Relaxed);
            match ev.kind {
                EventKind::Timeout {
                    process,
                    activation,
                } => {
                    self.shared.work_executed.fetch_add(1, Ordering::Relaxed);
                    self.invoke(process, None, activation);
                }
                EventKind::Activate {
                    channel,
                    activation,
                } => self.fan_out(channel, activation),
                EventKind::ExecActivate {
                    process,
                    channel,
                    activation,
                } => {
                    self.shared.work_executed.fetch_add(1, Ordering::Relaxed);
                    self.invoke(process, Some(channel), activation);
                }
                EventKind::Bind {
                    channel,
                    process,
                    bound,
                    pri,
                } => {
                    self.shared.work_executed.fetch_add(1, Ordering::Relaxed);
                    insert_wait_entry(
                        &mut self.world.in_channel(channel).waiting.lock().unwrap(),
                        crate::channel::WaitEntry {
                            process,
                            bound,
                            pri,
                        },
                    );
                }
                EventKind::MakeAppt { peer } => {
                    self.shared.sync_executed.fetch_add(1, Ordering::Relaxed);
                    self.make_appointment(peer);
                }
                EventKind::WaitAppt { peer } => {
                    self.shared.sync_executed.fetch_add(1, Ordering::Relaxed);
                    self.wait_appointment(peer);
                }
            }
        }

        self.apply_deferred_graph_changes();
        if self.recompute_min_delay {
            self.recompute_min_cross_delay();
        }
        // The window is half-open; time lands on its last covered tick.
        if self.horizon - 1 > self.clock {
            self.set_clock(self.horizon - 1);
        }
    }

    /// Run a process body with the dispatch context.
    fn invoke(&mut self, proc: Process, chan: Option<InChannel>, act: Option<Activation>) {
        let world = self.world.clone();
        let prec = world.process(proc);
        self.current_process = Some(proc);
        self.active_channel = chan;
        {
            let mut body = prec.body.lock().unwrap();
            let mut ctx = SimCtx { core: self };
            (*body)(&mut ctx, act);
        }
        self.current_process = None;
        self.active_channel = None;
    }

    /// `Activate` fan-out: push one `ExecActivate` per waiting-list entry
    /// at the current instant. One-shot entries leave the list before any
    /// body runs, so binding-state queries made during the fan-out see the
    /// post-activation list.
    fn fan_out(&mut self, ic: InChannel, act: Option<Activation>) {
        let world = self.world.clone();
        let entries: Vec<crate::channel::WaitEntry> = {
            let mut list = world.in_channel(ic).waiting.lock().unwrap();
            let snapshot = list.clone();
            list.retain(|e| e.bound);
            snapshot
        };
        for e in entries {
            let seq = self.next_seq();
            self.events.push(Event {
                time: self.clock,
                key2: e.pri,
                seq,
                kind: EventKind::ExecActivate {
                    process: e.process,
                    channel: ic,
                    activation: act.clone(),
                },
                cancelled: None,
            });
        }
    }

    // -----------------------------------------------------------------
    // Appointments (composite synchronization)
    // -----------------------------------------------------------------

    /// Publish the next appointment to `peer` and reschedule.
    fn make_appointment(&mut self, peer: TimelineId) {
        let lookahead = self.out_lookahead[peer];
        let appt = self.clock + lookahead;
        let dest = self.world.timelines[peer].clone();
        {
            let slot = &dest.in_appt[self.id];
            let mut s = slot.state.lock().unwrap();
            s.appointment = appt;
            if s.waiting {
                log::trace!("timeline {} signals appointment {} to {}", self.id, appt, peer);
                slot.cv.notify_one();
            }
        }
        self.push_sync_event(EventKind::MakeAppt { peer }, appt, MIN_SCHED_PRI - 1);
    }

    /// Honor the incoming appointment from `peer`: block until the peer
    /// has promised a time past our clock, reschedule for the promised
    /// time, and splice any sub-window events the peer deposited.
    fn wait_appointment(&mut self, peer: TimelineId) {
        let shared = self.shared.clone();
        let appt = {
            let slot = &shared.in_appt[peer];
            let mut s = slot.state.lock().unwrap();
            if self.clock >= s.appointment {
                s.waiting = true;
                self.state = TimelineState::Waiting;
                log::trace!("timeline {} waits on appointment from {}", self.id, peer);
                while self.clock >= s.appointment {
                    s = slot.cv.wait(s).unwrap();
                }
                s.waiting = false;
                self.state = TimelineState::Running;
            }
            s.appointment
        };
        self.push_sync_event(EventKind::WaitAppt { peer }, appt, MIN_SCHED_PRI);

        let peer_shared = self.world.timelines[peer].clone();
        let mut deposited = peer_shared.out_appt[self.id].events.lock().unwrap();
        for ev in deposited.drain(..) {
            self.events.push(ev);
        }
    }

    // -----------------------------------------------------------------
    // Deferred graph mutation & lookahead bookkeeping
    // -----------------------------------------------------------------

    /// Apply `mapto`s and delay changes buffered during the window.
    pub fn apply_deferred_graph_changes(&mut self) {
        let world = self.world.clone();
        for pm in std::mem::take(&mut self.channels_to_map) {
            let orec = world.out_channel(pm.oc);
            let xtimeline = world.in_channel(pm.ic).timeline != orec.timeline;
            let mut st = orec.state.lock().unwrap();
            st.mapped_to.push(MappedChannel {
                ic: pm.ic,
                transfer_delay: pm.transfer_delay,
                xtimeline,
                asynchronous: false,
            });
            if xtimeline {
                let total = st.min_write_delay + pm.transfer_delay;
                // Totals below the window size never constrain the global
                // window; the thresholded recomputation excludes them as
                // well.
                if total >= self.window_size {
                    if self.min_cross_delay == NO_TIME {
                        self.min_cross_delay = total;
                        self.channels_at_minimum = 1;
                    } else if total == self.min_cross_delay {
                        self.channels_at_minimum += 1;
                    } else if total < self.min_cross_delay {
                        self.recompute_min_delay = true;
                    }
                }
            }
        }

        for pd in std::mem::take(&mut self.delays_to_change) {
            let orec = world.out_channel(pd.oc);
            let mut st = orec.state.lock().unwrap();
            match pd.ic {
                None => {
                    let xtransfer = st.min_xtransfer();
                    if xtransfer != NO_TIME && pd.delay + xtransfer == 0 {
                        log::warn!(
                            "timeline {}: min-write-delay change dropped, would create a \
                             zero-delay crossing",
                            self.id
                        );
                        continue;
                    }
                    st.min_write_delay = pd.delay;
                    if xtransfer != NO_TIME {
                        let crossing = pd.delay + xtransfer;
                        if crossing == self.min_cross_delay {
                            self.channels_at_minimum += 1;
                        } else if crossing < self.min_cross_delay {
                            self.recompute_min_delay = true;
                        }
                    }
                }
                Some(ic) => {
                    if let Some(pos) = st.mapped_to.iter().position(|m| m.ic == ic) {
                        st.mapped_to[pos].transfer_delay = pd.delay;
                        if st.mapped_to[pos].xtimeline {
                            let crossing = st.min_write_delay + pd.delay;
                            if crossing == self.min_cross_delay {
                                self.channels_at_minimum += 1;
                            } else if crossing < self.min_cross_delay {
                                self.recompute_min_delay = true;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Smallest total cross-timeline delay at least `thrs` over all
    /// out-channels owned by entities aligned here, or [`NO_TIME`].
    pub fn min_sync_cross_delay(&self, thrs: Tick) -> Tick {
        let mut ans = NO_TIME;
        for &e in &self.entities {
            for &oc in &self.world.entity(e).out_channels {
                let st = self.world.out_channel(oc).state.lock().unwrap();
                let d = st.min_sync_cross_delay(thrs);
                if d != NO_TIME && (ans == NO_TIME || d < ans) {
                    ans = d;
                }
            }
        }
        ans
    }

    /// Number of cross-timeline mappings whose total delay is exactly `d`.
    pub fn count_delay_crossings(&self, d: Tick) -> u32 {
        let mut ans = 0;
        for &e in &self.entities {
            for &oc in &self.world.entity(e).out_channels {
                let st = self.world.out_channel(oc).state.lock().unwrap();
                ans += st.count_delay_crossings(d);
            }
        }
        ans
    }

    pub fn recompute_min_cross_delay(&mut self) {
        self.min_cross_delay = self.min_sync_cross_delay(self.window_size);
        self.channels_at_minimum = if self.min_cross_delay == NO_TIME {
            0
        } else {
            self.count_delay_crossings(self.min_cross_delay)
        };
    }

    /// Derive per-peer lookaheads and mark sub-window mappings as
    /// appointment-synchronized. Called once, before the workers start.
    pub fn initialize_appointments(&mut self, window_size: Tick) {
        self.window_size = window_size;
        self.out_lookahead = vec![NO_TIME; self.world.num_timelines];
        for &e in &self.entities.clone() {
            for &oc in &self.world.entity(e).out_channels {
                let mut st = self.world.out_channel(oc).state.lock().unwrap();
                let mwd = st.min_write_delay;
                for m in st.mapped_to.iter_mut() {
                    if !m.xtimeline {
                        continue;
                    }
                    let lookahead = mwd + m.transfer_delay;
                    m.asynchronous = lookahead < window_size;
                    let peer = self.world.in_channel(m.ic).timeline;
                    if self.out_lookahead[peer] == NO_TIME
                        || lookahead < self.out_lookahead[peer]
                    {
                        self.out_lookahead[peer] = lookahead;
                    }
                }
            }
        }
    }
}

/// Worker thread body: the epoch / window loop.
pub(crate) fn run(mut core: TimelineCore) {
    let world = core.world.clone();
    let ctl = &world.control;
    let me = core.id;
    loop {
        ctl.window_barrier.wait(me, NO_TIME);
        if ctl.shutdown.load(Ordering::Acquire) {
            log::debug!("timeline {me}: shutdown");
            return;
        }
        let epoch_stop = ctl.epoch_stop.load(Ordering::Acquire);
        let check_stop = ctl.next_action.load(Ordering::Acquire) == NEXT_ACTION_STOP_FUNCTION;
        log::debug!("timeline {me}: epoch up to {epoch_stop}");

        loop {
            core.drain_inbox();
            core.set_state(TimelineState::Blocked);
            let window_end = if world.num_timelines > 1 {
                let nxt = core.events.peek_time();
                let offer = if core.events.is_empty() || core.min_cross_delay == NO_TIME {
                    // No events, or no outbound synchronized crossings:
                    // nothing to constrain the others with. Under composite
                    // synchronization still bound the window length.
                    if core.window_size > 0 {
                        core.clock.max(nxt) + core.window_size
                    } else {
                        NO_TIME
                    }
                } else {
                    core.clock.max(nxt) + core.min_cross_delay.max(0)
                };
                ctl.bottom_barrier.wait(me, offer);
                let m = ctl.bottom_barrier.min();
                if m == NO_TIME {
                    // Every timeline is out of constraints; finish the
                    // epoch in one window.
                    epoch_stop
                } else {
                    assert!(m > 0, "window reduction produced non-positive horizon {m}");
                    m.min(epoch_stop)
                }
            } else {
                epoch_stop
            };
            core.horizon = window_end;
            core.set_state(TimelineState::Running);
            core.sync_window();
            core.set_state(TimelineState::Blocked);

            if window_end >= epoch_stop {
                break;
            }
            let stop_now = check_stop && world.stop_condition();
            ctl.top_barrier.wait(me, if stop_now { 1 } else { 0 });
            if ctl.top_barrier.max() >= 1 {
                // Some timeline saw the stop condition hold; everyone
                // agrees through the reduction and ends the epoch here.
                break;
            }
        }
        ctl.window_barrier.wait(me, core.horizon);
    }
}

/// Dispatch context handed to process bodies and entity init hooks.
///
/// All runtime primitives go through a `SimCtx`: it carries exclusive
/// access to the running timeline, which is what makes same-timeline
/// scheduling lock-free and keeps cross-timeline traffic on the audited
/// paths.
pub struct SimCtx<'a> {
    pub(crate) core: &'a mut TimelineCore,
}

impl SimCtx<'_> {
    /// Current virtual time on this timeline.
    pub fn now(&self) -> Tick {
        self.core.clock
    }

    /// The timeline this context executes on.
    pub fn timeline(&self) -> TimelineId {
        self.core.id
    }

    /// Exclusive upper edge of the current synchronization window.
    pub fn horizon(&self) -> Tick {
        self.core.horizon
    }

    /// The in-channel whose activation triggered the running process, or
    /// `None` for a timeout-triggered body.
    pub fn active_channel(&self) -> Option<InChannel> {
        self.core.active_channel
    }

    /// The currently running process, if a body is executing.
    pub fn current_process(&self) -> Option<Process> {
        self.core.current_process
    }

    /// The simulation's clock scale.
    pub fn scale(&self) -> &TimeScale {
        &self.core.world.scale
    }

    /// Look up an entity registered with a global name.
    pub fn entity_by_name(&self, name: &str) -> Option<Entity> {
        self.core.world.entity_names.get(name).copied()
    }

    /// Look up an in-channel by its per-entity name.
    pub fn in_channel_by_name(&self, entity: Entity, name: &str) -> Option<InChannel> {
        self.core.world.entity(entity).in_channel_names.get(name).copied()
    }

    /// Look up a process by its per-entity name.
    pub fn process_by_name(&self, entity: Entity, name: &str) -> Option<Process> {
        self.core.world.entity(entity).process_names.get(name).copied()
    }

    pub(crate) fn world(&self) -> &Arc<World> {
        &self.core.world
    }
}
