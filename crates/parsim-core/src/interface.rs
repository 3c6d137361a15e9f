//! The simulation interface: construction, epochs, and measurements.
//!
//! An [`Interface`] owns the simulation world. Model construction happens
//! on the control thread before [`Interface::init_model`] freezes the
//! object tables, runs the entity init hooks, derives the window size and
//! appointment structure, and starts one worker thread per timeline.
//! After that, [`Interface::advance`] drives epochs: the control thread
//! publishes the epoch stop time, meets the workers at the window barrier,
//! and reads the reached horizon back out of the barrier reduction.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use serde::Serialize;

use crate::barrier::{Barrier, BarrierKind};
use crate::channel::{
    InChannel, InChannelRec, MapError, MappedChannel, OutChannel, OutChannelRec, OutChannelState,
    WaitEntry, insert_wait_entry,
};
use crate::entity::{Entity, EntityRec};
use crate::event::{Activation, EventKind, MIN_SCHED_PRI, user_pri};
use crate::process::{Process, ProcessBody, ProcessRec};
use crate::time::{NO_TIME, Tick, TimeScale};
use crate::timeline::{SimCtx, TimelineCore, TimelineId, TimelineShared};

pub(crate) const NEXT_ACTION_STOP_BEFORE_TIME: u8 = 0;
pub(crate) const NEXT_ACTION_STOP_FUNCTION: u8 = 1;

/// How timelines agree on synchronization windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// Pure global barrier windows.
    #[default]
    Global,
    /// Global windows plus pairwise appointments for channel pairs whose
    /// lookahead is smaller than the window size.
    Composite,
}

/// Build-time configuration of a simulation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimConfig {
    pub sync: SyncPolicy,
    pub barrier: BarrierKind,
}

/// Shared control block: the three barriers and the epoch directives.
pub(crate) struct ControlShared {
    /// Size `num_timelines + 1`; epoch handshake with the control thread.
    pub window_barrier: Barrier,
    /// Size `num_timelines`; per-window horizon min-reduction.
    pub bottom_barrier: Barrier,
    /// Size `num_timelines`; between consecutive windows of an epoch.
    pub top_barrier: Barrier,
    pub epoch_stop: AtomicI64,
    pub next_action: AtomicU8,
    pub stop_cond: Mutex<Option<Arc<dyn Fn() -> bool + Send + Sync>>>,
    pub shutdown: AtomicBool,
}

/// The frozen simulation world shared by every thread.
pub(crate) struct World {
    pub scale: TimeScale,
    pub num_timelines: usize,
    pub entities: Vec<EntityRec>,
    pub processes: Vec<ProcessRec>,
    pub in_channels: Vec<InChannelRec>,
    pub out_channels: Vec<OutChannelRec>,
    pub timelines: Vec<Arc<TimelineShared>>,
    pub entity_names: HashMap<String, Entity>,
    pub control: ControlShared,
}

impl World {
    pub fn entity(&self, e: Entity) -> &EntityRec {
        &self.entities[e.0 as usize]
    }

    pub fn process(&self, p: Process) -> &ProcessRec {
        &self.processes[p.0 as usize]
    }

    pub fn in_channel(&self, ic: InChannel) -> &InChannelRec {
        &self.in_channels[ic.0 as usize]
    }

    pub fn out_channel(&self, oc: OutChannel) -> &OutChannelRec {
        &self.out_channels[oc.0 as usize]
    }

    pub fn stop_condition(&self) -> bool {
        let f = self.control.stop_cond.lock().unwrap().clone();
        f.is_some_and(|f| f())
    }
}

/// Pre-freeze model under construction.
struct ModelBuilder {
    entities: Vec<EntityRec>,
    processes: Vec<ProcessRec>,
    in_channels: Vec<InChannelRec>,
    out_channels: Vec<OutChannelRec>,
    entity_names: HashMap<String, Entity>,
    inits: Vec<Option<Box<dyn FnOnce(&mut SimCtx<'_>) + Send>>>,
}

struct RunningSim {
    world: Arc<World>,
    workers: Vec<JoinHandle<()>>,
    window_size: Tick,
}

enum Phase {
    Building(ModelBuilder),
    Running(RunningSim),
}

/// Handle on a whole simulation.
pub struct Interface {
    num_timelines: usize,
    scale: TimeScale,
    config: SimConfig,
    clock: Tick,
    phase: Phase,
    created_at: Instant,
    init_done_at: Option<Instant>,
    run_started_at: Option<Instant>,
    run_ended_at: Option<Instant>,
}

impl Interface {
    /// Create a simulation with `num_timelines` worker timelines and a
    /// clock of `10^log_ticks_per_sec` ticks per simulated second, using
    /// the default configuration.
    pub fn new(num_timelines: usize, log_ticks_per_sec: i32) -> Self {
        Self::with_config(num_timelines, log_ticks_per_sec, SimConfig::default())
    }

    pub fn with_config(num_timelines: usize, log_ticks_per_sec: i32, config: SimConfig) -> Self {
        assert!(num_timelines > 0, "a simulation needs at least one timeline");
        Interface {
            num_timelines,
            scale: TimeScale::new(log_ticks_per_sec),
            config,
            clock: 0,
            phase: Phase::Building(ModelBuilder {
                entities: Vec::new(),
                processes: Vec::new(),
                in_channels: Vec::new(),
                out_channels: Vec::new(),
                entity_names: HashMap::new(),
                inits: Vec::new(),
            }),
            created_at: Instant::now(),
            init_done_at: None,
            run_started_at: None,
            run_ended_at: None,
        }
    }

    pub fn num_timelines(&self) -> usize {
        self.num_timelines
    }

    /// The timeline with index `i`.
    pub fn get_timeline(&self, i: usize) -> TimelineId {
        assert!(i < self.num_timelines, "no timeline {i}");
        i
    }

    /// Simulated time reached so far.
    pub fn clock(&self) -> Tick {
        self.clock
    }

    pub fn scale(&self) -> &TimeScale {
        &self.scale
    }

    fn builder_mut(&mut self) -> &mut ModelBuilder {
        match &mut self.phase {
            Phase::Building(b) => b,
            Phase::Running(_) => panic!("the model cannot change after init_model"),
        }
    }

    fn running(&self) -> &RunningSim {
        match &self.phase {
            Phase::Running(r) => r,
            Phase::Building(_) => panic!("init_model must be called first"),
        }
    }

    // -----------------------------------------------------------------
    // Model construction
    // -----------------------------------------------------------------

    /// Create an entity aligned to `timeline`, optionally registering a
    /// global name. On a duplicate name the first binding wins.
    pub fn create_entity(&mut self, timeline: TimelineId, name: Option<&str>) -> Entity {
        assert!(timeline < self.num_timelines, "no timeline {timeline}");
        let b = self.builder_mut();
        let id = Entity(b.entities.len() as u32);
        if let Some(name) = name {
            if b.entity_names.contains_key(name) {
                log::warn!("duplicate entity name {name:?}; keeping the first registration");
            } else {
                b.entity_names.insert(name.to_string(), id);
            }
        }
        b.entities.push(EntityRec {
            name: name.map(str::to_string),
            timeline,
            in_channels: Vec::new(),
            out_channels: Vec::new(),
            processes: Vec::new(),
            in_channel_names: HashMap::new(),
            process_names: HashMap::new(),
        });
        b.inits.push(None);
        id
    }

    /// Register the init hook run for `entity` during
    /// [`Interface::init_model`], after all objects exist. This is where
    /// models wire their channel mappings and seed initial events.
    pub fn set_init<F>(&mut self, entity: Entity, f: F)
    where
        F: FnOnce(&mut SimCtx<'_>) + Send + 'static,
    {
        let b = self.builder_mut();
        b.inits[entity.0 as usize] = Some(Box::new(f));
    }

    /// Create a process owned by `entity` with the given waiting-list
    /// priority. The body runs whenever a scheduled event for the process
    /// fires.
    pub fn create_process<F>(
        &mut self,
        entity: Entity,
        name: Option<&str>,
        priority: u32,
        body: F,
    ) -> Process
    where
        F: FnMut(&mut SimCtx<'_>, Option<Activation>) + Send + 'static,
    {
        let b = self.builder_mut();
        let id = Process(b.processes.len() as u32);
        let timeline = b.entities[entity.0 as usize].timeline;
        if let Some(name) = name {
            let names = &mut b.entities[entity.0 as usize].process_names;
            if names.contains_key(name) {
                log::warn!("duplicate process name {name:?}; keeping the first registration");
            } else {
                names.insert(name.to_string(), id);
            }
        }
        b.entities[entity.0 as usize].processes.push(id);
        b.processes.push(ProcessRec {
            owner: entity,
            timeline,
            priority,
            name: name.map(str::to_string),
            body: Mutex::new(Box::new(body) as ProcessBody),
        });
        id
    }

    /// Create an in-channel owned by `entity`, optionally registering a
    /// per-entity name.
    pub fn create_in_channel(&mut self, entity: Entity, name: Option<&str>) -> InChannel {
        let b = self.builder_mut();
        let id = InChannel(b.in_channels.len() as u32);
        let timeline = b.entities[entity.0 as usize].timeline;
        if let Some(name) = name {
            let names = &mut b.entities[entity.0 as usize].in_channel_names;
            if names.contains_key(name) {
                log::warn!("duplicate in-channel name {name:?}; keeping the first registration");
            } else {
                names.insert(name.to_string(), id);
            }
        }
        b.entities[entity.0 as usize].in_channels.push(id);
        b.in_channels.push(InChannelRec {
            owner: entity,
            timeline,
            name: name.map(str::to_string),
            waiting: Mutex::new(Vec::new()),
        });
        id
    }

    /// Create an out-channel owned by `entity` with a minimum per-write
    /// delay.
    pub fn create_out_channel(&mut self, entity: Entity, min_write_delay: Tick) -> OutChannel {
        assert!(min_write_delay >= 0, "negative minimum write delay");
        let b = self.builder_mut();
        let id = OutChannel(b.out_channels.len() as u32);
        let timeline = b.entities[entity.0 as usize].timeline;
        b.entities[entity.0 as usize].out_channels.push(id);
        b.out_channels.push(OutChannelRec {
            owner: entity,
            timeline,
            state: Mutex::new(OutChannelState {
                min_write_delay,
                mapped_to: Vec::new(),
            }),
        });
        id
    }

    /// Construction-phase `mapto`. Applied immediately; returns the time
    /// it takes effect (now).
    pub fn mapto(
        &mut self,
        oc: OutChannel,
        ic: InChannel,
        transfer_delay: Tick,
    ) -> Result<Tick, MapError> {
        let clock = self.clock;
        let b = self.builder_mut();
        let out_tl = b.out_channels[oc.0 as usize].timeline;
        let in_tl = b.in_channels[ic.0 as usize].timeline;
        let xtimeline = out_tl != in_tl;
        let mut st = b.out_channels[oc.0 as usize].state.lock().unwrap();
        if xtimeline && st.min_write_delay + transfer_delay == 0 {
            return Err(MapError::ZeroDelayCrossTimeline);
        }
        if let Some(m) = st.mapped_to.iter().find(|m| m.ic == ic) {
            return if m.transfer_delay != transfer_delay {
                Err(MapError::DelayConflict)
            } else {
                Ok(clock)
            };
        }
        st.mapped_to.push(MappedChannel {
            ic,
            transfer_delay,
            xtimeline,
            asynchronous: false,
        });
        Ok(clock)
    }

    /// Construction-phase unmap. Returns whether the mapping existed.
    pub fn unmap(&mut self, oc: OutChannel, ic: InChannel) -> bool {
        let b = self.builder_mut();
        let mut st = b.out_channels[oc.0 as usize].state.lock().unwrap();
        match st.mapped_to.iter().position(|m| m.ic == ic) {
            Some(pos) => {
                st.mapped_to.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Construction-phase transfer-delay change.
    pub fn new_transfer_delay(
        &mut self,
        oc: OutChannel,
        ic: InChannel,
        delay: Tick,
    ) -> Result<Tick, MapError> {
        let clock = self.clock;
        let b = self.builder_mut();
        let mut st = b.out_channels[oc.0 as usize].state.lock().unwrap();
        match st.mapped_to.iter_mut().find(|m| m.ic == ic) {
            Some(m) => {
                m.transfer_delay = delay;
                Ok(clock)
            }
            None => Err(MapError::NotMapped),
        }
    }

    /// Construction-phase minimum-write-delay change.
    pub fn new_min_write_delay(&mut self, oc: OutChannel, mwd: Tick) -> Tick {
        let clock = self.clock;
        let b = self.builder_mut();
        b.out_channels[oc.0 as usize].state.lock().unwrap().min_write_delay = mwd;
        clock
    }

    /// Construction-phase persistent bind of `proc` to `ic`.
    pub fn bind(&mut self, ic: InChannel, proc: Process) {
        self.attach(ic, proc, true);
    }

    /// Construction-phase one-shot attachment of `proc` to `ic`.
    pub fn wait_on(&mut self, ic: InChannel, proc: Process) {
        self.attach(ic, proc, false);
    }

    fn attach(&mut self, ic: InChannel, proc: Process, bound: bool) {
        let b = self.builder_mut();
        let irec = &b.in_channels[ic.0 as usize];
        let prec = &b.processes[proc.0 as usize];
        assert_eq!(
            irec.timeline, prec.timeline,
            "process and in-channel must be co-aligned"
        );
        insert_wait_entry(
            &mut irec.waiting.lock().unwrap(),
            WaitEntry {
                process: proc,
                bound,
                pri: user_pri(prec.priority),
            },
        );
    }

    // -----------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------

    /// Freeze the model, run every entity's init hook, derive the window
    /// size and appointment structure, and start the worker threads.
    pub fn init_model(&mut self) {
        if matches!(self.phase, Phase::Running(_)) {
            panic!("init_model called twice");
        }
        let Phase::Building(b) = std::mem::replace(
            &mut self.phase,
            Phase::Building(ModelBuilder {
                entities: Vec::new(),
                processes: Vec::new(),
                in_channels: Vec::new(),
                out_channels: Vec::new(),
                entity_names: HashMap::new(),
                inits: Vec::new(),
            }),
        ) else {
            unreachable!();
        };
        let n = self.num_timelines;

        let world = Arc::new(World {
            scale: self.scale.clone(),
            num_timelines: n,
            entities: b.entities,
            processes: b.processes,
            in_channels: b.in_channels,
            out_channels: b.out_channels,
            timelines: (0..n).map(|i| Arc::new(TimelineShared::new(i, n))).collect(),
            entity_names: b.entity_names,
            control: ControlShared {
                window_barrier: Barrier::new(self.config.barrier, n + 1),
                bottom_barrier: Barrier::new(self.config.barrier, n),
                top_barrier: Barrier::new(self.config.barrier, n),
                epoch_stop: AtomicI64::new(0),
                next_action: AtomicU8::new(NEXT_ACTION_STOP_BEFORE_TIME),
                stop_cond: Mutex::new(None),
                shutdown: AtomicBool::new(false),
            },
        });

        let mut cores: Vec<TimelineCore> =
            (0..n).map(|i| TimelineCore::new(i, world.clone())).collect();
        for (idx, rec) in world.entities.iter().enumerate() {
            cores[rec.timeline].entities.push(Entity(idx as u32));
        }

        // Entity init hooks: wiring and initial events, per timeline on
        // the control thread.
        for (idx, init) in b.inits.into_iter().enumerate() {
            if let Some(f) = init {
                let tl = world.entities[idx].timeline;
                let mut ctx = SimCtx {
                    core: &mut cores[tl],
                };
                f(&mut ctx);
            }
        }

        // Smallest cross-timeline delay anywhere; the composite window
        // size is num_timelines times it.
        let mut mxtd = NO_TIME;
        for core in &cores {
            let d = core.min_sync_cross_delay(0);
            if d != NO_TIME && (mxtd == NO_TIME || d < mxtd) {
                mxtd = d;
            }
        }
        let window_size = match (self.config.sync, mxtd) {
            (SyncPolicy::Composite, d) if d != NO_TIME => n as Tick * d,
            _ => 0,
        };
        log::debug!("window size {window_size} (min cross-timeline delay {mxtd})");

        for core in cores.iter_mut() {
            core.initialize_appointments(window_size);
            core.recompute_min_cross_delay();
        }

        // Kick off the appointment protocol for every pair with a
        // sub-window lookahead.
        let mut kicks = Vec::new();
        for (a, core) in cores.iter().enumerate() {
            for (peer, &la) in core.out_lookahead.iter().enumerate() {
                if la != NO_TIME && la < window_size {
                    kicks.push((a, EventKind::MakeAppt { peer }, la, MIN_SCHED_PRI - 1));
                    kicks.push((peer, EventKind::WaitAppt { peer: a }, la, MIN_SCHED_PRI));
                }
            }
        }
        for (tl, kind, at, key2) in kicks {
            cores[tl].push_sync_event(kind, at, key2);
        }

        let workers = cores
            .into_iter()
            .map(|core| {
                thread::Builder::new()
                    .name(format!("timeline-{}", core.id))
                    .spawn(move || crate::timeline::run(core))
                    .expect("failed to spawn timeline worker")
            })
            .collect();

        self.phase = Phase::Running(RunningSim {
            world,
            workers,
            window_size,
        });
        self.init_done_at = Some(Instant::now());
    }

    /// Advance the simulation by `t` ticks of virtual time. Returns the
    /// time actually reached, which cross-timeline constraints may hold
    /// below `clock() + t`.
    pub fn advance(&mut self, t: Tick) -> Tick {
        self.advance_epoch(NEXT_ACTION_STOP_BEFORE_TIME, t, None)
    }

    /// Advance by at most `t` ticks, evaluating `stop` at the end of every
    /// synchronization window; the epoch ends early once it returns true.
    pub fn advance_until<F>(&mut self, stop: F, t: Tick) -> Tick
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.advance_epoch(NEXT_ACTION_STOP_FUNCTION, t, Some(Arc::new(stop)))
    }

    fn advance_epoch(
        &mut self,
        action: u8,
        t: Tick,
        cond: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
    ) -> Tick {
        assert!(t > 0, "advance needs a positive span");
        let epoch_stop = self.clock + t;
        if self.run_started_at.is_none() {
            self.run_started_at = Some(Instant::now());
        }
        let world = self.running().world.clone();
        let ctl = &world.control;
        ctl.epoch_stop.store(epoch_stop, Ordering::Release);
        ctl.next_action.store(action, Ordering::Release);
        *ctl.stop_cond.lock().unwrap() = cond;

        let me = self.num_timelines; // the control thread's barrier slot
        ctl.window_barrier.wait(me, NO_TIME); // release the workers
        ctl.window_barrier.wait(me, NO_TIME); // and wait out the epoch
        let reached = ctl.window_barrier.min();

        *ctl.stop_cond.lock().unwrap() = None;
        self.run_ended_at = Some(Instant::now());
        if reached != NO_TIME {
            self.clock = reached;
        }
        self.clock
    }

    /// Collect the runtime counters of all timelines.
    pub fn runtime_measurements(&self) -> RuntimeMeasurements {
        let run = self.running();
        let per_timeline: Vec<TimelineMeasurements> = run
            .world
            .timelines
            .iter()
            .map(|tl| TimelineMeasurements {
                timeline: tl.id,
                executed: tl.executed.load(Ordering::Relaxed),
                work_executed: tl.work_executed.load(Ordering::Relaxed),
                sync_executed: tl.sync_executed.load(Ordering::Relaxed),
                windows: tl.windows.load(Ordering::Relaxed),
            })
            .collect();
        let total_events: u64 = per_timeline.iter().map(|t| t.executed).sum();
        let work_events: u64 = per_timeline.iter().map(|t| t.work_executed).sum();
        let sync_events: u64 = per_timeline.iter().map(|t| t.sync_executed).sum();
        let windows: u64 = per_timeline.iter().map(|t| t.windows).sum();
        let build_seconds = self
            .init_done_at
            .map_or(0.0, |t| (t - self.created_at).as_secs_f64());
        let run_seconds = match (self.run_started_at, self.run_ended_at) {
            (Some(a), Some(b)) => (b - a).as_secs_f64(),
            _ => 0.0,
        };
        let rate = |events: u64| {
            if run_seconds > 0.0 {
                events as f64 / run_seconds
            } else {
                0.0
            }
        };
        RuntimeMeasurements {
            num_timelines: self.num_timelines,
            log_ticks_per_sec: self.scale.log_ticks_per_sec(),
            window_size: run.window_size,
            sim_time: self.clock,
            sim_seconds: self.scale.to_seconds(self.clock),
            total_events,
            work_events,
            sync_events,
            windows,
            build_seconds,
            run_seconds,
            total_event_rate: rate(total_events),
            work_event_rate: rate(work_events),
            per_timeline,
        }
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        if let Phase::Running(run) = &mut self.phase {
            run.world.control.shutdown.store(true, Ordering::Release);
            run.world
                .control
                .window_barrier
                .wait(run.world.num_timelines, NO_TIME);
            for worker in run.workers.drain(..) {
                let _ = worker.join();
            }
        }
    }
}

/// Counters of one timeline.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineMeasurements {
    pub timeline: usize,
    /// Events dequeued and dispatched (cancelled events excluded).
    pub executed: u64,
    /// Timeouts, activations delivered to bodies, and binds.
    pub work_executed: u64,
    /// Appointment bookkeeping events.
    pub sync_executed: u64,
    /// Synchronization windows completed.
    pub windows: u64,
}

/// Aggregate runtime report of a simulation.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeMeasurements {
    pub num_timelines: usize,
    pub log_ticks_per_sec: i32,
    pub window_size: Tick,
    pub sim_time: Tick,
    pub sim_seconds: f64,
    pub total_events: u64,
    pub work_events: u64,
    pub sync_events: u64,
    pub windows: u64,
    pub build_seconds: f64,
    pub run_seconds: f64,
    pub total_event_rate: f64,
    pub work_event_rate: f64,
    pub per_timeline: Vec<TimelineMeasurements>,
}

impl fmt::Display for RuntimeMeasurements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "-------------- runtime measurements ----------------")?;
        writeln!(
            f,
            "simulation run of {:.6} sim seconds on {} timelines",
            self.sim_seconds, self.num_timelines
        )?;
        writeln!(f, "build time {:.3}s, run time {:.3}s", self.build_seconds, self.run_seconds)?;
        writeln!(
            f,
            "total evts {}, work evts {}, sync evts {}, windows {}",
            self.total_events, self.work_events, self.sync_events, self.windows
        )?;
        writeln!(
            f,
            "total evt rate {:.0}/s, work evt rate {:.0}/s",
            self.total_event_rate, self.work_event_rate
        )?;
        for tl in &self.per_timeline {
            writeln!(
                f,
                "  timeline {}: {} evts ({} work, {} sync) over {} windows",
                tl.timeline, tl.executed, tl.work_executed, tl.sync_executed, tl.windows
            )?;
        }
        write!(f, "----------------------------------------------------")
    }
}
