//! Event-driven simulation engine.
//!
//! This is the core of the simulator. It owns all runtime state (jobs,
//! per-core occupants, resource holds, the event bus) and drives the
//! stateless strategies: scheduler, execution-time model, and resource
//! protocols. Simulated time advances between atomic event applications
//! only; within one instant the order is segment completions (and their
//! resource releases), deadline checks, new releases, scheduler decisions,
//! preemptions, migrations, and starts.
//!
//! Determinism: every map iterated during simulation is a `BTreeMap` /
//! `BTreeSet` (sorted order), every heap entry carries an explicit total
//! order, and both PRNG streams derive from `sim.seed`. Identical (model,
//! seed) inputs produce bit-identical event sequences.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::arrival::{ArrivalContext, ArrivalRegistry};
use crate::etm::{Etm, EtmLookup, OverheadModel};
use crate::events::{
    BlockReason, EventBus, EventHandler, EventIdMode, EventKind, PreemptKind, SimEvent,
};
use crate::metrics::{MetricsCollector, MetricsReport};
use crate::model::{ModelSpec, ProtocolKind, TaskGraphSpec, TaskType};
use crate::protocol::{PriorityDomain, Protocol, ReleaseOutcome, ResourceRuntime, Woken};
use crate::sched::{
    CoreSnapshot, DecisionAction, ReadySegment, ScheduleSnapshot, SchedulerCfg, SchedulerKind,
};
use crate::types::{
    job_id as make_job_id, segment_key as make_segment_key, CoreId, JobId, Priority, ResourceId,
    SegmentKey, SubtaskId, TaskId, Time, TimeKey, TIME_EPS,
};
use crate::SimError;

/// Completion-boundary slack, matching the coarser tolerance used when
/// comparing accumulated execution against scheduled finish times.
const FINISH_EPS: Time = 1e-9;

/// Bail out of same-instant rescheduling after this many rounds.
const SCHEDULE_RETRY_LIMIT: usize = 8;

/// How segments acquire their resource batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquirePolicy {
    /// Acquire one at a time; keep holdings while waiting for the next.
    #[default]
    LegacySequential,
    /// All-or-nothing: on any block, release in-batch acquisitions first.
    AtomicRollback,
}

impl AcquirePolicy {
    pub fn parse(raw: &str) -> Option<AcquirePolicy> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "legacy_sequential" => Some(AcquirePolicy::LegacySequential),
            "atomic_rollback" => Some(AcquirePolicy::AtomicRollback),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            AcquirePolicy::LegacySequential => "legacy_sequential",
            AcquirePolicy::AtomicRollback => "atomic_rollback",
        }
    }
}

/// Resolved engine configuration, derived from `scheduler.params`.
#[derive(Debug, Clone)]
struct EngineCfg {
    scheduler: SchedulerCfg,
    event_id_mode: EventIdMode,
    acquire_policy: AcquirePolicy,
    etm: Etm,
    overheads: OverheadModel,
}

#[derive(Debug)]
struct CoreRuntime {
    core_id: CoreId,
    speed: f64,
    running: Option<SegmentKey>,
    running_since: Option<Time>,
    finish_time: Option<Time>,
    /// Nominal work consumed per unit time by the current occupant.
    work_rate: f64,
}

#[derive(Debug)]
struct SegmentRuntime {
    key: SegmentKey,
    task_id: TaskId,
    job_id: JobId,
    subtask_id: SubtaskId,
    segment_id: String,
    remaining: Time,
    required_resources: Vec<ResourceId>,
    mapping_hint: Option<CoreId>,
    preemptible: bool,
    absolute_deadline: Option<Time>,
    task_period: Option<Time>,
    release_time: Time,
    ready_time: Time,
    base_priority: Priority,
    effective_priority: Priority,
    running_on: Option<CoreId>,
    finished: bool,
    blocked: bool,
    waiting_resource: Option<ResourceId>,
    det_ready_time: Option<Time>,
    det_window_id: Option<u64>,
    det_offset_index: Option<usize>,
}

#[derive(Debug)]
struct SubtaskRuntime {
    predecessors: Vec<SubtaskId>,
    successors: Vec<SubtaskId>,
    segment_keys: Vec<SegmentKey>,
    next_index: usize,
    completed: bool,
}

#[derive(Debug)]
struct JobRuntime {
    job_id: JobId,
    task_id: TaskId,
    release_index: u64,
    release_time: Time,
    absolute_deadline: Option<Time>,
    abort_on_miss: bool,
    subtasks: BTreeMap<SubtaskId, SubtaskRuntime>,
    completed: bool,
    missed_deadline: bool,
    /// Last core any of this job's segments ran on, for migration tracking.
    last_core: Option<CoreId>,
}

/// Future job release, ordered by (time, release index, task id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ReleaseEntry {
    time: TimeKey,
    release_index: u64,
    task_id: TaskId,
}

/// Deferred segment readiness (time-deterministic release offsets).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyEntry {
    time: TimeKey,
    segment_key: SegmentKey,
}

enum DispatchOutcome {
    Started,
    Blocked,
    Dropped,
    Errored,
    Noop,
}

/// The simulation engine. One instance per run; multiple instances may
/// coexist in a process (no global state).
pub struct Engine {
    bus: EventBus,
    metrics: MetricsCollector,
    arrival_registry: ArrivalRegistry,

    spec: Option<ModelSpec>,
    cfg: Option<EngineCfg>,
    task_index: BTreeMap<TaskId, usize>,
    task_resource_usage: BTreeMap<TaskId, BTreeSet<ResourceId>>,

    protocols: Vec<Protocol>,
    resource_protocols: BTreeMap<ResourceId, usize>,
    resource_bound_cores: BTreeMap<ResourceId, CoreId>,

    cores: BTreeMap<CoreId, CoreRuntime>,
    segments: BTreeMap<SegmentKey, SegmentRuntime>,
    jobs: BTreeMap<JobId, JobRuntime>,
    ready: BTreeSet<SegmentKey>,
    held: BTreeMap<SegmentKey, BTreeSet<ResourceId>>,
    aborted_jobs: BTreeSet<JobId>,
    active_job_priorities: BTreeMap<JobId, Priority>,

    release_heap: BinaryHeap<Reverse<ReleaseEntry>>,
    ready_heap: BinaryHeap<Reverse<ReadyEntry>>,
    pending_ready: BTreeMap<SegmentKey, Time>,

    hyper_period: Option<Time>,
    arrival_rng: StdRng,
    no_params: BTreeMap<String, serde_json::Value>,

    now: Time,
    paused: bool,
    stopped: bool,
    failed: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

impl Engine {
    pub fn new() -> Engine {
        Engine {
            bus: EventBus::new(),
            metrics: MetricsCollector::new(),
            arrival_registry: ArrivalRegistry::with_builtins(),
            spec: None,
            cfg: None,
            task_index: BTreeMap::new(),
            task_resource_usage: BTreeMap::new(),
            protocols: Vec::new(),
            resource_protocols: BTreeMap::new(),
            resource_bound_cores: BTreeMap::new(),
            cores: BTreeMap::new(),
            segments: BTreeMap::new(),
            jobs: BTreeMap::new(),
            ready: BTreeSet::new(),
            held: BTreeMap::new(),
            aborted_jobs: BTreeSet::new(),
            active_job_priorities: BTreeMap::new(),
            release_heap: BinaryHeap::new(),
            ready_heap: BinaryHeap::new(),
            pending_ready: BTreeMap::new(),
            hyper_period: None,
            arrival_rng: StdRng::seed_from_u64(0),
            no_params: BTreeMap::new(),
            now: 0.0,
            paused: false,
            stopped: false,
            failed: false,
        }
    }

    /// Attach an external subscriber. Subscribers persist across
    /// `build()` / `reset()`.
    pub fn subscribe(&mut self, handler: EventHandler) {
        self.bus.subscribe(handler);
    }

    /// Register a custom arrival generator before `build()`.
    pub fn register_arrival_generator(
        &mut self,
        name: &str,
        generator: Box<dyn crate::arrival::ArrivalGenerator>,
    ) {
        self.arrival_registry.register(name, generator);
    }

    pub fn now(&self) -> Time {
        self.now
    }

    pub fn events(&self) -> &[SimEvent] {
        self.bus.events()
    }

    pub fn events_jsonl(&self) -> String {
        self.bus.to_jsonl()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn scheduler_kind(&self) -> Option<SchedulerKind> {
        self.cfg.as_ref().map(|c| c.scheduler.kind)
    }

    /// The model this engine was built from, if any.
    pub fn model(&self) -> Option<&ModelSpec> {
        self.spec.as_ref()
    }

    /// Aggregate metrics for the current run.
    pub fn metrics_report(&self) -> MetricsReport {
        let duration = self.spec.as_ref().map(|s| s.sim.duration).unwrap_or(0.0);
        let core_ids: Vec<CoreId> = self.cores.keys().cloned().collect();
        self.metrics.report(duration, &core_ids)
    }

    /// Materialize runtime state from a validated model. On error no
    /// partial state is left behind: the previous build stays intact.
    pub fn build(&mut self, spec: ModelSpec) -> Result<(), SimError> {
        let cfg = Self::resolve_cfg(&spec)?;
        for task in &spec.tasks {
            if let Some(crate::arrival::ArrivalProcess::Custom { generator, .. }) =
                task.resolved_arrival()
            {
                if !self.arrival_registry.contains(generator) {
                    return Err(SimError::Config {
                        code: "arrival.generator",
                        message: format!(
                            "task '{}' references unknown arrival generator '{generator}'",
                            task.id
                        ),
                    });
                }
            }
        }

        self.clear_runtime();
        self.bus.rearm(cfg.event_id_mode, spec.sim.seed);
        self.metrics.reset();
        self.arrival_rng = StdRng::seed_from_u64(spec.sim.seed as u64);

        self.task_index = spec
            .tasks
            .iter()
            .enumerate()
            .map(|(idx, task)| (task.id.clone(), idx))
            .collect();
        self.task_resource_usage = spec
            .tasks
            .iter()
            .map(|task| {
                let mut used = BTreeSet::new();
                for sub in &task.subtasks {
                    for seg in &sub.segments {
                        used.extend(seg.required_resources.iter().cloned());
                    }
                }
                (task.id.clone(), used)
            })
            .collect();

        for (core_id, speed) in spec.effective_speeds() {
            self.cores.insert(
                core_id.clone(),
                CoreRuntime {
                    core_id,
                    speed,
                    running: None,
                    running_since: None,
                    finish_time: None,
                    work_rate: 0.0,
                },
            );
        }

        self.hyper_period = Self::deterministic_hyper_period(&spec);
        self.setup_protocols(&spec, &cfg);

        for task in &spec.tasks {
            self.release_heap.push(Reverse(ReleaseEntry {
                time: TimeKey(task.release_base_time()),
                release_index: 0,
                task_id: task.id.clone(),
            }));
        }

        info!(
            tasks = spec.tasks.len(),
            cores = self.cores.len(),
            resources = spec.resources.len(),
            seed = spec.sim.seed,
            "engine built"
        );
        self.cfg = Some(cfg);
        self.spec = Some(spec);
        Ok(())
    }

    /// Rebuild from the last model. Equivalent to `build()` with the same
    /// spec; external subscribers remain attached.
    pub fn reset(&mut self) -> Result<(), SimError> {
        match self.spec.take() {
            Some(spec) => self.build(spec),
            None => {
                self.clear_runtime();
                self.bus.rearm(EventIdMode::Deterministic, 0);
                self.metrics.reset();
                Ok(())
            }
        }
    }

    fn clear_runtime(&mut self) {
        self.spec = None;
        self.cfg = None;
        self.task_index.clear();
        self.task_resource_usage.clear();
        self.protocols.clear();
        self.resource_protocols.clear();
        self.resource_bound_cores.clear();
        self.cores.clear();
        self.segments.clear();
        self.jobs.clear();
        self.ready.clear();
        self.held.clear();
        self.aborted_jobs.clear();
        self.active_job_priorities.clear();
        self.release_heap.clear();
        self.ready_heap.clear();
        self.pending_ready.clear();
        self.hyper_period = None;
        self.now = 0.0;
        self.paused = false;
        self.stopped = false;
        self.failed = false;
    }

    fn resolve_cfg(spec: &ModelSpec) -> Result<EngineCfg, SimError> {
        let scheduler = SchedulerCfg::from_spec(&spec.scheduler)?;
        let params = &spec.scheduler.params;

        let event_id_mode = match params.get("event_id_mode") {
            None => EventIdMode::Deterministic,
            Some(value) => {
                let raw = value.as_str().ok_or_else(|| SimError::Config {
                    code: "scheduler.event_id_mode",
                    message: "scheduler.params.event_id_mode must be a string".into(),
                })?;
                EventIdMode::parse(raw).ok_or_else(|| SimError::Config {
                    code: "scheduler.event_id_mode",
                    message: format!(
                        "invalid scheduler.params.event_id_mode='{raw}', expected deterministic|random|seeded_random"
                    ),
                })?
            }
        };
        let acquire_policy = match params.get("resource_acquire_policy") {
            None => AcquirePolicy::LegacySequential,
            Some(value) => {
                let raw = value.as_str().ok_or_else(|| SimError::Config {
                    code: "scheduler.resource_acquire_policy",
                    message: "scheduler.params.resource_acquire_policy must be a string".into(),
                })?;
                AcquirePolicy::parse(raw).ok_or_else(|| SimError::Config {
                    code: "scheduler.resource_acquire_policy",
                    message: "scheduler.params.resource_acquire_policy must be one of legacy_sequential|atomic_rollback"
                        .into(),
                })?
            }
        };
        let etm_name = match params.get("etm") {
            None => "constant".to_string(),
            Some(value) => value
                .as_str()
                .ok_or_else(|| SimError::Config {
                    code: "etm.name",
                    message: "scheduler.params.etm must be a string".into(),
                })?
                .to_string(),
        };
        let etm = Etm::from_params(&etm_name, params.get("etm_params"))?;
        let overheads = OverheadModel::from_params(params.get("overhead"))?;

        Ok(EngineCfg {
            scheduler,
            event_id_mode,
            acquire_policy,
            etm,
            overheads,
        })
    }

    fn setup_protocols(&mut self, spec: &ModelSpec, cfg: &EngineCfg) {
        let domain = match cfg.scheduler.kind {
            SchedulerKind::Edf => PriorityDomain::AbsoluteDeadline,
            SchedulerKind::RateMonotonic => PriorityDomain::FixedPriority,
        };

        // Static ceilings: highest base priority over tasks that may ever
        // request the resource. Under EDF these are placeholders refreshed
        // on every release in the absolute-deadline domain.
        let mut ceilings: BTreeMap<ResourceId, f64> = spec
            .resources
            .iter()
            .map(|r| (r.id.clone(), Priority::LOWEST.0))
            .collect();
        if domain == PriorityDomain::FixedPriority {
            for task in &spec.tasks {
                let priority = cfg
                    .scheduler
                    .priority_value(task.deadline, task.period)
                    .0;
                for resource in self
                    .task_resource_usage
                    .get(&task.id)
                    .into_iter()
                    .flatten()
                {
                    if let Some(slot) = ceilings.get_mut(resource) {
                        *slot = slot.max(priority);
                    }
                }
            }
        }

        let mut grouped: BTreeMap<ProtocolKind, BTreeMap<ResourceId, ResourceRuntime>> =
            BTreeMap::new();
        for resource in &spec.resources {
            self.resource_bound_cores
                .insert(resource.id.clone(), resource.bound_core_id.clone());
            grouped.entry(resource.protocol).or_default().insert(
                resource.id.clone(),
                ResourceRuntime {
                    bound_core_id: resource.bound_core_id.clone(),
                    ceiling: ceilings[&resource.id],
                },
            );
        }
        for (kind, resources) in grouped {
            let mut protocol = Protocol::new(kind, domain);
            protocol.configure(&resources);
            let index = self.protocols.len();
            for resource_id in resources.keys() {
                self.resource_protocols.insert(resource_id.clone(), index);
            }
            self.protocols.push(protocol);
        }
    }

    /// Recompute EDF-domain PCP ceilings from the active job set: a
    /// resource's ceiling is the highest priority (smallest absolute
    /// deadline) among active jobs whose task can request it.
    fn refresh_resource_ceilings(&mut self) {
        let Some(cfg) = &self.cfg else { return };
        if cfg.scheduler.kind != SchedulerKind::Edf || self.protocols.is_empty() {
            return;
        }
        let mut ceilings: BTreeMap<ResourceId, f64> = self
            .resource_protocols
            .keys()
            .map(|id| (id.clone(), Priority::LOWEST.0))
            .collect();
        for (job_id, priority) in &self.active_job_priorities {
            let Some(job) = self.jobs.get(job_id) else {
                continue;
            };
            for resource in self
                .task_resource_usage
                .get(&job.task_id)
                .into_iter()
                .flatten()
            {
                if let Some(slot) = ceilings.get_mut(resource) {
                    *slot = slot.max(priority.0);
                }
            }
        }
        for protocol in &mut self.protocols {
            protocol.update_resource_ceilings(&ceilings);
        }
    }

    fn register_active_job_priority(&mut self, job_id: &JobId, priority: Priority) {
        self.active_job_priorities.insert(job_id.clone(), priority);
        self.refresh_resource_ceilings();
    }

    fn unregister_active_job_priority(&mut self, job_id: &JobId) {
        if self.active_job_priorities.remove(job_id).is_some() {
            self.refresh_resource_ceilings();
        }
    }

    /// Least common multiple of time-deterministic periods (scaled to
    /// microsecond resolution), used to assign deterministic window ids.
    fn deterministic_hyper_period(spec: &ModelSpec) -> Option<Time> {
        const SCALE: f64 = 1_000_000.0;
        let mut lcm: u64 = 1;
        let mut found = false;
        for task in &spec.tasks {
            if task.task_type != TaskType::TimeDeterministic {
                continue;
            }
            let Some(period) = task.period else { continue };
            let scaled = (period * SCALE).round() as u64;
            if scaled == 0 {
                continue;
            }
            found = true;
            lcm = lcm / gcd(lcm, scaled) * scaled;
        }
        found.then_some(lcm as f64 / SCALE)
    }

    fn publish(&mut self, kind: EventKind) {
        self.bus.publish(self.now, kind);
        if let Some(event) = self.bus.events().last() {
            self.metrics.consume(event);
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle: run / step / pause / resume / stop
    // ------------------------------------------------------------------

    /// Advance until `until` (default `sim.duration`) or no more events.
    pub fn run(&mut self, until: Option<Time>) -> Result<(), SimError> {
        match self.run_inner(until) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.failed = true;
                self.metrics.mark_failed();
                Err(err)
            }
        }
    }

    fn run_inner(&mut self, until: Option<Time>) -> Result<(), SimError> {
        let duration = self.require_built()?.sim.duration;
        let horizon = until.unwrap_or(duration);

        while self.now < horizon && !self.stopped {
            if self.paused {
                break;
            }
            if !self.advance_once(horizon)? {
                break;
            }
        }

        let reached_horizon = self.now >= horizon - TIME_EPS;
        self.finalize(reached_horizon && !self.paused && !self.stopped)
    }

    /// Advance exactly one event horizon, or by `delta` simulated time.
    pub fn step(&mut self, delta: Option<Time>) -> Result<(), SimError> {
        let duration = self.require_built()?.sim.duration;
        match delta {
            None => {
                self.advance_once(duration)?;
            }
            Some(delta) => {
                let target = self.now + delta;
                while self.now < target && !self.stopped {
                    if !self.advance_once(target)? {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Checked between event applications; any partially-emitted instant
    /// completes atomically.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    fn require_built(&self) -> Result<&ModelSpec, SimError> {
        self.spec.as_ref().ok_or(SimError::Config {
            code: "engine.build",
            message: "build() must be called before running".into(),
        })
    }

    /// One iteration of the main loop: apply everything due at `now`,
    /// then advance the clock to the next event horizon.
    fn advance_once(&mut self, horizon: Time) -> Result<bool, SimError> {
        self.process_releases()?;
        self.process_ready_heap();
        self.check_deadlines()?;
        self.schedule_until_stable()?;

        let mut next: Option<Time> = None;
        let mut consider = |t: Time| {
            next = Some(next.map_or(t, |n: Time| n.min(t)));
        };
        if let Some(Reverse(entry)) = self.release_heap.peek() {
            consider(entry.time.0);
        }
        if let Some(Reverse(entry)) = self.ready_heap.peek() {
            consider(entry.time.0);
        }
        for core in self.cores.values() {
            if let Some(finish) = core.finish_time {
                consider(finish);
            }
        }
        for job in self.jobs.values() {
            if job.completed || job.missed_deadline {
                continue;
            }
            let Some(deadline) = job.absolute_deadline else {
                continue;
            };
            if deadline > self.now + TIME_EPS {
                consider(deadline);
            }
        }
        let Some(mut next_time) = next else {
            return Ok(false);
        };
        if next_time <= self.now + TIME_EPS {
            // Guard against zero-width stalls.
            next_time = self.now + FINISH_EPS;
        }
        self.now = next_time.min(horizon);

        self.process_ready_heap();
        self.complete_finished_segments()?;
        self.check_deadlines()?;
        Ok(true)
    }

    fn finalize(&mut self, truncate_running: bool) -> Result<(), SimError> {
        if truncate_running {
            self.truncate_running_segments()?;
        }
        self.check_deadlines()
    }

    // ------------------------------------------------------------------
    // Releases and readiness
    // ------------------------------------------------------------------

    fn process_releases(&mut self) -> Result<(), SimError> {
        loop {
            match self.release_heap.peek() {
                Some(Reverse(entry)) if entry.time.0 <= self.now + TIME_EPS => {}
                _ => break,
            }
            let Reverse(entry) = self.release_heap.pop().expect("peeked entry");
            let task_idx = self.task_index[&entry.task_id];
            let task = self.require_built()?.tasks[task_idx].clone();
            self.release_job(&task, entry.release_index, entry.time.0)?;
        }
        Ok(())
    }

    fn release_job(
        &mut self,
        task: &TaskGraphSpec,
        release_index: u64,
        release_time: Time,
    ) -> Result<(), SimError> {
        let cfg = self.cfg.as_ref().expect("built engine");
        let job_id = make_job_id(&task.id, release_index);
        let absolute_deadline = task.deadline.map(|d| release_time + d);
        let base_priority = cfg
            .scheduler
            .priority_value(absolute_deadline, task.period);

        let mut subtasks: BTreeMap<SubtaskId, SubtaskRuntime> = BTreeMap::new();
        for sub in &task.subtasks {
            let mut ordered = sub.segments.clone();
            ordered.sort_by_key(|seg| seg.index);
            let mut segment_keys = Vec::with_capacity(ordered.len());
            for seg in &ordered {
                let key = make_segment_key(&job_id, &sub.id, &seg.id);
                let (det_ready_time, det_window_id, det_offset_index) =
                    self.deterministic_ready_info(task, release_index, release_time, seg.release_offsets.as_deref());
                self.segments.insert(
                    key.clone(),
                    SegmentRuntime {
                        key: key.clone(),
                        task_id: task.id.clone(),
                        job_id: job_id.clone(),
                        subtask_id: sub.id.clone(),
                        segment_id: seg.id.clone(),
                        remaining: seg.wcet,
                        required_resources: seg.required_resources.clone(),
                        mapping_hint: seg.mapping_hint.clone(),
                        preemptible: seg.preemptible,
                        absolute_deadline,
                        task_period: task.period,
                        release_time,
                        ready_time: release_time,
                        base_priority,
                        effective_priority: base_priority,
                        running_on: None,
                        finished: false,
                        blocked: false,
                        waiting_resource: None,
                        det_ready_time,
                        det_window_id,
                        det_offset_index,
                    },
                );
                self.held.insert(key.clone(), BTreeSet::new());
                segment_keys.push(key);
            }
            subtasks.insert(
                sub.id.clone(),
                SubtaskRuntime {
                    predecessors: sub.predecessors.clone(),
                    successors: sub.successors.clone(),
                    segment_keys,
                    next_index: 0,
                    completed: false,
                },
            );
        }

        self.jobs.insert(
            job_id.clone(),
            JobRuntime {
                job_id: job_id.clone(),
                task_id: task.id.clone(),
                release_index,
                release_time,
                absolute_deadline,
                abort_on_miss: task.abort_on_miss,
                subtasks,
                completed: false,
                missed_deadline: false,
                last_core: None,
            },
        );
        self.register_active_job_priority(&job_id, base_priority);

        debug!(job = %job_id, release_time, "job released");
        self.publish(EventKind::JobRelease {
            job_id: job_id.clone(),
            task_id: task.id.clone(),
            release_index,
            absolute_deadline,
        });

        let roots: Vec<SegmentKey> = self.jobs[&job_id]
            .subtasks
            .values()
            .filter(|sub| sub.predecessors.is_empty())
            .map(|sub| sub.segment_keys[0].clone())
            .collect();
        for key in roots {
            self.queue_segment_ready(&key);
        }

        let next_index = release_index + 1;
        if let Some(next_release) = self.next_release_time(task, next_index, release_time)? {
            let duration = self.require_built()?.sim.duration;
            if next_release <= duration + TIME_EPS {
                self.release_heap.push(Reverse(ReleaseEntry {
                    time: TimeKey(next_release),
                    release_index: next_index,
                    task_id: task.id.clone(),
                }));
            }
        }
        Ok(())
    }

    fn deterministic_ready_info(
        &self,
        task: &TaskGraphSpec,
        release_index: u64,
        release_time: Time,
        release_offsets: Option<&[f64]>,
    ) -> (Option<Time>, Option<u64>, Option<usize>) {
        if task.task_type != TaskType::TimeDeterministic {
            return (None, None, None);
        }
        let default_offsets = [0.0];
        let offsets = match release_offsets {
            Some(offsets) if !offsets.is_empty() => offsets,
            _ => &default_offsets,
        };
        let offset_index = (release_index as usize) % offsets.len();
        let ready_time = release_time + offsets[offset_index];
        let mut window_id = release_index;
        if let Some(hyper) = self.hyper_period {
            if hyper > TIME_EPS {
                let elapsed = (release_time - task.release_base_time()).max(0.0);
                window_id = ((elapsed + TIME_EPS) / hyper) as u64;
            }
        }
        (Some(ready_time), Some(window_id), Some(offset_index))
    }

    fn next_release_time(
        &mut self,
        task: &TaskGraphSpec,
        next_index: u64,
        current_release: Time,
    ) -> Result<Option<Time>, SimError> {
        if let Some(cap) = task.max_releases() {
            if next_index >= cap {
                return Ok(None);
            }
        }
        if let Some(process) = task.resolved_arrival() {
            let ctx = ArrivalContext {
                task_id: &task.id,
                now: self.now,
                current_release,
                release_index: next_index,
                params: &self.no_params,
            };
            let interval =
                process.next_interval(&ctx, &self.arrival_registry, &mut self.arrival_rng)?;
            return Ok(interval.map(|i| current_release + i));
        }
        if task.task_type == TaskType::TimeDeterministic {
            let Some(period) = task.period else {
                return Ok(None);
            };
            return Ok(Some(task.release_base_time() + period * next_index as f64));
        }
        Ok(None)
    }

    fn queue_segment_ready(&mut self, key: &SegmentKey) {
        let det_ready_time = match self.segments.get(key) {
            Some(seg) if !seg.finished && !self.aborted_jobs.contains(&seg.job_id) => {
                seg.det_ready_time
            }
            _ => return,
        };
        match det_ready_time {
            Some(ready_time) if ready_time > self.now + TIME_EPS => {
                if let Some(pending) = self.pending_ready.get(key) {
                    if *pending <= ready_time + TIME_EPS {
                        return;
                    }
                }
                self.pending_ready.insert(key.clone(), ready_time);
                self.ready_heap.push(Reverse(ReadyEntry {
                    time: TimeKey(ready_time),
                    segment_key: key.clone(),
                }));
            }
            Some(ready_time) => self.mark_segment_ready(key, self.now.max(ready_time)),
            None => self.mark_segment_ready(key, self.now),
        }
    }

    fn process_ready_heap(&mut self) {
        loop {
            match self.ready_heap.peek() {
                Some(Reverse(entry)) if entry.time.0 <= self.now + TIME_EPS => {}
                _ => break,
            }
            let Reverse(entry) = self.ready_heap.pop().expect("peeked entry");
            let Some(pending) = self.pending_ready.get(&entry.segment_key) else {
                continue;
            };
            if (pending - entry.time.0).abs() > TIME_EPS {
                continue;
            }
            self.pending_ready.remove(&entry.segment_key);
            let at = self.now.max(entry.time.0);
            self.mark_segment_ready(&entry.segment_key, at);
        }
    }

    fn mark_segment_ready(&mut self, key: &SegmentKey, at: Time) {
        let Some(seg) = self.segments.get_mut(key) else {
            return;
        };
        if seg.finished || self.aborted_jobs.contains(&seg.job_id) {
            return;
        }
        seg.blocked = false;
        seg.waiting_resource = None;
        seg.ready_time = at;
        let kind = EventKind::SubtaskReady {
            job_id: seg.job_id.clone(),
            subtask_id: seg.subtask_id.clone(),
            segment_key: key.clone(),
            window_id: seg.det_window_id,
            offset_index: seg.det_offset_index,
        };
        self.pending_ready.remove(key);
        self.ready.insert(key.clone());
        self.publish(kind);
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    fn build_snapshot(&self) -> ScheduleSnapshot {
        let ready = self
            .ready
            .iter()
            .filter_map(|key| self.segments.get(key))
            .filter(|seg| !seg.finished && !self.aborted_jobs.contains(&seg.job_id))
            .map(|seg| self.ready_segment(seg))
            .collect();
        let cores = self
            .cores
            .values()
            .map(|core| {
                let running = core
                    .running
                    .as_ref()
                    .and_then(|key| self.segments.get(key))
                    .filter(|seg| !seg.finished && !self.aborted_jobs.contains(&seg.job_id))
                    .map(|seg| self.ready_segment(seg));
                CoreSnapshot {
                    core_id: core.core_id.clone(),
                    speed: core.speed,
                    running,
                }
            })
            .collect();
        ScheduleSnapshot {
            now: self.now,
            ready,
            cores,
        }
    }

    fn ready_segment(&self, seg: &SegmentRuntime) -> ReadySegment {
        ReadySegment {
            key: seg.key.clone(),
            job_id: seg.job_id.clone(),
            task_id: seg.task_id.clone(),
            subtask_id: seg.subtask_id.clone(),
            segment_id: seg.segment_id.clone(),
            remaining: seg.remaining,
            absolute_deadline: seg.absolute_deadline,
            task_period: seg.task_period,
            mapping_hint: seg.mapping_hint.clone(),
            preemptible: seg.preemptible,
            release_time: seg.release_time,
            ready_time: seg.ready_time,
            priority: seg.effective_priority,
        }
    }

    fn schedule_until_stable(&mut self) -> Result<(), SimError> {
        for _ in 0..SCHEDULE_RETRY_LIMIT {
            let changed = self.schedule_once()?;
            if !changed || self.ready.is_empty() {
                return Ok(());
            }
        }
        if !self.ready.is_empty() && self.cores.values().all(|core| core.running.is_none()) {
            warn!(ready = self.ready.len(), "schedule retry limit exhausted");
            self.publish(EventKind::Error {
                reason: "schedule_retry_limit".into(),
                job_id: None,
                segment_key: None,
                core_id: None,
                resource_id: None,
                detail: Some(format!(
                    "limit={SCHEDULE_RETRY_LIMIT} ready_count={}",
                    self.ready.len()
                )),
            });
        }
        Ok(())
    }

    fn schedule_once(&mut self) -> Result<bool, SimError> {
        self.ready.retain(|key| {
            self.segments
                .get(key)
                .map(|seg| !seg.finished && !self.aborted_jobs.contains(&seg.job_id))
                .unwrap_or(false)
        });
        if self.ready.is_empty() && self.cores.values().all(|core| core.running.is_none()) {
            return Ok(false);
        }

        let cfg = self.cfg.as_ref().expect("built engine");
        let schedule_cost = cfg.overheads.schedule;
        let decisions = cfg.scheduler.schedule(&self.build_snapshot());
        if schedule_cost > 0.0 {
            self.now += schedule_cost;
        }

        let mut changed = false;
        for decision in &decisions {
            if decision.action == DecisionAction::Preempt {
                if let Some(core_id) = &decision.from_core {
                    if self.apply_preempt(core_id, PreemptKind::Scheduler, true, false, None)? {
                        changed = true;
                    }
                }
            }
        }
        for decision in &decisions {
            if decision.action == DecisionAction::Migrate {
                let (Some(from), Some(key)) = (&decision.from_core, &decision.segment_key) else {
                    continue;
                };
                let still_running = self
                    .cores
                    .get(from)
                    .map(|core| core.running.as_ref() == Some(key))
                    .unwrap_or(false);
                if !still_running {
                    continue;
                }
                if self.apply_preempt(from, PreemptKind::Scheduler, true, false, Some("migrate"))? {
                    changed = true;
                }
            }
        }
        for decision in &decisions {
            if decision.action == DecisionAction::Dispatch {
                let (Some(job_id), Some(key), Some(core_id)) = (
                    &decision.job_id,
                    &decision.segment_key,
                    &decision.to_core,
                ) else {
                    continue;
                };
                let outcome = self.apply_dispatch(job_id, key, core_id)?;
                if !matches!(outcome, DispatchOutcome::Noop) {
                    changed = true;
                }
            }
        }
        Ok(changed)
    }

    fn apply_preempt(
        &mut self,
        core_id: &CoreId,
        kind: PreemptKind,
        requeue: bool,
        force: bool,
        reason: Option<&str>,
    ) -> Result<bool, SimError> {
        let now = self.now;
        let Some(core) = self.cores.get_mut(core_id) else {
            return Ok(false);
        };
        let Some(key) = core.running.clone() else {
            return Ok(false);
        };
        let seg = self.segments.get_mut(&key).ok_or(SimError::Invariant {
            code: "engine.running_segment",
            message: format!("core '{core_id}' runs unknown segment '{key}'"),
        })?;
        if !seg.preemptible && !force {
            return Ok(false);
        }
        if let Some(since) = core.running_since {
            let elapsed = (now - since).max(0.0);
            seg.remaining -= elapsed * core.work_rate;
            if seg.remaining < -1e-6 {
                return Err(SimError::Invariant {
                    code: "engine.negative_work",
                    message: format!("segment '{key}' remaining work went negative"),
                });
            }
            seg.remaining = seg.remaining.max(0.0);
        }
        seg.running_on = None;
        let job_id = seg.job_id.clone();
        let finished = seg.finished;

        core.running = None;
        core.running_since = None;
        core.finish_time = None;
        core.work_rate = 0.0;

        if requeue && !finished && !self.aborted_jobs.contains(&job_id) {
            self.ready.insert(key.clone());
        }
        info!(core = %core_id, segment = %key, ?kind, "preempted");
        self.publish(EventKind::Preempt {
            job_id,
            segment_key: key,
            core_id: core_id.clone(),
            kind,
            reason: reason.map(str::to_string),
        });
        Ok(true)
    }

    fn apply_dispatch(
        &mut self,
        job_id: &JobId,
        key: &SegmentKey,
        core_id: &CoreId,
    ) -> Result<DispatchOutcome, SimError> {
        if self.aborted_jobs.contains(job_id) {
            return Ok(DispatchOutcome::Noop);
        }
        if self
            .cores
            .get(core_id)
            .map(|core| core.running.is_some())
            .unwrap_or(true)
        {
            return Ok(DispatchOutcome::Noop);
        }
        if !self.ready.contains(key) {
            return Ok(DispatchOutcome::Noop);
        }
        {
            let seg = &self.segments[key];
            if seg.finished || self.aborted_jobs.contains(&seg.job_id) {
                self.ready.remove(key);
                return Ok(DispatchOutcome::Dropped);
            }
            if let Some(hint) = &seg.mapping_hint {
                if hint != core_id {
                    let kind = EventKind::Error {
                        reason: "mapping_hint_violation".into(),
                        job_id: Some(seg.job_id.clone()),
                        segment_key: Some(key.clone()),
                        core_id: Some(core_id.clone()),
                        resource_id: None,
                        detail: Some(format!("expected_core={hint} requested_core={core_id}")),
                    };
                    self.publish(kind);
                    self.abort_job(job_id, "abort_on_error")?;
                    return Ok(DispatchOutcome::Errored);
                }
            }
        }

        match self.acquire_segment_resources(job_id, key, core_id)? {
            DispatchOutcome::Started => {}
            other => return Ok(other),
        }

        let last_core = self.jobs[job_id].last_core.clone();
        let migration_cost = match last_core {
            Some(from) if &from != core_id => {
                self.publish(EventKind::Migration {
                    job_id: job_id.clone(),
                    segment_key: key.clone(),
                    from_core: from,
                    to_core: core_id.clone(),
                });
                self.cfg.as_ref().expect("built engine").overheads.migration
            }
            _ => 0.0,
        };
        let cfg = self.cfg.as_ref().expect("built engine");
        let context_cost = cfg.overheads.context_switch;

        let core_speed = self.cores[core_id].speed;
        let (execution_time, work_rate) = {
            let seg = &self.segments[key];
            let lookup = EtmLookup {
                task_id: &seg.task_id,
                subtask_id: &seg.subtask_id,
                segment_id: &seg.segment_id,
                core_id,
            };
            (
                cfg.etm.estimate(seg.remaining, core_speed, &lookup),
                cfg.etm.work_rate(core_speed, &lookup),
            )
        };
        let total_runtime = migration_cost + context_cost + execution_time;
        let now = self.now;

        let remaining = {
            let seg = self.segments.get_mut(key).expect("checked above");
            seg.running_on = Some(core_id.clone());
            seg.blocked = false;
            seg.remaining
        };
        self.ready.remove(key);
        {
            let job = self.jobs.get_mut(job_id).expect("released job");
            job.last_core = Some(core_id.clone());
        }
        let core = self.cores.get_mut(core_id).expect("known core");
        core.running = Some(key.clone());
        core.running_since = Some(now);
        core.finish_time = Some(now + total_runtime);
        // Spread overheads into the consumption rate so nominal-work
        // accounting stays exact on preemption and cross-core resume.
        core.work_rate = if total_runtime > 0.0 {
            remaining / total_runtime
        } else {
            work_rate
        };

        info!(core = %core_id, segment = %key, execution_time, "started");
        self.publish(EventKind::SegmentStart {
            job_id: job_id.clone(),
            segment_key: key.clone(),
            core_id: core_id.clone(),
            execution_time,
            estimated_finish: now + total_runtime,
        });
        Ok(DispatchOutcome::Started)
    }

    /// Acquire every resource the segment needs, honoring the configured
    /// acquisition policy. Returns `Started` when all grants succeeded.
    fn acquire_segment_resources(
        &mut self,
        job_id: &JobId,
        key: &SegmentKey,
        core_id: &CoreId,
    ) -> Result<DispatchOutcome, SimError> {
        let required = self.segments[key].required_resources.clone();
        let mut acquired_now: Vec<ResourceId> = Vec::new();

        for resource_id in required {
            if self.held[key].contains(&resource_id) {
                continue;
            }
            let priority = self.segments[key].effective_priority;
            let protocol_idx = self.resource_protocols[&resource_id];
            let outcome =
                self.protocols[protocol_idx].request(key, &resource_id, core_id, priority);
            let domain = self.protocols[protocol_idx].domain();

            if !outcome.granted {
                let reason = outcome.reason.unwrap_or(BlockReason::ResourceBusy);
                let policy = self.cfg.as_ref().expect("built engine").acquire_policy;
                let mut rollback_released = Vec::new();
                if policy == AcquirePolicy::AtomicRollback
                    && !acquired_now.is_empty()
                    && reason != BlockReason::BoundCoreViolation
                {
                    rollback_released =
                        self.rollback_acquisitions(job_id, key, core_id, &acquired_now)?;
                }
                {
                    let seg = self.segments.get_mut(key).expect("checked above");
                    seg.blocked = true;
                    seg.waiting_resource = Some(resource_id.clone());
                }
                self.ready.remove(key);
                debug!(segment = %key, resource = %resource_id, ?reason, "blocked");
                self.publish(EventKind::SegmentBlocked {
                    job_id: job_id.clone(),
                    segment_key: key.clone(),
                    core_id: core_id.clone(),
                    resource_id: resource_id.clone(),
                    reason,
                    request_priority: priority.0,
                    owner_segment: outcome.owner_segment.clone(),
                    system_ceiling: outcome.system_ceiling,
                    priority_domain: (reason == BlockReason::SystemCeilingBlock)
                        .then_some(domain),
                    resource_acquire_policy: policy.as_str().to_string(),
                    rollback_released,
                });
                // Inheritance raises are published after the block event
                // that justifies them.
                self.apply_priority_updates(&outcome.priority_updates);
                if reason == BlockReason::BoundCoreViolation {
                    self.publish(EventKind::Error {
                        reason: "bound_core_violation".into(),
                        job_id: Some(job_id.clone()),
                        segment_key: Some(key.clone()),
                        core_id: Some(core_id.clone()),
                        resource_id: Some(resource_id.clone()),
                        detail: None,
                    });
                    self.abort_job(job_id, "abort_on_error")?;
                    return Ok(DispatchOutcome::Errored);
                }
                return Ok(DispatchOutcome::Blocked);
            }

            self.apply_priority_updates(&outcome.priority_updates);
            self.held.get_mut(key).expect("registered segment").insert(resource_id.clone());
            acquired_now.push(resource_id.clone());
            self.publish(EventKind::ResourceAcquire {
                job_id: job_id.clone(),
                segment_key: key.clone(),
                resource_id: resource_id.clone(),
                core_id: core_id.clone(),
                request_priority: priority.0,
            });
            if let Some((ceiling, system_ceiling)) = outcome.ceiling_push {
                self.publish(EventKind::CeilingPush {
                    resource_id,
                    ceiling,
                    system_ceiling,
                });
            }
        }
        Ok(DispatchOutcome::Started)
    }

    /// Release in-batch acquisitions in reverse order (atomic_rollback).
    fn rollback_acquisitions(
        &mut self,
        job_id: &JobId,
        key: &SegmentKey,
        core_id: &CoreId,
        acquired: &[ResourceId],
    ) -> Result<Vec<ResourceId>, SimError> {
        let mut released = Vec::new();
        for resource_id in acquired.iter().rev() {
            if !self.held[key].contains(resource_id) {
                continue;
            }
            self.release_one_resource(
                job_id,
                key,
                resource_id,
                Some(core_id.clone()),
                Some("acquire_rollback"),
            )?;
            released.push(resource_id.clone());
        }
        released.sort();
        Ok(released)
    }

    fn apply_priority_updates(&mut self, updates: &[crate::protocol::PriorityUpdate]) {
        for update in updates {
            let Some(seg) = self.segments.get_mut(&update.segment_key) else {
                continue;
            };
            let finished = seg.finished;
            if !finished {
                seg.effective_priority = Priority(update.to);
            }
            let job_id = seg.job_id.clone();
            if update.to > update.from {
                // A raise for a finished segment would violate the
                // owner-hold contract; drop it.
                if finished {
                    continue;
                }
                self.publish(EventKind::PriorityRaise {
                    job_id,
                    segment_key: update.segment_key.clone(),
                    from: update.from,
                    to: update.to,
                    due_to: update.due_to.clone(),
                });
            } else {
                // Restores still document the protocol transition when a
                // segment's last release happens on its completion path.
                self.publish(EventKind::PriorityRestore {
                    job_id,
                    segment_key: update.segment_key.clone(),
                    from: update.from,
                    to: update.to,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Completion, resource release, deadlines, abort
    // ------------------------------------------------------------------

    fn complete_finished_segments(&mut self) -> Result<(), SimError> {
        let finished: Vec<CoreId> = self
            .cores
            .values()
            .filter(|core| {
                core.running.is_some()
                    && core
                        .finish_time
                        .map(|f| f <= self.now + FINISH_EPS)
                        .unwrap_or(false)
            })
            .map(|core| core.core_id.clone())
            .collect();

        for core_id in finished {
            let Some(key) = self.cores[&core_id].running.clone() else {
                continue;
            };
            {
                let core = self.cores.get_mut(&core_id).expect("known core");
                let seg = self.segments.get_mut(&key).ok_or(SimError::Invariant {
                    code: "engine.running_segment",
                    message: format!("core '{core_id}' runs unknown segment '{key}'"),
                })?;
                if let Some(since) = core.running_since {
                    let elapsed = (self.now - since).max(0.0);
                    seg.remaining = (seg.remaining - elapsed * core.work_rate).max(0.0);
                }
                seg.finished = true;
                seg.running_on = None;
                core.running = None;
                core.running_since = None;
                core.finish_time = None;
                core.work_rate = 0.0;
            }

            let job_id = self.segments[&key].job_id.clone();
            info!(core = %core_id, segment = %key, "completed");
            self.publish(EventKind::SegmentEnd {
                job_id: job_id.clone(),
                segment_key: key.clone(),
                core_id: core_id.clone(),
                truncated: false,
            });
            self.release_segment_resources(&job_id, &key, Some(core_id))?;
            self.on_segment_finish(&key)?;
        }
        Ok(())
    }

    /// Release everything a segment holds, in sorted resource order.
    fn release_segment_resources(
        &mut self,
        job_id: &JobId,
        key: &SegmentKey,
        core_id: Option<CoreId>,
    ) -> Result<(), SimError> {
        let held: Vec<ResourceId> = self
            .held
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for resource_id in held {
            self.release_one_resource(job_id, key, &resource_id, core_id.clone(), None)?;
        }
        Ok(())
    }

    fn release_one_resource(
        &mut self,
        job_id: &JobId,
        key: &SegmentKey,
        resource_id: &ResourceId,
        core_id: Option<CoreId>,
        reason: Option<&str>,
    ) -> Result<(), SimError> {
        let protocol_idx = self.resource_protocols[resource_id];
        let outcome = self.protocols[protocol_idx].release(key, resource_id);
        if !outcome.released {
            return Err(SimError::Invariant {
                code: "engine.release_unheld",
                message: format!("segment '{key}' released resource '{resource_id}' it does not hold"),
            });
        }
        self.held.get_mut(key).expect("registered segment").remove(resource_id);
        self.apply_priority_updates(&outcome.priority_updates);
        self.publish(EventKind::ResourceRelease {
            job_id: job_id.clone(),
            segment_key: key.clone(),
            resource_id: resource_id.clone(),
            core_id,
            reason: reason.map(str::to_string),
        });
        self.emit_release_effects(&outcome, None);
        Ok(())
    }

    /// Publish ceiling pops and wake blocked segments from a release or
    /// cancellation outcome.
    fn emit_release_effects(&mut self, outcome: &ReleaseOutcome, wake_reason: Option<&str>) {
        for (resource_id, system_ceiling) in &outcome.ceiling_pops {
            self.publish(EventKind::CeilingPop {
                resource_id: resource_id.clone(),
                system_ceiling: *system_ceiling,
            });
        }
        for woken in &outcome.woken {
            self.wake_segment(woken, wake_reason);
        }
    }

    fn wake_segment(&mut self, woken: &Woken, reason: Option<&str>) {
        let Some(seg) = self.segments.get_mut(&woken.segment_key) else {
            return;
        };
        if seg.finished || self.aborted_jobs.contains(&seg.job_id) {
            return;
        }
        seg.blocked = false;
        seg.waiting_resource = None;
        let job_id = seg.job_id.clone();
        self.ready.insert(woken.segment_key.clone());
        self.publish(EventKind::SegmentUnblocked {
            job_id,
            segment_key: woken.segment_key.clone(),
            resource_id: Some(woken.resource_id.clone()),
            reason: reason.map(str::to_string),
        });
    }

    fn on_segment_finish(&mut self, key: &SegmentKey) -> Result<(), SimError> {
        let (job_id, subtask_id) = {
            let seg = &self.segments[key];
            (seg.job_id.clone(), seg.subtask_id.clone())
        };
        if self.aborted_jobs.contains(&job_id) {
            return Ok(());
        }

        let next_key = {
            let job = self.jobs.get_mut(&job_id).expect("released job");
            let sub = job.subtasks.get_mut(&subtask_id).expect("known subtask");
            sub.next_index += 1;
            if sub.next_index < sub.segment_keys.len() {
                Some(sub.segment_keys[sub.next_index].clone())
            } else {
                sub.completed = true;
                None
            }
        };
        if let Some(next) = next_key {
            self.queue_segment_ready(&next);
            return Ok(());
        }

        // Subtask finished: wake successors whose predecessors are all done.
        let newly_ready: Vec<SegmentKey> = {
            let job = &self.jobs[&job_id];
            let sub = &job.subtasks[&subtask_id];
            sub.successors
                .iter()
                .filter_map(|succ_id| {
                    let succ = &job.subtasks[succ_id];
                    if succ.completed {
                        return None;
                    }
                    let unblocked = succ
                        .predecessors
                        .iter()
                        .all(|pred| job.subtasks[pred].completed);
                    unblocked.then(|| succ.segment_keys[0].clone())
                })
                .collect()
        };
        for next in newly_ready {
            self.queue_segment_ready(&next);
        }

        let all_done = self.jobs[&job_id].subtasks.values().all(|sub| sub.completed);
        if all_done {
            let task_id = {
                let job = self.jobs.get_mut(&job_id).expect("released job");
                job.completed = true;
                job.task_id.clone()
            };
            self.unregister_active_job_priority(&job_id);
            info!(job = %job_id, "job complete");
            self.publish(EventKind::JobComplete { job_id, task_id });
        }
        Ok(())
    }

    /// Closed-bound deadline scan: an incomplete job at `now >= deadline`
    /// misses. Simultaneous misses are processed in (task id, release
    /// index) order.
    fn check_deadlines(&mut self) -> Result<(), SimError> {
        let mut due: Vec<(TaskId, u64, JobId)> = self
            .jobs
            .values()
            .filter(|job| !job.completed && !job.missed_deadline)
            .filter_map(|job| {
                let deadline = job.absolute_deadline?;
                (deadline <= self.now + TIME_EPS).then(|| {
                    (job.task_id.clone(), job.release_index, job.job_id.clone())
                })
            })
            .collect();
        due.sort();

        for (_, _, job_id) in due {
            let (deadline, abort_on_miss) = {
                let job = self.jobs.get_mut(&job_id).expect("scanned job");
                job.missed_deadline = true;
                (job.absolute_deadline.expect("checked above"), job.abort_on_miss)
            };
            warn!(job = %job_id, deadline, "deadline miss");
            self.publish(EventKind::DeadlineMiss {
                job_id: job_id.clone(),
                absolute_deadline: deadline,
                abort_on_miss,
            });
            if abort_on_miss {
                self.abort_job(&job_id, "abort_on_miss")?;
            }
        }
        Ok(())
    }

    /// The single exit bottleneck for abandoning a job: forced preemption
    /// off every core, release of all held resources, protocol
    /// cancellation (waking any waiters), then `JobAbort`. The job never
    /// reappears in scheduling.
    fn abort_job(&mut self, job_id: &JobId, reason: &str) -> Result<(), SimError> {
        if self.aborted_jobs.contains(job_id) {
            return Ok(());
        }
        self.aborted_jobs.insert(job_id.clone());

        let segment_keys: Vec<SegmentKey> = self
            .jobs
            .get(job_id)
            .map(|job| {
                job.subtasks
                    .values()
                    .flat_map(|sub| sub.segment_keys.iter().cloned())
                    .collect()
            })
            .unwrap_or_default();

        // Snapshot holdings before cancellation rewrites them.
        let held_snapshot: BTreeMap<SegmentKey, Vec<ResourceId>> = segment_keys
            .iter()
            .map(|key| {
                (
                    key.clone(),
                    self.held
                        .get(key)
                        .map(|set| set.iter().cloned().collect())
                        .unwrap_or_default(),
                )
            })
            .collect();

        let running_cores: Vec<CoreId> = self
            .cores
            .values()
            .filter(|core| {
                core.running
                    .as_ref()
                    .map(|key| segment_keys.contains(key))
                    .unwrap_or(false)
            })
            .map(|core| core.core_id.clone())
            .collect();
        for core_id in running_cores {
            self.apply_preempt(&core_id, PreemptKind::Forced, false, true, Some(reason))?;
        }

        for key in &segment_keys {
            if let Some(seg) = self.segments.get_mut(key) {
                seg.blocked = false;
                seg.waiting_resource = None;
                seg.running_on = None;
            }
            self.ready.remove(key);
            self.pending_ready.remove(key);
        }

        for key in &segment_keys {
            // Releases are published first, then the cancellation's side
            // effects (ceiling pops, wakeups), mirroring the normal
            // release path: a pop or an unblock is always preceded by the
            // release that enables it.
            for resource_id in held_snapshot.get(key).into_iter().flatten() {
                let core_id = self.resource_bound_cores.get(resource_id).cloned();
                self.publish(EventKind::ResourceRelease {
                    job_id: job_id.clone(),
                    segment_key: key.clone(),
                    resource_id: resource_id.clone(),
                    core_id,
                    reason: Some("cancel_segment".to_string()),
                });
            }
            let protocol_indexes: BTreeSet<usize> = self
                .segments
                .get(key)
                .map(|seg| {
                    seg.required_resources
                        .iter()
                        .filter_map(|r| self.resource_protocols.get(r).copied())
                        .collect()
                })
                .unwrap_or_default();
            for idx in protocol_indexes {
                let outcome = self.protocols[idx].cancel_segment(key);
                self.apply_priority_updates(&outcome.priority_updates);
                self.emit_release_effects(&outcome, Some("cancel_segment"));
            }
            if let Some(held) = self.held.get_mut(key) {
                held.clear();
            }
            if let Some(seg) = self.segments.get_mut(key) {
                seg.finished = true;
            }
        }

        let task_id = self
            .jobs
            .get(job_id)
            .map(|job| job.task_id.clone())
            .unwrap_or_default();
        warn!(job = %job_id, reason, "job aborted");
        self.publish(EventKind::JobAbort {
            job_id: job_id.clone(),
            task_id,
            reason: reason.to_string(),
        });
        self.unregister_active_job_priority(job_id);
        Ok(())
    }

    /// At the horizon, close out still-running segments so resource
    /// holdings and busy intervals balance.
    fn truncate_running_segments(&mut self) -> Result<(), SimError> {
        let running: Vec<CoreId> = self
            .cores
            .values()
            .filter(|core| core.running.is_some())
            .map(|core| core.core_id.clone())
            .collect();
        for core_id in running {
            let Some(key) = self.cores[&core_id].running.clone() else {
                continue;
            };
            {
                let core = self.cores.get_mut(&core_id).expect("known core");
                if let Some(seg) = self.segments.get_mut(&key) {
                    if let Some(since) = core.running_since {
                        let elapsed = (self.now - since).max(0.0);
                        seg.remaining = (seg.remaining - elapsed * core.work_rate).max(0.0);
                    }
                    seg.finished = true;
                    seg.running_on = None;
                }
                core.running = None;
                core.running_since = None;
                core.finish_time = None;
                core.work_rate = 0.0;
            }
            let job_id = self.segments[&key].job_id.clone();
            self.publish(EventKind::SegmentEnd {
                job_id: job_id.clone(),
                segment_key: key.clone(),
                core_id: core_id.clone(),
                truncated: true,
            });
            self.release_segment_resources(&job_id, &key, Some(core_id))?;
        }
        Ok(())
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}
