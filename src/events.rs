//! Event envelope, typed event kinds, and the publication bus.
//!
//! Every observable action in a run is a [`SimEvent`]: a monotone sequence
//! number, a simulated timestamp, an id (mode-dependent), and a typed
//! payload. The serialized record is `{"seq", "time", "id", "kind",
//! "payload"}`, one JSON object per line on disk; field names are part of
//! the public contract.
//!
//! The [`EventBus`] is deliberately long-lived: engine rebuilds re-arm the
//! sequence counter and clear the recorded trace, but never touch
//! subscriber identity. Losing subscribers across a rebuild is a defect.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::protocol::PriorityDomain;
use crate::types::{CoreId, JobId, ResourceId, SegmentKey, SubtaskId, TaskId, Time};

/// How event ids are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventIdMode {
    /// `evt-{seq:08}`; identical across seeded re-runs.
    #[default]
    Deterministic,
    /// 128-bit hex drawn from a PRNG seeded by `sim.seed`.
    SeededRandom,
    /// Ephemeral 128-bit hex drawn from OS entropy.
    Random,
}

impl EventIdMode {
    pub fn parse(raw: &str) -> Option<EventIdMode> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "deterministic" => Some(EventIdMode::Deterministic),
            "seeded_random" => Some(EventIdMode::SeededRandom),
            "random" => Some(EventIdMode::Random),
            _ => None,
        }
    }
}

/// Why a preemption happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptKind {
    /// The scheduler replaced the occupant with a higher-priority segment.
    Scheduler,
    /// The engine removed the occupant on an abort path.
    Forced,
}

/// Why a segment failed to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    ResourceBusy,
    SystemCeilingBlock,
    BoundCoreViolation,
}

/// Typed event payloads. Variant names are the wire `kind` strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum EventKind {
    JobRelease {
        job_id: JobId,
        task_id: TaskId,
        release_index: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        absolute_deadline: Option<Time>,
    },
    SubtaskReady {
        job_id: JobId,
        subtask_id: SubtaskId,
        segment_key: SegmentKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        window_id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset_index: Option<usize>,
    },
    SegmentStart {
        job_id: JobId,
        segment_key: SegmentKey,
        core_id: CoreId,
        execution_time: Time,
        estimated_finish: Time,
    },
    SegmentEnd {
        job_id: JobId,
        segment_key: SegmentKey,
        core_id: CoreId,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        truncated: bool,
    },
    SegmentBlocked {
        job_id: JobId,
        segment_key: SegmentKey,
        core_id: CoreId,
        resource_id: ResourceId,
        reason: BlockReason,
        request_priority: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner_segment: Option<SegmentKey>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system_ceiling: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority_domain: Option<PriorityDomain>,
        resource_acquire_policy: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        rollback_released: Vec<ResourceId>,
    },
    SegmentUnblocked {
        job_id: JobId,
        segment_key: SegmentKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource_id: Option<ResourceId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Preempt {
        job_id: JobId,
        segment_key: SegmentKey,
        core_id: CoreId,
        kind: PreemptKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Migration {
        job_id: JobId,
        segment_key: SegmentKey,
        from_core: CoreId,
        to_core: CoreId,
    },
    ResourceAcquire {
        job_id: JobId,
        segment_key: SegmentKey,
        resource_id: ResourceId,
        core_id: CoreId,
        request_priority: f64,
    },
    ResourceRelease {
        job_id: JobId,
        segment_key: SegmentKey,
        resource_id: ResourceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        core_id: Option<CoreId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    DeadlineMiss {
        job_id: JobId,
        absolute_deadline: Time,
        abort_on_miss: bool,
    },
    JobComplete {
        job_id: JobId,
        task_id: TaskId,
    },
    JobAbort {
        job_id: JobId,
        task_id: TaskId,
        reason: String,
    },
    PriorityRaise {
        job_id: JobId,
        segment_key: SegmentKey,
        from: f64,
        to: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        due_to: Option<SegmentKey>,
    },
    PriorityRestore {
        job_id: JobId,
        segment_key: SegmentKey,
        from: f64,
        to: f64,
    },
    CeilingPush {
        resource_id: ResourceId,
        ceiling: f64,
        system_ceiling: f64,
    },
    CeilingPop {
        resource_id: ResourceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system_ceiling: Option<f64>,
    },
    Error {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<JobId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        segment_key: Option<SegmentKey>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        core_id: Option<CoreId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource_id: Option<ResourceId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl EventKind {
    /// Wire name of this kind.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::JobRelease { .. } => "JobRelease",
            EventKind::SubtaskReady { .. } => "SubtaskReady",
            EventKind::SegmentStart { .. } => "SegmentStart",
            EventKind::SegmentEnd { .. } => "SegmentEnd",
            EventKind::SegmentBlocked { .. } => "SegmentBlocked",
            EventKind::SegmentUnblocked { .. } => "SegmentUnblocked",
            EventKind::Preempt { .. } => "Preempt",
            EventKind::Migration { .. } => "Migration",
            EventKind::ResourceAcquire { .. } => "ResourceAcquire",
            EventKind::ResourceRelease { .. } => "ResourceRelease",
            EventKind::DeadlineMiss { .. } => "DeadlineMiss",
            EventKind::JobComplete { .. } => "JobComplete",
            EventKind::JobAbort { .. } => "JobAbort",
            EventKind::PriorityRaise { .. } => "PriorityRaise",
            EventKind::PriorityRestore { .. } => "PriorityRestore",
            EventKind::CeilingPush { .. } => "CeilingPush",
            EventKind::CeilingPop { .. } => "CeilingPop",
            EventKind::Error { .. } => "Error",
        }
    }

    /// Job the event concerns, when it concerns exactly one.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            EventKind::JobRelease { job_id, .. }
            | EventKind::SubtaskReady { job_id, .. }
            | EventKind::SegmentStart { job_id, .. }
            | EventKind::SegmentEnd { job_id, .. }
            | EventKind::SegmentBlocked { job_id, .. }
            | EventKind::SegmentUnblocked { job_id, .. }
            | EventKind::Preempt { job_id, .. }
            | EventKind::Migration { job_id, .. }
            | EventKind::ResourceAcquire { job_id, .. }
            | EventKind::ResourceRelease { job_id, .. }
            | EventKind::DeadlineMiss { job_id, .. }
            | EventKind::JobComplete { job_id, .. }
            | EventKind::JobAbort { job_id, .. }
            | EventKind::PriorityRaise { job_id, .. }
            | EventKind::PriorityRestore { job_id, .. } => Some(job_id),
            EventKind::Error { job_id, .. } => job_id.as_ref(),
            _ => None,
        }
    }
}

/// One published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimEvent {
    pub seq: u64,
    pub time: Time,
    pub id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl SimEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("event serialization is infallible")
    }
}

/// Subscriber callback. Subscribers observe events; they must not assume
/// they can mutate engine state from inside a handler.
pub type EventHandler = Box<dyn FnMut(&SimEvent)>;

/// In-process pub/sub bus with sequence assignment and trace recording.
pub struct EventBus {
    seq: u64,
    id_mode: EventIdMode,
    id_rng: StdRng,
    events: Vec<SimEvent>,
    subscribers: Vec<EventHandler>,
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            seq: 0,
            id_mode: EventIdMode::Deterministic,
            id_rng: StdRng::seed_from_u64(0),
            events: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    /// Attach a subscriber. Subscribers survive every engine rebuild.
    pub fn subscribe(&mut self, handler: EventHandler) {
        self.subscribers.push(handler);
    }

    /// Reset sequence, trace, and id PRNG for a fresh run. Subscribers are
    /// left attached.
    pub fn rearm(&mut self, id_mode: EventIdMode, seed: i64) {
        self.seq = 0;
        self.id_mode = id_mode;
        self.events.clear();
        self.id_rng = match id_mode {
            EventIdMode::Random => StdRng::from_entropy(),
            _ => StdRng::seed_from_u64(seed as u64),
        };
    }

    fn next_event_id(&mut self) -> String {
        match self.id_mode {
            EventIdMode::Deterministic => format!("evt-{:08}", self.seq),
            EventIdMode::SeededRandom | EventIdMode::Random => {
                let hi = self.id_rng.next_u64();
                let lo = self.id_rng.next_u64();
                format!("{hi:016x}{lo:016x}")
            }
        }
    }

    /// Publish one event: assign seq + id, record it, notify subscribers.
    pub fn publish(&mut self, time: Time, kind: EventKind) -> u64 {
        let event = SimEvent {
            seq: self.seq,
            time,
            id: self.next_event_id(),
            kind,
        };
        self.seq += 1;
        for handler in &mut self.subscribers {
            handler(&event);
        }
        self.events.push(event);
        self.seq - 1
    }

    /// All events published since the last rearm, in emission order.
    pub fn events(&self) -> &[SimEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Count events of the given wire kind.
    pub fn kind_count(&self, kind: &str) -> usize {
        self.events.iter().filter(|e| e.kind.name() == kind).count()
    }

    /// Serialize the trace as newline-delimited JSON.
    pub fn to_jsonl(&self) -> String {
        let mut out = String::new();
        for event in &self.events {
            out.push_str(&event.to_json());
            out.push('\n');
        }
        out
    }

    /// Pretty-print the trace for debugging.
    pub fn dump(&self) {
        for event in &self.events {
            eprintln!(
                "[{:>12.6}] #{:<5} {:<18} {}",
                event.time,
                event.seq,
                event.kind.name(),
                serde_json::to_string(&event.kind).unwrap_or_default()
            );
        }
    }
}
