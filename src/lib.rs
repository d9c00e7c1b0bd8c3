//! rtsim - Deterministic discrete-event simulator for real-time scheduling
//! on heterogeneous multi-core platforms.
//!
//! The engine executes task-graph jobs (DAGs of subtasks composed of
//! segments) on cores with heterogeneous effective speeds, under a
//! pluggable scheduling policy (EDF / rate-monotonic) mediated by resource
//! protocols (mutex / priority inheritance / priority ceiling). Every
//! observable action lands in an ordered event trace; metrics and the
//! audit derive from the trace alone.
//!
//! # Architecture
//!
//! - **Engine**: time-advancing loop, job/segment state machines, deadline
//!   enforcement with resource-safe abort paths
//! - **Events**: typed envelope + bus with persistent subscribers
//! - **Arrival**: lazy release-time sequences, seeded per run
//! - **Protocols**: lock semantics and priority adjustment
//! - **Scheduler**: per-core selection, tie-breaking, preemption policy
//! - **Metrics / Audit**: trace consumers
//!
//! # Usage
//!
//! ```rust,no_run
//! use rtsim::{Engine, ModelSpec};
//!
//! let doc = std::fs::read_to_string("model.json").unwrap();
//! let spec = ModelSpec::from_json_str(&doc).unwrap();
//! let mut engine = Engine::new();
//! engine.build(spec).unwrap();
//! engine.run(None).unwrap();
//! println!("{}", engine.events_jsonl());
//! ```

pub mod arrival;
pub mod audit;
pub mod engine;
pub mod etm;
pub mod events;
pub mod metrics;
pub mod model;
pub mod protocol;
pub mod sched;
pub mod types;

pub use arrival::{ArrivalGenerator, ArrivalProcess, ArrivalRegistry};
pub use audit::{build_audit_report, AuditReport, RuleStatus};
pub use engine::{AcquirePolicy, Engine};
pub use etm::{Etm, OverheadModel};
pub use events::{
    BlockReason, EventBus, EventIdMode, EventKind, PreemptKind, SimEvent,
};
pub use metrics::{MetricsReport, RunStatus};
pub use model::{ModelSpec, ProtocolKind, TaskType, MODEL_VERSION};
pub use protocol::{PriorityDomain, Protocol};
pub use sched::{SchedulerCfg, SchedulerKind, TieBreaker};
pub use types::{Priority, Time};

/// Unified error type for model loading, engine configuration, and
/// runtime invariant violations.
///
/// The taxonomy matters for callers: model and configuration errors halt
/// `build()` with nothing partially constructed; invariant violations halt
/// a running simulation and mark the run failed in metrics. Expected
/// runtime conditions (deadline misses, blocking, preemption) are events,
/// never errors.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// The model document violates schema or semantic rules.
    #[error("model error [{code}]: {message}")]
    Model {
        code: &'static str,
        message: String,
    },

    /// The engine configuration names an unknown strategy or bad params.
    #[error("config error [{code}]: {message}")]
    Config {
        code: &'static str,
        message: String,
    },

    /// Internal engine state became inconsistent. Fatal for the run.
    #[error("runtime invariant violated [{code}]: {message}")]
    Invariant {
        code: &'static str,
        message: String,
    },
}

impl SimError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            SimError::Model { code, .. }
            | SimError::Config { code, .. }
            | SimError::Invariant { code, .. } => code,
        }
    }

    /// Process exit code for the CLI: 1 for model/config, 2 for runtime
    /// invariant violations.
    pub fn exit_code(&self) -> i32 {
        match self {
            SimError::Model { .. } | SimError::Config { .. } => 1,
            SimError::Invariant { .. } => 2,
        }
    }
}
