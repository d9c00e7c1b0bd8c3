//! Scheduling policies: EDF and rate-monotonic, with configurable
//! tie-breaking and preemption policy.
//!
//! The scheduler is a stateless strategy: the engine hands it a snapshot
//! (ready segments + per-core occupants) and gets back a decision list. It
//! never mutates runtime state itself, which keeps every decision
//! reproducible from the snapshot alone.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::SchedulerSpec;
use crate::types::{CoreId, JobId, Priority, SegmentId, SegmentKey, SubtaskId, TaskId, Time};
use crate::SimError;

/// Scheduling policy. Closed set; selected by `scheduler.name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Edf,
    RateMonotonic,
}

impl SchedulerKind {
    pub fn parse(name: &str) -> Option<SchedulerKind> {
        match name.trim().to_ascii_lowercase().as_str() {
            "edf" | "earliest_deadline_first" => Some(SchedulerKind::Edf),
            "rm" | "rate_monotonic" | "fixed_priority" => Some(SchedulerKind::RateMonotonic),
            _ => None,
        }
    }
}

/// Order among equal-priority segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreaker {
    /// Ready time, then release time, then task id, then segment key.
    #[default]
    Fifo,
    /// Most recently ready first.
    Lifo,
    /// Stable lexicographic order on the segment key.
    SegmentKey,
}

impl TieBreaker {
    pub fn parse(raw: &str) -> Option<TieBreaker> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "fifo" => Some(TieBreaker::Fifo),
            "lifo" => Some(TieBreaker::Lifo),
            "segment_key" => Some(TieBreaker::SegmentKey),
            _ => None,
        }
    }
}

/// Resolved scheduler configuration.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerCfg {
    pub kind: SchedulerKind,
    pub tie_breaker: TieBreaker,
    pub allow_preempt: bool,
}

impl SchedulerCfg {
    /// Resolve from `scheduler.name` + `scheduler.params`. Unknown names
    /// are configuration errors surfaced at engine build.
    pub fn from_spec(spec: &SchedulerSpec) -> Result<SchedulerCfg, SimError> {
        let kind = SchedulerKind::parse(&spec.name).ok_or_else(|| SimError::Config {
            code: "scheduler.name",
            message: format!(
                "unknown scheduler '{}', expected edf|rate_monotonic",
                spec.name
            ),
        })?;
        let tie_breaker = match spec.params.get("tie_breaker") {
            None => TieBreaker::Fifo,
            Some(value) => {
                let raw = value.as_str().ok_or_else(|| SimError::Config {
                    code: "scheduler.tie_breaker",
                    message: "scheduler.params.tie_breaker must be a string".into(),
                })?;
                TieBreaker::parse(raw).ok_or_else(|| SimError::Config {
                    code: "scheduler.tie_breaker",
                    message: format!(
                        "unknown tie_breaker '{raw}', expected fifo|lifo|segment_key"
                    ),
                })?
            }
        };
        let allow_preempt = match spec.params.get("allow_preempt") {
            None => true,
            Some(value) => value.as_bool().ok_or_else(|| SimError::Config {
                code: "scheduler.allow_preempt",
                message: "scheduler.params.allow_preempt must be a boolean".into(),
            })?,
        };
        Ok(SchedulerCfg {
            kind,
            tie_breaker,
            allow_preempt,
        })
    }

    /// Base priority of a job in this scheduler's domain. Jobs with no
    /// deadline (EDF) or no period (RM) sort below everything.
    pub fn priority_value(&self, deadline: Option<Time>, period: Option<Time>) -> Priority {
        match self.kind {
            SchedulerKind::Edf => deadline.map_or(Priority::LOWEST, |d| Priority(-d)),
            SchedulerKind::RateMonotonic => period.map_or(Priority::LOWEST, |p| Priority(-p)),
        }
    }
}

/// Scheduler-facing description of one schedulable segment.
#[derive(Debug, Clone)]
pub struct ReadySegment {
    pub key: SegmentKey,
    pub job_id: JobId,
    pub task_id: TaskId,
    pub subtask_id: SubtaskId,
    pub segment_id: SegmentId,
    pub remaining: Time,
    pub absolute_deadline: Option<Time>,
    pub task_period: Option<Time>,
    pub mapping_hint: Option<CoreId>,
    pub preemptible: bool,
    pub release_time: Time,
    pub ready_time: Time,
    /// Effective priority, including protocol-induced raises.
    pub priority: Priority,
}

/// Scheduler-facing description of one core.
#[derive(Debug, Clone)]
pub struct CoreSnapshot {
    pub core_id: CoreId,
    pub speed: f64,
    pub running: Option<ReadySegment>,
}

/// Immutable view the engine hands to the scheduler.
#[derive(Debug, Clone)]
pub struct ScheduleSnapshot {
    pub now: Time,
    pub ready: Vec<ReadySegment>,
    pub cores: Vec<CoreSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    Dispatch,
    Preempt,
    Migrate,
    Idle,
}

/// One scheduling decision for the engine to apply.
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: DecisionAction,
    pub job_id: Option<JobId>,
    pub segment_key: Option<SegmentKey>,
    pub from_core: Option<CoreId>,
    pub to_core: Option<CoreId>,
    pub reason: &'static str,
}

fn opt_time(value: Option<Time>) -> f64 {
    value.unwrap_or(f64::INFINITY)
}

impl SchedulerCfg {
    fn tie_break(&self, a: &ReadySegment, b: &ReadySegment) -> Ordering {
        match self.tie_breaker {
            TieBreaker::Fifo => a
                .ready_time
                .total_cmp(&b.ready_time)
                .then_with(|| a.release_time.total_cmp(&b.release_time))
                .then_with(|| a.task_id.cmp(&b.task_id))
                .then_with(|| a.key.cmp(&b.key)),
            TieBreaker::Lifo => b
                .ready_time
                .total_cmp(&a.ready_time)
                .then_with(|| a.release_time.total_cmp(&b.release_time))
                .then_with(|| a.task_id.cmp(&b.task_id))
                .then_with(|| a.key.cmp(&b.key)),
            TieBreaker::SegmentKey => a.key.cmp(&b.key),
        }
    }

    /// Total order over candidates; `Less` wins the core.
    fn compare(&self, a: &ReadySegment, b: &ReadySegment) -> Ordering {
        let primary = b.priority.cmp(&a.priority);
        if primary != Ordering::Equal {
            return primary;
        }
        let policy = match self.kind {
            SchedulerKind::Edf => opt_time(a.absolute_deadline)
                .total_cmp(&opt_time(b.absolute_deadline)),
            SchedulerKind::RateMonotonic => opt_time(a.task_period)
                .total_cmp(&opt_time(b.task_period))
                .then_with(|| {
                    opt_time(a.absolute_deadline).total_cmp(&opt_time(b.absolute_deadline))
                }),
        };
        policy.then_with(|| self.tie_break(a, b))
    }

    /// Assign the best eligible segment to every core and derive the
    /// preempt/migrate/dispatch decision list.
    pub fn schedule(&self, snapshot: &ScheduleSnapshot) -> Vec<Decision> {
        let running_on: BTreeMap<&SegmentKey, &CoreId> = snapshot
            .cores
            .iter()
            .filter_map(|core| core.running.as_ref().map(|seg| (&seg.key, &core.core_id)))
            .collect();

        let mut assignments: BTreeMap<&CoreId, Option<&ReadySegment>> = BTreeMap::new();
        let mut used: BTreeSet<&SegmentKey> = BTreeSet::new();

        for core in &snapshot.cores {
            let current = core.running.as_ref();
            // A running segment that may not be preempted keeps its core.
            if let Some(seg) = current {
                if (!self.allow_preempt || !seg.preemptible) && !used.contains(&seg.key) {
                    assignments.insert(&core.core_id, Some(seg));
                    used.insert(&seg.key);
                    continue;
                }
            }
            let mut candidates: Vec<&ReadySegment> = snapshot
                .ready
                .iter()
                .filter(|seg| {
                    !used.contains(&seg.key)
                        && seg
                            .mapping_hint
                            .as_ref()
                            .map_or(true, |hint| hint == &core.core_id)
                })
                .collect();
            if let Some(seg) = current {
                if !used.contains(&seg.key) {
                    candidates.push(seg);
                }
            }
            if candidates.is_empty() {
                assignments.insert(&core.core_id, None);
                continue;
            }
            candidates.sort_by(|a, b| self.compare(a, b));
            let chosen = candidates[0];
            assignments.insert(&core.core_id, Some(chosen));
            used.insert(&chosen.key);
        }

        let mut decisions = Vec::new();
        let mut preempted: BTreeSet<&CoreId> = BTreeSet::new();

        for core in &snapshot.cores {
            let current = core.running.as_ref();
            let chosen = assignments.get(&core.core_id).copied().flatten();
            let current_key = current.map(|seg| &seg.key);
            let chosen_key = chosen.map(|seg| &seg.key);

            if current_key == chosen_key {
                continue;
            }

            if let (Some(current), Some(_)) = (current, chosen_key) {
                decisions.push(Decision {
                    action: DecisionAction::Preempt,
                    job_id: Some(current.job_id.clone()),
                    segment_key: Some(current.key.clone()),
                    from_core: Some(core.core_id.clone()),
                    to_core: None,
                    reason: "higher-priority segment selected",
                });
                preempted.insert(&core.core_id);
            }

            let Some(chosen) = chosen else {
                if current.is_none() {
                    decisions.push(Decision {
                        action: DecisionAction::Idle,
                        job_id: None,
                        segment_key: None,
                        from_core: Some(core.core_id.clone()),
                        to_core: Some(core.core_id.clone()),
                        reason: "no ready segment",
                    });
                }
                continue;
            };

            if let Some(source) = running_on.get(&chosen.key) {
                if *source != &core.core_id && !preempted.contains(source) {
                    decisions.push(Decision {
                        action: DecisionAction::Migrate,
                        job_id: Some(chosen.job_id.clone()),
                        segment_key: Some(chosen.key.clone()),
                        from_core: Some((*source).clone()),
                        to_core: Some(core.core_id.clone()),
                        reason: "rebalance to target core",
                    });
                }
            }

            decisions.push(Decision {
                action: DecisionAction::Dispatch,
                job_id: Some(chosen.job_id.clone()),
                segment_key: Some(chosen.key.clone()),
                from_core: None,
                to_core: Some(core.core_id.clone()),
                reason: "priority dispatch",
            });
        }

        decisions
    }
}
