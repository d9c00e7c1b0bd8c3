//! Metrics derived by streaming the event trace.
//!
//! The collector consumes every published event exactly once and never
//! reaches back into engine state: the trace is the single source of
//! truth, so any consumer replaying the same trace derives the same
//! numbers.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::events::{EventKind, PreemptKind, SimEvent};
use crate::types::{CoreId, JobId, SegmentKey, TaskId, Time};

/// Per-job results in release order.
#[derive(Debug, Clone, Serialize)]
pub struct PerJob {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub release: Time,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complete: Option<Time>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<Time>,
    pub missed: bool,
    pub aborted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub jobs_released: usize,
    pub jobs_completed: usize,
    pub jobs_aborted: usize,
    pub deadline_miss_rate: f64,
    pub scheduler_preempt_count: u64,
    pub forced_preempt_count: u64,
    pub preempt_count: u64,
    pub migration_count: u64,
    pub core_utilization: BTreeMap<CoreId, f64>,
}

/// One metrics document for a run.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub status: RunStatus,
    pub event_count: u64,
    pub per_job: Vec<PerJob>,
    pub summary: MetricsSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Failed,
}

#[derive(Debug, Default, Clone)]
struct JobRecord {
    task_id: TaskId,
    release: Time,
    complete: Option<Time>,
    missed: bool,
    aborted: bool,
}

/// Streaming metrics collector.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    jobs: BTreeMap<JobId, JobRecord>,
    release_order: Vec<JobId>,
    running: BTreeMap<SegmentKey, (Time, CoreId)>,
    core_busy: BTreeMap<CoreId, Time>,
    scheduler_preempts: u64,
    forced_preempts: u64,
    migrations: u64,
    event_count: u64,
    max_time: Time,
    failed: bool,
}

impl MetricsCollector {
    pub fn new() -> MetricsCollector {
        MetricsCollector::default()
    }

    pub fn reset(&mut self) {
        *self = MetricsCollector::default();
    }

    /// A runtime invariant violation halted the simulation.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn consume(&mut self, event: &SimEvent) {
        self.event_count += 1;
        self.max_time = self.max_time.max(event.time);

        match &event.kind {
            EventKind::JobRelease {
                job_id,
                task_id,
                absolute_deadline: _,
                ..
            } => {
                self.release_order.push(job_id.clone());
                self.jobs.insert(
                    job_id.clone(),
                    JobRecord {
                        task_id: task_id.clone(),
                        release: event.time,
                        complete: None,
                        missed: false,
                        aborted: false,
                    },
                );
            }
            EventKind::SegmentStart {
                segment_key,
                core_id,
                ..
            } => {
                self.running
                    .insert(segment_key.clone(), (event.time, core_id.clone()));
            }
            EventKind::SegmentEnd { segment_key, .. } => {
                self.close_busy_interval(segment_key, event.time);
            }
            EventKind::Preempt {
                segment_key, kind, ..
            } => {
                self.close_busy_interval(segment_key, event.time);
                match kind {
                    PreemptKind::Scheduler => self.scheduler_preempts += 1,
                    PreemptKind::Forced => self.forced_preempts += 1,
                }
            }
            EventKind::Migration { .. } => self.migrations += 1,
            EventKind::DeadlineMiss { job_id, .. } => {
                if let Some(job) = self.jobs.get_mut(job_id) {
                    job.missed = true;
                }
            }
            EventKind::JobComplete { job_id, .. } => {
                if let Some(job) = self.jobs.get_mut(job_id) {
                    job.complete = Some(event.time);
                }
            }
            EventKind::JobAbort { job_id, .. } => {
                if let Some(job) = self.jobs.get_mut(job_id) {
                    job.aborted = true;
                }
            }
            _ => {}
        }
    }

    fn close_busy_interval(&mut self, segment_key: &SegmentKey, end: Time) {
        if let Some((start, core)) = self.running.remove(segment_key) {
            *self.core_busy.entry(core).or_insert(0.0) += (end - start).max(0.0);
        }
    }

    /// Build the metrics document. `duration` is the configured
    /// `sim.duration` (utilization denominator); `core_ids` lists every
    /// platform core so idle cores report 0.0 rather than disappearing.
    pub fn report(&self, duration: Time, core_ids: &[CoreId]) -> MetricsReport {
        let mut per_job = Vec::with_capacity(self.release_order.len());
        for job_id in &self.release_order {
            let record = &self.jobs[job_id];
            per_job.push(PerJob {
                job_id: job_id.clone(),
                task_id: record.task_id.clone(),
                release: record.release,
                complete: record.complete,
                response_time: record.complete.map(|c| c - record.release),
                missed: record.missed,
                aborted: record.aborted,
            });
        }

        let jobs_released = self.release_order.len();
        let jobs_completed = self.jobs.values().filter(|j| j.complete.is_some()).count();
        let jobs_aborted = self.jobs.values().filter(|j| j.aborted).count();
        let missed = self.jobs.values().filter(|j| j.missed).count();
        let deadline_miss_rate = if jobs_released == 0 {
            0.0
        } else {
            missed as f64 / jobs_released as f64
        };

        let denominator = if duration > 0.0 { duration } else { self.max_time };
        let mut core_utilization: BTreeMap<CoreId, f64> = core_ids
            .iter()
            .map(|core| (core.clone(), 0.0))
            .collect();
        for (core, busy) in &self.core_busy {
            let fraction = if denominator > 0.0 {
                (busy / denominator).clamp(0.0, 1.0)
            } else {
                0.0
            };
            core_utilization.insert(core.clone(), fraction);
        }

        MetricsReport {
            status: if self.failed {
                RunStatus::Failed
            } else {
                RunStatus::Ok
            },
            event_count: self.event_count,
            per_job,
            summary: MetricsSummary {
                jobs_released,
                jobs_completed,
                jobs_aborted,
                deadline_miss_rate,
                scheduler_preempt_count: self.scheduler_preempts,
                forced_preempt_count: self.forced_preempts,
                preempt_count: self.scheduler_preempts + self.forced_preempts,
                migration_count: self.migrations,
                core_utilization,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: u64, time: Time, kind: EventKind) -> SimEvent {
        SimEvent {
            seq,
            time,
            id: format!("evt-{seq:08}"),
            kind,
        }
    }

    #[test]
    fn response_time_and_utilization() {
        let mut metrics = MetricsCollector::new();
        metrics.consume(&event(
            0,
            0.0,
            EventKind::JobRelease {
                job_id: "t1@0".into(),
                task_id: "t1".into(),
                release_index: 0,
                absolute_deadline: Some(20.0),
            },
        ));
        metrics.consume(&event(
            1,
            0.0,
            EventKind::SegmentStart {
                job_id: "t1@0".into(),
                segment_key: "t1@0:s0:seg0".into(),
                core_id: "c0".into(),
                execution_time: 5.0,
                estimated_finish: 5.0,
            },
        ));
        metrics.consume(&event(
            2,
            5.0,
            EventKind::SegmentEnd {
                job_id: "t1@0".into(),
                segment_key: "t1@0:s0:seg0".into(),
                core_id: "c0".into(),
                truncated: false,
            },
        ));
        metrics.consume(&event(
            3,
            5.0,
            EventKind::JobComplete {
                job_id: "t1@0".into(),
                task_id: "t1".into(),
            },
        ));

        let report = metrics.report(20.0, &["c0".to_string()]);
        assert_eq!(report.status, RunStatus::Ok);
        assert_eq!(report.per_job.len(), 1);
        assert_eq!(report.per_job[0].response_time, Some(5.0));
        assert!(!report.per_job[0].missed);
        assert_eq!(report.summary.jobs_completed, 1);
        assert_eq!(report.summary.core_utilization["c0"], 0.25);
    }

    #[test]
    fn preempt_counts_split_by_kind() {
        let mut metrics = MetricsCollector::new();
        for (seq, kind) in [(0, PreemptKind::Scheduler), (1, PreemptKind::Forced)] {
            metrics.consume(&event(
                seq,
                1.0,
                EventKind::Preempt {
                    job_id: "t1@0".into(),
                    segment_key: "t1@0:s0:seg0".into(),
                    core_id: "c0".into(),
                    kind,
                    reason: None,
                },
            ));
        }
        let report = metrics.report(10.0, &[]);
        assert_eq!(report.summary.scheduler_preempt_count, 1);
        assert_eq!(report.summary.forced_preempt_count, 1);
        assert_eq!(report.summary.preempt_count, 2);
    }

    #[test]
    fn idle_cores_report_zero_utilization() {
        let metrics = MetricsCollector::new();
        let report = metrics.report(10.0, &["c0".to_string(), "c1".to_string()]);
        assert_eq!(report.summary.core_utilization.len(), 2);
        assert_eq!(report.summary.core_utilization["c1"], 0.0);
    }
}
