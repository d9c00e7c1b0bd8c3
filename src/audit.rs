//! Post-run audit: versioned invariant checks over the event trace.
//!
//! Every rule produces pass/warn/fail plus *evidence*: the minimal list of
//! event sequence numbers sufficient to reproduce the judgement. The audit
//! consumes only the serialized trace semantics (the same records written
//! to disk), never engine internals, so it can re-run offline.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::events::{BlockReason, EventKind, SimEvent};
use crate::model::ModelSpec;
use crate::protocol::PriorityDomain;
use crate::sched::SchedulerKind;
use crate::types::{JobId, ResourceId, SegmentKey};

pub const AUDIT_RULE_VERSION: &str = "0.2";
const EVIDENCE_CAP: usize = 20;
const ASSET_CAP: usize = 50;
const CHAIN_WALK_CAP: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleResult {
    pub name: String,
    pub rule_version: String,
    pub status: RuleStatus,
    pub evidence: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl RuleResult {
    fn new(name: &str, evidence: Vec<u64>, notes: Option<String>) -> RuleResult {
        let status = if evidence.is_empty() {
            RuleStatus::Pass
        } else {
            RuleStatus::Fail
        };
        RuleResult {
            name: name.to_string(),
            rule_version: AUDIT_RULE_VERSION.to_string(),
            status,
            evidence,
            notes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelRelationSummary {
    pub task_count: usize,
    pub subtask_count: usize,
    pub segment_count: usize,
    pub core_count: usize,
    pub resource_count: usize,
    pub unbound_segment_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaitEdge {
    pub seq: u64,
    pub segment_key: SegmentKey,
    pub resource_id: ResourceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_segment: Option<SegmentKey>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CeilingBlock {
    pub seq: u64,
    pub segment_key: SegmentKey,
    pub resource_id: ResourceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_ceiling: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CeilingResolution {
    pub segment_key: SegmentKey,
    pub blocked_seq: u64,
    pub resolved_seq: u64,
    pub resolved_by: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProtocolProofAssets {
    pub pip_wait_edge_count: usize,
    pub pip_wait_edges: Vec<WaitEdge>,
    pub pip_owner_mismatch_count: usize,
    pub pcp_ceiling_block_count: usize,
    pub pcp_ceiling_blocks: Vec<CeilingBlock>,
    pub pcp_ceiling_resolution_count: usize,
    pub pcp_ceiling_resolutions: Vec<CeilingResolution>,
    pub pcp_ceiling_unresolved_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileStatus {
    pub status: RuleStatus,
    pub required_rules: Vec<String>,
    pub passed_rules: Vec<String>,
    pub failed_rules: Vec<String>,
    pub pass_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComplianceProfiles {
    pub profile_version: String,
    pub default_profile: String,
    pub engineering_v1: ProfileStatus,
    pub research_v1: ProfileStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub rule_version: String,
    pub status: RuleStatus,
    pub rules: Vec<RuleResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_relation_summary: Option<ModelRelationSummary>,
    pub protocol_proof_assets: ProtocolProofAssets,
    pub compliance_profiles: ComplianceProfiles,
}

impl AuditReport {
    pub fn passed(&self) -> bool {
        self.status == RuleStatus::Pass
    }
}

/// Delivery baseline: resource balance, termination paths, deadlock safety.
const ENGINEERING_RULES: &[&str] = &[
    "resource_release_balance",
    "abort_cancel_release_visibility",
    "resource_partial_hold_on_block",
    "wait_for_deadlock",
];

/// Reproducibility baseline: everything, including protocol-domain rules.
const RESEARCH_RULES: &[&str] = &[
    "resource_release_balance",
    "abort_cancel_release_visibility",
    "pcp_priority_domain_alignment",
    "pcp_ceiling_numeric_domain",
    "resource_partial_hold_on_block",
    "pip_priority_chain_consistency",
    "pcp_ceiling_transition_consistency",
    "wait_for_deadlock",
    "pip_owner_hold_consistency",
];

fn cap(mut evidence: Vec<u64>) -> Vec<u64> {
    evidence.truncate(EVIDENCE_CAP);
    evidence
}

fn job_prefix(job_id: &JobId) -> String {
    format!("{job_id}:")
}

/// Walk the wait-for map from `start`; returns the cycle if one closes.
fn find_wait_cycle(wait_for: &BTreeMap<SegmentKey, SegmentKey>, start: &SegmentKey) -> bool {
    let mut seen: BTreeSet<&SegmentKey> = BTreeSet::new();
    let mut cursor = start;
    while let Some(next) = wait_for.get(cursor) {
        if !seen.insert(cursor) {
            return true;
        }
        cursor = next;
    }
    false
}

/// Build the audit report for one trace.
pub fn build_audit_report(
    events: &[SimEvent],
    scheduler: Option<SchedulerKind>,
    spec: Option<&ModelSpec>,
) -> AuditReport {
    let is_edf = scheduler == Some(SchedulerKind::Edf);

    // resource_release_balance
    let mut balance_evidence: Vec<u64> = Vec::new();
    let mut holds: BTreeMap<(SegmentKey, ResourceId), (i64, u64)> = BTreeMap::new();
    for event in events {
        match &event.kind {
            EventKind::ResourceAcquire {
                segment_key,
                resource_id,
                ..
            } => {
                let entry = holds
                    .entry((segment_key.clone(), resource_id.clone()))
                    .or_insert((0, event.seq));
                entry.0 += 1;
                entry.1 = event.seq;
            }
            EventKind::ResourceRelease {
                segment_key,
                resource_id,
                ..
            } => {
                let entry = holds
                    .entry((segment_key.clone(), resource_id.clone()))
                    .or_insert((0, event.seq));
                entry.0 -= 1;
                if entry.0 < 0 {
                    balance_evidence.push(event.seq);
                    entry.0 = 0;
                }
            }
            _ => {}
        }
    }
    for (_, (count, last_acquire)) in &holds {
        if *count > 0 {
            balance_evidence.push(*last_acquire);
        }
    }
    balance_evidence.sort_unstable();

    // abort_cancel_release_visibility + invariant: all acquires released
    // by the time of JobAbort.
    let mut job_acquires: BTreeMap<JobId, u64> = BTreeMap::new();
    let mut job_cancel_releases: BTreeMap<JobId, u64> = BTreeMap::new();
    let mut job_open_holds: BTreeMap<JobId, i64> = BTreeMap::new();
    let mut abort_evidence: Vec<u64> = Vec::new();
    for event in events {
        match &event.kind {
            EventKind::ResourceAcquire { job_id, .. } => {
                *job_acquires.entry(job_id.clone()).or_insert(0) += 1;
                *job_open_holds.entry(job_id.clone()).or_insert(0) += 1;
            }
            EventKind::ResourceRelease { job_id, reason, .. } => {
                *job_open_holds.entry(job_id.clone()).or_insert(0) -= 1;
                if reason.as_deref() == Some("cancel_segment") {
                    *job_cancel_releases.entry(job_id.clone()).or_insert(0) += 1;
                }
            }
            EventKind::JobAbort { job_id, .. } => {
                let acquired = job_acquires.get(job_id).copied().unwrap_or(0);
                let cancelled = job_cancel_releases.get(job_id).copied().unwrap_or(0);
                let open = job_open_holds.get(job_id).copied().unwrap_or(0);
                if (acquired > 0 && cancelled == 0) || open > 0 {
                    abort_evidence.push(event.seq);
                }
            }
            _ => {}
        }
    }

    // Per-segment open holds feed the atomic-rollback partial-hold rule.
    let mut segment_holds: BTreeMap<SegmentKey, i64> = BTreeMap::new();
    let mut partial_hold_evidence: Vec<u64> = Vec::new();

    // Owner tracking feeds PIP rules and the wait-for graph.
    let mut resource_owner: BTreeMap<ResourceId, SegmentKey> = BTreeMap::new();
    let mut wait_for: BTreeMap<SegmentKey, SegmentKey> = BTreeMap::new();
    let mut pip_chain_evidence: Vec<u64> = Vec::new();
    let mut pip_owner_evidence: Vec<u64> = Vec::new();
    let mut deadlock_evidence: Vec<u64> = Vec::new();
    let mut domain_evidence: Vec<u64> = Vec::new();
    let mut numeric_evidence: Vec<u64> = Vec::new();

    let mut wait_edges: Vec<WaitEdge> = Vec::new();
    let mut ceiling_blocked: BTreeMap<SegmentKey, u64> = BTreeMap::new();
    let mut ceiling_blocks: Vec<CeilingBlock> = Vec::new();
    let mut ceiling_resolutions: Vec<CeilingResolution> = Vec::new();
    let mut ceiling_unresolved_evidence: Vec<u64> = Vec::new();
    let mut owner_mismatches = 0usize;

    fn resolve_ceiling_blocks(
        ceiling_blocked: &mut BTreeMap<SegmentKey, u64>,
        prefix: &str,
        resolved_seq: u64,
        resolved_by: &'static str,
        out: &mut Vec<CeilingResolution>,
    ) {
        let keys: Vec<SegmentKey> = ceiling_blocked
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        for key in keys {
            let blocked_seq = ceiling_blocked.remove(&key).expect("listed key");
            out.push(CeilingResolution {
                segment_key: key,
                blocked_seq,
                resolved_seq,
                resolved_by,
            });
        }
    }

    for event in events {
        match &event.kind {
            EventKind::ResourceAcquire {
                segment_key,
                resource_id,
                ..
            } => {
                resource_owner.insert(resource_id.clone(), segment_key.clone());
                wait_for.remove(segment_key);
                *segment_holds.entry(segment_key.clone()).or_insert(0) += 1;
            }
            EventKind::ResourceRelease {
                segment_key,
                resource_id,
                ..
            } => {
                if resource_owner.get(resource_id) == Some(segment_key) {
                    resource_owner.remove(resource_id);
                }
                *segment_holds.entry(segment_key.clone()).or_insert(0) -= 1;
            }
            EventKind::SegmentBlocked {
                segment_key,
                resource_id,
                reason,
                owner_segment,
                system_ceiling,
                priority_domain,
                resource_acquire_policy,
                ..
            } => match reason {
                BlockReason::ResourceBusy => {
                    wait_edges.push(WaitEdge {
                        seq: event.seq,
                        segment_key: segment_key.clone(),
                        resource_id: resource_id.clone(),
                        owner_segment: owner_segment.clone(),
                    });
                    if resource_acquire_policy == "atomic_rollback"
                        && segment_holds.get(segment_key).copied().unwrap_or(0) > 0
                    {
                        partial_hold_evidence.push(event.seq);
                    }
                    match owner_segment {
                        None => pip_chain_evidence.push(event.seq),
                        Some(owner) if owner == segment_key => {
                            pip_chain_evidence.push(event.seq)
                        }
                        Some(owner) => {
                            if let Some(expected) = resource_owner.get(resource_id) {
                                if expected != owner {
                                    pip_owner_evidence.push(event.seq);
                                    owner_mismatches += 1;
                                }
                            }
                            wait_for.insert(segment_key.clone(), owner.clone());
                            if find_wait_cycle(&wait_for, segment_key) {
                                deadlock_evidence.push(event.seq);
                            }
                        }
                    }
                }
                BlockReason::SystemCeilingBlock => {
                    ceiling_blocked.insert(segment_key.clone(), event.seq);
                    ceiling_blocks.push(CeilingBlock {
                        seq: event.seq,
                        segment_key: segment_key.clone(),
                        resource_id: resource_id.clone(),
                        system_ceiling: *system_ceiling,
                    });
                    if is_edf {
                        if *priority_domain != Some(PriorityDomain::AbsoluteDeadline) {
                            domain_evidence.push(event.seq);
                        }
                        if matches!(system_ceiling, Some(c) if *c >= 0.0) {
                            numeric_evidence.push(event.seq);
                        }
                    }
                }
                BlockReason::BoundCoreViolation => {}
            },
            EventKind::SegmentUnblocked { segment_key, .. } => {
                wait_for.remove(segment_key);
                if ceiling_blocked.contains_key(segment_key) {
                    resolve_ceiling_blocks(
                        &mut ceiling_blocked,
                        segment_key,
                        event.seq,
                        "segment_unblocked",
                        &mut ceiling_resolutions,
                    );
                }
            }
            EventKind::PriorityRaise {
                segment_key,
                due_to: Some(due_to),
                ..
            } => {
                // Chain consistency: the inherited-from waiter must be
                // transitively blocked on the raised segment.
                let mut cursor = due_to;
                let mut reached = false;
                for _ in 0..CHAIN_WALK_CAP {
                    match wait_for.get(cursor) {
                        Some(next) if next == segment_key => {
                            reached = true;
                            break;
                        }
                        Some(next) => cursor = next,
                        None => break,
                    }
                }
                if !reached {
                    pip_chain_evidence.push(event.seq);
                }
                // Owner-hold consistency: a raise is only legal while the
                // raised segment actually holds something.
                if segment_holds.get(segment_key).copied().unwrap_or(0) <= 0 {
                    pip_owner_evidence.push(event.seq);
                    owner_mismatches += 1;
                }
            }
            EventKind::CeilingPush { ceiling, .. } => {
                if is_edf && *ceiling >= 0.0 {
                    numeric_evidence.push(event.seq);
                }
            }
            EventKind::JobComplete { job_id, .. } => {
                let prefix = job_prefix(job_id);
                wait_for.retain(|key, _| !key.starts_with(&prefix));
                resource_owner.retain(|_, owner| !owner.starts_with(&prefix));
                resolve_ceiling_blocks(
                    &mut ceiling_blocked,
                    &prefix,
                    event.seq,
                    "job_complete",
                    &mut ceiling_resolutions,
                );
            }
            EventKind::JobAbort { job_id, .. } => {
                let prefix = job_prefix(job_id);
                wait_for.retain(|key, _| !key.starts_with(&prefix));
                resource_owner.retain(|_, owner| !owner.starts_with(&prefix));
                resolve_ceiling_blocks(
                    &mut ceiling_blocked,
                    &prefix,
                    event.seq,
                    "job_abort",
                    &mut ceiling_resolutions,
                );
            }
            _ => {}
        }
    }
    for seq in ceiling_blocked.values() {
        ceiling_unresolved_evidence.push(*seq);
    }
    ceiling_unresolved_evidence.sort_unstable();

    let rules = vec![
        RuleResult::new("resource_release_balance", cap(balance_evidence), None),
        RuleResult::new("abort_cancel_release_visibility", cap(abort_evidence), None),
        RuleResult::new(
            "pip_priority_chain_consistency",
            cap(pip_chain_evidence),
            None,
        ),
        RuleResult::new("pip_owner_hold_consistency", cap(pip_owner_evidence), None),
        RuleResult::new(
            "pcp_priority_domain_alignment",
            cap(domain_evidence),
            (!is_edf).then(|| "not applicable outside EDF".to_string()),
        ),
        RuleResult::new(
            "pcp_ceiling_numeric_domain",
            cap(numeric_evidence),
            (!is_edf).then(|| "not applicable outside EDF".to_string()),
        ),
        RuleResult::new(
            "pcp_ceiling_transition_consistency",
            cap(ceiling_unresolved_evidence),
            None,
        ),
        RuleResult::new(
            "resource_partial_hold_on_block",
            cap(partial_hold_evidence),
            None,
        ),
        RuleResult::new("wait_for_deadlock", cap(deadlock_evidence), None),
    ];

    let status = if rules.iter().any(|r| r.status == RuleStatus::Fail) {
        RuleStatus::Fail
    } else {
        RuleStatus::Pass
    };

    let pip_wait_edge_count = wait_edges.len();
    wait_edges.truncate(ASSET_CAP);
    let pcp_ceiling_block_count = ceiling_blocks.len();
    ceiling_blocks.truncate(ASSET_CAP);
    let pcp_ceiling_resolution_count = ceiling_resolutions.len();
    ceiling_resolutions.truncate(ASSET_CAP);

    let compliance_profiles = ComplianceProfiles {
        profile_version: "0.1".to_string(),
        default_profile: "research_v1".to_string(),
        engineering_v1: profile_status(&rules, ENGINEERING_RULES),
        research_v1: profile_status(&rules, RESEARCH_RULES),
    };

    AuditReport {
        rule_version: AUDIT_RULE_VERSION.to_string(),
        status,
        rules,
        model_relation_summary: spec.map(model_relation_summary),
        protocol_proof_assets: ProtocolProofAssets {
            pip_wait_edge_count,
            pip_wait_edges: wait_edges,
            pip_owner_mismatch_count: owner_mismatches,
            pcp_ceiling_block_count,
            pcp_ceiling_blocks: ceiling_blocks,
            pcp_ceiling_resolution_count,
            pcp_ceiling_resolutions: ceiling_resolutions,
            pcp_ceiling_unresolved_count: ceiling_blocked.len(),
        },
        compliance_profiles,
    }
}

fn profile_status(rules: &[RuleResult], required: &[&str]) -> ProfileStatus {
    let by_name: BTreeMap<&str, &RuleResult> =
        rules.iter().map(|r| (r.name.as_str(), r)).collect();
    let mut passed = Vec::new();
    let mut failed = Vec::new();
    for name in required {
        match by_name.get(name) {
            Some(rule) if rule.status == RuleStatus::Pass => passed.push(name.to_string()),
            _ => failed.push(name.to_string()),
        }
    }
    let total = required.len();
    ProfileStatus {
        status: if failed.is_empty() {
            RuleStatus::Pass
        } else {
            RuleStatus::Fail
        },
        required_rules: required.iter().map(|s| s.to_string()).collect(),
        passed_rules: passed.clone(),
        failed_rules: failed,
        pass_rate: if total == 0 {
            1.0
        } else {
            passed.len() as f64 / total as f64
        },
    }
}

fn model_relation_summary(spec: &ModelSpec) -> ModelRelationSummary {
    let subtask_count = spec.tasks.iter().map(|t| t.subtasks.len()).sum();
    let mut segment_count = 0usize;
    let mut unbound = 0usize;
    for task in &spec.tasks {
        for sub in &task.subtasks {
            segment_count += sub.segments.len();
            unbound += sub
                .segments
                .iter()
                .filter(|seg| seg.mapping_hint.is_none())
                .count();
        }
    }
    ModelRelationSummary {
        task_count: spec.tasks.len(),
        subtask_count,
        segment_count,
        core_count: spec.platform.cores.len(),
        resource_count: spec.resources.len(),
        unbound_segment_count: unbound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PreemptKind;

    fn event(seq: u64, time: f64, kind: EventKind) -> SimEvent {
        SimEvent {
            seq,
            time,
            id: format!("evt-{seq:08}"),
            kind,
        }
    }

    fn acquire(seq: u64, segment: &str, resource: &str) -> SimEvent {
        event(
            seq,
            seq as f64,
            EventKind::ResourceAcquire {
                job_id: "t1@0".into(),
                segment_key: segment.into(),
                resource_id: resource.into(),
                core_id: "c0".into(),
                request_priority: -10.0,
            },
        )
    }

    fn release(seq: u64, segment: &str, resource: &str, reason: Option<&str>) -> SimEvent {
        event(
            seq,
            seq as f64,
            EventKind::ResourceRelease {
                job_id: "t1@0".into(),
                segment_key: segment.into(),
                resource_id: resource.into(),
                core_id: None,
                reason: reason.map(str::to_string),
            },
        )
    }

    #[test]
    fn balanced_trace_passes() {
        let events = vec![
            acquire(0, "t1@0:s0:seg0", "r0"),
            release(1, "t1@0:s0:seg0", "r0", None),
        ];
        let report = build_audit_report(&events, Some(SchedulerKind::Edf), None);
        assert!(report.passed());
    }

    #[test]
    fn unbalanced_acquire_fails_with_evidence() {
        let events = vec![acquire(0, "t1@0:s0:seg0", "r0")];
        let report = build_audit_report(&events, Some(SchedulerKind::Edf), None);
        let rule = report
            .rules
            .iter()
            .find(|r| r.name == "resource_release_balance")
            .unwrap();
        assert_eq!(rule.status, RuleStatus::Fail);
        assert_eq!(rule.evidence, vec![0]);
        assert!(!report.passed());
    }

    #[test]
    fn abort_without_cancel_release_fails() {
        let events = vec![
            acquire(0, "t1@0:s0:seg0", "r0"),
            event(
                1,
                10.0,
                EventKind::Preempt {
                    job_id: "t1@0".into(),
                    segment_key: "t1@0:s0:seg0".into(),
                    core_id: "c0".into(),
                    kind: PreemptKind::Forced,
                    reason: Some("abort_on_miss".into()),
                },
            ),
            event(
                2,
                10.0,
                EventKind::JobAbort {
                    job_id: "t1@0".into(),
                    task_id: "t1".into(),
                    reason: "abort_on_miss".into(),
                },
            ),
        ];
        let report = build_audit_report(&events, Some(SchedulerKind::Edf), None);
        let rule = report
            .rules
            .iter()
            .find(|r| r.name == "abort_cancel_release_visibility")
            .unwrap();
        assert_eq!(rule.status, RuleStatus::Fail);
        assert_eq!(rule.evidence, vec![2]);
    }

    #[test]
    fn abort_with_cancel_release_passes() {
        let events = vec![
            acquire(0, "t1@0:s0:seg0", "r0"),
            release(1, "t1@0:s0:seg0", "r0", Some("cancel_segment")),
            event(
                2,
                10.0,
                EventKind::JobAbort {
                    job_id: "t1@0".into(),
                    task_id: "t1".into(),
                    reason: "abort_on_miss".into(),
                },
            ),
        ];
        let report = build_audit_report(&events, Some(SchedulerKind::Edf), None);
        assert!(report.passed());
    }

    #[test]
    fn ceiling_block_in_static_domain_fails_under_edf() {
        let events = vec![event(
            0,
            1.0,
            EventKind::SegmentBlocked {
                job_id: "t1@0".into(),
                segment_key: "t1@0:s0:seg0".into(),
                core_id: "c0".into(),
                resource_id: "r0".into(),
                reason: BlockReason::SystemCeilingBlock,
                request_priority: -10.0,
                owner_segment: None,
                system_ceiling: Some(3.0),
                priority_domain: Some(PriorityDomain::FixedPriority),
                resource_acquire_policy: "legacy_sequential".into(),
                rollback_released: vec![],
            },
        )];
        let report = build_audit_report(&events, Some(SchedulerKind::Edf), None);
        let domain = report
            .rules
            .iter()
            .find(|r| r.name == "pcp_priority_domain_alignment")
            .unwrap();
        let numeric = report
            .rules
            .iter()
            .find(|r| r.name == "pcp_ceiling_numeric_domain")
            .unwrap();
        assert_eq!(domain.status, RuleStatus::Fail);
        assert_eq!(numeric.status, RuleStatus::Fail);
        // Unresolved ceiling block also trips the transition rule.
        let transition = report
            .rules
            .iter()
            .find(|r| r.name == "pcp_ceiling_transition_consistency")
            .unwrap();
        assert_eq!(transition.status, RuleStatus::Fail);
    }

    #[test]
    fn wait_for_cycle_is_detected() {
        let block = |seq: u64, segment: &str, owner: &str, resource: &str| {
            event(
                seq,
                seq as f64,
                EventKind::SegmentBlocked {
                    job_id: "t1@0".into(),
                    segment_key: segment.into(),
                    core_id: "c0".into(),
                    resource_id: resource.into(),
                    reason: BlockReason::ResourceBusy,
                    request_priority: -10.0,
                    owner_segment: Some(owner.into()),
                    system_ceiling: None,
                    priority_domain: None,
                    resource_acquire_policy: "legacy_sequential".into(),
                    rollback_released: vec![],
                },
            )
        };
        let events = vec![
            block(0, "a", "b", "r0"),
            block(1, "b", "a", "r1"),
        ];
        let report = build_audit_report(&events, Some(SchedulerKind::Edf), None);
        let rule = report
            .rules
            .iter()
            .find(|r| r.name == "wait_for_deadlock")
            .unwrap();
        assert_eq!(rule.status, RuleStatus::Fail);
        assert_eq!(rule.evidence, vec![1]);
    }
}
