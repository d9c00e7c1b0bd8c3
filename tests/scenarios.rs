use serde_json::json;

use rtsim::{Engine, EventKind, PreemptKind};

mod common;

/// Single DAG on a single core under EDF, no resources: the canonical
/// two-subtask chain with exact completion times.
#[test]
fn single_dag_single_core_edf() {
    common::setup();
    let spec = common::model(json!({
        "version": "0.2",
        "platform": common::single_core_platform(),
        "tasks": [{
            "id": "t1", "name": "chain", "task_type": "time_deterministic",
            "period": 20.0, "deadline": 20.0,
            "subtasks": [
                {"id": "s0", "successors": ["s1"],
                 "segments": [{"id": "seg0", "index": 1, "wcet": 2.0}]},
                {"id": "s1", "predecessors": ["s0"],
                 "segments": [{"id": "seg1", "index": 1, "wcet": 3.0}]}
            ]
        }],
        "scheduler": {"name": "edf"},
        "sim": {"duration": 20.0, "seed": 42}
    }));

    let mut engine = Engine::new();
    engine.build(spec).unwrap();
    engine.run(None).unwrap();
    let events = engine.events();

    let release = common::first(events, "JobRelease");
    assert_eq!(release.time, 0.0);

    let starts = common::of_kind(events, "SegmentStart");
    let ends = common::of_kind(events, "SegmentEnd");
    assert_eq!(starts.len(), 2);
    assert_eq!(ends.len(), 2);
    assert_eq!(starts[0].time, 0.0);
    assert_eq!(ends[0].time, 2.0);
    assert_eq!(starts[1].time, 2.0);
    assert_eq!(ends[1].time, 5.0);

    let complete = common::first(events, "JobComplete");
    assert_eq!(complete.time, 5.0);

    let report = engine.metrics_report();
    assert_eq!(report.per_job[0].response_time, Some(5.0));
    assert_eq!(report.summary.deadline_miss_rate, 0.0);
    assert_eq!(report.summary.preempt_count, 0);
}

/// Heterogeneous speed: the second subtask is mapped onto a 5x core, so
/// its 3.0 wcet takes 0.6 simulated time, and the job migrates.
#[test]
fn heterogeneous_speed_scales_wcet_and_migrates() {
    common::setup();
    let spec = common::model(json!({
        "version": "0.2",
        "platform": {
            "processor_types": [
                {"id": "p0", "name": "small", "core_count": 1, "speed_factor": 1.0},
                {"id": "p1", "name": "big", "core_count": 1, "speed_factor": 5.0}
            ],
            "cores": [
                {"id": "c0", "type_id": "p0", "speed_factor": 1.0},
                {"id": "g0", "type_id": "p1", "speed_factor": 1.0}
            ]
        },
        "tasks": [{
            "id": "t1", "name": "hetero", "task_type": "time_deterministic",
            "period": 20.0, "deadline": 20.0,
            "subtasks": [
                {"id": "s0", "successors": ["s1"],
                 "segments": [{"id": "seg0", "index": 1, "wcet": 2.0, "mapping_hint": "c0"}]},
                {"id": "s1", "predecessors": ["s0"],
                 "segments": [{"id": "seg1", "index": 1, "wcet": 3.0, "mapping_hint": "g0"}]}
            ]
        }],
        "scheduler": {"name": "edf"},
        "sim": {"duration": 20.0, "seed": 42}
    }));

    let mut engine = Engine::new();
    engine.build(spec).unwrap();
    engine.run(None).unwrap();
    let events = engine.events();

    let ends = common::of_kind(events, "SegmentEnd");
    assert_eq!(ends.len(), 2);
    assert_eq!(ends[0].time, 2.0);
    assert!((ends[1].time - 2.6).abs() < 1e-9, "got {}", ends[1].time);

    let migration = common::first(events, "Migration");
    match &migration.kind {
        EventKind::Migration {
            from_core, to_core, ..
        } => {
            assert_eq!(from_core, "c0");
            assert_eq!(to_core, "g0");
        }
        other => panic!("unexpected kind {other:?}"),
    }
    // The migration precedes the second segment's start.
    let second_start = common::of_kind(events, "SegmentStart")[1];
    assert!(migration.seq < second_start.seq);
    assert_eq!(engine.metrics_report().summary.migration_count, 1);
}

/// Abort on deadline miss while holding a resource: DeadlineMiss, forced
/// Preempt, ResourceRelease, JobAbort, in that order, all at t=10, and
/// the job never runs again.
#[test]
fn abort_on_miss_releases_resources_in_order() {
    common::setup();
    let spec = common::model(json!({
        "version": "0.2",
        "platform": common::single_core_platform(),
        "resources": [
            {"id": "r0", "name": "bus", "bound_core_id": "c0", "protocol": "mutex"}
        ],
        "tasks": [{
            "id": "t1", "name": "laggard", "task_type": "dynamic_rt",
            "deadline": 10.0, "abort_on_miss": true,
            "arrival_process": {"type": "one_shot"},
            "subtasks": [{
                "id": "s0",
                "segments": [{"id": "seg0", "index": 1, "wcet": 20.0,
                              "required_resources": ["r0"]}]
            }]
        }],
        "scheduler": {"name": "edf"},
        "sim": {"duration": 30.0, "seed": 42}
    }));

    let mut engine = Engine::new();
    engine.build(spec).unwrap();
    engine.run(None).unwrap();
    let events = engine.events();

    let miss = common::first(events, "DeadlineMiss");
    let preempt = common::first(events, "Preempt");
    let release = events
        .iter()
        .find(|e| {
            matches!(&e.kind, EventKind::ResourceRelease { reason, .. }
                if reason.as_deref() == Some("cancel_segment"))
        })
        .expect("cancel release");
    let abort = common::first(events, "JobAbort");

    for event in [miss, preempt, release, abort] {
        assert_eq!(event.time, 10.0);
    }
    assert!(miss.seq < preempt.seq);
    assert!(preempt.seq < release.seq);
    assert!(release.seq < abort.seq);
    match &preempt.kind {
        EventKind::Preempt { kind, .. } => assert_eq!(*kind, PreemptKind::Forced),
        other => panic!("unexpected kind {other:?}"),
    }

    // No further execution for the aborted job.
    assert!(common::starts_for(events, "t1@0")
        .iter()
        .all(|e| e.time < 10.0));

    let report = engine.metrics_report();
    assert_eq!(report.summary.jobs_aborted, 1);
    assert_eq!(report.summary.forced_preempt_count, 1);
    assert_eq!(report.summary.deadline_miss_rate, 1.0);
}

/// Abort while another segment is blocked on the held mutex: the
/// cancel-path ResourceRelease precedes the waiter's SegmentUnblocked,
/// matching the normal release path, and the waiter then runs.
#[test]
fn abort_with_blocked_waiter_releases_before_wakeup() {
    common::setup();
    let spec = common::model(json!({
        "version": "0.2",
        "platform": common::single_core_platform(),
        "resources": [
            {"id": "r0", "name": "lock", "bound_core_id": "c0", "protocol": "mutex"}
        ],
        "tasks": [
            {
                "id": "doomed", "name": "doomed", "task_type": "dynamic_rt",
                "deadline": 10.0, "abort_on_miss": true,
                "arrival_process": {"type": "one_shot"},
                "subtasks": [{"id": "s0", "segments": [
                    {"id": "cs", "index": 1, "wcet": 50.0,
                     "required_resources": ["r0"]}]}]
            },
            {
                "id": "waiter", "name": "waiter", "task_type": "dynamic_rt",
                "deadline": 4.0, "arrival": 1.0,
                "arrival_process": {"type": "one_shot"},
                "subtasks": [{"id": "s0", "segments": [
                    {"id": "cs", "index": 1, "wcet": 1.0,
                     "required_resources": ["r0"]}]}]
            }
        ],
        "scheduler": {"name": "edf"},
        "sim": {"duration": 20.0, "seed": 42}
    }));

    let mut engine = Engine::new();
    engine.build(spec).unwrap();
    engine.run(None).unwrap();
    let events = engine.events();

    // The waiter preempts the holder at t=1 and blocks on r0.
    let block = events
        .iter()
        .find(|e| {
            matches!(&e.kind, EventKind::SegmentBlocked { job_id, .. } if job_id == "waiter@0")
        })
        .expect("waiter must block");
    assert_eq!(block.time, 1.0);

    // At t=10 the holder aborts: forced preempt, then the release, then
    // the waiter's wakeup it enables, then JobAbort.
    let release = events
        .iter()
        .find(|e| {
            matches!(&e.kind, EventKind::ResourceRelease { job_id, reason, .. }
                if job_id == "doomed@0" && reason.as_deref() == Some("cancel_segment"))
        })
        .expect("cancel release");
    let unblocked = events
        .iter()
        .find(|e| {
            matches!(&e.kind, EventKind::SegmentUnblocked { job_id, .. } if job_id == "waiter@0")
        })
        .expect("waiter wakeup");
    let abort = common::first(events, "JobAbort");
    for event in [release, unblocked, abort] {
        assert_eq!(event.time, 10.0);
    }
    assert!(release.seq < unblocked.seq);
    assert!(unblocked.seq < abort.seq);

    // The woken waiter acquires the lock and finishes (late).
    let waiter_acquire = events
        .iter()
        .find(|e| {
            matches!(&e.kind, EventKind::ResourceAcquire { job_id, .. } if job_id == "waiter@0")
        })
        .expect("waiter acquires after the abort");
    assert!(waiter_acquire.seq > abort.seq);
    assert!(events
        .iter()
        .any(|e| matches!(&e.kind, EventKind::JobComplete { job_id, .. } if job_id == "waiter@0")));
}

/// A non-aborting miss emits exactly one DeadlineMiss and the job still
/// completes late.
#[test]
fn miss_without_abort_completes_late() {
    common::setup();
    let spec = common::model(json!({
        "version": "0.2",
        "platform": common::single_core_platform(),
        "tasks": [{
            "id": "t1", "name": "late", "task_type": "dynamic_rt",
            "deadline": 4.0,
            "arrival_process": {"type": "one_shot"},
            "subtasks": [{
                "id": "s0",
                "segments": [{"id": "seg0", "index": 1, "wcet": 6.0}]
            }]
        }],
        "scheduler": {"name": "edf"},
        "sim": {"duration": 10.0, "seed": 42}
    }));

    let mut engine = Engine::new();
    engine.build(spec).unwrap();
    engine.run(None).unwrap();
    let events = engine.events();

    assert_eq!(common::of_kind(events, "DeadlineMiss").len(), 1);
    assert_eq!(common::first(events, "DeadlineMiss").time, 4.0);
    assert_eq!(common::first(events, "JobComplete").time, 6.0);

    let report = engine.metrics_report();
    assert_eq!(report.summary.jobs_completed, 1);
    assert_eq!(report.summary.jobs_aborted, 0);
    assert!(report.per_job[0].missed);
}

/// `allow_preempt=false` runs every segment to completion even when a
/// tighter-deadline job arrives mid-flight.
#[test]
fn allow_preempt_false_runs_to_segment_completion() {
    common::setup();
    let build = |allow: bool| {
        common::model(json!({
            "version": "0.2",
            "platform": common::single_core_platform(),
            "tasks": [
                {
                    "id": "a", "name": "long", "task_type": "dynamic_rt",
                    "deadline": 100.0,
                    "arrival_process": {"type": "one_shot"},
                    "subtasks": [{"id": "s0", "segments": [
                        {"id": "seg0", "index": 1, "wcet": 8.0}]}]
                },
                {
                    "id": "b", "name": "urgent", "task_type": "dynamic_rt",
                    "deadline": 10.0, "arrival": 2.0,
                    "arrival_process": {"type": "one_shot"},
                    "subtasks": [{"id": "s0", "segments": [
                        {"id": "seg0", "index": 1, "wcet": 1.0}]}]
                }
            ],
            "scheduler": {"name": "edf", "params": {"allow_preempt": allow}},
            "sim": {"duration": 20.0, "seed": 42}
        }))
    };

    let mut preemptive = Engine::new();
    preemptive.build(build(true)).unwrap();
    preemptive.run(None).unwrap();
    assert_eq!(
        preemptive.metrics_report().summary.scheduler_preempt_count,
        1
    );

    let mut cooperative = Engine::new();
    cooperative.build(build(false)).unwrap();
    cooperative.run(None).unwrap();
    let report = cooperative.metrics_report();
    assert_eq!(report.summary.scheduler_preempt_count, 0);
    // The urgent job waits for the long segment to finish.
    let b_start = common::starts_for(cooperative.events(), "b@0")[0];
    assert_eq!(b_start.time, 8.0);
}

/// Fixed-interval arrivals release periodically until the horizon and the
/// trace truncates the segment still running at the end.
#[test]
fn fixed_arrivals_release_until_horizon() {
    common::setup();
    let spec = common::model(json!({
        "version": "0.2",
        "platform": common::single_core_platform(),
        "tasks": [{
            "id": "t1", "name": "periodic", "task_type": "dynamic_rt",
            "deadline": 5.0,
            "arrival_process": {"type": "fixed", "params": {"interval": 4.0}},
            "subtasks": [{"id": "s0", "segments": [
                {"id": "seg0", "index": 1, "wcet": 3.0}]}]
        }],
        "scheduler": {"name": "edf"},
        "sim": {"duration": 10.0, "seed": 42}
    }));

    let mut engine = Engine::new();
    engine.build(spec).unwrap();
    engine.run(None).unwrap();
    let events = engine.events();

    let releases = common::of_kind(events, "JobRelease");
    let release_times: Vec<f64> = releases.iter().map(|e| e.time).collect();
    assert_eq!(release_times, vec![0.0, 4.0, 8.0]);

    // The third job is still running at t=10; its end is truncated.
    let truncated = events.iter().any(|e| {
        matches!(&e.kind, EventKind::SegmentEnd { truncated, .. } if *truncated)
    });
    assert!(truncated);

    let report = engine.metrics_report();
    assert_eq!(report.summary.jobs_released, 3);
    assert_eq!(report.summary.jobs_completed, 2);
    // Busy the whole horizon: 3 + 3 + 4-truncated-to-2... the first two
    // jobs complete back-to-back and the third runs 8..10.
    assert!((report.summary.core_utilization["c0"] - 0.8).abs() < 1e-9);
}

/// max_releases caps a stochastic arrival sequence.
#[test]
fn max_releases_caps_sequence() {
    common::setup();
    let spec = common::model(json!({
        "version": "0.2",
        "platform": common::single_core_platform(),
        "tasks": [{
            "id": "t1", "name": "burst", "task_type": "dynamic_rt",
            "deadline": 50.0,
            "arrival_process": {"type": "poisson", "params": {"rate": 10.0},
                                 "max_releases": 2},
            "subtasks": [{"id": "s0", "segments": [
                {"id": "seg0", "index": 1, "wcet": 0.01}]}]
        }],
        "scheduler": {"name": "edf"},
        "sim": {"duration": 100.0, "seed": 42}
    }));

    let mut engine = Engine::new();
    engine.build(spec).unwrap();
    engine.run(None).unwrap();
    assert_eq!(engine.metrics_report().summary.jobs_released, 2);
}

/// Rate-monotonic prefers the shorter-period task when both are ready.
#[test]
fn rate_monotonic_orders_by_period() {
    common::setup();
    let spec = common::model(json!({
        "version": "0.2",
        "platform": common::single_core_platform(),
        "tasks": [
            {
                "id": "slow", "name": "slow", "task_type": "time_deterministic",
                "period": 50.0, "deadline": 50.0,
                "subtasks": [{"id": "s0", "segments": [
                    {"id": "seg0", "index": 1, "wcet": 2.0}]}]
            },
            {
                "id": "fast", "name": "fast", "task_type": "time_deterministic",
                "period": 10.0, "deadline": 10.0,
                "subtasks": [{"id": "s0", "segments": [
                    {"id": "seg0", "index": 1, "wcet": 1.0}]}]
            }
        ],
        "scheduler": {"name": "rate_monotonic"},
        "sim": {"duration": 20.0, "seed": 42}
    }));

    let mut engine = Engine::new();
    engine.build(spec).unwrap();
    engine.run(None).unwrap();
    let events = engine.events();

    let first_start = common::first(events, "SegmentStart");
    match &first_start.kind {
        EventKind::SegmentStart { job_id, .. } => assert_eq!(job_id, "fast@0"),
        other => panic!("unexpected kind {other:?}"),
    }
    assert_eq!(engine.metrics_report().summary.deadline_miss_rate, 0.0);
}

/// step() advances one event horizon at a time and lands on the same
/// trace a straight run produces.
#[test]
fn step_matches_run() {
    common::setup();
    let doc = json!({
        "version": "0.2",
        "platform": common::single_core_platform(),
        "tasks": [{
            "id": "t1", "name": "chain", "task_type": "time_deterministic",
            "period": 10.0, "deadline": 10.0,
            "subtasks": [{"id": "s0", "segments": [
                {"id": "seg0", "index": 1, "wcet": 2.0}]}]
        }],
        "scheduler": {"name": "edf"},
        "sim": {"duration": 30.0, "seed": 42}
    });

    let mut ran = Engine::new();
    ran.build(common::model(doc.clone())).unwrap();
    ran.run(None).unwrap();

    let mut stepped = Engine::new();
    stepped.build(common::model(doc)).unwrap();
    while stepped.now() < 30.0 - 1e-12 {
        let before = stepped.now();
        stepped.step(None).unwrap();
        if stepped.now() <= before + 1e-12 {
            break;
        }
    }
    stepped.run(None).unwrap();

    assert_eq!(ran.events_jsonl(), stepped.events_jsonl());
}

/// stop() freezes the run at the next event boundary; pause() keeps the
/// queue intact for resume().
#[test]
fn pause_resume_continues_the_same_trace() {
    common::setup();
    let doc = json!({
        "version": "0.2",
        "platform": common::single_core_platform(),
        "tasks": [{
            "id": "t1", "name": "chain", "task_type": "time_deterministic",
            "period": 5.0, "deadline": 5.0,
            "subtasks": [{"id": "s0", "segments": [
                {"id": "seg0", "index": 1, "wcet": 1.0}]}]
        }],
        "scheduler": {"name": "edf"},
        "sim": {"duration": 20.0, "seed": 42}
    });

    let mut reference = Engine::new();
    reference.build(common::model(doc.clone())).unwrap();
    reference.run(None).unwrap();

    let mut paused = Engine::new();
    paused.build(common::model(doc)).unwrap();
    paused.run(Some(7.0)).unwrap();
    paused.pause();
    paused.resume();
    paused.run(None).unwrap();

    let times = |engine: &Engine| -> Vec<(f64, String)> {
        engine
            .events()
            .iter()
            .map(|e| (e.time, e.kind.name().to_string()))
            .collect()
    };
    assert_eq!(times(&reference), times(&paused));
}
