#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::{json, Value};

use rtsim::{EventKind, ModelSpec, SimEvent};

/// Initialize tracing from `RUST_LOG`. `try_init()` is idempotent: the
/// first call in the process succeeds, later calls are ignored.
pub fn setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_test_writer()
        .try_init();
}

/// Parse + validate a model document, panicking on errors.
pub fn model(value: Value) -> ModelSpec {
    ModelSpec::from_json_value(value).expect("valid model")
}

/// Single-core platform fragment: one processor family, one core c0.
pub fn single_core_platform() -> Value {
    json!({
        "processor_types": [
            {"id": "p0", "name": "uni", "core_count": 1, "speed_factor": 1.0}
        ],
        "cores": [
            {"id": "c0", "type_id": "p0", "speed_factor": 1.0}
        ]
    })
}

/// Events of the given wire kind, in emission order.
pub fn of_kind<'a>(events: &'a [SimEvent], kind: &str) -> Vec<&'a SimEvent> {
    events.iter().filter(|e| e.kind.name() == kind).collect()
}

/// First event of the given kind, panicking when absent.
pub fn first<'a>(events: &'a [SimEvent], kind: &str) -> &'a SimEvent {
    of_kind(events, kind)
        .into_iter()
        .next()
        .unwrap_or_else(|| panic!("expected at least one {kind} event"))
}

/// All `SegmentStart` events for the given job.
pub fn starts_for<'a>(events: &'a [SimEvent], job: &str) -> Vec<&'a SimEvent> {
    events
        .iter()
        .filter(|e| {
            matches!(&e.kind, EventKind::SegmentStart { job_id, .. } if job_id == job)
        })
        .collect()
}

/// Shared recorder for subscriber tests: collects (time, kind) pairs.
pub type Recorder = Rc<RefCell<Vec<(f64, String)>>>;

pub fn recorder() -> Recorder {
    Rc::new(RefCell::new(Vec::new()))
}

pub fn record_into(sink: &Recorder) -> Box<dyn FnMut(&SimEvent)> {
    let sink = sink.clone();
    Box::new(move |event| {
        sink.borrow_mut()
            .push((event.time, event.kind.name().to_string()));
    })
}
