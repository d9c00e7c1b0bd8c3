//! Validated input model.
//!
//! The structured document consumed by the engine: platform, resources,
//! task graphs, scheduler choice, and sim parameters. Parsing is serde
//! derive over JSON; `ModelSpec::validate` performs the semantic pass
//! (reference resolution, DAG acyclicity, mapping fallback, legacy arrival
//! normalization) and writes resolved values back into the spec so that a
//! validated model serializes to an equivalent validated model.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::arrival::{ArrivalKind, ArrivalProcess};
use crate::types::{CoreId, ResourceId, Time};
use crate::SimError;

/// Model document version this engine consumes.
pub const MODEL_VERSION: &str = "0.2";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessorTypeSpec {
    pub id: String,
    pub name: String,
    pub core_count: u32,
    pub speed_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreSpec {
    pub id: CoreId,
    pub type_id: String,
    pub speed_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformSpec {
    pub processor_types: Vec<ProcessorTypeSpec>,
    pub cores: Vec<CoreSpec>,
}

/// Concurrency protocol guarding a shared resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    Mutex,
    Pip,
    Pcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    pub id: ResourceId,
    pub name: String,
    pub bound_core_id: CoreId,
    #[serde(default = "ResourceSpec::default_protocol")]
    pub protocol: ProtocolKind,
}

impl ResourceSpec {
    fn default_protocol() -> ProtocolKind {
        ProtocolKind::Mutex
    }
}

/// Task timing category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    TimeDeterministic,
    DynamicRt,
    NonRt,
}

/// Legacy dynamic-task arrival model, kept for configs predating
/// `arrival_process`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrivalModel {
    FixedInterval,
    UniformInterval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArrivalProcessSpec {
    #[serde(rename = "type")]
    pub kind: ArrivalKind,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_releases: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SegmentSpec {
    pub id: String,
    /// 1-based position within the owning subtask.
    pub index: u32,
    pub wcet: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acet: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_resources: Vec<ResourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_hint: Option<CoreId>,
    #[serde(default = "default_true")]
    pub preemptible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_offsets: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubtaskSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predecessors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub successors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_mapping_hint: Option<CoreId>,
    pub segments: Vec<SegmentSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskGraphSpec {
    pub id: String,
    pub name: String,
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<f64>,
    #[serde(default)]
    pub arrival: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_offset: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_inter_arrival: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_inter_arrival: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrival_model: Option<ArrivalModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrival_process: Option<ArrivalProcessSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_mapping_hint: Option<CoreId>,
    #[serde(default)]
    pub abort_on_miss: bool,
    pub subtasks: Vec<SubtaskSpec>,
    /// Typed arrival process produced by validation. Not part of the wire
    /// format; re-derived on every validate pass.
    #[serde(skip)]
    pub(crate) resolved_arrival: Option<ArrivalProcess>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSpec {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimSpec {
    pub duration: f64,
    #[serde(default = "SimSpec::default_seed")]
    pub seed: i64,
}

impl SimSpec {
    fn default_seed() -> i64 {
        42
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSpec {
    pub version: String,
    pub platform: PlatformSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceSpec>,
    pub tasks: Vec<TaskGraphSpec>,
    pub scheduler: SchedulerSpec,
    pub sim: SimSpec,
}

fn model_err(code: &'static str, message: impl Into<String>) -> SimError {
    SimError::Model {
        code,
        message: message.into(),
    }
}

impl ModelSpec {
    /// Parse a JSON document and run semantic validation.
    pub fn from_json_str(input: &str) -> Result<ModelSpec, SimError> {
        let mut spec: ModelSpec = serde_json::from_str(input)
            .map_err(|e| model_err("schema", format!("invalid model document: {e}")))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Parse an in-memory JSON value and run semantic validation.
    pub fn from_json_value(value: Value) -> Result<ModelSpec, SimError> {
        let mut spec: ModelSpec = serde_json::from_value(value)
            .map_err(|e| model_err("schema", format!("invalid model document: {e}")))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Effective speed per core: family factor times per-core factor.
    pub fn effective_speeds(&self) -> BTreeMap<CoreId, f64> {
        let family: BTreeMap<&str, f64> = self
            .platform
            .processor_types
            .iter()
            .map(|p| (p.id.as_str(), p.speed_factor))
            .collect();
        self.platform
            .cores
            .iter()
            .map(|core| {
                let base = family.get(core.type_id.as_str()).copied().unwrap_or(1.0);
                (core.id.clone(), core.speed_factor * base)
            })
            .collect()
    }

    /// Semantic validation. Mutates the spec: mapping hints are resolved
    /// onto segments, time-deterministic release offsets default to `[0]`,
    /// and legacy arrival fields normalize into a typed arrival process.
    pub fn validate(&mut self) -> Result<(), SimError> {
        if self.version != MODEL_VERSION {
            return Err(model_err(
                "version",
                format!(
                    "unsupported model version '{}', expected '{MODEL_VERSION}'",
                    self.version
                ),
            ));
        }
        if self.sim.duration <= 0.0 {
            return Err(model_err("sim.duration", "sim.duration must be > 0"));
        }
        if self.tasks.is_empty() {
            return Err(model_err("tasks", "model must define at least one task"));
        }

        self.validate_platform()?;
        let core_ids: BTreeSet<CoreId> =
            self.platform.cores.iter().map(|c| c.id.clone()).collect();
        let resource_bound_cores = self.validate_resources(&core_ids)?;
        let resource_ids: BTreeSet<ResourceId> =
            self.resources.iter().map(|r| r.id.clone()).collect();

        let mut task_ids = BTreeSet::new();
        for task in &mut self.tasks {
            if !task_ids.insert(task.id.clone()) {
                return Err(model_err("tasks.id", format!("duplicate task id '{}'", task.id)));
            }
            task.validate(&core_ids, &resource_ids, &resource_bound_cores)?;
        }
        Ok(())
    }

    fn validate_platform(&self) -> Result<(), SimError> {
        if self.platform.processor_types.is_empty() || self.platform.cores.is_empty() {
            return Err(model_err(
                "platform",
                "platform requires at least one processor type and one core",
            ));
        }
        let mut type_ids = BTreeSet::new();
        for processor in &self.platform.processor_types {
            if processor.speed_factor <= 0.0 {
                return Err(model_err(
                    "platform.speed_factor",
                    format!("processor type '{}' speed_factor must be > 0", processor.id),
                ));
            }
            if processor.core_count == 0 {
                return Err(model_err(
                    "platform.core_count",
                    format!("processor type '{}' core_count must be >= 1", processor.id),
                ));
            }
            if !type_ids.insert(processor.id.as_str()) {
                return Err(model_err(
                    "platform.processor_types",
                    format!("duplicate processor type id '{}'", processor.id),
                ));
            }
        }

        let mut core_ids = BTreeSet::new();
        let mut cores_by_type: BTreeMap<&str, u32> = BTreeMap::new();
        for core in &self.platform.cores {
            if core.speed_factor <= 0.0 {
                return Err(model_err(
                    "platform.speed_factor",
                    format!("core '{}' speed_factor must be > 0", core.id),
                ));
            }
            if !core_ids.insert(core.id.as_str()) {
                return Err(model_err(
                    "platform.cores",
                    format!("duplicate core id '{}'", core.id),
                ));
            }
            if !type_ids.contains(core.type_id.as_str()) {
                return Err(model_err(
                    "platform.cores",
                    format!("core '{}' references unknown processor type '{}'", core.id, core.type_id),
                ));
            }
            *cores_by_type.entry(core.type_id.as_str()).or_insert(0) += 1;
        }

        for processor in &self.platform.processor_types {
            let actual = cores_by_type.get(processor.id.as_str()).copied().unwrap_or(0);
            if actual != processor.core_count {
                return Err(model_err(
                    "platform.core_count",
                    format!(
                        "processor type '{}' declares core_count={} but has {} cores in platform.cores",
                        processor.id, processor.core_count, actual
                    ),
                ));
            }
        }
        Ok(())
    }

    fn validate_resources(
        &self,
        core_ids: &BTreeSet<CoreId>,
    ) -> Result<BTreeMap<ResourceId, CoreId>, SimError> {
        let mut seen = BTreeSet::new();
        let mut bound = BTreeMap::new();
        for resource in &self.resources {
            if !seen.insert(resource.id.as_str()) {
                return Err(model_err(
                    "resources.id",
                    format!("duplicate resource id '{}'", resource.id),
                ));
            }
            if !core_ids.contains(&resource.bound_core_id) {
                return Err(model_err(
                    "resources.bound_core_id",
                    format!(
                        "resource '{}' bound_core_id '{}' does not exist",
                        resource.id, resource.bound_core_id
                    ),
                ));
            }
            bound.insert(resource.id.clone(), resource.bound_core_id.clone());
        }
        Ok(bound)
    }
}

impl TaskGraphSpec {
    /// First release time for this task.
    pub fn release_base_time(&self) -> Time {
        if self.task_type == TaskType::TimeDeterministic {
            self.arrival + self.phase_offset.unwrap_or(0.0)
        } else {
            self.arrival
        }
    }

    pub(crate) fn resolved_arrival(&self) -> Option<&ArrivalProcess> {
        self.resolved_arrival.as_ref()
    }

    /// `max_releases` cap, if the arrival process declares one.
    pub fn max_releases(&self) -> Option<u64> {
        self.arrival_process.as_ref().and_then(|p| p.max_releases)
    }

    fn validate(
        &mut self,
        core_ids: &BTreeSet<CoreId>,
        resource_ids: &BTreeSet<ResourceId>,
        resource_bound_cores: &BTreeMap<ResourceId, CoreId>,
    ) -> Result<(), SimError> {
        self.validate_timing()?;
        self.normalize_arrival()?;
        self.validate_graph(core_ids, resource_ids, resource_bound_cores)
    }

    fn validate_timing(&mut self) -> Result<(), SimError> {
        let id = self.id.clone();
        if let Some(period) = self.period {
            if period <= 0.0 {
                return Err(model_err("task.period", format!("task '{id}' period must be > 0")));
            }
        }
        if let Some(deadline) = self.deadline {
            if deadline <= 0.0 {
                return Err(model_err("task.deadline", format!("task '{id}' deadline must be > 0")));
            }
        }
        if self.arrival < 0.0 {
            return Err(model_err("task.arrival", format!("task '{id}' arrival must be >= 0")));
        }
        match self.task_type {
            TaskType::TimeDeterministic => {
                if self.period.is_none() {
                    return Err(model_err(
                        "task.period",
                        format!("time_deterministic task '{id}' must define period"),
                    ));
                }
                if self.phase_offset.is_none() {
                    self.phase_offset = Some(0.0);
                }
            }
            _ => {
                if self.phase_offset.is_some_and(|offset| offset != 0.0) {
                    return Err(model_err(
                        "task.phase_offset",
                        format!("task '{id}' phase_offset is only valid for time_deterministic tasks"),
                    ));
                }
            }
        }
        if let Some(offset) = self.phase_offset {
            if offset < 0.0 {
                return Err(model_err(
                    "task.phase_offset",
                    format!("task '{id}' phase_offset must be >= 0"),
                ));
            }
        }
        if self.task_type != TaskType::NonRt && self.deadline.is_none() {
            return Err(model_err(
                "task.deadline",
                format!("real-time task '{id}' must define deadline"),
            ));
        }
        if self.task_type == TaskType::DynamicRt && self.min_inter_arrival.is_none() {
            self.min_inter_arrival = self.period;
        }
        if self.task_type != TaskType::DynamicRt && self.max_inter_arrival.is_some() {
            return Err(model_err(
                "task.max_inter_arrival",
                format!("task '{id}' max_inter_arrival is only valid for dynamic_rt tasks"),
            ));
        }
        if self.max_inter_arrival.is_some() && self.min_inter_arrival.is_none() {
            return Err(model_err(
                "task.max_inter_arrival",
                format!("task '{id}' max_inter_arrival requires min_inter_arrival or period"),
            ));
        }
        for (field, value) in [
            ("min_inter_arrival", self.min_inter_arrival),
            ("max_inter_arrival", self.max_inter_arrival),
        ] {
            if let Some(v) = value {
                if v <= 0.0 {
                    return Err(model_err(
                        "task.inter_arrival",
                        format!("task '{id}' {field} must be > 0"),
                    ));
                }
            }
        }
        if let (Some(min), Some(max)) = (self.min_inter_arrival, self.max_inter_arrival) {
            if max < min - crate::types::TIME_EPS {
                return Err(model_err(
                    "task.inter_arrival",
                    format!("task '{id}' max_inter_arrival must be >= min_inter_arrival"),
                ));
            }
        }
        if self.task_type != TaskType::DynamicRt && self.arrival_model.is_some() {
            return Err(model_err(
                "task.arrival_model",
                format!("task '{id}' arrival_model is only valid for dynamic_rt tasks"),
            ));
        }
        Ok(())
    }

    /// Resolve `arrival_process` (or the legacy inter-arrival fields) into
    /// a typed [`ArrivalProcess`].
    fn normalize_arrival(&mut self) -> Result<(), SimError> {
        let id = self.id.clone();
        if let Some(process) = self.arrival_process.clone() {
            if self.task_type == TaskType::TimeDeterministic {
                return Err(model_err(
                    "task.arrival_process",
                    format!("task '{id}' arrival_process is not valid for time_deterministic tasks"),
                ));
            }
            let mut process = process;
            if process.kind == ArrivalKind::OneShot {
                match process.max_releases {
                    None => process.max_releases = Some(1),
                    Some(1) => {}
                    Some(_) => {
                        return Err(model_err(
                            "task.arrival_process",
                            format!("task '{id}' arrival_process type=one_shot only supports max_releases=1"),
                        ));
                    }
                }
            }
            let resolved = ArrivalProcess::resolve(
                &process,
                self.min_inter_arrival.or(self.period),
                self.max_inter_arrival,
            )
            .map_err(|message| model_err("task.arrival_process", format!("task '{id}': {message}")))?;

            // Mirror the resolved process back onto the legacy fields so
            // downstream consumers see one consistent story.
            if self.task_type == TaskType::DynamicRt {
                match &resolved {
                    ArrivalProcess::Fixed { interval } => {
                        self.min_inter_arrival = Some(*interval);
                        self.max_inter_arrival = None;
                        self.arrival_model = Some(ArrivalModel::FixedInterval);
                    }
                    ArrivalProcess::Uniform {
                        min_interval,
                        max_interval,
                    } => {
                        self.min_inter_arrival = Some(*min_interval);
                        self.max_inter_arrival = Some(*max_interval);
                        self.arrival_model = Some(ArrivalModel::UniformInterval);
                    }
                    ArrivalProcess::OneShot => {
                        self.arrival_model = None;
                        self.min_inter_arrival = None;
                        self.max_inter_arrival = None;
                    }
                    _ => self.arrival_model = None,
                }
            }
            self.arrival_process = Some(process);
            self.resolved_arrival = Some(resolved);
            return Ok(());
        }

        self.resolved_arrival = match self.task_type {
            // Periodic releases come straight from the period formula.
            TaskType::TimeDeterministic => None,
            TaskType::DynamicRt => {
                if self.arrival_model.is_none() {
                    self.arrival_model = Some(if self.max_inter_arrival.is_some() {
                        ArrivalModel::UniformInterval
                    } else {
                        ArrivalModel::FixedInterval
                    });
                }
                match self.arrival_model {
                    Some(ArrivalModel::UniformInterval) => {
                        let min = self.min_inter_arrival.ok_or_else(|| {
                            model_err(
                                "task.arrival_model",
                                format!("task '{id}' arrival_model=uniform_interval requires min_inter_arrival"),
                            )
                        })?;
                        let max = self.max_inter_arrival.ok_or_else(|| {
                            model_err(
                                "task.arrival_model",
                                format!("task '{id}' arrival_model=uniform_interval requires max_inter_arrival"),
                            )
                        })?;
                        Some(ArrivalProcess::Uniform {
                            min_interval: min,
                            max_interval: max,
                        })
                    }
                    _ => {
                        if self.max_inter_arrival.is_some() {
                            return Err(model_err(
                                "task.arrival_model",
                                format!("task '{id}' arrival_model=fixed_interval does not allow max_inter_arrival"),
                            ));
                        }
                        match self.min_inter_arrival {
                            Some(interval) => Some(ArrivalProcess::Fixed { interval }),
                            None => Some(ArrivalProcess::OneShot),
                        }
                    }
                }
            }
            // Without an explicit arrival process a non-RT task releases
            // exactly once, at its arrival time.
            TaskType::NonRt => Some(ArrivalProcess::OneShot),
        };
        Ok(())
    }

    fn validate_graph(
        &mut self,
        core_ids: &BTreeSet<CoreId>,
        resource_ids: &BTreeSet<ResourceId>,
        resource_bound_cores: &BTreeMap<ResourceId, CoreId>,
    ) -> Result<(), SimError> {
        let task_id = self.id.clone();
        let task_type = self.task_type;
        let period = self.period;
        let task_hint = self.task_mapping_hint.clone();
        if let Some(hint) = &task_hint {
            if !core_ids.contains(hint) {
                return Err(model_err(
                    "task.mapping_hint",
                    format!("task '{task_id}' task_mapping_hint '{hint}' does not exist"),
                ));
            }
        }

        let subtask_ids: Vec<String> = self.subtasks.iter().map(|s| s.id.clone()).collect();
        let subtask_set: BTreeSet<&str> = subtask_ids.iter().map(String::as_str).collect();
        if subtask_set.len() != subtask_ids.len() {
            return Err(model_err(
                "task.subtasks",
                format!("task '{task_id}' contains duplicate subtask ids"),
            ));
        }
        if self.subtasks.is_empty() {
            return Err(model_err(
                "task.subtasks",
                format!("task '{task_id}' must define at least one subtask"),
            ));
        }

        let mut edges: BTreeSet<(String, String)> = BTreeSet::new();
        for sub in &mut self.subtasks {
            if sub.segments.is_empty() {
                return Err(model_err(
                    "subtask.segments",
                    format!("task '{task_id}' subtask '{}' must define at least one segment", sub.id),
                ));
            }
            if let Some(hint) = &sub.subtask_mapping_hint {
                if !core_ids.contains(hint) {
                    return Err(model_err(
                        "subtask.mapping_hint",
                        format!(
                            "task '{task_id}' subtask '{}' subtask_mapping_hint '{hint}' does not exist",
                            sub.id
                        ),
                    ));
                }
            }
            for pred in &sub.predecessors {
                if !subtask_set.contains(pred.as_str()) {
                    return Err(model_err(
                        "subtask.predecessors",
                        format!(
                            "task '{task_id}' subtask '{}' references unknown predecessor '{pred}'",
                            sub.id
                        ),
                    ));
                }
                edges.insert((pred.clone(), sub.id.clone()));
            }
            for succ in &sub.successors {
                if !subtask_set.contains(succ.as_str()) {
                    return Err(model_err(
                        "subtask.successors",
                        format!(
                            "task '{task_id}' subtask '{}' references unknown successor '{succ}'",
                            sub.id
                        ),
                    ));
                }
                edges.insert((sub.id.clone(), succ.clone()));
            }

            let mut segment_ids = BTreeSet::new();
            let mut indexes: Vec<u32> = sub.segments.iter().map(|s| s.index).collect();
            indexes.sort_unstable();
            let expected: Vec<u32> = (1..=sub.segments.len() as u32).collect();
            if indexes != expected {
                return Err(model_err(
                    "segment.index",
                    format!(
                        "task '{task_id}' subtask '{}' segment index must start at 1 and be continuous",
                        sub.id
                    ),
                ));
            }
            let sub_hint = sub.subtask_mapping_hint.clone();
            for seg in &mut sub.segments {
                if !segment_ids.insert(seg.id.clone()) {
                    return Err(model_err(
                        "segment.id",
                        format!("task '{task_id}' subtask '{}' has duplicate segment ids", sub.id),
                    ));
                }
                if seg.wcet <= 0.0 {
                    return Err(model_err(
                        "segment.wcet",
                        format!("task '{task_id}' segment '{}' wcet must be > 0", seg.id),
                    ));
                }
                if matches!(seg.acet, Some(acet) if acet <= 0.0) {
                    return Err(model_err(
                        "segment.acet",
                        format!("task '{task_id}' segment '{}' acet must be > 0", seg.id),
                    ));
                }

                let mut effective_hint = seg
                    .mapping_hint
                    .clone()
                    .or_else(|| sub_hint.clone())
                    .or_else(|| task_hint.clone());
                for resource_id in &seg.required_resources {
                    if !resource_ids.contains(resource_id) {
                        return Err(model_err(
                            "segment.required_resources",
                            format!(
                                "task '{task_id}' segment '{}' references unknown resource '{resource_id}'",
                                seg.id
                            ),
                        ));
                    }
                }
                if let Some(hint) = &effective_hint {
                    if !core_ids.contains(hint) {
                        return Err(model_err(
                            "segment.mapping_hint",
                            format!("task '{task_id}' segment '{}' mapping_hint '{hint}' does not exist", seg.id),
                        ));
                    }
                }

                match &seg.release_offsets {
                    Some(offsets) => {
                        if task_type != TaskType::TimeDeterministic {
                            return Err(model_err(
                                "segment.release_offsets",
                                format!(
                                    "task '{task_id}' segment '{}' release_offsets requires a time_deterministic task",
                                    seg.id
                                ),
                            ));
                        }
                        if offsets.is_empty() {
                            return Err(model_err(
                                "segment.release_offsets",
                                format!("task '{task_id}' segment '{}' release_offsets must not be empty", seg.id),
                            ));
                        }
                        for offset in offsets {
                            if *offset < 0.0 {
                                return Err(model_err(
                                    "segment.release_offsets",
                                    format!("task '{task_id}' segment '{}' release_offsets must be >= 0", seg.id),
                                ));
                            }
                            if let Some(period) = period {
                                if *offset >= period - crate::types::TIME_EPS {
                                    return Err(model_err(
                                        "segment.release_offsets",
                                        format!(
                                            "task '{task_id}' segment '{}' release_offset {offset} must be < period",
                                            seg.id
                                        ),
                                    ));
                                }
                            }
                        }
                    }
                    None if task_type == TaskType::TimeDeterministic => {
                        seg.release_offsets = Some(vec![0.0]);
                    }
                    None => {}
                }

                // A segment needing resources is pinned to the cores those
                // resources are bound to.
                let required_cores: BTreeSet<&CoreId> = seg
                    .required_resources
                    .iter()
                    .filter_map(|r| resource_bound_cores.get(r))
                    .collect();
                if required_cores.len() > 1 {
                    let ordered: Vec<&str> = required_cores.iter().map(|c| c.as_str()).collect();
                    return Err(model_err(
                        "segment.required_resources",
                        format!(
                            "task '{task_id}' segment '{}' requires resources bound to multiple cores: {}",
                            seg.id,
                            ordered.join(", ")
                        ),
                    ));
                }
                if let Some(bound_core) = required_cores.into_iter().next() {
                    match &effective_hint {
                        None => effective_hint = Some(bound_core.clone()),
                        Some(hint) if hint != bound_core => {
                            return Err(model_err(
                                "segment.mapping_hint",
                                format!(
                                    "task '{task_id}' segment '{}' mapping_hint '{hint}' conflicts with required resource core '{bound_core}'",
                                    seg.id
                                ),
                            ));
                        }
                        Some(_) => {}
                    }
                }
                if task_type == TaskType::TimeDeterministic && effective_hint.is_none() {
                    if core_ids.len() == 1 {
                        effective_hint = core_ids.iter().next().cloned();
                    } else {
                        return Err(model_err(
                            "segment.mapping_hint",
                            format!(
                                "task '{task_id}' segment '{}' requires a mapping_hint for a time_deterministic task on a multi-core platform",
                                seg.id
                            ),
                        ));
                    }
                }
                seg.mapping_hint = effective_hint;
            }
        }

        // Kahn topological order over the combined predecessor/successor
        // edge set; leftover nodes mean a cycle.
        let mut indegree: BTreeMap<&str, usize> =
            subtask_ids.iter().map(|id| (id.as_str(), 0)).collect();
        let mut adjacency: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (src, dst) in &edges {
            if adjacency
                .entry(src.as_str())
                .or_default()
                .insert(dst.as_str())
            {
                *indegree.get_mut(dst.as_str()).expect("validated subtask id") += 1;
            }
        }
        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(current) = queue.pop_front() {
            visited += 1;
            if let Some(next) = adjacency.get(current) {
                for dst in next {
                    let deg = indegree.get_mut(dst).expect("validated subtask id");
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(*dst);
                    }
                }
            }
        }
        if visited != indegree.len() {
            return Err(model_err(
                "task.dag",
                format!("task '{task_id}' DAG contains a cycle"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_model() -> Value {
        json!({
            "version": "0.2",
            "platform": {
                "processor_types": [{"id": "p0", "name": "big", "core_count": 1, "speed_factor": 1.0}],
                "cores": [{"id": "c0", "type_id": "p0", "speed_factor": 1.0}]
            },
            "tasks": [{
                "id": "t1", "name": "t1", "task_type": "time_deterministic",
                "period": 20.0, "deadline": 20.0,
                "subtasks": [{
                    "id": "s0",
                    "segments": [{"id": "seg0", "index": 1, "wcet": 2.0}]
                }]
            }],
            "scheduler": {"name": "edf"},
            "sim": {"duration": 100.0, "seed": 42}
        })
    }

    #[test]
    fn minimal_model_validates() {
        let spec = ModelSpec::from_json_value(minimal_model()).unwrap();
        assert_eq!(spec.tasks[0].phase_offset, Some(0.0));
        // Single-core platform: the hint resolves implicitly.
        assert_eq!(
            spec.tasks[0].subtasks[0].segments[0].mapping_hint.as_deref(),
            Some("c0")
        );
        assert_eq!(
            spec.tasks[0].subtasks[0].segments[0].release_offsets,
            Some(vec![0.0])
        );
    }

    #[test]
    fn rejects_core_count_mismatch() {
        let mut doc = minimal_model();
        doc["platform"]["processor_types"][0]["core_count"] = json!(2);
        let err = ModelSpec::from_json_value(doc).unwrap_err();
        assert!(err.to_string().contains("core_count"));
    }

    #[test]
    fn rejects_missing_deadline_for_rt_task() {
        let mut doc = minimal_model();
        doc["tasks"][0]["deadline"] = Value::Null;
        let err = ModelSpec::from_json_value(doc).unwrap_err();
        assert!(err.to_string().contains("deadline"));
    }

    #[test]
    fn rejects_dag_cycle() {
        let mut doc = minimal_model();
        doc["tasks"][0]["subtasks"] = json!([
            {"id": "a", "successors": ["b"], "segments": [{"id": "x", "index": 1, "wcet": 1.0}]},
            {"id": "b", "successors": ["a"], "segments": [{"id": "y", "index": 1, "wcet": 1.0}]}
        ]);
        let err = ModelSpec::from_json_value(doc).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn rejects_time_deterministic_without_hint_on_multicore() {
        let mut doc = minimal_model();
        doc["platform"]["processor_types"][0]["core_count"] = json!(2);
        doc["platform"]["cores"] = json!([
            {"id": "c0", "type_id": "p0", "speed_factor": 1.0},
            {"id": "c1", "type_id": "p0", "speed_factor": 1.0}
        ]);
        let err = ModelSpec::from_json_value(doc).unwrap_err();
        assert!(err.to_string().contains("mapping_hint"));
    }

    #[test]
    fn rejects_inverted_inter_arrival_bounds() {
        let mut doc = minimal_model();
        doc["tasks"][0] = json!({
            "id": "t1", "name": "t1", "task_type": "dynamic_rt",
            "deadline": 10.0, "min_inter_arrival": 5.0, "max_inter_arrival": 3.0,
            "subtasks": [{"id": "s0", "segments": [{"id": "seg0", "index": 1, "wcet": 1.0}]}]
        });
        let err = ModelSpec::from_json_value(doc).unwrap_err();
        assert!(err.to_string().contains("max_inter_arrival"));
    }

    #[test]
    fn legacy_fields_normalize_to_uniform() {
        let mut doc = minimal_model();
        doc["tasks"][0] = json!({
            "id": "t1", "name": "t1", "task_type": "dynamic_rt",
            "deadline": 10.0, "min_inter_arrival": 3.0, "max_inter_arrival": 5.0,
            "subtasks": [{"id": "s0", "segments": [{"id": "seg0", "index": 1, "wcet": 1.0}]}]
        });
        let spec = ModelSpec::from_json_value(doc).unwrap();
        assert_eq!(spec.tasks[0].arrival_model, Some(ArrivalModel::UniformInterval));
        assert!(matches!(
            spec.tasks[0].resolved_arrival,
            Some(ArrivalProcess::Uniform { .. })
        ));
    }

    #[test]
    fn validated_model_roundtrips() {
        let spec = ModelSpec::from_json_value(minimal_model()).unwrap();
        let serialized = serde_json::to_value(&spec).unwrap();
        let reparsed = ModelSpec::from_json_value(serialized).unwrap();
        assert_eq!(
            serde_json::to_string(&spec).unwrap(),
            serde_json::to_string(&reparsed).unwrap()
        );
    }
}
