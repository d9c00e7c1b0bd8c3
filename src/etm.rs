//! Execution-time models and overhead accounting.
//!
//! An ETM maps (segment, core) to an effective duration. It is consulted
//! exactly once when a segment starts running; the engine then burns down
//! remaining *nominal* work at the rate the estimate implies, so mid-run
//! preemption and resume on a differently-scaled core stay exact.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::types::{CoreId, SegmentId, SubtaskId, TaskId, Time};
use crate::SimError;

/// Identifies one running segment for table lookups.
#[derive(Debug, Clone, Copy)]
pub struct EtmLookup<'a> {
    pub task_id: &'a TaskId,
    pub subtask_id: &'a SubtaskId,
    pub segment_id: &'a SegmentId,
    pub core_id: &'a CoreId,
}

/// Execution-time model. Closed set; selected by `scheduler.params.etm`.
#[derive(Debug, Clone, PartialEq)]
pub enum Etm {
    /// `wcet / effective_core_speed`.
    Constant,
    /// Scale factors looked up by segment/core key, falling back from the
    /// most specific key to `default_scale`.
    TableBased {
        table: BTreeMap<String, f64>,
        default_scale: f64,
    },
}

impl Default for Etm {
    fn default() -> Self {
        Etm::Constant
    }
}

impl Etm {
    /// Build an ETM from `scheduler.params.etm` / `etm_params`.
    pub fn from_params(name: &str, params: Option<&Value>) -> Result<Etm, SimError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "default" | "constant" => Ok(Etm::Constant),
            "table_based" => {
                let config = match params {
                    None => serde_json::Map::new(),
                    Some(Value::Object(map)) => map.clone(),
                    Some(_) => {
                        return Err(SimError::Config {
                            code: "etm.params",
                            message: "scheduler.params.etm_params must be an object".into(),
                        })
                    }
                };
                let default_scale = match config.get("default_scale") {
                    None => 1.0,
                    Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
                    Some(_) => 0.0,
                };
                if default_scale <= 0.0 {
                    return Err(SimError::Config {
                        code: "etm.params",
                        message: "scheduler.params.etm_params.default_scale must be > 0".into(),
                    });
                }
                let mut table = BTreeMap::new();
                if let Some(raw) = config.get("table") {
                    let entries = raw.as_object().ok_or_else(|| SimError::Config {
                        code: "etm.params",
                        message: "scheduler.params.etm_params.table must be an object".into(),
                    })?;
                    for (key, value) in entries {
                        let key = key.trim();
                        if key.is_empty() {
                            return Err(SimError::Config {
                                code: "etm.params",
                                message: "scheduler.params.etm_params.table contains an empty key".into(),
                            });
                        }
                        let scale = value.as_f64().unwrap_or(0.0);
                        if scale <= 0.0 {
                            return Err(SimError::Config {
                                code: "etm.params",
                                message: format!(
                                    "scheduler.params.etm_params.table['{key}'] must be > 0"
                                ),
                            });
                        }
                        table.insert(key.to_string(), scale);
                    }
                }
                Ok(Etm::TableBased {
                    table,
                    default_scale,
                })
            }
            other => Err(SimError::Config {
                code: "etm.name",
                message: format!("unknown etm '{other}', expected constant|table_based"),
            }),
        }
    }

    /// Effective duration for `remaining` nominal work on a core with the
    /// given effective speed.
    pub fn estimate(&self, remaining: Time, core_speed: f64, lookup: &EtmLookup<'_>) -> Time {
        remaining * self.scale(lookup) / core_speed
    }

    /// Nominal work consumed per unit of simulated time on this core.
    pub fn work_rate(&self, core_speed: f64, lookup: &EtmLookup<'_>) -> f64 {
        core_speed / self.scale(lookup)
    }

    fn scale(&self, lookup: &EtmLookup<'_>) -> f64 {
        match self {
            Etm::Constant => 1.0,
            Etm::TableBased {
                table,
                default_scale,
            } => {
                let prefix = format!(
                    "{}/{}/{}",
                    lookup.task_id, lookup.subtask_id, lookup.segment_id
                );
                let candidates = [
                    format!("{prefix}@{}", lookup.core_id),
                    format!("{prefix}@*"),
                    format!("{}@{}", lookup.segment_id, lookup.core_id),
                    format!("{}@*", lookup.segment_id),
                ];
                candidates
                    .iter()
                    .find_map(|key| table.get(key))
                    .copied()
                    .unwrap_or(*default_scale)
            }
        }
    }
}

/// Constant scheduling overheads charged on top of execution time.
/// All default to zero; configured via `scheduler.params.overhead`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OverheadModel {
    pub context_switch: Time,
    pub migration: Time,
    pub schedule: Time,
}

impl OverheadModel {
    pub fn from_params(params: Option<&Value>) -> Result<OverheadModel, SimError> {
        let config = match params {
            None => return Ok(OverheadModel::default()),
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(SimError::Config {
                    code: "overhead.params",
                    message: "scheduler.params.overhead must be an object".into(),
                })
            }
        };
        let field = |key: &str| -> Result<Time, SimError> {
            match config.get(key) {
                None => Ok(0.0),
                Some(value) => {
                    let v = value.as_f64().unwrap_or(-1.0);
                    if v < 0.0 {
                        return Err(SimError::Config {
                            code: "overhead.params",
                            message: format!("scheduler.params.overhead.{key} must be >= 0"),
                        });
                    }
                    Ok(v)
                }
            }
        };
        Ok(OverheadModel {
            context_switch: field("context_switch")?,
            migration: field("migration")?,
            schedule: field("schedule")?,
        })
    }
}
