//! Scheduler ids offered to the front-end.

use serde::Serialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Ddim,
    Ddpm,
    EulerDiscrete,
    EulerAncestral,
    DpmSolverMultistep,
    LmsDiscrete,
}

/// A registry entry: the update rule plus config keys merged over the
/// pipeline's scheduler snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSpec {
    pub id: &'static str,
    pub kind: SchedulerKind,
    pub overrides: Map<String, Value>,
}

const IDS: [&str; 9] = [
    "ddim",
    "ddpm",
    "dpm++_2m",
    "dpm++_2m_k",
    "euler",
    "euler_a",
    "euler_k",
    "lms",
    "lms_k",
];

/// Sorted scheduler ids.
pub fn ids() -> &'static [&'static str] {
    &IDS
}

pub fn lookup(id: &str) -> Option<SchedulerSpec> {
    let karras = |enabled: bool| json!({ "use_karras_sigmas": enabled });
    let (id, kind, overrides) = match id {
        "ddim" => (IDS[0], SchedulerKind::Ddim, json!({})),
        "ddpm" => (IDS[1], SchedulerKind::Ddpm, json!({})),
        "dpm++_2m" => (IDS[2], SchedulerKind::DpmSolverMultistep, karras(false)),
        "dpm++_2m_k" => (IDS[3], SchedulerKind::DpmSolverMultistep, karras(true)),
        "euler" => (IDS[4], SchedulerKind::EulerDiscrete, karras(false)),
        "euler_a" => (IDS[5], SchedulerKind::EulerAncestral, json!({})),
        "euler_k" => (IDS[6], SchedulerKind::EulerDiscrete, karras(true)),
        "lms" => (IDS[7], SchedulerKind::LmsDiscrete, karras(false)),
        "lms_k" => (IDS[8], SchedulerKind::LmsDiscrete, karras(true)),
        _ => return None,
    };

    let overrides = match overrides {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Some(SchedulerSpec { id, kind, overrides })
}

impl SchedulerSpec {
    /// Merge the overrides over a snapshot taken at pipeline load.
    pub fn merged_config(&self, snapshot: &Value) -> Value {
        let mut merged = match snapshot {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        for (key, value) in &self.overrides {
            merged.insert(key.clone(), value.clone());
        }
        Value::Object(merged)
    }
}
