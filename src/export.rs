//! Flow export documents.

use crate::model::*;
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EXPORT_VERSION: &str = "1.0";

/// A portable snapshot of a flow and its variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowExport {
    pub version: String,
    #[serde(rename = "exportTime")]
    pub export_time: String,
    pub flow: ExportedFlow,
    #[serde(default)]
    pub variables: Vec<FlowVariable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedFlow {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub project_id: Option<RecordId>,
    #[serde(default)]
    pub environment_id: Option<RecordId>,
    #[serde(default)]
    pub global_variables: Value,
    #[serde(default)]
    pub steps: Vec<FlowStep>,
}

impl FlowExport {
    /// Snapshot `flow` as of `now`.
    pub fn from_flow(flow: &Flow, now: DateTime<Local>) -> Self {
        Self {
            version: EXPORT_VERSION.to_string(),
            export_time: now.to_rfc3339(),
            flow: ExportedFlow {
                name: flow.name.clone(),
                description: flow.description.clone(),
                project_id: flow.project_id,
                environment_id: flow.environment_id,
                global_variables: flow
                    .global_variables
                    .clone()
                    .unwrap_or_else(|| Value::Object(JsonMap::new())),
                steps: flow.steps.clone(),
            },
            variables: flow.variables.clone(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse flow export")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize flow export")
    }

    /// A new flow (id 0) built from this export.
    pub fn into_flow(self) -> Flow {
        let mut flow = Flow {
            id: 0,
            project_id: None,
            name: self.flow.name.clone(),
            description: None,
            environment_id: None,
            global_variables: None,
            variables: Vec::new(),
            steps: Vec::new(),
            execution_config: ExecutionConfig::default(),
        };
        self.apply_to(&mut flow);
        flow
    }

    /// Overwrite `flow` with this export. The flow keeps its id, name
    /// and execution settings; variables are replaced, skipping entries
    /// with an empty key or value.
    pub fn apply_to(self, flow: &mut Flow) {
        flow.description = self.flow.description;
        flow.project_id = self.flow.project_id;
        flow.environment_id = self.flow.environment_id;
        flow.global_variables = match self.flow.global_variables {
            Value::Null => None,
            other => Some(other),
        };
        flow.steps = self.flow.steps;
        flow.variables = self
            .variables
            .into_iter()
            .filter(|var| !var.key.is_empty() && !is_empty_value(&var.value))
            .collect();
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// File-system friendly export name: the flow name reduced to
/// alphanumerics, spaces, `-` and `_`, plus a timestamp.
pub fn export_name(flow: &Flow, now: DateTime<Local>) -> String {
    let safe: String = flow
        .name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let safe = safe.trim();
    let base = if safe.is_empty() {
        format!("flow_{}", flow.id)
    } else {
        safe.to_string()
    };
    format!("{base}_{}", now.format("%Y%m%d_%H%M%S"))
}
