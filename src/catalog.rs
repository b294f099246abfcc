//! Catalog records consumed by the engine.
//!
//! [`Catalog`] is the lookup contract the runners depend on. How the
//! records are stored is up to the implementor; [`Workspace`] keeps
//! them in memory and is what the CLI loads from disk.

use crate::model::*;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Read access to endpoints, environments, test data, flows and tasks.
pub trait Catalog: Send + Sync {
    fn endpoint(&self, id: RecordId) -> Option<Endpoint>;

    fn environment(&self, id: RecordId) -> Option<Environment>;

    fn test_data(&self, id: RecordId) -> Option<TestData>;

    /// First test-data record saved for `endpoint_id`.
    fn default_test_data(&self, endpoint_id: RecordId) -> Option<TestData>;

    fn flow(&self, id: RecordId) -> Option<Flow>;

    fn task(&self, id: RecordId) -> Option<TestTask>;
}

/// In-memory catalog, deserialized from a workspace document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workspace {
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub environments: Vec<Environment>,
    #[serde(default)]
    pub test_data: Vec<TestData>,
    #[serde(default)]
    pub flows: Vec<Flow>,
    #[serde(default)]
    pub tasks: Vec<TestTask>,
}

impl Workspace {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse workspace YAML")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse workspace JSON")
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize workspace")
    }

    /// Append every record of `other`. Lookups return the first match,
    /// so records already present win over duplicates.
    pub fn merge(&mut self, other: Workspace) {
        self.endpoints.extend(other.endpoints);
        self.environments.extend(other.environments);
        self.test_data.extend(other.test_data);
        self.flows.extend(other.flows);
        self.tasks.extend(other.tasks);
    }

    /// Consistency problems that would make runs fail or behave
    /// surprisingly. Empty when the workspace looks sound.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        duplicates("endpoint", self.endpoints.iter().map(|e| e.id), &mut warnings);
        duplicates("environment", self.environments.iter().map(|e| e.id), &mut warnings);
        duplicates("test data", self.test_data.iter().map(|t| t.id), &mut warnings);
        duplicates("flow", self.flows.iter().map(|f| f.id), &mut warnings);
        duplicates("task", self.tasks.iter().map(|t| t.id), &mut warnings);

        for env in &self.environments {
            if let Err(err) = url::Url::parse(&env.base_url) {
                warnings.push(format!(
                    "environment {} ({}): invalid base_url '{}': {err}",
                    env.id, env.name, env.base_url
                ));
            }
        }

        for data in &self.test_data {
            if self.endpoint(data.endpoint_id).is_none() {
                warnings.push(format!(
                    "test data {}: unknown endpoint {}",
                    data.id, data.endpoint_id
                ));
            }
        }

        for flow in &self.flows {
            for (position, step) in flow.steps.iter().enumerate() {
                if self.endpoint(step.endpoint_id).is_none() {
                    warnings.push(format!(
                        "flow {} '{}': step {} references unknown endpoint {}",
                        flow.id,
                        flow.name,
                        position + 1,
                        step.endpoint_id
                    ));
                }
                let env = step.environment_id.or(flow.environment_id);
                if let Some(env) = env.filter(|id| self.environment(*id).is_none()) {
                    warnings.push(format!(
                        "flow {} '{}': step {} references unknown environment {env}",
                        flow.id,
                        flow.name,
                        position + 1
                    ));
                }
            }
        }

        for task in &self.tasks {
            for item in &task.items {
                let known = match item.item_type {
                    ItemType::Api => self.endpoint(item.item_id).is_some(),
                    ItemType::Flow => self.flow(item.item_id).is_some(),
                };
                if !known {
                    warnings.push(format!(
                        "task {} '{}': unknown {:?} item {}",
                        task.id, task.name, item.item_type, item.item_id
                    ));
                }
            }
        }

        warnings
    }
}

fn duplicates(
    kind: &str,
    ids: impl Iterator<Item = RecordId>,
    warnings: &mut Vec<String>,
) {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            warnings.push(format!("duplicate {kind} id {id}"));
        }
    }
}

impl Catalog for Workspace {
    fn endpoint(&self, id: RecordId) -> Option<Endpoint> {
        self.endpoints.iter().find(|e| e.id == id).cloned()
    }

    fn environment(&self, id: RecordId) -> Option<Environment> {
        self.environments.iter().find(|e| e.id == id).cloned()
    }

    fn test_data(&self, id: RecordId) -> Option<TestData> {
        self.test_data.iter().find(|t| t.id == id).cloned()
    }

    fn default_test_data(&self, endpoint_id: RecordId) -> Option<TestData> {
        self.test_data
            .iter()
            .find(|t| t.endpoint_id == endpoint_id)
            .cloned()
    }

    fn flow(&self, id: RecordId) -> Option<Flow> {
        self.flows.iter().find(|f| f.id == id).cloned()
    }

    fn task(&self, id: RecordId) -> Option<TestTask> {
        self.tasks.iter().find(|t| t.id == id).cloned()
    }
}
