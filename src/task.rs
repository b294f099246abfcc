//! Test tasks: batches of endpoints and flows run against one
//! environment.

use crate::endpoint::execute_endpoint;
use crate::error::ConfigError;
use crate::model::*;
use crate::runner::{DefaultFlowRunner, FlowRunner};
use anyhow::{anyhow, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

/// Failed item names listed in a task's error summary.
const SUMMARY_NAMES: usize = 5;

/// Runs [`TestTask`]s. Cheap to clone; clones share the catalog and
/// HTTP client.
#[derive(Clone)]
pub struct TaskRunner {
    flows: DefaultFlowRunner,
}

impl TaskRunner {
    pub fn new(flows: DefaultFlowRunner) -> Self {
        Self { flows }
    }

    /// Run task `task_id` against `environment_id`. Items run in
    /// `sort_order`; a failing or missing item never aborts the task.
    #[instrument(skip(self))]
    pub async fn run(
        &self,
        task_id: RecordId,
        environment_id: RecordId,
    ) -> Result<TaskExecution, ConfigError> {
        let catalog = self.flows.catalog();
        let task = catalog
            .task(task_id)
            .ok_or(ConfigError::MissingTask(task_id))?;
        catalog
            .environment(environment_id)
            .ok_or(ConfigError::UnknownEnvironment(environment_id))?;

        let started_at = Utc::now();
        let mut items = task.items.clone();
        items.sort_by_key(|item| item.sort_order);

        info!("Starting task: {} ({} items)", task.name, items.len());

        let mut results = Vec::with_capacity(items.len());
        for item in &items {
            let result = match item.item_type {
                ItemType::Api => self.run_api_item(item.item_id, environment_id).await,
                ItemType::Flow => self.run_flow_item(item.item_id, environment_id).await,
            };
            if !result.success {
                warn!(
                    "Task item {} failed: {}",
                    result.item_name,
                    result.error_message.as_deref().unwrap_or("unknown error")
                );
            }
            results.push(result);
        }

        let success_count = results.iter().filter(|r| r.success).count();
        let failed_count = results.len() - success_count;
        let status = if failed_count == 0 {
            TaskStatus::Success
        } else {
            TaskStatus::Failed
        };

        info!(
            "Task finished: {} - {} passed, {} failed",
            task.name, success_count, failed_count
        );

        Ok(TaskExecution {
            task_id,
            environment_id,
            status,
            total_count: results.len(),
            success_count,
            failed_count,
            error_message: failure_summary(&results),
            execution_results: results,
            started_at,
            completed_at: Some(Utc::now()),
        })
    }

    /// Run several tasks concurrently, one tokio task each. Results
    /// come back in input order.
    pub async fn run_many(&self, runs: &[(RecordId, RecordId)]) -> Vec<Result<TaskExecution>> {
        let handles: Vec<_> = runs
            .iter()
            .map(|&(task_id, environment_id)| {
                let runner = self.clone();
                tokio::spawn(async move { runner.run(task_id, environment_id).await })
            })
            .collect();

        let mut executions = Vec::with_capacity(handles.len());
        for handle in handles {
            let execution = match handle.await {
                Ok(result) => result.map_err(anyhow::Error::from),
                Err(err) => Err(anyhow!("task execution panicked: {err}")),
            };
            executions.push(execution);
        }
        executions
    }

    async fn run_api_item(
        &self,
        endpoint_id: RecordId,
        environment_id: RecordId,
    ) -> TaskItemResult {
        let catalog = self.flows.catalog();
        let Some(endpoint) = catalog.endpoint(endpoint_id) else {
            return missing_item(ItemType::Api, endpoint_id, "endpoint not found");
        };

        let request = ApiExecuteRequest {
            environment_id,
            test_data_id: catalog.default_test_data(endpoint_id).map(|t| t.id),
            ..Default::default()
        };
        let item_name = display_name(&endpoint.name, &endpoint.path);

        let executor = self.flows.executor();
        match execute_endpoint(catalog.as_ref(), executor, endpoint_id, &request).await {
            Ok(record) => TaskItemResult {
                item_type: ItemType::Api,
                item_id: endpoint_id,
                item_name,
                success: record.success,
                status_code: record.response_status,
                error_message: record.error_message.clone(),
                execution_time: Some(record.response_time),
                details: serde_json::to_value(&record).ok(),
            },
            Err(err) => TaskItemResult {
                error_message: Some(err.to_string()),
                item_name,
                ..missing_item(ItemType::Api, endpoint_id, "")
            },
        }
    }

    async fn run_flow_item(&self, flow_id: RecordId, environment_id: RecordId) -> TaskItemResult {
        let Some(flow) = self.flows.catalog().flow(flow_id) else {
            return missing_item(ItemType::Flow, flow_id, "flow not found");
        };
        let flow = pin_environment(flow, environment_id);

        let request = FlowExecuteRequest {
            environment_id: Some(environment_id),
            ..Default::default()
        };

        match self.flows.run(&flow, &request).await {
            Ok(run) => {
                let failed_step = run.results.iter().find(|step| !step.success);
                TaskItemResult {
                    item_type: ItemType::Flow,
                    item_id: flow_id,
                    item_name: flow.name.clone(),
                    success: run.success,
                    status_code: run.results.last().and_then(|step| step.status),
                    error_message: failed_step.map(|step| {
                        format!(
                            "step {} failed: {}",
                            step.index,
                            step.error_message.as_deref().unwrap_or("unsuccessful response")
                        )
                    }),
                    execution_time: Some(run.results.iter().map(|step| step.response_time).sum()),
                    details: serde_json::to_value(&run).ok(),
                }
            }
            Err(err) => TaskItemResult {
                item_name: flow.name.clone(),
                error_message: Some(err.to_string()),
                ..missing_item(ItemType::Flow, flow_id, "")
            },
        }
    }
}

/// Point the flow and every step at the task's environment, overriding
/// whatever was saved on them.
fn pin_environment(mut flow: Flow, environment_id: RecordId) -> Flow {
    flow.environment_id = Some(environment_id);
    for step in &mut flow.steps {
        step.environment_id = None;
    }
    flow
}

fn missing_item(item_type: ItemType, item_id: RecordId, message: &str) -> TaskItemResult {
    TaskItemResult {
        item_type,
        item_id,
        item_name: format!("{} {item_id}", item_type_label(item_type)),
        success: false,
        status_code: None,
        error_message: Some(message.to_string()),
        execution_time: None,
        details: None,
    }
}

fn item_type_label(item_type: ItemType) -> &'static str {
    match item_type {
        ItemType::Api => "api",
        ItemType::Flow => "flow",
    }
}

fn display_name(name: &str, path: &str) -> String {
    if name.is_empty() {
        path.to_string()
    } else {
        name.to_string()
    }
}

/// `"N item(s) failed: a, b, c, d, e ..."`, or `None` when all passed.
fn failure_summary(results: &[TaskItemResult]) -> Option<String> {
    let failed: Vec<&str> = results
        .iter()
        .filter(|r| !r.success)
        .map(|r| r.item_name.as_str())
        .collect();
    if failed.is_empty() {
        return None;
    }

    let mut summary = format!(
        "{} item(s) failed: {}",
        failed.len(),
        failed
            .iter()
            .take(SUMMARY_NAMES)
            .copied()
            .collect::<Vec<_>>()
            .join(", ")
    );
    if failed.len() > SUMMARY_NAMES {
        summary.push_str(" ...");
    }
    Some(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, success: bool) -> TaskItemResult {
        TaskItemResult {
            item_name: name.to_string(),
            success,
            ..missing_item(ItemType::Api, 1, "")
        }
    }

    #[test]
    fn test_failure_summary_lists_first_five() {
        assert_eq!(failure_summary(&[item("a", true)]), None);

        let results: Vec<_> = ["a", "b", "c", "d", "e", "f"]
            .iter()
            .map(|name| item(name, false))
            .chain([item("ok", true)])
            .collect();
        assert_eq!(
            failure_summary(&results).unwrap(),
            "6 item(s) failed: a, b, c, d, e ..."
        );
        assert_eq!(
            failure_summary(&results[..2]).unwrap(),
            "2 item(s) failed: a, b"
        );
    }

    #[test]
    fn test_task_environment_overrides_saved_ones() {
        let flow: Flow = serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "saved",
            "environment_id": 1,
            "steps": [
                {"endpoint_id": 1, "environment_id": 3},
                {"endpoint_id": 2}
            ]
        }))
        .unwrap();

        let pinned = pin_environment(flow, 2);
        assert_eq!(pinned.environment_id, Some(2));
        assert!(pinned.steps.iter().all(|step| step.environment_id.is_none()));
    }

    #[test]
    fn test_missing_item_names() {
        let missing = missing_item(ItemType::Flow, 7, "flow not found");
        assert_eq!(missing.item_name, "flow 7");
        assert!(!missing.success);
        assert_eq!(display_name("", "/ping"), "/ping");
    }
}
