//! Data model for flows, catalog records, and execution results.
//!
//! Field names follow the JSON surface the API layer and the task
//! scheduler consume, so serialized results are stable across
//! releases.

use crate::context::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Identifier of a catalog record (endpoint, environment, flow, ...).
pub type RecordId = i64;

/// JSON object used for headers, path parameters and query parameters.
pub type JsonMap = Map<String, Value>;

// ── Catalog records ─────────────────────────────────────

/// An endpoint from the API catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: RecordId,
    #[serde(default)]
    pub name: String,
    pub method: HttpMethod,
    /// Path template; `{name}` placeholders are filled from path
    /// parameters.
    pub path: String,
}

/// A target environment: base URL plus default headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: RecordId,
    #[serde(default)]
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub headers: JsonMap,
}

/// Saved default parameter values for an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestData {
    pub id: RecordId,
    pub endpoint_id: RecordId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path_params: Option<JsonMap>,
    #[serde(default)]
    pub query_params: Option<JsonMap>,
    #[serde(default)]
    pub headers: Option<JsonMap>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Status code checked by single-endpoint execution.
    #[serde(default)]
    pub expected_status: Option<u16>,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

/// HTTP method of an endpoint. Accepted in any case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(format!("unsupported HTTP method '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for HttpMethod {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ── Flow definition ─────────────────────────────────────

/// A saved, ordered sequence of HTTP-request steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default)]
    pub id: RecordId,
    #[serde(default)]
    pub project_id: Option<RecordId>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Default environment for steps without their own.
    #[serde(default)]
    pub environment_id: Option<RecordId>,
    /// Legacy bulk variables: a mapping, or a JSON-encoded mapping.
    #[serde(default)]
    pub global_variables: Option<Value>,
    /// Persisted key/value variables.
    #[serde(default)]
    pub variables: Vec<FlowVariable>,
    #[serde(default)]
    pub steps: Vec<FlowStep>,
    #[serde(default, alias = "executionConfig")]
    pub execution_config: ExecutionConfig,
}

impl Flow {
    /// Steps that take part in a run, in order. Their position in
    /// this list (1-based) is the `API[n]` index.
    pub fn enabled_steps(&self) -> impl Iterator<Item = &FlowStep> {
        self.steps.iter().filter(|step| step.is_enabled())
    }
}

/// A persisted flow variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowVariable {
    pub key: String,
    pub value: Value,
}

/// Run-level execution settings saved with a flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default, alias = "failAction")]
    pub fail_action: Option<FailAction>,
}

/// What a run does after a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailAction {
    #[default]
    Stop,
    Continue,
}

/// One HTTP call definition within a flow.
///
/// The parameter fields distinguish "absent" (`None`, inherit from
/// test data) from an explicit empty mapping (`Some({})`, send
/// nothing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStep {
    pub endpoint_id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_data_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_params: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_params: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
    #[serde(default)]
    pub extracts: Vec<ExtractRule>,
    /// Missing counts as enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl FlowStep {
    pub fn is_enabled(&self) -> bool {
        self.enabled != Some(false)
    }
}

/// Copies a value out of a response into a named context variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractRule {
    pub name: String,
    #[serde(default)]
    pub path: String,
    /// 1-based step to read from; `None` or `0` is the current step.
    #[serde(default)]
    pub step_index: Option<usize>,
}

/// A declarative pass/fail check against a step's response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    #[serde(rename = "type", default)]
    pub kind: Option<AssertionKind>,
    #[serde(default)]
    pub operator: Option<Operator>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub expected: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionKind {
    StatusCode,
    JsonPath,
    ResponseTime,
    Contains,
    ResponseBody,
    ResponseHeader,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    NotContains,
    Exists,
    NotExists,
    IsEmpty,
    IsNotEmpty,
    Regex,
    #[serde(other)]
    Unsupported,
}

// ── Execution surfaces ──────────────────────────────────

/// Parameters of a flow run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowExecuteRequest {
    /// Used only by steps for which neither the step nor the flow
    /// names an environment.
    #[serde(default)]
    pub environment_id: Option<RecordId>,
    /// Highest-precedence variables.
    #[serde(default)]
    pub global_variables: Option<JsonMap>,
    #[serde(default, alias = "failAction")]
    pub fail_action: Option<FailAction>,
    /// Pause between consecutive steps, in milliseconds.
    #[serde(default)]
    pub delay: u64,
}

/// Outcome of a flow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRunResult {
    pub success: bool,
    pub results: Vec<StepResult>,
    pub context: Context,
}

/// Snapshot of one executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub endpoint_id: RecordId,
    pub endpoint_name: String,
    pub url: String,
    pub method: String,
    pub success: bool,
    pub status: Option<u16>,
    /// Milliseconds.
    pub response_time: u64,
    pub error_message: Option<String>,
    pub alias: Option<String>,
    pub extracted: JsonMap,
    pub request_headers: JsonMap,
    pub request_path_params: Option<JsonMap>,
    pub request_query_params: Option<JsonMap>,
    pub request_body: Option<Value>,
    pub request_assertions: Vec<Assertion>,
    pub response_headers: Option<HashMap<String, String>>,
    pub response_body: Option<String>,
}

/// Parameters of a single-endpoint execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiExecuteRequest {
    pub environment_id: RecordId,
    #[serde(default)]
    pub test_data_id: Option<RecordId>,
    #[serde(default)]
    pub path_params: Option<JsonMap>,
    #[serde(default)]
    pub query_params: Option<JsonMap>,
    #[serde(default)]
    pub headers: Option<JsonMap>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Overrides the test data's assertions when non-empty.
    #[serde(default)]
    pub assertions: Vec<Assertion>,
    #[serde(default)]
    pub global_variables: Option<JsonMap>,
}

/// Persisted record of a single-endpoint execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub endpoint_id: RecordId,
    pub test_data_id: Option<RecordId>,
    pub environment_id: RecordId,
    pub request_url: String,
    pub request_method: String,
    pub request_headers: JsonMap,
    pub request_query_params: Option<JsonMap>,
    pub request_path_params: Option<JsonMap>,
    pub request_body: Option<Value>,
    pub response_status: Option<u16>,
    pub response_headers: Option<HashMap<String, String>>,
    pub response_body: Option<String>,
    pub response_time: u64,
    pub success: bool,
    pub error_message: Option<String>,
    pub executed_at: DateTime<Utc>,
}

// ── Test tasks ──────────────────────────────────────────

/// A named batch of endpoints and flows run against one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestTask {
    pub id: RecordId,
    pub name: String,
    #[serde(default)]
    pub items: Vec<TaskItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskItem {
    pub item_type: ItemType,
    pub item_id: RecordId,
    #[serde(default)]
    pub sort_order: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Api,
    Flow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Success,
    Failed,
}

/// Result of one task item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskItemResult {
    pub item_type: ItemType,
    pub item_id: RecordId,
    pub item_name: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    /// Milliseconds.
    pub execution_time: Option<u64>,
    pub details: Option<Value>,
}

/// Result of a whole task run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task_id: RecordId,
    pub environment_id: RecordId,
    pub status: TaskStatus,
    pub total_count: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub execution_results: Vec<TaskItemResult>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
