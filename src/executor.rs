//! Step execution: input resolution, one outbound HTTP call, assertion
//! evaluation and context update.

use crate::assertion::{self, ResponseView};
use crate::context::Context;
use crate::model::*;
use crate::path;
use crate::template;
use anyhow::{Context as _, Result};
use reqwest::{Client, Method};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};

/// Per-call timeout used unless overridden.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A step with its collaborators looked up.
#[derive(Debug, Clone)]
pub struct ResolvedStep {
    /// 1-based position among enabled steps.
    pub index: usize,
    pub step: FlowStep,
    pub endpoint: Endpoint,
    pub environment: Environment,
    pub test_data: Option<TestData>,
}

/// Fully resolved request inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: JsonMap,
    pub path_params: Option<JsonMap>,
    pub query_params: Option<JsonMap>,
    pub body: Option<Value>,
}

/// What came back from the server.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub text: String,
    /// `None` when the body is empty or not JSON.
    pub json: Option<Value>,
}

impl CapturedResponse {
    pub fn view(&self, response_time: u64) -> ResponseView<'_> {
        ResponseView {
            status: self.status,
            response_time,
            json: self.json.as_ref(),
            text: &self.text,
        }
    }
}

/// Result of one step plus the context to hand to the next one.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub result: StepResult,
    pub context: Context,
}

/// Executes single steps over a shared HTTP client.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    client: Client,
    timeout: Duration,
}

impl StepExecutor {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    /// Create an executor with a custom client
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one step against `ctx` and return its result together with
    /// the updated context. Transport failures are reported in the
    /// result, never as an error.
    #[instrument(skip(self, plan, ctx), fields(index = plan.index, endpoint = %plan.endpoint.name))]
    pub async fn execute(&self, plan: &ResolvedStep, mut ctx: Context) -> StepOutcome {
        let request = prepare(plan, &ctx);
        debug!(
            "Resolved request {} {} headers={:?} query={:?} body={:?}",
            request.method, request.url, request.headers, request.query_params, request.body
        );

        let started = Instant::now();
        let outcome = self.send(&request).await;
        let response_time = elapsed_ms(started);

        let mut result = StepResult {
            index: plan.index,
            endpoint_id: plan.endpoint.id,
            endpoint_name: plan.endpoint.name.clone(),
            url: request.url,
            method: plan.endpoint.method.as_str().to_string(),
            success: false,
            status: None,
            response_time,
            error_message: None,
            alias: plan.step.alias.clone(),
            extracted: JsonMap::new(),
            request_headers: request.headers,
            request_path_params: request.path_params,
            request_query_params: request.query_params,
            request_body: request.body,
            request_assertions: plan.step.assertions.clone(),
            response_headers: None,
            response_body: None,
        };

        let mut body = None;
        match outcome {
            Ok(response) => {
                let view = response.view(response_time);
                let report = assertion::evaluate_all(&plan.step.assertions, &view, &ctx);
                result.success = report.passed;
                result.error_message = report.error_message();
                result.status = Some(response.status);
                result.response_headers = Some(response.headers);
                result.response_body = Some(response.text);
                body = response.json;
            }
            Err(err) => {
                error!("Request failed: {err:#}");
                result.error_message = Some(format!("{err:#}"));
            }
        }

        let stored = body
            .filter(assertion::is_truthy)
            .unwrap_or_else(|| Value::Object(JsonMap::new()));
        result.extracted = apply_extracts(&plan.step.extracts, plan.index, &stored, &mut ctx);
        ctx.record_response(plan.index, stored);

        StepOutcome {
            result,
            context: ctx,
        }
    }

    /// Issue `request` and capture the response.
    #[instrument(skip(self, request), fields(url = %request.url, method = %request.method))]
    pub(crate) async fn send(&self, request: &PreparedRequest) -> Result<CapturedResponse> {
        let mut builder = self
            .client
            .request(convert_method(request.method), &request.url)
            .timeout(self.timeout);

        for (name, value) in &request.headers {
            if value.is_null() {
                continue;
            }
            builder = builder.header(name.as_str(), template::stringify(value));
        }

        if let Some(query) = &request.query_params {
            let pairs = query_pairs(query);
            if !pairs.is_empty() {
                builder = builder.query(&pairs);
            }
        }

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("{} {} failed", request.method, request.url))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let text = response
            .text()
            .await
            .with_context(|| format!("reading response body from {}", request.url))?;

        let json = if text.trim().is_empty() {
            None
        } else {
            match serde_json::from_str(&text) {
                Ok(value) => Some(value),
                Err(err) => {
                    debug!("Response body is not JSON: {err}");
                    None
                }
            }
        };

        Ok(CapturedResponse {
            status,
            headers,
            text,
            json,
        })
    }
}

impl Default for StepExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a step's request inputs against `ctx`.
///
/// Step-level fields win when present, even as `{}`, and are rendered.
/// Otherwise test-data defaults apply as stored. Step headers replace
/// the environment and test-data headers wholesale.
pub fn prepare(plan: &ResolvedStep, ctx: &Context) -> PreparedRequest {
    let step = &plan.step;
    let test_data = plan.test_data.as_ref();

    let headers = match &step.headers {
        Some(headers) => template::render_map(headers, ctx),
        None => {
            let mut merged = plan.environment.headers.clone();
            if let Some(defaults) = test_data.and_then(|t| t.headers.as_ref()) {
                merged.extend(defaults.clone());
            }
            merged
        }
    };

    let path_params = step
        .path_params
        .as_ref()
        .map(|params| template::render_map(params, ctx))
        .or_else(|| test_data.and_then(|t| t.path_params.clone()));
    let query_params = step
        .query_params
        .as_ref()
        .map(|params| template::render_map(params, ctx))
        .or_else(|| test_data.and_then(|t| t.query_params.clone()));
    let body = step
        .body
        .as_ref()
        .map(|body| template::render(body, ctx))
        .or_else(|| test_data.and_then(|t| t.body.clone()));

    PreparedRequest {
        method: plan.endpoint.method,
        url: build_url(
            &plan.environment.base_url,
            &plan.endpoint.path,
            path_params.as_ref(),
        ),
        headers,
        path_params,
        query_params,
        body,
    }
}

/// Join base URL and endpoint path, then fill `{name}` placeholders.
pub fn build_url(base_url: &str, path: &str, path_params: Option<&JsonMap>) -> String {
    let mut url = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    if let Some(params) = path_params {
        for (key, value) in params {
            url = url.replace(&format!("{{{key}}}"), &template::stringify(value));
        }
    }
    url
}

/// Apply extraction rules after step `index` produced `current`.
///
/// A rule without `step_index`, with `0`, or with the current index
/// reads `current`. An earlier index reads that step's recorded
/// response. Later indexes are skipped.
fn apply_extracts(
    rules: &[ExtractRule],
    index: usize,
    current: &Value,
    ctx: &mut Context,
) -> JsonMap {
    let mut extracted = JsonMap::new();

    for rule in rules {
        if rule.name.is_empty() {
            continue;
        }

        let value = match rule.step_index {
            None | Some(0) => path::lookup(current, &rule.path),
            Some(k) if k == index => path::lookup(current, &rule.path),
            Some(k) if k < index => match ctx.response(k) {
                Some(response) => path::lookup(response, &rule.path),
                None => {
                    warn!("Extract '{}': no response recorded for step {k}", rule.name);
                    continue;
                }
            },
            Some(k) => {
                warn!(
                    "Extract '{}': step {k} has not run yet (current step {index})",
                    rule.name
                );
                continue;
            }
        };

        debug!("Extracted {} = {}", rule.name, value);
        ctx.insert(rule.name.clone(), value.clone());
        extracted.insert(rule.name.clone(), value);
    }

    extracted
}

/// Encode query parameters. Arrays repeat the key, nulls are dropped.
fn query_pairs(query: &JsonMap) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (key, value) in query {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                for item in items.iter().filter(|item| !item.is_null()) {
                    pairs.push((key.clone(), template::stringify(item)));
                }
            }
            other => pairs.push((key.clone(), template::stringify(other))),
        }
    }
    pairs
}

fn convert_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Delete => Method::DELETE,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Head => Method::HEAD,
        HttpMethod::Options => Method::OPTIONS,
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(step: Value, test_data: Option<Value>) -> ResolvedStep {
        ResolvedStep {
            index: 1,
            step: serde_json::from_value(step).unwrap(),
            endpoint: serde_json::from_value(json!({
                "id": 1, "name": "get user", "method": "get", "path": "/users/{id}/posts/{post}"
            }))
            .unwrap(),
            environment: serde_json::from_value(json!({
                "id": 1,
                "base_url": "http://api.test/",
                "headers": {"X-Env": "env", "X-Shared": "env"}
            }))
            .unwrap(),
            test_data: test_data.map(|t| serde_json::from_value(t).unwrap()),
        }
    }

    fn defaults() -> Value {
        json!({
            "id": 9, "endpoint_id": 1,
            "headers": {"X-Shared": "td", "X-Td": "td"},
            "path_params": {"id": "$uid", "post": 2},
            "query_params": {"page": 1},
            "body": {"from": "test data"}
        })
    }

    #[test]
    fn test_headers_merge_without_step_override() {
        let request = prepare(&plan(json!({"endpoint_id": 1}), Some(defaults())), &Context::new());
        assert_eq!(
            Value::Object(request.headers),
            json!({"X-Env": "env", "X-Shared": "td", "X-Td": "td"})
        );
    }

    #[test]
    fn test_step_headers_replace_inherited_headers() {
        let ctx: Context = [("tok".to_string(), json!("abc"))].into_iter().collect();
        let step = json!({"endpoint_id": 1, "headers": {"Authorization": "Bearer {{tok}}"}});
        let request = prepare(&plan(step, Some(defaults())), &ctx);
        assert_eq!(
            Value::Object(request.headers),
            json!({"Authorization": "Bearer \"abc\""})
        );

        let step = json!({"endpoint_id": 1, "headers": {}});
        let request = prepare(&plan(step, Some(defaults())), &ctx);
        assert!(request.headers.is_empty());
    }

    #[test]
    fn test_test_data_defaults_are_not_rendered() {
        let ctx: Context = [("uid".to_string(), json!(5))].into_iter().collect();
        let request = prepare(&plan(json!({"endpoint_id": 1}), Some(defaults())), &ctx);
        assert_eq!(request.url, "http://api.test/users/$uid/posts/2");
        assert_eq!(request.body, Some(json!({"from": "test data"})));
        assert_eq!(request.query_params, Some(json!({"page": 1}).as_object().unwrap().clone()));
    }

    #[test]
    fn test_step_params_win_and_are_rendered() {
        let ctx: Context = [("uid".to_string(), json!(5))].into_iter().collect();
        let request = prepare(
            &plan(
                json!({
                    "endpoint_id": 1,
                    "path_params": {"id": "$uid", "post": "p"},
                    "query_params": {},
                    "body": {"user": "$uid"}
                }),
                Some(defaults()),
            ),
            &ctx,
        );
        assert_eq!(request.url, "http://api.test/users/5/posts/p");
        assert_eq!(request.query_params, Some(JsonMap::new()));
        assert_eq!(request.body, Some(json!({"user": 5})));
    }

    #[test]
    fn test_build_url_slashes() {
        assert_eq!(build_url("http://h/", "/a", None), "http://h/a");
        assert_eq!(build_url("http://h", "a", None), "http://h/a");
    }

    #[test]
    fn test_query_pairs_expand_arrays() {
        let query = json!({"tag": ["a", null, 2], "skip": null, "q": true});
        let pairs = query_pairs(query.as_object().unwrap());
        assert_eq!(
            pairs,
            vec![
                ("q".to_string(), "true".to_string()),
                ("tag".to_string(), "a".to_string()),
                ("tag".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn test_extracts_honour_step_index() {
        let mut ctx = Context::new();
        ctx.record_response(1, json!({"token": "first"}));
        let current = json!({"token": "second"});
        let rules: Vec<ExtractRule> = serde_json::from_value(json!([
            {"name": "now", "path": "token"},
            {"name": "zero", "path": "token", "step_index": 0},
            {"name": "self", "path": "token", "step_index": 2},
            {"name": "earlier", "path": "token", "step_index": 1},
            {"name": "later", "path": "token", "step_index": 3},
            {"name": "miss", "path": "nope"}
        ]))
        .unwrap();

        let extracted = apply_extracts(&rules, 2, &current, &mut ctx);
        assert_eq!(
            Value::Object(extracted),
            json!({
                "now": "second",
                "zero": "second",
                "self": "second",
                "earlier": "first",
                "miss": null
            })
        );
        assert_eq!(ctx.get("earlier"), Some(&json!("first")));
        assert!(!ctx.contains_key("later"));
    }
}
