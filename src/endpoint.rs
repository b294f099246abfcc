//! Single-endpoint execution outside of a flow.
//!
//! Input precedence differs from flow steps: headers and query
//! parameters are merged across environment, test data and request
//! rather than replaced, and every source is rendered.

use crate::assertion;
use crate::catalog::Catalog;
use crate::context::Context;
use crate::error::ConfigError;
use crate::executor::{self, PreparedRequest, StepExecutor};
use crate::model::*;
use crate::template;
use chrono::Utc;
use std::time::Instant;
use tracing::{error, info, instrument};

/// Recorded response bodies are cut to this many characters.
pub const MAX_RECORDED_BODY: usize = 10_000;

/// Execute `endpoint_id` once and produce an execution record.
#[instrument(skip(catalog, executor, request), fields(environment_id = request.environment_id))]
pub async fn execute_endpoint(
    catalog: &dyn Catalog,
    executor: &StepExecutor,
    endpoint_id: RecordId,
    request: &ApiExecuteRequest,
) -> Result<ExecutionRecord, ConfigError> {
    let endpoint = catalog
        .endpoint(endpoint_id)
        .ok_or(ConfigError::UnknownEndpoint(endpoint_id))?;
    let environment = catalog
        .environment(request.environment_id)
        .ok_or(ConfigError::UnknownEnvironment(request.environment_id))?;
    let test_data = request.test_data_id.and_then(|id| catalog.test_data(id));

    let ctx: Context = request
        .global_variables
        .clone()
        .map(Context::from)
        .unwrap_or_default();

    let prepared = prepare(&endpoint, &environment, test_data.as_ref(), request, &ctx);
    info!("Executing {} {}", prepared.method, prepared.url);

    let assertions = if request.assertions.is_empty() {
        test_data
            .as_ref()
            .map(|t| t.assertions.clone())
            .unwrap_or_default()
    } else {
        request.assertions.clone()
    };

    let started = Instant::now();
    let outcome = executor.send(&prepared).await;
    let response_time = executor::elapsed_ms(started);

    let mut record = ExecutionRecord {
        endpoint_id,
        test_data_id: request.test_data_id,
        environment_id: request.environment_id,
        request_url: prepared.url,
        request_method: prepared.method.as_str().to_string(),
        request_headers: prepared.headers,
        request_query_params: prepared.query_params.filter(|q| !q.is_empty()),
        request_path_params: prepared.path_params.filter(|p| !p.is_empty()),
        request_body: prepared.body,
        response_status: None,
        response_headers: None,
        response_body: None,
        response_time,
        success: false,
        error_message: None,
        executed_at: Utc::now(),
    };

    match outcome {
        Ok(response) => {
            let report =
                assertion::evaluate_all(&assertions, &response.view(response_time), &ctx);
            record.success = report.passed;

            let expected_status = test_data.as_ref().and_then(|t| t.expected_status);
            if let Some(expected) = expected_status.filter(|e| *e != response.status) {
                record.success = false;
                record.error_message =
                    Some(format!("expected status {expected}, actual {}", response.status));
            }
            if let Some(message) = report.error_message() {
                record.error_message = Some(message);
            }

            record.response_status = Some(response.status);
            record.response_headers = Some(response.headers);
            record.response_body = Some(truncate_body(response.text));
        }
        Err(err) => {
            error!("Request failed: {err:#}");
            record.error_message = Some(format!("{err:#}"));
        }
    }

    info!(
        "Endpoint {} finished in {} ms - Success: {}",
        endpoint.name, record.response_time, record.success
    );
    Ok(record)
}

fn prepare(
    endpoint: &Endpoint,
    environment: &Environment,
    test_data: Option<&TestData>,
    request: &ApiExecuteRequest,
    ctx: &Context,
) -> PreparedRequest {
    let path_params = test_data
        .and_then(|t| t.path_params.as_ref())
        .filter(|p| !p.is_empty())
        .or(request.path_params.as_ref())
        .map(|params| template::render_map(params, ctx));

    let mut headers = template::render_map(&environment.headers, ctx);
    for layer in [
        test_data.and_then(|t| t.headers.as_ref()),
        request.headers.as_ref(),
    ]
    .into_iter()
    .flatten()
    {
        headers.extend(template::render_map(layer, ctx));
    }

    let mut query = JsonMap::new();
    for layer in [
        test_data.and_then(|t| t.query_params.as_ref()),
        request.query_params.as_ref(),
    ]
    .into_iter()
    .flatten()
    {
        query.extend(template::render_map(layer, ctx));
    }

    let body = request
        .body
        .as_ref()
        .filter(|body| assertion::is_truthy(body))
        .or(test_data.and_then(|t| t.body.as_ref()))
        .map(|body| template::render(body, ctx));

    PreparedRequest {
        method: endpoint.method,
        url: executor::build_url(&environment.base_url, &endpoint.path, path_params.as_ref()),
        headers,
        path_params,
        query_params: Some(query),
        body,
    }
}

/// Cut `text` to [`MAX_RECORDED_BODY`] characters.
pub fn truncate_body(text: String) -> String {
    match text.char_indices().nth(MAX_RECORDED_BODY) {
        Some((cut, _)) => format!("{}... (truncated)", &text[..cut]),
        None => text,
    }
}
