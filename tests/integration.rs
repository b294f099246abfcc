use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use apiflow::{
    execute_endpoint, ApiExecuteRequest, Catalog, ConfigError, DefaultFlowRunner, FailAction,
    FlowExecuteRequest, FlowRunResult, ItemType, StepExecutor, TaskRunner, TaskStatus,
    Workspace,
};
use axum::{
    extract::{Path, Query},
    http::{HeaderMap, Method, StatusCode},
    routing::{any, get, post},
    Json, Router,
};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;

struct TestServer {
    base_url: String,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

async fn echo(
    method: Method,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
    body: String,
) -> Json<Value> {
    let headers: Map<String, Value> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                Value::String(value.to_str().unwrap_or_default().to_string()),
            )
        })
        .collect();

    let mut params = Map::new();
    for (key, value) in query {
        match params.get_mut(&key) {
            Some(Value::Array(values)) => values.push(Value::String(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
            None => {
                params.insert(key, Value::String(value));
            }
        }
    }

    Json(json!({
        "method": method.as_str(),
        "headers": headers,
        "query": params,
        "body": serde_json::from_str::<Value>(&body).unwrap_or(Value::Null),
    }))
}

impl TestServer {
    async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let app = Router::new()
            .route(
                "/login",
                post(|Json(body): Json<Value>| async move {
                    let user = body["user"].as_str().unwrap_or("nobody").to_string();
                    Json(json!({
                        "token": format!("tok-{user}"),
                        "user": {"id": 7, "name": user}
                    }))
                }),
            )
            .route("/echo", any(echo))
            .route(
                "/items/:id",
                get(|Path(id): Path<String>| async move { Json(json!({ "id": id })) }),
            )
            .route(
                "/status/:code",
                get(|Path(code): Path<u16>| async move {
                    (
                        StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST),
                        Json(json!({ "code": code })),
                    )
                }),
            )
            .route("/text", get(|| async move { "Hello flow world" }));

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("test server error: {err}");
            }
        });
        let base_url = format!("http://{addr}");

        Self {
            base_url,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                let _ = handle.await;
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn load_workspace(base_url: &str) -> Workspace {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let path = manifest_dir.join("tests/fixtures/workspace.yaml");
    let content = fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("failed to read {path:?}: {e}"));
    let content = content.replace("__BASE_URL__", base_url);
    Workspace::from_yaml(&content).unwrap_or_else(|e| panic!("failed to parse workspace: {e:#}"))
}

fn executor() -> StepExecutor {
    StepExecutor::new().with_timeout(Duration::from_secs(5))
}

fn runner(base_url: &str) -> DefaultFlowRunner {
    DefaultFlowRunner::with_executor(Arc::new(load_workspace(base_url)), executor())
}

async fn run_flow(base_url: &str, flow_id: i64, request: FlowExecuteRequest) -> FlowRunResult {
    runner(base_url)
        .run_flow(flow_id, &request)
        .await
        .unwrap_or_else(|e| panic!("flow {flow_id} failed pre-flight: {e}"))
}

#[tokio::test]
async fn variables_flow_from_one_step_to_the_next() {
    let server = TestServer::spawn().await;

    let result = run_flow(&server.base_url, 1, FlowExecuteRequest::default()).await;

    assert!(result.success, "flow should succeed: {:?}", result.results);
    assert_eq!(result.results.len(), 2);
    assert_eq!(result.results[0].alias.as_deref(), Some("sign in"));
    assert_eq!(result.results[0].request_body, Some(json!({"user": "bob"})));
    assert_eq!(result.results[0].extracted["tok"], json!("tok-bob"));

    assert_eq!(
        result.context.get("API[1]"),
        Some(&json!({"token": "tok-bob", "user": {"id": 7, "name": "bob"}}))
    );
    assert_eq!(result.context.get("tok"), Some(&json!("tok-bob")));

    let echoed = result.context.get("API[2]").expect("second response recorded");
    assert_eq!(
        echoed["body"],
        json!({"token": "tok-bob", "uid": 7, "label": "7", "both": "id-7"})
    );
    assert_eq!(echoed["headers"]["x-token"], json!("tok-bob"));
    assert!(echoed["headers"].get("x-env").is_none());

    server.shutdown().await;
}

#[tokio::test]
async fn request_variables_override_flow_variables() {
    let server = TestServer::spawn().await;
    let request = FlowExecuteRequest {
        global_variables: json!({"user": "carol"}).as_object().cloned(),
        ..Default::default()
    };

    let result = run_flow(&server.base_url, 1, request).await;

    assert_eq!(result.context.get("tok"), Some(&json!("tok-carol")));
    server.shutdown().await;
}

#[tokio::test]
async fn stop_on_failure_skips_remaining_steps() {
    let server = TestServer::spawn().await;

    let result = run_flow(&server.base_url, 2, FlowExecuteRequest::default()).await;

    assert!(!result.success);
    assert_eq!(result.results.len(), 2);
    assert!(result.results[0].success);
    assert_eq!(result.results[1].status, Some(500));
    assert!(!result.results[1].success);
    assert!(result.context.get("API[3]").is_none());

    server.shutdown().await;
}

#[tokio::test]
async fn continue_on_failure_runs_every_step() {
    let server = TestServer::spawn().await;
    let request = FlowExecuteRequest {
        fail_action: Some(FailAction::Continue),
        ..Default::default()
    };

    let result = run_flow(&server.base_url, 2, request).await;

    assert!(!result.success);
    assert_eq!(result.results.len(), 3);
    assert!(result.results[2].success);
    assert_eq!(result.results[2].response_body.as_deref(), Some("Hello flow world"));
    // Non-JSON bodies are recorded as an empty mapping.
    assert_eq!(result.context.get("API[3]"), Some(&json!({})));

    server.shutdown().await;
}

#[tokio::test]
async fn disabled_steps_take_no_position() {
    let server = TestServer::spawn().await;

    let result = run_flow(&server.base_url, 3, FlowExecuteRequest::default()).await;

    assert!(result.success);
    assert_eq!(result.results.len(), 2);
    assert_eq!(result.results[1].index, 2);
    assert!(result.results[1].url.ends_with("/items/one"));
    assert_eq!(result.context.get("API[2]"), Some(&json!({"id": "one"})));
    assert!(result.context.get("API[3]").is_none());
    assert_eq!(result.context.get("first"), Some(&json!("one")));
    assert_eq!(result.context.get("second"), Some(&json!("one")));

    server.shutdown().await;
}

#[tokio::test]
async fn step_headers_replace_inherited_headers() {
    let server = TestServer::spawn().await;

    let result = run_flow(&server.base_url, 4, FlowExecuteRequest::default()).await;
    assert!(result.success, "{:?}", result.results);

    let inherited = result.context.get("API[1]").unwrap();
    assert_eq!(inherited["headers"]["x-env"], json!("local"));
    assert_eq!(inherited["headers"]["x-shared"], json!("td"));
    assert_eq!(inherited["query"], json!({"page": "1"}));

    let replaced = result.context.get("API[2]").unwrap();
    assert!(replaced["headers"].get("x-env").is_none());
    assert!(replaced["headers"].get("x-shared").is_none());
    assert_eq!(replaced["query"], json!({"tag": ["a", "b"]}));
    assert!(result.results[1].request_headers.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn transport_errors_are_recorded_not_raised() {
    let result = run_flow("http://127.0.0.1:9", 5, FlowExecuteRequest::default()).await;

    assert!(!result.success);
    assert_eq!(result.results.len(), 1);
    let step = &result.results[0];
    assert!(step.status.is_none());
    assert!(step.response_body.is_none());
    assert!(step.error_message.as_deref().is_some_and(|m| !m.is_empty()));
    assert_eq!(result.context.get("API[1]"), Some(&json!({})));
}

#[tokio::test]
async fn missing_environment_aborts_before_any_request() {
    let server = TestServer::spawn().await;
    let runner = runner(&server.base_url);

    let err = runner
        .run_flow(6, &FlowExecuteRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err, ConfigError::NoEnvironment { step: 1 });

    let request = FlowExecuteRequest {
        environment_id: Some(1),
        ..Default::default()
    };
    let result = runner.run_flow(6, &request).await.unwrap();
    assert!(result.success);

    server.shutdown().await;
}

#[tokio::test]
async fn assertions_decide_step_success() {
    let server = TestServer::spawn().await;

    let result = run_flow(&server.base_url, 7, FlowExecuteRequest::default()).await;

    assert_eq!(result.results.len(), 2, "saved fail action is continue");
    assert!(result.results[0].success, "{:?}", result.results[0].error_message);
    assert!(!result.results[1].success);

    let message = result.results[1].error_message.as_deref().unwrap();
    assert_eq!(message.lines().count(), 2, "{message}");
    assert!(message.contains("expected zzz, actual abc"));
    assert!(message.contains("expected 201, actual 200"));
    assert_eq!(result.results[1].request_assertions.len(), 2);
    // Extraction still runs when the step's assertions fail.
    assert_eq!(result.results[1].extracted["got"], json!("abc"));
    assert_eq!(result.context.get("got"), Some(&json!("abc")));

    server.shutdown().await;
}

#[tokio::test]
async fn single_endpoint_checks_expected_status() {
    let server = TestServer::spawn().await;
    let workspace = load_workspace(&server.base_url);
    let request = ApiExecuteRequest {
        environment_id: 1,
        test_data_id: Some(12),
        ..Default::default()
    };

    let record = execute_endpoint(&workspace, &executor(), 5, &request)
        .await
        .unwrap();

    assert_eq!(record.response_status, Some(201));
    assert!(record.request_url.ends_with("/status/201"));
    assert!(!record.success);
    assert_eq!(
        record.error_message.as_deref(),
        Some("expected status 200, actual 201")
    );

    server.shutdown().await;
}

#[tokio::test]
async fn single_endpoint_merges_and_renders_inputs() {
    let server = TestServer::spawn().await;
    let workspace = load_workspace(&server.base_url);
    let request: ApiExecuteRequest = serde_json::from_value(json!({
        "environment_id": 1,
        "headers": {"X-Shared": "request", "X-Who": "$who"},
        "query_params": {"q": "$who"},
        "body": {"name": "$who", "n": "NUM($n)"},
        "global_variables": {"who": "dana", "n": "4"},
        "assertions": [
            {"type": "json_path", "operator": "eq", "target": "body.name", "expected": "$who"}
        ]
    }))
    .unwrap();

    let record = execute_endpoint(&workspace, &executor(), 3, &request)
        .await
        .unwrap();

    assert!(record.success, "{:?}", record.error_message);
    assert_eq!(record.request_body, Some(json!({"name": "dana", "n": 4})));
    assert_eq!(record.request_headers["X-Env"], json!("local"));
    assert_eq!(record.request_headers["X-Shared"], json!("request"));

    let echoed: Value = serde_json::from_str(record.response_body.as_deref().unwrap()).unwrap();
    assert_eq!(echoed["headers"]["x-who"], json!("dana"));
    assert_eq!(echoed["query"], json!({"q": "dana"}));

    let missing = execute_endpoint(&workspace, &executor(), 404, &request).await;
    assert_eq!(missing.unwrap_err(), ConfigError::UnknownEndpoint(404));

    server.shutdown().await;
}

#[tokio::test]
async fn task_runs_items_in_order_and_records_missing_ones() {
    let server = TestServer::spawn().await;
    let tasks = TaskRunner::new(runner(&server.base_url));

    let execution = tasks.run(1, 1).await.unwrap();

    assert_eq!(execution.status, TaskStatus::Failed);
    assert_eq!(execution.total_count, 3);
    assert_eq!(execution.success_count, 2);
    assert_eq!(execution.failed_count, 1);

    let items = &execution.execution_results;
    assert_eq!(items[0].item_type, ItemType::Api);
    assert_eq!(items[0].item_name, "text");
    assert_eq!(items[0].status_code, Some(200));
    assert_eq!(items[1].item_name, "login chain");
    assert!(items[1].success);
    assert_eq!(items[2].error_message.as_deref(), Some("flow not found"));
    assert_eq!(
        execution.error_message.as_deref(),
        Some("1 item(s) failed: flow 99")
    );
    assert!(execution.completed_at.is_some());

    server.shutdown().await;
}

#[tokio::test]
async fn task_environment_overrides_the_flows_saved_environment() {
    let server = TestServer::spawn().await;
    let tasks = TaskRunner::new(runner(&server.base_url));

    // Flow 1 saves environment 1; the task runs it against environment 2.
    let execution = tasks.run(3, 2).await.unwrap();

    assert_eq!(execution.environment_id, 2);
    assert_eq!(execution.failed_count, 1);
    let details = execution.execution_results[0].details.as_ref().unwrap();
    let url = details["results"][0]["url"].as_str().unwrap();
    assert_eq!(url, "http://127.0.0.1:1/login");
    assert_eq!(details["results"].as_array().unwrap().len(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn tasks_run_concurrently() {
    let server = TestServer::spawn().await;
    let tasks = TaskRunner::new(runner(&server.base_url));

    let executions = tasks.run_many(&[(2, 1), (1, 1), (42, 1)]).await;

    assert_eq!(executions.len(), 3);
    let quick = executions[0].as_ref().unwrap();
    assert_eq!(quick.status, TaskStatus::Success);
    assert_eq!(quick.task_id, 2);
    assert_eq!(executions[1].as_ref().unwrap().total_count, 3);
    assert!(executions[2]
        .as_ref()
        .unwrap_err()
        .to_string()
        .contains("task 42 not found"));

    server.shutdown().await;
}

#[tokio::test]
async fn workspace_catalog_is_usable_as_trait_object() {
    let workspace = load_workspace("http://localhost");
    let catalog: Arc<dyn Catalog> = Arc::new(workspace);

    assert_eq!(catalog.flow(1).unwrap().steps.len(), 2);
    assert_eq!(catalog.default_test_data(5).unwrap().id, 12);
    assert!(catalog.task(4).is_none());
}
