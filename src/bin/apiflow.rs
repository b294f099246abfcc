//! apiflow CLI - run flows, tasks and single endpoints from a workspace.

use anyhow::{anyhow, Context, Result};
use apiflow::export::{export_name, FlowExport};
use apiflow::{
    execute_endpoint, ApiExecuteRequest, Catalog, DefaultFlowRunner, ExecutionRecord, FailAction,
    FlowExecuteRequest, FlowRunResult, FlowRunner, JsonMap, RecordId, StepExecutor, TaskExecution,
    TaskRunner, WorkspaceLoader,
};
use chrono::{Local, Utc};
use clap::{ArgGroup, Parser, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Run API flows, test tasks and single endpoints defined in a workspace.
#[derive(Parser, Debug)]
#[command(name = "apiflow", version, about)]
#[command(group(ArgGroup::new("target").required(true).args(["flow", "task", "endpoint"])))]
struct Cli {
    /// Workspace file or directory.
    #[arg(short = 'w', long = "workspace", env = "APIFLOW_WORKSPACE")]
    workspace: PathBuf,

    /// Flow id to run (or export).
    #[arg(long = "flow")]
    flow: Option<RecordId>,

    /// Test task id to run.
    #[arg(long = "task")]
    task: Option<RecordId>,

    /// Endpoint id to execute once.
    #[arg(long = "endpoint")]
    endpoint: Option<RecordId>,

    /// Environment id. Required for tasks and endpoints; a fallback for flows.
    #[arg(short = 'e', long = "env")]
    environment: Option<RecordId>,

    /// Variable override as key=value. Values are parsed as JSON when possible.
    #[arg(long = "var", value_parser = parse_var)]
    vars: Vec<(String, Value)>,

    /// What to do after a failed step.
    #[arg(long = "fail-action")]
    fail_action: Option<FailActionArg>,

    /// Pause between flow steps in milliseconds.
    #[arg(long = "delay", default_value_t = 0)]
    delay: u64,

    /// Test data id for single-endpoint execution.
    #[arg(long = "test-data")]
    test_data: Option<RecordId>,

    /// Timeout in seconds per request.
    #[arg(short = 't', long = "timeout", default_value_t = 30)]
    timeout: u64,

    /// Directory to save report files.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,

    /// Write the flow's export document to this file instead of running it.
    #[arg(long = "export", requires = "flow")]
    export: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum FailActionArg {
    Stop,
    Continue,
}

impl From<FailActionArg> for FailAction {
    fn from(arg: FailActionArg) -> Self {
        match arg {
            FailActionArg::Stop => FailAction::Stop,
            FailActionArg::Continue => FailAction::Continue,
        }
    }
}

fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty variable name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .try_init();
}

fn status_label(success: bool) -> &'static str {
    if success {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...(truncated)", &text[..cut]),
        None => text.to_string(),
    }
}

fn print_flow_result(name: &str, result: &FlowRunResult, verbose: bool) {
    info!("{} flow: {}", status_label(result.success), name);

    for step in &result.results {
        let mark = if step.success {
            "\x1b[32m✓\x1b[0m"
        } else {
            "\x1b[31m✗\x1b[0m"
        };
        let label = step.alias.as_deref().unwrap_or(&step.endpoint_name);
        let status = step
            .status
            .map_or_else(|| "-".to_string(), |s| s.to_string());
        info!(
            "  {}. {} {} {} [{}] ({} ms)",
            step.index, mark, step.method, label, status, step.response_time
        );

        if let Some(message) = &step.error_message {
            for line in message.lines() {
                error!("     \x1b[31mError: {}\x1b[0m", line);
            }
        }

        if verbose {
            debug!("     Request: {} {}", step.method, step.url);
            if let Some(body) = &step.request_body {
                debug!("     Request body: {}", truncate(&body.to_string(), 500));
            }
            if !step.extracted.is_empty() {
                let extracted = Value::Object(step.extracted.clone());
                debug!("     Extracted: {}", extracted);
            }
            if let Some(body) = &step.response_body {
                debug!("     Response body: {}", truncate(body, 500));
            }
        }
    }
}

fn print_task_result(name: &str, execution: &TaskExecution) {
    info!(
        "{} task: {} ({} passed, {} failed)",
        status_label(execution.failed_count == 0),
        name,
        execution.success_count,
        execution.failed_count
    );
    for item in &execution.execution_results {
        info!(
            "  {} {:?} {} ({} ms)",
            status_label(item.success),
            item.item_type,
            item.item_name,
            item.execution_time.unwrap_or_default()
        );
        if let Some(message) = &item.error_message {
            error!("     \x1b[31mError: {}\x1b[0m", message);
        }
    }
}

fn print_endpoint_result(record: &ExecutionRecord, verbose: bool) {
    let status = record
        .response_status
        .map_or_else(|| "-".to_string(), |s| s.to_string());
    info!(
        "{} {} {} [{}] ({} ms)",
        status_label(record.success),
        record.request_method,
        record.request_url,
        status,
        record.response_time
    );
    if let Some(message) = &record.error_message {
        error!("     \x1b[31mError: {}\x1b[0m", message);
    }
    if verbose {
        if let Some(body) = &record.response_body {
            debug!("     Response body: {}", truncate(body, 500));
        }
    }
}

/// Write `value` to `report_dir`. `text` is the plain-text rendition.
fn save_report<T: Serialize>(
    name: &str,
    value: &T,
    text: String,
    report_dir: &Path,
    format: ReportFormat,
) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)?;
    }

    let timestamp = Utc::now().timestamp();
    let sanitized_name = name.replace([' ', '/'], "_");

    let (filename, content) = match format {
        ReportFormat::Json => (
            format!("{sanitized_name}-{timestamp}.json"),
            serde_json::to_string_pretty(value)?,
        ),
        ReportFormat::Yaml => (
            format!("{sanitized_name}-{timestamp}.yaml"),
            serde_yaml::to_string(value)?,
        ),
        ReportFormat::Text => (format!("{sanitized_name}-{timestamp}.txt"), text),
    };

    let file_path = report_dir.join(filename);
    let mut file = File::create(&file_path)?;
    file.write_all(content.as_bytes())?;

    Ok(file_path)
}

fn flow_report_text(name: &str, result: &FlowRunResult) -> String {
    let mut content = String::new();
    content.push_str(&format!("Flow: {name}\n"));
    content.push_str(&format!(
        "Status: {}\n\nSteps:\n",
        if result.success { "PASS" } else { "FAIL" }
    ));
    for step in &result.results {
        content.push_str(&format!(
            "  {}. {} {} ({})\n",
            step.index,
            step.method,
            step.url,
            if step.success { "PASS" } else { "FAIL" }
        ));
        if let Some(error) = &step.error_message {
            content.push_str(&format!("     Error: {error}\n"));
        }
        content.push_str(&format!("     Duration: {} ms\n", step.response_time));
    }
    content
}

fn task_report_text(name: &str, execution: &TaskExecution) -> String {
    let mut content = format!(
        "Task: {name}\nStatus: {:?}\nPassed: {}\nFailed: {}\n\nItems:\n",
        execution.status, execution.success_count, execution.failed_count
    );
    for item in &execution.execution_results {
        content.push_str(&format!(
            "  {:?} {} ({})\n",
            item.item_type,
            item.item_name,
            if item.success { "PASS" } else { "FAIL" }
        ));
        if let Some(error) = &item.error_message {
            content.push_str(&format!("     Error: {error}\n"));
        }
    }
    content
}

fn endpoint_report_text(record: &ExecutionRecord) -> String {
    let mut content = format!(
        "Endpoint: {} {}\nStatus: {}\nResponse status: {}\nDuration: {} ms\n",
        record.request_method,
        record.request_url,
        if record.success { "PASS" } else { "FAIL" },
        record
            .response_status
            .map_or_else(|| "-".to_string(), |s| s.to_string()),
        record.response_time
    );
    if let Some(error) = &record.error_message {
        content.push_str(&format!("Error: {error}\n"));
    }
    content
}

fn write_report<T: Serialize>(args: &Cli, name: &str, value: &T, text: String) {
    if let Some(dir) = &args.report_dir {
        match save_report(name, value, text, dir, args.report_format) {
            Ok(path) => info!("Report saved: {}", path.display()),
            Err(e) => error!("Failed to save report: {}", e),
        }
    }
}

fn export_flow(catalog: &dyn Catalog, flow_id: RecordId, target: &Path) -> Result<()> {
    let flow = catalog
        .flow(flow_id)
        .ok_or_else(|| anyhow!("Flow {flow_id} not found"))?;
    let now = Local::now();
    let document = FlowExport::from_flow(&flow, now).to_json()?;

    let target = if target.is_dir() {
        target.join(format!("{}.json", export_name(&flow, now)))
    } else {
        target.to_path_buf()
    };
    fs::write(&target, document)
        .context(format!("Failed to write export: {}", target.display()))?;
    info!("Exported flow '{}' to {}", flow.name, target.display());
    Ok(())
}

async fn run(args: &Cli) -> Result<bool> {
    let workspace = WorkspaceLoader::new()
        .load(&args.workspace)
        .context(format!("Failed to load workspace: {}", args.workspace.display()))?;
    for warning in workspace.validate() {
        warn!("Workspace: {}", warning);
    }
    let catalog: Arc<dyn Catalog> = Arc::new(workspace);

    let executor = StepExecutor::new().with_timeout(Duration::from_secs(args.timeout));
    let flows = DefaultFlowRunner::with_executor(catalog.clone(), executor.clone());
    let vars: JsonMap = args.vars.iter().cloned().collect();

    if let Some(flow_id) = args.flow {
        if let Some(target) = &args.export {
            export_flow(catalog.as_ref(), flow_id, target)?;
            return Ok(true);
        }

        let flow = catalog
            .flow(flow_id)
            .ok_or_else(|| anyhow!("Flow {flow_id} not found"))?;
        let request = FlowExecuteRequest {
            environment_id: args.environment,
            global_variables: (!vars.is_empty()).then_some(vars),
            fail_action: args.fail_action.map(FailAction::from),
            delay: args.delay,
        };

        let result = flows.run(&flow, &request).await?;
        print_flow_result(&flow.name, &result, args.verbose);
        write_report(args, &flow.name, &result, flow_report_text(&flow.name, &result));
        return Ok(result.success);
    }

    let environment_id = args
        .environment
        .ok_or_else(|| anyhow!("--env is required for tasks and endpoints"))?;

    if let Some(task_id) = args.task {
        let execution = TaskRunner::new(flows).run(task_id, environment_id).await?;
        let name = catalog
            .task(task_id)
            .map(|t| t.name)
            .unwrap_or_else(|| format!("task {task_id}"));
        print_task_result(&name, &execution);
        write_report(args, &name, &execution, task_report_text(&name, &execution));
        return Ok(execution.failed_count == 0);
    }

    let endpoint_id = args
        .endpoint
        .ok_or_else(|| anyhow!("one of --flow, --task or --endpoint is required"))?;
    let request = ApiExecuteRequest {
        environment_id,
        test_data_id: args.test_data,
        global_variables: (!vars.is_empty()).then_some(vars),
        ..Default::default()
    };
    let record = execute_endpoint(catalog.as_ref(), &executor, endpoint_id, &request).await?;
    print_endpoint_result(&record, args.verbose);
    write_report(
        args,
        &format!("endpoint-{endpoint_id}"),
        &record,
        endpoint_report_text(&record),
    );
    Ok(record.success)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    let success = run(&args).await?;
    if !success {
        exit(1);
    }

    Ok(())
}
