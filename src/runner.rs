//! Flow orchestration

use crate::catalog::Catalog;
use crate::context::Context;
use crate::error::ConfigError;
use crate::executor::{ResolvedStep, StepExecutor};
use crate::model::*;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Flow runner trait
#[async_trait]
pub trait FlowRunner: Send + Sync {
    /// Execute a flow. Only pre-flight configuration problems are
    /// errors; step failures are reported in the result.
    async fn run(
        &self,
        flow: &Flow,
        request: &FlowExecuteRequest,
    ) -> Result<FlowRunResult, ConfigError>;
}

/// Default flow runner backed by a [`Catalog`].
#[derive(Clone)]
pub struct DefaultFlowRunner {
    catalog: Arc<dyn Catalog>,
    executor: StepExecutor,
}

impl DefaultFlowRunner {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self::with_executor(catalog, StepExecutor::new())
    }

    /// Create a runner with a custom step executor
    pub fn with_executor(catalog: Arc<dyn Catalog>, executor: StepExecutor) -> Self {
        Self { catalog, executor }
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    /// Look up flow `flow_id` and run it.
    pub async fn run_flow(
        &self,
        flow_id: RecordId,
        request: &FlowExecuteRequest,
    ) -> Result<FlowRunResult, ConfigError> {
        let flow = self
            .catalog
            .flow(flow_id)
            .ok_or(ConfigError::MissingFlow(flow_id))?;
        self.run(&flow, request).await
    }

    /// Seed a run's context: persisted variables, then the legacy bulk
    /// variables, then the request's variables.
    pub fn initial_context(flow: &Flow, request: &FlowExecuteRequest) -> Context {
        let mut ctx: Context = flow
            .variables
            .iter()
            .map(|var| (var.key.clone(), var.value.clone()))
            .collect();

        match &flow.global_variables {
            Some(Value::Object(vars)) => ctx.extend(vars.clone()),
            Some(Value::String(raw)) if !raw.trim().is_empty() => {
                match serde_json::from_str::<Value>(raw) {
                    Ok(Value::Object(vars)) => ctx.extend(vars),
                    Ok(_) => debug!("Ignoring non-object global_variables"),
                    Err(err) => debug!("Ignoring unparseable global_variables: {err}"),
                }
            }
            _ => {}
        }

        if let Some(vars) = &request.global_variables {
            ctx.extend(vars.clone());
        }
        ctx
    }

    /// Request override, then the flow's saved setting, then stop.
    pub fn resolve_fail_action(flow: &Flow, request: &FlowExecuteRequest) -> FailAction {
        request
            .fail_action
            .or(flow.execution_config.fail_action)
            .unwrap_or_default()
    }

    /// Resolve every enabled step's endpoint, environment and test data
    /// before anything is sent.
    pub fn plan(
        &self,
        flow: &Flow,
        request: &FlowExecuteRequest,
    ) -> Result<Vec<ResolvedStep>, ConfigError> {
        flow.enabled_steps()
            .enumerate()
            .map(|(position, step)| {
                let index = position + 1;

                let endpoint = self.catalog.endpoint(step.endpoint_id).ok_or(
                    ConfigError::MissingEndpoint {
                        step: index,
                        endpoint_id: step.endpoint_id,
                    },
                )?;

                let environment_id = step
                    .environment_id
                    .or(flow.environment_id)
                    .or(request.environment_id)
                    .ok_or(ConfigError::NoEnvironment { step: index })?;
                let environment = self.catalog.environment(environment_id).ok_or(
                    ConfigError::MissingEnvironment {
                        step: index,
                        environment_id,
                    },
                )?;

                let test_data = match step.test_data_id {
                    Some(id) => self.catalog.test_data(id),
                    None => self.catalog.default_test_data(endpoint.id),
                };

                Ok(ResolvedStep {
                    index,
                    step: step.clone(),
                    endpoint,
                    environment,
                    test_data,
                })
            })
            .collect()
    }
}

#[async_trait]
impl FlowRunner for DefaultFlowRunner {
    #[instrument(skip(self, flow, request), fields(flow = %flow.name))]
    async fn run(
        &self,
        flow: &Flow,
        request: &FlowExecuteRequest,
    ) -> Result<FlowRunResult, ConfigError> {
        let plan = self.plan(flow, request)?;
        let fail_action = Self::resolve_fail_action(flow, request);
        let mut ctx = Self::initial_context(flow, request);
        let mut results = Vec::with_capacity(plan.len());
        let mut success = true;

        info!(
            "Starting flow: {} ({} steps, fail action {:?})",
            flow.name,
            plan.len(),
            fail_action
        );
        debug!("Initial context: {:?}", ctx);

        for (position, step) in plan.iter().enumerate() {
            if position > 0 && request.delay > 0 {
                tokio::time::sleep(Duration::from_millis(request.delay)).await;
            }

            info!(
                "Running step {}/{}: {} {}",
                step.index,
                plan.len(),
                step.endpoint.method,
                step.step.alias.as_deref().unwrap_or(&step.endpoint.name)
            );

            let outcome = self.executor.execute(step, ctx).await;
            ctx = outcome.context;
            let failed = !outcome.result.success;
            results.push(outcome.result);

            if failed {
                success = false;
                if fail_action == FailAction::Stop {
                    warn!("Stopping flow after failed step {}", step.index);
                    break;
                }
            }
        }

        info!(
            "Flow finished: {} ({}/{} steps run) - Success: {}",
            flow.name,
            results.len(),
            plan.len(),
            success
        );

        Ok(FlowRunResult {
            success,
            results,
            context: ctx,
        })
    }
}
