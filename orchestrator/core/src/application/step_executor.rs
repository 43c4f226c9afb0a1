// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Step Executor (Tier3)
//!
//! Runs exactly one leaf step:
//!
//! 1. select the strategy for the step
//! 2. estimate its cost; an estimate above the allocation fails the step
//!    with `BudgetExceeded` before anything runs
//! 3. validate the inputs against the step's declared inputs
//! 4. run the strategy, bounded by the allocation timeout; `cancel_step`
//!    trips a per-step token the strategy checks between atomic calls, so an
//!    in-flight tool or model call always finishes and is booked
//! 5. reject any result whose usage exceeds the allocation, dropping its
//!    outputs
//!
//! Every outcome, including faults, is returned as a
//! [`StepExecutionResult`]; nothing is thrown past Tier3.

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::application::strategies::{StrategyContext, StrategyFactory, StrategyResult};
use crate::domain::communication::{RequestType, TierHandler, TierRequest, TierResponse};
use crate::domain::config::StrategyCosts;
use crate::domain::context::{AdaptationState, ContextHeader, StepContext, Tier};
use crate::domain::errors::{BudgetResource, ExecutionError};
use crate::domain::events::{event_types, EventPublisher};
use crate::domain::resources::{Credits, ResourceUsage};
use crate::domain::routine::StepDefinition;
use crate::domain::step::{
    StepExecutionRequest, StepExecutionResult, StepId, StepOutcome, StrategyType,
};

/// Up-front credit estimate for a step.
pub trait CostEstimator: Send + Sync {
    fn estimate(&self, strategy: StrategyType, step: &StepDefinition) -> Credits;
}

/// Configured base cost per strategy plus the step's own `estimated_credits`.
#[derive(Debug, Clone, Default)]
pub struct StrategyCostEstimator {
    costs: StrategyCosts,
}

impl StrategyCostEstimator {
    pub fn new(costs: StrategyCosts) -> Self {
        Self { costs }
    }
}

impl CostEstimator for StrategyCostEstimator {
    fn estimate(&self, strategy: StrategyType, step: &StepDefinition) -> Credits {
        let base = self.costs.base(strategy);
        match step.estimated_credits {
            Some(extra) => base.saturating_add(extra),
            None => base,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelStepPayload {
    pub step_id: StepId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Removes the step's token when execution ends on any path.
struct ActiveStep<'a> {
    registry: &'a DashMap<StepId, CancellationToken>,
    step_id: StepId,
}

impl Drop for ActiveStep<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.step_id);
    }
}

pub struct StepExecutor {
    factory: StrategyFactory,
    estimator: Arc<dyn CostEstimator>,
    events: Arc<dyn EventPublisher>,
    active: DashMap<StepId, CancellationToken>,
}

impl StepExecutor {
    pub fn new(factory: StrategyFactory, events: Arc<dyn EventPublisher>) -> Self {
        let estimator = Arc::new(StrategyCostEstimator::new(factory.config().costs.clone()));
        Self {
            factory,
            estimator,
            events,
            active: DashMap::new(),
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn CostEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn factory(&self) -> &StrategyFactory {
        &self.factory
    }

    pub fn active_steps(&self) -> usize {
        self.active.len()
    }

    /// Signal cancellation to a running step. Returns false for unknown or
    /// already finished steps.
    pub fn cancel_step(&self, step_id: &StepId, reason: &str) -> bool {
        match self.active.get(step_id) {
            Some(token) => {
                info!(step_id = %step_id, reason, "Cancelling step");
                token.cancel();
                true
            }
            None => false,
        }
    }

    #[instrument(skip(self, request), fields(step_id = %request.step_id, node = %request.node_id))]
    pub async fn execute_step(&self, request: StepExecutionRequest) -> StepExecutionResult {
        let started = Instant::now();
        let strategy_type = StrategyFactory::select(&request.step);
        let mut allocation = request.allocation.clone();
        if let Some(cap) = request.step.max_credits {
            allocation.max_credits = allocation.max_credits.min(cap);
        }

        self.events.emit(
            event_types::STEP_STARTED,
            Tier::Tier3,
            json!({
                "stepId": request.step_id,
                "runId": request.run_id,
                "nodeId": request.node_id,
                "strategy": strategy_type,
            }),
        );

        let estimate = self.estimator.estimate(strategy_type, &request.step);
        if estimate > allocation.max_credits {
            let err = ExecutionError::budget_exceeded(BudgetResource::Credits, estimate, allocation.max_credits);
            self.events.emit(
                event_types::BUDGET_EXCEEDED,
                Tier::Tier3,
                json!({
                    "stepId": request.step_id,
                    "runId": request.run_id,
                    "estimate": estimate,
                    "available": allocation.max_credits,
                }),
            );
            return self.finish(&request, strategy_type, Err(err), started);
        }

        let report = self
            .factory
            .services()
            .validation
            .validate_inputs(&request.step.inputs, &request.inputs);
        if !report.valid {
            let err = ExecutionError::validation(report.errors.join("; "));
            return self.finish(&request, strategy_type, Err(err), started);
        }

        let cancel = CancellationToken::new();
        self.active.insert(request.step_id, cancel.clone());
        let _registration = ActiveStep {
            registry: &self.active,
            step_id: request.step_id,
        };

        let threshold = self.factory.config().reasoning.confidence_threshold;
        let header = ContextHeader::new(Tier::Tier3, request.context.clone());
        let context = StrategyContext {
            step_id: request.step_id,
            run_id: request.run_id,
            node_id: request.node_id.clone(),
            step: request.step.clone(),
            context: StepContext::new(
                header,
                request.inputs.clone(),
                AdaptationState::fixed(strategy_type, threshold),
            ),
            allocation: allocation.clone(),
            session_user: request.session_user.clone(),
            cancel: cancel.clone(),
            progress: Arc::default(),
        };

        let strategy = self.factory.create(strategy_type);
        let outcome = match tokio::time::timeout(allocation.timeout, strategy.execute(&context)).await {
            Ok(Ok(result)) => Ok(result),
            // Faults carry whatever the strategy booked before failing.
            Ok(Err(err)) => Ok(Self::cut_off(strategy_type, err, &context)),
            Err(_) => {
                cancel.cancel();
                let err = ExecutionError::limit_exceeded(
                    BudgetResource::Time.to_string(),
                    format!("step exceeded its {}ms timeout", allocation.timeout.as_millis()),
                );
                Ok(Self::cut_off(strategy_type, err, &context))
            }
        };

        let outcome = outcome.map(|result| match result.resource_usage.overspend(&allocation) {
            Some(err) if !result.is_cancellation() => {
                if let ExecutionError::BudgetExceeded {
                    resource,
                    requested,
                    available,
                } = &err
                {
                    warn!(resource = %resource, used = %requested, available = %available, "Step usage exceeded its allocation");
                    self.events.emit(
                        event_types::BUDGET_EXCEEDED,
                        Tier::Tier3,
                        json!({
                            "stepId": request.step_id,
                            "runId": request.run_id,
                            "resource": resource.to_string(),
                            "used": requested,
                            "available": available,
                        }),
                    );
                }
                StrategyResult {
                    success: false,
                    outputs: Map::new(),
                    error: Some(err),
                    ..result
                }
            }
            _ => result,
        });

        self.finish(&request, strategy_type, outcome, started)
    }

    fn cut_off(strategy_type: StrategyType, err: ExecutionError, context: &StrategyContext) -> StrategyResult {
        let progress = context.progress();
        StrategyResult::failed(strategy_type, err, progress.usage).with_tool_calls(progress.tool_calls)
    }

    fn finish(
        &self,
        request: &StepExecutionRequest,
        strategy_type: StrategyType,
        outcome: Result<StrategyResult, ExecutionError>,
        started: Instant,
    ) -> StepExecutionResult {
        let duration_ms = started.elapsed().as_millis() as u64;
        let mut result = match outcome {
            Ok(result) if result.success => StepExecutionResult {
                step_id: request.step_id,
                status: StepOutcome::Completed,
                outputs: result.outputs,
                error: None,
                resource_usage: result.resource_usage,
                duration_ms,
                strategy: Some(strategy_type),
                tool_calls: result.tool_calls,
            },
            Ok(result) => {
                let err = result
                    .error
                    .unwrap_or_else(|| ExecutionError::validation("strategy reported failure"));
                let mut failed = StepExecutionResult::failed(request.step_id, &err, result.resource_usage);
                if !result.validation_errors.is_empty() {
                    if let Some(info) = failed.error.as_mut() {
                        let errors = json!(result.validation_errors);
                        match info.details.as_mut().and_then(|d| d.as_object_mut()) {
                            Some(details) => {
                                details.insert("validationErrors".to_string(), errors);
                            }
                            None => info.details = Some(json!({ "validationErrors": errors })),
                        }
                    }
                }
                failed.tool_calls = result.tool_calls;
                failed
            }
            Err(err) => StepExecutionResult::failed(request.step_id, &err, ResourceUsage::default()),
        };
        result.strategy = Some(strategy_type);
        result.duration_ms = duration_ms;
        result.resource_usage.duration_ms = duration_ms;

        let status = if result.is_completed() { "completed" } else { "failed" };
        counter!(
            "strata_steps_total",
            "strategy" => strategy_type.as_str(),
            "status" => status
        )
        .increment(1);

        if result.is_completed() {
            info!(
                step_id = %request.step_id,
                strategy = %strategy_type,
                credits = %result.resource_usage.credits,
                duration_ms,
                "Step completed"
            );
            self.events.emit(
                event_types::STEP_COMPLETED,
                Tier::Tier3,
                json!({
                    "stepId": request.step_id,
                    "runId": request.run_id,
                    "nodeId": request.node_id,
                    "strategy": strategy_type,
                    "durationMs": duration_ms,
                    "creditsUsed": result.resource_usage.credits,
                }),
            );
        } else {
            warn!(
                step_id = %request.step_id,
                strategy = %strategy_type,
                error = ?result.error,
                "Step failed"
            );
            self.events.emit(
                event_types::STEP_FAILED,
                Tier::Tier3,
                json!({
                    "stepId": request.step_id,
                    "runId": request.run_id,
                    "nodeId": request.node_id,
                    "strategy": strategy_type,
                    "error": result.error,
                }),
            );
        }
        result
    }
}

#[async_trait]
impl TierHandler for StepExecutor {
    fn tier(&self) -> Tier {
        Tier::Tier3
    }

    async fn handle(&self, request: TierRequest) -> TierResponse {
        match request.request_type {
            RequestType::ExecuteStep => match request.payload_as::<StepExecutionRequest>() {
                Ok(step) => TierResponse::from_result(request.id, Ok(self.execute_step(step).await)),
                Err(e) => TierResponse::err(request.id, &e),
            },
            RequestType::CancelStep => {
                let result = request.payload_as::<CancelStepPayload>().map(|payload| {
                    let reason = payload.reason.as_deref().unwrap_or("cancel requested");
                    json!({ "cancelled": self.cancel_step(&payload.step_id, reason) })
                });
                TierResponse::from_result(request.id, result)
            }
            other => TierResponse::err(
                request.id,
                &ExecutionError::validation(format!("tier3 does not handle {other:?} requests")),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::rate_limiter::RateLimiter;
    use crate::application::strategies::testing::{reply, services, ScriptedEngine};
    use crate::application::strategies::SharedServices;
    use crate::application::tool_orchestrator::ToolOrchestrator;
    use crate::application::validation_engine::ValidationEngine;
    use crate::domain::config::StrategiesConfig;
    use crate::domain::context::ContextMetadata;
    use crate::domain::events::NoopPublisher;
    use crate::domain::llm::{CompletionResponse, ToolCallRequest};
    use crate::domain::process::RunId;
    use crate::domain::rate_limit::RateLimitConfig;
    use crate::domain::resources::ResourceAllocation;
    use crate::domain::routine::{IoSpec, TransformOp};
    use crate::domain::security::SessionUser;
    use crate::domain::tool_policy::ToolApprovalPolicy;
    use crate::domain::tools::{ToolExecutor, ToolOutput};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn executor(engine: Arc<ScriptedEngine>) -> StepExecutor {
        let factory = StrategyFactory::new(services(engine), StrategiesConfig::default());
        StepExecutor::new(factory, Arc::new(NoopPublisher))
    }

    fn request(step: StepDefinition, inputs: serde_json::Value, credits: u64) -> StepExecutionRequest {
        StepExecutionRequest {
            step_id: StepId::new(),
            run_id: RunId::new(),
            node_id: "n".to_string(),
            step,
            inputs: inputs.as_object().cloned().unwrap_or_default(),
            context: ContextMetadata::default(),
            session_user: None,
            allocation: ResourceAllocation::new(Credits::from(credits), 10_000, Duration::from_secs(30), 5),
        }
    }

    #[tokio::test]
    async fn test_completed_step() {
        let exec = executor(Arc::new(ScriptedEngine::new(vec![reply("hi", 4)])));
        let result = exec.execute_step(request(StepDefinition::prompt("hello"), json!({}), 50)).await;
        assert_eq!(result.status, StepOutcome::Completed);
        assert_eq!(result.strategy, Some(StrategyType::Conversational));
        assert_eq!(result.resource_usage.credits, Credits::new(4));
        assert_eq!(exec.active_steps(), 0);
    }

    #[tokio::test]
    async fn test_estimate_above_allocation_fails_before_running() {
        let engine = Arc::new(ScriptedEngine::new(vec![reply("hi", 1)]));
        let exec = executor(engine.clone());
        let mut step = StepDefinition::prompt("hello");
        step.estimated_credits = Some(Credits::new(500));

        let result = exec.execute_step(request(step, json!({}), 100)).await;
        assert_eq!(result.status, StepOutcome::Failed);
        assert_eq!(result.error.unwrap().code, "BUDGET_EXCEEDED");
        assert!(engine.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_usage_above_allocation_drops_outputs() {
        let exec = executor(Arc::new(ScriptedEngine::new(vec![reply("expensive", 150)])));
        let result = exec.execute_step(request(StepDefinition::prompt("go"), json!({}), 100)).await;
        assert_eq!(result.status, StepOutcome::Failed);
        assert!(result.outputs.is_empty());
        assert_eq!(result.error.unwrap().code, "BUDGET_EXCEEDED");
        assert_eq!(result.resource_usage.credits, Credits::new(150));
    }

    #[tokio::test]
    async fn test_invalid_inputs_fail_the_step() {
        let exec = executor(Arc::new(ScriptedEngine::default()));
        let mut step = StepDefinition::transform(vec![TransformOp::Constant {
            output: "x".to_string(),
            value: json!(1),
        }]);
        step.inputs = vec![IoSpec::required("text")];

        let result = exec.execute_step(request(step, json!({}), 10)).await;
        assert_eq!(result.status, StepOutcome::Failed);
        let error = result.error.unwrap();
        assert_eq!(error.code, "VALIDATION_ERROR");
        assert!(error.message.contains("missing required input 'text'"));
    }

    #[tokio::test]
    async fn test_schema_failure_carries_validation_details() {
        let exec = executor(Arc::new(ScriptedEngine::default()));
        let mut step = StepDefinition::transform(vec![]);
        step.strategy = Some(StrategyType::Deterministic);
        step.outputs = vec![IoSpec::required("label")];

        let result = exec.execute_step(request(step, json!({}), 10)).await;
        let error = result.error.unwrap();
        assert_eq!(error.details.unwrap()["validationErrors"][0], "missing required output 'label'");
    }

    #[tokio::test]
    async fn test_tier_handler_round_trip() {
        let exec = executor(Arc::new(ScriptedEngine::new(vec![reply("hi", 1)])));
        let req = TierRequest::with_payload(
            RequestType::ExecuteStep,
            Tier::Tier2,
            Tier::Tier3,
            &request(StepDefinition::prompt("x"), json!({}), 10),
        )
        .unwrap();

        let response = exec.handle(req).await;
        assert!(response.success);
        let result: StepExecutionResult = response.into_result().unwrap();
        assert!(result.is_completed());

        let cancel = TierRequest::new(
            RequestType::CancelStep,
            Tier::Tier2,
            Tier::Tier3,
            json!({"stepId": StepId::new()}),
        );
        let response = exec.handle(cancel).await;
        assert_eq!(response.data.unwrap()["cancelled"], false);
    }

    /// Tool that signals when it starts and finishes only once released.
    struct GatedTool {
        started: Notify,
        release: Notify,
        finished: AtomicBool,
    }

    #[async_trait]
    impl ToolExecutor for GatedTool {
        async fn execute(
            &self,
            _tool_name: &str,
            arguments: &serde_json::Value,
            _user: Option<&SessionUser>,
        ) -> Result<ToolOutput, String> {
            self.started.notify_one();
            self.release.notified().await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(ToolOutput::new(arguments.clone(), Credits::new(5)))
        }
    }

    fn gated_executor(engine: ScriptedEngine, tool: Arc<GatedTool>) -> StepExecutor {
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig::new(100, 100, Duration::from_secs(60)),
            Arc::new(NoopPublisher),
        ));
        let policy = ToolApprovalPolicy {
            default_requires_approval: false,
            ..ToolApprovalPolicy::default()
        };
        let tools = ToolOrchestrator::new(tool, limiter, policy, Arc::new(NoopPublisher));
        let services = SharedServices::new(Arc::new(tools), Arc::new(ValidationEngine::new()), Arc::new(engine));
        StepExecutor::new(StrategyFactory::new(services, StrategiesConfig::default()), Arc::new(NoopPublisher))
    }

    fn asks_for_tool(credits: u64) -> CompletionResponse {
        let mut response = reply("looking it up", credits);
        response.tool_calls = vec![ToolCallRequest {
            name: "lookup".to_string(),
            arguments: json!({"q": "release notes"}),
        }];
        response
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_tool_call_finish() {
        let tool = Arc::new(GatedTool {
            started: Notify::new(),
            release: Notify::new(),
            finished: AtomicBool::new(false),
        });
        let engine = ScriptedEngine::new(vec![asks_for_tool(40), reply("never asked", 1)]);
        let exec = Arc::new(gated_executor(engine, tool.clone()));
        let req = request(StepDefinition::prompt("summarise"), json!({}), 100);
        let step_id = req.step_id;

        let task = tokio::spawn({
            let exec = exec.clone();
            async move { exec.execute_step(req).await }
        });
        tool.started.notified().await;
        assert!(exec.cancel_step(&step_id, "stop"));
        tokio::task::yield_now().await;
        assert!(!task.is_finished());
        tool.release.notify_one();

        let result = task.await.unwrap();
        assert!(tool.finished.load(Ordering::SeqCst));
        assert_eq!(result.status, StepOutcome::Failed);
        assert_eq!(result.error.unwrap().code, "CANCELLATION_REQUESTED");
        assert_eq!(result.tool_calls.len(), 1);
        assert!(result.tool_calls[0].succeeded());
        assert_eq!(result.resource_usage.credits, Credits::new(45));
        assert_eq!(result.resource_usage.tool_calls, 1);
        assert_eq!(exec.active_steps(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_step_reports_booked_usage() {
        let tool = Arc::new(GatedTool {
            started: Notify::new(),
            release: Notify::new(),
            finished: AtomicBool::new(false),
        });
        let exec = gated_executor(ScriptedEngine::new(vec![asks_for_tool(30)]), tool.clone());
        let mut req = request(StepDefinition::prompt("summarise"), json!({}), 100);
        req.allocation.timeout = Duration::from_secs(2);

        // The tool is never released; the allocation timeout cuts the step off.
        let result = exec.execute_step(req).await;
        assert_eq!(result.status, StepOutcome::Failed);
        assert_eq!(result.error.unwrap().code, "LIMIT_EXCEEDED");
        assert_eq!(result.resource_usage.credits, Credits::new(30));
        assert!(!tool.finished.load(Ordering::SeqCst));
    }
}
