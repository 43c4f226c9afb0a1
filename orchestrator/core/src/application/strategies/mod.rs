// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Step Strategies
//!
//! Tier3 executes every leaf step through one [`ExecutionStrategy`]:
//!
//! | Strategy | Drives |
//! |----------|--------|
//! | [`ConversationalStrategy`] | model loop with tool calls, bounded by tool-call and credit allocation |
//! | [`DeterministicStrategy`] | side-effect-free transforms plus output schema validation |
//! | [`ReasoningStrategy`] | repeated JSON answers until the confidence threshold is met |
//! | [`RoutingStrategy`] | picks one declared route label |
//!
//! All strategies share a single [`SharedServices`] bundle, handed out by the
//! [`StrategyFactory`], so tool rate limits and compiled schemas are global
//! across concurrently running steps.
//!
//! A strategy returns `Ok` with `success: false` for every failure that
//! happens after it started spending (schema violations, unknown route labels,
//! cancellation, reasoning backend faults), so the usage travels with the
//! result. `Err` is reserved for faults before any work, such as a prompt that
//! does not render.
//!
//! Cancellation is cooperative: strategies check the step's token between
//! atomic model and tool calls, never in the middle of one.

mod conversational;
mod deterministic;
mod factory;
mod reasoning;
mod routing;

pub use conversational::ConversationalStrategy;
pub use deterministic::DeterministicStrategy;
pub use factory::StrategyFactory;
pub use reasoning::ReasoningStrategy;
pub use routing::{RoutingStrategy, ROUTE_OUTPUT};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::application::tool_orchestrator::ToolOrchestrator;
use crate::application::validation_engine::ValidationEngine;
use crate::domain::errors::ExecutionError;
use crate::domain::context::StepContext;
use crate::domain::llm::{CompletionRequest, ReasoningEngine};
use crate::domain::process::RunId;
use crate::domain::resources::{Credits, ResourceAllocation, ResourceUsage};
use crate::domain::routine::StepDefinition;
use crate::domain::security::SessionUser;
use crate::domain::step::{StepId, StrategyType, ToolCallRecord};
use crate::infrastructure::template_engine::TemplateEngine;

/// Collaborators every strategy uses. Cloning shares the same instances.
#[derive(Clone)]
pub struct SharedServices {
    pub tools: Arc<ToolOrchestrator>,
    pub validation: Arc<ValidationEngine>,
    pub reasoning: Arc<dyn ReasoningEngine>,
    pub templates: Arc<TemplateEngine>,
}

impl SharedServices {
    pub fn new(
        tools: Arc<ToolOrchestrator>,
        validation: Arc<ValidationEngine>,
        reasoning: Arc<dyn ReasoningEngine>,
    ) -> Self {
        Self {
            tools,
            validation,
            reasoning,
            templates: Arc::new(TemplateEngine::new()),
        }
    }

    /// True when both bundles point at the same tool orchestrator and
    /// validation engine.
    pub fn same_instances(&self, other: &SharedServices) -> bool {
        Arc::ptr_eq(&self.tools, &other.tools) && Arc::ptr_eq(&self.validation, &other.validation)
    }
}

/// What a strategy has spent so far. The executor reads it when the strategy
/// is cut off by its timeout.
#[derive(Debug, Clone, Default)]
pub struct StepProgress {
    pub usage: ResourceUsage,
    pub tool_calls: Vec<ToolCallRecord>,
}

/// Everything a strategy needs to run one step.
pub struct StrategyContext {
    pub step_id: StepId,
    pub run_id: RunId,
    pub node_id: String,
    pub step: StepDefinition,
    pub context: StepContext,
    pub allocation: ResourceAllocation,
    pub session_user: Option<SessionUser>,
    pub cancel: CancellationToken,
    pub progress: Arc<Mutex<StepProgress>>,
}

impl StrategyContext {
    pub fn inputs(&self) -> &Map<String, Value> {
        &self.context.memory.inputs
    }

    pub fn user(&self) -> Option<&SessionUser> {
        self.session_user.as_ref()
    }

    /// Fails with `CancellationRequested` once the step was cancelled.
    pub fn ensure_active(&self) -> Result<(), ExecutionError> {
        if self.cancel.is_cancelled() {
            return Err(ExecutionError::cancelled(format!("step {} cancelled", self.step_id)));
        }
        Ok(())
    }

    /// Record the running usage total.
    pub fn book(&self, usage: &ResourceUsage) {
        self.progress.lock().usage = usage.clone();
    }

    pub fn book_tool_call(&self, record: &ToolCallRecord) {
        self.progress.lock().tool_calls.push(record.clone());
    }

    pub fn progress(&self) -> StepProgress {
        self.progress.lock().clone()
    }

    /// Credits left after `usage`.
    pub fn credits_left(&self, usage: &ResourceUsage) -> Credits {
        self.allocation.max_credits.saturating_sub(usage.credits)
    }

    pub fn tool_calls_left(&self, usage: &ResourceUsage) -> u32 {
        self.allocation.max_tool_calls.saturating_sub(usage.tool_calls)
    }

    /// A completion request pre-filled from the step and caller.
    pub fn completion_request(&self, prompt: String, usage: &ResourceUsage) -> CompletionRequest {
        let mut request = CompletionRequest::new(prompt, self.credits_left(usage), self.tool_calls_left(usage));
        request.system_prompt = self.step.system_prompt.clone();
        request.agent = self.step.agent.clone();
        request.model_preference = self.step.model_preference.clone();
        request.conversation_id = Some(self.step_id.to_string());
        request.credit_account_id = self
            .session_user
            .as_ref()
            .and_then(|u| u.credit_account_id.clone());
        request.session_user = self.session_user.clone();
        request
    }
}

#[derive(Debug, Clone, Default)]
pub struct StrategyMetadata {
    pub strategy_type: Option<StrategyType>,
    /// The strategy stopped at a bound and returned what it had.
    pub partial: bool,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct StrategyResult {
    pub success: bool,
    pub outputs: Map<String, Value>,
    pub error: Option<ExecutionError>,
    pub validation_errors: Vec<String>,
    pub metadata: StrategyMetadata,
    pub resource_usage: ResourceUsage,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl StrategyResult {
    pub fn succeeded(strategy: StrategyType, outputs: Map<String, Value>, usage: ResourceUsage) -> Self {
        Self {
            success: true,
            outputs,
            error: None,
            validation_errors: Vec::new(),
            metadata: StrategyMetadata {
                strategy_type: Some(strategy),
                ..StrategyMetadata::default()
            },
            resource_usage: usage,
            tool_calls: Vec::new(),
        }
    }

    pub fn failed(strategy: StrategyType, error: ExecutionError, usage: ResourceUsage) -> Self {
        Self {
            success: false,
            outputs: Map::new(),
            error: Some(error),
            validation_errors: Vec::new(),
            metadata: StrategyMetadata {
                strategy_type: Some(strategy),
                ..StrategyMetadata::default()
            },
            resource_usage: usage,
            tool_calls: Vec::new(),
        }
    }

    /// Failed with a structured list of validation messages.
    pub fn invalid(strategy: StrategyType, errors: Vec<String>, usage: ResourceUsage) -> Self {
        let error = ExecutionError::validation(errors.join("; "));
        let mut result = Self::failed(strategy, error, usage);
        result.validation_errors = errors;
        result
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self.error, Some(ExecutionError::CancellationRequested { .. }))
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCallRecord>) -> Self {
        self.tool_calls = calls;
        self
    }

    pub fn partial(mut self) -> Self {
        self.metadata.partial = true;
        self
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.metadata.data.insert(key.to_string(), value);
        self
    }
}

#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn strategy_type(&self) -> StrategyType;

    fn services(&self) -> &SharedServices;

    async fn execute(&self, context: &StrategyContext) -> Result<StrategyResult, ExecutionError>;
}

/// Render the step prompt against the step inputs.
pub(crate) fn render_prompt(services: &SharedServices, context: &StrategyContext) -> Result<String, ExecutionError> {
    let template = context
        .step
        .prompt
        .as_deref()
        .ok_or_else(|| ExecutionError::validation(format!("step {} has no prompt", context.node_id)))?;
    services.templates.render(template, context.inputs())
}
