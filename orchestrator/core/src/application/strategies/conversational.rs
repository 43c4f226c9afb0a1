// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Conversational strategy
//!
//! Alternates model turns and the tool calls the model asks for. Tool calls
//! stop as soon as the step's tool-call or credit allocation is used up; the
//! strategy then returns the last model message as a partial result instead
//! of failing the step.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::{render_prompt, ExecutionStrategy, SharedServices, StrategyContext, StrategyResult};
use crate::domain::config::ConversationalConfig;
use crate::domain::errors::ExecutionError;
use crate::domain::llm::{ConversationTurn, TurnRole};
use crate::domain::resources::ResourceUsage;
use crate::domain::step::{StrategyType, ToolCallRecord};

pub struct ConversationalStrategy {
    services: SharedServices,
    config: ConversationalConfig,
}

impl ConversationalStrategy {
    pub fn new(services: SharedServices, config: ConversationalConfig) -> Self {
        Self { services, config }
    }

    fn bound_reached(context: &StrategyContext, usage: &ResourceUsage) -> bool {
        context.tool_calls_left(usage) == 0
            || context.credits_left(usage).is_zero()
            || usage.tokens >= context.allocation.max_tokens
    }

    /// Failed result that keeps what was spent before stopping.
    fn stopped(&self, err: ExecutionError, usage: ResourceUsage, tool_calls: Vec<ToolCallRecord>) -> StrategyResult {
        StrategyResult::failed(self.strategy_type(), err, usage).with_tool_calls(tool_calls)
    }

    fn tool_turn(record: &ToolCallRecord) -> ConversationTurn {
        let content = match (&record.result, &record.error) {
            (Some(result), _) => result.to_string(),
            (None, Some(error)) => format!("error: {error}"),
            (None, None) => String::new(),
        };
        ConversationTurn {
            role: TurnRole::Tool,
            content,
            tool_name: Some(record.tool_name.clone()),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for ConversationalStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::Conversational
    }

    fn services(&self) -> &SharedServices {
        &self.services
    }

    async fn execute(&self, context: &StrategyContext) -> Result<StrategyResult, ExecutionError> {
        let prompt = render_prompt(&self.services, context)?;
        let mut usage = ResourceUsage::default();
        let mut history: Vec<ConversationTurn> = Vec::new();
        let mut tool_calls: Vec<ToolCallRecord> = Vec::new();
        let mut last_message: Option<String> = None;
        let mut finished = false;
        let mut bounded = false;
        let mut turns = 0u32;

        while turns < self.config.max_turns.max(1) {
            if let Err(err) = context.ensure_active() {
                return Ok(self.stopped(err, usage, tool_calls));
            }
            if Self::bound_reached(context, &usage) && turns > 0 {
                bounded = true;
                break;
            }

            let mut request = context.completion_request(prompt.clone(), &usage);
            request.tools = context.step.tools.clone();
            request.history = history.clone();

            let response = match self.services.reasoning.complete(request).await {
                Ok(response) => response,
                Err(err) => return Ok(self.stopped(err.into(), usage, tool_calls)),
            };
            turns += 1;
            usage.credits = usage.credits.saturating_add(response.credits_consumed);
            usage.tokens = usage.tokens.saturating_add(response.tokens_used);
            context.book(&usage);
            debug!(
                step_id = %context.step_id,
                turn = turns,
                requested_tools = response.tool_calls.len(),
                "Conversational turn finished"
            );

            history.push(ConversationTurn {
                role: TurnRole::Assistant,
                content: response.final_message.clone(),
                tool_name: None,
            });
            last_message = Some(response.final_message);

            if response.tool_calls.is_empty() {
                finished = true;
                break;
            }

            for call in response.tool_calls {
                if Self::bound_reached(context, &usage) {
                    bounded = true;
                    break;
                }
                if let Err(err) = context.ensure_active() {
                    return Ok(self.stopped(err, usage, tool_calls));
                }
                let record = self
                    .services
                    .tools
                    .call(&call.name, call.arguments, context.user(), context.step.estimated_credits)
                    .await;
                usage.tool_calls += 1;
                usage.credits = usage.credits.saturating_add(record.credits_used);
                context.book(&usage);
                context.book_tool_call(&record);
                history.push(Self::tool_turn(&record));
                tool_calls.push(record);
            }

            if bounded {
                break;
            }
        }

        if let Err(err) = context.ensure_active() {
            return Ok(self.stopped(err, usage, tool_calls));
        }

        let Some(message) = last_message else {
            let err = ExecutionError::limit_exceeded("credits", "no conversational turn fit in the allocation");
            return Ok(StrategyResult::failed(self.strategy_type(), err, usage));
        };

        if bounded {
            info!(
                step_id = %context.step_id,
                tool_calls = usage.tool_calls,
                credits = %usage.credits,
                "Conversational step stopped at its allocation"
            );
        }

        let mut outputs = Map::new();
        outputs.insert("response".to_string(), Value::String(message.clone()));
        if let [only] = context.step.outputs.as_slice() {
            outputs.insert(only.name.clone(), Value::String(message));
        }

        let mut result = StrategyResult::succeeded(self.strategy_type(), outputs, usage)
            .with_tool_calls(tool_calls)
            .with_data("turns", json!(turns));
        if !finished {
            result = result.partial();
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::strategies::testing::{allocation, context, reply, services, ScriptedEngine};
    use crate::domain::llm::ToolCallRequest;
    use crate::domain::resources::Credits;
    use crate::domain::routine::StepDefinition;
    use std::sync::Arc;

    fn with_tools(message: &str, tools: usize) -> crate::domain::llm::CompletionResponse {
        let mut response = reply(message, 1);
        response.tool_calls = (0..tools)
            .map(|i| ToolCallRequest {
                name: "lookup".to_string(),
                arguments: json!({"i": i}),
            })
            .collect();
        response
    }

    #[tokio::test]
    async fn test_prompt_is_rendered_and_answer_returned() {
        let engine = Arc::new(ScriptedEngine::new(vec![reply("hello Ada", 3)]));
        let strategy = ConversationalStrategy::new(services(engine.clone()), ConversationalConfig::default());
        let ctx = context(StepDefinition::prompt("Greet {{name}}"), json!({"name": "Ada"}), allocation(50, 5));

        let result = strategy.execute(&ctx).await.unwrap();
        assert!(result.success);
        assert!(!result.metadata.partial);
        assert_eq!(result.outputs["response"], "hello Ada");
        assert_eq!(result.resource_usage.credits, Credits::new(3));
        assert_eq!(engine.requests.lock()[0].prompt, "Greet Ada");
    }

    #[tokio::test]
    async fn test_tool_calls_stop_at_allocation_with_partial_result() {
        let engine = Arc::new(ScriptedEngine::new(vec![
            with_tools("let me look", 5),
            reply("never reached", 1),
        ]));
        let strategy = ConversationalStrategy::new(services(engine), ConversationalConfig::default());
        let ctx = context(StepDefinition::prompt("go"), json!({}), allocation(100, 2));

        let result = strategy.execute(&ctx).await.unwrap();
        assert!(result.success);
        assert!(result.metadata.partial);
        assert_eq!(result.tool_calls.len(), 2);
        assert_eq!(result.resource_usage.tool_calls, 2);
        assert_eq!(result.outputs["response"], "let me look");
    }

    #[tokio::test]
    async fn test_tool_results_feed_the_next_turn() {
        let engine = Arc::new(ScriptedEngine::new(vec![with_tools("checking", 1), reply("done", 1)]));
        let strategy = ConversationalStrategy::new(services(engine.clone()), ConversationalConfig::default());
        let ctx = context(StepDefinition::prompt("go"), json!({}), allocation(100, 5));

        let result = strategy.execute(&ctx).await.unwrap();
        assert_eq!(result.outputs["response"], "done");
        let second = &engine.requests.lock()[1];
        assert_eq!(second.history.len(), 2);
        assert_eq!(second.history[1].role, TurnRole::Tool);
        assert_eq!(second.tool_call_budget, 4);
    }

    #[tokio::test]
    async fn test_cancelled_step_returns_cancellation() {
        let engine = Arc::new(ScriptedEngine::new(vec![reply("x", 1)]));
        let strategy = ConversationalStrategy::new(services(engine), ConversationalConfig::default());
        let ctx = context(StepDefinition::prompt("go"), json!({}), allocation(100, 5));
        ctx.cancel.cancel();

        let result = strategy.execute(&ctx).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code(), "CANCELLATION_REQUESTED");
        assert_eq!(result.resource_usage, ResourceUsage::default());
    }

    #[tokio::test]
    async fn test_backend_failure_keeps_spent_credits() {
        // Second turn has no scripted answer, so the engine reports unavailable.
        let engine = Arc::new(ScriptedEngine::new(vec![with_tools("checking", 1)]));
        let strategy = ConversationalStrategy::new(services(engine), ConversationalConfig::default());
        let ctx = context(StepDefinition::prompt("go"), json!({}), allocation(100, 5));

        let result = strategy.execute(&ctx).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code(), "EXTERNAL_SERVICE_ERROR");
        assert_eq!(result.resource_usage.credits, Credits::new(2));
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(ctx.progress().usage.credits, Credits::new(2));
    }
}
