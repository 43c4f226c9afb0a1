// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Reasoning strategy
//!
//! Asks the model for a JSON answer carrying a self-reported confidence and
//! refines it until the confidence reaches the adaptation threshold, the
//! iteration limit is hit or the credit allocation runs out. The most
//! confident answer seen wins.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{render_prompt, ExecutionStrategy, SharedServices, StrategyContext, StrategyResult};
use crate::domain::config::ReasoningConfig;
use crate::domain::errors::ExecutionError;
use crate::domain::resources::ResourceUsage;
use crate::domain::step::StrategyType;

const ANSWER_FORMAT: &str = "Respond only with a JSON object of the form \
{\"answer\": <your answer>, \"confidence\": <number between 0 and 1>, \"rationale\": <short string>}.";

#[derive(Debug, Clone, Deserialize)]
struct ReasonedAnswer {
    answer: Value,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    rationale: Option<String>,
}

impl ReasonedAnswer {
    /// Anything that is not the expected JSON counts as an unconfident answer.
    fn parse(message: &str) -> Self {
        let trimmed = message
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        serde_json::from_str::<ReasonedAnswer>(trimmed)
            .map(|mut a| {
                a.confidence = a.confidence.clamp(0.0, 1.0);
                a
            })
            .unwrap_or_else(|_| ReasonedAnswer {
                answer: Value::String(message.to_string()),
                confidence: 0.0,
                rationale: None,
            })
    }
}

pub struct ReasoningStrategy {
    services: SharedServices,
    config: ReasoningConfig,
}

impl ReasoningStrategy {
    pub fn new(services: SharedServices, config: ReasoningConfig) -> Self {
        Self { services, config }
    }

    fn refine_prompt(prompt: &str, previous: &ReasonedAnswer) -> String {
        format!(
            "{prompt}\n\nYour previous answer was {} with confidence {:.2}. \
             Re-examine it and answer again.",
            previous.answer, previous.confidence
        )
    }
}

#[async_trait]
impl ExecutionStrategy for ReasoningStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::Reasoning
    }

    fn services(&self) -> &SharedServices {
        &self.services
    }

    async fn execute(&self, context: &StrategyContext) -> Result<StrategyResult, ExecutionError> {
        let prompt = render_prompt(&self.services, context)?;
        let threshold = context.context.adaptation.confidence_threshold;
        let mut usage = ResourceUsage::default();
        let mut best: Option<ReasonedAnswer> = None;
        let mut last: Option<ReasonedAnswer> = None;
        let mut iterations = 0u32;

        while iterations < self.config.max_iterations.max(1) {
            if let Err(err) = context.ensure_active() {
                return Ok(StrategyResult::failed(self.strategy_type(), err, usage));
            }
            if context.credits_left(&usage).is_zero() {
                break;
            }

            let text = match &last {
                Some(previous) => Self::refine_prompt(&prompt, previous),
                None => prompt.clone(),
            };
            let mut request = context.completion_request(text, &usage);
            request.tool_call_budget = 0;
            request.config.json_response = true;
            request.system_prompt = Some(match request.system_prompt.take() {
                Some(system) => format!("{system}\n\n{ANSWER_FORMAT}"),
                None => ANSWER_FORMAT.to_string(),
            });

            let response = match self.services.reasoning.complete(request).await {
                Ok(response) => response,
                Err(err) => return Ok(StrategyResult::failed(self.strategy_type(), err.into(), usage)),
            };
            iterations += 1;
            usage.credits = usage.credits.saturating_add(response.credits_consumed);
            usage.tokens = usage.tokens.saturating_add(response.tokens_used);
            context.book(&usage);

            let answer = ReasonedAnswer::parse(&response.final_message);
            debug!(
                step_id = %context.step_id,
                iteration = iterations,
                confidence = answer.confidence,
                "Reasoning iteration finished"
            );

            let confident = answer.confidence >= threshold;
            if best.as_ref().map_or(true, |b| answer.confidence > b.confidence) {
                best = Some(answer.clone());
            }
            last = Some(answer);
            if confident {
                break;
            }
        }

        if let Err(err) = context.ensure_active() {
            return Ok(StrategyResult::failed(self.strategy_type(), err, usage));
        }

        let Some(best) = best else {
            let err = ExecutionError::limit_exceeded("credits", "no reasoning iteration fit in the allocation");
            return Ok(StrategyResult::failed(self.strategy_type(), err, usage));
        };

        let mut outputs = Map::new();
        if let [only] = context.step.outputs.as_slice() {
            if only.name != "answer" {
                outputs.insert(only.name.clone(), best.answer.clone());
            }
        }
        outputs.insert("answer".to_string(), best.answer);
        outputs.insert("confidence".to_string(), json!(best.confidence));
        if let Some(rationale) = best.rationale {
            outputs.insert("rationale".to_string(), Value::String(rationale));
        }

        let mut result = StrategyResult::succeeded(self.strategy_type(), outputs, usage)
            .with_data("iterations", json!(iterations))
            .with_data("threshold", json!(threshold));
        if best.confidence < threshold {
            result = result.partial();
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::strategies::testing::{allocation, context, reply, services, ScriptedEngine};
    use crate::domain::llm::{CompletionRequest, CompletionResponse, ReasoningEngine, ReasoningError};
    use crate::domain::resources::Credits;
    use crate::domain::routine::StepDefinition;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn strategy(engine: Arc<ScriptedEngine>) -> ReasoningStrategy {
        ReasoningStrategy::new(services(engine), ReasoningConfig::default())
    }

    #[tokio::test]
    async fn test_stops_once_confident() {
        let engine = Arc::new(ScriptedEngine::new(vec![
            reply(r#"{"answer": "maybe", "confidence": 0.4}"#, 2),
            reply(r#"{"answer": "yes", "confidence": 0.9, "rationale": "checked"}"#, 2),
            reply(r#"{"answer": "unused", "confidence": 1.0}"#, 2),
        ]));
        let ctx = context(StepDefinition::prompt("Is it safe?"), json!({}), allocation(100, 0));

        let result = strategy(engine.clone()).execute(&ctx).await.unwrap();
        assert!(result.success);
        assert!(!result.metadata.partial);
        assert_eq!(result.outputs["answer"], "yes");
        assert_eq!(result.outputs["rationale"], "checked");
        assert_eq!(result.metadata.data["iterations"], 2);
        assert_eq!(engine.requests.lock().len(), 2);
        assert!(engine.requests.lock()[1].prompt.contains("previous answer"));
    }

    #[tokio::test]
    async fn test_returns_most_confident_after_iteration_limit() {
        let engine = Arc::new(ScriptedEngine::new(vec![
            reply(r#"{"answer": "a", "confidence": 0.6}"#, 1),
            reply(r#"{"answer": "b", "confidence": 0.3}"#, 1),
            reply("not json at all", 1),
        ]));
        let ctx = context(StepDefinition::prompt("?"), json!({}), allocation(100, 0));

        let result = strategy(engine).execute(&ctx).await.unwrap();
        assert!(result.success);
        assert!(result.metadata.partial);
        assert_eq!(result.outputs["answer"], "a");
        assert_eq!(result.metadata.data["iterations"], 3);
    }

    #[tokio::test]
    async fn test_credit_allocation_bounds_iterations() {
        let engine = Arc::new(ScriptedEngine::new(vec![
            reply(r#"{"answer": "a", "confidence": 0.1}"#, 5),
            reply(r#"{"answer": "b", "confidence": 0.2}"#, 5),
        ]));
        let ctx = context(StepDefinition::prompt("?"), json!({}), allocation(5, 0));

        let result = strategy(engine.clone()).execute(&ctx).await.unwrap();
        assert_eq!(engine.requests.lock().len(), 1);
        assert_eq!(result.outputs["answer"], "a");
    }

    /// Cancels the step once its first answer has been produced.
    struct CancelAfterFirst {
        inner: ScriptedEngine,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl ReasoningEngine for CancelAfterFirst {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ReasoningError> {
            let response = self.inner.complete(request).await;
            self.cancel.cancel();
            response
        }
    }

    #[tokio::test]
    async fn test_cancellation_between_iterations_keeps_usage() {
        let ctx = context(StepDefinition::prompt("?"), json!({}), allocation(100, 0));
        let engine = Arc::new(CancelAfterFirst {
            inner: ScriptedEngine::new(vec![
                reply(r#"{"answer": "a", "confidence": 0.1}"#, 7),
                reply(r#"{"answer": "b", "confidence": 0.2}"#, 7),
            ]),
            cancel: ctx.cancel.clone(),
        });
        let strategy = ReasoningStrategy::new(services(engine.clone()), ReasoningConfig::default());

        let result = strategy.execute(&ctx).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code(), "CANCELLATION_REQUESTED");
        assert_eq!(result.resource_usage.credits, Credits::new(7));
        assert_eq!(ctx.progress().usage.credits, Credits::new(7));
        assert_eq!(engine.inner.requests.lock().len(), 1);
    }
}
