// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Routing strategy
//!
//! Picks one of the step's declared route labels and writes it to the
//! `route` output. Conditions are evaluated over the step inputs in
//! declaration order; when none matches and model routing is enabled the
//! reasoning engine is asked to choose. A label that was never declared is a
//! validation failure.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::{ExecutionStrategy, SharedServices, StrategyContext, StrategyResult};
use crate::domain::config::RoutingConfig;
use crate::domain::errors::ExecutionError;
use crate::domain::resources::ResourceUsage;
use crate::domain::step::StrategyType;

pub const ROUTE_OUTPUT: &str = "route";

pub struct RoutingStrategy {
    services: SharedServices,
    config: RoutingConfig,
}

impl RoutingStrategy {
    pub fn new(services: SharedServices, config: RoutingConfig) -> Self {
        Self { services, config }
    }

    fn routing_prompt(&self, context: &StrategyContext) -> Result<String, ExecutionError> {
        let mut prompt = match context.step.prompt.as_deref() {
            Some(template) => self.services.templates.render(template, context.inputs())?,
            None => format!(
                "Choose the route that fits these inputs:\n{}",
                Value::Object(context.inputs().clone())
            ),
        };
        prompt.push_str("\n\nAnswer with exactly one of the following labels and nothing else:\n");
        for route in &context.step.routes {
            match &route.description {
                Some(description) => prompt.push_str(&format!("- {}: {description}\n", route.label)),
                None => prompt.push_str(&format!("- {}\n", route.label)),
            }
        }
        Ok(prompt)
    }

    fn chosen(&self, label: String, how: &str, usage: ResourceUsage) -> StrategyResult {
        let mut outputs = Map::new();
        outputs.insert(ROUTE_OUTPUT.to_string(), Value::String(label));
        StrategyResult::succeeded(self.strategy_type(), outputs, usage).with_data("selected_by", json!(how))
    }
}

#[async_trait]
impl ExecutionStrategy for RoutingStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::Routing
    }

    fn services(&self) -> &SharedServices {
        &self.services
    }

    async fn execute(&self, context: &StrategyContext) -> Result<StrategyResult, ExecutionError> {
        context.ensure_active()?;

        let matched = context
            .step
            .routes
            .iter()
            .find(|route| route.when.as_ref().is_some_and(|c| c.evaluate(context.inputs())));
        if let Some(route) = matched {
            debug!(step_id = %context.step_id, route = %route.label, "Route selected by condition");
            return Ok(self.chosen(route.label.clone(), "condition", ResourceUsage::default()));
        }

        let use_model = context.step.model_routing.unwrap_or(self.config.model_fallback);
        if !use_model {
            return Ok(StrategyResult::invalid(
                self.strategy_type(),
                vec!["no route condition matched".to_string()],
                ResourceUsage::default(),
            ));
        }

        let mut usage = ResourceUsage::default();
        let mut request = context.completion_request(self.routing_prompt(context)?, &usage);
        request.tool_call_budget = 0;
        let response = match self.services.reasoning.complete(request).await {
            Ok(response) => response,
            Err(err) => return Ok(StrategyResult::failed(self.strategy_type(), err.into(), usage)),
        };
        usage.credits = response.credits_consumed;
        usage.tokens = response.tokens_used;
        context.book(&usage);
        if let Err(err) = context.ensure_active() {
            return Ok(StrategyResult::failed(self.strategy_type(), err, usage));
        }

        let label = response
            .final_message
            .trim()
            .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '.')
            .to_string();
        if !context.step.routes.iter().any(|r| r.label == label) {
            warn!(step_id = %context.step_id, label = %label, "Model chose an undeclared route");
            return Ok(StrategyResult::invalid(
                self.strategy_type(),
                vec![format!("model chose unknown route '{label}'")],
                usage,
            ));
        }

        debug!(step_id = %context.step_id, route = %label, "Route selected by model");
        Ok(self.chosen(label, "model", usage))
    }
}
