// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Deterministic strategy
//!
//! Applies the step's transforms in order, then checks the produced outputs
//! with the shared validation engine. No model or tool is involved and no
//! credits are consumed.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{ExecutionStrategy, SharedServices, StrategyContext, StrategyResult};
use crate::domain::errors::ExecutionError;
use crate::domain::resources::ResourceUsage;
use crate::domain::routine::{lookup, TransformOp};
use crate::domain::step::StrategyType;

pub struct DeterministicStrategy {
    services: SharedServices,
}

impl DeterministicStrategy {
    pub fn new(services: SharedServices) -> Self {
        Self { services }
    }

    fn apply(
        &self,
        op: &TransformOp,
        inputs: &Map<String, Value>,
        outputs: &mut Map<String, Value>,
        errors: &mut Vec<String>,
    ) {
        match op {
            TransformOp::Copy { mappings } => {
                for (output, source) in mappings {
                    match lookup(inputs, source) {
                        Some(value) => {
                            outputs.insert(output.clone(), value.clone());
                        }
                        None => errors.push(format!("copy source '{source}' is not an input")),
                    }
                }
            }
            TransformOp::Template { output, template } => {
                match self.services.templates.render(template, inputs) {
                    Ok(text) => {
                        outputs.insert(output.clone(), Value::String(text));
                    }
                    Err(e) => errors.push(format!("template for '{output}': {e}")),
                }
            }
            TransformOp::Constant { output, value } => {
                outputs.insert(output.clone(), value.clone());
            }
        }
    }
}

#[async_trait]
impl ExecutionStrategy for DeterministicStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::Deterministic
    }

    fn services(&self) -> &SharedServices {
        &self.services
    }

    async fn execute(&self, context: &StrategyContext) -> Result<StrategyResult, ExecutionError> {
        context.ensure_active()?;

        let mut outputs = Map::new();
        let mut errors = Vec::new();
        for op in &context.step.transforms {
            self.apply(op, context.inputs(), &mut outputs, &mut errors);
        }

        if errors.is_empty() {
            let report = self.services.validation.validate_outputs(
                context.step.output_schema.as_ref(),
                &context.step.outputs,
                &outputs,
            );
            errors = report.errors;
        }

        debug!(
            step_id = %context.step_id,
            transforms = context.step.transforms.len(),
            errors = errors.len(),
            "Deterministic transforms applied"
        );

        if !errors.is_empty() {
            return Ok(StrategyResult::invalid(self.strategy_type(), errors, ResourceUsage::default()));
        }

        Ok(StrategyResult::succeeded(self.strategy_type(), outputs, ResourceUsage::default())
            .with_data("transforms", json!(context.step.transforms.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::strategies::testing::{allocation, context, services, ScriptedEngine};
    use crate::domain::routine::{IoSpec, StepDefinition};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn strategy() -> DeterministicStrategy {
        DeterministicStrategy::new(services(Arc::new(ScriptedEngine::default())))
    }

    #[tokio::test]
    async fn test_transforms_produce_outputs() {
        let mut mappings = BTreeMap::new();
        mappings.insert("title".to_string(), "ticket.title".to_string());
        let step = StepDefinition::transform(vec![
            TransformOp::Copy { mappings },
            TransformOp::Template {
                output: "summary".to_string(),
                template: "[{{ticket.priority}}] {{ticket.title}}".to_string(),
            },
            TransformOp::Constant {
                output: "source".to_string(),
                value: json!("intake"),
            },
        ]);
        let inputs = json!({"ticket": {"title": "Disk full", "priority": "P1"}});

        let result = strategy().execute(&context(step, inputs, allocation(10, 0))).await.unwrap();
        assert!(result.success);
        assert_eq!(result.outputs["title"], "Disk full");
        assert_eq!(result.outputs["summary"], "[P1] Disk full");
        assert_eq!(result.outputs["source"], "intake");
        assert!(result.resource_usage.credits.is_zero());
    }

    #[tokio::test]
    async fn test_schema_violation_is_a_structured_failure() {
        let mut step = StepDefinition::transform(vec![TransformOp::Constant {
            output: "score".to_string(),
            value: json!("high"),
        }]);
        step.output_schema = Some(json!({
            "type": "object",
            "properties": { "score": { "type": "number" } }
        }));
        step.outputs = vec![IoSpec::required("score"), IoSpec::required("label")];

        let result = strategy().execute(&context(step, json!({}), allocation(10, 0))).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.validation_errors.len(), 2);
        assert!(result.validation_errors.iter().any(|e| e.contains("'label'")));
        assert_eq!(result.error.unwrap().code(), "VALIDATION_ERROR");
        assert!(result.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_missing_copy_source_is_reported() {
        let mut mappings = BTreeMap::new();
        mappings.insert("x".to_string(), "nope".to_string());
        let step = StepDefinition::transform(vec![TransformOp::Copy { mappings }]);

        let result = strategy().execute(&context(step, json!({}), allocation(10, 0))).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.validation_errors, vec!["copy source 'nope' is not an input"]);
    }
}
