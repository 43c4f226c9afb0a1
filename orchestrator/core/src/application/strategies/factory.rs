// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0

use std::sync::Arc;

use super::{
    ConversationalStrategy, DeterministicStrategy, ExecutionStrategy, ReasoningStrategy, RoutingStrategy,
    SharedServices,
};
use crate::domain::config::StrategiesConfig;
use crate::domain::routine::StepDefinition;
use crate::domain::step::StrategyType;

/// Builds strategies keyed by type. Every instance it returns holds clones of
/// the same [`SharedServices`].
pub struct StrategyFactory {
    services: SharedServices,
    config: StrategiesConfig,
}

impl StrategyFactory {
    pub fn new(services: SharedServices, config: StrategiesConfig) -> Self {
        Self { services, config }
    }

    pub fn services(&self) -> &SharedServices {
        &self.services
    }

    pub fn config(&self) -> &StrategiesConfig {
        &self.config
    }

    pub fn create(&self, strategy: StrategyType) -> Arc<dyn ExecutionStrategy> {
        let services = self.services.clone();
        match strategy {
            StrategyType::Conversational => {
                Arc::new(ConversationalStrategy::new(services, self.config.conversational.clone()))
            }
            StrategyType::Deterministic => Arc::new(DeterministicStrategy::new(services)),
            StrategyType::Reasoning => Arc::new(ReasoningStrategy::new(services, self.config.reasoning.clone())),
            StrategyType::Routing => Arc::new(RoutingStrategy::new(services, self.config.routing.clone())),
        }
    }

    /// An explicit `strategy` wins; otherwise transforms, routes and the
    /// reasoning hint are checked in that order.
    pub fn select(step: &StepDefinition) -> StrategyType {
        if let Some(explicit) = step.strategy {
            return explicit;
        }
        if !step.transforms.is_empty() {
            StrategyType::Deterministic
        } else if !step.routes.is_empty() {
            StrategyType::Routing
        } else if step.reasoning {
            StrategyType::Reasoning
        } else {
            StrategyType::Conversational
        }
    }

    pub fn for_step(&self, step: &StepDefinition) -> Arc<dyn ExecutionStrategy> {
        self.create(Self::select(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::strategies::testing::{services, ScriptedEngine};
    use crate::domain::routine::{RouteOption, TransformOp};
    use serde_json::json;

    #[test]
    fn test_every_strategy_shares_the_same_services() {
        let factory = StrategyFactory::new(services(Arc::new(ScriptedEngine::default())), StrategiesConfig::default());
        for strategy in StrategyType::ALL {
            let first = factory.create(strategy);
            let second = factory.create(strategy);
            assert_eq!(first.strategy_type(), strategy);
            assert!(first.services().same_instances(factory.services()));
            assert!(second.services().same_instances(first.services()));
        }
    }

    #[test]
    fn test_selection_rules() {
        let transform = StepDefinition::transform(vec![TransformOp::Constant {
            output: "x".to_string(),
            value: json!(1),
        }]);
        assert_eq!(StrategyFactory::select(&transform), StrategyType::Deterministic);

        let routing = StepDefinition::routing(vec![RouteOption::new("a", None)]);
        assert_eq!(StrategyFactory::select(&routing), StrategyType::Routing);

        let mut reasoning = StepDefinition::prompt("think");
        reasoning.reasoning = true;
        assert_eq!(StrategyFactory::select(&reasoning), StrategyType::Reasoning);

        let mut explicit = transform.clone();
        explicit.strategy = Some(StrategyType::Conversational);
        assert_eq!(StrategyFactory::select(&explicit), StrategyType::Conversational);

        assert_eq!(StrategyFactory::select(&StepDefinition::prompt("hi")), StrategyType::Conversational);
    }
}
