// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;

use super::swarm::{GoalPlan, SwarmConfig};
use strata_core::domain::errors::ExecutionError;

/// Decomposes a swarm goal into runnable goal plans.
///
/// `pending` lists the goal ids to (re-)plan: every configured goal on the
/// first call, only the blocked ones after an adaptation.
#[async_trait]
pub trait GoalPlanner: Send + Sync {
    async fn plan(&self, config: &SwarmConfig, pending: &[String]) -> Result<Vec<GoalPlan>, ExecutionError>;
}

/// Maps configured goal specs 1:1 onto plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticGoalPlanner;

#[async_trait]
impl GoalPlanner for StaticGoalPlanner {
    async fn plan(&self, config: &SwarmConfig, pending: &[String]) -> Result<Vec<GoalPlan>, ExecutionError> {
        Ok(config
            .goals
            .iter()
            .filter(|goal| pending.iter().any(|id| id == &goal.id))
            .map(|goal| GoalPlan {
                goal_id: goal.id.clone(),
                description: goal.description.clone(),
                routine: goal.routine.clone(),
                inputs: goal.inputs.clone(),
                allocation: goal.allocation.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::swarm::GoalSpec;
    use serde_json::json;
    use std::time::Duration;
    use strata_core::domain::resources::{Credits, ResourceAllocation};
    use strata_core::domain::routine::{Routine, StepDefinition, TransformOp};

    #[tokio::test]
    async fn test_static_planner_only_plans_pending_goals() {
        let routine = Routine::single_step(
            "noop",
            StepDefinition::transform(vec![TransformOp::Constant {
                output: "ok".to_string(),
                value: json!(true),
            }]),
        );
        let config = SwarmConfig::new(
            "team",
            "ship",
            ResourceAllocation::new(Credits::new(10), 100, Duration::from_secs(10), 1),
        )
        .with_goal(GoalSpec::new("a", "first", routine.clone()))
        .with_goal(GoalSpec::new("b", "second", routine));

        let plans = StaticGoalPlanner.plan(&config, &["b".to_string()]).await.unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].goal_id, "b");
        assert_eq!(plans[0].description, "second");
    }
}
