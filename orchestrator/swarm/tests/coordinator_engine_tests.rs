// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Swarm coordination over a real Tier2/Tier3 engine.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::future::{ready, Future};
use std::sync::Arc;
use std::time::Duration;

use strata_core::application::Engine;
use strata_core::domain::communication::TierHandler;
use strata_core::domain::config::EngineConfigManifest;
use strata_core::domain::coordination::SwarmPhase;
use strata_core::domain::llm::{CompletionRequest, CompletionResponse, ReasoningEngine, ReasoningError};
use strata_core::domain::process::OrchestrationPhase;
use strata_core::domain::resources::{Credits, ResourceAllocation};
use strata_core::domain::routine::{IoSpec, Routine, StepDefinition, TransformOp};
use strata_core::domain::security::SessionUser;
use strata_core::domain::tools::{ToolExecutor, ToolOutput};
use strata_swarm::domain::{GoalSpec, StaticGoalPlanner, SwarmConfig};
use strata_swarm::infrastructure::InMemorySwarmRepository;
use strata_swarm::SwarmCoordinator;

/// Answers after a delay, so prompt steps are still mid-call when the swarm
/// is cancelled.
struct SlowEngine;

#[async_trait]
impl ReasoningEngine for SlowEngine {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, ReasoningError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(CompletionResponse {
            final_message: "still thinking".to_string(),
            credits_consumed: Credits::new(3),
            tool_calls: Vec::new(),
            tokens_used: 12,
        })
    }
}

struct NoTools;

#[async_trait]
impl ToolExecutor for NoTools {
    async fn execute(
        &self,
        tool_name: &str,
        _arguments: &Value,
        _user: Option<&SessionUser>,
    ) -> Result<ToolOutput, String> {
        Err(format!("tool '{tool_name}' is not available"))
    }
}

fn quick(id: &str) -> Routine {
    Routine::single_step(
        id,
        StepDefinition::transform(vec![TransformOp::Constant {
            output: "found".to_string(),
            value: json!(id),
        }]),
    )
}

fn slow(id: &str) -> Routine {
    Routine::single_step(id, StepDefinition::prompt("think about it"))
        .with_outputs([IoSpec::required("response")])
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn test_cancelling_swarm_cancels_active_runs_only() {
    let engine = Engine::builder(EngineConfigManifest::default())
        .reasoning(Arc::new(SlowEngine))
        .tools(Arc::new(NoTools))
        .build()
        .unwrap();
    let tier2: Arc<dyn TierHandler> = Arc::new(engine.orchestrator().clone());
    let coordinator = SwarmCoordinator::new(
        tier2,
        Arc::new(StaticGoalPlanner),
        Arc::new(InMemorySwarmRepository::new()),
        Arc::new(engine.events().clone()),
    );
    let mut swarm_events = engine.events().subscribe_pattern("swarm.*");

    let allocation = ResourceAllocation::new(Credits::new(90), 30_000, Duration::from_secs(60), 9);
    let config = SwarmConfig::new("review", "review the release", allocation)
        .with_goal(GoalSpec::new("lookup", "find the changelog", quick("lookup")))
        .with_goal(GoalSpec::new("draft", "draft notes", slow("draft")))
        .with_goal(GoalSpec::new("critique", "critique notes", slow("critique")));
    let swarm_id = coordinator.start_swarm(config).await.unwrap();
    coordinator.plan_swarm(swarm_id).await.unwrap();

    eventually("the quick run to complete", || {
        let coordinator = coordinator.clone();
        async move { coordinator.get_swarm_status(swarm_id).await.unwrap().completed_runs.len() == 1 }
    })
    .await;
    eventually("both slow steps to start", || ready(engine.step_executor().active_steps() == 2)).await;

    let before = coordinator.get_swarm_status(swarm_id).await.unwrap();
    assert_eq!(before.active_runs.len(), 2);
    let completed = before.completed_runs[0];

    assert!(coordinator
        .cancel_swarm(swarm_id, "release-manager", "release postponed")
        .await
        .unwrap());
    let report = tokio::time::timeout(Duration::from_secs(5), coordinator.wait_for_completion(swarm_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.status, SwarmPhase::Cancelled);

    for run_id in &before.active_runs {
        let run_id = *run_id;
        eventually("the run to be cancelled", || {
            let orchestrator = engine.orchestrator().clone();
            async move {
                orchestrator
                    .get_run_status(run_id)
                    .await
                    .map(|s| s.phase == OrchestrationPhase::Cancelled)
                    .unwrap_or(false)
            }
        })
        .await;
    }
    let kept = engine.orchestrator().get_run_status(completed).await.unwrap();
    assert_eq!(kept.phase, OrchestrationPhase::Completed);
    eventually("steps to unwind", || ready(engine.step_executor().active_steps() == 0)).await;

    let mut seen = Vec::new();
    while let Ok(event) = swarm_events.try_recv() {
        seen.push(event.event_type);
    }
    assert!(seen.iter().any(|t| t == "swarm.started"));
    assert!(seen.iter().any(|t| t == "swarm.cancelled"));
}

#[tokio::test]
async fn test_swarm_of_quick_goals_settles_budget() {
    let engine = Engine::builder(EngineConfigManifest::default())
        .reasoning(Arc::new(SlowEngine))
        .tools(Arc::new(NoTools))
        .build()
        .unwrap();
    let coordinator = SwarmCoordinator::new(
        Arc::new(engine.orchestrator().clone()),
        Arc::new(StaticGoalPlanner),
        Arc::new(InMemorySwarmRepository::new()),
        Arc::new(engine.events().clone()),
    );

    let allocation = ResourceAllocation::new(Credits::new(40), 10_000, Duration::from_secs(30), 4);
    let config = SwarmConfig::new("index", "index the docs", allocation)
        .with_goal(GoalSpec::new("one", "first", quick("one")))
        .with_goal(GoalSpec::new("two", "second", quick("two")));
    let swarm_id = coordinator.start_swarm(config).await.unwrap();
    coordinator.plan_swarm(swarm_id).await.unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), coordinator.wait_for_completion(swarm_id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.status, SwarmPhase::Completed);
    assert_eq!(report.completed_runs.len(), 2);
    assert!(report.resource_usage.credits <= Credits::new(40));
}
