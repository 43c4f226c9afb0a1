// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Engine wiring
//!
//! Builds one Tier3 [`StepExecutor`] and one Tier2 [`RoutineOrchestrator`]
//! from an [`EngineConfigManifest`]. The rate limiter, tool orchestrator and
//! validation engine are created once here and shared by every strategy.

use anyhow::{anyhow, Context};
use std::sync::Arc;
use tracing::info;

use crate::application::rate_limiter::RateLimiter;
use crate::application::routine_orchestrator::RoutineOrchestrator;
use crate::application::step_executor::StepExecutor;
use crate::application::strategies::{SharedServices, StrategyFactory};
use crate::application::tool_orchestrator::ToolOrchestrator;
use crate::application::validation_engine::ValidationEngine;
use crate::domain::config::EngineConfigManifest;
use crate::domain::events::EventPublisher;
use crate::domain::llm::ReasoningEngine;
use crate::domain::repository::RunRepository;
use crate::domain::tools::{ApprovalGate, ToolExecutor};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::repositories::InMemoryRunRepository;

pub struct Engine {
    config: EngineConfigManifest,
    events: EventBus,
    rate_limiter: Arc<RateLimiter>,
    step_executor: Arc<StepExecutor>,
    orchestrator: RoutineOrchestrator,
}

impl Engine {
    pub fn builder(config: EngineConfigManifest) -> EngineBuilder {
        EngineBuilder {
            config,
            reasoning: None,
            tools: None,
            repository: None,
            approval_gate: None,
            events: None,
        }
    }

    pub fn config(&self) -> &EngineConfigManifest {
        &self.config
    }

    /// Bus every tier publishes to. Subscribe here to observe the engine.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn step_executor(&self) -> &Arc<StepExecutor> {
        &self.step_executor
    }

    /// Tier2 entry point. Clones share the same runs.
    pub fn orchestrator(&self) -> &RoutineOrchestrator {
        &self.orchestrator
    }
}

pub struct EngineBuilder {
    config: EngineConfigManifest,
    reasoning: Option<Arc<dyn ReasoningEngine>>,
    tools: Option<Arc<dyn ToolExecutor>>,
    repository: Option<Arc<dyn RunRepository>>,
    approval_gate: Option<Arc<dyn ApprovalGate>>,
    events: Option<EventBus>,
}

impl EngineBuilder {
    pub fn reasoning(mut self, engine: Arc<dyn ReasoningEngine>) -> Self {
        self.reasoning = Some(engine);
        self
    }

    pub fn tools(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(executor);
        self
    }

    /// Defaults to an in-memory repository.
    pub fn repository(mut self, repository: Arc<dyn RunRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn approval_gate(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval_gate = Some(gate);
        self
    }

    /// Use an existing bus instead of one sized from `spec.event_bus`.
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn build(self) -> anyhow::Result<Engine> {
        self.config.validate().context("invalid engine configuration")?;
        let reasoning = self
            .reasoning
            .ok_or_else(|| anyhow!("a reasoning engine is required"))?;
        let tools = self.tools.ok_or_else(|| anyhow!("a tool executor is required"))?;
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(InMemoryRunRepository::new()));

        let spec = &self.config.spec;
        let events = self
            .events
            .unwrap_or_else(|| EventBus::new(spec.event_bus.capacity));
        let publisher: Arc<dyn EventPublisher> = Arc::new(events.clone());

        let rate_limiter = Arc::new(RateLimiter::from_config(&spec.rate_limits, publisher.clone()));
        let mut tool_orchestrator = ToolOrchestrator::new(
            tools,
            rate_limiter.clone(),
            spec.tool_approval.clone(),
            publisher.clone(),
        );
        if let Some(gate) = self.approval_gate {
            tool_orchestrator = tool_orchestrator.with_approval_gate(gate);
        }

        let services = SharedServices::new(
            Arc::new(tool_orchestrator),
            Arc::new(ValidationEngine::new()),
            reasoning,
        );
        let factory = StrategyFactory::new(services, spec.strategies.clone());
        let step_executor = Arc::new(StepExecutor::new(factory, publisher.clone()));
        let orchestrator = RoutineOrchestrator::new(
            step_executor.clone(),
            repository,
            publisher,
            spec.orchestrator.clone(),
        );

        info!(
            name = %self.config.metadata.name,
            checkpoint_interval = spec.orchestrator.checkpoint_interval,
            max_steps_per_run = spec.orchestrator.max_steps_per_run,
            "Engine initialized"
        );

        Ok(Engine {
            config: self.config,
            events,
            rate_limiter,
            step_executor,
            orchestrator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::routine_orchestrator::RunConfig;
    use crate::application::strategies::testing::{EchoTools, ScriptedEngine};
    use crate::domain::resources::{Credits, ResourceAllocation};
    use crate::domain::routine::{Routine, StepDefinition, TransformOp};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_build_requires_reasoning_engine() {
        let err = Engine::builder(EngineConfigManifest::default())
            .tools(Arc::new(EchoTools))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("reasoning engine"));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = EngineConfigManifest::default();
        config.kind = "Something".to_string();
        let result = Engine::builder(config)
            .reasoning(Arc::new(ScriptedEngine::default()))
            .tools(Arc::new(EchoTools))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_engine_runs_a_routine_and_publishes_events() {
        let engine = Engine::builder(EngineConfigManifest::default())
            .reasoning(Arc::new(ScriptedEngine::default()))
            .tools(Arc::new(EchoTools))
            .build()
            .unwrap();
        let mut receiver = engine.events().subscribe_pattern("run.*");

        let routine = Routine::single_step(
            "const",
            StepDefinition::transform(vec![TransformOp::Constant {
                output: "answer".to_string(),
                value: json!(42),
            }]),
        );
        let allocation = ResourceAllocation::new(Credits::new(10), 1_000, Duration::from_secs(5), 1);
        let outcome = engine
            .orchestrator()
            .run(RunConfig::new(routine, allocation))
            .await
            .unwrap();

        assert!(outcome.is_completed());
        assert_eq!(outcome.outputs["answer"], 42);
        let started = receiver.recv().await.unwrap();
        assert_eq!(started.event_type, "run.started");
    }
}
