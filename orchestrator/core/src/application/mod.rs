// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod engine;
pub mod rate_limiter;
pub mod routine_orchestrator;
pub mod security_validator;
pub mod step_executor;
pub mod strategies;
pub mod tool_orchestrator;
pub mod validation_engine;

// Re-export the tier entry points for convenience
pub use engine::{Engine, EngineBuilder};
pub use rate_limiter::RateLimiter;
pub use routine_orchestrator::{RoutineOrchestrator, RunConfig, RunOutcome, RunStatus};
pub use step_executor::{CostEstimator, StepExecutor, StrategyCostEstimator};
pub use tool_orchestrator::ToolOrchestrator;
pub use validation_engine::ValidationEngine;
