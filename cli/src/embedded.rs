// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Embedded engine for CLI commands
//!
//! Builds the tiers in-process. The binary carries no model backend and no
//! tool host, so prompt-driven steps fail with an external-service error and
//! tool calls are refused; deterministic and condition-routed routines run
//! to completion.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use strata_core::application::Engine;
use strata_core::domain::config::EngineConfigManifest;
use strata_core::domain::llm::{CompletionRequest, CompletionResponse, ReasoningEngine, ReasoningError};
use strata_core::domain::resources::{Credits, ResourceAllocation};
use strata_core::domain::security::SessionUser;
use strata_core::domain::tools::{ToolExecutor, ToolOutput};
use strata_swarm::domain::StaticGoalPlanner;
use strata_swarm::infrastructure::InMemorySwarmRepository;
use strata_swarm::SwarmCoordinator;

/// Allocation used when a routine file does not declare one.
pub fn default_allocation() -> ResourceAllocation {
    ResourceAllocation::new(Credits::new(100), 100_000, Duration::from_secs(300), 50)
}

pub struct UnavailableReasoningEngine;

#[async_trait]
impl ReasoningEngine for UnavailableReasoningEngine {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, ReasoningError> {
        Err(ReasoningError::Unavailable(
            "no reasoning backend is attached to the CLI".to_string(),
        ))
    }
}

pub struct NoToolExecutor;

#[async_trait]
impl ToolExecutor for NoToolExecutor {
    async fn execute(
        &self,
        tool_name: &str,
        _arguments: &Value,
        _user: Option<&SessionUser>,
    ) -> std::result::Result<ToolOutput, String> {
        Err(format!("tool '{tool_name}' has no executor in the CLI"))
    }
}

pub struct EmbeddedEngine {
    engine: Engine,
    swarms: SwarmCoordinator,
}

impl EmbeddedEngine {
    pub fn new(config: EngineConfigManifest) -> Result<Self> {
        let engine = Engine::builder(config)
            .reasoning(Arc::new(UnavailableReasoningEngine))
            .tools(Arc::new(NoToolExecutor))
            .build()
            .context("Failed to initialize engine")?;
        let swarms = SwarmCoordinator::new(
            Arc::new(engine.orchestrator().clone()),
            Arc::new(StaticGoalPlanner),
            Arc::new(InMemorySwarmRepository::new()),
            Arc::new(engine.events().clone()),
        );
        debug!("Embedded engine ready");
        Ok(Self { engine, swarms })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn swarms(&self) -> &SwarmCoordinator {
        &self.swarms
    }
}

/// Parse repeated `key=value` arguments. Values that parse as JSON keep
/// their type; anything else becomes a string.
pub fn parse_inputs(params: &[String]) -> Result<Map<String, Value>> {
    let mut inputs = Map::new();
    for param in params {
        let Some((key, value)) = param.split_once('=') else {
            anyhow::bail!("Invalid input format: '{}'. Expected 'key=value'", param);
        };
        if key.trim().is_empty() {
            anyhow::bail!("Invalid input format: '{}'. Key cannot be empty", param);
        }
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        inputs.insert(key.trim().to_string(), value);
    }
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_inputs_keeps_json_types() {
        let inputs = parse_inputs(&[
            "count=3".to_string(),
            "flag=true".to_string(),
            "name=ada".to_string(),
            "tags=[\"a\",\"b\"]".to_string(),
        ])
        .unwrap();
        assert_eq!(inputs["count"], json!(3));
        assert_eq!(inputs["flag"], json!(true));
        assert_eq!(inputs["name"], json!("ada"));
        assert_eq!(inputs["tags"], json!(["a", "b"]));
    }

    #[test]
    fn test_parse_inputs_rejects_missing_separator() {
        assert!(parse_inputs(&["oops".to_string()]).is_err());
        assert!(parse_inputs(&["=value".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_prompt_steps_report_missing_backend() {
        let err = UnavailableReasoningEngine
            .complete(CompletionRequest::new("hi", Credits::new(1), 0))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unavailable"));
    }
}
