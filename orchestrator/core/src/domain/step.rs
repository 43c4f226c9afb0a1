// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Step Execution Contract
//!
//! The request Tier2 sends to Tier3 for a single leaf node and the result that
//! comes back. Tool calls made while the step ran are recorded on the result
//! whether they succeeded or not; a failed tool call does not by itself fail
//! the step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::domain::context::ContextMetadata;
use crate::domain::errors::{ErrorInfo, ExecutionError};
use crate::domain::process::RunId;
use crate::domain::resources::{Credits, ResourceAllocation, ResourceUsage};
use crate::domain::routine::StepDefinition;
use crate::domain::security::SessionUser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub Uuid);

impl StepId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    Conversational,
    Deterministic,
    Reasoning,
    Routing,
}

impl StrategyType {
    pub const ALL: [StrategyType; 4] = [
        StrategyType::Conversational,
        StrategyType::Deterministic,
        StrategyType::Reasoning,
        StrategyType::Routing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyType::Conversational => "conversational",
            StrategyType::Deterministic => "deterministic",
            StrategyType::Reasoning => "reasoning",
            StrategyType::Routing => "routing",
        }
    }
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Succeeded,
    Failed,
    RateLimited,
    ApprovalRequired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub id: Uuid,
    pub tool_name: String,
    pub arguments: Value,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub credits_used: Credits,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

impl ToolCallRecord {
    pub fn succeeded(&self) -> bool {
        self.status == ToolCallStatus::Succeeded
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionRequest {
    pub step_id: StepId,
    pub run_id: RunId,
    pub node_id: String,
    pub step: StepDefinition,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub context: ContextMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_user: Option<SessionUser>,
    pub allocation: ResourceAllocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub step_id: StepId,
    pub status: StepOutcome,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub resource_usage: ResourceUsage,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyType>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
}

impl StepExecutionResult {
    /// A failed result carrying no outputs.
    pub fn failed(step_id: StepId, error: &ExecutionError, usage: ResourceUsage) -> Self {
        Self {
            step_id,
            status: StepOutcome::Failed,
            outputs: Map::new(),
            error: Some(error.to_info()),
            duration_ms: usage.duration_ms,
            resource_usage: usage,
            strategy: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepOutcome::Completed
    }
}
