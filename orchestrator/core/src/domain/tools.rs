// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::resources::Credits;
use crate::domain::security::SessionUser;

/// Value returned by a tool together with what it cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub value: Value,
    #[serde(default)]
    pub credits_used: Credits,
}

impl ToolOutput {
    pub fn new(value: Value, credits_used: Credits) -> Self {
        Self { value, credits_used }
    }
}

/// Executes named tools. The error string is recorded on the call record.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        tool_name: &str,
        arguments: &Value,
        user: Option<&SessionUser>,
    ) -> Result<ToolOutput, String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub tool_name: String,
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_credits: Option<Credits>,
}

/// Decides calls the approval policy flagged. Without a gate those calls are
/// recorded as pending approval and never executed.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn decide(&self, request: &ApprovalRequest) -> bool;
}
