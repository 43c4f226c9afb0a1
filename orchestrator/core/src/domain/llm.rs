// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Reasoning collaborator
//!
//! The model backend is consumed as a black box behind [`ReasoningEngine`].
//! Strategies build a [`CompletionRequest`], bounded by a tool-call and a
//! credit budget, and get back the final message plus any tool calls the model
//! wants made before it continues.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::errors::ExecutionError;
use crate::domain::resources::Credits;
use crate::domain::security::SessionUser;

/// Tool exposed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema for the arguments object.
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: empty_object_schema(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Ask the model for a JSON object answer.
    #[serde(default)]
    pub json_response: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_account_id: Option<String>,
    #[serde(default)]
    pub config: CompletionConfig,
    /// Tool calls the model may still request.
    pub tool_call_budget: u32,
    /// Credits the model may still spend.
    pub credit_budget: Credits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_user: Option<SessionUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_preference: Option<String>,
    /// Prior turns, including tool results fed back to the model.
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, credit_budget: Credits, tool_call_budget: u32) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            tools: Vec::new(),
            agent: None,
            credit_account_id: None,
            config: CompletionConfig::default(),
            tool_call_budget,
            credit_budget,
            session_user: None,
            conversation_id: None,
            model_preference: None,
            history: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub final_message: String,
    pub credits_consumed: Credits,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default)]
    pub tokens_used: u64,
}

#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ReasoningError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReasoningError {
    #[error("reasoning backend unavailable: {0}")]
    Unavailable(String),

    #[error("reasoning backend rate limited")]
    RateLimited,

    #[error("invalid completion request: {0}")]
    InvalidRequest(String),

    #[error("reasoning backend error: {0}")]
    Backend(String),
}

impl From<ReasoningError> for ExecutionError {
    fn from(err: ReasoningError) -> Self {
        match err {
            ReasoningError::InvalidRequest(msg) => ExecutionError::validation(msg),
            other => ExecutionError::external("reasoning engine", other),
        }
    }
}
