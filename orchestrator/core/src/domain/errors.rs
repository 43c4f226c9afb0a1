// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Execution Error Taxonomy
//!
//! Every failure that can cross a tier boundary is an [`ExecutionError`]. Each
//! variant carries a stable wire `code` and a `recoverable` flag. Only the
//! flattened [`ErrorInfo`] form ever leaves the tier that produced the error.
//!
//! | Variant | Code | Recoverable |
//! |---------|------|-------------|
//! | `Validation` | `VALIDATION_ERROR` | no |
//! | `BudgetExceeded` | `BUDGET_EXCEEDED` | no |
//! | `LimitExceeded` | `LIMIT_EXCEEDED` | no |
//! | `RateLimitExceeded` | `RATE_LIMIT_EXCEEDED` | yes |
//! | `ToolExecution` | `TOOL_EXECUTION_ERROR` | yes |
//! | `ExternalService` | `EXTERNAL_SERVICE_ERROR` | yes |
//! | `CancellationRequested` | `CANCELLATION_REQUESTED` | no |
//! | `NotFound` | `NOT_FOUND` | no |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Which ceiling of a `ResourceAllocation` was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetResource {
    Credits,
    Tokens,
    ToolCalls,
    Time,
}

impl fmt::Display for BudgetResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BudgetResource::Credits => "credits",
            BudgetResource::Tokens => "tokens",
            BudgetResource::ToolCalls => "tool_calls",
            BudgetResource::Time => "time",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionError {
    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("budget exceeded for {resource}: requested {requested}, available {available}")]
    BudgetExceeded {
        resource: BudgetResource,
        requested: String,
        available: String,
    },

    #[error("limit '{limit}' exceeded: {message}")]
    LimitExceeded { limit: String, message: String },

    #[error("rate limit exceeded for '{resource}', retry after {retry_after_ms}ms")]
    RateLimitExceeded { resource: String, retry_after_ms: u64 },

    #[error("tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("{service} failed: {message}")]
    ExternalService { service: String, message: String },

    #[error("cancellation requested: {reason}")]
    CancellationRequested { reason: String },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: String, id: String },
}

impl ExecutionError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn budget_exceeded(
        resource: BudgetResource,
        requested: impl fmt::Display,
        available: impl fmt::Display,
    ) -> Self {
        Self::BudgetExceeded {
            resource,
            requested: requested.to_string(),
            available: available.to_string(),
        }
    }

    pub fn limit_exceeded(limit: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LimitExceeded {
            limit: limit.into(),
            message: message.into(),
        }
    }

    pub fn external(service: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::ExternalService {
            service: service.into(),
            message: message.to_string(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::CancellationRequested {
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::Validation { .. } => "VALIDATION_ERROR",
            ExecutionError::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            ExecutionError::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            ExecutionError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            ExecutionError::ToolExecution { .. } => "TOOL_EXECUTION_ERROR",
            ExecutionError::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            ExecutionError::CancellationRequested { .. } => "CANCELLATION_REQUESTED",
            ExecutionError::NotFound { .. } => "NOT_FOUND",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ExecutionError::RateLimitExceeded { .. }
                | ExecutionError::ToolExecution { .. }
                | ExecutionError::ExternalService { .. }
        )
    }

    /// Budget and limit breaches end the owning run or swarm outright.
    pub fn terminates_owner(&self) -> bool {
        matches!(
            self,
            ExecutionError::BudgetExceeded { .. } | ExecutionError::LimitExceeded { .. }
        )
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code().to_string(),
            message: self.to_string(),
            recoverable: self.is_recoverable(),
            details: serde_json::to_value(self).ok(),
        }
    }
}

/// Flattened error form that crosses tier boundaries.
///
/// `details` carries the structured variant when the producer had one, so the
/// receiving tier can rebuild the original [`ExecutionError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            recoverable,
            details: None,
        }
    }

    /// Rebuild the typed error, falling back to a code-based mapping when the
    /// structured details are missing.
    pub fn to_error(&self) -> ExecutionError {
        if let Some(err) = self
            .details
            .as_ref()
            .and_then(|d| serde_json::from_value::<ExecutionError>(d.clone()).ok())
        {
            return err;
        }

        match self.code.as_str() {
            "VALIDATION_ERROR" => ExecutionError::validation(&self.message),
            "BUDGET_EXCEEDED" => ExecutionError::BudgetExceeded {
                resource: BudgetResource::Credits,
                requested: "unknown".to_string(),
                available: "unknown".to_string(),
            },
            "LIMIT_EXCEEDED" => ExecutionError::limit_exceeded("unknown", &self.message),
            "RATE_LIMIT_EXCEEDED" => ExecutionError::RateLimitExceeded {
                resource: "unknown".to_string(),
                retry_after_ms: 0,
            },
            "TOOL_EXECUTION_ERROR" => ExecutionError::ToolExecution {
                tool: "unknown".to_string(),
                message: self.message.clone(),
            },
            "CANCELLATION_REQUESTED" => ExecutionError::cancelled(&self.message),
            "NOT_FOUND" => ExecutionError::not_found("entity", &self.message),
            _ => ExecutionError::external("remote tier", &self.message),
        }
    }
}

impl From<&ExecutionError> for ErrorInfo {
    fn from(err: &ExecutionError) -> Self {
        err.to_info()
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}
