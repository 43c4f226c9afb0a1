// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Cross-Tier Envelope
//!
//! Every call between tiers is a [`TierRequest`] answered by exactly one
//! [`TierResponse`] carrying the same id. Errors cross the boundary only as
//! [`ErrorInfo`].
//!
//! ```json
//! { "id": "...", "type": "execute_run", "source": "tier1", "target": "tier2",
//!   "payload": { ... }, "metadata": { "userId": "u1" } }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::context::Tier;
use crate::domain::errors::{ErrorInfo, ExecutionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    ExecuteSwarm,
    ExecuteRun,
    ExecuteStep,
    CancelSwarm,
    CancelRun,
    CancelStep,
    GetStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierRequest {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    pub source: Tier,
    pub target: Tier,
    pub payload: Value,
    #[serde(default)]
    pub metadata: RequestMetadata,
}

impl TierRequest {
    pub fn new(request_type: RequestType, source: Tier, target: Tier, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_type,
            source,
            target,
            payload,
            metadata: RequestMetadata {
                timestamp: Some(Utc::now()),
                ..RequestMetadata::default()
            },
        }
    }

    /// Build a request from a typed payload.
    pub fn with_payload<T: Serialize>(
        request_type: RequestType,
        source: Tier,
        target: Tier,
        payload: &T,
    ) -> Result<Self, ExecutionError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| ExecutionError::validation(format!("unserializable payload: {e}")))?;
        Ok(Self::new(request_type, source, target, payload))
    }

    pub fn from_user(mut self, user_id: impl Into<String>) -> Self {
        self.metadata.user_id = Some(user_id.into());
        self
    }

    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ExecutionError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ExecutionError::validation(format!(
                "invalid {:?} payload: {e}",
                self.request_type
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierResponse {
    pub request_id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl TierResponse {
    pub fn ok(request_id: Uuid, data: Value) -> Self {
        Self {
            request_id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(request_id: Uuid, error: &ExecutionError) -> Self {
        Self {
            request_id,
            success: false,
            data: None,
            error: Some(error.to_info()),
        }
    }

    /// Respond with the serialized value or the error.
    pub fn from_result<T: Serialize>(request_id: Uuid, result: Result<T, ExecutionError>) -> Self {
        match result.and_then(|v| {
            serde_json::to_value(v)
                .map_err(|e| ExecutionError::validation(format!("unserializable response: {e}")))
        }) {
            Ok(data) => Self::ok(request_id, data),
            Err(e) => Self::err(request_id, &e),
        }
    }

    pub fn into_result<T: DeserializeOwned>(self) -> Result<T, ExecutionError> {
        if !self.success {
            return Err(self
                .error
                .map(|info| info.to_error())
                .unwrap_or_else(|| ExecutionError::external("remote tier", "failed without error detail")));
        }
        serde_json::from_value(self.data.unwrap_or(Value::Null))
            .map_err(|e| ExecutionError::validation(format!("unexpected response shape: {e}")))
    }
}

/// A tier that answers envelope requests.
#[async_trait]
pub trait TierHandler: Send + Sync {
    fn tier(&self) -> Tier;

    async fn handle(&self, request: TierRequest) -> TierResponse;
}
