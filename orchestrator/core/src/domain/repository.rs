// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Persistence Collaborator
//!
//! The core only issues read/write intents; transactional storage lives
//! outside it.
//!
//! | Trait | Records | Implementations |
//! |-------|---------|----------------|
//! | `RunRepository` | [`RunRecord`], [`StepRecord`], [`Checkpoint`] | `InMemoryRunRepository` |
//! | `SwarmRepository` (strata-swarm) | `Swarm` | `InMemorySwarmRepository` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::context::ContextSnapshot;
use crate::domain::errors::{ErrorInfo, ExecutionError};
use crate::domain::process::{OrchestrationPhase, RunId};
use crate::domain::resources::ResourceUsage;
use crate::domain::step::StepExecutionResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub routine_id: String,
    pub status: OrchestrationPhase,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    #[serde(default)]
    pub errors: Vec<ErrorInfo>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: RunId,
    pub location: String,
    pub result: StepExecutionResult,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub run_id: RunId,
    pub sequence: u32,
    pub snapshot: ContextSnapshot,
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn save_run(&self, run: &RunRecord) -> Result<(), RepositoryError>;

    async fn find_run(&self, id: RunId) -> Result<Option<RunRecord>, RepositoryError>;

    async fn save_step(&self, step: &StepRecord) -> Result<(), RepositoryError>;

    async fn steps_for_run(&self, id: RunId) -> Result<Vec<StepRecord>, RepositoryError>;

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError>;

    async fn latest_checkpoint(&self, id: RunId) -> Result<Option<Checkpoint>, RepositoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

impl From<RepositoryError> for ExecutionError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(id) => ExecutionError::not_found("record", id),
            other => ExecutionError::external("persistence", other),
        }
    }
}
