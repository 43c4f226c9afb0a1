// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::process::RunId;
use crate::domain::repository::{Checkpoint, RepositoryError, RunRecord, RunRepository, StepRecord};

/// Run persistence for development and tests.
#[derive(Clone, Default)]
pub struct InMemoryRunRepository {
    runs: Arc<RwLock<HashMap<RunId, RunRecord>>>,
    steps: Arc<RwLock<HashMap<RunId, Vec<StepRecord>>>>,
    checkpoints: Arc<RwLock<HashMap<RunId, Vec<Checkpoint>>>>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint_count(&self, id: RunId) -> usize {
        self.checkpoints.read().get(&id).map_or(0, Vec::len)
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn save_run(&self, run: &RunRecord) -> Result<(), RepositoryError> {
        self.runs.write().insert(run.run_id, run.clone());
        Ok(())
    }

    async fn find_run(&self, id: RunId) -> Result<Option<RunRecord>, RepositoryError> {
        Ok(self.runs.read().get(&id).cloned())
    }

    async fn save_step(&self, step: &StepRecord) -> Result<(), RepositoryError> {
        self.steps.write().entry(step.run_id).or_default().push(step.clone());
        Ok(())
    }

    async fn steps_for_run(&self, id: RunId) -> Result<Vec<StepRecord>, RepositoryError> {
        Ok(self.steps.read().get(&id).cloned().unwrap_or_default())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        self.checkpoints
            .write()
            .entry(checkpoint.run_id)
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn latest_checkpoint(&self, id: RunId) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self
            .checkpoints
            .read()
            .get(&id)
            .and_then(|all| all.iter().max_by_key(|c| c.sequence).cloned()))
    }
}
