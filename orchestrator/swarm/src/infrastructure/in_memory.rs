// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::repository::SwarmRepository;
use crate::domain::swarm::{SwarmId, SwarmRecord};
use strata_core::domain::repository::RepositoryError;

/// Swarm persistence for development and tests.
#[derive(Clone, Default)]
pub struct InMemorySwarmRepository {
    swarms: Arc<RwLock<HashMap<SwarmId, SwarmRecord>>>,
}

impl InMemorySwarmRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.swarms.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.swarms.read().is_empty()
    }
}

#[async_trait]
impl SwarmRepository for InMemorySwarmRepository {
    async fn save(&self, swarm: &SwarmRecord) -> Result<(), RepositoryError> {
        self.swarms.write().insert(swarm.swarm_id, swarm.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: SwarmId) -> Result<Option<SwarmRecord>, RepositoryError> {
        Ok(self.swarms.read().get(&id).cloned())
    }
}
