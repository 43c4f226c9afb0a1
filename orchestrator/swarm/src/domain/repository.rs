// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;

use super::swarm::{SwarmId, SwarmRecord};
use strata_core::domain::repository::RepositoryError;

/// Persistence intents for swarms. Storage lives outside the core.
#[async_trait]
pub trait SwarmRepository: Send + Sync {
    async fn save(&self, swarm: &SwarmRecord) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: SwarmId) -> Result<Option<SwarmRecord>, RepositoryError>;
}
