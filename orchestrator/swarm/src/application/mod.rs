// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Application layer: the Tier1 coordinator.

pub mod coordinator;

pub use coordinator::{ExecuteSwarmPayload, RunRequest, SwarmCoordinator, SwarmRef};
