// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Domain Layer
//!
//! Pure domain types for multi-agent coordination. No I/O dependencies.
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`swarm`] | `Swarm`, `SwarmId`, `SwarmConfig`, `GoalSpec`, `SwarmStatusReport` |
//! | [`planner`] | `GoalPlanner`, `StaticGoalPlanner` |
//! | [`repository`] | `SwarmRepository` |

pub mod planner;
pub mod repository;
pub mod swarm;

pub use planner::*;
pub use repository::*;
pub use swarm::*;
