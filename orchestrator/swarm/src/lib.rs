// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # `strata-swarm` — Tier1 swarm coordination
//!
//! A swarm is a group of agents working towards one goal. The coordinator
//! splits that goal into goal plans, runs each plan as a Tier2 routine run
//! carved from the swarm budget, and re-plans blocked goals until the swarm
//! completes, fails or is cancelled.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | `Swarm`, `SwarmConfig`, `GoalPlanner`, `SwarmRepository` |
//! | [`application`] | Application | `SwarmCoordinator` (a Tier1 `TierHandler`) |
//! | [`infrastructure`] | Infrastructure | `InMemorySwarmRepository` |
//!
//! Decisions, consensus and conflicts live in the swarm's shared memory
//! (`strata_core::domain::coordination`). Conflicts are only ever resolved
//! through [`SwarmCoordinator::resolve_conflict`].

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::SwarmCoordinator;
pub use domain::*;
