// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Strata execution core
//!
//! Runs user-defined routines under strict resource budgets.
//!
//! # Architecture
//!
//! - **Tier2** ([`application::RoutineOrchestrator`]) walks a routine's graph
//!   for one run and dispatches every leaf step to Tier3.
//! - **Tier3** ([`application::StepExecutor`]) executes one step through a
//!   pluggable strategy.
//! - Resource governance (rate limiter, tool approval, security validator)
//!   and the event bus are shared by every tier.
//!
//! Tiers talk to each other only through [`domain::communication::TierRequest`]
//! envelopes, so a tier can be replaced by anything implementing
//! [`domain::communication::TierHandler`]. The swarm tier lives in the
//! `strata-swarm` crate.

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
