// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the Strata CLI

pub mod config;
pub mod routine;
pub mod swarm;

pub use self::config::ConfigCommand;
pub use self::routine::RoutineCommand;
pub use self::swarm::SwarmCommand;
