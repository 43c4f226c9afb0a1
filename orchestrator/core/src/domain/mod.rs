// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Domain layer: pure types, invariants and collaborator traits.

pub mod communication;
pub mod config;
pub mod context;
pub mod coordination;
pub mod errors;
pub mod events;
pub mod llm;
pub mod process;
pub mod rate_limit;
pub mod repository;
pub mod resources;
pub mod routine;
pub mod security;
pub mod step;
pub mod tool_policy;
pub mod tools;
