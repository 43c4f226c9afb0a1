// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Strata CLI library - exposes the command handlers and the in-process
//! engine host so they can be tested without the binary.

pub mod commands;
pub mod embedded;
