// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod in_memory;

pub use in_memory::InMemorySwarmRepository;
