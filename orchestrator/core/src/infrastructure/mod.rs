// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod repositories;
pub mod routine_parser;
pub mod template_engine;

pub use event_bus::{EventBus, EventBusError, EventReceiver, SubscriptionId};
pub use repositories::InMemoryRunRepository;
pub use routine_parser::{ParsedRoutine, RoutineParseError, RoutineParser};
pub use template_engine::TemplateEngine;
