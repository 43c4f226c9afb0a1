// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0

// Minimal security validator
//
// Only two checks live here: is there an authenticated user, and does that
// user hold an exact `resource:action` permission. Every check publishes its
// inputs and outcome; anything smarter (anomaly detection, threat scoring)
// subscribes to `security.*` on the event bus.

use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::domain::context::Tier;
use crate::domain::errors::ExecutionError;
use crate::domain::events::{event_types, EventPublisher};
use crate::domain::security::{Permission, SessionUser};

pub struct MinimalSecurityValidator {
    events: Arc<dyn EventPublisher>,
    source: Tier,
}

impl MinimalSecurityValidator {
    pub fn new(events: Arc<dyn EventPublisher>, source: Tier) -> Self {
        Self { events, source }
    }

    pub fn check_authenticated(&self, user: Option<&SessionUser>) -> bool {
        let authenticated = user.is_some_and(|u| !u.id.trim().is_empty());
        debug!(authenticated, "Authentication check");
        self.events.emit(
            event_types::SECURITY_AUTHENTICATION_CHECKED,
            self.source,
            json!({
                "userId": user.map(|u| u.id.as_str()),
                "authenticated": authenticated,
            }),
        );
        authenticated
    }

    /// `permission` must be a `resource:action` string; anything else is denied.
    pub fn check_permission(&self, user: Option<&SessionUser>, permission: &str) -> bool {
        let granted = match (user, Permission::parse(permission)) {
            (Some(user), Some(parsed)) => user.has_permission(&parsed),
            _ => false,
        };
        debug!(permission, granted, "Permission check");
        self.events.emit(
            event_types::SECURITY_PERMISSION_CHECKED,
            self.source,
            json!({
                "userId": user.map(|u| u.id.as_str()),
                "permission": permission,
                "granted": granted,
            }),
        );
        granted
    }

    /// Authentication plus permission, as an error for callers that need one.
    pub fn authorize(&self, user: Option<&SessionUser>, permission: &str) -> Result<(), ExecutionError> {
        if !self.check_authenticated(user) {
            return Err(ExecutionError::validation("an authenticated user is required"));
        }
        if !self.check_permission(user, permission) {
            return Err(ExecutionError::validation(format!(
                "missing permission '{permission}'"
            )));
        }
        Ok(())
    }
}
