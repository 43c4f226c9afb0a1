// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::context::Tier;

/// Notification emitted by every state-changing operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: Tier,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl TierEvent {
    pub fn new(event_type: impl Into<String>, source: Tier, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            source,
            timestamp: Utc::now(),
            data,
            correlation_id: None,
        }
    }

    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Category before the first dot, e.g. `run` for `run.completed`.
    pub fn category(&self) -> &str {
        self.event_type
            .split_once('.')
            .map_or(self.event_type.as_str(), |(head, _)| head)
    }
}

/// Event type names.
pub mod event_types {
    pub const SWARM_STARTED: &str = "swarm.started";
    pub const SWARM_PHASE_CHANGED: &str = "swarm.phase_changed";
    pub const SWARM_COMPLETED: &str = "swarm.completed";
    pub const SWARM_FAILED: &str = "swarm.failed";
    pub const SWARM_CANCELLED: &str = "swarm.cancelled";
    pub const SWARM_DECISION_RECORDED: &str = "swarm.decision_recorded";
    pub const SWARM_CONSENSUS_RECORDED: &str = "swarm.consensus_recorded";
    pub const SWARM_CONFLICT_DETECTED: &str = "swarm.conflict_detected";
    pub const SWARM_CONFLICT_RESOLVED: &str = "swarm.conflict_resolved";

    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_COMPLETED: &str = "run.completed";
    pub const RUN_FAILED: &str = "run.failed";
    pub const RUN_CANCELLED: &str = "run.cancelled";
    pub const RUN_CHECKPOINTED: &str = "run.checkpointed";

    pub const STEP_STARTED: &str = "step.started";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const STEP_FAILED: &str = "step.failed";
    pub const STEP_SKIPPED: &str = "step.skipped";

    pub const TOOL_CALLED: &str = "tool.called";
    pub const TOOL_FAILED: &str = "tool.failed";
    pub const TOOL_APPROVAL_REQUIRED: &str = "tool.approval_required";

    pub const RATE_LIMIT_VIOLATED: &str = "rate_limit.violated";
    pub const RATE_LIMIT_BURST_USED: &str = "rate_limit.burst_used";

    pub const SECURITY_AUTHENTICATION_CHECKED: &str = "security.authentication_checked";
    pub const SECURITY_PERMISSION_CHECKED: &str = "security.permission_checked";

    pub const BUDGET_EXCEEDED: &str = "budget.exceeded";
}

/// Publishing capability handed to every component that changes state.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: TierEvent);

    fn emit(&self, event_type: &str, source: Tier, data: Value) {
        self.publish(TierEvent::new(event_type, source, data));
    }
}

/// Publisher that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: TierEvent) {}
}

/// Does `event_type` match a subscription pattern: exact, `prefix.*` or `*`.
pub fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => pattern == event_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("*", "run.completed"));
        assert!(pattern_matches("run.*", "run.completed"));
        assert!(pattern_matches("run.completed", "run.completed"));
        assert!(!pattern_matches("run.*", "runner.completed"));
        assert!(!pattern_matches("run.completed", "run.failed"));
    }

    #[test]
    fn test_event_wire_shape() {
        let event = TierEvent::new(event_types::RUN_STARTED, Tier::Tier2, serde_json::json!({"x": 1}));
        assert_eq!(event.category(), "run");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "run.started");
        assert_eq!(json["source"], "tier2");
    }
}
