// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Execution Contexts
//!
//! Every tier owns a context made of a shared [`ContextHeader`] plus a
//! tier-specific payload:
//!
//! | Tier | Payload | Module |
//! |------|---------|--------|
//! | Tier1 | `CoordinationContext` | [`crate::domain::coordination`] |
//! | Tier2 | `ProcessContext` | [`crate::domain::process`] |
//! | Tier3 | [`StepContext`] | this module |
//!
//! Contexts are owned by their originating tier; only [`ContextSnapshot`]s are
//! handed to the persistence collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::step::{StrategyType, ToolCallRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Tier1,
    Tier2,
    Tier3,
    External,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Tier::Tier1 => "tier1",
            Tier::Tier2 => "tier2",
            Tier::Tier3 => "tier3",
            Tier::External => "external",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(pub Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_context_id: Option<ContextId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl ContextMetadata {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextHeader {
    pub id: ContextId,
    pub tier: Tier,
    pub timestamp: DateTime<Utc>,
    pub metadata: ContextMetadata,
}

impl ContextHeader {
    pub fn new(tier: Tier, metadata: ContextMetadata) -> Self {
        Self {
            id: ContextId::new(),
            tier,
            timestamp: Utc::now(),
            metadata,
        }
    }

    /// Header for a context spawned beneath this one. User, session and tags
    /// are inherited; the parent link points back here.
    pub fn child(&self, tier: Tier) -> Self {
        let mut metadata = self.metadata.clone();
        metadata.parent_context_id = Some(self.id);
        Self::new(tier, metadata)
    }
}

/// Serialized copy of a tier context, written by the checkpoint path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub context_id: ContextId,
    pub tier: Tier,
    pub taken_at: DateTime<Utc>,
    pub state: Value,
}

impl ContextSnapshot {
    pub fn capture<T: Serialize>(header: &ContextHeader, payload: &T) -> serde_json::Result<Self> {
        Ok(Self {
            context_id: header.id,
            tier: header.tier,
            taken_at: Utc::now(),
            state: serde_json::to_value(payload)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tier3
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMemory {
    pub inputs: Map<String, Value>,
    pub outputs: Map<String, Value>,
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default)]
    pub strategy_data: HashMap<String, Value>,
    #[serde(default)]
    pub learning_data: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationMode {
    #[default]
    Fixed,
    Adaptive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationState {
    pub mode: AdaptationMode,
    pub current_strategy: StrategyType,
    pub confidence_threshold: f64,
}

impl AdaptationState {
    pub fn fixed(strategy: StrategyType, confidence_threshold: f64) -> Self {
        Self {
            mode: AdaptationMode::Fixed,
            current_strategy: strategy,
            confidence_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepContext {
    pub header: ContextHeader,
    pub memory: ExecutionMemory,
    pub adaptation: AdaptationState,
}

impl StepContext {
    pub fn new(
        header: ContextHeader,
        inputs: Map<String, Value>,
        adaptation: AdaptationState,
    ) -> Self {
        Self {
            header,
            memory: ExecutionMemory {
                inputs,
                ..ExecutionMemory::default()
            },
            adaptation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_header_links_parent_and_inherits_user() {
        let root = ContextHeader::new(Tier::Tier1, ContextMetadata::for_user("alice"));
        let child = root.child(Tier::Tier2);

        assert_eq!(child.tier, Tier::Tier2);
        assert_eq!(child.metadata.parent_context_id, Some(root.id));
        assert_eq!(child.metadata.user_id.as_deref(), Some("alice"));
        assert_ne!(child.id, root.id);
    }

    #[test]
    fn test_metadata_serializes_camel_case() {
        let mut metadata = ContextMetadata::for_user("u1");
        metadata.session_id = Some("s1".into());
        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["sessionId"], "s1");
        assert!(json.get("tags").is_none());
    }
}
