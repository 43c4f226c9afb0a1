// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Tool Approval Policy
//!
//! Decides whether a tool call needs human approval before it runs.
//!
//! Precedence, first match wins:
//!
//! 1. explicit per-tool override
//! 2. trusted caller, as long as the estimate stays within
//!    `max_auto_approval_credits` (above the cap evaluation falls through)
//! 3. tool risk level compared against `risk_threshold`
//! 4. `default_requires_approval`

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::domain::resources::Credits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolApprovalPolicy {
    #[serde(default = "default_true")]
    pub default_requires_approval: bool,
    #[serde(default = "default_threshold")]
    pub risk_threshold: RiskLevel,
    #[serde(default)]
    pub tool_overrides: HashMap<String, bool>,
    #[serde(default)]
    pub trusted_callers: HashSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_auto_approval_credits: Option<Credits>,
    #[serde(default)]
    pub tool_risk_levels: HashMap<String, RiskLevel>,
}

fn default_true() -> bool {
    true
}

fn default_threshold() -> RiskLevel {
    RiskLevel::Medium
}

impl Default for ToolApprovalPolicy {
    fn default() -> Self {
        Self {
            default_requires_approval: true,
            risk_threshold: RiskLevel::Medium,
            tool_overrides: HashMap::new(),
            trusted_callers: HashSet::new(),
            max_auto_approval_credits: None,
            tool_risk_levels: HashMap::new(),
        }
    }
}

impl ToolApprovalPolicy {
    pub fn with_override(mut self, tool: impl Into<String>, requires_approval: bool) -> Self {
        self.tool_overrides.insert(tool.into(), requires_approval);
        self
    }

    pub fn with_risk(mut self, tool: impl Into<String>, level: RiskLevel) -> Self {
        self.tool_risk_levels.insert(tool.into(), level);
        self
    }

    pub fn with_trusted_caller(mut self, caller: impl Into<String>) -> Self {
        self.trusted_callers.insert(caller.into());
        self
    }

    pub fn requires_approval(
        &self,
        tool_name: &str,
        caller_id: Option<&str>,
        estimated_credits: Option<Credits>,
    ) -> bool {
        if let Some(&forced) = self.tool_overrides.get(tool_name) {
            return forced;
        }

        if let Some(caller) = caller_id {
            if self.trusted_callers.contains(caller) {
                let within_cap = match (self.max_auto_approval_credits, estimated_credits) {
                    (Some(cap), Some(estimate)) => estimate <= cap,
                    _ => true,
                };
                if within_cap {
                    return false;
                }
            }
        }

        if let Some(&level) = self.tool_risk_levels.get(tool_name) {
            return level >= self.risk_threshold;
        }

        self.default_requires_approval
    }
}
