// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Aggregate
//!
//! - [`Swarm`] — aggregate root: coordination context, budget ledger and the
//!   child runs spawned for its goals.
//! - [`SwarmId`] — unique identifier (UUID newtype).
//! - [`SwarmConfig`] — what a caller submits to start a swarm.
//!
//! # Invariants
//!
//! - Child run allocations are carved from the swarm ledger and settled
//!   exactly once when the run reports back.
//! - A terminal phase is never left.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use strata_core::domain::context::{ContextHeader, ContextMetadata, Tier};
use strata_core::domain::coordination::{CoordinationContext, SwarmPhase};
use strata_core::domain::errors::{ErrorInfo, ExecutionError};
use strata_core::domain::process::{OrchestrationPhase, RunId};
use strata_core::domain::resources::{BudgetLedger, ResourceAllocation, ResourceUsage};
use strata_core::domain::routine::Routine;
use strata_core::domain::security::SessionUser;

/// Unique identifier for a [`Swarm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SwarmId(pub Uuid);

impl SwarmId {
    /// Generate a new random `SwarmId`.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SwarmId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SwarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A participating agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl AgentSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: None,
            capabilities: Vec::new(),
        }
    }
}

/// A goal the swarm pursues, achieved by running one routine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalSpec {
    pub id: String,
    pub description: String,
    pub routine: Routine,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Share of the swarm budget for this goal's run. When absent the
    /// remaining budget is split evenly across the goals planned together.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<ResourceAllocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl GoalSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>, routine: Routine) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            routine,
            inputs: Map::new(),
            allocation: None,
            agent: None,
        }
    }

    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_allocation(mut self, allocation: ResourceAllocation) -> Self {
        self.allocation = Some(allocation);
        self
    }
}

fn default_max_failed_runs() -> u32 {
    3
}

fn default_max_replans() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptationPolicy {
    /// Failed child runs that push the swarm into `adapting`. Zero disables
    /// the threshold.
    #[serde(default = "default_max_failed_runs")]
    pub max_failed_runs: u32,
    /// How many times blocked goals may be re-planned before the swarm fails.
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
    /// Re-plan as soon as the swarm enters `adapting`.
    #[serde(default = "default_true")]
    pub auto_adapt: bool,
}

impl Default for AdaptationPolicy {
    fn default() -> Self {
        Self {
            max_failed_runs: default_max_failed_runs(),
            max_replans: default_max_replans(),
            auto_adapt: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swarm_id: Option<SwarmId>,
    pub name: String,
    /// The overall goal, decomposed by the planner.
    pub goal: String,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub goals: Vec<GoalSpec>,
    pub allocation: ResourceAllocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_user: Option<SessionUser>,
    #[serde(default)]
    pub adaptation: AdaptationPolicy,
    #[serde(default)]
    pub metadata: ContextMetadata,
}

impl SwarmConfig {
    pub fn new(name: impl Into<String>, goal: impl Into<String>, allocation: ResourceAllocation) -> Self {
        Self {
            swarm_id: None,
            name: name.into(),
            goal: goal.into(),
            agents: Vec::new(),
            goals: Vec::new(),
            allocation,
            session_user: None,
            adaptation: AdaptationPolicy::default(),
            metadata: ContextMetadata::default(),
        }
    }

    pub fn with_goal(mut self, goal: GoalSpec) -> Self {
        self.goals.push(goal);
        self
    }

    pub fn with_agent(mut self, agent: AgentSpec) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn with_user(mut self, user: SessionUser) -> Self {
        self.session_user = Some(user);
        self
    }

    /// Required fields, unique goal ids, valid routines and ceilings.
    pub fn validate(&self) -> Result<(), ExecutionError> {
        if self.name.trim().is_empty() {
            return Err(ExecutionError::validation("swarm name is required"));
        }
        if self.goal.trim().is_empty() {
            return Err(ExecutionError::validation("swarm goal is required"));
        }
        self.allocation.validate()?;
        if self.allocation.max_tokens == 0 || self.allocation.max_tool_calls == 0 {
            return Err(ExecutionError::validation(
                "max_tokens and max_tool_calls must be greater than zero",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for goal in &self.goals {
            if goal.id.trim().is_empty() {
                return Err(ExecutionError::validation("goal id is required"));
            }
            if !seen.insert(goal.id.as_str()) {
                return Err(ExecutionError::validation(format!("duplicate goal id '{}'", goal.id)));
            }
            goal.routine.validate()?;
            if let Some(allocation) = &goal.allocation {
                allocation.validate()?;
            }
        }
        Ok(())
    }
}

/// One goal as decided by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalPlan {
    pub goal_id: String,
    pub description: String,
    pub routine: Routine,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<ResourceAllocation>,
}

/// Tier2 run spawned on behalf of a goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildRun {
    pub run_id: RunId,
    pub goal_id: String,
    pub allocation: ResourceAllocation,
    pub status: OrchestrationPhase,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    /// Whether the carved allocation has been returned to the swarm ledger.
    #[serde(default)]
    pub settled: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ChildRun {
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmStatusReport {
    pub swarm_id: SwarmId,
    pub name: String,
    pub status: SwarmPhase,
    pub current_phase: SwarmPhase,
    /// Completed goals over all goals planned so far.
    pub progress: f64,
    pub active_runs: Vec<RunId>,
    pub completed_runs: Vec<RunId>,
    pub failed_runs: Vec<RunId>,
    pub errors: Vec<ErrorInfo>,
    pub resource_usage: ResourceUsage,
    pub unresolved_conflicts: usize,
}

impl SwarmStatusReport {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Persisted view of a swarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmRecord {
    pub swarm_id: SwarmId,
    pub name: String,
    pub goal: String,
    pub context: CoordinationContext,
    pub runs: Vec<ChildRun>,
    pub resource_usage: ResourceUsage,
    pub errors: Vec<ErrorInfo>,
    pub replans: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl SwarmRecord {
    pub fn phase(&self) -> SwarmPhase {
        self.context.state.phase
    }

    pub fn status_report(&self) -> SwarmStatusReport {
        let state = &self.context.state;
        let planned = state.active_goals.len() + state.completed_goals.len() + state.blocked_goals.len();
        let progress = if self.phase() == SwarmPhase::Completed {
            1.0
        } else if planned == 0 {
            0.0
        } else {
            state.completed_goals.len() as f64 / planned as f64
        };
        let with_status = |wanted: OrchestrationPhase| -> Vec<RunId> {
            self.runs
                .iter()
                .filter(|r| r.status == wanted)
                .map(|r| r.run_id)
                .collect()
        };

        SwarmStatusReport {
            swarm_id: self.swarm_id,
            name: self.name.clone(),
            status: self.phase(),
            current_phase: self.phase(),
            progress,
            active_runs: self.runs.iter().filter(|r| r.is_active()).map(|r| r.run_id).collect(),
            completed_runs: with_status(OrchestrationPhase::Completed),
            failed_runs: with_status(OrchestrationPhase::Failed),
            errors: self.errors.clone(),
            resource_usage: self.resource_usage.clone(),
            unresolved_conflicts: self.context.shared_memory.unresolved_conflicts().count(),
        }
    }

    /// Terminal with every child run's allocation returned.
    pub fn is_settled(&self) -> bool {
        self.phase().is_terminal() && self.runs.iter().all(|r| r.settled)
    }
}

/// Aggregate root for a group of cooperating agents.
#[derive(Debug, Clone)]
pub struct Swarm {
    pub id: SwarmId,
    pub config: SwarmConfig,
    pub context: CoordinationContext,
    pub ledger: BudgetLedger,
    pub runs: BTreeMap<RunId, ChildRun>,
    /// Goals planned so far, by id.
    pub plans: BTreeMap<String, GoalPlan>,
    pub failed_runs: u32,
    pub replans: u32,
    /// Set while a planner call is outstanding.
    pub planning: bool,
    pub errors: Vec<ErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Swarm {
    pub fn new(id: SwarmId, config: SwarmConfig) -> Self {
        let mut metadata = config.metadata.clone();
        if metadata.user_id.is_none() {
            metadata.user_id = config.session_user.as_ref().map(|u| u.id.clone());
        }
        Self {
            id,
            context: CoordinationContext::new(ContextHeader::new(Tier::Tier1, metadata)),
            ledger: BudgetLedger::new(config.allocation.clone()),
            config,
            runs: BTreeMap::new(),
            plans: BTreeMap::new(),
            failed_runs: 0,
            replans: 0,
            planning: false,
            errors: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn phase(&self) -> SwarmPhase {
        self.context.state.phase
    }

    /// Move to `next` if the state machine allows it. Entering a terminal
    /// phase stamps `finished_at`.
    pub fn advance(&mut self, next: SwarmPhase) -> bool {
        if !self.phase().can_transition_to(next) {
            return false;
        }
        self.context.state.phase = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }

    pub fn active_runs(&self) -> Vec<RunId> {
        self.runs.values().filter(|r| r.is_active()).map(|r| r.run_id).collect()
    }

    /// Metadata for a child run, parented to this swarm.
    pub fn child_metadata(&self) -> ContextMetadata {
        let mut metadata = self.context.header.metadata.clone();
        metadata.parent_context_id = Some(self.context.header.id);
        metadata
    }

    pub fn status_report(&self) -> SwarmStatusReport {
        self.record().status_report()
    }

    pub fn record(&self) -> SwarmRecord {
        SwarmRecord {
            swarm_id: self.id,
            name: self.config.name.clone(),
            goal: self.config.goal.clone(),
            context: self.context.clone(),
            runs: self.runs.values().cloned().collect(),
            resource_usage: self.ledger.consumed().clone(),
            errors: self.errors.clone(),
            replans: self.replans,
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use strata_core::domain::resources::Credits;
    use strata_core::domain::routine::{StepDefinition, TransformOp};

    fn routine() -> Routine {
        Routine::single_step(
            "noop",
            StepDefinition::transform(vec![TransformOp::Constant {
                output: "done".to_string(),
                value: json!(true),
            }]),
        )
    }

    fn allocation() -> ResourceAllocation {
        ResourceAllocation::new(Credits::new(100), 1_000, Duration::from_secs(30), 10)
    }

    #[test]
    fn test_config_requires_name_goal_and_unique_goals() {
        let config = SwarmConfig::new("", "ship it", allocation());
        assert!(config.validate().is_err());

        let config = SwarmConfig::new("team", " ", allocation());
        assert!(config.validate().is_err());

        let config = SwarmConfig::new("team", "ship it", allocation())
            .with_goal(GoalSpec::new("g1", "first", routine()))
            .with_goal(GoalSpec::new("g1", "again", routine()));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate goal id"));

        let mut config = SwarmConfig::new("team", "ship it", allocation());
        config.allocation.max_tool_calls = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_terminal_phase_is_final() {
        let mut swarm = Swarm::new(SwarmId::new(), SwarmConfig::new("team", "goal", allocation()));
        assert_eq!(swarm.phase(), SwarmPhase::Planning);
        assert!(swarm.advance(SwarmPhase::Cancelled));
        assert!(swarm.finished_at.is_some());
        assert!(!swarm.advance(SwarmPhase::Completed));
        assert_eq!(swarm.phase(), SwarmPhase::Cancelled);
    }

    #[test]
    fn test_progress_counts_completed_goals() {
        let mut swarm = Swarm::new(SwarmId::new(), SwarmConfig::new("team", "goal", allocation()));
        let state = &mut swarm.context.state;
        state.active_goals.insert("a".to_string());
        state.active_goals.insert("b".to_string());
        state.complete_goal("a");

        let report = swarm.status_report();
        assert!((report.progress - 0.5).abs() < 1e-9);
        assert_eq!(report.current_phase, SwarmPhase::Planning);
    }
}
