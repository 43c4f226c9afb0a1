// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Tier1 Coordination Context
//!
//! Shared memory for a swarm of cooperating agents. Decision, consensus and
//! conflict records are append-only; a conflict only becomes resolved through
//! [`SharedMemory::resolve_conflict`], which is driven by external arbitration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::domain::context::ContextHeader;
use crate::domain::errors::ExecutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmPhase {
    Planning,
    Executing,
    Monitoring,
    Adapting,
    Completed,
    Cancelled,
    Failed,
}

impl SwarmPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SwarmPhase::Completed | SwarmPhase::Cancelled | SwarmPhase::Failed)
    }

    /// `planning -> executing -> monitoring -> adapting -> planning`, with any
    /// live phase able to end. Terminal phases never move again.
    pub fn can_transition_to(&self, next: SwarmPhase) -> bool {
        use SwarmPhase::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Cancelled) | (_, Failed) => true,
            (Planning, Executing)
            | (Executing, Monitoring)
            | (Monitoring, Adapting)
            | (Monitoring, Completed)
            | (Adapting, Planning) => true,
            // A plan with nothing to run completes straight away.
            (Planning, Completed) | (Executing, Completed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SwarmPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SwarmPhase::Planning => "planning",
            SwarmPhase::Executing => "executing",
            SwarmPhase::Monitoring => "monitoring",
            SwarmPhase::Adapting => "adapting",
            SwarmPhase::Completed => "completed",
            SwarmPhase::Cancelled => "cancelled",
            SwarmPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: Uuid,
    pub agent_id: String,
    pub goal_id: String,
    /// The option the agent chose; two agents disagree when these differ.
    pub choice: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    pub recorded_at: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn new(agent_id: impl Into<String>, goal_id: impl Into<String>, choice: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            goal_id: goal_id.into(),
            choice: choice.into(),
            rationale: None,
            confidence: 1.0,
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub agent_id: String,
    /// Normalized to 0..=1.
    pub score: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRecord {
    pub id: Uuid,
    pub topic: String,
    pub participants: Vec<String>,
    pub votes: Vec<Vote>,
    pub score: f64,
    /// 1.0 when every vote agrees, 0.0 at maximal variance.
    pub agreement: f64,
    pub confidence: f64,
    pub recorded_at: DateTime<Utc>,
}

impl ConsensusRecord {
    /// Average score with a variance penalty on confidence.
    ///
    /// Variance of scores in `[0, 1]` is at most 0.25, so
    /// `agreement = 1 - min(variance / 0.25, 1)` and
    /// `confidence = 0.7 * agreement + 0.3 * mean(vote confidence)`.
    pub fn aggregate(topic: impl Into<String>, votes: Vec<Vote>) -> Result<Self, ExecutionError> {
        if votes.is_empty() {
            return Err(ExecutionError::validation("consensus needs at least one vote"));
        }
        if let Some(bad) = votes
            .iter()
            .find(|v| !(0.0..=1.0).contains(&v.score) || !(0.0..=1.0).contains(&v.confidence))
        {
            return Err(ExecutionError::validation(format!(
                "vote from '{}' is outside 0..=1",
                bad.agent_id
            )));
        }

        let count = votes.len() as f64;
        let score = votes.iter().map(|v| v.score).sum::<f64>() / count;
        let variance = votes.iter().map(|v| (v.score - score).powi(2)).sum::<f64>() / count;
        let agreement = 1.0 - (variance / 0.25).min(1.0);
        let mean_confidence = votes.iter().map(|v| v.confidence).sum::<f64>() / count;

        Ok(Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            participants: votes.iter().map(|v| v.agent_id.clone()).collect(),
            votes,
            score,
            agreement,
            confidence: agreement * 0.7 + mean_confidence * 0.3,
            recorded_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    DecisionDisagreement,
    ResourceContention,
    GoalOverlap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub parties: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedMemory {
    pub blackboard: Map<String, Value>,
    pub decisions: Vec<DecisionRecord>,
    pub consensus: Vec<ConsensusRecord>,
    pub conflicts: Vec<ConflictRecord>,
}

impl SharedMemory {
    /// Append a decision. Returns the conflict it raised when another agent
    /// already chose differently for the same goal.
    pub fn record_decision(&mut self, decision: DecisionRecord) -> Option<ConflictRecord> {
        let disagreeing: BTreeSet<String> = self
            .decisions
            .iter()
            .filter(|d| {
                d.goal_id == decision.goal_id
                    && d.agent_id != decision.agent_id
                    && d.choice != decision.choice
            })
            .map(|d| d.agent_id.clone())
            .collect();

        let conflict = (!disagreeing.is_empty()).then(|| {
            let mut parties: Vec<String> = disagreeing.into_iter().collect();
            parties.push(decision.agent_id.clone());
            ConflictRecord {
                id: Uuid::new_v4(),
                conflict_type: ConflictType::DecisionDisagreement,
                description: format!(
                    "agent '{}' chose '{}' for goal '{}', conflicting with {}",
                    decision.agent_id,
                    decision.choice,
                    decision.goal_id,
                    parties[..parties.len() - 1].join(", ")
                ),
                parties,
                goal_id: Some(decision.goal_id.clone()),
                resolution: None,
                resolved: false,
                resolved_by: None,
                detected_at: Utc::now(),
                resolved_at: None,
            }
        });

        self.decisions.push(decision);
        if let Some(c) = &conflict {
            self.conflicts.push(c.clone());
        }
        conflict
    }

    pub fn record_consensus(&mut self, record: ConsensusRecord) {
        self.consensus.push(record);
    }

    pub fn resolve_conflict(
        &mut self,
        conflict_id: Uuid,
        resolution: impl Into<String>,
        arbiter: impl Into<String>,
    ) -> Result<&ConflictRecord, ExecutionError> {
        let conflict = self
            .conflicts
            .iter_mut()
            .find(|c| c.id == conflict_id)
            .ok_or_else(|| ExecutionError::not_found("conflict", conflict_id))?;
        if conflict.resolved {
            return Err(ExecutionError::validation(format!(
                "conflict {conflict_id} is already resolved"
            )));
        }
        conflict.resolution = Some(resolution.into());
        conflict.resolved_by = Some(arbiter.into());
        conflict.resolved = true;
        conflict.resolved_at = Some(Utc::now());
        Ok(conflict)
    }

    pub fn unresolved_conflicts(&self) -> impl Iterator<Item = &ConflictRecord> {
        self.conflicts.iter().filter(|c| !c.resolved)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationState {
    pub phase: SwarmPhase,
    pub active_goals: BTreeSet<String>,
    pub completed_goals: BTreeSet<String>,
    pub blocked_goals: BTreeSet<String>,
}

impl Default for CoordinationState {
    fn default() -> Self {
        Self {
            phase: SwarmPhase::Planning,
            active_goals: BTreeSet::new(),
            completed_goals: BTreeSet::new(),
            blocked_goals: BTreeSet::new(),
        }
    }
}

impl CoordinationState {
    pub fn complete_goal(&mut self, goal_id: &str) {
        self.active_goals.remove(goal_id);
        self.blocked_goals.remove(goal_id);
        self.completed_goals.insert(goal_id.to_string());
    }

    pub fn block_goal(&mut self, goal_id: &str) {
        self.active_goals.remove(goal_id);
        self.blocked_goals.insert(goal_id.to_string());
    }

    /// Every goal that is not completed is blocked.
    pub fn all_remaining_blocked(&self) -> bool {
        self.active_goals.is_empty() && !self.blocked_goals.is_empty()
    }

    pub fn is_exhausted(&self) -> bool {
        self.active_goals.is_empty() && self.blocked_goals.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationContext {
    pub header: ContextHeader,
    pub shared_memory: SharedMemory,
    pub state: CoordinationState,
}

impl CoordinationContext {
    pub fn new(header: ContextHeader) -> Self {
        Self {
            header,
            shared_memory: SharedMemory::default(),
            state: CoordinationState::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        assert!(SwarmPhase::Planning.can_transition_to(SwarmPhase::Executing));
        assert!(SwarmPhase::Adapting.can_transition_to(SwarmPhase::Planning));
        assert!(SwarmPhase::Monitoring.can_transition_to(SwarmPhase::Cancelled));
        assert!(!SwarmPhase::Planning.can_transition_to(SwarmPhase::Monitoring));
        assert!(!SwarmPhase::Cancelled.can_transition_to(SwarmPhase::Completed));
        assert!(!SwarmPhase::Completed.can_transition_to(SwarmPhase::Failed));
    }

    #[test]
    fn test_disagreeing_decisions_raise_unresolved_conflict() {
        let mut memory = SharedMemory::default();
        assert!(memory.record_decision(DecisionRecord::new("a1", "g1", "plan-a")).is_none());
        assert!(memory.record_decision(DecisionRecord::new("a2", "g1", "plan-a")).is_none());

        let conflict = memory
            .record_decision(DecisionRecord::new("a3", "g1", "plan-b"))
            .unwrap();
        assert_eq!(conflict.parties, vec!["a1", "a2", "a3"]);
        assert!(!conflict.resolved);
        assert_eq!(memory.decisions.len(), 3);
        assert_eq!(memory.unresolved_conflicts().count(), 1);
    }

    #[test]
    fn test_conflict_resolves_once() {
        let mut memory = SharedMemory::default();
        memory.record_decision(DecisionRecord::new("a1", "g1", "x"));
        let conflict = memory.record_decision(DecisionRecord::new("a2", "g1", "y")).unwrap();

        let resolved = memory.resolve_conflict(conflict.id, "take x", "human").unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.resolution.as_deref(), Some("take x"));

        let err = memory.resolve_conflict(conflict.id, "take y", "human").unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_consensus_penalizes_disagreement() {
        let unanimous = ConsensusRecord::aggregate(
            "ship",
            vec![
                Vote { agent_id: "a".into(), score: 0.8, confidence: 1.0 },
                Vote { agent_id: "b".into(), score: 0.8, confidence: 1.0 },
            ],
        )
        .unwrap();
        assert!((unanimous.agreement - 1.0).abs() < 1e-9);
        assert!((unanimous.confidence - 1.0).abs() < 1e-9);

        let split = ConsensusRecord::aggregate(
            "ship",
            vec![
                Vote { agent_id: "a".into(), score: 0.0, confidence: 1.0 },
                Vote { agent_id: "b".into(), score: 1.0, confidence: 1.0 },
            ],
        )
        .unwrap();
        assert!((split.score - 0.5).abs() < 1e-9);
        assert!(split.agreement.abs() < 1e-9);
        assert!((split.confidence - 0.3).abs() < 1e-9);
    }
}
