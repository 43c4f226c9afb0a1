// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Tier2 Process Context
//!
//! Navigation, memory and orchestration state for one run.
//!
//! - `visited_locations` is a set. Entering a visited location is only legal
//!   through a loop edge; plain linear flow that comes back is rejected.
//! - A [`BranchState`] tracks the steps beneath a parallel node and only
//!   reports `completed` once every branch finished and every step beneath it
//!   is terminal.
//! - Once the orchestration phase is terminal it never changes again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use crate::domain::context::ContextHeader;
use crate::domain::errors::ExecutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node inside a (possibly nested) graph scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub scope: String,
    pub node_id: String,
}

impl Location {
    pub fn new(scope: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            node_id: node_id.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.scope, self.node_id)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.node_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchState {
    pub parallel: bool,
    pub total_branches: usize,
    pub finished_branches: usize,
    pub steps: BTreeMap<String, StepStatus>,
    pub status: BranchStatus,
}

impl BranchState {
    pub fn new(parallel: bool, total_branches: usize) -> Self {
        Self {
            parallel,
            total_branches,
            finished_branches: 0,
            steps: BTreeMap::new(),
            status: BranchStatus::Active,
        }
    }

    pub fn track_step(&mut self, key: impl Into<String>, status: StepStatus) {
        self.steps.insert(key.into(), status);
        self.refresh();
    }

    pub fn branch_finished(&mut self) {
        self.finished_branches = (self.finished_branches + 1).min(self.total_branches);
        self.refresh();
    }

    pub fn mark_failed(&mut self) {
        self.status = BranchStatus::Failed;
    }

    fn refresh(&mut self) {
        if self.status == BranchStatus::Failed {
            return;
        }
        let settled = self.finished_branches == self.total_branches
            && self.steps.values().all(StepStatus::is_terminal);
        self.status = if settled {
            BranchStatus::Completed
        } else {
            BranchStatus::Active
        };
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NavigationState {
    pub current_location: Option<Location>,
    pub location_stack: Vec<Location>,
    pub visited_locations: BTreeSet<Location>,
    pub branch_states: BTreeMap<String, BranchState>,
    /// Times each loop edge has been taken, keyed by `scope/from->to`.
    pub loop_counters: BTreeMap<String, u32>,
}

impl NavigationState {
    /// Move to `location`. A revisit is only allowed when the caller arrived
    /// through a loop edge.
    pub fn enter(&mut self, location: Location, via_loop: bool) -> Result<(), ExecutionError> {
        if self.visited_locations.contains(&location) && !via_loop {
            return Err(ExecutionError::validation(format!(
                "location {location} was already visited and the edge into it is not a loop"
            )));
        }
        self.visited_locations.insert(location.clone());
        self.current_location = Some(location);
        Ok(())
    }

    pub fn has_visited(&self, location: &Location) -> bool {
        self.visited_locations.contains(location)
    }

    /// Count one traversal of a loop edge. Returns false once `limit` is used up.
    pub fn take_loop(&mut self, edge_key: &str, limit: u32) -> bool {
        let taken = self.loop_counters.entry(edge_key.to_string()).or_insert(0);
        if *taken >= limit {
            return false;
        }
        *taken += 1;
        true
    }

    pub fn push_scope(&mut self, location: Location) {
        self.location_stack.push(location);
    }

    pub fn pop_scope(&mut self) -> Option<Location> {
        self.location_stack.pop()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMarker {
    pub id: Uuid,
    pub sequence: u32,
    pub completed_steps: usize,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceData {
    pub steps_completed: u64,
    pub steps_failed: u64,
    pub total_step_ms: u64,
    pub tool_calls: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessMemory {
    pub variables: Map<String, Value>,
    pub checkpoints: Vec<CheckpointMarker>,
    pub performance: PerformanceData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationPhase {
    Initializing,
    Navigating,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl OrchestrationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationPhase::Completed | OrchestrationPhase::Failed | OrchestrationPhase::Cancelled
        )
    }
}

impl fmt::Display for OrchestrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrchestrationPhase::Initializing => "initializing",
            OrchestrationPhase::Navigating => "navigating",
            OrchestrationPhase::Executing => "executing",
            OrchestrationPhase::Completed => "completed",
            OrchestrationPhase::Failed => "failed",
            OrchestrationPhase::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub phase: OrchestrationPhase,
    pub active_steps: BTreeSet<String>,
    pub pending_steps: BTreeSet<String>,
    pub completed_steps: BTreeSet<String>,
    pub failed_steps: BTreeSet<String>,
    pub cancelled_steps: BTreeSet<String>,
    pub skipped_steps: BTreeSet<String>,
}

impl Default for OrchestrationState {
    fn default() -> Self {
        Self {
            phase: OrchestrationPhase::Initializing,
            active_steps: BTreeSet::new(),
            pending_steps: BTreeSet::new(),
            completed_steps: BTreeSet::new(),
            failed_steps: BTreeSet::new(),
            cancelled_steps: BTreeSet::new(),
            skipped_steps: BTreeSet::new(),
        }
    }
}

impl OrchestrationState {
    /// Change phase unless already terminal. Returns whether it changed.
    pub fn advance(&mut self, next: OrchestrationPhase) -> bool {
        if self.phase.is_terminal() || self.phase == next {
            return false;
        }
        self.phase = next;
        true
    }

    fn clear(&mut self, key: &str) {
        self.active_steps.remove(key);
        self.pending_steps.remove(key);
    }

    pub fn mark_pending(&mut self, key: &str) {
        self.pending_steps.insert(key.to_string());
    }

    pub fn mark_active(&mut self, key: &str) {
        self.pending_steps.remove(key);
        self.active_steps.insert(key.to_string());
    }

    pub fn mark_completed(&mut self, key: &str) {
        self.clear(key);
        self.failed_steps.remove(key);
        self.completed_steps.insert(key.to_string());
    }

    pub fn mark_failed(&mut self, key: &str) {
        self.clear(key);
        self.failed_steps.insert(key.to_string());
    }

    pub fn mark_skipped(&mut self, key: &str) {
        self.clear(key);
        self.skipped_steps.insert(key.to_string());
    }

    /// Move every active and pending step to cancelled, leaving completed
    /// steps alone. Returns the steps that were active.
    pub fn cancel_outstanding(&mut self) -> Vec<String> {
        let active: Vec<String> = std::mem::take(&mut self.active_steps).into_iter().collect();
        let pending = std::mem::take(&mut self.pending_steps);
        self.cancelled_steps.extend(active.iter().cloned());
        self.cancelled_steps.extend(pending);
        active
    }

    pub fn status_of(&self, key: &str) -> Option<StepStatus> {
        if self.completed_steps.contains(key) {
            Some(StepStatus::Completed)
        } else if self.failed_steps.contains(key) {
            Some(StepStatus::Failed)
        } else if self.cancelled_steps.contains(key) {
            Some(StepStatus::Cancelled)
        } else if self.skipped_steps.contains(key) {
            Some(StepStatus::Skipped)
        } else if self.active_steps.contains(key) {
            Some(StepStatus::Active)
        } else if self.pending_steps.contains(key) {
            Some(StepStatus::Pending)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessContext {
    pub header: ContextHeader,
    pub navigation: NavigationState,
    pub memory: ProcessMemory,
    pub orchestration: OrchestrationState,
}

impl ProcessContext {
    pub fn new(header: ContextHeader, variables: Map<String, Value>) -> Self {
        Self {
            header,
            navigation: NavigationState::default(),
            memory: ProcessMemory {
                variables,
                ..ProcessMemory::default()
            },
            orchestration: OrchestrationState::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_revisit_is_rejected() {
        let mut nav = NavigationState::default();
        let loc = Location::new("root", "a");
        nav.enter(loc.clone(), false).unwrap();

        let err = nav.enter(loc.clone(), false).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(nav.enter(loc, true).is_ok());
    }

    #[test]
    fn test_loop_counter_stops_at_limit() {
        let mut nav = NavigationState::default();
        assert!(nav.take_loop("root/b->a", 2));
        assert!(nav.take_loop("root/b->a", 2));
        assert!(!nav.take_loop("root/b->a", 2));
    }

    #[test]
    fn test_branch_completes_only_when_all_steps_terminal() {
        let mut branch = BranchState::new(true, 2);
        branch.track_step("p[0]/a", StepStatus::Active);
        branch.track_step("p[1]/b", StepStatus::Completed);
        branch.branch_finished();
        assert_eq!(branch.status, BranchStatus::Active);

        branch.track_step("p[0]/a", StepStatus::Completed);
        assert_eq!(branch.status, BranchStatus::Active);
        branch.branch_finished();
        assert_eq!(branch.status, BranchStatus::Completed);
    }

    #[test]
    fn test_terminal_phase_is_sticky() {
        let mut state = OrchestrationState::default();
        assert!(state.advance(OrchestrationPhase::Navigating));
        assert!(state.advance(OrchestrationPhase::Cancelled));
        assert!(!state.advance(OrchestrationPhase::Completed));
        assert_eq!(state.phase, OrchestrationPhase::Cancelled);
    }

    #[test]
    fn test_cancel_outstanding_keeps_completed() {
        let mut state = OrchestrationState::default();
        state.mark_active("a");
        state.mark_completed("a");
        state.mark_active("b");
        state.mark_pending("c");

        let active = state.cancel_outstanding();
        assert_eq!(active, vec!["b".to_string()]);
        assert!(state.completed_steps.contains("a"));
        assert_eq!(state.status_of("c"), Some(StepStatus::Cancelled));
    }
}
