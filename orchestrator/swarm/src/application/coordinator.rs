// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Coordinator (Tier1)
//!
//! Decomposes a swarm goal into goal plans, spawns one Tier2 run per goal and
//! follows the runs to a swarm-level outcome.
//!
//! ```text
//! planning ──► executing ──► monitoring ──► completed
//!    ▲                           │
//!    └──────── adapting ◄────────┘        (any live phase) ──► cancelled | failed
//! ```
//!
//! Child runs are dispatched as `execute_run` envelopes on their own tasks;
//! when a run reports back its usage is settled against the swarm ledger and
//! its outputs land on the blackboard under the goal id. Every operation that
//! touches a live swarm first checks the swarm deadline.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::planner::GoalPlanner;
use crate::domain::repository::SwarmRepository;
use crate::domain::swarm::{ChildRun, Swarm, SwarmConfig, SwarmId, SwarmRecord, SwarmStatusReport};
use strata_core::application::routine_orchestrator::{ExecuteRunPayload, RunConfig, RunOutcome, RunRef};
use strata_core::domain::communication::{RequestType, TierHandler, TierRequest, TierResponse};
use strata_core::domain::context::Tier;
use strata_core::domain::coordination::{ConflictRecord, ConsensusRecord, DecisionRecord, SwarmPhase, Vote};
use strata_core::domain::errors::{BudgetResource, ExecutionError};
use strata_core::domain::events::{event_types, EventPublisher};
use strata_core::domain::process::{OrchestrationPhase, RunId};
use strata_core::domain::resources::{ResourceAllocation, ResourceUsage};
use strata_core::domain::routine::Routine;

/// One child run requested against a swarm's remaining budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub goal_id: String,
    pub routine: Routine,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    pub allocation: ResourceAllocation,
}

/// Envelope payload for `execute_swarm`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteSwarmPayload {
    #[serde(flatten)]
    pub config: SwarmConfig,
    #[serde(default)]
    pub await_completion: bool,
}

/// Envelope payload for `cancel_swarm` and `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmRef {
    pub swarm_id: SwarmId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

struct SwarmHandle {
    state: Mutex<Swarm>,
    finished: Notify,
}

struct Inner {
    tier2: Arc<dyn TierHandler>,
    planner: Arc<dyn GoalPlanner>,
    repository: Arc<dyn SwarmRepository>,
    events: Arc<dyn EventPublisher>,
    /// Live swarms. A swarm leaves once terminal with every child settled;
    /// later reads are answered from the repository.
    swarms: DashMap<SwarmId, Arc<SwarmHandle>>,
}

#[derive(Clone)]
pub struct SwarmCoordinator {
    inner: Arc<Inner>,
}

impl SwarmCoordinator {
    pub fn new(
        tier2: Arc<dyn TierHandler>,
        planner: Arc<dyn GoalPlanner>,
        repository: Arc<dyn SwarmRepository>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tier2,
                planner,
                repository,
                events,
                swarms: DashMap::new(),
            }),
        }
    }

    fn handle_of(&self, swarm_id: SwarmId) -> Result<Arc<SwarmHandle>, ExecutionError> {
        self.inner
            .swarms
            .get(&swarm_id)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| ExecutionError::not_found("swarm", swarm_id))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    #[instrument(skip(self, config), fields(swarm = %config.name))]
    pub async fn start_swarm(&self, config: SwarmConfig) -> Result<SwarmId, ExecutionError> {
        config.validate()?;
        let swarm_id = config.swarm_id.unwrap_or_default();
        if self.inner.repository.find_by_id(swarm_id).await?.is_some() {
            return Err(ExecutionError::validation(format!("swarm {swarm_id} already exists")));
        }
        let swarm = Swarm::new(swarm_id, config);
        let record = swarm.record();
        let (name, goals, max_credits) = (
            swarm.config.name.clone(),
            swarm.config.goals.len(),
            swarm.config.allocation.max_credits,
        );

        match self.inner.swarms.entry(swarm_id) {
            Entry::Occupied(_) => {
                return Err(ExecutionError::validation(format!("swarm {swarm_id} already exists")));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(SwarmHandle {
                    state: Mutex::new(swarm),
                    finished: Notify::new(),
                }));
            }
        }
        gauge!("strata_swarms_active").increment(1.0);

        info!(swarm_id = %swarm_id, name = %name, goals, "Swarm started");
        self.inner.events.emit(
            event_types::SWARM_STARTED,
            Tier::Tier1,
            json!({
                "swarmId": swarm_id,
                "name": name,
                "goals": goals,
                "maxCredits": max_credits,
            }),
        );
        self.save(&record).await;
        Ok(swarm_id)
    }

    /// Plan the pending goals and spawn one run per plan.
    ///
    /// The first call plans every configured goal; after an adaptation only
    /// the blocked goals are planned again.
    #[instrument(skip(self), fields(swarm_id = %swarm_id))]
    pub async fn plan_swarm(&self, swarm_id: SwarmId) -> Result<SwarmStatusReport, ExecutionError> {
        let handle = self.handle_of(swarm_id)?;
        self.enforce_deadline(swarm_id, &handle).await?;

        let (config, pending) = {
            let mut swarm = handle.state.lock();
            if swarm.phase() != SwarmPhase::Planning || swarm.planning {
                return Err(ExecutionError::validation(format!(
                    "swarm {swarm_id} is not waiting for a plan (phase {})",
                    swarm.phase()
                )));
            }
            swarm.planning = true;
            let pending: Vec<String> = if swarm.plans.is_empty() {
                swarm.config.goals.iter().map(|g| g.id.clone()).collect()
            } else {
                swarm.context.state.blocked_goals.iter().cloned().collect()
            };
            (swarm.config.clone(), pending)
        };

        let planned = self.inner.planner.plan(&config, &pending).await;

        let requests = {
            let mut swarm = handle.state.lock();
            swarm.planning = false;
            let plans = planned?;
            if swarm.phase() != SwarmPhase::Planning {
                return Err(ExecutionError::cancelled(format!(
                    "swarm {swarm_id} left planning while the planner ran"
                )));
            }

            // Goals without their own allocation share what is left evenly.
            let share = {
                let remaining = swarm.ledger.remaining();
                let parts = plans.len().max(1) as u32;
                ResourceAllocation {
                    max_credits: remaining.max_credits.split(parts),
                    max_tokens: remaining.max_tokens / u64::from(parts),
                    max_tool_calls: remaining.max_tool_calls / parts,
                    ..remaining
                }
            };

            let mut requests = Vec::with_capacity(plans.len());
            for plan in plans {
                let state = &mut swarm.context.state;
                state.blocked_goals.remove(&plan.goal_id);
                state.completed_goals.remove(&plan.goal_id);
                state.active_goals.insert(plan.goal_id.clone());
                requests.push(RunRequest {
                    goal_id: plan.goal_id.clone(),
                    routine: plan.routine.clone(),
                    inputs: plan.inputs.clone(),
                    allocation: plan.allocation.clone().unwrap_or_else(|| share.clone()),
                });
                swarm.plans.insert(plan.goal_id.clone(), plan);
            }

            if requests.is_empty() {
                info!(swarm_id = %swarm_id, "Planner produced no goals");
                self.transition(&mut swarm, SwarmPhase::Completed);
            } else {
                self.transition(&mut swarm, SwarmPhase::Executing);
            }
            requests
        };
        if requests.is_empty() {
            self.persist(&handle).await;
            return self.get_swarm_status(swarm_id).await;
        }

        for request in requests {
            let goal_id = request.goal_id.clone();
            if let Err(err) = self.request_run_execution(swarm_id, request).await {
                if handle.state.lock().phase().is_terminal() {
                    debug!(swarm_id = %swarm_id, goal = %goal_id, "Swarm ended while spawning runs");
                    return self.get_swarm_status(swarm_id).await;
                }
                warn!(swarm_id = %swarm_id, goal = %goal_id, error = %err, "Could not spawn goal run");
                self.fail_swarm(swarm_id, &handle, &err).await;
                return Err(err);
            }
        }

        let adapt = {
            let mut swarm = handle.state.lock();
            self.transition(&mut swarm, SwarmPhase::Monitoring);
            self.evaluate(&mut swarm)
        };
        self.persist(&handle).await;
        if adapt {
            self.adaptation_task(swarm_id).await;
        }
        self.get_swarm_status(swarm_id).await
    }

    /// Spawn a Tier2 run carved from the swarm's remaining budget.
    #[instrument(skip(self, request), fields(swarm_id = %swarm_id, goal = %request.goal_id))]
    pub async fn request_run_execution(
        &self,
        swarm_id: SwarmId,
        request: RunRequest,
    ) -> Result<RunId, ExecutionError> {
        let handle = self.handle_of(swarm_id)?;
        self.enforce_deadline(swarm_id, &handle).await?;

        let (run_id, envelope) = {
            let mut swarm = handle.state.lock();
            if swarm.phase().is_terminal() {
                return Err(ExecutionError::validation(format!(
                    "swarm {swarm_id} is {}",
                    swarm.phase()
                )));
            }
            let allocation = swarm.ledger.carve(&request.allocation)?;
            let run_id = RunId::new();
            let user_id = swarm.context.header.metadata.user_id.clone();
            let payload = ExecuteRunPayload {
                config: RunConfig {
                    run_id: Some(run_id),
                    routine: request.routine,
                    inputs: request.inputs,
                    allocation: allocation.clone(),
                    session_user: swarm.config.session_user.clone(),
                    metadata: swarm.child_metadata(),
                    dry_run: false,
                    required_permission: None,
                },
                await_completion: true,
            };
            let envelope = match TierRequest::with_payload(RequestType::ExecuteRun, Tier::Tier1, Tier::Tier2, &payload) {
                Ok(envelope) => envelope.correlated(swarm_id.to_string()),
                Err(err) => {
                    swarm.ledger.settle(&allocation, &ResourceUsage::default());
                    return Err(err);
                }
            };
            let envelope = match user_id {
                Some(user) => envelope.from_user(user),
                None => envelope,
            };

            let state = &mut swarm.context.state;
            state.blocked_goals.remove(&request.goal_id);
            state.active_goals.insert(request.goal_id.clone());
            swarm.runs.insert(
                run_id,
                ChildRun {
                    run_id,
                    goal_id: request.goal_id.clone(),
                    allocation,
                    status: OrchestrationPhase::Initializing,
                    outputs: Map::new(),
                    resource_usage: ResourceUsage::default(),
                    settled: false,
                    started_at: chrono::Utc::now(),
                    finished_at: None,
                },
            );
            (run_id, envelope)
        };

        counter!("strata_swarm_runs_total", "status" => "started").increment(1);
        info!(swarm_id = %swarm_id, run_id = %run_id, goal = %request.goal_id, "Spawned child run");
        tokio::spawn(self.watch_run(swarm_id, run_id, envelope));
        Ok(run_id)
    }

    /// Return blocked goals to planning, or fail the swarm once the re-plan
    /// budget is spent.
    #[instrument(skip(self), fields(swarm_id = %swarm_id))]
    pub async fn adapt_swarm(&self, swarm_id: SwarmId) -> Result<SwarmStatusReport, ExecutionError> {
        let handle = self.handle_of(swarm_id)?;
        self.enforce_deadline(swarm_id, &handle).await?;

        let exhausted = {
            let mut swarm = handle.state.lock();
            if swarm.phase() != SwarmPhase::Adapting {
                return Err(ExecutionError::validation(format!(
                    "swarm {swarm_id} is not adapting (phase {})",
                    swarm.phase()
                )));
            }
            if swarm.replans >= swarm.config.adaptation.max_replans {
                Some(ExecutionError::limit_exceeded(
                    "replans",
                    format!("goals still blocked after {} re-plans", swarm.replans),
                ))
            } else {
                swarm.replans += 1;
                swarm.failed_runs = 0;
                self.transition(&mut swarm, SwarmPhase::Planning);
                None
            }
        };

        match exhausted {
            Some(err) => {
                warn!(swarm_id = %swarm_id, error = %err, "Adaptation exhausted");
                self.fail_swarm(swarm_id, &handle, &err).await;
                self.get_swarm_status(swarm_id).await
            }
            None => {
                info!(swarm_id = %swarm_id, "Re-planning blocked goals");
                self.plan_swarm(swarm_id).await
            }
        }
    }

    pub async fn get_swarm_status(&self, swarm_id: SwarmId) -> Result<SwarmStatusReport, ExecutionError> {
        if let Ok(handle) = self.handle_of(swarm_id) {
            let report = handle.state.lock().status_report();
            return Ok(report);
        }
        Ok(self.stored(swarm_id).await?.status_report())
    }

    async fn stored(&self, swarm_id: SwarmId) -> Result<SwarmRecord, ExecutionError> {
        self.inner
            .repository
            .find_by_id(swarm_id)
            .await?
            .ok_or_else(|| ExecutionError::not_found("swarm", swarm_id))
    }

    /// Cancel a swarm and every active child run. Returns false when the
    /// swarm was already terminal.
    #[instrument(skip(self), fields(swarm_id = %swarm_id))]
    pub async fn cancel_swarm(&self, swarm_id: SwarmId, user_id: &str, reason: &str) -> Result<bool, ExecutionError> {
        let Ok(handle) = self.handle_of(swarm_id) else {
            // Retired swarms are terminal.
            return self.stored(swarm_id).await.map(|_| false);
        };
        let runs = {
            let mut swarm = handle.state.lock();
            if !self.transition(&mut swarm, SwarmPhase::Cancelled) {
                return Ok(false);
            }
            swarm.active_runs()
        };

        info!(swarm_id = %swarm_id, user_id, reason, active_runs = runs.len(), "Swarm cancelled");
        self.inner.events.emit(
            event_types::SWARM_CANCELLED,
            Tier::Tier1,
            json!({
                "swarmId": swarm_id,
                "userId": user_id,
                "reason": reason,
                "activeRuns": runs,
            }),
        );
        self.cancel_children(swarm_id, &runs, reason, Some(user_id)).await;
        self.persist(&handle).await;
        Ok(true)
    }

    /// Resolves once the swarm reaches a terminal phase.
    pub async fn wait_for_completion(&self, swarm_id: SwarmId) -> Result<SwarmStatusReport, ExecutionError> {
        let Ok(handle) = self.handle_of(swarm_id) else {
            return self.get_swarm_status(swarm_id).await;
        };
        loop {
            let notified = handle.finished.notified();
            {
                let swarm = handle.state.lock();
                if swarm.phase().is_terminal() {
                    return Ok(swarm.status_report());
                }
            }
            notified.await;
        }
    }

    // ========================================================================
    // Shared memory
    // ========================================================================

    /// Append a decision; returns the conflict it raised, if any.
    pub async fn record_decision(
        &self,
        swarm_id: SwarmId,
        decision: DecisionRecord,
    ) -> Result<Option<ConflictRecord>, ExecutionError> {
        let handle = self.handle_of(swarm_id)?;
        self.enforce_deadline(swarm_id, &handle).await?;

        let conflict = {
            let mut swarm = handle.state.lock();
            if swarm.phase().is_terminal() {
                return Err(ExecutionError::validation(format!(
                    "swarm {swarm_id} is {}",
                    swarm.phase()
                )));
            }
            let known = &swarm.config.agents;
            if !known.is_empty() && !known.iter().any(|a| a.id == decision.agent_id) {
                return Err(ExecutionError::validation(format!(
                    "agent '{}' is not part of swarm {swarm_id}",
                    decision.agent_id
                )));
            }

            self.inner.events.emit(
                event_types::SWARM_DECISION_RECORDED,
                Tier::Tier1,
                json!({
                    "swarmId": swarm_id,
                    "agentId": decision.agent_id,
                    "goalId": decision.goal_id,
                    "choice": decision.choice,
                }),
            );
            let conflict = swarm.context.shared_memory.record_decision(decision);
            if let Some(conflict) = &conflict {
                warn!(swarm_id = %swarm_id, conflict_id = %conflict.id, parties = ?conflict.parties, "Conflict detected");
                self.inner.events.emit(
                    event_types::SWARM_CONFLICT_DETECTED,
                    Tier::Tier1,
                    json!({
                        "swarmId": swarm_id,
                        "conflictId": conflict.id,
                        "type": conflict.conflict_type,
                        "parties": conflict.parties,
                        "description": conflict.description,
                    }),
                );
            }
            conflict
        };
        self.persist(&handle).await;
        Ok(conflict)
    }

    pub async fn record_consensus(
        &self,
        swarm_id: SwarmId,
        topic: &str,
        votes: Vec<Vote>,
    ) -> Result<ConsensusRecord, ExecutionError> {
        let handle = self.handle_of(swarm_id)?;
        self.enforce_deadline(swarm_id, &handle).await?;

        let record = ConsensusRecord::aggregate(topic, votes)?;
        {
            let mut swarm = handle.state.lock();
            if swarm.phase().is_terminal() {
                return Err(ExecutionError::validation(format!(
                    "swarm {swarm_id} is {}",
                    swarm.phase()
                )));
            }
            swarm.context.shared_memory.record_consensus(record.clone());
        }
        debug!(swarm_id = %swarm_id, topic, score = record.score, agreement = record.agreement, "Consensus recorded");
        self.inner.events.emit(
            event_types::SWARM_CONSENSUS_RECORDED,
            Tier::Tier1,
            json!({
                "swarmId": swarm_id,
                "topic": record.topic,
                "participants": record.participants,
                "score": record.score,
                "agreement": record.agreement,
                "confidence": record.confidence,
            }),
        );
        self.persist(&handle).await;
        Ok(record)
    }

    /// External arbitration entry point. Conflicts are never resolved any
    /// other way.
    pub async fn resolve_conflict(
        &self,
        swarm_id: SwarmId,
        conflict_id: Uuid,
        resolution: &str,
        arbiter: &str,
    ) -> Result<ConflictRecord, ExecutionError> {
        let handle = self.handle_of(swarm_id)?;
        let resolved = handle
            .state
            .lock()
            .context
            .shared_memory
            .resolve_conflict(conflict_id, resolution, arbiter)
            .cloned()?;

        info!(swarm_id = %swarm_id, conflict_id = %conflict_id, arbiter, "Conflict resolved");
        self.inner.events.emit(
            event_types::SWARM_CONFLICT_RESOLVED,
            Tier::Tier1,
            json!({
                "swarmId": swarm_id,
                "conflictId": conflict_id,
                "resolution": resolution,
                "arbiter": arbiter,
            }),
        );
        self.persist(&handle).await;
        Ok(resolved)
    }

    // ========================================================================
    // Child runs
    // ========================================================================

    fn watch_run(&self, swarm_id: SwarmId, run_id: RunId, request: TierRequest) -> BoxFuture<'static, ()> {
        let this = self.clone();
        async move {
            let outcome = this.inner.tier2.handle(request).await.into_result::<RunOutcome>();
            this.on_run_finished(swarm_id, run_id, outcome).await;
        }
        .boxed()
    }

    async fn on_run_finished(&self, swarm_id: SwarmId, run_id: RunId, outcome: Result<RunOutcome, ExecutionError>) {
        let Ok(handle) = self.handle_of(swarm_id) else {
            return;
        };

        let adapt = {
            let mut swarm = handle.state.lock();
            let Some(child) = swarm.runs.get(&run_id).cloned() else {
                warn!(swarm_id = %swarm_id, run_id = %run_id, "Result for unknown child run");
                return;
            };
            if child.settled {
                return;
            }

            let (status, outputs, usage, error) = match outcome {
                Ok(outcome) => (
                    outcome.status,
                    outcome.outputs,
                    outcome.resource_usage,
                    outcome.errors.last().cloned(),
                ),
                Err(err) => (
                    OrchestrationPhase::Failed,
                    Map::new(),
                    ResourceUsage::default(),
                    Some(err.to_info()),
                ),
            };
            swarm.ledger.settle(&child.allocation, &usage);
            if let Some(entry) = swarm.runs.get_mut(&run_id) {
                entry.status = status;
                entry.outputs = outputs.clone();
                entry.resource_usage = usage.clone();
                entry.settled = true;
                entry.finished_at = Some(chrono::Utc::now());
            }
            counter!("strata_swarm_runs_total", "status" => status.to_string()).increment(1);
            info!(
                swarm_id = %swarm_id,
                run_id = %run_id,
                goal = %child.goal_id,
                status = %status,
                credits = %usage.credits,
                "Child run finished"
            );

            if swarm.phase().is_terminal() {
                false
            } else {
                if status == OrchestrationPhase::Completed {
                    swarm
                        .context
                        .shared_memory
                        .blackboard
                        .insert(child.goal_id.clone(), Value::Object(outputs));
                    swarm.context.state.complete_goal(&child.goal_id);
                } else {
                    swarm.context.state.block_goal(&child.goal_id);
                    swarm.failed_runs += 1;
                    if let Some(error) = error {
                        swarm.errors.push(error);
                    }
                }
                self.evaluate(&mut swarm)
            }
        };

        self.persist(&handle).await;
        if self.enforce_deadline(swarm_id, &handle).await.is_err() {
            return;
        }
        if adapt {
            self.adaptation_task(swarm_id).await;
        }
    }

    fn adaptation_task(&self, swarm_id: SwarmId) -> BoxFuture<'static, ()> {
        let this = self.clone();
        async move {
            match this.adapt_swarm(swarm_id).await {
                Ok(report) => debug!(swarm_id = %swarm_id, phase = %report.current_phase, "Adaptation finished"),
                Err(err) => warn!(swarm_id = %swarm_id, error = %err, "Adaptation failed"),
            }
        }
        .boxed()
    }

    async fn cancel_children(&self, swarm_id: SwarmId, runs: &[RunId], reason: &str, user_id: Option<&str>) {
        let cancels = runs.iter().map(|run_id| async move {
            let payload = RunRef {
                run_id: *run_id,
                reason: Some(reason.to_string()),
            };
            let request = match TierRequest::with_payload(RequestType::CancelRun, Tier::Tier1, Tier::Tier2, &payload) {
                Ok(request) => request.correlated(swarm_id.to_string()),
                Err(err) => {
                    error!(swarm_id = %swarm_id, run_id = %run_id, error = %err, "Could not build cancel_run request");
                    return;
                }
            };
            let request = match user_id {
                Some(user) => request.from_user(user),
                None => request,
            };
            let response = self.inner.tier2.handle(request).await;
            if !response.success {
                // NOT_FOUND here means Tier2 has not registered the run yet; it
                // remembers the cancellation and starts the run cancelled.
                debug!(swarm_id = %swarm_id, run_id = %run_id, error = ?response.error, "Tier2 did not cancel run");
            }
        });
        join_all(cancels).await;
    }

    // ========================================================================
    // State machine helpers
    // ========================================================================

    /// Apply a phase change and publish it. Cancellation events are emitted
    /// by `cancel_swarm`, which knows the caller and reason.
    fn transition(&self, swarm: &mut Swarm, next: SwarmPhase) -> bool {
        let from = swarm.phase();
        if !swarm.advance(next) {
            return false;
        }
        debug!(swarm_id = %swarm.id, from = %from, to = %next, "Swarm phase changed");
        self.inner.events.emit(
            event_types::SWARM_PHASE_CHANGED,
            Tier::Tier1,
            json!({ "swarmId": swarm.id, "from": from, "to": next }),
        );

        if next.is_terminal() {
            gauge!("strata_swarms_active").decrement(1.0);
            let report = swarm.status_report();
            match next {
                SwarmPhase::Completed => {
                    info!(swarm_id = %swarm.id, credits = %report.resource_usage.credits, "Swarm completed");
                    self.inner.events.emit(
                        event_types::SWARM_COMPLETED,
                        Tier::Tier1,
                        json!({
                            "swarmId": swarm.id,
                            "completedRuns": report.completed_runs.len(),
                            "creditsUsed": report.resource_usage.credits,
                        }),
                    );
                }
                SwarmPhase::Failed => {
                    warn!(swarm_id = %swarm.id, errors = report.errors.len(), "Swarm failed");
                    self.inner.events.emit(
                        event_types::SWARM_FAILED,
                        Tier::Tier1,
                        json!({ "swarmId": swarm.id, "errors": report.errors }),
                    );
                }
                _ => {}
            }
        }
        true
    }

    /// Decide what follows a change in goal state. Only acts while
    /// monitoring; returns true when the swarm should re-plan now.
    fn evaluate(&self, swarm: &mut Swarm) -> bool {
        if swarm.phase() != SwarmPhase::Monitoring {
            return false;
        }
        let state = &swarm.context.state;
        if state.is_exhausted() {
            self.transition(swarm, SwarmPhase::Completed);
            return false;
        }
        let threshold = swarm.config.adaptation.max_failed_runs;
        if state.all_remaining_blocked() || (threshold > 0 && swarm.failed_runs >= threshold) {
            self.transition(swarm, SwarmPhase::Adapting);
            return swarm.config.adaptation.auto_adapt;
        }
        false
    }

    async fn enforce_deadline(&self, swarm_id: SwarmId, handle: &SwarmHandle) -> Result<(), ExecutionError> {
        let expired = {
            let swarm = handle.state.lock();
            if swarm.phase().is_terminal() || !swarm.ledger.is_expired() {
                None
            } else {
                Some(ExecutionError::budget_exceeded(
                    BudgetResource::Time,
                    format!("{}ms", swarm.ledger.elapsed().as_millis()),
                    format!("{}ms", swarm.config.allocation.timeout.as_millis()),
                ))
            }
        };
        match expired {
            None => Ok(()),
            Some(err) => {
                warn!(swarm_id = %swarm_id, "Swarm deadline exceeded");
                self.fail_swarm(swarm_id, handle, &err).await;
                Err(err)
            }
        }
    }

    /// No-op on a swarm that is already terminal; its recorded errors stay
    /// as they were.
    async fn fail_swarm(&self, swarm_id: SwarmId, handle: &SwarmHandle, err: &ExecutionError) {
        let runs = {
            let mut swarm = handle.state.lock();
            if !swarm.phase().can_transition_to(SwarmPhase::Failed) {
                return;
            }
            swarm.errors.push(err.to_info());
            self.transition(&mut swarm, SwarmPhase::Failed);
            swarm.active_runs()
        };
        if matches!(err, ExecutionError::BudgetExceeded { .. }) {
            self.inner.events.emit(
                event_types::BUDGET_EXCEEDED,
                Tier::Tier1,
                json!({ "swarmId": swarm_id, "error": err.to_info() }),
            );
        }
        self.cancel_children(swarm_id, &runs, "swarm failed", None).await;
        self.persist(handle).await;
    }

    /// Save the swarm and wake waiters once it is terminal. Persistence
    /// failures are logged, never fatal. A settled swarm that was saved is
    /// dropped from the live table.
    async fn persist(&self, handle: &SwarmHandle) {
        let record = handle.state.lock().record();
        if record.phase().is_terminal() {
            handle.finished.notify_waiters();
        }
        if self.save(&record).await && record.is_settled() {
            self.inner.swarms.remove(&record.swarm_id);
            debug!(swarm_id = %record.swarm_id, "Swarm retired");
        }
    }

    async fn save(&self, record: &SwarmRecord) -> bool {
        match self.inner.repository.save(record).await {
            Ok(()) => true,
            Err(err) => {
                error!(swarm_id = %record.swarm_id, error = %err, "Failed to persist swarm");
                false
            }
        }
    }
}

#[async_trait]
impl TierHandler for SwarmCoordinator {
    fn tier(&self) -> Tier {
        Tier::Tier1
    }

    async fn handle(&self, request: TierRequest) -> TierResponse {
        match request.request_type {
            RequestType::ExecuteSwarm => {
                let result: Result<SwarmStatusReport, ExecutionError> = async {
                    let payload: ExecuteSwarmPayload = request.payload_as()?;
                    let swarm_id = self.start_swarm(payload.config).await?;
                    let report = self.plan_swarm(swarm_id).await?;
                    if payload.await_completion {
                        self.wait_for_completion(swarm_id).await
                    } else {
                        Ok(report)
                    }
                }
                .await;
                TierResponse::from_result(request.id, result)
            }
            RequestType::CancelSwarm => {
                let result: Result<Value, ExecutionError> = async {
                    let target: SwarmRef = request.payload_as()?;
                    let user = target
                        .user_id
                        .or_else(|| request.metadata.user_id.clone())
                        .unwrap_or_else(|| "system".to_string());
                    let reason = target.reason.unwrap_or_else(|| "cancel requested".to_string());
                    let cancelled = self.cancel_swarm(target.swarm_id, &user, &reason).await?;
                    Ok(json!({ "cancelled": cancelled }))
                }
                .await;
                TierResponse::from_result(request.id, result)
            }
            RequestType::GetStatus => {
                let result = match request.payload_as::<SwarmRef>() {
                    Ok(target) => self.get_swarm_status(target.swarm_id).await,
                    Err(err) => Err(err),
                };
                TierResponse::from_result(request.id, result)
            }
            other => TierResponse::err(
                request.id,
                &ExecutionError::validation(format!("tier1 does not handle {other:?} requests")),
            ),
        }
    }
}
