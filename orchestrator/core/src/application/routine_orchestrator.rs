// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Routine Orchestrator (Tier2)
//!
//! Walks one run's routine graph and dispatches every leaf node to Tier3 as
//! an `execute_step` request. Composite sub-routines are walked in their own
//! scope and parallel nodes run their branches concurrently; neither ever
//! reaches Tier3 directly.
//!
//! ## Budget
//!
//! Each run owns a [`BudgetLedger`]. Before every dispatch the ledger's
//! ceilings are re-checked (breach → `LimitExceeded`, run fails), then the
//! step allocation is carved out of what remains and settled with the step's
//! actual usage when the result comes back. A result whose usage went past
//! its allocation is booked as reported but its outputs are dropped, and the
//! run fails with `BudgetExceeded`.
//!
//! ## Retention
//!
//! Once a run is terminal and its record and final checkpoint are written,
//! its handle leaves memory. Status and outcome reads then come from the
//! [`RunRepository`].
//!
//! ## Cancellation
//!
//! `cancel_run` is monotonic: it moves outstanding steps to cancelled, sends
//! `cancel_step` to Tier3 for every active step and never touches completed
//! steps. A run that already reached a terminal phase stays there.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt};
use metrics::gauge;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::application::security_validator::MinimalSecurityValidator;
use crate::application::step_executor::CancelStepPayload;
use crate::application::strategies::ROUTE_OUTPUT;
use crate::domain::communication::{RequestType, TierHandler, TierRequest, TierResponse};
use crate::domain::config::OrchestratorConfig;
use crate::domain::context::{ContextHeader, ContextMetadata, ContextSnapshot, Tier};
use crate::domain::errors::{ErrorInfo, ExecutionError};
use crate::domain::events::{event_types, EventPublisher};
use crate::domain::process::{
    BranchState, CheckpointMarker, Location, OrchestrationPhase, ProcessContext, RunId, StepStatus,
};
use crate::domain::repository::{Checkpoint, RunRecord, RunRepository, StepRecord};
use crate::domain::resources::{BudgetLedger, ResourceAllocation, ResourceUsage};
use crate::domain::routine::{
    failed_flag, lookup, FailurePolicy, Node, NodeKind, Routine, RoutineGraph, RoutineKind, StepDefinition,
};
use crate::domain::security::SessionUser;
use crate::domain::step::{StepExecutionRequest, StepExecutionResult, StepId};

fn default_true() -> bool {
    true
}

/// Placeholder written for every input/output name during a dry run.
pub fn placeholder(name: &str) -> Value {
    Value::String(format!("<{name}>"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    /// Caller-chosen id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub routine: Routine,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    pub allocation: ResourceAllocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_user: Option<SessionUser>,
    #[serde(default)]
    pub metadata: ContextMetadata,
    /// Walk the graph with placeholders instead of dispatching steps.
    #[serde(default)]
    pub dry_run: bool,
    /// `resource:action` the session user must hold to start the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_permission: Option<String>,
}

impl RunConfig {
    pub fn new(routine: Routine, allocation: ResourceAllocation) -> Self {
        Self {
            run_id: None,
            routine,
            inputs: Map::new(),
            allocation,
            session_user: None,
            metadata: ContextMetadata::default(),
            dry_run: false,
            required_permission: None,
        }
    }

    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_user(mut self, user: SessionUser) -> Self {
        self.session_user = Some(user);
        self
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// Envelope payload for `execute_run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRunPayload {
    #[serde(flatten)]
    pub config: RunConfig,
    #[serde(default = "default_true")]
    pub await_completion: bool,
}

/// Envelope payload for `cancel_run` and `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRef {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: OrchestrationPhase,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    #[serde(default)]
    pub errors: Vec<ErrorInfo>,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == OrchestrationPhase::Completed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub run_id: RunId,
    pub routine_id: String,
    pub phase: OrchestrationPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<String>,
    pub active_steps: Vec<String>,
    pub pending_steps: Vec<String>,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub cancelled_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub resource_usage: ResourceUsage,
    pub errors: Vec<ErrorInfo>,
    pub dry_run: bool,
}

impl RunStatus {
    /// Step lists come from the process context when one is at hand; a
    /// record without a snapshot still reports phase, usage and errors.
    fn describe(record: RunRecord, process: Option<&ProcessContext>) -> Self {
        let mut status = Self {
            run_id: record.run_id,
            routine_id: record.routine_id,
            phase: record.status,
            current_location: None,
            active_steps: Vec::new(),
            pending_steps: Vec::new(),
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            cancelled_steps: Vec::new(),
            skipped_steps: Vec::new(),
            resource_usage: record.resource_usage,
            errors: record.errors,
            dry_run: record.dry_run,
        };
        if let Some(process) = process {
            let orchestration = &process.orchestration;
            status.current_location = process.navigation.current_location.as_ref().map(Location::key);
            status.active_steps = orchestration.active_steps.iter().cloned().collect();
            status.pending_steps = orchestration.pending_steps.iter().cloned().collect();
            status.completed_steps = orchestration.completed_steps.iter().cloned().collect();
            status.failed_steps = orchestration.failed_steps.iter().cloned().collect();
            status.cancelled_steps = orchestration.cancelled_steps.iter().cloned().collect();
            status.skipped_steps = orchestration.skipped_steps.iter().cloned().collect();
        }
        status
    }
}

struct RunState {
    routine: Routine,
    process: ProcessContext,
    ledger: BudgetLedger,
    session_user: Option<SessionUser>,
    dry_run: bool,
    errors: Vec<ErrorInfo>,
    outputs: Map<String, Value>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    dispatched: u32,
    since_checkpoint: u32,
    checkpoint_seq: u32,
    active_steps: HashMap<String, StepId>,
    executing: bool,
    counted_active: bool,
}

struct RunHandle {
    state: Mutex<RunState>,
    cancel: CancellationToken,
}

/// Where a walk runs: the enclosing parallel node (if any) and how many
/// branches share the remaining budget.
#[derive(Debug, Clone)]
struct Lane {
    branch: Option<String>,
    width: u32,
}

impl Lane {
    fn root() -> Self {
        Self { branch: None, width: 1 }
    }
}

enum Prepared {
    DryRun,
    Dispatch {
        request: StepExecutionRequest,
        allocation: ResourceAllocation,
    },
}

enum Verdict {
    Done,
    Retry,
    Abort(ExecutionError),
}

struct Inner {
    tier3: Arc<dyn TierHandler>,
    repository: Arc<dyn RunRepository>,
    events: Arc<dyn EventPublisher>,
    security: MinimalSecurityValidator,
    config: OrchestratorConfig,
    /// Live runs. Terminal runs are dropped once persisted and answered
    /// from the repository.
    runs: DashMap<RunId, Arc<RunHandle>>,
    /// Cancellations that arrived before the run was registered.
    early_cancellations: DashMap<RunId, (String, Instant)>,
}

/// How long a cancellation for an unregistered run is remembered.
const EARLY_CANCEL_TTL: Duration = Duration::from_secs(300);
const MAX_EARLY_CANCELLATIONS: usize = 1024;

#[derive(Clone)]
pub struct RoutineOrchestrator {
    inner: Arc<Inner>,
}

impl RoutineOrchestrator {
    pub fn new(
        tier3: Arc<dyn TierHandler>,
        repository: Arc<dyn RunRepository>,
        events: Arc<dyn EventPublisher>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tier3,
                repository,
                security: MinimalSecurityValidator::new(events.clone(), Tier::Tier2),
                events,
                config,
                runs: DashMap::new(),
                early_cancellations: DashMap::new(),
            }),
        }
    }

    fn handle_of(&self, run_id: RunId) -> Result<Arc<RunHandle>, ExecutionError> {
        self.inner
            .runs
            .get(&run_id)
            .map(|r| r.clone())
            .ok_or_else(|| ExecutionError::not_found("run", run_id))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Register a run and build its process context. Nothing is dispatched
    /// until [`execute_run`](Self::execute_run).
    #[instrument(skip(self, config), fields(routine = %config.routine.id))]
    pub async fn start_run(&self, config: RunConfig) -> Result<RunId, ExecutionError> {
        config.routine.validate()?;
        config.allocation.validate()?;
        if let Some(permission) = &config.required_permission {
            self.inner
                .security
                .authorize(config.session_user.as_ref(), permission)?;
        }

        let mut variables = config.inputs.clone();
        let mut missing = Vec::new();
        for spec in config.routine.required_inputs() {
            if variables.contains_key(&spec.name) {
                continue;
            }
            if config.dry_run {
                variables.insert(spec.name.clone(), placeholder(&spec.name));
            } else {
                missing.push(spec.name.clone());
            }
        }
        if !missing.is_empty() {
            return Err(ExecutionError::validation(format!(
                "missing required inputs: {}",
                missing.join(", ")
            )));
        }

        let run_id = config.run_id.unwrap_or_default();
        if self.inner.runs.contains_key(&run_id) || self.inner.repository.find_run(run_id).await?.is_some() {
            return Err(ExecutionError::validation(format!("run {run_id} already exists")));
        }

        let mut metadata = config.metadata.clone();
        if metadata.user_id.is_none() {
            metadata.user_id = config.session_user.as_ref().map(|u| u.id.clone());
        }
        let process = ProcessContext::new(ContextHeader::new(Tier::Tier2, metadata), variables);

        let state = RunState {
            routine: config.routine.clone(),
            process,
            ledger: BudgetLedger::new(config.allocation.clone()),
            session_user: config.session_user.clone(),
            dry_run: config.dry_run,
            errors: Vec::new(),
            outputs: Map::new(),
            started_at: Utc::now(),
            finished_at: None,
            dispatched: 0,
            since_checkpoint: 0,
            checkpoint_seq: 0,
            active_steps: HashMap::new(),
            executing: false,
            counted_active: true,
        };
        let record = Self::record(&state, run_id);
        self.inner.runs.insert(
            run_id,
            Arc::new(RunHandle {
                state: Mutex::new(state),
                cancel: CancellationToken::new(),
            }),
        );
        gauge!("strata_runs_active").increment(1.0);

        info!(run_id = %run_id, routine = %config.routine.id, dry_run = config.dry_run, "Run started");
        self.inner.events.emit(
            event_types::RUN_STARTED,
            Tier::Tier2,
            json!({
                "runId": run_id,
                "routineId": config.routine.id,
                "composite": config.routine.is_composite(),
                "dryRun": config.dry_run,
                "maxCredits": config.allocation.max_credits,
            }),
        );
        self.save_run(&record).await;

        if let Some((_, (reason, at))) = self.inner.early_cancellations.remove(&run_id) {
            if at.elapsed() < EARLY_CANCEL_TTL {
                self.cancel_run(run_id, &reason).await?;
            }
        }
        Ok(run_id)
    }

    /// Drive a started run to a terminal phase.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn execute_run(&self, run_id: RunId) -> Result<RunOutcome, ExecutionError> {
        let Ok(run) = self.handle_of(run_id) else {
            // Only terminal runs leave the live table.
            return self.stored(run_id).await.map(|record| RunOutcome {
                run_id,
                status: record.status,
                outputs: record.outputs,
                resource_usage: record.resource_usage,
                errors: record.errors,
            });
        };
        let routine = {
            let mut st = run.state.lock();
            if st.process.orchestration.phase.is_terminal() {
                return Ok(Self::outcome(&st, run_id));
            }
            if st.executing {
                return Err(ExecutionError::validation(format!("run {run_id} is already executing")));
            }
            st.executing = true;
            st.process.orchestration.advance(OrchestrationPhase::Navigating);
            st.routine.clone()
        };

        let walked = match &routine.kind {
            RoutineKind::MultiStep { graph } => {
                self.walk(&run, run_id, graph, routine.id.clone(), Lane::root()).await
            }
            RoutineKind::SingleStep { .. } => {
                let graph = RoutineGraph::sequence(vec![Node::routine(routine.id.clone(), routine.clone())]);
                self.walk(&run, run_id, &graph, "root".to_string(), Lane::root()).await
            }
        };

        Ok(self.finalize(&run, run_id, walked).await)
    }

    /// `start_run` followed by `execute_run`.
    pub async fn run(&self, config: RunConfig) -> Result<RunOutcome, ExecutionError> {
        let run_id = self.start_run(config).await?;
        self.execute_run(run_id).await
    }

    /// Status of a live run, or of a finished one as last persisted.
    pub async fn get_run_status(&self, run_id: RunId) -> Result<RunStatus, ExecutionError> {
        if let Ok(run) = self.handle_of(run_id) {
            let st = run.state.lock();
            return Ok(RunStatus::describe(Self::record(&st, run_id), Some(&st.process)));
        }

        let record = self.stored(run_id).await?;
        let process = self
            .inner
            .repository
            .latest_checkpoint(run_id)
            .await?
            .and_then(|checkpoint| serde_json::from_value::<ProcessContext>(checkpoint.snapshot.state).ok());
        Ok(RunStatus::describe(record, process.as_ref()))
    }

    async fn stored(&self, run_id: RunId) -> Result<RunRecord, ExecutionError> {
        self.inner
            .repository
            .find_run(run_id)
            .await?
            .ok_or_else(|| ExecutionError::not_found("run", run_id))
    }

    /// Cancel a run. Returns false when the run was already terminal.
    ///
    /// An unknown id is remembered so a run registered later under that id
    /// starts cancelled, and `NotFound` is returned.
    pub async fn cancel_run(&self, run_id: RunId, reason: &str) -> Result<bool, ExecutionError> {
        let Some(run) = self.inner.runs.get(&run_id).map(|r| r.clone()) else {
            if self.inner.repository.find_run(run_id).await?.is_some() {
                return Ok(false);
            }
            self.remember_early_cancel(run_id, reason);
            return Err(ExecutionError::not_found("run", run_id));
        };

        let (active, cancelled_steps, record, checkpoint, executing) = {
            let mut st = run.state.lock();
            if !st.process.orchestration.advance(OrchestrationPhase::Cancelled) {
                return Ok(false);
            }
            let keys = st.process.orchestration.cancel_outstanding();
            let active: Vec<StepId> = keys
                .iter()
                .filter_map(|k| st.active_steps.get(k).copied())
                .collect();
            st.finished_at = Some(Utc::now());
            Self::leave_active(&mut st);
            let cancelled = st.process.orchestration.cancelled_steps.len();
            // An executing run is persisted and retired by its walk.
            let checkpoint = (!st.executing).then(|| Self::snapshot(&mut st, run_id)).flatten();
            (active, cancelled, Self::record(&st, run_id), checkpoint, st.executing)
        };
        run.cancel.cancel();

        info!(run_id = %run_id, reason, active_steps = active.len(), "Run cancelled");
        self.inner.events.emit(
            event_types::RUN_CANCELLED,
            Tier::Tier2,
            json!({
                "runId": run_id,
                "reason": reason,
                "cancelledSteps": cancelled_steps,
            }),
        );
        for step_id in active {
            self.cancel_step(run_id, step_id, reason).await;
        }
        if executing {
            self.save_run(&record).await;
        } else {
            self.retire(run_id, &record, checkpoint).await;
        }
        Ok(true)
    }

    fn remember_early_cancel(&self, run_id: RunId, reason: &str) {
        let early = &self.inner.early_cancellations;
        early.retain(|_, (_, at)| at.elapsed() < EARLY_CANCEL_TTL);
        if early.len() >= MAX_EARLY_CANCELLATIONS && !early.contains_key(&run_id) {
            warn!(run_id = %run_id, "Too many pending cancellations for unknown runs, dropping");
            return;
        }
        early.insert(run_id, (reason.to_string(), Instant::now()));
    }

    /// Persist the final record and snapshot, then drop the live handle.
    /// The handle stays when either write fails so status remains readable.
    async fn retire(&self, run_id: RunId, record: &RunRecord, checkpoint: Option<Checkpoint>) {
        let saved = self.save_run(record).await;
        let snapshotted = match checkpoint {
            Some(checkpoint) => self.save_checkpoint(checkpoint).await,
            None => false,
        };
        if saved && snapshotted {
            self.inner.runs.remove(&run_id);
            debug!(run_id = %run_id, "Run retired");
        }
    }

    // ========================================================================
    // Graph walk
    // ========================================================================

    fn walk<'a>(
        &'a self,
        run: &'a Arc<RunHandle>,
        run_id: RunId,
        graph: &'a RoutineGraph,
        scope: String,
        lane: Lane,
    ) -> BoxFuture<'a, Result<(), ExecutionError>> {
        async move {
            let mut next = Some((graph.start.clone(), false));
            while let Some((node_id, via_loop)) = next.take() {
                if run.cancel.is_cancelled() {
                    return Err(ExecutionError::cancelled(format!("run {run_id} cancelled")));
                }
                let node = graph.node(&node_id).ok_or_else(|| {
                    ExecutionError::validation(format!("unknown node '{node_id}' in {scope}"))
                })?;
                let location = Location::new(scope.clone(), node_id.clone());
                run.state
                    .lock()
                    .process
                    .navigation
                    .enter(location.clone(), via_loop)?;

                self.execute_node(run, run_id, node, &location, &lane).await?;

                next = {
                    let mut st = run.state.lock();
                    Self::next_hop(&mut st.process, graph, &scope, &node_id)
                };
            }
            Ok(())
        }
        .boxed()
    }

    /// First outgoing edge whose condition holds. Loop edges are skipped
    /// once their limit is used up.
    fn next_hop(
        process: &mut ProcessContext,
        graph: &RoutineGraph,
        scope: &str,
        from: &str,
    ) -> Option<(String, bool)> {
        for (index, edge) in graph.outgoing(from) {
            if !edge.condition.evaluate(&process.memory.variables) {
                continue;
            }
            match edge.loop_limit {
                Some(limit) => {
                    let key = format!("{scope}/{}->{}#{index}", edge.from, edge.to);
                    if process.navigation.take_loop(&key, limit) {
                        return Some((edge.to.clone(), true));
                    }
                }
                None => return Some((edge.to.clone(), false)),
            }
        }
        None
    }

    async fn execute_node(
        &self,
        run: &Arc<RunHandle>,
        run_id: RunId,
        node: &Node,
        location: &Location,
        lane: &Lane,
    ) -> Result<(), ExecutionError> {
        let outcome = match &node.kind {
            NodeKind::Routine { routine } => match &routine.kind {
                RoutineKind::SingleStep { .. } => {
                    return self.dispatch_leaf(run, run_id, node, routine, location, lane).await;
                }
                RoutineKind::MultiStep { graph } => {
                    self.run_composite(run, run_id, node, graph, location, lane).await
                }
            },
            NodeKind::Parallel { branches } => self.run_parallel(run, run_id, branches, location, lane).await,
        };

        // Leaf failures apply their policy inside dispatch_leaf; composite and
        // parallel nodes only honour `continue`.
        match outcome {
            Err(err)
                if node.on_failure == FailurePolicy::Continue
                    && !err.terminates_owner()
                    && !matches!(err, ExecutionError::CancellationRequested { .. }) =>
            {
                warn!(run_id = %run_id, node = %node.id, error = %err, "Node failed, continuing");
                let mut st = run.state.lock();
                st.process
                    .memory
                    .variables
                    .insert(failed_flag(&node.id), Value::Bool(true));
                st.errors.push(err.to_info());
                Ok(())
            }
            other => other,
        }
    }

    async fn run_composite(
        &self,
        run: &Arc<RunHandle>,
        run_id: RunId,
        node: &Node,
        graph: &RoutineGraph,
        location: &Location,
        lane: &Lane,
    ) -> Result<(), ExecutionError> {
        {
            let mut st = run.state.lock();
            let variables = &mut st.process.memory.variables;
            for (input, variable) in &node.input_map {
                if let Some(value) = lookup(variables, variable).cloned() {
                    variables.insert(input.clone(), value);
                }
            }
            st.process.navigation.push_scope(location.clone());
        }
        debug!(run_id = %run_id, location = %location, "Entering composite routine");

        let walked = self.walk(run, run_id, graph, location.key(), lane.clone()).await;

        let mut st = run.state.lock();
        st.process.navigation.pop_scope();
        if walked.is_ok() {
            let variables = &mut st.process.memory.variables;
            for (output, variable) in &node.output_map {
                if let Some(value) = variables.get(output).cloned() {
                    variables.insert(variable.clone(), value);
                }
            }
        }
        walked
    }

    async fn run_parallel(
        &self,
        run: &Arc<RunHandle>,
        run_id: RunId,
        branches: &[RoutineGraph],
        location: &Location,
        lane: &Lane,
    ) -> Result<(), ExecutionError> {
        let key = location.key();
        run.state
            .lock()
            .process
            .navigation
            .branch_states
            .insert(key.clone(), BranchState::new(true, branches.len()));

        let width = lane.width.saturating_mul(branches.len().max(1) as u32);
        let key = &key;
        let walks = branches.iter().enumerate().map(|(index, branch)| async move {
            let lane = Lane {
                branch: Some(key.clone()),
                width,
            };
            let walked = self
                .walk(run, run_id, branch, format!("{key}[{index}]"), lane)
                .await;
            let mut st = run.state.lock();
            if let Some(state) = st.process.navigation.branch_states.get_mut(key) {
                if walked.is_err() {
                    state.mark_failed();
                }
                state.branch_finished();
            }
            walked
        });

        let results = join_all(walks).await;
        debug!(run_id = %run_id, location = %location, branches = results.len(), "Parallel branches settled");
        results.into_iter().collect::<Result<Vec<_>, _>>().map(|_| ())
    }

    // ========================================================================
    // Leaf dispatch
    // ========================================================================

    async fn dispatch_leaf(
        &self,
        run: &Arc<RunHandle>,
        run_id: RunId,
        node: &Node,
        routine: &Routine,
        location: &Location,
        lane: &Lane,
    ) -> Result<(), ExecutionError> {
        let key = location.key();
        let step = routine.leaf_step().ok_or_else(|| {
            ExecutionError::validation(format!("routine '{}' is not a single step", routine.id))
        })?;
        let attempts = match node.on_failure {
            FailurePolicy::Retry { max_attempts } => max_attempts.max(1),
            _ => 1,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let prepared = {
                let mut st = run.state.lock();
                self.prepare(&mut st, run, run_id, node, &step, &key, lane)?
            };
            let Prepared::Dispatch { request, allocation } = prepared else {
                return Ok(());
            };

            let result = self.send_step(run_id, request, allocation.timeout).await;

            let (verdict, checkpoint) = {
                let mut st = run.state.lock();
                self.absorb(&mut st, run, run_id, node, &key, lane, &result, &allocation, attempt, attempts)
            };
            self.save_step(run_id, &key, result).await;
            if let Some(checkpoint) = checkpoint {
                self.save_checkpoint(checkpoint).await;
            }

            match verdict {
                Verdict::Done => return Ok(()),
                Verdict::Retry => {
                    info!(run_id = %run_id, node = %node.id, attempt, attempts, "Retrying step");
                }
                Verdict::Abort(err) => return Err(err),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn prepare(
        &self,
        st: &mut RunState,
        run: &RunHandle,
        run_id: RunId,
        node: &Node,
        step: &StepDefinition,
        key: &str,
        lane: &Lane,
    ) -> Result<Prepared, ExecutionError> {
        if run.cancel.is_cancelled() || st.process.orchestration.phase.is_terminal() {
            return Err(ExecutionError::cancelled(format!("run {run_id} cancelled")));
        }

        if st.dry_run {
            let variables = &mut st.process.memory.variables;
            for spec in &step.outputs {
                let target = node.output_map.get(&spec.name).unwrap_or(&spec.name);
                variables.insert(target.clone(), placeholder(&spec.name));
            }
            if !step.routes.is_empty() {
                let target = node
                    .output_map
                    .get(ROUTE_OUTPUT)
                    .map(String::as_str)
                    .unwrap_or(ROUTE_OUTPUT);
                variables.insert(target.to_string(), placeholder(ROUTE_OUTPUT));
            }
            st.process.orchestration.mark_skipped(key);
            Self::track(st, lane, key, StepStatus::Skipped);
            self.inner.events.emit(
                event_types::STEP_SKIPPED,
                Tier::Tier2,
                json!({
                    "runId": run_id,
                    "nodeId": node.id,
                    "location": key,
                    "dryRun": true,
                }),
            );
            return Ok(Prepared::DryRun);
        }

        st.dispatched += 1;
        if st.dispatched > self.inner.config.max_steps_per_run {
            return Err(ExecutionError::limit_exceeded(
                "steps",
                format!("run dispatched more than {} steps", self.inner.config.max_steps_per_run),
            ));
        }
        st.ledger.check_ceilings()?;
        let share = Self::share_of(&st.ledger, lane.width);
        let allocation = st.ledger.carve(&share)?;

        let step_id = StepId::new();
        let inputs = Self::node_inputs(node, step, &st.process.memory.variables);
        let mut context = st.process.header.metadata.clone();
        context.parent_context_id = Some(st.process.header.id);

        st.active_steps.insert(key.to_string(), step_id);
        st.process.orchestration.mark_pending(key);
        st.process.orchestration.mark_active(key);
        st.process.orchestration.advance(OrchestrationPhase::Executing);
        Self::track(st, lane, key, StepStatus::Active);

        Ok(Prepared::Dispatch {
            request: StepExecutionRequest {
                step_id,
                run_id,
                node_id: node.id.clone(),
                step: step.clone(),
                inputs,
                context,
                session_user: st.session_user.clone(),
                allocation: allocation.clone(),
            },
            allocation,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn absorb(
        &self,
        st: &mut RunState,
        run: &RunHandle,
        run_id: RunId,
        node: &Node,
        key: &str,
        lane: &Lane,
        result: &StepExecutionResult,
        allocation: &ResourceAllocation,
        attempt: u32,
        attempts: u32,
    ) -> (Verdict, Option<Checkpoint>) {
        st.active_steps.remove(key);
        st.ledger.settle(allocation, &result.resource_usage);
        let performance = &mut st.process.memory.performance;
        performance.total_step_ms += result.duration_ms;
        performance.tool_calls += result.tool_calls.len() as u64;

        let cancelled = run.cancel.is_cancelled()
            || matches!(&result.error, Some(info) if info.code == "CANCELLATION_REQUESTED");
        if cancelled {
            return (
                Verdict::Abort(ExecutionError::cancelled(format!("run {run_id} cancelled"))),
                None,
            );
        }

        if let Some(err) = result.resource_usage.overspend(allocation) {
            warn!(run_id = %run_id, node = %node.id, error = %err, "Step reported usage beyond its allocation");
            st.process.memory.performance.steps_failed += 1;
            st.process.orchestration.mark_failed(key);
            Self::track(st, lane, key, StepStatus::Failed);
            return (Verdict::Abort(err), None);
        }

        if result.is_completed() {
            let variables = &mut st.process.memory.variables;
            for (name, value) in &result.outputs {
                let target = node.output_map.get(name).unwrap_or(name);
                variables.insert(target.clone(), value.clone());
            }
            st.process.memory.performance.steps_completed += 1;
            st.process.orchestration.mark_completed(key);
            st.process.orchestration.advance(OrchestrationPhase::Navigating);
            Self::track(st, lane, key, StepStatus::Completed);

            st.since_checkpoint += 1;
            let interval = self.inner.config.checkpoint_interval;
            let checkpoint = if interval > 0 && st.since_checkpoint >= interval {
                st.since_checkpoint = 0;
                Self::snapshot(st, run_id)
            } else {
                None
            };
            return (Verdict::Done, checkpoint);
        }

        st.process.memory.performance.steps_failed += 1;
        let info = result.error.clone().unwrap_or_else(|| {
            ErrorInfo::new("EXTERNAL_SERVICE_ERROR", "step failed without error detail", false)
        });
        let err = info.to_error();

        st.process.orchestration.mark_failed(key);
        Self::track(st, lane, key, StepStatus::Failed);
        if err.terminates_owner() {
            return (Verdict::Abort(err), None);
        }

        match node.on_failure {
            FailurePolicy::Retry { .. } if info.recoverable && attempt < attempts => (Verdict::Retry, None),
            FailurePolicy::Continue => {
                warn!(run_id = %run_id, node = %node.id, error = %info, "Step failed, continuing");
                st.process
                    .memory
                    .variables
                    .insert(failed_flag(&node.id), Value::Bool(true));
                st.errors.push(info);
                st.process.orchestration.advance(OrchestrationPhase::Navigating);
                (Verdict::Done, None)
            }
            _ => (Verdict::Abort(err), None),
        }
    }

    async fn send_step(&self, run_id: RunId, request: StepExecutionRequest, timeout: Duration) -> StepExecutionResult {
        let step_id = request.step_id;
        let envelope = match TierRequest::with_payload(RequestType::ExecuteStep, Tier::Tier2, Tier::Tier3, &request) {
            Ok(envelope) => envelope.correlated(run_id.to_string()),
            Err(err) => return StepExecutionResult::failed(step_id, &err, ResourceUsage::default()),
        };

        match tokio::time::timeout(timeout, self.inner.tier3.handle(envelope)).await {
            Ok(response) => response
                .into_result::<StepExecutionResult>()
                .unwrap_or_else(|err| StepExecutionResult::failed(step_id, &err, ResourceUsage::default())),
            Err(_) => {
                self.cancel_step(run_id, step_id, "run time budget exhausted").await;
                let err = ExecutionError::limit_exceeded(
                    "time",
                    format!("step {step_id} did not finish within {}ms", timeout.as_millis()),
                );
                StepExecutionResult::failed(step_id, &err, ResourceUsage::default())
            }
        }
    }

    async fn cancel_step(&self, run_id: RunId, step_id: StepId, reason: &str) {
        let payload = CancelStepPayload {
            step_id,
            reason: Some(reason.to_string()),
        };
        let request = match TierRequest::with_payload(RequestType::CancelStep, Tier::Tier2, Tier::Tier3, &payload) {
            Ok(request) => request.correlated(run_id.to_string()),
            Err(err) => {
                error!(run_id = %run_id, step_id = %step_id, error = %err, "Could not build cancel_step request");
                return;
            }
        };
        let response = self.inner.tier3.handle(request).await;
        if !response.success {
            warn!(run_id = %run_id, step_id = %step_id, error = ?response.error, "Tier3 rejected cancel_step");
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn share_of(ledger: &BudgetLedger, width: u32) -> ResourceAllocation {
        let remaining = ledger.remaining();
        if width <= 1 {
            return remaining;
        }
        ResourceAllocation {
            max_credits: remaining.max_credits.split(width),
            max_tokens: remaining.max_tokens / u64::from(width),
            max_tool_calls: remaining.max_tool_calls / width,
            ..remaining
        }
    }

    /// Declared inputs are read through the node's `input_map`; a step that
    /// declares none sees every run variable.
    fn node_inputs(node: &Node, step: &StepDefinition, variables: &Map<String, Value>) -> Map<String, Value> {
        if step.inputs.is_empty() {
            let mut inputs = variables.clone();
            for (input, variable) in &node.input_map {
                if let Some(value) = lookup(variables, variable) {
                    inputs.insert(input.clone(), value.clone());
                }
            }
            return inputs;
        }
        let mut inputs = Map::new();
        for spec in &step.inputs {
            let variable = node.input_map.get(&spec.name).unwrap_or(&spec.name);
            if let Some(value) = lookup(variables, variable) {
                inputs.insert(spec.name.clone(), value.clone());
            }
        }
        inputs
    }

    fn track(st: &mut RunState, lane: &Lane, key: &str, status: StepStatus) {
        if let Some(branch) = &lane.branch {
            if let Some(state) = st.process.navigation.branch_states.get_mut(branch) {
                state.track_step(key, status);
            }
        }
    }

    fn snapshot(st: &mut RunState, run_id: RunId) -> Option<Checkpoint> {
        st.checkpoint_seq += 1;
        let sequence = st.checkpoint_seq;
        let id = Uuid::new_v4();
        st.process.memory.checkpoints.push(CheckpointMarker {
            id,
            sequence,
            completed_steps: st.process.orchestration.completed_steps.len(),
            taken_at: Utc::now(),
        });
        match ContextSnapshot::capture(&st.process.header, &st.process) {
            Ok(snapshot) => Some(Checkpoint {
                id,
                run_id,
                sequence,
                snapshot,
            }),
            Err(err) => {
                error!(run_id = %run_id, error = %err, "Failed to capture run snapshot");
                None
            }
        }
    }

    fn leave_active(st: &mut RunState) {
        if st.counted_active {
            st.counted_active = false;
            gauge!("strata_runs_active").decrement(1.0);
        }
    }

    fn record(st: &RunState, run_id: RunId) -> RunRecord {
        RunRecord {
            run_id,
            routine_id: st.routine.id.clone(),
            status: st.process.orchestration.phase,
            outputs: st.outputs.clone(),
            resource_usage: st.ledger.consumed().clone(),
            errors: st.errors.clone(),
            started_at: st.started_at,
            finished_at: st.finished_at,
            dry_run: st.dry_run,
        }
    }

    fn outcome(st: &RunState, run_id: RunId) -> RunOutcome {
        RunOutcome {
            run_id,
            status: st.process.orchestration.phase,
            outputs: st.outputs.clone(),
            resource_usage: st.ledger.consumed().clone(),
            errors: st.errors.clone(),
        }
    }

    /// The routine's declared outputs, or every variable when none are declared.
    fn collect_outputs(routine: &Routine, variables: &Map<String, Value>) -> Map<String, Value> {
        if routine.outputs.is_empty() {
            return variables.clone();
        }
        routine
            .outputs
            .iter()
            .filter_map(|spec| lookup(variables, &spec.name).map(|v| (spec.name.clone(), v.clone())))
            .collect()
    }

    async fn finalize(
        &self,
        run: &Arc<RunHandle>,
        run_id: RunId,
        walked: Result<(), ExecutionError>,
    ) -> RunOutcome {
        let (outcome, record, checkpoint, transition) = {
            let mut st = run.state.lock();
            let transition = match walked {
                Ok(()) => {
                    let moved = st.process.orchestration.advance(OrchestrationPhase::Completed);
                    if moved {
                        st.outputs = Self::collect_outputs(&st.routine, &st.process.memory.variables);
                    }
                    moved.then_some(None)
                }
                Err(err @ ExecutionError::CancellationRequested { .. }) => {
                    let moved = st.process.orchestration.advance(OrchestrationPhase::Cancelled);
                    if moved {
                        st.process.orchestration.cancel_outstanding();
                    }
                    moved.then_some(Some(err))
                }
                Err(err) => {
                    let moved = st.process.orchestration.advance(OrchestrationPhase::Failed);
                    if moved {
                        st.errors.push(err.to_info());
                    }
                    moved.then_some(Some(err))
                }
            };
            if st.finished_at.is_none() {
                st.finished_at = Some(Utc::now());
            }
            Self::leave_active(&mut st);
            let checkpoint = Self::snapshot(&mut st, run_id);
            (Self::outcome(&st, run_id), Self::record(&st, run_id), checkpoint, transition)
        };

        match transition {
            Some(None) => {
                info!(run_id = %run_id, credits = %outcome.resource_usage.credits, "Run completed");
                self.inner.events.emit(
                    event_types::RUN_COMPLETED,
                    Tier::Tier2,
                    json!({
                        "runId": run_id,
                        "outputs": outcome.outputs.keys().collect::<Vec<_>>(),
                        "creditsUsed": outcome.resource_usage.credits,
                    }),
                );
            }
            Some(Some(err @ ExecutionError::CancellationRequested { .. })) => {
                self.inner.events.emit(
                    event_types::RUN_CANCELLED,
                    Tier::Tier2,
                    json!({ "runId": run_id, "reason": err.to_string() }),
                );
            }
            Some(Some(err)) => {
                warn!(run_id = %run_id, error = %err, "Run failed");
                if matches!(err, ExecutionError::BudgetExceeded { .. }) {
                    self.inner.events.emit(
                        event_types::BUDGET_EXCEEDED,
                        Tier::Tier2,
                        json!({ "runId": run_id, "error": err.to_info() }),
                    );
                }
                self.inner.events.emit(
                    event_types::RUN_FAILED,
                    Tier::Tier2,
                    json!({ "runId": run_id, "error": err.to_info() }),
                );
            }
            None => {
                debug!(run_id = %run_id, phase = %outcome.status, "Run was already terminal");
            }
        }

        self.retire(run_id, &record, checkpoint).await;
        outcome
    }

    // ========================================================================
    // Persistence (never fatal)
    // ========================================================================

    async fn save_run(&self, record: &RunRecord) -> bool {
        match self.inner.repository.save_run(record).await {
            Ok(()) => true,
            Err(err) => {
                error!(run_id = %record.run_id, error = %err, "Failed to persist run");
                false
            }
        }
    }

    async fn save_step(&self, run_id: RunId, location: &str, result: StepExecutionResult) {
        let record = StepRecord {
            run_id,
            location: location.to_string(),
            result,
            recorded_at: Utc::now(),
        };
        if let Err(err) = self.inner.repository.save_step(&record).await {
            error!(run_id = %run_id, location, error = %err, "Failed to persist step");
        }
    }

    async fn save_checkpoint(&self, checkpoint: Checkpoint) -> bool {
        match self.inner.repository.save_checkpoint(&checkpoint).await {
            Ok(()) => {
                debug!(run_id = %checkpoint.run_id, sequence = checkpoint.sequence, "Checkpoint written");
                self.inner.events.emit(
                    event_types::RUN_CHECKPOINTED,
                    Tier::Tier2,
                    json!({
                        "runId": checkpoint.run_id,
                        "checkpointId": checkpoint.id,
                        "sequence": checkpoint.sequence,
                    }),
                );
                true
            }
            Err(err) => {
                warn!(run_id = %checkpoint.run_id, error = %err, "Checkpoint write failed");
                false
            }
        }
    }
}

#[async_trait]
impl TierHandler for RoutineOrchestrator {
    fn tier(&self) -> Tier {
        Tier::Tier2
    }

    async fn handle(&self, request: TierRequest) -> TierResponse {
        match request.request_type {
            RequestType::ExecuteRun => {
                let payload = match request.payload_as::<ExecuteRunPayload>() {
                    Ok(payload) => payload,
                    Err(err) => return TierResponse::err(request.id, &err),
                };
                let run_id = match self.start_run(payload.config).await {
                    Ok(run_id) => run_id,
                    Err(err) => return TierResponse::err(request.id, &err),
                };
                // The run is owned by its own task so an abandoned caller
                // cannot strand it mid-walk.
                let orchestrator = self.clone();
                let task = tokio::spawn(async move { orchestrator.execute_run(run_id).await });
                if !payload.await_completion {
                    return TierResponse::ok(
                        request.id,
                        json!({ "runId": run_id, "status": OrchestrationPhase::Initializing }),
                    );
                }
                match task.await {
                    Ok(result) => TierResponse::from_result(request.id, result),
                    Err(err) => TierResponse::err(request.id, &ExecutionError::external("tier2 run task", err)),
                }
            }
            RequestType::CancelRun => {
                let result = match request.payload_as::<RunRef>() {
                    Ok(target) => {
                        let reason = target.reason.as_deref().unwrap_or("cancel requested");
                        self.cancel_run(target.run_id, reason)
                            .await
                            .map(|cancelled| json!({ "cancelled": cancelled }))
                    }
                    Err(err) => Err(err),
                };
                TierResponse::from_result(request.id, result)
            }
            RequestType::GetStatus => {
                let result = match request.payload_as::<RunRef>() {
                    Ok(target) => self.get_run_status(target.run_id).await,
                    Err(err) => Err(err),
                };
                TierResponse::from_result(request.id, result)
            }
            other => TierResponse::err(
                request.id,
                &ExecutionError::validation(format!("tier2 does not handle {other:?} requests")),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::step_executor::StepExecutor;
    use crate::application::strategies::testing::{reply, services, ScriptedEngine};
    use crate::application::strategies::StrategyFactory;
    use crate::domain::config::StrategiesConfig;
    use crate::domain::events::{NoopPublisher, TierEvent};
    use crate::domain::resources::Credits;
    use crate::domain::step::StepOutcome;
    use crate::domain::routine::{Condition, Edge, IoSpec, TransformOp};
    use crate::infrastructure::repositories::InMemoryRunRepository;
    use std::collections::BTreeMap;
    use tokio::sync::Notify;

    /// Forwards to a real Tier3 and records which nodes reached it.
    struct RecordingTier3 {
        inner: StepExecutor,
        dispatched: Mutex<Vec<String>>,
        cancels: Mutex<Vec<StepId>>,
    }

    #[async_trait]
    impl TierHandler for RecordingTier3 {
        fn tier(&self) -> Tier {
            Tier::Tier3
        }

        async fn handle(&self, request: TierRequest) -> TierResponse {
            match request.request_type {
                RequestType::ExecuteStep => {
                    if let Ok(step) = request.payload_as::<StepExecutionRequest>() {
                        self.dispatched.lock().push(step.node_id);
                    }
                }
                RequestType::CancelStep => {
                    if let Ok(payload) = request.payload_as::<CancelStepPayload>() {
                        self.cancels.lock().push(payload.step_id);
                    }
                }
                _ => {}
            }
            self.inner.handle(request).await
        }
    }

    struct Harness {
        tier3: Arc<RecordingTier3>,
        repository: Arc<InMemoryRunRepository>,
        orchestrator: RoutineOrchestrator,
    }

    fn harness(engine: ScriptedEngine, config: OrchestratorConfig) -> Harness {
        let factory = StrategyFactory::new(services(Arc::new(engine)), StrategiesConfig::default());
        let tier3 = Arc::new(RecordingTier3 {
            inner: StepExecutor::new(factory, Arc::new(NoopPublisher)),
            dispatched: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
        });
        let repository = Arc::new(InMemoryRunRepository::new());
        let orchestrator = RoutineOrchestrator::new(tier3.clone(), repository.clone(), Arc::new(NoopPublisher), config);
        Harness {
            tier3,
            repository,
            orchestrator,
        }
    }

    fn budget(credits: u64) -> ResourceAllocation {
        ResourceAllocation::new(Credits::from(credits), 100_000, Duration::from_secs(60), 50)
    }

    fn constant(id: &str, output: &str, value: Value) -> Routine {
        Routine::single_step(
            id,
            StepDefinition::transform(vec![TransformOp::Constant {
                output: output.to_string(),
                value,
            }]),
        )
    }

    fn copy(id: &str, output: &str, source: &str) -> Routine {
        let mut mappings = BTreeMap::new();
        mappings.insert(output.to_string(), source.to_string());
        Routine::single_step(id, StepDefinition::transform(vec![TransformOp::Copy { mappings }]))
    }

    fn inputs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_sequence_completes_with_declared_outputs() {
        let h = harness(ScriptedEngine::default(), OrchestratorConfig::default());
        let graph = RoutineGraph::sequence(vec![
            Node::routine("a", constant("a", "x", json!(1))),
            Node::routine("b", copy("b", "y", "x")).map_output("y", "result"),
        ]);
        let routine = Routine::multi_step("flow", graph).with_outputs([IoSpec::required("result")]);

        let outcome = h.orchestrator.run(RunConfig::new(routine, budget(10))).await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.outputs, inputs(json!({"result": 1})));
        assert_eq!(*h.tier3.dispatched.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_composite_nodes_never_reach_tier3() {
        let h = harness(ScriptedEngine::default(), OrchestratorConfig::default());
        let inner = Routine::multi_step(
            "inner",
            RoutineGraph::sequence(vec![
                Node::routine("i1", constant("i1", "p", json!("a"))),
                Node::routine("i2", constant("i2", "q", json!("b"))),
            ]),
        );
        let graph = RoutineGraph::sequence(vec![
            Node::routine("sub", inner),
            Node::routine("after", constant("after", "r", json!("c"))),
        ]);

        let outcome = h
            .orchestrator
            .run(RunConfig::new(Routine::multi_step("outer", graph), budget(10)))
            .await
            .unwrap();
        assert!(outcome.is_completed());
        assert_eq!(*h.tier3.dispatched.lock(), vec!["i1", "i2", "after"]);
    }

    #[tokio::test]
    async fn test_step_over_budget_fails_run() {
        let h = harness(ScriptedEngine::new(vec![reply("costly", 150)]), OrchestratorConfig::default());
        let routine = Routine::single_step("expensive", StepDefinition::prompt("do it"))
            .with_outputs([IoSpec::required("response")]);

        let outcome = h.orchestrator.run(RunConfig::new(routine, budget(100))).await.unwrap();
        assert_eq!(outcome.status, OrchestrationPhase::Failed);
        assert!(outcome.outputs.is_empty());
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].code, "BUDGET_EXCEEDED");
        assert_eq!(outcome.resource_usage.credits, Credits::new(150));
    }

    /// Tier3 that answers every step with a fixed cost, whatever the
    /// allocation said. Completes the step unless `error` is set.
    struct FixedCostTier3 {
        usage: ResourceUsage,
        error: Option<ExecutionError>,
    }

    #[async_trait]
    impl TierHandler for FixedCostTier3 {
        fn tier(&self) -> Tier {
            Tier::Tier3
        }

        async fn handle(&self, request: TierRequest) -> TierResponse {
            let step: StepExecutionRequest = request.payload_as().unwrap();
            let result = match &self.error {
                Some(err) => StepExecutionResult::failed(step.step_id, err, self.usage.clone()),
                None => {
                    let mut outputs = Map::new();
                    outputs.insert("response".to_string(), json!("done anyway"));
                    StepExecutionResult {
                        step_id: step.step_id,
                        status: StepOutcome::Completed,
                        outputs,
                        error: None,
                        resource_usage: self.usage.clone(),
                        duration_ms: 1,
                        strategy: None,
                        tool_calls: Vec::new(),
                    }
                }
            };
            TierResponse::from_result(request.id, Ok(result))
        }
    }

    fn fixed_cost(usage: ResourceUsage, error: Option<ExecutionError>) -> RoutineOrchestrator {
        RoutineOrchestrator::new(
            Arc::new(FixedCostTier3 { usage, error }),
            Arc::new(InMemoryRunRepository::new()),
            Arc::new(NoopPublisher),
            OrchestratorConfig::default(),
        )
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TierEvent>>);

    impl EventPublisher for Recorder {
        fn publish(&self, event: TierEvent) {
            self.0.lock().push(event);
        }
    }

    #[tokio::test]
    async fn test_completed_step_over_allocation_is_not_committed() {
        let events = Arc::new(Recorder::default());
        let repository = Arc::new(InMemoryRunRepository::new());
        let orchestrator = RoutineOrchestrator::new(
            Arc::new(FixedCostTier3 {
                usage: ResourceUsage::credits(Credits::new(150)),
                error: None,
            }),
            repository.clone(),
            events.clone(),
            OrchestratorConfig::default(),
        );
        let routine = Routine::single_step("expensive", StepDefinition::prompt("do it"))
            .with_outputs([IoSpec::required("response")]);

        let outcome = orchestrator.run(RunConfig::new(routine, budget(100))).await.unwrap();
        assert_eq!(outcome.status, OrchestrationPhase::Failed);
        assert!(outcome.outputs.is_empty());
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].code, "BUDGET_EXCEEDED");
        assert_eq!(outcome.resource_usage.credits, Credits::new(150));

        let status = orchestrator.get_run_status(outcome.run_id).await.unwrap();
        assert_eq!(status.failed_steps, vec!["root/expensive"]);
        assert!(status.completed_steps.is_empty());
        let stored = repository.find_run(outcome.run_id).await.unwrap().unwrap();
        assert_eq!(stored.resource_usage.credits, Credits::new(150));
        assert!(events
            .0
            .lock()
            .iter()
            .any(|e| e.event_type == event_types::BUDGET_EXCEEDED));
    }

    #[tokio::test]
    async fn test_cut_off_steps_still_charge_the_run() {
        let routine = || {
            Routine::single_step("chat", StepDefinition::prompt("keep going"))
                .with_outputs([IoSpec::required("response")])
        };

        let timed_out = fixed_cost(
            ResourceUsage::credits(Credits::new(30)),
            Some(ExecutionError::limit_exceeded("time", "step exceeded its 2000ms timeout")),
        );
        let outcome = timed_out.run(RunConfig::new(routine(), budget(100))).await.unwrap();
        assert_eq!(outcome.status, OrchestrationPhase::Failed);
        assert_eq!(outcome.errors[0].code, "LIMIT_EXCEEDED");
        assert_eq!(outcome.resource_usage.credits, Credits::new(30));

        let cancelled = fixed_cost(
            ResourceUsage::credits(Credits::new(45)),
            Some(ExecutionError::cancelled("step cancelled")),
        );
        let outcome = cancelled.run(RunConfig::new(routine(), budget(100))).await.unwrap();
        assert_eq!(outcome.status, OrchestrationPhase::Cancelled);
        assert!(outcome.outputs.is_empty());
        assert_eq!(outcome.resource_usage.credits, Credits::new(45));
    }

    #[tokio::test]
    async fn test_zero_tool_call_ceiling_runs_transform_steps() {
        let h = harness(ScriptedEngine::default(), OrchestratorConfig::default());
        let graph = RoutineGraph::sequence(vec![
            Node::routine("a", constant("a", "x", json!(1))),
            Node::routine("b", copy("b", "y", "x")),
        ]);
        let allocation = ResourceAllocation::new(Credits::from(10), 0, Duration::from_secs(60), 0);

        let outcome = h
            .orchestrator
            .run(RunConfig::new(Routine::multi_step("flow", graph), allocation))
            .await
            .unwrap();
        assert!(outcome.is_completed(), "{:?}", outcome.errors);
        assert_eq!(outcome.outputs["y"], 1);
        assert_eq!(*h.tier3.dispatched.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_terminal_runs_leave_memory_but_keep_their_status() {
        let h = harness(ScriptedEngine::default(), OrchestratorConfig::default());
        let graph = RoutineGraph::sequence(vec![
            Node::routine("a", constant("a", "x", json!(1))),
            Node::routine("b", constant("b", "y", json!(2))),
        ]);

        let outcome = h
            .orchestrator
            .run(RunConfig::new(Routine::multi_step("flow", graph), budget(10)))
            .await
            .unwrap();
        assert!(h.orchestrator.inner.runs.is_empty());

        let status = h.orchestrator.get_run_status(outcome.run_id).await.unwrap();
        assert_eq!(status.phase, OrchestrationPhase::Completed);
        assert_eq!(status.completed_steps, vec!["flow/a", "flow/b"]);
        let again = h.orchestrator.execute_run(outcome.run_id).await.unwrap();
        assert_eq!(again, outcome);

        let reused = RunConfig::new(constant("r", "x", json!(1)), budget(10)).with_run_id(outcome.run_id);
        assert_eq!(h.orchestrator.start_run(reused).await.unwrap_err().code(), "VALIDATION_ERROR");

        let pending = h
            .orchestrator
            .start_run(RunConfig::new(constant("r", "x", json!(1)), budget(10)))
            .await
            .unwrap();
        assert!(h.orchestrator.cancel_run(pending, "not needed").await.unwrap());
        assert!(!h.orchestrator.inner.runs.contains_key(&pending));
        let status = h.orchestrator.get_run_status(pending).await.unwrap();
        assert_eq!(status.phase, OrchestrationPhase::Cancelled);
    }

    #[tokio::test]
    async fn test_pending_cancellations_for_unknown_runs_are_bounded() {
        let h = harness(ScriptedEngine::default(), OrchestratorConfig::default());
        let early = &h.orchestrator.inner.early_cancellations;
        let stale = Instant::now().checked_sub(EARLY_CANCEL_TTL * 2).unwrap();
        early.insert(RunId::new(), ("forgotten".to_string(), stale));

        for _ in 0..MAX_EARLY_CANCELLATIONS + 10 {
            assert!(h.orchestrator.cancel_run(RunId::new(), "early").await.is_err());
        }
        assert_eq!(early.len(), MAX_EARLY_CANCELLATIONS);
        assert!(early.iter().all(|entry| entry.value().0 == "early"));
    }

    #[tokio::test]
    async fn test_continue_policy_and_failure_branch() {
        let h = harness(ScriptedEngine::default(), OrchestratorConfig::default());
        let graph = RoutineGraph::new(
            "bad",
            vec![
                Node::routine("bad", copy("bad", "x", "missing")).on_failure(FailurePolicy::Continue),
                Node::routine("recover", constant("recover", "recovered", json!(true))),
                Node::routine("happy", constant("happy", "recovered", json!(false))),
            ],
            vec![
                Edge::new("bad", "recover").when(Condition::StepFailed { node: "bad".to_string() }),
                Edge::new("bad", "happy"),
            ],
        );

        let outcome = h
            .orchestrator
            .run(RunConfig::new(Routine::multi_step("flow", graph), budget(10)))
            .await
            .unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.outputs["recovered"], true);
        assert_eq!(outcome.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_loop_edge_revisits_up_to_limit() {
        let h = harness(ScriptedEngine::default(), OrchestratorConfig::default());
        let graph = RoutineGraph::new(
            "tick",
            vec![Node::routine("tick", constant("tick", "ticked", json!(true)))],
            vec![Edge::new("tick", "tick").looping(2)],
        );

        let outcome = h
            .orchestrator
            .run(RunConfig::new(Routine::multi_step("loop", graph), budget(10)))
            .await
            .unwrap();
        assert!(outcome.is_completed());
        assert_eq!(h.tier3.dispatched.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_dry_run_uses_placeholders_and_dispatches_nothing() {
        let h = harness(ScriptedEngine::default(), OrchestratorConfig::default());
        let summarize = Routine::single_step("summarize", StepDefinition::prompt("Summarize {{text}}"))
            .with_inputs([IoSpec::required("text")])
            .with_outputs([IoSpec::required("summary")]);
        let routine = Routine::multi_step(
            "flow",
            RoutineGraph::sequence(vec![Node::routine("summarize", summarize)]),
        )
        .with_inputs([IoSpec::required("text")])
        .with_outputs([IoSpec::required("summary")]);

        let outcome = h
            .orchestrator
            .run(RunConfig::new(routine, budget(10)).dry_run())
            .await
            .unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.outputs["summary"], "<summary>");
        assert!(outcome.resource_usage.credits.is_zero());
        assert!(h.tier3.dispatched.lock().is_empty());

        let status = h.orchestrator.get_run_status(outcome.run_id).await.unwrap();
        assert_eq!(status.skipped_steps, vec!["flow/summarize"]);
    }

    #[tokio::test]
    async fn test_parallel_branches_all_run() {
        let h = harness(ScriptedEngine::default(), OrchestratorConfig::default());
        let graph = RoutineGraph::sequence(vec![Node::parallel(
            "fan",
            vec![
                RoutineGraph::sequence(vec![Node::routine("left", constant("left", "l", json!(1)))]),
                RoutineGraph::sequence(vec![Node::routine("right", constant("right", "r", json!(2)))]),
            ],
        )]);

        let outcome = h
            .orchestrator
            .run(RunConfig::new(Routine::multi_step("fan", graph), budget(10)))
            .await
            .unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.outputs["l"], 1);
        assert_eq!(outcome.outputs["r"], 2);
    }

    #[tokio::test]
    async fn test_checkpoints_every_interval_and_at_end() {
        let config = OrchestratorConfig {
            checkpoint_interval: 1,
            ..OrchestratorConfig::default()
        };
        let h = harness(ScriptedEngine::default(), config);
        let graph = RoutineGraph::sequence(vec![
            Node::routine("a", constant("a", "x", json!(1))),
            Node::routine("b", constant("b", "y", json!(2))),
        ]);

        let outcome = h
            .orchestrator
            .run(RunConfig::new(Routine::multi_step("flow", graph), budget(10)))
            .await
            .unwrap();
        assert_eq!(h.repository.checkpoint_count(outcome.run_id), 3);
    }

    #[tokio::test]
    async fn test_step_limit_fails_run() {
        let config = OrchestratorConfig {
            max_steps_per_run: 1,
            ..OrchestratorConfig::default()
        };
        let h = harness(ScriptedEngine::default(), config);
        let graph = RoutineGraph::sequence(vec![
            Node::routine("a", constant("a", "x", json!(1))),
            Node::routine("b", constant("b", "y", json!(2))),
        ]);

        let outcome = h
            .orchestrator
            .run(RunConfig::new(Routine::multi_step("flow", graph), budget(10)))
            .await
            .unwrap();
        assert_eq!(outcome.status, OrchestrationPhase::Failed);
        assert_eq!(outcome.errors[0].code, "LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn test_missing_input_and_permission_are_rejected() {
        let h = harness(ScriptedEngine::default(), OrchestratorConfig::default());
        let routine = constant("r", "x", json!(1)).with_inputs([IoSpec::required("text")]);

        let err = h
            .orchestrator
            .start_run(RunConfig::new(routine.clone(), budget(10)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("text"));

        let mut config = RunConfig::new(routine, budget(10)).with_inputs(inputs(json!({"text": "hi"})));
        config.required_permission = Some("routine:execute".to_string());
        let err = h
            .orchestrator
            .start_run(config.clone().with_user(SessionUser::new("u1")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let allowed = SessionUser::new("u2").with_permissions(["routine:execute"]);
        assert!(h.orchestrator.start_run(config.with_user(allowed)).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_completed_run_is_noop() {
        let h = harness(ScriptedEngine::default(), OrchestratorConfig::default());
        let outcome = h
            .orchestrator
            .run(RunConfig::new(constant("r", "x", json!(1)), budget(10)))
            .await
            .unwrap();

        assert!(!h.orchestrator.cancel_run(outcome.run_id, "late").await.unwrap());
        let status = h.orchestrator.get_run_status(outcome.run_id).await.unwrap();
        assert_eq!(status.phase, OrchestrationPhase::Completed);
    }

    /// Tier3 that parks every step until told to cancel it.
    struct ParkingTier3 {
        started: Notify,
        released: Notify,
        cancels: Mutex<Vec<StepId>>,
    }

    #[async_trait]
    impl TierHandler for ParkingTier3 {
        fn tier(&self) -> Tier {
            Tier::Tier3
        }

        async fn handle(&self, request: TierRequest) -> TierResponse {
            match request.request_type {
                RequestType::ExecuteStep => {
                    let step: StepExecutionRequest = request.payload_as().unwrap();
                    self.started.notify_one();
                    self.released.notified().await;
                    let err = ExecutionError::cancelled("step cancelled");
                    TierResponse::from_result(
                        request.id,
                        Ok(StepExecutionResult::failed(step.step_id, &err, ResourceUsage::default())),
                    )
                }
                _ => {
                    let payload: CancelStepPayload = request.payload_as().unwrap();
                    self.cancels.lock().push(payload.step_id);
                    self.released.notify_one();
                    TierResponse::ok(request.id, json!({ "cancelled": true }))
                }
            }
        }
    }

    #[tokio::test]
    async fn test_cancel_in_flight_run_propagates_to_tier3() {
        let tier3 = Arc::new(ParkingTier3 {
            started: Notify::new(),
            released: Notify::new(),
            cancels: Mutex::new(Vec::new()),
        });
        let orchestrator = RoutineOrchestrator::new(
            tier3.clone(),
            Arc::new(InMemoryRunRepository::new()),
            Arc::new(NoopPublisher),
            OrchestratorConfig::default(),
        );
        let run_id = orchestrator
            .start_run(RunConfig::new(constant("r", "x", json!(1)), budget(10)))
            .await
            .unwrap();

        let runner = orchestrator.clone();
        let task = tokio::spawn(async move { runner.execute_run(run_id).await });
        tier3.started.notified().await;

        assert!(orchestrator.cancel_run(run_id, "user abort").await.unwrap());
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.status, OrchestrationPhase::Cancelled);
        assert_eq!(tier3.cancels.lock().len(), 1);
        let status = orchestrator.get_run_status(run_id).await.unwrap();
        assert_eq!(status.cancelled_steps, vec!["root/r"]);
    }

    #[tokio::test]
    async fn test_cancel_before_registration_starts_run_cancelled() {
        let h = harness(ScriptedEngine::default(), OrchestratorConfig::default());
        let run_id = RunId::new();
        assert!(h.orchestrator.cancel_run(run_id, "early").await.is_err());

        let config = RunConfig::new(constant("r", "x", json!(1)), budget(10)).with_run_id(run_id);
        let outcome = h.orchestrator.run(config).await.unwrap();
        assert_eq!(outcome.status, OrchestrationPhase::Cancelled);
        assert!(h.tier3.dispatched.lock().is_empty());
    }

    #[tokio::test]
    async fn test_tier_handler_requests() {
        let h = harness(ScriptedEngine::default(), OrchestratorConfig::default());
        let payload = ExecuteRunPayload {
            config: RunConfig::new(constant("r", "x", json!(7)), budget(10)),
            await_completion: true,
        };
        let request = TierRequest::with_payload(RequestType::ExecuteRun, Tier::Tier1, Tier::Tier2, &payload).unwrap();
        let outcome: RunOutcome = h.orchestrator.handle(request).await.into_result().unwrap();
        assert_eq!(outcome.outputs["x"], 7);

        let status = TierRequest::with_payload(
            RequestType::GetStatus,
            Tier::Tier1,
            Tier::Tier2,
            &RunRef {
                run_id: outcome.run_id,
                reason: None,
            },
        )
        .unwrap();
        let status: RunStatus = h.orchestrator.handle(status).await.into_result().unwrap();
        assert_eq!(status.completed_steps, vec!["root/r"]);

        let unknown = TierRequest::new(
            RequestType::CancelRun,
            Tier::Tier1,
            Tier::Tier2,
            json!({ "runId": RunId::new() }),
        );
        let response = h.orchestrator.handle(unknown).await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, "NOT_FOUND");
    }
}
