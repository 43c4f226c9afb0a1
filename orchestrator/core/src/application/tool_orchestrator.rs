// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Tool Orchestrator
//!
//! Single entry point for tool calls from every strategy. Per call:
//!
//! 1. rate limit (`tool_calls`, keyed by the calling user)
//! 2. approval policy; flagged calls go to the [`ApprovalGate`] when one is
//!    configured, otherwise they are recorded as `approval_required` and skipped
//! 3. execution through the [`ToolExecutor`]
//!
//! Every path ends in a [`ToolCallRecord`]. A call never fails the step; the
//! strategy looks at the record and decides.

use chrono::Utc;
use metrics::counter;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::rate_limiter::RateLimiter;
use crate::domain::context::Tier;
use crate::domain::events::{event_types, EventPublisher};
use crate::domain::resources::Credits;
use crate::domain::security::SessionUser;
use crate::domain::step::{ToolCallRecord, ToolCallStatus};
use crate::domain::tool_policy::ToolApprovalPolicy;
use crate::domain::tools::{ApprovalGate, ApprovalRequest, ToolExecutor};

pub const TOOL_CALLS_RESOURCE: &str = "tool_calls";

pub struct ToolOrchestrator {
    executor: Arc<dyn ToolExecutor>,
    rate_limiter: Arc<RateLimiter>,
    policy: ToolApprovalPolicy,
    approval_gate: Option<Arc<dyn ApprovalGate>>,
    events: Arc<dyn EventPublisher>,
}

impl ToolOrchestrator {
    pub fn new(
        executor: Arc<dyn ToolExecutor>,
        rate_limiter: Arc<RateLimiter>,
        policy: ToolApprovalPolicy,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            executor,
            rate_limiter,
            policy,
            approval_gate: None,
            events,
        }
    }

    pub fn with_approval_gate(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval_gate = Some(gate);
        self
    }

    pub fn policy(&self) -> &ToolApprovalPolicy {
        &self.policy
    }

    fn record(
        tool_name: &str,
        arguments: Value,
        status: ToolCallStatus,
        started: Instant,
    ) -> ToolCallRecord {
        ToolCallRecord {
            id: Uuid::new_v4(),
            tool_name: tool_name.to_string(),
            arguments,
            status,
            result: None,
            error: None,
            credits_used: Credits::ZERO,
            duration_ms: started.elapsed().as_millis() as u64,
            started_at: Utc::now(),
        }
    }

    pub async fn call(
        &self,
        tool_name: &str,
        arguments: Value,
        user: Option<&SessionUser>,
        estimated_credits: Option<Credits>,
    ) -> ToolCallRecord {
        let started = Instant::now();
        let caller = user.map(|u| u.id.as_str());

        let admission = self.rate_limiter.check(TOOL_CALLS_RESOURCE, 1, caller);
        if !admission.allowed {
            let retry_ms = admission.retry_after.map_or(0, |d| d.as_millis());
            let mut record = Self::record(tool_name, arguments, ToolCallStatus::RateLimited, started);
            record.error = Some(format!("rate limited, retry after {retry_ms}ms"));
            counter!("strata_tool_calls_total", "status" => "rate_limited").increment(1);
            return record;
        }

        if self.policy.requires_approval(tool_name, caller, estimated_credits) {
            let approved = match &self.approval_gate {
                Some(gate) => {
                    let request = ApprovalRequest {
                        tool_name: tool_name.to_string(),
                        arguments: arguments.clone(),
                        caller_id: caller.map(str::to_string),
                        estimated_credits,
                    };
                    gate.decide(&request).await
                }
                None => false,
            };

            if !approved {
                info!(tool = tool_name, caller = caller.unwrap_or("-"), "Tool call requires approval");
                self.events.emit(
                    event_types::TOOL_APPROVAL_REQUIRED,
                    Tier::Tier3,
                    json!({
                        "tool": tool_name,
                        "callerId": caller,
                        "gated": self.approval_gate.is_some(),
                    }),
                );
                let mut record =
                    Self::record(tool_name, arguments, ToolCallStatus::ApprovalRequired, started);
                record.error = Some(if self.approval_gate.is_some() {
                    "approval denied".to_string()
                } else {
                    "awaiting approval".to_string()
                });
                counter!("strata_tool_calls_total", "status" => "approval_required").increment(1);
                return record;
            }
        }

        let outcome = self.executor.execute(tool_name, &arguments, user).await;
        let mut record = Self::record(tool_name, arguments, ToolCallStatus::Succeeded, started);
        match outcome {
            Ok(output) => {
                debug!(tool = tool_name, credits = %output.credits_used, "Tool call succeeded");
                record.credits_used = output.credits_used;
                record.result = Some(output.value);
                counter!("strata_tool_calls_total", "status" => "succeeded").increment(1);
                self.events.emit(
                    event_types::TOOL_CALLED,
                    Tier::Tier3,
                    json!({
                        "callId": record.id,
                        "tool": tool_name,
                        "creditsUsed": record.credits_used,
                        "durationMs": record.duration_ms,
                    }),
                );
            }
            Err(message) => {
                warn!(tool = tool_name, error = %message, "Tool call failed");
                record.status = ToolCallStatus::Failed;
                record.error = Some(message);
                counter!("strata_tool_calls_total", "status" => "failed").increment(1);
                self.events.emit(
                    event_types::TOOL_FAILED,
                    Tier::Tier3,
                    json!({
                        "callId": record.id,
                        "tool": tool_name,
                        "error": record.error,
                    }),
                );
            }
        }
        record
    }
}
