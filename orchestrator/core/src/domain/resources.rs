// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Resource Budgets
//!
//! - [`Credits`] — the metered unit of execution cost.
//! - [`ResourceAllocation`] — ceilings handed to a swarm, run or step.
//! - [`ResourceUsage`] — what an execution unit actually consumed.
//! - [`BudgetLedger`] — books usage against one allocation and carves
//!   sub-allocations for children.
//!
//! ## Invariants
//!
//! - `consume` rejects, without mutating, usage that would exceed the
//!   allocation. `settle` books a child's usage as reported; an overspend is
//!   surfaced through [`ResourceUsage::overspend`] and fails the owner.
//! - A zero ceiling is only exhausted once something was consumed against it.
//! - A carved child allocation is subtracted from the parent's remaining budget
//!   while the child runs; `settle` returns the unused remainder.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

use crate::domain::errors::{BudgetResource, ExecutionError};

/// Non-negative credit amount.
///
/// Serialized as a decimal string so that values beyond the 53-bit range of
/// JSON numbers survive a round trip; numbers are still accepted on input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Credits(u128);

impl Credits {
    pub const ZERO: Credits = Credits(0);

    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Credits) -> Option<Credits> {
        self.0.checked_add(other.0).map(Credits)
    }

    pub fn checked_sub(self, other: Credits) -> Option<Credits> {
        self.0.checked_sub(other.0).map(Credits)
    }

    pub fn saturating_add(self, other: Credits) -> Credits {
        Credits(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Credits) -> Credits {
        Credits(self.0.saturating_sub(other.0))
    }

    /// Integer division, used when splitting a budget across parallel branches.
    pub fn split(self, parts: u32) -> Credits {
        Credits(self.0 / u128::from(parts.max(1)))
    }
}

impl From<u64> for Credits {
    fn from(value: u64) -> Self {
        Self(u128::from(value))
    }
}

impl FromStr for Credits {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u128>().map(Credits)
    }
}

impl fmt::Display for Credits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::iter::Sum for Credits {
    fn sum<I: Iterator<Item = Credits>>(iter: I) -> Self {
        iter.fold(Credits::ZERO, Credits::saturating_add)
    }
}

impl Serialize for Credits {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

struct CreditsVisitor;

impl<'de> Visitor<'de> for CreditsVisitor {
    type Value = Credits;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-negative integer or a decimal string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Credits, E> {
        Ok(Credits::from(v))
    }

    fn visit_u128<E: de::Error>(self, v: u128) -> Result<Credits, E> {
        Ok(Credits(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Credits, E> {
        u64::try_from(v)
            .map(Credits::from)
            .map_err(|_| E::custom(format!("credits cannot be negative: {v}")))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Credits, E> {
        v.parse::<Credits>()
            .map_err(|e| E::custom(format!("invalid credit amount '{v}': {e}")))
    }
}

impl<'de> Deserialize<'de> for Credits {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(CreditsVisitor)
    }
}

/// Optional scheduling hints; never enforced by the core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

/// Ceilings for one execution unit (swarm, run or step).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub max_credits: Credits,
    pub max_tokens: u64,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub max_tool_calls: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute: Option<ComputeHints>,
}

impl ResourceAllocation {
    pub fn new(max_credits: Credits, max_tokens: u64, timeout: Duration, max_tool_calls: u32) -> Self {
        Self {
            max_credits,
            max_tokens,
            timeout,
            max_tool_calls,
            compute: None,
        }
    }

    /// Allocation used for dry runs, which never consume budget.
    pub fn unmetered() -> Self {
        Self::new(Credits::new(u128::MAX), u64::MAX, Duration::from_secs(24 * 60 * 60), u32::MAX)
    }

    pub fn with_compute(mut self, compute: ComputeHints) -> Self {
        self.compute = Some(compute);
        self
    }

    /// Rejects allocations that could never admit any work.
    pub fn validate(&self) -> Result<(), ExecutionError> {
        if self.max_credits.is_zero() {
            return Err(ExecutionError::validation("max_credits must be greater than zero"));
        }
        if self.timeout.is_zero() {
            return Err(ExecutionError::validation("timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// Actual consumption reported by an execution unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub credits: Credits,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub tool_calls: u32,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ResourceUsage {
    pub fn credits(credits: Credits) -> Self {
        Self {
            credits,
            ..Self::default()
        }
    }

    pub fn add(&mut self, other: &ResourceUsage) {
        self.credits = self.credits.saturating_add(other.credits);
        self.tokens = self.tokens.saturating_add(other.tokens);
        self.tool_calls = self.tool_calls.saturating_add(other.tool_calls);
        self.duration_ms = self.duration_ms.saturating_add(other.duration_ms);
    }

    /// First ceiling of `allocation` this usage goes beyond, if any.
    pub fn exceeded_in(&self, allocation: &ResourceAllocation) -> Option<BudgetResource> {
        if self.credits > allocation.max_credits {
            Some(BudgetResource::Credits)
        } else if self.tokens > allocation.max_tokens {
            Some(BudgetResource::Tokens)
        } else if self.tool_calls > allocation.max_tool_calls {
            Some(BudgetResource::ToolCalls)
        } else {
            None
        }
    }

    /// `BudgetExceeded` for the first ceiling of `allocation` this usage
    /// goes beyond.
    pub fn overspend(&self, allocation: &ResourceAllocation) -> Option<ExecutionError> {
        let resource = self.exceeded_in(allocation)?;
        let (used, available) = match resource {
            BudgetResource::Tokens => (self.tokens.to_string(), allocation.max_tokens.to_string()),
            BudgetResource::ToolCalls => (self.tool_calls.to_string(), allocation.max_tool_calls.to_string()),
            _ => (self.credits.to_string(), allocation.max_credits.to_string()),
        };
        Some(ExecutionError::budget_exceeded(resource, used, available))
    }
}

/// A ceiling is exhausted once something was consumed against it and the
/// limit is reached. A zero ceiling with nothing consumed admits work that
/// does not draw on that resource.
fn exhausted<T: PartialOrd + Default>(consumed: T, limit: T) -> bool {
    consumed > T::default() && consumed >= limit
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Reservation {
    credits: Credits,
    tokens: u64,
    tool_calls: u32,
}

/// Books consumption against a single allocation.
#[derive(Debug, Clone)]
pub struct BudgetLedger {
    allocation: ResourceAllocation,
    consumed: ResourceUsage,
    reserved: Reservation,
    started_at: Instant,
}

impl BudgetLedger {
    pub fn new(allocation: ResourceAllocation) -> Self {
        Self {
            allocation,
            consumed: ResourceUsage::default(),
            reserved: Reservation::default(),
            started_at: Instant::now(),
        }
    }

    pub fn allocation(&self) -> &ResourceAllocation {
        &self.allocation
    }

    pub fn consumed(&self) -> &ResourceUsage {
        &self.consumed
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn remaining_time(&self) -> Duration {
        self.allocation.timeout.saturating_sub(self.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed() >= self.allocation.timeout
    }

    pub fn remaining_credits(&self) -> Credits {
        self.allocation
            .max_credits
            .saturating_sub(self.consumed.credits)
            .saturating_sub(self.reserved.credits)
    }

    fn remaining_tokens(&self) -> u64 {
        self.allocation
            .max_tokens
            .saturating_sub(self.consumed.tokens)
            .saturating_sub(self.reserved.tokens)
    }

    fn remaining_tool_calls(&self) -> u32 {
        self.allocation
            .max_tool_calls
            .saturating_sub(self.consumed.tool_calls)
            .saturating_sub(self.reserved.tool_calls)
    }

    /// What is still available, expressed as an allocation.
    pub fn remaining(&self) -> ResourceAllocation {
        ResourceAllocation {
            max_credits: self.remaining_credits(),
            max_tokens: self.remaining_tokens(),
            timeout: self.remaining_time(),
            max_tool_calls: self.remaining_tool_calls(),
            compute: self.allocation.compute.clone(),
        }
    }

    /// Reports the first exhausted ceiling. Checked before every dispatch.
    pub fn check_ceilings(&self) -> Result<(), ExecutionError> {
        if self.is_expired() {
            return Err(ExecutionError::limit_exceeded(
                BudgetResource::Time.to_string(),
                format!(
                    "{}ms elapsed of {}ms allowed",
                    self.elapsed().as_millis(),
                    self.allocation.timeout.as_millis()
                ),
            ));
        }
        if exhausted(self.consumed.credits, self.allocation.max_credits) {
            return Err(ExecutionError::limit_exceeded(
                BudgetResource::Credits.to_string(),
                format!(
                    "{} of {} credits consumed",
                    self.consumed.credits, self.allocation.max_credits
                ),
            ));
        }
        if exhausted(self.consumed.tokens, self.allocation.max_tokens) {
            return Err(ExecutionError::limit_exceeded(
                BudgetResource::Tokens.to_string(),
                format!(
                    "{} of {} tokens consumed",
                    self.consumed.tokens, self.allocation.max_tokens
                ),
            ));
        }
        if exhausted(self.consumed.tool_calls, self.allocation.max_tool_calls) {
            return Err(ExecutionError::limit_exceeded(
                BudgetResource::ToolCalls.to_string(),
                format!(
                    "{} of {} tool calls used",
                    self.consumed.tool_calls, self.allocation.max_tool_calls
                ),
            ));
        }
        Ok(())
    }

    /// Reserve a child allocation out of the remaining budget.
    ///
    /// The child's timeout is clamped to the time this ledger has left.
    pub fn carve(&mut self, request: &ResourceAllocation) -> Result<ResourceAllocation, ExecutionError> {
        let credits = self.remaining_credits();
        if request.max_credits > credits {
            return Err(ExecutionError::budget_exceeded(
                BudgetResource::Credits,
                request.max_credits,
                credits,
            ));
        }
        let tokens = self.remaining_tokens();
        if request.max_tokens > tokens {
            return Err(ExecutionError::budget_exceeded(
                BudgetResource::Tokens,
                request.max_tokens,
                tokens,
            ));
        }
        let tool_calls = self.remaining_tool_calls();
        if request.max_tool_calls > tool_calls {
            return Err(ExecutionError::budget_exceeded(
                BudgetResource::ToolCalls,
                request.max_tool_calls,
                tool_calls,
            ));
        }
        let time_left = self.remaining_time();
        if time_left.is_zero() {
            return Err(ExecutionError::budget_exceeded(
                BudgetResource::Time,
                format!("{}ms", request.timeout.as_millis()),
                "0ms",
            ));
        }

        self.reserved.credits = self.reserved.credits.saturating_add(request.max_credits);
        self.reserved.tokens = self.reserved.tokens.saturating_add(request.max_tokens);
        self.reserved.tool_calls = self.reserved.tool_calls.saturating_add(request.max_tool_calls);

        let mut carved = request.clone();
        carved.timeout = request.timeout.min(time_left);
        Ok(carved)
    }

    /// Release a carved allocation and book what the child actually used.
    ///
    /// Usage is booked as reported, even past the carved amount; callers
    /// check [`ResourceUsage::overspend`] and fail the owner. Returns the
    /// unused remainder that flows back to this ledger.
    pub fn settle(&mut self, carved: &ResourceAllocation, used: &ResourceUsage) -> ResourceUsage {
        self.reserved.credits = self.reserved.credits.saturating_sub(carved.max_credits);
        self.reserved.tokens = self.reserved.tokens.saturating_sub(carved.max_tokens);
        self.reserved.tool_calls = self.reserved.tool_calls.saturating_sub(carved.max_tool_calls);
        self.consumed.add(used);

        ResourceUsage {
            credits: carved.max_credits.saturating_sub(used.credits),
            tokens: carved.max_tokens.saturating_sub(used.tokens),
            tool_calls: carved.max_tool_calls.saturating_sub(used.tool_calls),
            duration_ms: 0,
        }
    }

    /// Book usage directly. Rejects, without mutating, anything that would
    /// push consumption past the allocation.
    pub fn consume(&mut self, usage: &ResourceUsage) -> Result<(), ExecutionError> {
        let credits = self.remaining_credits();
        if usage.credits > credits {
            return Err(ExecutionError::budget_exceeded(
                BudgetResource::Credits,
                usage.credits,
                credits,
            ));
        }
        let tokens = self.remaining_tokens();
        if usage.tokens > tokens {
            return Err(ExecutionError::budget_exceeded(
                BudgetResource::Tokens,
                usage.tokens,
                tokens,
            ));
        }
        let tool_calls = self.remaining_tool_calls();
        if usage.tool_calls > tool_calls {
            return Err(ExecutionError::budget_exceeded(
                BudgetResource::ToolCalls,
                usage.tool_calls,
                tool_calls,
            ));
        }
        self.consumed.add(usage);
        Ok(())
    }
}
