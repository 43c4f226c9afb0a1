// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for tier events
//
// In-memory streaming over a tokio broadcast channel. Every subscriber sees
// events in publish order; nothing is promised across subscribers. Events are
// not persisted, a subscriber that falls behind the channel capacity loses the
// oldest events and is told how many.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::events::{pattern_matches, EventPublisher, TierEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Event bus for publishing and subscribing to tier events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<TierEvent>>,
    subscriptions: Arc<DashMap<SubscriptionId, CancellationToken>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    /// Capacity is how many events are buffered per receiver before the
    /// oldest are dropped.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
            subscriptions: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish(&self, event: TierEvent) {
        debug!(event_type = %event.event_type, source = %event.source, "Publishing event");

        // send() only fails when nobody is listening
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
    }

    /// Raw receiver for every event.
    pub fn subscribe_all(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            pattern: None,
        }
    }

    /// Raw receiver filtered by a type pattern (`run.completed`, `run.*`, `*`).
    pub fn subscribe_pattern(&self, pattern: impl Into<String>) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            pattern: Some(pattern.into()),
        }
    }

    /// Run `handler` on a dedicated task for every event matching `pattern`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, pattern: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(TierEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let token = CancellationToken::new();
        self.subscriptions.insert(id, token.clone());

        let mut receiver = self.subscribe_pattern(pattern);
        let subscriptions = self.subscriptions.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = receiver.recv() => match next {
                        Ok(event) => handler(event),
                        Err(EventBusError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
            }
            subscriptions.remove(&id);
            debug!(subscription = %id, "Subscription task finished");
        });

        id
    }

    /// Stop a subscription task. Returns false for an unknown id.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.subscriptions.remove(&id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of live receivers, including those behind subscription tasks.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, event: TierEvent) {
        EventBus::publish(self, event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<TierEvent>,
    pattern: Option<String>,
}

impl EventReceiver {
    fn matches(&self, event: &TierEvent) -> bool {
        self.pattern
            .as_deref()
            .map_or(true, |p| pattern_matches(p, &event.event_type))
    }

    /// Next matching event (waits until one is available)
    pub async fn recv(&mut self) -> Result<TierEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => EventBusError::Closed,
                broadcast::error::RecvError::Lagged(n) => {
                    warn!("Event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Next matching event without waiting
    pub fn try_recv(&mut self) -> Result<TierEvent, EventBusError> {
        loop {
            let event = self.receiver.try_recv().map_err(|e| match e {
                broadcast::error::TryRecvError::Empty => EventBusError::Empty,
                broadcast::error::TryRecvError::Closed => EventBusError::Closed,
                broadcast::error::TryRecvError::Lagged(n) => {
                    warn!("Event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}
