use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use super::{Engine, EventFilter, Result};
use crate::catalogue::Event;

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub name: String,
    /// Replay every retained event after this sequence. `None` starts live.
    pub replay_from: Option<u64>,
    pub filter: EventFilter,
}

impl SubscribeOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn replay_from(mut self, sequence: u64) -> Self {
        self.replay_from = Some(sequence);
        self
    }

    pub fn filter(mut self, filter: EventFilter) -> Self {
        self.filter = filter;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event { sequence: u64, event: Arc<Event> },
    /// Nothing arrived before the timeout.
    Timeout,
    /// The engine stopped and this subscriber has seen everything.
    EndOfStream,
}

/// A subscriber's cursor into the engine. Dropping it unsubscribes.
pub struct Subscription {
    engine: Arc<Engine>,
    id: u64,
    name: String,
    notify: Arc<Notify>,
    gap: Option<Range<u64>>,
}

impl Subscription {
    pub(super) fn new(
        engine: Arc<Engine>,
        id: u64,
        name: String,
        notify: Arc<Notify>,
        gap: Option<Range<u64>>,
    ) -> Self {
        Self {
            engine,
            id,
            name,
            notify,
            gap,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sequences requested for replay that had already been purged.
    pub fn gap(&self) -> Option<Range<u64>> {
        self.gap.clone()
    }

    /// Wait up to `timeout` for the next event in sequence order.
    pub async fn next(&mut self, timeout: Duration) -> Result<Delivery> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.engine.poll(self.id)? {
                return Ok(delivery);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(Delivery::Timeout);
            }
        }
    }

    /// Mark everything up to `sequence` as processed. Committing beyond
    /// what was delivered is clamped.
    pub fn commit(&self, sequence: u64) {
        self.engine.commit(self.id, sequence);
    }

    /// Highest sequence committed so far. Before any commit this is the
    /// sequence just below where the subscription started.
    pub fn committed(&self) -> u64 {
        self.engine.committed(self.id).unwrap_or(0)
    }

    /// Take every pending event without waiting. The caller commits once
    /// they are safely stored.
    pub fn drain(&mut self) -> Result<Vec<(u64, Arc<Event>)>> {
        self.engine.drain(self.id)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.engine.unsubscribe(self.id);
    }
}
