//! Multiplexing engine: the process-wide publish/subscribe hub.
//!
//! Every published event gets the next global sequence number and is
//! appended once to a shared retention window. Subscribers are cursors
//! into that window, never copies, so fan-out is O(subscribers) no matter
//! how large the event is.
//!
//! `publish` is synchronous and never waits on a consumer. A subscriber
//! that falls more than `queue_max_events` behind is flagged as
//! overflowing and disconnected; producers are never throttled.
//!
//! # Purge contract
//!
//! The front of the window is purged once every live subscriber has
//! committed past it and more than `retention_events` events are held.
//! The hard caps `retention_max_events` and `retention_max_age` purge
//! regardless; a subscriber that had not yet read a purged event is
//! disconnected with an overflow error, never silently skipped.

mod filter;
mod subscription;

pub use filter::EventFilter;
pub use subscription::{Delivery, SubscribeOptions, Subscription};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::catalogue::Event;
use crate::stream::StreamError;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("multiplexing engine is not running (state: {0:?})")]
    NotRunning(EngineState),

    #[error("subscriber '{0}' overflowed and was disconnected")]
    Overflow(String),

    #[error("subscription {0} no longer exists")]
    Unsubscribed(u64),
}

impl From<EngineError> for StreamError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotRunning(_) => StreamError::NotRunning,
            EngineError::Overflow(name) => StreamError::Overflow(name),
            EngineError::Unsubscribed(id) => StreamError::Closed(format!("subscription {id}")),
        }
    }
}

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backlog after which a subscriber is disconnected.
    pub queue_max_events: u64,
    /// History kept for replay once every subscriber has committed.
    pub retention_events: usize,
    /// Hard cap on retained events.
    pub retention_max_events: usize,
    /// Hard cap on the age of retained events, in milliseconds.
    pub retention_max_age_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_max_events: 100_000,
            retention_events: 10_000,
            retention_max_events: 1_000_000,
            retention_max_age_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn retention_max_age(&self) -> Option<Duration> {
        self.retention_max_age_ms.map(Duration::from_millis)
    }
}

/// Listener of engine lifecycle transitions.
///
/// `observe` runs under the engine lock for every published event and
/// must stay cheap.
#[async_trait]
pub trait Hooker: Send + Sync {
    fn name(&self) -> &str;

    /// Called by `start`; returned events are published before any other.
    async fn starting(&self) -> Vec<Arc<Event>> {
        Vec::new()
    }

    /// Called by `stop` before the engine reaches `Stopped`; returned
    /// events are appended as the last ones.
    async fn stopping(&self) -> Vec<Arc<Event>> {
        Vec::new()
    }

    fn observe(&self, _event: &Arc<Event>) {}
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberStats {
    pub id: u64,
    pub name: String,
    /// Sequence of the next event to deliver.
    pub next: u64,
    pub committed: u64,
    pub backlog: u64,
    pub overflowed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub state: EngineState,
    /// Sequence of the most recent event, 0 before the first one.
    pub last_sequence: u64,
    pub retained: usize,
    pub oldest_retained: Option<u64>,
    pub hooks: usize,
    pub subscribers: Vec<SubscriberStats>,
}

// ============================================================================
// Engine
// ============================================================================

struct Slot {
    sequence: u64,
    at: Instant,
    event: Arc<Event>,
}

struct Subscriber {
    name: String,
    next: u64,
    committed: u64,
    overflowed: bool,
    filter: EventFilter,
    notify: Arc<Notify>,
}

struct Inner {
    state: EngineState,
    next_sequence: u64,
    retained: VecDeque<Slot>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber: u64,
    hooks: Vec<Arc<dyn Hooker>>,
}

/// The multiplexing engine. Share it as `Arc<Engine>`.
pub struct Engine {
    config: EngineConfig,
    inner: Mutex<Inner>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(Inner {
                state: EngineState::Uninitialized,
                next_sequence: 1,
                retained: VecDeque::new(),
                subscribers: HashMap::new(),
                next_subscriber: 1,
                hooks: Vec::new(),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.inner.lock().state
    }

    /// `Uninitialized → Running`. Hookers' starting events go out first.
    ///
    /// Starting an already running engine is a no-op; a stopped engine
    /// cannot be restarted.
    pub async fn start(&self) -> Result<()> {
        let hooks = {
            let inner = self.inner.lock();
            match inner.state {
                EngineState::Uninitialized => inner.hooks.clone(),
                EngineState::Running => return Ok(()),
                other => return Err(EngineError::NotRunning(other)),
            }
        };

        let mut initial = Vec::new();
        for hook in &hooks {
            let events = hook.starting().await;
            debug!(hooker = hook.name(), events = events.len(), "Hooker started");
            initial.extend(events);
        }

        let mut inner = self.inner.lock();
        if inner.state != EngineState::Uninitialized {
            return Ok(());
        }
        inner.state = EngineState::Running;
        let count = initial.len();
        for event in initial {
            inner.append(event, &self.config);
        }
        info!(hooks = hooks.len(), initial_events = count, "Multiplexing engine started");
        Ok(())
    }

    /// Publish one event and return its sequence number.
    pub fn publish(&self, event: Arc<Event>) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.state != EngineState::Running {
            return Err(EngineError::NotRunning(inner.state));
        }
        Ok(inner.append(event, &self.config))
    }

    /// Attach a new subscriber.
    pub fn subscribe(self: &Arc<Self>, options: SubscribeOptions) -> Result<Subscription> {
        let mut inner = self.inner.lock();
        if inner.state != EngineState::Running {
            return Err(EngineError::NotRunning(inner.state));
        }
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;

        let live = inner.next_sequence;
        let base = inner.retained.front().map_or(live, |slot| slot.sequence);
        let (next, gap) = match options.replay_from {
            None => (live, None),
            Some(after) => {
                let wanted = after.saturating_add(1);
                if wanted < base {
                    (base, Some(wanted..base))
                } else {
                    (wanted.min(live), None)
                }
            }
        };
        if let Some(gap) = &gap {
            warn!(
                subscriber = %options.name,
                missing_from = gap.start,
                missing_to = gap.end,
                "Replay requested below retention window, starting at oldest retained event"
            );
        }

        let notify = Arc::new(Notify::new());
        inner.subscribers.insert(
            id,
            Subscriber {
                name: options.name.clone(),
                next,
                committed: next - 1,
                overflowed: false,
                filter: options.filter,
                notify: notify.clone(),
            },
        );
        if next < live {
            notify.notify_one();
        }
        info!(subscriber = %options.name, id, from = next, "Subscriber attached");
        Ok(Subscription::new(self.clone(), id, options.name, notify, gap))
    }

    /// Detach a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(sub) = inner.subscribers.remove(&id) {
            debug!(subscriber = %sub.name, id, "Subscriber detached");
            inner.purge(&self.config);
        }
    }

    /// Register a lifecycle listener. Hooking the same instance twice is a
    /// no-op.
    pub fn hook(&self, hooker: Arc<dyn Hooker>) {
        let mut inner = self.inner.lock();
        if inner.hooks.iter().any(|h| Arc::ptr_eq(h, &hooker)) {
            return;
        }
        debug!(hooker = hooker.name(), "Hooker registered");
        inner.hooks.push(hooker);
    }

    /// Remove a lifecycle listener. Unknown listeners are ignored.
    pub fn unhook(&self, hooker: &Arc<dyn Hooker>) {
        self.inner.lock().hooks.retain(|h| !Arc::ptr_eq(h, hooker));
    }

    /// Stop the engine: `Running → Stopping → Stopped`.
    ///
    /// Hookers' `stopping` runs before `Stopped` is reached and their final
    /// events are appended. Every subscriber is then woken; each drains its
    /// remaining backlog and receives end-of-stream. Idempotent.
    pub async fn stop(&self) {
        let hooks = {
            let mut inner = self.inner.lock();
            match inner.state {
                EngineState::Running => {
                    inner.state = EngineState::Stopping;
                    inner.hooks.clone()
                }
                EngineState::Uninitialized => {
                    inner.state = EngineState::Stopped;
                    inner.wake_all();
                    return;
                }
                EngineState::Stopping | EngineState::Stopped => return,
            }
        };
        info!("Multiplexing engine stopping");

        let mut finals = Vec::new();
        for hook in &hooks {
            let events = hook.stopping().await;
            debug!(hooker = hook.name(), events = events.len(), "Hooker stopped");
            finals.extend(events);
        }

        let mut inner = self.inner.lock();
        for event in finals {
            inner.append(event, &self.config);
        }
        inner.state = EngineState::Stopped;
        inner.wake_all();
        info!(
            last_sequence = inner.next_sequence - 1,
            subscribers = inner.subscribers.len(),
            "Multiplexing engine stopped"
        );
    }

    pub fn statistics(&self) -> EngineStats {
        let inner = self.inner.lock();
        let last_sequence = inner.next_sequence - 1;
        let mut subscribers: Vec<_> = inner
            .subscribers
            .iter()
            .map(|(id, sub)| SubscriberStats {
                id: *id,
                name: sub.name.clone(),
                next: sub.next,
                committed: sub.committed,
                backlog: inner.next_sequence.saturating_sub(sub.next),
                overflowed: sub.overflowed,
            })
            .collect();
        subscribers.sort_by_key(|s| s.id);
        EngineStats {
            state: inner.state,
            last_sequence,
            retained: inner.retained.len(),
            oldest_retained: inner.retained.front().map(|slot| slot.sequence),
            hooks: inner.hooks.len(),
            subscribers,
        }
    }

    // ------------------------------------------------------------------------
    // Subscription internals
    // ------------------------------------------------------------------------

    /// Next deliverable item for `id`, `None` if the caller must wait.
    fn poll(&self, id: u64) -> Result<Option<Delivery>> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        let Inner {
            retained,
            subscribers,
            ..
        } = &mut *inner;
        let sub = subscribers.get_mut(&id).ok_or(EngineError::Unsubscribed(id))?;
        if sub.overflowed {
            return Err(EngineError::Overflow(sub.name.clone()));
        }
        let base = retained.front().map_or(sub.next, |slot| slot.sequence);
        let start = sub.next.saturating_sub(base) as usize;
        for slot in retained.iter().skip(start) {
            sub.next = slot.sequence + 1;
            if sub.filter.matches(&slot.event) {
                return Ok(Some(Delivery::Event {
                    sequence: slot.sequence,
                    event: slot.event.clone(),
                }));
            }
            if sub.committed + 1 == slot.sequence {
                sub.committed = slot.sequence;
            }
        }
        if state == EngineState::Stopped {
            return Ok(Some(Delivery::EndOfStream));
        }
        Ok(None)
    }

    fn committed(&self, id: u64) -> Option<u64> {
        self.inner.lock().subscribers.get(&id).map(|sub| sub.committed)
    }

    fn commit(&self, id: u64, sequence: u64) {
        let mut inner = self.inner.lock();
        if let Some(sub) = inner.subscribers.get_mut(&id) {
            let delivered = sub.next - 1;
            sub.committed = sub.committed.max(sequence.min(delivered));
            inner.purge(&self.config);
        }
    }

    fn drain(&self, id: u64) -> Result<Vec<(u64, Arc<Event>)>> {
        let mut inner = self.inner.lock();
        let Inner {
            retained,
            subscribers,
            ..
        } = &mut *inner;
        let sub = subscribers.get_mut(&id).ok_or(EngineError::Unsubscribed(id))?;
        if sub.overflowed {
            return Err(EngineError::Overflow(sub.name.clone()));
        }
        let base = retained.front().map_or(sub.next, |slot| slot.sequence);
        let start = sub.next.saturating_sub(base) as usize;
        let drained: Vec<_> = retained
            .iter()
            .skip(start)
            .filter(|slot| sub.filter.matches(&slot.event))
            .map(|slot| (slot.sequence, slot.event.clone()))
            .collect();
        if let Some(last) = retained.back() {
            sub.next = sub.next.max(last.sequence + 1);
        }
        Ok(drained)
    }
}

impl Inner {
    fn append(&mut self, event: Arc<Event>, config: &EngineConfig) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        for hook in &self.hooks {
            hook.observe(&event);
        }

        for sub in self.subscribers.values_mut() {
            if sub.overflowed {
                continue;
            }
            // Caught-up subscribers skip unwanted events without waking.
            if sub.next == sequence && !sub.filter.matches(&event) {
                sub.next = sequence + 1;
                if sub.committed + 1 == sequence {
                    sub.committed = sequence;
                }
                continue;
            }
            let backlog = sequence + 1 - sub.next;
            if backlog > config.queue_max_events {
                sub.overflowed = true;
                warn!(
                    subscriber = %sub.name,
                    backlog,
                    limit = config.queue_max_events,
                    sequence,
                    "Subscriber overflowed, disconnecting"
                );
            }
            sub.notify.notify_one();
        }

        self.retained.push_back(Slot {
            sequence,
            at: Instant::now(),
            event,
        });
        self.purge(config);
        sequence
    }

    fn purge(&mut self, config: &EngineConfig) {
        let min_committed = self
            .subscribers
            .values()
            .filter(|sub| !sub.overflowed)
            .map(|sub| sub.committed)
            .min()
            .unwrap_or(self.next_sequence - 1);

        while self.retained.len() > config.retention_events {
            match self.retained.front() {
                Some(slot) if slot.sequence <= min_committed => {
                    self.retained.pop_front();
                }
                _ => break,
            }
        }

        let max_age = config.retention_max_age();
        loop {
            let Some(front) = self.retained.front() else {
                break;
            };
            let over_count = self.retained.len() > config.retention_max_events;
            let over_age = max_age.is_some_and(|age| front.at.elapsed() > age);
            if !over_count && !over_age {
                break;
            }
            let purged = front.sequence;
            self.retained.pop_front();
            for sub in self.subscribers.values_mut() {
                if !sub.overflowed && sub.next <= purged {
                    sub.overflowed = true;
                    warn!(
                        subscriber = %sub.name,
                        sequence = purged,
                        "Retention cap reached before subscriber read event, disconnecting"
                    );
                    sub.notify.notify_one();
                }
            }
        }
    }

    fn wake_all(&self) {
        for sub in self.subscribers.values() {
            sub.notify.notify_one();
        }
    }
}
