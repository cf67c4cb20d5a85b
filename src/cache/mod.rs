//! Side tables rebuilt from published events.
//!
//! A [`DimensionMirror`] is hooked into the engine and keeps the latest
//! event per key for a set of event ids. Its state is saved to a snapshot
//! file on stop and loaded back on start, so lookups work before the
//! first live event arrives. Nothing else writes to it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::bbdo::{BbdoOptions, BbdoStream, Role};
use crate::catalogue::{Catalogue, Event, EventId, Value};
use crate::events::storage;
use crate::multiplexing::Hooker;
use crate::stream::file::{self, FileStream};
use crate::stream::{self as streams, Received, Stream};

/// Synchronous lookups answered from replayed events.
pub trait PersistentCache: Send + Sync {
    type Key: ?Sized;
    type Value;

    fn get(&self, key: &Self::Key) -> Option<Self::Value>;
}

// ============================================================================
// Event files
// ============================================================================

const FILE_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// A list of events stored as BBDO frames in a split file set.
#[derive(Debug, Clone)]
pub struct EventFile {
    path: PathBuf,
    catalogue: Arc<Catalogue>,
}

impl EventFile {
    pub fn new(path: impl Into<PathBuf>, catalogue: Arc<Catalogue>) -> Self {
        Self {
            path: path.into(),
            catalogue,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn options() -> BbdoOptions {
        BbdoOptions {
            coarse: true,
            relay_unknown: true,
            ..Default::default()
        }
    }

    async fn open(&self) -> streams::Result<BbdoStream> {
        let bytes = FileStream::open(&self.path, 0).await?;
        BbdoStream::open(
            Box::new(bytes),
            self.catalogue.clone(),
            Self::options(),
            Role::First,
        )
        .await
    }

    /// Every stored event, oldest first. A missing file is empty.
    pub async fn load(&self) -> streams::Result<Vec<Arc<Event>>> {
        if file::existing_splits(&self.path).await.is_empty() {
            return Ok(Vec::new());
        }
        let mut stream = self.open().await?;
        let mut events = Vec::new();
        loop {
            match stream.read(FILE_READ_TIMEOUT).await? {
                Received::Item(event) => events.push(event),
                Received::WouldBlock => continue,
                Received::EndOfStream => break,
            }
        }
        Ok(events)
    }

    /// Overwrite the file with `events`.
    pub async fn replace(&self, events: &[Arc<Event>]) -> streams::Result<()> {
        self.clear().await?;
        if events.is_empty() {
            return Ok(());
        }
        let mut stream = self.open().await?;
        for event in events {
            stream.write(event.clone()).await?;
        }
        stream.flush().await?;
        stream.close().await
    }

    pub async fn clear(&self) -> streams::Result<()> {
        file::remove_all(&self.path).await
    }
}

// ============================================================================
// Dimension mirror
// ============================================================================

type MirrorKey = (EventId, Vec<String>);

fn key_of(id: EventId, values: &[Value]) -> MirrorKey {
    (id, values.iter().map(ToString::to_string).collect())
}

/// Latest event per key for a fixed set of event ids.
pub struct DimensionMirror {
    name: String,
    ids: Vec<EventId>,
    snapshot: Option<EventFile>,
    republish: bool,
    entries: RwLock<HashMap<MirrorKey, Arc<Event>>>,
}

impl DimensionMirror {
    pub fn new(name: impl Into<String>, ids: Vec<EventId>) -> Self {
        Self {
            name: name.into(),
            ids,
            snapshot: None,
            republish: false,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Persist the mirror in `file` across restarts.
    pub fn with_snapshot(mut self, file: EventFile) -> Self {
        self.snapshot = Some(file);
        self
    }

    /// Publish the loaded snapshot as the engine's first events.
    pub fn with_republish(mut self, republish: bool) -> Self {
        self.republish = republish;
        self
    }

    pub fn mirrors(&self, id: EventId) -> bool {
        self.ids.contains(&id)
    }

    /// Latest event of type `id` whose key fields equal `key`.
    pub fn lookup(&self, id: EventId, key: &[Value]) -> Option<Arc<Event>> {
        self.entries.read().get(&key_of(id, key)).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Every mirrored event ordered by id, then key.
    pub fn events(&self) -> Vec<Arc<Event>> {
        let entries = self.entries.read();
        let mut keyed: Vec<_> = entries.iter().collect();
        keyed.sort_by(|a, b| a.0.cmp(b.0));
        keyed.into_iter().map(|(_, event)| event.clone()).collect()
    }

    /// Record `event` if it is one of the mirrored ids. Returns whether it
    /// was kept.
    pub fn apply(&self, event: &Arc<Event>) -> bool {
        if !self.mirrors(event.id) {
            return false;
        }
        match event.key_values() {
            Ok(key) => {
                self.entries
                    .write()
                    .insert(key_of(event.id, &key), event.clone());
                true
            }
            Err(e) => {
                debug!(mirror = %self.name, event = %event.id, error = %e, "Event has no usable key");
                false
            }
        }
    }
}

#[async_trait]
impl Hooker for DimensionMirror {
    fn name(&self) -> &str {
        &self.name
    }

    async fn starting(&self) -> Vec<Arc<Event>> {
        let Some(snapshot) = &self.snapshot else {
            return Vec::new();
        };
        let loaded = match snapshot.load().await {
            Ok(events) => events,
            Err(e) => {
                warn!(
                    mirror = %self.name,
                    path = %snapshot.path().display(),
                    error = %e,
                    "Could not load mirror snapshot"
                );
                return Vec::new();
            }
        };
        let kept = loaded.iter().filter(|event| self.apply(event)).count();
        info!(mirror = %self.name, entries = kept, "Mirror snapshot loaded");
        if self.republish {
            loaded
        } else {
            Vec::new()
        }
    }

    async fn stopping(&self) -> Vec<Arc<Event>> {
        if let Some(snapshot) = &self.snapshot {
            let events = self.events();
            match snapshot.replace(&events).await {
                Ok(()) => info!(mirror = %self.name, entries = events.len(), "Mirror snapshot saved"),
                Err(e) => warn!(mirror = %self.name, error = %e, "Could not save mirror snapshot"),
            }
        }
        Vec::new()
    }

    fn observe(&self, event: &Arc<Event>) {
        self.apply(event);
    }
}

impl PersistentCache for DimensionMirror {
    type Key = (EventId, Vec<Value>);
    type Value = Arc<Event>;

    fn get(&self, key: &Self::Key) -> Option<Arc<Event>> {
        self.lookup(key.0, &key.1)
    }
}

// ============================================================================
// Metric index
// ============================================================================

/// `metric_id ↔ name` lookups over mirrored `metric_mapping` events.
#[derive(Clone)]
pub struct MetricIndex {
    mirror: Arc<DimensionMirror>,
}

impl MetricIndex {
    /// Event ids the backing mirror must hold.
    pub fn required_ids() -> Vec<EventId> {
        vec![storage::METRIC_MAPPING]
    }

    pub fn new(mirror: Arc<DimensionMirror>) -> Self {
        if !mirror.mirrors(storage::METRIC_MAPPING) {
            warn!(mirror = mirror.name.as_str(), "Mirror does not hold metric mappings");
        }
        Self { mirror }
    }

    fn mapping(&self, metric_id: u32) -> Option<Arc<Event>> {
        self.mirror
            .lookup(storage::METRIC_MAPPING, &[Value::UInt(metric_id)])
    }

    pub fn name_of(&self, metric_id: u32) -> Option<String> {
        let mapping = self.mapping(metric_id)?;
        mapping.get("name").ok()?.as_str().map(str::to_string)
    }

    pub fn index_of(&self, metric_id: u32) -> Option<u64> {
        match self.mapping(metric_id)?.get("index_id").ok()? {
            Value::ULong(index) => Some(*index),
            _ => None,
        }
    }

    /// Reverse lookup; scans every mapping.
    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.mirror
            .events()
            .iter()
            .filter(|event| event.id == storage::METRIC_MAPPING)
            .find(|event| event.get("name").ok().and_then(Value::as_str) == Some(name))
            .and_then(|event| match event.get("metric_id").ok()? {
                Value::UInt(id) => Some(*id),
                _ => None,
            })
    }
}

impl PersistentCache for MetricIndex {
    type Key = u32;
    type Value = String;

    fn get(&self, metric_id: &u32) -> Option<String> {
        self.name_of(*metric_id)
    }
}

#[cfg(test)]
mod tests;
