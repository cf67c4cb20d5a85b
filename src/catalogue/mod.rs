//! Event catalogue and field mapping.
//!
//! Every event kind is identified by a `(category, element)` pair and
//! described by a [`Schema`]: an ordered list of typed field [`Entry`]s.
//! Schemas drive generic serialization (BBDO), generic comparison and
//! key-based lookups in the dimension mirrors.
//!
//! Schemas are collected once at startup through a [`CatalogueBuilder`]
//! and frozen into an immutable [`Catalogue`], which is shared by `Arc`
//! and needs no locking afterwards.

mod event;

pub use event::{Body, Event};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

/// Result type for catalogue operations.
pub type Result<T> = std::result::Result<T, CatalogueError>;

/// Errors raised while building or querying the catalogue.
#[derive(Debug, thiserror::Error)]
pub enum CatalogueError {
    /// A different schema was already registered under this id.
    ///
    /// This is a fatal configuration error: silently replacing the schema
    /// would break wire compatibility with every peer.
    #[error("conflicting schema for event {id}: '{existing}' already registered, refusing '{attempted}'")]
    Conflict {
        id: EventId,
        existing: String,
        attempted: String,
    },

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Errors about an event's shape relative to its schema.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("unknown event {0}")]
    Unknown(EventId),

    #[error("event {id} has no field '{field}'")]
    NoSuchField { id: EventId, field: String },

    #[error("field '{field}' of event {id} expects {expected:?}, got {actual:?}")]
    TypeMismatch {
        id: EventId,
        field: String,
        expected: FieldType,
        actual: FieldType,
    },

    #[error("event {id} carries {actual} values, schema declares {expected}")]
    FieldCount {
        id: EventId,
        expected: usize,
        actual: usize,
    },

    #[error("event {0} is opaque and has no accessible fields")]
    Opaque(EventId),
}

// ============================================================================
// Identifiers
// ============================================================================

/// Two-level type tag of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId {
    pub category: u16,
    pub element: u16,
}

impl EventId {
    pub const fn new(category: u16, element: u16) -> Self {
        Self { category, element }
    }

    /// Single 32-bit form (`category << 16 | element`).
    pub const fn packed(self) -> u32 {
        ((self.category as u32) << 16) | self.element as u32
    }

    pub const fn from_packed(packed: u32) -> Self {
        Self {
            category: (packed >> 16) as u16,
            element: (packed & 0xFFFF) as u16,
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.element)
    }
}

// ============================================================================
// Field types and values
// ============================================================================

/// Semantic type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    Short,
    Int,
    UInt,
    Long,
    ULong,
    Double,
    String,
    Blob,
    /// Seconds since the Unix epoch.
    Time,
    /// Ordered list of nested events.
    Events,
}

/// Variant-typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Short(i16),
    Int(i32),
    UInt(u32),
    Long(i64),
    ULong(u64),
    Double(f64),
    String(String),
    Blob(Bytes),
    Time(i64),
    Events(Vec<Arc<Event>>),
}

impl Value {
    /// Zero value used for fields missing from a shorter payload.
    pub fn default_for(field_type: FieldType) -> Self {
        match field_type {
            FieldType::Bool => Value::Bool(false),
            FieldType::Short => Value::Short(0),
            FieldType::Int => Value::Int(0),
            FieldType::UInt => Value::UInt(0),
            FieldType::Long => Value::Long(0),
            FieldType::ULong => Value::ULong(0),
            FieldType::Double => Value::Double(0.0),
            FieldType::String => Value::String(String::new()),
            FieldType::Blob => Value::Blob(Bytes::new()),
            FieldType::Time => Value::Time(0),
            FieldType::Events => Value::Events(Vec::new()),
        }
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Bool(_) => FieldType::Bool,
            Value::Short(_) => FieldType::Short,
            Value::Int(_) => FieldType::Int,
            Value::UInt(_) => FieldType::UInt,
            Value::Long(_) => FieldType::Long,
            Value::ULong(_) => FieldType::ULong,
            Value::Double(_) => FieldType::Double,
            Value::String(_) => FieldType::String,
            Value::Blob(_) => FieldType::Blob,
            Value::Time(_) => FieldType::Time,
            Value::Events(_) => FieldType::Events,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Short(v) => Some(v as i64),
            Value::Int(v) => Some(v as i64),
            Value::UInt(v) => Some(v as i64),
            Value::Long(v) | Value::Time(v) => Some(v),
            Value::ULong(v) => i64::try_from(v).ok(),
            Value::Bool(v) => Some(v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Short(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Long(v) | Value::Time(v) => write!(f, "{v}"),
            Value::ULong(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => f.write_str(v),
            Value::Blob(v) => write!(f, "0x{}", hex::encode(v)),
            Value::Events(v) => write!(f, "[{} events]", v.len()),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        })*
    };
}

value_from! {
    bool => Bool,
    i16 => Short,
    i32 => Int,
    u32 => UInt,
    i64 => Long,
    u64 => ULong,
    f64 => Double,
    String => String,
    Bytes => Blob,
    Vec<Arc<Event>> => Events,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

// ============================================================================
// Schemas
// ============================================================================

/// One field of a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub field_type: FieldType,
    /// Whether the field travels on the wire.
    pub serialize: bool,
    /// Whether the field is part of the upsert/merge key.
    pub key: bool,
}

impl Entry {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            serialize: true,
            key: false,
        }
    }

    /// Mark the field as part of the event key.
    pub fn key(mut self) -> Self {
        self.key = true;
        self
    }

    /// Keep the field in memory only; it is never serialized.
    pub fn local(mut self) -> Self {
        self.serialize = false;
        self
    }
}

/// Static description of one event kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub id: EventId,
    pub name: String,
    pub entries: Vec<Entry>,
}

impl Schema {
    pub fn new(id: EventId, name: impl Into<String>, entries: Vec<Entry>) -> Self {
        Self {
            id,
            name: name.into(),
            entries,
        }
    }

    pub fn index_of(&self, field: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == field)
    }

    pub fn entry(&self, field: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.name == field)
    }

    pub fn serialized_entries(&self) -> impl Iterator<Item = (usize, &Entry)> {
        self.entries.iter().enumerate().filter(|(_, e)| e.serialize)
    }

    pub fn key_entries(&self) -> impl Iterator<Item = (usize, &Entry)> {
        self.entries.iter().enumerate().filter(|(_, e)| e.key)
    }

    /// Default values for every entry, in declaration order.
    pub fn default_values(&self) -> Vec<Value> {
        self.entries
            .iter()
            .map(|e| Value::default_for(e.field_type))
            .collect()
    }
}

// ============================================================================
// Catalogue
// ============================================================================

/// Collects schema registrations before the catalogue is frozen.
#[derive(Debug, Default)]
pub struct CatalogueBuilder {
    schemas: HashMap<EventId, Arc<Schema>>,
}

impl CatalogueBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema.
    ///
    /// Registering an identical schema again is a no-op. Registering a
    /// different schema under an id already in use fails.
    pub fn register(&mut self, schema: Schema) -> Result<&mut Self> {
        if let Some(existing) = self.schemas.get(&schema.id) {
            if **existing == schema {
                debug!(id = %schema.id, name = %schema.name, "Schema already registered");
                return Ok(self);
            }
            return Err(CatalogueError::Conflict {
                id: schema.id,
                existing: existing.name.clone(),
                attempted: schema.name,
            });
        }
        debug!(
            id = %schema.id,
            name = %schema.name,
            fields = schema.entries.len(),
            "Registered schema"
        );
        self.schemas.insert(schema.id, Arc::new(schema));
        Ok(self)
    }

    pub fn build(self) -> Catalogue {
        Catalogue {
            schemas: self.schemas,
        }
    }
}

/// Immutable registry of event schemas.
#[derive(Debug, Default, Clone)]
pub struct Catalogue {
    schemas: HashMap<EventId, Arc<Schema>>,
}

impl Catalogue {
    pub fn builder() -> CatalogueBuilder {
        CatalogueBuilder::new()
    }

    /// Look up the schema of an event kind.
    pub fn schema(&self, id: EventId) -> std::result::Result<Arc<Schema>, SchemaError> {
        self.schemas
            .get(&id)
            .cloned()
            .ok_or(SchemaError::Unknown(id))
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.schemas.contains_key(&id)
    }

    /// Find a schema by its registered name.
    pub fn by_name(&self, name: &str) -> Option<Arc<Schema>> {
        self.schemas.values().find(|s| s.name == name).cloned()
    }

    /// Create an event of the given kind with default field values.
    pub fn create(&self, id: EventId) -> std::result::Result<Event, SchemaError> {
        Ok(Event::new(self.schema(id)?))
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<EventId> {
        let mut ids: Vec<_> = self.schemas.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Distinct categories with at least one registered schema, sorted.
    pub fn categories(&self) -> Vec<u16> {
        let mut categories: Vec<_> = self.schemas.keys().map(|id| id.category).collect();
        categories.sort_unstable();
        categories.dedup();
        categories
    }
}
