//! Event instances.

use std::sync::Arc;

use bytes::Bytes;

use super::{Entry, EventId, Schema, SchemaError, Value};

/// Payload of an event.
#[derive(Debug, Clone)]
pub enum Body {
    /// Decoded fields, one value per schema entry in declaration order.
    Record {
        schema: Arc<Schema>,
        values: Vec<Value>,
    },
    /// Raw payload of an event kind this process has no schema for.
    /// Relayed verbatim.
    Opaque(Bytes),
}

/// A single monitoring event.
///
/// Events are mutable while being built and immutable once published:
/// the engine and every stream share them as `Arc<Event>`.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: EventId,
    pub source_id: u16,
    pub destination_id: u16,
    pub body: Body,
}

impl Event {
    /// New record event with default field values.
    pub fn new(schema: Arc<Schema>) -> Self {
        let values = schema.default_values();
        Self {
            id: schema.id,
            source_id: 0,
            destination_id: 0,
            body: Body::Record { schema, values },
        }
    }

    /// Build a record event from already-typed values.
    pub fn from_values(schema: Arc<Schema>, values: Vec<Value>) -> Result<Self, SchemaError> {
        if values.len() != schema.entries.len() {
            return Err(SchemaError::FieldCount {
                id: schema.id,
                expected: schema.entries.len(),
                actual: values.len(),
            });
        }
        for (entry, value) in schema.entries.iter().zip(&values) {
            if entry.field_type != value.field_type() {
                return Err(SchemaError::TypeMismatch {
                    id: schema.id,
                    field: entry.name.clone(),
                    expected: entry.field_type,
                    actual: value.field_type(),
                });
            }
        }
        Ok(Self {
            id: schema.id,
            source_id: 0,
            destination_id: 0,
            body: Body::Record { schema, values },
        })
    }

    pub fn opaque(id: EventId, payload: Bytes) -> Self {
        Self {
            id,
            source_id: 0,
            destination_id: 0,
            body: Body::Opaque(payload),
        }
    }

    pub fn with_routing(mut self, source_id: u16, destination_id: u16) -> Self {
        self.source_id = source_id;
        self.destination_id = destination_id;
        self
    }

    pub fn schema(&self) -> Option<&Arc<Schema>> {
        match &self.body {
            Body::Record { schema, .. } => Some(schema),
            Body::Opaque(_) => None,
        }
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self.body, Body::Opaque(_))
    }

    /// Field values in schema order. Empty for opaque events.
    pub fn values(&self) -> &[Value] {
        match &self.body {
            Body::Record { values, .. } => values,
            Body::Opaque(_) => &[],
        }
    }

    /// Read a field by name.
    pub fn get(&self, field: &str) -> Result<&Value, SchemaError> {
        let (schema, values) = self.record()?;
        let index = schema.index_of(field).ok_or_else(|| SchemaError::NoSuchField {
            id: self.id,
            field: field.to_string(),
        })?;
        Ok(&values[index])
    }

    /// Read the field described by `entry`.
    pub fn get_entry(&self, entry: &Entry) -> Result<&Value, SchemaError> {
        self.get(&entry.name)
    }

    /// Write a field by name. The value must match the declared type.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<(), SchemaError> {
        let value = value.into();
        let id = self.id;
        let Body::Record { schema, values } = &mut self.body else {
            return Err(SchemaError::Opaque(id));
        };
        let index = schema.index_of(field).ok_or_else(|| SchemaError::NoSuchField {
            id,
            field: field.to_string(),
        })?;
        let expected = schema.entries[index].field_type;
        if expected != value.field_type() {
            return Err(SchemaError::TypeMismatch {
                id,
                field: field.to_string(),
                expected,
                actual: value.field_type(),
            });
        }
        values[index] = value;
        Ok(())
    }

    /// Builder form of [`Event::set`].
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Result<Self, SchemaError> {
        self.set(field, value)?;
        Ok(self)
    }

    /// Values of the key entries, in schema order.
    ///
    /// Events with no key entries yield an empty key.
    pub fn key_values(&self) -> Result<Vec<Value>, SchemaError> {
        let (schema, values) = self.record()?;
        Ok(schema
            .key_entries()
            .map(|(index, _)| values[index].clone())
            .collect())
    }

    fn record(&self) -> Result<(&Arc<Schema>, &[Value]), SchemaError> {
        match &self.body {
            Body::Record { schema, values } => Ok((schema, values)),
            Body::Opaque(_) => Err(SchemaError::Opaque(self.id)),
        }
    }
}

impl PartialEq for Event {
    /// Same kind, same routing and equal serializable fields.
    ///
    /// Local (non-serialized) fields do not take part in comparison, so an
    /// event equals its own encode/decode round trip.
    fn eq(&self, other: &Self) -> bool {
        if self.id != other.id
            || self.source_id != other.source_id
            || self.destination_id != other.destination_id
        {
            return false;
        }
        match (&self.body, &other.body) {
            (Body::Opaque(a), Body::Opaque(b)) => a == b,
            (
                Body::Record { schema, values },
                Body::Record {
                    values: other_values,
                    ..
                },
            ) => schema
                .serialized_entries()
                .all(|(index, _)| values.get(index) == other_values.get(index)),
            _ => false,
        }
    }
}
