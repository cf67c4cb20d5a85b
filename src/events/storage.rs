//! Storage events: metric values and metric id mappings.

use crate::catalogue::{CatalogueBuilder, Entry, EventId, FieldType, Result, Schema};

use super::STORAGE;

pub const METRIC: EventId = EventId::new(STORAGE, 1);
pub const METRIC_MAPPING: EventId = EventId::new(STORAGE, 2);
pub const REBUILD: EventId = EventId::new(STORAGE, 3);

pub fn register(builder: &mut CatalogueBuilder) -> Result<()> {
    builder.register(Schema::new(
        METRIC,
        "metric",
        vec![
            Entry::new("metric_id", FieldType::UInt).key(),
            Entry::new("ctime", FieldType::Time),
            Entry::new("value", FieldType::Double),
            Entry::new("interval", FieldType::UInt),
            Entry::new("is_for_rebuild", FieldType::Bool),
            // Resolved locally from the metric index, never sent.
            Entry::new("name", FieldType::String).local(),
        ],
    ))?;
    builder.register(Schema::new(
        METRIC_MAPPING,
        "metric_mapping",
        vec![
            Entry::new("metric_id", FieldType::UInt).key(),
            Entry::new("index_id", FieldType::ULong),
            Entry::new("name", FieldType::String),
        ],
    ))?;
    builder.register(Schema::new(
        REBUILD,
        "rebuild",
        vec![
            Entry::new("end", FieldType::Bool),
            Entry::new("id", FieldType::UInt),
            Entry::new("is_index", FieldType::Bool),
            Entry::new("metrics", FieldType::Events),
        ],
    ))?;
    Ok(())
}
