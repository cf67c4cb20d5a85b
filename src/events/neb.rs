//! Monitoring engine (neb) events.

use crate::catalogue::{CatalogueBuilder, Entry, EventId, FieldType, Result, Schema};

use super::NEB;

pub const HOST_STATUS: EventId = EventId::new(NEB, 1);
pub const SERVICE_STATUS: EventId = EventId::new(NEB, 2);
pub const HOST: EventId = EventId::new(NEB, 3);
pub const INSTANCE: EventId = EventId::new(NEB, 4);

pub fn register(builder: &mut CatalogueBuilder) -> Result<()> {
    builder.register(Schema::new(
        HOST_STATUS,
        "host_status",
        vec![
            Entry::new("host_id", FieldType::Int).key(),
            Entry::new("state", FieldType::Int),
            Entry::new("output", FieldType::String),
        ],
    ))?;
    builder.register(Schema::new(
        SERVICE_STATUS,
        "service_status",
        vec![
            Entry::new("host_id", FieldType::Int).key(),
            Entry::new("service_id", FieldType::Int).key(),
            Entry::new("state", FieldType::Int),
            Entry::new("state_type", FieldType::Short),
            Entry::new("last_check", FieldType::Time),
            Entry::new("output", FieldType::String),
            Entry::new("perfdata", FieldType::String),
        ],
    ))?;
    builder.register(Schema::new(
        HOST,
        "host",
        vec![
            Entry::new("host_id", FieldType::Int).key(),
            Entry::new("name", FieldType::String),
            Entry::new("address", FieldType::String),
            Entry::new("enabled", FieldType::Bool),
            Entry::new("poller_id", FieldType::UInt),
        ],
    ))?;
    builder.register(Schema::new(
        INSTANCE,
        "instance",
        vec![
            Entry::new("poller_id", FieldType::UInt).key(),
            Entry::new("name", FieldType::String),
            Entry::new("running", FieldType::Bool),
            Entry::new("pid", FieldType::Long),
            Entry::new("program_start", FieldType::Time),
            Entry::new("program_end", FieldType::Time),
        ],
    ))?;
    Ok(())
}
