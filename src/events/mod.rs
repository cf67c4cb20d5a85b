//! Built-in event domains.
//!
//! Each domain module registers its schemas with a [`CatalogueBuilder`] at
//! startup. Only a representative subset of each domain ships here; other
//! crates add their own domains through the same `register` entry point.

pub mod neb;
pub mod storage;

use crate::catalogue::{Catalogue, CatalogueBuilder, Result};

/// Monitoring engine events (hosts, services, checks).
pub const NEB: u16 = 1;
/// Reserved for BBDO control frames.
pub const BBDO: u16 = 2;
/// Performance data and metric mappings.
pub const STORAGE: u16 = 3;
pub const CORRELATION: u16 = 4;
pub const BAM: u16 = 6;

/// Register every built-in domain.
pub fn register_all(builder: &mut CatalogueBuilder) -> Result<()> {
    neb::register(builder)?;
    storage::register(builder)?;
    Ok(())
}

/// Catalogue holding every built-in domain.
pub fn builtin_catalogue() -> Result<Catalogue> {
    let mut builder = Catalogue::builder();
    register_all(&mut builder)?;
    Ok(builder.build())
}

/// Human-readable name of a category.
pub fn category_name(category: u16) -> &'static str {
    match category {
        NEB => "neb",
        BBDO => "bbdo",
        STORAGE => "storage",
        CORRELATION => "correlation",
        BAM => "bam",
        _ => "unknown",
    }
}
