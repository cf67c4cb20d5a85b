use std::path::Path;
use std::sync::Arc;

use crate::cache::EventFile;
use crate::catalogue::{Catalogue, Event};
use crate::stream::Result;

/// Unsent events of one output endpoint, kept across restarts in
/// `<cache_dir>/<endpoint>.queue`.
#[derive(Debug, Clone)]
pub struct PersistentQueue {
    file: EventFile,
}

impl PersistentQueue {
    pub fn new(cache_dir: impl AsRef<Path>, endpoint: &str, catalogue: Arc<Catalogue>) -> Self {
        let name: String = endpoint
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Self {
            file: EventFile::new(cache_dir.as_ref().join(format!("{name}.queue")), catalogue),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub async fn load(&self) -> Result<Vec<Arc<Event>>> {
        self.file.load().await
    }

    pub async fn replace(&self, events: &[Arc<Event>]) -> Result<()> {
        self.file.replace(events).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.file.clear().await
    }
}
