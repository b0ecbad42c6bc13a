//! Snapshot persistence backends

pub mod file;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod sled;

use crate::config::StateBackend;
use crate::error::Result;
use crate::snapshot::RegistrySnapshot;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

pub use file::FileStateStore;
#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryStateStore;
pub use sled::SledStateStore;

/// Trait for snapshot storage backends
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Replace the stored snapshot
    async fn save(&self, snapshot: &RegistrySnapshot) -> Result<()>;

    /// Load the stored snapshot, if any
    async fn load(&self) -> Result<Option<RegistrySnapshot>>;
}

/// Open the configured backend at `path`
pub async fn open_store(
    backend: StateBackend,
    path: impl AsRef<Path>,
) -> Result<Arc<dyn StateStore>> {
    let path = path.as_ref();
    let store: Arc<dyn StateStore> = match backend {
        StateBackend::File => Arc::new(FileStateStore::new(path.join("registry.json"))),
        StateBackend::Sled => Arc::new(SledStateStore::new(path.join("registry.sled")).await?),
    };
    Ok(store)
}
