//! Sled database snapshot store

use super::StateStore;
use crate::error::Result;
use crate::snapshot::RegistrySnapshot;
use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, error, info};

const TREE: &str = "snapshots";
const KEY: &[u8] = b"registry";

/// Stores the snapshot as JSON under one key of a sled tree
pub struct SledStateStore {
    db: sled::Db,
    snapshots: sled::Tree,
}

impl SledStateStore {
    /// Open or create the database at `path`
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Ensure the directory exists
        if let Some(parent) = path.parent() {
            async_fs::create_dir_all(parent).await?;
        }

        info!("Opening sled state database at {:?}", path);
        let db = sled::open(path)?;
        let snapshots = db.open_tree(TREE)?;

        Ok(Self { db, snapshots })
    }

    /// Temporary database that is removed on drop
    pub fn in_memory() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let snapshots = db.open_tree(TREE)?;
        Ok(Self { db, snapshots })
    }
}

#[async_trait]
impl StateStore for SledStateStore {
    async fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        let value = serde_json::to_vec(snapshot)?;
        self.snapshots.insert(KEY, value)?;
        self.snapshots.flush_async().await?;
        debug!("Saved registry snapshot ({} environments)", snapshot.environments.len());
        Ok(())
    }

    async fn load(&self) -> Result<Option<RegistrySnapshot>> {
        match self.snapshots.get(KEY)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }
}

impl Drop for SledStateStore {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            error!("Failed to flush state database on drop: {}", e);
        }
    }
}
