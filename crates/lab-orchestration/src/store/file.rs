//! JSON file snapshot store

use super::StateStore;
use crate::error::{Error, Result};
use crate::snapshot::RegistrySnapshot;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Stores the snapshot as pretty JSON in one file
///
/// Saves go to a temporary file next to the target which is then renamed
/// over it, so a crash mid-save leaves the previous snapshot intact.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Store at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Target file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            async_fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_vec_pretty(snapshot)?;
        let temp = self.temp_path();
        async_fs::write(&temp, content).await?;
        async_fs::rename(&temp, &self.path).await?;

        debug!("Saved registry snapshot to {:?}", self.path);
        Ok(())
    }

    async fn load(&self) -> Result<Option<RegistrySnapshot>> {
        let content = match async_fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot = serde_json::from_slice(&content).map_err(|e| {
            Error::Persistence(format!("corrupt snapshot {:?}: {}", self.path, e))
        })?;
        Ok(Some(snapshot))
    }
}
