//! In-memory snapshot store for tests

use super::StateStore;
use crate::error::{Error, Result};
use crate::snapshot::RegistrySnapshot;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Keeps the last snapshot in memory
#[derive(Default)]
pub struct MemoryStateStore {
    snapshot: Mutex<Option<RegistrySnapshot>>,
    saves: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every save fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful saves
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Last saved snapshot
    pub fn last(&self) -> Option<RegistrySnapshot> {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Persistence("memory store is failing".to_string()));
        }
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self) -> Result<Option<RegistrySnapshot>> {
        Ok(self.last())
    }
}
