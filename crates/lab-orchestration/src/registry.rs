//! Process-wide environment registry

use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::lab::Lab;
use crate::snapshot::RegistrySnapshot;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Map from event tag to environment
///
/// Lookups share a read lock; only inserting and removing environments
/// takes the write lock. Environment locks are never taken while the
/// registry lock is held.
#[derive(Default)]
pub struct EnvironmentRegistry {
    environments: RwLock<HashMap<String, Arc<Environment>>>,
}

impl EnvironmentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Find an environment by event tag
    pub fn lookup(&self, event_tag: &str) -> Option<Arc<Environment>> {
        self.environments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_tag)
            .cloned()
    }

    /// Add an environment; an existing tag is a conflict
    pub fn insert(&self, env: Arc<Environment>) -> Result<()> {
        let mut environments = self
            .environments
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if environments.contains_key(env.tag()) {
            return Err(Error::Conflict(format!(
                "environment {} already exists",
                env.tag()
            )));
        }

        debug!("Registered environment {}", env.tag());
        environments.insert(env.tag().to_string(), env);
        Ok(())
    }

    /// Remove an environment
    pub fn remove(&self, event_tag: &str) -> Option<Arc<Environment>> {
        let removed = self
            .environments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(event_tag);
        if removed.is_some() {
            debug!("Removed environment {}", event_tag);
        }
        removed
    }

    /// Find the environment owning a lab tag
    ///
    /// The event tag is the part of the lab tag before the first `-`.
    pub fn environment_of(&self, lab_tag: &str) -> Result<Arc<Environment>> {
        let event_tag = lab_tag
            .split_once('-')
            .map(|(event_tag, _)| event_tag)
            .ok_or_else(|| Error::not_found("lab", lab_tag))?;

        self.lookup(event_tag)
            .ok_or_else(|| Error::not_found("environment", event_tag))
    }

    /// Resolve a lab tag to its environment and lab
    pub async fn get_lab_by_tag(&self, lab_tag: &str) -> Result<(Arc<Environment>, Arc<Lab>)> {
        let env = self.environment_of(lab_tag)?;
        let lab = env
            .get_lab(lab_tag)
            .await
            .ok_or_else(|| Error::not_found("lab", lab_tag))?;
        Ok((env, lab))
    }

    /// All environments, sorted by tag
    pub fn list(&self) -> Vec<Arc<Environment>> {
        let mut environments: Vec<_> = self
            .environments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        environments.sort_by(|a, b| a.tag().cmp(b.tag()));
        environments
    }

    /// Number of environments
    pub fn len(&self) -> usize {
        self.environments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether there are no environments
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persistable copy of every environment
    pub async fn snapshot(&self) -> RegistrySnapshot {
        let mut environments = Vec::new();
        for env in self.list() {
            environments.push(env.snapshot().await);
        }
        RegistrySnapshot::new(environments)
    }
}
