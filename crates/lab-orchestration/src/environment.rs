//! Environments: one training event's labs, rules and worker pool
//!
//! The environment lock guards the lab index, the isolation rule table and
//! the client address allocator together. Status lives outside the lock so
//! it can be read cheaply, but it only moves forward, and the transition to
//! `Closing` happens under the lock so that lab registration and closing
//! cannot interleave.

use crate::error::{Error, Result};
use crate::exercise::ExerciseConfig;
use crate::infra::{CancelHandle, CancelSignal, FrontendSpec, cancel_pair};
use crate::lab::{Lab, LabType};
use crate::snapshot::EnvironmentSnapshot;
use crate::worker::WorkerPool;
use futures::lock::{Mutex, MutexGuard};
use ipnet::Ipv4Net;
use range_network::{IpAllocator, IsolationRule, NetworkRuleManager, RuleTable};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Environment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EnvironmentStatus {
    /// VPN interface being set up
    Initializing = 0,
    /// Accepting lab requests
    Running = 1,
    /// Draining work and tearing down labs
    Closing = 2,
    /// Torn down
    Closed = 3,
}

impl EnvironmentStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EnvironmentStatus::Initializing,
            1 => EnvironmentStatus::Running,
            2 => EnvironmentStatus::Closing,
            _ => EnvironmentStatus::Closed,
        }
    }

    /// Closing or closed
    pub fn is_closing(self) -> bool {
        self >= EnvironmentStatus::Closing
    }
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvironmentStatus::Initializing => "initializing",
            EnvironmentStatus::Running => "running",
            EnvironmentStatus::Closing => "closing",
            EnvironmentStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Check an event tag
///
/// `-` is reserved as the separator between event tag and lab id.
pub fn validate_event_tag(tag: &str) -> Result<()> {
    static TAG: OnceLock<Option<Regex>> = OnceLock::new();

    if tag.is_empty() {
        return Err(Error::Validation("event tag must not be empty".to_string()));
    }

    let valid = TAG
        .get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_]*$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(tag));
    if !valid {
        return Err(Error::Validation(format!("invalid event tag: {}", tag)));
    }
    Ok(())
}

/// Settings an environment was created with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Event tag
    pub tag: String,
    /// Type of every lab in the environment
    pub lab_type: LabType,
    /// Exercises every new lab starts with
    pub exercises: Vec<ExerciseConfig>,
    /// Frontend machines of every lab
    pub frontends: Vec<FrontendSpec>,
    /// VPN endpoint address, subnet prefix included
    pub vpn_address: Ipv4Net,
    /// VPN endpoint port
    pub vpn_port: u16,
    /// VPN clients per lab
    pub team_size: u8,
}

/// Locked part of an environment
pub struct EnvState {
    /// Registered labs by tag
    pub labs: BTreeMap<String, Arc<Lab>>,
    /// Isolation rules by lab tag
    pub rules: RuleTable,
    /// VPN client addresses by lab tag
    pub clients: IpAllocator,
}

/// One training event
pub struct Environment {
    config: EnvironmentConfig,
    status: AtomicU8,
    state: Mutex<EnvState>,
    pool: WorkerPool,
    cancel: CancelHandle,
    signal: CancelSignal,
}

impl Environment {
    /// Create an environment in the `Initializing` state
    pub fn new(config: EnvironmentConfig, workers: usize, queue_capacity: usize) -> Self {
        let (cancel, signal) = cancel_pair();
        let pool = WorkerPool::new(format!("env-{}", config.tag), workers, queue_capacity);
        let clients = IpAllocator::new(config.vpn_address);

        Self {
            config,
            status: AtomicU8::new(EnvironmentStatus::Initializing as u8),
            state: Mutex::new(EnvState {
                labs: BTreeMap::new(),
                rules: RuleTable::new(),
                clients,
            }),
            pool,
            cancel,
            signal,
        }
    }

    /// Event tag
    pub fn tag(&self) -> &str {
        &self.config.tag
    }

    /// Creation settings
    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    /// Current status
    pub fn status(&self) -> EnvironmentStatus {
        EnvironmentStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Move the status forward; backward transitions are ignored
    ///
    /// Returns true if the status changed.
    pub fn advance(&self, to: EnvironmentStatus) -> bool {
        let changed = self
            .status
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (to as u8 > current).then_some(to as u8)
            })
            .is_ok();
        if changed {
            debug!("Environment {} is now {}", self.tag(), to);
        }
        changed
    }

    /// Provisioning queue
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Cancellation signal handed to long collaborator calls
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.signal
    }

    /// Lock the environment state
    pub async fn lock(&self) -> MutexGuard<'_, EnvState> {
        self.state.lock().await
    }

    /// Mark the environment `Closing`, cancel in-flight work and close the queue
    ///
    /// Returns false if it was already closing.
    pub async fn begin_close(&self) -> bool {
        let _state = self.state.lock().await;
        let changed = self.advance(EnvironmentStatus::Closing);
        self.cancel.cancel();
        self.pool.close();
        if changed {
            info!("Closing environment {}", self.tag());
        }
        changed
    }

    /// Register a fully started lab
    ///
    /// Fails once the environment is closing; the caller then owns the lab
    /// and must tear it down.
    pub async fn register_lab(&self, lab: Arc<Lab>) -> Result<()> {
        let mut state = self.state.lock().await;

        if self.status().is_closing() {
            return Err(Error::Validation(format!(
                "environment {} is closing, lab {} not registered",
                self.tag(),
                lab.tag()
            )));
        }
        if state.labs.contains_key(lab.tag()) {
            return Err(Error::Conflict(format!("lab {} already registered", lab.tag())));
        }

        debug!("Registered lab {} in environment {}", lab.tag(), self.tag());
        state.labs.insert(lab.tag().to_string(), lab);
        Ok(())
    }

    /// Remove a lab from the index
    pub async fn remove_lab(&self, lab_tag: &str) -> Option<Arc<Lab>> {
        self.state.lock().await.labs.remove(lab_tag)
    }

    /// Look up a registered lab
    pub async fn get_lab(&self, lab_tag: &str) -> Option<Arc<Lab>> {
        self.state.lock().await.labs.get(lab_tag).cloned()
    }

    /// Registered lab tags, sorted
    pub async fn lab_tags(&self) -> Vec<String> {
        self.state.lock().await.labs.keys().cloned().collect()
    }

    /// Number of registered labs
    pub async fn lab_count(&self) -> usize {
        self.state.lock().await.labs.len()
    }

    /// Take every registered lab out of the index
    pub async fn drain_labs(&self) -> Vec<Arc<Lab>> {
        let mut state = self.state.lock().await;
        std::mem::take(&mut state.labs).into_values().collect()
    }

    /// Fresh lab tag: `<event tag>-<8 hex chars>`
    pub fn next_lab_tag(&self) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.tag(), &id[..8])
    }

    /// Allocate client addresses and issue isolation rules for a VPN lab
    ///
    /// Check and creation happen under one lock hold, so a second request
    /// for the same lab is a conflict no matter which path it comes from.
    pub async fn issue_vpn_access(
        &self,
        rules: &NetworkRuleManager,
        lab_tag: &str,
        lab_subnet: Ipv4Net,
    ) -> Result<Vec<Ipv4Addr>> {
        let mut state = self.state.lock().await;

        if state.rules.contains_key(lab_tag) {
            return Err(Error::Conflict(format!(
                "VPN configs already generated for lab {}",
                lab_tag
            )));
        }

        let ips = state
            .clients
            .allocate_block(lab_tag, usize::from(self.config.team_size))?;

        let EnvState {
            rules: table,
            clients,
            ..
        } = &mut *state;
        if let Err(e) = rules.issue(table, lab_tag, lab_subnet, &ips).await {
            clients.release(lab_tag);
            return Err(e.into());
        }

        Ok(ips)
    }

    /// Forget a lab's rules and client addresses
    ///
    /// The caller revokes the returned rules on the firewall.
    pub async fn take_vpn_access(&self, lab_tag: &str) -> (Option<IsolationRule>, Vec<Ipv4Addr>) {
        let mut state = self.state.lock().await;
        let rule = state.rules.remove(lab_tag);
        let ips = state.clients.release(lab_tag);
        (rule, ips)
    }

    /// Persistable copy of the environment
    pub async fn snapshot(&self) -> EnvironmentSnapshot {
        let labs: Vec<Arc<Lab>>;
        let rules;
        let clients;
        {
            let state = self.state.lock().await;
            labs = state.labs.values().cloned().collect();
            rules = state.rules.clone();
            clients = state.clients.all_allocations().clone();
        }

        // Lab locks are taken after the environment lock is released
        let mut lab_snapshots = Vec::with_capacity(labs.len());
        for lab in labs {
            lab_snapshots.push(lab.snapshot().await);
        }

        EnvironmentSnapshot {
            config: self.config.clone(),
            status: self.status(),
            labs: lab_snapshots,
            rules,
            clients,
        }
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("tag", &self.config.tag)
            .field("status", &self.status())
            .finish()
    }
}
