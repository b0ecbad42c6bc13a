//! Persistable registry model

use crate::environment::{EnvironmentConfig, EnvironmentStatus};
use crate::exercise::Exercise;
use crate::infra::LabHandle;
use crate::lab::{LabCredentials, LabType};
use chrono::{DateTime, Utc};
use range_network::RuleTable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// The whole registry at one point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Format version
    pub version: u32,
    /// When the snapshot was taken
    pub saved_at: DateTime<Utc>,
    /// Environments, sorted by tag
    pub environments: Vec<EnvironmentSnapshot>,
}

/// One environment with its labs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    /// Creation settings
    pub config: EnvironmentConfig,
    /// Status when saved
    pub status: EnvironmentStatus,
    /// Registered labs
    pub labs: Vec<LabSnapshot>,
    /// Issued isolation rules by lab tag
    pub rules: RuleTable,
    /// VPN client addresses by lab tag
    pub clients: BTreeMap<String, Vec<Ipv4Addr>>,
}

/// One lab with its exercises
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabSnapshot {
    /// Lab tag
    pub tag: String,
    /// Owning event tag
    pub event_tag: String,
    /// Lab type
    pub lab_type: LabType,
    /// Whether the lab is a VPN lab
    pub is_vpn: bool,
    /// Provisioned skeleton
    pub handle: LabHandle,
    /// Access credentials
    pub credentials: LabCredentials,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Exercises in insertion order
    pub exercises: Vec<Exercise>,
}

impl RegistrySnapshot {
    /// Snapshot of the given environments, stamped now
    pub fn new(environments: Vec<EnvironmentSnapshot>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            environments,
        }
    }

    /// Event tags
    pub fn event_tags(&self) -> Vec<&str> {
        self.environments
            .iter()
            .map(|env| env.config.tag.as_str())
            .collect()
    }

    /// Lab tags across all environments
    pub fn lab_tags(&self) -> Vec<&str> {
        self.environments
            .iter()
            .flat_map(|env| env.labs.iter().map(|lab| lab.tag.as_str()))
            .collect()
    }

    /// Exercise tags by lab tag
    pub fn exercise_tags(&self) -> BTreeMap<&str, Vec<&str>> {
        self.environments
            .iter()
            .flat_map(|env| env.labs.iter())
            .map(|lab| {
                (
                    lab.tag.as_str(),
                    lab.exercises.iter().map(|e| e.tag()).collect(),
                )
            })
            .collect()
    }
}
