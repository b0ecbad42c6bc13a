//! Request and response types of the agent surface

use crate::environment::EnvironmentStatus;
use crate::exercise::ExerciseInfo;
use crate::infra::FrontendSpec;
use crate::lab::{LabCredentials, LabType};
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Create an environment for an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEnvironmentRequest {
    /// Event tag
    pub event_tag: String,
    /// Type of the environment's labs
    pub lab_type: LabType,
    /// Exercises every lab starts with
    pub exercise_tags: Vec<String>,
    /// Frontend machines of every lab
    #[serde(default)]
    pub frontends: Vec<FrontendSpec>,
    /// VPN endpoint port, agent default if unset
    #[serde(default)]
    pub vpn_port: Option<u16>,
    /// VPN clients per lab, agent default if unset
    #[serde(default)]
    pub team_size: Option<u8>,
}

/// Create a lab in an environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLabRequest {
    /// Event tag
    pub event_tag: String,
    /// Whether the lab is reached through a VPN tunnel
    pub is_vpn: bool,
}

/// Add exercises to a lab
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddExercisesRequest {
    /// Lab tag
    pub lab_tag: String,
    /// Exercises to add
    pub exercise_tags: Vec<String>,
}

/// Address one exercise of a lab
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExerciseRequest {
    /// Lab tag
    pub lab_tag: String,
    /// Exercise tag
    pub exercise_tag: String,
}

/// Reply of operations that return no data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Human readable outcome
    pub message: String,
}

impl StatusResponse {
    /// The operation completed
    pub fn ok() -> Self {
        Self {
            message: "OK".to_string(),
        }
    }

    /// The operation was queued
    pub fn accepted() -> Self {
        Self {
            message: "accepted".to_string(),
        }
    }
}

/// A lab as reported to the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabDescriptor {
    /// Lab tag
    pub tag: String,
    /// Owning event tag
    pub event_tag: String,
    /// Lab type
    pub lab_type: LabType,
    /// Whether the lab is a VPN lab
    pub is_vpn: bool,
    /// Lab network
    pub subnet: Ipv4Net,
    /// DNS server inside the lab
    pub dns_address: Ipv4Addr,
    /// Remote access credentials
    pub credentials: LabCredentials,
    /// Exercises in insertion order
    pub exercises: Vec<ExerciseInfo>,
    /// WireGuard client configs, only set when they were just generated
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vpn_configs: Vec<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// One line of an environment listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSummary {
    /// Event tag
    pub tag: String,
    /// Current status
    pub status: EnvironmentStatus,
    /// Registered labs
    pub lab_count: usize,
    /// VPN endpoint address
    pub vpn_address: Ipv4Net,
}
