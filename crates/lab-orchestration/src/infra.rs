//! Collaborator interfaces
//!
//! The agent does not create virtual machines, resolve exercise definitions
//! or serve DNS itself. Those jobs belong to the collaborators defined here,
//! which the embedding process supplies through [`Collaborators`].

use crate::error::Result;
use crate::exercise::{DnsRecord, ExerciseConfig};
use crate::lab::LabType;
use crate::store::StateStore;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use range_network::{FirewallBackend, VpnGateway};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Cancels an environment's in-flight provisioning
///
/// Dropping the handle cancels as well.
#[derive(Debug)]
pub struct CancelHandle {
    tx: async_channel::Sender<()>,
}

/// Observes cancellation of an environment
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: async_channel::Receiver<()>,
}

/// Create a connected cancellation handle and signal
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = async_channel::bounded(1);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    /// Fire the signal; idempotent
    pub fn cancel(&self) {
        self.tx.close();
    }
}

impl CancelSignal {
    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.rx.is_closed()
    }

    /// Resolve once cancellation is requested
    pub async fn cancelled(&self) {
        // Nothing is ever sent, recv only returns once the channel closes
        let _ = self.rx.recv().await;
    }
}

/// Resources of one frontend (participant-facing) machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontendSpec {
    /// Machine image
    pub image: String,
    /// Memory in MiB
    #[serde(default)]
    pub memory_mb: u32,
    /// CPU share
    #[serde(default)]
    pub cpu: f64,
}

/// What the provisioner needs to build a lab skeleton
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabSpec {
    /// Lab tag
    pub tag: String,
    /// Owning event tag
    pub event_tag: String,
    /// Lab type
    pub lab_type: LabType,
    /// Whether participants reach the lab through a VPN tunnel
    pub is_vpn: bool,
    /// Frontend machines to provision
    pub frontends: Vec<FrontendSpec>,
}

/// Provisioned lab skeleton: network plus frontends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabHandle {
    /// Provisioner-assigned identifier
    pub id: String,
    /// Lab network
    pub subnet: Ipv4Net,
    /// DNS server inside the lab network
    pub dns_address: Ipv4Addr,
}

/// One infrastructure unit of an exercise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Container or VM image
    pub image: String,
    /// Memory in MiB
    pub memory_mb: u32,
    /// CPU share
    pub cpu: f64,
    /// Environment variables, flags included
    pub env: BTreeMap<String, String>,
}

/// What the provisioner needs to create an exercise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseSpec {
    /// Owning lab tag
    pub lab_tag: String,
    /// Exercise tag
    pub exercise_tag: String,
    /// Units to create, in configuration order
    pub instances: Vec<InstanceSpec>,
}

/// A created infrastructure unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHandle {
    /// Provisioner-assigned identifier
    pub id: String,
    /// Image the unit was created from
    pub image: String,
    /// Address allocated inside the lab network
    pub address: Ipv4Addr,
}

/// Exercise definition lookup
#[async_trait]
pub trait ExerciseCatalog: Send + Sync {
    /// Resolve exercise tags to their definitions
    ///
    /// Tags the catalog does not know are left out of the result.
    async fn resolve_by_tags(&self, tags: &[String]) -> Result<Vec<ExerciseConfig>>;
}

/// Hypervisor / container runtime driver
#[async_trait]
pub trait InfrastructureProvisioner: Send + Sync {
    /// Create a lab skeleton (network, DNS server, frontends)
    async fn create_lab(&self, spec: &LabSpec, cancel: &CancelSignal) -> Result<LabHandle>;

    /// Bring up a lab skeleton
    async fn start_lab(&self, lab: &LabHandle, cancel: &CancelSignal) -> Result<()>;

    /// Destroy a lab skeleton; unknown handles are not an error
    async fn close_lab(&self, lab: &LabHandle) -> Result<()>;

    /// Create the units of one exercise, one handle per spec instance
    async fn create_exercise(
        &self,
        lab: &LabHandle,
        spec: &ExerciseSpec,
    ) -> Result<Vec<InstanceHandle>>;

    /// Start created units
    async fn start_exercise(&self, lab: &LabHandle, instances: &[InstanceHandle]) -> Result<()>;

    /// Stop running units
    async fn stop_exercise(&self, lab: &LabHandle, instances: &[InstanceHandle]) -> Result<()>;

    /// Destroy units; unknown handles are not an error
    async fn close_exercise(&self, lab: &LabHandle, instances: &[InstanceHandle]) -> Result<()>;
}

/// Per-lab DNS server
#[async_trait]
pub trait DnsService: Send + Sync {
    /// Replace the lab's record set
    async fn refresh(&self, lab: &LabHandle, records: &[DnsRecord]) -> Result<()>;
}

/// Everything the agent calls out to
#[derive(Clone)]
pub struct Collaborators {
    /// Exercise definitions
    pub catalog: Arc<dyn ExerciseCatalog>,
    /// Infrastructure driver
    pub provisioner: Arc<dyn InfrastructureProvisioner>,
    /// Lab DNS
    pub dns: Arc<dyn DnsService>,
    /// Host firewall
    pub firewall: Arc<dyn FirewallBackend>,
    /// WireGuard endpoint
    pub vpn: Arc<dyn VpnGateway>,
    /// Snapshot persistence
    pub store: Arc<dyn StateStore>,
}
