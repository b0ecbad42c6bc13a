//! In-process collaborators for tests
//!
//! Every fake keeps its state behind a std mutex and exposes counters the
//! tests assert on. Failures are injected per exercise tag or globally.

use crate::config::AgentConfig;
use crate::environment::EnvironmentConfig;
use crate::error::{Error, Result};
use crate::exercise::{
    ChildChallengeConfig, DnsRecord, ExerciseConfig, InstanceConfig, RecordConfig,
};
use crate::infra::{
    CancelSignal, Collaborators, DnsService, ExerciseCatalog, ExerciseSpec,
    InfrastructureProvisioner, InstanceHandle, LabHandle, LabSpec,
};
use crate::lab::LabType;
use crate::store::MemoryStateStore;
use crate::stream::LabEvent;
use async_channel::Receiver;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use range_network::{FirewallBackend, FirewallRule, PeerCredentials, RuleId, VpnGateway};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Exercise definition with one instance and one generated flag
///
/// The instance serves an "A" record `<tag>.range` and receives its flag
/// in `APP_FLAG`.
pub fn sample_exercise(tag: &str) -> ExerciseConfig {
    ExerciseConfig {
        tag: tag.to_string(),
        name: format!("Exercise {}", tag),
        category: "web".to_string(),
        instance: vec![InstanceConfig {
            image: format!("registry/{}:latest", tag),
            memory_mb: 128,
            cpu: 0.5,
            children: vec![ChildChallengeConfig {
                tag: format!("{}-1", tag),
                name: format!("Challenge {}", tag),
                env_flag: "APP_FLAG".to_string(),
                points: 100,
                ..Default::default()
            }],
            records: vec![RecordConfig {
                record_type: "A".to_string(),
                name: format!("{}.range", tag),
                data: String::new(),
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Lab skeleton that was never provisioned
pub fn sample_lab_handle() -> LabHandle {
    LabHandle {
        id: "lab-sample".to_string(),
        subnet: "10.10.4.0/24".parse().unwrap_or_else(|_| Ipv4Net::default()),
        dns_address: Ipv4Addr::new(10, 10, 4, 3),
    }
}

/// Standard environment with three clients per lab on `10.17.0.1/24`
pub fn sample_env_config(tag: &str) -> EnvironmentConfig {
    EnvironmentConfig {
        tag: tag.to_string(),
        lab_type: LabType::Standard,
        exercises: vec![sample_exercise("web")],
        frontends: Vec::new(),
        vpn_address: "10.17.0.1/24".parse().unwrap_or_else(|_| Ipv4Net::default()),
        vpn_port: 51820,
        team_size: 3,
    }
}

/// Agent configuration with small pools for tests
pub fn sample_agent_config() -> AgentConfig {
    let mut config = AgentConfig::new("agent.range.test");
    config.vpn_range = "10.17.0.0/16".parse().ok();
    config.workers_per_environment = 2;
    config.teardown_workers = 1;
    config.task_queue_capacity = 16;
    config.lab_stream_capacity = 64;
    config.default_team_size = 2;
    config
}

/// Wait for the next stream event, failing after a few seconds
pub async fn next_event(events: &Receiver<LabEvent>) -> Result<LabEvent> {
    let timeout = async {
        smol::Timer::after(Duration::from_secs(5)).await;
        Err(Error::Infrastructure("timed out waiting for lab event".to_string()))
    };
    let recv = async {
        events
            .recv()
            .await
            .map_err(|_| Error::Infrastructure("lab stream closed".to_string()))
    };
    smol::future::or(recv, timeout).await
}

/// Poll `check` until it holds, giving up after a few seconds
pub async fn wait_until<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if check() {
            return true;
        }
        smol::Timer::after(Duration::from_millis(10)).await;
    }
    check()
}

/// Catalog serving a fixed set of definitions
#[derive(Default)]
pub struct FakeCatalog {
    exercises: HashMap<String, ExerciseConfig>,
}

impl FakeCatalog {
    /// Catalog of [`sample_exercise`] definitions
    pub fn with_samples(tags: &[&str]) -> Self {
        Self::new(tags.iter().map(|tag| sample_exercise(tag)).collect())
    }

    /// Catalog of the given definitions
    pub fn new(exercises: Vec<ExerciseConfig>) -> Self {
        Self {
            exercises: exercises
                .into_iter()
                .map(|config| (config.tag.clone(), config))
                .collect(),
        }
    }
}

#[async_trait]
impl ExerciseCatalog for FakeCatalog {
    async fn resolve_by_tags(&self, tags: &[String]) -> Result<Vec<ExerciseConfig>> {
        Ok(tags
            .iter()
            .filter_map(|tag| self.exercises.get(tag).cloned())
            .collect())
    }
}

#[derive(Default)]
struct ProvisionerState {
    labs: HashSet<String>,
    next_subnet: u8,
    next_host: HashMap<String, u8>,
    // instance id -> exercise tag
    instances: HashMap<String, String>,
    fail_create: HashSet<String>,
    fail_start: HashSet<String>,
    created: usize,
    started: usize,
}

/// Provisioner that tracks lab skeletons and instances in memory
#[derive(Default)]
pub struct FakeProvisioner {
    state: Mutex<ProvisionerState>,
    ids: AtomicU64,
    fail_lab: AtomicBool,
    fail_close: AtomicBool,
    ignore_cancel: AtomicBool,
    start_delay: Mutex<Option<Duration>>,
}

impl FakeProvisioner {
    /// Provisioner where everything succeeds
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ProvisionerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make creation of an exercise fail
    pub fn fail_create(&self, exercise_tag: &str) {
        self.state().fail_create.insert(exercise_tag.to_string());
    }

    /// Make starting an exercise fail
    pub fn fail_start(&self, exercise_tag: &str) {
        self.state().fail_start.insert(exercise_tag.to_string());
    }

    /// Make lab skeleton creation fail
    pub fn fail_create_lab(&self, failing: bool) {
        self.fail_lab.store(failing, Ordering::SeqCst);
    }

    /// Make exercise teardown fail, leaving the instances live
    pub fn set_fail_close(&self, failing: bool) {
        self.fail_close.store(failing, Ordering::SeqCst);
    }

    /// Let delayed lab starts run to completion even when cancelled
    pub fn set_ignore_cancel(&self, ignore: bool) {
        self.ignore_cancel.store(ignore, Ordering::SeqCst);
    }

    /// Delay every lab start; a cancelled start fails unless cancellation
    /// is ignored
    pub fn set_start_delay(&self, delay: Duration) {
        *self
            .start_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Lab skeletons not yet closed
    pub fn live_labs(&self) -> usize {
        self.state().labs.len()
    }

    /// Instances not yet closed
    pub fn live_instances(&self) -> usize {
        self.state().instances.len()
    }

    /// Successful exercise creations
    pub fn created_exercises(&self) -> usize {
        self.state().created
    }

    /// Successful exercise starts
    pub fn started_exercises(&self) -> usize {
        self.state().started
    }

    /// Whether an instance exists
    pub fn is_live(&self, instance_id: &str) -> bool {
        self.state().instances.contains_key(instance_id)
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.ids.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl InfrastructureProvisioner for FakeProvisioner {
    async fn create_lab(&self, spec: &LabSpec, cancel: &CancelSignal) -> Result<LabHandle> {
        if cancel.is_cancelled() {
            return Err(Error::Infrastructure("cancelled".to_string()));
        }
        if self.fail_lab.load(Ordering::SeqCst) {
            return Err(Error::Infrastructure(format!(
                "no capacity for lab {}",
                spec.tag
            )));
        }

        let id = self.next_id("lab");
        let mut state = self.state();
        state.next_subnet = state.next_subnet.wrapping_add(1);
        let octet = state.next_subnet;
        state.labs.insert(id.clone());

        Ok(LabHandle {
            id,
            subnet: Ipv4Net::new(Ipv4Addr::new(10, 10, octet, 0), 24)
                .map_err(|e| Error::Infrastructure(e.to_string()))?,
            dns_address: Ipv4Addr::new(10, 10, octet, 3),
        })
    }

    async fn start_lab(&self, lab: &LabHandle, cancel: &CancelSignal) -> Result<()> {
        let delay = *self
            .start_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay.filter(|_| self.ignore_cancel.load(Ordering::SeqCst)) {
            smol::Timer::after(delay).await;
        } else if let Some(delay) = delay {
            let cancelled = smol::future::or(
                async {
                    smol::Timer::after(delay).await;
                    false
                },
                async {
                    cancel.cancelled().await;
                    true
                },
            )
            .await;
            if cancelled {
                return Err(Error::Infrastructure(format!(
                    "start of {} cancelled",
                    lab.id
                )));
            }
        }

        if self.state().labs.contains(&lab.id) {
            Ok(())
        } else {
            Err(Error::Infrastructure(format!("unknown lab {}", lab.id)))
        }
    }

    async fn close_lab(&self, lab: &LabHandle) -> Result<()> {
        self.state().labs.remove(&lab.id);
        Ok(())
    }

    async fn create_exercise(
        &self,
        lab: &LabHandle,
        spec: &ExerciseSpec,
    ) -> Result<Vec<InstanceHandle>> {
        let mut state = self.state();
        if state.fail_create.contains(&spec.exercise_tag) {
            return Err(Error::Infrastructure(format!(
                "image pull failed for {}",
                spec.exercise_tag
            )));
        }

        let mut handles = Vec::with_capacity(spec.instances.len());
        for instance in &spec.instances {
            let host = state.next_host.entry(lab.id.clone()).or_insert(9);
            *host = host.wrapping_add(1);
            let octets = lab.subnet.network().octets();
            let address = Ipv4Addr::new(octets[0], octets[1], octets[2], *host);

            let id = self.next_id("inst");
            state.instances.insert(id.clone(), spec.exercise_tag.clone());
            handles.push(InstanceHandle {
                id,
                image: instance.image.clone(),
                address,
            });
        }

        state.created += 1;
        Ok(handles)
    }

    async fn start_exercise(&self, _lab: &LabHandle, instances: &[InstanceHandle]) -> Result<()> {
        let mut state = self.state();
        for instance in instances {
            let Some(tag) = state.instances.get(&instance.id) else {
                return Err(Error::Infrastructure(format!(
                    "unknown instance {}",
                    instance.id
                )));
            };
            if state.fail_start.contains(tag) {
                return Err(Error::Infrastructure(format!("{} failed to boot", tag)));
            }
        }
        state.started += 1;
        Ok(())
    }

    async fn stop_exercise(&self, _lab: &LabHandle, instances: &[InstanceHandle]) -> Result<()> {
        let state = self.state();
        match instances.iter().find(|i| !state.instances.contains_key(&i.id)) {
            Some(missing) => Err(Error::Infrastructure(format!(
                "unknown instance {}",
                missing.id
            ))),
            None => Ok(()),
        }
    }

    async fn close_exercise(&self, _lab: &LabHandle, instances: &[InstanceHandle]) -> Result<()> {
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(Error::Infrastructure(format!(
                "{} instances did not stop",
                instances.len()
            )));
        }
        let mut state = self.state();
        for instance in instances {
            state.instances.remove(&instance.id);
        }
        Ok(())
    }
}

/// DNS service remembering the last pushed record set
#[derive(Default)]
pub struct FakeDns {
    refreshes: AtomicUsize,
    failing: AtomicBool,
    last: Mutex<Vec<DnsRecord>>,
}

impl FakeDns {
    /// DNS where every refresh succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every refresh fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful refreshes
    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Records of the last successful refresh
    pub fn last_records(&self) -> Vec<DnsRecord> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl DnsService for FakeDns {
    async fn refresh(&self, lab: &LabHandle, records: &[DnsRecord]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Infrastructure(format!(
                "DNS server of {} unreachable",
                lab.id
            )));
        }
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = records.to_vec();
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Firewall keeping installed rules in memory
#[derive(Default)]
pub struct FakeFirewall {
    rules: Mutex<BTreeMap<String, FirewallRule>>,
    next_id: AtomicU64,
    failing: AtomicBool,
}

impl FakeFirewall {
    /// Firewall accepting every rule
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every rule installation fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Rules currently installed
    pub fn active_rules(&self) -> usize {
        self.rules.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl FirewallBackend for FakeFirewall {
    async fn add_rule(&self, rule: &FirewallRule) -> range_network::Result<RuleId> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(range_network::Error::Firewall(
                "chain not found".to_string(),
            ));
        }
        let id = format!("fw-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), rule.clone());
        Ok(RuleId(id))
    }

    async fn remove_rule(&self, id: &RuleId) -> range_network::Result<()> {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id.0);
        Ok(())
    }
}

/// VPN gateway tracking interfaces and peers in memory
#[derive(Default)]
pub struct FakeVpnGateway {
    interfaces: Mutex<HashSet<String>>,
    peers: Mutex<HashSet<(String, Ipv4Addr)>>,
    fail_open: AtomicBool,
    fail_peers: AtomicBool,
}

impl FakeVpnGateway {
    /// Gateway where everything succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Make interface setup fail
    pub fn set_fail_open(&self, failing: bool) {
        self.fail_open.store(failing, Ordering::SeqCst);
    }

    /// Make peer registration fail
    pub fn set_fail_peers(&self, failing: bool) {
        self.fail_peers.store(failing, Ordering::SeqCst);
    }

    /// Whether an environment's interface is up
    pub fn is_open(&self, event_tag: &str) -> bool {
        self.interfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(event_tag)
    }

    /// Registered peers across all interfaces
    pub fn peers(&self) -> usize {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl VpnGateway for FakeVpnGateway {
    async fn open_interface(
        &self,
        event_tag: &str,
        _address: Ipv4Net,
        _port: u16,
    ) -> range_network::Result<()> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(range_network::Error::Gateway(format!(
                "cannot create interface for {}",
                event_tag
            )));
        }
        self.interfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_tag.to_string());
        Ok(())
    }

    async fn register_peer(
        &self,
        event_tag: &str,
        client_ip: Ipv4Addr,
    ) -> range_network::Result<PeerCredentials> {
        if self.fail_peers.load(Ordering::SeqCst) {
            return Err(range_network::Error::Gateway(format!(
                "cannot add peer {}",
                client_ip
            )));
        }
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((event_tag.to_string(), client_ip));
        Ok(PeerCredentials {
            client_private_key: format!("client-key-{}", client_ip),
            server_public_key: format!("server-key-{}", event_tag),
        })
    }

    async fn remove_peer(&self, event_tag: &str, client_ip: Ipv4Addr) -> range_network::Result<()> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(event_tag.to_string(), client_ip));
        Ok(())
    }

    async fn close_interface(&self, event_tag: &str) -> range_network::Result<()> {
        self.interfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(event_tag);
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(tag, _)| tag != event_tag);
        Ok(())
    }
}

/// One set of fakes plus typed handles to each
pub struct Fakes {
    /// Exercise catalog
    pub catalog: Arc<FakeCatalog>,
    /// Infrastructure driver
    pub provisioner: Arc<FakeProvisioner>,
    /// Lab DNS
    pub dns: Arc<FakeDns>,
    /// Host firewall
    pub firewall: Arc<FakeFirewall>,
    /// WireGuard endpoint
    pub vpn: Arc<FakeVpnGateway>,
    /// Snapshot store
    pub store: Arc<MemoryStateStore>,
}

impl Fakes {
    /// Fakes whose catalog serves samples for `exercise_tags`
    pub fn new(exercise_tags: &[&str]) -> Self {
        Self {
            catalog: Arc::new(FakeCatalog::with_samples(exercise_tags)),
            provisioner: Arc::new(FakeProvisioner::new()),
            dns: Arc::new(FakeDns::new()),
            firewall: Arc::new(FakeFirewall::new()),
            vpn: Arc::new(FakeVpnGateway::new()),
            store: Arc::new(MemoryStateStore::new()),
        }
    }

    /// Collaborators backed by these fakes
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            catalog: self.catalog.clone(),
            provisioner: self.provisioner.clone(),
            dns: self.dns.clone(),
            firewall: self.firewall.clone(),
            vpn: self.vpn.clone(),
            store: self.store.clone(),
        }
    }
}
