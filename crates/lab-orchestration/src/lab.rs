//! Labs: one team's isolated bundle of infrastructure and exercises

use crate::api::LabDescriptor;
use crate::error::{Error, Failures, Result};
use crate::exercise::{Challenge, DnsRecord, Exercise, ExerciseConfig, validate_exercise_tag};
use crate::infra::{CancelSignal, DnsService, InfrastructureProvisioner, LabHandle, LabSpec};
use crate::snapshot::LabSnapshot;
use chrono::{DateTime, Utc};
use futures::lock::Mutex;
use indexmap::IndexMap;
use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Length of generated lab passwords
const PASSWORD_LEN: usize = 16;

/// Kind of lab
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabType {
    /// Guided lab reached through the browser frontends only
    Beginner,
    /// Full lab, optionally reached through a VPN tunnel
    Standard,
}

impl fmt::Display for LabType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabType::Beginner => f.write_str("beginner"),
            LabType::Standard => f.write_str("standard"),
        }
    }
}

/// Remote access credentials of a lab
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabCredentials {
    /// Login name
    pub username: String,
    /// Login password
    pub password: String,
}

impl LabCredentials {
    /// Generate credentials for a lab id
    pub fn generate(lab_id: &str) -> Self {
        let password = OsRng
            .sample_iter(&Alphanumeric)
            .take(PASSWORD_LEN)
            .map(char::from)
            .collect();
        Self {
            username: format!("lab{}", lab_id),
            password,
        }
    }
}

impl fmt::Debug for LabCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LabCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Mutable part of a lab, guarded by the lab lock
#[derive(Default)]
struct LabState {
    /// Exercises by tag, in insertion order
    exercises: IndexMap<String, Exercise>,
}

impl LabState {
    /// Lab-wide record set, in exercise insertion order
    fn dns_records(&self) -> Vec<DnsRecord> {
        self.exercises
            .values()
            .flat_map(|exercise| exercise.records().iter().cloned())
            .collect()
    }
}

/// One team's lab
pub struct Lab {
    tag: String,
    event_tag: String,
    lab_type: LabType,
    is_vpn: bool,
    handle: LabHandle,
    credentials: LabCredentials,
    created_at: DateTime<Utc>,
    state: Mutex<LabState>,
    provisioner: Arc<dyn InfrastructureProvisioner>,
    dns: Arc<dyn DnsService>,
}

impl Lab {
    /// Provision a lab skeleton
    ///
    /// Beginner labs are never VPN labs; callers reject that combination
    /// before queueing work, this is the last line.
    pub async fn create(
        spec: LabSpec,
        provisioner: Arc<dyn InfrastructureProvisioner>,
        dns: Arc<dyn DnsService>,
        cancel: &CancelSignal,
    ) -> Result<Self> {
        if spec.is_vpn && spec.lab_type == LabType::Beginner {
            return Err(Error::Validation("beginner labs cannot be VPN labs".to_string()));
        }

        info!("Creating lab {} for event {}", spec.tag, spec.event_tag);
        let handle = provisioner.create_lab(&spec, cancel).await?;

        let lab_id = spec
            .tag
            .rsplit_once('-')
            .map(|(_, id)| id)
            .unwrap_or(spec.tag.as_str());
        let credentials = LabCredentials::generate(lab_id);

        Ok(Self {
            tag: spec.tag,
            event_tag: spec.event_tag,
            lab_type: spec.lab_type,
            is_vpn: spec.is_vpn,
            handle,
            credentials,
            created_at: Utc::now(),
            state: Mutex::new(LabState::default()),
            provisioner,
            dns,
        })
    }

    /// Lab tag
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Owning event tag
    pub fn event_tag(&self) -> &str {
        &self.event_tag
    }

    /// Lab type
    pub fn lab_type(&self) -> LabType {
        self.lab_type
    }

    /// Whether the lab is reached through a VPN tunnel
    pub fn is_vpn(&self) -> bool {
        self.is_vpn
    }

    /// Provisioned skeleton
    pub fn handle(&self) -> &LabHandle {
        &self.handle
    }

    /// Access credentials
    pub fn credentials(&self) -> &LabCredentials {
        &self.credentials
    }

    /// Bring up the skeleton and every exercise
    pub async fn start(&self, cancel: &CancelSignal) -> Result<()> {
        self.provisioner.start_lab(&self.handle, cancel).await?;

        let mut state = self.state.lock().await;
        let tags: Vec<String> = state.exercises.keys().cloned().collect();
        self.start_exercises_locked(&mut state, &tags).await
    }

    /// Tear down every exercise and the skeleton
    ///
    /// Failures are collected and reported together; every resource is
    /// still attempted, so a half-started lab can be closed.
    pub async fn close(&self) -> Result<()> {
        let mut failures = Failures::new();
        let mut state = self.state.lock().await;

        for exercise in state.exercises.values_mut() {
            if let Err(e) = exercise.close(&*self.provisioner, &self.handle).await {
                warn!("Failed to close exercise {} in lab {}: {}", exercise.tag(), self.tag, e);
                failures.push(exercise.tag(), e);
            }
        }

        if let Err(e) = self.provisioner.close_lab(&self.handle).await {
            warn!("Failed to close lab {}: {}", self.tag, e);
            failures.push(&self.tag, e);
        }

        if failures.is_empty() {
            info!("Closed lab {}", self.tag);
            Ok(())
        } else {
            Err(Error::Teardown(failures))
        }
    }

    /// Create exercises without starting them
    ///
    /// The batch is atomic: on any rejection or creation failure the
    /// exercise index is left as it was.
    pub async fn add_exercises(&self, configs: Vec<ExerciseConfig>) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        self.add_exercises_locked(&mut state, configs).await
    }

    /// Add exercises, refresh DNS and start the new exercises in parallel
    ///
    /// Exercises already in the lab are left alone. If DNS refresh fails
    /// nothing is started. A start failure does not keep the other
    /// exercises from starting; every failing tag is reported.
    pub async fn add_and_start_exercises(&self, configs: Vec<ExerciseConfig>) -> Result<()> {
        let mut state = self.state.lock().await;

        let added = self.add_exercises_locked(&mut state, configs).await?;
        self.refresh_dns_locked(&state).await?;
        self.start_exercises_locked(&mut state, &added).await
    }

    /// Push the full record set to the lab's DNS server
    pub async fn refresh_dns(&self) -> Result<()> {
        let state = self.state.lock().await;
        self.refresh_dns_locked(&state).await
    }

    /// Start one exercise
    pub async fn start_exercise(&self, tag: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let exercise = state
            .exercises
            .get_mut(tag)
            .ok_or_else(|| Error::not_found("exercise", tag))?;
        exercise.start(&*self.provisioner, &self.handle).await
    }

    /// Stop one exercise
    pub async fn stop_exercise(&self, tag: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let exercise = state
            .exercises
            .get_mut(tag)
            .ok_or_else(|| Error::not_found("exercise", tag))?;
        exercise.stop(&*self.provisioner, &self.handle).await
    }

    /// Recreate and restart one exercise
    ///
    /// The instances may come back on new addresses, or not at all, so DNS
    /// is refreshed whether or not the reset succeeded.
    pub async fn reset_exercise(&self, tag: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let exercise = state
            .exercises
            .get_mut(tag)
            .ok_or_else(|| Error::not_found("exercise", tag))?;
        let reset = exercise
            .reset(&*self.provisioner, &self.handle, &self.tag)
            .await;

        let refreshed = self.refresh_dns_locked(&state).await;
        reset.and(refreshed)
    }

    /// Exercise tags in insertion order
    pub async fn exercise_tags(&self) -> Vec<String> {
        self.state.lock().await.exercises.keys().cloned().collect()
    }

    /// Challenges of every exercise, in insertion order
    pub async fn challenges(&self) -> Vec<Challenge> {
        let state = self.state.lock().await;
        state
            .exercises
            .values()
            .flat_map(|exercise| exercise.challenges())
            .collect()
    }

    /// Check a flag submission
    pub async fn verify_flag(
        &self,
        exercise_tag: &str,
        challenge_tag: &str,
        candidate: &str,
    ) -> Result<bool> {
        let state = self.state.lock().await;
        let exercise = state
            .exercises
            .get(exercise_tag)
            .ok_or_else(|| Error::not_found("exercise", exercise_tag))?;
        Ok(exercise.verify_flag(challenge_tag, candidate))
    }

    /// Current DNS record set
    pub async fn dns_records(&self) -> Vec<DnsRecord> {
        self.state.lock().await.dns_records()
    }

    /// Descriptor reported to the platform
    pub async fn descriptor(&self) -> LabDescriptor {
        let state = self.state.lock().await;
        LabDescriptor {
            tag: self.tag.clone(),
            event_tag: self.event_tag.clone(),
            lab_type: self.lab_type,
            is_vpn: self.is_vpn,
            subnet: self.handle.subnet,
            dns_address: self.handle.dns_address,
            credentials: self.credentials.clone(),
            exercises: state.exercises.values().map(|e| e.info()).collect(),
            vpn_configs: Vec::new(),
            created_at: self.created_at,
        }
    }

    /// Persistable copy of the lab
    pub async fn snapshot(&self) -> LabSnapshot {
        let state = self.state.lock().await;
        LabSnapshot {
            tag: self.tag.clone(),
            event_tag: self.event_tag.clone(),
            lab_type: self.lab_type,
            is_vpn: self.is_vpn,
            handle: self.handle.clone(),
            credentials: self.credentials.clone(),
            created_at: self.created_at,
            exercises: state.exercises.values().cloned().collect(),
        }
    }

    /// Rebuild a lab from a snapshot without touching infrastructure
    pub fn from_snapshot(
        snapshot: LabSnapshot,
        provisioner: Arc<dyn InfrastructureProvisioner>,
        dns: Arc<dyn DnsService>,
    ) -> Self {
        let exercises = snapshot
            .exercises
            .into_iter()
            .map(|exercise| (exercise.tag().to_string(), exercise))
            .collect();

        Self {
            tag: snapshot.tag,
            event_tag: snapshot.event_tag,
            lab_type: snapshot.lab_type,
            is_vpn: snapshot.is_vpn,
            handle: snapshot.handle,
            credentials: snapshot.credentials,
            created_at: snapshot.created_at,
            state: Mutex::new(LabState { exercises }),
            provisioner,
            dns,
        }
    }

    async fn add_exercises_locked(
        &self,
        state: &mut LabState,
        configs: Vec<ExerciseConfig>,
    ) -> Result<Vec<String>> {
        // Validate the whole batch before creating anything
        let mut batch = HashSet::new();
        for config in &configs {
            validate_exercise_tag(&config.tag)?;
            if state.exercises.contains_key(&config.tag) || !batch.insert(config.tag.as_str()) {
                return Err(Error::Conflict(format!(
                    "exercise {} already exists in lab {}",
                    config.tag, self.tag
                )));
            }
        }

        let mut created: Vec<Exercise> = Vec::with_capacity(configs.len());
        for config in configs {
            let mut exercise = Exercise::new(config);
            if let Err(e) = exercise
                .create(&*self.provisioner, &self.handle, &self.tag)
                .await
            {
                error!(
                    "Failed to create exercise {} in lab {}: {}",
                    exercise.tag(),
                    self.tag,
                    e
                );
                for mut done in created {
                    if let Err(e) = done.close(&*self.provisioner, &self.handle).await {
                        warn!("Failed to roll back exercise {}: {}", done.tag(), e);
                    }
                }
                return Err(e);
            }
            created.push(exercise);
        }

        let tags: Vec<String> = created.iter().map(|e| e.tag().to_string()).collect();
        for exercise in created {
            state.exercises.insert(exercise.tag().to_string(), exercise);
        }
        debug!("Added exercises {:?} to lab {}", tags, self.tag);
        Ok(tags)
    }

    async fn refresh_dns_locked(&self, state: &LabState) -> Result<()> {
        let records = state.dns_records();
        self.dns
            .refresh(&self.handle, &records)
            .await
            .inspect_err(|e| error!("Failed to refresh DNS for lab {}: {}", self.tag, e))
    }

    async fn start_exercises_locked(&self, state: &mut LabState, tags: &[String]) -> Result<()> {
        let provisioner = &*self.provisioner;
        let handle = &self.handle;

        let starts = state
            .exercises
            .values_mut()
            .filter(|exercise| tags.iter().any(|tag| tag == exercise.tag()))
            .map(|exercise| async move {
                let result = exercise.start(provisioner, handle).await;
                (exercise.tag().to_string(), result)
            });
        let results = futures::future::join_all(starts).await;

        let mut failures = Failures::new();
        for (tag, result) in results {
            if let Err(e) = result {
                error!("Failed to start exercise {} in lab {}: {}", tag, self.tag, e);
                failures.push(tag, e);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::ExerciseStart(failures))
        }
    }
}

impl fmt::Debug for Lab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lab")
            .field("tag", &self.tag)
            .field("lab_type", &self.lab_type)
            .field("is_vpn", &self.is_vpn)
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::exercise::ExerciseStatus;
    use crate::infra::cancel_pair;
    use crate::testing::{FakeDns, FakeProvisioner, sample_exercise};

    fn spec(is_vpn: bool, lab_type: LabType) -> LabSpec {
        LabSpec {
            tag: "ev-1a2b3c4d".to_string(),
            event_tag: "ev".to_string(),
            lab_type,
            is_vpn,
            frontends: Vec::new(),
        }
    }

    async fn new_lab(provisioner: &Arc<FakeProvisioner>, dns: &Arc<FakeDns>) -> Lab {
        let (_handle, signal) = cancel_pair();
        Lab::create(
            spec(false, LabType::Standard),
            provisioner.clone(),
            dns.clone(),
            &signal,
        )
        .await
        .unwrap()
    }

    #[smol_potat::test]
    async fn test_beginner_vpn_lab_rejected() {
        let provisioner = Arc::new(FakeProvisioner::new());
        let (_handle, signal) = cancel_pair();

        let result = Lab::create(
            spec(true, LabType::Beginner),
            provisioner.clone(),
            Arc::new(FakeDns::new()),
            &signal,
        )
        .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(provisioner.live_labs(), 0);
    }

    #[smol_potat::test]
    async fn test_credentials_use_lab_id() {
        let provisioner = Arc::new(FakeProvisioner::new());
        let lab = new_lab(&provisioner, &Arc::new(FakeDns::new())).await;

        assert_eq!(lab.credentials().username, "lab1a2b3c4d");
        assert_eq!(lab.credentials().password.len(), PASSWORD_LEN);
        assert!(lab.credentials().password.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(!format!("{:?}", lab.credentials()).contains(&lab.credentials().password));
    }

    #[smol_potat::test]
    async fn test_duplicate_in_batch_leaves_index_unchanged() {
        let provisioner = Arc::new(FakeProvisioner::new());
        let lab = new_lab(&provisioner, &Arc::new(FakeDns::new())).await;
        lab.add_exercises(vec![sample_exercise("web")]).await.unwrap();

        // Duplicate of an existing tag
        let result = lab
            .add_exercises(vec![sample_exercise("sqli"), sample_exercise("web")])
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Conflict);

        // Duplicate inside the batch
        let result = lab
            .add_exercises(vec![sample_exercise("xss"), sample_exercise("xss")])
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Conflict);

        assert_eq!(lab.exercise_tags().await, vec!["web".to_string()]);
        assert_eq!(provisioner.created_exercises(), 1);
    }

    #[smol_potat::test]
    async fn test_empty_tag_rejected() {
        let provisioner = Arc::new(FakeProvisioner::new());
        let lab = new_lab(&provisioner, &Arc::new(FakeDns::new())).await;

        let result = lab
            .add_exercises(vec![sample_exercise("web"), ExerciseConfig::default()])
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(lab.exercise_tags().await.is_empty());
    }

    #[smol_potat::test]
    async fn test_creation_failure_rolls_back_batch() {
        let provisioner = Arc::new(FakeProvisioner::new());
        provisioner.fail_create("sqli");
        let lab = new_lab(&provisioner, &Arc::new(FakeDns::new())).await;

        let result = lab
            .add_exercises(vec![sample_exercise("web"), sample_exercise("sqli")])
            .await;

        assert!(result.is_err());
        assert!(lab.exercise_tags().await.is_empty());
        assert_eq!(provisioner.live_instances(), 0);
    }

    #[smol_potat::test]
    async fn test_partial_start_failure_names_failing_exercise() {
        let provisioner = Arc::new(FakeProvisioner::new());
        provisioner.fail_start("sqli");
        let dns = Arc::new(FakeDns::new());
        let lab = new_lab(&provisioner, &dns).await;

        let result = lab
            .add_and_start_exercises(vec![
                sample_exercise("web"),
                sample_exercise("sqli"),
                sample_exercise("xss"),
            ])
            .await;

        match result {
            Err(Error::ExerciseStart(failures)) => assert_eq!(failures.tags(), vec!["sqli"]),
            other => panic!("expected start failure, got {:?}", other),
        }

        let descriptor = lab.descriptor().await;
        let status = |tag: &str| {
            descriptor
                .exercises
                .iter()
                .find(|e| e.tag == tag)
                .map(|e| e.status)
        };
        assert_eq!(status("web"), Some(ExerciseStatus::Running));
        assert_eq!(status("xss"), Some(ExerciseStatus::Running));
        assert_eq!(status("sqli"), Some(ExerciseStatus::Failed));
        assert_eq!(dns.refreshes(), 1);
    }

    #[smol_potat::test]
    async fn test_dns_failure_starts_nothing() {
        let provisioner = Arc::new(FakeProvisioner::new());
        let dns = Arc::new(FakeDns::new());
        dns.set_failing(true);
        let lab = new_lab(&provisioner, &dns).await;

        let result = lab.add_and_start_exercises(vec![sample_exercise("web")]).await;

        assert!(result.is_err());
        assert_eq!(provisioner.started_exercises(), 0);
    }

    #[smol_potat::test]
    async fn test_add_and_start_only_starts_new_exercises() {
        let provisioner = Arc::new(FakeProvisioner::new());
        let dns = Arc::new(FakeDns::new());
        let lab = new_lab(&provisioner, &dns).await;

        lab.add_and_start_exercises(vec![sample_exercise("web")])
            .await
            .unwrap();
        lab.stop_exercise("web").await.unwrap();
        lab.add_and_start_exercises(vec![sample_exercise("sqli")])
            .await
            .unwrap();

        let descriptor = lab.descriptor().await;
        assert_eq!(descriptor.exercises[0].status, ExerciseStatus::Stopped);
        assert_eq!(descriptor.exercises[1].status, ExerciseStatus::Running);
        // Both exercises' records are pushed on the second refresh
        assert_eq!(dns.last_records().len(), 2);
    }

    #[smol_potat::test]
    async fn test_exercise_operations_on_unknown_tag() {
        let provisioner = Arc::new(FakeProvisioner::new());
        let lab = new_lab(&provisioner, &Arc::new(FakeDns::new())).await;

        assert_eq!(lab.start_exercise("nope").await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(lab.stop_exercise("nope").await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(lab.reset_exercise("nope").await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[smol_potat::test]
    async fn test_close_after_partial_start_releases_everything() {
        let provisioner = Arc::new(FakeProvisioner::new());
        provisioner.fail_start("sqli");
        let lab = new_lab(&provisioner, &Arc::new(FakeDns::new())).await;
        let _ = lab
            .add_and_start_exercises(vec![sample_exercise("web"), sample_exercise("sqli")])
            .await;

        lab.close().await.unwrap();

        assert_eq!(provisioner.live_instances(), 0);
        assert_eq!(provisioner.live_labs(), 0);
    }

    #[smol_potat::test]
    async fn test_reset_keeps_unclosed_instances_for_teardown() {
        let provisioner = Arc::new(FakeProvisioner::new());
        let lab = new_lab(&provisioner, &Arc::new(FakeDns::new())).await;
        lab.add_and_start_exercises(vec![sample_exercise("web")])
            .await
            .unwrap();

        provisioner.set_fail_close(true);
        lab.reset_exercise("web").await.unwrap();
        assert_eq!(provisioner.live_instances(), 2);

        provisioner.set_fail_close(false);
        lab.close().await.unwrap();
        assert_eq!(provisioner.live_instances(), 0);
        assert_eq!(provisioner.live_labs(), 0);
    }

    #[smol_potat::test]
    async fn test_failed_reset_withdraws_dns_records() {
        let provisioner = Arc::new(FakeProvisioner::new());
        let dns = Arc::new(FakeDns::new());
        let lab = new_lab(&provisioner, &dns).await;
        lab.add_and_start_exercises(vec![sample_exercise("web"), sample_exercise("sqli")])
            .await
            .unwrap();
        assert_eq!(dns.last_records().len(), 2);

        provisioner.fail_create("web");
        assert!(lab.reset_exercise("web").await.is_err());

        let records = dns.last_records();
        assert_eq!(records.len(), 1);
        assert!(records.iter().all(|r| r.name != "web.range"));
        assert_eq!(lab.descriptor().await.exercises[0].status, ExerciseStatus::Failed);
    }
}
