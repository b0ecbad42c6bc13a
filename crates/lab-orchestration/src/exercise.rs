//! Exercise definitions and lifecycle
//!
//! An exercise is one challenge inside a lab. Dynamic exercises are backed by
//! one or more infrastructure instances; static exercises only carry flags.
//! Flags are bound when the exercise is constructed and never change, so a
//! reset brings the same flags back up on fresh instances.

use crate::error::{Error, Result};
use crate::flag::Flag;
use crate::infra::{
    ExerciseSpec, InfrastructureProvisioner, InstanceHandle, InstanceSpec, LabHandle,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Exercise definition as served by the catalog
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExerciseConfig {
    /// Exercise tag, unique within a lab
    pub tag: String,
    /// Display name
    pub name: String,
    /// Category name
    pub category: String,
    /// Hidden from participants until unlocked
    pub secret: bool,
    /// No backing infrastructure
    #[serde(rename = "static")]
    pub is_static: bool,
    /// Infrastructure instances
    pub instance: Vec<InstanceConfig>,
    /// Notes for organizers
    pub organizer_description: String,
}

/// One infrastructure unit of an exercise
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Container or VM image
    pub image: String,
    /// Memory in MiB
    #[serde(rename = "memory")]
    pub memory_mb: u32,
    /// CPU share
    pub cpu: f64,
    /// Extra environment variables
    pub envs: Vec<EnvVarConfig>,
    /// Challenges served by this instance
    pub children: Vec<ChildChallengeConfig>,
    /// DNS records served for this instance
    pub records: Vec<RecordConfig>,
}

/// Environment variable of an instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvVarConfig {
    /// Variable name
    pub name: String,
    /// Variable value
    pub value: String,
}

/// A challenge with its own flag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChildChallengeConfig {
    /// Challenge tag
    pub tag: String,
    /// Display name
    pub name: String,
    /// Variable the flag is injected under
    pub env_flag: String,
    /// Fixed flag; a flag is generated when empty
    #[serde(rename = "static")]
    pub static_flag: String,
    /// Score
    pub points: u32,
    /// Category name
    pub category: String,
    /// Description shown to teams
    pub team_description: String,
    /// Skills a team should have before attempting the challenge
    #[serde(rename = "prerequisite", skip_serializing_if = "Vec::is_empty")]
    pub prerequisites: Vec<String>,
    /// Skills the challenge teaches
    #[serde(rename = "outcome", skip_serializing_if = "Vec::is_empty")]
    pub outcomes: Vec<String>,
    /// Solved outside the lab infrastructure
    pub static_challenge: bool,
}

/// DNS record template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    /// Record type ("A", "MX", ...)
    #[serde(rename = "type")]
    pub record_type: String,
    /// Record name
    pub name: String,
    /// Record data
    pub data: String,
}

/// Name served by a lab's DNS server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    /// Address the name resolves to
    pub address: Ipv4Addr,
    /// Host name
    pub name: String,
}

/// A bound flag value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FlagValue {
    /// Configured by the exercise author
    Static(String),
    /// Generated when the exercise was created
    Generated(Flag),
}

impl FlagValue {
    /// Canonical flag text
    pub fn value(&self) -> String {
        match self {
            FlagValue::Static(s) => s.clone(),
            FlagValue::Generated(flag) => flag.to_string(),
        }
    }

    /// Exact comparison against a submission
    pub fn verify(&self, candidate: &str) -> bool {
        match self {
            FlagValue::Static(s) => s == candidate,
            FlagValue::Generated(flag) => flag.verify(candidate),
        }
    }
}

/// Flag bound to one child challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundFlag {
    /// Index of the instance serving the challenge
    pub instance: usize,
    /// Challenge tag
    pub tag: String,
    /// Challenge name
    pub name: String,
    /// Variable the flag is injected under, if any
    pub env_flag: String,
    /// The flag
    pub flag: FlagValue,
}

/// Challenge as listed to the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    /// Challenge name
    pub name: String,
    /// Challenge tag
    pub tag: String,
    /// Flag value
    pub value: String,
}

/// Exercise lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExerciseStatus {
    /// No infrastructure behind it
    Static,
    /// Instances exist but were not started
    Created,
    /// Instances running
    Running,
    /// Instances stopped
    Stopped,
    /// Last start, stop or reset failed
    Failed,
}

/// Summary of an exercise for descriptors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExerciseInfo {
    /// Exercise tag
    pub tag: String,
    /// Display name
    pub name: String,
    /// Current status
    pub status: ExerciseStatus,
}

/// Check an exercise tag
pub fn validate_exercise_tag(tag: &str) -> Result<()> {
    static TAG: OnceLock<Option<Regex>> = OnceLock::new();

    if tag.is_empty() {
        return Err(Error::Validation("exercise tag must not be empty".to_string()));
    }

    let valid = TAG
        .get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(tag));
    if !valid {
        return Err(Error::Validation(format!("invalid exercise tag: {}", tag)));
    }
    Ok(())
}

/// An exercise inside a lab
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exercise {
    config: ExerciseConfig,
    flags: Vec<BoundFlag>,
    instances: Vec<InstanceHandle>,
    // Instances a reset failed to close, retried on every close
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    leftovers: Vec<InstanceHandle>,
    records: Vec<DnsRecord>,
    status: ExerciseStatus,
}

impl Exercise {
    /// Bind flags for a definition; nothing is created yet
    pub fn new(config: ExerciseConfig) -> Self {
        let flags = config
            .instance
            .iter()
            .enumerate()
            .flat_map(|(idx, instance)| {
                instance.children.iter().map(move |child| BoundFlag {
                    instance: idx,
                    tag: child.tag.clone(),
                    name: child.name.clone(),
                    env_flag: child.env_flag.clone(),
                    flag: if child.static_flag.is_empty() {
                        FlagValue::Generated(Flag::generate())
                    } else {
                        FlagValue::Static(child.static_flag.clone())
                    },
                })
            })
            .collect();

        let status = if config.is_static {
            ExerciseStatus::Static
        } else {
            ExerciseStatus::Created
        };

        Self {
            config,
            flags,
            instances: Vec::new(),
            leftovers: Vec::new(),
            records: Vec::new(),
            status,
        }
    }

    /// Exercise tag
    pub fn tag(&self) -> &str {
        &self.config.tag
    }

    /// Definition the exercise was built from
    pub fn config(&self) -> &ExerciseConfig {
        &self.config
    }

    /// Whether the exercise has backing infrastructure
    pub fn is_static(&self) -> bool {
        self.config.is_static
    }

    /// Current status
    pub fn status(&self) -> ExerciseStatus {
        self.status
    }

    /// Created instances
    pub fn instances(&self) -> &[InstanceHandle] {
        &self.instances
    }

    /// Old instances still waiting to be closed after a reset
    pub fn leftovers(&self) -> &[InstanceHandle] {
        &self.leftovers
    }

    /// DNS records synthesized for the instances
    pub fn records(&self) -> &[DnsRecord] {
        &self.records
    }

    /// Bound flags
    pub fn flags(&self) -> &[BoundFlag] {
        &self.flags
    }

    /// What the provisioner is asked to create, flags injected
    pub fn spec(&self, lab_tag: &str) -> ExerciseSpec {
        let instances = self
            .config
            .instance
            .iter()
            .enumerate()
            .map(|(idx, instance)| {
                let mut env: BTreeMap<String, String> = instance
                    .envs
                    .iter()
                    .map(|var| (var.name.clone(), var.value.clone()))
                    .collect();
                for bound in self.flags.iter().filter(|f| f.instance == idx) {
                    if !bound.env_flag.is_empty() {
                        env.insert(bound.env_flag.clone(), bound.flag.value());
                    }
                }
                InstanceSpec {
                    image: instance.image.clone(),
                    memory_mb: instance.memory_mb,
                    cpu: instance.cpu,
                    env,
                }
            })
            .collect();

        ExerciseSpec {
            lab_tag: lab_tag.to_string(),
            exercise_tag: self.config.tag.clone(),
            instances,
        }
    }

    /// Create the backing instances and synthesize DNS records
    ///
    /// Every "A" record of a non-client image maps its name to the address
    /// the provisioner allocated for that instance.
    pub async fn create(
        &mut self,
        provisioner: &dyn InfrastructureProvisioner,
        lab: &LabHandle,
        lab_tag: &str,
    ) -> Result<()> {
        if self.is_static() {
            return Ok(());
        }

        let instances = provisioner
            .create_exercise(lab, &self.spec(lab_tag))
            .await?;

        if instances.len() != self.config.instance.len() {
            warn!(
                "Provisioner returned {} instances for exercise {}, expected {}",
                instances.len(),
                self.tag(),
                self.config.instance.len()
            );
            if let Err(e) = provisioner.close_exercise(lab, &instances).await {
                warn!("Failed to clean up exercise {}: {}", self.tag(), e);
            }
            return Err(Error::Infrastructure(format!(
                "instance count mismatch for exercise {}",
                self.tag()
            )));
        }

        let mut records = Vec::new();
        for (config, handle) in self.config.instance.iter().zip(&instances) {
            if config.image.contains("client") {
                continue;
            }
            for record in config.records.iter().filter(|r| r.record_type == "A") {
                records.push(DnsRecord {
                    address: handle.address,
                    name: record.name.clone(),
                });
            }
        }

        debug!(
            "Created exercise {} in lab {} ({} instances, {} records)",
            self.tag(),
            lab_tag,
            instances.len(),
            records.len()
        );
        self.instances = instances;
        self.records = records;
        self.status = ExerciseStatus::Created;
        Ok(())
    }

    /// Start the backing instances
    pub async fn start(
        &mut self,
        provisioner: &dyn InfrastructureProvisioner,
        lab: &LabHandle,
    ) -> Result<()> {
        if self.is_static() {
            return Ok(());
        }

        match provisioner.start_exercise(lab, &self.instances).await {
            Ok(()) => {
                self.status = ExerciseStatus::Running;
                Ok(())
            }
            Err(e) => {
                self.status = ExerciseStatus::Failed;
                Err(e)
            }
        }
    }

    /// Stop the backing instances
    pub async fn stop(
        &mut self,
        provisioner: &dyn InfrastructureProvisioner,
        lab: &LabHandle,
    ) -> Result<()> {
        if self.is_static() {
            return Ok(());
        }

        match provisioner.stop_exercise(lab, &self.instances).await {
            Ok(()) => {
                self.status = ExerciseStatus::Stopped;
                Ok(())
            }
            Err(e) => {
                self.status = ExerciseStatus::Failed;
                Err(e)
            }
        }
    }

    /// Recreate the backing instances and start them again
    ///
    /// A wedged instance must not block the recovery: old instances that
    /// fail to close are kept as leftovers and closed with the exercise.
    /// Records of the old instances are dropped either way.
    pub async fn reset(
        &mut self,
        provisioner: &dyn InfrastructureProvisioner,
        lab: &LabHandle,
        lab_tag: &str,
    ) -> Result<()> {
        if self.is_static() {
            return Ok(());
        }

        info!("Resetting exercise {} in lab {}", self.tag(), lab_tag);
        if let Err(e) = self.close(provisioner, lab).await {
            warn!(
                "Keeping {} unclosed instances of {} for teardown: {}",
                self.instances.len() + self.leftovers.len(),
                self.tag(),
                e
            );
            self.leftovers.append(&mut self.instances);
            self.records.clear();
        }

        if let Err(e) = self.create(provisioner, lab, lab_tag).await {
            self.status = ExerciseStatus::Failed;
            return Err(e);
        }
        self.start(provisioner, lab).await
    }

    /// Destroy the backing instances and any leftovers of a reset
    ///
    /// Both sets are attempted; the first failure is returned.
    pub async fn close(
        &mut self,
        provisioner: &dyn InfrastructureProvisioner,
        lab: &LabHandle,
    ) -> Result<()> {
        let mut result = Ok(());

        if !self.leftovers.is_empty() {
            match provisioner.close_exercise(lab, &self.leftovers).await {
                Ok(()) => self.leftovers.clear(),
                Err(e) => result = Err(e),
            }
        }

        if !self.instances.is_empty() {
            match provisioner.close_exercise(lab, &self.instances).await {
                Ok(()) => {
                    self.instances.clear();
                    self.records.clear();
                }
                Err(e) => result = result.and(Err(e)),
            }
        }

        result
    }

    /// Challenges with their flag values
    pub fn challenges(&self) -> Vec<Challenge> {
        self.flags
            .iter()
            .map(|bound| Challenge {
                name: bound.name.clone(),
                tag: bound.tag.clone(),
                value: bound.flag.value(),
            })
            .collect()
    }

    /// Check a submission for one child challenge
    pub fn verify_flag(&self, challenge_tag: &str, candidate: &str) -> bool {
        self.flags
            .iter()
            .find(|bound| bound.tag == challenge_tag)
            .is_some_and(|bound| bound.flag.verify(candidate))
    }

    /// Summary for descriptors
    pub fn info(&self) -> ExerciseInfo {
        ExerciseInfo {
            tag: self.config.tag.clone(),
            name: self.config.name.clone(),
            status: self.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProvisioner, sample_exercise, sample_lab_handle};

    #[test]
    fn test_catalog_json_field_names() {
        let json = r#"{
            "tag": "sqli",
            "name": "SQL Injection",
            "static": false,
            "organizerDescription": "classic",
            "instance": [{
                "image": "registry/sqli:1",
                "memory": 256,
                "cpu": 0.5,
                "envs": [{"name": "MODE", "value": "hard"}],
                "children": [{
                    "tag": "sqli-login",
                    "name": "Login bypass",
                    "envFlag": "APP_FLAG",
                    "points": 10,
                    "prerequisite": ["HTTP basics"],
                    "outcome": ["Bypass a login form", "Read a database"]
                }],
                "records": [{"type": "A", "name": "shop.range"}]
            }]
        }"#;

        let config: ExerciseConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.organizer_description, "classic");
        assert_eq!(config.instance[0].memory_mb, 256);
        let child = &config.instance[0].children[0];
        assert_eq!(child.env_flag, "APP_FLAG");
        assert_eq!(child.prerequisites, vec!["HTTP basics"]);
        assert_eq!(child.outcomes.len(), 2);

        // Kept when the definition is written back into a snapshot
        let saved = serde_json::to_value(&config).unwrap();
        let saved_child = &saved["instance"][0]["children"][0];
        assert_eq!(saved_child["prerequisite"][0], "HTTP basics");
        assert_eq!(saved_child["outcome"][1], "Read a database");
        assert_eq!(config.instance[0].records[0].record_type, "A");
    }

    #[test]
    fn test_flags_bound_at_construction() {
        let mut config = sample_exercise("sqli");
        config.instance[0].children.push(ChildChallengeConfig {
            tag: "sqli-admin".to_string(),
            name: "Admin".to_string(),
            static_flag: "FIRE{fixed}".to_string(),
            ..Default::default()
        });

        let exercise = Exercise::new(config);
        let challenges = exercise.challenges();

        assert_eq!(challenges.len(), 2);
        assert!(challenges[0].value.parse::<Flag>().is_ok());
        assert_eq!(challenges[1].value, "FIRE{fixed}");
        assert!(exercise.verify_flag("sqli-admin", "FIRE{fixed}"));
        assert!(!exercise.verify_flag("sqli-admin", "FIRE{fixed} "));
        assert!(!exercise.verify_flag("missing", "FIRE{fixed}"));
    }

    #[test]
    fn test_spec_injects_flags_into_env() {
        let exercise = Exercise::new(sample_exercise("sqli"));
        let spec = exercise.spec("ev-1a2b3c4d");

        let flag = exercise.challenges()[0].value.clone();
        assert_eq!(spec.instances[0].env.get("APP_FLAG"), Some(&flag));
        assert_eq!(spec.exercise_tag, "sqli");
    }

    #[smol_potat::test]
    async fn test_create_synthesizes_a_records_for_non_client_images() {
        let provisioner = FakeProvisioner::new();
        let lab = sample_lab_handle();
        let mut config = sample_exercise("web");
        config.instance.push(InstanceConfig {
            image: "registry/kali-client:1".to_string(),
            records: vec![RecordConfig {
                record_type: "A".to_string(),
                name: "attacker.range".to_string(),
                data: String::new(),
            }],
            ..Default::default()
        });
        config.instance[0].records.push(RecordConfig {
            record_type: "MX".to_string(),
            name: "mail.range".to_string(),
            data: String::new(),
        });

        let mut exercise = Exercise::new(config);
        exercise.create(&provisioner, &lab, "ev-1a2b3c4d").await.unwrap();

        assert_eq!(exercise.instances().len(), 2);
        assert_eq!(
            exercise.records(),
            &[DnsRecord {
                address: exercise.instances()[0].address,
                name: "web.range".to_string()
            }]
        );
        assert_eq!(exercise.status(), ExerciseStatus::Created);
    }

    #[smol_potat::test]
    async fn test_reset_keeps_flags_and_recreates_instances() {
        let provisioner = FakeProvisioner::new();
        let lab = sample_lab_handle();
        let mut exercise = Exercise::new(sample_exercise("web"));

        exercise.create(&provisioner, &lab, "ev-1a2b3c4d").await.unwrap();
        exercise.start(&provisioner, &lab).await.unwrap();
        let before = exercise.instances()[0].id.clone();
        let flags = exercise.challenges();

        exercise.reset(&provisioner, &lab, "ev-1a2b3c4d").await.unwrap();

        assert_ne!(exercise.instances()[0].id, before);
        assert_eq!(exercise.challenges(), flags);
        assert_eq!(exercise.status(), ExerciseStatus::Running);
        assert!(!provisioner.is_live(&before));
    }

    #[smol_potat::test]
    async fn test_static_exercise_has_no_infrastructure() {
        let provisioner = FakeProvisioner::new();
        let lab = sample_lab_handle();
        let mut config = sample_exercise("osint");
        config.is_static = true;

        let mut exercise = Exercise::new(config);
        exercise.create(&provisioner, &lab, "ev-1a2b3c4d").await.unwrap();
        exercise.start(&provisioner, &lab).await.unwrap();

        assert!(exercise.instances().is_empty());
        assert_eq!(exercise.status(), ExerciseStatus::Static);
        assert_eq!(provisioner.created_exercises(), 0);
    }

    #[test]
    fn test_tag_validation() {
        assert!(validate_exercise_tag("sql-injection_2").is_ok());
        assert!(validate_exercise_tag("").is_err());
        assert!(validate_exercise_tag("-leading").is_err());
        assert!(validate_exercise_tag("Upper").is_err());
    }
}
