//! The agent request surface
//!
//! [`AgentService`] validates requests synchronously and hands provisioning
//! to the owning environment's worker pool. Queued operations answer
//! "accepted"; their outcome is pushed on the lab stream.

use crate::api::{
    AddExercisesRequest, CreateEnvironmentRequest, CreateLabRequest, EnvironmentSummary,
    ExerciseRequest, LabDescriptor, StatusResponse,
};
use crate::config::{AgentConfig, MAX_TEAM_SIZE};
use crate::environment::{Environment, EnvironmentConfig, EnvironmentStatus, validate_event_tag};
use crate::error::{Error, Result};
use crate::exercise::{ExerciseConfig, validate_exercise_tag};
use crate::infra::Collaborators;
use crate::lab::{Lab, LabType};
use crate::registry::EnvironmentRegistry;
use crate::snapshot::EnvironmentSnapshot;
use crate::stream::{LabEvent, LabStream};
use crate::tasks;
use crate::worker::WorkerPool;
use async_channel::Receiver;
use futures::lock::Mutex;
use range_network::{NetworkRuleManager, VpnAddressPool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State shared between the service and its background jobs
pub(crate) struct AgentInner {
    pub(crate) config: AgentConfig,
    pub(crate) registry: EnvironmentRegistry,
    pub(crate) vpn_pool: VpnAddressPool,
    pub(crate) rules: NetworkRuleManager,
    pub(crate) collab: Collaborators,
    pub(crate) stream: LabStream,
    pub(crate) teardown: WorkerPool,
    persist_lock: Mutex<()>,
}

impl AgentInner {
    /// Save a registry snapshot; failures are logged, never returned
    pub(crate) async fn persist(&self) {
        // Serialize snapshot-then-save so an older snapshot never lands last
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.registry.snapshot().await;
        match self.collab.store.save(&snapshot).await {
            Ok(()) => debug!(
                "Persisted registry snapshot ({} environments)",
                snapshot.environments.len()
            ),
            Err(e) => warn!("Failed to persist registry snapshot: {}", e),
        }
    }

    /// Resolve exercise tags, in request order
    async fn resolve_exercises(&self, tags: &[String]) -> Result<Vec<ExerciseConfig>> {
        for tag in tags {
            validate_exercise_tag(tag)?;
        }
        if tags.is_empty() {
            return Ok(Vec::new());
        }

        let resolved: HashMap<String, ExerciseConfig> = self
            .collab
            .catalog
            .resolve_by_tags(tags)
            .await?
            .into_iter()
            .map(|config| (config.tag.clone(), config))
            .collect();

        tags.iter()
            .map(|tag| {
                resolved
                    .get(tag)
                    .cloned()
                    .ok_or_else(|| Error::not_found("exercise", tag.as_str()))
            })
            .collect()
    }
}

/// The agent's orchestration service
#[derive(Clone)]
pub struct AgentService {
    inner: Arc<AgentInner>,
}

impl AgentService {
    /// Create a service with an empty registry
    pub fn new(config: AgentConfig, collab: Collaborators) -> Result<Self> {
        config.validate()?;

        let vpn_pool = config.vpn_pool()?;
        let rules = NetworkRuleManager::new(collab.firewall.clone());
        let stream = LabStream::new(config.lab_stream_capacity);
        let teardown = WorkerPool::new(
            "teardown",
            config.teardown_workers,
            config.task_queue_capacity,
        );

        info!(
            "Starting agent on {} with VPN range {}",
            config.host,
            vpn_pool.range()
        );

        Ok(Self {
            inner: Arc::new(AgentInner {
                config,
                registry: EnvironmentRegistry::new(),
                vpn_pool,
                rules,
                collab,
                stream,
                teardown,
                persist_lock: Mutex::new(()),
            }),
        })
    }

    /// Agent configuration
    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Environment registry
    pub fn registry(&self) -> &EnvironmentRegistry {
        &self.inner.registry
    }

    /// VPN endpoint address pool
    pub fn vpn_pool(&self) -> &VpnAddressPool {
        &self.inner.vpn_pool
    }

    /// Outbound event stream
    pub fn stream(&self) -> &LabStream {
        &self.inner.stream
    }

    /// Subscribe to lab events
    pub fn lab_stream(&self) -> Receiver<LabEvent> {
        self.inner.stream.subscribe()
    }

    /// Create an environment and queue its setup
    pub async fn create_environment(
        &self,
        req: CreateEnvironmentRequest,
    ) -> Result<StatusResponse> {
        validate_event_tag(&req.event_tag)?;
        if self.inner.registry.lookup(&req.event_tag).is_some() {
            return Err(Error::Conflict(format!(
                "environment {} already exists",
                req.event_tag
            )));
        }

        let team_size = req.team_size.unwrap_or(self.inner.config.default_team_size);
        if team_size == 0 || team_size > MAX_TEAM_SIZE {
            return Err(Error::Validation(format!(
                "team size must be between 1 and {}, got {}",
                MAX_TEAM_SIZE, team_size
            )));
        }

        let exercises = self.inner.resolve_exercises(&req.exercise_tags).await?;
        let vpn_address = self.inner.vpn_pool.get()?;

        let config = EnvironmentConfig {
            tag: req.event_tag.clone(),
            lab_type: req.lab_type,
            exercises,
            frontends: req.frontends,
            vpn_address,
            vpn_port: req.vpn_port.unwrap_or(self.inner.config.default_vpn_port),
            team_size,
        };
        let env = Arc::new(Environment::new(
            config,
            self.inner.config.workers_per_environment,
            self.inner.config.task_queue_capacity,
        ));

        if let Err(e) = self.inner.registry.insert(env.clone()) {
            self.inner.vpn_pool.release(vpn_address);
            return Err(e);
        }

        if let Err(e) = env
            .pool()
            .add_task(tasks::setup_environment(self.inner.clone(), env.clone()))
        {
            self.inner.registry.remove(env.tag());
            self.inner.vpn_pool.release(vpn_address);
            return Err(e);
        }

        info!(
            "Created environment {} with {} exercises on {}",
            req.event_tag,
            env.config().exercises.len(),
            vpn_address
        );
        self.inner.persist().await;
        Ok(StatusResponse::accepted())
    }

    /// Queue creation of a lab in a running environment
    pub async fn create_lab_for_env(&self, req: CreateLabRequest) -> Result<StatusResponse> {
        let env = self
            .inner
            .registry
            .lookup(&req.event_tag)
            .ok_or_else(|| Error::not_found("environment", req.event_tag.as_str()))?;

        match env.status() {
            EnvironmentStatus::Running => {}
            EnvironmentStatus::Initializing => {
                return Err(Error::Validation(format!(
                    "environment {} is not ready",
                    req.event_tag
                )));
            }
            EnvironmentStatus::Closing | EnvironmentStatus::Closed => {
                return Err(Error::not_found("environment", req.event_tag.as_str()));
            }
        }

        if req.is_vpn && env.config().lab_type == LabType::Beginner {
            return Err(Error::Validation(
                "beginner labs cannot be VPN labs".to_string(),
            ));
        }

        env.pool()
            .add_task(tasks::provision_lab(self.inner.clone(), env.clone(), req.is_vpn))?;

        debug!("Queued lab creation for environment {}", req.event_tag);
        Ok(StatusResponse::accepted())
    }

    /// Describe a registered lab
    pub async fn get_lab(&self, lab_tag: &str) -> Result<LabDescriptor> {
        let (_, lab) = self.inner.registry.get_lab_by_tag(lab_tag).await?;
        Ok(lab.descriptor().await)
    }

    /// Generate the WireGuard client configs of a VPN lab
    ///
    /// Configs can be generated once per lab; a second request, or one
    /// for a lab whose configs were generated at creation, is a conflict.
    pub async fn create_vpn_conf_for_lab(&self, lab_tag: &str) -> Result<Vec<String>> {
        let (env, lab) = self.inner.registry.get_lab_by_tag(lab_tag).await?;
        if !lab.is_vpn() {
            return Err(Error::Validation(format!(
                "lab {} is not a VPN lab",
                lab_tag
            )));
        }

        let configs = tasks::create_vpn_configs(&self.inner, &env, &lab).await?;
        self.inner.persist().await;
        Ok(configs)
    }

    /// Remove a lab from the index and queue its teardown
    pub async fn close_lab(&self, lab_tag: &str) -> Result<StatusResponse> {
        let env = self.inner.registry.environment_of(lab_tag)?;
        let lab = env
            .remove_lab(lab_tag)
            .await
            .ok_or_else(|| Error::not_found("lab", lab_tag))?;

        info!("Closing lab {}", lab_tag);
        self.inner
            .teardown
            .add_task_or_detach(tasks::close_lab(self.inner.clone(), env, lab));
        Ok(StatusResponse::accepted())
    }

    /// Add exercises to a lab and start them
    pub async fn add_exercises_to_lab(&self, req: AddExercisesRequest) -> Result<StatusResponse> {
        if req.exercise_tags.is_empty() {
            return Err(Error::Validation("no exercise tags given".to_string()));
        }

        let (_, lab) = self.inner.registry.get_lab_by_tag(&req.lab_tag).await?;
        // Beginner labs only ever run the environment's own exercises
        if lab.lab_type() == LabType::Beginner {
            return Err(Error::Validation(format!(
                "cannot add exercises to beginner lab {}",
                lab.tag()
            )));
        }
        let configs = self.inner.resolve_exercises(&req.exercise_tags).await?;

        let result = lab.add_and_start_exercises(configs).await;
        // Added exercises stay even if some failed to start
        self.inner.persist().await;
        result.map(|()| StatusResponse::ok())
    }

    /// Start one exercise of a lab
    pub async fn start_exercise_in_lab(&self, req: ExerciseRequest) -> Result<StatusResponse> {
        let lab = self.lab(&req.lab_tag).await?;
        let result = lab.start_exercise(&req.exercise_tag).await;
        self.finish_exercise_op(result).await
    }

    /// Stop one exercise of a lab
    pub async fn stop_exercise_in_lab(&self, req: ExerciseRequest) -> Result<StatusResponse> {
        let lab = self.lab(&req.lab_tag).await?;
        let result = lab.stop_exercise(&req.exercise_tag).await;
        self.finish_exercise_op(result).await
    }

    /// Recreate one exercise of a lab
    pub async fn reset_exercise_in_lab(&self, req: ExerciseRequest) -> Result<StatusResponse> {
        let lab = self.lab(&req.lab_tag).await?;
        let result = lab.reset_exercise(&req.exercise_tag).await;
        self.finish_exercise_op(result).await
    }

    /// Begin closing an environment and queue its teardown
    pub async fn close_environment(&self, event_tag: &str) -> Result<StatusResponse> {
        let env = self
            .inner
            .registry
            .lookup(event_tag)
            .ok_or_else(|| Error::not_found("environment", event_tag))?;

        if env.begin_close().await {
            self.inner
                .teardown
                .add_task_or_detach(tasks::close_environment(self.inner.clone(), env));
        } else {
            debug!("Environment {} is already closing", event_tag);
        }
        Ok(StatusResponse::accepted())
    }

    /// Summaries of every environment
    pub async fn list_environments(&self) -> Vec<EnvironmentSummary> {
        let mut summaries = Vec::new();
        for env in self.inner.registry.list() {
            summaries.push(EnvironmentSummary {
                tag: env.tag().to_string(),
                status: env.status(),
                lab_count: env.lab_count().await,
                vpn_address: env.config().vpn_address,
            });
        }
        summaries
    }

    /// Rebuild the registry from the stored snapshot
    ///
    /// Environments come back running with fresh worker pools; those that
    /// were closing when saved are closed again. Returns the number of
    /// restored environments.
    pub async fn restore(&self) -> Result<usize> {
        let Some(snapshot) = self.inner.collab.store.load().await? else {
            info!("No registry snapshot to restore");
            return Ok(0);
        };

        let mut restored = 0;
        for env_snapshot in snapshot.environments {
            let tag = env_snapshot.config.tag.clone();
            let status = env_snapshot.status;
            if status == EnvironmentStatus::Closed {
                continue;
            }

            let vpn_address = env_snapshot.config.vpn_address;
            if let Err(e) = self.inner.vpn_pool.reserve(vpn_address) {
                warn!("Skipping environment {} from snapshot: {}", tag, e);
                continue;
            }

            let env = match self.rebuild_environment(env_snapshot).await {
                Ok(env) => env,
                Err(e) => {
                    warn!("Skipping environment {} from snapshot: {}", tag, e);
                    self.inner.vpn_pool.release(vpn_address);
                    continue;
                }
            };
            info!("Restored environment {} with {} labs", tag, env.lab_count().await);
            restored += 1;

            if status == EnvironmentStatus::Closing {
                self.close_environment(&tag).await?;
            }
        }

        Ok(restored)
    }

    /// Stop accepting work and wait for queued jobs to finish
    pub async fn shutdown(&self) {
        info!("Shutting down agent");
        for env in self.inner.registry.list() {
            env.pool().shutdown().await;
        }
        self.inner.teardown.shutdown().await;
        self.inner.persist().await;
    }

    async fn rebuild_environment(&self, snapshot: EnvironmentSnapshot) -> Result<Arc<Environment>> {
        let env = Arc::new(Environment::new(
            snapshot.config,
            self.inner.config.workers_per_environment,
            self.inner.config.task_queue_capacity,
        ));
        env.advance(EnvironmentStatus::Running);

        {
            let mut state = env.lock().await;
            for (owner, ips) in &snapshot.clients {
                state.clients.allocate_specific(owner, ips)?;
            }
            state.rules = snapshot.rules;
        }
        for lab in snapshot.labs {
            let lab = Lab::from_snapshot(
                lab,
                self.inner.collab.provisioner.clone(),
                self.inner.collab.dns.clone(),
            );
            env.register_lab(Arc::new(lab)).await?;
        }

        self.inner.registry.insert(env.clone())?;
        Ok(env)
    }

    async fn lab(&self, lab_tag: &str) -> Result<Arc<Lab>> {
        let (_, lab) = self.inner.registry.get_lab_by_tag(lab_tag).await?;
        Ok(lab)
    }

    async fn finish_exercise_op(&self, result: Result<()>) -> Result<StatusResponse> {
        if !matches!(result, Err(Error::NotFound { .. })) {
            self.inner.persist().await;
        }
        result.map(|()| StatusResponse::ok())
    }
}
