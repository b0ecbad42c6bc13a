//! # Lab orchestration
//!
//! Environment and lab lifecycle engine of a cyber-range agent.
//!
//! An agent hosts one [`Environment`] per training event. Each environment
//! owns a VPN endpoint subnet, a worker pool and any number of [`Lab`]s, one
//! per team. A lab bundles infrastructure provisioned through an
//! [`InfrastructureProvisioner`] with the [`Exercise`]s the team solves, each
//! carrying freshly generated [`Flag`]s.
//!
//! [`AgentService`] is the request surface. Long-running work is queued on
//! worker pools and reported through the [`LabStream`]; every mutation is
//! persisted as a [`RegistrySnapshot`] so a restarted agent can
//! [`restore`](AgentService::restore) its registry.
//!
//! ## Example
//!
//! ```rust,no_run
//! use lab_orchestration::{
//!     AgentConfig, AgentService, Collaborators, CreateEnvironmentRequest, LabType,
//! };
//!
//! # async fn example(collab: Collaborators) -> lab_orchestration::Result<()> {
//! let agent = AgentService::new(AgentConfig::new("agent-01.range.example"), collab)?;
//! let events = agent.lab_stream();
//!
//! agent
//!     .create_environment(CreateEnvironmentRequest {
//!         event_tag: "spring_ctf".to_string(),
//!         lab_type: LabType::Standard,
//!         exercise_tags: vec!["sqli".to_string()],
//!         frontends: Vec::new(),
//!         vpn_port: None,
//!         team_size: Some(4),
//!     })
//!     .await?;
//!
//! let ready = events.recv().await;
//! # let _ = ready;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unsafe_code)]

mod agent;
mod api;
mod config;
mod environment;
mod error;
mod exercise;
mod flag;
mod infra;
mod lab;
mod registry;
mod snapshot;
pub mod store;
mod stream;
mod tasks;
mod worker;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use agent::AgentService;
pub use api::{
    AddExercisesRequest, CreateEnvironmentRequest, CreateLabRequest, EnvironmentSummary,
    ExerciseRequest, LabDescriptor, StatusResponse,
};
pub use config::{AgentConfig, MAX_TEAM_SIZE, StateBackend};
pub use environment::{
    EnvState, Environment, EnvironmentConfig, EnvironmentStatus, validate_event_tag,
};
pub use error::{Error, ErrorKind, Failures, Result};
pub use exercise::{
    BoundFlag, Challenge, ChildChallengeConfig, DnsRecord, EnvVarConfig, Exercise,
    ExerciseConfig, ExerciseInfo, ExerciseStatus, FlagValue, InstanceConfig, RecordConfig,
    validate_exercise_tag,
};
pub use flag::{ALPHABET, CORE_LEN, FLAG_LEN, FLAG_PREFIX, Flag};
pub use infra::{
    CancelHandle, CancelSignal, Collaborators, DnsService, ExerciseCatalog, ExerciseSpec,
    FrontendSpec, InfrastructureProvisioner, InstanceHandle, InstanceSpec, LabHandle, LabSpec,
    cancel_pair,
};
pub use lab::{Lab, LabCredentials, LabType};
pub use registry::EnvironmentRegistry;
pub use snapshot::{EnvironmentSnapshot, LabSnapshot, RegistrySnapshot, SNAPSHOT_VERSION};
pub use store::{StateStore, open_store};
pub use stream::{LabEvent, LabStream};
pub use worker::WorkerPool;
