//! Common helpers for agent integration tests

#![allow(dead_code)]

use async_channel::Receiver;
use lab_orchestration::testing::{Fakes, next_event, sample_agent_config};
use lab_orchestration::{
    AgentService, Collaborators, CreateEnvironmentRequest, CreateLabRequest, LabDescriptor,
    LabEvent, LabType,
};

/// Exercises every test catalog serves
pub const CATALOG: &[&str] = &["web", "sqli", "xss"];

/// An agent wired to fresh fakes
pub struct TestAgent {
    /// Service under test
    pub agent: AgentService,
    /// Fakes behind the agent
    pub fakes: Fakes,
    /// Lab stream subscription
    pub events: Receiver<LabEvent>,
}

impl TestAgent {
    /// Agent with the default test configuration
    pub fn new() -> Self {
        let fakes = Fakes::new(CATALOG);
        let collab = fakes.collaborators();
        Self::with_collaborators(fakes, collab)
    }

    /// Agent using `collab`, which may replace some of the fakes
    pub fn with_collaborators(fakes: Fakes, collab: Collaborators) -> Self {
        let agent =
            AgentService::new(sample_agent_config(), collab).expect("Failed to create agent");
        let events = agent.lab_stream();
        Self {
            agent,
            fakes,
            events,
        }
    }

    /// Next lab stream event
    pub async fn next_event(&self) -> LabEvent {
        next_event(&self.events)
            .await
            .expect("No lab event arrived")
    }

    /// Create an environment and wait until it is running
    pub async fn start_environment(&self, request: CreateEnvironmentRequest) {
        let tag = request.event_tag.clone();
        self.agent
            .create_environment(request)
            .await
            .expect("Failed to create environment");

        match self.next_event().await {
            LabEvent::EnvironmentReady { event_tag } => assert_eq!(event_tag, tag),
            other => panic!("Expected environment ready, got {:?}", other),
        }
    }

    /// Create a lab and wait until it is ready
    pub async fn start_lab(&self, event_tag: &str, is_vpn: bool) -> LabDescriptor {
        self.agent
            .create_lab_for_env(CreateLabRequest {
                event_tag: event_tag.to_string(),
                is_vpn,
            })
            .await
            .expect("Failed to queue lab creation");

        match self.next_event().await {
            LabEvent::LabReady(descriptor) => descriptor,
            other => panic!("Expected lab ready, got {:?}", other),
        }
    }
}

/// Environment request for `exercises` with `team_size` clients per lab
pub fn env_request(
    event_tag: &str,
    lab_type: LabType,
    exercises: &[&str],
    team_size: Option<u8>,
) -> CreateEnvironmentRequest {
    CreateEnvironmentRequest {
        event_tag: event_tag.to_string(),
        lab_type,
        exercise_tags: exercises.iter().map(|tag| tag.to_string()).collect(),
        frontends: Vec::new(),
        vpn_port: None,
        team_size,
    }
}
