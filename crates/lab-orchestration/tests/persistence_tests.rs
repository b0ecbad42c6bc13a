//! Registry snapshots: saving after mutations and restoring on startup

use lab_orchestration::testing::{Fakes, wait_until};
use lab_orchestration::{
    Collaborators, ErrorKind, LabType, StateBackend, StateStore, open_store,
};
use std::sync::Arc;

mod common;
use common::{CATALOG, TestAgent, env_request};

async fn round_trip(backend: StateBackend) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store: Arc<dyn StateStore> = open_store(backend, dir.path())
        .await
        .expect("Failed to open store");

    let fakes = Fakes::new(CATALOG);
    let collab = Collaborators {
        store: store.clone(),
        ..fakes.collaborators()
    };
    let first = TestAgent::with_collaborators(fakes, collab.clone());
    first
        .start_environment(env_request("spring", LabType::Standard, &["web", "sqli"], Some(2)))
        .await;
    let lab = first.start_lab("spring", true).await;

    let snapshot = store
        .load()
        .await
        .expect("Failed to load snapshot")
        .expect("No snapshot saved");
    assert_eq!(snapshot.event_tags(), vec!["spring"]);
    assert_eq!(snapshot.lab_tags(), vec![lab.tag.as_str()]);
    assert_eq!(
        snapshot.exercise_tags().get(lab.tag.as_str()),
        Some(&vec!["web", "sqli"])
    );

    // A restarted agent over the same store and infrastructure
    let second = TestAgent::with_collaborators(Fakes::new(CATALOG), collab);
    assert_eq!(second.agent.restore().await.expect("Failed to restore"), 1);

    let restored = second.agent.get_lab(&lab.tag).await.expect("Lab not restored");
    assert_eq!(restored.credentials, lab.credentials);
    assert_eq!(restored.subnet, lab.subnet);
    assert_eq!(restored.exercises, lab.exercises);
    assert_eq!(second.agent.vpn_pool().held_count(), 1);

    // Issued rules survive the restart
    let again = second.agent.create_vpn_conf_for_lab(&lab.tag).await;
    assert_eq!(again.unwrap_err().kind(), ErrorKind::Conflict);

    let duplicate = second
        .agent
        .create_environment(env_request("spring", LabType::Standard, &["web"], None))
        .await;
    assert_eq!(duplicate.unwrap_err().kind(), ErrorKind::Conflict);
}

#[smol_potat::test]
async fn test_round_trip_through_file_store() {
    round_trip(StateBackend::File).await;
}

#[smol_potat::test]
async fn test_round_trip_through_sled_store() {
    round_trip(StateBackend::Sled).await;
}

#[smol_potat::test]
async fn test_every_mutation_is_persisted() {
    let t = TestAgent::new();
    t.start_environment(env_request("spring", LabType::Standard, &["web"], None))
        .await;
    let lab = t.start_lab("spring", false).await;
    let saves = t.fakes.store.saves();

    t.agent.close_lab(&lab.tag).await.expect("Failed to close lab");
    assert!(wait_until(|| t.fakes.store.saves() > saves).await);
    assert!(wait_until(|| {
        t.fakes
            .store
            .last()
            .is_some_and(|snapshot| snapshot.lab_tags().is_empty())
    })
    .await);
}

#[smol_potat::test]
async fn test_persist_failure_does_not_fail_requests() {
    let t = TestAgent::new();
    t.fakes.store.set_failing(true);

    t.start_environment(env_request("spring", LabType::Standard, &["web"], None))
        .await;
    t.start_lab("spring", false).await;

    assert_eq!(t.fakes.store.saves(), 0);
    assert_eq!(t.agent.list_environments().await[0].lab_count, 1);
}

#[smol_potat::test]
async fn test_restore_recloses_closing_environment() {
    let t = TestAgent::new();
    t.start_environment(env_request("spring", LabType::Standard, &["web"], None))
        .await;
    t.start_lab("spring", false).await;

    let mut snapshot = t.fakes.store.last().expect("No snapshot saved");
    snapshot.environments[0].status = lab_orchestration::EnvironmentStatus::Closing;

    let fakes = Fakes::new(CATALOG);
    fakes.store.save(&snapshot).await.expect("Failed to seed store");
    let collab = Collaborators {
        provisioner: t.fakes.provisioner.clone(),
        ..fakes.collaborators()
    };
    let restarted = TestAgent::with_collaborators(fakes, collab);

    assert_eq!(restarted.agent.restore().await.expect("Failed to restore"), 1);
    assert!(wait_until(|| restarted.agent.registry().is_empty()).await);
    assert_eq!(t.fakes.provisioner.live_labs(), 0);
    assert_eq!(restarted.agent.vpn_pool().held_count(), 0);
}

#[smol_potat::test]
async fn test_restore_without_snapshot() {
    let t = TestAgent::new();
    assert_eq!(t.agent.restore().await.expect("Failed to restore"), 0);
    assert!(t.agent.registry().is_empty());
}
