//! Closing environments while labs are still being provisioned

use lab_orchestration::testing::wait_until;
use lab_orchestration::{CreateLabRequest, ErrorKind, LabEvent, LabType};
use std::time::Duration;

mod common;
use common::{TestAgent, env_request};

#[smol_potat::test]
async fn test_close_during_provisioning_leaves_nothing_running() {
    let t = TestAgent::new();
    t.start_environment(env_request("spring", LabType::Standard, &["web", "sqli"], None))
        .await;
    t.fakes
        .provisioner
        .set_start_delay(Duration::from_millis(300));

    // Two workers: two labs block in start, the third waits in the queue
    for _ in 0..3 {
        t.agent
            .create_lab_for_env(CreateLabRequest {
                event_tag: "spring".to_string(),
                is_vpn: false,
            })
            .await
            .expect("Failed to queue lab creation");
    }
    smol::Timer::after(Duration::from_millis(50)).await;

    t.agent
        .close_environment("spring")
        .await
        .expect("Failed to close environment");

    for _ in 0..3 {
        match t.next_event().await {
            LabEvent::LabFailed { event_tag, .. } => assert_eq!(event_tag, "spring"),
            other => panic!("Expected lab failure, got {:?}", other),
        }
    }

    assert!(wait_until(|| t.agent.registry().is_empty()).await);
    assert_eq!(t.fakes.provisioner.live_labs(), 0);
    assert_eq!(t.fakes.provisioner.live_instances(), 0);
    assert_eq!(t.agent.vpn_pool().held_count(), 0);
}

#[smol_potat::test]
async fn test_lab_started_after_close_is_torn_down_unregistered() {
    let t = TestAgent::new();
    t.start_environment(env_request("spring", LabType::Standard, &["web", "sqli"], Some(2)))
        .await;
    // Starts run to completion even though close cancels them
    t.fakes.provisioner.set_ignore_cancel(true);
    t.fakes
        .provisioner
        .set_start_delay(Duration::from_millis(300));

    for is_vpn in [true, false] {
        t.agent
            .create_lab_for_env(CreateLabRequest {
                event_tag: "spring".to_string(),
                is_vpn,
            })
            .await
            .expect("Failed to queue lab creation");
    }
    smol::Timer::after(Duration::from_millis(50)).await;

    t.agent
        .close_environment("spring")
        .await
        .expect("Failed to close environment");

    for _ in 0..2 {
        match t.next_event().await {
            LabEvent::LabFailed { event_tag, .. } => assert_eq!(event_tag, "spring"),
            other => panic!("Expected lab failure, got {:?}", other),
        }
    }

    // Both labs were fully started before being discarded
    assert_eq!(t.fakes.provisioner.started_exercises(), 4);
    assert!(wait_until(|| t.agent.registry().is_empty()).await);
    assert_eq!(t.fakes.provisioner.live_labs(), 0);
    assert_eq!(t.fakes.provisioner.live_instances(), 0);
    assert_eq!(t.fakes.firewall.active_rules(), 0);
    assert_eq!(t.fakes.vpn.peers(), 0);
    assert!(
        t.fakes
            .store
            .last()
            .is_none_or(|snapshot| snapshot.lab_tags().is_empty())
    );
}

#[smol_potat::test]
async fn test_close_tears_down_registered_labs() {
    let t = TestAgent::new();
    t.start_environment(env_request("spring", LabType::Standard, &["web"], Some(2)))
        .await;
    t.start_lab("spring", true).await;
    t.start_lab("spring", false).await;
    assert_eq!(t.fakes.provisioner.live_labs(), 2);

    t.agent
        .close_environment("spring")
        .await
        .expect("Failed to close environment");

    assert!(wait_until(|| t.agent.registry().is_empty()).await);
    assert_eq!(t.fakes.provisioner.live_labs(), 0);
    assert_eq!(t.fakes.provisioner.live_instances(), 0);
    assert_eq!(t.fakes.firewall.active_rules(), 0);
    assert_eq!(t.fakes.vpn.peers(), 0);
}

#[smol_potat::test]
async fn test_close_is_idempotent_and_blocks_new_labs() {
    let t = TestAgent::new();
    t.start_environment(env_request("spring", LabType::Standard, &["web"], None))
        .await;
    t.fakes
        .provisioner
        .set_start_delay(Duration::from_millis(200));
    t.agent
        .create_lab_for_env(CreateLabRequest {
            event_tag: "spring".to_string(),
            is_vpn: false,
        })
        .await
        .expect("Failed to queue lab creation");

    t.agent.close_environment("spring").await.expect("first close");
    t.agent.close_environment("spring").await.expect("second close");

    let late = t
        .agent
        .create_lab_for_env(CreateLabRequest {
            event_tag: "spring".to_string(),
            is_vpn: false,
        })
        .await;
    assert_eq!(late.unwrap_err().kind(), ErrorKind::NotFound);

    assert!(wait_until(|| t.agent.registry().is_empty()).await);
    assert_eq!(
        t.agent.close_environment("spring").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(t.fakes.provisioner.live_labs(), 0);
}
