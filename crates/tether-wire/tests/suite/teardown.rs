use std::collections::HashMap;
use std::time::Duration;

use tether_wire::mock::{MockAgent, MockAgentConfig};
use tether_wire::protocol::Opcode;
use tether_wire::{AgentError, StepKind};

use super::{connect, wait_until, WAIT};

fn slow(opcode: Opcode) -> MockAgentConfig {
    MockAgentConfig {
        reply_delays: HashMap::from([(opcode, Duration::from_secs(30))]),
        ..Default::default()
    }
}

#[tokio::test]
async fn agent_disconnect_fails_pending_and_later_requests() {
    let agent = MockAgent::spawn_with_config(slow(Opcode::ThreadInfo))
        .await
        .unwrap();
    let client = connect(&agent).await;

    let info = client.thread_info(1);
    let queued = client.list_thread_ids();
    wait_until(|| !agent.requests().is_empty()).await;
    agent.disconnect();

    assert_eq!(info.await.unwrap_err(), AgentError::ConnectionClosed);
    assert_eq!(queued.await.unwrap_err(), AgentError::ConnectionClosed);
    tokio::time::timeout(WAIT, client.shutdown_token().cancelled())
        .await
        .unwrap();
    assert!(client.is_closed());
    assert_eq!(
        client.list_thread_ids().await.unwrap_err(),
        AgentError::ConnectionClosed
    );
}

#[tokio::test]
async fn invalid_length_prefix_is_fatal() {
    let agent = MockAgent::spawn_with_config(slow(Opcode::ThreadInfo))
        .await
        .unwrap();
    let client = connect(&agent).await;

    let info = client.thread_info(1);
    wait_until(|| !agent.requests().is_empty()).await;
    let mut bogus = agent.byte_order().u32_bytes(4).to_vec();
    bogus.extend_from_slice(&[0; 12]);
    assert!(agent.send_raw(bogus));

    assert!(matches!(info.await.unwrap_err(), AgentError::Protocol(_)));
    assert!(client.is_closed());
}

#[tokio::test]
async fn unknown_reply_kind_is_fatal() {
    let agent = MockAgent::spawn_with_config(slow(Opcode::ThreadInfo))
        .await
        .unwrap();
    let client = connect(&agent).await;

    let info = client.thread_info(1);
    wait_until(|| !agent.requests().is_empty()).await;
    let order = agent.byte_order();
    let mut frame = Vec::new();
    for word in [16, 9, 0, 0] {
        frame.extend_from_slice(&order.u32_bytes(word));
    }
    assert!(agent.send_raw(frame));

    assert!(matches!(info.await.unwrap_err(), AgentError::Protocol(_)));
}

#[tokio::test]
async fn pending_step_fails_when_the_connection_drops() {
    let agent = MockAgent::spawn_with_config(slow(Opcode::Step))
        .await
        .unwrap();
    let client = connect(&agent).await;

    let step = client.step(1, StepKind::Over, 1);
    wait_until(|| !agent.requests().is_empty()).await;
    agent.disconnect();

    assert!(step.await.unwrap_err().is_fatal());
}

#[tokio::test]
async fn local_shutdown_rejects_queued_requests() {
    let agent = MockAgent::spawn_with_config(slow(Opcode::ThreadInfo))
        .await
        .unwrap();
    let client = connect(&agent).await;

    let info = client.thread_info(1);
    let ids = client.list_thread_ids();
    client.shutdown();

    assert_eq!(info.await.unwrap_err(), AgentError::ConnectionClosed);
    assert_eq!(ids.await.unwrap_err(), AgentError::ConnectionClosed);
}
