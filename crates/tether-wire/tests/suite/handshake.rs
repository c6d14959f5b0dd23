use std::time::Duration;

use tether_wire::mock::{MockAgent, MockAgentConfig, MockThread};
use tether_wire::{AgentClient, AgentClientConfig, AgentError, AgentInfo, ByteOrder};
use tokio::net::TcpListener;

use super::connect;

#[tokio::test]
async fn little_endian_agent_reports_version_and_decodes_replies() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        byte_order: ByteOrder::LittleEndian,
        version: 0x0003_0001,
        threads: vec![MockThread::new(1, "main"), MockThread::new(0x0102_0304, "io")],
        ..Default::default()
    })
    .await
    .unwrap();
    let client = connect(&agent).await;

    assert_eq!(
        client.agent_info(),
        Some(AgentInfo {
            byte_order: ByteOrder::LittleEndian,
            version: 0x0003_0001,
        })
    );
    assert_eq!(client.list_thread_ids().await.unwrap(), vec![1, 0x0102_0304]);
}

#[tokio::test]
async fn wrong_agent_identifier_fails_the_connection() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        handshake_identifier: Some(b"SOMETHING-ELSE!!".to_vec()),
        ..Default::default()
    })
    .await
    .unwrap();

    let err = AgentClient::connect(agent.addr()).await.err().unwrap();
    assert!(
        matches!(err, AgentError::HandshakeMismatch { ref received } if received.starts_with("SOMETHING")),
        "unexpected error: {err:?}"
    );
}

#[tokio::test]
async fn silent_agent_times_out_during_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _accept = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(socket);
    });

    let config = AgentClientConfig {
        handshake_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let err = AgentClient::connect_with_config(addr, config)
        .await
        .err()
        .unwrap();
    assert_eq!(err, AgentError::Timeout);
}

#[tokio::test]
async fn agent_closing_before_handshake_reports_connection_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);
    });

    let err = AgentClient::connect(addr).await.err().unwrap();
    assert!(err.is_fatal(), "unexpected error: {err:?}");
}
