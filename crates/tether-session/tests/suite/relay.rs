use std::collections::HashMap;

use serde_json::json;
use tether_session::{Command, RelayLink, RelayServer, Session, SessionError};
use tether_wire::mock::{MockAgent, MockAgentConfig, MockEval, MockEvent};
use tether_wire::protocol::Opcode;
use tether_wire::{BreakpointEvent, ThreadEvent, ThreadEventKind};
use tokio::net::{TcpListener, TcpStream};

use super::{collect, direct_session, next};

/// A relay session in front of a direct one, over an in-memory link.
async fn relayed(agent: &MockAgent) -> (Session, Session) {
    let direct = direct_session(agent).await;
    let (near, far) = RelayLink::pair();
    let server = RelayServer::new(direct.clone());
    tokio::spawn(async move { server.serve(far).await });
    (Session::relay(near), direct)
}

#[tokio::test]
async fn relayed_commands_return_the_same_fields() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        evaluations: HashMap::from([("len(items)".to_string(), vec![MockEval::Value("4".into())])]),
        ..Default::default()
    })
    .await
    .unwrap();
    let (session, _direct) = relayed(&agent).await;

    let ids = session.send_message(Command::ListThreadIds, vec![]).await.unwrap();
    assert_eq!(ids["threadIds"], json!([1]));

    let value = session
        .send("evaluate", vec![json!(1), json!(0), json!("len(items)")])
        .await
        .unwrap();
    assert_eq!(value["value"], json!("4"));
    assert!(!value.contains_key("requestId"));
}

#[tokio::test]
async fn relayed_failures_arrive_as_error_strings() {
    let agent = MockAgent::spawn().await.unwrap();
    let (session, _direct) = relayed(&agent).await;

    let err = session.send("getSourceFile", vec![json!("main")]).await.unwrap_err();
    assert!(
        matches!(&err, SessionError::Relay(message) if message == "agent error 8: source not available"),
        "{err}"
    );

    let err = session.send("getFrameLocals", vec![json!(1)]).await.unwrap_err();
    assert!(
        matches!(&err, SessionError::Relay(message) if message.contains("missing `frameLevel`")),
        "{err}"
    );

    // The relay stays usable after request-scoped failures.
    let ids = session.send("listThreadIds", vec![]).await.unwrap();
    assert_eq!(ids["threadIds"], json!([1]));
}

#[tokio::test]
async fn events_are_forwarded_out_of_band() {
    let agent = MockAgent::spawn().await.unwrap();
    let (session, _direct) = relayed(&agent).await;
    let mut hits = collect(session.breakpoint_events());
    let mut threads = collect(session.thread_events());

    let set = session.send("setBreakpoint", vec![json!("main")]).await.unwrap();
    let breakpoint_id = set["breakpoint"]["id"].as_u64().unwrap() as u32;

    assert!(agent.emit(MockEvent::ThreadStarted(5)));
    assert!(agent.emit(MockEvent::BreakpointHit {
        breakpoint_id,
        thread_id: 1,
    }));

    assert_eq!(
        next(&mut threads).await,
        ThreadEvent {
            kind: ThreadEventKind::Started,
            thread_id: 5,
        }
    );
    assert_eq!(
        next(&mut hits).await,
        BreakpointEvent {
            breakpoint_id,
            thread_id: 1,
        }
    );
}

#[tokio::test]
async fn requests_reach_the_agent_in_relay_order() {
    let agent = MockAgent::spawn().await.unwrap();
    let (session, _direct) = relayed(&agent).await;

    let first = session.send("suspendThread", vec![json!(1)]);
    let second = session.send("getThreadStack", vec![json!(1)]);
    let third = session.send("resumeThread", vec![json!(1)]);
    let (a, b, c) = tokio::join!(first, second, third);
    a.unwrap();
    assert_eq!(b.unwrap()["frames"], json!([]));
    c.unwrap();

    assert_eq!(
        agent.opcodes(),
        vec![Opcode::SuspendThread, Opcode::ThreadStack, Opcode::ResumeThread]
    );
}

#[tokio::test]
async fn relay_over_tcp_uses_line_delimited_json() {
    let agent = MockAgent::spawn().await.unwrap();
    let direct = direct_session(&agent).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::new(direct);
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        server.serve(RelayLink::from_stream(stream)).await
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let session = Session::relay(RelayLink::from_stream(stream));
    let info = session.send("getThreadInfo", vec![json!(1)]).await.unwrap();
    assert_eq!(info["thread"]["name"], json!("main"));
}

#[tokio::test]
async fn agent_disconnect_closes_the_relay() {
    let agent = MockAgent::spawn().await.unwrap();
    let (session, direct) = relayed(&agent).await;
    session.send("listThreadIds", vec![]).await.unwrap();

    agent.disconnect();
    direct.closed_token().cancelled().await;
    tokio::time::timeout(super::WAIT, session.closed_token().cancelled())
        .await
        .expect("relay should close once the agent is gone");

    let err = session.send("listThreadIds", vec![]).await.unwrap_err();
    assert!(matches!(err, SessionError::RelayClosed));
    assert!(err.is_fatal());
}
