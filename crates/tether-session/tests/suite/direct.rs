use std::collections::HashMap;

use serde_json::json;
use tether_session::{Command, SessionError};
use tether_wire::mock::{frame, MockAgent, MockAgentConfig, MockEvent};
use tether_wire::protocol::Opcode;
use tether_wire::{AgentError, BreakpointEvent, FrameLanguage};

use super::{collect, direct_session, next};

#[tokio::test]
async fn thread_queries_come_back_as_named_result_fields() {
    let agent = MockAgent::spawn().await.unwrap();
    let session = direct_session(&agent).await;

    let ids = session.send_message(Command::ListThreadIds, vec![]).await.unwrap();
    assert_eq!(ids["threadIds"], json!([1]));

    let info = session.send("getThreadInfo", vec![json!(1)]).await.unwrap();
    assert_eq!(info["thread"]["name"], json!("main"));
    assert_eq!(info["thread"]["isDaemon"], json!(false));

    let ack = session.send("suspendThread", vec![json!(1)]).await.unwrap();
    assert!(ack.is_empty());
}

#[tokio::test]
async fn bad_calls_never_reach_the_agent() {
    let agent = MockAgent::spawn().await.unwrap();
    let session = direct_session(&agent).await;

    let err = session.send("getThreadInfo", vec![]).await.unwrap_err();
    assert!(matches!(err, SessionError::BadArguments { command: "getThreadInfo", .. }));

    let err = session.send("frobnicate", vec![json!(1)]).await.unwrap_err();
    assert!(matches!(err, SessionError::UnknownCommand(name) if name == "frobnicate"));

    let err = session
        .send_message(Command::EnableBreakpoint, vec![json!(7)])
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Agent(AgentError::UnknownBreakpoint(7))));

    assert!(agent.requests().is_empty());
}

#[tokio::test]
async fn agent_errors_keep_their_code() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        source_files: HashMap::from([("main".to_string(), "app/main.py".to_string())]),
        ..Default::default()
    })
    .await
    .unwrap();
    let session = direct_session(&agent).await;

    let found = session.send("getSourceFile", vec![json!("main")]).await.unwrap();
    assert_eq!(found["path"], json!("app/main.py"));

    let err = session.send("getSourceFile", vec![json!("worker")]).await.unwrap_err();
    assert!(!err.is_fatal());
    assert!(matches!(err, SessionError::Agent(AgentError::Agent { code: 8, .. })));
    assert!(!session.is_closed());
}

#[tokio::test]
async fn breakpoint_conditions_are_managed_through_commands() {
    let agent = MockAgent::spawn().await.unwrap();
    let session = direct_session(&agent).await;
    let mut hits = collect(session.breakpoint_events());

    let set = session
        .send("setBreakpoint", vec![json!("handle"), json!(14), json!("app/views.py")])
        .await
        .unwrap();
    let id = set["breakpoint"]["id"].clone();
    assert_eq!(set["breakpoint"]["kind"], json!("line"));

    session
        .send("setBreakpointCondition", vec![id.clone(), json!("n"), json!("3")])
        .await
        .unwrap();
    session
        .send("setBreakpointConditionalEnabled", vec![id.clone(), json!(true)])
        .await
        .unwrap();

    let listed = session.send("getBreakpoints", vec![]).await.unwrap();
    let bp = &listed["breakpoints"][0];
    assert_eq!(bp["conditional"], json!(true));
    assert_eq!(bp["condition"], json!({ "expression": "n", "expected": "3" }));

    session
        .send("setBreakpointConditionalEnabled", vec![id.clone(), json!(false)])
        .await
        .unwrap();
    let breakpoint_id = id.as_u64().unwrap() as u32;
    assert!(agent.emit(MockEvent::BreakpointHit {
        breakpoint_id,
        thread_id: 1,
    }));
    assert_eq!(
        next(&mut hits).await,
        BreakpointEvent {
            breakpoint_id,
            thread_id: 1,
        }
    );
    assert!(!agent.opcodes().contains(&Opcode::Evaluate));
}

#[tokio::test]
async fn step_commands_cover_single_and_long_steps() {
    let start = frame("handle", 10, FrameLanguage::Tracked);
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        stacks: HashMap::from([(
            1,
            vec![
                vec![start.clone()],
                vec![start],
                vec![frame("handle", 12, FrameLanguage::Tracked)],
            ],
        )]),
        ..Default::default()
    })
    .await
    .unwrap();
    let session = direct_session(&agent).await;

    let single = session.send("step", vec![json!(1), json!("over"), json!(2)]).await.unwrap();
    assert!(single.is_empty());

    let long = session.send("step", vec![json!(1), json!("long-line")]).await.unwrap();
    assert_eq!(long["outcome"], json!("arrived"));
    assert_eq!(long["frame"]["offset"], json!(12));

    let err = session.send("step", vec![json!(1), json!("sideways")]).await.unwrap_err();
    assert!(matches!(err, SessionError::BadArguments { command: "step", .. }));
}
