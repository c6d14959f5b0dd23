use std::collections::HashMap;

use tether_wire::mock::{frame, MockAgent, MockAgentConfig, MockEvent, MockLocal, MockThread};
use tether_wire::protocol::Opcode;
use tether_wire::{
    AgentError, FrameLanguage, LocalValue, ThreadEvent, ThreadEventKind, ThreadFlags, ThreadState,
};

use super::{collect, connect, next};

fn worker() -> MockThread {
    MockThread {
        id: 2,
        name: "worker-2".to_string(),
        priority: 3,
        daemon: true,
        state: ThreadState::Parked,
        flags: ThreadFlags {
            suspended: true,
            interrupted: false,
            native: true,
        },
    }
}

#[tokio::test]
async fn thread_listing_and_info() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        threads: vec![MockThread::new(1, "main"), worker()],
        ..Default::default()
    })
    .await
    .unwrap();
    let client = connect(&agent).await;

    assert_eq!(client.list_thread_ids().await.unwrap(), vec![1, 2]);

    let info = client.thread_info(2).await.unwrap();
    assert_eq!(info.name, "worker-2");
    assert_eq!(info.priority, 3);
    assert!(info.is_daemon);
    assert_eq!(info.state, ThreadState::Parked);
    assert!(info.flags.suspended && info.flags.native && !info.flags.interrupted);
}

#[tokio::test]
async fn requests_reach_the_agent_in_call_order() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        source_files: HashMap::from([("main".to_string(), "/srv/app/main.py".to_string())]),
        ..Default::default()
    })
    .await
    .unwrap();
    let client = connect(&agent).await;

    let info = client.thread_info(1);
    let ids = client.list_thread_ids();
    let source = client.source_file("main");

    // Awaiting out of order does not change what was sent first.
    assert_eq!(source.await.unwrap(), "/srv/app/main.py");
    assert_eq!(ids.await.unwrap(), vec![1]);
    assert_eq!(info.await.unwrap().name, "main");
    assert_eq!(
        agent.opcodes(),
        vec![Opcode::ThreadInfo, Opcode::ListThreads, Opcode::SourceFile]
    );
}

#[tokio::test]
async fn agent_errors_only_fail_the_current_request() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        errors: HashMap::from([(Opcode::SuspendThread, 7)]),
        ..Default::default()
    })
    .await
    .unwrap();
    let client = connect(&agent).await;

    let suspend = client.suspend_thread(1);
    let ids = client.list_thread_ids();
    assert_eq!(
        suspend.await.unwrap_err(),
        AgentError::Agent {
            code: 7,
            message: "thread not alive".to_string(),
        }
    );
    assert_eq!(ids.await.unwrap(), vec![1]);
    assert!(!client.is_closed());

    let err = client.thread_info(42).await.unwrap_err();
    assert!(matches!(err, AgentError::Agent { code: 1, .. }), "{err:?}");
}

#[tokio::test]
async fn stack_frames_carry_level_offset_and_language() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        stacks: HashMap::from([(
            1,
            vec![vec![
                frame("handle_request", 42, FrameLanguage::Tracked),
                frame("PyEval_EvalFrame", 7, FrameLanguage::Host),
                frame("", 0, FrameLanguage::Other(9)),
            ]],
        )]),
        ..Default::default()
    })
    .await
    .unwrap();
    let client = connect(&agent).await;

    let frames = client.thread_stack(1).await.unwrap();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].name, "handle_request");
    assert_eq!(frames[0].offset, 42);
    assert_eq!(frames[0].language, FrameLanguage::Tracked);
    assert_eq!(frames[1].level, 1);
    assert_eq!(frames[2].language, FrameLanguage::Other(9));
    assert!(frames[2].is_synthetic());
}

#[tokio::test]
async fn locals_decode_every_value_kind_and_tolerate_unknown_tags() {
    let local = |name: &str, argument: bool, value: LocalValue| MockLocal {
        name: name.to_string(),
        argument,
        value,
    };
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        locals: vec![
            local("count", true, LocalValue::Int(-3)),
            local("ready", false, LocalValue::Bool(true)),
            local("ratio", false, LocalValue::Double(0.25)),
            local("scale", false, LocalValue::Float(1.5)),
            local("label", false, LocalValue::Str("hello".to_string())),
            local("opaque", false, LocalValue::Unknown { tag: 99 }),
            local("after", false, LocalValue::Int(7)),
        ],
        ..Default::default()
    })
    .await
    .unwrap();
    let client = connect(&agent).await;

    let locals = client.frame_locals(1, 0).await.unwrap();
    let values: Vec<_> = locals.iter().map(|l| l.value.clone()).collect();
    assert_eq!(
        values,
        vec![
            LocalValue::Int(-3),
            LocalValue::Bool(true),
            LocalValue::Double(0.25),
            LocalValue::Float(1.5),
            LocalValue::Str("hello".to_string()),
            LocalValue::Unknown { tag: 99 },
            LocalValue::Int(7),
        ]
    );
    assert!(locals[0].is_argument);
    assert!(!locals[1].is_argument);

    let requests = agent.requests();
    assert_eq!((requests[0].b, requests[0].c), (1, 0));
}

#[tokio::test]
async fn replies_split_into_tiny_writes_are_reassembled() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        write_chunk: Some(3),
        stacks: HashMap::from([(
            1,
            vec![vec![
                frame("outer", 1, FrameLanguage::Tracked),
                frame("inner", 2, FrameLanguage::Tracked),
            ]],
        )]),
        ..Default::default()
    })
    .await
    .unwrap();
    let client = connect(&agent).await;

    let names: Vec<_> = client
        .thread_stack(1)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.name)
        .collect();
    assert_eq!(names, vec!["outer", "inner"]);
    assert_eq!(client.list_thread_ids().await.unwrap(), vec![1]);
}

#[tokio::test]
async fn thread_events_reach_subscribers_in_order() {
    let agent = MockAgent::spawn().await.unwrap();
    let client = connect(&agent).await;
    let mut events = collect(client.thread_events());

    assert!(agent.emit(MockEvent::ThreadStarted(5)));
    assert!(agent.emit(MockEvent::Other {
        kind: 77,
        thread_id: 5
    }));
    assert!(agent.emit(MockEvent::ThreadEnded(5)));

    assert_eq!(
        next(&mut events).await,
        ThreadEvent {
            kind: ThreadEventKind::Started,
            thread_id: 5,
        }
    );
    assert_eq!(
        next(&mut events).await,
        ThreadEvent {
            kind: ThreadEventKind::Ended,
            thread_id: 5,
        }
    );
    // Unknown event kinds are ignored without harming the connection.
    assert_eq!(client.list_thread_ids().await.unwrap(), vec![1]);
}
