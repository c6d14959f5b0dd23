use std::collections::HashMap;
use std::time::Duration;

use tether_wire::mock::{MockAgent, MockAgentConfig, MockEval, MockEvent};
use tether_wire::protocol::Opcode;
use tether_wire::{
    AgentClient, AgentError, BreakpointEvent, BreakpointKind, ThreadEvent, ThreadEventKind,
};
use tokio::sync::mpsc;

use super::{collect, connect, next, wait_until};

const HIT: MockEvent = MockEvent::BreakpointHit {
    breakpoint_id: 1,
    thread_id: 1,
};

fn evaluations(results: &[MockEval]) -> HashMap<String, Vec<MockEval>> {
    HashMap::from([("request.retries > 2".to_string(), results.to_vec())])
}

#[tokio::test]
async fn breakpoint_lifecycle_tracks_agent_confirmed_state() {
    let agent = MockAgent::spawn().await.unwrap();
    let client = connect(&agent).await;

    let line = client
        .set_breakpoint("handle_request", Some(12), Some("app/views.py"))
        .await
        .unwrap();
    assert_eq!(line.kind, BreakpointKind::Line);
    assert_eq!(line.file.as_deref(), Some("app/views.py"));
    assert!(line.enabled);

    let entry = client.set_breakpoint("main", None, None).await.unwrap();
    assert_eq!(entry.kind, BreakpointKind::MethodEntry);
    assert_ne!(entry.id, line.id);

    client.disable_breakpoint(line.id).await.unwrap();
    client.delete_breakpoint(entry.id).await.unwrap();

    let table = client.breakpoints();
    assert_eq!(table.len(), 1);
    assert_eq!(table[0].id, line.id);
    assert!(!table[0].enabled);

    let request = &agent.requests()[0];
    assert_eq!(request.opcode, Opcode::SetBreakpoint);
    assert_eq!(request.b, 12);
    assert_eq!(
        request.string_arg(agent.byte_order()).as_deref(),
        Some("handle_request")
    );
}

#[tokio::test]
async fn breakpoint_set_with_a_dropped_future_can_still_be_deleted() {
    let agent = MockAgent::spawn().await.unwrap();
    let client = connect(&agent).await;

    drop(client.set_breakpoint("main", Some(3), None));
    wait_until(|| client.breakpoints().len() == 1).await;
    let id = client.breakpoints()[0].id;

    drop(client.disable_breakpoint(id));
    wait_until(|| !client.breakpoints()[0].enabled).await;

    client.delete_breakpoint(id).await.unwrap();
    assert!(client.breakpoints().is_empty());
    assert_eq!(
        agent.opcodes(),
        vec![
            Opcode::SetBreakpoint,
            Opcode::DisableBreakpoint,
            Opcode::DeleteBreakpoint,
        ]
    );
}

#[tokio::test]
async fn unknown_breakpoint_ids_are_rejected_locally() {
    let agent = MockAgent::spawn().await.unwrap();
    let client = connect(&agent).await;

    assert_eq!(
        client.enable_breakpoint(9).await.unwrap_err(),
        AgentError::UnknownBreakpoint(9)
    );
    assert_eq!(
        client.set_breakpoint_condition(9, "x", "True").unwrap_err(),
        AgentError::UnknownBreakpoint(9)
    );
    assert!(agent.requests().is_empty());
}

#[tokio::test]
async fn unconditional_hits_are_published_without_evaluation() {
    let agent = MockAgent::spawn().await.unwrap();
    let client = connect(&agent).await;
    let mut hits = collect(client.breakpoint_events());

    let bp = client.set_breakpoint("main", Some(3), None).await.unwrap();
    // A condition that is not switched on is ignored.
    client
        .set_breakpoint_condition(bp.id, "request.retries > 2", "True")
        .unwrap();
    assert!(agent.emit(HIT));

    assert_eq!(
        next(&mut hits).await,
        BreakpointEvent {
            breakpoint_id: bp.id,
            thread_id: 1,
        }
    );
    assert_eq!(agent.opcodes(), vec![Opcode::SetBreakpoint]);
}

#[tokio::test]
async fn unmet_condition_resumes_until_the_condition_holds() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        evaluations: evaluations(&[
            MockEval::Value("False".to_string()),
            MockEval::Value("True".to_string()),
        ]),
        hit_after_resume: Some((HIT, 1)),
        ..Default::default()
    })
    .await
    .unwrap();
    let client = connect(&agent).await;
    let mut hits = collect(client.breakpoint_events());

    let bp = client.set_breakpoint("retry", Some(40), None).await.unwrap();
    client
        .set_breakpoint_condition(bp.id, "request.retries > 2", "True")
        .unwrap();
    client.set_breakpoint_conditional(bp.id, true).unwrap();
    assert!(agent.emit(HIT));

    assert_eq!(next(&mut hits).await.breakpoint_id, bp.id);
    assert_eq!(
        agent.opcodes(),
        vec![
            Opcode::SetBreakpoint,
            Opcode::Evaluate,
            Opcode::ResumeThread,
            Opcode::Evaluate,
        ]
    );
    let evaluate = &agent.requests()[1];
    assert_eq!((evaluate.b, evaluate.c), (1, 0));

    // Exactly one surfaced hit.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(hits.try_recv().is_err());
}

#[tokio::test]
async fn condition_evaluation_runs_ahead_of_queued_application_requests() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        evaluations: evaluations(&[MockEval::Value("False".to_string())]),
        event_before_reply: vec![(Opcode::ListThreads, HIT)],
        ..Default::default()
    })
    .await
    .unwrap();
    let client = connect(&agent).await;
    let mut hits = collect(client.breakpoint_events());

    let bp = client.set_breakpoint("retry", Some(40), None).await.unwrap();
    client
        .set_breakpoint_condition(bp.id, "request.retries > 2", "True")
        .unwrap();
    client.set_breakpoint_conditional(bp.id, true).unwrap();

    let ids = client.list_thread_ids();
    let info = client.thread_info(1);
    assert_eq!(ids.await.unwrap(), vec![1]);
    assert_eq!(info.await.unwrap().name, "main");

    assert_eq!(
        agent.opcodes(),
        vec![
            Opcode::SetBreakpoint,
            Opcode::ListThreads,
            Opcode::Evaluate,
            Opcode::ResumeThread,
            Opcode::ThreadInfo,
        ]
    );
    assert!(hits.try_recv().is_err());
}

#[tokio::test]
async fn failing_condition_is_reported_as_a_stop() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        evaluations: evaluations(&[MockEval::Error(6)]),
        ..Default::default()
    })
    .await
    .unwrap();
    let client = connect(&agent).await;
    let mut hits = collect(client.breakpoint_events());

    let bp = client.set_breakpoint("retry", Some(40), None).await.unwrap();
    client
        .set_breakpoint_condition(bp.id, "request.retries > 2", "True")
        .unwrap();
    client.set_breakpoint_conditional(bp.id, true).unwrap();
    assert!(agent.emit(HIT));

    assert_eq!(next(&mut hits).await.breakpoint_id, bp.id);
    assert_eq!(
        agent.opcodes(),
        vec![Opcode::SetBreakpoint, Opcode::Evaluate]
    );
    // The queue lock was released once the hit was decided.
    assert_eq!(client.list_thread_ids().await.unwrap(), vec![1]);
}

#[derive(Debug, PartialEq)]
enum Seen {
    Hit(BreakpointEvent),
    Thread(ThreadEvent),
}

/// Record breakpoint and thread events on one channel, in delivery order.
fn collect_all(client: &AgentClient) -> mpsc::UnboundedReceiver<Seen> {
    let (tx, rx) = mpsc::unbounded_channel();
    let hits = tx.clone();
    client
        .breakpoint_events()
        .subscribe(move |event: &BreakpointEvent| {
            let _ = hits.send(Seen::Hit(*event));
        });
    client.thread_events().subscribe(move |event: &ThreadEvent| {
        let _ = tx.send(Seen::Thread(*event));
    });
    rx
}

const THREAD_ENDED: ThreadEvent = ThreadEvent {
    kind: ThreadEventKind::Ended,
    thread_id: 2,
};

#[tokio::test]
async fn hits_and_thread_events_keep_agent_order() {
    let agent = MockAgent::spawn().await.unwrap();
    let client = connect(&agent).await;
    let mut seen = collect_all(&client);

    let bp = client.set_breakpoint("main", Some(3), None).await.unwrap();
    assert!(agent.emit_all(&[HIT, MockEvent::ThreadEnded(2)]));

    assert_eq!(
        next(&mut seen).await,
        Seen::Hit(BreakpointEvent {
            breakpoint_id: bp.id,
            thread_id: 1,
        })
    );
    assert_eq!(next(&mut seen).await, Seen::Thread(THREAD_ENDED));
}

#[tokio::test]
async fn thread_events_wait_behind_a_condition_being_evaluated() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        evaluations: evaluations(&[MockEval::Value("True".to_string())]),
        reply_delays: HashMap::from([(Opcode::Evaluate, Duration::from_millis(50))]),
        ..Default::default()
    })
    .await
    .unwrap();
    let client = connect(&agent).await;
    let mut seen = collect_all(&client);

    let bp = client.set_breakpoint("retry", Some(40), None).await.unwrap();
    client
        .set_breakpoint_condition(bp.id, "request.retries > 2", "True")
        .unwrap();
    client.set_breakpoint_conditional(bp.id, true).unwrap();
    assert!(agent.emit_all(&[HIT, MockEvent::ThreadEnded(2)]));

    assert_eq!(
        next(&mut seen).await,
        Seen::Hit(BreakpointEvent {
            breakpoint_id: bp.id,
            thread_id: 1,
        })
    );
    assert_eq!(next(&mut seen).await, Seen::Thread(THREAD_ENDED));
}
