use std::time::Duration;

use tether_session::Session;
use tether_wire::mock::MockAgent;
use tether_wire::{AgentClient, Subscribers};
use tokio::sync::mpsc;

mod direct;
mod relay;

pub(crate) const WAIT: Duration = Duration::from_secs(5);

pub(crate) async fn direct_session(agent: &MockAgent) -> Session {
    let client = AgentClient::connect(agent.addr())
        .await
        .expect("connect to mock agent");
    Session::direct(client)
}

pub(crate) fn collect<T: Clone + Send + 'static>(
    subscribers: &Subscribers<T>,
) -> mpsc::UnboundedReceiver<T> {
    let (tx, rx) = mpsc::unbounded_channel();
    subscribers.subscribe(move |value: &T| {
        let _ = tx.send(value.clone());
    });
    rx
}

pub(crate) async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}
