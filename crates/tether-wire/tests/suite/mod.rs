use std::time::Duration;

use tether_wire::mock::MockAgent;
use tether_wire::{AgentClient, Subscribers};
use tokio::sync::mpsc;

mod breakpoints;
mod handshake;
mod requests;
mod teardown;

pub(crate) const WAIT: Duration = Duration::from_secs(5);

pub(crate) async fn connect(agent: &MockAgent) -> AgentClient {
    AgentClient::connect(agent.addr())
        .await
        .expect("connect to mock agent")
}

/// Forward everything published on `subscribers` into a channel.
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

/// Poll `cond` until it holds.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
