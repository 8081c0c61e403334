#![allow(dead_code)]

use rs_workflow_stream::{
    ClientStats, Config, FeedState, WorkflowClient, WorkflowFeed,
    events::{ClientEvent, EventReceiver},
    reconnect::FixedJitter,
    transport::{
        StaticToken,
        memory::{self, MemoryPeer, MemoryServer},
    },
    types::ClientFrame,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

pub const WAIT: Duration = Duration::from_secs(60);

/// Memory-backed config: no heartbeats, no jitter, fast retries.
pub fn test_config() -> Config {
    let mut config = Config::for_url(Url::parse("ws://memory.test/ws/workflows").unwrap());
    config.websocket.heartbeat_interval = Duration::ZERO;
    config.reconnect.jitter = 0.0;
    config.reconnect.base_delay = Duration::from_millis(10);
    config.reconnect.max_delay = Duration::from_millis(100);
    config
}

pub fn client_with(config: Config) -> (WorkflowClient, MemoryServer) {
    let (connector, server) = memory::channel();
    let client = WorkflowClient::with_jitter(
        config,
        Arc::new(connector),
        Arc::new(StaticToken::anonymous()),
        Box::new(FixedJitter(0.0)),
    );
    (client, server)
}

pub fn client() -> (WorkflowClient, MemoryServer) {
    client_with(test_config())
}

pub fn event_json(run_id: &str, node_name: &str, phase: &str) -> Value {
    json!({
        "run_id": run_id,
        "timestamp": "2025-03-01T10:15:00Z",
        "node_name": node_name,
        "phase": phase,
        "metrics": {},
        "issues": [],
        "data": {}
    })
}

pub async fn accept(server: &mut MemoryServer) -> MemoryPeer {
    timeout(WAIT, server.accept())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

/// Reads intent frames until `count` have arrived.
pub async fn frames(peer: &mut MemoryPeer, count: usize) -> Vec<ClientFrame> {
    let mut frames = Vec::with_capacity(count);
    while frames.len() < count {
        let frame = timeout(WAIT, peer.next_frame())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client closed the connection");
        frames.push(frame);
    }
    frames
}

pub async fn wait_for_feed<F>(feed: &mut WorkflowFeed, condition: F) -> FeedState
where
    F: Fn(&FeedState) -> bool,
{
    timeout(WAIT, async {
        loop {
            let state = feed.state();
            if condition(&state) {
                return state;
            }
            assert!(feed.changed().await, "feed stopped changing");
        }
    })
    .await
    .expect("timed out waiting for feed state")
}

pub async fn wait_for_stats<F>(client: &WorkflowClient, condition: F) -> ClientStats
where
    F: Fn(&ClientStats) -> bool,
{
    let mut stats = client.watch_stats();
    let result = timeout(WAIT, stats.wait_for(|s| condition(s)))
        .await
        .expect("timed out waiting for stats");
    let snapshot = result.expect("client stopped").clone();
    snapshot
}

pub async fn wait_for_event<F>(lifecycle: &mut EventReceiver, condition: F) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = lifecycle.recv().await.expect("lifecycle closed");
            if condition(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for lifecycle event")
}

pub fn node_names(state: &FeedState) -> Vec<String> {
    state.events.iter().map(|e| e.node_name.clone()).collect()
}
