mod common;

use common::*;
use rs_workflow_stream::{
    ConnectionState, FeedOptions, get_instance, get_or_init, reset_instance, types::ClientFrame,
};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

// one test so the process-wide slot is never shared between concurrent tests
#[tokio::test]
async fn process_wide_instance_lifecycle() {
    assert!(get_instance().is_none());

    let servers = Arc::new(Mutex::new(Vec::new()));
    let builds = Arc::new(AtomicUsize::new(0));
    let init = || -> rs_workflow_stream::error::Result<_> {
        builds.fetch_add(1, Ordering::SeqCst);
        let (client, server) = client();
        servers.lock().unwrap().push(server);
        Ok(client)
    };

    let first = get_or_init(init).unwrap();
    let again = get_or_init(init).unwrap();
    assert_eq!(builds.load(Ordering::SeqCst), 1);

    // both handles drive the same connection
    let _a = first.subscribe("run-1", FeedOptions::default()).await.unwrap();
    let _b = again.subscribe("run-2", FeedOptions::default()).await.unwrap();
    assert_eq!(get_instance().unwrap().stats().subscription_count, 2);

    let mut server = servers.lock().unwrap().remove(0);
    let mut peer = accept(&mut server).await;
    let mut topics: Vec<String> = frames(&mut peer, 2)
        .await
        .iter()
        .map(|f| f.topic().to_string())
        .collect();
    topics.sort();
    assert_eq!(topics, vec!["run-1", "run-2"]);

    reset_instance().await;
    assert!(get_instance().is_none());
    assert!(first.is_shut_down());
    assert_eq!(first.stats().connection_state, ConnectionState::Closed);
    assert_eq!(first.stats().subscription_count, 0);
    let mut unsubscribed: Vec<ClientFrame> = frames(&mut peer, 2).await;
    unsubscribed.sort_by(|a, b| a.topic().cmp(b.topic()));
    assert_eq!(
        unsubscribed,
        vec![ClientFrame::unsubscribe("run-1"), ClientFrame::unsubscribe("run-2")]
    );

    // a fresh instance starts with no state
    let fresh = get_or_init(init).unwrap();
    assert_eq!(builds.load(Ordering::SeqCst), 2);
    assert!(!fresh.is_shut_down());
    assert_eq!(fresh.stats().subscription_count, 0);
    assert_eq!(fresh.stats().frames_received, 0);

    // a shut down instance is replaced on next use
    fresh.shutdown().await;
    let replacement = get_or_init(init).unwrap();
    assert_eq!(builds.load(Ordering::SeqCst), 3);
    assert!(!replacement.is_shut_down());

    reset_instance().await;
    reset_instance().await;
    assert!(get_instance().is_none());
}
