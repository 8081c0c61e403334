/// file: src/feed.rs
/// description: reactive per-topic view with loading/error state, bounded local history and RAII release
use crate::{
    buffer::EventBuffer,
    client::WorkflowClient,
    error::{ConnectionFailure, Result},
    registry::{EventCallback, ListenerId, TopicListener},
    types::{ConnectionState, Topic, WorkflowEvent},
};
use std::fmt;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::watch;
use tracing::debug;

/// Options recognised by [`WorkflowClient::subscribe`].
#[derive(Clone)]
pub struct FeedOptions {
    /// When false no subscription is made and the feed stays inert.
    pub enabled: bool,
    /// Bound on the feed's local history. Zero means the client's configured
    /// default (`--history`, 1000 unless changed).
    pub max_events: usize,
    /// Invoked once per event, in arrival order, on the client's task. Must
    /// not panic.
    pub on_event: Option<EventCallback>,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_events: 0,
            on_event: None,
        }
    }
}

impl fmt::Debug for FeedOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedOptions")
            .field("enabled", &self.enabled)
            .field("max_events", &self.max_events)
            .field("on_event", &self.on_event.is_some())
            .finish()
    }
}

impl FeedOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(&WorkflowEvent) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(callback));
        self
    }
}

/// What a consumer renders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedState {
    pub events: Vec<Arc<WorkflowEvent>>,
    pub is_loading: bool,
    pub error: Option<ConnectionFailure>,
}

struct FeedInner {
    events: EventBuffer,
    is_loading: bool,
    error: Option<ConnectionFailure>,
}

struct FeedListener {
    disposed: AtomicBool,
    inner: Mutex<FeedInner>,
    on_event: Option<EventCallback>,
    revision: watch::Sender<u64>,
}

impl FeedListener {
    fn new(max_events: usize, on_event: Option<EventCallback>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            disposed: AtomicBool::new(false),
            inner: Mutex::new(FeedInner {
                events: EventBuffer::new(max_events),
                is_loading: true,
                error: None,
            }),
            on_event,
            revision,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    fn snapshot(&self) -> FeedState {
        let inner = self.lock();
        FeedState {
            events: inner.events.snapshot(),
            is_loading: inner.is_loading,
            error: inner.error.clone(),
        }
    }

    fn clear(&self) {
        {
            let mut inner = self.lock();
            inner.events.clear();
            inner.error = None;
        }
        self.bump();
    }
}

impl TopicListener for FeedListener {
    fn on_event(&self, event: &Arc<WorkflowEvent>) {
        if self.is_disposed() {
            return;
        }
        self.lock().events.append(event.clone());
        self.bump();
        if let Some(callback) = &self.on_event {
            callback(event);
        }
    }

    fn on_attached(
        &self,
        history: &[Arc<WorkflowEvent>],
        state: ConnectionState,
        failure: Option<&ConnectionFailure>,
    ) {
        if self.is_disposed() {
            return;
        }
        {
            let mut inner = self.lock();
            inner.events.clear();
            inner.events.extend(history.iter().cloned());
            match state {
                ConnectionState::Open => inner.is_loading = false,
                ConnectionState::Failed => {
                    inner.is_loading = false;
                    inner.error = failure.cloned();
                }
                _ => inner.is_loading = true,
            }
        }
        self.bump();
    }

    fn on_connection_state(&self, state: ConnectionState, failure: Option<&ConnectionFailure>) {
        if self.is_disposed() {
            return;
        }
        {
            let mut inner = self.lock();
            match state {
                ConnectionState::Open => {
                    inner.is_loading = false;
                    inner.error = None;
                }
                ConnectionState::Failed => {
                    inner.is_loading = false;
                    inner.error = failure.cloned();
                }
                ConnectionState::Closed => inner.is_loading = false,
                ConnectionState::Connecting | ConnectionState::Reconnecting => return,
            }
        }
        self.bump();
    }
}

struct Attachment {
    id: ListenerId,
    listener: Arc<FeedListener>,
    changes: watch::Receiver<u64>,
}

/// A topic's events as observable state. Dropping the feed unsubscribes, and
/// no state changes once it is closed or dropped.
pub struct WorkflowFeed {
    client: WorkflowClient,
    topic: Topic,
    options: FeedOptions,
    attachment: Option<Attachment>,
}

impl WorkflowFeed {
    pub(crate) async fn open(client: WorkflowClient, topic: Topic, options: FeedOptions) -> Result<Self> {
        let mut feed = Self {
            client,
            topic,
            options,
            attachment: None,
        };
        if feed.options.enabled {
            feed.attachment = Some(feed.attach().await?);
        } else {
            debug!(topic = %feed.topic, "Feed disabled, not subscribing");
        }
        Ok(feed)
    }

    async fn attach(&self) -> Result<Attachment> {
        let max_events = match self.options.max_events {
            0 => self.client.default_max_events(),
            n => n,
        };
        let listener = Arc::new(FeedListener::new(max_events, self.options.on_event.clone()));
        let changes = listener.revision.subscribe();
        let id = self
            .client
            .attach(self.topic.clone(), listener.clone(), max_events)
            .await?;
        Ok(Attachment {
            id,
            listener,
            changes,
        })
    }

    fn release(&mut self) -> Option<ListenerId> {
        let attachment = self.attachment.take()?;
        attachment.listener.dispose();
        Some(attachment.id)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_enabled(&self) -> bool {
        self.options.enabled
    }

    pub fn state(&self) -> FeedState {
        match &self.attachment {
            Some(attachment) => attachment.listener.snapshot(),
            None => FeedState::default(),
        }
    }

    pub fn events(&self) -> Vec<Arc<WorkflowEvent>> {
        self.state().events
    }

    pub fn is_loading(&self) -> bool {
        self.state().is_loading
    }

    pub fn error(&self) -> Option<ConnectionFailure> {
        self.state().error
    }

    /// Clears local events and error; the subscription stays in place.
    pub fn clear_events(&self) {
        if let Some(attachment) = &self.attachment {
            attachment.listener.clear();
        }
    }

    /// Waits until the state may have changed. Returns false at once for an
    /// inert feed.
    pub async fn changed(&mut self) -> bool {
        match self.attachment.as_mut() {
            Some(attachment) => attachment.changes.changed().await.is_ok(),
            None => false,
        }
    }

    /// Re-points the feed at another topic, discarding local state.
    pub async fn set_topic(&mut self, topic: impl Into<Topic>) -> Result<()> {
        let topic = topic.into();
        if topic == self.topic && (self.attachment.is_some() || !self.options.enabled) {
            return Ok(());
        }
        if let Some(id) = self.release() {
            self.client.detach(self.topic.clone(), id);
        }
        self.topic = topic;
        if self.options.enabled {
            self.attachment = Some(self.attach().await?);
        }
        Ok(())
    }

    /// Unsubscribes and waits until the client has applied it.
    pub async fn close(mut self) {
        if let Some(id) = self.release() {
            self.client.remove(self.topic.clone(), id).await;
        }
    }
}

impl Drop for WorkflowFeed {
    fn drop(&mut self) {
        if let Some(id) = self.release() {
            self.client.detach(std::mem::take(&mut self.topic), id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Phase;

    fn event(node: &str, phase: Phase) -> Arc<WorkflowEvent> {
        Arc::new(WorkflowEvent::new("run-123", node, phase))
    }

    #[test]
    fn loading_until_first_open() {
        let listener = FeedListener::new(10, None);
        listener.on_attached(&[], ConnectionState::Connecting, None);
        assert!(listener.snapshot().is_loading);

        listener.on_connection_state(ConnectionState::Open, None);
        assert!(!listener.snapshot().is_loading);

        listener.on_connection_state(ConnectionState::Reconnecting, None);
        assert!(!listener.snapshot().is_loading);
    }

    #[test]
    fn seeds_from_history_within_own_bound() {
        let listener = FeedListener::new(2, None);
        let history = vec![
            event("a", Phase::Start),
            event("b", Phase::Start),
            event("c", Phase::Start),
        ];
        listener.on_attached(&history, ConnectionState::Open, None);

        let names: Vec<_> = listener
            .snapshot()
            .events
            .iter()
            .map(|e| e.node_name.clone())
            .collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn failure_surfaces_as_error_and_clear_resets_it() {
        let listener = FeedListener::new(10, None);
        listener.on_attached(&[], ConnectionState::Connecting, None);
        listener.on_event(&event("PLAN", Phase::Start));

        let failure = ConnectionFailure::new("credentials rejected", Some(4401), true);
        listener.on_connection_state(ConnectionState::Failed, Some(&failure));
        let state = listener.snapshot();
        assert!(!state.is_loading);
        assert_eq!(state.error, Some(failure));
        assert_eq!(state.events.len(), 1);

        listener.clear();
        assert_eq!(listener.snapshot(), FeedState::default());
    }

    #[test]
    fn callback_runs_once_per_event_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: EventCallback = Arc::new(move |event: &WorkflowEvent| {
            sink.lock().unwrap().push(event.phase);
        });
        let listener = FeedListener::new(10, Some(callback));
        listener.on_attached(&[], ConnectionState::Open, None);

        listener.on_event(&event("PLAN", Phase::Start));
        listener.on_event(&event("PLAN", Phase::End));

        assert_eq!(*seen.lock().unwrap(), vec![Phase::Start, Phase::End]);
    }

    #[test]
    fn disposed_listener_ignores_everything() {
        let calls = Arc::new(Mutex::new(0usize));
        let counter = calls.clone();
        let callback: EventCallback = Arc::new(move |_: &WorkflowEvent| {
            *counter.lock().unwrap() += 1;
        });
        let listener = FeedListener::new(10, Some(callback));
        listener.on_attached(&[], ConnectionState::Open, None);
        let before = listener.snapshot();

        listener.dispose();
        listener.on_event(&event("PLAN", Phase::Start));
        listener.on_connection_state(ConnectionState::Failed, None);

        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(listener.snapshot(), before);
        assert_eq!(*listener.revision.borrow(), 1);
    }
}
