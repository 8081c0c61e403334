// file: src/client.rs
// description: process-wide client facade and the supervisor task that owns the connection, registry and router
// reference: https://docs.rs/tokio/latest/tokio/sync/index.html

use crate::{
    client_state::{ClientStats, StatsReceiver, StatsSender, create_stats_channel},
    config::Config,
    connection::{Connection, ConnectionSignal, DropCause},
    error::{ConnectionFailure, Result, WorkflowStreamError},
    events::{ClientEvent, EventReceiver, EventSender, create_event_channel},
    feed::{FeedOptions, WorkflowFeed},
    monitoring::{
        ACTIVE_LISTENERS_GAUGE, ACTIVE_TOPICS_GAUGE, CONNECTED_GAUGE, EVENTS_ROUTED_COUNTER,
        FRAMES_RECEIVED_COUNTER, RECONNECT_COUNTER, record_discarded_frame,
    },
    reconnect::{CloseDisposition, JitterSource, RandomJitter, ReconnectDecision, ReconnectPolicy},
    registry::{
        CallbackListener, EventCallback, ListenerId, Removal, Subscription, SubscriptionRegistry,
        TopicListener,
    },
    router::{MessageRouter, RouteOutcome},
    transport::{Connector, TokenProvider, WebSocketConnector},
    types::{ClientFrame, ConnectionState, Topic, WorkflowEvent},
};
use std::sync::{
    Arc, LazyLock, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

enum Command {
    Subscribe {
        subscription: Subscription,
        reply: oneshot::Sender<()>,
    },
    Unsubscribe {
        topic: Topic,
        id: ListenerId,
        reply: Option<oneshot::Sender<bool>>,
    },
    History {
        topic: Topic,
        reply: oneshot::Sender<Vec<Arc<WorkflowEvent>>>,
    },
    ClearHistory {
        topic: Topic,
        reply: oneshot::Sender<bool>,
    },
    Reconnect {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Owns every piece of mutable pipeline state. All registry and connection
/// mutation happens on this one task, in the order commands and frames arrive.
struct Supervisor {
    connection: Connection,
    registry: SubscriptionRegistry,
    router: MessageRouter,
    policy: ReconnectPolicy,
    retry_at: Option<Instant>,
    idle_at: Option<Instant>,
    idle_teardown: Option<Duration>,
    last_failure: Option<ConnectionFailure>,
    url: String,
    events: EventSender,
    stats: StatsSender,
}

impl Supervisor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!(url = %self.url, "Client supervisor started");

        loop {
            let retry_at = self.retry_at;
            let idle_at = self.idle_at;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                signal = self.connection.next_signal() => self.handle_signal(signal).await,
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    if self.registry.is_empty() {
                        self.teardown("no active subscriptions").await;
                    } else {
                        self.connect();
                    }
                }
                _ = sleep_until(idle_at.unwrap_or_else(Instant::now)), if idle_at.is_some() => {
                    self.idle_at = None;
                    if self.registry.is_empty() {
                        self.teardown("idle").await;
                    }
                }
            }

            self.publish_stats();
        }

        info!("Client supervisor stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                subscription,
                reply,
            } => {
                self.subscribe(subscription).await;
                self.publish_stats();
                let _ = reply.send(());
            }
            Command::Unsubscribe { topic, id, reply } => {
                let removed = self.unsubscribe(&topic, id).await;
                self.publish_stats();
                if let Some(reply) = reply {
                    let _ = reply.send(removed);
                }
            }
            Command::History { topic, reply } => {
                let _ = reply.send(self.registry.history(&topic));
            }
            Command::ClearHistory { topic, reply } => {
                let _ = reply.send(self.registry.clear_history(&topic));
            }
            Command::Reconnect { reply } => {
                self.reconnect().await;
                self.publish_stats();
                let _ = reply.send(());
            }
            // handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn subscribe(&mut self, subscription: Subscription) {
        let topic = subscription.topic.clone();
        let listener = subscription.listener.clone();
        let registration = self.registry.subscribe(subscription);
        self.idle_at = None;

        let state = self.connection.state();
        let failure = match state {
            ConnectionState::Failed => self.last_failure.as_ref(),
            _ => None,
        };
        listener.on_attached(&registration.history, state, failure);

        match state {
            ConnectionState::Closed => self.connect(),
            ConnectionState::Open if registration.first_for_topic => {
                self.send_intent(ClientFrame::subscribe(&topic)).await;
            }
            // Connecting and Reconnecting replay every active topic once open.
            _ => {}
        }
    }

    async fn unsubscribe(&mut self, topic: &str, id: ListenerId) -> bool {
        match self.registry.unsubscribe(topic, id) {
            Removal::NotFound => false,
            Removal::Removed { last_for_topic } => {
                if last_for_topic && self.connection.is_open() {
                    self.send_intent(ClientFrame::unsubscribe(topic)).await;
                }
                if self.registry.is_empty() {
                    self.on_empty().await;
                }
                true
            }
        }
    }

    /// Last listener left: cancel pending retries and schedule idle teardown.
    async fn on_empty(&mut self) {
        if self.connection.state() == ConnectionState::Reconnecting {
            self.retry_at = None;
            self.teardown("no active subscriptions").await;
            return;
        }
        if let Some(window) = self.idle_teardown {
            debug!(idle_ms = window.as_millis() as u64, "No listeners left, scheduling teardown");
            self.idle_at = Some(Instant::now() + window);
        }
    }

    async fn send_intent(&mut self, frame: ClientFrame) {
        match self.connection.send(&frame).await {
            Ok(()) => {
                let topic = frame.topic().to_string();
                debug!(topic = %topic, "Sent {:?}", frame);
                self.emit(match frame {
                    ClientFrame::Subscribe { .. } => ClientEvent::SubscriptionSent { topic },
                    ClientFrame::Unsubscribe { .. } => ClientEvent::UnsubscriptionSent { topic },
                });
            }
            // subscribe intents are replayed on the next open
            Err(e) => debug!(topic = %frame.topic(), "Intent not sent: {}", e),
        }
    }

    fn connect(&mut self) {
        if self.connection.open() {
            self.registry.notify_state(ConnectionState::Connecting, None);
            self.emit(ClientEvent::Connecting {
                url: self.url.clone(),
            });
        }
    }

    async fn handle_signal(&mut self, signal: ConnectionSignal) {
        match signal {
            ConnectionSignal::Opened => self.on_open().await,
            ConnectionSignal::Frame(text) => self.on_frame(&text),
            ConnectionSignal::Undecodable(detail) => {
                FRAMES_RECEIVED_COUNTER.increment(1);
                let outcome = self.router.reject_undecodable(&detail);
                self.record_outcome(outcome);
            }
            ConnectionSignal::HeartbeatDue => {
                if let Err(e) = self.connection.probe().await {
                    self.on_drop(DropCause::from_error(&e)).await;
                }
            }
            ConnectionSignal::ConnectFailed(cause) | ConnectionSignal::Dropped(cause) => {
                self.on_drop(cause).await;
            }
        }
    }

    async fn on_open(&mut self) {
        self.policy.reset();
        self.retry_at = None;
        CONNECTED_GAUGE.set(1.0);

        let topics = self.registry.active_topics();
        let mut resubscribed = 0;
        for topic in &topics {
            if !self.connection.is_open() {
                break;
            }
            self.send_intent(ClientFrame::subscribe(topic)).await;
            resubscribed += 1;
        }

        let connection_id = self
            .connection
            .connection_id()
            .map(|id| id.to_string())
            .unwrap_or_default();
        info!(
            connection_id = %connection_id,
            resubscribed,
            "Connected, active topics resubscribed"
        );
        self.registry.notify_state(ConnectionState::Open, None);
        self.emit(ClientEvent::Connected {
            connection_id,
            resubscribed,
        });
    }

    fn on_frame(&mut self, text: &str) {
        FRAMES_RECEIVED_COUNTER.increment(1);
        let outcome = self.router.route(text, &mut self.registry);
        self.record_outcome(outcome);
    }

    fn record_outcome(&self, outcome: RouteOutcome) {
        match outcome {
            RouteOutcome::Delivered { .. } => EVENTS_ROUTED_COUNTER.increment(1),
            RouteOutcome::Discarded(reason) => {
                record_discarded_frame(reason.label());
                self.emit(ClientEvent::FrameDiscarded {
                    reason: reason.to_string(),
                });
            }
            RouteOutcome::Unroutable { .. } | RouteOutcome::Control(_) => {}
        }
    }

    async fn on_drop(&mut self, cause: DropCause) {
        CONNECTED_GAUGE.set(0.0);
        self.emit(ClientEvent::Disconnected {
            reason: cause.failure.to_string(),
        });

        if self.registry.is_empty() {
            self.teardown("no active subscriptions").await;
            return;
        }

        self.last_failure = Some(cause.failure.clone());
        match self.policy.on_failure(cause.disposition) {
            ReconnectDecision::Retry { attempt, delay } => {
                RECONNECT_COUNTER.increment(1);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Connection lost ({}), reconnecting",
                    cause.failure
                );
                self.connection.mark_reconnecting();
                self.retry_at = Some(Instant::now() + delay);
                self.registry
                    .notify_state(ConnectionState::Reconnecting, None);
                self.emit(ClientEvent::Reconnecting { attempt, delay });
            }
            ReconnectDecision::GiveUp { attempts } => {
                let failure = match cause.disposition {
                    CloseDisposition::Retryable => ConnectionFailure::new(
                        format!(
                            "{} ({})",
                            WorkflowStreamError::MaxReconnectsExceeded,
                            cause.failure.message
                        ),
                        cause.failure.close_code,
                        true,
                    ),
                    _ => cause.failure.into_terminal(),
                };
                error!(attempts, "Giving up on connection: {}", failure);
                self.connection.mark_failed();
                self.retry_at = None;
                self.last_failure = Some(failure.clone());
                self.registry
                    .notify_state(ConnectionState::Failed, Some(&failure));
                self.emit(ClientEvent::Failed { failure });
            }
        }
    }

    async fn teardown(&mut self, reason: &str) {
        if self.connection.state() == ConnectionState::Closed {
            return;
        }
        info!(reason, "Closing connection");
        self.connection.close().await;
        CONNECTED_GAUGE.set(0.0);
        self.registry.notify_state(ConnectionState::Closed, None);
        self.emit(ClientEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    async fn reconnect(&mut self) {
        info!("Manual reconnect requested");
        self.retry_at = None;
        self.last_failure = None;
        self.connection.close().await;
        self.policy.reset();
        if self.registry.is_empty() {
            return;
        }
        self.connect();
    }

    async fn shutdown(&mut self) {
        self.emit(ClientEvent::Stopping);
        if self.connection.is_open() {
            for topic in self.registry.active_topics() {
                self.send_intent(ClientFrame::unsubscribe(&topic)).await;
            }
        }
        self.retry_at = None;
        self.idle_at = None;
        self.connection.close().await;
        CONNECTED_GAUGE.set(0.0);
        self.registry.notify_state(ConnectionState::Closed, None);
        let topics = self.registry.clear();
        self.last_failure = None;
        self.publish_stats();
        info!(topics = topics.len(), "Client shut down");
    }

    fn publish_stats(&self) {
        let mut stats = ClientStats {
            connection_state: self.connection.state(),
            subscription_count: self.registry.listener_count(),
            topic_count: self.registry.topic_count(),
            connection_id: self.connection.connection_id().map(|id| id.to_string()),
            reconnect_attempt: self.policy.state().attempt,
            last_failure: self.last_failure.clone(),
            ..ClientStats::default()
        };
        stats.record_router(self.router.stats());

        ACTIVE_TOPICS_GAUGE.set(stats.topic_count as f64);
        ACTIVE_LISTENERS_GAUGE.set(stats.subscription_count as f64);
        self.stats.send_replace(stats);
    }

    fn emit(&self, event: ClientEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }
}

struct ClientInner {
    commands: mpsc::UnboundedSender<Command>,
    stats: StatsReceiver,
    events: EventSender,
    next_listener_id: AtomicU64,
    default_max_events: usize,
}

/// The single entry point for consumers. Cheap to clone; every clone talks to
/// the same supervisor and therefore the same physical connection.
#[derive(Clone)]
pub struct WorkflowClient {
    inner: Arc<ClientInner>,
}

impl WorkflowClient {
    /// Spawns the supervisor task; must be called from within a Tokio runtime.
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self::with_jitter(config, connector, tokens, Box::new(RandomJitter::new()))
    }

    /// Like [`WorkflowClient::new`] with an explicit jitter source for the
    /// reconnection policy.
    pub fn with_jitter(
        config: Config,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
        jitter: Box<dyn JitterSource>,
    ) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = create_stats_channel();
        let events = create_event_channel();

        let supervisor = Supervisor {
            url: config.websocket.url.to_string(),
            idle_teardown: config.websocket.idle_teardown,
            connection: Connection::new(config.websocket.clone(), connector, tokens),
            registry: SubscriptionRegistry::new(
                config.buffer.max_events,
                config.buffer.retained_idle_topics,
            ),
            router: MessageRouter::new(),
            policy: ReconnectPolicy::with_jitter(config.reconnect.clone(), jitter),
            retry_at: None,
            idle_at: None,
            last_failure: None,
            events: events.clone(),
            stats: stats_tx,
        };
        tokio::spawn(supervisor.run(receiver));

        Self {
            inner: Arc::new(ClientInner {
                commands,
                stats: stats_rx,
                events,
                next_listener_id: AtomicU64::new(1),
                default_max_events: config.buffer.max_events,
            }),
        }
    }

    /// Client over the rustls-backed WebSocket connector.
    pub fn connect_websocket(config: Config, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let connector = WebSocketConnector::new()?;
        Ok(Self::new(config, Arc::new(connector), tokens))
    }

    /// Opens a reactive feed of `topic`'s events.
    pub async fn subscribe(&self, topic: impl Into<Topic>, options: FeedOptions) -> Result<WorkflowFeed> {
        WorkflowFeed::open(self.clone(), topic.into(), options).await
    }

    /// Registers a bare callback. The returned handle unsubscribes when dropped.
    /// The callback runs on the client's task and must not panic.
    pub async fn listen<F>(&self, topic: impl Into<Topic>, callback: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&WorkflowEvent) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let callback: EventCallback = Arc::new(callback);
        let listener = CallbackListener::new(callback);
        let id = self.attach(topic.clone(), listener.clone(), 0).await?;
        Ok(SubscriptionHandle {
            client: self.clone(),
            topic,
            id,
            listener,
            active: true,
        })
    }

    pub(crate) async fn attach(
        &self,
        topic: Topic,
        listener: Arc<dyn TopicListener>,
        max_events: usize,
    ) -> Result<ListenerId> {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let (reply, done) = oneshot::channel();
        self.send(Command::Subscribe {
            subscription: Subscription::new(id, topic, listener, max_events),
            reply,
        })?;
        done.await.map_err(|_| WorkflowStreamError::ClientShutdown)?;
        Ok(id)
    }

    /// Removes a listener and waits until the removal is reflected in stats.
    pub(crate) async fn remove(&self, topic: Topic, id: ListenerId) -> bool {
        let (reply, done) = oneshot::channel();
        if self
            .send(Command::Unsubscribe {
                topic,
                id,
                reply: Some(reply),
            })
            .is_err()
        {
            return false;
        }
        done.await.unwrap_or(false)
    }

    /// Fire-and-forget removal for drop paths.
    pub(crate) fn detach(&self, topic: Topic, id: ListenerId) {
        let _ = self.send(Command::Unsubscribe {
            topic,
            id,
            reply: None,
        });
    }

    pub(crate) fn default_max_events(&self) -> usize {
        self.inner.default_max_events
    }

    /// Snapshot as of the last command the supervisor finished.
    pub fn stats(&self) -> ClientStats {
        self.inner.stats.borrow().clone()
    }

    pub fn watch_stats(&self) -> StatsReceiver {
        self.inner.stats.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.stats.borrow().connection_state
    }

    /// Receiver for lifecycle events published from now on.
    pub fn lifecycle(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    /// Retained history for `topic`, oldest first.
    pub async fn history(&self, topic: impl Into<Topic>) -> Result<Vec<Arc<WorkflowEvent>>> {
        let (reply, done) = oneshot::channel();
        self.send(Command::History {
            topic: topic.into(),
            reply,
        })?;
        done.await.map_err(|_| WorkflowStreamError::ClientShutdown)
    }

    pub async fn clear_history(&self, topic: impl Into<Topic>) -> Result<bool> {
        let (reply, done) = oneshot::channel();
        self.send(Command::ClearHistory {
            topic: topic.into(),
            reply,
        })?;
        done.await.map_err(|_| WorkflowStreamError::ClientShutdown)
    }

    /// Resets the reconnection policy, leaves `Failed` and reopens if anyone is listening.
    pub async fn reconnect(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Reconnect { reply })?;
        done.await.map_err(|_| WorkflowStreamError::ClientShutdown)
    }

    /// Unsubscribes every topic, closes the connection and stops the supervisor.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.commands.is_closed()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| WorkflowStreamError::ClientShutdown)
    }
}

/// A callback registration. Dropping it unsubscribes; the callback is
/// disabled immediately, before the supervisor processes the removal.
pub struct SubscriptionHandle {
    client: WorkflowClient,
    topic: Topic,
    id: ListenerId,
    listener: Arc<CallbackListener>,
    active: bool,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Unsubscribes and waits for the supervisor to apply it.
    pub async fn unsubscribe(mut self) -> bool {
        self.active = false;
        self.listener.dispose();
        let topic = std::mem::take(&mut self.topic);
        self.client.remove(topic, self.id).await
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if self.active {
            self.listener.dispose();
            self.client.detach(std::mem::take(&mut self.topic), self.id);
        }
    }
}

static INSTANCE: LazyLock<Mutex<Option<WorkflowClient>>> = LazyLock::new(|| Mutex::new(None));

/// The process-wide client, if one has been created.
pub fn get_instance() -> Option<WorkflowClient> {
    INSTANCE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Returns the process-wide client, creating it with `init` on first use.
pub fn get_or_init<F>(init: F) -> Result<WorkflowClient>
where
    F: FnOnce() -> Result<WorkflowClient>,
{
    let mut slot = INSTANCE.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(client) = slot.as_ref()
        && !client.is_shut_down()
    {
        return Ok(client.clone());
    }
    let client = init()?;
    *slot = Some(client.clone());
    Ok(client)
}

/// Replaces the process-wide client, returning the previous one without shutting it down.
pub fn install(client: WorkflowClient) -> Option<WorkflowClient> {
    INSTANCE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(client)
}

/// Tears down the process-wide client and discards all of its state. The next
/// `get_or_init` builds a fresh one.
pub async fn reset_instance() {
    let previous = INSTANCE.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(client) = previous {
        client.shutdown().await;
    }
}
