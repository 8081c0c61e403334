/// file: src/registry.rs
/// description: topic -> listener multiplexing with ref-counted server interest and per-topic history
use crate::{
    buffer::EventBuffer,
    error::ConnectionFailure,
    types::{ConnectionState, Topic, WorkflowEvent},
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tracing::debug;

pub type ListenerId = u64;

/// Runs on the supervisor task; a panic inside it takes the client down
/// (release builds abort), so callbacks must not panic.
pub type EventCallback = Arc<dyn Fn(&WorkflowEvent) + Send + Sync>;

/// Receiver side of a subscription. All methods run on the supervisor task,
/// in the order the underlying frames and state changes happened, and must
/// not panic.
pub trait TopicListener: Send + Sync {
    fn on_event(&self, event: &Arc<WorkflowEvent>);

    /// Called once, right after registration, before any event is delivered.
    fn on_attached(
        &self,
        _history: &[Arc<WorkflowEvent>],
        _state: ConnectionState,
        _failure: Option<&ConnectionFailure>,
    ) {
    }

    fn on_connection_state(&self, _state: ConnectionState, _failure: Option<&ConnectionFailure>) {}
}

/// Closure-backed listener. Once disposed the callback is never invoked again,
/// even for events already in flight on the supervisor.
pub struct CallbackListener {
    callback: EventCallback,
    active: AtomicBool,
}

impl CallbackListener {
    pub fn new(callback: EventCallback) -> Arc<Self> {
        Arc::new(Self {
            callback,
            active: AtomicBool::new(true),
        })
    }

    pub fn dispose(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn recording() -> (
        Arc<dyn TopicListener>,
        Arc<std::sync::Mutex<Vec<Arc<WorkflowEvent>>>>,
    ) {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn TopicListener> = CallbackListener::new(Arc::new(move |event: &WorkflowEvent| {
            sink.lock().unwrap().push(Arc::new(event.clone()));
        }));
        (listener, seen)
    }
}

impl TopicListener for CallbackListener {
    fn on_event(&self, event: &Arc<WorkflowEvent>) {
        if self.is_active() {
            (self.callback)(event);
        }
    }
}

/// One listener's interest in a topic.
pub struct Subscription {
    pub id: ListenerId,
    pub topic: Topic,
    pub listener: Arc<dyn TopicListener>,
    pub created_at: DateTime<Utc>,
    pub max_events: usize,
}

impl Subscription {
    pub fn new(
        id: ListenerId,
        topic: impl Into<Topic>,
        listener: Arc<dyn TopicListener>,
        max_events: usize,
    ) -> Self {
        Self {
            id,
            topic: topic.into(),
            listener,
            created_at: Utc::now(),
            max_events,
        }
    }
}

struct TopicEntry {
    order: u64,
    listeners: Vec<Subscription>,
}

#[derive(Debug)]
pub struct Registration {
    /// First listener for the topic: server interest must be declared.
    pub first_for_topic: bool,
    /// Shared history retained for the topic at registration time.
    pub history: Vec<Arc<WorkflowEvent>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    NotFound,
    Removed { last_for_topic: bool },
}

pub struct SubscriptionRegistry {
    topics: HashMap<Topic, TopicEntry>,
    buffers: HashMap<Topic, EventBuffer>,
    /// Topics with a buffer but no listeners, least recently active first.
    idle: VecDeque<Topic>,
    retained_idle_topics: usize,
    next_order: u64,
    default_max_events: usize,
}

impl SubscriptionRegistry {
    pub fn new(default_max_events: usize, retained_idle_topics: usize) -> Self {
        Self {
            topics: HashMap::new(),
            buffers: HashMap::new(),
            idle: VecDeque::new(),
            retained_idle_topics,
            next_order: 0,
            default_max_events,
        }
    }

    pub fn subscribe(&mut self, subscription: Subscription) -> Registration {
        let topic = subscription.topic.clone();
        let wanted = if subscription.max_events == 0 {
            self.default_max_events
        } else {
            subscription.max_events
        };

        self.idle.retain(|idle| idle != &topic);

        // The largest bound requested by any listener governs the shared buffer.
        let buffer = self
            .buffers
            .entry(topic.clone())
            .or_insert_with(|| EventBuffer::new(wanted));
        if wanted > buffer.max_events() {
            buffer.set_max_events(wanted);
        }
        let history = buffer.snapshot();

        let first_for_topic = !self.topics.contains_key(&topic);
        let order = self.next_order;
        let entry = self.topics.entry(topic.clone()).or_insert_with(|| TopicEntry {
            order,
            listeners: Vec::new(),
        });
        if first_for_topic {
            self.next_order += 1;
        }

        debug!(
            topic = %topic,
            listener_id = subscription.id,
            first_for_topic,
            "Registered listener"
        );
        entry.listeners.push(subscription);

        Registration {
            first_for_topic,
            history,
        }
    }

    /// After the last listener leaves, the topic's history is kept only while
    /// it is among the most recent `retained_idle_topics` idle topics.
    pub fn unsubscribe(&mut self, topic: &str, id: ListenerId) -> Removal {
        let Some(entry) = self.topics.get_mut(topic) else {
            return Removal::NotFound;
        };
        let Some(position) = entry.listeners.iter().position(|s| s.id == id) else {
            return Removal::NotFound;
        };
        entry.listeners.remove(position);

        let last_for_topic = entry.listeners.is_empty();
        if last_for_topic {
            self.topics.remove(topic);
            self.retire(topic);
        }
        debug!(topic = %topic, listener_id = id, last_for_topic, "Removed listener");
        Removal::Removed { last_for_topic }
    }

    /// Appends to the topic's history and fans out to its listeners in
    /// registration order. Returns how many listeners were invoked.
    pub fn dispatch(&mut self, event: Arc<WorkflowEvent>) -> usize {
        let Some(entry) = self.topics.get(&event.run_id) else {
            return 0;
        };

        if let Some(buffer) = self.buffers.get_mut(&event.run_id) {
            buffer.append(event.clone());
        }

        let mut delivered = 0;
        for subscription in entry
            .listeners
            .iter()
            .filter(|s| s.topic == event.run_id)
        {
            subscription.listener.on_event(&event);
            delivered += 1;
        }
        delivered
    }

    pub fn notify_state(&self, state: ConnectionState, failure: Option<&ConnectionFailure>) {
        for subscription in self.topics.values().flat_map(|entry| entry.listeners.iter()) {
            subscription.listener.on_connection_state(state, failure);
        }
    }

    /// Topics with at least one listener, in the order they were first subscribed.
    pub fn active_topics(&self) -> Vec<Topic> {
        let mut topics: Vec<(&Topic, u64)> = self
            .topics
            .iter()
            .map(|(topic, entry)| (topic, entry.order))
            .collect();
        topics.sort_by_key(|(_, order)| *order);
        topics.into_iter().map(|(topic, _)| topic.clone()).collect()
    }

    pub fn is_active(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn listener_count(&self) -> usize {
        self.topics.values().map(|entry| entry.listeners.len()).sum()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn history(&self, topic: &str) -> Vec<Arc<WorkflowEvent>> {
        self.buffers
            .get(topic)
            .map(EventBuffer::snapshot)
            .unwrap_or_default()
    }

    /// Empties an active topic's history; an idle topic's buffer is released.
    pub fn clear_history(&mut self, topic: &str) -> bool {
        if self.is_active(topic) {
            return match self.buffers.get_mut(topic) {
                Some(buffer) => {
                    buffer.clear();
                    true
                }
                None => false,
            };
        }
        self.idle.retain(|idle| idle != topic);
        self.buffers.remove(topic).is_some()
    }

    /// Topics whose history is held without any listener.
    pub fn retained_idle_topics(&self) -> usize {
        self.idle.len()
    }

    fn retire(&mut self, topic: &str) {
        if self.retained_idle_topics == 0 {
            self.buffers.remove(topic);
            return;
        }
        self.idle.push_back(topic.to_string());
        while self.idle.len() > self.retained_idle_topics {
            if let Some(oldest) = self.idle.pop_front() {
                debug!(topic = %oldest, "Releasing idle topic history");
                self.buffers.remove(&oldest);
            }
        }
    }

    /// Drops every listener and buffer. Returns the topics that were active,
    /// in registration order.
    pub fn clear(&mut self) -> Vec<Topic> {
        let topics = self.active_topics();
        self.topics.clear();
        self.buffers.clear();
        self.idle.clear();
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Phase;
    use std::sync::Mutex;

    fn event(run_id: &str, node: &str) -> Arc<WorkflowEvent> {
        Arc::new(WorkflowEvent::new(run_id, node, Phase::Start))
    }

    #[derive(Default)]
    struct StateSpy {
        states: Mutex<Vec<ConnectionState>>,
    }

    impl TopicListener for StateSpy {
        fn on_event(&self, _event: &Arc<WorkflowEvent>) {}

        fn on_connection_state(&self, state: ConnectionState, _failure: Option<&ConnectionFailure>) {
            self.states.lock().unwrap().push(state);
        }
    }

    #[test]
    fn ref_counts_listeners_per_topic() {
        let mut registry = SubscriptionRegistry::new(100, 4);
        let (a, _) = CallbackListener::recording();
        let (b, _) = CallbackListener::recording();

        assert!(registry.subscribe(Subscription::new(1, "run-1", a, 0)).first_for_topic);
        assert!(!registry.subscribe(Subscription::new(2, "run-1", b, 0)).first_for_topic);
        assert_eq!(registry.listener_count(), 2);
        assert_eq!(registry.topic_count(), 1);

        assert_eq!(
            registry.unsubscribe("run-1", 1),
            Removal::Removed {
                last_for_topic: false
            }
        );
        assert_eq!(
            registry.unsubscribe("run-1", 2),
            Removal::Removed {
                last_for_topic: true
            }
        );
        assert_eq!(registry.unsubscribe("run-1", 2), Removal::NotFound);
        assert!(registry.is_empty());
    }

    #[test]
    fn fans_out_to_every_listener_of_the_topic() {
        let mut registry = SubscriptionRegistry::new(100, 4);
        let (a, seen_a) = CallbackListener::recording();
        let (b, seen_b) = CallbackListener::recording();
        let (other, seen_other) = CallbackListener::recording();
        registry.subscribe(Subscription::new(1, "run-123", a, 0));
        registry.subscribe(Subscription::new(2, "run-123", b, 0));
        registry.subscribe(Subscription::new(3, "run-456", other, 0));

        assert_eq!(registry.dispatch(event("run-123", "PLAN")), 2);

        assert_eq!(seen_a.lock().unwrap().len(), 1);
        assert_eq!(seen_b.lock().unwrap().len(), 1);
        assert!(seen_other.lock().unwrap().is_empty());
    }

    #[test]
    fn history_survives_last_unsubscribe_and_seeds_new_listeners() {
        let mut registry = SubscriptionRegistry::new(100, 4);
        let (a, _) = CallbackListener::recording();
        registry.subscribe(Subscription::new(1, "run-1", a, 0));
        registry.dispatch(event("run-1", "PLAN"));
        registry.dispatch(event("run-1", "EXECUTE"));
        registry.unsubscribe("run-1", 1);

        let (b, _) = CallbackListener::recording();
        let registration = registry.subscribe(Subscription::new(2, "run-1", b, 0));
        assert!(registration.first_for_topic);
        let names: Vec<_> = registration
            .history
            .iter()
            .map(|e| e.node_name.as_str())
            .collect();
        assert_eq!(names, vec!["PLAN", "EXECUTE"]);

        assert!(registry.clear_history("run-1"));
        assert!(registry.history("run-1").is_empty());
    }

    #[test]
    fn idle_history_is_released_oldest_first() {
        let mut registry = SubscriptionRegistry::new(10, 2);
        for (id, topic) in [(1, "run-1"), (2, "run-2"), (3, "run-3")] {
            let (listener, _) = CallbackListener::recording();
            registry.subscribe(Subscription::new(id, topic, listener, 0));
            registry.dispatch(event(topic, "PLAN"));
            registry.unsubscribe(topic, id);
        }

        assert!(registry.history("run-1").is_empty());
        assert_eq!(registry.history("run-2").len(), 1);
        assert_eq!(registry.history("run-3").len(), 1);
        assert_eq!(registry.retained_idle_topics(), 2);

        // resubscribing takes a topic out of the idle set
        let (listener, _) = CallbackListener::recording();
        registry.subscribe(Subscription::new(4, "run-2", listener, 0));
        assert_eq!(registry.retained_idle_topics(), 1);
    }

    #[test]
    fn history_is_released_with_last_listener_when_retention_is_off() {
        let mut registry = SubscriptionRegistry::new(10, 0);
        let (listener, _) = CallbackListener::recording();
        registry.subscribe(Subscription::new(1, "run-1", listener, 0));
        registry.dispatch(event("run-1", "PLAN"));
        assert_eq!(registry.history("run-1").len(), 1);

        registry.unsubscribe("run-1", 1);
        assert!(registry.history("run-1").is_empty());
        assert!(!registry.clear_history("run-1"));
    }

    #[test]
    fn clearing_idle_history_releases_the_buffer() {
        let mut registry = SubscriptionRegistry::new(10, 4);
        let (active, _) = CallbackListener::recording();
        let (leaving, _) = CallbackListener::recording();
        registry.subscribe(Subscription::new(1, "run-active", active, 0));
        registry.subscribe(Subscription::new(2, "run-idle", leaving, 0));
        registry.dispatch(event("run-active", "PLAN"));
        registry.dispatch(event("run-idle", "PLAN"));
        registry.unsubscribe("run-idle", 2);

        assert!(registry.clear_history("run-idle"));
        assert_eq!(registry.retained_idle_topics(), 0);
        assert!(!registry.clear_history("run-idle"));

        // an active topic keeps its buffer and keeps recording
        assert!(registry.clear_history("run-active"));
        registry.dispatch(event("run-active", "EXECUTE"));
        assert_eq!(registry.history("run-active").len(), 1);
    }

    #[test]
    fn larger_bound_governs_shared_buffer() {
        let mut registry = SubscriptionRegistry::new(100, 4);
        let (small, _) = CallbackListener::recording();
        let (large, _) = CallbackListener::recording();
        registry.subscribe(Subscription::new(1, "run-1", small, 2));
        registry.subscribe(Subscription::new(2, "run-1", large, 4));

        for i in 0..6 {
            registry.dispatch(event("run-1", &format!("n{i}")));
        }
        assert_eq!(registry.history("run-1").len(), 4);
    }

    #[test]
    fn active_topics_follow_first_registration_order() {
        let mut registry = SubscriptionRegistry::new(10, 4);
        for (id, topic) in [(1, "run-c"), (2, "run-a"), (3, "run-c"), (4, "run-b")] {
            let (listener, _) = CallbackListener::recording();
            registry.subscribe(Subscription::new(id, topic, listener, 0));
        }
        assert_eq!(registry.active_topics(), vec!["run-c", "run-a", "run-b"]);

        registry.unsubscribe("run-a", 2);
        assert_eq!(registry.active_topics(), vec!["run-c", "run-b"]);
    }

    #[test]
    fn disposed_callback_is_not_invoked() {
        let calls = Arc::new(Mutex::new(0usize));
        let counter = calls.clone();
        let listener = CallbackListener::new(Arc::new(move |_: &WorkflowEvent| {
            *counter.lock().unwrap() += 1;
        }));

        let mut registry = SubscriptionRegistry::new(10, 4);
        registry.subscribe(Subscription::new(1, "run-1", listener.clone(), 0));
        registry.dispatch(event("run-1", "a"));
        listener.dispose();
        registry.dispatch(event("run-1", "b"));

        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn state_changes_reach_every_listener() {
        let mut registry = SubscriptionRegistry::new(10, 4);
        let spy = Arc::new(StateSpy::default());
        registry.subscribe(Subscription::new(1, "run-1", spy.clone(), 0));

        registry.notify_state(ConnectionState::Open, None);
        registry.notify_state(ConnectionState::Reconnecting, None);
        assert_eq!(
            *spy.states.lock().unwrap(),
            vec![ConnectionState::Open, ConnectionState::Reconnecting]
        );
    }
}
