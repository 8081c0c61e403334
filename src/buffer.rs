/// file: src/buffer.rs
/// description: bounded, insertion-ordered per-topic event history with FIFO eviction
use crate::types::WorkflowEvent;
use std::collections::VecDeque;
use std::sync::Arc;

pub const DEFAULT_MAX_EVENTS: usize = 1000;

pub const DEFAULT_RETAINED_IDLE_TOPICS: usize = 16;

#[derive(Debug, Clone)]
pub struct EventBuffer {
    events: VecDeque<Arc<WorkflowEvent>>,
    max_events: usize,
    evicted: u64,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS)
    }
}

impl EventBuffer {
    /// A `max_events` of zero is treated as one; a buffer always keeps the latest event.
    pub fn new(max_events: usize) -> Self {
        let max_events = max_events.max(1);
        Self {
            events: VecDeque::with_capacity(max_events.min(DEFAULT_MAX_EVENTS)),
            max_events,
            evicted: 0,
        }
    }

    pub fn append(&mut self, event: Arc<WorkflowEvent>) {
        self.events.push_back(event);
        self.evict_overflow();
    }

    pub fn extend<I>(&mut self, events: I)
    where
        I: IntoIterator<Item = Arc<WorkflowEvent>>,
    {
        for event in events {
            self.append(event);
        }
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Ordered copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<WorkflowEvent>> {
        self.events.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<WorkflowEvent>> {
        self.events.iter()
    }

    pub fn latest(&self) -> Option<&Arc<WorkflowEvent>> {
        self.events.back()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    /// Total events dropped from the head since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Changes the bound; shrinking evicts from the head immediately.
    pub fn set_max_events(&mut self, max_events: usize) {
        self.max_events = max_events.max(1);
        self.evict_overflow();
    }

    fn evict_overflow(&mut self) {
        while self.events.len() > self.max_events {
            self.events.pop_front();
            self.evicted += 1;
        }
    }
}
