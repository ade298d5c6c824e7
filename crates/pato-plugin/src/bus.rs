//! Event bus: ordered, typed publish/subscribe with bounded per-subscriber
//! queues.
//!
//! Publishing never blocks on a subscriber. Every matching subscriber gets
//! the event appended to its own queue at publish time; when a queue is full
//! its oldest event is evicted and a `bus.dropped` diagnostic is published.
//! The affected subscriber sees one coalesced drop notice (naming the first
//! event it lost) in the position the diagnostic was published, so sequences
//! from every source stay monotonic per subscriber. Diagnostics that are
//! themselves evicted are only counted, so overflow never cascades.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::PluginError;
use crate::events::{DroppedPayload, Event, EventPattern, EventSource, EVENT_DROPPED};
use crate::manifest::PluginId;

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// A party that receives events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Subscriber {
    Plugin(PluginId),
    Ui,
}

impl fmt::Display for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plugin(id) => write!(f, "{id}"),
            Self::Ui => f.write_str("ui"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub subscriber: Subscriber,
    pub pattern: EventPattern,
}

/// Outcome of one publish.
#[derive(Debug, Clone)]
pub struct PublishReport {
    pub event: Arc<Event>,
    /// Subscribers the event was enqueued for.
    pub delivered: usize,
    /// Older events evicted to make room.
    pub dropped: usize,
}

/// Something a subscriber pulls off its queue.
#[derive(Debug, Clone)]
pub enum Delivery {
    Event(Arc<Event>),
    /// Events were lost since the last pull. `diagnostic` names the first.
    Dropped { diagnostic: Arc<Event>, count: u64 },
}

impl Delivery {
    pub fn event(&self) -> &Arc<Event> {
        match self {
            Self::Event(event) => event,
            Self::Dropped { diagnostic, .. } => diagnostic,
        }
    }

    /// Flatten to a single event; a drop notice carries its `count` in the
    /// diagnostic payload.
    pub fn into_event(self) -> Arc<Event> {
        match self {
            Self::Event(event) => event,
            Self::Dropped { diagnostic, count } => {
                let mut event = diagnostic.as_ref().clone();
                if let serde_json::Value::Object(ref mut map) = event.payload {
                    map.insert("count".into(), serde_json::Value::from(count));
                }
                Arc::new(event)
            }
        }
    }
}

// ─── Subscriber queue ────────────────────────────────────────────────

#[derive(Debug)]
enum Entry {
    Event(Arc<Event>),
    Notice { diagnostic: Arc<Event>, count: u64 },
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<Entry>,
    /// Events in `entries`; notices do not take up capacity.
    queued: usize,
    notice_pending: bool,
    closed: bool,
    dropped_total: u64,
}

/// Bounded inbound queue of one subscriber. Single consumer.
#[derive(Debug)]
pub struct SubscriberQueue {
    subscriber: Subscriber,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SubscriberQueue {
    fn new(subscriber: Subscriber, capacity: usize, closed: bool) -> Self {
        Self {
            subscriber,
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                closed,
                ..QueueState::default()
            }),
            notify: Notify::new(),
        }
    }

    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued events, not counting a pending drop notice.
    pub fn len(&self) -> usize {
        self.lock().queued
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn dropped_total(&self) -> u64 {
        self.lock().dropped_total
    }

    /// Pop the next delivery without waiting.
    pub fn try_next(&self) -> Option<Delivery> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        match state.entries.pop_front()? {
            Entry::Event(event) => {
                state.queued -= 1;
                Some(Delivery::Event(event))
            }
            Entry::Notice { diagnostic, count } => {
                state.notice_pending = false;
                Some(Delivery::Dropped { diagnostic, count })
            }
        }
    }

    /// Wait for the next delivery. `None` once the queue is closed.
    pub async fn next(&self) -> Option<Delivery> {
        loop {
            if let Some(delivery) = self.try_next() {
                return Some(delivery);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Append, evicting the oldest event when full. Returns the evicted one.
    fn push(&self, event: Arc<Event>) -> Option<Arc<Event>> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        let evicted = if state.queued >= self.capacity {
            let oldest = state
                .entries
                .iter()
                .position(|e| matches!(e, Entry::Event(_)));
            match oldest.and_then(|i| state.entries.remove(i)) {
                Some(Entry::Event(evicted)) => {
                    state.queued -= 1;
                    state.dropped_total += 1;
                    Some(evicted)
                }
                _ => None,
            }
        } else {
            None
        };
        state.entries.push_back(Entry::Event(event));
        state.queued += 1;
        drop(state);
        self.notify.notify_one();
        evicted
    }

    /// Record a loss. The first loss since the notice was last pulled
    /// appends a notice carrying its diagnostic; later ones only bump the
    /// pending notice's count.
    fn note_drop(&self, diagnostic: Option<Arc<Event>>) {
        let mut state = self.lock();
        if state.notice_pending {
            let pending = state.entries.iter_mut().rev().find_map(|e| match e {
                Entry::Notice { count, .. } => Some(count),
                Entry::Event(_) => None,
            });
            if let Some(count) = pending {
                *count += 1;
            }
            return;
        }
        if let Some(diagnostic) = diagnostic {
            state.entries.push_back(Entry::Notice {
                diagnostic,
                count: 1,
            });
            state.notice_pending = true;
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Discard everything queued and wake the consumer.
    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.entries.clear();
        state.queued = 0;
        state.notice_pending = false;
        drop(state);
        self.notify.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ─── Bus ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct BusState {
    subscriptions: Vec<Subscription>,
    queues: HashMap<Subscriber, Arc<SubscriberQueue>>,
    sequences: HashMap<EventSource, u64>,
    next_subscription: u64,
    closed: bool,
}

impl BusState {
    fn next_sequence(&mut self, source: &EventSource) -> u64 {
        let seq = self.sequences.entry(source.clone()).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Queues of every subscriber with at least one matching subscription,
    /// in subscription order, each at most once.
    fn matching_queues(&self, event_type: &str) -> Vec<Arc<SubscriberQueue>> {
        let mut seen: Vec<&Subscriber> = Vec::new();
        let mut queues = Vec::new();
        for sub in &self.subscriptions {
            if !sub.pattern.matches(event_type) || seen.contains(&&sub.subscriber) {
                continue;
            }
            seen.push(&sub.subscriber);
            if let Some(queue) = self.queues.get(&sub.subscriber) {
                queues.push(queue.clone());
            }
        }
        queues
    }
}

/// The host-wide event bus. Construct once per host and share by `Arc`.
#[derive(Debug)]
pub struct EventBus {
    capacity: usize,
    state: Mutex<BusState>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(BusState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Create (or return) the inbound queue for `subscriber`.
    pub fn attach(&self, subscriber: Subscriber) -> Arc<SubscriberQueue> {
        let mut state = self.lock();
        let closed = state.closed;
        state
            .queues
            .entry(subscriber.clone())
            .or_insert_with(|| Arc::new(SubscriberQueue::new(subscriber, self.capacity, closed)))
            .clone()
    }

    /// Create the inbound queue for `subscriber` only if it has none yet.
    pub fn attach_new(&self, subscriber: Subscriber) -> Option<Arc<SubscriberQueue>> {
        let mut state = self.lock();
        if state.queues.contains_key(&subscriber) {
            return None;
        }
        let queue = Arc::new(SubscriberQueue::new(
            subscriber.clone(),
            self.capacity,
            state.closed,
        ));
        state.queues.insert(subscriber, queue.clone());
        Some(queue)
    }

    pub fn is_attached(&self, subscriber: &Subscriber) -> bool {
        self.lock().queues.contains_key(subscriber)
    }

    /// Add a subscription for an attached subscriber. Subscribing twice to
    /// the same pattern returns the existing id.
    pub fn subscribe(
        &self,
        subscriber: &Subscriber,
        pattern: EventPattern,
    ) -> Result<SubscriptionId, PluginError> {
        let mut state = self.lock();
        if !state.queues.contains_key(subscriber) {
            return Err(PluginError::NotFound(format!(
                "subscriber {subscriber} is not attached to the bus"
            )));
        }
        if let Some(existing) = state
            .subscriptions
            .iter()
            .find(|s| &s.subscriber == subscriber && s.pattern == pattern)
        {
            return Ok(existing.id);
        }
        state.next_subscription += 1;
        let id = SubscriptionId(state.next_subscription);
        tracing::debug!(subscriber = %subscriber, pattern = %pattern, id = id.0, "subscription added");
        state.subscriptions.push(Subscription {
            id,
            subscriber: subscriber.clone(),
            pattern,
        });
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| s.id != id);
        before != state.subscriptions.len()
    }

    /// Remove every subscription of `subscriber` and close its queue,
    /// discarding queued events. Idempotent; returns how many subscriptions
    /// were removed.
    pub fn detach(&self, subscriber: &Subscriber) -> usize {
        let mut state = self.lock();
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| &s.subscriber != subscriber);
        let removed = before - state.subscriptions.len();
        if let Some(queue) = state.queues.remove(subscriber) {
            queue.close();
            tracing::debug!(subscriber = %subscriber, removed, "subscriber detached");
        }
        removed
    }

    pub fn subscriptions_of(&self, subscriber: &Subscriber) -> Vec<Subscription> {
        self.lock()
            .subscriptions
            .iter()
            .filter(|s| &s.subscriber == subscriber)
            .cloned()
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Publish an event to every currently matching subscription.
    pub fn publish(
        &self,
        source: EventSource,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        correlation_id: Option<Uuid>,
    ) -> PublishReport {
        let event_type = event_type.into();
        let mut state = self.lock();

        let sequence = state.next_sequence(&source);
        let event = Arc::new(Event {
            event_type,
            source,
            payload,
            correlation_id: correlation_id.unwrap_or_else(Uuid::new_v4),
            sequence,
            timestamp: Utc::now(),
        });

        if state.closed {
            return PublishReport {
                event,
                delivered: 0,
                dropped: 0,
            };
        }

        let targets = state.matching_queues(&event.event_type);
        let mut evictions = Vec::new();
        for queue in &targets {
            if let Some(evicted) = queue.push(event.clone()) {
                evictions.push((queue.clone(), evicted));
            }
        }
        let dropped = evictions.len();

        for (queue, evicted) in evictions {
            if evicted.is_diagnostic() {
                queue.note_drop(None);
                continue;
            }
            tracing::warn!(
                subscriber = %queue.subscriber(),
                event = %evicted.event_type,
                source = %evicted.source,
                sequence = evicted.sequence,
                "subscriber queue full, dropped oldest event"
            );
            let diagnostic = Self::diagnostic(&mut state, queue.subscriber(), &evicted);
            queue.note_drop(Some(diagnostic.clone()));
            for observer in state.matching_queues(EVENT_DROPPED) {
                if observer.subscriber() == queue.subscriber() {
                    continue;
                }
                if observer.push(diagnostic.clone()).is_some() {
                    observer.note_drop(None);
                }
            }
        }

        PublishReport {
            delivered: targets.len(),
            dropped,
            event,
        }
    }

    /// Stop all delivery: close every queue and forget every subscription.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.subscriptions.clear();
        for (_, queue) in state.queues.drain() {
            queue.close();
        }
        tracing::info!("event bus closed");
    }

    fn diagnostic(state: &mut BusState, subscriber: &Subscriber, evicted: &Event) -> Arc<Event> {
        let payload = DroppedPayload {
            subscriber: subscriber.to_string(),
            dropped: evicted.reference(),
        };
        let sequence = state.next_sequence(&EventSource::Host);
        Arc::new(Event {
            event_type: EVENT_DROPPED.to_string(),
            source: EventSource::Host,
            payload: serde_json::to_value(payload).unwrap_or_default(),
            correlation_id: evicted.correlation_id,
            sequence,
            timestamp: Utc::now(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
