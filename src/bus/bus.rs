//! The in-process topic bus.
//!
//! Routing model: publishing derives every topic key a message matches
//! (`type:`, `sender:`, `receiver:`, `*`) and fans out synchronously to the
//! subscribers of those keys. Delivery is exactly-once per subscriber, keyed
//! by message id, so a subscriber registered on several matching topics (or
//! catching up via [`MessageBus::replay`]) still sees each message once.
//!
//! A failing subscriber never affects the others: callback errors are logged
//! and delivery continues. The bus is in-memory and ephemeral; the bounded
//! history buffer exists for replay and audit, not durability.

use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::warn;
use uuid::Uuid;

use super::message::{Message, MessageFilter};

/// Error type subscriber callbacks may return; the bus logs it and moves on.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

type Callback = Arc<dyn Fn(&Message) -> Result<(), SubscriberError> + Send + Sync>;

/// Handle identifying one subscriber; required for unsubscribe, replay, and
/// adding further topics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum BusError {
    #[error("unknown subscriber: {id}")]
    #[diagnostic(code(stageloom::bus::unknown_subscriber))]
    UnknownSubscriber { id: SubscriberId },
}

struct Subscription {
    topics: FxHashSet<String>,
    callback: Callback,
    /// Message ids already delivered to this subscriber.
    delivered: FxHashSet<Uuid>,
}

impl Subscription {
    fn matches(&self, message: &Message) -> bool {
        message
            .derived_topics()
            .iter()
            .any(|key| self.topics.contains(key))
    }
}

#[derive(Default)]
struct BusInner {
    /// Bounded history, oldest first.
    history: VecDeque<Message>,
    subscriptions: FxHashMap<SubscriberId, Subscription>,
    by_topic: FxHashMap<String, Vec<SubscriberId>>,
    next_id: u64,
}

/// Topic-based in-process message bus.
///
/// Cheap to share: wrap in an `Arc` and publish from anywhere. Callbacks are
/// invoked outside the internal lock, so a subscriber may itself publish.
pub struct MessageBus {
    inner: Mutex<BusInner>,
    history_limit: usize,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(100)
    }
}

impl MessageBus {
    /// Create a bus keeping at most `history_limit` messages.
    #[must_use]
    pub fn new(history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner::default()),
            history_limit: history_limit.max(1),
        }
    }

    /// Register a callback for every future message matching `topic`.
    ///
    /// Topic keys are built with [`topics`](super::topics):
    /// `type:<tag>`, `sender:<id>`, `receiver:<id>`, or `*`.
    pub fn subscribe<F>(&self, topic: impl Into<String>, callback: F) -> SubscriberId
    where
        F: Fn(&Message) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        let topic = topic.into();
        let mut inner = self.lock();
        let id = SubscriberId(inner.next_id);
        inner.next_id += 1;
        inner.subscriptions.insert(
            id,
            Subscription {
                topics: FxHashSet::from_iter([topic.clone()]),
                callback: Arc::new(callback),
                delivered: FxHashSet::default(),
            },
        );
        inner.by_topic.entry(topic).or_default().push(id);
        id
    }

    /// Subscribe an existing subscriber to an additional topic.
    ///
    /// Messages matching more than one of the subscriber's topics are still
    /// delivered once.
    pub fn add_topic(&self, id: SubscriberId, topic: impl Into<String>) -> Result<(), BusError> {
        let topic = topic.into();
        let mut inner = self.lock();
        let Some(sub) = inner.subscriptions.get_mut(&id) else {
            return Err(BusError::UnknownSubscriber { id });
        };
        if sub.topics.insert(topic.clone()) {
            inner.by_topic.entry(topic).or_default().push(id);
        }
        Ok(())
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> Result<(), BusError> {
        let mut inner = self.lock();
        let Some(sub) = inner.subscriptions.remove(&id) else {
            return Err(BusError::UnknownSubscriber { id });
        };
        for topic in &sub.topics {
            if let Some(ids) = inner.by_topic.get_mut(topic) {
                ids.retain(|s| *s != id);
            }
        }
        Ok(())
    }

    /// Publish a message to every subscriber whose topic matches one of its
    /// derived keys, each exactly once. Returns the number of successful
    /// deliveries.
    pub fn publish(&self, message: Message) -> usize {
        let pending = {
            let mut inner = self.lock();

            // Record history first, evicting the oldest entry past the cap
            // and forgetting its id in the dedup sets.
            inner.history.push_back(message.clone());
            if inner.history.len() > self.history_limit {
                if let Some(old) = inner.history.pop_front() {
                    for sub in inner.subscriptions.values_mut() {
                        sub.delivered.remove(&old.id);
                    }
                }
            }

            let mut candidates: Vec<SubscriberId> = Vec::new();
            for key in message.derived_topics() {
                if let Some(ids) = inner.by_topic.get(&key) {
                    candidates.extend(ids.iter().copied());
                }
            }

            let mut pending: Vec<(SubscriberId, Callback)> =
                Vec::with_capacity(candidates.len());
            for id in candidates {
                if let Some(sub) = inner.subscriptions.get_mut(&id) {
                    // Exactly-once: dedupe by subscriber identity, not by
                    // topic match count, and mark before invoking so a replay
                    // cannot deliver the same id again.
                    if sub.delivered.insert(message.id) {
                        pending.push((id, Arc::clone(&sub.callback)));
                    }
                }
            }
            pending
        };

        self.deliver(&message, pending)
    }

    /// Deliver any history matching the subscriber's topics it has not yet
    /// seen. Returns the number of successful deliveries.
    pub fn replay(&self, id: SubscriberId) -> Result<usize, BusError> {
        let batch = {
            let mut inner = self.lock();
            if !inner.subscriptions.contains_key(&id) {
                return Err(BusError::UnknownSubscriber { id });
            }
            let messages: Vec<Message> = inner.history.iter().cloned().collect();
            let mut batch = Vec::new();
            if let Some(sub) = inner.subscriptions.get_mut(&id) {
                for message in messages {
                    if sub.matches(&message) && sub.delivered.insert(message.id) {
                        batch.push((message, Arc::clone(&sub.callback)));
                    }
                }
            }
            batch
        };

        let mut delivered = 0;
        for (message, callback) in batch {
            delivered += self.deliver(&message, vec![(id, callback)]);
        }
        Ok(delivered)
    }

    /// Messages matching `filter`, oldest first.
    #[must_use]
    pub fn history(&self, filter: &MessageFilter) -> Vec<Message> {
        let inner = self.lock();
        inner
            .history
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect()
    }

    /// Topic keys with at least one subscriber, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let inner = self.lock();
        let mut topics: Vec<String> = inner
            .by_topic
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort_unstable();
        topics
    }

    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let inner = self.lock();
        inner.by_topic.get(topic).map_or(0, Vec::len)
    }

    /// Invoke callbacks outside the lock; errors are isolated per subscriber.
    fn deliver(&self, message: &Message, pending: Vec<(SubscriberId, Callback)>) -> usize {
        let mut delivered = 0;
        for (id, callback) in pending {
            match callback(message) {
                Ok(()) => delivered += 1,
                Err(error) => {
                    warn!(subscriber = %id, kind = %message.kind, %error, "subscriber callback failed");
                }
            }
        }
        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
