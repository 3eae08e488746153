//! Messages exchanged on the in-process bus, and the topic keys that route
//! them.
//!
//! A subscriber does not subscribe to a message type directly but to a
//! *topic*: one of `type:<tag>`, `sender:<id>`, `receiver:<id>`, or the
//! wildcard `*`. Publishing derives every key a message matches; routing is
//! the bus's job, the keys are built here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Topic key constructors.
pub mod topics {
    /// Matches every published message.
    pub const WILDCARD: &str = "*";

    /// Topic matching messages of one type tag.
    #[must_use]
    pub fn message_type(tag: &str) -> String {
        format!("type:{tag}")
    }

    /// Topic matching messages from one sender.
    #[must_use]
    pub fn sender(id: &str) -> String {
        format!("sender:{id}")
    }

    /// Topic matching messages addressed to one receiver.
    #[must_use]
    pub fn receiver(id: &str) -> String {
        format!("receiver:{id}")
    }
}

/// Well-known message type tags published by the engine itself.
///
/// The bus accepts arbitrary tags; these constants exist so engine and
/// application code agree on spelling.
pub mod types {
    pub const STAGE_STARTED: &str = "stage_started";
    pub const STAGE_COMPLETE: &str = "stage_complete";
    pub const STAGE_FAILED: &str = "stage_failed";
    pub const REVISION_REQUESTED: &str = "revision_requested";
    pub const PIPELINE_FINISHED: &str = "pipeline_finished";
}

/// A single bus message.
///
/// Messages are immutable once published. The `id` is the deduplication key
/// for exactly-once delivery; `correlation_id` ties together messages that
/// belong to the same logical exchange (a revision request and the re-run it
/// triggers, for example). An absent `receiver` means broadcast.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    /// Type tag, e.g. `stage_complete`.
    pub kind: String,
    pub sender: String,
    pub receiver: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub payload: Value,
    pub published_at: DateTime<Utc>,
}

impl Message {
    #[must_use]
    pub fn new(kind: impl Into<String>, sender: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            sender: sender.into(),
            receiver: None,
            correlation_id: None,
            payload,
            published_at: Utc::now(),
        }
    }

    /// Address the message to a single receiver instead of broadcasting.
    #[must_use]
    pub fn to(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    /// Attach a correlation id linking this message to an earlier one.
    #[must_use]
    pub fn correlated_with(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Every topic key this message matches, wildcard included.
    #[must_use]
    pub fn derived_topics(&self) -> Vec<String> {
        let mut keys = vec![
            topics::message_type(&self.kind),
            topics::sender(&self.sender),
        ];
        if let Some(receiver) = &self.receiver {
            keys.push(topics::receiver(receiver));
        }
        keys.push(topics::WILDCARD.to_string());
        keys
    }
}

/// Predicate over messages, used for history queries.
///
/// Empty filter matches everything; each set field narrows the match.
#[derive(Clone, Debug, Default)]
pub struct MessageFilter {
    pub kind: Option<String>,
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub correlation_id: Option<Uuid>,
}

impl MessageFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    #[must_use]
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    #[must_use]
    pub fn receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    #[must_use]
    pub fn since(mut self, at: DateTime<Utc>) -> Self {
        self.since = Some(at);
        self
    }

    #[must_use]
    pub fn until(mut self, at: DateTime<Utc>) -> Self {
        self.until = Some(at);
        self
    }

    #[must_use]
    pub fn correlated_with(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    #[must_use]
    pub fn matches(&self, message: &Message) -> bool {
        if let Some(kind) = &self.kind {
            if &message.kind != kind {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            if &message.sender != sender {
                return false;
            }
        }
        if let Some(receiver) = &self.receiver {
            if message.receiver.as_ref() != Some(receiver) {
                return false;
            }
        }
        if let Some(since) = &self.since {
            if message.published_at < *since {
                return false;
            }
        }
        if let Some(until) = &self.until {
            if message.published_at > *until {
                return false;
            }
        }
        if let Some(correlation) = &self.correlation_id {
            if message.correlation_id.as_ref() != Some(correlation) {
                return false;
            }
        }
        true
    }
}
