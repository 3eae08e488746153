//! In-process topic message bus with derived-key routing, bounded history,
//! and exactly-once per-subscriber delivery.

#[allow(clippy::module_inception)]
mod bus;
mod message;

pub use bus::{BusError, MessageBus, SubscriberError, SubscriberId};
pub use message::{topics, types, Message, MessageFilter};
