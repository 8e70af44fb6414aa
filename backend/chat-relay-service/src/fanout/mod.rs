//! Cross-process delivery.
//!
//! Every process pattern-subscribes once to the broker and hands each payload to the local
//! connections listening on that channel through the [`ChannelRegistry`].

pub mod pubsub;
mod registry;

pub use registry::{ChannelRegistry, SubscriberId};

use crate::error::AppResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

pub const CHAT_CHANNEL_PREFIX: &str = "chat-";
pub const ONLINE_CHANNEL_PREFIX: &str = "online-";

pub fn chat_channel(user: &Uuid) -> String {
    format!("{CHAT_CHANNEL_PREFIX}{user}")
}

pub fn online_channel(user: &Uuid) -> String {
    format!("{ONLINE_CHANNEL_PREFIX}{user}")
}

/// Pub/sub plus a small key-value store, as offered by Redis.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> AppResult<()>;

    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    /// Publish `payload` on `channel` and store it under the same key, atomically.
    async fn publish_and_set(&self, channel: &str, payload: &str, ttl: Duration) -> AppResult<()>;
}

/// Single-process broker that delivers straight into a registry. Values never expire.
pub struct MemoryBroker {
    registry: ChannelRegistry,
    values: Mutex<HashMap<String, String>>,
}

impl MemoryBroker {
    pub fn new(registry: ChannelRegistry) -> Self {
        Self {
            registry,
            values: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: &str) -> AppResult<()> {
        self.registry.broadcast(channel, payload).await;
        Ok(())
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    async fn publish_and_set(&self, channel: &str, payload: &str, _ttl: Duration) -> AppResult<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.to_string(), payload.to_string());
        self.publish(channel, payload).await
    }
}
