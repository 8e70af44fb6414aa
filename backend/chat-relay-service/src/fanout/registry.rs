use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc::UnboundedSender, RwLock};
use uuid::Uuid;

/// Unique identifier for a connection's subscriptions
///
/// A connection registers under the same id on every channel it listens to, so all of its entries
/// can be dropped in one call when it closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SubscriberId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

struct Subscriber {
    id: SubscriberId,
    sender: UnboundedSender<String>,
}

/// Channel registry for local connections
///
/// Maps broker channel names (`chat-{uuid}`, `online-{uuid}`) to the outbound queues of the
/// connections in this process that listen on them.
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    inner: Arc<RwLock<HashMap<String, Vec<Subscriber>>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on `channel`. Registering the same subscriber twice keeps one entry.
    pub async fn add_subscriber(
        &self,
        channel: &str,
        subscriber_id: SubscriberId,
        sender: UnboundedSender<String>,
    ) {
        let mut guard = self.inner.write().await;
        let subscribers = guard.entry(channel.to_string()).or_default();
        if subscribers.iter().any(|s| s.id == subscriber_id) {
            return;
        }
        subscribers.push(Subscriber {
            id: subscriber_id,
            sender,
        });

        tracing::debug!(
            "Added subscriber {:?} to channel {}, total subscribers: {}",
            subscriber_id,
            channel,
            subscribers.len()
        );
    }

    pub async fn remove_subscriber(&self, channel: &str, subscriber_id: SubscriberId) {
        let mut guard = self.inner.write().await;

        if let Some(subscribers) = guard.get_mut(channel) {
            subscribers.retain(|s| s.id != subscriber_id);

            if subscribers.is_empty() {
                guard.remove(channel);
                tracing::debug!("Removed empty channel {} from registry", channel);
            }
        }
    }

    /// Drop every entry of a closing connection.
    pub async fn remove_all(&self, subscriber_id: SubscriberId) {
        let mut guard = self.inner.write().await;
        guard.retain(|_, subscribers| {
            subscribers.retain(|s| s.id != subscriber_id);
            !subscribers.is_empty()
        });
    }

    /// Deliver to every local subscriber of `channel`
    ///
    /// Subscribers whose queue is gone are cleaned up.
    pub async fn broadcast(&self, channel: &str, msg: &str) {
        let mut guard = self.inner.write().await;
        if let Some(subscribers) = guard.get_mut(channel) {
            let before = subscribers.len();
            subscribers.retain(|subscriber| subscriber.sender.send(msg.to_string()).is_ok());
            let after = subscribers.len();

            if before != after {
                tracing::debug!(
                    "Broadcast to channel {}: {} dead senders cleaned up, {} active",
                    channel,
                    before - after,
                    after
                );
            }
            if after == 0 {
                guard.remove(channel);
            }
        }
    }

    pub async fn subscriber_count(&self, channel: &str) -> usize {
        let guard = self.inner.read().await;
        guard.get(channel).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn test_broadcast_reaches_each_subscriber_once() {
        let registry = ChannelRegistry::new();
        let (tx, mut rx) = unbounded_channel();
        let id = SubscriberId::new();

        registry.add_subscriber("chat-a", id, tx.clone()).await;
        registry.add_subscriber("chat-a", id, tx).await;
        assert_eq!(registry.subscriber_count("chat-a").await, 1);

        registry.broadcast("chat-a", "hello").await;
        registry.broadcast("chat-b", "nobody").await;
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_all() {
        let registry = ChannelRegistry::new();
        let (tx, _rx) = unbounded_channel();
        let (other_tx, _other_rx) = unbounded_channel();
        let id = SubscriberId::new();
        let other = SubscriberId::new();

        registry.add_subscriber("chat-a", id, tx.clone()).await;
        registry.add_subscriber("online-b", id, tx).await;
        registry.add_subscriber("online-b", other, other_tx).await;

        registry.remove_all(id).await;
        assert_eq!(registry.subscriber_count("chat-a").await, 0);
        assert_eq!(registry.subscriber_count("online-b").await, 1);

        registry.remove_subscriber("online-b", other).await;
        assert_eq!(registry.subscriber_count("online-b").await, 0);
    }

    #[tokio::test]
    async fn test_dead_senders_cleaned_up() {
        let registry = ChannelRegistry::new();
        let (tx, rx) = unbounded_channel();
        registry.add_subscriber("chat-a", SubscriberId::new(), tx).await;
        drop(rx);

        registry.broadcast("chat-a", "hello").await;
        assert_eq!(registry.subscriber_count("chat-a").await, 0);
    }
}
