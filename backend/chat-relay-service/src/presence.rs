use crate::classifier::MessageGate;
use crate::error::AppResult;
use crate::fanout::{online_channel, Broker, ChannelRegistry, SubscriberId};
use crate::stanza::render;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnlineStatus {
    Online,
    OnlineRecently,
    Offline,
}

impl OnlineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnlineStatus::Online => "online",
            OnlineStatus::OnlineRecently => "online-recently",
            OnlineStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for OnlineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-user online status, published on `online-{uuid}` and kept in the broker for late
/// subscribers.
#[derive(Clone)]
pub struct Presence {
    broker: Arc<dyn Broker>,
    registry: ChannelRegistry,
    ttl: Duration,
}

impl Presence {
    pub fn new(broker: Arc<dyn Broker>, registry: ChannelRegistry, ttl: Duration) -> Self {
        Self {
            broker,
            registry,
            ttl,
        }
    }

    pub async fn set_status(&self, user: Uuid, status: OnlineStatus) -> AppResult<()> {
        let event = render::online_event(&user.to_string(), status.as_str());
        self.broker
            .publish_and_set(&online_channel(&user), &event, self.ttl)
            .await
    }

    /// Whether `user` is connected anywhere right now.
    pub async fn is_online(&self, user: Uuid) -> AppResult<bool> {
        let event = self.broker.get(&online_channel(&user)).await?;
        let online = render::online_event(&user.to_string(), OnlineStatus::Online.as_str());
        Ok(event.as_deref() == Some(online.as_str()))
    }

    /// Start forwarding `target`'s status changes to a connection.
    ///
    /// Returns the frames to send straight away: the acknowledgement and, unless either side
    /// blocked the other, the last known status.
    pub async fn subscribe(
        &self,
        gate: &MessageGate,
        watcher: Uuid,
        subscriber_id: SubscriberId,
        sender: UnboundedSender<String>,
        target: &str,
    ) -> Vec<String> {
        match self
            .try_subscribe(gate, watcher, subscriber_id, sender, target)
            .await
        {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, target = %target, "presence subscription failed");
                vec![render::subscribe_unsuccessful(target)]
            }
        }
    }

    async fn try_subscribe(
        &self,
        gate: &MessageGate,
        watcher: Uuid,
        subscriber_id: SubscriberId,
        sender: UnboundedSender<String>,
        target: &str,
    ) -> AppResult<Vec<String>> {
        let Ok(target_uuid) = Uuid::parse_str(target) else {
            return Ok(vec![render::subscribe_unsuccessful(target)]);
        };

        let blocked = gate.resolve_pair(watcher, target_uuid).await?.is_none();
        if blocked {
            return Ok(vec![render::subscribe_successful(target)]);
        }

        let channel = online_channel(&target_uuid);
        self.registry
            .add_subscriber(&channel, subscriber_id, sender)
            .await;

        let current = match self.broker.get(&channel).await? {
            Some(event) => event,
            None => render::online_event(target, OnlineStatus::Offline.as_str()),
        };
        Ok(vec![render::subscribe_successful(target), current])
    }

    pub async fn unsubscribe(&self, subscriber_id: SubscriberId, target: &str) -> String {
        match Uuid::parse_str(target) {
            Ok(target_uuid) => {
                self.registry
                    .remove_subscriber(&online_channel(&target_uuid), subscriber_id)
                    .await;
                render::unsubscribe_successful(target)
            }
            Err(_) => render::unsubscribe_unsuccessful(target),
        }
    }
}
