use super::{ChannelRegistry, CHAT_CHANNEL_PREFIX, ONLINE_CHANNEL_PREFIX};
use futures_util::{Stream, StreamExt};
use redis::Client;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Route every `chat-*` and `online-*` publication to local subscribers.
///
/// Runs forever and should be spawned in a background task. When the pub/sub connection fails or
/// its stream ends, it reconnects with exponential backoff.
pub async fn start_psub_listener(client: Client, registry: ChannelRegistry) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match listen(&client, &registry, &mut backoff).await {
            Ok(()) => warn!(
                retry_in_ms = backoff.as_millis() as u64,
                "Pub/sub stream ended, reconnecting"
            ),
            Err(e) => error!(
                error = %e,
                retry_in_ms = backoff.as_millis() as u64,
                "Pub/sub connection failed, reconnecting"
            ),
        }
        sleep(backoff).await;
        backoff = next_backoff(backoff);
    }
}

/// One pub/sub session. Resets `backoff` once both patterns are subscribed.
async fn listen(
    client: &Client,
    registry: &ChannelRegistry,
    backoff: &mut Duration,
) -> redis::RedisResult<()> {
    // PubSub requires a dedicated connection, not the shared manager
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(format!("{CHAT_CHANNEL_PREFIX}*")).await?;
    pubsub.psubscribe(format!("{ONLINE_CHANNEL_PREFIX}*")).await?;
    info!("Subscribed to chat and presence channels");
    *backoff = INITIAL_BACKOFF;

    let messages = pubsub.on_message().filter_map(|msg| async move {
        let channel = msg.get_channel_name().to_string();
        match msg.get_payload::<String>() {
            Ok(payload) => Some((channel, payload)),
            Err(e) => {
                error!(error = ?e, channel = %channel, "Failed to get message payload");
                None
            }
        }
    });
    forward(messages, registry).await;
    Ok(())
}

/// Broadcast each `(channel, payload)` until the stream ends.
async fn forward(messages: impl Stream<Item = (String, String)>, registry: &ChannelRegistry) {
    futures_util::pin_mut!(messages);
    while let Some((channel, payload)) = messages.next().await {
        registry.broadcast(&channel, &payload).await;
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}
