//! Push notifications for recipients who are not connected.

use anyhow::{bail, Context};
use async_trait::async_trait;
use batcher::{BatchProcessor, Batcher, BatcherConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const MAX_NOTIFICATION_LENGTH: usize = 140;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// True once the push service accepted the notification.
    async fn send(&self, token: &str, title: &str, body: &str) -> bool;
}

pub fn notification_title(is_intro: bool) -> &'static str {
    if is_intro {
        "New intro"
    } else {
        "New message"
    }
}

/// First line of the message, cut to what fits in a notification.
pub fn notification_body(text: Option<&str>) -> String {
    let first_line = match text {
        Some(text) => text.lines().next().unwrap_or_default().trim(),
        None => "Voice message",
    };
    first_line.chars().take(MAX_NOTIFICATION_LENGTH).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    pub to: String,
    pub title: String,
    pub body: String,
    pub sound: &'static str,
    pub priority: &'static str,
}

#[derive(Debug, Deserialize)]
struct PushTicket {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    #[serde(default)]
    data: Vec<PushTicket>,
}

struct PushSender {
    endpoint: String,
    http_client: reqwest::Client,
}

#[async_trait]
impl BatchProcessor<PushMessage> for PushSender {
    async fn process_batch(&self, batch: &[PushMessage]) -> anyhow::Result<()> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .header("Accept", "application/json")
            .json(batch)
            .send()
            .await
            .context("push send request failed")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            bail!("push API error: {} - {}", status, error_text);
        }

        let parsed: PushResponse = response
            .json()
            .await
            .context("failed to parse push response")?;
        for (ticket, message) in parsed.data.iter().zip(batch) {
            if ticket.status != "ok" {
                warn!(
                    token = %message.to,
                    status = %ticket.status,
                    message = ?ticket.message,
                    "push notification rejected"
                );
            }
        }

        debug!(notifications = batch.len(), "push batch sent");
        Ok(())
    }
}

/// Expo-style push API client. Notifications are posted in batches of up to 100.
pub struct ExpoNotifier {
    batcher: Batcher<PushMessage>,
}

impl ExpoNotifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let sender = PushSender {
            endpoint: endpoint.into(),
            http_client: reqwest::Client::new(),
        };
        let batcher = Batcher::new(
            BatcherConfig::new("push-notifications")
                .flush_interval(Duration::from_secs(1))
                .max_batch_size(100),
            Arc::new(sender),
        );
        batcher.start();
        Self { batcher }
    }

    pub async fn shutdown(&self) {
        self.batcher.shutdown().await;
    }
}

#[async_trait]
impl Notifier for ExpoNotifier {
    async fn send(&self, token: &str, title: &str, body: &str) -> bool {
        let done = self.batcher.enqueue_with_ack(PushMessage {
            to: token.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            sound: "default",
            priority: "high",
        });
        done.await.is_ok()
    }
}
