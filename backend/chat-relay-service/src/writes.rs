//! Batched writes.
//!
//! Each table the relay writes on the hot path gets its own [`Batcher`], so a burst of messages
//! turns into a handful of round trips. None of them retry: a failed batch is logged and dropped.

use crate::store::{
    Directory, DisplayedMark, LastNotification, MessageStore, PushTokenUpdate, StoredMessage,
};
use anyhow::Context;
use async_trait::async_trait;
use batcher::{BatchProcessor, Batcher, BatcherConfig};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct StoreMessages(Arc<dyn MessageStore>);

#[async_trait]
impl BatchProcessor<StoredMessage> for StoreMessages {
    async fn process_batch(&self, batch: &[StoredMessage]) -> anyhow::Result<()> {
        self.0
            .store_messages(batch)
            .await
            .context("failed to store messages")
    }
}

struct MarkDisplayed(Arc<dyn MessageStore>);

#[async_trait]
impl BatchProcessor<DisplayedMark> for MarkDisplayed {
    async fn process_batch(&self, batch: &[DisplayedMark]) -> anyhow::Result<()> {
        self.0
            .mark_displayed(batch)
            .await
            .context("failed to mark conversations displayed")
    }
}

struct UpsertIntroHashes(Arc<dyn MessageStore>);

#[async_trait]
impl BatchProcessor<String> for UpsertIntroHashes {
    async fn process_batch(&self, batch: &[String]) -> anyhow::Result<()> {
        self.0
            .upsert_intro_hashes(batch)
            .await
            .context("failed to upsert intro hashes")
    }
}

struct TouchLastOnline(Arc<dyn Directory>);

#[async_trait]
impl BatchProcessor<Uuid> for TouchLastOnline {
    async fn process_batch(&self, batch: &[Uuid]) -> anyhow::Result<()> {
        self.0
            .touch_last_online(batch)
            .await
            .context("failed to update last online time")
    }
}

struct RecordLastNotifications(Arc<dyn Directory>);

#[async_trait]
impl BatchProcessor<LastNotification> for RecordLastNotifications {
    async fn process_batch(&self, batch: &[LastNotification]) -> anyhow::Result<()> {
        self.0
            .record_last_notifications(batch)
            .await
            .context("failed to record last notification time")
    }
}

struct SetPushTokens(Arc<dyn Directory>);

#[async_trait]
impl BatchProcessor<PushTokenUpdate> for SetPushTokens {
    async fn process_batch(&self, batch: &[PushTokenUpdate]) -> anyhow::Result<()> {
        self.0
            .set_push_tokens(batch)
            .await
            .context("failed to set push tokens")
    }
}

fn config(name: &str, flush_interval: Duration, max_batch_size: usize) -> BatcherConfig {
    BatcherConfig::new(name)
        .flush_interval(flush_interval)
        .min_batch_size(1)
        .max_batch_size(max_batch_size)
        .retry(false)
}

pub struct Writes {
    pub messages: Batcher<StoredMessage>,
    pub displayed: Batcher<DisplayedMark>,
    pub intro_hashes: Batcher<String>,
    pub last_online: Batcher<Uuid>,
    pub last_notifications: Batcher<LastNotification>,
    pub push_tokens: Batcher<PushTokenUpdate>,
}

impl Writes {
    pub fn new(directory: Arc<dyn Directory>, messages: Arc<dyn MessageStore>) -> Self {
        let second = Duration::from_secs(1);
        Self {
            messages: Batcher::new(
                config("store-messages", Duration::from_millis(500), 1000),
                Arc::new(StoreMessages(messages.clone())),
            ),
            displayed: Batcher::new(
                config("mark-displayed", second, 1000),
                Arc::new(MarkDisplayed(messages.clone())),
            ),
            intro_hashes: Batcher::new(
                config("intro-hashes", second, 1000),
                Arc::new(UpsertIntroHashes(messages)),
            ),
            last_online: Batcher::new(
                config("last-online", second, 1000),
                Arc::new(TouchLastOnline(directory.clone())),
            ),
            last_notifications: Batcher::new(
                config("last-notifications", second, 1000),
                Arc::new(RecordLastNotifications(directory.clone())),
            ),
            push_tokens: Batcher::new(
                config("push-tokens", second, 100),
                Arc::new(SetPushTokens(directory)),
            ),
        }
    }

    pub fn start(&self) {
        self.messages.start();
        self.displayed.start();
        self.intro_hashes.start();
        self.last_online.start();
        self.last_notifications.start();
        self.push_tokens.start();
    }

    pub async fn shutdown(&self) {
        self.messages.shutdown().await;
        self.displayed.shutdown().await;
        self.intro_hashes.shutdown().await;
        self.last_online.shutdown().await;
        self.last_notifications.shutdown().await;
        self.push_tokens.shutdown().await;
    }

    /// Shorten every flush interval; integration tests use this to avoid sleeping.
    pub fn set_flush_interval(&self, flush_interval: Duration) {
        self.messages.set_flush_interval(flush_interval);
        self.displayed.set_flush_interval(flush_interval);
        self.intro_hashes.set_flush_interval(flush_interval);
        self.last_online.set_flush_interval(flush_interval);
        self.last_notifications.set_flush_interval(flush_interval);
        self.push_tokens.set_flush_interval(flush_interval);
    }
}
