//! Voice message blobs.

use crate::error::AppResult;
use crate::notify::MAX_NOTIFICATION_LENGTH;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Body archived for voice messages so older clients show something sensible. The padding keeps
/// everything after the first line out of inbox previews and notifications.
pub static AUDIO_MESSAGE_BODY: Lazy<String> = Lazy::new(|| {
    format!(
        "Voice message\n{}\nUpgrade to the latest version of Duolicious to hear this message",
        "\u{a0}".repeat(MAX_NOTIFICATION_LENGTH)
    )
});

#[async_trait]
pub trait AudioStore: Send + Sync {
    async fn put(&self, audio_uuid: &str, audio: &[u8]) -> AppResult<()>;
}

/// Writes each clip to `{dir}/{audio_uuid}.aac`.
pub struct FsAudioStore {
    dir: PathBuf,
}

impl FsAudioStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl AudioStore for FsAudioStore {
    async fn put(&self, audio_uuid: &str, audio: &[u8]) -> AppResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("{audio_uuid}.aac"));
        tokio::fs::write(&path, audio).await?;
        debug!(path = %path.display(), bytes = audio.len(), "stored audio clip");
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAudioStore {
    clips: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryAudioStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, audio_uuid: &str) -> Option<Vec<u8>> {
        self.clips
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(audio_uuid)
            .cloned()
    }
}

#[async_trait]
impl AudioStore for MemoryAudioStore {
    async fn put(&self, audio_uuid: &str, audio: &[u8]) -> AppResult<()> {
        self.clips
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(audio_uuid.to_string(), audio.to_vec());
        Ok(())
    }
}
