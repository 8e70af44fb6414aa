//! Storage collaborators.
//!
//! [`Directory`] answers questions about people (sessions, blocks, trust, push tokens) from tables
//! other services own. [`MessageStore`] owns the chat tables: archive, inbox and intro hashes.
//! Both have a PostgreSQL implementation and an in-memory one for tests.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::AppResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Internal numeric id of a person
pub type PersonId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationLevel {
    None,
    Unverified,
    Basics,
    Photos,
}

impl VerificationLevel {
    pub fn from_id(id: i32) -> Self {
        match id {
            1 => VerificationLevel::Unverified,
            2 => VerificationLevel::Basics,
            3 => VerificationLevel::Photos,
            _ => VerificationLevel::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustProfile {
    pub verification_level: VerificationLevel,
    /// Account must pass age verification before sending intros
    pub verification_required: bool,
    pub sign_up_time: DateTime<Utc>,
}

/// Inputs to the daily intro quota, all counted over the last 24 hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub verification_level: VerificationLevel,
    pub recent_reports: u32,
    pub recent_rude_messages: u32,
    pub intros_today: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mailbox {
    /// Last message was sent by the owner
    Chats,
    /// Last message was received by the owner
    Inbox,
}

impl Mailbox {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mailbox::Chats => "chats",
            Mailbox::Inbox => "inbox",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "inbox" => Mailbox::Inbox,
            _ => Mailbox::Chats,
        }
    }
}

/// A delivered message ready to be written to both archives and both inbox rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub from: Uuid,
    pub to: Uuid,
    pub from_id: PersonId,
    pub to_id: PersonId,
    pub stanza_id: String,
    pub body: String,
    pub audio_uuid: Option<String>,
    /// Outbound archive id; the inbound copy uses `archive_id + 1`
    pub archive_id: i64,
    /// Rendered message as delivered to the recipient
    pub content: String,
    pub search_body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub owner: Uuid,
    pub id: i64,
    pub sender: Uuid,
    pub recipient: Uuid,
    pub stanza_id: String,
    pub body: String,
    pub audio_uuid: Option<String>,
    pub search_body: String,
}

impl ArchiveRecord {
    pub fn counterpart(&self) -> Uuid {
        if self.sender == self.owner {
            self.recipient
        } else {
            self.sender
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxEntry {
    pub owner: Uuid,
    pub counterpart: Uuid,
    pub msg_id: String,
    pub mailbox: Mailbox,
    pub content: String,
    pub updated_at_us: i64,
    pub unread_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayedMark {
    pub owner: Uuid,
    pub counterpart: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTokenUpdate {
    pub username: Uuid,
    /// `None` clears the token
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LastNotification {
    pub username: Uuid,
    pub is_intro: bool,
}

/// Read access to people, plus the handful of small writes the relay makes about them.
#[async_trait]
pub trait Directory: Send + Sync {
    /// True when `token_hash` is an unexpired session of `person`.
    async fn check_session(&self, person: Uuid, token_hash: &str) -> AppResult<bool>;

    async fn person_id(&self, person: Uuid) -> AppResult<Option<PersonId>>;

    /// Either side skipped (blocked or reported) the other.
    async fn is_skipped(&self, a: PersonId, b: PersonId) -> AppResult<bool>;

    /// Neither party has messaged the other yet.
    async fn is_intro(&self, from: PersonId, to: PersonId) -> AppResult<bool>;

    async fn trust_profile(&self, person: PersonId) -> AppResult<TrustProfile>;

    async fn rate_limit_snapshot(&self, person: PersonId) -> AppResult<RateLimitSnapshot>;

    async fn record_rude_message(&self, person: PersonId, body: &str) -> AppResult<()>;

    async fn push_token(&self, person: Uuid) -> AppResult<Option<String>>;

    async fn set_push_tokens(&self, batch: &[PushTokenUpdate]) -> AppResult<()>;

    async fn touch_last_online(&self, batch: &[Uuid]) -> AppResult<()>;

    async fn record_last_notifications(&self, batch: &[LastNotification]) -> AppResult<()>;
}

/// Chat-owned tables.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Write both archive copies, both inbox rows and the messaged pair of every message, in one
    /// transaction.
    async fn store_messages(&self, batch: &[StoredMessage]) -> AppResult<()>;

    /// Up to `limit` records between `owner` and `counterpart` with id below `before`,
    /// newest first.
    async fn archive_page(
        &self,
        owner: Uuid,
        counterpart: Uuid,
        before: Option<i64>,
        limit: usize,
    ) -> AppResult<Vec<ArchiveRecord>>;

    async fn mark_displayed(&self, batch: &[DisplayedMark]) -> AppResult<()>;

    /// All conversations of `owner`, ordered by counterpart.
    async fn inbox(&self, owner: Uuid) -> AppResult<Vec<InboxEntry>>;

    /// The hash was used within the last 7 days.
    async fn intro_hash_seen(&self, hash: &str) -> AppResult<bool>;

    async fn upsert_intro_hashes(&self, batch: &[String]) -> AppResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_level_from_id() {
        assert_eq!(VerificationLevel::from_id(0), VerificationLevel::None);
        assert_eq!(VerificationLevel::from_id(1), VerificationLevel::Unverified);
        assert_eq!(VerificationLevel::from_id(2), VerificationLevel::Basics);
        assert_eq!(VerificationLevel::from_id(3), VerificationLevel::Photos);
        assert_eq!(VerificationLevel::from_id(9), VerificationLevel::None);
    }

    #[test]
    fn test_archive_counterpart() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut record = ArchiveRecord {
            owner: a,
            id: 1,
            sender: a,
            recipient: b,
            stanza_id: "s".into(),
            body: "hi".into(),
            audio_uuid: None,
            search_body: "hi".into(),
        };
        assert_eq!(record.counterpart(), b);

        record.owner = b;
        assert_eq!(record.counterpart(), a);
    }
}
