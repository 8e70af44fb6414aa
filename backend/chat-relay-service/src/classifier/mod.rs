//! Gates every inbound message passes before delivery.
//!
//! Gates run in a fixed order and the first one that rejects decides the response:
//!
//! 1. length
//! 2. block list (and unknown sender or recipient)
//! 3. typing notifications skip everything below
//! 4. intro classification; the remaining gates only apply to intros
//! 5. age verification
//! 6. rudeness
//! 7. spam, unless the sender is trusted
//! 8. daily intro quota
//! 9. uniqueness
//!
//! Lookups are memoized with short-lived caches since the same pair usually exchanges several
//! messages in a row.

pub mod ratelimit;
pub mod text;
pub mod uniqueness;

use crate::error::{AppError, AppResult};
use crate::stanza::render;
use crate::stanza::MessageStanza;
use crate::store::{
    Directory, MessageStore, PersonId, RateLimitSnapshot, TrustProfile, VerificationLevel,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use ttl_cache::{TtlCache, DEFAULT_CAPACITY};
use uuid::Uuid;

pub use text::{HeuristicClassifier, TextClassifier};

const SKIPPED_TTL: Duration = Duration::from_secs(5);
const VERIFICATION_TTL: Duration = Duration::from_secs(3);
const RATE_LIMIT_TTL: Duration = Duration::from_secs(5);
const TRUST_TTL: Duration = Duration::from_secs(60);
const INTRO_CACHE_CAPACITY: usize = 16 * DEFAULT_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Either side skipped the other, or one of them doesn't exist
    Skipped,
    AgeVerification,
    Offensive,
    Spam,
    RateLimited(VerificationLevel),
}

impl BlockReason {
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            BlockReason::Skipped => None,
            BlockReason::AgeVerification => Some("age-verification"),
            BlockReason::Offensive => Some("offensive"),
            BlockReason::Spam => Some("spam"),
            BlockReason::RateLimited(_) => Some("rate-limited-1day"),
        }
    }

    pub fn subreason(&self) -> Option<&'static str> {
        match self {
            BlockReason::RateLimited(VerificationLevel::Unverified) => Some("unverified-basics"),
            BlockReason::RateLimited(VerificationLevel::Basics) => Some("unverified-photos"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    TooLong,
    Blocked(BlockReason),
    NotUnique,
    /// Forward to the recipient without storing or acknowledging
    Typing { from_id: PersonId, to_id: PersonId },
    Deliver {
        from_id: PersonId,
        to_id: PersonId,
        is_intro: bool,
        /// Hash to record once the message is accepted
        intro_hash: Option<String>,
    },
}

impl Verdict {
    /// Response to the sender, if the verdict has one of its own.
    pub fn rejection(&self, stanza_id: &str) -> Option<String> {
        match self {
            Verdict::TooLong => Some(render::message_too_long(stanza_id)),
            Verdict::Blocked(reason) => Some(render::message_blocked(
                stanza_id,
                reason.reason(),
                reason.subreason(),
            )),
            Verdict::NotUnique => Some(render::message_not_unique(stanza_id)),
            Verdict::Typing { .. } | Verdict::Deliver { .. } => None,
        }
    }
}

/// Old enough accounts skip the spam filter; the bar drops as verification rises.
pub fn is_trusted(profile: &TrustProfile, now: DateTime<Utc>) -> bool {
    let threshold = match profile.verification_level {
        VerificationLevel::None => return false,
        VerificationLevel::Unverified => ChronoDuration::days(30),
        VerificationLevel::Basics => ChronoDuration::days(7),
        VerificationLevel::Photos => ChronoDuration::days(1),
    };
    now - profile.sign_up_time >= threshold
}

fn pair(a: PersonId, b: PersonId) -> (PersonId, PersonId) {
    (a.min(b), a.max(b))
}

pub struct MessageGate {
    directory: Arc<dyn Directory>,
    messages: Arc<dyn MessageStore>,
    text: Arc<dyn TextClassifier>,
    max_message_len: usize,
    person_ids: TtlCache<Uuid, Option<PersonId>>,
    skipped: TtlCache<(PersonId, PersonId), bool>,
    intros: TtlCache<(PersonId, PersonId), bool>,
    verification_required: TtlCache<PersonId, bool>,
    trust: TtlCache<PersonId, TrustProfile>,
    rate_limits: TtlCache<PersonId, RateLimitSnapshot>,
}

impl MessageGate {
    pub fn new(
        directory: Arc<dyn Directory>,
        messages: Arc<dyn MessageStore>,
        text: Arc<dyn TextClassifier>,
        max_message_len: usize,
    ) -> Self {
        Self {
            directory,
            messages,
            text,
            max_message_len,
            // Ids never change once assigned; misses are not kept
            person_ids: TtlCache::new("person_ids", INTRO_CACHE_CAPACITY)
                .with_condition(Option::is_some),
            skipped: TtlCache::new("skipped", DEFAULT_CAPACITY).with_ttl(SKIPPED_TTL),
            // Once two people have talked they stay past the intro stage
            intros: TtlCache::new("intros", INTRO_CACHE_CAPACITY)
                .with_condition(|is_intro: &bool| !*is_intro),
            verification_required: TtlCache::new("verification_required", DEFAULT_CAPACITY)
                .with_ttl(VERIFICATION_TTL),
            trust: TtlCache::new("trust", DEFAULT_CAPACITY).with_ttl(TRUST_TTL),
            rate_limits: TtlCache::new("rate_limits", DEFAULT_CAPACITY).with_ttl(RATE_LIMIT_TTL),
        }
    }

    async fn person_id(&self, person: Uuid) -> AppResult<Option<PersonId>> {
        self.person_ids
            .get_or_try_insert_with(person, || self.directory.person_id(person))
            .await
    }

    pub async fn is_skipped(&self, a: PersonId, b: PersonId) -> AppResult<bool> {
        self.skipped
            .get_or_try_insert_with(pair(a, b), || self.directory.is_skipped(a, b))
            .await
    }

    async fn is_intro(&self, from: PersonId, to: PersonId) -> AppResult<bool> {
        self.intros
            .get_or_try_insert_with(pair(from, to), || self.directory.is_intro(from, to))
            .await
    }

    /// Resolve both parties and check neither blocked the other.
    ///
    /// Returns `None` when either is unknown or the pair is blocked.
    pub async fn resolve_pair(
        &self,
        from: Uuid,
        to: Uuid,
    ) -> AppResult<Option<(PersonId, PersonId)>> {
        let (Some(from_id), Some(to_id)) = (self.person_id(from).await?, self.person_id(to).await?)
        else {
            return Ok(None);
        };
        if self.is_skipped(from_id, to_id).await? {
            return Ok(None);
        }
        Ok(Some((from_id, to_id)))
    }

    pub async fn evaluate(&self, from: Uuid, message: &MessageStanza) -> AppResult<Verdict> {
        if let Some(text) = message.text() {
            if text.chars().count() > self.max_message_len {
                return Ok(Verdict::TooLong);
            }
        }

        let Some((from_id, to_id)) = self.resolve_pair(from, message.to()).await? else {
            return Ok(Verdict::Blocked(BlockReason::Skipped));
        };

        if let MessageStanza::Typing { .. } = message {
            return Ok(Verdict::Typing { from_id, to_id });
        }

        if !self.is_intro(from_id, to_id).await? {
            return Ok(Verdict::Deliver {
                from_id,
                to_id,
                is_intro: false,
                intro_hash: None,
            });
        }

        let verification_required = self
            .verification_required
            .get_or_try_insert_with(from_id, || async {
                let profile = self.directory.trust_profile(from_id).await?;
                Ok::<_, AppError>(
                    profile.verification_required
                        && matches!(
                            profile.verification_level,
                            VerificationLevel::None | VerificationLevel::Unverified
                        ),
                )
            })
            .await?;
        if verification_required {
            return Ok(Verdict::Blocked(BlockReason::AgeVerification));
        }

        if let Some(text) = message.text() {
            if self.text.is_rude(text) {
                info!(person_id = from_id, "rude intro blocked");
                self.directory.record_rude_message(from_id, text).await?;
                self.rate_limits.invalidate(&from_id);
                return Ok(Verdict::Blocked(BlockReason::Offensive));
            }

            let trust = self
                .trust
                .get_or_try_insert_with(from_id, || self.directory.trust_profile(from_id))
                .await?;
            if !is_trusted(&trust, Utc::now()) && self.text.is_spam(text) {
                debug!(person_id = from_id, "spam intro blocked");
                return Ok(Verdict::Blocked(BlockReason::Spam));
            }
        }

        let snapshot = self
            .rate_limits
            .get_or_try_insert_with(from_id, || self.directory.rate_limit_snapshot(from_id))
            .await?;
        if let Some(tier) = ratelimit::limited_tier(&snapshot) {
            debug!(
                person_id = from_id,
                intros_today = snapshot.intros_today,
                "intro rate limited"
            );
            return Ok(Verdict::Blocked(BlockReason::RateLimited(tier)));
        }

        let intro_hash = match message.text() {
            Some(text) => {
                let hash = uniqueness::intro_hash(text);
                if self.messages.intro_hash_seen(&hash).await? {
                    return Ok(Verdict::NotUnique);
                }
                Some(hash)
            }
            None => None,
        };

        Ok(Verdict::Deliver {
            from_id,
            to_id,
            is_intro: true,
            intro_hash,
        })
    }
}
