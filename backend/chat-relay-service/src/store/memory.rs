use super::{
    ArchiveRecord, Directory, DisplayedMark, InboxEntry, LastNotification, Mailbox,
    MessageStore, PersonId, PushTokenUpdate, RateLimitSnapshot, StoredMessage, TrustProfile,
    VerificationLevel,
};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

struct Person {
    id: PersonId,
    trust: TrustProfile,
    push_token: Option<String>,
    sessions: HashSet<String>,
    last_online_touches: usize,
}

struct Skip {
    subject: PersonId,
    object: PersonId,
    reported: bool,
    at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    people: HashMap<Uuid, Person>,
    next_id: PersonId,
    skipped: Vec<Skip>,
    messaged: Vec<(PersonId, PersonId, DateTime<Utc>)>,
    rude_messages: Vec<(PersonId, String, DateTime<Utc>)>,
    last_notifications: Vec<LastNotification>,
    archive: BTreeMap<(Uuid, i64), ArchiveRecord>,
    inbox: BTreeMap<(Uuid, Uuid), InboxEntry>,
    intro_hashes: HashMap<String, DateTime<Utc>>,
}

impl Inner {
    fn person_by_id(&self, id: PersonId) -> Option<&Person> {
        self.people.values().find(|p| p.id == id)
    }

    fn has_messaged(&self, a: PersonId, b: PersonId) -> bool {
        self.messaged
            .iter()
            .any(|(s, o, _)| (*s == a && *o == b) || (*s == b && *o == a))
    }

    fn upsert_inbox(&mut self, owner: Uuid, counterpart: Uuid, m: &StoredMessage, mailbox: Mailbox) {
        let now_us = Utc::now().timestamp_micros();
        let entry = self
            .inbox
            .entry((owner, counterpart))
            .or_insert_with(|| InboxEntry {
                owner,
                counterpart,
                msg_id: String::new(),
                mailbox,
                content: String::new(),
                updated_at_us: now_us,
                unread_count: 0,
            });
        entry.msg_id = m.stanza_id.clone();
        entry.mailbox = mailbox;
        entry.content = m.content.clone();
        entry.updated_at_us = now_us;
        entry.unread_count = match mailbox {
            Mailbox::Chats => 0,
            Mailbox::Inbox => entry.unread_count + 1,
        };
    }
}

/// In-process [`Directory`] and [`MessageStore`] with the same semantics as the SQL, for tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a person with the given trust profile.
    pub fn add_person(&self, uuid: Uuid, trust: TrustProfile) -> PersonId {
        let mut inner = self.inner();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.people.insert(
            uuid,
            Person {
                id,
                trust,
                push_token: None,
                sessions: HashSet::new(),
                last_online_touches: 0,
            },
        );
        id
    }

    /// Register a long-standing, photo-verified person.
    pub fn add_trusted_person(&self, uuid: Uuid) -> PersonId {
        self.add_person(
            uuid,
            TrustProfile {
                verification_level: VerificationLevel::Photos,
                verification_required: false,
                sign_up_time: Utc::now() - Duration::days(365),
            },
        )
    }

    pub fn add_session(&self, uuid: Uuid, token_hash: impl Into<String>) {
        if let Some(person) = self.inner().people.get_mut(&uuid) {
            person.sessions.insert(token_hash.into());
        }
    }

    pub fn set_push_token(&self, uuid: Uuid, token: impl Into<String>) {
        if let Some(person) = self.inner().people.get_mut(&uuid) {
            person.push_token = Some(token.into());
        }
    }

    /// `subject` skips `object`; `reported` counts against `object`'s quota.
    pub fn skip(&self, subject: Uuid, object: Uuid, reported: bool) {
        let mut inner = self.inner();
        let ids = inner
            .people
            .get(&subject)
            .map(|p| p.id)
            .zip(inner.people.get(&object).map(|p| p.id));
        if let Some((subject, object)) = ids {
            inner.skipped.push(Skip {
                subject,
                object,
                reported,
                at: Utc::now(),
            });
        }
    }

    /// Record that `from` messaged `to` at `at`.
    pub fn add_messaged(&self, from: PersonId, to: PersonId, at: DateTime<Utc>) {
        self.inner().messaged.push((from, to, at));
    }

    pub fn archive_len(&self, owner: Uuid) -> usize {
        self.inner().archive.keys().filter(|(o, _)| *o == owner).count()
    }

    pub fn total_archive_len(&self) -> usize {
        self.inner().archive.len()
    }

    pub fn inbox_entry(&self, owner: Uuid, counterpart: Uuid) -> Option<InboxEntry> {
        self.inner().inbox.get(&(owner, counterpart)).cloned()
    }

    pub fn rude_message_count(&self, person: PersonId) -> usize {
        self.inner()
            .rude_messages
            .iter()
            .filter(|(p, _, _)| *p == person)
            .count()
    }

    pub fn push_token_of(&self, uuid: Uuid) -> Option<String> {
        self.inner().people.get(&uuid).and_then(|p| p.push_token.clone())
    }

    pub fn last_online_touches(&self, uuid: Uuid) -> usize {
        self.inner()
            .people
            .get(&uuid)
            .map_or(0, |p| p.last_online_touches)
    }

    pub fn last_notifications(&self) -> Vec<LastNotification> {
        self.inner().last_notifications.clone()
    }
}

#[async_trait]
impl Directory for MemoryStore {
    async fn check_session(&self, person: Uuid, token_hash: &str) -> AppResult<bool> {
        Ok(self
            .inner()
            .people
            .get(&person)
            .is_some_and(|p| p.sessions.contains(token_hash)))
    }

    async fn person_id(&self, person: Uuid) -> AppResult<Option<PersonId>> {
        Ok(self.inner().people.get(&person).map(|p| p.id))
    }

    async fn is_skipped(&self, a: PersonId, b: PersonId) -> AppResult<bool> {
        Ok(self
            .inner()
            .skipped
            .iter()
            .any(|s| (s.subject == a && s.object == b) || (s.subject == b && s.object == a)))
    }

    async fn is_intro(&self, from: PersonId, to: PersonId) -> AppResult<bool> {
        Ok(!self.inner().has_messaged(from, to))
    }

    async fn trust_profile(&self, person: PersonId) -> AppResult<TrustProfile> {
        self.inner()
            .person_by_id(person)
            .map(|p| p.trust.clone())
            .ok_or_else(|| AppError::Internal(format!("person {person} not found")))
    }

    async fn rate_limit_snapshot(&self, person: PersonId) -> AppResult<RateLimitSnapshot> {
        let inner = self.inner();
        let level = inner
            .person_by_id(person)
            .map(|p| p.trust.verification_level)
            .ok_or_else(|| AppError::Internal(format!("person {person} not found")))?;
        let since = Utc::now() - Duration::hours(24);

        let recent_reports = inner
            .skipped
            .iter()
            .filter(|s| s.object == person && s.reported && s.at > since)
            .count();
        let recent_rude_messages = inner
            .rude_messages
            .iter()
            .filter(|(p, _, at)| *p == person && *at > since)
            .count();
        let intros_today = inner
            .messaged
            .iter()
            .filter(|(s, o, at)| {
                *s == person
                    && *at >= since
                    && !inner
                        .messaged
                        .iter()
                        .any(|(s2, o2, at2)| s2 == o && o2 == s && at2 < at)
            })
            .count();

        Ok(RateLimitSnapshot {
            verification_level: level,
            recent_reports: u32::try_from(recent_reports).unwrap_or(u32::MAX),
            recent_rude_messages: u32::try_from(recent_rude_messages).unwrap_or(u32::MAX),
            intros_today: u32::try_from(intros_today).unwrap_or(u32::MAX),
        })
    }

    async fn record_rude_message(&self, person: PersonId, body: &str) -> AppResult<()> {
        self.inner()
            .rude_messages
            .push((person, body.to_string(), Utc::now()));
        Ok(())
    }

    async fn push_token(&self, person: Uuid) -> AppResult<Option<String>> {
        Ok(self.push_token_of(person))
    }

    async fn set_push_tokens(&self, batch: &[PushTokenUpdate]) -> AppResult<()> {
        let mut inner = self.inner();
        for update in batch {
            if let Some(person) = inner.people.get_mut(&update.username) {
                person.push_token = update.token.clone();
            }
        }
        Ok(())
    }

    async fn touch_last_online(&self, batch: &[Uuid]) -> AppResult<()> {
        let mut inner = self.inner();
        for username in batch {
            if let Some(person) = inner.people.get_mut(username) {
                person.last_online_touches += 1;
            }
        }
        Ok(())
    }

    async fn record_last_notifications(&self, batch: &[LastNotification]) -> AppResult<()> {
        self.inner().last_notifications.extend_from_slice(batch);
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn store_messages(&self, batch: &[StoredMessage]) -> AppResult<()> {
        let mut inner = self.inner();
        for m in batch {
            for (owner, id) in [(m.from, m.archive_id), (m.to, m.archive_id + 1)] {
                inner.archive.entry((owner, id)).or_insert_with(|| ArchiveRecord {
                    owner,
                    id,
                    sender: m.from,
                    recipient: m.to,
                    stanza_id: m.stanza_id.clone(),
                    body: m.body.clone(),
                    audio_uuid: m.audio_uuid.clone(),
                    search_body: m.search_body.clone(),
                });
            }

            inner.upsert_inbox(m.from, m.to, m, Mailbox::Chats);
            inner.upsert_inbox(m.to, m.from, m, Mailbox::Inbox);

            let already = inner
                .messaged
                .iter()
                .any(|(s, o, _)| *s == m.from_id && *o == m.to_id);
            if !already {
                inner.messaged.push((m.from_id, m.to_id, Utc::now()));
            }
        }
        Ok(())
    }

    async fn archive_page(
        &self,
        owner: Uuid,
        counterpart: Uuid,
        before: Option<i64>,
        limit: usize,
    ) -> AppResult<Vec<ArchiveRecord>> {
        let inner = self.inner();
        Ok(inner
            .archive
            .range((owner, i64::MIN)..=(owner, i64::MAX))
            .rev()
            .map(|(_, record)| record)
            .filter(|r| r.counterpart() == counterpart)
            .filter(|r| before.map_or(true, |before| r.id < before))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_displayed(&self, batch: &[DisplayedMark]) -> AppResult<()> {
        let mut inner = self.inner();
        for mark in batch {
            if let Some(entry) = inner.inbox.get_mut(&(mark.owner, mark.counterpart)) {
                entry.unread_count = 0;
            }
        }
        Ok(())
    }

    async fn inbox(&self, owner: Uuid) -> AppResult<Vec<InboxEntry>> {
        Ok(self
            .inner()
            .inbox
            .values()
            .filter(|e| e.owner == owner)
            .cloned()
            .collect())
    }

    async fn intro_hash_seen(&self, hash: &str) -> AppResult<bool> {
        let since = Utc::now() - Duration::days(7);
        Ok(self
            .inner()
            .intro_hashes
            .get(hash)
            .is_some_and(|at| *at > since))
    }

    async fn upsert_intro_hashes(&self, batch: &[String]) -> AppResult<()> {
        let mut inner = self.inner();
        let now = Utc::now();
        for hash in batch {
            inner.intro_hashes.insert(hash.clone(), now);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(from: (Uuid, PersonId), to: (Uuid, PersonId), archive_id: i64) -> StoredMessage {
        StoredMessage {
            from: from.0,
            to: to.0,
            from_id: from.1,
            to_id: to.1,
            stanza_id: format!("s{archive_id}"),
            body: "hello".into(),
            audio_uuid: None,
            archive_id,
            content: "<message/>".into(),
            search_body: "hello".into(),
        }
    }

    #[tokio::test]
    async fn test_store_messages_writes_both_sides() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let a_id = store.add_trusted_person(a);
        let b_id = store.add_trusted_person(b);

        assert!(store.is_intro(a_id, b_id).await.unwrap());
        store
            .store_messages(&[message((a, a_id), (b, b_id), 256)])
            .await
            .unwrap();

        assert_eq!(store.archive_len(a), 1);
        assert_eq!(store.archive_len(b), 1);
        assert!(!store.is_intro(b_id, a_id).await.unwrap());

        let b_page = store.archive_page(b, a, None, 50).await.unwrap();
        assert_eq!(b_page[0].id, 257);
        assert_eq!(b_page[0].sender, a);
    }

    #[tokio::test]
    async fn test_intros_today_ignores_replies() {
        let store = MemoryStore::new();
        let a = store.add_trusted_person(Uuid::new_v4());
        let b = store.add_trusted_person(Uuid::new_v4());
        let c = store.add_trusted_person(Uuid::new_v4());
        let earlier = Utc::now() - Duration::minutes(5);

        // b wrote to a first, so a -> b is a reply
        store.add_messaged(b, a, earlier);
        store.add_messaged(a, b, Utc::now());
        store.add_messaged(a, c, Utc::now());

        let snapshot = store.rate_limit_snapshot(a).await.unwrap();
        assert_eq!(snapshot.intros_today, 1);
    }

    #[tokio::test]
    async fn test_unknown_session_rejected() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        store.add_trusted_person(a);
        store.add_session(a, "hash");

        assert!(store.check_session(a, "hash").await.unwrap());
        assert!(!store.check_session(a, "other").await.unwrap());
        assert!(!store.check_session(Uuid::new_v4(), "hash").await.unwrap());
    }

    #[tokio::test]
    async fn test_intro_hash_window() {
        let store = MemoryStore::new();
        assert!(!store.intro_hash_seen("abc").await.unwrap());
        store
            .upsert_intro_hashes(&["abc".to_string(), "abc".to_string()])
            .await
            .unwrap();
        assert!(store.intro_hash_seen("abc").await.unwrap());
    }
}
