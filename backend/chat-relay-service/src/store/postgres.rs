use super::{
    ArchiveRecord, Directory, DisplayedMark, InboxEntry, LastNotification, Mailbox,
    MessageStore, PersonId, PushTokenUpdate, RateLimitSnapshot, StoredMessage, TrustProfile,
    VerificationLevel,
};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use db_pool::PgPool;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;
use uuid::Uuid;

const Q_CHECK_SESSION: &str = r#"
    SELECT 1
    FROM duo_session
    JOIN person ON person.id = duo_session.person_id
    WHERE duo_session.session_token_hash = $1
      AND person.uuid = $2
      AND duo_session.session_expiry > NOW()
"#;

const Q_IS_SKIPPED: &str = r#"
    SELECT 1
    FROM skipped
    WHERE (subject_person_id = $1 AND object_person_id = $2)
       OR (subject_person_id = $2 AND object_person_id = $1)
    LIMIT 1
"#;

const Q_HAS_MESSAGED: &str = r#"
    SELECT 1
    FROM messaged
    WHERE (subject_person_id = $1 AND object_person_id = $2)
       OR (subject_person_id = $2 AND object_person_id = $1)
    LIMIT 1
"#;

const Q_RATE_LIMIT_SNAPSHOT: &str = r#"
    SELECT
        person.verification_level_id::int AS verification_level_id,
        (
            SELECT COUNT(*)
            FROM skipped
            WHERE object_person_id = $1
              AND reported
              AND created_at > NOW() - INTERVAL '24 hours'
        ) AS recent_reports,
        (
            SELECT COUNT(*)
            FROM rude_message
            WHERE person_id = $1
              AND created_at > NOW() - INTERVAL '24 hours'
        ) AS recent_rude_messages,
        (
            SELECT COUNT(*)
            FROM messaged AS m1
            WHERE m1.subject_person_id = $1
              AND m1.created_at >= NOW() - INTERVAL '24 hours'
              AND NOT EXISTS (
                  SELECT 1
                  FROM messaged AS m2
                  WHERE m2.subject_person_id = m1.object_person_id
                    AND m2.object_person_id = m1.subject_person_id
                    AND m2.created_at < m1.created_at
              )
        ) AS intros_today
    FROM person
    WHERE id = $1
"#;

const Q_INSERT_ARCHIVE: &str = r#"
    INSERT INTO mam_message (
        owner_uuid, id, counterpart_uuid, sender_uuid, recipient_uuid,
        stanza_id, body, audio_uuid, search_body
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
    ON CONFLICT DO NOTHING
"#;

const Q_UPSERT_SENDER_INBOX: &str = r#"
    INSERT INTO inbox (
        owner_uuid, counterpart_uuid, msg_id, box, content, updated_at_us, unread_count
    ) VALUES ($1, $2, $3, 'chats', $4, (EXTRACT(EPOCH FROM NOW()) * 1e6)::bigint, 0)
    ON CONFLICT (owner_uuid, counterpart_uuid) DO UPDATE SET
        msg_id = EXCLUDED.msg_id,
        box = 'chats',
        content = EXCLUDED.content,
        updated_at_us = EXCLUDED.updated_at_us,
        unread_count = 0
"#;

const Q_UPSERT_RECIPIENT_INBOX: &str = r#"
    INSERT INTO inbox (
        owner_uuid, counterpart_uuid, msg_id, box, content, updated_at_us, unread_count
    ) VALUES ($1, $2, $3, 'inbox', $4, (EXTRACT(EPOCH FROM NOW()) * 1e6)::bigint, 1)
    ON CONFLICT (owner_uuid, counterpart_uuid) DO UPDATE SET
        msg_id = EXCLUDED.msg_id,
        box = 'inbox',
        content = EXCLUDED.content,
        updated_at_us = EXCLUDED.updated_at_us,
        unread_count = inbox.unread_count + 1
"#;

const Q_SET_MESSAGED: &str = r#"
    INSERT INTO messaged (subject_person_id, object_person_id)
    VALUES ($1, $2)
    ON CONFLICT DO NOTHING
"#;

const Q_ARCHIVE_PAGE: &str = r#"
    SELECT owner_uuid, id, sender_uuid, recipient_uuid, stanza_id, body, audio_uuid, search_body
    FROM mam_message
    WHERE owner_uuid = $1
      AND counterpart_uuid = $2
      AND ($3::bigint IS NULL OR id < $3)
    ORDER BY id DESC
    LIMIT $4
"#;

const Q_MARK_DISPLAYED: &str = r#"
    UPDATE inbox
    SET unread_count = 0
    FROM UNNEST($1::uuid[], $2::uuid[]) AS displayed(owner_uuid, counterpart_uuid)
    WHERE inbox.owner_uuid = displayed.owner_uuid
      AND inbox.counterpart_uuid = displayed.counterpart_uuid
"#;

const Q_INTRO_HASH_SEEN: &str = r#"
    SELECT 1
    FROM intro_hash
    WHERE hash = $1
      AND last_used_at > NOW() - INTERVAL '7 days'
"#;

const Q_UPSERT_INTRO_HASHES: &str = r#"
    INSERT INTO intro_hash (hash, last_used_at)
    SELECT hash, NOW() FROM UNNEST($1::text[]) AS hash
    ON CONFLICT (hash) DO UPDATE SET last_used_at = NOW()
"#;

const Q_UPDATE_LAST_ONLINE: &str = r#"
    UPDATE person SET last_online_time = NOW() WHERE uuid = ANY($1)
"#;

const Q_UPDATE_LAST_INTRO_NOTIFICATION: &str = r#"
    UPDATE person
    SET intro_seconds = EXTRACT(EPOCH FROM NOW() + INTERVAL '5 seconds')::int
    WHERE uuid = ANY($1)
"#;

const Q_UPDATE_LAST_CHAT_NOTIFICATION: &str = r#"
    UPDATE person
    SET chat_seconds = EXTRACT(EPOCH FROM NOW() + INTERVAL '5 seconds')::int
    WHERE uuid = ANY($1)
"#;

fn count(n: i64) -> u32 {
    u32::try_from(n.max(0)).unwrap_or(u32::MAX)
}

/// PostgreSQL-backed [`Directory`] and [`MessageStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Directory for PgStore {
    async fn check_session(&self, person: Uuid, token_hash: &str) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(Q_CHECK_SESSION, &[&token_hash, &person])
            .await
            .map_err(|e| AppError::Database(format!("check_session: {e}")))?;
        Ok(row.is_some())
    }

    async fn person_id(&self, person: Uuid) -> AppResult<Option<PersonId>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT id FROM person WHERE uuid = $1", &[&person])
            .await?;
        Ok(row.map(|row| row.get(0)))
    }

    async fn is_skipped(&self, a: PersonId, b: PersonId) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let row = client.query_opt(Q_IS_SKIPPED, &[&a, &b]).await?;
        Ok(row.is_some())
    }

    async fn is_intro(&self, from: PersonId, to: PersonId) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let row = client.query_opt(Q_HAS_MESSAGED, &[&from, &to]).await?;
        Ok(row.is_none())
    }

    async fn trust_profile(&self, person: PersonId) -> AppResult<TrustProfile> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT verification_level_id::int, verification_required, sign_up_time \
                 FROM person WHERE id = $1",
                &[&person],
            )
            .await
            .map_err(|e| AppError::Database(format!("trust_profile: {e}")))?
            .ok_or_else(|| AppError::Internal(format!("person {person} not found")))?;

        Ok(TrustProfile {
            verification_level: VerificationLevel::from_id(row.get(0)),
            verification_required: row.get(1),
            sign_up_time: row.get(2),
        })
    }

    async fn rate_limit_snapshot(&self, person: PersonId) -> AppResult<RateLimitSnapshot> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(Q_RATE_LIMIT_SNAPSHOT, &[&person])
            .await
            .map_err(|e| AppError::Database(format!("rate_limit_snapshot: {e}")))?
            .ok_or_else(|| AppError::Internal(format!("person {person} not found")))?;

        Ok(RateLimitSnapshot {
            verification_level: VerificationLevel::from_id(row.get("verification_level_id")),
            recent_reports: count(row.get("recent_reports")),
            recent_rude_messages: count(row.get("recent_rude_messages")),
            intros_today: count(row.get("intros_today")),
        })
    }

    async fn record_rude_message(&self, person: PersonId, body: &str) -> AppResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO rude_message (person_id, message) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
                &[&person, &body],
            )
            .await?;
        Ok(())
    }

    async fn push_token(&self, person: Uuid) -> AppResult<Option<String>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT push_token FROM person WHERE uuid = $1", &[&person])
            .await?;
        Ok(row.and_then(|row| row.get(0)))
    }

    async fn set_push_tokens(&self, batch: &[PushTokenUpdate]) -> AppResult<()> {
        // Last update per user wins
        let latest: BTreeMap<Uuid, Option<&str>> = batch
            .iter()
            .map(|u| (u.username, u.token.as_deref()))
            .collect();

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let stmt = tx
            .prepare("UPDATE person SET push_token = $2 WHERE uuid = $1")
            .await?;
        for (username, token) in &latest {
            tx.execute(&stmt, &[username, token]).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn touch_last_online(&self, batch: &[Uuid]) -> AppResult<()> {
        let usernames: Vec<Uuid> = batch
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let client = self.pool.get().await?;
        client.execute(Q_UPDATE_LAST_ONLINE, &[&usernames]).await?;
        Ok(())
    }

    async fn record_last_notifications(&self, batch: &[LastNotification]) -> AppResult<()> {
        let client = self.pool.get().await?;
        for (is_intro, query) in [
            (true, Q_UPDATE_LAST_INTRO_NOTIFICATION),
            (false, Q_UPDATE_LAST_CHAT_NOTIFICATION),
        ] {
            let usernames: Vec<Uuid> = batch
                .iter()
                .filter(|n| n.is_intro == is_intro)
                .map(|n| n.username)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if !usernames.is_empty() {
                client.execute(query, &[&usernames]).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn store_messages(&self, batch: &[StoredMessage]) -> AppResult<()> {
        let mut client = self.pool.get().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| AppError::Database(format!("begin store_messages: {e}")))?;

        let insert_archive = tx.prepare(Q_INSERT_ARCHIVE).await?;
        let upsert_sender = tx.prepare(Q_UPSERT_SENDER_INBOX).await?;
        let upsert_recipient = tx.prepare(Q_UPSERT_RECIPIENT_INBOX).await?;
        let set_messaged = tx.prepare(Q_SET_MESSAGED).await?;

        let mut messaged = HashSet::new();
        for m in batch {
            let inbound_id = m.archive_id + 1;
            tx.execute(
                &insert_archive,
                &[
                    &m.from,
                    &m.archive_id,
                    &m.to,
                    &m.from,
                    &m.to,
                    &m.stanza_id,
                    &m.body,
                    &m.audio_uuid,
                    &m.search_body,
                ],
            )
            .await?;
            tx.execute(
                &insert_archive,
                &[
                    &m.to,
                    &inbound_id,
                    &m.from,
                    &m.from,
                    &m.to,
                    &m.stanza_id,
                    &m.body,
                    &m.audio_uuid,
                    &m.search_body,
                ],
            )
            .await?;

            tx.execute(&upsert_sender, &[&m.from, &m.to, &m.stanza_id, &m.content])
                .await?;
            tx.execute(&upsert_recipient, &[&m.to, &m.from, &m.stanza_id, &m.content])
                .await?;

            if messaged.insert((m.from_id, m.to_id)) {
                tx.execute(&set_messaged, &[&m.from_id, &m.to_id]).await?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| AppError::Database(format!("commit store_messages: {e}")))?;

        debug!(messages = batch.len(), "stored message batch");
        Ok(())
    }

    async fn archive_page(
        &self,
        owner: Uuid,
        counterpart: Uuid,
        before: Option<i64>,
        limit: usize,
    ) -> AppResult<Vec<ArchiveRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let client = self.pool.get().await?;
        let rows = client
            .query(Q_ARCHIVE_PAGE, &[&owner, &counterpart, &before, &limit])
            .await
            .map_err(|e| AppError::Database(format!("archive_page: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|row| ArchiveRecord {
                owner: row.get("owner_uuid"),
                id: row.get("id"),
                sender: row.get("sender_uuid"),
                recipient: row.get("recipient_uuid"),
                stanza_id: row.get("stanza_id"),
                body: row.get("body"),
                audio_uuid: row.get("audio_uuid"),
                search_body: row.get("search_body"),
            })
            .collect())
    }

    async fn mark_displayed(&self, batch: &[DisplayedMark]) -> AppResult<()> {
        let marks: BTreeSet<(Uuid, Uuid)> =
            batch.iter().map(|m| (m.owner, m.counterpart)).collect();
        let (owners, counterparts): (Vec<Uuid>, Vec<Uuid>) = marks.into_iter().unzip();

        let client = self.pool.get().await?;
        client
            .execute(Q_MARK_DISPLAYED, &[&owners, &counterparts])
            .await?;
        Ok(())
    }

    async fn inbox(&self, owner: Uuid) -> AppResult<Vec<InboxEntry>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT owner_uuid, counterpart_uuid, msg_id, box, content, updated_at_us, \
                 unread_count FROM inbox WHERE owner_uuid = $1 ORDER BY counterpart_uuid",
                &[&owner],
            )
            .await
            .map_err(|e| AppError::Database(format!("inbox: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let mailbox: String = row.get("box");
                let unread_count: i32 = row.get("unread_count");
                InboxEntry {
                    owner: row.get("owner_uuid"),
                    counterpart: row.get("counterpart_uuid"),
                    msg_id: row.get("msg_id"),
                    mailbox: Mailbox::parse(&mailbox),
                    content: row.get("content"),
                    updated_at_us: row.get("updated_at_us"),
                    unread_count: i64::from(unread_count),
                }
            })
            .collect())
    }

    async fn intro_hash_seen(&self, hash: &str) -> AppResult<bool> {
        let client = self.pool.get().await?;
        let row = client.query_opt(Q_INTRO_HASH_SEEN, &[&hash]).await?;
        Ok(row.is_some())
    }

    async fn upsert_intro_hashes(&self, batch: &[String]) -> AppResult<()> {
        // A single upsert cannot touch the same row twice
        let hashes: Vec<&str> = batch
            .iter()
            .map(String::as_str)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let client = self.pool.get().await?;
        client.execute(Q_UPSERT_INTRO_HASHES, &[&hashes]).await?;
        Ok(())
    }
}
