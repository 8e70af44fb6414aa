//! Per-user message archive.
//!
//! Every delivered message is archived twice: under the sender with id `micros << 8` and under the
//! recipient with that id plus one. Ids double as pagination cursors.

use crate::config::Config;
use crate::error::AppResult;
use crate::stanza::{render, MamQuery};
use crate::store::{ArchiveRecord, MessageStore};
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

pub const MAM_PAGE_LIMIT: usize = 50;

static LAST_ARCHIVE_ID: AtomicI64 = AtomicI64::new(0);

/// Outbound archive id for a message accepted now.
///
/// Ids from this process strictly increase. Across processes they assume fewer than 256 messages
/// per owner per microsecond and clocks that never step back.
pub fn next_archive_id() -> i64 {
    let now = Utc::now().timestamp_micros() << 8;
    let mut last = LAST_ARCHIVE_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(last.saturating_add(1 << 8));
        match LAST_ARCHIVE_ID.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Lowercased body with punctuation folded to spaces and symbols dropped, for full-text search.
pub fn search_body(text: &str) -> String {
    let mut folded = String::with_capacity(text.len());
    for c in text.chars().flat_map(char::to_lowercase) {
        if matches!(c, ',' | '.' | ':' | ';' | '-' | '?' | '!') {
            folded.push(' ');
        } else if c.is_alphanumeric() || c == '_' || c.is_whitespace() {
            folded.push(c);
        }
    }
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn render_record(config: &Config, record: &ArchiveRecord) -> String {
    render::chat_message(
        &config.jid(&record.sender),
        &config.jid(&record.recipient),
        &record.stanza_id,
        "chat",
        Some(&record.body),
        record.audio_uuid.as_deref(),
    )
}

/// One page of `owner`'s conversation with `query.with`, oldest first, followed by `fin`.
pub async fn query_page(
    store: &dyn MessageStore,
    config: &Config,
    owner: Uuid,
    query: &MamQuery,
) -> AppResult<Vec<String>> {
    let limit = query.max.unwrap_or(MAM_PAGE_LIMIT).min(MAM_PAGE_LIMIT);
    let mut records = store
        .archive_page(owner, query.with, query.before, limit)
        .await?;
    records.reverse();

    let owner_jid = config.jid(&owner);
    let mut frames: Vec<String> = records
        .iter()
        .map(|record| {
            render::mam_result(
                &owner_jid,
                &query.query_id,
                record.id,
                &render_record(config, record),
            )
        })
        .collect();
    frames.push(render::mam_fin(&owner_jid, &query.query_id));
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::{decode_archive_id, encode_archive_id};
    use crate::store::{MemoryStore, StoredMessage};

    #[test]
    fn test_search_body() {
        assert_eq!(search_body("Hello, World!"), "hello world");
        assert_eq!(search_body("  it's-a   me:mario?? "), "its a me mario");
        assert_eq!(search_body("snake_case #tag"), "snake_case tag");
        assert_eq!(search_body("!!!"), "");
    }

    #[test]
    fn test_next_archive_id_leaves_room() {
        let id = next_archive_id();
        assert_eq!(id & 0xff, 0);
        assert!(next_archive_id() > id);
    }

    async fn seed(store: &MemoryStore, a: Uuid, b: Uuid, n: i64) {
        let a_id = store.add_trusted_person(a);
        let b_id = store.add_trusted_person(b);
        let batch: Vec<StoredMessage> = (1..=n)
            .map(|i| StoredMessage {
                from: a,
                to: b,
                from_id: a_id,
                to_id: b_id,
                stanza_id: format!("m{i}"),
                body: format!("message {i}"),
                audio_uuid: None,
                archive_id: i << 8,
                content: String::new(),
                search_body: format!("message {i}"),
            })
            .collect();
        store.store_messages(&batch).await.unwrap();
    }

    fn ids(frames: &[String]) -> Vec<i64> {
        frames
            .iter()
            .filter_map(|f| {
                let marker = r#"queryid="q" id=""#;
                let start = f.find(marker)? + marker.len();
                let end = start + f[start..].find('"')?;
                decode_archive_id(&f[start..end])
            })
            .collect()
    }

    #[tokio::test]
    async fn test_pages_walk_backwards_without_overlap() {
        let store = MemoryStore::new();
        let config = Config::test_defaults();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        seed(&store, a, b, 60).await;

        let query = MamQuery {
            query_id: "q".into(),
            with: b,
            before: None,
            max: Some(50),
        };
        let first = query_page(&store, &config, a, &query).await.unwrap();
        assert_eq!(first.len(), 51);
        assert!(first[50].contains("<fin"));

        let first_ids = ids(&first[..50]);
        assert_eq!(first_ids.first(), Some(&(11 << 8)));
        assert_eq!(first_ids.last(), Some(&(60 << 8)));
        assert!(first_ids.windows(2).all(|w| w[0] < w[1]));

        let query = MamQuery {
            before: first_ids.first().copied(),
            ..query
        };
        let second = query_page(&store, &config, a, &query).await.unwrap();
        let second_ids = ids(&second[..second.len() - 1]);
        assert_eq!(second_ids.len(), 10);
        assert_eq!(second_ids.last(), Some(&(10 << 8)));
        assert!(second[0].contains(&format!(r#"id="{}""#, encode_archive_id(1 << 8))));
    }

    #[tokio::test]
    async fn test_max_is_capped() {
        let store = MemoryStore::new();
        let config = Config::test_defaults();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        seed(&store, a, b, 60).await;

        let query = MamQuery {
            query_id: "q".into(),
            with: a,
            before: None,
            max: Some(500),
        };
        // b's copies are the inbound ones
        let frames = query_page(&store, &config, b, &query).await.unwrap();
        assert_eq!(frames.len(), 51);
        assert_eq!(ids(&frames[..1]), vec![(11 << 8) + 1]);
    }
}
