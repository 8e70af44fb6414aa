use crate::config::Config;
use crate::error::AppResult;
use crate::stanza::render::{self, InboxRow};
use crate::store::MessageStore;
use uuid::Uuid;

/// Every conversation of `owner` with its last message and unread count, then `fin`.
pub async fn list_inbox(
    store: &dyn MessageStore,
    config: &Config,
    owner: Uuid,
    query_id: &str,
) -> AppResult<Vec<String>> {
    let owner_jid = config.jid(&owner);
    let entries = store.inbox(owner).await?;

    let mut frames = Vec::with_capacity(entries.len() + 1);
    for entry in &entries {
        frames.push(render::inbox_result(&InboxRow {
            owner_jid: &owner_jid,
            query_id,
            msg_id: &entry.msg_id,
            unread_count: entry.unread_count,
            updated_at_us: entry.updated_at_us,
            mailbox: entry.mailbox.as_str(),
            content: &entry.content,
        }));
    }
    frames.push(render::inbox_fin(query_id));
    Ok(frames)
}
