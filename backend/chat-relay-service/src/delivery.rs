//! Accepting a message: run it past the gate, persist it, fan it out and acknowledge it.

use crate::archive::{next_archive_id, search_body};
use crate::audio::AUDIO_MESSAGE_BODY;
use crate::classifier::Verdict;
use crate::error::{AppError, AppResult};
use crate::fanout::chat_channel;
use crate::notify::{notification_body, notification_title};
use crate::stanza::{render, MessageStanza};
use crate::state::AppState;
use crate::store::{LastNotification, PersonId, StoredMessage};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Frames to send back to the sender of `message`.
pub async fn handle_message(state: &AppState, from: Uuid, message: MessageStanza) -> Vec<String> {
    let stanza_id = message.stanza_id().to_owned();

    let verdict = match state.gate.evaluate(from, &message).await {
        Ok(verdict) => verdict,
        Err(e) => {
            warn!(error = %e, username = %from, stanza_id = %stanza_id, "message gate failed");
            return vec![render::server_error(&stanza_id)];
        }
    };

    let outcome = match verdict {
        Verdict::TooLong | Verdict::Blocked(_) | Verdict::NotUnique => {
            debug!(username = %from, stanza_id = %stanza_id, verdict = ?verdict, "message rejected");
            return verdict.rejection(&stanza_id).into_iter().collect();
        }
        Verdict::Typing { .. } => forward_typing(state, from, &message).await,
        Verdict::Deliver {
            from_id,
            to_id,
            is_intro,
            intro_hash,
        } => {
            let accepted = Accepted {
                from,
                from_id,
                to_id,
                is_intro,
                intro_hash,
            };
            deliver(state, accepted, message).await
        }
    };

    outcome.unwrap_or_else(|e| {
        warn!(error = %e, username = %from, stanza_id = %stanza_id, "message delivery failed");
        vec![render::server_error(&stanza_id)]
    })
}

async fn forward_typing(
    state: &AppState,
    from: Uuid,
    message: &MessageStanza,
) -> AppResult<Vec<String>> {
    let to = message.to();
    let xml = render::chat_message(
        &state.config.jid(&from),
        &state.config.jid(&to),
        message.stanza_id(),
        "typing",
        None,
        None,
    );
    state.broker.publish(&chat_channel(&to), &xml).await?;
    Ok(Vec::new())
}

struct Accepted {
    from: Uuid,
    from_id: PersonId,
    to_id: PersonId,
    is_intro: bool,
    intro_hash: Option<String>,
}

async fn deliver(
    state: &AppState,
    accepted: Accepted,
    message: MessageStanza,
) -> AppResult<Vec<String>> {
    let from = accepted.from;
    let to = message.to();
    let stanza_id = message.stanza_id().to_owned();

    let (body, audio_uuid) = match &message {
        MessageStanza::Chat { body, .. } => (body.as_str(), None),
        MessageStanza::Audio { audio, audio_uuid, .. } => {
            state.audio.put(audio_uuid, audio).await?;
            (AUDIO_MESSAGE_BODY.as_str(), Some(audio_uuid.clone()))
        }
        MessageStanza::Typing { .. } => {
            return Err(AppError::Internal(
                "typing notification reached delivery".into(),
            ))
        }
    };

    if let Some(hash) = accepted.intro_hash {
        state.writes.intro_hashes.enqueue(hash);
    }

    let content = render::chat_message(
        &state.config.jid(&from),
        &state.config.jid(&to),
        &stanza_id,
        "chat",
        Some(body),
        audio_uuid.as_deref(),
    );

    let stored = state.writes.messages.enqueue_with_ack(StoredMessage {
        from,
        to,
        from_id: accepted.from_id,
        to_id: accepted.to_id,
        stanza_id: stanza_id.clone(),
        body: body.to_owned(),
        audio_uuid,
        archive_id: next_archive_id(),
        content: content.clone(),
        search_body: search_body(body),
    });

    state.broker.publish(&chat_channel(&to), &content).await?;

    let notification = Notification {
        recipient: to,
        is_intro: accepted.is_intro,
        body: notification_body(message.text()),
    };
    tokio::spawn(notify_when_stored(state.clone(), stored, notification));

    Ok(vec![render::message_delivered(&stanza_id)])
}

struct Notification {
    recipient: Uuid,
    is_intro: bool,
    body: String,
}

/// Push to the recipient once the message is stored, unless they are connected.
async fn notify_when_stored(
    state: AppState,
    stored: oneshot::Receiver<()>,
    notification: Notification,
) {
    if stored.await.is_err() {
        return;
    }
    if let Err(e) = notify(&state, &notification).await {
        warn!(error = %e, recipient = %notification.recipient, "push notification failed");
    }
}

async fn notify(state: &AppState, notification: &Notification) -> AppResult<()> {
    let recipient = notification.recipient;
    if state.presence.is_online(recipient).await? {
        return Ok(());
    }
    let Some(token) = state.directory.push_token(recipient).await? else {
        return Ok(());
    };

    let title = notification_title(notification.is_intro);
    if state
        .notifier
        .send(&token, title, &notification.body)
        .await
    {
        state.writes.last_notifications.enqueue(LastNotification {
            username: recipient,
            is_intro: notification.is_intro,
        });
    }
    Ok(())
}
