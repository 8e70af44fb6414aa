//! Per-connection stanza dispatch.
//!
//! A [`Connection`] owns the session state of one client. Frames are handled strictly in order;
//! everything the client should see, including fan-out from other connections, goes through the
//! outbound channel.

use crate::archive;
use crate::delivery;
use crate::error::{AppError, AppResult};
use crate::fanout::{chat_channel, SubscriberId};
use crate::inbox;
use crate::presence::OnlineStatus;
use crate::session::{AuthOutcome, Session};
use crate::stanza::{self, render, Stanza};
use crate::state::AppState;
use crate::store::{DisplayedMark, PushTokenUpdate};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Background task aborted when its handle is dropped.
struct Refresher(JoinHandle<()>);

impl Refresher {
    async fn stop(mut self) {
        self.0.abort();
        let _ = (&mut self.0).await;
    }
}

impl Drop for Refresher {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Connection {
    state: AppState,
    session: Session,
    subscriber_id: SubscriberId,
    outbound: UnboundedSender<String>,
    refresher: Option<Refresher>,
}

impl Connection {
    pub fn new(state: AppState, outbound: UnboundedSender<String>) -> Self {
        let session = Session::new();
        Self {
            state,
            subscriber_id: SubscriberId::from(session.connection_id),
            session,
            outbound,
            refresher: None,
        }
    }

    pub fn username(&self) -> Option<Uuid> {
        self.session.username()
    }

    /// Handle one client frame. Malformed frames are dropped.
    pub async fn handle_frame(&mut self, frame: &str) -> Flow {
        let Some(stanza) = stanza::parse(frame) else {
            debug!(connection_id = %self.session.connection_id, "dropping malformed frame");
            return Flow::Continue;
        };

        match self.dispatch(stanza).await {
            Ok(flow) => flow,
            Err(e) => {
                warn!(
                    error = %e,
                    connection_id = %self.session.connection_id,
                    "closing connection after error"
                );
                Flow::Close
            }
        }
    }

    async fn dispatch(&mut self, stanza: Stanza) -> AppResult<Flow> {
        match stanza {
            Stanza::StreamOpen { version, to } => {
                self.send(self.session.handle_open(&version, &to))?;
                Ok(Flow::Continue)
            }
            Stanza::Auth { payload } => self.authenticate(&payload).await,
            other => match self.session.username() {
                Some(username) => self.dispatch_authenticated(username, other).await,
                None => {
                    debug!(
                        connection_id = %self.session.connection_id,
                        "ignoring stanza before authentication"
                    );
                    Ok(Flow::Continue)
                }
            },
        }
    }

    async fn authenticate(&mut self, payload: &str) -> AppResult<Flow> {
        let outcome = match self
            .session
            .handle_auth(self.state.directory.as_ref(), payload)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, connection_id = %self.session.connection_id, "session lookup failed");
                AuthOutcome::Failure(vec![
                    render::auth_failure(),
                    render::STREAM_CLOSE.to_string(),
                ])
            }
        };

        match outcome {
            AuthOutcome::Success(frames) => {
                self.send(frames)?;
                if let Some(username) = self.session.username() {
                    self.on_authenticated(username).await;
                }
                Ok(Flow::Continue)
            }
            AuthOutcome::Failure(frames) => {
                self.send(frames)?;
                Ok(Flow::Close)
            }
        }
    }

    async fn on_authenticated(&mut self, username: Uuid) {
        self.state
            .registry
            .add_subscriber(
                &chat_channel(&username),
                self.subscriber_id,
                self.outbound.clone(),
            )
            .await;

        let state = self.state.clone();
        let refresh_interval = self.state.config.online_refresh_interval;
        self.refresher = Some(Refresher(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = state
                    .presence
                    .set_status(username, OnlineStatus::Online)
                    .await
                {
                    warn!(error = %e, username = %username, "failed to publish presence");
                }
                state.writes.last_online.enqueue(username);
            }
        })));
    }

    async fn dispatch_authenticated(&mut self, username: Uuid, stanza: Stanza) -> AppResult<Flow> {
        let state = &self.state;
        let frames = match stanza {
            Stanza::Message(message) => delivery::handle_message(state, username, message).await,
            Stanza::Ping { iq_id: None } => vec![render::DUO_PONG.to_string()],
            Stanza::Ping { iq_id: Some(id) } => vec![render::iq_result(&id)],
            Stanza::MamQuery(query) => {
                match archive::query_page(state.messages.as_ref(), &state.config, username, &query)
                    .await
                {
                    Ok(frames) => frames,
                    Err(e) => {
                        warn!(error = %e, username = %username, "archive query failed");
                        Vec::new()
                    }
                }
            }
            Stanza::InboxQuery { query_id } => {
                match inbox::list_inbox(state.messages.as_ref(), &state.config, username, &query_id)
                    .await
                {
                    Ok(frames) => frames,
                    Err(e) => {
                        warn!(error = %e, username = %username, "inbox query failed");
                        Vec::new()
                    }
                }
            }
            Stanza::Displayed { to } => {
                state.writes.displayed.enqueue(DisplayedMark {
                    owner: username,
                    counterpart: to,
                });
                Vec::new()
            }
            Stanza::SubscribePresence { uuid } => {
                state
                    .presence
                    .subscribe(
                        &state.gate,
                        username,
                        self.subscriber_id,
                        self.outbound.clone(),
                        &uuid,
                    )
                    .await
            }
            Stanza::UnsubscribePresence { uuid } => {
                vec![state.presence.unsubscribe(self.subscriber_id, &uuid).await]
            }
            Stanza::IqBind { id } => vec![render::iq_bind_result(&id, &state.config.jid(&username))],
            Stanza::IqSession { id } => vec![render::iq_result(&id)],
            Stanza::RegisterPushToken { token } => {
                state.writes.push_tokens.enqueue(PushTokenUpdate { username, token });
                vec![render::REGISTRATION_SUCCESSFUL.to_string()]
            }
            Stanza::StreamOpen { .. } | Stanza::Auth { .. } | Stanza::Unknown => Vec::new(),
        };

        self.send(frames)?;
        Ok(Flow::Continue)
    }

    fn send(&self, frames: Vec<String>) -> AppResult<()> {
        for frame in frames {
            self.outbound
                .send(frame)
                .map_err(|_| AppError::Transport("outbound channel closed".into()))?;
        }
        Ok(())
    }

    /// Stop the presence refresher, leave every channel and mark the user recently online.
    pub async fn shutdown(mut self) {
        if let Some(refresher) = self.refresher.take() {
            refresher.stop().await;
        }

        self.state.registry.remove_all(self.subscriber_id).await;

        if let Some(username) = self.session.username() {
            if let Err(e) = self
                .state
                .presence
                .set_status(username, OnlineStatus::OnlineRecently)
                .await
            {
                warn!(error = %e, username = %username, "failed to publish presence");
            }
            self.state.writes.last_online.enqueue(username);
            info!(username = %username, "connection closed");
        }
    }
}
