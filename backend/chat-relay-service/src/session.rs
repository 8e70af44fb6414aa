//! Stream negotiation and SASL PLAIN authentication.
//!
//! A session starts unauthenticated and authenticates at most once. Anything that fails to
//! authenticate gets a failure stanza and the stream is closed.

use crate::error::AppResult;
use crate::stanza::render;
use crate::store::Directory;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha512};
use tracing::{debug, info};
use uuid::Uuid;

/// Outcome of an authentication attempt, with the frames to send back.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    Success(Vec<String>),
    /// Send the frames, then close the connection
    Failure(Vec<String>),
}

#[derive(Debug)]
pub struct Session {
    pub connection_id: Uuid,
    username: Option<Uuid>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Session tokens are stored as hex sha512 digests.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha512::digest(token.as_bytes()))
}

/// Split a SASL PLAIN payload into `(username, secret)`.
fn decode_plain(payload: &str) -> Option<(Uuid, String)> {
    let decoded = STANDARD.decode(payload.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let parts: Vec<&str> = decoded.split('\0').collect();
    let [_, username, secret] = parts.as_slice() else {
        return None;
    };
    let username = Uuid::parse_str(username).ok()?;
    Some((username, secret.to_string()))
}

impl Session {
    pub fn new() -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            username: None,
        }
    }

    pub fn username(&self) -> Option<Uuid> {
        self.username
    }

    pub fn is_authenticated(&self) -> bool {
        self.username.is_some()
    }

    /// Stream header and the features on offer at this stage. Nothing is sent back unless the
    /// client names both a version and a domain.
    pub fn handle_open(&self, version: &str, to: &str) -> Vec<String> {
        if version.is_empty() || to.is_empty() {
            return Vec::new();
        }
        vec![
            render::stream_open(version, to),
            render::stream_features(self.is_authenticated()),
        ]
    }

    pub async fn handle_auth(
        &mut self,
        directory: &dyn Directory,
        payload: &str,
    ) -> AppResult<AuthOutcome> {
        let failure = || {
            AuthOutcome::Failure(vec![
                render::auth_failure(),
                render::STREAM_CLOSE.to_string(),
            ])
        };

        if self.is_authenticated() {
            debug!(connection_id = %self.connection_id, "rejecting second authentication");
            return Ok(failure());
        }

        let Some((username, secret)) = decode_plain(payload) else {
            debug!(connection_id = %self.connection_id, "malformed auth payload");
            return Ok(failure());
        };

        if !directory
            .check_session(username, &hash_token(&secret))
            .await?
        {
            info!(connection_id = %self.connection_id, username = %username, "authentication failed");
            return Ok(failure());
        }

        self.username = Some(username);
        info!(connection_id = %self.connection_id, username = %username, "authenticated");
        Ok(AuthOutcome::Success(vec![render::auth_success()]))
    }
}
