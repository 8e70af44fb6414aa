//! Shared fixtures: a fully wired relay over in-memory backends, and a client that talks to a
//! [`Connection`] directly instead of over a socket.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chat_relay_service::audio::MemoryAudioStore;
use chat_relay_service::classifier::HeuristicClassifier;
use chat_relay_service::config::Config;
use chat_relay_service::connection::{Connection, Flow};
use chat_relay_service::fanout::{ChannelRegistry, MemoryBroker};
use chat_relay_service::notify::Notifier;
use chat_relay_service::session::hash_token;
use chat_relay_service::state::{AppState, Backends};
use chat_relay_service::store::{MemoryStore, PersonId, TrustProfile};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPush {
    pub token: String,
    pub title: String,
    pub body: String,
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentPush>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<SentPush> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, token: &str, title: &str, body: &str) -> bool {
        self.sent.lock().unwrap().push(SentPush {
            token: token.to_string(),
            title: title.to_string(),
            body: body.to_string(),
        });
        true
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub audio: Arc<MemoryAudioStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub state: AppState,
}

impl Harness {
    /// Must be called inside a tokio runtime; the write batchers are started here.
    pub fn new() -> Self {
        Self::with_config(Config::test_defaults())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let audio = Arc::new(MemoryAudioStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let registry = ChannelRegistry::new();

        let state = AppState::new(
            config,
            Backends {
                directory: store.clone(),
                messages: store.clone(),
                broker: Arc::new(MemoryBroker::new(registry.clone())),
                registry,
                text: Arc::new(HeuristicClassifier::new().unwrap()),
                notifier: notifier.clone(),
                audio: audio.clone(),
            },
        );
        state.writes.set_flush_interval(Duration::from_millis(10));
        state.writes.start();

        Self {
            store,
            audio,
            notifier,
            state,
        }
    }

    /// A long-standing person with a session token of `token-{uuid}`.
    pub fn person(&self) -> (Uuid, PersonId) {
        let uuid = Uuid::new_v4();
        let id = self.store.add_trusted_person(uuid);
        self.store.add_session(uuid, hash_token(&token_for(uuid)));
        (uuid, id)
    }

    pub fn person_with(&self, trust: TrustProfile) -> (Uuid, PersonId) {
        let uuid = Uuid::new_v4();
        let id = self.store.add_person(uuid, trust);
        self.store.add_session(uuid, hash_token(&token_for(uuid)));
        (uuid, id)
    }

    pub fn client(&self) -> TestClient {
        let (outbound, inbound) = unbounded_channel();
        TestClient {
            connection: Some(Connection::new(self.state.clone(), outbound)),
            inbound,
        }
    }

    pub async fn login(&self, user: Uuid) -> TestClient {
        let mut client = self.client();
        client.send(&auth_frame(user, &token_for(user))).await;
        let reply = client.recv().await;
        assert!(reply.starts_with("<success"), "unexpected auth reply: {reply}");
        client
    }

    pub async fn shutdown(&self) {
        self.state.writes.shutdown().await;
    }
}

pub struct TestClient {
    connection: Option<Connection>,
    inbound: UnboundedReceiver<String>,
}

impl TestClient {
    pub async fn send(&mut self, frame: &str) -> Flow {
        match self.connection.as_mut() {
            Some(connection) => connection.handle_frame(frame).await,
            None => Flow::Close,
        }
    }

    /// Everything queued for this client so far.
    pub fn drain(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.inbound.try_recv() {
            frames.push(frame);
        }
        frames
    }

    pub async fn recv(&mut self) -> String {
        tokio::time::timeout(WAIT, self.inbound.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("outbound channel closed")
    }

    /// Skip frames until one contains `needle`.
    pub async fn recv_matching(&mut self, needle: &str) -> String {
        loop {
            let frame = self.recv().await;
            if frame.contains(needle) {
                return frame;
            }
        }
    }

    pub async fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.shutdown().await;
        }
    }
}

pub fn token_for(user: Uuid) -> String {
    format!("token-{user}")
}

pub fn auth_frame(user: Uuid, secret: &str) -> String {
    format!(
        r#"<auth xmlns="urn:ietf:params:xml:ns:xmpp-sasl" mechanism="PLAIN">{}</auth>"#,
        STANDARD.encode(format!("\0{user}\0{secret}"))
    )
}

pub fn chat_frame(to: Uuid, id: &str, body: &str) -> String {
    format!(
        r#"<message xmlns="jabber:client" type="chat" to="{to}@duolicious.app" id="{id}"><body>{body}</body></message>"#
    )
}

pub fn typing_frame(to: Uuid, id: &str) -> String {
    format!(r#"<message xmlns="jabber:client" type="typing" to="{to}@duolicious.app" id="{id}"/>"#)
}

pub fn audio_frame(to: Uuid, id: &str, audio: &[u8]) -> String {
    format!(
        r#"<message xmlns="jabber:client" type="chat" to="{to}@duolicious.app" id="{id}" audio_base64="{}"/>"#,
        STANDARD.encode(audio)
    )
}

pub fn mam_frame(query_id: &str, with: Uuid, before: Option<&str>, max: usize) -> String {
    let before = before.map_or_else(String::new, |b| format!("<before>{b}</before>"));
    format!(
        r#"<iq xmlns="jabber:client" type="set" id="{query_id}"><query xmlns="urn:xmpp:mam:2" queryid="{query_id}"><x xmlns="jabber:x:data" type="submit"><field var="FORM_TYPE"><value>urn:xmpp:mam:2</value></field><field var="with"><value>{with}@duolicious.app</value></field></x><set xmlns="http://jabber.org/protocol/rsm"><max>{max}</max>{before}</set></query></iq>"#
    )
}

pub fn inbox_frame(query_id: &str) -> String {
    format!(
        r#"<iq xmlns="jabber:client" type="set" id="{query_id}"><inbox xmlns="erlang-solutions.com:xmpp:inbox:0" queryid="{query_id}"/></iq>"#
    )
}

/// Archive id of a MAM result frame, as sent.
pub fn mam_result_id(frame: &str, query_id: &str) -> Option<String> {
    let marker = format!(r#"queryid="{query_id}" id=""#);
    let start = frame.find(&marker)? + marker.len();
    let end = start + frame[start..].find('"')?;
    Some(frame[start..end].to_string())
}

/// Poll `condition` until it holds or the wait runs out.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
