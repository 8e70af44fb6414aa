use crate::audio::AudioStore;
use crate::classifier::{MessageGate, TextClassifier};
use crate::config::Config;
use crate::fanout::{Broker, ChannelRegistry};
use crate::notify::Notifier;
use crate::presence::Presence;
use crate::store::{Directory, MessageStore};
use crate::writes::Writes;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub directory: Arc<dyn Directory>,
    pub messages: Arc<dyn MessageStore>,
    pub broker: Arc<dyn Broker>,
    /// Local subscribers of the broker's channels
    pub registry: ChannelRegistry,
    pub presence: Presence,
    pub gate: Arc<MessageGate>,
    pub writes: Arc<Writes>,
    pub notifier: Arc<dyn Notifier>,
    pub audio: Arc<dyn AudioStore>,
}

/// Backends the state is assembled from.
pub struct Backends {
    pub directory: Arc<dyn Directory>,
    pub messages: Arc<dyn MessageStore>,
    pub broker: Arc<dyn Broker>,
    pub registry: ChannelRegistry,
    pub text: Arc<dyn TextClassifier>,
    pub notifier: Arc<dyn Notifier>,
    pub audio: Arc<dyn AudioStore>,
}

impl AppState {
    /// Wire up the gate, presence and batched writes. Batchers are not started here.
    pub fn new(config: Config, backends: Backends) -> Self {
        let gate = MessageGate::new(
            backends.directory.clone(),
            backends.messages.clone(),
            backends.text,
            config.max_message_len,
        );
        let presence = Presence::new(
            backends.broker.clone(),
            backends.registry.clone(),
            config.presence_ttl,
        );
        let writes = Writes::new(backends.directory.clone(), backends.messages.clone());

        Self {
            config: Arc::new(config),
            directory: backends.directory,
            messages: backends.messages,
            broker: backends.broker,
            registry: backends.registry,
            presence,
            gate: Arc::new(gate),
            writes: Arc::new(writes),
            notifier: backends.notifier,
            audio: backends.audio,
        }
    }
}
