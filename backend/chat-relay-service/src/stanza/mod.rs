//! Client stanzas: the closed set of frames the relay understands, how they are read from raw
//! text and how responses are written back.

mod parse;
pub mod render;

pub use parse::parse;

use uuid::Uuid;

pub const NS_FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";
pub const NS_STREAMS: &str = "http://etherx.jabber.org/streams";
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const NS_SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
pub const NS_CLIENT: &str = "jabber:client";
pub const NS_PING: &str = "urn:xmpp:ping";
pub const NS_MAM: &str = "urn:xmpp:mam:2";
pub const NS_FORWARD: &str = "urn:xmpp:forward:0";
pub const NS_DELAY: &str = "urn:xmpp:delay";
pub const NS_RECEIPTS: &str = "urn:xmpp:receipts";
pub const NS_INBOX: &str = "erlang-solutions.com:xmpp:inbox:0";

pub const MAX_STANZA_ID_LEN: usize = 250;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stanza {
    StreamOpen { version: String, to: String },
    /// Base64 SASL PLAIN payload, untouched
    Auth { payload: String },
    Message(MessageStanza),
    /// `iq_id` is set for XMPP pings, unset for `duo_ping`
    Ping { iq_id: Option<String> },
    MamQuery(MamQuery),
    InboxQuery { query_id: String },
    Displayed { to: Uuid },
    SubscribePresence { uuid: String },
    UnsubscribePresence { uuid: String },
    IqBind { id: String },
    IqSession { id: String },
    /// `None` clears the stored token
    RegisterPushToken { token: Option<String> },
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStanza {
    Chat {
        stanza_id: String,
        to: Uuid,
        body: String,
    },
    Typing {
        stanza_id: String,
        to: Uuid,
    },
    Audio {
        stanza_id: String,
        to: Uuid,
        audio: Vec<u8>,
        /// 64 hex chars, assigned on receipt
        audio_uuid: String,
    },
}

impl MessageStanza {
    pub fn stanza_id(&self) -> &str {
        match self {
            MessageStanza::Chat { stanza_id, .. }
            | MessageStanza::Typing { stanza_id, .. }
            | MessageStanza::Audio { stanza_id, .. } => stanza_id,
        }
    }

    pub fn to(&self) -> Uuid {
        match self {
            MessageStanza::Chat { to, .. }
            | MessageStanza::Typing { to, .. }
            | MessageStanza::Audio { to, .. } => *to,
        }
    }

    /// Free text typed by the sender, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageStanza::Chat { body, .. } => Some(body),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MamQuery {
    pub query_id: String,
    pub with: Uuid,
    /// Exclusive upper bound on archive ids
    pub before: Option<i64>,
    pub max: Option<usize>,
}

/// Username part of a JID (`uuid@domain/resource` or a bare uuid).
pub fn bare_uuid(jid: &str) -> Option<Uuid> {
    let local = jid.split('@').next()?;
    Uuid::parse_str(local.trim()).ok()
}

const BASE32_DIGITS: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";

/// Archive ids travel as base-32 strings with digits `0-9A-V`.
pub fn encode_archive_id(id: i64) -> String {
    if id == 0 {
        return "0".to_string();
    }

    let mut n = id.unsigned_abs();
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(BASE32_DIGITS[(n % 32) as usize]);
        n /= 32;
    }
    if id < 0 {
        digits.push(b'-');
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

pub fn decode_archive_id(s: &str) -> Option<i64> {
    i64::from_str_radix(s, 32).ok()
}
