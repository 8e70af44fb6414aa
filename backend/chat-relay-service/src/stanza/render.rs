//! Outbound frames. Every interpolated value goes through [`escape_xml`].

use super::{
    encode_archive_id, NS_BIND, NS_CLIENT, NS_DELAY, NS_FORWARD, NS_FRAMING, NS_INBOX, NS_MAM,
    NS_RECEIPTS, NS_SASL, NS_SESSION, NS_STREAMS, NS_TLS,
};
use chrono::{TimeZone, Utc};

pub const STREAM_CLOSE: &str = "</stream:stream>";
pub const DUO_PONG: &str = r#"<duo_pong preferred_interval="10000" preferred_timeout="5000" />"#;
pub const REGISTRATION_SUCCESSFUL: &str = "<duo_registration_successful />";

/// Escape XML special characters for attribute and text content
pub fn escape_xml(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

pub fn stream_open(version: &str, from: &str) -> String {
    format!(
        r#"<open xmlns="{}" version="{}" id="{}" from="{}"/>"#,
        NS_FRAMING,
        escape_xml(version),
        uuid::Uuid::new_v4(),
        escape_xml(from)
    )
}

pub fn stream_features(authenticated: bool) -> String {
    if authenticated {
        format!(
            r#"<features xmlns="{}"><session xmlns="{}"/><bind xmlns="{}"/></features>"#,
            NS_STREAMS, NS_SESSION, NS_BIND
        )
    } else {
        format!(
            r#"<features xmlns="{}"><starttls xmlns="{}"/><mechanisms xmlns="{}"><mechanism>PLAIN</mechanism></mechanisms></features>"#,
            NS_STREAMS, NS_TLS, NS_SASL
        )
    }
}

pub fn auth_success() -> String {
    format!(r#"<success xmlns="{}"/>"#, NS_SASL)
}

pub fn auth_failure() -> String {
    format!(r#"<failure xmlns="{}"><not-authorized/></failure>"#, NS_SASL)
}

pub fn iq_bind_result(id: &str, jid: &str) -> String {
    format!(
        r#"<iq type="result" id="{}"><bind xmlns="{}"><jid>{}</jid></bind></iq>"#,
        escape_xml(id),
        NS_BIND,
        escape_xml(jid)
    )
}

pub fn iq_result(id: &str) -> String {
    format!(r#"<iq type="result" id="{}"/>"#, escape_xml(id))
}

/// A chat or typing message as delivered to the recipient and as archived.
pub fn chat_message(
    from_jid: &str,
    to_jid: &str,
    stanza_id: &str,
    message_type: &str,
    body: Option<&str>,
    audio_uuid: Option<&str>,
) -> String {
    let mut xml = format!(
        r#"<message xmlns="{}" from="{}" to="{}" id="{}" type="{}""#,
        NS_CLIENT,
        escape_xml(from_jid),
        escape_xml(to_jid),
        escape_xml(stanza_id),
        escape_xml(message_type)
    );
    if let Some(audio_uuid) = audio_uuid {
        xml.push_str(&format!(r#" audio_uuid="{}""#, escape_xml(audio_uuid)));
    }

    match body {
        Some(body) => {
            xml.push_str(&format!(
                r#"><body>{}</body><request xmlns="{}"/></message>"#,
                escape_xml(body),
                NS_RECEIPTS
            ));
        }
        None => xml.push_str("/>"),
    }
    xml
}

pub fn message_too_long(stanza_id: &str) -> String {
    format!(r#"<duo_message_too_long id="{}"/>"#, escape_xml(stanza_id))
}

pub fn message_blocked(stanza_id: &str, reason: Option<&str>, subreason: Option<&str>) -> String {
    let mut xml = format!(r#"<duo_message_blocked id="{}""#, escape_xml(stanza_id));
    if let Some(reason) = reason {
        xml.push_str(&format!(r#" reason="{}""#, reason));
    }
    if let Some(subreason) = subreason {
        xml.push_str(&format!(r#" subreason="{}""#, subreason));
    }
    xml.push_str("/>");
    xml
}

pub fn message_not_unique(stanza_id: &str) -> String {
    format!(r#"<duo_message_not_unique id="{}"/>"#, escape_xml(stanza_id))
}

pub fn message_delivered(stanza_id: &str) -> String {
    format!(r#"<duo_message_delivered id="{}"/>"#, escape_xml(stanza_id))
}

pub fn server_error(stanza_id: &str) -> String {
    format!(r#"<duo_server_error id="{}"/>"#, escape_xml(stanza_id))
}

pub fn online_event(uuid: &str, status: &str) -> String {
    format!(
        r#"<duo_online_event uuid="{}" status="{}" />"#,
        escape_xml(uuid),
        status
    )
}

pub fn subscribe_successful(uuid: &str) -> String {
    format!(r#"<duo_subscribe_successful uuid="{}" />"#, escape_xml(uuid))
}

pub fn subscribe_unsuccessful(uuid: &str) -> String {
    format!(r#"<duo_subscribe_unsuccessful uuid="{}" />"#, escape_xml(uuid))
}

pub fn unsubscribe_successful(uuid: &str) -> String {
    format!(r#"<duo_unsubscribe_successful uuid="{}" />"#, escape_xml(uuid))
}

pub fn unsubscribe_unsuccessful(uuid: &str) -> String {
    format!(
        r#"<duo_unsubscribe_unsuccessful uuid="{}" />"#,
        escape_xml(uuid)
    )
}

/// `2024-01-31T12:00:00.000000Z` for a microsecond unix timestamp
pub fn format_stamp(micros: i64) -> String {
    Utc.timestamp_micros(micros)
        .single()
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}

/// One archived message wrapped for a MAM page. `message_xml` is already rendered.
pub fn mam_result(owner_jid: &str, query_id: &str, archive_id: i64, message_xml: &str) -> String {
    format!(
        r#"<message xmlns="{}" from="{}" to="{}" id="{}"><result xmlns="{}" queryid="{}" id="{}"><forwarded xmlns="{}"><delay xmlns="{}" stamp="{}"/>{}</forwarded></result></message>"#,
        NS_CLIENT,
        escape_xml(owner_jid),
        escape_xml(owner_jid),
        uuid::Uuid::new_v4(),
        NS_MAM,
        escape_xml(query_id),
        encode_archive_id(archive_id),
        NS_FORWARD,
        NS_DELAY,
        format_stamp(archive_id >> 8),
        message_xml
    )
}

pub fn mam_fin(owner_jid: &str, query_id: &str) -> String {
    format!(
        r#"<iq xmlns="{}" from="{}" to="{}" id="{}" type="result"><fin xmlns="{}"/></iq>"#,
        NS_CLIENT,
        escape_xml(owner_jid),
        escape_xml(owner_jid),
        escape_xml(query_id),
        NS_MAM
    )
}

pub struct InboxRow<'a> {
    pub owner_jid: &'a str,
    pub query_id: &'a str,
    pub msg_id: &'a str,
    pub unread_count: i64,
    pub updated_at_us: i64,
    pub mailbox: &'a str,
    /// Rendered message, embedded as-is
    pub content: &'a str,
}

pub fn inbox_result(row: &InboxRow<'_>) -> String {
    format!(
        r#"<message xmlns="{}" from="{}" to="{}" id="{}"><result xmlns="{}" unread="{}" queryid="{}"><forwarded xmlns="{}"><delay xmlns="{}" stamp="{}"/>{}</forwarded><read>{}</read><box>{}</box><archive>false</archive><mute>0</mute></result></message>"#,
        NS_CLIENT,
        escape_xml(row.owner_jid),
        escape_xml(row.owner_jid),
        escape_xml(row.msg_id),
        NS_INBOX,
        row.unread_count,
        escape_xml(row.query_id),
        NS_FORWARD,
        NS_DELAY,
        format_stamp(row.updated_at_us),
        row.content,
        row.unread_count == 0,
        escape_xml(row.mailbox)
    )
}

pub fn inbox_fin(query_id: &str) -> String {
    format!(
        r#"<iq id="{}" type="result"><fin/></iq>"#,
        escape_xml(query_id)
    )
}
