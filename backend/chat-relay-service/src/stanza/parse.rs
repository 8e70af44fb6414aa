use super::{
    bare_uuid, decode_archive_id, MamQuery, MessageStanza, Stanza, MAX_STANZA_ID_LEN, NS_BIND,
    NS_CLIENT, NS_FRAMING, NS_PING, NS_SASL, NS_SESSION,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::reader::NsReader;
use rand::RngCore;

/// Minimal element tree. Names are local names; `ns` is the resolved namespace.
#[derive(Debug, Clone, Default)]
struct Element {
    name: String,
    ns: Option<String>,
    attrs: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn is(&self, name: &str, ns: &str) -> bool {
        self.name == name && self.ns.as_deref() == Some(ns)
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    fn child_ns(&self, name: &str, ns: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.is(name, ns))
    }

    /// Depth-first search of descendants by local name.
    fn find(&self, name: &str) -> Option<&Element> {
        self.find_where(&|e| e.name == name)
    }

    fn find_where(&self, pred: &dyn Fn(&Element) -> bool) -> Option<&Element> {
        let mut pending: Vec<&Element> = self.children.iter().rev().collect();
        while let Some(element) = pending.pop() {
            if pred(element) {
                return Some(element);
            }
            pending.extend(element.children.iter().rev());
        }
        None
    }
}

/// Deepest element nesting accepted in a frame.
const MAX_DEPTH: usize = 256;

/// Parse one frame. Anything malformed or off-schema yields `None`.
pub fn parse(frame: &str) -> Option<Stanza> {
    let root = parse_tree(frame)?;
    classify(&root)
}

fn parse_tree(frame: &str) -> Option<Element> {
    let mut reader = NsReader::from_str(frame);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let (resolved, event) = reader.read_resolved_event().ok()?;
        match event {
            Event::Start(start) => {
                if stack.len() >= MAX_DEPTH {
                    return None;
                }
                let element = open_element(&start, resolved)?;
                stack.push(element);
            }
            Event::Empty(start) => {
                let element = open_element(&start, resolved)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack.pop()?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(text) => {
                let text = text.unescape().ok()?;
                push_text(&mut stack, &text)?;
            }
            Event::CData(cdata) => {
                let raw = cdata.into_inner();
                let text = std::str::from_utf8(&raw).ok()?;
                push_text(&mut stack, text)?;
            }
            Event::DocType(_) => return None,
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) => {}
            Event::Eof => break,
        }
    }

    if !stack.is_empty() {
        return None;
    }
    root
}

fn open_element(start: &BytesStart<'_>, resolved: ResolveResult<'_>) -> Option<Element> {
    let ns = match resolved {
        ResolveResult::Bound(ns) => Some(std::str::from_utf8(ns.as_ref()).ok()?.to_owned()),
        ResolveResult::Unbound => None,
        ResolveResult::Unknown(_) => return None,
    };
    let name = std::str::from_utf8(start.local_name().as_ref())
        .ok()?
        .to_owned();

    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.ok()?;
        let key = std::str::from_utf8(attr.key.as_ref()).ok()?;
        if key == "xmlns" || key.starts_with("xmlns:") {
            continue;
        }
        let value = attr.unescape_value().ok()?.into_owned();
        attrs.push((key.to_owned(), value));
    }

    Some(Element {
        name,
        ns,
        attrs,
        ..Element::default()
    })
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Option<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        // a second top-level element
        None => return None,
    }
    Some(())
}

fn push_text(stack: &mut [Element], text: &str) -> Option<()> {
    match stack.last_mut() {
        Some(current) => current.text.push_str(text),
        None if text.trim().is_empty() => {}
        None => return None,
    }
    Some(())
}

fn classify(root: &Element) -> Option<Stanza> {
    let ns = root.ns.as_deref();

    match (root.name.as_str(), ns) {
        ("open", Some(NS_FRAMING)) => Some(Stanza::StreamOpen {
            version: root.attr("version")?.to_owned(),
            to: root.attr("to")?.to_owned(),
        }),
        ("auth", Some(NS_SASL)) => Some(Stanza::Auth {
            payload: root.text.trim().to_owned(),
        }),
        ("message", Some(NS_CLIENT)) => {
            if root.child("displayed").is_some() {
                let to = bare_uuid(root.attr("to")?)?;
                Some(Stanza::Displayed { to })
            } else {
                parse_message(root).map(Stanza::Message)
            }
        }
        ("iq", None) | ("iq", Some(NS_CLIENT)) => parse_iq(root),
        ("inbox", _) => parse_inbox(root),
        ("duo_ping", _) => Some(Stanza::Ping { iq_id: None }),
        ("duo_subscribe_online", _) => Some(Stanza::SubscribePresence {
            uuid: non_empty(root.attr("uuid"))?.to_owned(),
        }),
        ("duo_unsubscribe_online", _) => Some(Stanza::UnsubscribePresence {
            uuid: non_empty(root.attr("uuid"))?.to_owned(),
        }),
        ("duo_register_push_token", _) => {
            let token = root.attr("token")?.trim();
            Some(Stanza::RegisterPushToken {
                token: (!token.is_empty()).then(|| token.to_owned()),
            })
        }
        _ => Some(Stanza::Unknown),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_message(root: &Element) -> Option<MessageStanza> {
    let stanza_id = non_empty(root.attr("id"))
        .filter(|id| id.chars().count() <= MAX_STANZA_ID_LEN)?
        .to_owned();
    let to = bare_uuid(root.attr("to")?)?;

    match root.attr("type")? {
        "typing" => Some(MessageStanza::Typing { stanza_id, to }),
        "chat" => {
            if let Some(encoded) = non_empty(root.attr("audio_base64")) {
                let audio = STANDARD.decode(encoded).ok()?;
                return Some(MessageStanza::Audio {
                    stanza_id,
                    to,
                    audio,
                    audio_uuid: random_audio_uuid(),
                });
            }

            let body = root.child_ns("body", NS_CLIENT)?.text.trim();
            if body.is_empty() {
                return None;
            }
            Some(MessageStanza::Chat {
                stanza_id,
                to,
                body: body.to_owned(),
            })
        }
        _ => None,
    }
}

fn random_audio_uuid() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn parse_iq(root: &Element) -> Option<Stanza> {
    let id = root.attr("id").unwrap_or("default").to_owned();

    if root.child_ns("bind", NS_BIND).is_some() {
        return Some(Stanza::IqBind { id });
    }
    if root.child_ns("session", NS_SESSION).is_some() {
        return Some(Stanza::IqSession { id });
    }
    if root.child_ns("ping", NS_PING).is_some() {
        return Some(Stanza::Ping { iq_id: Some(id) });
    }
    if root.find("query").is_some() {
        return parse_mam_query(root).map(Stanza::MamQuery);
    }
    if root.find("inbox").is_some() {
        return parse_inbox(root);
    }

    Some(Stanza::Unknown)
}

fn parse_mam_query(root: &Element) -> Option<MamQuery> {
    let query = root.find("query")?;
    let query_id = non_empty(query.attr("queryid"))?.to_owned();

    let with = query
        .find_where(&|e| e.name == "field" && e.attr("var") == Some("with"))?
        .child("value")?;
    let with = bare_uuid(with.text.trim())?;

    let before = match query.find("before").and_then(|e| non_empty(Some(e.text.as_str()))) {
        Some(raw) => Some(decode_archive_id(raw)?),
        None => None,
    };

    let max = match query.find("max").and_then(|e| non_empty(Some(e.text.as_str()))) {
        Some(raw) => Some(raw.parse::<usize>().ok()?),
        None => None,
    };

    Some(MamQuery {
        query_id,
        with,
        before,
        max,
    })
}

fn parse_inbox(root: &Element) -> Option<Stanza> {
    let inbox = if root.name == "inbox" {
        root
    } else {
        root.find("inbox")?
    };
    let query_id = non_empty(inbox.attr("queryid"))?.to_owned();
    Some(Stanza::InboxQuery { query_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const PEER: &str = "6e3b6d5a-2b51-4bd4-9a8b-6a2b3f0f6c11";

    fn peer() -> Uuid {
        Uuid::parse_str(PEER).unwrap()
    }

    #[test]
    fn test_stream_open() {
        let frame = r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" to="duolicious.app" version="1.0"/>"#;
        assert_eq!(
            parse(frame),
            Some(Stanza::StreamOpen {
                version: "1.0".into(),
                to: "duolicious.app".into(),
            })
        );

        let missing_to = r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" version="1.0"/>"#;
        assert_eq!(parse(missing_to), None);
    }

    #[test]
    fn test_auth_payload_is_trimmed() {
        let frame = r#"<auth xmlns="urn:ietf:params:xml:ns:xmpp-sasl" mechanism="PLAIN"> AGEAYg== </auth>"#;
        assert_eq!(
            parse(frame),
            Some(Stanza::Auth {
                payload: "AGEAYg==".into()
            })
        );
    }

    #[test]
    fn test_chat_message() {
        let frame = format!(
            r#"<message xmlns="jabber:client" type="chat" to="{}@duolicious.app" id="m1"><body>  hello there </body><request xmlns="urn:xmpp:receipts"/></message>"#,
            PEER
        );
        assert_eq!(
            parse(&frame),
            Some(Stanza::Message(MessageStanza::Chat {
                stanza_id: "m1".into(),
                to: peer(),
                body: "hello there".into(),
            }))
        );
    }

    #[test]
    fn test_prefixed_namespace_resolves() {
        let frame = format!(
            r#"<c:message xmlns:c="jabber:client" type="chat" to="{}" id="m1"><c:body>hi</c:body></c:message>"#,
            PEER
        );
        assert!(matches!(
            parse(&frame),
            Some(Stanza::Message(MessageStanza::Chat { .. }))
        ));
    }

    #[test]
    fn test_body_in_foreign_namespace_is_rejected() {
        let frame = format!(
            r#"<message xmlns="jabber:client" type="chat" to="{}" id="m1"><body xmlns="urn:other">hi</body></message>"#,
            PEER
        );
        assert_eq!(parse(&frame), None);
    }

    #[test]
    fn test_typing_message() {
        let frame = format!(
            r#"<message xmlns="jabber:client" type="typing" to="{}@duolicious.app" id="t1"/>"#,
            PEER
        );
        assert_eq!(
            parse(&frame),
            Some(Stanza::Message(MessageStanza::Typing {
                stanza_id: "t1".into(),
                to: peer(),
            }))
        );
    }

    #[test]
    fn test_audio_message_gets_random_uuid() {
        let frame = format!(
            r#"<message xmlns="jabber:client" type="chat" to="{}" id="a1" audio_base64="aGVsbG8="/>"#,
            PEER
        );
        match parse(&frame) {
            Some(Stanza::Message(MessageStanza::Audio {
                audio, audio_uuid, ..
            })) => {
                assert_eq!(audio, b"hello");
                assert_eq!(audio_uuid.len(), 64);
                assert!(audio_uuid.chars().all(|c| c.is_ascii_hexdigit()));
            }
            other => panic!("unexpected parse result: {:?}", other),
        }

        let bad = format!(
            r#"<message xmlns="jabber:client" type="chat" to="{}" id="a1" audio_base64="!!!"/>"#,
            PEER
        );
        assert_eq!(parse(&bad), None);
    }

    #[test]
    fn test_invalid_messages_are_dropped() {
        let empty_body = format!(
            r#"<message xmlns="jabber:client" type="chat" to="{}" id="m1"><body>   </body></message>"#,
            PEER
        );
        let no_type = format!(
            r#"<message xmlns="jabber:client" to="{}" id="m1"><body>x</body></message>"#,
            PEER
        );
        let bad_to = r#"<message xmlns="jabber:client" type="chat" to="bob@duolicious.app" id="m1"><body>x</body></message>"#;
        let long_id = format!(
            r#"<message xmlns="jabber:client" type="chat" to="{}" id="{}"><body>x</body></message>"#,
            PEER,
            "x".repeat(251)
        );

        assert_eq!(parse(&empty_body), None);
        assert_eq!(parse(&no_type), None);
        assert_eq!(parse(bad_to), None);
        assert_eq!(parse(&long_id), None);
    }

    #[test]
    fn test_hostile_xml_is_dropped() {
        assert_eq!(parse("<message"), None);
        assert_eq!(parse("<a></b>"), None);
        assert_eq!(parse("<a/><b/>"), None);
        assert_eq!(parse("text<a/>"), None);
        assert_eq!(parse(r#"<!DOCTYPE x [<!ENTITY e "boom">]><x>&e;</x>"#), None);
        assert_eq!(parse("<x>&undefined;</x>"), None);
        assert_eq!(parse(r#"<p:x xmlns:q="urn:q"/>"#), None);
        assert_eq!(parse(""), None);
    }

    #[test]
    fn test_deep_nesting_is_dropped() {
        let deep = "<a>".repeat(200_000) + &"</a>".repeat(200_000);
        assert_eq!(parse(&deep), None);

        let over = "<a>".repeat(MAX_DEPTH + 1) + &"</a>".repeat(MAX_DEPTH + 1);
        assert_eq!(parse(&over), None);

        let nested = format!("<presence>{}{}</presence>", "<a>".repeat(100), "</a>".repeat(100));
        assert_eq!(parse(&nested), Some(Stanza::Unknown));
    }

    #[test]
    fn test_unknown_root() {
        assert_eq!(parse("<presence/>"), Some(Stanza::Unknown));
    }

    #[test]
    fn test_pings() {
        assert_eq!(parse("<duo_ping/>"), Some(Stanza::Ping { iq_id: None }));
        assert_eq!(
            parse(r#"<iq xmlns="jabber:client" type="get" id="p1"><ping xmlns="urn:xmpp:ping"/></iq>"#),
            Some(Stanza::Ping {
                iq_id: Some("p1".into())
            })
        );
    }

    #[test]
    fn test_mam_query() {
        let frame = format!(
            r#"<iq xmlns="jabber:client" type="set" id="q">
                 <query xmlns="urn:xmpp:mam:2" queryid="qid">
                   <x xmlns="jabber:x:data" type="submit">
                     <field var="FORM_TYPE"><value>urn:xmpp:mam:2</value></field>
                     <field var="with"><value>{}@duolicious.app</value></field>
                   </x>
                   <set xmlns="http://jabber.org/protocol/rsm"><max>20</max><before>1V</before></set>
                 </query>
               </iq>"#,
            PEER
        );
        assert_eq!(
            parse(&frame),
            Some(Stanza::MamQuery(MamQuery {
                query_id: "qid".into(),
                with: peer(),
                before: Some(63),
                max: Some(20),
            }))
        );
    }

    #[test]
    fn test_mam_query_without_paging() {
        let frame = format!(
            r#"<iq type="set" id="q"><query queryid="qid"><x><field var="with"><value>{}</value></field></x><set><before/></set></query></iq>"#,
            PEER
        );
        assert_eq!(
            parse(&frame),
            Some(Stanza::MamQuery(MamQuery {
                query_id: "qid".into(),
                with: peer(),
                before: None,
                max: None,
            }))
        );
    }

    #[test]
    fn test_mam_query_with_bad_cursor_is_dropped() {
        let frame = format!(
            r#"<iq type="set" id="q"><query queryid="qid"><x><field var="with"><value>{}</value></field></x><set><before>not base32!</before></set></query></iq>"#,
            PEER
        );
        assert_eq!(parse(&frame), None);
    }

    #[test]
    fn test_inbox_queries() {
        let wrapped = r#"<iq xmlns="jabber:client" type="set" id="1"><inbox xmlns="erlang-solutions.com:xmpp:inbox:0" queryid="iq1"/></iq>"#;
        let bare = r#"<inbox xmlns="erlang-solutions.com:xmpp:inbox:0" queryid="iq2"/>"#;
        assert_eq!(
            parse(wrapped),
            Some(Stanza::InboxQuery {
                query_id: "iq1".into()
            })
        );
        assert_eq!(
            parse(bare),
            Some(Stanza::InboxQuery {
                query_id: "iq2".into()
            })
        );
    }

    #[test]
    fn test_displayed() {
        let frame = format!(
            r#"<message xmlns="jabber:client" to="{}@duolicious.app"><displayed xmlns="urn:xmpp:chat-markers:0" id="m1"/></message>"#,
            PEER
        );
        assert_eq!(parse(&frame), Some(Stanza::Displayed { to: peer() }));
    }

    #[test]
    fn test_presence_and_push_token() {
        assert_eq!(
            parse(&format!(r#"<duo_subscribe_online uuid="{}"/>"#, PEER)),
            Some(Stanza::SubscribePresence { uuid: PEER.into() })
        );
        assert_eq!(
            parse(&format!(r#"<duo_unsubscribe_online uuid="{}"/>"#, PEER)),
            Some(Stanza::UnsubscribePresence { uuid: PEER.into() })
        );
        assert_eq!(parse("<duo_subscribe_online/>"), None);
        assert_eq!(
            parse(r#"<duo_register_push_token token="ExponentPushToken[x]"/>"#),
            Some(Stanza::RegisterPushToken {
                token: Some("ExponentPushToken[x]".into())
            })
        );
        assert_eq!(
            parse(r#"<duo_register_push_token token=""/>"#),
            Some(Stanza::RegisterPushToken { token: None })
        );
    }

    #[test]
    fn test_bind_and_session() {
        assert_eq!(
            parse(r#"<iq xmlns="jabber:client" type="set" id="b1"><bind xmlns="urn:ietf:params:xml:ns:xmpp-bind"><resource>r</resource></bind></iq>"#),
            Some(Stanza::IqBind { id: "b1".into() })
        );
        assert_eq!(
            parse(r#"<iq xmlns="jabber:client" type="set" id="s1"><session xmlns="urn:ietf:params:xml:ns:xmpp-session"/></iq>"#),
            Some(Stanza::IqSession { id: "s1".into() })
        );
    }

    #[test]
    fn test_escaped_text_is_unescaped() {
        let frame = format!(
            r#"<message xmlns="jabber:client" type="chat" to="{}" id="m&amp;1"><body>a &lt; b</body></message>"#,
            PEER
        );
        assert_eq!(
            parse(&frame),
            Some(Stanza::Message(MessageStanza::Chat {
                stanza_id: "m&1".into(),
                to: peer(),
                body: "a < b".into(),
            }))
        );
    }
}
