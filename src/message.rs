//! Raw ESL protocol frame: the `EslMessage` produced directly off the wire
//! before it is promoted into an `EslEvent` by the connection handler.

use std::collections::HashMap;

/// The recognized ESL `Content-Type` values (spec.md §6). Anything else is
/// passed through as `Unknown` rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentType {
    AuthRequest,
    CommandReply,
    ApiResponse,
    TextEventPlain,
    TextEventXml,
    TextDisconnectNotice,
    TextRudeRejection,
    Unknown(String),
}

impl ContentType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            crate::constants::CONTENT_TYPE_AUTH => ContentType::AuthRequest,
            crate::constants::CONTENT_TYPE_REPLY => ContentType::CommandReply,
            crate::constants::CONTENT_TYPE_API_RESPONSE => ContentType::ApiResponse,
            crate::constants::CONTENT_TYPE_EVENT_PLAIN => ContentType::TextEventPlain,
            crate::constants::CONTENT_TYPE_EVENT_XML => ContentType::TextEventXml,
            crate::constants::CONTENT_TYPE_DISCONNECT => ContentType::TextDisconnectNotice,
            crate::constants::CONTENT_TYPE_RUDE_REJECTION => ContentType::TextRudeRejection,
            other => ContentType::Unknown(other.to_string()),
        }
    }

    pub fn is_event(&self) -> bool {
        matches!(self, ContentType::TextEventPlain | ContentType::TextEventXml)
    }
}

/// An ordered header map: preserves insertion order (so a canonical
/// serializer round-trips) while still giving O(1) lookup via an auxiliary
/// index, the same trade-off `ticpu-freeswitch-esl-rs`'s parser makes with a
/// plain `HashMap` — we additionally keep order because spec.md §8 requires
/// a parse/serialize round-trip property test.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    order: Vec<String>,
    values: HashMap<String, String>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, preserving first-seen order. FreeSWITCH does not
    /// send duplicate header names in practice; a later insert of the same
    /// name overwrites the value without moving its position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if !self.values.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.values.insert(name, value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|s| s.as_str())
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterate headers in wire (insertion) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order
            .iter()
            .map(move |k| (k.as_str(), self.values[k].as_str()))
    }
}

/// A parsed protocol frame (spec.md §3 `EslMessage`).
#[derive(Debug, Clone)]
pub struct EslMessage {
    headers: HeaderMap,
    content_type: ContentType,
    body: Option<String>,
    content_length: Option<usize>,
}

impl EslMessage {
    pub fn new(headers: HeaderMap, body: Option<String>) -> Self {
        let content_type = headers
            .get("Content-Type")
            .map(ContentType::parse)
            .unwrap_or_else(|| ContentType::Unknown(String::new()));
        let content_length = headers.get("Content-Length").and_then(|v| v.parse().ok());

        Self {
            headers,
            content_type,
            body,
            content_length,
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn content_type(&self) -> &ContentType {
        &self.content_type
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    pub fn reply_text(&self) -> Option<&str> {
        self.header("Reply-Text")
    }

    pub fn is_ok(&self) -> bool {
        self.reply_text().map(|t| t.starts_with("+OK")).unwrap_or(false)
    }

    pub fn is_error(&self) -> bool {
        self.reply_text().map(|t| t.starts_with("-ERR")).unwrap_or(false)
    }

    pub fn error_text(&self) -> Option<&str> {
        if self.is_error() {
            self.reply_text().map(|t| t.strip_prefix("-ERR ").unwrap_or(t))
        } else {
            None
        }
    }

    /// Canonical wire serialization, used by the round-trip property test
    /// (spec.md §8) and never by the live writer (that's `command.rs`'s job
    /// — a message round-trip is a test fixture, not a runtime path).
    pub fn to_wire_format(&self) -> String {
        let mut out = String::new();
        for (k, v) in self.headers.iter() {
            if k == "Content-Length" {
                continue;
            }
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push('\n');
        }
        match &self.body {
            Some(body) => {
                out.push_str(&format!("Content-Length: {}\n\n", body.len()));
                out.push_str(body);
            }
            None => out.push('\n'),
        }
        out
    }
}
