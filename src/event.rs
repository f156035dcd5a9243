//! ESL event parsing and representation
//!
//! `EslEvent` is the semantic view over a parsed `EslMessage` (spec.md §3):
//! event headers, an optional body, and a flag distinguishing a
//! command-reply-promoted event (outbound connect) from a plain event
//! parsed off `text/event-plain`/`text/event-xml`.
//!
//! Header values are stored as received on the wire and URL-decoded lazily
//! on access, caching the decoded form per spec.md §9's design note (decode
//! on read, not on parse, so a raw value is never silently corrupted by a
//! decode that didn't need to happen; cache it so a hot accessor like
//! `event_name()` doesn't re-decode on every call).

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::message::{ContentType, EslMessage, HeaderMap};

/// A parsed (or promoted) FreeSWITCH event.
#[derive(Debug)]
pub struct EslEvent {
    headers: HeaderMap,
    body: Option<String>,
    /// Set when this event was synthesized from a `command/reply` (the
    /// outbound-mode initial channel data) rather than parsed from a
    /// `text/event-*` frame.
    promoted: bool,
    decoded_cache: Mutex<HashMap<String, String>>,
}

impl Clone for EslEvent {
    fn clone(&self) -> Self {
        Self {
            headers: self.headers.clone(),
            body: self.body.clone(),
            promoted: self.promoted,
            decoded_cache: Mutex::new(self.decoded_cache.lock().unwrap().clone()),
        }
    }
}

impl EslEvent {
    pub fn new(headers: HeaderMap, body: Option<String>, promoted: bool) -> Self {
        Self {
            headers,
            body,
            promoted,
            decoded_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Build a plain event from a frame whose body carries the event's own
    /// header block (`text/event-plain`/`text/event-xml`). The frame's
    /// content-type determines the parse strategy; XML bodies are handled
    /// by `crate::codec::parse_event_xml`.
    pub fn from_message(message: &EslMessage) -> crate::error::EslResult<Self> {
        match message.content_type() {
            ContentType::TextEventPlain => {
                let body = message.body().unwrap_or("");
                let (headers, tail) = crate::codec::parse_header_block(body)?;
                let event_body = if tail.is_empty() { None } else { Some(tail.to_string()) };
                Ok(Self::new(headers, event_body, false))
            }
            ContentType::TextEventXml => {
                let body = message.body().unwrap_or("");
                let headers = crate::codec::parse_event_xml(body)?;
                Ok(Self::new(headers, None, false))
            }
            other => Err(crate::error::EslError::UnsupportedContentType(format!("{:?}", other))),
        }
    }

    /// Promote a `command/reply` into the initial `EslEvent` outbound mode
    /// delivers to `onConnect` (spec.md §4.C).
    pub fn promote(message: &EslMessage) -> Self {
        Self::new(message.headers().clone(), message.body().map(str::to_string), true)
    }

    pub fn is_promoted(&self) -> bool {
        self.promoted
    }

    /// Raw (not URL-decoded) header value.
    pub fn raw_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// URL-decoded header value, decoding once and caching the result.
    pub fn header(&self, name: &str) -> Option<String> {
        let raw = self.headers.get(name)?;
        let mut cache = self.decoded_cache.lock().unwrap();
        if let Some(cached) = cache.get(name) {
            return Some(cached.clone());
        }
        let decoded = urlencoding::decode(raw)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| raw.to_string());
        cache.insert(name.to_string(), decoded.clone());
        Some(decoded)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn body_lines(&self) -> Vec<&str> {
        self.body.as_deref().map(|b| b.lines().collect()).unwrap_or_default()
    }

    // ==================== Common accessors ====================

    pub fn event_name(&self) -> Option<String> {
        self.header("Event-Name")
    }

    pub fn is_event(&self, name: &str) -> bool {
        self.event_name().map(|n| n == name).unwrap_or(false)
    }

    pub fn unique_id(&self) -> Option<String> {
        self.header("Unique-ID").or_else(|| self.header("Channel-Call-UUID"))
    }

    pub fn job_uuid(&self) -> Option<String> {
        self.header("Job-UUID")
    }

    pub fn caller_number(&self) -> Option<String> {
        self.header("Caller-Caller-ID-Number")
            .or_else(|| self.header("variable_sip_from_user"))
    }

    pub fn callee_number(&self) -> Option<String> {
        self.header("Caller-Destination-Number")
            .or_else(|| self.header("variable_sip_to_user"))
    }

    pub fn duration(&self) -> Option<i64> {
        self.header("variable_duration").and_then(|s| s.parse().ok())
    }

    pub fn billsec(&self) -> Option<i64> {
        self.header("variable_billsec").and_then(|s| s.parse().ok())
    }

    pub fn hangup_cause(&self) -> Option<String> {
        self.header("Hangup-Cause")
    }

    pub fn channel_state(&self) -> Option<String> {
        self.header("Channel-State")
    }

    pub fn answer_state(&self) -> Option<String> {
        self.header("Answer-State")
    }

    pub fn direction(&self) -> Option<String> {
        self.header("Call-Direction").or_else(|| self.header("variable_direction"))
    }

    pub fn reply_text(&self) -> Option<String> {
        self.header("Reply-Text")
    }

    pub fn is_ok(&self) -> bool {
        self.reply_text().map(|t| t.starts_with("+OK")).unwrap_or(false)
    }

    pub fn is_error(&self) -> bool {
        self.reply_text().map(|t| t.starts_with("-ERR")).unwrap_or(false)
    }

    pub fn error_message(&self) -> Option<String> {
        if self.is_error() {
            self.reply_text().map(|t| t.strip_prefix("-ERR ").unwrap_or(&t).to_string())
        } else {
            None
        }
    }

    /// Look up a `variable_<name>` header.
    pub fn get_variable(&self, name: &str) -> Option<String> {
        self.header(&format!("variable_{}", name))
    }

    /// `Event-Date-Timestamp` is microseconds since the Unix epoch.
    pub fn event_timestamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let micros: i64 = self.header("Event-Date-Timestamp")?.parse().ok()?;
        chrono::DateTime::from_timestamp_micros(micros)
    }

    /// All (URL-decoded) headers plus the body as a JSON object, for callers
    /// that want to log or persist an event without depending on this
    /// crate's own types.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::with_capacity(self.headers.len() + 1);
        for (name, _) in self.headers.iter() {
            if let Some(value) = self.header(name) {
                map.insert(name.to_string(), serde_json::Value::String(value));
            }
        }
        if let Some(body) = self.body() {
            map.insert("_body".to_string(), serde_json::Value::String(body.to_string()));
        }
        serde_json::Value::Object(map)
    }
}

impl fmt::Display for EslEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EslEvent {{")?;
        if let Some(name) = self.event_name() {
            write!(f, " Event-Name: {}", name)?;
        }
        if let Some(uuid) = self.unique_id() {
            write!(f, ", UUID: {}", uuid)?;
        }
        write!(f, ", headers: {} }}", self.headers.len())
    }
}
