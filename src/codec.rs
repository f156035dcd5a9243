//! Wire codec: frames and parses `EslMessage`s off a byte stream
//!
//! Mirrors the teacher's `EslConnection::read_response` byte-oriented read
//! loop, generalized to return a structured `EslMessage` instead of a raw
//! `String`, and to buffer only the header block plus the declared body
//! length rather than concatenating across frames.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{EslError, EslResult};
use crate::message::{EslMessage, HeaderMap};

/// Read one `EslMessage` off `reader`: a header block terminated by a blank
/// line, followed by a `Content-Length`-gated body if one is declared.
pub async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> EslResult<EslMessage> {
    let headers = read_header_block(reader).await?;

    let content_length = match headers.get("Content-Length") {
        Some(raw) => Some(
            raw.trim()
                .parse::<usize>()
                .map_err(|_| EslError::InvalidContentLength(raw.to_string()))?,
        ),
        None => None,
    };

    let body = match content_length {
        Some(n) if n > 0 => {
            let mut buf = vec![0u8; n];
            reader.read_exact(&mut buf).await.map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => EslError::UnexpectedEof,
                _ => EslError::Io(e),
            })?;
            Some(String::from_utf8_lossy(&buf).into_owned())
        }
        _ => None,
    };

    Ok(EslMessage::new(headers, body))
}

async fn read_header_block<R: AsyncBufRead + Unpin>(reader: &mut R) -> EslResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            // EOF with no bytes read at all: a clean close between frames is
            // the caller's problem (it sees `UnexpectedEof` and treats it as
            // a closed socket), not a malformed frame.
            return Err(EslError::UnexpectedEof);
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = parse_header_line(trimmed)?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn parse_header_line(line: &str) -> EslResult<(String, String)> {
    let idx = line.find(':').ok_or_else(|| EslError::MalformedHeader(line.to_string()))?;
    let name = line[..idx].trim().to_string();
    let value = &line[idx + 1..];
    let value = value.strip_prefix(' ').unwrap_or(value);
    Ok((name, value.to_string()))
}

/// Parse a block of `Name: Value` lines out of an in-memory string (used for
/// the nested header block inside a `text/event-plain` body), returning the
/// parsed headers and whatever text follows.
///
/// If the parsed block itself carries a `Content-Length`, that many bytes
/// are consumed as an inner body (e.g. a DTMF payload) and the remaining
/// tail is returned as the event's message body, per spec.md §4.A step 3.
pub fn parse_header_block(text: &str) -> EslResult<(HeaderMap, String)> {
    let mut headers = HeaderMap::new();
    let mut rest = text;

    loop {
        let (line, remainder) = match rest.find('\n') {
            Some(idx) => (&rest[..idx], &rest[idx + 1..]),
            None => (rest, ""),
        };
        let line = line.trim_end_matches('\r');
        rest = remainder;
        if line.is_empty() {
            break;
        }
        let (name, value) = parse_header_line(line)?;
        headers.insert(name, value);
        if rest.is_empty() {
            break;
        }
    }

    if let Some(raw_len) = headers.get("Content-Length") {
        let n: usize = raw_len.trim().parse().map_err(|_| EslError::InvalidContentLength(raw_len.to_string()))?;
        if n > 0 {
            if rest.len() < n {
                return Err(EslError::UnexpectedEof);
            }
            let (_inner_body, tail) = rest.split_at(n);
            return Ok((headers, tail.to_string()));
        }
    }

    Ok((headers, rest.to_string()))
}

/// Minimal hand-rolled scanner for a `text/event-xml` body: extracts the
/// `<headers>` child elements into the same ordered map the plain-text
/// parser produces. FreeSWITCH's XML event body is a fixed, simple shape
/// (no attributes, no CDATA), so this never needs a real XML parser —
/// this crate only parses XML events, it never emits them.
pub fn parse_event_xml(xml: &str) -> EslResult<HeaderMap> {
    let mut headers = HeaderMap::new();

    let headers_start = xml
        .find("<headers>")
        .ok_or_else(|| EslError::MalformedHeader("missing <headers> element".to_string()))?
        + "<headers>".len();
    let headers_end = xml[headers_start..]
        .find("</headers>")
        .map(|i| headers_start + i)
        .ok_or_else(|| EslError::MalformedHeader("unterminated <headers> element".to_string()))?;
    let mut rest = &xml[headers_start..headers_end];

    while let Some(tag_start) = rest.find('<') {
        let after_open = &rest[tag_start + 1..];
        let tag_end = after_open
            .find('>')
            .ok_or_else(|| EslError::MalformedHeader("unterminated XML tag".to_string()))?;
        let tag_name = &after_open[..tag_end];

        if let Some(closing) = tag_name.strip_prefix('/') {
            let _ = closing;
            rest = &after_open[tag_end + 1..];
            continue;
        }

        let close_tag = format!("</{}>", tag_name);
        let value_region = &after_open[tag_end + 1..];
        let close_idx = value_region
            .find(&close_tag)
            .ok_or_else(|| EslError::MalformedHeader(format!("missing closing tag for {}", tag_name)))?;
        let raw_value = &value_region[..close_idx];

        headers.insert(tag_name.to_string(), decode_xml_entities(raw_value));
        rest = &value_region[close_idx + close_tag.len()..];
    }

    Ok(headers)
}

fn decode_xml_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
