//! Inbound HTTP request head (§3 `RequestHead`).
//!
//! Headers are ISO-8859-1-clean: each byte maps to one `char`, no UTF-8
//! assumption, preserving the exact wire bytes every proxy along the chain
//! is required to forward verbatim.

use crate::error::{Error, Result};

/// A parsed request line + headers, preserving insertion order. Header
/// lookups are ASCII case-insensitive, matching HTTP semantics.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub start_line: String,
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }
}

fn iso8859_1_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Parses a raw ISO-8859-1 byte buffer (request line + headers, including
/// the trailing `\r\n\r\n`) into a [`RequestHead`].
///
/// Header tokenizing itself is delegated to `httparse::Request`, the same
/// parser the retrieved teacher crate uses (`proxy.rs`'s
/// `handle_http_request`). Per §4.2, a header line that lacks a `:` is
/// ignored rather than treated as a parse failure, so such lines are
/// stripped out of the buffer before it reaches `httparse` — httparse itself
/// has no "ignore this line" mode and would otherwise reject the whole head.
pub fn parse_request_head(raw: &[u8]) -> Result<RequestHead> {
    let text = iso8859_1_string(raw);
    let mut lines = text.split("\r\n");
    let start_line = lines
        .next()
        .ok_or_else(|| Error::ClientHandshakeMalformed("empty request head".into()))?
        .to_string();

    let mut filtered = String::with_capacity(text.len());
    filtered.push_str(&start_line);
    filtered.push_str("\r\n");
    for line in lines {
        if line.is_empty() {
            // The blank line marks the head/body boundary; anything after
            // it (prefetched body bytes) is never header data.
            break;
        }
        if line.contains(':') {
            filtered.push_str(line);
            filtered.push_str("\r\n");
        }
        // Lines without ':' are ignored, per §4.2.
    }
    filtered.push_str("\r\n");
    let filtered = filtered.into_bytes();

    let mut header_slots = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut header_slots);
    match req.parse(&filtered)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => {
            return Err(Error::ClientHandshakeMalformed("incomplete request head".into()));
        }
    }

    let method = req
        .method
        .ok_or_else(|| Error::ClientHandshakeMalformed("missing method".into()))?
        .to_string();
    let target = req
        .path
        .ok_or_else(|| Error::ClientHandshakeMalformed("missing request target".into()))?
        .to_string();
    let version = match req.version {
        Some(0) => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
    .to_string();

    let headers = req
        .headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| (h.name.to_string(), iso8859_1_string(h.value).trim().to_string()))
        .collect();

    Ok(RequestHead {
        start_line,
        method,
        target,
        version,
        headers,
    })
}
