//! Management protocol framing
//!
//! A management request is `<path>[SP<payload>]` terminated by a single NUL
//! byte; the reply is one line of JSON followed by `\n`, after which the
//! server closes the connection. Paths are lower-case dictionary-like keys
//! (`bus/create`, `bus/80000/add`); payloads are raw bytes whose shape is
//! owned by the individual handler.
//!
//! Dispatch is table-driven: handlers register [`PathPattern`]s such as
//! `bus/{id}/add`, and the router extracts the `{name}` segments.

use crate::error::{ProtocolError, Result};
use serde::Serialize;

/// Upper bound on a request frame, NUL terminator included
pub const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// A parsed management request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedRequest<'a> {
    /// Request path, the bytes before the first space
    pub path: &'a str,
    /// Raw payload, empty when the request had no space
    pub payload: &'a [u8],
}

/// Split a NUL-stripped request frame into path and payload.
pub fn parse_request(frame: &[u8]) -> Result<ParsedRequest<'_>> {
    let (path_bytes, payload) = match frame.iter().position(|&b| b == b' ') {
        Some(idx) => (&frame[..idx], &frame[idx + 1..]),
        None => (frame, &[][..]),
    };
    if path_bytes.is_empty() {
        return Err(ProtocolError::MalformedRequest("empty path"));
    }
    let path = std::str::from_utf8(path_bytes)
        .map_err(|_| ProtocolError::MalformedRequest("path is not UTF-8"))?;
    if path.split('/').any(|seg| seg.is_empty()) {
        return Err(ProtocolError::MalformedRequest("empty path segment"));
    }
    Ok(ParsedRequest { path, payload })
}

/// Encode one JSON reply line.
pub fn encode_reply<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

/// One segment of a registered path pattern
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A registered path pattern with `{name}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    segments: Vec<Segment>,
}

/// Values extracted from the `{name}` segments of a matched path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams {
    values: Vec<(String, String)>,
}

impl PathParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

impl PathPattern {
    /// Parse a pattern such as `bus/{id}/add`.
    ///
    /// Panics on a malformed pattern: patterns are compile-time constants
    /// in the dispatch table, never wire input.
    pub fn new(pattern: &str) -> Self {
        let segments = pattern
            .split('/')
            .map(|seg| {
                assert!(!seg.is_empty(), "empty segment in pattern '{pattern}'");
                if let Some(name) = seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    assert!(!name.is_empty(), "empty placeholder in pattern '{pattern}'");
                    Segment::Param(name.to_string())
                } else {
                    Segment::Literal(seg.to_string())
                }
            })
            .collect();
        Self { segments }
    }

    /// Match a request path, extracting placeholder values.
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        let mut params = PathParams::default();
        let mut segments = self.segments.iter();
        for part in path.split('/') {
            match segments.next()? {
                Segment::Literal(lit) => {
                    if lit != part {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.values.push((name.clone(), part.to_string()));
                }
            }
        }
        if segments.next().is_some() {
            return None;
        }
        Some(params)
    }
}
