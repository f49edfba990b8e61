//! Reusable request line token buffers.
//!
//! A [`RequestLineBuffer`] is allocated once per connection and recycled
//! after every request, so the method, URI and protocol tokens are parsed
//! into storage that keeps its capacity across requests.
//!
//! The buffer deliberately does not implement `PartialEq`/`Hash`; compare
//! individual tokens instead.

use crate::{Error, Result};
use bytes::BytesMut;
use memchr::memchr;

/// Initial capacity of the method token
const METHOD_CAPACITY: usize = 8;
/// Initial capacity of the URI token
const URI_CAPACITY: usize = 64;
/// Initial capacity of the protocol token
const PROTOCOL_CAPACITY: usize = 8;

/// Method, URI and protocol of one HTTP request line.
#[derive(Debug)]
pub struct RequestLineBuffer {
    method: BytesMut,
    uri: BytesMut,
    protocol: BytesMut,
}

impl Default for RequestLineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestLineBuffer {
    pub fn new() -> Self {
        Self::with_capacity(METHOD_CAPACITY, URI_CAPACITY, PROTOCOL_CAPACITY)
    }

    pub fn with_capacity(method: usize, uri: usize, protocol: usize) -> Self {
        Self {
            method: BytesMut::with_capacity(method),
            uri: BytesMut::with_capacity(uri),
            protocol: BytesMut::with_capacity(protocol),
        }
    }

    /// Parse `METHOD SP URI [SP PROTOCOL]`, with or without the trailing CRLF.
    ///
    /// Any previous contents are discarded first. A missing protocol token
    /// leaves it empty (HTTP/0.9 style request).
    pub fn parse(&mut self, line: &[u8]) -> Result<()> {
        self.recycle();

        let line = trim_line_end(line);
        let method_end = memchr(b' ', line)
            .ok_or_else(|| Error::BadRequest("missing request URI".to_string()))?;
        if method_end == 0 {
            return Err(Error::BadRequest("missing request method".to_string()));
        }

        let rest = trim_leading_spaces(&line[method_end + 1..]);
        let (uri, protocol) = match memchr(b' ', rest) {
            Some(pos) => (&rest[..pos], trim_leading_spaces(&rest[pos + 1..])),
            None => (rest, &[][..]),
        };
        if uri.is_empty() {
            return Err(Error::BadRequest("missing request URI".to_string()));
        }

        self.method.extend_from_slice(&line[..method_end]);
        self.uri.extend_from_slice(uri);
        self.protocol.extend_from_slice(protocol);
        Ok(())
    }

    /// Reset every token to empty, keeping the allocated storage.
    pub fn recycle(&mut self) {
        self.method.clear();
        self.uri.clear();
        self.protocol.clear();
    }

    pub fn method(&self) -> &[u8] {
        &self.method
    }

    pub fn uri(&self) -> &[u8] {
        &self.uri
    }

    pub fn protocol(&self) -> &[u8] {
        &self.protocol
    }

    pub fn method_str(&self) -> Result<&str> {
        token_str(&self.method, "method")
    }

    pub fn uri_str(&self) -> Result<&str> {
        token_str(&self.uri, "URI")
    }

    pub fn protocol_str(&self) -> Result<&str> {
        token_str(&self.protocol, "protocol")
    }

    /// Capacities of the method, URI and protocol buffers
    pub fn capacity(&self) -> (usize, usize, usize) {
        (
            self.method.capacity(),
            self.uri.capacity(),
            self.protocol.capacity(),
        )
    }

    /// Offset of the first full match of `pattern` in the URI token.
    ///
    /// Accepts anything byte-like (`&str`, `String`, `&[u8]`, `Vec<u8>`) with
    /// the same semantics. An empty pattern never matches.
    pub fn index_of<P: AsRef<[u8]>>(&self, pattern: P) -> Option<usize> {
        self.index_of_from(pattern, 0)
    }

    /// Like [`index_of`](Self::index_of), starting the search at `start`.
    pub fn index_of_from<P: AsRef<[u8]>>(&self, pattern: P, start: usize) -> Option<usize> {
        let pattern = pattern.as_ref();
        let haystack = self.uri.get(start..)?;
        if pattern.is_empty() || pattern.len() > haystack.len() {
            return None;
        }
        let first = pattern[0];
        let last_start = haystack.len() - pattern.len();

        let mut pos = 0;
        while pos <= last_start {
            let candidate = pos + memchr(first, &haystack[pos..=last_start])?;
            if haystack[candidate..candidate + pattern.len()] == *pattern {
                return Some(start + candidate);
            }
            pos = candidate + 1;
        }
        None
    }

    /// Offset of the first `byte` in the URI token at or after `start`.
    pub fn index_of_byte(&self, byte: u8, start: usize) -> Option<usize> {
        let haystack = self.uri.get(start..)?;
        memchr(byte, haystack).map(|pos| start + pos)
    }
}

fn token_str<'a>(token: &'a [u8], name: &str) -> Result<&'a str> {
    std::str::from_utf8(token)
        .map_err(|_| Error::BadRequest(format!("request {} is not valid UTF-8", name)))
}

fn trim_line_end(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., b'\r' | b'\n'] = line {
        line = rest;
    }
    line
}

fn trim_leading_spaces(mut bytes: &[u8]) -> &[u8] {
    while let [b' ', rest @ ..] = bytes {
        bytes = rest;
    }
    bytes
}
