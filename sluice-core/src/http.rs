// HTTP request and response types

use crate::request_line::RequestLineBuffer;
use crate::{Error, HttpStatus, Result};
use std::collections::HashMap;

/// Request attribute naming the URI of the page being included.
pub const INCLUDE_REQUEST_URI: &str = "sluice.include.request_uri";

/// How a request reached the component handling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchType {
    /// Direct client request
    #[default]
    Request,
    /// Forwarded from another component
    Forward,
    /// Included into another component's output
    Include,
}

/// HTTP request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// Request URI as sent, including any query string
    pub uri: String,
    /// Path portion of the URI
    pub path: String,
    pub query: Option<String>,
    pub protocol: String,
    /// Header names are stored lower-cased
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub dispatch: DispatchType,
}

impl Request {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (uri.clone(), None),
        };
        Self {
            method: method.into(),
            uri,
            path,
            query,
            protocol: "HTTP/1.1".to_string(),
            headers: HashMap::new(),
            body: Vec::new(),
            attributes: HashMap::new(),
            dispatch: DispatchType::Request,
        }
    }

    /// Build a request from the tokens of a parsed request line.
    pub fn from_request_line(line: &RequestLineBuffer) -> Result<Self> {
        let method = line.method_str()?;
        let uri = line.uri_str()?;
        if method.is_empty() || uri.is_empty() {
            return Err(Error::BadRequest("empty request line".to_string()));
        }
        let protocol = match line.protocol_str()? {
            "" => "HTTP/0.9",
            protocol => protocol,
        };
        Ok(Self::new(method, uri).with_protocol(protocol))
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Get a header by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Get a query parameter by name (`a=1&b` style, no percent-decoding)
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.as_deref()?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then_some(value)
        })
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<String> {
        self.attributes.remove(name)
    }

    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }

    /// Whether this request is executing as an include inside another request
    pub fn is_include(&self) -> bool {
        self.dispatch == DispatchType::Include
    }

    /// Whether the client expects the connection to stay open
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("connection").unwrap_or("");
        if self.protocol == "HTTP/1.1" {
            !connection.eq_ignore_ascii_case("close")
        } else {
            connection.eq_ignore_ascii_case("keep-alive")
        }
    }
}

/// HTTP response
///
/// The body is buffered; the connector decides how it is framed on the wire.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    content_length: Option<u64>,
    committed: bool,
    suspended: bool,
    chunking_allowed: bool,
    closing: bool,
    error: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self::new(200)
    }
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            content_length: None,
            committed: false,
            suspended: false,
            chunking_allowed: true,
            closing: false,
            error: false,
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn not_found() -> Self {
        Self::new(404)
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Set a header, replacing any existing value with the same name
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => *existing = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.set_header("Content-Type", content_type);
    }

    pub fn set_content_length(&mut self, length: u64) {
        self.content_length = Some(length);
    }

    /// Explicit content length, `None` when unknown
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Hint how many seconds the client should wait before retrying
    pub fn set_retry_after(&mut self, seconds: u64) {
        self.set_header("Retry-After", seconds.to_string());
    }

    /// Append to the buffered body. Writes on a suspended response are dropped.
    pub fn write(&mut self, bytes: &[u8]) {
        if !self.suspended {
            self.body.extend_from_slice(bytes);
        }
    }

    pub fn write_str(&mut self, text: &str) {
        self.write(text.as_bytes());
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    /// Discard buffered output
    pub fn reset_buffer(&mut self) -> Result<()> {
        if self.committed {
            return Err(Error::ResponseCommitted);
        }
        self.body.clear();
        Ok(())
    }

    /// Replace the response with an error page.
    ///
    /// Fails with [`Error::ResponseCommitted`] once output has started.
    pub fn send_error(&mut self, status: u16, message: &str) -> Result<()> {
        if self.committed {
            return Err(Error::ResponseCommitted);
        }
        self.status = status;
        self.error = true;
        self.body.clear();
        self.content_length = None;
        self.set_content_type("text/plain; charset=utf-8");
        self.body.extend_from_slice(message.as_bytes());
        Ok(())
    }

    /// Whether `send_error` has been called
    pub fn is_error(&self) -> bool {
        self.error
    }

    /// Mark the response as started; status and headers can no longer change on the wire
    pub fn commit(&mut self) {
        self.committed = true;
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Stop accepting output (mid-failure state)
    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Whether the transport can frame this response with chunked encoding
    pub fn set_chunking_allowed(&mut self, allowed: bool) {
        self.chunking_allowed = allowed;
    }

    pub fn is_chunking_allowed(&self) -> bool {
        self.chunking_allowed
    }

    /// Mark the connection to be closed after this response
    pub fn set_closing(&mut self, closing: bool) {
        self.closing = closing;
    }

    /// True when the connection will close after this response
    pub fn is_closing(&self) -> bool {
        self.closing
            || self
                .header("Connection")
                .is_some_and(|v| v.eq_ignore_ascii_case("close"))
    }

    /// Serialize the status line and headers, terminated by an empty line
    pub fn head_bytes(&self, protocol: &str) -> Vec<u8> {
        let mut head = Vec::with_capacity(128 + self.headers.len() * 32);
        head.extend_from_slice(protocol.as_bytes());
        head.push(b' ');
        head.extend_from_slice(self.status.to_string().as_bytes());
        head.push(b' ');
        head.extend_from_slice(HttpStatus::reason_for(self.status).as_bytes());
        head.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        if let Some(length) = self.content_length {
            head.extend_from_slice(b"Content-Length: ");
            head.extend_from_slice(length.to_string().as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");
        head
    }
}
