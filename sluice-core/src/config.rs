// Server configuration

use crate::{Error, Result};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable prefix for [`ServerConfig::from_env`]
pub const ENV_PREFIX: &str = "SLUICE_";

/// Connector and buffer settings.
///
/// Loadable from TOML (every field optional) or from `SLUICE_*` environment
/// variables, e.g. `SLUICE_BIND_ADDR`, `SLUICE_KEEP_ALIVE_TIMEOUT_SECS`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the connector listens on
    pub bind_addr: String,
    /// Idle time allowed between requests on a kept-alive connection
    pub keep_alive_timeout_secs: u64,
    /// Requests served on one connection before it is closed
    pub max_requests_per_connection: u32,
    /// Longest accepted request line, in bytes
    pub max_request_line: usize,
    /// Largest accepted header block, in bytes
    pub max_header_bytes: usize,
    /// Largest accepted request body, in bytes
    pub max_body_bytes: usize,
    /// Bodies up to this size are sent with Content-Length instead of chunked
    pub output_buffer_size: usize,
    /// Pooled request line buffers
    pub line_buffer_pool: usize,
    /// Pooled body buffers
    pub body_buffer_pool: usize,
    /// Whether HTTP/1.1 responses may use chunked encoding
    pub chunking: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            keep_alive_timeout_secs: 60,
            max_requests_per_connection: 100,
            max_request_line: 8192,
            max_header_bytes: 16 * 1024,
            max_body_bytes: 1024 * 1024,
            output_buffer_size: 8192,
            line_buffer_pool: 64,
            body_buffer_pool: 64,
            chunking: true,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings for tests: ephemeral port, short keep-alive.
    pub fn testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            keep_alive_timeout_secs: 2,
            ..Self::default()
        }
    }

    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout_secs = timeout.as_secs();
        self
    }

    pub fn max_requests_per_connection(mut self, max: u32) -> Self {
        self.max_requests_per_connection = max;
        self
    }

    pub fn max_request_line(mut self, bytes: usize) -> Self {
        self.max_request_line = bytes;
        self
    }

    pub fn max_header_bytes(mut self, bytes: usize) -> Self {
        self.max_header_bytes = bytes;
        self
    }

    pub fn max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    pub fn output_buffer_size(mut self, bytes: usize) -> Self {
        self.output_buffer_size = bytes;
        self
    }

    pub fn line_buffer_pool(mut self, capacity: usize) -> Self {
        self.line_buffer_pool = capacity;
        self
    }

    pub fn body_buffer_pool(mut self, capacity: usize) -> Self {
        self.body_buffer_pool = capacity;
        self
    }

    pub fn chunking(mut self, enabled: bool) -> Self {
        self.chunking = enabled;
        self
    }

    /// Keep-alive timeout as a `Duration`
    pub fn keep_alive_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_secs)
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("TOML parse error: {}", e)))
    }

    /// Load from a TOML file
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Defaults overridden by `SLUICE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Defaults overridden by `SLUICE_*` entries of `vars`.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref();
            match name {
                "BIND_ADDR" => config.bind_addr = value.to_string(),
                "KEEP_ALIVE_TIMEOUT_SECS" => config.keep_alive_timeout_secs = parse(name, value)?,
                "MAX_REQUESTS_PER_CONNECTION" => {
                    config.max_requests_per_connection = parse(name, value)?
                }
                "MAX_REQUEST_LINE" => config.max_request_line = parse(name, value)?,
                "MAX_HEADER_BYTES" => config.max_header_bytes = parse(name, value)?,
                "MAX_BODY_BYTES" => config.max_body_bytes = parse(name, value)?,
                "OUTPUT_BUFFER_SIZE" => config.output_buffer_size = parse(name, value)?,
                "LINE_BUFFER_POOL" => config.line_buffer_pool = parse(name, value)?,
                "BODY_BUFFER_POOL" => config.body_buffer_pool = parse(name, value)?,
                "CHUNKING" => config.chunking = parse_flag(name, value)?,
                _ => {}
            }
        }
        Ok(config)
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {}{}: {:?}", ENV_PREFIX, name, value)))
}

/// Accepts `1`/`true`/`yes`/`on` and their negatives.
fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!(
            "invalid flag for {}{}: {:?}",
            ENV_PREFIX, name, value
        ))),
    }
}
