// Error types for the Sluice container core

use crate::HttpStatus;
use thiserror::Error;

/// Result type for container operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A valve asked the pipeline to continue past its last stage.
    #[error("No further valves configured in this pipeline")]
    NoFurtherValves,

    /// `close()` was called on a suspended output stream.
    #[error("Output stream is suspended")]
    StreamSuspended,

    /// The response has already been committed to the client.
    #[error("Response already committed")]
    ResponseCommitted,

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Payload Too Large: {0}")]
    PayloadTooLarge(String),

    #[error("URI Too Long: {0}")]
    UriTooLong(String),

    #[error("Request Header Fields Too Large: {0}")]
    HeaderFieldsTooLarge(String),

    #[error("Service Unavailable: {message}")]
    ServiceUnavailable {
        message: String,
        /// Seconds the client should wait before retrying
        retry_after: Option<u64>,
    },

    #[error("Unsupported callback: {0}")]
    UnsupportedCallback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::BadRequest(_) => HttpStatus::BadRequest.code(),
            Error::NotFound(_) => HttpStatus::NotFound.code(),
            Error::PayloadTooLarge(_) => HttpStatus::PayloadTooLarge.code(),
            Error::UriTooLong(_) => HttpStatus::UriTooLong.code(),
            Error::HeaderFieldsTooLarge(_) => HttpStatus::RequestHeaderFieldsTooLarge.code(),
            Error::ServiceUnavailable { .. } => HttpStatus::ServiceUnavailable.code(),

            // Default to 500 for everything else
            _ => HttpStatus::InternalServerError.code(),
        }
    }

    /// Get the HttpStatus enum for this error
    pub fn http_status(&self) -> HttpStatus {
        HttpStatus::from_code(self.status_code()).unwrap_or(HttpStatus::InternalServerError)
    }

    /// Retry-After hint carried by unavailability errors
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Error::ServiceUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.http_status().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.http_status().is_server_error()
    }
}
