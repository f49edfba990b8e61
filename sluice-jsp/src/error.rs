// Error types for the page runtime

use thiserror::Error;

/// Result type for page runtime operations.
pub type JspResult<T> = std::result::Result<T, JspError>;

#[derive(Error, Debug)]
pub enum JspError {
    /// Fatal to the current request only; the next request compiles again.
    #[error("Unable to compile {uri}: {message}")]
    Compile { uri: String, message: String },

    /// The page asked to be taken out of service for a while.
    ///
    /// `seconds <= 0` means "use the configured default".
    #[error("Page unavailable: {message}")]
    Unavailable { message: String, seconds: i64 },

    /// The page source no longer exists.
    #[error("Page source not found: {0}")]
    SourceNotFound(String),

    #[error("Invalid jsp_precompile parameter: {0}")]
    InvalidPrecompile(String),

    /// Failure raised by page logic.
    #[error("Page error: {0}")]
    Page(String),

    #[error(transparent)]
    Core(#[from] sluice_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JspError {
    pub fn compile(uri: impl Into<String>, message: impl Into<String>) -> Self {
        JspError::Compile {
            uri: uri.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>, seconds: i64) -> Self {
        JspError::Unavailable {
            message: message.into(),
            seconds,
        }
    }
}

impl From<JspError> for sluice_core::Error {
    fn from(err: JspError) -> Self {
        match err {
            JspError::Unavailable { message, seconds } => sluice_core::Error::ServiceUnavailable {
                message,
                retry_after: u64::try_from(seconds).ok().filter(|s| *s > 0),
            },
            JspError::SourceNotFound(uri) => sluice_core::Error::NotFound(uri),
            JspError::Core(e) => e,
            JspError::Io(e) => sluice_core::Error::Io(e),
            other => sluice_core::Error::Internal(other.to_string()),
        }
    }
}
