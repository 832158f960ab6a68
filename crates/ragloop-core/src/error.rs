//! Error taxonomy shared by every core component.
//!
//! Degenerate inputs (zero-norm vectors, empty chunk lists, an empty cache)
//! are not errors anywhere in this crate: they resolve to defined zero or
//! empty results.

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid model / backend configuration. Fatal at startup.
    #[error("Configuration error: {message}")]
    Configuration { message: String },
    /// A resource required by the current operation does not exist.
    #[error("Not found: {message}")]
    NotFound { message: String },
    /// Dimension mismatches and invalid policy parameters.
    #[error("Validation error: {message}")]
    Validation { message: String },
    /// Blob store I/O or (de)serialization failure. Never swallowed.
    #[error("Persistence error: {message}")]
    Persistence { message: String },
    /// Failure reported by an external embedding or generation service.
    #[error("Provider error: {message}")]
    Provider { message: String },
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence { message: message.into() }
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider { message: message.into() }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence { message: err.to_string() }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence { message: err.to_string() }
    }
}
