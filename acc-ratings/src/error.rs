//! Error types for the rating engine.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during engine operations.
///
/// Per-cell submission failures are deliberately absent: a batch reports them
/// as data in [`BatchOutcome`](crate::batch::BatchOutcome) instead.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A bulk resolve call failed; the whole matrix must be retried.
    #[error("assessment resolution failed: {0}")]
    Resolution(String),

    /// No usable credentials; the caller must log in again.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The server rejected the presented access token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A time range with its start after its end.
    #[error("invalid time range: start {start} is after end {end}")]
    InvalidRange { start: String, end: String },

    /// Caller supplied an unusable argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The remote API answered with a non-success status.
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Request could not be sent or its body could not be read.
    #[error("request failed: {0}")]
    Request(String),

    /// A remote call did not finish within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Failed to access the system keyring.
    #[error("keyring error: {0}")]
    Keyring(String),

    /// Configuration could not be loaded or applied.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(String),
}

impl Error {
    /// Whether this error means the credential is no longer usable.
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::NotAuthenticated | Error::Unauthorized(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formats_correctly() {
        let err = Error::Resolution("connection reset".to_string());
        assert_eq!(err.to_string(), "assessment resolution failed: connection reset");

        let err = Error::Api {
            status: 404,
            message: "Capability Assessment not found".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "API error (status 404): Capability Assessment not found"
        );
    }

    #[test]
    fn error_from_serde_json() {
        let json_err: serde_json::Error = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn auth_errors_are_classified() {
        assert!(Error::NotAuthenticated.is_auth());
        assert!(Error::Unauthorized("expired".into()).is_auth());
        assert!(!Error::Request("reset".into()).is_auth());
    }
}
