//! Push client error types.
//!
//! Errors are split along the recovery boundaries the session cares about:
//!
//! - **Transport errors** (`Connection`, `TruncatedStream`, `Io`) indicate a
//!   dead or dying link and are recoverable through a reset, up to the
//!   configured sequential-error threshold.
//! - **Protocol errors** (`UnsupportedVersion`, `InvalidLength`, `UnknownTag`,
//!   `Json`) indicate a schema mismatch with the server and terminate the
//!   client rather than retrying.
//!
//! The `Decrypt` variant preserves the full error chain via `#[source]` so
//! callers can inspect the underlying key or parameter failure.

use thiserror::Error;

use crate::crypto::DecryptError;

/// Push client errors.
#[derive(Error, Debug)]
pub enum PushError {
    /// Socket or TLS level failure while connecting or talking to the server.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The stream ended in the middle of a frame.
    #[error("Truncated stream while reading {0}")]
    TruncatedStream(String),

    /// The server spoke a protocol version this client does not understand.
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// A frame declared a payload length outside the accepted range.
    #[error("Invalid payload length {0}")]
    InvalidLength(u64),

    /// A frame carried a tag byte with no registered schema.
    #[error("Unknown message tag {0}")]
    UnknownTag(u8),

    /// Payload decryption failed.
    ///
    /// The full chain is preserved via `#[source]` so the specific key or
    /// parameter problem stays inspectable.
    #[error("Decryption error: {0}")]
    Decrypt(#[source] DecryptError),

    /// The check-in/registration collaborator reported a failure.
    #[error("Registration error: {0}")]
    Registration(String),

    /// An operation was attempted in a run state that does not allow it.
    #[error("Invalid client state: {0}")]
    InvalidState(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for push client operations
pub type Result<T> = std::result::Result<T, PushError>;

impl PushError {
    /// Whether this error indicates a broken link rather than a protocol
    /// violation. Transport errors are recoverable through a reset; everything
    /// else terminates the client.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PushError::Connection(_) | PushError::TruncatedStream(_) | PushError::Io(_)
        )
    }
}

impl From<DecryptError> for PushError {
    fn from(err: DecryptError) -> Self {
        PushError::Decrypt(err)
    }
}

impl From<toml::de::Error> for PushError {
    fn from(err: toml::de::Error) -> Self {
        PushError::Config(err.to_string())
    }
}
