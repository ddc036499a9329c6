//! Error types for the fixture handoff protocol.

use snafu::Snafu;

/// Errors from the fixture store.
///
/// Timeout and cancellation are distinct variants so callers can tell
/// "waited the full ceiling" apart from "was told to stop".
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum HandoffError {
    /// The store location refused the write.
    #[snafu(display("store write refused at '{path}': {reason}"))]
    StoreWrite {
        /// The store path.
        path: String,
        /// Why the write was refused.
        reason: String,
    },

    /// A bounded wait elapsed without the store changing state.
    #[snafu(display("{operation} timed out after {timeout_ms}ms"))]
    StoreTimeout {
        /// Description of the wait.
        operation: String,
        /// The ceiling that elapsed.
        timeout_ms: u64,
    },

    /// The surrounding run was cancelled while waiting.
    #[snafu(display("{operation} cancelled"))]
    Cancelled {
        /// Description of the wait.
        operation: String,
    },

    /// The store exists but its content does not parse as a record.
    #[snafu(display("corrupted record at '{path}': {reason}"))]
    Corrupted {
        /// The store path.
        path: String,
        /// Description of what went wrong.
        reason: String,
    },

    /// JSON serialization/deserialization error.
    #[snafu(display("record serialization error: {source}"))]
    Serialization {
        /// The underlying error.
        source: serde_json::Error,
    },

    /// Filesystem error against the store location.
    #[snafu(display("store i/o error at '{path}': {source}"))]
    Io {
        /// The store path.
        path: String,
        /// The underlying error.
        source: std::io::Error,
    },
}

impl From<serde_json::Error> for HandoffError {
    fn from(source: serde_json::Error) -> Self {
        HandoffError::Serialization { source }
    }
}

impl HandoffError {
    /// True when the error is a timeout rather than cancellation or failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HandoffError::StoreTimeout { .. })
    }

    /// True when the wait was cancelled by the surrounding run.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HandoffError::Cancelled { .. })
    }
}
