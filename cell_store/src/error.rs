//! Error types for shared store and command channel operations

use thiserror::Error;

/// Errors that can occur during store or command channel operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// A producer tried to issue while a record is still outstanding
    #[error("Command channel busy: {key} holds record #{id}")]
    ChannelBusy {
        /// Channel key
        key: String,
        /// Correlation id of the record occupying the key (0 if unreadable)
        id: u64,
    },

    /// The record at the key is not the one the caller expected
    #[error("Stale command on {key}: expected #{expected}, found {found:?}")]
    StaleRecord {
        /// Channel key
        key: String,
        /// Correlation id the caller holds
        expected: u64,
        /// Correlation id currently stored, `None` when the key is empty
        found: Option<u64>,
    },

    /// The consumer already reported completion for this record
    #[error("Command #{id} on {key} already completed")]
    AlreadyCompleted {
        /// Channel key
        key: String,
        /// Correlation id
        id: u64,
    },

    /// The value at a channel key does not decode as a command record
    #[error("Malformed command record at {key}: {reason}")]
    MalformedRecord {
        /// Channel key
        key: String,
        /// Decoder message
        reason: String,
    },

    /// A parameter name collides with a record field
    #[error("Parameter name '{name}' is reserved by the command record")]
    ReservedParam {
        /// Offending parameter name
        name: String,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {source}")]
    Json {
        /// Source JSON error
        #[from]
        source: serde_json::Error,
    },
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
