//! Error types for the FSM engine and the cell machines.

use cell_hal::HalError;
use cell_store::StoreError;
use thiserror::Error;

/// Errors raised by strategies, contexts and the engine itself.
///
/// Inside a running machine every one of these is folded into the
/// machine's fault event; they only surface to callers at construction
/// and thread-management time.
#[derive(Error, Debug)]
pub enum FsmError {
    /// The same (state, event) pair was given two targets.
    #[error("Duplicate transition rule ({state}, {event})")]
    DuplicateRule {
        /// Source state name
        state: &'static str,
        /// Event name
        event: &'static str,
    },

    /// A state has no strategy bound to it.
    #[error("No strategy bound to state {0}")]
    MissingStrategy(&'static str),

    /// Hardware collaborator failure.
    #[error("Hardware error: {0}")]
    Hal(#[from] HalError),

    /// Shared store or command channel failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A command record carried unusable parameters.
    #[error("Invalid parameters for {process}: {reason}")]
    InvalidParams {
        /// Requested process
        process: String,
        /// What was wrong
        reason: String,
    },

    /// A strategy panicked.
    #[error("Strategy panicked: {0}")]
    Panic(String),

    /// An FSM thread could not be spawned or joined.
    #[error("Thread error in {fsm}: {reason}")]
    Thread {
        /// FSM name
        fsm: &'static str,
        /// OS or join error
        reason: String,
    },
}

impl FsmError {
    /// Shorthand for [`FsmError::InvalidParams`].
    pub fn invalid(process: &str, reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            process: process.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for FSM operations.
pub type FsmResult<T> = Result<T, FsmError>;
