//! # Cell Shared Store
//!
//! The process-wide key/value map that FSM threads and hardware pollers
//! share, plus the command channel convention built on top of it.
//!
//! ## Module Structure
//!
//! - [`store`]: [`SharedStore`] with per-key locking and change notification
//! - [`command`]: producer/consumer halves of the command channel
//! - [`error`]: [`StoreError`] taxonomy
//!
//! ## Usage
//!
//! ```rust
//! use cell_store::{CommandConsumer, CommandProducer, Params, SharedStore};
//!
//! # fn main() -> Result<(), cell_store::StoreError> {
//! let store = SharedStore::new();
//! let mut logic = CommandProducer::new(store.clone(), "command/robot");
//! let robot = CommandConsumer::new(store.clone(), "command/robot");
//!
//! let id = logic.issue("MOVE_TO_HOME", Params::new())?;
//! if let Some(record) = robot.pending()? {
//!     robot.complete(record.id, None)?;
//! }
//! let done = logic.poll_completion()?.expect("finished above");
//! assert_eq!(done.id, id);
//! assert!(done.is_success());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod command;
pub mod error;
pub mod store;

pub use command::{
    CommandConsumer, CommandProducer, CommandRecord, CommandState, Completion, Params,
    RESERVED_FIELDS,
};
pub use error::{StoreError, StoreResult};
pub use store::SharedStore;

/// Convenient re-exports.
pub mod prelude {
    pub use crate::command::{
        CommandConsumer, CommandProducer, CommandRecord, CommandState, Completion, Params,
    };
    pub use crate::error::{StoreError, StoreResult};
    pub use crate::store::SharedStore;
    pub use serde_json::{Value, json};
}
