//! # Cell HAL Library
//!
//! Hardware collaborators of the test cell and the threads that poll them.
//!
//! # Module Structure
//!
//! - [`driver`] - Collaborator traits (`RobotController`, `DigitalIo`, ...) and `HalError`
//! - [`tester`] - External tester wire codec and message client
//! - [`poller`] - I/O mirror, tower lamp and communication status threads
//! - [`driver_registry`] - Backend factory registration and the `CellHardware` bundle
//! - [`drivers`] - Backend implementations (simulation)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            cell_hal                              │
//! │  ┌──────────────┐    ┌──────────────┐    ┌────────────────────┐  │
//! │  │ SharedStore  │◄───│   Pollers    │◄──►│  BackendRegistry   │  │
//! │  │ (cell_store) │    │ io/lamp/comm │    │  name → factory    │  │
//! │  └──────────────┘    └──────┬───────┘    └─────────┬──────────┘  │
//! │                             │                      ▼             │
//! │                             │            ┌────────────────────┐  │
//! │                             └───────────►│   CellHardware     │  │
//! │                                          │  (trait objects)   │  │
//! │                                          └────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod driver;
pub mod driver_registry;
pub mod drivers;
pub mod poller;
pub mod tester;

// Re-export key types for convenience
pub use crate::driver::{
    DigitalIo, HalError, HalResult, IntVar, QrReader, RobotController, RobotStatus, SharedIo,
    TesterLink, ThicknessGauge, ZonePredictor, share_io,
};
pub use crate::driver_registry::{BackendFactory, BackendRegistry, CellHardware};
pub use crate::poller::{
    CommStatusAggregator, IoPoller, LampController, LampPattern, Poller, PollerHandle,
    spawn_poller,
};
pub use crate::tester::{
    FrameDecoder, ProtocolError, TesterClient, TesterMessage, create_message, parse_message,
};
