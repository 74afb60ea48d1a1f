//! Hardware collaborator traits and error types.
//!
//! This module defines:
//! - `HalError` enum - Error types for hardware operations
//! - `RobotController` - integer-variable RPC to the robot controller
//! - `DigitalIo` - fixed-width DI/DO rack
//! - `ThicknessGauge`, `QrReader` - station instruments
//! - `TesterLink` - byte transport to the external tester
//! - `ZonePredictor` - optional position-to-zone resolver
//!
//! Every call is bounded by the collaborator's own timeout. Callers treat an
//! `Err` as one communication failure and count consecutive failures
//! against the configured threshold.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

use crate::tester::ProtocolError;

/// Error types for hardware operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HalError {
    /// Backend construction failed
    #[error("Initialization failed: {0}")]
    InitFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Hardware communication error
    #[error("Hardware communication error: {0}")]
    CommunicationError(String),

    /// Operation attempted before `connect()` succeeded
    #[error("{0} not connected")]
    NotConnected(&'static str),

    /// Bounded call did not answer in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Index outside the I/O rack
    #[error("I/O index {index} out of range (width {width})")]
    IndexOutOfRange {
        /// Requested index
        index: usize,
        /// Rack width
        width: usize,
    },

    /// Backend not registered
    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    /// Tester wire protocol violation
    #[error("Tester protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl HalError {
    /// Whether the error reflects a broken link rather than bad data.
    pub fn is_comm(&self) -> bool {
        matches!(
            self,
            Self::CommunicationError(_) | Self::NotConnected(_) | Self::Timeout(_)
        )
    }
}

/// Result alias for hardware calls.
pub type HalResult<T> = Result<T, HalError>;

// ─── Robot ──────────────────────────────────────────────────────────

/// Integer variables exposed by the robot controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntVar {
    /// Motion request written by the cell.
    Cmd,
    /// `CMD + ACK_OFFSET` once the controller accepts the request.
    Ack,
    /// `CMD + DONE_OFFSET` once the motion finished.
    Done,
    /// Last motion id the controller finished.
    LastPosition,
}

/// Controller status word.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RobotStatus {
    /// Servo power on.
    pub servo_on: bool,
    /// Collision detected.
    pub collision: bool,
    /// Active alarm code, if any.
    pub alarm: Option<i32>,
    /// Joint positions [deg].
    pub joints: [f64; 6],
}

/// Robot controller RPC.
pub trait RobotController: Send {
    /// Open the RPC session.
    fn connect(&mut self) -> HalResult<()>;

    /// Close the RPC session.
    fn disconnect(&mut self);

    /// Read one integer variable.
    fn read_var(&mut self, var: IntVar) -> HalResult<i64>;

    /// Write one integer variable.
    fn write_var(&mut self, var: IntVar, value: i64) -> HalResult<()>;

    /// Read the status word.
    fn status(&mut self) -> HalResult<RobotStatus>;

    /// Switch servo power.
    fn set_servo(&mut self, on: bool) -> HalResult<()>;

    /// Clear latched controller alarms.
    fn reset_alarm(&mut self) -> HalResult<()> {
        Ok(())
    }
}

/// Resolves a robot pose to the nearest known motion id.
///
/// Consulted when the controller's last-position variable does not name a
/// known motion id.
pub trait ZonePredictor: Send {
    /// Predicted motion id, or `None` when the pose is not in any zone.
    fn predict(&mut self, status: &RobotStatus) -> Option<i64>;
}

// ─── Digital I/O ────────────────────────────────────────────────────

/// Fixed-width digital I/O rack.
pub trait DigitalIo: Send {
    /// Open the fieldbus session.
    fn connect(&mut self) -> HalResult<()>;

    /// Number of inputs.
    fn di_count(&self) -> usize;

    /// Number of outputs.
    fn do_count(&self) -> usize;

    /// Pull a fresh input image and push the output image.
    fn refresh(&mut self) -> HalResult<()>;

    /// Input value from the last refresh.
    fn get_di(&self, index: usize) -> HalResult<bool>;

    /// Output value as last written.
    fn get_do(&self, index: usize) -> HalResult<bool>;

    /// Write one output (applied on the next refresh).
    fn set_do(&mut self, index: usize, value: bool) -> HalResult<()>;
}

/// I/O rack shared by the I/O poller, the lamp controller and the Device FSM.
pub type SharedIo = Arc<Mutex<Box<dyn DigitalIo>>>;

/// Wrap an I/O backend for sharing.
pub fn share_io(io: Box<dyn DigitalIo>) -> SharedIo {
    Arc::new(Mutex::new(io))
}

// ─── Instruments ────────────────────────────────────────────────────

/// Serial thickness gauge.
pub trait ThicknessGauge: Send {
    /// Open the serial session.
    fn connect(&mut self) -> HalResult<()>;

    /// One measurement [mm].
    fn measure(&mut self) -> HalResult<f64>;
}

/// QR reader.
pub trait QrReader: Send {
    /// Open the reader socket.
    fn connect(&mut self) -> HalResult<()>;

    /// Trigger and read one code.
    fn read_code(&mut self) -> HalResult<String>;
}

/// Byte transport to the external tester.
///
/// Framing lives in [`crate::tester::TesterClient`]; a link only moves bytes.
pub trait TesterLink: Send {
    /// Open the connection.
    fn connect(&mut self) -> HalResult<()>;

    /// Send bytes.
    fn write(&mut self, bytes: &[u8]) -> HalResult<()>;

    /// Bytes received since the last call, without blocking.
    fn read_available(&mut self) -> HalResult<Vec<u8>>;
}
