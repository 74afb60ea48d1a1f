//! # Test Cell FSM Library
//!
//! State machines that run the test cell. Three machines (Logic, Device,
//! Robot) each own one thread and never call each other: the Logic FSM
//! writes command records into the Shared Store and the Device and Robot
//! FSMs serve them.
//!
//! ## Module Structure
//!
//! - `engine` - generic state/event/strategy runtime with fault isolation
//! - `rules` - state and event traits, transition table
//! - `context` - state shared by every strategy of one machine
//! - `lifecycle` - CONNECTING / ERROR / RECOVERING / STOP_AND_OFF strategies
//! - `violation` - communication failure counters
//! - `motion` - motion id catalogue and the safety validator
//! - `handshake` - CMD/ACK/DONE exchange with the robot controller
//! - `process` - process names of the command channels
//! - `robot`, `device`, `logic` - the three concrete machines
//! - `cell` - wiring and threads
//!
//! ## Violations
//!
//! Every machine recomputes a [`Violation`](cell_common::violation::Violation)
//! bitmask from its sensed inputs once per tick. A non-zero mask moves the
//! machine to ERROR, which hands over to RECOVERING; an emergency stop moves
//! it to STOP_AND_OFF from anywhere.

#![warn(missing_docs)]

pub mod cell;
pub mod context;
pub mod device;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod lifecycle;
pub mod logic;
pub mod motion;
pub mod process;
pub mod robot;
pub mod rules;
pub mod violation;

pub use cell::{Cell, CellHandle};
pub use engine::{Fsm, FsmHandle, Machine, Strategy, TickOutcome};
pub use error::{FsmError, FsmResult};
pub use motion::{MotionCatalogue, MotionSafety, Position};
