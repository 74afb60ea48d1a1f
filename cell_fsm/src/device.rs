//! Device FSM.
//!
//! Consumes `command/device` and drives the station instruments: the
//! thickness gauge, the QR reader, the tester link and the non-indicator
//! digital outputs. Each command runs in its own work state and returns to
//! READY with DONE.
//!
//! ```text
//!                ┌──MEASURE──► MEASURING ──┐
//!                ├──SCAN─────► SCANNING ───┤
//! READY ─────────┼──TEST─────► TESTING ────┼──DONE──► READY
//!                └──SWITCH───► SWITCHING ──┘
//! ```

pub mod context;
pub mod job;
pub mod strategies;

use cell_common::keys::{DEVICE_FSM, state};

use crate::engine::{Fsm, Machine, Strategy};
use crate::error::FsmResult;
use crate::lifecycle::{
    ConnectingStrategy, ErrorStrategy, LifecycleEvent, LifecycleStates, RecoveringStrategy,
    StopAndOffStrategy, add_lifecycle_rules,
};
use crate::rules::{EventId, RuleTable, StateId};

pub use context::{DeviceContext, Instruments};
pub use job::{DeviceAction, DeviceJob};

/// System-level state ids.
pub const SYSTEM_STATES: std::ops::Range<u16> = 0x0000..0x0100;
/// Work state ids.
pub const WORK_STATES: std::ops::Range<u16> = 0x0100..0x0200;

/// Device FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DeviceState {
    /// Opening instrument sessions.
    Connecting = 0x0001,
    /// Waiting for a command.
    Ready = 0x0002,
    /// Violation present.
    Error = 0x0003,
    /// Reconnecting and re-checking.
    Recovering = 0x0004,
    /// Emergency stop.
    StopAndOff = 0x0005,
    /// Gauge reading.
    Measuring = 0x0101,
    /// QR read.
    Scanning = 0x0102,
    /// Tester exchange.
    Testing = 0x0103,
    /// Output write.
    Switching = 0x0104,
}

impl DeviceState {
    /// Numeric id.
    #[inline]
    pub const fn id(self) -> u16 {
        self as u16
    }

    /// Whether a command is being executed.
    pub fn is_work(self) -> bool {
        WORK_STATES.contains(&self.id())
    }
}

impl StateId for DeviceState {
    const ALL: &'static [Self] = &[
        Self::Connecting,
        Self::Ready,
        Self::Error,
        Self::Recovering,
        Self::StopAndOff,
        Self::Measuring,
        Self::Scanning,
        Self::Testing,
        Self::Switching,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Connecting => state::CONNECTING,
            Self::Ready => state::READY,
            Self::Error => state::ERROR,
            Self::Recovering => state::RECOVERING,
            Self::StopAndOff => state::STOP_AND_OFF,
            Self::Measuring => "MEASURING",
            Self::Scanning => "SCANNING",
            Self::Testing => "TESTING",
            Self::Switching => "SWITCHING",
        }
    }
}

/// Device FSM events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEvent {
    /// No transition.
    None,
    /// Instruments reachable.
    Connected,
    /// Command finished, recovery succeeded or e-stop released.
    Done,
    /// Start recovery.
    Recover,
    /// Violation bitmask non-zero.
    ViolationDetect,
    /// Emergency stop.
    StopEmg,
    /// Gauge command accepted.
    Measure,
    /// QR command accepted.
    Scan,
    /// Tester command accepted.
    Test,
    /// Output command accepted.
    Switch,
}

impl EventId for DeviceEvent {
    const NONE: Self = Self::None;

    fn name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Connected => "CONNECTED",
            Self::Done => "DONE",
            Self::Recover => "RECOVER",
            Self::ViolationDetect => "VIOLATION_DETECT",
            Self::StopEmg => "STOP_EMG",
            Self::Measure => "MEASURE",
            Self::Scan => "SCAN",
            Self::Test => "TEST",
            Self::Switch => "SWITCH",
        }
    }
}

impl LifecycleEvent for DeviceEvent {
    const CONNECTED: Self = Self::Connected;
    const DONE: Self = Self::Done;
    const RECOVER: Self = Self::Recover;
    const VIOLATION_DETECT: Self = Self::ViolationDetect;
    const STOP_EMG: Self = Self::StopEmg;
}

/// Device machine definition.
#[derive(Debug)]
pub struct DeviceFsm;

impl Machine for DeviceFsm {
    type State = DeviceState;
    type Event = DeviceEvent;
    type Context = DeviceContext;

    const NAME: &'static str = DEVICE_FSM;
    const ERROR_STATE: DeviceState = DeviceState::Error;
    const FAULT_EVENT: DeviceEvent = DeviceEvent::ViolationDetect;

    fn rules(table: &mut RuleTable<DeviceState, DeviceEvent>) -> FsmResult<()> {
        add_lifecycle_rules(
            table,
            LifecycleStates {
                connecting: DeviceState::Connecting,
                ready: DeviceState::Ready,
                error: DeviceState::Error,
                recovering: DeviceState::Recovering,
                stop_and_off: DeviceState::StopAndOff,
            },
        )?;
        for (event, work) in [
            (DeviceEvent::Measure, DeviceState::Measuring),
            (DeviceEvent::Scan, DeviceState::Scanning),
            (DeviceEvent::Test, DeviceState::Testing),
            (DeviceEvent::Switch, DeviceState::Switching),
        ] {
            table.add(DeviceState::Ready, event, work)?;
            table.add(work, DeviceEvent::Done, DeviceState::Ready)?;
        }
        Ok(())
    }

    fn strategy(state: DeviceState) -> Box<dyn Strategy<Self>> {
        match state {
            DeviceState::Connecting => Box::new(ConnectingStrategy::default()),
            DeviceState::Ready => Box::new(strategies::ReadyStrategy::default()),
            DeviceState::Measuring => Box::new(strategies::MeasuringStrategy),
            DeviceState::Scanning => Box::new(strategies::ScanningStrategy),
            DeviceState::Testing => Box::new(strategies::TestingStrategy::default()),
            DeviceState::Switching => Box::new(strategies::SwitchingStrategy),
            DeviceState::Error => Box::new(ErrorStrategy::default()),
            DeviceState::Recovering => Box::new(RecoveringStrategy::default()),
            DeviceState::StopAndOff => Box::new(StopAndOffStrategy),
        }
    }
}

/// Device FSM starting in CONNECTING.
///
/// # Errors
/// Rule table construction failures.
pub fn device_fsm(ctx: DeviceContext) -> FsmResult<Fsm<DeviceFsm>> {
    Fsm::new(DeviceState::Connecting, ctx)
}
