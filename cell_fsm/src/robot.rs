//! Robot FSM.
//!
//! Consumes `command/robot`, expands each process into a motion plan and
//! dispatches the plan one validated motion at a time over the
//! CMD/ACK/DONE handshake.
//!
//! ```text
//! CONNECTING ──CONNECTED──► READY ──MOVE──► MOVING
//!                             ▲               │
//!                             └─────DONE──────┘
//! ```
//!
//! plus the lifecycle transitions of [`crate::lifecycle`].

pub mod context;
pub mod plan;
pub mod strategies;

use cell_common::keys::{ROBOT_FSM, state};

use crate::engine::{Fsm, Machine, Strategy};
use crate::error::FsmResult;
use crate::lifecycle::{
    ConnectingStrategy, ErrorStrategy, LifecycleEvent, LifecycleStates, RecoveringStrategy,
    StopAndOffStrategy, add_lifecycle_rules,
};
use crate::rules::{EventId, RuleTable, StateId};

pub use context::RobotContext;
pub use plan::RobotJob;

/// System-level state ids.
pub const SYSTEM_STATES: std::ops::Range<u16> = 0x0000..0x0100;
/// Motion-level state ids.
pub const MOTION_STATES: std::ops::Range<u16> = 0x0100..0x0200;

/// Robot FSM states, grouped by id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RobotState {
    /// Opening the controller session.
    Connecting = 0x0001,
    /// Waiting for a command.
    Ready = 0x0002,
    /// Violation present.
    Error = 0x0003,
    /// Reconnecting and re-checking.
    Recovering = 0x0004,
    /// Emergency stop.
    StopAndOff = 0x0005,
    /// Executing a motion plan.
    Moving = 0x0101,
}

impl RobotState {
    /// Numeric id.
    #[inline]
    pub const fn id(self) -> u16 {
        self as u16
    }

    /// Whether the state belongs to the motion range.
    pub fn is_motion(self) -> bool {
        MOTION_STATES.contains(&self.id())
    }
}

impl StateId for RobotState {
    const ALL: &'static [Self] = &[
        Self::Connecting,
        Self::Ready,
        Self::Error,
        Self::Recovering,
        Self::StopAndOff,
        Self::Moving,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Connecting => state::CONNECTING,
            Self::Ready => state::READY,
            Self::Error => state::ERROR,
            Self::Recovering => state::RECOVERING,
            Self::StopAndOff => state::STOP_AND_OFF,
            Self::Moving => "MOVING",
        }
    }
}

/// Robot FSM events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RobotEvent {
    /// No transition.
    None,
    /// Controller session open and position resolved.
    Connected,
    /// Plan finished, recovery succeeded or e-stop released.
    Done,
    /// Start recovery.
    Recover,
    /// Violation bitmask non-zero.
    ViolationDetect,
    /// Emergency stop.
    StopEmg,
    /// Command accepted, plan ready.
    Move,
}

impl EventId for RobotEvent {
    const NONE: Self = Self::None;

    fn name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Connected => "CONNECTED",
            Self::Done => "DONE",
            Self::Recover => "RECOVER",
            Self::ViolationDetect => "VIOLATION_DETECT",
            Self::StopEmg => "STOP_EMG",
            Self::Move => "MOVE",
        }
    }
}

impl LifecycleEvent for RobotEvent {
    const CONNECTED: Self = Self::Connected;
    const DONE: Self = Self::Done;
    const RECOVER: Self = Self::Recover;
    const VIOLATION_DETECT: Self = Self::ViolationDetect;
    const STOP_EMG: Self = Self::StopEmg;
}

/// Robot machine definition.
#[derive(Debug)]
pub struct RobotFsm;

impl Machine for RobotFsm {
    type State = RobotState;
    type Event = RobotEvent;
    type Context = RobotContext;

    const NAME: &'static str = ROBOT_FSM;
    const ERROR_STATE: RobotState = RobotState::Error;
    const FAULT_EVENT: RobotEvent = RobotEvent::ViolationDetect;

    fn rules(table: &mut RuleTable<RobotState, RobotEvent>) -> FsmResult<()> {
        add_lifecycle_rules(
            table,
            LifecycleStates {
                connecting: RobotState::Connecting,
                ready: RobotState::Ready,
                error: RobotState::Error,
                recovering: RobotState::Recovering,
                stop_and_off: RobotState::StopAndOff,
            },
        )?;
        table.add(RobotState::Ready, RobotEvent::Move, RobotState::Moving)?;
        table.add(RobotState::Moving, RobotEvent::Done, RobotState::Ready)
    }

    fn strategy(state: RobotState) -> Box<dyn Strategy<Self>> {
        match state {
            RobotState::Connecting => Box::new(ConnectingStrategy::default()),
            RobotState::Ready => Box::new(strategies::ReadyStrategy::default()),
            RobotState::Moving => Box::new(strategies::MovingStrategy::default()),
            RobotState::Error => Box::new(ErrorStrategy::default()),
            RobotState::Recovering => Box::new(RecoveringStrategy::default()),
            RobotState::StopAndOff => Box::new(StopAndOffStrategy),
        }
    }
}

/// Robot FSM starting in CONNECTING.
///
/// # Errors
/// Rule table construction failures.
pub fn robot_fsm(ctx: RobotContext) -> FsmResult<Fsm<RobotFsm>> {
    Fsm::new(RobotState::Connecting, ctx)
}
