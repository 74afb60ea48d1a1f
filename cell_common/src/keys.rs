//! Well-known Shared Store paths.
//!
//! Keys are hierarchical, `/`-separated strings. Every path that more than
//! one thread reads or writes is named here so producers and consumers can
//! never disagree on spelling.

use crate::io::{DiRole, DoRole};

/// Path segment separator.
pub const SEPARATOR: char = '/';

/// FSM name of the batch sequencer.
pub const LOGIC_FSM: &str = "logic";
/// FSM name of the device coordinator.
pub const DEVICE_FSM: &str = "device";
/// FSM name of the robot coordinator.
pub const ROBOT_FSM: &str = "robot";

/// Command channel: Logic → Robot.
pub const ROBOT_COMMAND: &str = "command/robot";
/// Command channel: Logic → Device.
pub const DEVICE_COMMAND: &str = "command/device";

/// Batch request written by an operator surface, consumed by the Logic FSM.
pub const BATCH_REQUEST: &str = "batch/request";
/// Live sequencer progress (`{step, total, specimen, process}`).
pub const BATCH_PROGRESS: &str = "batch/progress";
/// Final report of the last finished or aborted batch.
pub const BATCH_REPORT: &str = "batch/report";

/// Last motion id the robot completed (null while unknown or in transit).
pub const ROBOT_POSITION: &str = "robot/position";

/// Aggregated communication health (`{subsystem: bool}`).
pub const COMM_STATUS: &str = "comm/status";

/// Subsystems that keep a consecutive-failure counter under `comm/`.
pub const COMM_SUBSYSTEMS: [&str; 5] = ["robot", "io", "gauge", "qr", "tester"];

/// State names published under `fsm/<name>/state` that observers act on.
pub mod state {
    /// Waiting for collaborators.
    pub const CONNECTING: &str = "CONNECTING";
    /// Robot/Device waiting for a command.
    pub const READY: &str = "READY";
    /// Logic waiting for a batch.
    pub const IDLE: &str = "IDLE";
    /// Logic sequencing a batch.
    pub const RUNNING: &str = "RUNNING";
    /// Violation present.
    pub const ERROR: &str = "ERROR";
    /// Reconnecting and re-checking.
    pub const RECOVERING: &str = "RECOVERING";
    /// Emergency stop active.
    pub const STOP_AND_OFF: &str = "STOP_AND_OFF";
}

/// Raw digital input vector.
pub const DI_RAW: &str = "io/di/raw";
/// Raw digital output vector.
pub const DO_RAW: &str = "io/do/raw";

/// Published state name of an FSM.
pub fn fsm_state(fsm: &str) -> String {
    format!("fsm/{fsm}/state")
}

/// Published violation bitmask of an FSM.
pub fn fsm_violation(fsm: &str) -> String {
    format!("fsm/{fsm}/violation")
}

/// Operator reset flag for an FSM whose recovery budget is exhausted.
pub fn fsm_reset(fsm: &str) -> String {
    format!("cmd/{fsm}/reset")
}

/// Consecutive failure counter of a communication subsystem.
pub fn comm_failures(subsystem: &str) -> String {
    format!("comm/{subsystem}/failures")
}

/// Named digital input.
pub fn di(role: DiRole) -> String {
    format!("io/di/{}", role.name())
}

/// Named digital output.
pub fn do_(role: DoRole) -> String {
    format!("io/do/{}", role.name())
}

/// Join path segments with [`SEPARATOR`].
pub fn join(segments: &[&str]) -> String {
    segments.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fsm_keys_are_namespaced() {
        assert_eq!(fsm_state(ROBOT_FSM), "fsm/robot/state");
        assert_eq!(fsm_violation(LOGIC_FSM), "fsm/logic/violation");
        assert_eq!(fsm_reset(DEVICE_FSM), "cmd/device/reset");
    }

    #[test]
    fn io_keys_use_role_names() {
        assert_eq!(di(DiRole::EmergencyStop), "io/di/emergency_stop");
        assert_eq!(do_(DoRole::LampGreen), "io/do/lamp_green");
    }

    #[test]
    fn command_channels_are_distinct() {
        assert_ne!(ROBOT_COMMAND, DEVICE_COMMAND);
        assert_eq!(join(&["comm", "gauge", "failures"]), comm_failures("gauge"));
    }
}
