//! Simulated robot controller.
//!
//! The controller advances one step on every `read_var` call, which makes
//! its timing a function of how often the cell polls rather than of wall
//! clock time:
//!
//! 1. a non-zero `CMD` is accepted after `ack_delay_polls` reads and
//!    `ACK = CMD + ACK_OFFSET` is exposed;
//! 2. once the cell writes `CMD = 0`, `ACK` drops and the motion starts;
//! 3. after `done_delay_polls` further reads `DONE = CMD + DONE_OFFSET` is
//!    exposed and the last-position variable moves to `CMD`;
//! 4. the cell writes `DONE = 0` to re-arm.

use cell_common::consts::{ACK_OFFSET, DONE_OFFSET, HOME_MOTION_ID};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::driver::{HalError, HalResult, IntVar, RobotController, RobotStatus};

/// Simulated controller timing.
#[derive(Debug, Clone, Copy)]
pub struct SimRobotTiming {
    /// Reads between a CMD write and its ACK.
    pub ack_delay_polls: u32,
    /// Reads between motion start and DONE.
    pub done_delay_polls: u32,
}

impl Default for SimRobotTiming {
    fn default() -> Self {
        Self {
            ack_delay_polls: 1,
            done_delay_polls: 2,
        }
    }
}

#[derive(Debug)]
struct RobotSim {
    timing: SimRobotTiming,
    connected: bool,
    cmd: i64,
    ack: i64,
    done: i64,
    last_position: i64,
    ack_countdown: Option<u32>,
    accepted: Option<i64>,
    motion: Option<(i64, u32)>,
    servo_on: bool,
    collision: bool,
    alarm: Option<i32>,
    comm_down: bool,
    ignore_commands: bool,
    ack_skew: i64,
    stall_motion: bool,
    cmd_writes: Vec<i64>,
    completed: Vec<i64>,
}

impl RobotSim {
    fn new(timing: SimRobotTiming) -> Self {
        Self {
            timing,
            connected: false,
            cmd: 0,
            ack: 0,
            done: 0,
            last_position: HOME_MOTION_ID,
            ack_countdown: None,
            accepted: None,
            motion: None,
            servo_on: false,
            collision: false,
            alarm: None,
            comm_down: false,
            ignore_commands: false,
            ack_skew: 0,
            stall_motion: false,
            cmd_writes: Vec::new(),
            completed: Vec::new(),
        }
    }

    fn check_link(&self) -> HalResult<()> {
        if self.comm_down {
            return Err(HalError::CommunicationError("robot RPC timeout".into()));
        }
        if !self.connected {
            return Err(HalError::NotConnected("robot"));
        }
        Ok(())
    }

    fn step(&mut self) {
        // Acceptance of a freshly written CMD.
        if self.cmd != 0 && self.accepted.is_none() && self.servo_on && !self.ignore_commands {
            let left = self.ack_countdown.get_or_insert(self.timing.ack_delay_polls);
            if *left == 0 {
                self.ack = self.cmd + i64::from(ACK_OFFSET) + self.ack_skew;
                self.accepted = Some(self.cmd);
                self.ack_countdown = None;
                trace!(cmd = self.cmd, ack = self.ack, "Sim robot acknowledged");
            } else {
                *left -= 1;
            }
        }

        // CMD cleared after ACK: start moving.
        if let (Some(target), 0, None) = (self.accepted, self.cmd, self.motion) {
            self.ack = 0;
            self.motion = Some((target, self.timing.done_delay_polls));
        }

        if let Some((target, left)) = self.motion.as_mut() {
            if self.stall_motion || self.collision || !self.servo_on {
                return;
            }
            if *left == 0 {
                let target = *target;
                self.done = target + i64::from(DONE_OFFSET);
                self.last_position = target;
                self.motion = None;
                self.accepted = None;
                self.completed.push(target);
                debug!(position = target, "Sim robot reached target");
            } else {
                *left -= 1;
            }
        }
    }
}

/// Shared handle for inspecting and faulting a [`SimRobot`].
#[derive(Debug, Clone)]
pub struct SimRobotHandle(Arc<Mutex<RobotSim>>);

impl SimRobotHandle {
    /// Make every RPC call fail.
    pub fn set_comm_down(&self, down: bool) {
        self.0.lock().comm_down = down;
    }

    /// Never acknowledge new commands.
    pub fn set_ignore_commands(&self, ignore: bool) {
        self.0.lock().ignore_commands = ignore;
    }

    /// Add `skew` to every ACK value (a wrong ACK must not be accepted).
    pub fn set_ack_skew(&self, skew: i64) {
        self.0.lock().ack_skew = skew;
    }

    /// Freeze motions after acceptance (DONE never arrives).
    pub fn set_stall_motion(&self, stall: bool) {
        self.0.lock().stall_motion = stall;
    }

    /// Raise or clear the collision flag.
    pub fn set_collision(&self, collision: bool) {
        self.0.lock().collision = collision;
    }

    /// Raise or clear a controller alarm.
    pub fn set_alarm(&self, alarm: Option<i32>) {
        self.0.lock().alarm = alarm;
    }

    /// Overwrite the last-position variable.
    pub fn set_last_position(&self, position: i64) {
        self.0.lock().last_position = position;
    }

    /// Last-position variable.
    pub fn last_position(&self) -> i64 {
        self.0.lock().last_position
    }

    /// Every non-zero CMD value written, in order.
    pub fn cmd_writes(&self) -> Vec<i64> {
        self.0.lock().cmd_writes.clone()
    }

    /// Every motion id that reached DONE, in order.
    pub fn completed(&self) -> Vec<i64> {
        self.0.lock().completed.clone()
    }

    /// Servo power state.
    pub fn servo_on(&self) -> bool {
        self.0.lock().servo_on
    }
}

/// Simulated robot controller.
#[derive(Debug)]
pub struct SimRobot {
    sim: Arc<Mutex<RobotSim>>,
}

impl SimRobot {
    /// New controller at HOME with servo off.
    pub fn new(timing: SimRobotTiming) -> (Self, SimRobotHandle) {
        let sim = Arc::new(Mutex::new(RobotSim::new(timing)));
        (Self { sim: Arc::clone(&sim) }, SimRobotHandle(sim))
    }
}

impl RobotController for SimRobot {
    fn connect(&mut self) -> HalResult<()> {
        let mut sim = self.sim.lock();
        if sim.comm_down {
            return Err(HalError::CommunicationError("robot controller unreachable".into()));
        }
        sim.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.sim.lock().connected = false;
    }

    fn read_var(&mut self, var: IntVar) -> HalResult<i64> {
        let mut sim = self.sim.lock();
        sim.check_link()?;
        sim.step();
        Ok(match var {
            IntVar::Cmd => sim.cmd,
            IntVar::Ack => sim.ack,
            IntVar::Done => sim.done,
            IntVar::LastPosition => sim.last_position,
        })
    }

    fn write_var(&mut self, var: IntVar, value: i64) -> HalResult<()> {
        let mut sim = self.sim.lock();
        sim.check_link()?;
        match var {
            IntVar::Cmd => {
                if value != 0 {
                    sim.cmd_writes.push(value);
                }
                sim.cmd = value;
            }
            IntVar::Done => sim.done = value,
            IntVar::Ack | IntVar::LastPosition => {
                return Err(HalError::ConfigError(format!("{var:?} is read-only")));
            }
        }
        Ok(())
    }

    fn status(&mut self) -> HalResult<RobotStatus> {
        let sim = self.sim.lock();
        sim.check_link()?;
        Ok(RobotStatus {
            servo_on: sim.servo_on,
            collision: sim.collision,
            alarm: sim.alarm,
            joints: [0.0; 6],
        })
    }

    fn set_servo(&mut self, on: bool) -> HalResult<()> {
        let mut sim = self.sim.lock();
        sim.check_link()?;
        sim.servo_on = on;
        Ok(())
    }

    fn reset_alarm(&mut self) -> HalResult<()> {
        let mut sim = self.sim.lock();
        sim.check_link()?;
        sim.alarm = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> (SimRobot, SimRobotHandle) {
        let (mut robot, handle) = SimRobot::new(SimRobotTiming {
            ack_delay_polls: 0,
            done_delay_polls: 1,
        });
        robot.connect().unwrap();
        robot.set_servo(true).unwrap();
        (robot, handle)
    }

    #[test]
    fn full_motion_cycle() {
        let (mut robot, handle) = connected();
        robot.write_var(IntVar::Cmd, 1020).unwrap();
        assert_eq!(robot.read_var(IntVar::Ack).unwrap(), 1520);

        robot.write_var(IntVar::Cmd, 0).unwrap();
        let mut done = 0;
        for _ in 0..5 {
            done = robot.read_var(IntVar::Done).unwrap();
            if done != 0 {
                break;
            }
        }
        assert_eq!(done, 11020);
        assert_eq!(robot.read_var(IntVar::Ack).unwrap(), 0);
        assert_eq!(handle.last_position(), 1020);

        robot.write_var(IntVar::Done, 0).unwrap();
        assert_eq!(robot.read_var(IntVar::Done).unwrap(), 0);
        assert_eq!(handle.cmd_writes(), vec![1020]);
        assert_eq!(handle.completed(), vec![1020]);
    }

    #[test]
    fn servo_off_blocks_acceptance() {
        let (mut robot, _handle) = connected();
        robot.set_servo(false).unwrap();
        robot.write_var(IntVar::Cmd, 1000).unwrap();
        for _ in 0..3 {
            assert_eq!(robot.read_var(IntVar::Ack).unwrap(), 0);
        }
    }

    #[test]
    fn comm_fault_fails_every_call() {
        let (mut robot, handle) = connected();
        handle.set_comm_down(true);
        assert!(robot.read_var(IntVar::Ack).unwrap_err().is_comm());
        assert!(robot.connect().is_err());
        handle.set_comm_down(false);
        assert!(robot.connect().is_ok());
    }

    #[test]
    fn ack_skew_is_visible() {
        let (mut robot, handle) = connected();
        handle.set_ack_skew(1);
        robot.write_var(IntVar::Cmd, 1000).unwrap();
        assert_eq!(robot.read_var(IntVar::Ack).unwrap(), 1501);
    }

    #[test]
    fn read_only_vars_reject_writes() {
        let (mut robot, _) = connected();
        assert!(robot.write_var(IntVar::Ack, 1).is_err());
    }
}
