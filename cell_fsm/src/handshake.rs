//! CMD/ACK/DONE motion handshake.
//!
//! The robot controller exposes three integer variables:
//!
//! 1. the cell writes `CMD = id`;
//! 2. the controller acknowledges with `ACK = id + ACK_OFFSET`, after which
//!    the cell writes `CMD = 0`;
//! 3. the controller completes with `DONE = id + DONE_OFFSET`, after which
//!    the cell writes `DONE = 0`.
//!
//! Any other value on ACK or DONE leaves the motion pending. The handshake
//! is polled once per tick and never blocks; time is passed in by the
//! caller.

use cell_common::config::RobotConfig;
use cell_common::consts::{ACK_OFFSET, DONE_OFFSET};
use cell_hal::{HalResult, IntVar, RobotController};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Why a handshake gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// No exact ACK after every retry.
    AckTimeout,
    /// No exact DONE within the completion timeout.
    DoneTimeout,
}

/// Phase of a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// CMD written, waiting for ACK.
    WaitAck {
        /// 1-based attempt number
        attempt: u32,
        /// When this attempt times out
        deadline: Instant,
    },
    /// ACK seen and CMD cleared, waiting for DONE.
    WaitDone {
        /// When completion times out
        deadline: Instant,
    },
    /// DONE seen and cleared.
    Complete,
    /// Gave up.
    Failed(HandshakeFailure),
}

/// Result of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Nothing new.
    Pending,
    /// Exact ACK observed this poll.
    Acknowledged,
    /// Exact DONE observed this poll, or earlier.
    Complete,
    /// Timed out.
    Failed(HandshakeFailure),
}

/// Handshake timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTiming {
    /// CMD writes before an ACK timeout.
    pub ack_retries: u32,
    /// Wait per CMD write.
    pub ack_retry_interval: Duration,
    /// Wait for DONE after ACK.
    pub done_timeout: Duration,
}

impl From<&RobotConfig> for HandshakeTiming {
    fn from(cfg: &RobotConfig) -> Self {
        Self {
            ack_retries: cfg.ack_retries.max(1),
            ack_retry_interval: cfg.ack_retry_interval(),
            done_timeout: cfg.done_timeout(),
        }
    }
}

/// One motion's handshake.
#[derive(Debug, Clone)]
pub struct MotionHandshake {
    cmd: i64,
    timing: HandshakeTiming,
    phase: HandshakePhase,
}

impl MotionHandshake {
    /// Write `CMD = cmd` and start waiting for the ACK.
    ///
    /// # Errors
    /// The CMD write failed; nothing was started.
    pub fn start(
        robot: &mut dyn RobotController,
        cmd: i64,
        timing: HandshakeTiming,
        now: Instant,
    ) -> HalResult<Self> {
        robot.write_var(IntVar::Cmd, cmd)?;
        debug!(cmd, "CMD written");
        Ok(Self {
            cmd,
            timing,
            phase: HandshakePhase::WaitAck {
                attempt: 1,
                deadline: now + timing.ack_retry_interval,
            },
        })
    }

    /// Motion id.
    #[inline]
    pub fn cmd(&self) -> i64 {
        self.cmd
    }

    /// Current phase.
    #[inline]
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// The only ACK value that acknowledges this motion.
    #[inline]
    pub fn expected_ack(&self) -> i64 {
        self.cmd + i64::from(ACK_OFFSET)
    }

    /// The only DONE value that completes this motion.
    #[inline]
    pub fn expected_done(&self) -> i64 {
        self.cmd + i64::from(DONE_OFFSET)
    }

    /// Advance by reading the controller once.
    ///
    /// # Errors
    /// RPC failures. The phase is unchanged, so the caller may poll again.
    pub fn poll(&mut self, robot: &mut dyn RobotController, now: Instant) -> HalResult<HandshakeStatus> {
        match self.phase {
            HandshakePhase::WaitAck { attempt, deadline } => {
                let ack = robot.read_var(IntVar::Ack)?;
                if ack == self.expected_ack() {
                    robot.write_var(IntVar::Cmd, 0)?;
                    self.phase = HandshakePhase::WaitDone {
                        deadline: now + self.timing.done_timeout,
                    };
                    debug!(cmd = self.cmd, ack, "ACK observed");
                    return Ok(HandshakeStatus::Acknowledged);
                }
                if now < deadline {
                    return Ok(HandshakeStatus::Pending);
                }
                if attempt < self.timing.ack_retries {
                    warn!(cmd = self.cmd, attempt, last_ack = ack, "No ACK, rewriting CMD");
                    robot.write_var(IntVar::Cmd, self.cmd)?;
                    self.phase = HandshakePhase::WaitAck {
                        attempt: attempt + 1,
                        deadline: now + self.timing.ack_retry_interval,
                    };
                    return Ok(HandshakeStatus::Pending);
                }
                warn!(cmd = self.cmd, attempts = attempt, last_ack = ack, "ACK timeout");
                self.phase = HandshakePhase::Failed(HandshakeFailure::AckTimeout);
                robot.write_var(IntVar::Cmd, 0)?;
                Ok(HandshakeStatus::Failed(HandshakeFailure::AckTimeout))
            }
            HandshakePhase::WaitDone { deadline } => {
                let done = robot.read_var(IntVar::Done)?;
                if done == self.expected_done() {
                    robot.write_var(IntVar::Done, 0)?;
                    self.phase = HandshakePhase::Complete;
                    debug!(cmd = self.cmd, done, "DONE observed");
                    return Ok(HandshakeStatus::Complete);
                }
                if now >= deadline {
                    warn!(cmd = self.cmd, last_done = done, "DONE timeout");
                    self.phase = HandshakePhase::Failed(HandshakeFailure::DoneTimeout);
                    return Ok(HandshakeStatus::Failed(HandshakeFailure::DoneTimeout));
                }
                Ok(HandshakeStatus::Pending)
            }
            HandshakePhase::Complete => Ok(HandshakeStatus::Complete),
            HandshakePhase::Failed(reason) => Ok(HandshakeStatus::Failed(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cell_hal::{HalError, RobotStatus};

    /// Controller whose variables are set by the test.
    #[derive(Debug, Default)]
    struct Scripted {
        ack: i64,
        done: i64,
        writes: Vec<(IntVar, i64)>,
        fail_reads: bool,
    }

    impl RobotController for Scripted {
        fn connect(&mut self) -> HalResult<()> {
            Ok(())
        }
        fn disconnect(&mut self) {}
        fn read_var(&mut self, var: IntVar) -> HalResult<i64> {
            if self.fail_reads {
                return Err(HalError::Timeout("rpc".into()));
            }
            Ok(match var {
                IntVar::Ack => self.ack,
                IntVar::Done => self.done,
                _ => 0,
            })
        }
        fn write_var(&mut self, var: IntVar, value: i64) -> HalResult<()> {
            self.writes.push((var, value));
            Ok(())
        }
        fn status(&mut self) -> HalResult<RobotStatus> {
            Ok(RobotStatus::default())
        }
        fn set_servo(&mut self, _on: bool) -> HalResult<()> {
            Ok(())
        }
    }

    fn timing() -> HandshakeTiming {
        HandshakeTiming {
            ack_retries: 3,
            ack_retry_interval: Duration::from_millis(100),
            done_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn only_exact_values_are_accepted() {
        let t0 = Instant::now();
        let mut robot = Scripted::default();
        let mut hs = MotionHandshake::start(&mut robot, 1000, timing(), t0).unwrap();
        assert_eq!(robot.writes, vec![(IntVar::Cmd, 1000)]);

        for wrong in [1, 500, 1499, 1501, 11000] {
            robot.ack = wrong;
            assert_eq!(hs.poll(&mut robot, t0).unwrap(), HandshakeStatus::Pending);
        }
        robot.ack = 1500;
        assert_eq!(hs.poll(&mut robot, t0).unwrap(), HandshakeStatus::Acknowledged);
        assert_eq!(robot.writes.last(), Some(&(IntVar::Cmd, 0)));

        for wrong in [1500, 10000, 10999, 11001] {
            robot.done = wrong;
            assert_eq!(hs.poll(&mut robot, t0).unwrap(), HandshakeStatus::Pending);
        }
        robot.done = 11000;
        assert_eq!(hs.poll(&mut robot, t0).unwrap(), HandshakeStatus::Complete);
        assert_eq!(robot.writes.last(), Some(&(IntVar::Done, 0)));
        assert_eq!(hs.phase(), HandshakePhase::Complete);
    }

    #[test]
    fn ack_is_retried_then_times_out() {
        let t0 = Instant::now();
        let step = Duration::from_millis(100);
        let mut robot = Scripted::default();
        let mut hs = MotionHandshake::start(&mut robot, 2000, timing(), t0).unwrap();

        assert_eq!(hs.poll(&mut robot, t0 + step).unwrap(), HandshakeStatus::Pending);
        assert_eq!(hs.poll(&mut robot, t0 + step * 2).unwrap(), HandshakeStatus::Pending);
        assert_eq!(
            hs.poll(&mut robot, t0 + step * 3).unwrap(),
            HandshakeStatus::Failed(HandshakeFailure::AckTimeout)
        );
        let cmd_writes: Vec<i64> = robot
            .writes
            .iter()
            .filter(|(v, _)| *v == IntVar::Cmd)
            .map(|&(_, value)| value)
            .collect();
        assert_eq!(cmd_writes, vec![2000, 2000, 2000, 0]);
    }

    #[test]
    fn done_timeout() {
        let t0 = Instant::now();
        let mut robot = Scripted {
            ack: 4500,
            ..Scripted::default()
        };
        let mut hs = MotionHandshake::start(&mut robot, 4000, timing(), t0).unwrap();
        assert_eq!(hs.poll(&mut robot, t0).unwrap(), HandshakeStatus::Acknowledged);
        assert_eq!(
            hs.poll(&mut robot, t0 + Duration::from_secs(5)).unwrap(),
            HandshakeStatus::Failed(HandshakeFailure::DoneTimeout)
        );
        assert_eq!(
            hs.poll(&mut robot, t0 + Duration::from_secs(6)).unwrap(),
            HandshakeStatus::Failed(HandshakeFailure::DoneTimeout)
        );
    }

    #[test]
    fn rpc_errors_leave_phase_untouched() {
        let t0 = Instant::now();
        let mut robot = Scripted::default();
        let mut hs = MotionHandshake::start(&mut robot, 1000, timing(), t0).unwrap();
        robot.fail_reads = true;
        assert!(hs.poll(&mut robot, t0).is_err());
        assert!(matches!(hs.phase(), HandshakePhase::WaitAck { attempt: 1, .. }));
    }
}
