//! READY and MOVING strategies of the Robot FSM.

use cell_common::violation::Violation;
use cell_store::StoreError;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::engine::Strategy;
use crate::error::FsmResult;
use crate::handshake::{HandshakeFailure, HandshakeStatus, MotionHandshake};
use crate::lifecycle::check_guards;
use crate::process::RobotProcess;
use crate::robot::plan::{RobotJob, plan};
use crate::robot::{RobotContext, RobotEvent, RobotFsm};
use crate::rules::EventId;

// ─── READY ──────────────────────────────────────────────────────────

/// Waits for a command and turns it into a motion plan.
#[derive(Debug, Default)]
pub struct ReadyStrategy {
    malformed_reported: bool,
}

impl Strategy<RobotFsm> for ReadyStrategy {
    fn operate(&mut self, ctx: &mut RobotContext) -> FsmResult<RobotEvent> {
        if let Some(event) = check_guards(ctx) {
            return Ok(event);
        }

        let record = match ctx.commands().pending() {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.malformed_reported = false;
                return Ok(RobotEvent::None);
            }
            Err(e @ StoreError::MalformedRecord { .. }) => {
                if !self.malformed_reported {
                    warn!(error = %e, "Ignoring malformed robot command");
                    self.malformed_reported = true;
                }
                return Ok(RobotEvent::None);
            }
            Err(e) => return Err(e.into()),
        };

        let planned = record.process.parse::<RobotProcess>().and_then(|process| {
            let steps = plan(
                process,
                &record,
                ctx.safety().catalogue(),
                ctx.safety().current(),
            )?;
            Ok(RobotJob::new(record.id, process, steps))
        });
        match planned {
            Ok(job) => {
                ctx.begin_job(job);
                Ok(RobotEvent::Move)
            }
            Err(e) => {
                ctx.reject(record.id, &e.to_string());
                Ok(RobotEvent::None)
            }
        }
    }
}

// ─── MOVING ─────────────────────────────────────────────────────────

/// Dispatches the plan one validated motion at a time.
///
/// Cancellation by the producer is honoured between motions only; a motion
/// the controller has accepted always runs to its DONE.
#[derive(Debug, Default)]
pub struct MovingStrategy {
    handshake: Option<MotionHandshake>,
}

impl Strategy<RobotFsm> for MovingStrategy {
    fn prepare(&mut self, _ctx: &mut RobotContext) -> FsmResult<()> {
        self.handshake = None;
        Ok(())
    }

    fn operate(&mut self, ctx: &mut RobotContext) -> FsmResult<RobotEvent> {
        if let Some(event) = check_guards(ctx) {
            return Ok(event);
        }

        match self.handshake.as_mut() {
            None => self.dispatch_next(ctx),
            Some(handshake) => {
                let status = match ctx.poll_motion(handshake) {
                    Ok(status) => status,
                    Err(e) if e.is_comm() => {
                        debug!(cmd = handshake.cmd(), error = %e, "Handshake poll failed");
                        return Ok(RobotEvent::None);
                    }
                    Err(e) => return Err(e.into()),
                };
                match status {
                    HandshakeStatus::Pending | HandshakeStatus::Acknowledged => {
                        Ok(RobotEvent::None)
                    }
                    HandshakeStatus::Complete => {
                        self.handshake = None;
                        if let Some(job) = ctx.job_mut() {
                            job.advance();
                        }
                        Ok(RobotEvent::None)
                    }
                    HandshakeStatus::Failed(failure) => {
                        let cmd = handshake.cmd();
                        self.handshake = None;
                        let (bit, reason) = match failure {
                            HandshakeFailure::AckTimeout => {
                                (Violation::ROBOT_ACK_TIMEOUT, format!("no ACK for motion {cmd}"))
                            }
                            HandshakeFailure::DoneTimeout => {
                                (Violation::ROBOT_DONE_TIMEOUT, format!("no DONE for motion {cmd}"))
                            }
                        };
                        ctx.core_mut().latch(bit);
                        ctx.fail_job(&reason);
                        Ok(RobotEvent::ViolationDetect)
                    }
                }
            }
        }
    }

    fn exit(&mut self, ctx: &mut RobotContext, event: RobotEvent) -> FsmResult<()> {
        if event == RobotEvent::Done {
            return Ok(());
        }
        if let Some(handshake) = self.handshake.take() {
            warn!(cmd = handshake.cmd(), event = ?event, "Motion interrupted");
            ctx.interrupt_motion();
        }
        let violation = ctx.core().violation();
        let reason = if violation.is_empty() {
            format!("interrupted by {}", event.name())
        } else {
            format!("interrupted by {violation}")
        };
        ctx.fail_job(&reason);
        Ok(())
    }
}

impl MovingStrategy {
    fn dispatch_next(&mut self, ctx: &mut RobotContext) -> FsmResult<RobotEvent> {
        if ctx.job_cancelled() {
            if let Some(job) = ctx.drop_job() {
                info!(id = job.id, process = %job.process, "Robot command cancelled by producer");
            }
            return Ok(RobotEvent::Done);
        }
        let Some(target) = ctx.job().and_then(RobotJob::next_step) else {
            ctx.complete_job();
            return Ok(RobotEvent::Done);
        };

        let current = ctx.safety().current();
        if current == Some(target) {
            if let Some(job) = ctx.job_mut() {
                job.advance();
            }
            return Ok(RobotEvent::None);
        }
        if !ctx.safety().is_safe_to_move(target) {
            let from = ctx.safety().position();
            ctx.fail_job(&format!("unsafe motion {from} -> {target}"));
            return Ok(RobotEvent::Done);
        }

        match ctx.start_motion(target) {
            Ok(handshake) => {
                debug!(cmd = target, "Motion dispatched");
                self.handshake = Some(handshake);
                Ok(RobotEvent::None)
            }
            Err(e) if e.is_comm() => {
                debug!(cmd = target, error = %e, "CMD write failed, retrying");
                Ok(RobotEvent::None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
