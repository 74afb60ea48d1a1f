//! Robot FSM context.

use cell_common::config::{CommConfig, RecoveryConfig, RobotConfig};
use cell_common::keys;
use cell_common::violation::Violation;
use cell_hal::{HalResult, IntVar, RobotController, RobotStatus, ZonePredictor};
use cell_store::{CommandConsumer, SharedStore, StoreError};
use serde_json::Value;
use std::fmt;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::context::{Context, ContextCore};
use crate::error::FsmResult;
use crate::handshake::{HandshakeStatus, HandshakeTiming, MotionHandshake};
use crate::lifecycle::CellContext;
use crate::motion::{MotionCatalogue, MotionSafety, Position};
use crate::robot::plan::RobotJob;
use crate::violation::CommCounter;

/// Everything the Robot FSM owns.
pub struct RobotContext {
    core: ContextCore,
    robot: Box<dyn RobotController>,
    predictor: Option<Box<dyn ZonePredictor>>,
    timing: HandshakeTiming,
    safety: MotionSafety,
    comm: CommCounter,
    status: Option<RobotStatus>,
    connected: bool,
    servo_expected: bool,
    commands: CommandConsumer,
    job: Option<RobotJob>,
}

impl RobotContext {
    /// Context over a robot controller, consuming `command/robot`.
    pub fn new(
        store: SharedStore,
        robot: Box<dyn RobotController>,
        predictor: Option<Box<dyn ZonePredictor>>,
        config: &RobotConfig,
        comm: &CommConfig,
        recovery: RecoveryConfig,
    ) -> Self {
        let commands = CommandConsumer::new(store.clone(), keys::ROBOT_COMMAND);
        Self {
            core: ContextCore::new(keys::ROBOT_FSM, store, recovery),
            robot,
            predictor,
            timing: HandshakeTiming::from(config),
            safety: MotionSafety::new(MotionCatalogue::new(config.rack_floors)),
            comm: CommCounter::new("robot", Violation::ROBOT_COMM, comm.error_threshold),
            status: None,
            connected: false,
            servo_expected: false,
            commands,
            job: None,
        }
    }

    /// Motion validator and position tracker.
    pub fn safety(&self) -> &MotionSafety {
        &self.safety
    }

    /// Inbound command channel.
    pub fn commands(&self) -> &CommandConsumer {
        &self.commands
    }

    /// Command being executed.
    pub fn job(&self) -> Option<&RobotJob> {
        self.job.as_ref()
    }

    pub(crate) fn job_mut(&mut self) -> Option<&mut RobotJob> {
        self.job.as_mut()
    }

    pub(crate) fn begin_job(&mut self, job: RobotJob) {
        info!(
            id = job.id,
            process = %job.process,
            steps = ?job.steps(),
            "Robot command accepted"
        );
        self.job = Some(job);
    }

    /// Whether the job's record was cancelled or replaced by the producer.
    pub(crate) fn job_cancelled(&self) -> bool {
        self.job
            .as_ref()
            .is_some_and(|job| !self.commands.is_current(job.id))
    }

    pub(crate) fn drop_job(&mut self) -> Option<RobotJob> {
        self.job.take()
    }

    /// Report the job done with the reached position.
    pub(crate) fn complete_job(&mut self) {
        let Some(job) = self.job.take() else {
            return;
        };
        let result = serde_json::json!({ "position": self.safety.current() });
        match self.commands.complete(job.id, Some(result)) {
            Ok(()) => info!(id = job.id, process = %job.process, "Robot command done"),
            Err(e) => debug!(id = job.id, error = %e, "Completion not written"),
        }
    }

    /// Report the job failed.
    pub(crate) fn fail_job(&mut self, reason: &str) {
        let Some(job) = self.job.take() else {
            return;
        };
        warn!(id = job.id, process = %job.process, reason, "Robot command failed");
        if let Err(e) = self.commands.fail(job.id, reason) {
            debug!(id = job.id, error = %e, "Failure not written");
        }
    }

    /// Fail a record that never became a job.
    pub(crate) fn reject(&self, id: u64, reason: &str) {
        warn!(id, reason, "Robot command rejected");
        match self.commands.fail(id, reason) {
            Ok(()) | Err(StoreError::StaleRecord { .. }) => {}
            Err(e) => debug!(id, error = %e, "Rejection not written"),
        }
    }

    // ─── Motion ─────────────────────────────────────────────────────

    /// Write CMD for `target`.
    pub(crate) fn start_motion(&mut self, target: i64) -> HalResult<MotionHandshake> {
        let result = MotionHandshake::start(self.robot.as_mut(), target, self.timing, Instant::now());
        self.comm.record(self.core.store(), result)
    }

    /// Poll a running handshake and track the position it reports.
    pub(crate) fn poll_motion(&mut self, handshake: &mut MotionHandshake) -> HalResult<HandshakeStatus> {
        let result = handshake.poll(self.robot.as_mut(), Instant::now());
        let status = self.comm.record(self.core.store(), result)?;
        match status {
            HandshakeStatus::Acknowledged => self.safety.on_ack(handshake.cmd()),
            HandshakeStatus::Complete => self.safety.on_done(handshake.cmd()),
            HandshakeStatus::Failed(_) => self.safety.abort_motion(),
            HandshakeStatus::Pending => return Ok(status),
        }
        self.publish_position();
        Ok(status)
    }

    /// Abandon a motion whose handshake is still open.
    pub(crate) fn interrupt_motion(&mut self) {
        if self.connected {
            if let Err(e) = self.robot.write_var(IntVar::Cmd, 0) {
                debug!(error = %e, "CMD clear failed");
            }
        }
        self.safety.abort_motion();
        self.publish_position();
    }

    fn publish_position(&self) {
        let value = self.safety.current().map_or(Value::Null, Value::from);
        self.core.store().set(keys::ROBOT_POSITION, value);
    }

    /// Resolve the position from the controller, falling back to the zone
    /// predictor.
    fn resolve_position(&mut self) -> Position {
        let result = self.robot.read_var(IntVar::LastPosition);
        let reported = self.comm.record(self.core.store(), result).ok();
        let candidate = match reported {
            Some(id) if self.safety.catalogue().is_known(id) => Some(id),
            _ => self.predict(),
        };
        let position = self.safety.resolve(candidate);
        match position {
            Position::Known(id) => info!(position = id, "Robot position resolved"),
            _ => warn!(reported = ?reported, "Robot position unknown"),
        }
        self.publish_position();
        position
    }

    fn predict(&mut self) -> Option<i64> {
        let predictor = self.predictor.as_mut()?;
        let status = match self.status {
            Some(status) => status,
            None => self.robot.status().ok()?,
        };
        let predicted = predictor.predict(&status);
        debug!(?predicted, "Zone predictor consulted");
        predicted
    }
}

impl fmt::Debug for RobotContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RobotContext")
            .field("core", &self.core)
            .field("position", &self.safety.position())
            .field("connected", &self.connected)
            .field("job", &self.job)
            .finish_non_exhaustive()
    }
}

impl Context for RobotContext {
    fn core(&self) -> &ContextCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ContextCore {
        &mut self.core
    }
}

impl CellContext for RobotContext {
    fn connect(&mut self) -> FsmResult<bool> {
        let result = self.robot.connect();
        self.comm.record(self.core.store(), result)?;
        self.connected = true;
        let result = self.robot.set_servo(true);
        self.comm.record(self.core.store(), result)?;
        self.servo_expected = true;
        self.status = None;
        self.resolve_position();
        Ok(true)
    }

    fn reconnect(&mut self, bit: Violation) -> FsmResult<()> {
        if bit != Violation::ROBOT_COMM {
            return Ok(());
        }
        self.robot.disconnect();
        self.connected = false;
        self.robot.connect()?;
        self.connected = true;
        self.comm.reset(self.core.store());
        if self.servo_expected {
            self.robot.set_servo(true)?;
        }
        Ok(())
    }

    fn reset_faults(&mut self, snapshot: Violation) -> FsmResult<()> {
        self.core.clear_latched();
        if !self.connected {
            return Ok(());
        }
        if snapshot.intersects(Violation::ROBOT_CONTROLLER_ALARM | Violation::ROBOT_COLLISION) {
            let result = self.robot.reset_alarm();
            self.comm.record(self.core.store(), result)?;
        }
        if snapshot.contains(Violation::ROBOT_SERVO_OFF) {
            let result = self.robot.set_servo(true);
            self.comm.record(self.core.store(), result)?;
        }
        if self.safety.current().is_none() {
            self.resolve_position();
        }
        Ok(())
    }

    fn sense(&mut self) {
        if !self.connected {
            return;
        }
        let result = self.robot.status();
        if let Ok(status) = self.comm.record(self.core.store(), result) {
            self.status = Some(status);
        }
    }

    fn check_violation(&self) -> Violation {
        let mut v = self.core.latched() | self.comm.bits();
        if let Some(status) = &self.status {
            if status.collision {
                v |= Violation::ROBOT_COLLISION;
            }
            if status.alarm.is_some() {
                v |= Violation::ROBOT_CONTROLLER_ALARM;
            }
            if self.servo_expected && !status.servo_on {
                v |= Violation::ROBOT_SERVO_OFF;
            }
        }
        if self.connected && self.safety.position() == Position::Unknown {
            v |= Violation::ROBOT_POSITION_UNKNOWN;
        }
        v
    }

    fn enter_safe_state(&mut self) {
        if self.connected {
            if let Err(e) = self.robot.write_var(IntVar::Cmd, 0) {
                warn!(error = %e, "CMD clear failed");
            }
            if let Err(e) = self.robot.set_servo(false) {
                warn!(error = %e, "Servo off failed");
            }
        }
        self.servo_expected = false;
        self.status = None;
        self.safety.abort_motion();
        self.publish_position();
        self.fail_job("emergency stop");
    }
}
