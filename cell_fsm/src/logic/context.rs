//! Logic FSM context.

use cell_common::config::{LogicConfig, RecoveryConfig};
use cell_common::keys;
use cell_common::violation::Violation;
use cell_store::{CommandProducer, SharedStore};
use tracing::{info, warn};

use crate::context::{Context, ContextCore};
use crate::error::FsmResult;
use crate::lifecycle::CellContext;
use crate::logic::batch::{BatchReport, BatchRun, BatchStatus, Target};

/// Everything the Logic FSM owns.
#[derive(Debug)]
pub struct LogicContext {
    core: ContextCore,
    robot: CommandProducer,
    device: CommandProducer,
    config: LogicConfig,
    rack_floors: u8,
    batch: Option<BatchRun>,
}

impl LogicContext {
    /// Context producing on `command/robot` and `command/device`.
    pub fn new(
        store: SharedStore,
        config: &LogicConfig,
        rack_floors: u8,
        recovery: RecoveryConfig,
    ) -> Self {
        Self {
            robot: CommandProducer::new(store.clone(), keys::ROBOT_COMMAND),
            device: CommandProducer::new(store.clone(), keys::DEVICE_COMMAND),
            core: ContextCore::new(keys::LOGIC_FSM, store, recovery),
            config: config.clone(),
            rack_floors,
            batch: None,
        }
    }

    /// Rack size used to validate requests.
    pub fn rack_floors(&self) -> u8 {
        self.rack_floors
    }

    /// Retry budget per step.
    pub fn step_retries(&self) -> u32 {
        self.config.step_retries
    }

    /// Batch being sequenced.
    pub fn batch(&self) -> Option<&BatchRun> {
        self.batch.as_ref()
    }

    pub(crate) fn batch_mut(&mut self) -> Option<&mut BatchRun> {
        self.batch.as_mut()
    }

    /// Producer of one channel.
    pub(crate) fn producer(&mut self, target: Target) -> &mut CommandProducer {
        match target {
            Target::Robot => &mut self.robot,
            Target::Device => &mut self.device,
        }
    }

    pub(crate) fn start_batch(&mut self, run: BatchRun) {
        info!(
            specimens = run.specimen_count(),
            steps = run.steps().len(),
            "Batch started"
        );
        self.batch = Some(run);
        self.publish_progress();
    }

    pub(crate) fn publish_progress(&self) {
        let Some(run) = &self.batch else {
            return;
        };
        if let Err(e) = self.core.store().set_as(keys::BATCH_PROGRESS, &run.progress()) {
            warn!(error = %e, "Progress not published");
        }
    }

    pub(crate) fn publish_report(&self, report: &BatchReport) {
        if let Err(e) = self.core.store().set_as(keys::BATCH_REPORT, report) {
            warn!(error = %e, "Batch report not published");
        }
    }

    /// Publish the completed report and forget the batch.
    pub(crate) fn finish_batch(&mut self) {
        if let Some(run) = self.batch.take() {
            info!(steps = run.steps().len(), "Batch completed");
            self.publish_report(&run.report(BatchStatus::Completed, None));
        }
    }

    /// Withdraw outstanding commands, publish an aborted report and forget
    /// the batch.
    pub(crate) fn abort_batch(&mut self, reason: &str) {
        self.robot.cancel();
        self.device.cancel();
        if let Some(run) = self.batch.take() {
            warn!(step = run.cursor(), reason, "Batch aborted");
            self.publish_report(&run.report(BatchStatus::Aborted, Some(reason.to_string())));
        }
    }
}

impl Context for LogicContext {
    fn core(&self) -> &ContextCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ContextCore {
        &mut self.core
    }
}

impl CellContext for LogicContext {
    fn connect(&mut self) -> FsmResult<bool> {
        let store = self.core.store();
        let ready = |fsm: &str| store.get_str(&keys::fsm_state(fsm)).as_deref() == Some(keys::state::READY);
        Ok(ready(keys::ROBOT_FSM) && ready(keys::DEVICE_FSM))
    }

    fn reconnect(&mut self, _bit: Violation) -> FsmResult<()> {
        Ok(())
    }

    fn sense(&mut self) {}

    fn check_violation(&self) -> Violation {
        self.core.latched()
    }

    fn enter_safe_state(&mut self) {
        self.abort_batch("emergency stop");
    }
}
