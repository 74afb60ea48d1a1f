//! Device FSM context.

use cell_common::config::{CommConfig, DeviceConfig, IoConfig, RecoveryConfig};
use cell_common::io::{DiRole, DoRole};
use cell_common::keys;
use cell_common::violation::Violation;
use cell_hal::{
    HalError, HalResult, QrReader, SharedIo, TesterClient, TesterLink, TesterMessage,
    ThicknessGauge,
};
use cell_store::{CommandConsumer, SharedStore, StoreError};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::context::{Context, ContextCore};
use crate::device::job::DeviceJob;
use crate::error::FsmResult;
use crate::lifecycle::CellContext;
use crate::violation::{CommCounter, published_counter};

/// Station instruments handed to the Device FSM.
pub struct Instruments {
    /// Shared I/O rack.
    pub io: SharedIo,
    /// Thickness gauge.
    pub gauge: Box<dyn ThicknessGauge>,
    /// QR reader.
    pub qr: Box<dyn QrReader>,
    /// Tester transport.
    pub tester: Box<dyn TesterLink>,
}

/// Everything the Device FSM owns.
pub struct DeviceContext {
    core: ContextCore,
    io: SharedIo,
    gauge: Box<dyn ThicknessGauge>,
    qr: Box<dyn QrReader>,
    tester: TesterClient,
    gauge_comm: CommCounter,
    qr_comm: CommCounter,
    tester_comm: CommCounter,
    comm_threshold: u32,
    reply_timeout: Duration,
    test_timeout: Duration,
    do_count: usize,
    door_closed: Option<bool>,
    air_ok: Option<bool>,
    io_fault: Violation,
    commands: CommandConsumer,
    job: Option<DeviceJob>,
}

impl DeviceContext {
    /// Context over the station instruments, consuming `command/device`.
    pub fn new(
        store: SharedStore,
        instruments: Instruments,
        device: &DeviceConfig,
        io: &IoConfig,
        comm: &CommConfig,
        recovery: RecoveryConfig,
    ) -> Self {
        let threshold = comm.error_threshold;
        let commands = CommandConsumer::new(store.clone(), keys::DEVICE_COMMAND);
        Self {
            core: ContextCore::new(keys::DEVICE_FSM, store, recovery),
            io: instruments.io,
            gauge: instruments.gauge,
            qr: instruments.qr,
            tester: TesterClient::new(instruments.tester),
            gauge_comm: CommCounter::new("gauge", Violation::GAUGE_COMM, threshold),
            qr_comm: CommCounter::new("qr", Violation::QR_COMM, threshold),
            tester_comm: CommCounter::new("tester", Violation::TESTER_COMM, threshold),
            comm_threshold: threshold,
            reply_timeout: device.reply_timeout(),
            test_timeout: device.test_timeout(),
            do_count: io.do_count,
            door_closed: None,
            air_ok: None,
            io_fault: Violation::empty(),
            commands,
            job: None,
        }
    }

    /// Inbound command channel.
    pub fn commands(&self) -> &CommandConsumer {
        &self.commands
    }

    /// Output width used to validate `SET_OUTPUT`.
    pub fn do_count(&self) -> usize {
        self.do_count
    }

    /// Command being executed.
    pub fn job(&self) -> Option<&DeviceJob> {
        self.job.as_ref()
    }

    /// Reply deadline of the current tester exchange.
    pub fn exchange_timeout(&self) -> Duration {
        self.job
            .as_ref()
            .map_or(self.reply_timeout, |job| job.reply_timeout(self.reply_timeout, self.test_timeout))
    }

    pub(crate) fn begin_job(&mut self, job: DeviceJob) {
        info!(id = job.id, process = %job.process, "Device command accepted");
        self.job = Some(job);
    }

    pub(crate) fn complete_job(&mut self, result: Value) {
        let Some(job) = self.job.take() else {
            return;
        };
        match self.commands.complete(job.id, Some(result)) {
            Ok(()) => info!(id = job.id, process = %job.process, "Device command done"),
            Err(e) => debug!(id = job.id, error = %e, "Completion not written"),
        }
    }

    pub(crate) fn fail_job(&mut self, reason: &str) {
        let Some(job) = self.job.take() else {
            return;
        };
        warn!(id = job.id, process = %job.process, reason, "Device command failed");
        if let Err(e) = self.commands.fail(job.id, reason) {
            debug!(id = job.id, error = %e, "Failure not written");
        }
    }

    pub(crate) fn reject(&self, id: u64, reason: &str) {
        warn!(id, reason, "Device command rejected");
        match self.commands.fail(id, reason) {
            Ok(()) | Err(StoreError::StaleRecord { .. }) => {}
            Err(e) => debug!(id, error = %e, "Rejection not written"),
        }
    }

    // ─── Instruments ────────────────────────────────────────────────

    pub(crate) fn measure(&mut self) -> HalResult<f64> {
        let result = self.gauge.measure();
        self.gauge_comm.record(self.core.store(), result)
    }

    pub(crate) fn read_code(&mut self) -> HalResult<String> {
        let result = self.qr.read_code();
        self.qr_comm.record(self.core.store(), result)
    }

    pub(crate) fn tester_send(&mut self, message: &TesterMessage) -> HalResult<()> {
        let result = self.tester.send(message);
        self.tester_comm.record(self.core.store(), result)
    }

    pub(crate) fn tester_poll(&mut self) -> HalResult<Option<TesterMessage>> {
        let result = self.tester.poll();
        self.tester_comm.record(self.core.store(), result)
    }

    /// Count a missing tester reply as one communication failure.
    pub(crate) fn tester_silent(&mut self) {
        let silent: HalResult<()> = Err(HalError::Timeout("tester reply".into()));
        let _ = self.tester_comm.record(self.core.store(), silent);
    }

    pub(crate) fn set_output(&mut self, index: usize, value: bool) -> HalResult<()> {
        self.io.lock().set_do(index, value)
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("core", &self.core)
            .field("tester", &self.tester)
            .field("job", &self.job)
            .finish_non_exhaustive()
    }
}

impl Context for DeviceContext {
    fn core(&self) -> &ContextCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ContextCore {
        &mut self.core
    }
}

impl CellContext for DeviceContext {
    fn connect(&mut self) -> FsmResult<bool> {
        let result = self.gauge.connect();
        self.gauge_comm.record(self.core.store(), result)?;
        let result = self.qr.connect();
        self.qr_comm.record(self.core.store(), result)?;
        let result = self.tester.connect();
        self.tester_comm.record(self.core.store(), result)?;
        Ok(true)
    }

    fn reconnect(&mut self, bit: Violation) -> FsmResult<()> {
        let store = self.core.store();
        if bit == Violation::GAUGE_COMM {
            self.gauge.connect()?;
            self.gauge_comm.reset(store);
        } else if bit == Violation::QR_COMM {
            self.qr.connect()?;
            self.qr_comm.reset(store);
        } else if bit == Violation::TESTER_COMM {
            self.tester.connect()?;
            self.tester_comm.reset(store);
        } else if bit == Violation::IO_COMM {
            // The I/O poller resets its own counter on the next good refresh.
            self.io.lock().connect()?;
        }
        Ok(())
    }

    fn sense(&mut self) {
        let store = self.core.store();
        self.door_closed = store.get_bool(&keys::di(DiRole::DoorClosed));
        self.air_ok = store.get_bool(&keys::di(DiRole::AirPressureOk));
        self.io_fault = published_counter(store, "io", self.comm_threshold, Violation::IO_COMM);
    }

    fn check_violation(&self) -> Violation {
        let mut v = self.core.latched()
            | self.gauge_comm.bits()
            | self.qr_comm.bits()
            | self.tester_comm.bits()
            | self.io_fault;
        if self.door_closed == Some(false) {
            v |= Violation::DOOR_OPEN;
        }
        if self.air_ok == Some(false) {
            v |= Violation::AIR_PRESSURE_LOW;
        }
        v
    }

    fn enter_safe_state(&mut self) {
        {
            let mut io = self.io.lock();
            for role in DoRole::ALL.into_iter().filter(|r| !r.is_indicator()) {
                if let Err(e) = io.set_do(role.index(), false) {
                    warn!(output = %role, error = %e, "Safe-state output write failed");
                }
            }
        }
        self.fail_job("emergency stop");
    }
}
