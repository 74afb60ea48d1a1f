//! Simulation backend.
//!
//! Software stand-ins for every hardware collaborator, for development and
//! testing without a physical cell. Each simulated device comes with a
//! cloneable handle that tests use to inject faults and inspect traffic.

mod instruments;
mod io;
mod robot;

pub use instruments::{SimGauge, SimGaugeHandle, SimQr, SimQrHandle, SimTester, SimTesterHandle};
pub use io::{LinkedInput, SimIo, SimIoHandle};
pub use robot::{SimRobot, SimRobotHandle, SimRobotTiming};

use cell_common::config::{HardwareConfig, IoConfig};
use cell_common::io::{DiRole, DoRole};
use serde::Deserialize;
use tracing::info;

use crate::driver::{HalError, HalResult, share_io};
use crate::driver_registry::CellHardware;

/// Backend name under which the simulation registers.
pub const BACKEND_NAME: &str = "simulation";

/// Options read from `[hardware.options]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimulationOptions {
    /// Robot reads between CMD and ACK.
    pub ack_delay_polls: u32,
    /// Robot reads between motion start and DONE.
    pub done_delay_polls: u32,
    /// Tester reads between START_TEST and TEST_RESULT.
    pub test_duration_polls: u32,
    /// Gauge reading [mm].
    pub thickness_mm: f64,
    /// QR code prefix.
    pub qr_prefix: String,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            ack_delay_polls: 1,
            done_delay_polls: 4,
            test_duration_polls: 10,
            thickness_mm: 2.4,
            qr_prefix: "SP".to_string(),
        }
    }
}

impl SimulationOptions {
    /// Decode from the backend option table.
    pub fn from_table(options: &toml::Table) -> HalResult<Self> {
        toml::Value::Table(options.clone())
            .try_into()
            .map_err(|e| HalError::ConfigError(format!("simulation options: {e}")))
    }
}

/// Handles to every simulated device of one [`CellHardware`] bundle.
#[derive(Debug, Clone)]
pub struct SimulationHandles {
    /// Robot controller.
    pub robot: SimRobotHandle,
    /// I/O rack.
    pub io: SimIoHandle,
    /// Thickness gauge.
    pub gauge: SimGaugeHandle,
    /// QR reader.
    pub qr: SimQrHandle,
    /// Tester.
    pub tester: SimTesterHandle,
}

/// Build a simulated cell and keep the fault-injection handles.
pub fn build(options: &SimulationOptions, io: &IoConfig) -> (CellHardware, SimulationHandles) {
    let (robot, robot_h) = SimRobot::new(SimRobotTiming {
        ack_delay_polls: options.ack_delay_polls,
        done_delay_polls: options.done_delay_polls,
    });
    // Unlocking the tester door lets the grips close shortly after.
    let links = vec![LinkedInput {
        do_index: DoRole::TesterDoorUnlock.index(),
        di_index: DiRole::TesterGripClosed.index(),
        value: true,
        delay_refreshes: 2,
    }];
    let (sim_io, io_h) = SimIo::new(io.di_count, io.do_count, links);
    let (gauge, gauge_h) = SimGauge::new(options.thickness_mm);
    let (qr, qr_h) = SimQr::new(options.qr_prefix.clone());
    let (tester, tester_h) = SimTester::new(options.test_duration_polls);

    let hardware = CellHardware {
        robot: Box::new(robot),
        io: share_io(Box::new(sim_io)),
        gauge: Box::new(gauge),
        qr: Box::new(qr),
        tester: Box::new(tester),
        zone_predictor: None,
    };
    let handles = SimulationHandles {
        robot: robot_h,
        io: io_h,
        gauge: gauge_h,
        qr: qr_h,
        tester: tester_h,
    };
    (hardware, handles)
}

/// Registry factory for the simulation backend.
pub fn create_backend(hardware: &HardwareConfig, io: &IoConfig) -> HalResult<CellHardware> {
    let options = SimulationOptions::from_table(&hardware.options)?;
    info!(?options, "Creating simulation backend");
    Ok(build(&options, io).0)
}
