//! Cell runtime.
//!
//! Builds the Logic, Device and Robot machines and the hardware pollers from
//! one [`CellConfig`] and a [`CellHardware`] bundle. [`Cell::start`] moves
//! each onto its own thread; [`Cell::tick_all`] drives everything from the
//! calling thread for deterministic runs.

use cell_common::config::CellConfig;
use cell_hal::{
    CellHardware, CommStatusAggregator, IoPoller, LampController, Poller, PollerHandle,
    spawn_poller,
};
use cell_store::SharedStore;
use std::time::Duration;
use tracing::{error, info};

use crate::device::{DeviceContext, DeviceFsm, Instruments, device_fsm};
use crate::engine::{Fsm, FsmHandle};
use crate::error::FsmResult;
use crate::logic::{LogicContext, LogicFsm, logic_fsm};
use crate::robot::{RobotContext, RobotFsm, robot_fsm};

/// The three machines and the pollers, not yet running.
pub struct Cell {
    store: SharedStore,
    tick_interval: Duration,
    poll_interval: Duration,
    logic: Fsm<LogicFsm>,
    device: Fsm<DeviceFsm>,
    robot: Fsm<RobotFsm>,
    pollers: Vec<Box<dyn Poller>>,
}

impl Cell {
    /// Wire `hardware` into the machines.
    ///
    /// # Errors
    /// Rule table construction failures.
    pub fn new(config: &CellConfig, hardware: CellHardware, store: SharedStore) -> FsmResult<Self> {
        let threshold = config.comm.error_threshold;
        let pollers: Vec<Box<dyn Poller>> = vec![
            Box::new(IoPoller::new(hardware.io.clone(), threshold)),
            Box::new(LampController::new(hardware.io.clone())),
            Box::new(CommStatusAggregator::new(threshold)),
        ];

        let robot = robot_fsm(RobotContext::new(
            store.clone(),
            hardware.robot,
            hardware.zone_predictor,
            &config.robot,
            &config.comm,
            config.recovery.clone(),
        ))?;
        let device = device_fsm(DeviceContext::new(
            store.clone(),
            Instruments {
                io: hardware.io,
                gauge: hardware.gauge,
                qr: hardware.qr,
                tester: hardware.tester,
            },
            &config.device,
            &config.io,
            &config.comm,
            config.recovery.clone(),
        ))?;
        let logic = logic_fsm(LogicContext::new(
            store.clone(),
            &config.logic,
            config.robot.rack_floors,
            config.recovery.clone(),
        ))?;

        Ok(Self {
            store,
            tick_interval: config.engine.tick_interval(),
            poll_interval: config.comm.poll_interval(),
            logic,
            device,
            robot,
            pollers,
        })
    }

    /// Store shared by every thread.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Logic machine.
    pub fn logic(&self) -> &Fsm<LogicFsm> {
        &self.logic
    }

    /// Device machine.
    pub fn device(&self) -> &Fsm<DeviceFsm> {
        &self.device
    }

    /// Robot machine.
    pub fn robot(&self) -> &Fsm<RobotFsm> {
        &self.robot
    }

    /// One poll of every poller, then one tick of Robot, Device and Logic.
    pub fn tick_all(&mut self) {
        for poller in &mut self.pollers {
            poller.poll(&self.store);
        }
        self.robot.tick();
        self.device.tick();
        self.logic.tick();
    }

    /// Spawn the pollers and one thread per machine.
    ///
    /// # Errors
    /// Thread creation failures; everything already started is stopped.
    pub fn start(self) -> FsmResult<CellHandle> {
        let mut pollers = Vec::with_capacity(self.pollers.len());
        for poller in self.pollers {
            match spawn_poller(poller, self.store.clone(), self.poll_interval) {
                Ok(handle) => pollers.push(handle),
                Err(e) => {
                    stop_pollers(pollers);
                    return Err(e.into());
                }
            }
        }

        let robot = match self.robot.run_background(self.tick_interval) {
            Ok(handle) => handle,
            Err(e) => {
                stop_pollers(pollers);
                return Err(e);
            }
        };
        let device = match self.device.run_background(self.tick_interval) {
            Ok(handle) => handle,
            Err(e) => {
                stop_quietly(robot);
                stop_pollers(pollers);
                return Err(e);
            }
        };
        let logic = match self.logic.run_background(self.tick_interval) {
            Ok(handle) => handle,
            Err(e) => {
                stop_quietly(device);
                stop_quietly(robot);
                stop_pollers(pollers);
                return Err(e);
            }
        };

        info!(
            tick_ms = self.tick_interval.as_millis() as u64,
            poll_ms = self.poll_interval.as_millis() as u64,
            pollers = pollers.len(),
            "Cell started"
        );
        Ok(CellHandle {
            store: self.store,
            logic,
            device,
            robot,
            pollers,
        })
    }
}

// Moved onto its threads by `start`.
static_assertions::assert_impl_all!(Cell: Send);

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("logic", &self.logic)
            .field("device", &self.device)
            .field("robot", &self.robot)
            .field("pollers", &self.pollers.iter().map(|p| p.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn stop_pollers(pollers: Vec<PollerHandle>) {
    for poller in pollers {
        poller.stop();
    }
}

fn stop_quietly<M: crate::engine::Machine>(handle: FsmHandle<M>) {
    if let Err(e) = handle.stop() {
        error!(error = %e, "FSM thread did not stop cleanly");
    }
}

/// Running cell.
#[derive(Debug)]
pub struct CellHandle {
    store: SharedStore,
    logic: FsmHandle<LogicFsm>,
    device: FsmHandle<DeviceFsm>,
    robot: FsmHandle<RobotFsm>,
    pollers: Vec<PollerHandle>,
}

impl CellHandle {
    /// Store shared by every thread.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Whether every machine thread is still alive.
    pub fn is_running(&self) -> bool {
        !(self.logic.is_finished() || self.device.is_finished() || self.robot.is_finished())
    }

    /// Stop the producer first, then the consumers, then the pollers, and
    /// join every thread.
    ///
    /// # Errors
    /// The first machine thread that did not join cleanly.
    pub fn stop(self) -> FsmResult<()> {
        self.logic.request_stop();
        self.device.request_stop();
        self.robot.request_stop();

        let logic = self.logic.stop().map(drop);
        let device = self.device.stop().map(drop);
        let robot = self.robot.stop().map(drop);
        stop_pollers(self.pollers);
        info!("Cell stopped");
        logic.and(device).and(robot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cell_common::keys;
    use cell_hal::drivers::simulation::{self, SimulationOptions};
    use std::time::Instant;

    fn fast_config() -> CellConfig {
        let mut config = CellConfig::default();
        config.engine.tick_interval_ms = 1;
        config.comm.poll_interval_ms = 1;
        config.recovery.settle_delay_ms = 0;
        config
    }

    fn sim_cell(config: &CellConfig) -> (Cell, simulation::SimulationHandles) {
        let options = SimulationOptions {
            ack_delay_polls: 0,
            done_delay_polls: 1,
            test_duration_polls: 1,
            ..SimulationOptions::default()
        };
        let (hardware, handles) = simulation::build(&options, &config.io);
        let cell = Cell::new(config, hardware, SharedStore::new()).unwrap();
        (cell, handles)
    }

    #[test]
    fn lockstep_reaches_idle() {
        let (mut cell, _sim) = sim_cell(&fast_config());
        for _ in 0..5 {
            cell.tick_all();
        }
        let store = cell.store();
        assert_eq!(store.get_str(&keys::fsm_state("robot")).as_deref(), Some("READY"));
        assert_eq!(store.get_str(&keys::fsm_state("device")).as_deref(), Some("READY"));
        assert_eq!(store.get_str(&keys::fsm_state("logic")).as_deref(), Some("IDLE"));
    }

    #[test]
    fn threads_start_and_stop() {
        let (cell, _sim) = sim_cell(&fast_config());
        let handle = cell.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.store().get_str(&keys::fsm_state("logic")).as_deref() != Some("IDLE") {
            assert!(Instant::now() < deadline, "logic never reached IDLE");
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(handle.is_running());
        handle.stop().unwrap();
    }
}
