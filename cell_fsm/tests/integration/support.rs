//! Simulated cell rig shared by the integration tests.

use cell_common::config::CellConfig;
use cell_common::keys;
use cell_fsm::Cell;
use cell_hal::drivers::simulation::{self, SimulationHandles, SimulationOptions};
use cell_store::SharedStore;
use serde_json::{Value, json};

/// Default configuration without recovery settle time.
pub fn config() -> CellConfig {
    let mut config = CellConfig::default();
    config.recovery.settle_delay_ms = 0;
    config
}

/// Cell over a fast simulation plus the fault-injection handles.
pub fn sim_cell(config: &CellConfig) -> (Cell, SimulationHandles) {
    let options = SimulationOptions {
        ack_delay_polls: 0,
        done_delay_polls: 1,
        test_duration_polls: 2,
        ..SimulationOptions::default()
    };
    let (hardware, handles) = simulation::build(&options, &config.io);
    let cell = Cell::new(config, hardware, SharedStore::new()).expect("cell wiring");
    (cell, handles)
}

/// Sim cell ticked until Logic is IDLE.
pub fn idle_cell(config: &CellConfig) -> (Cell, SimulationHandles) {
    let (mut cell, sim) = sim_cell(config);
    assert!(
        tick_until(&mut cell, 10, |c| state(c, keys::LOGIC_FSM).as_deref() == Some("IDLE")),
        "cell never became idle"
    );
    (cell, sim)
}

/// Tick until `done` holds; false after `max_ticks`.
pub fn tick_until(cell: &mut Cell, max_ticks: usize, mut done: impl FnMut(&Cell) -> bool) -> bool {
    for _ in 0..max_ticks {
        cell.tick_all();
        if done(cell) {
            return true;
        }
    }
    false
}

pub fn state(cell: &Cell, fsm: &str) -> Option<String> {
    cell.store().get_str(&keys::fsm_state(fsm))
}

pub fn states(cell: &Cell) -> [Option<String>; 3] {
    [
        state(cell, keys::LOGIC_FSM),
        state(cell, keys::DEVICE_FSM),
        state(cell, keys::ROBOT_FSM),
    ]
}

pub fn progress_step(cell: &Cell) -> Option<u64> {
    cell.store().get(keys::BATCH_PROGRESS, Value::Null)["step"].as_u64()
}

pub fn submit(store: &SharedStore, specimens: Value) {
    store.set(keys::BATCH_REQUEST, json!({ "specimens": specimens }));
}

pub fn report(store: &SharedStore) -> Option<Value> {
    store.get_opt(keys::BATCH_REPORT)
}
