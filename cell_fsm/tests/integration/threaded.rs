//! The cell on its own threads.

use cell_common::keys;
use serde_json::json;
use std::thread;
use std::time::{Duration, Instant};

use super::support::{config, report, sim_cell, submit};

fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn batch_runs_on_background_threads() {
    let mut config = config();
    config.engine.tick_interval_ms = 1;
    config.comm.poll_interval_ms = 1;
    let (cell, sim) = sim_cell(&config);
    let handle = cell.start().expect("cell starts");
    let store = handle.store().clone();

    assert!(wait_for(Duration::from_secs(5), || {
        store.get_str(&keys::fsm_state(keys::LOGIC_FSM)).as_deref() == Some("IDLE")
    }));
    submit(&store, json!([{ "floor": 1, "tpname": "T1" }, { "floor": 2, "tpname": "T2" }]));

    assert!(
        wait_for(Duration::from_secs(20), || report(&store).is_some()),
        "no report, progress {:?}",
        store.get_opt(keys::BATCH_PROGRESS)
    );
    let report = report(&store).expect("batch report");
    assert_eq!(report["status"], json!("completed"), "{report}");
    assert_eq!(report["specimens"].as_array().map(Vec::len), Some(2));
    assert_eq!(sim.robot.last_position(), 1000);

    assert!(handle.is_running());
    handle.stop().expect("clean shutdown");
}

#[test]
fn stop_mid_batch_joins_every_thread() {
    let mut config = config();
    config.engine.tick_interval_ms = 1;
    config.comm.poll_interval_ms = 1;
    let (cell, sim) = sim_cell(&config);
    let handle = cell.start().expect("cell starts");

    submit(handle.store(), json!([{ "floor": 1, "tpname": "T1" }]));
    assert!(wait_for(Duration::from_secs(5), || !sim.robot.cmd_writes().is_empty()));
    handle.stop().expect("clean shutdown");
}
