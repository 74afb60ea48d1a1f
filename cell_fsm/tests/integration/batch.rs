//! Whole batches in lockstep against the simulated cell.

use cell_common::io::DoRole;
use cell_common::keys;
use serde_json::{Value, json};

use super::support::{config, idle_cell, progress_step, report, state, submit, tick_until};

// Motions to the current position are skipped: no HOME at the start, no
// gauge or tester front between the place/pick and load/unload chains.
const FULL_CYCLE: [i64; 19] = [
    1020, 1021, 1020, // rack floor 2
    2000, 2001, 2000, 2002, 2000, // gauge place, pick
    4000, 4001, 4002, 4000, 4003, 4004, 4000, // tester load, unload
    5000, 5001, 5000, // scrap
    1000,
];

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn machines_come_up_with_green_lamp() {
    let (mut cell, sim) = idle_cell(&config());
    assert_eq!(state(&cell, "robot").as_deref(), Some("READY"));
    assert_eq!(state(&cell, "device").as_deref(), Some("READY"));

    cell.tick_all();
    assert!(sim.io.output(DoRole::LampGreen.index()));
    assert!(!sim.io.output(DoRole::LampRed.index()));
    let comm = cell.store().get(keys::COMM_STATUS, Value::Null);
    assert_eq!(comm["robot"], json!(true));
    assert_eq!(cell.store().get_i64(keys::ROBOT_POSITION), Some(1000));
}

#[test]
fn logic_step_reaches_robot_as_cmd_1020() {
    let (mut cell, sim) = idle_cell(&config());
    submit(cell.store(), json!([{ "floor": 2, "tpname": "A1" }]));

    assert!(tick_until(&mut cell, 100, |c| progress_step(c) == Some(2)));
    assert!(sim.robot.cmd_writes().is_empty(), "already at HOME");

    assert!(tick_until(&mut cell, 100, |c| progress_step(c) == Some(3)));
    assert_eq!(sim.robot.cmd_writes(), vec![1020]);
    assert_eq!(sim.robot.completed(), vec![1020]);
    assert_eq!(sim.robot.last_position(), 1020);
    assert_eq!(cell.store().get_i64(keys::ROBOT_POSITION), Some(1020));
    assert!(cell.store().is_empty_at(keys::ROBOT_COMMAND));
}

#[test]
fn one_specimen_batch_completes() {
    let (mut cell, sim) = idle_cell(&config());
    submit(cell.store(), json!([{ "floor": 2, "tpname": "A1" }]));

    assert!(tick_until(&mut cell, 3000, |c| report(c.store()).is_some()));
    let report = report(cell.store()).expect("batch report");
    assert_eq!(report["status"], json!("completed"), "{report}");
    assert_eq!(report["steps_completed"], json!(14));

    let specimen = &report["specimens"][0];
    assert_eq!(specimen["tpname"], json!("A1"));
    assert!(specimen["qr"].as_str().unwrap_or_default().starts_with("SP-"));
    assert_eq!(specimen["thickness"], json!(2.4));
    assert_eq!(specimen["test"]["MAX_LOAD"], json!(12.5));

    assert_eq!(sim.robot.cmd_writes(), FULL_CYCLE.to_vec());
    assert_eq!(sim.robot.completed(), FULL_CYCLE.to_vec());
    assert_eq!(
        sim.tester.received_kinds(),
        vec!["ARE_YOU_THERE", "ASK_REGISTER", "START_TEST"]
    );

    assert!(tick_until(&mut cell, 5, |c| state(c, "logic").as_deref() == Some("IDLE")));
}

#[test]
fn two_specimens_run_back_to_back() {
    let (mut cell, sim) = idle_cell(&config());
    submit(
        cell.store(),
        json!([{ "floor": 1, "tpname": "A1" }, { "floor": 3, "tpname": "A2" }]),
    );

    assert!(tick_until(&mut cell, 6000, |c| report(c.store()).is_some()));
    let report = report(cell.store()).expect("batch report");
    assert_eq!(report["status"], json!("completed"), "{report}");
    assert_eq!(report["steps_completed"], json!(25));
    assert_ne!(report["specimens"][0]["qr"], report["specimens"][1]["qr"]);

    let writes = sim.robot.cmd_writes();
    assert!(writes.contains(&1011) && writes.contains(&1031));
    assert_eq!(writes.last(), Some(&1000));
    assert_eq!(
        sim.tester.received_kinds(),
        vec!["ARE_YOU_THERE", "ASK_REGISTER", "START_TEST", "ASK_REGISTER", "START_TEST"]
    );
}

#[test]
fn rejected_request_leaves_the_cell_idle() {
    let (mut cell, sim) = idle_cell(&config());
    submit(cell.store(), json!([{ "floor": 42, "tpname": "X" }]));
    cell.tick_all();

    let report = report(cell.store()).expect("batch report");
    assert_eq!(report["status"], json!("rejected"));
    assert!(report["reason"].as_str().unwrap_or_default().contains("floor 42"));
    for _ in 0..10 {
        cell.tick_all();
    }
    assert!(sim.robot.cmd_writes().is_empty());
    assert_eq!(state(&cell, "logic").as_deref(), Some("IDLE"));
}
