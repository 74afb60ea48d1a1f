//! Faults injected into a running batch.

use cell_common::io::{DiRole, DoRole};
use cell_common::keys;
use serde_json::json;

use super::support::{config, idle_cell, report, state, states, submit, tick_until};

// One specimen from floor 1, motions to the current position skipped.
const FLOOR_1_CYCLE: [i64; 19] = [
    1010, 1011, 1010, // rack floor 1
    2000, 2001, 2000, 2002, 2000, // gauge place, pick
    4000, 4001, 4002, 4000, 4003, 4004, 4000, // tester load, unload
    5000, 5001, 5000, // scrap
    1000,
];

/// Collide the robot on the first write of `motion`, clear it, and
/// return every CMD write of the batch, which must complete.
fn collide_then_finish(motion: i64) -> Vec<i64> {
    let mut config = config();
    config.logic.step_retries = 2;
    let (mut cell, sim) = idle_cell(&config);
    submit(cell.store(), json!([{ "floor": 1, "tpname": "R1" }]));

    assert!(tick_until(&mut cell, 500, |_| sim.robot.cmd_writes().contains(&motion)));
    sim.robot.set_collision(true);
    for _ in 0..20 {
        cell.tick_all();
    }
    sim.robot.set_collision(false);

    assert!(tick_until(&mut cell, 5000, |c| report(c.store()).is_some()));
    let report = report(cell.store()).expect("batch report");
    assert_eq!(report["status"], json!("completed"), "{report}");
    sim.robot.cmd_writes()
}

/// The retried step re-enters its station from HOME, then the cycle
/// carries on from where the failed step would have left it.
fn assert_retried_from_home(writes: &[i64], entry: i64, motion: i64) {
    assert_eq!(writes.iter().filter(|&&w| w == motion).count(), 2, "{writes:?}");
    let retry = writes.iter().rposition(|&w| w == motion).expect("retried motion");
    assert!(retry >= 2, "{writes:?}");
    assert_eq!(&writes[retry - 2..=retry], &[1000, entry, motion], "{writes:?}");
    let rest = FLOOR_1_CYCLE.iter().position(|&w| w == motion).expect("motion in cycle") + 1;
    assert_eq!(&writes[retry + 1..], &FLOOR_1_CYCLE[rest..], "{writes:?}");
}

#[test]
fn collision_is_recovered_and_the_batch_finishes() {
    let mut config = config();
    config.logic.step_retries = 2;
    let (mut cell, sim) = idle_cell(&config);
    submit(cell.store(), json!([{ "floor": 1, "tpname": "C1" }]));

    assert!(tick_until(&mut cell, 500, |_| sim.robot.cmd_writes().contains(&2001)));
    sim.robot.set_collision(true);

    let mut robot_states = Vec::new();
    for _ in 0..20 {
        cell.tick_all();
        robot_states.extend(state(&cell, keys::ROBOT_FSM));
    }
    assert!(robot_states.iter().any(|s| s == "ERROR" || s == "RECOVERING"), "{robot_states:?}");
    assert_ne!(state(&cell, keys::ROBOT_FSM).as_deref(), Some("READY"));

    sim.robot.set_collision(false);
    assert!(tick_until(&mut cell, 5000, |c| report(c.store()).is_some()));
    let report = report(cell.store()).expect("batch report");
    assert_eq!(report["status"], json!("completed"), "{report}");
    assert_eq!(sim.robot.cmd_writes().last(), Some(&1000));
    assert_eq!(sim.tester.received_kinds().last().map(String::as_str), Some("START_TEST"));
}

#[test]
fn failed_rack_pick_is_retried_from_home() {
    let writes = collide_then_finish(1011);
    assert_retried_from_home(&writes, 1010, 1011);
}

#[test]
fn failed_gauge_pick_is_retried_from_home() {
    let writes = collide_then_finish(2002);
    assert_retried_from_home(&writes, 2000, 2002);
}

#[test]
fn refused_registration_aborts_without_retries() {
    let mut config = config();
    config.logic.step_retries = 0;
    let (mut cell, sim) = idle_cell(&config);
    sim.tester.reject("BAD-1");
    submit(cell.store(), json!([{ "floor": 1, "tpname": "BAD-1" }]));

    assert!(tick_until(&mut cell, 3000, |c| report(c.store()).is_some()));
    let report = report(cell.store()).expect("batch report");
    assert_eq!(report["status"], json!("aborted"));
    let reason = report["reason"].as_str().unwrap_or_default();
    assert!(reason.contains("REGISTER_SPECIMEN failed"), "{reason}");
    assert!(reason.contains("refused"), "{reason}");
    assert!(!sim.tester.received_kinds().iter().any(|k| k == "START_TEST"));
    assert!(!sim.robot.cmd_writes().contains(&4001));

    // Logic latched the failure, then recovers on its own.
    assert_eq!(state(&cell, keys::LOGIC_FSM).as_deref(), Some("ERROR"));
    assert!(tick_until(&mut cell, 20, |c| state(c, keys::LOGIC_FSM).as_deref() == Some("IDLE")));
    assert_eq!(state(&cell, keys::DEVICE_FSM).as_deref(), Some("READY"));
}

#[test]
fn emergency_stop_halts_everything_until_released() {
    let (mut cell, sim) = idle_cell(&config());
    submit(cell.store(), json!([{ "floor": 3, "tpname": "E1" }]));
    assert!(tick_until(&mut cell, 500, |_| sim.robot.cmd_writes().contains(&1030)));

    sim.io.set_role(DiRole::EmergencyStop, true);
    assert!(tick_until(&mut cell, 5, |c| {
        states(c).iter().all(|s| s.as_deref() == Some("STOP_AND_OFF"))
    }));
    cell.tick_all();
    assert!(!sim.robot.servo_on());
    assert!(sim.io.output(DoRole::LampRed.index()));
    assert!(sim.io.output(DoRole::Buzzer.index()));
    assert!(!sim.io.output(DoRole::LampGreen.index()));

    let report = report(cell.store()).expect("batch report");
    assert_eq!(report["status"], json!("aborted"));
    assert!(cell.store().is_empty_at(keys::ROBOT_COMMAND));

    // Held for as long as the input is active.
    for _ in 0..10 {
        cell.tick_all();
    }
    assert_eq!(state(&cell, keys::ROBOT_FSM).as_deref(), Some("STOP_AND_OFF"));

    sim.io.set_role(DiRole::EmergencyStop, false);
    assert!(tick_until(&mut cell, 50, |c| {
        let [logic, device, robot] = states(c);
        logic.as_deref() == Some("IDLE")
            && device.as_deref() == Some("READY")
            && robot.as_deref() == Some("READY")
    }));
    assert!(sim.robot.servo_on());
    cell.tick_all();
    assert!(sim.io.output(DoRole::LampGreen.index()));
    assert!(!sim.io.output(DoRole::Buzzer.index()));
}
