//! Logic FSM: the batch sequencer.
//!
//! Waits until the Robot and Device machines both publish READY, then takes
//! batch requests from `batch/request`, expands each into its steps and
//! hands the steps one at a time to the Robot or Device command channel.
//! It never talks to hardware itself.
//!
//! ```text
//! CONNECTING ──CONNECTED──► IDLE ──START──► RUNNING
//!                            ▲                 │
//!                            └──────DONE───────┘
//! ```
//!
//! ## Module Structure
//!
//! - `batch` - request validation, step expansion, progress and reports
//! - `context` - command producers and the batch being run
//! - `strategies` - IDLE and RUNNING

pub mod batch;
pub mod context;
pub mod strategies;

use cell_common::keys::{LOGIC_FSM, state};

use crate::engine::{Fsm, Machine, Strategy};
use crate::error::FsmResult;
use crate::lifecycle::{
    ConnectingStrategy, ErrorStrategy, LifecycleEvent, LifecycleStates, RecoveringStrategy,
    StopAndOffStrategy, add_lifecycle_rules,
};
use crate::rules::{EventId, RuleTable, StateId};

pub use batch::{BatchProgress, BatchReport, BatchRequest, BatchRun, BatchStatus, Specimen};
pub use context::LogicContext;

/// Logic FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum LogicState {
    /// Waiting for Robot and Device.
    Connecting = 0x0001,
    /// Waiting for a batch request.
    Idle = 0x0002,
    /// Violation present.
    Error = 0x0003,
    /// Re-checking.
    Recovering = 0x0004,
    /// Emergency stop.
    StopAndOff = 0x0005,
    /// Sequencing a batch.
    Running = 0x0101,
}

impl StateId for LogicState {
    const ALL: &'static [Self] = &[
        Self::Connecting,
        Self::Idle,
        Self::Error,
        Self::Recovering,
        Self::StopAndOff,
        Self::Running,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Connecting => state::CONNECTING,
            Self::Idle => state::IDLE,
            Self::Error => state::ERROR,
            Self::Recovering => state::RECOVERING,
            Self::StopAndOff => state::STOP_AND_OFF,
            Self::Running => state::RUNNING,
        }
    }
}

/// Logic FSM events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicEvent {
    /// No transition.
    None,
    /// Robot and Device are READY.
    Connected,
    /// Batch finished, recovery succeeded or e-stop released.
    Done,
    /// Start recovery.
    Recover,
    /// Violation bitmask non-zero.
    ViolationDetect,
    /// Emergency stop.
    StopEmg,
    /// Batch accepted.
    Start,
}

impl EventId for LogicEvent {
    const NONE: Self = Self::None;

    fn name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Connected => "CONNECTED",
            Self::Done => "DONE",
            Self::Recover => "RECOVER",
            Self::ViolationDetect => "VIOLATION_DETECT",
            Self::StopEmg => "STOP_EMG",
            Self::Start => "START",
        }
    }
}

impl LifecycleEvent for LogicEvent {
    const CONNECTED: Self = Self::Connected;
    const DONE: Self = Self::Done;
    const RECOVER: Self = Self::Recover;
    const VIOLATION_DETECT: Self = Self::ViolationDetect;
    const STOP_EMG: Self = Self::StopEmg;
}

/// Logic machine definition.
#[derive(Debug)]
pub struct LogicFsm;

impl Machine for LogicFsm {
    type State = LogicState;
    type Event = LogicEvent;
    type Context = LogicContext;

    const NAME: &'static str = LOGIC_FSM;
    const ERROR_STATE: LogicState = LogicState::Error;
    const FAULT_EVENT: LogicEvent = LogicEvent::ViolationDetect;

    fn rules(table: &mut RuleTable<LogicState, LogicEvent>) -> FsmResult<()> {
        add_lifecycle_rules(
            table,
            LifecycleStates {
                connecting: LogicState::Connecting,
                ready: LogicState::Idle,
                error: LogicState::Error,
                recovering: LogicState::Recovering,
                stop_and_off: LogicState::StopAndOff,
            },
        )?;
        table.add(LogicState::Idle, LogicEvent::Start, LogicState::Running)?;
        table.add(LogicState::Running, LogicEvent::Done, LogicState::Idle)
    }

    fn strategy(state: LogicState) -> Box<dyn Strategy<Self>> {
        match state {
            LogicState::Connecting => Box::new(ConnectingStrategy::default()),
            LogicState::Idle => Box::new(strategies::IdleStrategy),
            LogicState::Running => Box::new(strategies::RunningStrategy::default()),
            LogicState::Error => Box::new(ErrorStrategy::default()),
            LogicState::Recovering => Box::new(RecoveringStrategy::default()),
            LogicState::StopAndOff => Box::new(StopAndOffStrategy),
        }
    }
}

/// Logic FSM starting in CONNECTING.
///
/// # Errors
/// Rule table construction failures.
pub fn logic_fsm(ctx: LogicContext) -> FsmResult<Fsm<LogicFsm>> {
    Fsm::new(LogicState::Connecting, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use cell_common::config::{LogicConfig, RecoveryConfig};
    use cell_common::keys;
    use cell_common::violation::Violation;
    use cell_store::{CommandConsumer, Params, SharedStore};
    use serde_json::{Value, json};

    struct Rig {
        fsm: Fsm<LogicFsm>,
        store: SharedStore,
        robot: CommandConsumer,
        device: CommandConsumer,
        served: Vec<(String, Params)>,
        fail_once: Vec<&'static str>,
    }

    fn rig_with(step_retries: u32) -> Rig {
        let store = SharedStore::new();
        let recovery = RecoveryConfig {
            settle_delay_ms: 0,
            ..RecoveryConfig::default()
        };
        let ctx = LogicContext::new(store.clone(), &LogicConfig { step_retries }, 10, recovery);
        let mut r = Rig {
            fsm: logic_fsm(ctx).unwrap(),
            robot: CommandConsumer::new(store.clone(), keys::ROBOT_COMMAND),
            device: CommandConsumer::new(store.clone(), keys::DEVICE_COMMAND),
            store,
            served: Vec::new(),
            fail_once: Vec::new(),
        };
        r.store.set(&keys::fsm_state(keys::ROBOT_FSM), "READY");
        r.store.set(&keys::fsm_state(keys::DEVICE_FSM), "READY");
        r.settle(1);
        assert_eq!(r.fsm.state(), LogicState::Idle);
        r
    }

    fn result_for(process: &str) -> Value {
        match process {
            "READ_QR" => json!({ "code": "SP-0007" }),
            "MEASURE_THICKNESS" => json!({ "thickness": 2.4 }),
            "START_TEST" => json!({ "MAX_LOAD": 12.5, "STATE": 0 }),
            _ => json!({}),
        }
    }

    impl Rig {
        fn settle(&mut self, ticks: usize) {
            for _ in 0..ticks {
                self.fsm.tick();
            }
        }

        /// Play Robot and Device: finish whatever is pending.
        fn serve(&mut self) {
            for consumer in [&self.robot, &self.device] {
                let Some(record) = consumer.pending().unwrap() else {
                    continue;
                };
                self.served.push((record.process.clone(), record.params.clone()));
                if let Some(pos) = self.fail_once.iter().position(|p| *p == record.process) {
                    self.fail_once.remove(pos);
                    consumer.fail(record.id, "simulated failure").unwrap();
                } else {
                    consumer.complete(record.id, Some(result_for(&record.process))).unwrap();
                }
            }
        }

        fn submit(&self, request: Value) {
            self.store.set(keys::BATCH_REQUEST, request);
        }

        fn run_batch(&mut self, max_ticks: usize) -> Value {
            for _ in 0..max_ticks {
                self.fsm.tick();
                if let Some(report) = self.store.get_opt(keys::BATCH_REPORT) {
                    return report;
                }
                self.serve();
            }
            panic!("no batch report after {max_ticks} ticks");
        }

        fn processes(&self) -> Vec<&str> {
            self.served.iter().map(|(p, _)| p.as_str()).collect()
        }
    }

    #[test]
    fn waits_for_robot_and_device() {
        let store = SharedStore::new();
        let ctx = LogicContext::new(store.clone(), &LogicConfig::default(), 10, RecoveryConfig::default());
        let mut fsm = logic_fsm(ctx).unwrap();
        store.set(&keys::fsm_state(keys::ROBOT_FSM), "READY");
        for _ in 0..3 {
            fsm.tick();
        }
        assert_eq!(fsm.state(), LogicState::Connecting);
        store.set(&keys::fsm_state(keys::DEVICE_FSM), "READY");
        fsm.tick();
        assert_eq!(fsm.state(), LogicState::Idle);
        assert_eq!(store.get_str(&keys::fsm_state(keys::LOGIC_FSM)).as_deref(), Some("IDLE"));
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let mut r = rig_with(1);
        for request in [json!({ "specimens": [] }), json!({ "specimens": [{ "floor": 12, "tpname": "A" }] }), json!("batch")] {
            r.store.clear(keys::BATCH_REPORT);
            r.submit(request.clone());
            r.settle(1);
            let report = r.store.get_opt(keys::BATCH_REPORT).unwrap();
            assert_eq!(report["status"], json!("rejected"), "{request}");
            assert!(r.store.is_empty_at(keys::BATCH_REQUEST));
            assert_eq!(r.fsm.state(), LogicState::Idle);
        }
        assert!(r.store.is_empty_at(keys::ROBOT_COMMAND));
    }

    #[test]
    fn sequences_one_specimen() {
        let mut r = rig_with(1);
        r.submit(json!({ "specimens": [{ "floor": 2, "tpname": "A1" }] }));
        let report = r.run_batch(200);

        assert_eq!(report["status"], json!("completed"));
        assert_eq!(report["steps_completed"], json!(14));
        assert_eq!(report["specimens"][0]["qr"], json!("SP-0007"));
        assert_eq!(report["specimens"][0]["test"]["MAX_LOAD"], json!(12.5));
        assert_eq!(
            r.processes(),
            vec![
                "MOVE_TO_HOME",
                "CHECK_TESTER",
                "MOVE_TO_RACK",
                "PICK_FROM_RACK",
                "PLACE_TO_GAUGE",
                "READ_QR",
                "MEASURE_THICKNESS",
                "PICK_FROM_GAUGE",
                "REGISTER_SPECIMEN",
                "LOAD_TESTER",
                "START_TEST",
                "UNLOAD_TESTER",
                "DISCARD_SCRAP",
                "MOVE_TO_HOME",
            ]
        );
        let (_, register) = &r.served[8];
        assert_eq!(register["TPNAME"], json!("A1"));
        assert_eq!(register["QR"], json!("SP-0007"));
        assert_eq!(register["THICKNESS"], json!(2.4));
        assert_eq!(r.served[2].1["target_floor"], json!(2));

        r.settle(1);
        assert_eq!(r.fsm.state(), LogicState::Idle);
    }

    #[test]
    fn failed_step_is_retried_after_returning_home() {
        let mut r = rig_with(1);
        r.fail_once.push("PICK_FROM_RACK");
        r.submit(json!({ "specimens": [{ "floor": 3, "tpname": "B2" }] }));
        let report = r.run_batch(300);
        assert_eq!(report["status"], json!("completed"));
        assert_eq!(
            &r.processes()[2..6],
            &["MOVE_TO_RACK", "PICK_FROM_RACK", "MOVE_TO_HOME", "PICK_FROM_RACK"]
        );
    }

    #[test]
    fn exhausted_retries_abort_and_latch() {
        let mut r = rig_with(0);
        r.fail_once.push("CHECK_TESTER");
        r.submit(json!({ "specimens": [{ "floor": 1, "tpname": "C3" }] }));
        let report = r.run_batch(50);
        assert_eq!(report["status"], json!("aborted"));
        assert!(report["reason"].as_str().unwrap_or_default().contains("CHECK_TESTER"));
        assert_eq!(report["steps_completed"], json!(1));
        assert_eq!(r.fsm.state(), LogicState::Error);
        assert!(r.fsm.context().core().violation().contains(Violation::COMMAND_FAILED));

        r.settle(10);
        assert_eq!(r.fsm.state(), LogicState::Idle);
        assert!(r.fsm.context().batch().is_none());
    }

    #[test]
    fn emergency_stop_aborts_and_withdraws_commands() {
        let mut r = rig_with(1);
        r.submit(json!({ "specimens": [{ "floor": 1, "tpname": "D4" }] }));
        r.settle(2);
        assert_eq!(r.fsm.state(), LogicState::Running);
        assert!(!r.store.is_empty_at(keys::ROBOT_COMMAND));

        r.store.set("io/di/emergency_stop", true);
        r.settle(2);
        assert_eq!(r.fsm.state(), LogicState::StopAndOff);
        assert!(r.store.is_empty_at(keys::ROBOT_COMMAND));
        let report = r.store.get_opt(keys::BATCH_REPORT).unwrap();
        assert_eq!(report["status"], json!("aborted"));

        r.store.set("io/di/emergency_stop", false);
        r.settle(3);
        assert_eq!(r.fsm.state(), LogicState::Idle);
    }

    #[test]
    fn progress_tracks_the_cursor() {
        let mut r = rig_with(1);
        r.submit(json!({ "specimens": [{ "floor": 2, "tpname": "A1" }] }));
        for _ in 0..40 {
            r.fsm.tick();
            let step = r.store.get(keys::BATCH_PROGRESS, Value::Null)["step"].as_u64();
            if step == Some(3) {
                assert_eq!(r.processes().last().copied(), Some("MOVE_TO_RACK"));
                return;
            }
            r.serve();
        }
        panic!("cursor never reached step 3");
    }
}
