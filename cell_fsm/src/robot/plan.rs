//! Expansion of robot processes into motion plans.

use cell_store::CommandRecord;

use crate::error::{FsmError, FsmResult};
use crate::motion::{
    GAUGE_FRONT, GAUGE_PICK, GAUGE_PLACE, HOME, MotionCatalogue, SCRAP_DROP, SCRAP_FRONT,
    TESTER_FRONT, TESTER_LOAD, TESTER_LOAD_APPROACH, TESTER_UNLOAD, TESTER_UNLOAD_APPROACH,
    rack_front, rack_pick,
};
use crate::process::{RobotProcess, TARGET_FLOOR};

/// Motion ids of `process`, in dispatch order.
///
/// `current` is the known robot position; `MOVE_TO_HOME` leaves an
/// intra-station position along its chain before heading home. Every
/// station plan starts at the station front, so a plan stays valid from
/// any waypoint, including HOME after an undo.
///
/// # Errors
/// [`FsmError::InvalidParams`] for a missing or out-of-range floor.
pub fn plan(
    process: RobotProcess,
    record: &CommandRecord,
    catalogue: &MotionCatalogue,
    current: Option<i64>,
) -> FsmResult<Vec<i64>> {
    let steps = match process {
        RobotProcess::MoveToHome => {
            let mut steps = current
                .map(|at| catalogue.path_to_waypoint(at))
                .unwrap_or_default();
            steps.push(HOME);
            steps
        }
        RobotProcess::MoveToRack => vec![rack_front(target_floor(process, record, catalogue)?)],
        RobotProcess::PickFromRack => {
            let floor = target_floor(process, record, catalogue)?;
            vec![rack_front(floor), rack_pick(floor), rack_front(floor)]
        }
        RobotProcess::PlaceToGauge => vec![GAUGE_FRONT, GAUGE_PLACE, GAUGE_FRONT],
        RobotProcess::PickFromGauge => vec![GAUGE_FRONT, GAUGE_PICK, GAUGE_FRONT],
        RobotProcess::LoadTester => {
            vec![TESTER_FRONT, TESTER_LOAD_APPROACH, TESTER_LOAD, TESTER_FRONT]
        }
        RobotProcess::UnloadTester => {
            vec![TESTER_FRONT, TESTER_UNLOAD_APPROACH, TESTER_UNLOAD, TESTER_FRONT]
        }
        RobotProcess::DiscardScrap => vec![SCRAP_FRONT, SCRAP_DROP, SCRAP_FRONT],
    };
    Ok(steps)
}

fn target_floor(
    process: RobotProcess,
    record: &CommandRecord,
    catalogue: &MotionCatalogue,
) -> FsmResult<u8> {
    let floor = record
        .param_i64(TARGET_FLOOR)
        .ok_or_else(|| FsmError::invalid(process.as_str(), "missing integer target_floor"))?;
    if !catalogue.has_floor(floor) {
        return Err(FsmError::invalid(
            process.as_str(),
            format!("floor {floor} outside 1..={}", catalogue.rack_floors()),
        ));
    }
    u8::try_from(floor).map_err(|_| FsmError::invalid(process.as_str(), "floor out of range"))
}

/// A command being executed as a sequence of motions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotJob {
    /// Correlation id of the command record.
    pub id: u64,
    /// Requested process.
    pub process: RobotProcess,
    steps: Vec<i64>,
    next: usize,
}

impl RobotJob {
    /// Job over a computed plan.
    pub fn new(id: u64, process: RobotProcess, steps: Vec<i64>) -> Self {
        Self {
            id,
            process,
            steps,
            next: 0,
        }
    }

    /// Motion to dispatch next.
    pub fn next_step(&self) -> Option<i64> {
        self.steps.get(self.next).copied()
    }

    /// Mark the current step finished.
    pub fn advance(&mut self) {
        self.next = (self.next + 1).min(self.steps.len());
    }

    /// Whole plan.
    pub fn steps(&self) -> &[i64] {
        &self.steps
    }

    /// Steps finished so far.
    pub fn completed(&self) -> usize {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cell_store::{CommandState, Params};
    use serde_json::json;

    fn record(params: serde_json::Value) -> CommandRecord {
        let params: Params = params.as_object().cloned().unwrap_or_default();
        CommandRecord {
            id: 1,
            process: "X".into(),
            params,
            state: CommandState::Pending,
            is_done: false,
            result: None,
        }
    }

    fn catalogue() -> MotionCatalogue {
        MotionCatalogue::new(5)
    }

    #[test]
    fn rack_motions_use_floor() {
        let r = record(json!({ "target_floor": 2 }));
        assert_eq!(plan(RobotProcess::MoveToRack, &r, &catalogue(), Some(HOME)).unwrap(), vec![1020]);
        assert_eq!(
            plan(RobotProcess::PickFromRack, &r, &catalogue(), Some(1020)).unwrap(),
            vec![1020, 1021, 1020]
        );
    }

    #[test]
    fn bad_floor_is_rejected() {
        for params in [json!({}), json!({ "target_floor": 0 }), json!({ "target_floor": 6 }), json!({ "target_floor": "2" })] {
            let err = plan(RobotProcess::MoveToRack, &record(params), &catalogue(), Some(HOME)).unwrap_err();
            assert!(matches!(err, FsmError::InvalidParams { .. }));
        }
    }

    #[test]
    fn home_leaves_station_chain_first() {
        let r = record(json!({}));
        assert_eq!(plan(RobotProcess::MoveToHome, &r, &catalogue(), Some(HOME)).unwrap(), vec![HOME]);
        assert_eq!(
            plan(RobotProcess::MoveToHome, &r, &catalogue(), Some(GAUGE_PLACE)).unwrap(),
            vec![GAUGE_FRONT, HOME]
        );
        assert_eq!(
            plan(RobotProcess::MoveToHome, &r, &catalogue(), Some(rack_pick(3))).unwrap(),
            vec![rack_front(3), HOME]
        );
        assert_eq!(plan(RobotProcess::MoveToHome, &r, &catalogue(), None).unwrap(), vec![HOME]);
    }

    #[test]
    fn station_plans_follow_allowed_edges() {
        let cat = catalogue();
        let r = record(json!({ "target_floor": 3 }));
        for process in [
            RobotProcess::PickFromRack,
            RobotProcess::PlaceToGauge,
            RobotProcess::PickFromGauge,
            RobotProcess::LoadTester,
            RobotProcess::UnloadTester,
            RobotProcess::DiscardScrap,
        ] {
            let steps = plan(process, &r, &cat, Some(HOME)).unwrap();
            let mut at = HOME;
            for step in steps {
                assert!(cat.is_allowed(at, step), "{process}: {at} -> {step}");
                at = step;
            }
            assert!(cat.is_waypoint(at));
        }
    }

    #[test]
    fn job_advances_through_steps() {
        let mut job = RobotJob::new(7, RobotProcess::PickFromRack, vec![1021, 1020]);
        assert_eq!(job.next_step(), Some(1021));
        job.advance();
        assert_eq!(job.next_step(), Some(1020));
        job.advance();
        job.advance();
        assert_eq!(job.next_step(), None);
        assert_eq!(job.completed(), 2);
    }
}
