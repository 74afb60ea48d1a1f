//! Batch requests, step expansion and reports.
//!
//! A batch names the specimens to test by rack floor and tester name. It
//! expands into a flat list of [`Step`]s, each addressed to the Robot or
//! the Device channel. Results of earlier steps (QR code, thickness, test
//! result) are collected per specimen and fed into later steps.

use cell_store::{Completion, Params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::process::{DeviceProcess, QR, RobotProcess, TARGET_FLOOR, THICKNESS, TPNAME};

/// One specimen of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Specimen {
    /// Rack floor holding the specimen.
    pub floor: u8,
    /// Name registered with the tester.
    pub tpname: String,
}

/// Payload of `batch/request`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Specimens in test order.
    pub specimens: Vec<Specimen>,
}

impl BatchRequest {
    /// Check the request against a rack of `rack_floors` floors.
    ///
    /// # Errors
    /// A human-readable reason for the rejection.
    pub fn validate(&self, rack_floors: u8) -> Result<(), String> {
        if self.specimens.is_empty() {
            return Err("batch has no specimens".into());
        }
        for (i, s) in self.specimens.iter().enumerate() {
            if s.floor == 0 || s.floor > rack_floors {
                return Err(format!(
                    "specimen {i}: floor {} outside 1..={rack_floors}",
                    s.floor
                ));
            }
            if s.tpname.trim().is_empty() {
                return Err(format!("specimen {i}: empty tpname"));
            }
            if self.specimens[..i].iter().any(|o| o.floor == s.floor) {
                return Err(format!("specimen {i}: floor {} listed twice", s.floor));
            }
        }
        Ok(())
    }
}

/// Channel a step is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// `command/robot`.
    Robot,
    /// `command/device`.
    Device,
}

/// Process of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepProcess {
    /// Served by the Robot FSM.
    Robot(RobotProcess),
    /// Served by the Device FSM.
    Device(DeviceProcess),
}

impl StepProcess {
    /// Channel this process is written to.
    pub fn target(self) -> Target {
        match self {
            Self::Robot(_) => Target::Robot,
            Self::Device(_) => Target::Device,
        }
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Robot(p) => p.as_str(),
            Self::Device(p) => p.as_str(),
        }
    }
}

impl fmt::Display for StepProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One command of the expanded batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// What to request.
    pub process: StepProcess,
    /// Index of the specimen the step works on.
    pub specimen: Option<usize>,
}

/// Step that returns the robot to HOME, used before each retry.
pub const UNDO_STEP: Step = Step {
    process: StepProcess::Robot(RobotProcess::MoveToHome),
    specimen: None,
};

const PER_SPECIMEN: [StepProcess; 11] = [
    StepProcess::Robot(RobotProcess::MoveToRack),
    StepProcess::Robot(RobotProcess::PickFromRack),
    StepProcess::Robot(RobotProcess::PlaceToGauge),
    StepProcess::Device(DeviceProcess::ReadQr),
    StepProcess::Device(DeviceProcess::MeasureThickness),
    StepProcess::Robot(RobotProcess::PickFromGauge),
    StepProcess::Device(DeviceProcess::RegisterSpecimen),
    StepProcess::Robot(RobotProcess::LoadTester),
    StepProcess::Device(DeviceProcess::StartTest),
    StepProcess::Robot(RobotProcess::UnloadTester),
    StepProcess::Robot(RobotProcess::DiscardScrap),
];

/// Expand a batch into its ordered steps.
pub fn expand(request: &BatchRequest) -> Vec<Step> {
    let mut steps = Vec::with_capacity(3 + request.specimens.len() * PER_SPECIMEN.len());
    steps.push(UNDO_STEP);
    steps.push(Step {
        process: StepProcess::Device(DeviceProcess::CheckTester),
        specimen: None,
    });
    for index in 0..request.specimens.len() {
        steps.extend(PER_SPECIMEN.iter().map(|&process| Step {
            process,
            specimen: Some(index),
        }));
    }
    steps.push(UNDO_STEP);
    steps
}

// ─── Reports ────────────────────────────────────────────────────────

/// What was learned about one specimen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecimenOutcome {
    /// Rack floor.
    pub floor: u8,
    /// Tester name.
    pub tpname: String,
    /// Scanned code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
    /// Measured thickness [mm].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thickness: Option<f64>,
    /// Parameters of the tester's TEST_RESULT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<Value>,
}

/// Final state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Every step succeeded.
    Completed,
    /// Stopped by a failure, a violation or an emergency stop.
    Aborted,
    /// The request was unusable.
    Rejected,
}

/// Payload of `batch/report`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Outcome.
    pub status: BatchStatus,
    /// Why the batch did not complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Steps that succeeded.
    pub steps_completed: usize,
    /// Steps of the expanded batch.
    pub total_steps: usize,
    /// Per-specimen results.
    pub specimens: Vec<SpecimenOutcome>,
}

impl BatchReport {
    /// Report for a request that never started.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            status: BatchStatus::Rejected,
            reason: Some(reason.into()),
            steps_completed: 0,
            total_steps: 0,
            specimens: Vec::new(),
        }
    }
}

/// Payload of `batch/progress`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Index of the current step.
    pub step: usize,
    /// Steps of the expanded batch.
    pub total: usize,
    /// Tester name of the current specimen.
    pub specimen: Option<String>,
    /// Process of the current step.
    pub process: Option<String>,
    /// Retries spent on the current step.
    pub retries: u32,
}

// ─── Run ────────────────────────────────────────────────────────────

/// A batch being sequenced.
#[derive(Debug, Clone)]
pub struct BatchRun {
    request: BatchRequest,
    steps: Vec<Step>,
    cursor: usize,
    retries: u32,
    outcomes: Vec<SpecimenOutcome>,
}

impl BatchRun {
    /// Start at the first step of `request`.
    pub fn new(request: BatchRequest) -> Self {
        let steps = expand(&request);
        let outcomes = request
            .specimens
            .iter()
            .map(|s| SpecimenOutcome {
                floor: s.floor,
                tpname: s.tpname.clone(),
                qr: None,
                thickness: None,
                test: None,
            })
            .collect();
        Self {
            request,
            steps,
            cursor: 0,
            retries: 0,
            outcomes,
        }
    }

    /// Index of the current step.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Specimens in the batch.
    pub fn specimen_count(&self) -> usize {
        self.request.specimens.len()
    }

    /// Expanded steps.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Current step, `None` once the batch is finished.
    pub fn current(&self) -> Option<Step> {
        self.steps.get(self.cursor).copied()
    }

    /// Retries spent on the current step.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Count one more retry of the current step.
    pub fn note_retry(&mut self) {
        self.retries += 1;
    }

    /// Parameters for `step`, filled from the request and earlier results.
    pub fn params_for(&self, step: Step) -> Params {
        let mut params = Params::new();
        let Some(index) = step.specimen else {
            return params;
        };
        let (Some(specimen), Some(outcome)) =
            (self.request.specimens.get(index), self.outcomes.get(index))
        else {
            return params;
        };
        match step.process {
            StepProcess::Robot(RobotProcess::MoveToRack | RobotProcess::PickFromRack) => {
                params.insert(TARGET_FLOOR.into(), specimen.floor.into());
            }
            StepProcess::Device(DeviceProcess::RegisterSpecimen) => {
                params.insert(TPNAME.into(), specimen.tpname.clone().into());
                if let Some(qr) = &outcome.qr {
                    params.insert(QR.into(), qr.clone().into());
                }
                if let Some(mm) = outcome.thickness {
                    params.insert(THICKNESS.into(), mm.into());
                }
            }
            StepProcess::Device(DeviceProcess::StartTest) => {
                params.insert(TPNAME.into(), specimen.tpname.clone().into());
            }
            _ => {}
        }
        params
    }

    /// Record the result of the current step and move to the next one.
    pub fn advance(&mut self, completion: &Completion) {
        if let Some(step) = self.current() {
            self.absorb(step, completion.result.as_ref());
        }
        self.cursor += 1;
        self.retries = 0;
    }

    fn absorb(&mut self, step: Step, result: Option<&Value>) {
        let (Some(index), Some(result)) = (step.specimen, result) else {
            return;
        };
        let Some(outcome) = self.outcomes.get_mut(index) else {
            return;
        };
        match step.process {
            StepProcess::Device(DeviceProcess::ReadQr) => {
                outcome.qr = result.get("code").and_then(Value::as_str).map(str::to_string);
            }
            StepProcess::Device(DeviceProcess::MeasureThickness) => {
                outcome.thickness = result.get("thickness").and_then(Value::as_f64);
            }
            StepProcess::Device(DeviceProcess::StartTest) => {
                outcome.test = Some(result.clone());
            }
            _ => {}
        }
    }

    /// Snapshot for `batch/progress`.
    pub fn progress(&self) -> BatchProgress {
        let step = self.current();
        BatchProgress {
            step: self.cursor,
            total: self.steps.len(),
            specimen: step
                .and_then(|s| s.specimen)
                .and_then(|i| self.request.specimens.get(i))
                .map(|s| s.tpname.clone()),
            process: step.map(|s| s.process.to_string()),
            retries: self.retries,
        }
    }

    /// Final report.
    pub fn report(&self, status: BatchStatus, reason: Option<String>) -> BatchReport {
        BatchReport {
            status,
            reason,
            steps_completed: self.cursor,
            total_steps: self.steps.len(),
            specimens: self.outcomes.clone(),
        }
    }
}
