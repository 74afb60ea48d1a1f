//! Validation of device command records.

use cell_common::io::DoRole;
use cell_hal::TesterMessage;
use cell_store::CommandRecord;
use serde_json::Value;
use std::time::Duration;

use crate::error::{FsmError, FsmResult};
use crate::process::{DeviceProcess, INDEX, ROLE, TPNAME, VALUE};

/// What a device command asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceAction {
    /// One gauge reading.
    Measure,
    /// One QR read.
    ReadQr,
    /// One request/reply exchange with the tester.
    Tester {
        /// Message to send
        request: TesterMessage,
    },
    /// Write one digital output.
    SetOutput {
        /// Output index
        index: usize,
        /// Level
        value: bool,
    },
}

/// A validated device command.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceJob {
    /// Correlation id of the record.
    pub id: u64,
    /// Requested process.
    pub process: DeviceProcess,
    /// Validated action.
    pub action: DeviceAction,
}

impl DeviceJob {
    /// Validate `record` against a rack of `do_count` outputs.
    ///
    /// # Errors
    /// [`FsmError::InvalidParams`] for unknown processes and unusable
    /// parameters.
    pub fn parse(record: &CommandRecord, do_count: usize) -> FsmResult<Self> {
        let process: DeviceProcess = record.process.parse()?;
        let action = match process {
            DeviceProcess::MeasureThickness => DeviceAction::Measure,
            DeviceProcess::ReadQr => DeviceAction::ReadQr,
            DeviceProcess::CheckTester => DeviceAction::Tester {
                request: TesterMessage::new("ARE_YOU_THERE"),
            },
            DeviceProcess::RegisterSpecimen => {
                match record.param_str(TPNAME) {
                    Some(name) if !name.is_empty() => {}
                    _ => return Err(FsmError::invalid(process.as_str(), "missing TPNAME")),
                }
                DeviceAction::Tester {
                    request: with_params(TesterMessage::new("ASK_REGISTER"), record),
                }
            }
            DeviceProcess::StartTest => DeviceAction::Tester {
                request: with_params(TesterMessage::new("START_TEST"), record),
            },
            DeviceProcess::SetOutput => output_action(process, record, do_count)?,
        };
        Ok(Self {
            id: record.id,
            process,
            action,
        })
    }

    /// How long to wait for the tester's reply.
    pub fn reply_timeout(&self, reply: Duration, test: Duration) -> Duration {
        match self.process {
            DeviceProcess::StartTest => test,
            _ => reply,
        }
    }
}

fn with_params(message: TesterMessage, record: &CommandRecord) -> TesterMessage {
    record
        .params
        .iter()
        .fold(message, |msg, (key, value)| msg.with(key.clone(), value.clone()))
}

fn output_action(
    process: DeviceProcess,
    record: &CommandRecord,
    do_count: usize,
) -> FsmResult<DeviceAction> {
    let invalid = |reason: String| FsmError::invalid(process.as_str(), reason);

    let index = match (record.param_str(ROLE), record.param(INDEX)) {
        (Some(name), _) => name.parse::<DoRole>().map_err(invalid)?.index(),
        (None, Some(Value::Number(n))) => n
            .as_u64()
            .and_then(|i| usize::try_from(i).ok())
            .ok_or_else(|| invalid(format!("bad index {n}")))?,
        _ => return Err(invalid("missing role or index".into())),
    };
    if index >= do_count {
        return Err(invalid(format!("index {index} outside 0..{do_count}")));
    }
    if let Some(role) = DoRole::ALL.into_iter().find(|r| r.index() == index) {
        if role.is_indicator() {
            return Err(invalid(format!("{role} is driven by the lamp controller")));
        }
    }
    let value = record
        .param_bool(VALUE)
        .ok_or_else(|| invalid("missing boolean value".into()))?;
    Ok(DeviceAction::SetOutput { index, value })
}
