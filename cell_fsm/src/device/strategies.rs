//! Work strategies of the Device FSM.

use cell_common::violation::Violation;
use cell_hal::{HalError, TesterMessage};
use cell_store::StoreError;
use serde_json::{Value, json};
use std::time::Instant;
use tracing::{debug, warn};

use crate::context::Context;
use crate::device::job::{DeviceAction, DeviceJob};
use crate::device::{DeviceContext, DeviceEvent, DeviceFsm};
use crate::engine::Strategy;
use crate::error::FsmResult;
use crate::lifecycle::check_guards;
use crate::process::DeviceProcess;
use crate::rules::EventId;

/// Fail the current job when a work state is left for any reason but DONE.
fn fail_if_interrupted(ctx: &mut DeviceContext, event: DeviceEvent) {
    if event == DeviceEvent::Done || ctx.job().is_none() {
        return;
    }
    let violation = ctx.core().violation();
    let reason = if violation.is_empty() {
        format!("interrupted by {}", event.name())
    } else {
        format!("interrupted by {violation}")
    };
    ctx.fail_job(&reason);
}

// ─── READY ──────────────────────────────────────────────────────────

/// Waits for a command and routes it to a work state.
#[derive(Debug, Default)]
pub struct ReadyStrategy {
    malformed_reported: bool,
}

impl Strategy<DeviceFsm> for ReadyStrategy {
    fn operate(&mut self, ctx: &mut DeviceContext) -> FsmResult<DeviceEvent> {
        if let Some(event) = check_guards(ctx) {
            return Ok(event);
        }

        let record = match ctx.commands().pending() {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.malformed_reported = false;
                return Ok(DeviceEvent::None);
            }
            Err(e @ StoreError::MalformedRecord { .. }) => {
                if !self.malformed_reported {
                    warn!(error = %e, "Ignoring malformed device command");
                    self.malformed_reported = true;
                }
                return Ok(DeviceEvent::None);
            }
            Err(e) => return Err(e.into()),
        };

        match DeviceJob::parse(&record, ctx.do_count()) {
            Ok(job) => {
                let event = match job.action {
                    DeviceAction::Measure => DeviceEvent::Measure,
                    DeviceAction::ReadQr => DeviceEvent::Scan,
                    DeviceAction::Tester { .. } => DeviceEvent::Test,
                    DeviceAction::SetOutput { .. } => DeviceEvent::Switch,
                };
                ctx.begin_job(job);
                Ok(event)
            }
            Err(e) => {
                ctx.reject(record.id, &e.to_string());
                Ok(DeviceEvent::None)
            }
        }
    }
}

// ─── MEASURING / SCANNING ───────────────────────────────────────────

/// One gauge reading.
#[derive(Debug, Default)]
pub struct MeasuringStrategy;

impl Strategy<DeviceFsm> for MeasuringStrategy {
    fn operate(&mut self, ctx: &mut DeviceContext) -> FsmResult<DeviceEvent> {
        if let Some(event) = check_guards(ctx) {
            return Ok(event);
        }
        match ctx.measure() {
            Ok(thickness) => {
                ctx.complete_job(json!({ "thickness": thickness }));
                Ok(DeviceEvent::Done)
            }
            // Retried until the counter trips the guard.
            Err(e) if e.is_comm() => Ok(DeviceEvent::None),
            Err(e) => {
                ctx.fail_job(&e.to_string());
                Ok(DeviceEvent::Done)
            }
        }
    }

    fn exit(&mut self, ctx: &mut DeviceContext, event: DeviceEvent) -> FsmResult<()> {
        fail_if_interrupted(ctx, event);
        Ok(())
    }
}

/// One QR read.
#[derive(Debug, Default)]
pub struct ScanningStrategy;

impl Strategy<DeviceFsm> for ScanningStrategy {
    fn operate(&mut self, ctx: &mut DeviceContext) -> FsmResult<DeviceEvent> {
        if let Some(event) = check_guards(ctx) {
            return Ok(event);
        }
        match ctx.read_code() {
            Ok(code) => {
                ctx.complete_job(json!({ "code": code }));
                Ok(DeviceEvent::Done)
            }
            Err(e) if e.is_comm() => Ok(DeviceEvent::None),
            Err(e) => {
                ctx.fail_job(&e.to_string());
                Ok(DeviceEvent::Done)
            }
        }
    }

    fn exit(&mut self, ctx: &mut DeviceContext, event: DeviceEvent) -> FsmResult<()> {
        fail_if_interrupted(ctx, event);
        Ok(())
    }
}

// ─── TESTING ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exchange {
    Send,
    Await { deadline: Instant },
}

/// One request/reply exchange with the tester.
#[derive(Debug)]
pub struct TestingStrategy {
    exchange: Exchange,
}

impl Default for TestingStrategy {
    fn default() -> Self {
        Self {
            exchange: Exchange::Send,
        }
    }
}

impl Strategy<DeviceFsm> for TestingStrategy {
    fn prepare(&mut self, _ctx: &mut DeviceContext) -> FsmResult<()> {
        self.exchange = Exchange::Send;
        Ok(())
    }

    fn operate(&mut self, ctx: &mut DeviceContext) -> FsmResult<DeviceEvent> {
        if let Some(event) = check_guards(ctx) {
            return Ok(event);
        }
        let Some(job) = ctx.job() else {
            return Ok(DeviceEvent::Done);
        };
        let DeviceAction::Tester { request } = &job.action else {
            ctx.fail_job("not a tester exchange");
            return Ok(DeviceEvent::Done);
        };

        match self.exchange {
            Exchange::Send => {
                let request = request.clone();
                match ctx.tester_send(&request) {
                    Ok(()) => {
                        self.exchange = Exchange::Await {
                            deadline: Instant::now() + ctx.exchange_timeout(),
                        };
                        Ok(DeviceEvent::None)
                    }
                    Err(e) if e.is_comm() => Ok(DeviceEvent::None),
                    Err(e) => {
                        ctx.fail_job(&e.to_string());
                        Ok(DeviceEvent::Done)
                    }
                }
            }
            Exchange::Await { deadline } => match ctx.tester_poll() {
                Ok(Some(reply)) => Ok(handle_reply(ctx, reply)),
                Ok(None) if Instant::now() >= deadline => {
                    ctx.tester_silent();
                    ctx.fail_job("no reply from tester");
                    Ok(DeviceEvent::Done)
                }
                Ok(None) => Ok(DeviceEvent::None),
                Err(HalError::Protocol(e)) => {
                    ctx.core_mut().latch(Violation::TESTER_PROTOCOL);
                    ctx.fail_job(&format!("tester protocol: {e}"));
                    Ok(DeviceEvent::ViolationDetect)
                }
                Err(e) if e.is_comm() => Ok(DeviceEvent::None),
                Err(e) => Err(e.into()),
            },
        }
    }

    fn exit(&mut self, ctx: &mut DeviceContext, event: DeviceEvent) -> FsmResult<()> {
        fail_if_interrupted(ctx, event);
        Ok(())
    }
}

fn tester_state(reply: &TesterMessage) -> i64 {
    match reply.get("STATE") {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(-1),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(-1),
        Some(_) => -1,
        None => 0,
    }
}

fn handle_reply(ctx: &mut DeviceContext, reply: TesterMessage) -> DeviceEvent {
    let Some(process) = ctx.job().map(|job| job.process) else {
        return DeviceEvent::Done;
    };
    match (process, reply.kind.as_str()) {
        (DeviceProcess::CheckTester, "I_AM_HERE") | (DeviceProcess::StartTest, "TEST_RESULT") => {
            let state = tester_state(&reply);
            if state != 0 {
                ctx.core_mut().latch(Violation::TESTER_STATE);
                ctx.fail_job(&format!("tester reports state {state}"));
                return DeviceEvent::ViolationDetect;
            }
            ctx.complete_job(reply.params_json());
            DeviceEvent::Done
        }
        (DeviceProcess::RegisterSpecimen, "REGISTER_OK") => {
            ctx.complete_job(reply.params_json());
            DeviceEvent::Done
        }
        (DeviceProcess::RegisterSpecimen, "REGISTER_NG") => {
            let name = reply.get_str("TPNAME").unwrap_or_default().to_string();
            ctx.fail_job(&format!("tester refused registration of {name:?}"));
            DeviceEvent::Done
        }
        (_, kind) => {
            warn!(%process, kind, "Unexpected tester message ignored");
            DeviceEvent::None
        }
    }
}

// ─── SWITCHING ──────────────────────────────────────────────────────

/// Writes one digital output.
#[derive(Debug, Default)]
pub struct SwitchingStrategy;

impl Strategy<DeviceFsm> for SwitchingStrategy {
    fn operate(&mut self, ctx: &mut DeviceContext) -> FsmResult<DeviceEvent> {
        if let Some(event) = check_guards(ctx) {
            return Ok(event);
        }
        let Some(&DeviceAction::SetOutput { index, value }) = ctx.job().map(|job| &job.action) else {
            ctx.fail_job("not an output write");
            return Ok(DeviceEvent::Done);
        };
        match ctx.set_output(index, value) {
            Ok(()) => {
                debug!(index, value, "Output written");
                ctx.complete_job(json!({ "index": index, "value": value }));
            }
            Err(e) => ctx.fail_job(&e.to_string()),
        }
        Ok(DeviceEvent::Done)
    }

    fn exit(&mut self, ctx: &mut DeviceContext, event: DeviceEvent) -> FsmResult<()> {
        fail_if_interrupted(ctx, event);
        Ok(())
    }
}
