//! IDLE and RUNNING strategies of the Logic FSM.

use cell_common::keys;
use cell_common::violation::Violation;
use cell_store::StoreError;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::engine::Strategy;
use crate::error::FsmResult;
use crate::lifecycle::check_guards;
use crate::logic::batch::{BatchReport, BatchRequest, BatchRun, Step, UNDO_STEP};
use crate::logic::{LogicContext, LogicEvent, LogicFsm};
use crate::rules::EventId;

// ─── IDLE ───────────────────────────────────────────────────────────

/// Waits for `batch/request` and starts it.
#[derive(Debug, Default)]
pub struct IdleStrategy;

impl Strategy<LogicFsm> for IdleStrategy {
    fn operate(&mut self, ctx: &mut LogicContext) -> FsmResult<LogicEvent> {
        if let Some(event) = check_guards(ctx) {
            return Ok(event);
        }

        // Taken in one step so a request is started at most once.
        let raw = ctx
            .core()
            .store()
            .update(keys::BATCH_REQUEST, |slot| slot.take());
        if raw.is_null() {
            return Ok(LogicEvent::None);
        }

        let request = match serde_json::from_value::<BatchRequest>(raw) {
            Ok(request) => request,
            Err(e) => {
                reject(ctx, format!("malformed batch request: {e}"));
                return Ok(LogicEvent::None);
            }
        };
        if let Err(reason) = request.validate(ctx.rack_floors()) {
            reject(ctx, reason);
            return Ok(LogicEvent::None);
        }
        ctx.start_batch(BatchRun::new(request));
        Ok(LogicEvent::Start)
    }
}

fn reject(ctx: &LogicContext, reason: String) {
    warn!(reason = %reason, "Batch request rejected");
    ctx.publish_report(&BatchReport::rejected(reason));
}

// ─── RUNNING ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Awaiting {
    step: Step,
    undo: bool,
}

/// Issues the batch steps one at a time and waits for each completion.
///
/// A failed step is retried after a return to HOME, up to
/// `logic.step_retries` times; beyond that the batch is aborted and
/// `COMMAND_FAILED` is latched.
#[derive(Debug, Default)]
pub struct RunningStrategy {
    awaiting: Option<Awaiting>,
    undo_pending: bool,
    busy_reported: bool,
}

impl Strategy<LogicFsm> for RunningStrategy {
    fn prepare(&mut self, _ctx: &mut LogicContext) -> FsmResult<()> {
        self.awaiting = None;
        self.undo_pending = false;
        self.busy_reported = false;
        Ok(())
    }

    fn operate(&mut self, ctx: &mut LogicContext) -> FsmResult<LogicEvent> {
        if let Some(event) = check_guards(ctx) {
            return Ok(event);
        }
        match self.awaiting {
            None => self.issue_next(ctx),
            Some(awaiting) => self.await_completion(ctx, awaiting),
        }
    }

    fn exit(&mut self, ctx: &mut LogicContext, event: LogicEvent) -> FsmResult<()> {
        if event != LogicEvent::Done && ctx.batch().is_some() {
            let violation = ctx.core().violation();
            let reason = if violation.is_empty() {
                format!("interrupted by {}", event.name())
            } else {
                format!("interrupted by {violation}")
            };
            ctx.abort_batch(&reason);
        }
        self.awaiting = None;
        Ok(())
    }
}

impl RunningStrategy {
    fn issue_next(&mut self, ctx: &mut LogicContext) -> FsmResult<LogicEvent> {
        let Some(run) = ctx.batch() else {
            return Ok(LogicEvent::Done);
        };
        let (step, undo) = if self.undo_pending {
            (UNDO_STEP, true)
        } else {
            match run.current() {
                Some(step) => (step, false),
                None => {
                    ctx.finish_batch();
                    return Ok(LogicEvent::Done);
                }
            }
        };
        let params = if undo { Default::default() } else { run.params_for(step) };
        let target = step.process.target();

        match ctx.producer(target).issue(step.process.as_str(), params) {
            Ok(id) => {
                debug!(id, process = %step.process, undo, "Step issued");
                self.awaiting = Some(Awaiting { step, undo });
                self.busy_reported = false;
                if !undo {
                    ctx.publish_progress();
                }
                Ok(LogicEvent::None)
            }
            // A record left over from an aborted batch; the consumer or a
            // cancel clears it.
            Err(StoreError::ChannelBusy { key, id }) => {
                if !self.busy_reported {
                    warn!(%key, id, "Command channel busy, waiting");
                    self.busy_reported = true;
                }
                Ok(LogicEvent::None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn await_completion(
        &mut self,
        ctx: &mut LogicContext,
        awaiting: Awaiting,
    ) -> FsmResult<LogicEvent> {
        let target = awaiting.step.process.target();
        let outcome = match ctx.producer(target).poll_completion() {
            Ok(None) => return Ok(LogicEvent::None),
            Ok(Some(completion)) => Ok(completion),
            // The record vanished or was replaced; treat it as a failure.
            Err(e @ StoreError::StaleRecord { .. }) => Err(e.to_string()),
            Err(e) => return Err(e.into()),
        };
        self.awaiting = None;

        let reason = match outcome {
            Ok(completion) if completion.is_success() => {
                if awaiting.undo {
                    self.undo_pending = false;
                    debug!("Returned HOME, retrying step");
                } else if let Some(run) = ctx.batch_mut() {
                    run.advance(&completion);
                    info!(
                        step = run.cursor(),
                        total = run.steps().len(),
                        process = %awaiting.step.process,
                        "Step done"
                    );
                    ctx.publish_progress();
                }
                return Ok(LogicEvent::None);
            }
            Ok(completion) => completion.reason().unwrap_or("no reason given").to_string(),
            Err(reason) => reason,
        };

        warn!(process = %awaiting.step.process, undo = awaiting.undo, reason = %reason, "Step failed");
        let retries = ctx.batch().map_or(0, BatchRun::retries);
        if !awaiting.undo && retries < ctx.step_retries() {
            if let Some(run) = ctx.batch_mut() {
                run.note_retry();
            }
            self.undo_pending = true;
            ctx.publish_progress();
            return Ok(LogicEvent::None);
        }

        ctx.core_mut().latch(Violation::COMMAND_FAILED);
        ctx.abort_batch(&format!("{} failed: {reason}", awaiting.step.process));
        Ok(LogicEvent::ViolationDetect)
    }
}
