//! Lifecycle strategies shared by every cell machine.
//!
//! ```text
//! CONNECTING ──CONNECTED──► READY/IDLE ⇄ work states
//!      ▲                        │
//!      │                 VIOLATION_DETECT (from any state)
//!      │                        ▼
//!      │                     ERROR ──RECOVER──► RECOVERING ──DONE──► READY/IDLE
//!      │                        ▲                   │
//!      │                        └─VIOLATION_DETECT──┘
//!      │
//! STOP_AND_OFF ◄──STOP_EMG── (any state)
//!      └──DONE (e-stop released)──► CONNECTING
//! ```
//!
//! The strategies here are generic over any machine whose context
//! implements [`CellContext`] and whose events implement
//! [`LifecycleEvent`].

use cell_common::violation::Violation;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::context::Context;
use crate::engine::{Machine, Strategy};
use crate::error::FsmResult;
use crate::rules::{EventId, RuleTable, StateId};
use crate::violation::log_violation;

/// Events every cell machine understands.
pub trait LifecycleEvent: EventId {
    /// Collaborators reachable.
    const CONNECTED: Self;
    /// Current activity finished.
    const DONE: Self;
    /// Leave ERROR for RECOVERING.
    const RECOVER: Self;
    /// Violation bitmask non-zero.
    const VIOLATION_DETECT: Self;
    /// Emergency stop input active.
    const STOP_EMG: Self;
}

/// Domain hooks the lifecycle strategies need.
pub trait CellContext: Context {
    /// Try to reach every collaborator. `Ok(false)` means "not yet".
    fn connect(&mut self) -> FsmResult<bool>;

    /// One reconnect attempt for a single communication bit.
    fn reconnect(&mut self, bit: Violation) -> FsmResult<()>;

    /// Clear non-communication faults before the recovery re-check.
    fn reset_faults(&mut self, _snapshot: Violation) -> FsmResult<()> {
        self.core_mut().clear_latched();
        Ok(())
    }

    /// Refresh sensed inputs and status flags.
    fn sense(&mut self);

    /// Bitmask computed from the current inputs and latched faults only.
    /// Calling it twice without new input returns the same value.
    fn check_violation(&self) -> Violation;

    /// Put outputs in a safe state and abandon in-flight work.
    fn enter_safe_state(&mut self);
}

/// Emergency stop first, violation bitmask second.
///
/// Refreshes inputs, stores the computed bitmask in the core and returns
/// the event the calling strategy must emit, if any.
pub fn check_guards<C, E>(ctx: &mut C) -> Option<E>
where
    C: CellContext,
    E: LifecycleEvent,
{
    ctx.core_mut().sense_emergency_stop();
    ctx.sense();
    let violation = ctx.check_violation();
    ctx.core_mut().set_violation(violation);
    if ctx.core().emergency_stop() {
        Some(E::STOP_EMG)
    } else if !violation.is_empty() {
        Some(E::VIOLATION_DETECT)
    } else {
        None
    }
}

/// Lifecycle states of one machine.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleStates<S> {
    /// Waiting for collaborators.
    pub connecting: S,
    /// Idle state reached after connecting or recovering.
    pub ready: S,
    /// Violation present.
    pub error: S,
    /// Reconnect and re-check.
    pub recovering: S,
    /// Emergency stop.
    pub stop_and_off: S,
}

/// Add the lifecycle transitions to `table`.
///
/// # Errors
/// Duplicate rules.
pub fn add_lifecycle_rules<S, E>(
    table: &mut RuleTable<S, E>,
    states: LifecycleStates<S>,
) -> FsmResult<()>
where
    S: StateId,
    E: LifecycleEvent,
{
    table.add(states.connecting, E::CONNECTED, states.ready)?;
    table.add(states.error, E::RECOVER, states.recovering)?;
    table.add(states.recovering, E::DONE, states.ready)?;
    table.add(states.stop_and_off, E::DONE, states.connecting)?;
    table.add_from_any(E::VIOLATION_DETECT, states.error)?;
    table.add_from_any(E::STOP_EMG, states.stop_and_off)
}

// ─── CONNECTING ─────────────────────────────────────────────────────

/// Retries `connect()` every tick until it succeeds.
#[derive(Debug, Default)]
pub struct ConnectingStrategy {
    attempts: u64,
}

impl<M> Strategy<M> for ConnectingStrategy
where
    M: Machine,
    M::Context: CellContext,
    M::Event: LifecycleEvent,
{
    fn prepare(&mut self, ctx: &mut M::Context) -> FsmResult<()> {
        self.attempts = 0;
        info!(fsm = ctx.core().fsm(), "Connecting");
        Ok(())
    }

    fn operate(&mut self, ctx: &mut M::Context) -> FsmResult<M::Event> {
        ctx.core_mut().sense_emergency_stop();
        if ctx.core().emergency_stop() {
            return Ok(M::Event::STOP_EMG);
        }

        self.attempts += 1;
        match ctx.connect() {
            Ok(true) => {
                info!(fsm = ctx.core().fsm(), attempts = self.attempts, "Connected");
                Ok(M::Event::CONNECTED)
            }
            Ok(false) => Ok(M::Event::NONE),
            Err(e) => {
                if self.attempts <= 3 || self.attempts % 1000 == 0 {
                    warn!(
                        fsm = ctx.core().fsm(),
                        attempts = self.attempts,
                        error = %e,
                        "Connect failed"
                    );
                }
                Ok(M::Event::NONE)
            }
        }
    }
}

// ─── ERROR ──────────────────────────────────────────────────────────

/// Logs the violation and hands over to RECOVERING.
///
/// When a recovery attempt budget is configured and used up, the state
/// holds until `cmd/<fsm>/reset` is set.
#[derive(Debug, Default)]
pub struct ErrorStrategy {
    holding: bool,
}

impl<M> Strategy<M> for ErrorStrategy
where
    M: Machine,
    M::Context: CellContext,
    M::Event: LifecycleEvent,
{
    fn prepare(&mut self, ctx: &mut M::Context) -> FsmResult<()> {
        let core = ctx.core();
        log_violation(core.fsm(), core.violation());
        self.holding = core.recovery_exhausted();
        if self.holding {
            error!(
                fsm = core.fsm(),
                attempts = core.failed_recoveries(),
                "Recovery attempts exhausted, waiting for operator reset"
            );
        }
        Ok(())
    }

    fn operate(&mut self, ctx: &mut M::Context) -> FsmResult<M::Event> {
        ctx.core_mut().sense_emergency_stop();
        if ctx.core().emergency_stop() {
            return Ok(M::Event::STOP_EMG);
        }
        if self.holding {
            if !ctx.core().take_reset_request() {
                return Ok(M::Event::NONE);
            }
            ctx.core_mut().reset_recovery();
        }
        Ok(M::Event::RECOVER)
    }
}

// ─── RECOVERING ─────────────────────────────────────────────────────

/// Current step of a recovery round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStep {
    /// Reconnect every communication bit of the snapshot.
    Reconnect,
    /// Wait for the settle delay.
    Settle {
        /// End of the wait
        until: Instant,
    },
    /// Re-sense and re-check.
    Recheck,
}

/// One round of targeted reconnection followed by a re-check.
#[derive(Debug)]
pub struct RecoveringStrategy {
    step: RecoveryStep,
    snapshot: Violation,
}

impl Default for RecoveringStrategy {
    fn default() -> Self {
        Self {
            step: RecoveryStep::Reconnect,
            snapshot: Violation::empty(),
        }
    }
}

impl RecoveringStrategy {
    /// Current step.
    pub fn step(&self) -> RecoveryStep {
        self.step
    }
}

impl<M> Strategy<M> for RecoveringStrategy
where
    M: Machine,
    M::Context: CellContext,
    M::Event: LifecycleEvent,
{
    fn prepare(&mut self, ctx: &mut M::Context) -> FsmResult<()> {
        self.snapshot = ctx.core().violation();
        self.step = RecoveryStep::Reconnect;
        info!(
            fsm = ctx.core().fsm(),
            violation = %self.snapshot,
            attempt = ctx.core().failed_recoveries() + 1,
            "Recovery started"
        );
        Ok(())
    }

    fn operate(&mut self, ctx: &mut M::Context) -> FsmResult<M::Event> {
        ctx.core_mut().sense_emergency_stop();
        if ctx.core().emergency_stop() {
            return Ok(M::Event::STOP_EMG);
        }

        match self.step {
            RecoveryStep::Reconnect => {
                let fsm = ctx.core().fsm();
                for bit in self.snapshot.comm_bits().iter() {
                    match ctx.reconnect(bit) {
                        Ok(()) => info!(fsm, violation = %bit, "Reconnected"),
                        Err(e) => warn!(fsm, violation = %bit, error = %e, "Reconnect failed"),
                    }
                }
                if let Err(e) = ctx.reset_faults(self.snapshot) {
                    warn!(fsm, error = %e, "Fault reset failed");
                }
                let delay = ctx
                    .core()
                    .recovery()
                    .settle_delay(ctx.core().failed_recoveries());
                self.step = RecoveryStep::Settle {
                    until: Instant::now() + delay,
                };
                Ok(M::Event::NONE)
            }
            RecoveryStep::Settle { until } => {
                if Instant::now() >= until {
                    self.step = RecoveryStep::Recheck;
                    Ok(self.recheck::<M>(ctx))
                } else {
                    Ok(M::Event::NONE)
                }
            }
            RecoveryStep::Recheck => Ok(self.recheck::<M>(ctx)),
        }
    }
}

impl RecoveringStrategy {
    fn recheck<M>(&mut self, ctx: &mut M::Context) -> M::Event
    where
        M: Machine,
        M::Context: CellContext,
        M::Event: LifecycleEvent,
    {
        ctx.sense();
        let violation = ctx.check_violation();
        ctx.core_mut().set_violation(violation);
        let fsm = ctx.core().fsm();
        if violation.is_empty() {
            ctx.core_mut().reset_recovery();
            info!(fsm, "Recovery complete");
            M::Event::DONE
        } else {
            ctx.core_mut().note_recovery_failed();
            warn!(
                fsm,
                violation = %violation,
                failed = ctx.core().failed_recoveries(),
                "Violation persists after recovery"
            );
            M::Event::VIOLATION_DETECT
        }
    }
}

// ─── STOP_AND_OFF ───────────────────────────────────────────────────

/// Safe state while the emergency stop is active.
#[derive(Debug, Default)]
pub struct StopAndOffStrategy;

impl<M> Strategy<M> for StopAndOffStrategy
where
    M: Machine,
    M::Context: CellContext,
    M::Event: LifecycleEvent,
{
    fn prepare(&mut self, ctx: &mut M::Context) -> FsmResult<()> {
        warn!(fsm = ctx.core().fsm(), "Emergency stop, entering safe state");
        ctx.enter_safe_state();
        Ok(())
    }

    fn operate(&mut self, ctx: &mut M::Context) -> FsmResult<M::Event> {
        ctx.core_mut().sense_emergency_stop();
        let violation = ctx.check_violation();
        ctx.core_mut().set_violation(violation);
        if ctx.core().emergency_stop() {
            Ok(M::Event::NONE)
        } else {
            info!(fsm = ctx.core().fsm(), "Emergency stop released");
            Ok(M::Event::DONE)
        }
    }
}
