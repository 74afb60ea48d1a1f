//! Generic FSM engine.
//!
//! A machine is a state enum, an event enum, a context and one
//! [`Strategy`] per state. [`Fsm::tick`] drives the current strategy
//! through its `prepare → operate → exit` lifecycle and resolves the
//! emitted event against the machine's [`RuleTable`].
//!
//! Strategy failures never escape the engine: an `Err` or a panic from
//! `prepare`, `operate` or `exit` latches `INTERNAL_FAULT` in the context
//! and forces the machine's fault transition.
//!
//! # Threading
//!
//! [`Fsm::run_background`] moves the machine onto its own thread. The loop
//! ticks, then sleeps until either the shared store changes or one tick
//! interval has elapsed, whichever comes first.

use cell_common::keys;
use cell_common::violation::Violation;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::error::{FsmError, FsmResult};
use crate::rules::{EventId, RuleTable, StateId};

/// Behavior bound to one state.
///
/// A strategy instance lives as long as its machine. Fields it keeps are
/// reset in `prepare`, which runs once per activation of the state.
pub trait Strategy<M: Machine>: Send {
    /// Entry hook.
    fn prepare(&mut self, _ctx: &mut M::Context) -> FsmResult<()> {
        Ok(())
    }

    /// Per-tick evaluation. `M::Event::NONE` keeps the state.
    fn operate(&mut self, ctx: &mut M::Context) -> FsmResult<M::Event>;

    /// Leave hook, called with the event that ends the activation.
    fn exit(&mut self, _ctx: &mut M::Context, _event: M::Event) -> FsmResult<()> {
        Ok(())
    }
}

/// Static definition of a machine.
pub trait Machine: Sized + 'static {
    /// State identifiers.
    type State: StateId;
    /// Event identifiers.
    type Event: EventId;
    /// Exclusively owned domain state.
    type Context: Context;

    /// Name used for store keys and logs.
    const NAME: &'static str;
    /// Fallback target of a strategy fault with no matching rule.
    const ERROR_STATE: Self::State;
    /// Event a strategy fault is converted into.
    const FAULT_EVENT: Self::Event;

    /// Populate the transition table.
    fn rules(table: &mut RuleTable<Self::State, Self::Event>) -> FsmResult<()>;

    /// Strategy for `state`.
    fn strategy(state: Self::State) -> Box<dyn Strategy<Self>>;
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome<S, E> {
    /// Strategy returned NONE.
    Stay,
    /// Event resolved to a rule.
    Transition {
        /// Previous state
        from: S,
        /// New state
        to: S,
        /// Triggering event
        event: E,
    },
    /// Event had no rule; state kept, strategy re-prepared next tick.
    Discarded {
        /// Unmatched event
        event: E,
    },
    /// Strategy failed or panicked.
    Fault {
        /// State whose strategy failed
        from: S,
        /// State entered
        to: S,
    },
}

/// A running machine instance.
pub struct Fsm<M: Machine> {
    state: M::State,
    prepared: bool,
    ctx: M::Context,
    rules: RuleTable<M::State, M::Event>,
    strategies: HashMap<M::State, Box<dyn Strategy<M>>>,
    state_key: String,
    violation_key: String,
    ticks: u64,
    transitions: u64,
}

impl<M: Machine> Fsm<M> {
    /// Build the rule and strategy tables and enter `initial`.
    ///
    /// # Errors
    /// Propagates rule-table construction errors.
    pub fn new(initial: M::State, ctx: M::Context) -> FsmResult<Self> {
        let mut rules = RuleTable::new();
        M::rules(&mut rules)?;
        let strategies = M::State::ALL
            .iter()
            .map(|&state| (state, M::strategy(state)))
            .collect();

        let fsm = Self {
            state: initial,
            prepared: false,
            ctx,
            rules,
            strategies,
            state_key: keys::fsm_state(M::NAME),
            violation_key: keys::fsm_violation(M::NAME),
            ticks: 0,
            transitions: 0,
        };
        fsm.publish();
        info!(
            fsm = M::NAME,
            state = initial.name(),
            rules = fsm.rules.len(),
            "FSM created"
        );
        Ok(fsm)
    }

    // ─── Accessors ──────────────────────────────────────────────────

    /// Current state.
    #[inline]
    pub fn state(&self) -> M::State {
        self.state
    }

    /// Whether the current state's `prepare` has run.
    #[inline]
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Context.
    pub fn context(&self) -> &M::Context {
        &self.ctx
    }

    /// Context, mutable.
    pub fn context_mut(&mut self) -> &mut M::Context {
        &mut self.ctx
    }

    /// Give up the machine and keep its context.
    pub fn into_context(self) -> M::Context {
        self.ctx
    }

    /// Transition table.
    pub fn rules(&self) -> &RuleTable<M::State, M::Event> {
        &self.rules
    }

    /// Ticks executed.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// State changes, including fault transitions.
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    // ─── Execution ──────────────────────────────────────────────────

    /// Run one `prepare? → operate → exit?` pass and apply its event.
    pub fn tick(&mut self) -> TickOutcome<M::State, M::Event> {
        self.ticks += 1;
        let from = self.state;

        let outcome = match self.run_strategy() {
            Ok(event) if event == M::Event::NONE => TickOutcome::Stay,
            Ok(event) => match self.rules.next(from, event) {
                Some(to) => {
                    debug!(
                        fsm = M::NAME,
                        from = from.name(),
                        to = to.name(),
                        event = event.name(),
                        "Transition"
                    );
                    self.enter(to);
                    TickOutcome::Transition { from, to, event }
                }
                None => {
                    warn!(
                        fsm = M::NAME,
                        state = from.name(),
                        event = event.name(),
                        "No rule for event, staying"
                    );
                    self.prepared = false;
                    TickOutcome::Discarded { event }
                }
            },
            Err(e) => {
                error!(fsm = M::NAME, state = from.name(), error = %e, "Strategy fault");
                self.ctx.core_mut().latch(Violation::INTERNAL_FAULT);
                let to = self
                    .rules
                    .next(from, M::FAULT_EVENT)
                    .unwrap_or(M::ERROR_STATE);
                self.enter(to);
                TickOutcome::Fault { from, to }
            }
        };

        self.publish();
        outcome
    }

    fn run_strategy(&mut self) -> FsmResult<M::Event> {
        let Self {
            state,
            prepared,
            ctx,
            strategies,
            ..
        } = self;
        let current = *state;
        let strategy = strategies
            .get_mut(&current)
            .ok_or(FsmError::MissingStrategy(current.name()))?;

        guarded(move || {
            if !*prepared {
                strategy.prepare(ctx)?;
                *prepared = true;
            }
            let event = strategy.operate(ctx)?;
            if event != M::Event::NONE {
                strategy.exit(ctx, event)?;
            }
            Ok(event)
        })
    }

    fn enter(&mut self, to: M::State) {
        self.state = to;
        self.prepared = false;
        self.transitions += 1;
    }

    fn publish(&self) {
        let core = self.ctx.core();
        let store = core.store();
        store.set(&self.state_key, self.state.name());
        store.set(&self.violation_key, core.violation().bits());
    }

    /// Move the machine onto its own thread.
    ///
    /// # Errors
    /// [`FsmError::Thread`] if the OS refuses the thread.
    pub fn run_background(self, interval: Duration) -> FsmResult<FsmHandle<M>>
    where
        M::Context: 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let store = self.ctx.core().store().clone();
        let mut fsm = self;

        let thread = thread::Builder::new()
            .name(format!("fsm-{}", M::NAME))
            .spawn(move || {
                info!(
                    fsm = M::NAME,
                    interval_us = interval.as_micros() as u64,
                    "FSM thread started"
                );
                let mut overruns: u64 = 0;
                while flag.load(Ordering::SeqCst) {
                    let start = Instant::now();
                    fsm.tick();
                    let seen = store.version();
                    let elapsed = start.elapsed();
                    if elapsed > interval {
                        overruns += 1;
                        if overruns <= 10 || overruns % 1000 == 0 {
                            warn!(
                                fsm = M::NAME,
                                elapsed_us = elapsed.as_micros() as u64,
                                overruns,
                                "Tick overran its interval"
                            );
                        }
                    }
                    store.wait_for_change(seen, interval.saturating_sub(elapsed));
                }
                info!(fsm = M::NAME, ticks = fsm.ticks, "FSM thread stopped");
                fsm
            })
            .map_err(|e| FsmError::Thread {
                fsm: M::NAME,
                reason: e.to_string(),
            })?;

        Ok(FsmHandle { running, thread })
    }
}

impl<M: Machine> fmt::Debug for Fsm<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fsm")
            .field("name", &M::NAME)
            .field("state", &self.state)
            .field("prepared", &self.prepared)
            .field("ticks", &self.ticks)
            .field("transitions", &self.transitions)
            .finish_non_exhaustive()
    }
}

/// Run `f`, turning a panic into [`FsmError::Panic`].
fn guarded<T>(f: impl FnOnce() -> FsmResult<T>) -> FsmResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(FsmError::Panic(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ─── Background handle ──────────────────────────────────────────────

/// Handle to a machine running on its own thread.
pub struct FsmHandle<M: Machine> {
    running: Arc<AtomicBool>,
    thread: JoinHandle<Fsm<M>>,
}

impl<M: Machine> FsmHandle<M> {
    /// Machine name.
    pub fn name(&self) -> &'static str {
        M::NAME
    }

    /// Ask the loop to stop after the current tick.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Stop the loop, join the thread and hand the machine back.
    ///
    /// # Errors
    /// [`FsmError::Thread`] if the thread died outside the engine's guard.
    pub fn stop(self) -> FsmResult<Fsm<M>> {
        self.request_stop();
        self.thread.join().map_err(|payload| FsmError::Thread {
            fsm: M::NAME,
            reason: panic_message(payload.as_ref()),
        })
    }
}

impl<M: Machine> fmt::Debug for FsmHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsmHandle")
            .field("name", &M::NAME)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}
