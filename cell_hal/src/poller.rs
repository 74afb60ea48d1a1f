//! Hardware pollers.
//!
//! Pollers are the non-FSM threads of the cell. Each one runs a fixed-period
//! loop and talks to the FSMs only through the shared store:
//!
//! - [`IoPoller`] mirrors the I/O rack into `io/di/*` and `io/do/*`
//! - [`LampController`] drives the tower lamp from published FSM states
//! - [`CommStatusAggregator`] folds failure counters into `comm/status`

use cell_common::io::{DiRole, DoRole};
use cell_common::keys::{self, state};
use cell_store::SharedStore;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::driver::{HalError, HalResult, SharedIo};

/// One periodic hardware task.
pub trait Poller: Send {
    /// Thread name.
    fn name(&self) -> &'static str;

    /// One iteration. Failures are recorded in the store, never returned.
    fn poll(&mut self, store: &SharedStore);
}

/// Running poller thread.
#[derive(Debug)]
pub struct PollerHandle {
    name: &'static str,
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl PollerHandle {
    /// Thread name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request the loop to stop without waiting.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop the loop and join the thread.
    pub fn stop(self) {
        self.request_stop();
        if self.thread.join().is_err() {
            warn!(poller = self.name, "Poller thread panicked");
        }
    }
}

/// Spawn `poller` on its own thread with a fixed `period`.
pub fn spawn_poller(
    mut poller: Box<dyn Poller>,
    store: SharedStore,
    period: Duration,
) -> HalResult<PollerHandle> {
    let name = poller.name();
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);

    let thread = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            debug!(poller = name, period_ms = period.as_millis() as u64, "Poller started");
            let mut overruns: u64 = 0;
            while flag.load(Ordering::SeqCst) {
                let start = Instant::now();
                poller.poll(&store);
                let elapsed = start.elapsed();
                if elapsed < period {
                    thread::sleep(period - elapsed);
                } else {
                    overruns += 1;
                    if overruns <= 10 || overruns % 1000 == 0 {
                        warn!(
                            poller = name,
                            elapsed_us = elapsed.as_micros() as u64,
                            overruns,
                            "Poll overran its period"
                        );
                    }
                }
            }
            debug!(poller = name, "Poller stopped");
        })
        .map_err(|e| HalError::InitFailed(format!("spawn {name}: {e}")))?;

    Ok(PollerHandle {
        name,
        running,
        thread,
    })
}

// ─── I/O mirror ─────────────────────────────────────────────────────

/// Mirrors the I/O rack into the store and counts consecutive failures.
pub struct IoPoller {
    io: SharedIo,
    connected: bool,
    failures: u32,
    threshold: u32,
}

impl IoPoller {
    /// Poller over a shared rack.
    pub fn new(io: SharedIo, threshold: u32) -> Self {
        Self {
            io,
            connected: false,
            failures: 0,
            threshold,
        }
    }

    fn read_images(&mut self) -> HalResult<(Vec<bool>, Vec<bool>)> {
        let mut io = self.io.lock();
        if !self.connected {
            io.connect()?;
            self.connected = true;
            info!("I/O rack connected");
        }
        io.refresh()?;
        let di = (0..io.di_count()).map(|i| io.get_di(i)).collect::<HalResult<Vec<_>>>()?;
        let do_ = (0..io.do_count()).map(|i| io.get_do(i)).collect::<HalResult<Vec<_>>>()?;
        Ok((di, do_))
    }
}

impl Poller for IoPoller {
    fn name(&self) -> &'static str {
        "io-poller"
    }

    fn poll(&mut self, store: &SharedStore) {
        let counter = keys::comm_failures("io");
        match self.read_images() {
            Ok((di, do_)) => {
                if self.failures >= self.threshold {
                    info!(after = self.failures, "I/O communication restored");
                }
                self.failures = 0;
                store.set(&counter, 0);
                for role in DiRole::ALL {
                    if let Some(&v) = di.get(role.index()) {
                        store.set(&keys::di(role), v);
                    }
                }
                for role in DoRole::ALL {
                    if let Some(&v) = do_.get(role.index()) {
                        store.set(&keys::do_(role), v);
                    }
                }
                store.set(keys::DI_RAW, di);
                store.set(keys::DO_RAW, do_);
            }
            Err(e) => {
                if e.is_comm() {
                    self.connected = false;
                }
                self.failures = self.failures.saturating_add(1);
                store.set(&counter, self.failures);
                if self.failures == self.threshold {
                    warn!(error = %e, failures = self.failures, "I/O communication lost");
                } else {
                    debug!(error = %e, failures = self.failures, "I/O refresh failed");
                }
            }
        }
    }
}

// ─── Tower lamp ─────────────────────────────────────────────────────

/// Tower lamp outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LampPattern {
    /// Red lamp.
    pub red: bool,
    /// Yellow lamp.
    pub yellow: bool,
    /// Green lamp.
    pub green: bool,
    /// Buzzer.
    pub buzzer: bool,
}

impl LampPattern {
    /// Pattern for the published `(logic, device, robot)` states.
    ///
    /// Missing states (FSM not started yet) count as neither healthy nor
    /// faulted.
    pub fn from_states(states: [Option<&str>; 3]) -> Self {
        let faulted = |s: &str| matches!(s, state::ERROR | state::RECOVERING | state::STOP_AND_OFF);
        let alarm = |s: &str| matches!(s, state::ERROR | state::STOP_AND_OFF);
        let idle = |s: &str| matches!(s, state::READY | state::IDLE);

        let red = states.into_iter().flatten().any(|s| faulted(s));
        let buzzer = states.into_iter().flatten().any(|s| alarm(s));
        let yellow = states[0] == Some(state::RUNNING);
        let green = !red && states.into_iter().all(|s| s.is_some_and(|s| idle(s)));
        Self {
            red,
            yellow,
            green,
            buzzer,
        }
    }

    fn outputs(self) -> [(DoRole, bool); 4] {
        [
            (DoRole::LampRed, self.red),
            (DoRole::LampYellow, self.yellow),
            (DoRole::LampGreen, self.green),
            (DoRole::Buzzer, self.buzzer),
        ]
    }
}

/// Drives the tower lamp from the published FSM states.
pub struct LampController {
    io: SharedIo,
    applied: Option<LampPattern>,
}

impl LampController {
    /// Controller over a shared rack.
    pub fn new(io: SharedIo) -> Self {
        Self { io, applied: None }
    }
}

impl Poller for LampController {
    fn name(&self) -> &'static str {
        "lamp-controller"
    }

    fn poll(&mut self, store: &SharedStore) {
        let read = |fsm: &str| store.get_str(&keys::fsm_state(fsm));
        let (logic, device, robot) = (read(keys::LOGIC_FSM), read(keys::DEVICE_FSM), read(keys::ROBOT_FSM));
        let pattern = LampPattern::from_states([logic.as_deref(), device.as_deref(), robot.as_deref()]);
        if self.applied == Some(pattern) {
            return;
        }

        let mut io = self.io.lock();
        let result = pattern
            .outputs()
            .into_iter()
            .try_for_each(|(role, on)| io.set_do(role.index(), on));
        match result {
            Ok(()) => {
                debug!(?pattern, "Tower lamp updated");
                self.applied = Some(pattern);
            }
            // Retried next period; the I/O poller accounts for link failures.
            Err(e) => debug!(error = %e, "Tower lamp update failed"),
        }
    }
}

// ─── Communication status ───────────────────────────────────────────

/// Publishes `comm/status` as `{subsystem: healthy}`.
pub struct CommStatusAggregator {
    threshold: u32,
    last: Option<Map<String, Value>>,
}

impl CommStatusAggregator {
    /// Aggregator with the consecutive-failure threshold.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            last: None,
        }
    }

    /// Health of every subsystem as currently recorded in the store.
    pub fn evaluate(&self, store: &SharedStore) -> Map<String, Value> {
        keys::COMM_SUBSYSTEMS
            .iter()
            .map(|&name| {
                let failures = store.get_i64(&keys::comm_failures(name)).unwrap_or(0);
                let healthy = failures < i64::from(self.threshold);
                (name.to_string(), Value::Bool(healthy))
            })
            .collect()
    }
}

impl Poller for CommStatusAggregator {
    fn name(&self) -> &'static str {
        "comm-status"
    }

    fn poll(&mut self, store: &SharedStore) {
        let status = self.evaluate(store);
        if let Some(last) = &self.last {
            for (name, healthy) in &status {
                if last.get(name) != Some(healthy) {
                    if healthy.as_bool() == Some(true) {
                        info!(subsystem = %name, "Communication healthy");
                    } else {
                        warn!(subsystem = %name, "Communication unhealthy");
                    }
                }
            }
        }
        store.set(keys::COMM_STATUS, Value::Object(status.clone()));
        self.last = Some(status);
    }
}
