//! Violation helpers shared by every context.
//!
//! The bit catalogue itself lives in `cell_common::violation`. This module
//! holds the pieces the contexts compute it from:
//!
//! - [`CommCounter`]: consecutive-failure counter for one collaborator,
//!   published under `comm/<subsystem>/failures`
//! - [`published_counter`]: the same check for counters owned by a poller
//! - [`log_violation`]: one ERROR line per set bit

use cell_common::keys;
use cell_common::violation::Violation;
use cell_hal::HalResult;
use cell_store::SharedStore;
use tracing::{debug, error, warn};

/// Consecutive communication failures of one collaborator.
#[derive(Debug, Clone)]
pub struct CommCounter {
    subsystem: &'static str,
    bit: Violation,
    failures: u32,
    threshold: u32,
}

impl CommCounter {
    /// Counter raising `bit` after `threshold` consecutive failures.
    pub fn new(subsystem: &'static str, bit: Violation, threshold: u32) -> Self {
        Self {
            subsystem,
            bit,
            failures: 0,
            threshold: threshold.max(1),
        }
    }

    /// Subsystem name.
    pub fn subsystem(&self) -> &'static str {
        self.subsystem
    }

    /// Violation bit this counter raises.
    pub fn bit(&self) -> Violation {
        self.bit
    }

    /// Current consecutive failure count.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether the threshold has been reached.
    pub fn tripped(&self) -> bool {
        self.failures >= self.threshold
    }

    /// `bit()` when tripped, empty otherwise.
    pub fn bits(&self) -> Violation {
        if self.tripped() {
            self.bit
        } else {
            Violation::empty()
        }
    }

    /// Count `result` and pass it through.
    ///
    /// Successes reset the counter; only communication-class errors count
    /// as failures.
    pub fn record<T>(&mut self, store: &SharedStore, result: HalResult<T>) -> HalResult<T> {
        match &result {
            Ok(_) => {
                if self.failures > 0 {
                    debug!(subsystem = self.subsystem, "Communication restored");
                    self.reset(store);
                }
            }
            Err(e) if e.is_comm() => {
                self.failures = self.failures.saturating_add(1);
                if self.failures == self.threshold {
                    warn!(
                        subsystem = self.subsystem,
                        failures = self.failures,
                        error = %e,
                        "Communication failure threshold reached"
                    );
                }
                store.set(&keys::comm_failures(self.subsystem), self.failures);
            }
            Err(_) => {}
        }
        result
    }

    /// Clear the counter.
    pub fn reset(&mut self, store: &SharedStore) {
        self.failures = 0;
        store.set(&keys::comm_failures(self.subsystem), 0);
    }
}

/// `bit` if the counter another thread publishes for `subsystem` has
/// reached `threshold`.
pub fn published_counter(
    store: &SharedStore,
    subsystem: &str,
    threshold: u32,
    bit: Violation,
) -> Violation {
    let failures = store.get_i64(&keys::comm_failures(subsystem)).unwrap_or(0);
    if failures >= i64::from(threshold.max(1)) {
        bit
    } else {
        Violation::empty()
    }
}

/// Log every set bit by name.
pub fn log_violation(fsm: &str, violation: Violation) {
    for name in violation.names() {
        error!(fsm, violation = name, "Violation active");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cell_hal::HalError;

    #[test]
    fn counter_trips_at_threshold_and_resets() {
        let store = SharedStore::new();
        let mut c = CommCounter::new("gauge", Violation::GAUGE_COMM, 2);

        let _ = c.record::<()>(&store, Err(HalError::Timeout("t".into())));
        assert!(!c.tripped());
        assert_eq!(store.get_i64("comm/gauge/failures"), Some(1));

        let _ = c.record::<()>(&store, Err(HalError::NotConnected("gauge")));
        assert_eq!(c.bits(), Violation::GAUGE_COMM);

        assert_eq!(c.record(&store, Ok(5)).unwrap(), 5);
        assert_eq!(c.failures(), 0);
        assert_eq!(store.get_i64("comm/gauge/failures"), Some(0));
    }

    #[test]
    fn non_comm_errors_do_not_count() {
        let store = SharedStore::new();
        let mut c = CommCounter::new("robot", Violation::ROBOT_COMM, 1);
        let _ = c.record::<()>(&store, Err(HalError::ConfigError("bad".into())));
        assert!(c.bits().is_empty());
    }

    #[test]
    fn published_counter_uses_threshold() {
        let store = SharedStore::new();
        assert!(published_counter(&store, "io", 3, Violation::IO_COMM).is_empty());
        store.set("comm/io/failures", 3);
        assert_eq!(
            published_counter(&store, "io", 3, Violation::IO_COMM),
            Violation::IO_COMM
        );
    }
}
