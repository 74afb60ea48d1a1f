//! State common to every FSM context.
//!
//! Each machine owns its context exclusively. The part every context has
//! in common (store handle, latched faults, last computed bitmask,
//! emergency-stop input and recovery bookkeeping) lives in
//! [`ContextCore`], which the engine and the lifecycle strategies reach
//! through the [`Context`] trait.

use cell_common::config::RecoveryConfig;
use cell_common::io::DiRole;
use cell_common::keys;
use cell_common::violation::Violation;
use cell_store::SharedStore;
use tracing::info;

/// Access to the common part of a machine context.
pub trait Context: Send {
    /// Common state.
    fn core(&self) -> &ContextCore;

    /// Common state, mutable.
    fn core_mut(&mut self) -> &mut ContextCore;
}

/// Common context state.
#[derive(Debug, Clone)]
pub struct ContextCore {
    fsm: &'static str,
    store: SharedStore,
    latched: Violation,
    violation: Violation,
    emergency_stop: bool,
    recovery: RecoveryConfig,
    failed_recoveries: u32,
}

impl ContextCore {
    /// Core for the machine called `fsm`.
    pub fn new(fsm: &'static str, store: SharedStore, recovery: RecoveryConfig) -> Self {
        Self {
            fsm,
            store,
            latched: Violation::empty(),
            violation: Violation::empty(),
            emergency_stop: false,
            recovery,
            failed_recoveries: 0,
        }
    }

    /// Machine name.
    #[inline]
    pub fn fsm(&self) -> &'static str {
        self.fsm
    }

    /// Shared store handle.
    #[inline]
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    // ─── Faults ─────────────────────────────────────────────────────

    /// Latch fault bits that no sensor reports (timeouts, protocol errors,
    /// internal faults). They stay set until recovery clears them.
    pub fn latch(&mut self, bits: Violation) {
        self.latched |= bits;
        self.violation |= bits;
    }

    /// Latched bits.
    #[inline]
    pub fn latched(&self) -> Violation {
        self.latched
    }

    /// Forget latched bits.
    pub fn clear_latched(&mut self) {
        self.latched = Violation::empty();
    }

    /// Last computed bitmask, as published.
    #[inline]
    pub fn violation(&self) -> Violation {
        self.violation
    }

    /// Record the bitmask computed this tick.
    pub fn set_violation(&mut self, violation: Violation) {
        self.violation = violation;
    }

    // ─── Safety input ───────────────────────────────────────────────

    /// Refresh the emergency-stop input from the store. A missing value
    /// keeps the last reading.
    pub fn sense_emergency_stop(&mut self) {
        if let Some(active) = self.store.get_bool(&keys::di(DiRole::EmergencyStop)) {
            self.emergency_stop = active;
        }
    }

    /// Emergency stop requested.
    #[inline]
    pub fn emergency_stop(&self) -> bool {
        self.emergency_stop
    }

    // ─── Recovery bookkeeping ───────────────────────────────────────

    /// Recovery policy.
    pub fn recovery(&self) -> &RecoveryConfig {
        &self.recovery
    }

    /// Consecutive failed recoveries.
    #[inline]
    pub fn failed_recoveries(&self) -> u32 {
        self.failed_recoveries
    }

    /// One more recovery failed.
    pub fn note_recovery_failed(&mut self) {
        self.failed_recoveries = self.failed_recoveries.saturating_add(1);
    }

    /// Recovery succeeded or was reset by an operator.
    pub fn reset_recovery(&mut self) {
        self.failed_recoveries = 0;
    }

    /// Whether the attempt budget is used up.
    pub fn recovery_exhausted(&self) -> bool {
        self.recovery.exhausted(self.failed_recoveries)
    }

    /// Consume an operator reset request (`cmd/<fsm>/reset`).
    pub fn take_reset_request(&self) -> bool {
        let key = keys::fsm_reset(self.fsm);
        let requested = self.store.update(&key, |slot| {
            if slot.as_bool() == Some(true) {
                *slot = false.into();
                true
            } else {
                false
            }
        });
        if requested {
            info!(fsm = self.fsm, "Operator reset received");
        }
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> ContextCore {
        ContextCore::new("robot", SharedStore::new(), RecoveryConfig::default())
    }

    #[test]
    fn latch_sets_and_clear_forgets() {
        let mut c = core();
        c.latch(Violation::ROBOT_ACK_TIMEOUT);
        assert_eq!(c.latched(), Violation::ROBOT_ACK_TIMEOUT);
        assert!(c.violation().contains(Violation::ROBOT_ACK_TIMEOUT));
        c.clear_latched();
        assert!(c.latched().is_empty());
    }

    #[test]
    fn emergency_stop_keeps_last_reading() {
        let mut c = core();
        c.store().set("io/di/emergency_stop", true);
        c.sense_emergency_stop();
        assert!(c.emergency_stop());
        c.store().clear("io/di/emergency_stop");
        c.sense_emergency_stop();
        assert!(c.emergency_stop());
    }

    #[test]
    fn reset_request_is_consumed_once() {
        let c = core();
        assert!(!c.take_reset_request());
        c.store().set("cmd/robot/reset", true);
        assert!(c.take_reset_request());
        assert!(!c.take_reset_request());
    }

    #[test]
    fn budget_follows_config() {
        let mut c = ContextCore::new(
            "logic",
            SharedStore::new(),
            RecoveryConfig {
                max_attempts: Some(2),
                ..RecoveryConfig::default()
            },
        );
        c.note_recovery_failed();
        assert!(!c.recovery_exhausted());
        c.note_recovery_failed();
        assert!(c.recovery_exhausted());
        c.reset_recovery();
        assert!(!c.recovery_exhausted());
    }
}
