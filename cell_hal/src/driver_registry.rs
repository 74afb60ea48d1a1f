//! Backend registry.
//!
//! Provides a `BackendRegistry` mapping backend names to factories that
//! build a complete [`CellHardware`] bundle. Constructed at startup and
//! passed around by value, with no global state.

use cell_common::config::{HardwareConfig, IoConfig};
use std::collections::HashMap;
use std::fmt;
use tracing::info;

use crate::driver::{
    DigitalIo, HalError, HalResult, QrReader, RobotController, SharedIo, TesterLink,
    ThicknessGauge, ZonePredictor,
};
use crate::drivers::register_all_backends;

/// Every hardware collaborator the cell needs.
pub struct CellHardware {
    /// Robot controller RPC, owned by the Robot FSM.
    pub robot: Box<dyn RobotController>,
    /// I/O rack, shared by pollers and the Device FSM.
    pub io: SharedIo,
    /// Thickness gauge, owned by the Device FSM.
    pub gauge: Box<dyn ThicknessGauge>,
    /// QR reader, owned by the Device FSM.
    pub qr: Box<dyn QrReader>,
    /// Tester link, owned by the Device FSM.
    pub tester: Box<dyn TesterLink>,
    /// Optional position resolver for the Robot FSM.
    pub zone_predictor: Option<Box<dyn ZonePredictor>>,
}

impl fmt::Debug for CellHardware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.io.lock();
        let io: &dyn DigitalIo = &**guard;
        f.debug_struct("CellHardware")
            .field("di_count", &io.di_count())
            .field("do_count", &io.do_count())
            .field("zone_predictor", &self.zone_predictor.is_some())
            .finish_non_exhaustive()
    }
}

/// Factory function type for creating a hardware bundle.
pub type BackendFactory = fn(&HardwareConfig, &IoConfig) -> HalResult<CellHardware>;

/// Registry of available hardware backends.
pub struct BackendRegistry {
    factories: HashMap<&'static str, BackendFactory>,
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in backend.
    pub fn with_builtin() -> HalResult<Self> {
        let mut registry = Self::new();
        register_all_backends(&mut registry)?;
        Ok(registry)
    }

    /// Register a backend factory.
    ///
    /// # Errors
    /// Returns `HalError::ConfigError` if the name is already taken.
    pub fn register(&mut self, name: &'static str, factory: BackendFactory) -> HalResult<()> {
        if self.factories.contains_key(name) {
            return Err(HalError::ConfigError(format!(
                "Backend '{name}' is already registered"
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Get a backend factory by name.
    pub fn get_factory(&self, name: &str) -> Option<BackendFactory> {
        self.factories.get(name).copied()
    }

    /// Build the backend selected by `hardware.backend`.
    ///
    /// # Errors
    /// Returns `HalError::BackendNotFound` if no backend with that name is
    /// registered, or whatever the factory reports.
    pub fn create(&self, hardware: &HardwareConfig, io: &IoConfig) -> HalResult<CellHardware> {
        let factory = self
            .get_factory(&hardware.backend)
            .ok_or_else(|| HalError::BackendNotFound(hardware.backend.clone()))?;
        let bundle = factory(hardware, io)?;
        info!(backend = %hardware.backend, "Hardware backend created");
        Ok(bundle)
    }

    /// All registered backend names, sorted.
    pub fn list_backends(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
