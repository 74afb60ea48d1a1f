//! Prelude module for common re-exports.
//!
//! This module provides convenient re-exports of commonly used types
//! so that consumers can do `use cell_common::prelude::*;` and get
//! the most important types without listing individual paths.

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    CellConfig, CommConfig, ConfigError, ConfigLoader, DeviceConfig, EngineConfig, HardwareConfig,
    IoConfig, LogLevel, LogicConfig, RecoveryConfig, RobotConfig, SharedConfig,
};

// ─── System Constants ───────────────────────────────────────────────
pub use crate::consts::{ACK_OFFSET, DI_COUNT, DO_COUNT, DONE_OFFSET, HOME_MOTION_ID};

// ─── I/O ────────────────────────────────────────────────────────────
pub use crate::io::{DiRole, DoRole};

// ─── Violations ─────────────────────────────────────────────────────
pub use crate::violation::{Subsystem, Violation};
