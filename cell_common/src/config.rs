//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! across all cell applications, and the [`CellConfig`] tree consumed by the
//! FSM runtime and the supervisor binary.
//!
//! # Usage
//!
//! ```rust,no_run
//! use cell_common::config::{CellConfig, ConfigError, ConfigLoader};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = CellConfig::load(Path::new("cell.toml"))?;
//!     config.validate()?;
//!     println!("Service: {}", config.shared.service_name);
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::consts::{
    DEFAULT_ACK_RETRIES, DEFAULT_ACK_RETRY_INTERVAL_MS, DEFAULT_COMM_ERROR_THRESHOLD,
    DEFAULT_DONE_TIMEOUT_MS, DEFAULT_RACK_FLOORS, DEFAULT_SETTLE_DELAY_MS, DEFAULT_TEST_TIMEOUT_MS,
    DEFAULT_TESTER_REPLY_TIMEOUT_MS, DEFAULT_TICK_INTERVAL_MS, DI_COUNT, DO_COUNT, MAX_RACK_FLOORS,
};
use crate::io::{max_di_index, max_do_index};

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Common configuration fields shared across all cell applications.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "cell-line-01"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            service_name: "cell".to_string(),
        }
    }
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// FSM engine timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval between two ticks of an FSM thread [ms].
    pub tick_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
        }
    }
}

impl EngineConfig {
    /// Tick interval as Duration.
    #[inline]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Robot motion handshake parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    /// CMD writes before declaring an ACK timeout.
    pub ack_retries: u32,
    /// Wait for the exact ACK per attempt [ms].
    pub ack_retry_interval_ms: u64,
    /// Wait for DONE after ACK [ms].
    pub done_timeout_ms: u64,
    /// Number of floors in the specimen rack.
    pub rack_floors: u8,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            ack_retries: DEFAULT_ACK_RETRIES,
            ack_retry_interval_ms: DEFAULT_ACK_RETRY_INTERVAL_MS,
            done_timeout_ms: DEFAULT_DONE_TIMEOUT_MS,
            rack_floors: DEFAULT_RACK_FLOORS,
        }
    }
}

impl RobotConfig {
    /// ACK wait per attempt as Duration.
    #[inline]
    pub const fn ack_retry_interval(&self) -> Duration {
        Duration::from_millis(self.ack_retry_interval_ms)
    }

    /// DONE timeout as Duration.
    #[inline]
    pub const fn done_timeout(&self) -> Duration {
        Duration::from_millis(self.done_timeout_ms)
    }
}

/// ERROR → RECOVERING policy.
///
/// With `max_attempts = None` recovery retries forever, which is the
/// historical behavior of the cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Delay between reconnecting and re-checking violations [ms].
    pub settle_delay_ms: u64,
    /// Consecutive failed recoveries before ERROR waits for an operator reset.
    pub max_attempts: Option<u32>,
    /// Upper bound of the doubling settle delay [ms]. `None` keeps the delay fixed.
    pub backoff_cap_ms: Option<u64>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            max_attempts: None,
            backoff_cap_ms: None,
        }
    }
}

impl RecoveryConfig {
    /// Settle delay for the given number of consecutive failed recoveries.
    pub fn settle_delay(&self, failed_attempts: u32) -> Duration {
        let base = self.settle_delay_ms;
        let ms = match self.backoff_cap_ms {
            Some(cap) => base
                .saturating_mul(1u64 << failed_attempts.min(16))
                .min(cap.max(base)),
            None => base,
        };
        Duration::from_millis(ms)
    }

    /// Whether the attempt budget is exhausted.
    #[inline]
    pub fn exhausted(&self, failed_attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| failed_attempts >= max)
    }
}

/// Communication health thresholds and poller timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    /// Consecutive failures before a comm violation bit is raised.
    pub error_threshold: u32,
    /// Hardware poller period [ms].
    pub poll_interval_ms: u64,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            error_threshold: DEFAULT_COMM_ERROR_THRESHOLD,
            poll_interval_ms: 20,
        }
    }
}

impl CommConfig {
    /// Poller period as Duration.
    #[inline]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Digital I/O rack widths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Number of digital inputs.
    pub di_count: usize,
    /// Number of digital outputs.
    pub do_count: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            di_count: DI_COUNT,
            do_count: DO_COUNT,
        }
    }
}

/// Device-side timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Wait for a tester reply to a presence or registration request [ms].
    pub reply_timeout_ms: u64,
    /// Wait for TEST_RESULT after START_TEST [ms].
    pub test_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: DEFAULT_TESTER_REPLY_TIMEOUT_MS,
            test_timeout_ms: DEFAULT_TEST_TIMEOUT_MS,
        }
    }
}

impl DeviceConfig {
    /// Tester reply timeout as Duration.
    #[inline]
    pub const fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Test completion timeout as Duration.
    #[inline]
    pub const fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }
}

/// Batch sequencer policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogicConfig {
    /// Retries of a failed step (each preceded by an undo to HOME).
    pub step_retries: u32,
}

impl Default for LogicConfig {
    fn default() -> Self {
        Self { step_retries: 1 }
    }
}

/// Hardware backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Registered backend name.
    pub backend: String,
    /// Backend-specific options, passed through untouched.
    pub options: toml::Table,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            backend: "simulation".to_string(),
            options: toml::Table::new(),
        }
    }
}

/// Complete cell configuration.
///
/// Every section has defaults, so an empty file is a valid configuration.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// service_name = "cell-line-01"
///
/// [robot]
/// ack_retries = 3
/// done_timeout_ms = 20000
///
/// [recovery]
/// settle_delay_ms = 1000
/// max_attempts = 5
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellConfig {
    /// Shared application settings.
    pub shared: SharedConfig,
    /// FSM engine timing.
    pub engine: EngineConfig,
    /// Robot handshake.
    pub robot: RobotConfig,
    /// Recovery policy.
    pub recovery: RecoveryConfig,
    /// Communication thresholds.
    pub comm: CommConfig,
    /// I/O widths.
    pub io: IoConfig,
    /// Device timeouts.
    pub device: DeviceConfig,
    /// Sequencer policy.
    pub logic: LogicConfig,
    /// Hardware backend.
    pub hardware: HardwareConfig,
}

impl CellConfig {
    /// Validate the whole tree.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.engine.tick_interval_ms == 0 {
            return invalid("engine.tick_interval_ms must be > 0".into());
        }
        if self.robot.ack_retries == 0 {
            return invalid("robot.ack_retries must be > 0".into());
        }
        if self.robot.ack_retry_interval_ms == 0 || self.robot.done_timeout_ms == 0 {
            return invalid("robot handshake timeouts must be > 0".into());
        }
        if self.robot.rack_floors == 0 || self.robot.rack_floors > MAX_RACK_FLOORS {
            return invalid(format!(
                "robot.rack_floors must be in 1..={MAX_RACK_FLOORS}, got {}",
                self.robot.rack_floors
            ));
        }
        if self.comm.error_threshold == 0 || self.comm.poll_interval_ms == 0 {
            return invalid("comm.error_threshold and comm.poll_interval_ms must be > 0".into());
        }
        if self.device.reply_timeout_ms == 0 || self.device.test_timeout_ms == 0 {
            return invalid("device timeouts must be > 0".into());
        }
        if self.io.di_count <= max_di_index() {
            return invalid(format!(
                "io.di_count {} cannot hold DI index {}",
                self.io.di_count,
                max_di_index()
            ));
        }
        if self.io.do_count <= max_do_index() {
            return invalid(format!(
                "io.do_count {} cannot hold DO index {}",
                self.io.do_count,
                max_do_index()
            ));
        }
        if self.hardware.backend.is_empty() {
            return invalid("hardware.backend cannot be empty".into());
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// This trait provides a default implementation that works with any type
/// implementing `serde::de::DeserializeOwned`.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_log_level_default() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_log_level_deserialization() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct TestWrapper {
            level: LogLevel,
        }

        for (text, level) in [
            ("trace", LogLevel::Trace),
            ("debug", LogLevel::Debug),
            ("info", LogLevel::Info),
            ("warn", LogLevel::Warn),
            ("error", LogLevel::Error),
        ] {
            let parsed: TestWrapper = toml::from_str(&format!("level = \"{text}\"")).unwrap();
            assert_eq!(parsed.level, level);
            assert_eq!(level.as_directive(), text);
        }
    }

    #[test]
    fn test_shared_config_validation_empty_service_name() {
        let config = SharedConfig {
            log_level: LogLevel::Info,
            service_name: "".to_string(),
        };
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_default_cell_config_is_valid() {
        let cfg = CellConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.robot.ack_retries, 3);
        assert_eq!(cfg.io.di_count, 48);
        assert_eq!(cfg.io.do_count, 32);
        assert_eq!(cfg.hardware.backend, "simulation");
        assert!(cfg.engine.tick_interval() < Duration::from_millis(10));
    }

    #[test]
    fn test_validation_rejects_bad_fields() {
        let mut cfg = CellConfig::default();
        cfg.engine.tick_interval_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = CellConfig::default();
        cfg.robot.ack_retries = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = CellConfig::default();
        cfg.io.di_count = 4;
        assert!(cfg.validate().is_err());

        let mut cfg = CellConfig::default();
        cfg.device.test_timeout_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = CellConfig::default();
        cfg.robot.rack_floors = 120;
        assert!(cfg.validate().is_err());

        let mut cfg = CellConfig::default();
        cfg.hardware.backend.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_settle_delay_fixed_without_cap() {
        let rc = RecoveryConfig::default();
        assert_eq!(rc.settle_delay(0), rc.settle_delay(7));
        assert!(!rc.exhausted(1_000));
    }

    #[test]
    fn test_settle_delay_doubles_up_to_cap() {
        let rc = RecoveryConfig {
            settle_delay_ms: 100,
            max_attempts: Some(3),
            backoff_cap_ms: Some(350),
        };
        assert_eq!(rc.settle_delay(0), Duration::from_millis(100));
        assert_eq!(rc.settle_delay(1), Duration::from_millis(200));
        assert_eq!(rc.settle_delay(2), Duration::from_millis(350));
        assert_eq!(rc.settle_delay(40), Duration::from_millis(350));
        assert!(!rc.exhausted(2));
        assert!(rc.exhausted(3));
    }

    #[test]
    fn test_config_loader_file_not_found() {
        let result = CellConfig::load(Path::new("/nonexistent/path/cell.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn test_config_loader_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid toml {{{{").unwrap();

        let result = CellConfig::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_config_loader_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[shared]
log_level = "debug"
service_name = "line-02"

[robot]
done_timeout_ms = 1500

[recovery]
max_attempts = 4

[hardware]
backend = "simulation"
options = {{ motion_polls = 2 }}
"#
        )
        .unwrap();
        file.flush().unwrap();

        let cfg = CellConfig::load(file.path()).unwrap();
        assert_eq!(cfg.shared.log_level, LogLevel::Debug);
        assert_eq!(cfg.shared.service_name, "line-02");
        assert_eq!(cfg.robot.done_timeout(), Duration::from_millis(1500));
        assert_eq!(cfg.robot.ack_retries, DEFAULT_ACK_RETRIES);
        assert_eq!(cfg.recovery.max_attempts, Some(4));
        assert_eq!(
            cfg.hardware.options.get("motion_polls").and_then(|v| v.as_integer()),
            Some(2)
        );
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_empty_file_is_default() {
        let file = NamedTempFile::new().unwrap();
        let cfg = CellConfig::load(file.path()).unwrap();
        assert_eq!(cfg, CellConfig::default());
    }
}
