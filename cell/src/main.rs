//! # Test Cell Supervisor
//!
//! Loads the cell configuration, builds the hardware backend, and runs the
//! Logic, Device and Robot machines on their own threads until Ctrl+C, or
//! until a batch given on the command line has been reported.
//!
//! # Usage
//!
//! ```bash
//! # Simulated cell, runs until Ctrl+C
//! cell --config config/cell.toml
//!
//! # Run one batch file and exit with its outcome
//! cell --config config/cell.toml --batch config/batch.toml
//!
//! # Verbose JSON logs
//! cell -v --json
//! ```

use cell_common::config::{CellConfig, ConfigError, ConfigLoader, LogLevel};
use cell_common::consts::DEFAULT_CONFIG_PATH;
use cell_common::keys;
use cell_fsm::Cell;
use cell_fsm::logic::{BatchReport, BatchRequest, BatchStatus};
use cell_hal::BackendRegistry;
use cell_store::SharedStore;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Test cell supervisor
#[derive(Parser, Debug)]
#[command(name = "cell")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Coordinates the robot, instruments and tester of a material test cell")]
#[command(long_about = None)]
struct Args {
    /// Cell configuration file. Defaults apply when it does not exist.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Hardware backend, overriding `[hardware] backend`.
    #[arg(short, long)]
    backend: Option<String>,

    /// Batch file (`[[specimens]]` tables) to run; exit once it is reported.
    #[arg(long, value_name = "FILE")]
    batch: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    match run(&args) {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(e) => {
            error!("FATAL: {e}");
            std::process::exit(1);
        }
    }
}

/// Returns whether the requested batch (if any) completed.
fn run(args: &Args) -> Result<bool, Box<dyn std::error::Error>> {
    // Logging comes up before a config error is returned, so it is reported.
    let loaded = load_config(&args.config);
    setup_tracing(args, log_level(&loaded));
    let (mut config, found) = loaded?;

    info!(
        service = %config.shared.service_name,
        "Test cell supervisor v{} starting",
        env!("CARGO_PKG_VERSION")
    );
    if !found {
        warn!(path = %args.config.display(), "Config file not found, using defaults");
    }
    if let Some(backend) = &args.backend {
        config.hardware.backend = backend.clone();
    }
    config.validate()?;

    let batch = args.batch.as_deref().map(load_batch).transpose()?;

    let registry = BackendRegistry::with_builtin()?;
    let hardware = registry.create(&config.hardware, &config.io)?;
    info!(backend = %config.hardware.backend, "Hardware backend ready");

    let store = SharedStore::new();
    let cell = Cell::new(&config, hardware, store.clone())?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        flag.store(false, Ordering::SeqCst);
    })?;

    let handle = cell.start()?;
    if let Some(request) = &batch {
        info!(specimens = request.specimens.len(), "Submitting batch");
        store.set_as(keys::BATCH_REQUEST, request)?;
    }

    let report = supervise(&store, &running, || handle.is_running(), batch.is_some());
    let stopped = handle.stop();

    let completed = match &report {
        Some(report) => {
            log_report(report);
            report.status == BatchStatus::Completed
        }
        None => batch.is_none(),
    };
    stopped?;
    info!("Test cell supervisor shutdown complete");
    Ok(completed)
}

/// Load `path`, falling back to defaults when it does not exist.
fn load_config(path: &Path) -> Result<(CellConfig, bool), ConfigError> {
    match CellConfig::load(path) {
        Ok(config) => Ok((config, true)),
        Err(ConfigError::FileNotFound) => Ok((CellConfig::default(), false)),
        Err(e) => Err(e),
    }
}

fn load_batch(path: &Path) -> Result<BatchRequest, ConfigError> {
    BatchRequest::load(path).map_err(|e| match e {
        ConfigError::FileNotFound => {
            ConfigError::ParseError(format!("batch file {} not found", path.display()))
        }
        other => other,
    })
}

/// Wait for shutdown, a dead machine thread or, when `until_report`, the
/// batch report.
fn supervise(
    store: &SharedStore,
    running: &AtomicBool,
    alive: impl Fn() -> bool,
    until_report: bool,
) -> Option<BatchReport> {
    let mut seen = store.version();
    loop {
        if let Some(report) = read_report(store) {
            if until_report {
                return Some(report);
            }
            log_report(&report);
            store.clear(keys::BATCH_REPORT);
        }
        if !running.load(Ordering::SeqCst) {
            return None;
        }
        if !alive() {
            error!("An FSM thread exited, shutting down");
            return None;
        }
        seen = store.wait_for_change(seen, Duration::from_millis(200));
    }
}

fn read_report(store: &SharedStore) -> Option<BatchReport> {
    match store.get_as::<BatchReport>(keys::BATCH_REPORT) {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "Unreadable batch report");
            store.clear(keys::BATCH_REPORT);
            None
        }
    }
}

fn log_report(report: &BatchReport) {
    info!(
        status = ?report.status,
        steps = report.steps_completed,
        total = report.total_steps,
        reason = report.reason.as_deref().unwrap_or("-"),
        "Batch finished"
    );
    for specimen in &report.specimens {
        info!(
            floor = specimen.floor,
            tpname = %specimen.tpname,
            qr = specimen.qr.as_deref().unwrap_or("-"),
            thickness = ?specimen.thickness,
            tested = specimen.test.is_some(),
            "Specimen"
        );
    }
}

/// Configured log level, or the default one when the config is unusable.
fn log_level(loaded: &Result<(CellConfig, bool), ConfigError>) -> LogLevel {
    loaded
        .as_ref()
        .map_or_else(|_| LogLevel::default(), |(config, _)| config.shared.log_level)
}

fn setup_tracing(args: &Args, level: LogLevel) {
    let default_level = if args.verbose {
        "debug"
    } else {
        level.as_directive()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if args.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_names(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_names(true)
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn args_parse() {
        let args = Args::parse_from(["cell", "-c", "x.toml", "--batch", "b.toml", "-v"]);
        assert_eq!(args.config, PathBuf::from("x.toml"));
        assert_eq!(args.batch, Some(PathBuf::from("b.toml")));
        assert!(args.verbose && !args.json);
        assert!(args.backend.is_none());
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let (config, found) = load_config(Path::new("/nonexistent/cell.toml")).unwrap();
        assert!(!found);
        assert_eq!(config, CellConfig::default());
    }

    #[test]
    fn shipped_files_load() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../config");
        let (config, found) = load_config(&dir.join("cell.toml")).unwrap();
        assert!(found);
        config.validate().unwrap();
        assert_eq!(config.shared.service_name, "cell-line-01");
        let batch = load_batch(&dir.join("batch.toml")).unwrap();
        batch.validate(config.robot.rack_floors).unwrap();
    }

    #[test]
    fn broken_config_is_an_error() {
        let f = file("[robot\nack_retries = ");
        assert!(matches!(load_config(f.path()), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn broken_config_still_gets_a_log_level() {
        let f = file("[shared]\nservice_name = \"c\"\nlog_level = \"warn\"\n[robot\n");
        let loaded = load_config(f.path());
        assert!(loaded.is_err());
        assert_eq!(log_level(&loaded), LogLevel::Info);

        let f = file("[shared]\nservice_name = \"c\"\nlog_level = \"warn\"\n");
        assert_eq!(log_level(&load_config(f.path())), LogLevel::Warn);
    }

    #[test]
    fn batch_file_lists_specimens() {
        let f = file(
            r#"
[[specimens]]
floor = 1
tpname = "A-01"

[[specimens]]
floor = 4
tpname = "A-02"
"#,
        );
        let batch = load_batch(f.path()).unwrap();
        assert_eq!(batch.specimens.len(), 2);
        assert_eq!(batch.specimens[1].floor, 4);
        assert_eq!(batch.specimens[1].tpname, "A-02");
    }

    #[test]
    fn missing_batch_file_names_the_path() {
        let err = load_batch(Path::new("/nonexistent/batch.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/batch.toml"));
    }

    #[test]
    fn supervise_returns_the_report() {
        let store = SharedStore::new();
        store.set(
            keys::BATCH_REPORT,
            serde_json::json!({
                "status": "completed",
                "steps_completed": 14,
                "total_steps": 14,
                "specimens": [],
            }),
        );
        let running = AtomicBool::new(true);
        let report = supervise(&store, &running, || true, true).expect("report");
        assert_eq!(report.status, BatchStatus::Completed);
    }

    #[test]
    fn supervise_stops_on_signal() {
        let store = SharedStore::new();
        let running = AtomicBool::new(false);
        assert!(supervise(&store, &running, || true, true).is_none());
    }
}
