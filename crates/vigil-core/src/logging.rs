//! Tracing setup for daemons and their children.
//!
//! A daemon writes JSON lines to `<log_dir>/<daemon>.log`, rolled daily,
//! and a compact human stream to stderr. Children only write to stderr,
//! which they inherit from the daemon: their stdout carries queue traffic.
//!
//! `RUST_LOG` always wins over the built-in default of `vigil=info`
//! (`vigil=debug` when verbose).
//!
//! ```no_run
//! use vigil_core::logging;
//!
//! let _guard = logging::init_logging(None, "broker-master", false).expect("logging init");
//! tracing::info!(module = "retention", "module started");
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::{Result, VigilError};

/// Target of module lifecycle events.
pub const MODULE_TARGET: &str = "vigil::module";

/// Keeps the file writer alive; dropping it flushes pending lines.
pub struct LogGuard {
    file: Option<WorkerGuard>,
}

impl fmt::Debug for LogGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogGuard").field("file", &self.file.is_some()).finish()
    }
}

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "vigil=debug" } else { "vigil=info" })
    })
}

/// Log file of `daemon_name` inside `log_dir`.
pub fn log_file_name(daemon_name: &str) -> String {
    let cleaned: String = daemon_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{cleaned}.log")
}

/// Install the daemon subscriber: JSON file layer plus stderr console.
///
/// `log_dir` defaults to [`default_log_dir`]. With `verbose` the console
/// also shows source locations.
pub fn init_logging(log_dir: Option<PathBuf>, daemon_name: &str, verbose: bool) -> Result<LogGuard> {
    let log_dir = match log_dir {
        Some(dir) => dir,
        None => default_log_dir()?,
    };
    ensure_dir(&log_dir)?;

    let appender = tracing_appender::rolling::daily(&log_dir, log_file_name(daemon_name));
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter(verbose))
        .with(layer().json().with_writer(writer).with_ansi(false).with_thread_names(true))
        .with(
            layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_file(verbose)
                .with_line_number(verbose),
        )
        .try_init()
        .map_err(|e| VigilError::internal(format!("logging already initialized: {e}")))?;

    tracing::debug!(log_dir = %log_dir.display(), daemon = daemon_name, "logging initialized");
    Ok(LogGuard { file: Some(guard) })
}

fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| VigilError::DirectoryCreation {
        path: dir.to_path_buf(),
        source: e,
    })
}

/// Install the stderr-only subscriber of a spawned child.
///
/// Never fails: a child that cannot log still runs.
pub fn init_child_logging(verbose: bool) -> LogGuard {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(verbose))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .compact()
        .try_init();
    LogGuard { file: None }
}

/// Debug-level subscriber for tests; safe to call repeatedly.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

/// `~/.vigil/logs/`
pub fn default_log_dir() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".vigil").join("logs"))
        .ok_or_else(|| VigilError::internal("HOME is not set, pass a log directory"))
}

/// Log a module lifecycle event on [`MODULE_TARGET`].
///
/// ```ignore
/// log_module_event!("retention", "started");
/// log_module_event!("retention", "restart_queued", reason = "dead process");
/// ```
#[macro_export]
macro_rules! log_module_event {
    ($module:expr, $event:expr) => {
        tracing::info!(target: "vigil::module", module = $module, event = $event, "module event")
    };
    ($module:expr, $event:expr, $($field:tt)*) => {
        tracing::info!(
            target: "vigil::module",
            module = $module,
            event = $event,
            $($field)*,
            "module event"
        )
    };
}
