//! Vigil - monitoring daemon with supervised module and worker processes
//!
//! ## Usage
//!
//! ```bash
//! # Run a daemon
//! vigil run --config /etc/vigil/poller.yaml
//!
//! # Validate a configuration and exit
//! vigil run --config /etc/vigil/poller.yaml --check
//!
//! # With verbose logging and a custom log directory
//! vigil -v run --config broker.yaml --log-dir /var/log/vigil/
//!
//! # List built-in module implementations
//! vigil modules
//! ```
//!
//! Module and worker processes are re-executions of this binary through the
//! hidden `child` command; their role comes from the environment.

mod daemon;
mod pool;

use std::panic;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use vigil_core::logging::{self, LogGuard};
use vigil_core::{ChildIo, ChildRole, CommandSpawner, DaemonConfig, VigilError};
use vigil_module::run_module_child;
use vigil_worker::run_worker_child;

use crate::daemon::Daemon;

/// Vigil monitoring daemon
#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging (increases log level)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a daemon
    Run {
        /// Daemon configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Directory for log files (defaults to ~/.vigil/logs/)
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Validate the configuration and exit
        #[arg(long)]
        check: bool,
    },

    /// List the module implementations built into this binary
    Modules,

    /// Run as a module or worker process
    #[command(hide = true)]
    Child,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            log_dir,
            check,
        } => run_daemon(config, log_dir, check, cli.verbose > 0),
        Command::Modules => {
            for name in daemon::registry().names() {
                println!("{name}");
            }
            ExitCode::SUCCESS
        }
        Command::Child => run_child(cli.verbose > 0),
    }
}

fn run_daemon(path: PathBuf, log_dir: Option<PathBuf>, check: bool, verbose: bool) -> ExitCode {
    let config = match DaemonConfig::load(&path) {
        Ok(config) => config,
        Err(e) => return report(&e),
    };
    if check {
        println!("{}: configuration OK ({} modules)", path.display(), config.modules.len());
        return ExitCode::SUCCESS;
    }

    let _guard = match setup_logging(&config, log_dir, verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::from(1);
        }
    };
    install_panic_hook();

    info!(daemon = %config.daemon.name, config = %path.display(), "starting vigil");

    let spawner = match CommandSpawner::current_exe() {
        Ok(spawner) => Arc::new(spawner),
        Err(e) => return report(&e),
    };
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot build the async runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(daemon::run(Daemon::new(config, spawner))) {
        Ok(()) => {
            info!("vigil exited normally");
            ExitCode::SUCCESS
        }
        Err(e) => report(&e),
    }
}

fn run_child(verbose: bool) -> ExitCode {
    let _guard = logging::init_child_logging(verbose);
    install_panic_hook();

    let io = ChildRole::from_env().and_then(|role| Ok((role, ChildIo::attach_stdio()?)));
    let (role, io) = match io {
        Ok(pair) => pair,
        Err(e) => return report(&e),
    };

    let code = match role {
        ChildRole::Module { descriptor } => run_module_child(&daemon::registry(), &descriptor, io).code(),
        ChildRole::Worker { id, settings } => run_worker_child(id, settings, io).code(),
    };
    ExitCode::from(code)
}

/// Log and print an error with its operator guidance.
fn report(e: &VigilError) -> ExitCode {
    error!(error = %e, "vigil failed");
    eprintln!("Error: {}", e);
    if let Some(guidance) = e.guidance() {
        eprintln!("  {}", guidance);
    }
    ExitCode::from(1)
}

/// Set up logging from the configuration, overridden by CLI arguments.
fn setup_logging(config: &DaemonConfig, log_dir: Option<PathBuf>, verbose: bool) -> vigil_core::Result<LogGuard> {
    let log_dir = log_dir.or_else(|| config.logging.dir.clone());
    logging::init_logging(log_dir, &config.daemon.name, verbose || config.logging.verbose)
}

/// Route panics through tracing before the default hook prints them.
fn install_panic_hook() {
    let original_hook = panic::take_hook();

    panic::set_hook(Box::new(move |panic_info| {
        error!(panic = %panic_info, "panic");
        original_hook(panic_info);
    }));
}
