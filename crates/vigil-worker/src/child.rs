//! Entry point of a worker process.

use tracing::{debug, warn};
use vigil_core::config::WorkerConfig;
use vigil_core::process::ENV_PROCESS_TITLE;
use vigil_core::signals::{StopToken, install_child_handlers, set_process_title};
use vigil_core::stdio::ChildIo;

use crate::action::CommandAction;
use crate::run_loop::{ExitReason, WorkerLoop};

/// Run a command worker over `io` until it exits.
pub fn run_worker_child(id: u64, settings: WorkerConfig, io: ChildIo) -> ExitReason {
    let title = std::env::var(ENV_PROCESS_TITLE).unwrap_or_else(|_| format!("vigil-worker-{id}"));
    if !set_process_title(&title) {
        debug!(title = %title, "process title not set");
    }

    let stop = StopToken::new();
    let listener = match install_child_handlers(stop.clone()) {
        Ok(listener) => Some(listener),
        Err(e) => {
            warn!(worker_id = id, error = %e, "signal handlers not installed");
            None
        }
    };

    let reason = WorkerLoop::<CommandAction>::new(id, settings, io)
        .with_stop_token(stop)
        .run();

    if let Some(listener) = listener {
        listener.close();
    }
    reason
}
