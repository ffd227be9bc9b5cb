//! The parent daemon: module supervisor, worker pool and the check loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use vigil_core::queue::{LocalQueueFactory, MessageQueue};
use vigil_core::{DaemonConfig, Result, Spawner};
use vigil_module::{ModuleRegistry, ModuleSupervisor, builtin};

use crate::pool::WorkerPool;

/// Registry of every module implementation this binary ships.
pub fn registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    builtin::register_builtins(&mut registry);
    registry
}

pub struct Daemon {
    config: DaemonConfig,
    supervisor: ModuleSupervisor,
    pool: Option<WorkerPool>,
    last_check: Instant,
}

impl Daemon {
    pub fn new(config: DaemonConfig, spawner: Arc<dyn Spawner>) -> Self {
        let mut supervisor = ModuleSupervisor::new(
            config.supervisor.clone(),
            Arc::new(registry()),
            Arc::new(LocalQueueFactory),
            Arc::clone(&spawner),
        );
        supervisor.set_daemon_name(&config.daemon.name);

        let pool = config.daemon.kind.dispatches_checks().then(|| {
            WorkerPool::new(
                config.worker.clone(),
                config.supervisor.kill_time,
                spawner,
                &config.daemon.name,
            )
        });

        Self {
            config,
            supervisor,
            pool,
            last_check: Instant::now(),
        }
    }

    pub fn supervisor(&self) -> &ModuleSupervisor {
        &self.supervisor
    }

    pub fn pool(&self) -> Option<&WorkerPool> {
        self.pool.as_ref()
    }

    /// Load, initialize and start every configured module, then the workers.
    pub fn start(&mut self) -> Result<()> {
        let loaded = self.supervisor.load(&self.config.modules);
        let instantiated = self.supervisor.instantiate();
        for message in self.supervisor.load_warnings() {
            warn!("{message}");
        }
        for message in self.supervisor.load_errors() {
            error!("{message}");
        }

        self.supervisor.init_internals(true);
        let retained = self.supervisor.load_retention();
        self.supervisor.start_externals(true);

        let workers = self.pool.as_mut().map_or(0, WorkerPool::fill);
        info!(
            daemon = %self.config.daemon.name,
            kind = %self.config.daemon.kind,
            loaded,
            instantiated,
            retained,
            workers,
            "daemon started"
        );
        self.last_check = Instant::now();
        Ok(())
    }

    /// One pass of the supervisory loop.
    pub fn check(&mut self) {
        let elapsed = self.last_check.elapsed();
        self.last_check = Instant::now();

        self.supervisor.tick();
        for (name, queue) in self.supervisor.external_outbound_queues() {
            let mut drained = 0;
            while let Ok(Some(message)) = queue.try_get() {
                debug!(module = %name, kind = %message.kind, "module message");
                drained += 1;
            }
            if drained > 0 {
                debug!(module = %name, drained, "module output drained");
            }
        }

        if let Some(pool) = self.pool.as_mut() {
            let finished = pool.drain_results();
            pool.maintain(elapsed, finished > 0);
        }
    }

    pub fn check_interval(&self) -> Duration {
        self.config.supervisor.check_interval
    }

    /// Stop every module and worker.
    pub fn shutdown(&mut self) {
        info!(daemon = %self.config.daemon.name, "shutting down");
        if let Some(pool) = self.pool.as_mut() {
            pool.shutdown();
        }
        let saved = self.supervisor.save_retention();
        debug!(saved, "retention saved");
        self.supervisor.shutdown_all();
    }
}

/// Wait for SIGINT, SIGTERM or SIGQUIT.
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Run the check loop until a shutdown signal arrives.
pub async fn run(mut daemon: Daemon) -> Result<()> {
    daemon.start()?;

    let mut interval = tokio::time::interval(daemon.check_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!(error = %e, "signal handling failed");
                }
                break;
            }
            _ = interval.tick() => daemon.check(),
        }
    }

    daemon.shutdown();
    Ok(())
}
