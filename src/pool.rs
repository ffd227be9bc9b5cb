//! Check worker pool of a dispatching daemon.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use vigil_core::config::WorkerConfig;
use vigil_core::queue::{ITEM_MESSAGE, LocalQueue, Message, MessageQueue, SharedQueue};
use vigil_core::{Result, Spawner};
use vigil_worker::run_loop::RETURNED_MESSAGE;
use vigil_worker::{CommandAction, Worker};

/// Workers sharing one intake queue and one results queue.
///
/// Dead workers are replaced on the next [`maintain`](Self::maintain).
/// Mortal workers idle past their timeout are reaped and only come back
/// once work is waiting.
pub struct WorkerPool {
    settings: WorkerConfig,
    kill_time: Duration,
    spawner: Arc<dyn Spawner>,
    daemon_name: String,
    intake: SharedQueue,
    results: SharedQueue,
    workers: Vec<Worker>,
}

impl WorkerPool {
    pub fn new(settings: WorkerConfig, kill_time: Duration, spawner: Arc<dyn Spawner>, daemon_name: &str) -> Self {
        Self {
            settings,
            kill_time,
            spawner,
            daemon_name: daemon_name.to_string(),
            intake: LocalQueue::shared(format!("{daemon_name}:intake")),
            results: LocalQueue::shared(format!("{daemon_name}:results")),
            workers: Vec::new(),
        }
    }

    /// Queue the workers pull actions from.
    pub fn intake(&self) -> &SharedQueue {
        &self.intake
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Queue an action for the next free worker.
    pub fn submit(&self, action: &CommandAction) -> Result<()> {
        self.intake.put(Message::encode(ITEM_MESSAGE, action)?)
    }

    /// Start workers until the configured count is reached. Returns the
    /// number started.
    pub fn fill(&mut self) -> usize {
        let mut started = 0;
        while self.workers.len() < self.settings.count {
            let mut worker = Worker::new(self.settings.clone()).with_kill_time(self.kill_time);
            let spawned = worker.start(
                self.spawner.as_ref(),
                &self.daemon_name,
                Arc::clone(&self.intake),
                Arc::clone(&self.results),
            );
            if let Err(e) = spawned {
                warn!(error = %e, "cannot start worker, retrying next check");
                break;
            }
            self.workers.push(worker);
            started += 1;
        }
        started
    }

    /// Replace dead workers, account idle time and reap idle ones.
    pub fn maintain(&mut self, elapsed: Duration, busy: bool) {
        for worker in &mut self.workers {
            if !worker.is_alive() {
                warn!(worker_id = worker.id(), "worker died unexpectedly, replacing it");
                worker.set_zombie();
            } else if busy {
                worker.reset_idle();
            } else {
                worker.add_idle_time(elapsed);
            }
        }
        self.workers.retain(|worker| !worker.is_zombie());

        let mut kept = Vec::with_capacity(self.workers.len());
        for mut worker in self.workers.drain(..) {
            if worker.is_killable() {
                info!(worker_id = worker.id(), idle = ?worker.idle_time(), "reaping idle worker");
                if let Err(e) = worker.send_stop() {
                    debug!(worker_id = worker.id(), error = %e, "stop message not sent");
                }
                worker.kill();
            } else {
                kept.push(worker);
            }
        }
        self.workers = kept;

        if busy || !self.settings.mortal || self.intake.len() > 0 {
            self.fill();
        }
    }

    /// Read every result the workers pushed. Actions handed back by a dying
    /// worker are queued again. Returns the number of finished actions.
    pub fn drain_results(&self) -> usize {
        let mut finished = 0;
        while let Ok(Some(message)) = self.results.try_get() {
            if message.kind == RETURNED_MESSAGE {
                debug!("action handed back, queueing it again");
                if let Err(e) = self.intake.put(Message::new(ITEM_MESSAGE, message.payload)) {
                    warn!(error = %e, "returned action dropped");
                }
                continue;
            }
            match message.decode::<CommandAction>() {
                Ok(action) => {
                    info!(
                        id = action.id,
                        status = ?action.status,
                        exit_code = ?action.exit_code,
                        "action finished"
                    );
                    finished += 1;
                }
                Err(e) => warn!(kind = %message.kind, error = %e, "unreadable worker result"),
            }
        }
        finished
    }

    /// Ask every worker to stop, then terminate them.
    pub fn shutdown(&mut self) {
        for worker in &self.workers {
            if let Err(e) = worker.send_stop() {
                debug!(worker_id = worker.id(), error = %e, "stop message not sent");
            }
        }
        for mut worker in self.workers.drain(..) {
            worker.kill();
        }
        self.intake.close();
        self.results.close();
    }
}
