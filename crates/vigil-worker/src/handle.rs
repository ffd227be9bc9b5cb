//! Parent-side handle of one worker process.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};
use vigil_core::config::{DEFAULT_KILL_TIME_SECS, WorkerConfig};
use vigil_core::error::{Result, VigilError};
use vigil_core::process::{ChildRole, ProcessHandle, SpawnRequest, Spawner, Termination, terminate_escalating};
use vigil_core::queue::{LocalQueue, Message, SharedQueue};

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// A worker process seen from the daemon that owns it.
///
/// The pool owning workers reaps killable ones with [`Worker::kill`].
#[derive(Debug)]
pub struct Worker {
    id: u64,
    settings: WorkerConfig,
    control: SharedQueue,
    process: Option<Box<dyn ProcessHandle>>,
    idle: Duration,
    zombie: bool,
    kill_time: Duration,
}

impl Worker {
    /// New worker with the next process-wide identity.
    pub fn new(settings: WorkerConfig) -> Self {
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            settings,
            control: LocalQueue::shared(format!("worker-{id}:control")),
            process: None,
            idle: Duration::ZERO,
            zombie: false,
            kill_time: Duration::from_secs(DEFAULT_KILL_TIME_SECS),
        }
    }

    pub fn with_kill_time(mut self, kill_time: Duration) -> Self {
        self.kill_time = kill_time;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> String {
        format!("worker-{}", self.id)
    }

    pub fn settings(&self) -> &WorkerConfig {
        &self.settings
    }

    /// Queue read by this worker only.
    pub fn control_queue(&self) -> &SharedQueue {
        &self.control
    }

    /// Spawn the worker process reading `intake` and writing `results`.
    pub fn start(
        &mut self,
        spawner: &dyn Spawner,
        daemon_name: &str,
        intake: SharedQueue,
        results: SharedQueue,
    ) -> Result<()> {
        if self.process.is_some() {
            self.kill();
        }
        let request = SpawnRequest {
            name: self.name(),
            daemon_name: daemon_name.to_string(),
            title: format!("{daemon_name}-worker-{}", self.id),
            role: ChildRole::Worker {
                id: self.id,
                settings: self.settings.clone(),
            },
            control: Some(Arc::clone(&self.control)),
            input: Some(intake),
            output: Some(results),
        };
        let process = spawner.spawn(request)?;
        info!(worker_id = self.id, pid = process.pid(), "worker started");
        self.process = Some(process);
        self.zombie = false;
        self.idle = Duration::ZERO;
        Ok(())
    }

    /// Ask the worker to stop at its next tick.
    pub fn send_stop(&self) -> Result<()> {
        if self.process.is_none() {
            return Err(VigilError::WorkerNotRunning { worker_id: self.id });
        }
        debug!(worker_id = self.id, "sending stop message");
        self.control.put(Message::stop())
    }

    /// Escalating termination; the handle is dropped afterwards.
    pub fn kill(&mut self) -> Termination {
        let name = self.name();
        let outcome = match self.process.as_mut() {
            Some(process) => terminate_escalating(process.as_mut(), &name, self.kill_time),
            None => Termination::AlreadyExited,
        };
        if outcome == Termination::Abandoned {
            warn!(worker_id = self.id, "worker abandoned");
        }
        self.process = None;
        outcome
    }

    pub fn is_alive(&mut self) -> bool {
        self.process.as_mut().is_some_and(|process| process.is_alive())
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|process| process.pid())
    }

    /// Mortal and idle for longer than the idle timeout.
    pub fn is_killable(&self) -> bool {
        self.settings.mortal && self.idle > self.settings.idle_timeout
    }

    pub fn add_idle_time(&mut self, elapsed: Duration) {
        self.idle += elapsed;
    }

    pub fn reset_idle(&mut self) {
        self.idle = Duration::ZERO;
    }

    pub fn idle_time(&self) -> Duration {
        self.idle
    }

    /// Mark the worker as dead without having been asked to.
    pub fn set_zombie(&mut self) {
        self.zombie = true;
    }

    pub fn is_zombie(&self) -> bool {
        self.zombie
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::testing::FakeSpawner;

    fn settings() -> WorkerConfig {
        WorkerConfig {
            idle_timeout: Duration::from_secs(10),
            ..WorkerConfig::default()
        }
    }

    #[test]
    fn test_identities_are_unique_and_increasing() {
        let a = Worker::new(settings());
        let b = Worker::new(settings());
        assert!(b.id() > a.id());
        assert_ne!(a.name(), b.name());
    }

    #[test]
    fn test_start_wires_control_before_intake() {
        let spawner = FakeSpawner::new();
        let mut worker = Worker::new(settings());
        let intake = LocalQueue::shared("intake");
        let results = LocalQueue::shared("results");
        worker.start(&spawner, "poller", intake, results).unwrap();

        let request = spawner.last_request(&worker.name()).unwrap();
        worker.send_stop().unwrap();
        assert!(request.control.unwrap().try_get().unwrap().unwrap().is_stop());
        assert!(request.input.unwrap().is_empty());
        assert!(matches!(request.role, ChildRole::Worker { id, .. } if id == worker.id()));
        assert_eq!(request.title, format!("poller-worker-{}", worker.id()));
        assert!(worker.is_alive());
    }

    #[test]
    fn test_send_stop_requires_process() {
        let worker = Worker::new(settings());
        assert!(matches!(worker.send_stop(), Err(VigilError::WorkerNotRunning { .. })));
    }

    #[test]
    fn test_kill_uses_escalation() {
        let spawner = FakeSpawner::new();
        let mut worker = Worker::new(settings()).with_kill_time(Duration::from_millis(1));
        worker
            .start(&spawner, "poller", LocalQueue::shared("i"), LocalQueue::shared("r"))
            .unwrap();
        let control = spawner.last(&worker.name()).unwrap();
        control.set_ignores_terminate(true);

        assert_eq!(worker.kill(), Termination::Killed);
        assert_eq!(control.signals(), vec!["TERM", "KILL"]);
        assert!(worker.pid().is_none());
        assert_eq!(worker.kill(), Termination::AlreadyExited);
    }

    #[test]
    fn test_killable_only_when_mortal_and_idle() {
        let mut worker = Worker::new(settings());
        worker.add_idle_time(Duration::from_secs(6));
        assert!(!worker.is_killable());
        worker.add_idle_time(Duration::from_secs(6));
        assert!(worker.is_killable());
        worker.reset_idle();
        assert!(!worker.is_killable());

        let mut immortal = Worker::new(WorkerConfig {
            mortal: false,
            ..settings()
        });
        immortal.add_idle_time(Duration::from_secs(60));
        assert!(!immortal.is_killable());
    }

    #[test]
    fn test_zombie_flag_cleared_on_start() {
        let spawner = FakeSpawner::new();
        let mut worker = Worker::new(settings());
        worker.set_zombie();
        assert!(worker.is_zombie());
        worker
            .start(&spawner, "poller", LocalQueue::shared("i"), LocalQueue::shared("r"))
            .unwrap();
        assert!(!worker.is_zombie());
    }
}
