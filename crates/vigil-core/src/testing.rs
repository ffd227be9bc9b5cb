//! In-memory process doubles for supervisor and worker tests.
//!
//! [`FakeSpawner`] hands out [`FakeProcess`] handles whose liveness is
//! driven by a [`FakeControl`], so tests can "crash" a child without an OS
//! process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, VigilError};
use crate::process::{ProcessHandle, SpawnRequest, Spawner};

#[derive(Debug, Default)]
struct FakeState {
    exited: bool,
    immortal: bool,
    ignores_terminate: bool,
    signals: Vec<&'static str>,
}

/// Fake child process.
#[derive(Debug)]
pub struct FakeProcess {
    pid: u32,
    state: Arc<Mutex<FakeState>>,
}

impl FakeProcess {
    pub fn new(pid: u32) -> (Self, FakeControl) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        (
            Self {
                pid,
                state: Arc::clone(&state),
            },
            FakeControl { pid, state },
        )
    }
}

impl ProcessHandle for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        !self.state.lock().exited
    }

    fn terminate(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.signals.push("TERM");
        if !state.ignores_terminate && !state.immortal {
            state.exited = true;
        }
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.signals.push("KILL");
        if !state.immortal {
            state.exited = true;
        }
        Ok(())
    }

    fn join(&mut self, _timeout: Duration) -> bool {
        self.state.lock().exited
    }
}

/// Test-side control over a [`FakeProcess`].
#[derive(Debug, Clone)]
pub struct FakeControl {
    pid: u32,
    state: Arc<Mutex<FakeState>>,
}

impl FakeControl {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Make the process exit as if it crashed.
    pub fn exit(&self) {
        self.state.lock().exited = true;
    }

    pub fn is_alive(&self) -> bool {
        !self.state.lock().exited
    }

    /// Survive both terminate and kill.
    pub fn set_immortal(&self, immortal: bool) {
        self.state.lock().immortal = immortal;
    }

    /// Survive terminate only.
    pub fn set_ignores_terminate(&self, ignores: bool) {
        self.state.lock().ignores_terminate = ignores;
    }

    /// Signals delivered so far.
    pub fn signals(&self) -> Vec<&'static str> {
        self.state.lock().signals.clone()
    }
}

/// Spawner producing fake processes.
#[derive(Debug)]
pub struct FakeSpawner {
    next_pid: AtomicU32,
    fail_next: AtomicBool,
    spawned: Mutex<Vec<(SpawnRequest, FakeControl)>>,
}

impl Default for FakeSpawner {
    fn default() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            fail_next: AtomicBool::new(false),
            spawned: Mutex::new(Vec::new()),
        }
    }
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next spawn fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().len()
    }

    /// Number of spawns for the unit `name`.
    pub fn spawns_of(&self, name: &str) -> usize {
        self.spawned
            .lock()
            .iter()
            .filter(|(request, _)| request.name == name)
            .count()
    }

    /// Control of the most recent process spawned for `name`.
    pub fn last(&self, name: &str) -> Option<FakeControl> {
        self.spawned
            .lock()
            .iter()
            .rev()
            .find(|(request, _)| request.name == name)
            .map(|(_, control)| control.clone())
    }

    /// The most recent request for `name`.
    pub fn last_request(&self, name: &str) -> Option<SpawnRequest> {
        self.spawned
            .lock()
            .iter()
            .rev()
            .find(|(request, _)| request.name == name)
            .map(|(request, _)| request.clone())
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn ProcessHandle>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(VigilError::process_spawn(&request.name, "injected spawn failure"));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (process, control) = FakeProcess::new(pid);
        self.spawned.lock().push((request, control));
        Ok(Box::new(process))
    }
}
