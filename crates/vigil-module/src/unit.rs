//! Process lifecycle of one module instance.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use vigil_core::config::{DEFAULT_KILL_TIME_SECS, ModuleDescriptor};
use vigil_core::error::{Result, VigilError};
use vigil_core::log_module_event;
use vigil_core::process::{ChildRole, ProcessHandle, SpawnRequest, Spawner, Termination, terminate_escalating};
use vigil_core::queue::{QueueFactory, QueuePair, SharedQueue};

use crate::module::{Capabilities, Module, ModuleProperties, Phase};

/// One module instance and, when external, its process and queues.
///
/// Internal units never own a process or queues: `create_queues` and
/// `start` are no-ops for them.
pub struct ModuleUnit {
    descriptor: ModuleDescriptor,
    properties: ModuleProperties,
    capabilities: Capabilities,
    module: Box<dyn Module>,
    queues: Option<QueuePair>,
    queue_factory: Option<Arc<dyn QueueFactory>>,
    process: Option<Box<dyn ProcessHandle>>,
    init_attempts: u32,
    last_init_attempt: Option<Instant>,
    kill_time: Duration,
    loaded_into: Option<String>,
}

impl ModuleUnit {
    pub fn new(descriptor: ModuleDescriptor, properties: ModuleProperties, module: Box<dyn Module>) -> Self {
        let capabilities = module.capabilities();
        Self {
            descriptor,
            properties,
            capabilities,
            module,
            queues: None,
            queue_factory: None,
            process: None,
            init_attempts: 0,
            last_init_attempt: None,
            kill_time: Duration::from_secs(DEFAULT_KILL_TIME_SECS),
            loaded_into: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn properties(&self) -> &ModuleProperties {
        &self.properties
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn is_external(&self) -> bool {
        self.properties.external
    }

    pub fn has_phase(&self, phase: Phase) -> bool {
        self.properties.has_phase(phase)
    }

    /// Name of the daemon that loaded this unit.
    pub fn loaded_into(&self) -> Option<&str> {
        self.loaded_into.as_deref()
    }

    pub fn set_loaded_into(&mut self, daemon: impl Into<String>) {
        self.loaded_into = Some(daemon.into());
    }

    /// Grace period between terminate and kill.
    pub fn set_kill_time(&mut self, kill_time: Duration) {
        self.kill_time = kill_time;
    }

    pub fn init_attempts(&self) -> u32 {
        self.init_attempts
    }

    pub fn last_init_attempt(&self) -> Option<Instant> {
        self.last_init_attempt
    }

    /// Count a new init attempt; returns the new count.
    pub(crate) fn count_init_attempt(&mut self) -> u32 {
        self.init_attempts += 1;
        self.init_attempts
    }

    pub(crate) fn record_init_attempt(&mut self, at: Instant) {
        self.last_init_attempt = Some(at);
    }

    // =========================================================================
    // Queues
    // =========================================================================

    /// Allocate a fresh queue pair, releasing any previous one first.
    ///
    /// On failure the unit keeps no queues and can be retried.
    pub fn create_queues(&mut self, factory: Arc<dyn QueueFactory>) -> Result<()> {
        if !self.is_external() {
            return Ok(());
        }
        self.clear_queues();
        let pair = factory.create_pair(self.name()).map_err(|e| match e {
            VigilError::QueueAllocation { .. } => e,
            other => VigilError::queue_allocation(self.name(), other.to_string()),
        })?;
        debug!(module = %self.name(), "queues allocated");
        self.queues = Some(pair);
        self.queue_factory = Some(factory);
        Ok(())
    }

    /// Close and release the queue pair, if any.
    pub fn clear_queues(&mut self) {
        if let Some(pair) = self.queues.take() {
            pair.close();
            if let Some(factory) = self.queue_factory.take() {
                factory.release(self.name());
            }
            debug!(module = %self.name(), "queues released");
        }
    }

    pub fn has_queues(&self) -> bool {
        self.queues.is_some()
    }

    /// Parent to module queue.
    pub fn inbound_queue(&self) -> Option<&SharedQueue> {
        self.queues.as_ref().map(|pair| &pair.inbound)
    }

    /// Module to parent queue.
    pub fn outbound_queue(&self) -> Option<&SharedQueue> {
        self.queues.as_ref().map(|pair| &pair.outbound)
    }

    /// Messages waiting for the module.
    pub fn inbound_depth(&self) -> usize {
        self.inbound_queue().map_or(0, |queue| queue.len())
    }

    // =========================================================================
    // Process
    // =========================================================================

    /// Spawn the module's process, stopping a previous one first.
    pub fn start(&mut self, spawner: &dyn Spawner) -> Result<()> {
        if !self.is_external() {
            return Ok(());
        }
        if self.process.is_some() {
            info!(module = %self.name(), "stopping previous process before start");
            self.stop();
        }
        let Some(pair) = self.queues.as_ref() else {
            return Err(VigilError::queue_allocation(
                self.name(),
                "queues must be created before start",
            ));
        };

        let daemon_name = self.loaded_into.clone().unwrap_or_default();
        let request = SpawnRequest {
            name: self.name().to_string(),
            title: process_title(&daemon_name, self.name()),
            daemon_name,
            role: ChildRole::Module {
                descriptor: self.descriptor.clone(),
            },
            control: None,
            input: Some(Arc::clone(&pair.inbound)),
            output: Some(Arc::clone(&pair.outbound)),
        };
        let process = spawner.spawn(request)?;
        let pid = process.pid();
        self.process = Some(process);
        log_module_event!(self.name(), "started", pid = pid);
        Ok(())
    }

    /// Escalating termination of the process; the handle is kept.
    pub fn kill(&mut self) -> Termination {
        let name = self.descriptor.name.clone();
        match self.process.as_mut() {
            Some(process) => terminate_escalating(process.as_mut(), &name, self.kill_time),
            None => Termination::AlreadyExited,
        }
    }

    /// Kill the process and drop its handle. No-op when not started.
    pub fn stop(&mut self) -> Termination {
        if self.process.is_none() {
            return Termination::AlreadyExited;
        }
        let outcome = self.kill();
        self.process = None;
        log_module_event!(self.name(), "stopped", outcome = ?outcome);
        outcome
    }

    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|process| process.pid())
    }

    /// Whether the process exists and is running.
    pub fn is_alive(&mut self) -> bool {
        self.process.as_mut().is_some_and(|process| process.is_alive())
    }

    // =========================================================================
    // Module hooks
    // =========================================================================

    /// Run the module's init hook. Panics are reported as errors.
    pub fn init(&mut self) -> anyhow::Result<bool> {
        match catch_unwind(AssertUnwindSafe(|| self.module.init())) {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("init panicked")),
        }
    }

    /// Call the quit hook if the module has one. Returns whether it ran.
    pub fn quit(&mut self) -> bool {
        if !self.capabilities.quit {
            return false;
        }
        if catch_unwind(AssertUnwindSafe(|| self.module.quit())).is_err() {
            warn!(module = %self.name(), "quit hook panicked");
        }
        true
    }

    /// Run the retention load hook. Panics are reported as errors.
    pub fn load_retention(&mut self) -> anyhow::Result<()> {
        match catch_unwind(AssertUnwindSafe(|| self.module.load_retention())) {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("retention load panicked")),
        }
    }

    /// Run the retention save hook. Panics are reported as errors.
    pub fn save_retention(&mut self) -> anyhow::Result<()> {
        match catch_unwind(AssertUnwindSafe(|| self.module.save_retention())) {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("retention save panicked")),
        }
    }

    pub fn hook_tick(&mut self) {
        if catch_unwind(AssertUnwindSafe(|| self.module.hook_tick())).is_err() {
            warn!(module = %self.name(), "tick hook panicked");
        }
    }
}

impl std::fmt::Debug for ModuleUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleUnit")
            .field("name", &self.descriptor.name)
            .field("external", &self.properties.external)
            .field("pid", &self.pid())
            .field("init_attempts", &self.init_attempts)
            .finish()
    }
}

fn process_title(daemon: &str, module: &str) -> String {
    if daemon.is_empty() {
        format!("vigil-{module}")
    } else {
        format!("{daemon}-{module}")
    }
}
