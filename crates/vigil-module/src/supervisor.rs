//! Supervision of the module instances of one daemon.
//!
//! The supervisor turns module descriptors into [`ModuleUnit`]s and keeps
//! the external ones running:
//!
//! 1. [`load`](ModuleSupervisor::load) resolves descriptors against the
//!    registry, recording failures in `load_errors`
//! 2. [`instantiate`](ModuleSupervisor::instantiate) builds one unit per
//!    resolved descriptor
//! 3. [`start_externals`](ModuleSupervisor::start_externals) inits and
//!    spawns external units
//! 4. [`check_liveness`](ModuleSupervisor::check_liveness) and
//!    [`retry_pending`](ModuleSupervisor::retry_pending) run on every tick of
//!    the daemon loop
//! 5. [`shutdown_all`](ModuleSupervisor::shutdown_all) stops everything
//!
//! Failures of one instance never stop the others from loading, starting or
//! restarting.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};
use vigil_core::config::{ModuleDescriptor, SupervisorConfig};
use vigil_core::error::VigilError;
use vigil_core::log_module_event;
use vigil_core::process::Spawner;
use vigil_core::queue::{QueueFactory, SharedQueue};

use crate::module::Phase;
use crate::registry::{ModuleRegistry, ResolvedModule};
use crate::unit::ModuleUnit;

/// Module supervisor of one daemon.
#[derive(Debug)]
pub struct ModuleSupervisor {
    config: SupervisorConfig,
    registry: Arc<ModuleRegistry>,
    queue_factory: Arc<dyn QueueFactory>,
    spawner: Arc<dyn Spawner>,
    daemon_name: String,
    configured: BTreeMap<String, ModuleDescriptor>,
    resolved: Vec<ResolvedModule>,
    instances: Vec<ModuleUnit>,
    pending_restart: Vec<String>,
    load_errors: Vec<String>,
    load_warnings: Vec<String>,
}

impl ModuleSupervisor {
    pub fn new(
        config: SupervisorConfig,
        registry: Arc<ModuleRegistry>,
        queue_factory: Arc<dyn QueueFactory>,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        Self {
            config,
            registry,
            queue_factory,
            spawner,
            daemon_name: String::new(),
            configured: BTreeMap::new(),
            resolved: Vec::new(),
            instances: Vec::new(),
            pending_restart: Vec::new(),
            load_errors: Vec::new(),
            load_warnings: Vec::new(),
        }
    }

    /// Name of the daemon owning the modules, passed to every instance.
    pub fn set_daemon_name(&mut self, name: impl Into<String>) {
        self.daemon_name = name.into();
        let name = self.daemon_name.clone();
        for unit in &mut self.instances {
            unit.set_loaded_into(name.clone());
        }
    }

    pub fn daemon_name(&self) -> &str {
        &self.daemon_name
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Resolve `descriptors`, replacing the previous resolution.
    ///
    /// Disabled descriptors are recorded for lookups but not resolved.
    /// Returns the number of resolved descriptors.
    pub fn load(&mut self, descriptors: &[ModuleDescriptor]) -> usize {
        self.configured.clear();
        self.resolved.clear();

        for descriptor in descriptors {
            if self.configured.contains_key(&descriptor.name) {
                self.record_error(format!(
                    "Module {}: declared more than once, keeping the first declaration",
                    descriptor.name
                ));
                continue;
            }
            self.configured
                .insert(descriptor.name.clone(), descriptor.clone());

            if !descriptor.enabled {
                debug!(module = %descriptor.name, "module disabled, not resolving");
                continue;
            }
            match self.registry.resolve(descriptor) {
                Ok(resolved) => {
                    debug!(
                        module = %descriptor.name,
                        implementation = %descriptor.implementation,
                        external = resolved.properties.external,
                        "module resolved"
                    );
                    self.resolved.push(resolved);
                }
                Err(e) => self.record_error(e.to_string()),
            }
        }

        let mut dangling = Vec::new();
        for resolved in &self.resolved {
            for reference in &resolved.descriptor.modules {
                if !self.configured.contains_key(reference) {
                    dangling.push(format!(
                        "Module {}: refers to undeclared module '{reference}'",
                        resolved.descriptor.name
                    ));
                }
            }
        }
        for warning in dangling {
            self.record_warning(warning);
        }

        info!(
            resolved = self.resolved.len(),
            declared = self.configured.len(),
            "modules loaded"
        );
        self.resolved.len()
    }

    /// Create one instance per resolved descriptor not instantiated yet.
    ///
    /// Factory failures and panics are load errors; the descriptor gets no
    /// instance. Returns the number of new instances.
    pub fn instantiate(&mut self) -> usize {
        let mut created = 0;
        for resolved in self.resolved.clone() {
            let name = resolved.descriptor.name.clone();
            if self.instance(&name).is_some() {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| resolved.instantiate()));
            match outcome {
                Ok(Ok(mut unit)) => {
                    unit.set_loaded_into(self.daemon_name.clone());
                    unit.set_kill_time(self.config.kill_time);
                    log_module_event!(name.as_str(), "instantiated", external = unit.is_external());
                    self.instances.push(unit);
                    created += 1;
                }
                Ok(Err(e)) => self.record_error(
                    VigilError::ModuleInstantiation {
                        module: name,
                        message: format!("{e:#}"),
                    }
                    .to_string(),
                ),
                Err(_) => self.record_error(
                    VigilError::ModuleInstantiation {
                        module: name,
                        message: "factory panicked".to_string(),
                    }
                    .to_string(),
                ),
            }
        }
        created
    }

    // =========================================================================
    // Init and start
    // =========================================================================

    /// Initialize `name`, honoring the retry backoff unless `first_start`.
    ///
    /// A refused attempt leaves process, queues and `last_init_attempt`
    /// untouched. Returns whether the module is ready to start.
    pub fn init_with_retry(&mut self, name: &str, first_start: bool) -> bool {
        match self.position(name) {
            Some(index) => self.init_at(index, first_start),
            None => {
                warn!(module = %name, "init requested for unknown module");
                false
            }
        }
    }

    fn init_at(&mut self, index: usize, first_start: bool) -> bool {
        let retry_period = self.config.retry_period;
        let now = Instant::now();
        let unit = &mut self.instances[index];

        let attempts = unit.count_init_attempt();
        if !first_start && attempts > 1 {
            if let Some(last) = unit.last_init_attempt() {
                let elapsed = now.saturating_duration_since(last);
                if elapsed < retry_period {
                    debug!(
                        module = %unit.name(),
                        attempts,
                        wait_secs = (retry_period - elapsed).as_secs_f64(),
                        "init retry postponed"
                    );
                    return false;
                }
            }
        }
        unit.record_init_attempt(now);

        if unit.is_external() {
            if let Err(e) = unit.create_queues(Arc::clone(&self.queue_factory)) {
                let message = e.to_string();
                warn!(module = %unit.name(), error = %message, "queue allocation failed");
                self.record_error(message);
                return false;
            }
        }

        let name = unit.name().to_string();
        match unit.init() {
            Ok(true) => {
                log_module_event!(name.as_str(), "initialized", attempts = attempts);
                true
            }
            Ok(false) => {
                warn!(module = %name, attempts, "module asked to retry init");
                false
            }
            Err(e) => {
                let error = VigilError::ModuleInit {
                    module: name,
                    message: format!("{e:#}"),
                };
                self.record_error(error.to_string());
                false
            }
        }
    }

    fn start_at(&mut self, index: usize) -> bool {
        let spawner = Arc::clone(&self.spawner);
        let unit = &mut self.instances[index];
        match unit.start(spawner.as_ref()) {
            Ok(()) => true,
            Err(e) => {
                let message = format!("Module {}: start failed: {e}", unit.name());
                self.record_error(message);
                false
            }
        }
    }

    /// Init then start every external instance; failures go to the restart
    /// queue.
    pub fn start_externals(&mut self, first_start: bool) {
        for index in 0..self.instances.len() {
            if !self.instances[index].is_external() || self.is_pending(self.instances[index].name()) {
                continue;
            }
            if !(self.init_at(index, first_start) && self.start_at(index)) {
                self.enqueue_restart(index);
            }
        }
    }

    /// Init every internal instance; failures go to the restart queue.
    pub fn init_internals(&mut self, first_start: bool) {
        for index in 0..self.instances.len() {
            if self.instances[index].is_external() || self.is_pending(self.instances[index].name()) {
                continue;
            }
            if !self.init_at(index, first_start) {
                self.enqueue_restart(index);
            }
        }
    }

    fn enqueue_restart(&mut self, index: usize) {
        let name = self.instances[index].name().to_string();
        if !self.pending_restart.contains(&name) {
            warn!(module = %name, "module queued for restart");
            self.pending_restart.push(name);
        }
    }

    // =========================================================================
    // Supervision
    // =========================================================================

    /// Queue dead external instances, and any instance whose inbound queue
    /// is over `max_queue_size`, for restart.
    pub fn check_liveness(&mut self) {
        let max_queue_size = self.config.max_queue_size;
        for index in 0..self.instances.len() {
            if self.is_pending(self.instances[index].name()) {
                continue;
            }
            let unit = &mut self.instances[index];
            let dead = unit.is_external() && !unit.is_alive();
            let depth = unit.inbound_depth();
            let overloaded = max_queue_size > 0 && depth > max_queue_size;
            if !dead && !overloaded {
                continue;
            }
            if dead {
                error!(module = %unit.name(), "module process is not alive");
            } else {
                error!(
                    module = %unit.name(),
                    depth,
                    max_queue_size,
                    "module inbound queue over limit, treating it as dead"
                );
            }
            unit.clear_queues();
            self.enqueue_restart(index);
        }
    }

    /// Retry every pending instance once; those refused or failing again
    /// stay pending.
    pub fn retry_pending(&mut self) {
        let snapshot = std::mem::take(&mut self.pending_restart);
        for name in snapshot {
            let Some(index) = self.position(&name) else {
                continue;
            };
            let restarted = self.init_at(index, false) && {
                self.instances[index].stop();
                self.start_at(index)
            };
            if restarted {
                log_module_event!(name.as_str(), "restarted");
            } else if !self.pending_restart.contains(&name) {
                self.pending_restart.push(name);
            }
        }
    }

    /// One supervision round: liveness, restarts, then internal tick hooks.
    pub fn tick(&mut self) {
        self.check_liveness();
        self.retry_pending();
        for index in 0..self.instances.len() {
            if !self.instances[index].is_external() && !self.is_pending(self.instances[index].name()) {
                self.instances[index].hook_tick();
            }
        }
    }

    /// Restore retained state of healthy internal modules with retention
    /// hooks. Returns the number of hooks that succeeded.
    pub fn load_retention(&mut self) -> usize {
        self.each_retention_module("retention_loaded", ModuleUnit::load_retention)
    }

    /// Save state of healthy internal modules with retention hooks. Returns
    /// the number of hooks that succeeded.
    pub fn save_retention(&mut self) -> usize {
        self.each_retention_module("retention_saved", ModuleUnit::save_retention)
    }

    fn each_retention_module(
        &mut self,
        event: &str,
        mut hook: impl FnMut(&mut ModuleUnit) -> anyhow::Result<()>,
    ) -> usize {
        let mut succeeded = 0;
        for index in 0..self.instances.len() {
            let unit = &self.instances[index];
            if unit.is_external() || !unit.capabilities().retention || self.is_pending(unit.name()) {
                continue;
            }
            let unit = &mut self.instances[index];
            match hook(unit) {
                Ok(()) => {
                    log_module_event!(unit.name(), event);
                    succeeded += 1;
                }
                Err(e) => error!(module = %unit.name(), error = %format!("{e:#}"), "retention hook failed"),
            }
        }
        succeeded
    }

    /// Ask internal modules to quit, stop external ones, forget them all.
    pub fn shutdown_all(&mut self) {
        for unit in &mut self.instances {
            if unit.is_external() {
                unit.stop();
                unit.clear_queues();
            } else if unit.quit() {
                debug!(module = %unit.name(), "module quit");
            }
        }
        info!(count = self.instances.len(), "all modules shut down");
        self.instances.clear();
        self.pending_restart.clear();
    }

    /// Stop and forget one instance.
    pub fn remove_instance(&mut self, name: &str) -> Option<ModuleUnit> {
        let index = self.position(name)?;
        self.pending_restart.retain(|pending| pending != name);
        let mut unit = self.instances.remove(index);
        unit.stop();
        unit.clear_queues();
        log_module_event!(name, "removed");
        Some(unit)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    fn position(&self, name: &str) -> Option<usize> {
        self.instances.iter().position(|unit| unit.name() == name)
    }

    pub fn instance(&self, name: &str) -> Option<&ModuleUnit> {
        self.instances.iter().find(|unit| unit.name() == name)
    }

    pub fn instance_mut(&mut self, name: &str) -> Option<&mut ModuleUnit> {
        self.instances.iter_mut().find(|unit| unit.name() == name)
    }

    /// All instances, in declaration order.
    pub fn instances(&self) -> &[ModuleUnit] {
        &self.instances
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.pending_restart.iter().any(|pending| pending == name)
    }

    pub fn pending_restart(&self) -> &[String] {
        &self.pending_restart
    }

    /// Instances not waiting for a restart.
    pub fn healthy_instances(&self) -> Vec<&ModuleUnit> {
        self.instances
            .iter()
            .filter(|unit| !self.is_pending(unit.name()))
            .collect()
    }

    /// Healthy internal instances, optionally restricted to a phase.
    pub fn internal_instances(&self, phase: Option<Phase>) -> Vec<&ModuleUnit> {
        self.healthy_instances()
            .into_iter()
            .filter(|unit| !unit.is_external() && phase.is_none_or(|phase| unit.has_phase(phase)))
            .collect()
    }

    /// Healthy external instances, optionally restricted to a phase.
    pub fn external_instances(&self, phase: Option<Phase>) -> Vec<&ModuleUnit> {
        self.healthy_instances()
            .into_iter()
            .filter(|unit| unit.is_external() && phase.is_none_or(|phase| unit.has_phase(phase)))
            .collect()
    }

    /// Outbound queues of healthy external instances, by module name.
    pub fn external_outbound_queues(&self) -> Vec<(String, SharedQueue)> {
        self.external_instances(None)
            .into_iter()
            .filter_map(|unit| {
                unit.outbound_queue()
                    .map(|queue| (unit.name().to_string(), Arc::clone(queue)))
            })
            .collect()
    }

    /// Declared descriptor by module name, including disabled ones.
    pub fn descriptor(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.configured.get(name)
    }

    pub fn resolved_count(&self) -> usize {
        self.resolved.len()
    }

    /// Errors accumulated since creation.
    pub fn load_errors(&self) -> &[String] {
        &self.load_errors
    }

    /// Warnings accumulated since creation.
    pub fn load_warnings(&self) -> &[String] {
        &self.load_warnings
    }

    fn record_error(&mut self, message: String) {
        error!(error = %message, "module load error");
        self.load_errors.push(message);
    }

    fn record_warning(&mut self, message: String) {
        warn!(warning = %message, "module load warning");
        self.load_warnings.push(message);
    }
}

impl Drop for ModuleSupervisor {
    fn drop(&mut self) {
        let running = self.instances.iter().filter(|unit| unit.has_process()).count();
        if running > 0 {
            warn!(running, "supervisor dropped with running modules, stopping them");
            self.shutdown_all();
        }
    }
}
