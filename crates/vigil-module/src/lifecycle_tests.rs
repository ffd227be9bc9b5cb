//! Supervisor lifecycle scenarios driven by fake processes.
//!
//! These tests cover:
//! - Load, instantiate and start of external modules
//! - Liveness checks, the restart queue and the retry backoff
//! - The inbound queue watchdog
//! - Load error accounting and shutdown

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use vigil_core::config::{ModuleDescriptor, SupervisorConfig};
use vigil_core::queue::{LocalQueueFactory, Message, QueueFactory, SharedQueueManager};
use vigil_core::testing::FakeSpawner;

use crate::builtin::{NullModule, register_builtins};
use crate::module::{Capabilities, Module, ModuleProperties, Phase};
use crate::registry::{ModuleImplementation, ModuleRegistry};
use crate::supervisor::ModuleSupervisor;

/// Scripted init results shared with every instance of the `flaky` module.
#[derive(Clone, Default)]
struct Script {
    results: Arc<Mutex<VecDeque<Result<bool, String>>>>,
    init_calls: Arc<AtomicUsize>,
    ticks: Arc<AtomicUsize>,
    retention_loads: Arc<AtomicUsize>,
    retention_saves: Arc<AtomicUsize>,
}

impl Script {
    fn push(&self, result: Result<bool, String>) {
        self.results.lock().push_back(result);
    }

    fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }
}

struct Flaky(Script);

impl Module for Flaky {
    fn init(&mut self) -> anyhow::Result<bool> {
        self.0.init_calls.fetch_add(1, Ordering::SeqCst);
        match self.0.results.lock().pop_front() {
            Some(Ok(ready)) => Ok(ready),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(true),
        }
    }

    fn hook_tick(&mut self) {
        self.0.ticks.fetch_add(1, Ordering::SeqCst);
    }
}

/// Internal module keeping state across daemon runs.
struct Keeper(Script);

impl Module for Keeper {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            quit: false,
            retention: true,
        }
    }

    fn load_retention(&mut self) -> anyhow::Result<()> {
        self.0.retention_loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn save_retention(&mut self) -> anyhow::Result<()> {
        self.0.retention_saves.fetch_add(1, Ordering::SeqCst);
        anyhow::ensure!(self.0.retention_saves.load(Ordering::SeqCst) < 2, "retention file is read-only");
        Ok(())
    }
}

struct Fixture {
    supervisor: ModuleSupervisor,
    spawner: Arc<FakeSpawner>,
    script: Script,
    null: NullModule,
}

fn registry(script: &Script, null: &NullModule) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    register_builtins(&mut registry);

    let flaky = script.clone();
    registry.register(
        "flaky",
        ModuleImplementation::new(ModuleProperties::external("flaky", &[Phase::Running]), move |_| {
            Ok(Box::new(Flaky(flaky.clone())) as Box<dyn Module>)
        }),
    );
    let ticking = script.clone();
    registry.register(
        "ticking",
        ModuleImplementation::new(ModuleProperties::internal("ticking", &[Phase::Retention]), move |_| {
            Ok(Box::new(Flaky(ticking.clone())) as Box<dyn Module>)
        }),
    );
    let keeper = script.clone();
    registry.register(
        "keeper",
        ModuleImplementation::new(ModuleProperties::internal("keeper", &[Phase::Retention]), move |_| {
            Ok(Box::new(Keeper(keeper.clone())) as Box<dyn Module>)
        }),
    );
    let shared_null = null.clone();
    registry.register(
        "quitter",
        ModuleImplementation::new(ModuleProperties::internal("quitter", &[Phase::Running]), move |_| {
            Ok(Box::new(shared_null.clone()) as Box<dyn Module>)
        }),
    );
    registry.register(
        "broken-factory",
        ModuleImplementation::new(ModuleProperties::external("broken", &[]), |_| {
            anyhow::bail!("missing credentials")
        }),
    );
    registry.register(
        "panicky-factory",
        ModuleImplementation::new(ModuleProperties::external("panicky", &[]), |_| {
            panic!("factory bug")
        }),
    );
    registry
}

fn fixture_with(config: SupervisorConfig, queues: Arc<dyn QueueFactory>) -> Fixture {
    let script = Script::default();
    let null = NullModule::default();
    let spawner = Arc::new(FakeSpawner::new());
    let mut supervisor = ModuleSupervisor::new(
        config,
        Arc::new(registry(&script, &null)),
        queues,
        spawner.clone(),
    );
    supervisor.set_daemon_name("broker-master");
    Fixture {
        supervisor,
        spawner,
        script,
        null,
    }
}

fn fixture(config: SupervisorConfig) -> Fixture {
    fixture_with(config, Arc::new(LocalQueueFactory))
}

fn quick_config() -> SupervisorConfig {
    SupervisorConfig {
        retry_period: Duration::from_millis(200),
        kill_time: Duration::from_millis(50),
        ..SupervisorConfig::default()
    }
}

fn names(units: &[&crate::unit::ModuleUnit]) -> Vec<String> {
    units.iter().map(|unit| unit.name().to_string()).collect()
}

// =============================================================================
// Start
// =============================================================================

#[test]
fn test_single_external_module_starts_healthy() {
    let mut fx = fixture(quick_config());
    assert_eq!(fx.supervisor.load(&[ModuleDescriptor::new("flaky-1", "flaky")]), 1);
    assert_eq!(fx.supervisor.instantiate(), 1);

    fx.supervisor.start_externals(true);
    assert_eq!(fx.spawner.spawns_of("flaky-1"), 1);

    fx.supervisor.check_liveness();
    assert!(fx.supervisor.pending_restart().is_empty());
    assert_eq!(names(&fx.supervisor.healthy_instances()), vec!["flaky-1"]);

    let unit = fx.supervisor.instance("flaky-1").unwrap();
    assert!(unit.has_process());
    assert_eq!(unit.loaded_into(), Some("broker-master"));
    assert!(fx.supervisor.load_errors().is_empty());
}

#[test]
fn test_first_start_ignores_backoff() {
    let mut fx = fixture(SupervisorConfig {
        retry_period: Duration::from_secs(60),
        ..quick_config()
    });
    fx.supervisor.load(&[ModuleDescriptor::new("flaky-1", "flaky")]);
    fx.supervisor.instantiate();

    assert!(fx.supervisor.init_with_retry("flaky-1", true));
    assert!(fx.supervisor.init_with_retry("flaky-1", true));
    assert_eq!(fx.script.init_calls(), 2);
}

#[test]
fn test_init_refusal_queues_restart() {
    let mut fx = fixture(quick_config());
    fx.script.push(Ok(false));
    fx.supervisor.load(&[ModuleDescriptor::new("flaky-1", "flaky")]);
    fx.supervisor.instantiate();

    fx.supervisor.start_externals(true);
    assert_eq!(fx.spawner.spawn_count(), 0);
    assert_eq!(fx.supervisor.pending_restart(), ["flaky-1".to_string()]);
    assert!(fx.supervisor.healthy_instances().is_empty());
    assert!(fx.supervisor.load_errors().is_empty());
}

#[test]
fn test_init_error_is_recorded_and_retried() {
    let mut fx = fixture(quick_config());
    fx.script.push(Err("database unreachable".into()));
    fx.supervisor.load(&[ModuleDescriptor::new("flaky-1", "flaky")]);
    fx.supervisor.instantiate();

    fx.supervisor.start_externals(true);
    assert!(fx.supervisor.is_pending("flaky-1"));
    assert_eq!(fx.supervisor.instances().len(), 1);
    assert_eq!(fx.supervisor.load_errors().len(), 1);
    assert_eq!(
        fx.supervisor.load_errors()[0],
        "Module flaky-1: initialization raised: database unreachable"
    );

    thread::sleep(Duration::from_millis(250));
    fx.supervisor.retry_pending();
    assert!(fx.supervisor.pending_restart().is_empty());
    assert_eq!(fx.spawner.spawns_of("flaky-1"), 1);
}

#[test]
fn test_spawn_failure_queues_restart() {
    let mut fx = fixture(quick_config());
    fx.supervisor.load(&[ModuleDescriptor::new("flaky-1", "flaky")]);
    fx.supervisor.instantiate();
    fx.spawner.fail_next();

    fx.supervisor.start_externals(true);
    assert!(fx.supervisor.is_pending("flaky-1"));
    assert!(fx.supervisor.load_errors()[0].contains("start failed"));
}

#[test]
fn test_queue_allocation_failure_queues_restart() {
    let mut fx = fixture_with(quick_config(), Arc::new(SharedQueueManager::with_max_pairs(0)));
    fx.supervisor.load(&[ModuleDescriptor::new("flaky-1", "flaky")]);
    fx.supervisor.instantiate();

    fx.supervisor.start_externals(true);
    assert!(fx.supervisor.is_pending("flaky-1"));
    assert_eq!(fx.script.init_calls(), 0);
    assert_eq!(fx.spawner.spawn_count(), 0);
    assert_eq!(fx.supervisor.load_errors().len(), 1);
}

// =============================================================================
// Liveness and restart
// =============================================================================

#[test]
fn test_dead_module_restarts_after_backoff() {
    let mut fx = fixture(quick_config());
    fx.supervisor.load(&[ModuleDescriptor::new("flaky-1", "flaky")]);
    fx.supervisor.instantiate();
    fx.supervisor.start_externals(true);
    let first = fx.spawner.last("flaky-1").unwrap();

    first.exit();
    fx.supervisor.check_liveness();
    fx.supervisor.retry_pending();
    assert!(fx.supervisor.is_pending("flaky-1"));
    assert_eq!(fx.spawner.spawns_of("flaky-1"), 1);
    assert!(!fx.supervisor.instance("flaky-1").unwrap().has_queues());

    thread::sleep(Duration::from_millis(250));
    fx.supervisor.retry_pending();
    assert!(fx.supervisor.pending_restart().is_empty());
    assert_eq!(fx.spawner.spawns_of("flaky-1"), 2);

    let second = fx.spawner.last("flaky-1").unwrap();
    assert_ne!(first.pid(), second.pid());
    let unit = fx.supervisor.instance("flaky-1").unwrap();
    assert_eq!(unit.pid(), Some(second.pid()));
    assert!(unit.has_queues());
}

#[test]
fn test_backoff_refusal_does_not_touch_state() {
    let mut fx = fixture(SupervisorConfig {
        retry_period: Duration::from_secs(60),
        ..quick_config()
    });
    fx.supervisor.load(&[ModuleDescriptor::new("flaky-1", "flaky")]);
    fx.supervisor.instantiate();

    assert!(fx.supervisor.init_with_retry("flaky-1", false));
    let unit = fx.supervisor.instance("flaky-1").unwrap();
    let recorded = unit.last_init_attempt();
    let queue = unit.inbound_queue().cloned().unwrap();

    assert!(!fx.supervisor.init_with_retry("flaky-1", false));
    let unit = fx.supervisor.instance("flaky-1").unwrap();
    assert_eq!(unit.last_init_attempt(), recorded);
    assert_eq!(unit.init_attempts(), 2);
    assert!(!queue.is_closed());
    assert_eq!(fx.script.init_calls(), 1);
}

#[test]
fn test_pending_instances_are_never_healthy() {
    let mut fx = fixture(quick_config());
    fx.supervisor.load(&[
        ModuleDescriptor::new("a", "flaky"),
        ModuleDescriptor::new("b", "flaky"),
    ]);
    fx.supervisor.instantiate();
    fx.supervisor.start_externals(true);

    fx.spawner.last("b").unwrap().exit();
    fx.supervisor.check_liveness();

    assert!(fx.supervisor.is_pending("b"));
    assert_eq!(names(&fx.supervisor.healthy_instances()), vec!["a"]);
    assert_eq!(names(&fx.supervisor.external_instances(None)), vec!["a"]);
    let queues = fx.supervisor.external_outbound_queues();
    assert_eq!(queues.len(), 1);
    assert_eq!(queues[0].0, "a");
}

#[test]
fn test_restart_preserves_instance_order() {
    let mut fx = fixture(quick_config());
    fx.supervisor.load(&[
        ModuleDescriptor::new("a", "flaky"),
        ModuleDescriptor::new("b", "flaky"),
        ModuleDescriptor::new("c", "flaky"),
    ]);
    fx.supervisor.instantiate();
    fx.supervisor.start_externals(true);

    fx.spawner.last("a").unwrap().exit();
    fx.supervisor.check_liveness();
    thread::sleep(Duration::from_millis(250));
    fx.supervisor.retry_pending();

    let order: Vec<&str> = fx.supervisor.instances().iter().map(|unit| unit.name()).collect();
    assert_eq!(order, vec!["a", "b", "c"]);
    assert_eq!(fx.spawner.spawns_of("a"), 2);
}

#[test]
fn test_queue_watchdog_restarts_live_module() {
    let mut fx = fixture(SupervisorConfig {
        max_queue_size: 2,
        ..quick_config()
    });
    fx.supervisor.load(&[ModuleDescriptor::new("flaky-1", "flaky")]);
    fx.supervisor.instantiate();
    fx.supervisor.start_externals(true);
    let first = fx.spawner.last("flaky-1").unwrap();

    let inbound = fx.supervisor.instance("flaky-1").unwrap().inbound_queue().cloned().unwrap();
    for n in 0..3 {
        inbound.put(Message::new("check", serde_json::json!(n))).unwrap();
    }
    fx.supervisor.check_liveness();

    assert!(first.is_alive());
    assert!(fx.supervisor.is_pending("flaky-1"));
    assert!(inbound.is_closed());

    thread::sleep(Duration::from_millis(250));
    fx.supervisor.retry_pending();
    assert!(!first.is_alive());
    assert_eq!(first.signals(), vec!["TERM"]);
    assert_eq!(fx.spawner.spawns_of("flaky-1"), 2);
    assert_eq!(fx.supervisor.instance("flaky-1").unwrap().inbound_depth(), 0);
}

#[test]
fn test_queue_watchdog_disabled_by_zero() {
    let mut fx = fixture(quick_config());
    fx.supervisor.load(&[ModuleDescriptor::new("flaky-1", "flaky")]);
    fx.supervisor.instantiate();
    fx.supervisor.start_externals(true);

    let inbound = fx.supervisor.instance("flaky-1").unwrap().inbound_queue().cloned().unwrap();
    for n in 0..100 {
        inbound.put(Message::new("check", serde_json::json!(n))).unwrap();
    }
    fx.supervisor.check_liveness();
    assert!(fx.supervisor.pending_restart().is_empty());
}

#[test]
fn test_queue_watchdog_threshold_is_exclusive() {
    let mut fx = fixture(SupervisorConfig {
        max_queue_size: 2,
        ..quick_config()
    });
    fx.supervisor.load(&[ModuleDescriptor::new("flaky-1", "flaky")]);
    fx.supervisor.instantiate();
    fx.supervisor.start_externals(true);

    let inbound = fx.supervisor.instance("flaky-1").unwrap().inbound_queue().cloned().unwrap();
    inbound.put(Message::new("check", serde_json::Value::Null)).unwrap();
    inbound.put(Message::new("check", serde_json::Value::Null)).unwrap();
    fx.supervisor.check_liveness();
    assert!(fx.supervisor.pending_restart().is_empty());
}

#[test]
fn test_tick_runs_internal_hooks() {
    let mut fx = fixture(quick_config());
    fx.supervisor.load(&[
        ModuleDescriptor::new("retention", "ticking"),
        ModuleDescriptor::new("flaky-1", "flaky"),
    ]);
    fx.supervisor.instantiate();
    fx.supervisor.init_internals(true);
    fx.supervisor.start_externals(true);

    fx.supervisor.tick();
    fx.supervisor.tick();
    assert_eq!(fx.script.ticks.load(Ordering::SeqCst), 2);
    assert_eq!(names(&fx.supervisor.internal_instances(Some(Phase::Retention))), vec!["retention"]);
    assert!(fx.supervisor.internal_instances(Some(Phase::Running)).is_empty());
    assert_eq!(names(&fx.supervisor.external_instances(Some(Phase::Running))), vec!["flaky-1"]);
}

#[test]
fn test_retention_hooks_run_only_where_declared() {
    let mut fx = fixture(quick_config());
    fx.supervisor.load(&[
        ModuleDescriptor::new("retention", "keeper"),
        ModuleDescriptor::new("ticker", "ticking"),
        ModuleDescriptor::new("flaky-1", "flaky"),
    ]);
    fx.supervisor.instantiate();
    fx.supervisor.init_internals(true);
    fx.supervisor.start_externals(true);

    assert_eq!(fx.supervisor.load_retention(), 1);
    assert_eq!(fx.script.retention_loads.load(Ordering::SeqCst), 1);

    assert_eq!(fx.supervisor.save_retention(), 1);
    assert_eq!(fx.supervisor.save_retention(), 0, "a failing hook is not counted");
    assert_eq!(fx.script.retention_saves.load(Ordering::SeqCst), 2);
    assert_eq!(fx.script.init_calls(), 2);
}

// =============================================================================
// Loading
// =============================================================================

#[test]
fn test_load_records_errors_and_keeps_going() {
    let mut fx = fixture(quick_config());
    let resolved = fx.supervisor.load(&[
        ModuleDescriptor::new("missing", "nowhere"),
        ModuleDescriptor::new("off", "flaky").disabled(),
        ModuleDescriptor::new("broken", "broken-factory"),
        ModuleDescriptor::new("panicky", "panicky-factory"),
        ModuleDescriptor::new("good", "flaky"),
    ]);
    assert_eq!(resolved, 3);
    assert_eq!(fx.supervisor.load_errors().len(), 1);
    assert!(fx.supervisor.load_errors()[0].contains("nowhere"));

    assert_eq!(fx.supervisor.instantiate(), 1);
    assert_eq!(fx.supervisor.load_errors().len(), 3);
    assert_eq!(
        fx.supervisor.load_errors()[1],
        "Module broken: instance creation failed: missing credentials"
    );
    assert_eq!(
        fx.supervisor.load_errors()[2],
        "Module panicky: instance creation failed: factory panicked"
    );
    assert_eq!(names(&fx.supervisor.healthy_instances()), vec!["good"]);

    let off = fx.supervisor.descriptor("off").unwrap();
    assert!(!off.enabled);
    assert!(fx.supervisor.instance("off").is_none());
}

#[test]
fn test_load_is_idempotent() {
    let mut fx = fixture(quick_config());
    let descriptors = vec![
        ModuleDescriptor::new("a", "flaky"),
        ModuleDescriptor::new("b", "echo"),
        ModuleDescriptor::new("n", "null"),
    ];
    let first = fx.supervisor.load(&descriptors);
    fx.supervisor.instantiate();
    fx.supervisor.shutdown_all();

    let second = fx.supervisor.load(&descriptors);
    assert_eq!(first, second);
    assert_eq!(fx.supervisor.resolved_count(), 3);
    assert!(fx.supervisor.load_errors().is_empty());
    assert_eq!(fx.supervisor.instantiate(), 3);
}

#[test]
fn test_duplicate_and_dangling_declarations() {
    let mut fx = fixture(quick_config());
    let mut parent = ModuleDescriptor::new("parent", "flaky");
    parent.modules = vec!["child".into(), "ghost".into()];
    fx.supervisor.load(&[
        parent,
        ModuleDescriptor::new("child", "flaky").disabled(),
        ModuleDescriptor::new("parent", "echo"),
    ]);

    assert_eq!(fx.supervisor.resolved_count(), 1);
    assert_eq!(fx.supervisor.load_errors().len(), 1);
    assert!(fx.supervisor.load_errors()[0].contains("more than once"));
    assert_eq!(fx.supervisor.load_warnings().len(), 1);
    assert!(fx.supervisor.load_warnings()[0].contains("ghost"));
    assert_eq!(fx.supervisor.descriptor("parent").unwrap().implementation, "flaky");
}

// =============================================================================
// Shutdown
// =============================================================================

#[test]
fn test_shutdown_quits_internals_and_stops_externals() {
    let mut fx = fixture(quick_config());
    fx.supervisor.load(&[
        ModuleDescriptor::new("q", "quitter"),
        ModuleDescriptor::new("flaky-1", "flaky"),
    ]);
    fx.supervisor.instantiate();
    fx.supervisor.init_internals(true);
    fx.supervisor.start_externals(true);
    let process = fx.spawner.last("flaky-1").unwrap();

    fx.supervisor.shutdown_all();
    assert!(fx.null.has_quit());
    assert!(!process.is_alive());
    assert!(fx.supervisor.instances().is_empty());
}

#[test]
fn test_remove_instance_stops_process() {
    let mut fx = fixture(quick_config());
    fx.supervisor.load(&[ModuleDescriptor::new("flaky-1", "flaky")]);
    fx.supervisor.instantiate();
    fx.supervisor.start_externals(true);
    let process = fx.spawner.last("flaky-1").unwrap();

    let unit = fx.supervisor.remove_instance("flaky-1").unwrap();
    assert!(!unit.has_process());
    assert!(!process.is_alive());
    assert!(fx.supervisor.instances().is_empty());
    assert!(fx.supervisor.remove_instance("flaky-1").is_none());
}

#[test]
fn test_drop_stops_running_modules() {
    let fx = fixture(quick_config());
    let spawner = Arc::clone(&fx.spawner);
    let mut supervisor = fx.supervisor;
    supervisor.load(&[ModuleDescriptor::new("flaky-1", "flaky")]);
    supervisor.instantiate();
    supervisor.start_externals(true);
    let process = spawner.last("flaky-1").unwrap();

    drop(supervisor);
    assert!(!process.is_alive());
}
