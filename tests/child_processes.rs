//! Module and worker processes running the real `vigil child` binary over
//! the stdio bridge.

use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vigil_core::config::{ModuleDescriptor, SupervisorConfig, WorkerConfig};
use vigil_core::process::CommandSpawner;
use vigil_core::queue::{ITEM_MESSAGE, LocalQueue, LocalQueueFactory, Message, SharedQueue};
use vigil_module::{ModuleRegistry, ModuleSupervisor, builtin};
use vigil_worker::{CommandAction, ItemStatus, Worker};

fn child_spawner() -> Arc<CommandSpawner> {
    Arc::new(CommandSpawner::new(env!("CARGO_BIN_EXE_vigil")).arg("child"))
}

fn supervisor(config: SupervisorConfig) -> ModuleSupervisor {
    let mut registry = ModuleRegistry::new();
    builtin::register_builtins(&mut registry);
    let mut supervisor = ModuleSupervisor::new(
        config,
        Arc::new(registry),
        Arc::new(LocalQueueFactory),
        child_spawner(),
    );
    supervisor.set_daemon_name("broker-e2e");
    supervisor
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

fn next_message(queue: &SharedQueue) -> Option<Message> {
    let mut received = None;
    wait_until(|| {
        received = queue.try_get().ok().flatten();
        received.is_some()
    });
    received
}

#[test]
fn test_echo_module_round_trip() {
    let mut supervisor = supervisor(SupervisorConfig {
        kill_time: Duration::from_secs(5),
        ..SupervisorConfig::default()
    });
    supervisor.load(&[ModuleDescriptor::new("echo-1", "echo").with_setting("prefix", "echo.")]);
    supervisor.instantiate();
    supervisor.start_externals(true);
    assert!(supervisor.pending_restart().is_empty());

    let unit = supervisor.instance("echo-1").unwrap();
    let inbound = Arc::clone(unit.inbound_queue().unwrap());
    let outbound = Arc::clone(unit.outbound_queue().unwrap());

    for n in 0..3 {
        inbound.put(Message::new("check", serde_json::json!(n))).unwrap();
    }
    for n in 0..3 {
        let echoed = next_message(&outbound).expect("module did not answer");
        assert_eq!(echoed.kind, "echo.check");
        assert_eq!(echoed.payload, serde_json::json!(n));
    }
    assert!(inbound.is_empty());

    supervisor.check_liveness();
    assert!(supervisor.pending_restart().is_empty());
    supervisor.shutdown_all();
}

#[test]
fn test_wedged_module_trips_queue_watchdog() {
    let mut supervisor = supervisor(SupervisorConfig {
        max_queue_size: 3,
        kill_time: Duration::from_millis(300),
        ..SupervisorConfig::default()
    });
    supervisor.load(&[ModuleDescriptor::new("echo-1", "echo")]);
    supervisor.instantiate();
    supervisor.start_externals(true);

    let unit = supervisor.instance("echo-1").unwrap();
    let pid = unit.pid().unwrap();
    let inbound = Arc::clone(unit.inbound_queue().unwrap());
    let outbound = Arc::clone(unit.outbound_queue().unwrap());

    inbound.put(Message::new("check", serde_json::json!("warm-up"))).unwrap();
    assert!(next_message(&outbound).is_some());

    let stopped = Command::new("kill").args(["-STOP", &pid.to_string()]).status().unwrap();
    assert!(stopped.success());

    for n in 0..5 {
        inbound.put(Message::new("check", serde_json::json!(n))).unwrap();
    }
    thread::sleep(Duration::from_millis(300));
    assert!(inbound.len() > 3, "a stopped module must not drain its queue");

    supervisor.check_liveness();
    assert!(supervisor.is_pending("echo-1"));
    supervisor.shutdown_all();
}

#[test]
fn test_worker_process_reports_results_and_stops() {
    let settings = WorkerConfig {
        processes_by_worker: 1,
        intake_poll: Duration::from_millis(20),
        mortal: false,
        ..WorkerConfig::default()
    };
    let intake = LocalQueue::shared("e2e:intake");
    let results = LocalQueue::shared("e2e:results");
    let spawner = child_spawner();
    let mut worker = Worker::new(settings).with_kill_time(Duration::from_secs(5));
    worker
        .start(spawner.as_ref(), "poller-e2e", Arc::clone(&intake), Arc::clone(&results))
        .unwrap();

    for id in 1..=3 {
        let action = CommandAction::new(id, format!("sleep 0.5; echo check-{id}"));
        intake.put(Message::encode(ITEM_MESSAGE, &action).unwrap()).unwrap();
    }

    assert!(wait_until(|| intake.len() == 2));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(intake.len(), 2, "a one-slot worker holds a single action");

    let first = next_message(&results).expect("no result from the worker");
    assert_eq!(first.kind, ITEM_MESSAGE);
    let action: CommandAction = first.decode().unwrap();
    assert_eq!(action.id, 1);
    assert_eq!(action.status, ItemStatus::Done);
    assert_eq!(action.output, "check-1");

    worker.send_stop().unwrap();
    assert!(wait_until(|| !worker.is_alive()));
    assert!(intake.len() >= 1, "actions the worker never took stay queued");
    worker.kill();
}
