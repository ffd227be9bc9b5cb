//! Worker loop running real shell commands in a thread.

use std::thread;
use std::time::{Duration, Instant};

use vigil_core::config::WorkerConfig;
use vigil_core::queue::{ITEM_MESSAGE, LocalQueue, Message, SharedQueue};
use vigil_core::stdio::ChildIo;
use vigil_worker::{CommandAction, ExitReason, ItemStatus, WorkerLoop};

fn queues() -> ChildIo {
    ChildIo {
        inbound: LocalQueue::shared("intake"),
        control: LocalQueue::shared("control"),
        outbound: LocalQueue::shared("results"),
    }
}

fn settings() -> WorkerConfig {
    WorkerConfig {
        intake_poll: Duration::from_millis(20),
        mortal: false,
        ..WorkerConfig::default()
    }
}

fn collect(results: &SharedQueue, expected: usize) -> Vec<CommandAction> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut done = Vec::new();
    while done.len() < expected && Instant::now() < deadline {
        match results.try_get().unwrap() {
            Some(message) => {
                assert_eq!(message.kind, ITEM_MESSAGE);
                done.push(message.decode::<CommandAction>().unwrap());
            }
            None => thread::sleep(Duration::from_millis(10)),
        }
    }
    done
}

#[test]
fn test_commands_run_in_parallel_and_report_back() {
    let io = queues();
    let intake = io.inbound.clone();
    let control = io.control.clone();
    let results = io.outbound.clone();

    let worker = thread::spawn(move || WorkerLoop::<CommandAction>::new(1, settings(), io).run());

    let started = Instant::now();
    for id in 1..=3 {
        let action = CommandAction::new(id, format!("sleep 0.3; echo done-{id}"));
        intake.put(Message::encode(ITEM_MESSAGE, &action).unwrap()).unwrap();
    }

    let mut done = collect(&results, 3);
    assert_eq!(done.len(), 3);
    assert!(started.elapsed() < Duration::from_secs(2));

    done.sort_by_key(|action| action.id);
    for action in &done {
        assert_eq!(action.status, ItemStatus::Done);
        assert_eq!(action.exit_code, Some(0));
        assert_eq!(action.output.trim(), format!("done-{}", action.id));
        assert!(action.launched_at.is_some());
    }

    control.put(Message::stop()).unwrap();
    assert_eq!(worker.join().unwrap(), ExitReason::Stopped);
}

#[test]
fn test_timed_out_command_is_reported() {
    let io = queues();
    let intake = io.inbound.clone();
    let results = io.outbound.clone();

    let worker = thread::spawn(move || WorkerLoop::<CommandAction>::new(2, settings(), io).run());

    let action = CommandAction::new(9, "sleep 30").with_timeout(Duration::from_millis(200));
    intake.put(Message::encode(ITEM_MESSAGE, &action).unwrap()).unwrap();

    let done = collect(&results, 1);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, ItemStatus::Timeout);

    intake.close();
    assert_eq!(worker.join().unwrap(), ExitReason::InputClosed);
}

#[test]
fn test_stop_is_not_held_up_by_background_processes() {
    let io = queues();
    let intake = io.inbound.clone();
    let control = io.control.clone();

    let worker = thread::spawn(move || WorkerLoop::<CommandAction>::new(3, settings(), io).run());

    let action = CommandAction::new(4, "sleep 6 & echo hi").with_timeout(Duration::from_secs(30));
    intake.put(Message::encode(ITEM_MESSAGE, &action).unwrap()).unwrap();
    thread::sleep(Duration::from_millis(300));

    let stopped_at = Instant::now();
    control.put(Message::stop()).unwrap();
    assert_eq!(worker.join().unwrap(), ExitReason::Stopped);
    assert!(stopped_at.elapsed() < Duration::from_secs(2));
}
