//! Shell command work item.

use std::io::{ErrorKind, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vigil_core::config::duration_serde;

use crate::item::{ItemStatus, LaunchOutcome, WorkItem};

/// Exit code reported when a command could not run to completion.
pub const EXIT_UNKNOWN: i32 = 3;

/// First poll delay after launch; doubles up to [`MAX_POLL_INTERVAL`].
pub const FIRST_POLL_INTERVAL: Duration = Duration::from_millis(1);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

/// A command run through `sh -c`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandAction {
    pub id: u64,
    pub command: String,

    #[serde(with = "duration_serde", default = "default_timeout")]
    pub timeout: Duration,

    #[serde(default)]
    pub status: ItemStatus,

    #[serde(default = "Utc::now")]
    pub enqueued_at: DateTime<Utc>,

    #[serde(default)]
    pub launched_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub exit_code: Option<i32>,

    #[serde(default)]
    pub output: String,

    #[serde(skip)]
    running: Option<Running>,
}

#[derive(Debug)]
struct Running {
    child: Child,
    /// Set once the shell itself was reaped
    exit_code: Option<i32>,
    started: Instant,
    next_check: Instant,
    interval: Duration,
    readers: Vec<OutputReader>,
}

impl Running {
    /// Whether every process holding stdout or stderr closed it.
    fn output_closed(&self) -> bool {
        self.readers.iter().all(|reader| reader.handle.is_finished())
    }

    /// Output captured so far, stdout first.
    fn output(&self, max_output: usize) -> String {
        let bytes: Vec<u8> = self
            .readers
            .iter()
            .flat_map(|reader| reader.captured.lock().clone())
            .collect();
        let mut text = String::from_utf8_lossy(&bytes).trim_end().to_string();
        truncate_on_char_boundary(&mut text, max_output);
        text
    }
}

/// Thread copying one output stream into a buffer the worker can read at
/// any time.
#[derive(Debug)]
struct OutputReader {
    handle: JoinHandle<()>,
    captured: Arc<Mutex<Vec<u8>>>,
}

impl CommandAction {
    pub fn new(id: u64, command: impl Into<String>) -> Self {
        Self {
            id,
            command: command.into(),
            timeout: default_timeout(),
            status: ItemStatus::Queued,
            enqueued_at: Utc::now(),
            launched_at: None,
            finished_at: None,
            exit_code: None,
            output: String::new(),
            running: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn finish(&mut self, status: ItemStatus, exit_code: i32, output: String) {
        self.status.advance(status);
        self.exit_code = Some(exit_code);
        self.output = output;
        self.finished_at = Some(Utc::now());
    }
}

fn truncate_on_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> Option<OutputReader> {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    let handle = thread::Builder::new()
        .name("vigil-action-output".into())
        .spawn(move || {
            let mut chunk = [0u8; 4096];
            loop {
                match source.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        })
        .ok()?;
    Some(OutputReader { handle, captured })
}

fn is_resource_exhaustion(error: &std::io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(code) if code == Errno::EMFILE as i32 || code == Errno::ENFILE as i32
    )
}

impl WorkItem for CommandAction {
    fn status(&self) -> ItemStatus {
        self.status
    }

    fn execute(&mut self) -> LaunchOutcome {
        if self.status != ItemStatus::Queued {
            return LaunchOutcome::Failed;
        }

        let spawned = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if is_resource_exhaustion(&e) => {
                self.finish(ItemStatus::Done, EXIT_UNKNOWN, format!("too many open files: {e}"));
                return LaunchOutcome::ResourceExhausted;
            }
            Err(e) => {
                self.finish(ItemStatus::Done, EXIT_UNKNOWN, format!("command could not be launched: {e}"));
                return LaunchOutcome::Failed;
            }
        };

        let mut readers = Vec::with_capacity(2);
        if let Some(reader) = child.stdout.take().and_then(spawn_reader) {
            readers.push(reader);
        }
        if let Some(reader) = child.stderr.take().and_then(spawn_reader) {
            readers.push(reader);
        }

        let started = Instant::now();
        debug!(id = self.id, pid = child.id(), "action launched");
        self.running = Some(Running {
            child,
            exit_code: None,
            started,
            next_check: started + FIRST_POLL_INTERVAL,
            interval: FIRST_POLL_INTERVAL,
            readers,
        });
        self.launched_at = Some(Utc::now());
        self.status.advance(ItemStatus::Launched);
        LaunchOutcome::Launched
    }

    /// Never waits: a command is final once the shell exited and its output
    /// streams closed, or once `timeout` passed.
    fn check_finished(&mut self, max_output: usize) {
        if self.status != ItemStatus::Launched {
            return;
        }
        let Some(mut running) = self.running.take() else {
            return;
        };

        if running.exit_code.is_none() {
            match running.child.try_wait() {
                Ok(Some(status)) => running.exit_code = Some(status.code().unwrap_or(EXIT_UNKNOWN)),
                Ok(None) => {}
                Err(e) => {
                    kill_group(&mut running);
                    self.finish(ItemStatus::Done, EXIT_UNKNOWN, format!("cannot poll command: {e}"));
                    return;
                }
            }
        }

        let timed_out = running.started.elapsed() >= self.timeout;
        match running.exit_code {
            Some(code) if running.output_closed() => {
                let output = running.output(max_output);
                self.finish(ItemStatus::Done, code, output);
            }
            Some(code) if timed_out => {
                warn!(id = self.id, "command exited but left a process holding its output, killing it");
                kill_group(&mut running);
                let output = running.output(max_output);
                self.finish(ItemStatus::Done, code, output);
            }
            None if timed_out => {
                kill_group(&mut running);
                warn!(id = self.id, timeout_secs = self.timeout.as_secs_f64(), "action timed out");
                let message = format!("timed out after {}", humantime::format_duration(self.timeout));
                self.finish(ItemStatus::Timeout, EXIT_UNKNOWN, message);
            }
            _ => {
                running.interval = (running.interval * 2).min(MAX_POLL_INTERVAL);
                running.next_check = Instant::now() + running.interval;
                self.running = Some(running);
            }
        }
    }

    fn next_check(&self) -> Option<Instant> {
        self.running.as_ref().map(|running| running.next_check)
    }

    fn abort(&mut self) {
        if let Some(mut running) = self.running.take() {
            debug!(id = self.id, "aborting launched action");
            kill_group(&mut running);
        }
    }
}

/// Kill the command and everything it started. Output readers are left to
/// finish on their own.
fn kill_group(running: &mut Running) {
    let killed = i32::try_from(running.child.id())
        .map_err(|_| Errno::ESRCH)
        .and_then(|raw| killpg(Pid::from_raw(raw), Signal::SIGKILL));
    if killed.is_err() {
        let _ = running.child.kill();
    }
    let _ = running.child.wait();
}
