//! OS process handles, spawning and the escalating termination protocol.
//!
//! Modules and workers run as child processes of the daemon. A child is a
//! re-execution of the daemon binary (`vigil child`) told what to run through
//! environment variables; its queues are bridged onto its stdio as JSON lines
//! by two pump threads per child.
//!
//! The input queue is only drained on the child's request. The child writes
//! a [`DEMAND_MESSAGE`] for as many messages as it is ready to take and an
//! [`ACK_MESSAGE`] for each one it consumed. Messages sent but never
//! acknowledged go back to the input queue once the child's stdout closes,
//! so a stalled child leaves its backlog in the parent's queue and a dead
//! one loses nothing it had not started on.
//!
//! [`terminate_escalating`] is the only place that stops a child: terminate
//! signal, bounded wait, kill signal, short wait, then abandon with an error
//! log. Both module units and workers call it.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{ModuleDescriptor, WorkerConfig};
use crate::error::{Result, VigilError};
use crate::queue::{ACK_MESSAGE, DEMAND_MESSAGE, Message, SharedQueue};

/// Wait after the kill signal before a process is abandoned.
pub const HARD_KILL_WAIT: Duration = Duration::from_secs(1);

/// Polling granularity of [`ProcessHandle::join`].
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Sleep of the stdin pump when every input queue is empty.
const PUMP_IDLE: Duration = Duration::from_millis(20);

pub const ENV_CHILD_ROLE: &str = "VIGIL_CHILD_ROLE";
pub const ENV_DAEMON_NAME: &str = "VIGIL_DAEMON_NAME";
pub const ENV_PROCESS_TITLE: &str = "VIGIL_PROCESS_TITLE";
pub const ENV_MODULE_DESCRIPTOR: &str = "VIGIL_MODULE_DESCRIPTOR";
pub const ENV_WORKER_ID: &str = "VIGIL_WORKER_ID";
pub const ENV_WORKER_SETTINGS: &str = "VIGIL_WORKER_SETTINGS";

/// Handle on a spawned OS process.
pub trait ProcessHandle: Send + std::fmt::Debug {
    /// OS process identifier.
    fn pid(&self) -> u32;

    /// Whether the process is still running. Reaps it if it exited.
    fn is_alive(&mut self) -> bool;

    /// Send the graceful terminate signal.
    fn terminate(&mut self) -> Result<()>;

    /// Send the unconditional kill signal.
    fn kill(&mut self) -> Result<()>;

    /// Wait up to `timeout` for the process to exit. Returns true if it did.
    fn join(&mut self, timeout: Duration) -> bool;
}

/// Outcome of [`terminate_escalating`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process was already gone
    AlreadyExited,
    /// The process exited after the terminate signal
    Graceful,
    /// The process exited after the kill signal
    Killed,
    /// The process survived both signals and was left behind
    Abandoned,
}

impl Termination {
    /// Whether the process is known to be gone.
    pub fn is_stopped(&self) -> bool {
        !matches!(self, Self::Abandoned)
    }
}

/// Stop a process: terminate, wait `grace`, kill, wait [`HARD_KILL_WAIT`],
/// then give up.
///
/// Never blocks longer than `grace + HARD_KILL_WAIT` and never fails; an
/// unkillable process is logged and abandoned.
pub fn terminate_escalating(process: &mut dyn ProcessHandle, name: &str, grace: Duration) -> Termination {
    if !process.is_alive() {
        debug!(name, pid = process.pid(), "process already exited");
        return Termination::AlreadyExited;
    }

    let pid = process.pid();
    debug!(name, pid, "sending terminate signal");
    if let Err(e) = process.terminate() {
        warn!(name, pid, error = %e, "terminate signal failed");
    }
    if process.join(grace) {
        info!(name, pid, "process terminated");
        return Termination::Graceful;
    }

    warn!(name, pid, grace_secs = grace.as_secs_f64(), "process ignored terminate signal, killing it");
    if let Err(e) = process.kill() {
        warn!(name, pid, error = %e, "kill signal failed");
    }
    if process.join(HARD_KILL_WAIT) {
        info!(name, pid, "process killed");
        return Termination::Killed;
    }

    error!(name, pid, "process survived the kill signal, abandoning it");
    Termination::Abandoned
}

/// What a spawned child runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChildRole {
    /// An external module's run loop
    Module { descriptor: ModuleDescriptor },
    /// A check worker loop
    Worker { id: u64, settings: WorkerConfig },
}

impl ChildRole {
    fn apply_env(&self, cmd: &mut Command) -> Result<()> {
        match self {
            Self::Module { descriptor } => {
                let json = serde_json::to_string(descriptor)
                    .map_err(|e| VigilError::json("encoding module descriptor", e))?;
                cmd.env(ENV_CHILD_ROLE, "module").env(ENV_MODULE_DESCRIPTOR, json);
            }
            Self::Worker { id, settings } => {
                let json = serde_json::to_string(settings)
                    .map_err(|e| VigilError::json("encoding worker settings", e))?;
                cmd.env(ENV_CHILD_ROLE, "worker")
                    .env(ENV_WORKER_ID, id.to_string())
                    .env(ENV_WORKER_SETTINGS, json);
            }
        }
        Ok(())
    }

    /// Read the role a parent passed to this process.
    pub fn from_env() -> Result<Self> {
        let role = env_var(ENV_CHILD_ROLE)?;
        match role.as_str() {
            "module" => {
                let json = env_var(ENV_MODULE_DESCRIPTOR)?;
                let descriptor = serde_json::from_str(&json)
                    .map_err(|e| VigilError::json("decoding module descriptor", e))?;
                Ok(Self::Module { descriptor })
            }
            "worker" => {
                let id = env_var(ENV_WORKER_ID)?
                    .parse()
                    .map_err(|e| VigilError::internal(format!("invalid {ENV_WORKER_ID}: {e}")))?;
                let json = env_var(ENV_WORKER_SETTINGS)?;
                let settings = serde_json::from_str(&json)
                    .map_err(|e| VigilError::json("decoding worker settings", e))?;
                Ok(Self::Worker { id, settings })
            }
            other => Err(VigilError::internal(format!("unknown child role '{other}'"))),
        }
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| VigilError::internal(format!("{key} is not set")))
}

/// Everything needed to spawn one child.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Unit name, used for logs and thread names
    pub name: String,
    /// Name of the daemon that owns the child
    pub daemon_name: String,
    /// Title the child sets on itself
    pub title: String,
    pub role: ChildRole,
    /// Queue forwarded to the child's stdin as soon as messages arrive
    pub control: Option<SharedQueue>,
    /// Queue forwarded to the child's stdin on demand
    pub input: Option<SharedQueue>,
    /// Queue receiving the child's stdout messages
    pub output: Option<SharedQueue>,
}

/// Starts child processes.
pub trait Spawner: Send + Sync + std::fmt::Debug {
    fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn ProcessHandle>>;
}

/// Spawns children by running a program.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-execute the running binary with its `child` subcommand.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| VigilError::io("locating daemon binary", "current_exe", e))?;
        Ok(Self::new(exe).arg("child"))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl Spawner for CommandSpawner {
    fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn ProcessHandle>> {
        let piped_in = request.control.is_some() || request.input.is_some();
        let piped_out = request.output.is_some() || request.input.is_some();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(ENV_DAEMON_NAME, &request.daemon_name)
            .env(ENV_PROCESS_TITLE, &request.title)
            .stdin(if piped_in { Stdio::piped() } else { Stdio::null() })
            .stdout(if piped_out { Stdio::piped() } else { Stdio::null() })
            .stderr(Stdio::inherit());
        request.role.apply_env(&mut cmd)?;

        let mut child = cmd
            .spawn()
            .map_err(|e| VigilError::process_spawn(&request.name, e.to_string()))?;

        let bridge_stop = Arc::new(AtomicBool::new(false));
        let flow = Arc::new(Mutex::new(Flow::default()));
        if let Some(stdin) = child.stdin.take() {
            let pump = StdinPump {
                control: request.control,
                input: request.input.clone(),
                flow: Arc::clone(&flow),
                stop: Arc::clone(&bridge_stop),
            };
            pump.spawn(&request.name, stdin)?;
        }
        if let Some(stdout) = child.stdout.take() {
            spawn_stdout_pump(&request.name, stdout, request.output, request.input, flow)?;
        }

        debug!(name = %request.name, pid = child.id(), program = %self.program.display(), "spawned child process");
        Ok(Box::new(ChildProcess {
            name: request.name,
            child,
            exited: false,
            exit_code: None,
            bridge_stop,
        }))
    }
}

/// Demand-driven delivery state of one child's input queue.
#[derive(Debug, Default)]
struct Flow {
    /// Messages the child asked for and has not been sent yet
    credit: usize,
    /// Sent and not acknowledged, oldest first
    in_flight: VecDeque<Message>,
    /// Set once the child's stdout closed
    closed: bool,
}

impl Flow {
    /// Take the next input message if the child asked for one.
    fn take(&mut self, input: &SharedQueue) -> Result<Option<Message>> {
        if self.closed {
            return Err(VigilError::queue_closed("child stdout"));
        }
        if self.credit == 0 {
            return Ok(None);
        }
        let Some(message) = input.try_get()? else {
            return Ok(None);
        };
        // Stop messages are routed to the child's control queue and are
        // never acknowledged.
        if !message.is_stop() {
            self.credit -= 1;
            self.in_flight.push_back(message.clone());
        }
        Ok(Some(message))
    }
}

struct StdinPump {
    control: Option<SharedQueue>,
    input: Option<SharedQueue>,
    flow: Arc<Mutex<Flow>>,
    stop: Arc<AtomicBool>,
}

/// Outcome of polling one source queue.
enum Polled {
    Sent,
    Empty,
    Closed,
}

impl StdinPump {
    fn spawn(self, name: &str, stdin: ChildStdin) -> Result<()> {
        thread::Builder::new()
            .name(format!("{name}-stdin"))
            .spawn(move || self.run(BufWriter::new(stdin)))
            .map_err(|e| VigilError::process_spawn(name, format!("stdin pump: {e}")))?;
        Ok(())
    }

    fn run(self, mut writer: BufWriter<ChildStdin>) {
        while !self.stop.load(Ordering::Relaxed) {
            let control = match &self.control {
                Some(queue) => Self::forward(&mut writer, queue.try_get()),
                None => Polled::Closed,
            };
            let input = match &self.input {
                Some(queue) => {
                    let taken = self.flow.lock().take(queue);
                    Self::forward(&mut writer, taken)
                }
                None => Polled::Closed,
            };

            match (control, input) {
                (Polled::Closed, Polled::Closed) => return,
                (Polled::Sent, _) | (_, Polled::Sent) => {
                    if writer.flush().is_err() {
                        return;
                    }
                }
                _ => thread::sleep(PUMP_IDLE),
            }
        }
    }

    fn forward(writer: &mut impl Write, polled: Result<Option<Message>>) -> Polled {
        match polled {
            Ok(Some(message)) => match write_line(writer, &message) {
                Ok(()) => Polled::Sent,
                Err(_) => Polled::Closed,
            },
            Ok(None) => Polled::Empty,
            Err(_) => Polled::Closed,
        }
    }
}

fn spawn_stdout_pump(
    name: &str,
    stdout: ChildStdout,
    output: Option<SharedQueue>,
    input: Option<SharedQueue>,
    flow: Arc<Mutex<Flow>>,
) -> Result<()> {
    let owner = name.to_string();
    thread::Builder::new()
        .name(format!("{name}-stdout"))
        .spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let message = match serde_json::from_str::<Message>(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(name = %owner, error = %e, "discarding malformed child message");
                        continue;
                    }
                };
                match message.kind.as_str() {
                    DEMAND_MESSAGE => {
                        let count = message
                            .payload
                            .as_u64()
                            .and_then(|count| usize::try_from(count).ok())
                            .unwrap_or(0);
                        flow.lock().credit += count;
                    }
                    ACK_MESSAGE => {
                        flow.lock().in_flight.pop_front();
                    }
                    _ => {
                        if let Some(output) = &output {
                            if output.put(message).is_err() {
                                break;
                            }
                        }
                    }
                }
            }

            let unacknowledged = {
                let mut flow = flow.lock();
                flow.closed = true;
                flow.credit = 0;
                std::mem::take(&mut flow.in_flight)
            };
            if let Some(input) = input {
                return_to_queue(&owner, &input, unacknowledged);
            }
        })
        .map_err(|e| VigilError::process_spawn(name, format!("stdout pump: {e}")))?;
    Ok(())
}

/// Put messages a gone child never consumed back on its input queue.
fn return_to_queue(name: &str, input: &SharedQueue, messages: VecDeque<Message>) {
    if messages.is_empty() {
        return;
    }
    let count = messages.len();
    for message in messages {
        if input.put(message).is_err() {
            debug!(name, "input queue closed, unconsumed messages dropped");
            return;
        }
    }
    info!(name, count, "returned unconsumed messages to the input queue");
}

/// Write one message as a JSON line.
pub fn write_line(writer: &mut impl Write, message: &Message) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, message)?;
    writer.write_all(b"\n")
}

/// A child started by [`CommandSpawner`].
#[derive(Debug)]
pub struct ChildProcess {
    name: String,
    child: Child,
    exited: bool,
    exit_code: Option<i32>,
    bridge_stop: Arc<AtomicBool>,
}

impl ChildProcess {
    /// Exit code, once the process has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn poll_exit(&mut self) -> bool {
        if self.exited {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.mark_exited(status.code());
                true
            }
            Ok(None) => false,
            Err(e) => {
                // Nothing left to wait for.
                debug!(name = %self.name, error = %e, "wait failed, treating process as gone");
                self.mark_exited(None);
                true
            }
        }
    }

    fn mark_exited(&mut self, code: Option<i32>) {
        self.exited = true;
        self.exit_code = code;
        self.bridge_stop.store(true, Ordering::Relaxed);
        debug!(name = %self.name, pid = self.child.id(), code, "child process exited");
    }

    fn send(&self, sig: Signal) -> Result<()> {
        let raw = i32::try_from(self.child.id())
            .map_err(|_| VigilError::internal(format!("pid {} out of range", self.child.id())))?;
        match signal::kill(Pid::from_raw(raw), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(VigilError::ProcessSignal {
                pid: self.child.id(),
                signal: sig.as_str().to_string(),
                message: e.to_string(),
            }),
        }
    }
}

impl ProcessHandle for ChildProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        !self.poll_exit()
    }

    fn terminate(&mut self) -> Result<()> {
        if self.poll_exit() {
            return Ok(());
        }
        self.send(Signal::SIGTERM)
    }

    fn kill(&mut self) -> Result<()> {
        if self.poll_exit() {
            return Ok(());
        }
        self.send(Signal::SIGKILL)
    }

    fn join(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.poll_exit() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(JOIN_POLL.min(deadline - now));
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.bridge_stop.store(true, Ordering::Relaxed);
    }
}
