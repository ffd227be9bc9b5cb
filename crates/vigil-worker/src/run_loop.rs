//! The loop running inside a worker process.
//!
//! Each tick runs intake, launch, collection and the control check, in that
//! order:
//!
//! ```text
//!   intake ──▶ launch ──▶ collect ──▶ control
//!     ▲                                  │
//!     └──────── wait (next poll) ◀───────┘
//! ```
//!
//! Once a launch reports resource exhaustion the worker is *dying*: intake
//! closes for good, queued items go back to the master unlaunched, launched
//! items finish, and the loop ends when nothing is held any more.

use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};
use vigil_core::config::WorkerConfig;
use vigil_core::queue::{ITEM_MESSAGE, Message, SharedQueue};
use vigil_core::signals::StopToken;
use vigil_core::stdio::ChildIo;

use crate::item::{ItemStatus, LaunchOutcome, WorkItem};

/// Type of messages carrying items handed back unlaunched.
pub const RETURNED_MESSAGE: &str = "returned";

/// Wall clock jump, in seconds, treated as a clock correction.
pub const CLOCK_SKEW_THRESHOLD_SECS: i64 = 900;

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Stop message or stop signal
    Stopped,
    /// Dying and nothing left to finish
    Drained,
    /// The master closed the intake queue and nothing is held
    InputClosed,
    /// Mortal worker idle for longer than its idle timeout
    Idle,
    /// Results could not be delivered
    OutputLost,
}

impl ExitReason {
    /// Process exit code.
    pub fn code(&self) -> u8 {
        match self {
            Self::Stopped | Self::InputClosed | Self::Idle => 0,
            Self::Drained => 1,
            Self::OutputLost => 2,
        }
    }
}

/// Worker loop over items of type `I`.
pub struct WorkerLoop<I> {
    id: u64,
    settings: WorkerConfig,
    inbound: SharedQueue,
    control: SharedQueue,
    outbound: SharedQueue,
    stop: StopToken,
    held: Vec<I>,
    dying: bool,
    stop_requested: bool,
    input_closed: bool,
    output_lost: bool,
    idle: Duration,
    last_tick: DateTime<Utc>,
}

impl<I> WorkerLoop<I>
where
    I: WorkItem + Serialize + DeserializeOwned,
{
    pub fn new(id: u64, settings: WorkerConfig, io: ChildIo) -> Self {
        Self {
            id,
            settings,
            inbound: io.inbound,
            control: io.control,
            outbound: io.outbound,
            stop: StopToken::new(),
            held: Vec::new(),
            dying: false,
            stop_requested: false,
            input_closed: false,
            output_lost: false,
            idle: Duration::ZERO,
            last_tick: Utc::now(),
        }
    }

    /// Stop when `token` is set (by a signal handler).
    pub fn with_stop_token(mut self, token: StopToken) -> Self {
        self.stop = token;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn held(&self) -> &[I] {
        &self.held
    }

    pub fn is_dying(&self) -> bool {
        self.dying
    }

    pub fn idle_time(&self) -> Duration {
        self.idle
    }

    // =========================================================================
    // Tick phases
    // =========================================================================

    /// Pull items while fewer than `processes_by_worker` are held.
    ///
    /// Only the free slots are requested from the master, so items beyond
    /// them stay in the shared intake for other workers.
    /// Sleeps `intake_poll` when the queue is empty and nothing is held.
    /// A torn-down queue ends intake quietly. Returns the number pulled.
    pub fn pull_ready_items(&mut self) -> usize {
        if self.dying || self.input_closed {
            return 0;
        }
        let free = self.settings.processes_by_worker.saturating_sub(self.held.len());
        if let Err(e) = self.inbound.request(free) {
            debug!(worker_id = self.id, error = %e, "intake request not sent");
        }
        let mut pulled = 0;
        while self.held.len() < self.settings.processes_by_worker {
            match self.inbound.try_get() {
                Ok(Some(message)) if message.kind == ITEM_MESSAGE => match message.decode::<I>() {
                    Ok(item) => {
                        self.held.push(item);
                        pulled += 1;
                    }
                    Err(e) => warn!(worker_id = self.id, error = %e, "discarding undecodable item"),
                },
                Ok(Some(message)) => {
                    debug!(worker_id = self.id, kind = %message.kind, "ignoring message")
                }
                Ok(None) => {
                    if pulled == 0 && self.held.is_empty() {
                        thread::sleep(self.settings.intake_poll);
                    }
                    break;
                }
                Err(_) => {
                    info!(worker_id = self.id, "intake queue closed");
                    self.input_closed = true;
                    break;
                }
            }
        }
        if pulled > 0 {
            self.idle = Duration::ZERO;
        }
        pulled
    }

    /// Launch queued items in intake order. Stops at the first resource
    /// exhaustion and marks the worker dying. Returns the number launched.
    pub fn launch_ready_items(&mut self) -> usize {
        let mut launched = 0;
        for item in &mut self.held {
            if self.dying {
                break;
            }
            if item.status() != ItemStatus::Queued {
                continue;
            }
            match item.execute() {
                LaunchOutcome::Launched => launched += 1,
                LaunchOutcome::Failed => debug!(worker_id = self.id, "item failed to launch"),
                LaunchOutcome::ResourceExhausted => {
                    error!(
                        worker_id = self.id,
                        "local resources exhausted, worker stops taking work and will exit once drained"
                    );
                    self.dying = true;
                }
            }
        }
        launched
    }

    /// Poll due items and push every final item to the master, in intake
    /// order. A dying worker also hands back its queued items. Returns the
    /// number pushed.
    pub fn collect_finished_items(&mut self) -> usize {
        let now = Instant::now();
        let max_output = self.settings.max_output_length;
        for item in &mut self.held {
            if item.status() == ItemStatus::Launched && item.next_check().is_none_or(|due| due <= now) {
                item.check_finished(max_output);
            }
        }

        let dying = self.dying;
        let (outgoing, kept): (Vec<I>, Vec<I>) = std::mem::take(&mut self.held)
            .into_iter()
            .partition(|item| item.status().is_final() || (dying && item.status() == ItemStatus::Queued));
        self.held = kept;

        let mut pushed = 0;
        for item in outgoing {
            let kind = if item.status().is_final() { ITEM_MESSAGE } else { RETURNED_MESSAGE };
            let sent = Message::encode(kind, &item).and_then(|message| self.outbound.put(message));
            if let Err(e) = sent {
                error!(worker_id = self.id, error = %e, "cannot deliver results, exiting");
                self.output_lost = true;
                break;
            }
            pushed += 1;
        }
        pushed
    }

    /// Read the control queue. Returns true once a stop was requested.
    pub fn check_control(&mut self) -> bool {
        while let Ok(Some(message)) = self.control.try_get() {
            if message.is_stop() {
                info!(worker_id = self.id, "stop message received");
                self.stop_requested = true;
            }
        }
        if self.stop.is_stop_requested() {
            self.stop_requested = true;
        }
        self.stop_requested
    }

    // =========================================================================
    // Loop
    // =========================================================================

    /// One iteration. Returns the exit reason once the loop must end.
    pub fn tick(&mut self) -> Option<ExitReason> {
        self.tick_at(Utc::now())
    }

    /// [`tick`](Self::tick) against an explicit wall clock reading.
    pub fn tick_at(&mut self, wall: DateTime<Utc>) -> Option<ExitReason> {
        let was_idle = self.held.is_empty();

        self.pull_ready_items();
        self.launch_ready_items();
        self.collect_finished_items();
        self.check_control();

        let elapsed = self.elapsed_since_last_tick(wall);
        if was_idle && self.held.is_empty() {
            self.idle += elapsed;
        }

        if self.output_lost {
            return Some(ExitReason::OutputLost);
        }
        if self.stop_requested {
            return Some(ExitReason::Stopped);
        }
        if !self.held.is_empty() {
            return None;
        }
        if self.dying {
            return Some(ExitReason::Drained);
        }
        if self.input_closed {
            return Some(ExitReason::InputClosed);
        }
        if self.settings.mortal && self.idle > self.settings.idle_timeout {
            return Some(ExitReason::Idle);
        }
        None
    }

    /// Wall time since the previous tick, rebasing on clock corrections.
    fn elapsed_since_last_tick(&mut self, wall: DateTime<Utc>) -> Duration {
        let delta = wall - self.last_tick;
        self.last_tick = wall;
        if delta.num_seconds().abs() > CLOCK_SKEW_THRESHOLD_SECS {
            warn!(
                worker_id = self.id,
                jump_secs = delta.num_seconds(),
                "system clock jumped, rebasing tick reference"
            );
            return Duration::ZERO;
        }
        delta.to_std().unwrap_or(Duration::ZERO)
    }

    /// How long to wait before the next tick: until the earliest item poll,
    /// at most `intake_poll`.
    pub fn next_wait(&self) -> Duration {
        let now = Instant::now();
        self.held
            .iter()
            .filter(|item| item.status() == ItemStatus::Launched)
            .filter_map(|item| item.next_check())
            .map(|due| due.saturating_duration_since(now))
            .fold(self.settings.intake_poll, Duration::min)
    }

    /// Tick until an exit reason comes up. Launched items are aborted when
    /// the loop is stopped.
    pub fn run(&mut self) -> ExitReason {
        info!(worker_id = self.id, pid = std::process::id(), "worker running");
        let reason = loop {
            if let Some(reason) = self.tick() {
                break reason;
            }
            if !self.held.is_empty() {
                thread::sleep(self.next_wait());
            }
        };
        if reason == ExitReason::Stopped || reason == ExitReason::OutputLost {
            for item in &mut self.held {
                item.abort();
            }
        }
        info!(worker_id = self.id, ?reason, held = self.held.len(), "worker exiting");
        reason
    }
}
