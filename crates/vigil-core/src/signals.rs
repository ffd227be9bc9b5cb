//! Signal handling inside spawned children.
//!
//! A child builds a [`SignalTable`] once at start-up and installs it. The
//! table maps each handled signal to an action; stop actions flip the
//! child's own [`StopToken`], every signal is also forwarded as a
//! notification the running module may react to. SIGHUP stops the child:
//! modules cannot reload in place.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::{Handle, Signals};
use tracing::{debug, info};

use crate::error::{Result, VigilError};

/// Cooperative cancellation flag of one child.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the owner to stop at its next loop boundary.
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Signals a child handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildSignal {
    Terminate,
    Interrupt,
    User1,
    User2,
    Hangup,
}

impl ChildSignal {
    pub const ALL: [ChildSignal; 5] = [
        Self::Terminate,
        Self::Interrupt,
        Self::User1,
        Self::User2,
        Self::Hangup,
    ];

    pub fn raw(&self) -> i32 {
        match self {
            Self::Terminate => SIGTERM,
            Self::Interrupt => SIGINT,
            Self::User1 => SIGUSR1,
            Self::User2 => SIGUSR2,
            Self::Hangup => SIGHUP,
        }
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|signal| signal.raw() == raw)
    }
}

/// What a handled signal does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Request the child to stop
    Stop,
    /// Only notify the running module
    Notify,
}

/// Dispatch table of a child process.
#[derive(Debug, Clone)]
pub struct SignalTable {
    entries: Vec<(ChildSignal, SignalAction)>,
}

impl SignalTable {
    /// The table every module and worker child uses.
    pub fn child_default() -> Self {
        Self {
            entries: vec![
                (ChildSignal::Terminate, SignalAction::Stop),
                (ChildSignal::Interrupt, SignalAction::Stop),
                (ChildSignal::Hangup, SignalAction::Stop),
                (ChildSignal::User1, SignalAction::Notify),
                (ChildSignal::User2, SignalAction::Notify),
            ],
        }
    }

    pub fn action_for(&self, signal: ChildSignal) -> Option<SignalAction> {
        self.entries
            .iter()
            .find(|(handled, _)| *handled == signal)
            .map(|(_, action)| *action)
    }

    /// Apply the action bound to `signal`.
    pub fn dispatch(&self, signal: ChildSignal, stop: &StopToken, notify: &Sender<ChildSignal>) {
        match self.action_for(signal) {
            Some(SignalAction::Stop) => {
                info!(?signal, "stop requested by signal");
                stop.request_stop();
            }
            Some(SignalAction::Notify) => debug!(?signal, "signal received"),
            None => return,
        }
        let _ = notify.try_send(signal);
    }

    /// Register the table with the OS and dispatch from a listener thread.
    pub fn install(self, stop: StopToken) -> Result<SignalListener> {
        let raw: Vec<i32> = self.entries.iter().map(|(signal, _)| signal.raw()).collect();
        let mut signals = Signals::new(&raw).map_err(|e| VigilError::SignalSetup {
            message: e.to_string(),
        })?;
        let handle = signals.handle();
        let (sender, receiver) = crossbeam_channel::unbounded();

        thread::Builder::new()
            .name("vigil-signals".into())
            .spawn(move || {
                for raw in signals.forever() {
                    if let Some(signal) = ChildSignal::from_raw(raw) {
                        self.dispatch(signal, &stop, &sender);
                    }
                }
            })
            .map_err(|e| VigilError::SignalSetup {
                message: e.to_string(),
            })?;

        Ok(SignalListener { receiver, handle })
    }
}

/// Installed signal table; dropping it does not uninstall the handlers.
#[derive(Debug)]
pub struct SignalListener {
    receiver: Receiver<ChildSignal>,
    handle: Handle,
}

impl SignalListener {
    /// Next received signal, if any.
    pub fn try_next(&self) -> Option<ChildSignal> {
        self.receiver.try_recv().ok()
    }

    pub fn receiver(&self) -> &Receiver<ChildSignal> {
        &self.receiver
    }

    /// Stop the listener thread.
    pub fn close(&self) {
        self.handle.close();
    }
}

/// Install the default child table bound to `stop`.
pub fn install_child_handlers(stop: StopToken) -> Result<SignalListener> {
    SignalTable::child_default().install(stop)
}

/// Set the process title shown by `ps`/`top`.
///
/// Best effort: Linux only, truncated to the kernel's 15 byte limit.
pub fn set_process_title(title: &str) -> bool {
    #[cfg(target_os = "linux")]
    {
        let mut end = title.len().min(15);
        while !title.is_char_boundary(end) {
            end -= 1;
        }
        std::fs::write("/proc/self/comm", &title[..end]).is_ok()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = title;
        false
    }
}
