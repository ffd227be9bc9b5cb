//! The pluggable module contract.
//!
//! A module implementation is registered with a `properties` record and an
//! instance factory (see [`crate::registry`]). The factory returns a boxed
//! [`Module`]; everything the supervisor needs to know about it is read
//! once, at instantiation time, into [`ModuleProperties`] and
//! [`Capabilities`].

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_core::queue::{Message, SharedQueue};
use vigil_core::signals::{ChildSignal, SignalListener, StopToken};
use vigil_core::stdio::ChildIo;

/// Sleep used when a module polls an empty queue.
pub const POLL_IDLE: Duration = Duration::from_millis(50);

/// Lifecycle phases a module takes part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Configuration,
    LateConfiguration,
    Running,
    Retention,
}

/// Declared properties of a module implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleProperties {
    /// Free-form type tag
    #[serde(rename = "type", default)]
    pub module_type: String,

    /// Whether instances run in their own process
    #[serde(default = "default_external")]
    pub external: bool,

    #[serde(default)]
    pub phases: Vec<Phase>,
}

fn default_external() -> bool {
    true
}

impl ModuleProperties {
    pub fn external(module_type: impl Into<String>, phases: &[Phase]) -> Self {
        Self {
            module_type: module_type.into(),
            external: true,
            phases: phases.to_vec(),
        }
    }

    pub fn internal(module_type: impl Into<String>, phases: &[Phase]) -> Self {
        Self {
            external: false,
            ..Self::external(module_type, phases)
        }
    }

    pub fn has_phase(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }

    /// Encode as the raw record registered with an implementation.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Optional hooks a module provides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Has a voluntary quit hook, called on shutdown of internal modules
    pub quit: bool,
    /// Has retention hooks, called on internal modules at daemon start and
    /// shutdown
    pub retention: bool,
}

/// A pluggable module.
///
/// `init` runs in the supervising daemon, which only starts the module once
/// it returned `Ok(true)`. External modules run `init` again in their own
/// process, then `main` and `do_stop`.
pub trait Module: Send {
    /// Prepare the module. `Ok(false)` asks for a supervised retry, an error
    /// is recorded and also retried.
    fn init(&mut self) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Run loop of an external module.
    ///
    /// The default drains and discards inbound messages until asked to stop.
    fn main(&mut self, ctx: &mut ModuleContext) -> anyhow::Result<()> {
        while !ctx.should_stop() {
            ctx.recv()?;
        }
        Ok(())
    }

    /// Cleanup after `main` returned, even on failure.
    fn do_stop(&mut self) {}

    /// Queried once, when the instance is created.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Voluntary quit hook; only called when `capabilities().quit` is set.
    fn quit(&mut self) {}

    /// Restore state saved by a previous run. Only called when
    /// `capabilities().retention` is set.
    fn load_retention(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Save state for the next run. Only called when
    /// `capabilities().retention` is set.
    fn save_retention(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called on every supervisor tick for healthy internal modules.
    fn hook_tick(&mut self) {}
}

/// What a running module sees of its process.
#[derive(Debug)]
pub struct ModuleContext {
    name: String,
    inbound: SharedQueue,
    outbound: SharedQueue,
    control: SharedQueue,
    stop: StopToken,
    signals: Option<SignalListener>,
}

impl ModuleContext {
    pub fn new(name: impl Into<String>, io: ChildIo, stop: StopToken) -> Self {
        Self {
            name: name.into(),
            inbound: io.inbound,
            outbound: io.outbound,
            control: io.control,
            stop,
            signals: None,
        }
    }

    pub fn with_signals(mut self, listener: SignalListener) -> Self {
        self.signals = Some(listener);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once a stop signal or stop message was received.
    ///
    /// Reading the control queue happens here, so loops should call this
    /// once per iteration.
    pub fn should_stop(&self) -> bool {
        while let Ok(Some(message)) = self.control.try_get() {
            if message.is_stop() {
                self.stop.request_stop();
            }
        }
        self.stop.is_stop_requested()
    }

    /// Whether a signal or stop message interrupted the module.
    pub fn is_interrupted(&self) -> bool {
        self.stop.is_stop_requested()
    }

    /// Next inbound message, sleeping [`POLL_IDLE`] when there is none.
    ///
    /// Asks the parent for one message at a time, so messages the module
    /// does not read stay queued on the parent side.
    /// Fails with `QueueClosed` once the parent went away.
    pub fn recv(&self) -> vigil_core::Result<Option<Message>> {
        self.inbound.request(1)?;
        let message = self.inbound.try_get()?;
        if message.is_none() {
            thread::sleep(POLL_IDLE);
        }
        Ok(message)
    }

    pub fn send(&self, message: Message) -> vigil_core::Result<()> {
        self.outbound.put(message)
    }

    /// Next signal delivered to the process, if any.
    pub fn take_signal(&self) -> Option<ChildSignal> {
        self.signals.as_ref().and_then(SignalListener::try_next)
    }

    pub fn stop_token(&self) -> &StopToken {
        &self.stop
    }

    pub(crate) fn close_signals(&self) {
        if let Some(listener) = &self.signals {
            listener.close();
        }
    }
}
