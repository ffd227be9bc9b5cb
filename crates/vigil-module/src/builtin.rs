//! Modules shipped with the daemon.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;
use vigil_core::config::ModuleDescriptor;

use crate::module::{Capabilities, Module, ModuleContext, ModuleProperties, Phase};
use crate::registry::{ModuleImplementation, ModuleRegistry};

pub const ECHO: &str = "echo";
pub const NULL: &str = "null";

/// External module sending every inbound message back unchanged.
///
/// A `prefix` setting, when present, is prepended to the message type.
#[derive(Debug, Default)]
pub struct EchoModule {
    prefix: Option<String>,
    echoed: u64,
}

impl EchoModule {
    pub fn from_descriptor(descriptor: &ModuleDescriptor) -> Self {
        Self {
            prefix: descriptor
                .setting("prefix")
                .and_then(|value| value.as_str())
                .map(str::to_string),
            echoed: 0,
        }
    }
}

impl Module for EchoModule {
    fn main(&mut self, ctx: &mut ModuleContext) -> anyhow::Result<()> {
        while !ctx.should_stop() {
            let Some(mut message) = ctx.recv()? else {
                continue;
            };
            if let Some(prefix) = &self.prefix {
                message.kind = format!("{prefix}{}", message.kind);
            }
            ctx.send(message)?;
            self.echoed += 1;
        }
        Ok(())
    }

    fn do_stop(&mut self) {
        info!(echoed = self.echoed, "echo module stopped");
    }
}

/// Internal module doing nothing; records whether it was asked to quit.
#[derive(Debug, Default, Clone)]
pub struct NullModule {
    quit: Arc<AtomicBool>,
}

impl NullModule {
    /// Whether the quit hook ran, shared between clones.
    pub fn has_quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }
}

impl Module for NullModule {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            quit: true,
            retention: false,
        }
    }

    fn quit(&mut self) {
        self.quit.store(true, Ordering::SeqCst);
    }
}

/// Register the built-in modules.
pub fn register_builtins(registry: &mut ModuleRegistry) {
    registry.register(
        ECHO,
        ModuleImplementation::new(ModuleProperties::external(ECHO, &[Phase::Running]), |descriptor| {
            Ok(Box::new(EchoModule::from_descriptor(descriptor)) as Box<dyn Module>)
        }),
    );
    registry.register(
        NULL,
        ModuleImplementation::new(ModuleProperties::internal(NULL, &[Phase::Running]), |_| {
            Ok(Box::new(NullModule::default()) as Box<dyn Module>)
        }),
    );
}
