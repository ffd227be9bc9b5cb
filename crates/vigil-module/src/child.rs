//! Entry point of an external module's own process.

use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{debug, error, info, warn};
use vigil_core::config::ModuleDescriptor;
use vigil_core::error::VigilError;
use vigil_core::process::ENV_PROCESS_TITLE;
use vigil_core::signals::{StopToken, install_child_handlers, set_process_title};
use vigil_core::stdio::ChildIo;

use crate::module::{Module, ModuleContext};
use crate::registry::ModuleRegistry;

/// How a module process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// `main` returned, was stopped, or lost its parent
    Clean,
    /// `main` failed or panicked
    Failed,
    /// The module could not be created in the child
    Unavailable,
}

impl ChildExit {
    pub fn code(&self) -> u8 {
        match self {
            Self::Clean => 0,
            Self::Failed => 1,
            Self::Unavailable => 3,
        }
    }
}

/// Run the module described by `descriptor` in this process.
///
/// Installs the child signal table and process title, recreates and
/// initializes the module through `registry`, then hands over to
/// [`run_module`].
pub fn run_module_child(registry: &ModuleRegistry, descriptor: &ModuleDescriptor, io: ChildIo) -> ChildExit {
    let title = std::env::var(ENV_PROCESS_TITLE).unwrap_or_else(|_| format!("vigil-{}", descriptor.name));
    if !set_process_title(&title) {
        debug!(title = %title, "process title not set");
    }

    let Some(module) = prepare_module(registry, descriptor) else {
        return ChildExit::Unavailable;
    };

    let stop = StopToken::new();
    let mut ctx = ModuleContext::new(descriptor.name.clone(), io, stop.clone());
    match install_child_handlers(stop) {
        Ok(listener) => ctx = ctx.with_signals(listener),
        Err(e) => warn!(module = %descriptor.name, error = %e, "signal handlers not installed"),
    }

    let exit = run_module(module, &mut ctx);
    ctx.close_signals();
    exit
}

/// Create the module instance of this process and run its `init` hook, so
/// that whatever `init` sets up lives in the process running `main`.
pub fn prepare_module(registry: &ModuleRegistry, descriptor: &ModuleDescriptor) -> Option<Box<dyn Module>> {
    let mut module = match registry
        .resolve(descriptor)
        .map_err(anyhow::Error::from)
        .and_then(|resolved| resolved.create_module())
    {
        Ok(module) => module,
        Err(e) => {
            let e = VigilError::ModuleInstantiation {
                module: descriptor.name.clone(),
                message: format!("{e:#}"),
            };
            error!(error = %e, "cannot create module in child");
            return None;
        }
    };

    match catch_unwind(AssertUnwindSafe(|| module.init())) {
        Ok(Ok(true)) => Some(module),
        Ok(Ok(false)) => {
            warn!(module = %descriptor.name, "module not ready in its process");
            None
        }
        Ok(Err(e)) => {
            let e = VigilError::ModuleInit {
                module: descriptor.name.clone(),
                message: format!("{e:#}"),
            };
            error!(error = %e, "module init failed in its process");
            None
        }
        Err(panic) => {
            let e = VigilError::ModuleInit {
                module: descriptor.name.clone(),
                message: format!("panicked: {}", panic_message(panic.as_ref())),
            };
            error!(error = %e, "module init failed in its process");
            None
        }
    }
}

/// Run `main` under a catch-all guard, then `do_stop`.
///
/// Closed queues and broken pipes mean the parent went away and end the
/// module quietly.
pub fn run_module(mut module: Box<dyn Module>, ctx: &mut ModuleContext) -> ChildExit {
    info!(module = %ctx.name(), pid = std::process::id(), "module process running");

    let outcome = catch_unwind(AssertUnwindSafe(|| module.main(ctx)));
    let exit = match outcome {
        Ok(Ok(())) => ChildExit::Clean,
        Ok(Err(e)) if is_disconnect(&e) => {
            debug!(module = %ctx.name(), error = %e, "parent went away");
            ChildExit::Clean
        }
        Ok(Err(e)) => {
            error!(module = %ctx.name(), error = %format!("{e:#}"), "module main failed");
            ChildExit::Failed
        }
        Err(panic) => {
            error!(module = %ctx.name(), panic = %panic_message(panic.as_ref()), "module main panicked");
            ChildExit::Failed
        }
    };

    if catch_unwind(AssertUnwindSafe(|| module.do_stop())).is_err() {
        error!(module = %ctx.name(), "module stop hook panicked");
    }
    info!(module = %ctx.name(), interrupted = ctx.is_interrupted(), exit = ?exit, "module process exiting");
    exit
}

fn is_disconnect(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        if let Some(vigil) = cause.downcast_ref::<VigilError>() {
            return vigil.is_queue_closed();
        }
        cause.downcast_ref::<io::Error>().is_some_and(|err| {
            matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset
            )
        })
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic".to_string()
    }
}
