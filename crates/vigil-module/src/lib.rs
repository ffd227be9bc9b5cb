//! Module lifecycle and supervision for Vigil.
//!
//! Modules are pluggable units of optional behavior (retention, log
//! shipping, external command bridges). An external module runs in its own
//! process so that a crash or a hang cannot take the daemon down with it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐      resolve       ┌──────────────────────┐
//! │   ModuleSupervisor   │ ─────────────────▶ │    ModuleRegistry    │
//! │ (load, start, tick)  │                    │ (properties+factory) │
//! └──────────┬───────────┘                    └──────────────────────┘
//!            │ owns
//!            ▼
//! ┌──────────────────────┐   stdin/stdout     ┌──────────────────────┐
//! │      ModuleUnit      │ ═════════════════▶ │  run_module_child    │
//! │ (queues, process)    │   JSON lines       │  (Module::main)      │
//! └──────────────────────┘                    └──────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vigil_core::{CommandSpawner, LocalQueueFactory, ModuleDescriptor, SupervisorConfig};
//! use vigil_module::{ModuleRegistry, ModuleSupervisor, builtin};
//!
//! fn main() -> vigil_core::Result<()> {
//!     let mut registry = ModuleRegistry::new();
//!     builtin::register_builtins(&mut registry);
//!
//!     let mut supervisor = ModuleSupervisor::new(
//!         SupervisorConfig::default(),
//!         Arc::new(registry),
//!         Arc::new(LocalQueueFactory),
//!         Arc::new(CommandSpawner::current_exe()?),
//!     );
//!     supervisor.set_daemon_name("broker");
//!     supervisor.load(&[ModuleDescriptor::new("echo-1", "echo")]);
//!     supervisor.instantiate();
//!     supervisor.start_externals(true);
//!
//!     // On every tick of the daemon loop:
//!     supervisor.tick();
//!
//!     supervisor.shutdown_all();
//!     Ok(())
//! }
//! ```

pub mod builtin;
pub mod child;
pub mod module;
pub mod registry;
pub mod supervisor;
pub mod unit;

#[cfg(test)]
mod lifecycle_tests;

// Re-export main types for convenience
pub use child::{ChildExit, prepare_module, run_module, run_module_child};
pub use module::{Capabilities, Module, ModuleContext, ModuleProperties, Phase};
pub use registry::{InstanceFactory, ModuleImplementation, ModuleRegistry, ResolvedModule};
pub use supervisor::ModuleSupervisor;
pub use unit::ModuleUnit;
