//! # vigil-core
//!
//! Core types, errors, and process plumbing for the Vigil daemon framework.
//!
//! This crate provides:
//! - [`VigilError`] - Error type shared by every Vigil crate
//! - [`logging`] - Tracing setup for parent daemons and spawned children
//! - [`config`] - YAML daemon configuration and module descriptors
//! - [`queue`] - Messages, queues and the queue factory abstraction
//! - [`process`] - Process handles, spawning and escalating termination
//! - [`signals`] - Child-side signal dispatch and process titles
//! - [`stdio`] - Child-side ends of the stdio queue bridge
//!
//! ## Example
//!
//! ```no_run
//! use vigil_core::{DaemonConfig, logging};
//!
//! fn main() -> vigil_core::Result<()> {
//!     let _guard = logging::init_logging(None, "broker-master", false)?;
//!     let config = DaemonConfig::load("/etc/vigil/broker.yaml")?;
//!     tracing::info!(daemon = %config.daemon.name, "configuration loaded");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod process;
pub mod queue;
pub mod signals;
pub mod stdio;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export main types for convenience
pub use config::{DaemonConfig, ModuleDescriptor, SupervisorConfig, WorkerConfig};
pub use error::{Result, VigilError};
pub use logging::{LogGuard, init_logging};
pub use process::{
    ChildRole, CommandSpawner, ProcessHandle, SpawnRequest, Spawner, Termination,
    terminate_escalating,
};
pub use queue::{
    LocalQueueFactory, Message, MessageQueue, QueueFactory, QueuePair, SharedQueue,
    SharedQueueManager,
};
pub use signals::{SignalTable, StopToken};
pub use stdio::ChildIo;
