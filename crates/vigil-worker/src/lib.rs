//! Check and action workers for Vigil.
//!
//! A worker is a process that pulls work items from the master, runs them
//! in parallel and pushes results back. The daemon side holds a [`Worker`]
//! handle; the process itself runs a [`WorkerLoop`].
//!
//! Items travel as `item` messages whose payload is the serialized item.
//! Results come back the same way; items handed back unlaunched by a dying
//! worker use the `returned` message type.
//!
//! # Example
//!
//! ```no_run
//! use vigil_core::{CommandSpawner, WorkerConfig};
//! use vigil_core::queue::{ITEM_MESSAGE, LocalQueue, Message};
//! use vigil_worker::{CommandAction, Worker};
//!
//! fn main() -> vigil_core::Result<()> {
//!     let intake = LocalQueue::shared("intake");
//!     let results = LocalQueue::shared("results");
//!
//!     let mut worker = Worker::new(WorkerConfig::default());
//!     worker.start(&CommandSpawner::current_exe()?, "poller", intake.clone(), results.clone())?;
//!
//!     intake.put(Message::encode(ITEM_MESSAGE, &CommandAction::new(1, "check_ping -H localhost"))?)?;
//!
//!     worker.send_stop()?;
//!     worker.kill();
//!     Ok(())
//! }
//! ```

pub mod action;
pub mod child;
pub mod handle;
pub mod item;
pub mod run_loop;

// Re-export main types for convenience
pub use action::CommandAction;
pub use child::run_worker_child;
pub use handle::Worker;
pub use item::{ItemStatus, LaunchOutcome, WorkItem};
pub use run_loop::{ExitReason, WorkerLoop};
