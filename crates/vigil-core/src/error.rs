//! Error types for Vigil operations.
//!
//! This module defines [`VigilError`], the error enum shared by every Vigil
//! crate. Supervisor-side failures are caught per instance and turned into
//! recorded load errors, so most variants end up as strings in a
//! supervisor's error list rather than as propagated failures.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`VigilError`].
pub type Result<T> = std::result::Result<T, VigilError>;

/// Error type for all Vigil operations.
#[derive(Debug, Error)]
pub enum VigilError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration file not found
    #[error("Configuration not found at {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration file is invalid YAML
    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    /// Configuration validation failed
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error with context
    #[error("I/O error {operation}: {path}")]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory creation failed
    #[error("Failed to create directory: {path}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON encoding or decoding error
    #[error("JSON error in {context}: {message}")]
    Json {
        context: String,
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // =========================================================================
    // Queue Errors
    // =========================================================================
    /// The queue factory could not allocate a queue pair
    #[error("Failed to allocate queues for {owner}: {message}")]
    QueueAllocation { owner: String, message: String },

    /// The queue endpoint was torn down
    #[error("Queue {queue} is closed")]
    QueueClosed { queue: String },

    // =========================================================================
    // Process Errors
    // =========================================================================
    /// Spawning a child process failed
    #[error("Failed to spawn process for {name}: {message}")]
    ProcessSpawn { name: String, message: String },

    /// Delivering a signal to a child process failed
    #[error("Failed to send {signal} to pid {pid}: {message}")]
    ProcessSignal {
        pid: u32,
        signal: String,
        message: String,
    },

    /// Installing signal handlers in a child process failed
    #[error("Failed to install signal handlers: {message}")]
    SignalSetup { message: String },

    // =========================================================================
    // Module Errors
    // =========================================================================
    /// The named module implementation is not registered
    #[error("Module {module}: implementation '{implementation}' not found")]
    ModuleResolution {
        module: String,
        implementation: String,
    },

    /// The implementation lacks a mandatory capability
    #[error("Module {module}: implementation '{implementation}' {message}")]
    ModuleCapability {
        module: String,
        implementation: String,
        message: String,
    },

    /// The instance factory failed
    #[error("Module {module}: instance creation failed: {message}")]
    ModuleInstantiation { module: String, message: String },

    /// The module init hook failed
    #[error("Module {module}: initialization raised: {message}")]
    ModuleInit { module: String, message: String },

    /// A module lookup by name failed
    #[error("Module not found: {module}")]
    ModuleNotFound { module: String },

    // =========================================================================
    // Worker Errors
    // =========================================================================
    /// Worker not running
    #[error("Worker {worker_id} is not running")]
    WorkerNotRunning { worker_id: u64 },

    /// A work item could not be decoded or encoded
    #[error("Worker {worker_id}: invalid work item: {message}")]
    WorkItemInvalid { worker_id: u64, message: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (bug in Vigil)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl VigilError {
    // =========================================================================
    // Constructor helpers for common error patterns
    // =========================================================================

    /// Create a ConfigNotFound error with source
    pub fn config_not_found_with_source(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ConfigNotFound {
            path: path.into(),
            source: Some(source),
        }
    }

    /// Create a ConfigValidation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    /// Create a JSON error
    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a QueueClosed error
    pub fn queue_closed(queue: impl Into<String>) -> Self {
        Self::QueueClosed {
            queue: queue.into(),
        }
    }

    /// Create a QueueAllocation error
    pub fn queue_allocation(owner: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueAllocation {
            owner: owner.into(),
            message: message.into(),
        }
    }

    /// Create a ProcessSpawn error
    pub fn process_spawn(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProcessSpawn {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    // =========================================================================
    // Error classification helpers
    // =========================================================================

    /// Returns true if the failing operation may succeed on a later attempt
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::QueueAllocation { .. }
                | Self::ProcessSpawn { .. }
                | Self::ModuleInit { .. }
        )
    }

    /// Returns true if a queue endpoint was torn down.
    ///
    /// A closed queue during shutdown is a normal race, not a fault.
    pub fn is_queue_closed(&self) -> bool {
        matches!(self, Self::QueueClosed { .. })
    }

    /// Returns true if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound { .. } | Self::ConfigInvalid { .. } | Self::ConfigValidation { .. }
        )
    }

    /// Returns true if this is a module loading error
    pub fn is_module_error(&self) -> bool {
        matches!(
            self,
            Self::ModuleResolution { .. }
                | Self::ModuleCapability { .. }
                | Self::ModuleInstantiation { .. }
                | Self::ModuleInit { .. }
                | Self::ModuleNotFound { .. }
        )
    }

    /// Returns actionable guidance for the operator
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            Self::ConfigNotFound { .. } => Some("Pass the daemon configuration with --config"),
            Self::ConfigInvalid { .. } => Some("Check the YAML syntax of the daemon configuration"),
            Self::ModuleResolution { .. } => {
                Some("Check the module 'implementation' field against the registered modules")
            }
            Self::ModuleCapability { .. } => {
                Some("The module implementation must declare properties and an instance factory")
            }
            Self::QueueAllocation { .. } => Some("The module will be retried on the next check"),
            _ => None,
        }
    }
}
