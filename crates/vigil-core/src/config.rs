//! Daemon configuration.
//!
//! A daemon reads one YAML document describing itself, its module
//! supervisor, its check workers and the modules it loads:
//!
//! ```yaml
//! daemon:
//!   name: broker-master
//!   kind: broker
//! supervisor:
//!   max_queue_size: 10000
//!   retry_period: 5s
//! worker:
//!   processes_by_worker: 128
//!   idle_timeout: 5m
//! modules:
//!   - name: retention
//!     implementation: echo
//!     path: /var/lib/vigil/retention.json
//! ```
//!
//! Durations accept humantime strings (`"5s"`, `"2m 30s"`) or plain seconds.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VigilError};

/// Default minimum delay between two init attempts of the same module.
pub const DEFAULT_RETRY_PERIOD_SECS: u64 = 5;

/// Default grace period between terminate and kill signals.
pub const DEFAULT_KILL_TIME_SECS: u64 = 10;

/// Default interval of the parent supervisory loop.
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 1;

/// Default bound on items a worker holds at once.
pub const DEFAULT_PROCESSES_BY_WORKER: usize = 256;

/// Default idle time after which a mortal worker may be reaped.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Default maximum length of a check output kept by a worker.
pub const DEFAULT_MAX_OUTPUT_LENGTH: usize = 8192;

/// Which role the parent daemon plays in the monitoring platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DaemonKind {
    Arbiter,
    Scheduler,
    Poller,
    Reactionner,
    #[default]
    Broker,
    Receiver,
}

impl DaemonKind {
    /// Returns true if this daemon executes checks through worker processes.
    pub fn dispatches_checks(&self) -> bool {
        matches!(self, Self::Poller | Self::Reactionner)
    }
}

impl std::fmt::Display for DaemonKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Arbiter => "arbiter",
            Self::Scheduler => "scheduler",
            Self::Poller => "poller",
            Self::Reactionner => "reactionner",
            Self::Broker => "broker",
            Self::Receiver => "receiver",
        };
        f.write_str(name)
    }
}

/// Identity of the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    /// Daemon name, used in process titles and logs
    pub name: String,
    /// Daemon role
    pub kind: DaemonKind,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            name: "vigil".to_string(),
            kind: DaemonKind::default(),
        }
    }
}

/// Module supervisor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Inbound queue depth above which a module is restarted (0 disables)
    pub max_queue_size: usize,

    /// Minimum delay between two init attempts of one module
    #[serde(with = "duration_serde")]
    pub retry_period: Duration,

    /// Grace period between terminate and kill signals
    #[serde(with = "duration_serde")]
    pub kill_time: Duration,

    /// Interval of the liveness/restart loop
    #[serde(with = "duration_serde")]
    pub check_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 0,
            retry_period: Duration::from_secs(DEFAULT_RETRY_PERIOD_SECS),
            kill_time: Duration::from_secs(DEFAULT_KILL_TIME_SECS),
            check_interval: Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
        }
    }
}

/// Check worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of workers the daemon keeps running
    pub count: usize,

    /// Maximum items held by one worker before intake pauses
    pub processes_by_worker: usize,

    /// Idle time after which a mortal worker is killable
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Whether workers may be reaped for idleness
    pub mortal: bool,

    /// Maximum check output length kept per item
    pub max_output_length: usize,

    /// Sleep used when the intake queue is empty
    #[serde(with = "duration_serde")]
    pub intake_poll: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 0,
            processes_by_worker: DEFAULT_PROCESSES_BY_WORKER,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            mortal: true,
            max_output_length: DEFAULT_MAX_OUTPUT_LENGTH,
            intake_poll: Duration::from_secs(1),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log directory (defaults to `~/.vigil/logs/`)
    pub dir: Option<PathBuf>,
    /// Debug level logging
    pub verbose: bool,
}

/// One declared module.
///
/// Fields other than the recognized ones are kept in `extra` and handed to
/// the module factory untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Unique module name within a daemon
    pub name: String,

    /// Registered implementation to resolve
    #[serde(alias = "module_type")]
    pub implementation: String,

    /// Disabled descriptors are recorded but never resolved
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Names of other modules this one refers to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<String>,

    /// Free-form module settings
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl ModuleDescriptor {
    /// Create an enabled descriptor with no extra settings.
    pub fn new(name: impl Into<String>, implementation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            implementation: implementation.into(),
            enabled: true,
            modules: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Mark the descriptor as disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Add a free-form setting.
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Look up a free-form setting.
    pub fn setting(&self, key: &str) -> Option<&serde_json::Value> {
        self.extra.get(key)
    }
}

/// Full daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub daemon: DaemonSection,
    pub supervisor: SupervisorConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
    pub modules: Vec<ModuleDescriptor>,
}

impl DaemonConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VigilError::config_not_found_with_source(path, e)
            } else {
                VigilError::io("reading configuration", path, e)
            }
        })?;

        let config: Self = serde_yaml::from_str(&text).map_err(|e| VigilError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;

        tracing::debug!(
            path = %path.display(),
            modules = config.modules.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Parse and validate a configuration from a YAML string.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).map_err(|e| VigilError::ConfigInvalid {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.daemon.name.trim().is_empty() {
            return Err(VigilError::config_validation("daemon name must not be empty"));
        }
        if self.supervisor.kill_time.is_zero() {
            return Err(VigilError::config_validation("supervisor.kill_time must be positive"));
        }
        if self.worker.processes_by_worker == 0 {
            return Err(VigilError::config_validation(
                "worker.processes_by_worker must be positive",
            ));
        }

        let mut seen = HashSet::new();
        for module in &self.modules {
            if module.name.trim().is_empty() {
                return Err(VigilError::config_validation("module name must not be empty"));
            }
            if !seen.insert(module.name.as_str()) {
                return Err(VigilError::config_validation(format!(
                    "duplicate module name '{}'",
                    module.name
                )));
            }
        }
        Ok(())
    }

    /// Replace the module list.
    pub fn with_modules(mut self, modules: Vec<ModuleDescriptor>) -> Self {
        self.modules = modules;
        self
    }

    /// Override the supervisor settings.
    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }
}

/// Serde adapter for durations written as humantime strings or seconds.
pub mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Text(text) => {
                humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom)
            }
        }
    }
}
