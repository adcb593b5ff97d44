//! Configuration for workers and the supervisor.
//!
//! All configuration is immutable after construction: a [`WorkerConfig`] is
//! built up front (programmatically or from a TOML file) and handed to the
//! worker, which never mutates it. There is no global default instance with
//! hidden state; `WorkerConfig::default()` is an ordinary value.

use crate::{
    Result,
    connector::ConnectorConfig,
    encoder::Encoder,
    events::EventLogConfig,
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Module for serializing std::time::Duration as human-readable strings
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let secs = duration.as_secs();
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else if secs == 0 {
            serializer.serialize_str("0s")
        } else if secs % 3600 == 0 {
            serializer.serialize_str(&format!("{}h", secs / 3600))
        } else if secs % 60 == 0 {
            serializer.serialize_str(&format!("{}m", secs / 60))
        } else {
            serializer.serialize_str(&format!("{}s", secs))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(D::Error::custom)
    }

    /// Parse a duration string like "250ms", "30s", "5m", "1h", "90", etc.
    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        // Handle just numbers (assume seconds)
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        if let Some(ms) = s.strip_suffix("ms") {
            let num: u64 = ms
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", ms))?;
            return Ok(Duration::from_millis(num));
        }

        // Handle suffixed durations
        if s.len() < 2 {
            return Err(format!("Invalid duration format: {}", s));
        }

        let (num_str, suffix) = s.split_at(s.len() - 1);
        let num: u64 = num_str
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

        match suffix {
            "s" => Ok(Duration::from_secs(num)),
            "m" => Ok(Duration::from_secs(num * 60)),
            "h" => Ok(Duration::from_secs(num * 3600)),
            "d" => Ok(Duration::from_secs(num * 86400)),
            _ => Err(format!(
                "Invalid duration suffix: {}. Use ms, s, m, h, or d",
                suffix
            )),
        }
    }
}

/// Which execution engine a worker runs its tasks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorConfig {
    /// One task at a time, timed by the out-of-process watchdog.
    #[default]
    Serial,
    /// Up to `threads` tasks in flight at once, each timed by the
    /// in-process task killer.
    Threaded { threads: usize },
}

/// Escalating timeout thresholds, in seconds. A threshold of 0.0 disables
/// that stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub soft_timeout: f64,
    pub hard_timeout: f64,
    pub critical_timeout: f64,
    /// Tick interval of the watchdog loops.
    pub tick_interval: f64,
    /// Explicit path to the watchdog binary. When unset it is resolved next
    /// to the current executable, then on PATH.
    pub watchdog_program: Option<PathBuf>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            soft_timeout: 0.0,
            hard_timeout: 0.0,
            critical_timeout: 0.0,
            tick_interval: 0.1,
            watchdog_program: None,
        }
    }
}

impl TimeoutConfig {
    /// True when no stage is enabled, i.e. tasks run unwatched.
    pub fn disabled(&self) -> bool {
        self.soft_timeout <= 0.0 && self.hard_timeout <= 0.0 && self.critical_timeout <= 0.0
    }
}

/// Where worker logs go. Stdout is never an option; it is reserved for
/// the supervisor summary channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogDestination {
    #[default]
    Stderr,
    File { path: PathBuf },
}

/// Log level, destination and per-event enable flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive, e.g. "info" or "taskmill=debug".
    pub level: String,
    pub destination: LogDestination,
    pub events: EventLogConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            destination: LogDestination::Stderr,
            events: EventLogConfig::default(),
        }
    }
}

impl LoggingConfig {
    /// Install the global tracing subscriber. Calling this twice is
    /// harmless; the second call is a no-op.
    pub fn init(&self) {
        use std::sync::Arc;
        use tracing_subscriber::EnvFilter;

        let filter =
            EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt().with_env_filter(filter);

        match &self.destination {
            LogDestination::Stderr => {
                let _ = builder.with_writer(std::io::stderr).try_init();
            }
            LogDestination::File { path } => {
                match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                    Ok(file) => {
                        let _ = builder.with_writer(Arc::new(file)).try_init();
                    }
                    Err(err) => {
                        let _ = builder.with_writer(std::io::stderr).try_init();
                        tracing::warn!(
                            "could not open log file {}, logging to stderr: {}",
                            path.display(),
                            err
                        );
                    }
                }
            }
        }
    }
}

/// Immutable-after-construction worker configuration.
///
/// # Examples
///
/// ```rust
/// use taskmill::config::WorkerConfig;
/// use taskmill::connector::ConnectorConfig;
///
/// let config = WorkerConfig::new("image_resize")
///     .with_connector(ConnectorConfig::Memory)
///     .with_max_tasks_per_run(1000)
///     .with_max_retries(3)
///     .with_tasks_per_transaction(25);
///
/// assert_eq!(config.name, "image_resize");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name; doubles as the queue name it consumes.
    pub name: String,

    /// Stop after this many tasks. 0 means run forever.
    #[serde(default)]
    pub max_tasks_per_run: u64,

    /// Retry ceiling enforced by `WorkerContext::retry`. 0 means unbounded.
    #[serde(default)]
    pub max_retries: u32,

    /// How many tasks to pull per poll.
    #[serde(default = "default_tasks_per_transaction")]
    pub tasks_per_transaction: usize,

    /// Sleep between polls that returned nothing.
    #[serde(default = "default_idle_interval", with = "duration_secs")]
    pub idle_interval: Duration,

    /// Fire the starvation event after this long with no tasks.
    /// Zero disables starvation reporting.
    #[serde(default = "default_starvation_timeout", with = "duration_secs")]
    pub starvation_timeout: Duration,

    #[serde(default)]
    pub connector: ConnectorConfig,

    #[serde(default)]
    pub encoder: Encoder,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_tasks_per_transaction() -> usize {
    1
}

fn default_idle_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_starvation_timeout() -> Duration {
    Duration::ZERO
}

impl WorkerConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            connector: ConnectorConfig::default(),
            encoder: Encoder::default(),
            executor: ExecutorConfig::default(),
            timeouts: TimeoutConfig::default(),
            max_tasks_per_run: 0,
            max_retries: 0,
            tasks_per_transaction: default_tasks_per_transaction(),
            idle_interval: default_idle_interval(),
            starvation_timeout: default_starvation_timeout(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn with_connector(mut self, connector: ConnectorConfig) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_encoder(mut self, encoder: Encoder) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_max_tasks_per_run(mut self, max_tasks: u64) -> Self {
        self.max_tasks_per_run = max_tasks;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_tasks_per_transaction(mut self, batch_size: usize) -> Self {
        self.tasks_per_transaction = batch_size.max(1);
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_starvation_timeout(mut self, timeout: Duration) -> Self {
        self.starvation_timeout = timeout;
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Load a worker configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Configuration for the supervising parent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Program spawned for each worker subprocess.
    pub program: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_concurrent_workers")]
    pub concurrent_workers: usize,

    /// Workers whose RSS exceeds this many megabytes are killed and
    /// respawned. None disables memory policing.
    #[serde(default)]
    pub max_worker_memory_mb: Option<u64>,

    #[serde(default = "default_poll_interval", with = "duration_secs")]
    pub poll_interval: Duration,
}

fn default_concurrent_workers() -> usize {
    1
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

impl SupervisorConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            concurrent_workers: default_concurrent_workers(),
            max_worker_memory_mb: None,
            poll_interval: default_poll_interval(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_concurrent_workers(mut self, count: usize) -> Self {
        self.concurrent_workers = count.max(1);
        self
    }

    pub fn with_max_worker_memory_mb(mut self, megabytes: u64) -> Self {
        self.max_worker_memory_mb = Some(megabytes);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
