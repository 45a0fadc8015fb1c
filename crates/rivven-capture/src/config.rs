//! Configuration for the capture core
//!
//! Loaded from YAML with `${VAR}` / `${VAR:-default}` environment expansion:
//!
//! ```yaml
//! server_name: inventory-server
//! database: inventory
//! snapshot_mode: initial
//! tables: [inventory.customers, inventory.orders]
//! signal_data_collection: inventory.debezium_signal
//! queue:
//!   max_queue_size: 8192
//!   max_batch_size: 2048
//!   poll_interval_ms: 500
//! engine:
//!   record_processing_threads: ${CAPTURE_THREADS:-4}
//!   record_processing_sequentially: false
//! ```

use crate::error::{CaptureError, Result};
use crate::event::TableId;
use crate::snapshot::SnapshotMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    /// Logical server name; identifies the partition
    pub server_name: String,

    /// Database being captured
    #[serde(default)]
    pub database: String,

    /// When to run the initial snapshot
    #[serde(default)]
    pub snapshot_mode: SnapshotMode,

    /// Tables included in snapshots (`db.table`)
    #[serde(default)]
    pub tables: Vec<String>,

    /// Event queue sizing
    #[serde(default)]
    pub queue: QueueConfig,

    /// Signal collection (`db.table`); absent disables signal-based
    /// incremental snapshots
    #[serde(default)]
    pub signal_data_collection: Option<String>,

    /// Connection is read-only (watermarks cannot be written)
    #[serde(default)]
    pub read_only: bool,

    /// Incremental snapshot settings
    #[serde(default)]
    pub incremental: IncrementalConfig,

    /// Async delivery engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Event queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum wait for space in a full queue; blocks forever when unset
    #[serde(default)]
    pub enqueue_timeout_ms: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_batch_size: default_max_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            enqueue_timeout_ms: None,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn enqueue_timeout(&self) -> Option<Duration> {
        self.enqueue_timeout_ms.map(Duration::from_millis)
    }
}

fn default_max_queue_size() -> usize {
    8192
}
fn default_max_batch_size() -> usize {
    2048
}
fn default_poll_interval_ms() -> u64 {
    500
}

/// Incremental snapshot configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IncrementalConfig {
    /// Rows read per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Tables snapshotted incrementally as soon as streaming starts
    #[serde(default)]
    pub auto_start_tables: Vec<String>,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            auto_start_tables: Vec::new(),
        }
    }
}

fn default_chunk_size() -> usize {
    1024
}

/// Delivery engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Maximum wait for phase start/stop
    #[serde(default = "default_task_management_timeout_ms")]
    pub task_management_timeout_ms: u64,

    /// Transform workers when processing in parallel
    #[serde(default = "default_record_processing_threads")]
    pub record_processing_threads: usize,

    /// Grace period for in-flight records on shutdown
    #[serde(default = "default_record_processing_shutdown_timeout_ms")]
    pub record_processing_shutdown_timeout_ms: u64,

    /// Deliver strictly in queue order on one logical thread
    #[serde(default = "default_true")]
    pub record_processing_sequentially: bool,

    /// Drive a per-record consumer serially in queue order, even when
    /// transforms run in parallel
    #[serde(default)]
    pub record_processing_with_serial_consumer: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_management_timeout_ms: default_task_management_timeout_ms(),
            record_processing_threads: default_record_processing_threads(),
            record_processing_shutdown_timeout_ms: default_record_processing_shutdown_timeout_ms(),
            record_processing_sequentially: true,
            record_processing_with_serial_consumer: false,
        }
    }
}

impl EngineConfig {
    /// Parallel, unordered processing with `threads` transform workers.
    pub fn parallel(threads: usize) -> Self {
        Self {
            record_processing_threads: threads,
            record_processing_sequentially: false,
            ..Default::default()
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.record_processing_shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_task_management_timeout(mut self, timeout: Duration) -> Self {
        self.task_management_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_serial_consumer(mut self, serial: bool) -> Self {
        self.record_processing_with_serial_consumer = serial;
        self
    }

    pub fn task_management_timeout(&self) -> Duration {
        Duration::from_millis(self.task_management_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.record_processing_shutdown_timeout_ms)
    }
}

fn default_task_management_timeout_ms() -> u64 {
    5000
}
fn default_record_processing_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
fn default_record_processing_shutdown_timeout_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}

impl CaptureConfig {
    pub fn new(server_name: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            database: database.into(),
            snapshot_mode: SnapshotMode::default(),
            tables: Vec::new(),
            queue: QueueConfig::default(),
            signal_data_collection: None,
            read_only: false,
            incremental: IncrementalConfig::default(),
            engine: EngineConfig::default(),
        }
    }

    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_snapshot_mode(mut self, mode: SnapshotMode) -> Self {
        self.snapshot_mode = mode;
        self
    }

    pub fn with_signal_data_collection(mut self, collection: impl Into<String>) -> Self {
        self.signal_data_collection = Some(collection.into());
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_incremental(mut self, incremental: IncrementalConfig) -> Self {
        self.incremental = incremental;
        self
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CaptureError::config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server_name.trim().is_empty() {
            return Err(CaptureError::config("server_name must not be empty"));
        }

        let positive = [
            ("queue.max_queue_size", self.queue.max_queue_size as u64),
            ("queue.max_batch_size", self.queue.max_batch_size as u64),
            ("queue.poll_interval_ms", self.queue.poll_interval_ms),
            ("incremental.chunk_size", self.incremental.chunk_size as u64),
            (
                "engine.task_management_timeout_ms",
                self.engine.task_management_timeout_ms,
            ),
            (
                "engine.record_processing_threads",
                self.engine.record_processing_threads as u64,
            ),
            (
                "engine.record_processing_shutdown_timeout_ms",
                self.engine.record_processing_shutdown_timeout_ms,
            ),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(CaptureError::config(format!("{} must be positive", name)));
            }
        }
        if self.queue.enqueue_timeout_ms == Some(0) {
            return Err(CaptureError::config(
                "queue.enqueue_timeout_ms must be positive",
            ));
        }

        self.table_ids()?;
        self.auto_start_tables()?;
        self.signal_collection()?;
        Ok(())
    }

    /// Snapshot include list
    pub fn table_ids(&self) -> Result<Vec<TableId>> {
        parse_tables("tables", &self.tables)
    }

    /// Tables snapshotted incrementally once streaming starts
    pub fn auto_start_tables(&self) -> Result<Vec<TableId>> {
        parse_tables("incremental.auto_start_tables", &self.incremental.auto_start_tables)
    }

    /// Signal collection, if configured and non-empty
    pub fn signal_collection(&self) -> Result<Option<TableId>> {
        match self.signal_data_collection.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => TableId::parse(s).map(Some).ok_or_else(|| {
                CaptureError::config(format!(
                    "signal_data_collection '{}' must be of the form db.table",
                    s
                ))
            }),
        }
    }
}

fn parse_tables(field: &str, tables: &[String]) -> Result<Vec<TableId>> {
    tables
        .iter()
        .map(|t| {
            TableId::parse(t).ok_or_else(|| {
                CaptureError::config(format!("{}: '{}' must be of the form db.table", field, t))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("RIVVEN_CAPTURE_TEST_SERVER", "server-a");
        let expanded = CaptureConfig::expand_env_vars("server_name: ${RIVVEN_CAPTURE_TEST_SERVER}");
        assert_eq!(expanded, "server_name: server-a");
    }

    #[test]
    fn test_env_var_with_default() {
        std::env::remove_var("RIVVEN_CAPTURE_MISSING_VAR");
        let expanded = CaptureConfig::expand_env_vars("value: ${RIVVEN_CAPTURE_MISSING_VAR:-7}");
        assert_eq!(expanded, "value: 7");
    }

    #[test]
    fn test_defaults() {
        let config = CaptureConfig::from_yaml_str("server_name: s1").unwrap();
        assert_eq!(config.snapshot_mode, SnapshotMode::Initial);
        assert_eq!(config.queue.max_queue_size, 8192);
        assert_eq!(config.queue.max_batch_size, 2048);
        assert_eq!(config.queue.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.incremental.chunk_size, 1024);
        assert_eq!(config.engine.task_management_timeout_ms, 5000);
        assert_eq!(config.engine.record_processing_shutdown_timeout_ms, 1000);
        assert!(config.engine.record_processing_sequentially);
        assert!(!config.engine.record_processing_with_serial_consumer);
        assert!(config.engine.record_processing_threads >= 1);
        assert_eq!(config.signal_collection().unwrap(), None);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server_name: inventory-server
database: inventory
snapshot_mode: when_needed
tables: [inventory.customers, inventory.orders]
signal_data_collection: inventory.signals
read_only: false
queue:
  max_queue_size: 100
  enqueue_timeout_ms: 250
incremental:
  chunk_size: 10
  auto_start_tables: [inventory.orders]
engine:
  record_processing_threads: 4
  record_processing_sequentially: false
"#;
        let config = CaptureConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.snapshot_mode, SnapshotMode::WhenNeeded);
        assert_eq!(config.table_ids().unwrap().len(), 2);
        assert_eq!(
            config.signal_collection().unwrap(),
            Some(TableId::new("inventory", "signals"))
        );
        assert_eq!(config.queue.enqueue_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.queue.max_batch_size, 2048);
        assert_eq!(config.engine.record_processing_threads, 4);
        assert!(!config.engine.record_processing_sequentially);
    }

    #[test]
    fn test_validation_rejects_non_positive_values() {
        let err = CaptureConfig::from_yaml_str(
            "server_name: s1\nengine:\n  record_processing_threads: 0\n",
        )
        .unwrap_err();
        assert!(matches!(err, CaptureError::Config(_)));
        assert!(err.to_string().contains("record_processing_threads"));

        let err = CaptureConfig::from_yaml_str(
            "server_name: s1\nengine:\n  task_management_timeout_ms: 0\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("task_management_timeout_ms"));
    }

    #[test]
    fn test_validation_rejects_bad_tables() {
        let config = CaptureConfig::new("s1", "db").with_tables(["customers"]);
        assert!(config.validate().is_err());

        let config = CaptureConfig::new("", "db");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_signal_collection_is_disabled() {
        let config = CaptureConfig::new("s1", "db").with_signal_data_collection("  ");
        assert_eq!(config.signal_collection().unwrap(), None);
    }
}
