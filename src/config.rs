//! Relay configuration, loaded from YAML.
//!
//! ```yaml
//! storage:
//!   dir: /var/lib/cdc-relay
//!   memory_mode: false
//! task:
//!   max_wait_ms: 100
//!   max_batch_size: 10000
//!   start_position: { file: mysql-bin.000042, offset: 4 }
//!   rules:
//!     - { schema: shop, table: orders, call: orders_sink, arguments: [--topic, orders] }
//! ```

use crate::checkpoint::{CheckpointOptions, StorageMode};
use crate::error::{RelayError, Result};
use crate::processor::ProcessorRegistry;
use crate::rules::{Rule, RuleSet};
use crate::types::Position;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Storage and persistence settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Holds the event journal, the checkpoint record and the lock file.
    pub dir: PathBuf,

    /// Keep the event log in memory only. Pending events are lost on
    /// restart and replication resumes from the consumption position.
    pub memory_mode: bool,

    pub checkpoint_flush_interval_ms: u64,

    /// Journal compaction cadence.
    pub compaction_interval_ms: u64,

    /// Journal writes between fsyncs.
    pub journal_sync_interval: u64,

    /// Write the checkpoint once more when the relay closes.
    pub flush_on_close: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./relay-data"),
            memory_mode: false,
            checkpoint_flush_interval_ms: 30_000,
            compaction_interval_ms: 60_000,
            journal_sync_interval: 100,
            flush_on_close: false,
        }
    }
}

impl StorageConfig {
    pub fn mode(&self) -> StorageMode {
        if self.memory_mode {
            StorageMode::Memory
        } else {
            StorageMode::File
        }
    }

    pub fn compaction_interval(&self) -> Duration {
        Duration::from_millis(self.compaction_interval_ms)
    }

    pub fn checkpoint_options(&self) -> CheckpointOptions {
        CheckpointOptions {
            mode: self.mode(),
            flush_interval: Duration::from_millis(self.checkpoint_flush_interval_ms),
            flush_on_close: self.flush_on_close,
        }
    }
}

/// Batching and routing settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Longest a non-empty backlog waits before a cycle runs.
    pub max_wait_ms: u64,

    /// Events examined per cycle; also the count that fires the trigger early.
    pub max_batch_size: u64,

    /// Pause before reconnecting a failed replication stream.
    pub retry_backoff_ms: u64,

    /// Used only when it is ahead of the recorded position.
    pub start_position: Option<Position>,

    pub rules: Vec<Rule>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: 100,
            max_batch_size: 10_000,
            retry_backoff_ms: 5_000,
            start_position: None,
            rules: Vec::new(),
        }
    }
}

impl TaskConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn rule_set(&self) -> RuleSet {
        RuleSet::new(self.rules.clone())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub storage: StorageConfig,
    pub task: TaskConfig,
}

impl RelayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Check the settings against the processors that will serve them.
    pub fn validate(&self, processors: &ProcessorRegistry) -> Result<()> {
        if self.task.rules.is_empty() {
            return Err(RelayError::Config("at least one rule is required".into()));
        }
        if self.task.max_batch_size == 0 {
            return Err(RelayError::Config("task.max_batch_size must be positive".into()));
        }
        if self.task.max_wait_ms == 0 {
            return Err(RelayError::Config("task.max_wait_ms must be positive".into()));
        }
        if self.storage.checkpoint_flush_interval_ms == 0 || self.storage.compaction_interval_ms == 0 {
            return Err(RelayError::Config("storage intervals must be positive".into()));
        }

        for rule in &self.task.rules {
            if rule.schema.is_empty() || rule.table.is_empty() {
                return Err(RelayError::Config(format!("rule for `{}` has an empty schema or table", rule.call)));
            }
            if !processors.contains(&rule.call) {
                return Err(RelayError::UnknownCall(rule.call.clone()));
            }
        }
        Ok(())
    }
}
