//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Repository (SQLite) settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// External transfer tool settings.
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Deferred-start scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Post-transfer reconciliation settings.
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Notification bus settings.
    #[serde(default)]
    pub events: EventsConfig,
}

/// Repository configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL (default: "sqlite://bucket-migrate.db").
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum pooled connections (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Create the database file when it does not exist (default: true).
    #[serde(default = "default_true")]
    pub create_if_missing: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            create_if_missing: true,
        }
    }
}

/// Transfer tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Program that provides the `mirror` and `ls` subcommands (default: "mc").
    #[serde(default = "default_program")]
    pub program: String,

    /// Hard wall-clock ceiling for one transfer, in seconds (default: 86400).
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,

    /// Grace period between SIGTERM and a forced kill, in seconds (default: 10).
    #[serde(default = "default_terminate_grace_secs")]
    pub terminate_grace_secs: u64,

    /// Age after which an in-flight job found at startup is presumed
    /// orphaned, in seconds (default: 600).
    #[serde(default = "default_staleness_window_secs")]
    pub staleness_window_secs: u64,

    /// Diagnostic lines kept for the failure message (default: 10).
    #[serde(default = "default_diagnostic_tail_lines")]
    pub diagnostic_tail_lines: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            max_duration_secs: default_max_duration_secs(),
            terminate_grace_secs: default_terminate_grace_secs(),
            staleness_window_secs: default_staleness_window_secs(),
            diagnostic_tail_lines: default_diagnostic_tail_lines(),
        }
    }
}

impl TransferConfig {
    /// Hard ceiling for a single transfer.
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    /// Grace period after the terminate signal.
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }

    /// Staleness window used by restart recovery.
    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_window_secs as i64)
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between repository polls, in seconds (default: 60).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Jobs due within this many seconds get a one-shot timer (default: 300).
    #[serde(default = "default_lookahead_secs")]
    pub lookahead_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            lookahead_secs: default_lookahead_secs(),
        }
    }
}

impl SchedulerConfig {
    /// Poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Timer lookahead window.
    pub fn lookahead(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lookahead_secs as i64)
    }
}

/// Reconciliation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Run reconciliation after every successful transfer (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listing records persisted per scratch chunk (default: 10000).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Distinct keys compared per page (default: 5000).
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_size: default_chunk_size(),
            page_size: default_page_size(),
        }
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Buffered events per subscriber before lagging (default: 256).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://bucket-migrate.db".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

fn default_program() -> String {
    "mc".to_string()
}

fn default_max_duration_secs() -> u64 {
    24 * 60 * 60
}

fn default_terminate_grace_secs() -> u64 {
    10
}

fn default_staleness_window_secs() -> u64 {
    10 * 60
}

fn default_diagnostic_tail_lines() -> usize {
    10
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_lookahead_secs() -> u64 {
    5 * 60
}

fn default_chunk_size() -> usize {
    10_000
}

fn default_page_size() -> usize {
    5_000
}

fn default_channel_capacity() -> usize {
    256
}
