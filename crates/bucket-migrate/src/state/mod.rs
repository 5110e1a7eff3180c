//! Migration records and their persistence.
//!
//! A [`Migration`] is the durable record of one transfer intent. The
//! repository ([`backend::StateBackend`], implemented by
//! [`db::SqliteStateBackend`]) is the single source of truth: components never
//! keep authoritative copies in memory and every mutation is a conditional
//! update keyed by migration id.

pub mod backend;
pub mod db;

pub use backend::{InventoryStore, StateBackend};
pub use db::SqliteStateBackend;

use crate::error::{MigrateError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current time at the millisecond precision the repository stores.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Lifecycle status of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Scheduled,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
    Reconciling,
    Verified,
    CompletedWithDifferences,
}

impl MigrationStatus {
    /// Statuses that count toward the one-active-migration-per-pair rule.
    pub const ACTIVE: [MigrationStatus; 4] = [
        MigrationStatus::Scheduled,
        MigrationStatus::Starting,
        MigrationStatus::Running,
        MigrationStatus::Reconciling,
    ];

    /// Statuses in which an external process or reconciliation may be in flight.
    pub const IN_FLIGHT: [MigrationStatus; 3] = [
        MigrationStatus::Starting,
        MigrationStatus::Running,
        MigrationStatus::Reconciling,
    ];

    /// Statuses that accept a cancellation request.
    pub const CANCELLABLE: [MigrationStatus; 3] = [
        MigrationStatus::Scheduled,
        MigrationStatus::Starting,
        MigrationStatus::Running,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Scheduled => "scheduled",
            MigrationStatus::Starting => "starting",
            MigrationStatus::Running => "running",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Cancelled => "cancelled",
            MigrationStatus::Reconciling => "reconciling",
            MigrationStatus::Verified => "verified",
            MigrationStatus::CompletedWithDifferences => "completed_with_differences",
        }
    }

    /// Whether the status is non-terminal for the uniqueness invariant.
    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Failed
                | MigrationStatus::Cancelled
                | MigrationStatus::Verified
                | MigrationStatus::CompletedWithDifferences
        )
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(MigrationStatus::Scheduled),
            "starting" => Ok(MigrationStatus::Starting),
            "running" => Ok(MigrationStatus::Running),
            "completed" => Ok(MigrationStatus::Completed),
            "failed" => Ok(MigrationStatus::Failed),
            "cancelled" => Ok(MigrationStatus::Cancelled),
            "reconciling" => Ok(MigrationStatus::Reconciling),
            "verified" => Ok(MigrationStatus::Verified),
            "completed_with_differences" => Ok(MigrationStatus::CompletedWithDifferences),
            _ => Err(MigrateError::Corrupt(format!("Invalid migration status: {}", s))),
        }
    }
}

/// Scheduler hand-off marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Waiting for its scheduled time.
    Queued,
    /// Handed to the transfer supervisor.
    Executing,
    /// Transfer phase is over.
    Finished,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Executing => "executing",
            ExecutionStatus::Finished => "finished",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(ExecutionStatus::Queued),
            "executing" => Ok(ExecutionStatus::Executing),
            "finished" => Ok(ExecutionStatus::Finished),
            _ => Err(MigrateError::Corrupt(format!("Invalid execution status: {}", s))),
        }
    }
}

/// Object-storage address: an alias plus a bucket path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Configured alias of the storage service.
    pub alias: String,
    /// Bucket, optionally followed by a prefix.
    pub bucket_path: String,
}

impl Endpoint {
    pub fn new(alias: impl Into<String>, bucket_path: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            bucket_path: bucket_path.into(),
        }
    }

    /// Parse `alias/bucket[/prefix]`.
    ///
    /// Parsing never fails; missing components show up as empty strings and
    /// are rejected by [`Endpoint::validate`].
    pub fn parse(address: &str) -> Self {
        let address = address.trim();
        match address.split_once('/') {
            Some((alias, rest)) => Self::new(alias, rest.trim_matches('/')),
            None => Self::new(address, ""),
        }
    }

    /// Bucket name (first path component).
    pub fn bucket(&self) -> &str {
        self.bucket_path.split('/').next().unwrap_or_default()
    }

    /// Check that both components are present.
    pub fn validate(&self, role: &str) -> Result<()> {
        if self.alias.trim().is_empty() {
            return Err(MigrateError::InvalidConfig(format!(
                "{} endpoint is missing an alias",
                role
            )));
        }
        if self.bucket().trim().is_empty() {
            return Err(MigrateError::InvalidConfig(format!(
                "{} endpoint is missing a bucket",
                role
            )));
        }
        if self.alias.chars().any(char::is_whitespace) {
            return Err(MigrateError::InvalidConfig(format!(
                "{} endpoint alias '{}' contains whitespace",
                role, self.alias
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.alias, self.bucket_path)
    }
}

/// Source and destination of a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub source: Endpoint,
    pub destination: Endpoint,
}

/// Flags passed through to the transfer tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    /// Overwrite objects that already exist at the destination.
    pub overwrite: bool,
    /// Delete destination objects that do not exist at the source.
    pub remove: bool,
    /// Exclude patterns.
    pub exclude: Vec<String>,
    /// Checksum algorithm name, e.g. "CRC32C".
    pub checksum: Option<String>,
    /// Preserve metadata and attributes.
    pub preserve: bool,
    /// Let the tool retry failed objects.
    pub retry: bool,
    /// Report what would be copied without copying.
    pub dry_run: bool,
    /// Keep watching the source for changes.
    pub watch: bool,
}

/// Transfer statistics refined from tool output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationStats {
    pub total_objects: u64,
    pub transferred_objects: u64,
    pub total_size: u64,
    pub transferred_size: u64,
    /// Most recently observed transfer rate in bytes per second.
    pub speed: f64,
}

impl MigrationStats {
    /// Fold a newer observation in; counters never go backwards.
    pub fn refine(&mut self, newer: &MigrationStats) {
        self.total_objects = self.total_objects.max(newer.total_objects);
        self.transferred_objects = self.transferred_objects.max(newer.transferred_objects);
        self.total_size = self.total_size.max(newer.total_size);
        self.transferred_size = self.transferred_size.max(newer.transferred_size);
        if newer.speed > 0.0 {
            self.speed = newer.speed;
        }
    }
}

/// Status of the reconciliation sub-record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Running,
    Completed,
    Failed,
}

/// Object count and byte total of one side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStats {
    pub object_count: u64,
    pub total_size: u64,
}

/// Category of a reconciliation difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferenceKind {
    MissingInDestination,
    MissingInSource,
    SizeMismatch,
    ContentMismatch,
}

impl DifferenceKind {
    pub const ALL: [DifferenceKind; 4] = [
        DifferenceKind::MissingInDestination,
        DifferenceKind::MissingInSource,
        DifferenceKind::SizeMismatch,
        DifferenceKind::ContentMismatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DifferenceKind::MissingInDestination => "missing_in_destination",
            DifferenceKind::MissingInSource => "missing_in_source",
            DifferenceKind::SizeMismatch => "size_mismatch",
            DifferenceKind::ContentMismatch => "content_mismatch",
        }
    }
}

impl fmt::Display for DifferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One object that differs between the two sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Difference {
    pub path: String,
    pub kind: DifferenceKind,
    pub source_size: Option<u64>,
    pub dest_size: Option<u64>,
}

/// Headline outcome of a reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationSummary {
    pub object_count_match: bool,
    pub total_size_match: bool,
    pub differences_found: bool,
}

/// Reconciliation sub-record of a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconciliation {
    pub status: ReconciliationStatus,
    pub source_stats: EndpointStats,
    pub dest_stats: EndpointStats,
    pub differences: Vec<Difference>,
    pub summary: ReconciliationSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Reconciliation {
    /// A freshly started reconciliation.
    pub fn running(started_at: DateTime<Utc>) -> Self {
        Self {
            status: ReconciliationStatus::Running,
            source_stats: EndpointStats::default(),
            dest_stats: EndpointStats::default(),
            differences: Vec::new(),
            summary: ReconciliationSummary::default(),
            error: None,
            started_at,
            completed_at: None,
        }
    }
}

/// Durable record of one transfer intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Migration {
    pub id: String,
    pub endpoints: Endpoints,
    pub options: TransferOptions,
    pub status: MigrationStatus,
    pub execution_status: ExecutionStatus,
    pub progress: u8,
    pub stats: MigrationStats,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub errors: Vec<String>,
    pub reconciliation: Option<Reconciliation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Migration {
    /// Build a new record.
    ///
    /// A `scheduled_time` in the future yields `scheduled`; anything else
    /// yields `starting` with `start_time` stamped.
    pub fn new(
        endpoints: Endpoints,
        options: TransferOptions,
        scheduled_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let scheduled_time = scheduled_time.filter(|t| *t > now);
        let (status, execution_status, start_time) = match scheduled_time {
            Some(_) => (MigrationStatus::Scheduled, ExecutionStatus::Queued, None),
            None => (MigrationStatus::Starting, ExecutionStatus::Executing, Some(now)),
        };

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            endpoints,
            options,
            status,
            execution_status,
            progress: 0,
            stats: MigrationStats::default(),
            scheduled_time,
            start_time,
            end_time: None,
            duration_ms: None,
            errors: Vec::new(),
            reconciliation: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn source(&self) -> &Endpoint {
        &self.endpoints.source
    }

    pub fn destination(&self) -> &Endpoint {
        &self.endpoints.destination
    }
}

/// Severity of a persisted per-migration log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(MigrateError::Corrupt(format!("Invalid log level: {}", s))),
        }
    }
}

/// Persisted log line of a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub migration_id: String,
    pub logged_at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}
