//! Repository traits for migration state and reconciliation scratch data.
//!
//! The [`StateBackend`] trait defines the interface for persisting migrations,
//! their log lines and reconciliation reports. [`InventoryStore`] holds the
//! scratch relation used while two endpoint listings are compared.
//!
//! # Design Pattern
//!
//! Components work with `Arc<dyn StateBackend>` without knowing the concrete
//! type. The only implementation shipped is `SqliteStateBackend` in `db.rs`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{EndpointStats, LogEntry, LogLevel, Migration, MigrationStatus};
use crate::error::Result;
use crate::reconcile::types::{InventoryJoinRow, ObjectRecord, ReconciliationReport, Side};

/// Mutation applied by [`StateBackend::update`].
///
/// May be invoked more than once when a concurrent writer wins the race, so it
/// must be a pure function of the record it is handed.
pub type Mutation<'a> = &'a (dyn Fn(&mut Migration) + Send + Sync);

/// Trait for migration persistence backends.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` to allow sharing across async tasks.
///
/// # Example
///
/// ```rust,ignore
/// let backend: Arc<dyn StateBackend> = Arc::new(SqliteStateBackend::connect(&config).await?);
/// backend.init_schema().await?;
/// backend.insert(&migration).await?;
/// let promoted = backend
///     .update(&id, &[MigrationStatus::Scheduled], &|m| m.status = MigrationStatus::Starting)
///     .await?;
/// ```
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Create tables and indexes. Idempotent.
    async fn init_schema(&self) -> Result<()>;

    /// Persist a new migration.
    ///
    /// Fails with `DuplicateActive` when a non-terminal migration already
    /// exists for the same source/destination pair.
    async fn insert(&self, migration: &Migration) -> Result<()>;

    /// Load one migration.
    async fn get(&self, id: &str) -> Result<Option<Migration>>;

    /// List migrations, newest first, optionally filtered by status.
    async fn list(&self, status: Option<MigrationStatus>) -> Result<Vec<Migration>>;

    /// Scheduled migrations due at or before `until`, earliest first.
    async fn list_scheduled(&self, until: Option<DateTime<Utc>>) -> Result<Vec<Migration>>;

    /// In-flight migrations (`starting`, `running`, `reconciling`) whose start
    /// time is older than `cutoff`.
    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Migration>>;

    /// Number of migrations in a status.
    async fn count(&self, status: MigrationStatus) -> Result<u64>;

    /// Atomic read-modify-write keyed by id.
    ///
    /// Applies `mutate` only if the stored status is one of `allowed` and
    /// returns the record as persisted. Returns `Ok(None)` when the status is
    /// not allowed and `NotFound` when the id is unknown.
    async fn update(
        &self,
        id: &str,
        allowed: &[MigrationStatus],
        mutate: Mutation<'_>,
    ) -> Result<Option<Migration>>;

    /// Append a leveled log line for a migration.
    async fn append_log(&self, id: &str, level: LogLevel, message: &str) -> Result<()>;

    /// Log lines of a migration in insertion order, at most `limit` of the latest.
    async fn list_logs(&self, id: &str, limit: usize) -> Result<Vec<LogEntry>>;

    /// Store (or replace) the reconciliation report of a migration.
    async fn save_report(&self, report: &ReconciliationReport) -> Result<()>;

    /// Load the reconciliation report of a migration.
    async fn load_report(&self, id: &str) -> Result<Option<ReconciliationReport>>;

    /// Backend type name for logging.
    fn backend_type(&self) -> &'static str;
}

/// Scratch relation for reconciliation inventories.
///
/// Rows are keyed by `(migration, side, object key)`. The two sides of one
/// migration never write to each other's key range.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Persist one chunk of listing records for a side.
    async fn insert_chunk(
        &self,
        migration_id: &str,
        side: Side,
        chunk_seq: u64,
        records: &[ObjectRecord],
    ) -> Result<()>;

    /// Next page of distinct object keys across both sides, ordered by key,
    /// strictly after `after`.
    async fn next_key_page(
        &self,
        migration_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// Outer join of both sides over the inclusive key range `[first, last]`,
    /// ordered by key.
    async fn join_range(
        &self,
        migration_id: &str,
        first: &str,
        last: &str,
    ) -> Result<Vec<InventoryJoinRow>>;

    /// Object count and total size of the rows stored for one side.
    ///
    /// A key listed twice is stored once, so this is the authoritative
    /// inventory size rather than the number of records streamed.
    async fn side_stats(&self, migration_id: &str, side: Side) -> Result<EndpointStats>;

    /// Drop all scratch rows of a migration. Returns the number removed.
    async fn clear_inventory(&self, migration_id: &str) -> Result<u64>;
}
