//! SQLite-backed repository for migrations.
//!
//! Stores migrations, their log lines, reconciliation reports and the
//! reconciliation scratch relation in one SQLite database:
//! - Conditional, versioned updates give atomic read-modify-write per id
//! - A partial unique index enforces one active migration per endpoint pair
//! - Timestamps are stored as unix milliseconds

use crate::config::DatabaseConfig;
use crate::error::{MigrateError, Result};
use crate::reconcile::types::{
    InventoryEntry, InventoryJoinRow, ObjectRecord, ReconciliationReport, Side,
};
use crate::state::backend::{InventoryStore, Mutation, StateBackend};
use crate::state::{
    now, Endpoint, EndpointStats, Endpoints, LogEntry, LogLevel, Migration, MigrationStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Rows per INSERT statement when persisting an inventory chunk.
/// Keeps bind parameters well under SQLite's variable limit.
const INSERT_BATCH_ROWS: usize = 500;

const MIGRATION_COLUMNS: &str = "id, source_alias, source_path, dest_alias, dest_path, options, \
     status, execution_status, progress, stats, errors, reconciliation, scheduled_time, \
     start_time, end_time, duration_ms, created_at, updated_at, version";

/// SQLite state backend.
#[derive(Clone)]
pub struct SqliteStateBackend {
    pool: SqlitePool,
}

impl SqliteStateBackend {
    /// Wrap an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the database described by the configuration and create the schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(config.create_if_missing)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let backend = Self::new(pool);
        backend.init_schema().await?;
        info!("Opened migration repository at {}", config.url);
        Ok(backend)
    }

    /// Private in-memory database with the schema created.
    ///
    /// Pinned to a single connection that never expires, since every SQLite
    /// connection to `:memory:` is a separate database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let backend = Self::new(pool);
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_row(&self, id: &str) -> Result<Option<MigrationRow>> {
        let row = sqlx::query_as::<_, MigrationRow>(&format!(
            "SELECT {} FROM migrations WHERE id = ?",
            MIGRATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

/// Translate a unique-index rejection into the domain error.
fn map_write_error(err: sqlx::Error, migration: &Migration) -> MigrateError {
    let err = MigrateError::from(err);
    if err.is_unique_violation() {
        MigrateError::DuplicateActive {
            from: migration.source().to_string(),
            to: migration.destination().to_string(),
        }
    } else {
        err
    }
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| MigrateError::Corrupt(format!("Invalid timestamp: {}", ms)))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

/// Flat row representation of a migration.
#[derive(Debug, Clone, sqlx::FromRow)]
struct MigrationRow {
    id: String,
    source_alias: String,
    source_path: String,
    dest_alias: String,
    dest_path: String,
    options: String,
    status: String,
    execution_status: String,
    progress: i64,
    stats: String,
    errors: String,
    reconciliation: Option<String>,
    scheduled_time: Option<i64>,
    start_time: Option<i64>,
    end_time: Option<i64>,
    duration_ms: Option<i64>,
    created_at: i64,
    updated_at: i64,
    version: i64,
}

impl MigrationRow {
    fn from_migration(m: &Migration, version: i64) -> Result<Self> {
        Ok(Self {
            id: m.id.clone(),
            source_alias: m.endpoints.source.alias.clone(),
            source_path: m.endpoints.source.bucket_path.clone(),
            dest_alias: m.endpoints.destination.alias.clone(),
            dest_path: m.endpoints.destination.bucket_path.clone(),
            options: serde_json::to_string(&m.options)?,
            status: m.status.as_str().to_string(),
            execution_status: m.execution_status.as_str().to_string(),
            progress: i64::from(m.progress),
            stats: serde_json::to_string(&m.stats)?,
            errors: serde_json::to_string(&m.errors)?,
            reconciliation: m
                .reconciliation
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            scheduled_time: m.scheduled_time.map(to_millis),
            start_time: m.start_time.map(to_millis),
            end_time: m.end_time.map(to_millis),
            duration_ms: m.duration_ms,
            created_at: to_millis(m.created_at),
            updated_at: to_millis(m.updated_at),
            version,
        })
    }
}

impl TryFrom<MigrationRow> for Migration {
    type Error = MigrateError;

    fn try_from(row: MigrationRow) -> Result<Self> {
        Ok(Migration {
            id: row.id,
            endpoints: Endpoints {
                source: Endpoint::new(row.source_alias, row.source_path),
                destination: Endpoint::new(row.dest_alias, row.dest_path),
            },
            options: serde_json::from_str(&row.options)?,
            status: row.status.parse()?,
            execution_status: row.execution_status.parse()?,
            progress: row.progress.clamp(0, 100) as u8,
            stats: serde_json::from_str(&row.stats)?,
            errors: serde_json::from_str(&row.errors)?,
            reconciliation: row
                .reconciliation
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            scheduled_time: opt_from_millis(row.scheduled_time)?,
            start_time: opt_from_millis(row.start_time)?,
            end_time: opt_from_millis(row.end_time)?,
            duration_ms: row.duration_ms,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

fn rows_to_migrations(rows: Vec<MigrationRow>) -> Result<Vec<Migration>> {
    rows.into_iter().map(Migration::try_from).collect()
}

#[async_trait]
impl StateBackend for SqliteStateBackend {
    async fn init_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS migrations (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                destination TEXT NOT NULL,
                source_alias TEXT NOT NULL,
                source_path TEXT NOT NULL,
                dest_alias TEXT NOT NULL,
                dest_path TEXT NOT NULL,
                options TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('scheduled', 'starting', 'running',
                    'completed', 'failed', 'cancelled', 'reconciling', 'verified',
                    'completed_with_differences')),
                execution_status TEXT NOT NULL CHECK (execution_status IN ('queued', 'executing', 'finished')),
                progress INTEGER NOT NULL DEFAULT 0,
                stats TEXT NOT NULL,
                errors TEXT NOT NULL DEFAULT '[]',
                reconciliation TEXT,
                scheduled_time INTEGER,
                start_time INTEGER,
                end_time INTEGER,
                duration_ms INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            )",
            // One non-terminal migration per endpoint pair.
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_migrations_active_pair
                ON migrations(source, destination)
                WHERE status IN ('scheduled', 'starting', 'running', 'reconciling')",
            "CREATE INDEX IF NOT EXISTS idx_migrations_due
                ON migrations(status, scheduled_time)",
            "CREATE TABLE IF NOT EXISTS migration_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                migration_id TEXT NOT NULL,
                logged_at INTEGER NOT NULL,
                level TEXT NOT NULL CHECK (level IN ('debug', 'info', 'warn', 'error')),
                message TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_migration_logs_migration
                ON migration_logs(migration_id, id)",
            "CREATE TABLE IF NOT EXISTS reconciliation_inventory (
                migration_id TEXT NOT NULL,
                side TEXT NOT NULL CHECK (side IN ('source', 'destination')),
                object_key TEXT NOT NULL,
                size INTEGER NOT NULL,
                fingerprint TEXT,
                last_modified TEXT,
                chunk_seq INTEGER NOT NULL,
                PRIMARY KEY (migration_id, side, object_key)
            )",
            "CREATE INDEX IF NOT EXISTS idx_reconciliation_inventory_key
                ON reconciliation_inventory(migration_id, object_key)",
            "CREATE TABLE IF NOT EXISTS reconciliation_reports (
                migration_id TEXT PRIMARY KEY,
                report TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn insert(&self, migration: &Migration) -> Result<()> {
        let row = MigrationRow::from_migration(migration, 0)?;

        sqlx::query(&format!(
            "INSERT INTO migrations (source, destination, {})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            MIGRATION_COLUMNS
        ))
        .bind(migration.source().to_string())
        .bind(migration.destination().to_string())
        .bind(&row.id)
        .bind(&row.source_alias)
        .bind(&row.source_path)
        .bind(&row.dest_alias)
        .bind(&row.dest_path)
        .bind(&row.options)
        .bind(&row.status)
        .bind(&row.execution_status)
        .bind(row.progress)
        .bind(&row.stats)
        .bind(&row.errors)
        .bind(&row.reconciliation)
        .bind(row.scheduled_time)
        .bind(row.start_time)
        .bind(row.end_time)
        .bind(row.duration_ms)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.version)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, migration))?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Migration>> {
        self.fetch_row(id).await?.map(Migration::try_from).transpose()
    }

    async fn list(&self, status: Option<MigrationStatus>) -> Result<Vec<Migration>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, MigrationRow>(&format!(
                    "SELECT {} FROM migrations WHERE status = ? ORDER BY created_at DESC, id",
                    MIGRATION_COLUMNS
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, MigrationRow>(&format!(
                    "SELECT {} FROM migrations ORDER BY created_at DESC, id",
                    MIGRATION_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows_to_migrations(rows)
    }

    async fn list_scheduled(&self, until: Option<DateTime<Utc>>) -> Result<Vec<Migration>> {
        let rows = match until {
            Some(until) => {
                sqlx::query_as::<_, MigrationRow>(&format!(
                    "SELECT {} FROM migrations
                     WHERE status = 'scheduled' AND scheduled_time <= ?
                     ORDER BY scheduled_time, id",
                    MIGRATION_COLUMNS
                ))
                .bind(to_millis(until))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, MigrationRow>(&format!(
                    "SELECT {} FROM migrations
                     WHERE status = 'scheduled'
                     ORDER BY scheduled_time, id",
                    MIGRATION_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows_to_migrations(rows)
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Migration>> {
        let rows = sqlx::query_as::<_, MigrationRow>(&format!(
            "SELECT {} FROM migrations
             WHERE status IN ('starting', 'running', 'reconciling')
               AND COALESCE(start_time, updated_at) < ?
             ORDER BY start_time, id",
            MIGRATION_COLUMNS
        ))
        .bind(to_millis(cutoff))
        .fetch_all(&self.pool)
        .await?;
        rows_to_migrations(rows)
    }

    async fn count(&self, status: MigrationStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM migrations WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn update(
        &self,
        id: &str,
        allowed: &[MigrationStatus],
        mutate: Mutation<'_>,
    ) -> Result<Option<Migration>> {
        loop {
            let row = self
                .fetch_row(id)
                .await?
                .ok_or_else(|| MigrateError::NotFound(id.to_string()))?;
            let version = row.version;
            let mut migration = Migration::try_from(row)?;

            if !allowed.contains(&migration.status) {
                return Ok(None);
            }

            mutate(&mut migration);
            migration.updated_at = now();
            let next = MigrationRow::from_migration(&migration, version + 1)?;

            let result = sqlx::query(
                "UPDATE migrations SET
                    status = ?, execution_status = ?, progress = ?, stats = ?, errors = ?,
                    reconciliation = ?, scheduled_time = ?, start_time = ?, end_time = ?,
                    duration_ms = ?, updated_at = ?, version = ?
                 WHERE id = ? AND version = ?",
            )
            .bind(&next.status)
            .bind(&next.execution_status)
            .bind(next.progress)
            .bind(&next.stats)
            .bind(&next.errors)
            .bind(&next.reconciliation)
            .bind(next.scheduled_time)
            .bind(next.start_time)
            .bind(next.end_time)
            .bind(next.duration_ms)
            .bind(next.updated_at)
            .bind(next.version)
            .bind(id)
            .bind(version)
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_error(e, &migration))?;

            if result.rows_affected() == 1 {
                return Migration::try_from(next).map(Some);
            }

            debug!("Migration {} changed concurrently (version {}), retrying", id, version);
        }
    }

    async fn append_log(&self, id: &str, level: LogLevel, message: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO migration_logs (migration_id, logged_at, level, message)
             VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(to_millis(now()))
        .bind(level.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_logs(&self, id: &str, limit: usize) -> Result<Vec<LogEntry>> {
        let rows: Vec<(String, i64, String, String)> = sqlx::query_as(
            "SELECT migration_id, logged_at, level, message FROM (
                SELECT id, migration_id, logged_at, level, message
                FROM migration_logs
                WHERE migration_id = ?
                ORDER BY id DESC
                LIMIT ?
             ) ORDER BY id",
        )
        .bind(id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(migration_id, logged_at, level, message)| {
                Ok(LogEntry {
                    migration_id,
                    logged_at: from_millis(logged_at)?,
                    level: level.parse()?,
                    message,
                })
            })
            .collect()
    }

    async fn save_report(&self, report: &ReconciliationReport) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO reconciliation_reports (migration_id, report, created_at)
             VALUES (?, ?, ?)",
        )
        .bind(&report.migration_id)
        .bind(serde_json::to_string(report)?)
        .bind(to_millis(report.generated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_report(&self, id: &str) -> Result<Option<ReconciliationReport>> {
        let report: Option<String> =
            sqlx::query_scalar("SELECT report FROM reconciliation_reports WHERE migration_id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        report
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(MigrateError::from)
    }

    fn backend_type(&self) -> &'static str {
        "sqlite"
    }
}

#[async_trait]
impl InventoryStore for SqliteStateBackend {
    async fn insert_chunk(
        &self,
        migration_id: &str,
        side: Side,
        chunk_seq: u64,
        records: &[ObjectRecord],
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for batch in records.chunks(INSERT_BATCH_ROWS) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT OR REPLACE INTO reconciliation_inventory
                 (migration_id, side, object_key, size, fingerprint, last_modified, chunk_seq) ",
            );
            builder.push_values(batch, |mut row, record| {
                row.push_bind(migration_id.to_string())
                    .push_bind(side.as_str())
                    .push_bind(record.key.clone())
                    .push_bind(record.size as i64)
                    .push_bind(record.fingerprint.clone())
                    .push_bind(record.last_modified.clone())
                    .push_bind(chunk_seq as i64);
            });
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn next_key_page(
        &self,
        migration_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let keys = match after {
            Some(after) => {
                sqlx::query_scalar(
                    "SELECT DISTINCT object_key FROM reconciliation_inventory
                     WHERE migration_id = ? AND object_key > ?
                     ORDER BY object_key
                     LIMIT ?",
                )
                .bind(migration_id)
                .bind(after)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar(
                    "SELECT DISTINCT object_key FROM reconciliation_inventory
                     WHERE migration_id = ?
                     ORDER BY object_key
                     LIMIT ?",
                )
                .bind(migration_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(keys)
    }

    async fn join_range(
        &self,
        migration_id: &str,
        first: &str,
        last: &str,
    ) -> Result<Vec<InventoryJoinRow>> {
        // SQLite has no portable FULL OUTER JOIN: left join from the source
        // side, plus destination-only keys.
        let rows: Vec<(String, Option<i64>, Option<String>, Option<i64>, Option<String>)> =
            sqlx::query_as(
                "SELECT s.object_key, s.size, s.fingerprint, d.size, d.fingerprint
                 FROM reconciliation_inventory s
                 LEFT JOIN reconciliation_inventory d
                   ON d.migration_id = s.migration_id
                  AND d.side = 'destination'
                  AND d.object_key = s.object_key
                 WHERE s.migration_id = ? AND s.side = 'source'
                   AND s.object_key >= ? AND s.object_key <= ?
                 UNION ALL
                 SELECT d.object_key, NULL, NULL, d.size, d.fingerprint
                 FROM reconciliation_inventory d
                 WHERE d.migration_id = ? AND d.side = 'destination'
                   AND d.object_key >= ? AND d.object_key <= ?
                   AND NOT EXISTS (
                     SELECT 1 FROM reconciliation_inventory s
                     WHERE s.migration_id = d.migration_id
                       AND s.side = 'source'
                       AND s.object_key = d.object_key
                   )
                 ORDER BY 1",
            )
            .bind(migration_id)
            .bind(first)
            .bind(last)
            .bind(migration_id)
            .bind(first)
            .bind(last)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(key, src_size, src_fp, dst_size, dst_fp)| InventoryJoinRow {
                key,
                source: src_size.map(|size| InventoryEntry {
                    size: size.max(0) as u64,
                    fingerprint: src_fp,
                }),
                destination: dst_size.map(|size| InventoryEntry {
                    size: size.max(0) as u64,
                    fingerprint: dst_fp,
                }),
            })
            .collect())
    }

    async fn side_stats(&self, migration_id: &str, side: Side) -> Result<EndpointStats> {
        let (count, total): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM reconciliation_inventory
             WHERE migration_id = ? AND side = ?",
        )
        .bind(migration_id)
        .bind(side.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(EndpointStats {
            object_count: count.max(0) as u64,
            total_size: total.max(0) as u64,
        })
    }

    async fn clear_inventory(&self, migration_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM reconciliation_inventory WHERE migration_id = ?")
            .bind(migration_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MigrationStats, ReconciliationSummary, TransferOptions};

    fn new_migration(source: &str, destination: &str) -> Migration {
        Migration::new(
            Endpoints {
                source: Endpoint::parse(source),
                destination: Endpoint::parse(destination),
            },
            TransferOptions {
                overwrite: true,
                exclude: vec!["*.tmp".to_string()],
                ..Default::default()
            },
            None,
            now(),
        )
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let backend = SqliteStateBackend::in_memory().await.unwrap();
        let migration = new_migration("a/bucket1", "b/bucket2");
        backend.insert(&migration).await.unwrap();

        let loaded = backend.get(&migration.id).await.unwrap().unwrap();
        assert_eq!(loaded, migration);
        assert!(backend.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_active_pair_rejected() {
        let backend = SqliteStateBackend::in_memory().await.unwrap();
        backend
            .insert(&new_migration("a/bucket1", "b/bucket2"))
            .await
            .unwrap();

        let err = backend
            .insert(&new_migration("a/bucket1", "b/bucket2"))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::DuplicateActive { .. }));

        // A different pair is fine.
        backend
            .insert(&new_migration("a/bucket1", "b/bucket3"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_terminal_migration_frees_pair() {
        let backend = SqliteStateBackend::in_memory().await.unwrap();
        let first = new_migration("a/bucket1", "b/bucket2");
        backend.insert(&first).await.unwrap();

        backend
            .update(&first.id, &MigrationStatus::ACTIVE, &|m| {
                m.status = MigrationStatus::Failed
            })
            .await
            .unwrap()
            .unwrap();

        backend
            .insert(&new_migration("a/bucket1", "b/bucket2"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_conditional_update() {
        let backend = SqliteStateBackend::in_memory().await.unwrap();
        let migration = new_migration("a/bucket1", "b/bucket2");
        backend.insert(&migration).await.unwrap();

        let updated = backend
            .update(&migration.id, &[MigrationStatus::Starting], &|m| {
                m.status = MigrationStatus::Running;
                m.progress = 40;
                m.stats = MigrationStats {
                    total_objects: 10,
                    transferred_objects: 4,
                    ..Default::default()
                };
                m.errors.push("transient".to_string());
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, MigrationStatus::Running);
        assert_eq!(updated, backend.get(&migration.id).await.unwrap().unwrap());

        // Not allowed from running any more.
        let rejected = backend
            .update(&migration.id, &[MigrationStatus::Starting], &|m| {
                m.status = MigrationStatus::Cancelled
            })
            .await
            .unwrap();
        assert!(rejected.is_none());

        let err = backend
            .update("missing", &[MigrationStatus::Starting], &|_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_scheduled_and_stale() {
        let backend = SqliteStateBackend::in_memory().await.unwrap();
        let t0 = now();

        let mut due = new_migration("a/b1", "b/b1");
        due.status = MigrationStatus::Scheduled;
        due.scheduled_time = Some(t0 - chrono::Duration::seconds(5));
        let mut later = new_migration("a/b2", "b/b2");
        later.status = MigrationStatus::Scheduled;
        later.scheduled_time = Some(t0 + chrono::Duration::hours(1));
        let mut stale = new_migration("a/b3", "b/b3");
        stale.status = MigrationStatus::Running;
        stale.start_time = Some(t0 - chrono::Duration::minutes(30));
        let fresh = new_migration("a/b4", "b/b4");

        for m in [&due, &later, &stale, &fresh] {
            backend.insert(m).await.unwrap();
        }

        let due_ids: Vec<_> = backend
            .list_scheduled(Some(t0))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(due_ids, vec![due.id.clone()]);
        assert_eq!(backend.list_scheduled(None).await.unwrap().len(), 2);
        assert_eq!(backend.count(MigrationStatus::Scheduled).await.unwrap(), 2);

        let stale_ids: Vec<_> = backend
            .list_stale(t0 - chrono::Duration::minutes(10))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(stale_ids, vec![stale.id.clone()]);
    }

    #[tokio::test]
    async fn test_logs_keep_latest_in_order() {
        let backend = SqliteStateBackend::in_memory().await.unwrap();
        for i in 0..5 {
            backend
                .append_log("m1", LogLevel::Info, &format!("line {}", i))
                .await
                .unwrap();
        }
        backend.append_log("m2", LogLevel::Warn, "other").await.unwrap();

        let logs = backend.list_logs("m1", 3).await.unwrap();
        let messages: Vec<_> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
        assert!(logs.iter().all(|l| l.level == LogLevel::Info));
    }

    #[tokio::test]
    async fn test_report_roundtrip() {
        let backend = SqliteStateBackend::in_memory().await.unwrap();
        let report = ReconciliationReport {
            migration_id: "m1".to_string(),
            source: "a/bucket1".to_string(),
            destination: "b/bucket2".to_string(),
            source_stats: Default::default(),
            dest_stats: Default::default(),
            summary: ReconciliationSummary {
                object_count_match: true,
                total_size_match: true,
                differences_found: false,
            },
            breakdown: Default::default(),
            recommendations: vec!["ok".to_string()],
            differences: vec![],
            generated_at: now(),
            duration_ms: 12,
        };
        backend.save_report(&report).await.unwrap();
        assert_eq!(backend.load_report("m1").await.unwrap(), Some(report));
        assert!(backend.load_report("m2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inventory_paging_and_join() {
        let backend = SqliteStateBackend::in_memory().await.unwrap();
        let source = vec![
            ObjectRecord::new("a.txt", 10, Some("e1")),
            ObjectRecord::new("b.txt", 20, Some("e2")),
            ObjectRecord::new("c.txt", 30, Some("e3")),
        ];
        let destination = vec![
            ObjectRecord::new("b.txt", 20, Some("e2")),
            ObjectRecord::new("c.txt", 31, Some("e3")),
            ObjectRecord::new("d.txt", 40, None),
        ];
        backend.insert_chunk("m1", Side::Source, 0, &source).await.unwrap();
        backend
            .insert_chunk("m1", Side::Destination, 0, &destination)
            .await
            .unwrap();
        backend
            .insert_chunk("m2", Side::Source, 0, &[ObjectRecord::new("zzz", 1, None)])
            .await
            .unwrap();

        let page = backend.next_key_page("m1", None, 2).await.unwrap();
        assert_eq!(page, vec!["a.txt", "b.txt"]);
        let page = backend.next_key_page("m1", Some("b.txt"), 2).await.unwrap();
        assert_eq!(page, vec!["c.txt", "d.txt"]);
        assert!(backend
            .next_key_page("m1", Some("d.txt"), 2)
            .await
            .unwrap()
            .is_empty());

        let rows = backend.join_range("m1", "a.txt", "d.txt").await.unwrap();
        let keys: Vec<_> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a.txt", "b.txt", "c.txt", "d.txt"]);
        assert!(rows[0].destination.is_none());
        assert_eq!(rows[2].source.as_ref().unwrap().size, 30);
        assert_eq!(rows[2].destination.as_ref().unwrap().size, 31);
        assert!(rows[3].source.is_none());

        let stats = backend.side_stats("m1", Side::Destination).await.unwrap();
        assert_eq!(stats.object_count, 3);
        assert_eq!(stats.total_size, 91);

        assert_eq!(backend.clear_inventory("m1").await.unwrap(), 6);
        assert!(backend.next_key_page("m1", None, 10).await.unwrap().is_empty());
        assert_eq!(backend.next_key_page("m2", None, 10).await.unwrap().len(), 1);
    }
}
