//! Streaming reconciliation of source and destination inventories.
//!
//! Runs after a successful transfer in three phases:
//!
//! - **Inventory**: both endpoints are listed concurrently; records are
//!   persisted in fixed-size chunks into the scratch relation, so neither
//!   listing is ever held in memory as a whole
//! - **Comparison**: distinct keys are paged in key order; each page is outer
//!   joined across the two sides and classified
//! - **Reporting**: counts become a summary plus recommendations, stored as the
//!   migration's report
//!
//! Matches are only counted. Only differences are retained.

pub mod inventory;
pub mod report;
pub mod types;

pub use inventory::{ObjectLister, ToolLister};
pub use types::{
    DifferenceBreakdown, InventoryEntry, InventoryJoinRow, ObjectRecord, ReconcilePhase,
    ReconcileProgressUpdate, ReconciliationReport, Side,
};

use crate::config::ReconcileConfig;
use crate::error::{MigrateError, Result};
use crate::events::NotificationSink;
use crate::state::{
    now, Difference, DifferenceKind, Endpoint, EndpointStats, InventoryStore, LogLevel, Migration,
    MigrationStatus, Reconciliation, ReconciliationStatus, StateBackend,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Classify one key of the joined inventories. `None` is a match.
///
/// Fingerprints are compared only when both sides report one.
pub fn compare_entries(
    source: Option<&InventoryEntry>,
    destination: Option<&InventoryEntry>,
) -> Option<DifferenceKind> {
    match (source, destination) {
        (Some(_), None) => Some(DifferenceKind::MissingInDestination),
        (None, Some(_)) => Some(DifferenceKind::MissingInSource),
        (None, None) => None,
        (Some(s), Some(d)) => {
            if s.size != d.size {
                Some(DifferenceKind::SizeMismatch)
            } else {
                match (&s.fingerprint, &d.fingerprint) {
                    (Some(a), Some(b)) if a != b => Some(DifferenceKind::ContentMismatch),
                    _ => None,
                }
            }
        }
    }
}

/// Engine for streaming reconciliation.
pub struct ReconcileEngine {
    state: Arc<dyn StateBackend>,
    inventory: Arc<dyn InventoryStore>,
    lister: Arc<dyn ObjectLister>,
    events: Arc<dyn NotificationSink>,
    config: ReconcileConfig,
    progress_tx: Option<mpsc::Sender<ReconcileProgressUpdate>>,
}

impl ReconcileEngine {
    pub fn new(
        state: Arc<dyn StateBackend>,
        inventory: Arc<dyn InventoryStore>,
        lister: Arc<dyn ObjectLister>,
        events: Arc<dyn NotificationSink>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            state,
            inventory,
            lister,
            events,
            config,
            progress_tx: None,
        }
    }

    /// Set progress channel for updates.
    pub fn with_progress(mut self, tx: mpsc::Sender<ReconcileProgressUpdate>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    async fn send_progress(&self, update: ReconcileProgressUpdate) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(update).await;
        }
    }

    /// Reconcile a migration that just completed its transfer.
    ///
    /// Moves `completed → reconciling`, runs the three phases and finishes in
    /// `verified` or `completed_with_differences`. A listing or storage
    /// failure puts the migration back to `completed` with a failed
    /// reconciliation sub-record. Returns `Ok(None)` when the migration was
    /// not in `completed`, and `Cancelled` when `cancel` fired mid-run (no
    /// further results are written in that case).
    pub async fn run(&self, id: &str, cancel: &CancellationToken) -> Result<Option<Migration>> {
        let started_at = now();
        let entered = self
            .state
            .update(id, &[MigrationStatus::Completed], &move |m| {
                m.status = MigrationStatus::Reconciling;
                m.reconciliation = Some(Reconciliation::running(started_at));
            })
            .await;
        let entered = match entered {
            // A newer migration for the same pair became active while this
            // one sat in `completed`; `reconciling` would violate uniqueness.
            Err(e @ MigrateError::DuplicateActive { .. }) => {
                return self.record_blocked(id, &e, started_at).await;
            }
            other => other?,
        };
        let Some(migration) = entered else {
            debug!("Migration {} is not awaiting reconciliation", id);
            return Ok(None);
        };
        self.events.notify(&migration).await;
        info!("Reconciling migration {}: {} -> {}", id, migration.source(), migration.destination());

        let outcome = async {
            let report = self
                .reconcile(id, migration.source(), migration.destination(), cancel)
                .await?;
            self.state.save_report(&report).await?;
            Ok::<_, MigrateError>(report)
        }
        .await;

        match self.inventory.clear_inventory(id).await {
            Ok(removed) => debug!("Removed {} scratch rows of migration {}", removed, id),
            Err(e) => warn!("Failed to clear scratch rows of migration {}: {}", id, e),
        }

        let updated = match outcome {
            Ok(report) => {
                let status = if report.summary.differences_found {
                    MigrationStatus::CompletedWithDifferences
                } else {
                    MigrationStatus::Verified
                };
                let completed_at = now();
                info!(
                    "Reconciliation of {} finished: {} keys compared, {} differences -> {}",
                    id,
                    report.breakdown.keys_compared(),
                    report.breakdown.total_differences(),
                    status
                );
                self.state
                    .update(id, &[MigrationStatus::Reconciling], &|m| {
                        m.status = status;
                        m.reconciliation = Some(Reconciliation {
                            status: ReconciliationStatus::Completed,
                            source_stats: report.source_stats,
                            dest_stats: report.dest_stats,
                            differences: report.differences.clone(),
                            summary: report.summary,
                            error: None,
                            started_at,
                            completed_at: Some(completed_at),
                        });
                    })
                    .await?
            }
            Err(MigrateError::Cancelled) => {
                info!("Reconciliation of {} abandoned", id);
                return Err(MigrateError::Cancelled);
            }
            Err(e) => {
                let cause = e.to_string();
                let message = format!("Reconciliation failed: {}", cause);
                error!("Migration {}: {}", id, message);
                if let Err(log_err) = self.state.append_log(id, LogLevel::Error, &message).await {
                    warn!("Failed to record log line for {}: {}", id, log_err);
                }
                let completed_at = now();
                self.state
                    .update(id, &[MigrationStatus::Reconciling], &|m| {
                        m.status = MigrationStatus::Completed;
                        let mut rec = m
                            .reconciliation
                            .clone()
                            .unwrap_or_else(|| Reconciliation::running(started_at));
                        rec.status = ReconciliationStatus::Failed;
                        rec.error = Some(cause.clone());
                        rec.completed_at = Some(completed_at);
                        m.reconciliation = Some(rec);
                        m.errors.push(message.clone());
                    })
                    .await?
            }
        };

        if let Some(m) = &updated {
            self.events.notify(m).await;
        }
        Ok(updated)
    }

    /// Record a reconciliation that could not enter `reconciling`.
    async fn record_blocked(
        &self,
        id: &str,
        cause: &MigrateError,
        started_at: DateTime<Utc>,
    ) -> Result<Option<Migration>> {
        let cause = cause.to_string();
        let message = format!("Reconciliation failed: {}", cause);
        error!("Migration {}: {}", id, message);
        if let Err(e) = self.state.append_log(id, LogLevel::Error, &message).await {
            warn!("Failed to record log line for {}: {}", id, e);
        }
        let completed_at = now();
        let updated = self
            .state
            .update(id, &[MigrationStatus::Completed], &|m| {
                let mut rec = Reconciliation::running(started_at);
                rec.status = ReconciliationStatus::Failed;
                rec.error = Some(cause.clone());
                rec.completed_at = Some(completed_at);
                m.reconciliation = Some(rec);
                m.errors.push(message.clone());
            })
            .await?;
        if let Some(m) = &updated {
            self.events.notify(m).await;
        }
        Ok(updated)
    }

    /// Run the three phases for one migration and build its report.
    pub async fn reconcile(
        &self,
        migration_id: &str,
        source: &Endpoint,
        destination: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<ReconciliationReport> {
        let start = Instant::now();

        // Leftovers of an interrupted run would skew the join.
        self.inventory.clear_inventory(migration_id).await?;

        let (source_stats, dest_stats) = tokio::try_join!(
            self.inventory_side(migration_id, Side::Source, source, cancel),
            self.inventory_side(migration_id, Side::Destination, destination, cancel),
        )?;
        info!(
            "Inventory of {}: source {} objects / {} bytes, destination {} objects / {} bytes",
            migration_id,
            source_stats.object_count,
            source_stats.total_size,
            dest_stats.object_count,
            dest_stats.total_size
        );

        let (breakdown, differences) = self.compare(migration_id, cancel).await?;

        self.send_progress(ReconcileProgressUpdate {
            migration_id: migration_id.to_string(),
            phase: ReconcilePhase::Reporting,
            side: None,
            chunks_written: 0,
            objects_listed: 0,
            pages_compared: 0,
            differences_found: breakdown.total_differences(),
        })
        .await;

        Ok(ReconciliationReport {
            migration_id: migration_id.to_string(),
            source: source.to_string(),
            destination: destination.to_string(),
            source_stats,
            dest_stats,
            summary: report::summarize(&source_stats, &dest_stats, &breakdown),
            breakdown,
            recommendations: report::recommendations(&breakdown),
            differences,
            generated_at: now(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Stream one endpoint's listing into the scratch relation.
    async fn inventory_side(
        &self,
        migration_id: &str,
        side: Side,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<EndpointStats> {
        let chunk_size = self.config.chunk_size.max(1);
        let (tx, mut rx) = mpsc::channel(chunk_size.min(1024));
        let listing = self.lister.list(endpoint, tx);

        let consume = async {
            let mut stats = EndpointStats::default();
            let mut chunk = Vec::with_capacity(chunk_size);
            let mut chunk_seq = 0u64;

            while let Some(record) = rx.recv().await {
                stats.object_count += 1;
                stats.total_size += record.size;
                chunk.push(record);
                if chunk.len() >= chunk_size {
                    self.write_chunk(migration_id, side, chunk_seq, &chunk, &stats, cancel)
                        .await?;
                    chunk.clear();
                    chunk_seq += 1;
                }
            }
            if !chunk.is_empty() {
                self.write_chunk(migration_id, side, chunk_seq, &chunk, &stats, cancel)
                    .await?;
            }
            // Dropping the receiver here lets a still-running lister notice.
            drop(rx);
            Ok::<_, MigrateError>(stats)
        };

        let (listed, streamed) = tokio::join!(listing, consume);
        let streamed = streamed?;
        listed?;

        let stats = self.inventory.side_stats(migration_id, side).await?;
        if stats.object_count != streamed.object_count {
            debug!(
                "Listing of {} {} repeated {} key(s)",
                side,
                endpoint,
                streamed.object_count.saturating_sub(stats.object_count)
            );
        }
        debug!(
            "Listed {} {} ({} objects)",
            side, endpoint, stats.object_count
        );
        Ok(stats)
    }

    async fn write_chunk(
        &self,
        migration_id: &str,
        side: Side,
        chunk_seq: u64,
        chunk: &[ObjectRecord],
        stats: &EndpointStats,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        self.inventory
            .insert_chunk(migration_id, side, chunk_seq, chunk)
            .await?;
        self.send_progress(ReconcileProgressUpdate {
            migration_id: migration_id.to_string(),
            phase: ReconcilePhase::Inventory,
            side: Some(side),
            chunks_written: chunk_seq + 1,
            objects_listed: stats.object_count,
            pages_compared: 0,
            differences_found: 0,
        })
        .await;
        Ok(())
    }

    /// Page through distinct keys and classify each one.
    async fn compare(
        &self,
        migration_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(DifferenceBreakdown, Vec<Difference>)> {
        let page_size = self.config.page_size.max(1);
        let mut breakdown = DifferenceBreakdown::default();
        let mut differences = Vec::new();
        let mut after: Option<String> = None;
        let mut pages = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }

            let keys = self
                .inventory
                .next_key_page(migration_id, after.as_deref(), page_size)
                .await?;
            let (first, last) = match (keys.first(), keys.last()) {
                (Some(first), Some(last)) => (first.clone(), last.clone()),
                _ => break,
            };

            let rows = self.inventory.join_range(migration_id, &first, &last).await?;
            for row in rows {
                let kind = compare_entries(row.source.as_ref(), row.destination.as_ref());
                breakdown.record(kind);
                if let Some(kind) = kind {
                    differences.push(Difference {
                        path: row.key,
                        kind,
                        source_size: row.source.map(|e| e.size),
                        dest_size: row.destination.map(|e| e.size),
                    });
                }
            }

            pages += 1;
            self.send_progress(ReconcileProgressUpdate {
                migration_id: migration_id.to_string(),
                phase: ReconcilePhase::Comparison,
                side: None,
                chunks_written: 0,
                objects_listed: 0,
                pages_compared: pages,
                differences_found: breakdown.total_differences(),
            })
            .await;

            if keys.len() < page_size {
                break;
            }
            after = Some(last);
        }

        debug!(
            "Compared {} keys of {} in {} pages",
            breakdown.keys_compared(),
            migration_id,
            pages
        );
        Ok((breakdown, differences))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconcileConfig;
    use crate::events::EventBus;
    use crate::reconcile::inventory::MemoryLister;
    use crate::state::{Endpoints, SqliteStateBackend, TransferOptions};
    use std::collections::BTreeMap;

    const SOURCE: &str = "a/bucket1";
    const DESTINATION: &str = "b/bucket2";

    fn config(chunk_size: usize, page_size: usize) -> ReconcileConfig {
        ReconcileConfig {
            enabled: true,
            chunk_size,
            page_size,
        }
    }

    fn engine(
        backend: &Arc<SqliteStateBackend>,
        lister: MemoryLister,
        config: ReconcileConfig,
    ) -> ReconcileEngine {
        ReconcileEngine::new(
            backend.clone(),
            backend.clone(),
            Arc::new(lister),
            Arc::new(EventBus::new(16)),
            config,
        )
    }

    /// Deterministic split of `n` objects across all five categories.
    fn synthetic(n: usize) -> (Vec<ObjectRecord>, Vec<ObjectRecord>) {
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut source = Vec::new();
        let mut destination = Vec::new();
        for i in 0..n {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let key = format!("obj/{:08}-{}", (state % 1_000_000), i);
            let size = 100 + (i as u64 % 17);
            let etag = format!("etag-{}", i);
            match state % 5 {
                0 => source.push(ObjectRecord::new(key, size, Some(&etag))),
                1 => destination.push(ObjectRecord::new(key, size, Some(&etag))),
                2 => {
                    source.push(ObjectRecord::new(key.clone(), size, Some(&etag)));
                    destination.push(ObjectRecord::new(key, size + 1, Some(&etag)));
                }
                3 => {
                    source.push(ObjectRecord::new(key.clone(), size, Some(&etag)));
                    destination.push(ObjectRecord::new(key, size, Some("other")));
                }
                _ => {
                    source.push(ObjectRecord::new(key.clone(), size, Some(&etag)));
                    destination.push(ObjectRecord::new(key, size, Some(&etag)));
                }
            }
        }
        (source, destination)
    }

    /// Full in-memory join for comparison.
    fn naive_differences(source: &[ObjectRecord], destination: &[ObjectRecord]) -> Vec<Difference> {
        let to_entry = |r: &ObjectRecord| InventoryEntry {
            size: r.size,
            fingerprint: r.fingerprint.clone(),
        };
        let mut joined: BTreeMap<String, (Option<InventoryEntry>, Option<InventoryEntry>)> =
            BTreeMap::new();
        for r in source {
            joined.entry(r.key.clone()).or_default().0 = Some(to_entry(r));
        }
        for r in destination {
            joined.entry(r.key.clone()).or_default().1 = Some(to_entry(r));
        }
        joined
            .into_iter()
            .filter_map(|(path, (s, d))| {
                compare_entries(s.as_ref(), d.as_ref()).map(|kind| Difference {
                    path,
                    kind,
                    source_size: s.map(|e| e.size),
                    dest_size: d.map(|e| e.size),
                })
            })
            .collect()
    }

    #[test]
    fn test_compare_entries() {
        let entry = |size, fp: Option<&str>| InventoryEntry {
            size,
            fingerprint: fp.map(str::to_string),
        };
        let a = entry(10, Some("x"));
        assert_eq!(
            compare_entries(Some(&a), None),
            Some(DifferenceKind::MissingInDestination)
        );
        assert_eq!(
            compare_entries(None, Some(&a)),
            Some(DifferenceKind::MissingInSource)
        );
        assert_eq!(
            compare_entries(Some(&a), Some(&entry(11, Some("x")))),
            Some(DifferenceKind::SizeMismatch)
        );
        assert_eq!(
            compare_entries(Some(&a), Some(&entry(10, Some("y")))),
            Some(DifferenceKind::ContentMismatch)
        );
        assert_eq!(compare_entries(Some(&a), Some(&entry(10, None))), None);
        assert_eq!(compare_entries(Some(&a), Some(&a)), None);
    }

    #[tokio::test]
    async fn test_chunked_comparison_matches_naive_join() {
        let page_size = 50;
        for n in [0, page_size, page_size + 1, page_size * 7 + 3] {
            let backend = Arc::new(SqliteStateBackend::in_memory().await.unwrap());
            let (source, destination) = synthetic(n);
            let lister = MemoryLister::default()
                .with_listing(SOURCE, source.clone())
                .with_listing(DESTINATION, destination.clone());
            let engine = engine(&backend, lister, config(16, page_size));

            let report = engine
                .reconcile(
                    "m1",
                    &Endpoint::parse(SOURCE),
                    &Endpoint::parse(DESTINATION),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();

            let expected = naive_differences(&source, &destination);
            assert_eq!(report.differences, expected, "n = {}", n);
            assert_eq!(report.source_stats.object_count, source.len() as u64);
            assert_eq!(report.dest_stats.object_count, destination.len() as u64);
            assert_eq!(
                report.breakdown.total_differences(),
                expected.len() as u64
            );
            assert_eq!(report.summary.differences_found, !expected.is_empty());
        }
    }

    #[tokio::test]
    async fn test_progress_reports_each_phase() {
        let backend = Arc::new(SqliteStateBackend::in_memory().await.unwrap());
        let (source, destination) = synthetic(30);
        let lister = MemoryLister::default()
            .with_listing(SOURCE, source)
            .with_listing(DESTINATION, destination);
        let (tx, mut rx) = mpsc::channel(1024);
        let engine = engine(&backend, lister, config(10, 10)).with_progress(tx);

        engine
            .reconcile(
                "m1",
                &Endpoint::parse(SOURCE),
                &Endpoint::parse(DESTINATION),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        drop(engine);

        let mut phases = Vec::new();
        while let Some(update) = rx.recv().await {
            phases.push(update.phase);
        }
        assert!(phases.contains(&ReconcilePhase::Inventory));
        assert!(phases.contains(&ReconcilePhase::Comparison));
        assert_eq!(phases.last(), Some(&ReconcilePhase::Reporting));
    }

    #[tokio::test]
    async fn test_cancelled_reconcile_writes_nothing() {
        let backend = Arc::new(SqliteStateBackend::in_memory().await.unwrap());
        let (source, destination) = synthetic(40);
        let lister = MemoryLister::default()
            .with_listing(SOURCE, source)
            .with_listing(DESTINATION, destination);
        let engine = engine(&backend, lister, config(5, 5));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = engine
            .reconcile(
                "m1",
                &Endpoint::parse(SOURCE),
                &Endpoint::parse(DESTINATION),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Cancelled));
        assert!(backend.next_key_page("m1", None, 10).await.unwrap().is_empty());
    }

    async fn completed_migration(backend: &SqliteStateBackend) -> Migration {
        let migration = Migration::new(
            Endpoints {
                source: Endpoint::parse(SOURCE),
                destination: Endpoint::parse(DESTINATION),
            },
            TransferOptions::default(),
            None,
            now(),
        );
        backend.insert(&migration).await.unwrap();
        backend
            .update(&migration.id, &[MigrationStatus::Starting], &|m| {
                m.status = MigrationStatus::Completed;
                m.progress = 100;
            })
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_identical_inventories_verifies() {
        let backend = Arc::new(SqliteStateBackend::in_memory().await.unwrap());
        let migration = completed_migration(&backend).await;
        let objects = vec![
            ObjectRecord::new("a.txt", 1, Some("e1")),
            ObjectRecord::new("b.txt", 2, Some("e2")),
        ];
        let lister = MemoryLister::default()
            .with_listing(SOURCE, objects.clone())
            .with_listing(DESTINATION, objects);
        let engine = engine(&backend, lister, config(1, 1));

        let done = engine
            .run(&migration.id, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, MigrationStatus::Verified);
        let rec = done.reconciliation.unwrap();
        assert_eq!(rec.status, ReconciliationStatus::Completed);
        assert!(rec.summary.object_count_match);
        assert!(rec.summary.total_size_match);
        assert!(!rec.summary.differences_found);
        assert!(rec.completed_at.is_some());

        let report = backend.load_report(&migration.id).await.unwrap().unwrap();
        assert_eq!(report.breakdown.matched, 2);
        assert!(backend
            .next_key_page(&migration.id, None, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_repeated_listing_key_counts_once() {
        let backend = Arc::new(SqliteStateBackend::in_memory().await.unwrap());
        let migration = completed_migration(&backend).await;
        let lister = MemoryLister::default()
            .with_listing(
                SOURCE,
                vec![
                    ObjectRecord::new("a.txt", 4, Some("e1")),
                    ObjectRecord::new("b.txt", 2, Some("e2")),
                    ObjectRecord::new("a.txt", 4, Some("e1")),
                ],
            )
            .with_listing(
                DESTINATION,
                vec![
                    ObjectRecord::new("a.txt", 4, Some("e1")),
                    ObjectRecord::new("b.txt", 2, Some("e2")),
                ],
            );
        let engine = engine(&backend, lister, config(2, 10));

        let done = engine
            .run(&migration.id, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, MigrationStatus::Verified);
        let rec = done.reconciliation.unwrap();
        assert_eq!(rec.source_stats.object_count, 2);
        assert_eq!(rec.source_stats.total_size, 6);
        assert!(rec.summary.object_count_match);
        assert!(rec.summary.total_size_match);
    }

    #[tokio::test]
    async fn test_run_with_differences() {
        let backend = Arc::new(SqliteStateBackend::in_memory().await.unwrap());
        let migration = completed_migration(&backend).await;
        let lister = MemoryLister::default()
            .with_listing(SOURCE, vec![ObjectRecord::new("a.txt", 1, None)])
            .with_listing(DESTINATION, vec![]);
        let engine = engine(&backend, lister, config(10, 10));

        let done = engine
            .run(&migration.id, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, MigrationStatus::CompletedWithDifferences);
        let rec = done.reconciliation.unwrap();
        assert_eq!(rec.differences.len(), 1);
        assert_eq!(rec.differences[0].kind, DifferenceKind::MissingInDestination);
        assert!(!rec.summary.object_count_match);
    }

    #[tokio::test]
    async fn test_run_listing_failure_keeps_completed() {
        let backend = Arc::new(SqliteStateBackend::in_memory().await.unwrap());
        let migration = completed_migration(&backend).await;
        let lister = MemoryLister::default()
            .with_listing(SOURCE, vec![ObjectRecord::new("a.txt", 1, None)])
            .with_failure(DESTINATION);
        let engine = engine(&backend, lister, config(10, 10));

        let done = engine
            .run(&migration.id, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, MigrationStatus::Completed);
        let rec = done.reconciliation.unwrap();
        assert_eq!(rec.status, ReconciliationStatus::Failed);
        assert!(rec.error.unwrap().contains("access denied"));
        assert_eq!(done.errors.len(), 1);
        assert!(backend.load_report(&migration.id).await.unwrap().is_none());
        assert!(backend
            .next_key_page(&migration.id, None, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_run_blocked_by_newer_active_migration_records_failure() {
        let backend = Arc::new(SqliteStateBackend::in_memory().await.unwrap());
        let migration = completed_migration(&backend).await;
        let newer = Migration::new(
            Endpoints {
                source: Endpoint::parse(SOURCE),
                destination: Endpoint::parse(DESTINATION),
            },
            TransferOptions::default(),
            Some(now() + chrono::Duration::hours(1)),
            now(),
        );
        backend.insert(&newer).await.unwrap();

        let bus = Arc::new(EventBus::new(16));
        let mut sub = bus.subscribe();
        let engine = ReconcileEngine::new(
            backend.clone(),
            backend.clone(),
            Arc::new(MemoryLister::default()),
            bus.clone(),
            config(10, 10),
        );

        let done = engine
            .run(&migration.id, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, MigrationStatus::Completed);
        let rec = done.reconciliation.unwrap();
        assert_eq!(rec.status, ReconciliationStatus::Failed);
        assert!(rec.error.unwrap().contains("active migration already exists"));
        assert_eq!(done.errors.len(), 1);
        assert!(done.errors[0].starts_with("Reconciliation failed"));
        assert!(sub.try_recv().is_some());

        let stored = backend.get(&newer.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MigrationStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_run_ignores_migration_not_completed() {
        let backend = Arc::new(SqliteStateBackend::in_memory().await.unwrap());
        let migration = Migration::new(
            Endpoints {
                source: Endpoint::parse(SOURCE),
                destination: Endpoint::parse(DESTINATION),
            },
            TransferOptions::default(),
            None,
            now(),
        );
        backend.insert(&migration).await.unwrap();
        let engine = engine(&backend, MemoryLister::default(), config(10, 10));

        let outcome = engine
            .run(&migration.id, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_none());
    }
}
