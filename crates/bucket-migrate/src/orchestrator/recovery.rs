//! Restart recovery of orphaned migrations.

use crate::error::Result;
use crate::events::NotificationSink;
use crate::state::{
    ExecutionStatus, InventoryStore, LogLevel, Migration, MigrationStatus, ReconciliationStatus,
    StateBackend,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Outcome of one recovery pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Migrations moved to `failed`.
    pub recovered: Vec<String>,
    /// In-flight migrations still inside the staleness window.
    pub in_flight: u64,
}

/// Fail every in-flight migration whose start is older than `window`.
///
/// Orphaned external processes are never resumed. Each migration is failed
/// through a conditional update, so repeated passes record the interruption
/// exactly once.
pub async fn recover_stale(
    state: &dyn StateBackend,
    inventory: &dyn InventoryStore,
    events: &dyn NotificationSink,
    window: chrono::Duration,
    at: DateTime<Utc>,
) -> Result<RecoveryReport> {
    let cutoff = at - window;
    let stale = state.list_stale(cutoff).await?;
    let mut report = RecoveryReport::default();

    for migration in stale {
        let message = interruption_message(&migration, window);
        let failed = state
            .update(&migration.id, &MigrationStatus::IN_FLIGHT, &|m| {
                let was_reconciling = m.status == MigrationStatus::Reconciling;
                m.status = MigrationStatus::Failed;
                m.execution_status = ExecutionStatus::Finished;
                m.errors.push(message.clone());
                if m.end_time.is_none() {
                    m.end_time = Some(at);
                    m.duration_ms = m
                        .start_time
                        .map(|start| (at - start).num_milliseconds().max(0));
                }
                if was_reconciling {
                    if let Some(rec) = m.reconciliation.as_mut() {
                        rec.status = ReconciliationStatus::Failed;
                        rec.error = Some(message.clone());
                        rec.completed_at = Some(at);
                    }
                }
            })
            .await?;

        let Some(failed) = failed else {
            continue;
        };

        warn!("Migration {}: {}", failed.id, message);
        if let Err(e) = state.append_log(&failed.id, LogLevel::Error, &message).await {
            warn!("Failed to record log line for {}: {}", failed.id, e);
        }
        if migration.status == MigrationStatus::Reconciling {
            inventory.clear_inventory(&failed.id).await?;
        }
        events.notify(&failed).await;
        report.recovered.push(failed.id);
    }

    for status in MigrationStatus::IN_FLIGHT {
        report.in_flight += state.count(status).await?;
    }

    if !report.recovered.is_empty() {
        info!(
            "Recovery failed {} orphaned migration(s); {} still in flight",
            report.recovered.len(),
            report.in_flight
        );
    }
    Ok(report)
}

fn interruption_message(migration: &Migration, window: chrono::Duration) -> String {
    format!(
        "Interrupted: found '{}' at startup with no supervisor for over {} minutes; the transfer was not resumed",
        migration.status,
        window.num_minutes()
    )
}
