//! Type definitions for streaming reconciliation.

use crate::state::{Difference, DifferenceKind, EndpointStats, ReconciliationSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which endpoint an inventory row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Source,
    Destination,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Source => "source",
            Side::Destination => "destination",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One object reported by an endpoint listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    /// Object key relative to the endpoint's bucket path.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// Content fingerprint (ETag or checksum), when the lister reports one.
    pub fingerprint: Option<String>,
    /// Last-modified timestamp as reported by the lister.
    pub last_modified: Option<String>,
}

impl ObjectRecord {
    pub fn new(key: impl Into<String>, size: u64, fingerprint: Option<&str>) -> Self {
        Self {
            key: key.into(),
            size,
            fingerprint: fingerprint.map(str::to_string),
            last_modified: None,
        }
    }
}

/// Data columns of one side of an inventory row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    pub size: u64,
    pub fingerprint: Option<String>,
}

/// One key of the outer join between both inventories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryJoinRow {
    pub key: String,
    pub source: Option<InventoryEntry>,
    pub destination: Option<InventoryEntry>,
}

/// Running per-category counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DifferenceBreakdown {
    pub matched: u64,
    pub missing_in_destination: u64,
    pub missing_in_source: u64,
    pub size_mismatch: u64,
    pub content_mismatch: u64,
}

impl DifferenceBreakdown {
    /// Count one classified key (`None` is a match).
    pub fn record(&mut self, kind: Option<DifferenceKind>) {
        match kind {
            None => self.matched += 1,
            Some(DifferenceKind::MissingInDestination) => self.missing_in_destination += 1,
            Some(DifferenceKind::MissingInSource) => self.missing_in_source += 1,
            Some(DifferenceKind::SizeMismatch) => self.size_mismatch += 1,
            Some(DifferenceKind::ContentMismatch) => self.content_mismatch += 1,
        }
    }

    /// Count for one category.
    pub fn count(&self, kind: DifferenceKind) -> u64 {
        match kind {
            DifferenceKind::MissingInDestination => self.missing_in_destination,
            DifferenceKind::MissingInSource => self.missing_in_source,
            DifferenceKind::SizeMismatch => self.size_mismatch,
            DifferenceKind::ContentMismatch => self.content_mismatch,
        }
    }

    /// Total number of differences.
    pub fn total_differences(&self) -> u64 {
        self.missing_in_destination + self.missing_in_source + self.size_mismatch + self.content_mismatch
    }

    /// Total keys compared.
    pub fn keys_compared(&self) -> u64 {
        self.matched + self.total_differences()
    }
}

/// Retrievable reconciliation artifact of a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub migration_id: String,
    pub source: String,
    pub destination: String,
    pub source_stats: EndpointStats,
    pub dest_stats: EndpointStats,
    pub summary: ReconciliationSummary,
    pub breakdown: DifferenceBreakdown,
    pub recommendations: Vec<String>,
    pub differences: Vec<Difference>,
    pub generated_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Phase of a reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePhase {
    Inventory,
    Comparison,
    Reporting,
}

impl fmt::Display for ReconcilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcilePhase::Inventory => write!(f, "inventory"),
            ReconcilePhase::Comparison => write!(f, "comparison"),
            ReconcilePhase::Reporting => write!(f, "reporting"),
        }
    }
}

/// Progress update for reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileProgressUpdate {
    pub migration_id: String,
    pub phase: ReconcilePhase,
    /// Side being listed (inventory phase only).
    pub side: Option<Side>,
    /// Chunks persisted so far for `side`.
    pub chunks_written: u64,
    /// Records persisted so far for `side`.
    pub objects_listed: u64,
    /// Key pages compared so far.
    pub pages_compared: u64,
    /// Differences found so far.
    pub differences_found: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakdown_counts() {
        let mut breakdown = DifferenceBreakdown::default();
        breakdown.record(None);
        breakdown.record(None);
        breakdown.record(Some(DifferenceKind::MissingInDestination));
        breakdown.record(Some(DifferenceKind::ContentMismatch));

        assert_eq!(breakdown.matched, 2);
        assert_eq!(breakdown.total_differences(), 2);
        assert_eq!(breakdown.keys_compared(), 4);
        assert_eq!(breakdown.count(DifferenceKind::ContentMismatch), 1);
        assert_eq!(breakdown.count(DifferenceKind::SizeMismatch), 0);
    }
}
