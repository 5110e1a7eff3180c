//! Summary and recommendations for a finished comparison.

use crate::reconcile::types::DifferenceBreakdown;
use crate::state::{DifferenceKind, EndpointStats, ReconciliationSummary};

/// Headline booleans of a reconciliation.
pub fn summarize(
    source: &EndpointStats,
    destination: &EndpointStats,
    breakdown: &DifferenceBreakdown,
) -> ReconciliationSummary {
    ReconciliationSummary {
        object_count_match: source.object_count == destination.object_count,
        total_size_match: source.total_size == destination.total_size,
        differences_found: breakdown.total_differences() > 0,
    }
}

/// Human-readable follow-ups, one per non-empty difference category.
pub fn recommendations(breakdown: &DifferenceBreakdown) -> Vec<String> {
    let mut out = Vec::new();

    for kind in DifferenceKind::ALL {
        let count = breakdown.count(kind);
        if count == 0 {
            continue;
        }
        let advice = match kind {
            DifferenceKind::MissingInDestination => format!(
                "{} object(s) are missing at the destination: re-run an incremental sync to copy them",
                count
            ),
            DifferenceKind::MissingInSource => format!(
                "{} object(s) exist only at the destination: review them, or re-run with --remove to delete extraneous objects",
                count
            ),
            DifferenceKind::SizeMismatch => format!(
                "{} object(s) differ in size: re-run with --overwrite to replace them",
                count
            ),
            DifferenceKind::ContentMismatch => format!(
                "{} object(s) have the same size but different content: re-run with --overwrite and --checksum to replace them",
                count
            ),
        };
        out.push(advice);
    }

    if out.is_empty() {
        out.push("Source and destination match; no action needed".to_string());
    }

    out
}
