//! Classification of transfer tool output.
//!
//! The tool's output is free text mixed with JSON lines, and the patterns
//! below were taken from what the tool actually prints. Everything here is a
//! best-effort estimate: a line that matches nothing is simply ignored, and a
//! percentage is never treated as exact.

use crate::state::MigrationStats;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Progress ceiling while the process is alive.
pub const MAX_LIVE_PROGRESS: u8 = 95;

const SIZE: &str = r"(\d+(?:\.\d+)?)\s*([KMGTP]i?B|B)";

static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid regex"));

static COPY_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^`([^`]+)`\s*->\s*`([^`]+)`").expect("valid regex"));

static SUMMARY_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)Total:\s*{SIZE}\s*,\s*Transferred:\s*{SIZE}\s*,\s*Speed:\s*{SIZE}/s"
    ))
    .expect("valid regex")
});

static SIZE_PAIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"{SIZE}\s*/\s*{SIZE}")).expect("valid regex"));

static SPEED: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"{SIZE}/s\b")).expect("valid regex"));

static PERCENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)\s*%").expect("valid regex"));

static OBJECT_PAIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+)\s*/\s*(\d+)\s+objects?\b").expect("valid regex"));

static OBJECT_TOTAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+)\s+objects?\b").expect("valid regex"));

static DIAGNOSTIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(<ERROR>|<WARN>|^mc: |\berror\b|\bfailed\b|\bwarning\b|\bdenied\b)")
        .expect("valid regex")
});

/// Facts extracted from one output line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineReport {
    /// Objects finished on this line.
    pub copied: u64,
    /// Bytes finished on this line.
    pub copied_bytes: u64,
    pub total_objects: Option<u64>,
    pub transferred_objects: Option<u64>,
    pub total_size: Option<u64>,
    pub transferred_size: Option<u64>,
    /// Bytes per second.
    pub speed: Option<f64>,
    /// Percentage printed by the tool.
    pub percent: Option<f64>,
}

impl LineReport {
    fn is_empty(&self) -> bool {
        *self == LineReport::default()
    }
}

/// Outcome of classifying one line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineClass {
    /// Stat or progress refinement.
    Report(LineReport),
    /// Error or warning text worth keeping in the migration log.
    Diagnostic(String),
    /// Nothing recognizable.
    Unclassified,
}

/// Parse a human-readable size such as `12.5 MiB` into bytes.
pub fn parse_size(value: &str, unit: &str) -> Option<u64> {
    let value: f64 = value.parse().ok()?;
    let multiplier: f64 = match unit.to_ascii_uppercase().as_str() {
        "B" => 1.0,
        "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "PB" => 1e15,
        "KIB" => 1024.0,
        "MIB" => 1024.0 * 1024.0,
        "GIB" => 1024.0 * 1024.0 * 1024.0,
        "TIB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "PIB" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}

fn size_at(caps: &regex::Captures<'_>, group: usize) -> Option<u64> {
    parse_size(caps.get(group)?.as_str(), caps.get(group + 1)?.as_str())
}

/// Strip terminal escapes and keep the last carriage-return segment, which is
/// what a terminal would show for a redrawn progress bar.
fn visible_text(line: &str) -> String {
    let stripped = ANSI_ESCAPE.replace_all(line, "");
    stripped
        .split('\r')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .last()
        .unwrap_or_default()
        .to_string()
}

/// Classify one line of tool output.
pub fn classify(line: &str) -> LineClass {
    let text = visible_text(line);
    if text.is_empty() {
        return LineClass::Unclassified;
    }

    if text.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<Value>(&text) {
            return classify_json(&value);
        }
    }

    if COPY_LINE.is_match(&text) {
        return LineClass::Report(LineReport {
            copied: 1,
            ..Default::default()
        });
    }

    if DIAGNOSTIC.is_match(&text) {
        return LineClass::Diagnostic(text);
    }

    let mut report = LineReport::default();

    if let Some(caps) = SUMMARY_LINE.captures(&text) {
        report.total_size = size_at(&caps, 1);
        report.transferred_size = size_at(&caps, 3);
        report.speed = size_at(&caps, 5).map(|s| s as f64);
    } else {
        if let Some(caps) = SIZE_PAIR.captures(&text) {
            report.transferred_size = size_at(&caps, 1);
            report.total_size = size_at(&caps, 3);
        }
        if let Some(caps) = SPEED.captures(&text) {
            report.speed = size_at(&caps, 1).map(|s| s as f64);
        }
    }

    if let Some(caps) = OBJECT_PAIR.captures(&text) {
        report.transferred_objects = caps[1].parse().ok();
        report.total_objects = caps[2].parse().ok();
    } else if let Some(caps) = OBJECT_TOTAL.captures(&text) {
        report.total_objects = caps[1].parse().ok();
    }

    if let Some(caps) = PERCENT.captures(&text) {
        report.percent = caps[1].parse::<f64>().ok().filter(|p| *p <= 100.0);
    }

    if report.is_empty() {
        LineClass::Unclassified
    } else {
        LineClass::Report(report)
    }
}

fn classify_json(value: &Value) -> LineClass {
    let u64_field = |name: &str| value.get(name).and_then(Value::as_u64);

    if value.get("status").and_then(Value::as_str) == Some("error") {
        let message = value
            .pointer("/error/message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string());
        return LineClass::Diagnostic(message);
    }

    let mut report = LineReport::default();

    // Per-object copy record.
    if value.get("source").is_some() && value.get("target").is_some() {
        report.copied = 1;
        report.copied_bytes = u64_field("size").unwrap_or(0);
    }

    report.total_objects = u64_field("totalCount");
    report.total_size = u64_field("totalSize").or_else(|| u64_field("total"));
    report.transferred_size = u64_field("transferred");
    report.speed = value.get("speed").and_then(Value::as_f64);

    if report.is_empty() {
        LineClass::Unclassified
    } else {
        LineClass::Report(report)
    }
}

/// Folds line reports into running stats and a bounded progress estimate.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    stats: MigrationStats,
    copied_objects: u64,
    copied_bytes: u64,
    progress: u8,
}

impl ProgressTracker {
    /// Continue from already persisted values.
    pub fn resume(stats: MigrationStats, progress: u8) -> Self {
        Self {
            stats,
            copied_objects: stats.transferred_objects,
            copied_bytes: stats.transferred_size,
            progress: progress.min(MAX_LIVE_PROGRESS),
        }
    }

    pub fn stats(&self) -> MigrationStats {
        self.stats
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Apply one report.
    pub fn apply(&mut self, report: &LineReport) {
        self.copied_objects += report.copied;
        self.copied_bytes += report.copied_bytes;

        self.stats.refine(&MigrationStats {
            total_objects: report.total_objects.unwrap_or(0),
            transferred_objects: report
                .transferred_objects
                .unwrap_or(0)
                .max(self.copied_objects),
            total_size: report.total_size.unwrap_or(0),
            transferred_size: report.transferred_size.unwrap_or(0).max(self.copied_bytes),
            speed: report.speed.unwrap_or(0.0),
        });

        let ratio = if self.stats.total_objects > 0 {
            Some(self.stats.transferred_objects as f64 / self.stats.total_objects.max(1) as f64)
        } else if self.stats.total_size > 0 {
            Some(self.stats.transferred_size as f64 / self.stats.total_size.max(1) as f64)
        } else {
            None
        };

        let candidate = ratio
            .map(|r| r * 100.0)
            .into_iter()
            .chain(report.percent)
            .fold(0.0_f64, f64::max);
        let candidate = candidate.floor().clamp(0.0, MAX_LIVE_PROGRESS as f64) as u8;
        self.progress = self.progress.max(candidate);
    }
}
