//! Endpoint listing sources for the inventory phase.

use crate::error::{MigrateError, Result};
use crate::reconcile::types::ObjectRecord;
use crate::state::Endpoint;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Error text reported by the tool for a bucket that does not exist.
static MISSING_BUCKET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(does not exist|NoSuchBucket|bucket not found|no such bucket)")
        .expect("valid regex")
});

/// Streams the recursive listing of one endpoint.
///
/// Records are pushed into `tx` as they are produced. A closed channel means
/// the consumer gave up; implementations stop and return `Cancelled`.
#[async_trait]
pub trait ObjectLister: Send + Sync {
    async fn list(&self, endpoint: &Endpoint, tx: mpsc::Sender<ObjectRecord>) -> Result<()>;
}

/// Lists endpoints with the transfer tool: `<program> ls --recursive --json <endpoint>`.
pub struct ToolLister {
    program: String,
}

impl ToolLister {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ObjectLister for ToolLister {
    async fn list(&self, endpoint: &Endpoint, tx: mpsc::Sender<ObjectRecord>) -> Result<()> {
        let target = endpoint.to_string();
        let mut child = Command::new(&self.program)
            .args(["ls", "--recursive", "--json"])
            .arg(&target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                MigrateError::listing(&target, format!("failed to spawn {}: {}", self.program, e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MigrateError::listing(&target, "stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MigrateError::listing(&target, "stderr was not captured"))?;

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut collected = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    collected.push(line);
                }
            }
            collected
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut errors = Vec::new();
        let mut listed = 0u64;
        while let Some(line) = lines.next_line().await? {
            match parse_listing_line(&line) {
                ListingLine::Object(record) => {
                    if tx.send(record).await.is_err() {
                        let _ = child.start_kill();
                        return Err(MigrateError::Cancelled);
                    }
                    listed += 1;
                }
                ListingLine::Error(message) => errors.push(message),
                ListingLine::Skip => {}
            }
        }

        let status = child.wait().await?;
        errors.extend(stderr_task.await.unwrap_or_default());

        if errors.iter().any(|e| MISSING_BUCKET.is_match(e)) {
            debug!("{} does not exist, treating it as empty", target);
            return Ok(());
        }

        if !status.success() {
            let detail = errors
                .last()
                .cloned()
                .unwrap_or_else(|| "no diagnostic output".to_string());
            return Err(MigrateError::listing(
                &target,
                format!("listing exited with {}: {}", status, detail),
            ));
        }

        if !errors.is_empty() {
            warn!(
                "Listing of {} reported {} error line(s), last: {}",
                target,
                errors.len(),
                errors[errors.len() - 1]
            );
        }
        debug!("Listed {} objects from {}", listed, target);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListingEntry {
    status: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    key: Option<String>,
    size: Option<u64>,
    etag: Option<String>,
    last_modified: Option<String>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, PartialEq)]
enum ListingLine {
    Object(ObjectRecord),
    Error(String),
    Skip,
}

fn parse_listing_line(line: &str) -> ListingLine {
    let line = line.trim();
    if line.is_empty() {
        return ListingLine::Skip;
    }

    let entry: ListingEntry = match serde_json::from_str(line) {
        Ok(entry) => entry,
        Err(_) => {
            if line.contains("<ERROR>") || line.to_ascii_lowercase().starts_with("error") {
                return ListingLine::Error(line.to_string());
            }
            debug!("Ignoring unstructured listing line: {}", line);
            return ListingLine::Skip;
        }
    };

    if entry.status.as_deref() == Some("error") {
        let message = entry
            .error
            .as_ref()
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| line.to_string());
        return ListingLine::Error(message);
    }

    let key = match entry.key {
        Some(key) if !key.is_empty() && !key.ends_with('/') => key,
        _ => return ListingLine::Skip,
    };
    if entry.kind.as_deref() == Some("folder") {
        return ListingLine::Skip;
    }

    let fingerprint = entry
        .etag
        .map(|e| e.trim_matches('"').to_string())
        .filter(|e| !e.is_empty());

    ListingLine::Object(ObjectRecord {
        key,
        size: entry.size.unwrap_or(0),
        fingerprint,
        last_modified: entry.last_modified,
    })
}

/// In-memory lister keyed by endpoint address.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryLister {
    listings: std::collections::HashMap<String, Vec<ObjectRecord>>,
    failing: std::collections::HashSet<String>,
}

#[cfg(test)]
impl MemoryLister {
    pub(crate) fn with_listing(mut self, endpoint: &str, records: Vec<ObjectRecord>) -> Self {
        self.listings.insert(endpoint.to_string(), records);
        self
    }

    pub(crate) fn with_failure(mut self, endpoint: &str) -> Self {
        self.failing.insert(endpoint.to_string());
        self
    }
}

#[cfg(test)]
#[async_trait]
impl ObjectLister for MemoryLister {
    async fn list(&self, endpoint: &Endpoint, tx: mpsc::Sender<ObjectRecord>) -> Result<()> {
        let target = endpoint.to_string();
        if self.failing.contains(&target) {
            return Err(MigrateError::listing(target, "access denied"));
        }
        for record in self.listings.get(&target).into_iter().flatten() {
            tx.send(record.clone())
                .await
                .map_err(|_| MigrateError::Cancelled)?;
        }
        Ok(())
    }
}
