//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Database validation
    if !config.database.url.starts_with("sqlite:") {
        return Err(MigrateError::Config(format!(
            "database.url must be a sqlite: URL, got '{}'",
            config.database.url
        )));
    }
    if config.database.max_connections == 0 {
        return Err(MigrateError::Config(
            "database.max_connections must be at least 1".into(),
        ));
    }

    // Transfer validation
    if config.transfer.program.trim().is_empty() {
        return Err(MigrateError::Config("transfer.program is required".into()));
    }
    if config.transfer.max_duration_secs == 0 {
        return Err(MigrateError::Config(
            "transfer.max_duration_secs must be at least 1".into(),
        ));
    }
    if config.transfer.staleness_window_secs == 0 {
        return Err(MigrateError::Config(
            "transfer.staleness_window_secs must be at least 1".into(),
        ));
    }

    // Scheduler validation
    if config.scheduler.poll_interval_secs == 0 {
        return Err(MigrateError::Config(
            "scheduler.poll_interval_secs must be at least 1".into(),
        ));
    }
    // A shorter lookahead would leave jobs between two polls without a timer.
    if config.scheduler.lookahead_secs < config.scheduler.poll_interval_secs {
        return Err(MigrateError::Config(format!(
            "scheduler.lookahead_secs ({}) must not be shorter than scheduler.poll_interval_secs ({})",
            config.scheduler.lookahead_secs, config.scheduler.poll_interval_secs
        )));
    }

    // Reconcile validation
    if config.reconcile.chunk_size == 0 {
        return Err(MigrateError::Config(
            "reconcile.chunk_size must be at least 1".into(),
        ));
    }
    if config.reconcile.page_size == 0 {
        return Err(MigrateError::Config(
            "reconcile.page_size must be at least 1".into(),
        ));
    }

    if config.events.channel_capacity == 0 {
        return Err(MigrateError::Config(
            "events.channel_capacity must be at least 1".into(),
        ));
    }

    Ok(())
}
