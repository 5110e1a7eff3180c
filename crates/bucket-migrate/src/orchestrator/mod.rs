//! Migration orchestrator - wires the engine together.
//!
//! The orchestrator owns the repository handle, the event bus, the transfer
//! supervisor and the scheduler, and exposes the operations a front end needs:
//! submission, queries, cancellation, rescheduling, restart recovery and the
//! long-running daemon loop.

mod recovery;

pub use recovery::{recover_stale, RecoveryReport};

use crate::config::Config;
use crate::error::{MigrateError, Result};
use crate::events::{EventBus, NotificationSink};
use crate::reconcile::{ObjectLister, ReconcileEngine, ReconciliationReport, ToolLister};
use crate::scheduler::Scheduler;
use crate::state::{
    now, Endpoint, Endpoints, InventoryStore, LogEntry, Migration, MigrationStatus,
    SqliteStateBackend, StateBackend, TransferOptions,
};
use crate::transfer::{MigrationDispatcher, TransferSupervisor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A request to create a migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub source: Endpoint,
    pub destination: Endpoint,
    #[serde(default)]
    pub options: TransferOptions,
    /// Start no earlier than this instant. `None` or a past instant starts
    /// the transfer immediately.
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
}

impl SubmitRequest {
    pub fn new(source: &str, destination: &str) -> Self {
        Self {
            source: Endpoint::parse(source),
            destination: Endpoint::parse(destination),
            options: TransferOptions::default(),
            scheduled_time: None,
        }
    }

    pub fn with_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }

    pub fn scheduled_at(mut self, time: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(time);
        self
    }

    /// Reject malformed requests before any state exists.
    pub fn validate(&self) -> Result<()> {
        self.source.validate("source")?;
        self.destination.validate("destination")?;
        if self.source == self.destination {
            return Err(MigrateError::InvalidConfig(format!(
                "source and destination are the same endpoint ({})",
                self.source
            )));
        }
        if self.options.exclude.iter().any(|p| p.trim().is_empty()) {
            return Err(MigrateError::InvalidConfig(
                "exclude patterns must not be empty".into(),
            ));
        }
        if let Some(alg) = &self.options.checksum {
            if alg.trim().is_empty() || alg.chars().any(char::is_whitespace) {
                return Err(MigrateError::InvalidConfig(format!(
                    "invalid checksum algorithm '{}'",
                    alg
                )));
            }
        }
        Ok(())
    }
}

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    state: Arc<dyn StateBackend>,
    inventory: Arc<dyn InventoryStore>,
    events: Arc<EventBus>,
    supervisor: TransferSupervisor,
    scheduler: Scheduler,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Open the configured repository and build the engine around it.
    pub async fn connect(config: Config) -> Result<Self> {
        let backend = Arc::new(SqliteStateBackend::connect(&config.database).await?);
        let lister = Arc::new(ToolLister::new(config.transfer.program.clone()));
        Ok(Self::with_components(config, backend, lister))
    }

    /// Build the engine around an existing repository and listing source.
    pub fn with_components(
        config: Config,
        backend: Arc<SqliteStateBackend>,
        lister: Arc<dyn ObjectLister>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let events = Arc::new(EventBus::new(config.events.channel_capacity));

        let reconciler = config.reconcile.enabled.then(|| {
            Arc::new(ReconcileEngine::new(
                backend.clone(),
                backend.clone(),
                lister,
                events.clone(),
                config.reconcile.clone(),
            ))
        });
        let supervisor = TransferSupervisor::new(
            backend.clone(),
            events.clone(),
            reconciler,
            config.transfer.clone(),
            shutdown.clone(),
        );
        let scheduler = Scheduler::new(
            backend.clone(),
            Arc::new(supervisor.clone()),
            events.clone(),
            config.scheduler.clone(),
        );

        Self {
            config,
            state: backend.clone(),
            inventory: backend,
            events,
            supervisor,
            scheduler,
            shutdown,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn supervisor(&self) -> &TransferSupervisor {
        &self.supervisor
    }

    /// Token that stops the daemon loop and all transfers.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Create a migration.
    ///
    /// A future `scheduled_time` leaves it `scheduled`; otherwise the transfer
    /// is started at once.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Migration> {
        request.validate()?;

        let migration = Migration::new(
            Endpoints {
                source: request.source,
                destination: request.destination,
            },
            request.options,
            request.scheduled_time,
            now(),
        );
        self.state.insert(&migration).await?;
        info!(
            "Submitted migration {}: {} -> {} ({})",
            migration.id,
            migration.source(),
            migration.destination(),
            migration.status
        );
        self.events.notify(&migration).await;

        if migration.status == MigrationStatus::Scheduled {
            self.scheduler.track(&migration).await;
        } else {
            self.supervisor.dispatch(migration.clone()).await?;
        }
        Ok(migration)
    }

    pub async fn get(&self, id: &str) -> Result<Migration> {
        self.state
            .get(id)
            .await?
            .ok_or_else(|| MigrateError::NotFound(id.to_string()))
    }

    pub async fn list(&self, status: Option<MigrationStatus>) -> Result<Vec<Migration>> {
        self.state.list(status).await
    }

    pub async fn logs(&self, id: &str, limit: usize) -> Result<Vec<LogEntry>> {
        self.get(id).await?;
        self.state.list_logs(id, limit).await
    }

    /// Reconciliation report of a migration.
    pub async fn report(&self, id: &str) -> Result<ReconciliationReport> {
        self.get(id).await?;
        self.state
            .load_report(id)
            .await?
            .ok_or_else(|| MigrateError::NotFound(format!("reconciliation report for {}", id)))
    }

    /// Cancel a `scheduled`, `starting` or `running` migration.
    pub async fn cancel(&self, id: &str) -> Result<Migration> {
        // The status can move between the read and the conditional update
        // (a timer promoting the job); one retry picks the other route.
        for _ in 0..2 {
            let current = self.get(id).await?;
            let outcome = match current.status {
                MigrationStatus::Scheduled => self.scheduler.cancel(id).await,
                MigrationStatus::Starting | MigrationStatus::Running => {
                    self.supervisor.cancel(id).await
                }
                status => return Err(MigrateError::transition(id, "cancel", status)),
            };
            match outcome {
                Err(MigrateError::InvalidTransition { .. }) => {
                    debug!("Migration {} changed status during cancel, retrying", id);
                }
                other => return other,
            }
        }
        let current = self.get(id).await?;
        Err(MigrateError::transition(id, "cancel", current.status))
    }

    /// Move a `scheduled` migration to a new time.
    pub async fn reschedule(&self, id: &str, time: DateTime<Utc>) -> Result<Migration> {
        self.scheduler.reschedule(id, time).await
    }

    /// Fail in-flight migrations orphaned by a previous process.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        recover_stale(
            self.state.as_ref(),
            self.inventory.as_ref(),
            self.events.as_ref(),
            self.config.transfer.staleness_window(),
            now(),
        )
        .await
    }

    /// Poll the repository until a migration stops moving.
    ///
    /// Returns once the status is terminal, or `completed` with no local
    /// supervisor left (reconciliation disabled or failed).
    pub async fn wait_for_settled(&self, id: &str, poll: Duration) -> Result<Migration> {
        loop {
            let current = self.get(id).await?;
            let settled = current.status.is_terminal()
                || (current.status == MigrationStatus::Completed
                    && !self.supervisor.is_active(id).await);
            if settled {
                return Ok(current);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(MigrateError::Cancelled),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Run the daemon: restart recovery, then the scheduler until shutdown.
    ///
    /// On shutdown, running transfers are interrupted and given
    /// `shutdown_timeout` to wind down.
    pub async fn run(&self, shutdown_timeout: Duration) -> Result<()> {
        let recovery = self.recover().await?;
        info!(
            "Daemon starting ({} backend): {} orphaned migration(s) failed, {} in flight",
            self.state.backend_type(),
            recovery.recovered.len(),
            recovery.in_flight
        );

        self.scheduler.run(self.shutdown.clone()).await;

        if !self.supervisor.shutdown(shutdown_timeout).await {
            warn!("Transfers did not stop within {:?}", shutdown_timeout);
        }
        info!("Daemon stopped");
        Ok(())
    }

    /// Stop the daemon loop and all transfers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
