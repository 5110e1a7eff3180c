//! Transfer supervision.
//!
//! One supervising task per running migration:
//! - Spawns `<program> mirror <flags> <source> <destination>`
//! - Merges stdout and stderr into one line stream and classifies each line
//! - Persists stat/progress refinements through conditional updates
//! - Finishes in `completed` (then hands off to reconciliation) or `failed`
//!
//! Cancellation flips the status first and then signals the child: SIGTERM,
//! a grace period, then a kill.

pub mod command;
pub mod parser;

use crate::config::TransferConfig;
use crate::error::{MigrateError, Result};
use crate::events::NotificationSink;
use crate::reconcile::ReconcileEngine;
use crate::state::{
    now, ExecutionStatus, LogLevel, Migration, MigrationStats, MigrationStatus, StateBackend,
};
use async_trait::async_trait;
use parser::{LineClass, ProgressTracker};
use std::collections::{HashMap, VecDeque};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

/// How often a running transfer re-reads its status, so cancellations made
/// by another process are noticed while the tool is silent.
const STATUS_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Hands a migration in `starting` over for execution.
#[async_trait]
pub trait MigrationDispatcher: Send + Sync {
    async fn dispatch(&self, migration: Migration) -> Result<()>;
}

/// How the supervised process ended.
#[derive(Debug)]
enum Outcome {
    Exited(ExitStatus),
    Cancelled,
    Shutdown,
    TimedOut,
    /// Supervision itself broke (repository or wait failure).
    Broken(MigrateError),
}

struct SupervisorInner {
    state: Arc<dyn StateBackend>,
    events: Arc<dyn NotificationSink>,
    reconciler: Option<Arc<ReconcileEngine>>,
    config: TransferConfig,
    /// Cancellation handle per supervised migration.
    active: Mutex<HashMap<String, CancellationToken>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// Supervisor of external transfer processes.
#[derive(Clone)]
pub struct TransferSupervisor {
    inner: Arc<SupervisorInner>,
}

impl TransferSupervisor {
    /// Create a supervisor. Pass a reconciliation engine to reconcile every
    /// successful transfer; `None` leaves them at `completed`.
    pub fn new(
        state: Arc<dyn StateBackend>,
        events: Arc<dyn NotificationSink>,
        reconciler: Option<Arc<ReconcileEngine>>,
        config: TransferConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                state,
                events,
                reconciler,
                config,
                active: Mutex::new(HashMap::new()),
                tasks: TaskTracker::new(),
                shutdown,
            }),
        }
    }

    /// Start supervising a migration in the background.
    ///
    /// Returns `None` if the migration is already supervised.
    pub async fn launch(&self, migration: Migration) -> Option<JoinHandle<()>> {
        let id = migration.id.clone();
        let token = CancellationToken::new();
        {
            let mut active = self.inner.active.lock().await;
            if active.contains_key(&id) {
                warn!("Migration {} is already being supervised", id);
                return None;
            }
            active.insert(id.clone(), token.clone());
        }

        let this = self.clone();
        Some(self.inner.tasks.spawn(async move {
            if let Err(e) = this.supervise(migration, token).await {
                error!("Supervisor for migration {} failed: {}", id, e);
            }
            this.inner.active.lock().await.remove(&id);
        }))
    }

    /// Cancel a migration in `starting` or `running`.
    ///
    /// The status flips to `cancelled` before the child is signalled.
    pub async fn cancel(&self, id: &str) -> Result<Migration> {
        let end = now();
        let updated = self
            .inner
            .state
            .update(
                id,
                &[MigrationStatus::Starting, MigrationStatus::Running],
                &|m| {
                    m.status = MigrationStatus::Cancelled;
                    m.execution_status = ExecutionStatus::Finished;
                    finish_times(m, end);
                },
            )
            .await?;

        let Some(migration) = updated else {
            let current = self
                .inner
                .state
                .get(id)
                .await?
                .ok_or_else(|| MigrateError::NotFound(id.to_string()))?;
            return Err(MigrateError::transition(id, "cancel", current.status));
        };

        if let Some(token) = self.inner.active.lock().await.get(id) {
            token.cancel();
        }
        self.log(id, LogLevel::Info, "Transfer cancelled by request").await;
        info!("Migration {} cancelled", id);
        self.inner.events.notify(&migration).await;
        Ok(migration)
    }

    /// Whether a migration has a live supervising task.
    pub async fn is_active(&self, id: &str) -> bool {
        self.inner.active.lock().await.contains_key(id)
    }

    /// Number of live supervising tasks.
    pub async fn active_count(&self) -> usize {
        self.inner.active.lock().await.len()
    }

    /// Stop all transfers and wait for their tasks.
    ///
    /// Running transfers are terminated and marked failed. Returns `false` if
    /// the tasks did not finish within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        let finished = tokio::time::timeout(timeout, self.inner.tasks.wait())
            .await
            .is_ok();
        if !finished {
            warn!(
                "{} transfer task(s) still running after {:?}",
                self.inner.tasks.len(),
                timeout
            );
        }
        finished
    }

    /// Run one migration to its end.
    async fn supervise(&self, migration: Migration, cancel: CancellationToken) -> Result<()> {
        let id = migration.id.clone();
        let config = &self.inner.config;
        let args = command::mirror_args(
            &migration.options,
            migration.source(),
            migration.destination(),
        );
        let rendered = command::display_command(&config.program, &args);
        info!("Starting transfer {}: {}", id, rendered);
        self.log(&id, LogLevel::Info, &format!("Running {}", rendered)).await;

        let spawned = Command::new(&config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let message = format!(
                    "Failed to spawn transfer tool '{}': {}",
                    config.program, e
                );
                self.fail(&id, message).await?;
                return Ok(());
            }
        };

        let started = now();
        let running = self
            .inner
            .state
            .update(&id, &[MigrationStatus::Starting], &|m| {
                m.status = MigrationStatus::Running;
                m.execution_status = ExecutionStatus::Executing;
                if m.start_time.is_none() {
                    m.start_time = Some(started);
                }
            })
            .await;
        let running = match running {
            Ok(running) => running,
            Err(e) => {
                terminate(&mut child, config.terminate_grace()).await;
                self.fail_after_error(&id, &e).await;
                return Err(e);
            }
        };
        let Some(running) = running else {
            debug!("Migration {} left 'starting' before the tool ran", id);
            terminate(&mut child, config.terminate_grace()).await;
            return Ok(());
        };
        self.inner.events.notify(&running).await;

        let (tx, mut rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, tx.clone());
        }
        drop(tx);

        let mut tracker = ProgressTracker::resume(running.stats, running.progress);
        let mut tail: VecDeque<String> = VecDeque::with_capacity(config.diagnostic_tail_lines);
        let deadline = tokio::time::sleep(config.max_duration());
        tokio::pin!(deadline);
        let mut status_check = tokio::time::interval(STATUS_CHECK_INTERVAL);
        status_check.reset();
        let mut streams_open = true;

        let outcome = loop {
            tokio::select! {
                line = rx.recv(), if streams_open => match line {
                    Some(line) => match parser::classify(&line) {
                        LineClass::Report(report) => {
                            tracker.apply(&report);
                            let stats = tracker.stats();
                            let progress = tracker.progress();
                            let updated = self
                                .inner
                                .state
                                .update(&id, &[MigrationStatus::Running], &|m| {
                                    m.stats.refine(&stats);
                                    m.progress = m.progress.max(progress);
                                })
                                .await;
                            match updated {
                                Ok(Some(m)) => self.inner.events.notify(&m).await,
                                Ok(None) => break Outcome::Cancelled,
                                Err(e) => break Outcome::Broken(e),
                            }
                        }
                        LineClass::Diagnostic(text) => {
                            if tail.len() == config.diagnostic_tail_lines {
                                tail.pop_front();
                            }
                            if config.diagnostic_tail_lines > 0 {
                                tail.push_back(text.clone());
                            }
                            self.log(&id, LogLevel::Warn, &text).await;
                        }
                        LineClass::Unclassified => trace!("[{}] {}", id, line),
                    },
                    None => streams_open = false,
                },
                status = child.wait(), if !streams_open => match status {
                    Ok(status) => break Outcome::Exited(status),
                    Err(e) => break Outcome::Broken(e.into()),
                },
                _ = cancel.cancelled() => break Outcome::Cancelled,
                _ = self.inner.shutdown.cancelled() => break Outcome::Shutdown,
                _ = &mut deadline => break Outcome::TimedOut,
                _ = status_check.tick() => match self.inner.state.get(&id).await {
                    Ok(current) => {
                        if current.map(|m| m.status) != Some(MigrationStatus::Running) {
                            break Outcome::Cancelled;
                        }
                    }
                    Err(e) => break Outcome::Broken(e),
                },
            }
        };

        match outcome {
            Outcome::Exited(status) if status.success() => {
                self.complete(&id, tracker.stats()).await?;
            }
            Outcome::Exited(status) => {
                let mut message = format!("Transfer tool {}", describe_exit(&status));
                if !tail.is_empty() {
                    let lines: Vec<_> = tail.into_iter().collect();
                    message.push_str(": ");
                    message.push_str(&lines.join("; "));
                }
                self.fail(&id, message).await?;
            }
            Outcome::Cancelled => {
                terminate(&mut child, config.terminate_grace()).await;
                info!("Transfer {} stopped after cancellation", id);
            }
            Outcome::Shutdown => {
                terminate(&mut child, config.terminate_grace()).await;
                self.fail(&id, "Transfer interrupted by shutdown".to_string())
                    .await?;
            }
            Outcome::TimedOut => {
                terminate(&mut child, config.terminate_grace()).await;
                let message = format!(
                    "Transfer exceeded the maximum duration of {}s",
                    config.max_duration_secs
                );
                self.fail(&id, message).await?;
            }
            Outcome::Broken(e) => {
                terminate(&mut child, config.terminate_grace()).await;
                self.fail_after_error(&id, &e).await;
                return Err(e);
            }
        }

        Ok(())
    }

    /// Best-effort failure record after supervision itself broke.
    async fn fail_after_error(&self, id: &str, cause: &MigrateError) {
        let message = format!("Transfer supervision failed: {}", cause);
        if let Err(e) = self.fail(id, message).await {
            error!("Could not record failure of migration {}: {}", id, e);
        }
    }

    /// Mark a successful transfer and start reconciliation.
    async fn complete(&self, id: &str, stats: MigrationStats) -> Result<()> {
        let end = now();
        let completed = self
            .inner
            .state
            .update(id, &[MigrationStatus::Running], &|m| {
                m.status = MigrationStatus::Completed;
                m.execution_status = ExecutionStatus::Finished;
                m.progress = 100;
                m.stats.refine(&stats);
                finish_times(m, end);
            })
            .await?;
        let Some(completed) = completed else {
            debug!("Migration {} changed status before completion was recorded", id);
            return Ok(());
        };

        info!(
            "Transfer {} completed: {} objects, {} bytes in {} ms",
            id,
            completed.stats.transferred_objects,
            completed.stats.transferred_size,
            completed.duration_ms.unwrap_or(0)
        );
        self.log(id, LogLevel::Info, "Transfer completed").await;
        self.inner.events.notify(&completed).await;

        if let Some(reconciler) = &self.inner.reconciler {
            match reconciler.run(id, &self.inner.shutdown).await {
                Ok(_) => {}
                Err(MigrateError::Cancelled) => {
                    info!("Reconciliation of {} interrupted by shutdown", id)
                }
                Err(e) => warn!("Reconciliation of {} could not be recorded: {}", id, e),
            }
        }
        Ok(())
    }

    /// Mark a transfer failed with an explanatory error.
    async fn fail(&self, id: &str, message: String) -> Result<()> {
        error!("Migration {}: {}", id, message);
        self.log(id, LogLevel::Error, &message).await;

        let end = now();
        let failed = self
            .inner
            .state
            .update(
                id,
                &[MigrationStatus::Starting, MigrationStatus::Running],
                &|m| {
                    m.status = MigrationStatus::Failed;
                    m.execution_status = ExecutionStatus::Finished;
                    m.errors.push(message.clone());
                    finish_times(m, end);
                },
            )
            .await?;

        match failed {
            Some(m) => self.inner.events.notify(&m).await,
            None => debug!("Migration {} was no longer in flight, failure not recorded", id),
        }
        Ok(())
    }

    /// Persist a log line; failures only reach the process log.
    async fn log(&self, id: &str, level: LogLevel, message: &str) {
        if let Err(e) = self.inner.state.append_log(id, level, message).await {
            warn!("Failed to record log line for {}: {}", id, e);
        }
    }
}

#[async_trait]
impl MigrationDispatcher for TransferSupervisor {
    async fn dispatch(&self, migration: Migration) -> Result<()> {
        self.launch(migration).await;
        Ok(())
    }
}

/// Stamp `end_time` and the transfer duration.
fn finish_times(m: &mut Migration, end: chrono::DateTime<chrono::Utc>) {
    m.end_time = Some(end);
    m.duration_ms = m
        .start_time
        .map(|start| (end - start).num_milliseconds().max(0));
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // Invalid UTF-8 and similar; the rest of the stream is lost.
                    debug!("Stopped reading transfer output: {}", e);
                    break;
                }
            }
        }
    });
}

fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("was terminated by signal {}", signal);
        }
    }
    "exited abnormally".to_string()
}

/// Ask the child to stop, then kill it after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                    return;
                }
                warn!("Transfer process {} ignored SIGTERM, killing it", pid);
            }
            Err(e) => debug!("SIGTERM to {} failed: {}", pid, e),
        }
    }

    if let Err(e) = child.kill().await {
        debug!("Failed to kill transfer process: {}", e);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ReconcileConfig;
    use crate::events::{EventBus, MigrationEvent};
    use crate::reconcile::inventory::MemoryLister;
    use crate::reconcile::ObjectRecord;
    use crate::state::{Endpoint, Endpoints, SqliteStateBackend, TransferOptions};
    use std::os::unix::fs::PermissionsExt;

    struct Fixture {
        backend: Arc<SqliteStateBackend>,
        events: Arc<EventBus>,
        supervisor: TransferSupervisor,
        _dir: tempfile::TempDir,
    }

    async fn fixture(script: &str, max_duration_secs: u64, reconciler: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("fake-mc");
        std::fs::write(&tool, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = Arc::new(SqliteStateBackend::in_memory().await.unwrap());
        let events = Arc::new(EventBus::new(256));
        let reconciler = reconciler.then(|| {
            let objects = vec![ObjectRecord::new("a.txt", 1, Some("e1"))];
            let lister = MemoryLister::default()
                .with_listing("a/bucket1", objects.clone())
                .with_listing("b/bucket2", objects);
            Arc::new(ReconcileEngine::new(
                backend.clone(),
                backend.clone(),
                Arc::new(lister),
                events.clone(),
                ReconcileConfig::default(),
            ))
        });
        let config = TransferConfig {
            program: tool.to_string_lossy().into_owned(),
            max_duration_secs,
            terminate_grace_secs: 1,
            ..Default::default()
        };
        let supervisor = TransferSupervisor::new(
            backend.clone(),
            events.clone(),
            reconciler,
            config,
            CancellationToken::new(),
        );
        Fixture {
            backend,
            events,
            supervisor,
            _dir: dir,
        }
    }

    async fn starting_migration(backend: &SqliteStateBackend) -> Migration {
        let migration = Migration::new(
            Endpoints {
                source: Endpoint::parse("a/bucket1"),
                destination: Endpoint::parse("b/bucket2"),
            },
            TransferOptions::default(),
            None,
            now(),
        );
        backend.insert(&migration).await.unwrap();
        migration
    }

    async fn run_to_end(f: &Fixture, migration: Migration) -> Migration {
        let id = migration.id.clone();
        let handle = f.supervisor.launch(migration).await.unwrap();
        tokio::time::timeout(Duration::from_secs(20), handle)
            .await
            .unwrap()
            .unwrap();
        f.backend.get(&id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_successful_transfer_completes() {
        let f = fixture(
            "echo '1/4 objects'\necho '2/4 objects'\necho '4/4 objects'\nexit 0",
            60,
            false,
        )
        .await;
        let mut sub = f.events.subscribe();
        let migration = starting_migration(&f.backend).await;

        let done = run_to_end(&f, migration).await;
        assert_eq!(done.status, MigrationStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.execution_status, ExecutionStatus::Finished);
        assert_eq!(done.stats.transferred_objects, 4);
        assert!(done.end_time.is_some());
        assert!(done.duration_ms.is_some());
        assert!(done.reconciliation.is_none());

        let mut progress = Vec::new();
        while let Some(MigrationEvent::MigrationUpdate(update)) = sub.try_recv() {
            progress.push(update.progress);
        }
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
        assert!(progress.contains(&50));
        assert!(progress.iter().filter(|p| **p < 100).all(|p| *p <= 95));
        assert_eq!(progress.last(), Some(&100));
    }

    #[tokio::test]
    async fn test_successful_transfer_is_reconciled() {
        let f = fixture("echo '`a/bucket1/a.txt` -> `b/bucket2/a.txt`'", 60, true).await;
        let migration = starting_migration(&f.backend).await;

        let done = run_to_end(&f, migration).await;
        assert_eq!(done.status, MigrationStatus::Verified);
        let rec = done.reconciliation.unwrap();
        assert!(!rec.summary.differences_found);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_diagnostics() {
        let f = fixture(
            "echo 'mc: <ERROR> Access Denied.' >&2\nexit 3",
            60,
            true,
        )
        .await;
        let migration = starting_migration(&f.backend).await;

        let done = run_to_end(&f, migration).await;
        assert_eq!(done.status, MigrationStatus::Failed);
        assert_eq!(done.errors.len(), 1);
        assert!(done.errors[0].contains("exited with code 3"));
        assert!(done.errors[0].contains("Access Denied"));
        // Failure short-circuits reconciliation.
        assert!(done.reconciliation.is_none());

        let logs = f.backend.list_logs(&done.id, 10).await.unwrap();
        assert!(logs.iter().any(|l| l.level == LogLevel::Warn));
        assert!(logs.iter().any(|l| l.level == LogLevel::Error));
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_failed() {
        let mut f = fixture("exit 0", 60, false).await;
        let config = TransferConfig {
            program: "/nonexistent/fake-mc".to_string(),
            ..Default::default()
        };
        f.supervisor = TransferSupervisor::new(
            f.backend.clone(),
            f.events.clone(),
            None,
            config,
            CancellationToken::new(),
        );
        let migration = starting_migration(&f.backend).await;

        let done = run_to_end(&f, migration).await;
        assert_eq!(done.status, MigrationStatus::Failed);
        assert!(done.errors[0].contains("Failed to spawn"));
    }

    #[tokio::test]
    async fn test_cancel_running_transfer() {
        let f = fixture("echo '1/10 objects'\nexec sleep 30", 60, true).await;
        let migration = starting_migration(&f.backend).await;
        let id = migration.id.clone();
        let handle = f.supervisor.launch(migration).await.unwrap();

        for _ in 0..200 {
            let current = f.backend.get(&id).await.unwrap().unwrap();
            if current.status == MigrationStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let cancelled = f.supervisor.cancel(&id).await.unwrap();
        assert_eq!(cancelled.status, MigrationStatus::Cancelled);

        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        let done = f.backend.get(&id).await.unwrap().unwrap();
        assert_eq!(done.status, MigrationStatus::Cancelled);
        assert!(done.reconciliation.is_none());
        assert!(!f.supervisor.is_active(&id).await);

        // A second cancel is rejected.
        let err = f.supervisor.cancel(&id).await.unwrap_err();
        assert!(matches!(err, MigrateError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_wall_clock_ceiling() {
        let f = fixture("exec sleep 30", 1, false).await;
        let migration = starting_migration(&f.backend).await;

        let done = run_to_end(&f, migration).await;
        assert_eq!(done.status, MigrationStatus::Failed);
        assert!(done.errors[0].contains("maximum duration"));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_transfers() {
        let f = fixture("exec sleep 30", 60, false).await;
        let migration = starting_migration(&f.backend).await;
        let id = migration.id.clone();
        f.supervisor.launch(migration).await.unwrap();

        for _ in 0..200 {
            if f.backend.get(&id).await.unwrap().unwrap().status == MigrationStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        assert!(f.supervisor.shutdown(Duration::from_secs(10)).await);
        let done = f.backend.get(&id).await.unwrap().unwrap();
        assert_eq!(done.status, MigrationStatus::Failed);
        assert!(done.errors[0].contains("shutdown"));
    }

    /// Repository whose progress writes fail; everything else is delegated.
    struct FailingProgressWrites {
        inner: Arc<SqliteStateBackend>,
    }

    #[async_trait]
    impl StateBackend for FailingProgressWrites {
        async fn init_schema(&self) -> Result<()> {
            self.inner.init_schema().await
        }
        async fn insert(&self, migration: &Migration) -> Result<()> {
            self.inner.insert(migration).await
        }
        async fn get(&self, id: &str) -> Result<Option<Migration>> {
            self.inner.get(id).await
        }
        async fn list(&self, status: Option<MigrationStatus>) -> Result<Vec<Migration>> {
            self.inner.list(status).await
        }
        async fn list_scheduled(
            &self,
            until: Option<chrono::DateTime<chrono::Utc>>,
        ) -> Result<Vec<Migration>> {
            self.inner.list_scheduled(until).await
        }
        async fn list_stale(&self, cutoff: chrono::DateTime<chrono::Utc>) -> Result<Vec<Migration>> {
            self.inner.list_stale(cutoff).await
        }
        async fn count(&self, status: MigrationStatus) -> Result<u64> {
            self.inner.count(status).await
        }
        async fn update(
            &self,
            id: &str,
            allowed: &[MigrationStatus],
            mutate: crate::state::backend::Mutation<'_>,
        ) -> Result<Option<Migration>> {
            if allowed == [MigrationStatus::Running] {
                return Err(MigrateError::Repository(sqlx::Error::PoolTimedOut));
            }
            self.inner.update(id, allowed, mutate).await
        }
        async fn append_log(&self, id: &str, level: LogLevel, message: &str) -> Result<()> {
            self.inner.append_log(id, level, message).await
        }
        async fn list_logs(&self, id: &str, limit: usize) -> Result<Vec<crate::state::LogEntry>> {
            self.inner.list_logs(id, limit).await
        }
        async fn save_report(&self, report: &crate::reconcile::ReconciliationReport) -> Result<()> {
            self.inner.save_report(report).await
        }
        async fn load_report(
            &self,
            id: &str,
        ) -> Result<Option<crate::reconcile::ReconciliationReport>> {
            self.inner.load_report(id).await
        }
        fn backend_type(&self) -> &'static str {
            "failing-progress"
        }
    }

    #[tokio::test]
    async fn test_repository_error_fails_and_stops_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("fake-mc");
        std::fs::write(&tool, "#!/bin/sh
echo '1/4 objects'
exec sleep 30
").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let backend = Arc::new(SqliteStateBackend::in_memory().await.unwrap());
        let supervisor = TransferSupervisor::new(
            Arc::new(FailingProgressWrites {
                inner: backend.clone(),
            }),
            Arc::new(EventBus::new(16)),
            None,
            TransferConfig {
                program: tool.to_string_lossy().into_owned(),
                terminate_grace_secs: 1,
                ..Default::default()
            },
            CancellationToken::new(),
        );
        let migration = starting_migration(&backend).await;
        let id = migration.id.clone();

        let handle = supervisor.launch(migration).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();

        let done = backend.get(&id).await.unwrap().unwrap();
        assert_eq!(done.status, MigrationStatus::Failed);
        assert_eq!(done.errors.len(), 1);
        assert!(done.errors[0].starts_with("Transfer supervision failed"));
        assert!(done.end_time.is_some());
        assert!(!supervisor.is_active(&id).await);
    }
}
