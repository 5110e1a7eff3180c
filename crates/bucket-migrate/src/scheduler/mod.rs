//! Activation of deferred migrations.
//!
//! Two paths promote a `scheduled` migration once its time has come:
//!
//! - A one-shot timer, armed for jobs due within the lookahead window
//! - A periodic repository poll, which promotes every due job without a live
//!   timer and arms timers for jobs that came within the lookahead window
//!
//! Timers are lost on restart; the poll rebuilds coverage from the
//! repository. Both paths promote through the same conditional
//! `scheduled → starting` update, so a race has exactly one winner.

use crate::config::SchedulerConfig;
use crate::error::{MigrateError, Result};
use crate::events::NotificationSink;
use crate::state::{now, ExecutionStatus, Migration, MigrationStatus, StateBackend};
use crate::transfer::MigrationDispatcher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Scheduler counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    /// Migrations currently in `scheduled`.
    pub scheduled_jobs: u64,
    /// Live one-shot timers.
    pub armed_timers: usize,
    /// Promotions won by this scheduler.
    pub promotions_total: u64,
    /// Completed poll passes.
    pub poll_runs: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
}

struct ArmedTimer {
    generation: u64,
    due: DateTime<Utc>,
    handle: JoinHandle<()>,
}

struct SchedulerInner {
    state: Arc<dyn StateBackend>,
    dispatcher: Arc<dyn MigrationDispatcher>,
    events: Arc<dyn NotificationSink>,
    config: SchedulerConfig,
    timers: Mutex<HashMap<String, ArmedTimer>>,
    next_generation: AtomicU64,
    promotions: AtomicU64,
    poll_runs: AtomicU64,
    last_poll_at: Mutex<Option<DateTime<Utc>>>,
}

/// Timer plus poll scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        state: Arc<dyn StateBackend>,
        dispatcher: Arc<dyn MigrationDispatcher>,
        events: Arc<dyn NotificationSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state,
                dispatcher,
                events,
                config,
                timers: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                promotions: AtomicU64::new(0),
                poll_runs: AtomicU64::new(0),
                last_poll_at: Mutex::new(None),
            }),
        }
    }

    /// Arm a timer for a freshly created `scheduled` migration if it is due
    /// within the lookahead window. Later jobs are left to the poll.
    pub async fn track(&self, migration: &Migration) {
        if migration.status != MigrationStatus::Scheduled {
            return;
        }
        if let Some(due) = migration.scheduled_time {
            if due <= now() + self.inner.config.lookahead() {
                self.arm(&migration.id, due).await;
            }
        }
    }

    /// Set the activation time of a `scheduled` migration and arm it.
    pub async fn schedule(&self, id: &str, time: DateTime<Utc>) -> Result<Migration> {
        self.set_time(id, time, "schedule").await
    }

    /// Move a `scheduled` migration to a new time. Any existing timer is
    /// cancelled first.
    pub async fn reschedule(&self, id: &str, time: DateTime<Utc>) -> Result<Migration> {
        self.set_time(id, time, "reschedule").await
    }

    async fn set_time(&self, id: &str, time: DateTime<Utc>, action: &str) -> Result<Migration> {
        self.disarm(id).await;
        let updated = self
            .inner
            .state
            .update(id, &[MigrationStatus::Scheduled], &|m| {
                m.scheduled_time = Some(time);
            })
            .await?;
        let migration = self.require(id, updated, action).await?;

        info!("Migration {} scheduled for {}", id, time);
        self.track(&migration).await;
        self.inner.events.notify(&migration).await;
        Ok(migration)
    }

    /// Cancel a `scheduled` migration without ever starting it.
    pub async fn cancel(&self, id: &str) -> Result<Migration> {
        self.disarm(id).await;
        let end = now();
        let updated = self
            .inner
            .state
            .update(id, &[MigrationStatus::Scheduled], &|m| {
                m.status = MigrationStatus::Cancelled;
                m.execution_status = ExecutionStatus::Finished;
                m.scheduled_time = None;
                m.end_time = Some(end);
            })
            .await?;
        let migration = self.require(id, updated, "cancel").await?;

        info!("Scheduled migration {} cancelled", id);
        self.inner.events.notify(&migration).await;
        Ok(migration)
    }

    /// Scheduled migrations, earliest first.
    pub async fn list_scheduled(&self) -> Result<Vec<Migration>> {
        self.inner.state.list_scheduled(None).await
    }

    pub async fn stats(&self) -> Result<SchedulerStats> {
        let scheduled_jobs = self.inner.state.count(MigrationStatus::Scheduled).await?;
        let armed_timers = self
            .inner
            .timers
            .lock()
            .await
            .values()
            .filter(|t| !t.handle.is_finished())
            .count();
        Ok(SchedulerStats {
            scheduled_jobs,
            armed_timers,
            promotions_total: self.inner.promotions.load(Ordering::Relaxed),
            poll_runs: self.inner.poll_runs.load(Ordering::Relaxed),
            last_poll_at: *self.inner.last_poll_at.lock().await,
        })
    }

    /// Poll until `shutdown` fires. The first pass runs immediately.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Scheduler started (poll every {:?}, lookahead {}s)",
            self.inner.config.poll_interval(),
            self.inner.config.lookahead_secs
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!("Scheduler poll failed: {}", e);
                    }
                }
            }
        }

        self.disarm_all().await;
        info!("Scheduler stopped");
    }

    /// One poll pass. Returns the number of promotions won.
    pub async fn poll_once(&self) -> Result<usize> {
        let poll_time = now();
        let horizon = poll_time + self.inner.config.lookahead();
        let upcoming = self.inner.state.list_scheduled(Some(horizon)).await?;

        let mut promoted = 0;
        for migration in upcoming {
            if self.has_live_timer(&migration.id).await {
                continue;
            }
            let Some(due) = migration.scheduled_time else {
                continue;
            };
            if due <= poll_time {
                if self.promote(&migration.id).await?.is_some() {
                    promoted += 1;
                }
            } else {
                self.arm(&migration.id, due).await;
            }
        }

        self.inner.poll_runs.fetch_add(1, Ordering::Relaxed);
        *self.inner.last_poll_at.lock().await = Some(poll_time);
        if promoted > 0 {
            debug!("Poll promoted {} migration(s)", promoted);
        }
        Ok(promoted)
    }

    /// Promote one migration if it is still `scheduled`.
    ///
    /// Returns the promoted record, or `None` when another path won.
    pub async fn promote(&self, id: &str) -> Result<Option<Migration>> {
        let started = now();
        let promoted = self
            .inner
            .state
            .update(id, &[MigrationStatus::Scheduled], &|m| {
                m.status = MigrationStatus::Starting;
                m.execution_status = ExecutionStatus::Executing;
                m.scheduled_time = None;
                m.start_time = Some(started);
            })
            .await?;

        let Some(migration) = promoted else {
            debug!("Migration {} was already promoted or cancelled", id);
            return Ok(None);
        };

        self.inner.promotions.fetch_add(1, Ordering::Relaxed);
        info!("Migration {} promoted to starting", id);
        self.inner.events.notify(&migration).await;
        self.inner.dispatcher.dispatch(migration.clone()).await?;
        Ok(Some(migration))
    }

    async fn arm(&self, id: &str, due: DateTime<Utc>) {
        let delay = (due - now()).to_std().unwrap_or(Duration::ZERO);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        // The lock is held while spawning so the timer cannot fire before it
        // is registered.
        let mut timers = self.inner.timers.lock().await;
        let this = self.clone();
        let timer_id = id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut timers = this.inner.timers.lock().await;
                if timers.get(&timer_id).map(|t| t.generation) == Some(generation) {
                    timers.remove(&timer_id);
                }
            }
            if let Err(e) = this.promote(&timer_id).await {
                warn!("Timer promotion of {} failed: {}", timer_id, e);
            }
        });

        if let Some(previous) = timers.insert(
            id.to_string(),
            ArmedTimer {
                generation,
                due,
                handle,
            },
        ) {
            previous.handle.abort();
        }
        debug!("Armed timer for {} (due {}, in {:?})", id, due, delay);
    }

    async fn disarm(&self, id: &str) {
        if let Some(timer) = self.inner.timers.lock().await.remove(id) {
            timer.handle.abort();
            debug!("Disarmed timer for {} (was due {})", id, timer.due);
        }
    }

    async fn disarm_all(&self) {
        let mut timers = self.inner.timers.lock().await;
        for (_, timer) in timers.drain() {
            timer.handle.abort();
        }
    }

    async fn has_live_timer(&self, id: &str) -> bool {
        let mut timers = self.inner.timers.lock().await;
        match timers.get(id) {
            Some(timer) if !timer.handle.is_finished() => true,
            Some(_) => {
                timers.remove(id);
                false
            }
            None => false,
        }
    }

    /// Turn a rejected conditional update into the matching error.
    async fn require(
        &self,
        id: &str,
        updated: Option<Migration>,
        action: &str,
    ) -> Result<Migration> {
        match updated {
            Some(m) => Ok(m),
            None => {
                let current = self
                    .inner
                    .state
                    .get(id)
                    .await?
                    .ok_or_else(|| MigrateError::NotFound(id.to_string()))?;
                Err(MigrateError::transition(id, action, current.status))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::state::{Endpoint, Endpoints, SqliteStateBackend, TransferOptions};
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingDispatcher {
        dispatched: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingDispatcher {
        fn ids(&self) -> Vec<String> {
            self.dispatched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MigrationDispatcher for RecordingDispatcher {
        async fn dispatch(&self, migration: Migration) -> Result<()> {
            self.dispatched.lock().unwrap().push(migration.id);
            Ok(())
        }
    }

    struct Fixture {
        backend: Arc<SqliteStateBackend>,
        dispatcher: Arc<RecordingDispatcher>,
        scheduler: Scheduler,
    }

    async fn fixture(poll_interval_secs: u64, lookahead_secs: u64) -> Fixture {
        let backend = Arc::new(SqliteStateBackend::in_memory().await.unwrap());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let scheduler = Scheduler::new(
            backend.clone(),
            dispatcher.clone(),
            Arc::new(EventBus::new(64)),
            SchedulerConfig {
                poll_interval_secs,
                lookahead_secs,
            },
        );
        Fixture {
            backend,
            dispatcher,
            scheduler,
        }
    }

    /// Insert a `scheduled` migration due at `due` (which may be in the past).
    async fn scheduled_at(backend: &SqliteStateBackend, pair: usize, due: DateTime<Utc>) -> Migration {
        let mut migration = Migration::new(
            Endpoints {
                source: Endpoint::parse(&format!("a/bucket{}", pair)),
                destination: Endpoint::parse(&format!("b/bucket{}", pair)),
            },
            TransferOptions::default(),
            Some(now() + chrono::Duration::hours(1)),
            now(),
        );
        migration.scheduled_time = Some(due);
        backend.insert(&migration).await.unwrap();
        migration
    }

    async fn wait_for_status(
        backend: &SqliteStateBackend,
        id: &str,
        status: MigrationStatus,
        within: Duration,
    ) -> Migration {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let current = backend.get(id).await.unwrap().unwrap();
            if current.status == status || tokio::time::Instant::now() >= deadline {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_timer_promotes_near_term_job() {
        let f = fixture(60, 300).await;
        let migration =
            scheduled_at(&f.backend, 1, now() + chrono::Duration::milliseconds(300)).await;
        f.scheduler.track(&migration).await;
        assert_eq!(f.scheduler.stats().await.unwrap().armed_timers, 1);

        let promoted = wait_for_status(
            &f.backend,
            &migration.id,
            MigrationStatus::Starting,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(promoted.status, MigrationStatus::Starting);
        assert_eq!(promoted.execution_status, ExecutionStatus::Executing);
        assert!(promoted.scheduled_time.is_none());
        assert!(promoted.start_time.unwrap() >= migration.scheduled_time.unwrap());
        assert_eq!(f.dispatcher.ids(), vec![migration.id.clone()]);
    }

    #[tokio::test]
    async fn test_poll_promotes_due_jobs_once() {
        let f = fixture(60, 300).await;
        let due = scheduled_at(&f.backend, 1, now() - chrono::Duration::seconds(5)).await;
        let later = scheduled_at(&f.backend, 2, now() + chrono::Duration::hours(2)).await;

        assert_eq!(f.scheduler.poll_once().await.unwrap(), 1);
        assert_eq!(f.scheduler.poll_once().await.unwrap(), 0);

        assert_eq!(f.dispatcher.ids(), vec![due.id.clone()]);
        let later = f.backend.get(&later.id).await.unwrap().unwrap();
        assert_eq!(later.status, MigrationStatus::Scheduled);

        let stats = f.scheduler.stats().await.unwrap();
        assert_eq!(stats.scheduled_jobs, 1);
        assert_eq!(stats.promotions_total, 1);
        assert_eq!(stats.poll_runs, 2);
        assert_eq!(stats.armed_timers, 0);
        assert!(stats.last_poll_at.is_some());
    }

    #[tokio::test]
    async fn test_poll_and_timer_race_has_one_winner() {
        let f = fixture(60, 300).await;
        let migration = scheduled_at(&f.backend, 1, now() - chrono::Duration::seconds(1)).await;

        let mut attempts = Vec::new();
        for i in 0..8 {
            let scheduler = f.scheduler.clone();
            let id = migration.id.clone();
            attempts.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    scheduler.promote(&id).await.unwrap().is_some() as usize
                } else {
                    scheduler.poll_once().await.unwrap()
                }
            }));
        }

        let mut wins = 0;
        for attempt in attempts {
            wins += attempt.await.unwrap();
        }
        assert_eq!(wins, 1);
        assert_eq!(f.dispatcher.ids().len(), 1);
    }

    #[tokio::test]
    async fn test_poll_arms_jobs_entering_lookahead() {
        let f = fixture(60, 300).await;
        let migration =
            scheduled_at(&f.backend, 1, now() + chrono::Duration::milliseconds(400)).await;

        assert_eq!(f.scheduler.poll_once().await.unwrap(), 0);
        assert_eq!(f.scheduler.stats().await.unwrap().armed_timers, 1);

        let promoted = wait_for_status(
            &f.backend,
            &migration.id,
            MigrationStatus::Starting,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(promoted.status, MigrationStatus::Starting);
        assert_eq!(f.dispatcher.ids().len(), 1);
    }

    #[tokio::test]
    async fn test_run_loop_promotes_within_poll_interval() {
        let f = fixture(1, 1).await;
        // Far enough out that no timer exists, as after a restart.
        let migration = scheduled_at(&f.backend, 1, now() + chrono::Duration::seconds(2)).await;

        let shutdown = CancellationToken::new();
        let runner = {
            let scheduler = f.scheduler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };

        let promoted = wait_for_status(
            &f.backend,
            &migration.id,
            MigrationStatus::Starting,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(promoted.status, MigrationStatus::Starting);
        let due = migration.scheduled_time.unwrap();
        let started = promoted.start_time.unwrap();
        assert!(started >= due);
        assert!(started - due <= chrono::Duration::seconds(1) + chrono::Duration::milliseconds(500));

        shutdown.cancel();
        runner.await.unwrap();
        assert_eq!(f.dispatcher.ids().len(), 1);
    }

    #[tokio::test]
    async fn test_reschedule_moves_timer() {
        let f = fixture(60, 300).await;
        let migration =
            scheduled_at(&f.backend, 1, now() + chrono::Duration::milliseconds(300)).await;
        f.scheduler.track(&migration).await;

        let later = now() + chrono::Duration::hours(1);
        let updated = f.scheduler.reschedule(&migration.id, later).await.unwrap();
        assert_eq!(updated.scheduled_time, Some(later));
        assert_eq!(f.scheduler.stats().await.unwrap().armed_timers, 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let current = f.backend.get(&migration.id).await.unwrap().unwrap();
        assert_eq!(current.status, MigrationStatus::Scheduled);
        assert!(f.dispatcher.ids().is_empty());

        // Back into the window: armed again.
        let soon = now() + chrono::Duration::milliseconds(200);
        f.scheduler.reschedule(&migration.id, soon).await.unwrap();
        let promoted = wait_for_status(
            &f.backend,
            &migration.id,
            MigrationStatus::Starting,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(promoted.status, MigrationStatus::Starting);

        let err = f.scheduler.reschedule(&migration.id, later).await.unwrap_err();
        assert!(matches!(err, MigrateError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_cancel_scheduled_job() {
        let f = fixture(60, 300).await;
        let migration =
            scheduled_at(&f.backend, 1, now() + chrono::Duration::milliseconds(300)).await;
        f.scheduler.track(&migration).await;

        let cancelled = f.scheduler.cancel(&migration.id).await.unwrap();
        assert_eq!(cancelled.status, MigrationStatus::Cancelled);
        assert!(cancelled.scheduled_time.is_none());
        let stored = f.backend.get(&migration.id).await.unwrap().unwrap();
        assert!(stored.scheduled_time.is_none());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(f.dispatcher.ids().is_empty());
        assert_eq!(f.scheduler.poll_once().await.unwrap(), 0);

        let err = f.scheduler.cancel(&migration.id).await.unwrap_err();
        assert!(matches!(err, MigrateError::InvalidTransition { .. }));
        let err = f.scheduler.cancel("missing").await.unwrap_err();
        assert!(matches!(err, MigrateError::NotFound(_)));
    }
}
