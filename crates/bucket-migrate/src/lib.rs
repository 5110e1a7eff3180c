//! # bucket-migrate
//!
//! Lifecycle engine for object-storage bucket migrations.
//!
//! A migration copies one bucket path to another by supervising an external
//! `mirror` process, then independently compares both sides. This library
//! provides:
//!
//! - **Job repository** on SQLite with one active migration per endpoint pair
//! - **Transfer supervision** with live progress, cancellation and a
//!   wall-clock ceiling
//! - **Deferred starts** through in-process timers backed by a database poll
//! - **Streaming reconciliation** that never holds a full listing in memory
//! - **Change notifications** for every persisted status or progress update
//! - **Restart recovery** of migrations orphaned by a previous process
//!
//! ## Example
//!
//! ```rust,no_run
//! use bucket_migrate::{Config, Orchestrator, SubmitRequest};
//!
//! #[tokio::main]
//! async fn main() -> bucket_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::connect(config).await?;
//!     let migration = orchestrator
//!         .submit(SubmitRequest::new("old/photos", "new/photos"))
//!         .await?;
//!     println!("Started migration {}", migration.id);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod reconcile;
pub mod scheduler;
pub mod state;
pub mod transfer;

// Re-exports for convenient access
pub use config::Config;
pub use error::{MigrateError, Result};
pub use events::{EventBus, MigrationEvent, NotificationSink, Subscription};
pub use orchestrator::{Orchestrator, RecoveryReport, SubmitRequest};
pub use reconcile::{ReconcileEngine, ReconciliationReport};
pub use scheduler::{Scheduler, SchedulerStats};
pub use state::{
    Endpoint, LogEntry, Migration, MigrationStatus, SqliteStateBackend, StateBackend,
    TransferOptions,
};
pub use transfer::TransferSupervisor;
