//! bucket-migrate CLI - scheduled, supervised and reconciled bucket migrations.

use bucket_migrate::{
    Config, Migration, MigrateError, MigrationStatus, Orchestrator, SubmitRequest,
    TransferOptions,
};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "bucket-migrate")]
#[command(about = "Scheduled, supervised and reconciled object-storage bucket migrations")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON results to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Timeout in seconds for graceful shutdown (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and recovery until interrupted
    Daemon,

    /// Submit a new migration
    Submit {
        /// Source endpoint (alias/bucket[/prefix])
        source: String,

        /// Destination endpoint (alias/bucket[/prefix])
        destination: String,

        #[command(flatten)]
        options: OptionArgs,

        #[command(flatten)]
        when: WhenArgs,

        /// Keep running until a scheduled migration has finished
        #[arg(long)]
        wait: bool,
    },

    /// List migrations
    List {
        /// Only show migrations in this status
        #[arg(long)]
        status: Option<MigrationStatus>,
    },

    /// Show one migration
    Show {
        /// Migration id
        id: String,
    },

    /// Show the log lines of a migration
    Logs {
        /// Migration id
        id: String,

        /// Number of most recent lines to show
        #[arg(long, default_value = "100")]
        limit: usize,
    },

    /// Show the reconciliation report of a migration
    Report {
        /// Migration id
        id: String,
    },

    /// Cancel a scheduled or running migration
    Cancel {
        /// Migration id
        id: String,
    },

    /// Move a scheduled migration to a new time
    Reschedule {
        /// Migration id
        id: String,

        #[command(flatten)]
        when: WhenArgs,
    },

    /// List scheduled migrations and scheduler counters
    Scheduled,

    /// Fail in-flight migrations left behind by a previous process
    Recover,
}

#[derive(Args)]
struct OptionArgs {
    /// Overwrite objects that differ at the destination
    #[arg(long)]
    overwrite: bool,

    /// Remove destination objects absent from the source
    #[arg(long)]
    remove: bool,

    /// Exclude objects matching this pattern (repeatable)
    #[arg(long)]
    exclude: Vec<String>,

    /// Checksum algorithm used for integrity checks
    #[arg(long)]
    checksum: Option<String>,

    /// Preserve object attributes
    #[arg(long)]
    preserve: bool,

    /// Retry failed objects
    #[arg(long)]
    retry: bool,

    /// Simulate the transfer without copying data
    #[arg(long)]
    dry_run: bool,

    /// Keep mirroring new changes
    #[arg(long)]
    watch: bool,
}

impl From<OptionArgs> for TransferOptions {
    fn from(args: OptionArgs) -> Self {
        TransferOptions {
            overwrite: args.overwrite,
            remove: args.remove,
            exclude: args.exclude,
            checksum: args.checksum,
            preserve: args.preserve,
            retry: args.retry,
            dry_run: args.dry_run,
            watch: args.watch,
        }
    }
}

#[derive(Args)]
struct WhenArgs {
    /// Start at this RFC 3339 instant (e.g. 2026-01-31T22:00:00Z)
    #[arg(long, value_parser = parse_instant, conflicts_with = "delay")]
    at: Option<DateTime<Utc>>,

    /// Start after this delay (e.g. 90s, 2h 30m)
    #[arg(long, value_parser = parse_delay)]
    delay: Option<chrono::Duration>,
}

impl WhenArgs {
    fn resolve(&self) -> Option<DateTime<Utc>> {
        self.at.or_else(|| self.delay.map(|d| Utc::now() + d))
    }
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid instant '{}': {}", value, e))
}

fn parse_delay(value: &str) -> Result<chrono::Duration, String> {
    let delay = humantime::parse_duration(value).map_err(|e| e.to_string())?;
    chrono::Duration::from_std(delay).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    let orchestrator = Orchestrator::connect(config).await?;
    let shutdown_timeout = Duration::from_secs(cli.shutdown_timeout);

    match cli.command {
        Commands::Daemon => {
            setup_signal_handler(orchestrator.shutdown_token(), cli.shutdown_timeout);
            orchestrator.run(shutdown_timeout).await?;
        }

        Commands::Submit {
            source,
            destination,
            options,
            when,
            wait,
        } => {
            let mut request =
                SubmitRequest::new(&source, &destination).with_options(options.into());
            if let Some(time) = when.resolve() {
                request = request.scheduled_at(time);
            }

            let migration = orchestrator.submit(request).await?;
            if migration.status == MigrationStatus::Scheduled && !wait {
                print_migration(&migration, cli.output_json)?;
                return Ok(());
            }

            // Foreground: drive the migration here until it settles.
            let shutdown = orchestrator.shutdown_token();
            setup_signal_handler(shutdown.clone(), cli.shutdown_timeout);
            let scheduler = if migration.status == MigrationStatus::Scheduled {
                info!(
                    "Waiting for migration {} scheduled at {}",
                    migration.id,
                    migration
                        .scheduled_time
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default()
                );
                let scheduler = orchestrator.scheduler().clone();
                let token = shutdown.clone();
                Some(tokio::spawn(async move { scheduler.run(token).await }))
            } else {
                None
            };

            let settled = orchestrator
                .wait_for_settled(&migration.id, Duration::from_millis(500))
                .await;

            if !orchestrator.supervisor().shutdown(shutdown_timeout).await {
                warn!("Transfers did not stop within {:?}", shutdown_timeout);
            }
            if let Some(handle) = scheduler {
                let _ = handle.await;
            }

            let migration = match settled {
                Ok(migration) => migration,
                Err(MigrateError::Cancelled) => {
                    let migration = orchestrator.get(&migration.id).await?;
                    print_migration(&migration, cli.output_json)?;
                    return Err(MigrateError::Cancelled);
                }
                Err(e) => return Err(e),
            };
            print_migration(&migration, cli.output_json)?;
            if migration.status == MigrationStatus::Failed {
                return Err(MigrateError::Process(
                    migration
                        .errors
                        .last()
                        .cloned()
                        .unwrap_or_else(|| "migration failed".to_string()),
                ));
            }
        }

        Commands::List { status } => {
            let migrations = orchestrator.list(status).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&migrations)?);
            } else if migrations.is_empty() {
                println!("No migrations");
            } else {
                println!(
                    "{:<36}  {:<26}  {:>4}  {:<24}  {}",
                    "ID", "STATUS", "PCT", "CREATED", "ROUTE"
                );
                for m in &migrations {
                    println!(
                        "{:<36}  {:<26}  {:>3}%  {:<24}  {} -> {}",
                        m.id,
                        m.status,
                        m.progress,
                        m.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        m.source(),
                        m.destination()
                    );
                }
            }
        }

        Commands::Show { id } => {
            let migration = orchestrator.get(&id).await?;
            print_migration(&migration, cli.output_json)?;
        }

        Commands::Logs { id, limit } => {
            let logs = orchestrator.logs(&id, limit).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&logs)?);
            } else {
                for entry in &logs {
                    println!(
                        "{} {:<5} {}",
                        entry.logged_at.format("%Y-%m-%d %H:%M:%S%.3f"),
                        entry.level.as_str().to_uppercase(),
                        entry.message
                    );
                }
            }
        }

        Commands::Report { id } => {
            let report = orchestrator.report(&id).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Reconciliation report for {}", report.migration_id);
                println!("  Source: {}", report.source);
                println!(
                    "    Objects: {}  Bytes: {}",
                    report.source_stats.object_count, report.source_stats.total_size
                );
                println!("  Destination: {}", report.destination);
                println!(
                    "    Objects: {}  Bytes: {}",
                    report.dest_stats.object_count, report.dest_stats.total_size
                );
                println!("  Matched keys: {}", report.breakdown.matched);
                println!(
                    "  Missing in destination: {}",
                    report.breakdown.missing_in_destination
                );
                println!("  Missing in source: {}", report.breakdown.missing_in_source);
                println!("  Size mismatches: {}", report.breakdown.size_mismatch);
                println!("  Content mismatches: {}", report.breakdown.content_mismatch);
                println!("  Duration: {:.2}s", report.duration_ms as f64 / 1000.0);
                println!("\nRecommendations:");
                for line in &report.recommendations {
                    println!("  - {}", line);
                }
                if !report.differences.is_empty() {
                    println!("\nDifferences:");
                    for d in &report.differences {
                        println!("  {:<24} {}", d.kind.as_str(), d.path);
                    }
                }
            }
        }

        Commands::Cancel { id } => {
            let migration = orchestrator.cancel(&id).await?;
            print_migration(&migration, cli.output_json)?;
        }

        Commands::Reschedule { id, when } => {
            let time = when.resolve().ok_or_else(|| {
                MigrateError::InvalidConfig("reschedule needs --at or --delay".to_string())
            })?;
            let migration = orchestrator.reschedule(&id, time).await?;
            print_migration(&migration, cli.output_json)?;
        }

        Commands::Scheduled => {
            let scheduled = orchestrator.scheduler().list_scheduled().await?;
            let stats = orchestrator.scheduler().stats().await?;
            if cli.output_json {
                let body = serde_json::json!({ "migrations": scheduled, "stats": stats });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                println!("Scheduled migrations: {}", stats.scheduled_jobs);
                for m in &scheduled {
                    println!(
                        "  {}  {}  {} -> {}",
                        m.id,
                        m.scheduled_time
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_default(),
                        m.source(),
                        m.destination()
                    );
                }
            }
        }

        Commands::Recover => {
            let report = orchestrator.recover().await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Recovered migrations: {}", report.recovered.len());
                for id in &report.recovered {
                    println!("  {}", id);
                }
                println!("Still in flight: {}", report.in_flight);
            }
        }
    }

    Ok(())
}

fn print_migration(migration: &Migration, json: bool) -> Result<(), MigrateError> {
    if json {
        println!("{}", serde_json::to_string_pretty(migration)?);
        return Ok(());
    }

    println!("Migration {}", migration.id);
    println!("  Route: {} -> {}", migration.source(), migration.destination());
    println!("  Status: {}", migration.status);
    println!("  Progress: {}%", migration.progress);
    if let Some(t) = migration.scheduled_time {
        println!("  Scheduled: {}", t.to_rfc3339());
    }
    if let Some(t) = migration.start_time {
        println!("  Started: {}", t.to_rfc3339());
    }
    if let Some(t) = migration.end_time {
        println!("  Finished: {}", t.to_rfc3339());
    }
    if let Some(ms) = migration.duration_ms {
        println!("  Duration: {:.2}s", ms as f64 / 1000.0);
    }
    let stats = &migration.stats;
    println!(
        "  Objects: {}/{}  Bytes: {}/{}",
        stats.transferred_objects, stats.total_objects, stats.transferred_size, stats.total_size
    );
    if let Some(rec) = &migration.reconciliation {
        println!(
            "  Reconciliation: {:?} (objects match: {}, size match: {}, differences: {})",
            rec.status,
            rec.summary.object_count_match,
            rec.summary.total_size_match,
            rec.summary.differences_found
        );
        if let Some(err) = &rec.error {
            println!("    Error: {}", err);
        }
    }
    for err in &migration.errors {
        println!("  Error: {}", err);
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        other => return Err(format!("invalid verbosity '{}'", other)),
    };

    // RUST_LOG takes precedence over --verbosity.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("invalid log format '{}'", other)),
    }

    Ok(())
}

/// Cancel `token` on SIGINT (Ctrl-C) or SIGTERM.
#[cfg(unix)]
fn setup_signal_handler(token: CancellationToken, shutdown_timeout: u64) {
    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to set up {} handler: {}", name, e);
                    return;
                }
            };
            stream.recv().await;
            eprintln!(
                "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
                name, shutdown_timeout
            );
            token.cancel();
        });
    }
}

/// Cancel `token` on Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler(token: CancellationToken, _shutdown_timeout: u64) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to set up Ctrl-C handler: {}", e);
            return;
        }
        eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
        token.cancel();
    });
}
