use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use renova_billing::{
    EngineOptions, Job, RenewalEngine, RunOptions, RunOutcome, RunSummary, SkipReason, Stores,
};
use renova_core::{DueFilter, RunLedger};
use renova_platform::{
    BalanceGateway, BillingConfig, PgStore, RUN_CHANNEL, RedisBus, RedisNoticeSink,
    RunCompletedEvent, ServiceConfig, connect_database,
};
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "renova-ops")]
#[command(about = "Renova recurring billing operations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate invoices for obligations that have fallen due
    Renew {
        /// Restrict the batch to one tenant
        #[arg(long)]
        company: Option<Uuid>,
        #[arg(long)]
        dry_run: bool,
        /// Run even if the job already completed today
        #[arg(long)]
        force: bool,
        #[arg(long)]
        batch_size: Option<i64>,
        /// Process as of this date instead of today (ISO date)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Re-attempt capture for failed invoices that waited out their backoff
    Charge {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        batch_size: Option<i64>,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Send renewal notices at the configured lead intervals
    Notify {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Show recent job runs from the ledger
    Status {
        #[arg(long)]
        job: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "renova_ops=info".to_string()),
        )
        .init();

    match run().await {
        Ok(code) => code,
        Err(err) => {
            error!("fatal: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = ServiceConfig::worker_from_env()?;
    let billing = BillingConfig::from_env()?;
    let pool = connect_database(&config.database_url).await?;
    let redis = RedisBus::connect(&config.redis_url)?;
    let store = Arc::new(PgStore::new(pool.clone()));

    let (job, opts, batch_size, date) = match cli.command {
        Commands::Status { job, limit } => {
            print_status(store.as_ref(), job.as_deref(), limit).await?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Renew {
            company,
            dry_run,
            force,
            batch_size,
            date,
        } => (
            Job::Renewals,
            RunOptions {
                force,
                dry_run,
                filter: DueFilter {
                    tenant_id: company,
                    due_from: None,
                },
            },
            batch_size,
            date,
        ),
        Commands::Charge {
            dry_run,
            force,
            batch_size,
            date,
        } => (
            Job::PaymentRetry,
            RunOptions {
                force,
                dry_run,
                filter: DueFilter::default(),
            },
            batch_size,
            date,
        ),
        Commands::Notify {
            dry_run,
            force,
            date,
        } => (
            Job::RenewalNotices,
            RunOptions {
                force,
                dry_run,
                filter: DueFilter::default(),
            },
            None,
            date,
        ),
    };

    let as_of = match date {
        Some(date) => date.and_time(NaiveTime::MIN).and_utc(),
        None => Utc::now(),
    };

    let engine = RenewalEngine::new(
        Stores {
            obligations: store.clone(),
            invoices: store.clone(),
            ledger: store.clone(),
            locks: store.clone(),
            notice_log: store.clone(),
        },
        Arc::new(BalanceGateway::new(pool.clone())),
        Arc::new(RedisNoticeSink::new(redis.clone())),
        EngineOptions {
            holder_id: holder_id(),
            batch_size: batch_size.unwrap_or(billing.batch_size),
            max_attempts: billing.max_attempts,
            stale_after: Duration::hours(billing.lock_stale_hours),
            lead_days: billing.lead_days.clone(),
        },
    );

    run_job(&engine, &redis, job, as_of, &opts, billing.failure_threshold).await
}

async fn run_job(
    engine: &RenewalEngine,
    redis: &RedisBus,
    job: Job,
    as_of: DateTime<Utc>,
    opts: &RunOptions,
    failure_threshold: f64,
) -> Result<ExitCode> {
    match engine.run(job, as_of, opts).await? {
        RunOutcome::Skipped(reason) => {
            let label = match reason {
                SkipReason::AlreadyRan => "already ran today",
                SkipReason::LockHeld => "already running",
            };
            println!("{}: skipped, {label}", job.job_name());
            Ok(ExitCode::from(3))
        }
        RunOutcome::Completed(summary) => {
            print_summary(job, &summary, opts.dry_run);

            if !opts.dry_run {
                let event = RunCompletedEvent {
                    job_name: job.job_name().to_string(),
                    run_date: as_of.date_naive(),
                    status: "COMPLETED".to_string(),
                    summary: serde_json::to_value(&summary)?,
                };
                if let Err(err) = redis.publish_json(RUN_CHANNEL, &event).await {
                    warn!("run event not published: {err:#}");
                }
            }

            if summary.failure_rate() > failure_threshold {
                error!(
                    "failure rate {:.1}% exceeds the {:.1}% threshold",
                    summary.failure_rate() * 100.0,
                    failure_threshold * 100.0
                );
                Ok(ExitCode::from(2))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}

fn print_summary(job: Job, summary: &RunSummary, dry_run: bool) {
    let suffix = if dry_run { " (dry-run)" } else { "" };
    println!("{}{suffix}", job.job_name());
    println!("  processed     {}", summary.processed);
    match job {
        Job::Renewals => {
            println!("  renewed       {}", summary.renewed);
            println!("  escalated     {}", summary.escalated);
            println!("  paused        {}", summary.paused);
        }
        Job::PaymentRetry => {
            println!("  charged       {}", summary.charged);
            println!("  exhausted     {}", summary.exhausted);
            println!("  waiting       {}", summary.skipped);
        }
        Job::RenewalNotices => {
            println!("  sent          {}", summary.notices_sent);
            println!("  already sent  {}", summary.skipped);
        }
    }
    println!("  failed        {}", summary.failed);
    for err in &summary.errors {
        println!("  error: {err}");
    }
}

async fn print_status(ledger: &PgStore, job: Option<&str>, limit: i64) -> Result<()> {
    let runs = ledger.recent_runs(job, limit).await?;
    if runs.is_empty() {
        println!("no recorded runs");
        return Ok(());
    }
    println!("{:<28} {:<12} {:<10} results", "job", "date", "status");
    for run in runs {
        println!(
            "{:<28} {:<12} {:<10} {}",
            run.job_name, run.run_date, run.status, run.results
        );
    }
    Ok(())
}

fn holder_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "renova-ops".to_string());
    format!("{host}:{}", std::process::id())
}
