use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use wb_pricewatch::config;
use wb_pricewatch::db;
use wb_pricewatch::notifier::{Dispatcher, LogMessenger};
use wb_pricewatch::pipeline::{RunOutcome, UpdatePipeline};
use wb_pricewatch::retention::RetentionJob;
use wb_pricewatch::selector;
use wb_pricewatch::wb::WbClient;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run a single pipeline, retention, or selection pass and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Fetch one product and run it through the update pipeline.
    /// Notifications are logged, not sent.
    Fetch { artikul: String },
    /// Delete expired task logs and trim price history.
    Retention,
    /// List subscriptions due right now, in processing order.
    Due,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    match args.command {
        Cmd::Fetch { artikul } => {
            let dispatcher = Dispatcher::new(pool.clone(), Arc::new(LogMessenger));
            let source = Arc::new(WbClient::from_config(&cfg.upstream)?);
            let pipeline = UpdatePipeline::new(pool.clone(), source, dispatcher);
            match pipeline.run(&artikul, Utc::now()).await {
                RunOutcome::Updated {
                    snapshot, events, ..
                } => {
                    println!(
                        "{}\t{}\tprice={}\trating={}\tquantity={}",
                        snapshot.artikul,
                        snapshot.name,
                        snapshot.price.round_dp(2),
                        snapshot.rating,
                        snapshot.quantity
                    );
                    for event in events {
                        println!("event\t{:?}", event);
                    }
                }
                other => println!("{:?}", other),
            }
        }
        Cmd::Retention => {
            let job = RetentionJob::from_config(pool.clone(), &cfg.retention)?;
            let report = job.run_once(Utc::now()).await?;
            println!(
                "task_logs_deleted={}\thistory_rows_deleted={}",
                report.task_logs_deleted, report.history_rows_deleted
            );
        }
        Cmd::Due => {
            let due = selector::select(&pool, Utc::now()).await?;
            info!(count = due.len(), "due subscriptions");
            for sub in due {
                let last = sub
                    .last_checked_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".into());
                println!("{}\tevery {} min\tlast checked {}", sub.artikul, sub.frequency_minutes, last);
            }
        }
    }

    Ok(())
}
