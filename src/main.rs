use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tracing::{error, info};

use wb_pricewatch::config;
use wb_pricewatch::db;
use wb_pricewatch::handlers::{self, BotContext};
use wb_pricewatch::notifier::Dispatcher;
use wb_pricewatch::pipeline::UpdatePipeline;
use wb_pricewatch::ratelimit::RateLimiter;
use wb_pricewatch::retention::RetentionJob;
use wb_pricewatch::scheduler::PollScheduler;
use wb_pricewatch::wb::WbClient;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let bot = Bot::new(cfg.telegram.bot_token.clone());
    let dispatcher = Dispatcher::new(pool.clone(), Arc::new(bot.clone()));
    let source = Arc::new(WbClient::from_config(&cfg.upstream)?);
    let pipeline = Arc::new(UpdatePipeline::new(pool.clone(), source, dispatcher));

    PollScheduler::new(
        pool.clone(),
        Arc::clone(&pipeline),
        Duration::from_secs(cfg.app.tick_seconds),
        cfg.app.max_concurrent_runs,
    )?
    .spawn();
    RetentionJob::from_config(pool.clone(), &cfg.retention)?.spawn();

    let ctx = BotContext {
        pool,
        pipeline,
        allowed_users: Arc::new(cfg.telegram.allowed_users.clone()),
        default_frequency_minutes: cfg.app.default_frequency_minutes,
        limiter: Arc::new(RateLimiter::per_minute(cfg.telegram.requests_per_minute)),
    };

    info!("starting telegram bot");
    teloxide::repl(bot, move |bot: Bot, msg: Message| {
        let ctx = ctx.clone();
        async move {
            if let Err(err) = handlers::handle_update(&bot, &ctx, &msg).await {
                error!(?err, "failed to handle update");
            }
            respond(())
        }
    })
    .await;

    Ok(())
}
