//! Daily cleanup of old task logs and deep price history.
//!
//! Runs independently of the poll scheduler; a failed pass is logged and
//! retried the next day.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use crate::config;
use crate::db::{self, Pool};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub task_logs_deleted: u64,
    pub history_rows_deleted: u64,
}

pub struct RetentionJob {
    pool: Pool,
    run_at: NaiveTime,
    task_log_max_age: Duration,
    history_depth: i64,
}

impl RetentionJob {
    pub fn new(pool: Pool, run_at: NaiveTime, task_log_days: i64, history_depth: i64) -> Result<Self> {
        if task_log_days <= 0 {
            return Err(anyhow!("task_log_days must be positive"));
        }
        if history_depth <= 0 {
            return Err(anyhow!("history_depth must be positive"));
        }
        Ok(Self {
            pool,
            run_at,
            task_log_max_age: Duration::days(task_log_days),
            history_depth,
        })
    }

    pub fn from_config(pool: Pool, cfg: &config::Retention) -> Result<Self> {
        Self::new(
            pool,
            cfg.run_at_time()?,
            cfg.task_log_days,
            cfg.price_history_depth,
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        info!(run_at = %self.run_at, "retention job started");
        loop {
            let now = Utc::now();
            let next = next_run_after(now, self.run_at);
            let wait = (next - now).to_std().unwrap_or_default();
            info!(next_run = %next, "retention job sleeping");
            tokio::time::sleep(wait).await;

            if let Err(err) = self.run_once(Utc::now()).await {
                error!(?err, "retention run failed");
            }
        }
    }

    /// Delete task logs strictly older than the max age and trim each
    /// product's price history to the configured depth.
    #[instrument(skip_all)]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let cutoff = now - self.task_log_max_age;
        let task_logs_deleted = db::delete_task_logs_before(&self.pool, cutoff).await?;
        let history_rows_deleted = db::trim_price_history(&self.pool, self.history_depth).await?;
        info!(
            task_logs_deleted,
            history_rows_deleted,
            %cutoff,
            "retention pass finished"
        );
        Ok(RetentionReport {
            task_logs_deleted,
            history_rows_deleted,
        })
    }
}

/// The first `run_at` (UTC) strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>, run_at: NaiveTime) -> DateTime<Utc> {
    let today = Utc.from_utc_datetime(&now.date_naive().and_time(run_at));
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}
