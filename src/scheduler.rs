//! Fixed-tick driver that runs the update pipeline for due subscriptions.
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::db::Pool;
use crate::pipeline::{RunOutcome, UpdatePipeline};
use crate::selector;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub updated: usize,
    pub fetch_failed: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct PollScheduler {
    pool: Pool,
    pipeline: Arc<UpdatePipeline>,
    tick: Duration,
    max_concurrent_runs: usize,
}

impl PollScheduler {
    pub fn new(
        pool: Pool,
        pipeline: Arc<UpdatePipeline>,
        tick: Duration,
        max_concurrent_runs: usize,
    ) -> Result<Self> {
        if tick.is_zero() {
            return Err(anyhow!("scheduler tick must be positive"));
        }
        if max_concurrent_runs == 0 {
            return Err(anyhow!("max_concurrent_runs must be positive"));
        }
        Ok(Self {
            pool,
            pipeline,
            tick,
            max_concurrent_runs,
        })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(Arc::new(self).run())
    }

    /// Tick forever. Each tick's work is spawned so a slow tick never delays
    /// the next one; overlapping ticks are kept apart per artikul by the
    /// pipeline's in-flight guard.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            tick_secs = self.tick.as_secs(),
            max_concurrent_runs = self.max_concurrent_runs,
            "poll scheduler started"
        );
        loop {
            interval.tick().await;
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                scheduler.tick_once(Utc::now()).await;
            });
        }
    }

    /// Select due subscriptions and drive one pipeline run for each.
    /// A subscription checked by an overlapping tick since selection is skipped.
    #[instrument(skip(self, now), fields(tick_id = %Uuid::new_v4()))]
    pub async fn tick_once(&self, now: DateTime<Utc>) -> TickReport {
        let due = match selector::select(&self.pool, now).await {
            Ok(due) => due,
            Err(err) => {
                error!(?err, "failed to select due subscriptions");
                return TickReport::default();
            }
        };
        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            debug!("no subscriptions due");
            return report;
        }

        let outcomes: Vec<RunOutcome> = stream::iter(due)
            .map(|sub| async move { self.pipeline.run_due(&sub.artikul, now).await })
            .buffer_unordered(self.max_concurrent_runs)
            .collect()
            .await;

        for outcome in &outcomes {
            match outcome {
                RunOutcome::Skipped => report.skipped += 1,
                RunOutcome::Updated { .. } => report.updated += 1,
                RunOutcome::FetchFailed { .. } => report.fetch_failed += 1,
                RunOutcome::Failed { .. } => report.failed += 1,
            }
        }

        info!(
            due = report.due,
            updated = report.updated,
            fetch_failed = report.fetch_failed,
            failed = report.failed,
            skipped = report.skipped,
            "tick finished"
        );
        report
    }
}
