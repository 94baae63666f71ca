//! One fetch -> detect -> persist -> notify -> log pass for a single artikul.
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, instrument, warn};

use crate::db::{self, Pool};
use crate::detector::detect;
use crate::model::{ChangeEvent, ProductSnapshot, TaskStatus};
use crate::notifier::Dispatcher;
use crate::selector;
use crate::wb::ProductSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetching,
    Detecting,
    Persisting,
    Notifying,
    LoggingResult,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetching => "fetching",
            Stage::Detecting => "detecting",
            Stage::Persisting => "persisting",
            Stage::Notifying => "notifying",
            Stage::LoggingResult => "logging_result",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Another run for the same artikul was already in flight.
    Skipped,
    Updated {
        snapshot: ProductSnapshot,
        events: Vec<ChangeEvent>,
        /// First observation of this artikul.
        created: bool,
        delivered: usize,
    },
    FetchFailed {
        kind: &'static str,
        message: String,
    },
    Failed {
        stage: Stage,
        message: String,
    },
}

impl RunOutcome {
    fn task_log(&self) -> Option<(TaskStatus, String)> {
        match self {
            RunOutcome::Skipped => None,
            RunOutcome::Updated {
                snapshot, events, ..
            } => {
                let mut message = format!(
                    "price={}, rating={}, quantity={}",
                    snapshot.price.round_dp(2),
                    snapshot.rating,
                    snapshot.quantity
                );
                if !events.is_empty() {
                    let kinds: Vec<&str> = events.iter().map(ChangeEvent::as_str).collect();
                    message.push_str(&format!(" [{}]", kinds.join(", ")));
                }
                Some((TaskStatus::Success, message))
            }
            RunOutcome::FetchFailed { kind, message } => {
                Some((TaskStatus::Error, format!("{}: {}", kind, message)))
            }
            RunOutcome::Failed { stage, message } => {
                Some((TaskStatus::Error, format!("{} failed: {}", stage, message)))
            }
        }
    }
}

/// Set of artikuls with a run in flight. Acquiring is an atomic check-and-set.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    pub fn try_acquire(&self, artikul: &str) -> Option<InFlightGuard> {
        let mut set = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(artikul.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            inner: Arc::clone(&self.inner),
            artikul: artikul.to_string(),
        })
    }

    pub fn contains(&self, artikul: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(artikul)
    }
}

/// Releases the artikul when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    inner: Arc<Mutex<HashSet<String>>>,
    artikul: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.artikul);
    }
}

pub struct UpdatePipeline {
    pool: Pool,
    source: Arc<dyn ProductSource>,
    dispatcher: Dispatcher,
    in_flight: InFlight,
}

impl UpdatePipeline {
    pub fn new(pool: Pool, source: Arc<dyn ProductSource>, dispatcher: Dispatcher) -> Self {
        Self {
            pool,
            source,
            dispatcher,
            in_flight: InFlight::default(),
        }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Run the pipeline for `artikul`. Never fails: every error is classified
    /// into the outcome and recorded as a task log entry.
    #[instrument(skip(self, artikul, now), fields(artikul = %artikul))]
    pub async fn run(&self, artikul: &str, now: DateTime<Utc>) -> RunOutcome {
        let Some(_guard) = self.in_flight.try_acquire(artikul) else {
            debug!("run already in flight; skipping");
            return RunOutcome::Skipped;
        };
        self.run_locked(artikul, now).await
    }

    /// Scheduled variant of [`run`](Self::run). Under the in-flight guard it
    /// re-reads the subscription, skips unless it is still due at `now`, and
    /// advances `last_checked_at` before releasing the guard.
    #[instrument(skip(self, artikul, now), fields(artikul = %artikul))]
    pub async fn run_due(&self, artikul: &str, now: DateTime<Utc>) -> RunOutcome {
        let Some(_guard) = self.in_flight.try_acquire(artikul) else {
            debug!("run already in flight; skipping");
            return RunOutcome::Skipped;
        };

        match db::get_subscription(&self.pool, artikul).await {
            Ok(Some(sub)) if selector::is_due(&sub, now) => {}
            Ok(_) => {
                debug!("subscription no longer due; skipping");
                return RunOutcome::Skipped;
            }
            Err(err) => {
                error!(?err, "failed to re-read subscription");
                return RunOutcome::Skipped;
            }
        }

        let outcome = self.run_locked(artikul, now).await;
        if let Err(err) = db::mark_checked(&self.pool, artikul, now).await {
            error!(?err, "failed to advance last_checked_at");
        }
        outcome
    }

    async fn run_locked(&self, artikul: &str, now: DateTime<Utc>) -> RunOutcome {
        let outcome = self.drive(artikul, now).await;

        if let Some((status, message)) = outcome.task_log() {
            debug!(stage = %Stage::LoggingResult, status = status.as_str(), %message);
            if let Err(err) = db::insert_task_log(&self.pool, artikul, status, &message, now).await
            {
                error!(?err, "failed to write task log");
            }
        }
        debug!(stage = %Stage::Done);
        outcome
    }

    async fn drive(&self, artikul: &str, now: DateTime<Utc>) -> RunOutcome {
        debug!(stage = %Stage::Fetching);
        let snapshot = match self.source.fetch(artikul).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(kind = err.kind(), %err, "fetch failed");
                return RunOutcome::FetchFailed {
                    kind: err.kind(),
                    message: err.to_string(),
                };
            }
        };

        let (events, created) = match self.persist(&snapshot, now).await {
            Ok(res) => res,
            Err(err) => {
                error!(?err, "failed to persist snapshot");
                return RunOutcome::Failed {
                    stage: Stage::Persisting,
                    message: format!("{:#}", err),
                };
            }
        };

        debug!(stage = %Stage::Notifying, events = events.len());
        let mut delivered = 0;
        for event in &events {
            match self.dispatcher.dispatch(event, artikul, &snapshot.name).await {
                Ok(report) => delivered += report.delivered,
                Err(err) => {
                    error!(?err, "failed to resolve recipients");
                    return RunOutcome::Failed {
                        stage: Stage::Notifying,
                        message: format!("{:#}", err),
                    };
                }
            }
        }

        info!(
            price = %snapshot.price,
            quantity = snapshot.quantity,
            events = events.len(),
            created,
            "product updated"
        );
        RunOutcome::Updated {
            snapshot,
            events,
            created,
            delivered,
        }
    }

    /// Read the previous state, upsert, detect, and append price history in
    /// one transaction. No external call happens while it is open.
    async fn persist(
        &self,
        snapshot: &ProductSnapshot,
        now: DateTime<Utc>,
    ) -> Result<(Vec<ChangeEvent>, bool)> {
        debug!(stage = %Stage::Persisting);
        let mut tx = self.pool.begin().await?;
        let previous = db::get_product_tx(&mut tx, &snapshot.artikul).await?;
        let product_id = db::upsert_product_tx(&mut tx, snapshot, now).await?;

        debug!(stage = %Stage::Detecting);
        let events = detect(previous.as_ref(), snapshot);
        for event in &events {
            if let ChangeEvent::PriceChanged { new, .. } = event {
                db::insert_price_history_tx(&mut tx, product_id, *new, snapshot.quantity, now)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok((events, previous.is_none()))
    }
}
