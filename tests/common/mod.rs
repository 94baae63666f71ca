#![allow(dead_code)]

use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use wb_pricewatch::db::Pool;
use wb_pricewatch::model::{price_from_minor, ProductSnapshot};
use wb_pricewatch::notifier::Messenger;
use wb_pricewatch::wb::{FetchError, ProductSource};

/// Single-connection in-memory pool so every query sees the same database.
pub async fn setup_pool() -> Pool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn snapshot(artikul: &str, price_minor: i64, quantity: i64) -> ProductSnapshot {
    ProductSnapshot {
        artikul: artikul.to_string(),
        name: format!("Product {}", artikul),
        price: price_from_minor(price_minor),
        rating: 4.7,
        quantity,
    }
}

/// Replays queued fetch results per artikul; an exhausted queue answers
/// `NotFound`.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    responses: Arc<Mutex<HashMap<String, VecDeque<Result<ProductSnapshot, FetchError>>>>>,
    calls: Arc<Mutex<Vec<String>>>,
    gate: Option<Gate>,
    delays: Arc<HashMap<String, Duration>>,
}

/// Lets a test hold a fetch open: `entered` fires when a fetch starts, and
/// the fetch waits for `release`.
#[derive(Clone, Default)]
pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl ScriptedSource {
    pub fn gated(gate: Gate) -> Self {
        Self {
            gate: Some(gate),
            ..Default::default()
        }
    }

    /// Make every fetch of `artikul` take `delay`.
    pub fn with_delay(mut self, artikul: &str, delay: Duration) -> Self {
        Arc::make_mut(&mut self.delays).insert(artikul.to_string(), delay);
        self
    }

    pub async fn push(&self, artikul: &str, response: Result<ProductSnapshot, FetchError>) {
        self.responses
            .lock()
            .await
            .entry(artikul.to_string())
            .or_default()
            .push_back(response);
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl ProductSource for ScriptedSource {
    async fn fetch(&self, artikul: &str) -> Result<ProductSnapshot, FetchError> {
        self.calls.lock().await.push(artikul.to_string());
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if let Some(delay) = self.delays.get(artikul) {
            tokio::time::sleep(*delay).await;
        }
        let next = self
            .responses
            .lock()
            .await
            .get_mut(artikul)
            .and_then(VecDeque::pop_front);
        next.unwrap_or_else(|| Err(FetchError::NotFound(artikul.to_string())))
    }
}

#[derive(Clone, Default)]
pub struct RecordingMessenger {
    sent: Arc<Mutex<Vec<(i64, String)>>>,
    failing: Arc<HashSet<i64>>,
}

impl RecordingMessenger {
    pub fn failing_for(chat_ids: &[i64]) -> Self {
        Self {
            failing: Arc::new(chat_ids.iter().copied().collect()),
            ..Default::default()
        }
    }

    pub async fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Messenger for RecordingMessenger {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()> {
        if self.failing.contains(&chat_id) {
            return Err(anyhow!("chat {} blocked the bot", chat_id));
        }
        self.sent.lock().await.push((chat_id, text.to_string()));
        Ok(())
    }
}
