use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const MIN_FREQUENCY_MINUTES: i64 = 1;
pub const MAX_FREQUENCY_MINUTES: i64 = 1440;

/// Upstream and storage both carry prices as integer kopecks.
pub fn price_from_minor(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

pub fn price_to_minor(price: Decimal) -> Result<i64> {
    (price.round_dp(2) * Decimal::ONE_HUNDRED)
        .to_i64()
        .ok_or_else(|| anyhow!("price {} does not fit into minor units", price))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    Success,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "success" => Some(TaskStatus::Success),
            "error" => Some(TaskStatus::Error),
            _ => None,
        }
    }
}

/// Attribute set returned by one upstream fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub artikul: String,
    pub name: String,
    pub price: Decimal,
    pub rating: f64,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub artikul: String,
    pub name: String,
    pub price: Decimal,
    pub rating: f64,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryEntry {
    pub id: i64,
    pub product_id: i64,
    pub price: Decimal,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub artikul: String,
    pub is_active: bool,
    pub frequency_minutes: i64,
    /// `None` until the first pipeline run completes.
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub id: i64,
    pub artikul: String,
    pub status: TaskStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A meaningful delta between the stored product and a fresh snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEvent {
    PriceChanged { old: Decimal, new: Decimal },
    QuantityChanged { old: i64, new: i64 },
}

impl ChangeEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeEvent::PriceChanged { .. } => "price_changed",
            ChangeEvent::QuantityChanged { .. } => "quantity_changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_units_round_trip_through_decimal() {
        let price = price_from_minor(250000);
        assert_eq!(price.to_string(), "2500.00");
        assert_eq!(price_to_minor(price).unwrap(), 250000);
    }

    #[test]
    fn price_to_minor_rounds_to_kopecks() {
        let price = Decimal::new(1234567, 4); // 123.4567
        assert_eq!(price_to_minor(price).unwrap(), 12346);
    }

    #[test]
    fn task_status_parses_known_values() {
        assert_eq!(TaskStatus::parse_status("success"), Some(TaskStatus::Success));
        assert_eq!(TaskStatus::parse_status("error"), Some(TaskStatus::Error));
        assert_eq!(TaskStatus::parse_status("pending"), None);
    }
}
