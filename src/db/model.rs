//! View models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// A recipient's subscription joined with the last stored product attributes.
/// Product fields are `None` until the first successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSubscriptionView {
    pub artikul: String,
    pub is_active: bool,
    pub frequency_minutes: i64,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub name: Option<String>,
    pub price: Option<Decimal>,
    pub quantity: Option<i64>,
}
