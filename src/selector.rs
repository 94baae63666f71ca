//! Picks the subscriptions whose polling interval has elapsed.
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::db::{self, Pool};
use crate::model::Subscription;

/// `is_active AND (now - last_checked_at) >= frequency`. A subscription that
/// was never checked is always due.
pub fn is_due(sub: &Subscription, now: DateTime<Utc>) -> bool {
    if !sub.is_active {
        return false;
    }
    match sub.last_checked_at {
        None => true,
        Some(last) => now - last >= Duration::minutes(sub.frequency_minutes),
    }
}

/// When the subscription became due; `None` for never-checked ones.
fn due_since(sub: &Subscription) -> Option<DateTime<Utc>> {
    sub.last_checked_at
        .map(|last| last + Duration::minutes(sub.frequency_minutes))
}

/// Filter `subs` down to the due ones, longest-overdue first. Never-checked
/// subscriptions lead; ties fall back to id order.
pub fn select_due(
    subs: impl IntoIterator<Item = Subscription>,
    now: DateTime<Utc>,
) -> Vec<Subscription> {
    let mut due: Vec<Subscription> = subs.into_iter().filter(|s| is_due(s, now)).collect();
    due.sort_by_key(|s| (due_since(s), s.id));
    due
}

pub async fn select(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
    let active = db::list_active_subscriptions(pool).await?;
    Ok(select_due(active, now))
}
