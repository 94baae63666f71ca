use super::model::UserSubscriptionView;
use crate::model::{
    price_from_minor, price_to_minor, PriceHistoryEntry, Product, ProductSnapshot, Subscription,
    TaskLogEntry, TaskStatus, MAX_FREQUENCY_MINUTES, MIN_FREQUENCY_MINUTES,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url: {}", normalized))?
        .create_if_missing(true)
        // Enable WAL and stricter durability.
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn product_from_row(row: &SqliteRow) -> Result<Product, sqlx::Error> {
    Ok(Product {
        id: row.try_get("id")?,
        artikul: row.try_get("artikul")?,
        name: row.try_get("name")?,
        price: price_from_minor(row.try_get("price_minor")?),
        rating: row.try_get("rating")?,
        quantity: row.try_get("quantity")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn subscription_from_row(row: &SqliteRow) -> Result<Subscription, sqlx::Error> {
    Ok(Subscription {
        id: row.try_get("id")?,
        artikul: row.try_get("artikul")?,
        is_active: row.try_get("is_active")?,
        frequency_minutes: row.try_get("frequency_minutes")?,
        last_checked_at: row.try_get("last_checked_at")?,
        created_at: row.try_get("created_at")?,
    })
}

const PRODUCT_COLUMNS: &str =
    "id, artikul, name, price_minor, rating, quantity, created_at, updated_at";

// ---------------------------------------------------------------------------
// products / price history
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn get_product(pool: &Pool, artikul: &str) -> Result<Option<Product>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM products WHERE artikul = ?",
        PRODUCT_COLUMNS
    ))
    .bind(artikul)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(product_from_row).transpose()?)
}

/// Read the stored product inside an open transaction, before it is overwritten.
pub async fn get_product_tx(
    tx: &mut Transaction<'_, Sqlite>,
    artikul: &str,
) -> Result<Option<Product>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM products WHERE artikul = ?",
        PRODUCT_COLUMNS
    ))
    .bind(artikul)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.as_ref().map(product_from_row).transpose()?)
}

/// Insert the product if absent, else overwrite its mutable fields and
/// `updated_at`. Returns the product row id.
pub async fn upsert_product_tx(
    tx: &mut Transaction<'_, Sqlite>,
    snapshot: &ProductSnapshot,
    now: DateTime<Utc>,
) -> Result<i64> {
    let id: i64 = sqlx::query(
        "INSERT INTO products (artikul, name, price_minor, rating, quantity, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(artikul) DO UPDATE SET \
            name = excluded.name, \
            price_minor = excluded.price_minor, \
            rating = excluded.rating, \
            quantity = excluded.quantity, \
            updated_at = excluded.updated_at \
         RETURNING id",
    )
    .bind(&snapshot.artikul)
    .bind(&snapshot.name)
    .bind(price_to_minor(snapshot.price)?)
    .bind(snapshot.rating)
    .bind(snapshot.quantity)
    .bind(now)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?
    .try_get("id")?;
    Ok(id)
}

pub async fn insert_price_history_tx(
    tx: &mut Transaction<'_, Sqlite>,
    product_id: i64,
    price: rust_decimal::Decimal,
    quantity: i64,
    now: DateTime<Utc>,
) -> Result<i64> {
    let id: i64 = sqlx::query(
        "INSERT INTO price_history (product_id, price_minor, quantity, created_at) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(product_id)
    .bind(price_to_minor(price)?)
    .bind(quantity)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?
    .try_get("id")?;
    Ok(id)
}

/// Price history for a product, newest first.
#[instrument(skip_all)]
pub async fn list_price_history(pool: &Pool, artikul: &str) -> Result<Vec<PriceHistoryEntry>> {
    let rows = sqlx::query(
        "SELECT h.id, h.product_id, h.price_minor, h.quantity, h.created_at \
         FROM price_history h JOIN products p ON p.id = h.product_id \
         WHERE p.artikul = ? ORDER BY h.created_at DESC, h.id DESC",
    )
    .bind(artikul)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| -> Result<PriceHistoryEntry> {
            Ok(PriceHistoryEntry {
                id: row.try_get("id")?,
                product_id: row.try_get("product_id")?,
                price: price_from_minor(row.try_get("price_minor")?),
                quantity: row.try_get("quantity")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

/// Keep the `depth` most recent history rows per product; returns rows deleted.
#[instrument(skip_all)]
pub async fn trim_price_history(pool: &Pool, depth: i64) -> Result<u64> {
    let res = sqlx::query(
        "DELETE FROM price_history WHERE id IN ( \
            SELECT id FROM ( \
                SELECT id, ROW_NUMBER() OVER ( \
                    PARTITION BY product_id ORDER BY created_at DESC, id DESC \
                ) AS rn FROM price_history \
            ) WHERE rn > ? \
         )",
    )
    .bind(depth)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// task logs
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_task_log(
    pool: &Pool,
    artikul: &str,
    status: TaskStatus,
    message: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    let id: i64 = sqlx::query(
        "INSERT INTO task_logs (artikul, status, message, created_at) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(artikul)
    .bind(status.as_str())
    .bind(message)
    .bind(now)
    .fetch_one(pool)
    .await?
    .try_get("id")?;
    Ok(id)
}

/// Task logs for one artikul, oldest first.
#[instrument(skip_all)]
pub async fn list_task_logs(pool: &Pool, artikul: &str) -> Result<Vec<TaskLogEntry>> {
    let rows = sqlx::query(
        "SELECT id, artikul, status, message, created_at FROM task_logs WHERE artikul = ? ORDER BY id ASC",
    )
    .bind(artikul)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| -> Result<TaskLogEntry> {
            let status: String = row.try_get("status")?;
            Ok(TaskLogEntry {
                id: row.try_get("id")?,
                artikul: row.try_get("artikul")?,
                status: TaskStatus::parse_status(&status)
                    .ok_or_else(|| anyhow!("unknown task status '{}'", status))?,
                message: row.try_get("message")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

/// Delete task logs created strictly before `cutoff`.
#[instrument(skip_all)]
pub async fn delete_task_logs_before(pool: &Pool, cutoff: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query("DELETE FROM task_logs WHERE created_at < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// subscriptions
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn list_active_subscriptions(pool: &Pool) -> Result<Vec<Subscription>> {
    let rows = sqlx::query(
        "SELECT id, artikul, is_active, frequency_minutes, last_checked_at, created_at \
         FROM subscriptions WHERE is_active = 1 ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(subscription_from_row)
        .collect::<Result<Vec<_>, _>>()?)
}

#[instrument(skip_all)]
pub async fn get_subscription(pool: &Pool, artikul: &str) -> Result<Option<Subscription>> {
    let row = sqlx::query(
        "SELECT id, artikul, is_active, frequency_minutes, last_checked_at, created_at \
         FROM subscriptions WHERE artikul = ?",
    )
    .bind(artikul)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(subscription_from_row).transpose()?)
}

/// Advance `last_checked_at` to `now`. The timestamp never moves backwards:
/// returns `false` when the stored value is already at or past `now`.
#[instrument(skip_all)]
pub async fn mark_checked(pool: &Pool, artikul: &str, now: DateTime<Utc>) -> Result<bool> {
    let current: Option<Option<DateTime<Utc>>> =
        sqlx::query_scalar("SELECT last_checked_at FROM subscriptions WHERE artikul = ?")
            .bind(artikul)
            .fetch_optional(pool)
            .await?;
    match current {
        None => Ok(false),
        Some(Some(last)) if last >= now => Ok(false),
        Some(previous) => {
            // Compare-and-set against the value we read so an overlapping tick
            // cannot move the timestamp backwards.
            let res = sqlx::query(
                "UPDATE subscriptions SET last_checked_at = ? \
                 WHERE artikul = ? AND last_checked_at IS ?",
            )
            .bind(now)
            .bind(artikul)
            .bind(previous)
            .execute(pool)
            .await?;
            Ok(res.rows_affected() == 1)
        }
    }
}

/// Register `chat_id` as a recipient for `artikul`, creating the subscription
/// or reactivating it with the given polling frequency.
#[instrument(skip_all)]
pub async fn subscribe(
    pool: &Pool,
    chat_id: i64,
    artikul: &str,
    frequency_minutes: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    if !(MIN_FREQUENCY_MINUTES..=MAX_FREQUENCY_MINUTES).contains(&frequency_minutes) {
        return Err(anyhow!(
            "frequency must be between {} and {} minutes, got {}",
            MIN_FREQUENCY_MINUTES,
            MAX_FREQUENCY_MINUTES,
            frequency_minutes
        ));
    }
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO user_subscriptions (chat_id, artikul, created_at) VALUES (?, ?, ?) \
         ON CONFLICT(chat_id, artikul) DO NOTHING",
    )
    .bind(chat_id)
    .bind(artikul)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "INSERT INTO subscriptions (artikul, is_active, frequency_minutes, last_checked_at, created_at) \
         VALUES (?, 1, ?, NULL, ?) \
         ON CONFLICT(artikul) DO UPDATE SET is_active = 1, frequency_minutes = excluded.frequency_minutes",
    )
    .bind(artikul)
    .bind(frequency_minutes)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Remove the recipient pair; deactivates the subscription once nobody is left.
/// Returns whether a pair was removed.
#[instrument(skip_all)]
pub async fn unsubscribe(pool: &Pool, chat_id: i64, artikul: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let removed = sqlx::query("DELETE FROM user_subscriptions WHERE chat_id = ? AND artikul = ?")
        .bind(chat_id)
        .bind(artikul)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    let remaining: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM user_subscriptions WHERE artikul = ?")
            .bind(artikul)
            .fetch_one(&mut *tx)
            .await?;
    if remaining == 0 {
        sqlx::query("UPDATE subscriptions SET is_active = 0 WHERE artikul = ?")
            .bind(artikul)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(removed > 0)
}

/// Chat ids subscribed to `artikul`, in subscription order.
#[instrument(skip_all)]
pub async fn list_recipients(pool: &Pool, artikul: &str) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT chat_id FROM user_subscriptions WHERE artikul = ? ORDER BY id ASC",
    )
    .bind(artikul)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn list_user_subscriptions(pool: &Pool, chat_id: i64) -> Result<Vec<UserSubscriptionView>> {
    let rows = sqlx::query(
        "SELECT s.artikul, s.is_active, s.frequency_minutes, s.last_checked_at, \
                p.name, p.price_minor, p.quantity \
         FROM user_subscriptions u \
         JOIN subscriptions s ON s.artikul = u.artikul \
         LEFT JOIN products p ON p.artikul = u.artikul \
         WHERE u.chat_id = ? ORDER BY u.id ASC",
    )
    .bind(chat_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| -> Result<UserSubscriptionView> {
            let price_minor: Option<i64> = row.try_get("price_minor")?;
            Ok(UserSubscriptionView {
                artikul: row.try_get("artikul")?,
                is_active: row.try_get("is_active")?,
                frequency_minutes: row.try_get("frequency_minutes")?,
                last_checked_at: row.try_get("last_checked_at")?,
                name: row.try_get("name")?,
                price: price_minor.map(price_from_minor),
                quantity: row.try_get("quantity")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[test]
    fn prepare_sqlite_url_leaves_memory_and_foreign_urls() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
    }

    #[test]
    fn prepare_sqlite_url_keeps_query_string() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("db.sqlite");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let out = prepare_sqlite_url(&url);
        assert_eq!(out, url);
        assert!(path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn subscribe_creates_and_reactivates() {
        let pool = setup_pool().await;
        let now = Utc::now();

        subscribe(&pool, 1, "303265098", 30, now).await.unwrap();
        subscribe(&pool, 1, "303265098", 30, now).await.unwrap();
        let sub = get_subscription(&pool, "303265098").await.unwrap().unwrap();
        assert!(sub.is_active);
        assert_eq!(sub.frequency_minutes, 30);
        assert!(sub.last_checked_at.is_none());
        assert_eq!(list_recipients(&pool, "303265098").await.unwrap(), vec![1]);

        assert!(unsubscribe(&pool, 1, "303265098").await.unwrap());
        let sub = get_subscription(&pool, "303265098").await.unwrap().unwrap();
        assert!(!sub.is_active);

        subscribe(&pool, 2, "303265098", 15, now).await.unwrap();
        let sub = get_subscription(&pool, "303265098").await.unwrap().unwrap();
        assert!(sub.is_active);
        assert_eq!(sub.frequency_minutes, 15);
    }

    #[tokio::test]
    async fn unsubscribe_keeps_subscription_while_recipients_remain() {
        let pool = setup_pool().await;
        let now = Utc::now();
        subscribe(&pool, 1, "111", 60, now).await.unwrap();
        subscribe(&pool, 2, "111", 60, now).await.unwrap();

        assert!(unsubscribe(&pool, 1, "111").await.unwrap());
        assert!(!unsubscribe(&pool, 1, "111").await.unwrap());
        let sub = get_subscription(&pool, "111").await.unwrap().unwrap();
        assert!(sub.is_active);
        assert_eq!(list_recipients(&pool, "111").await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn subscribe_rejects_out_of_range_frequency() {
        let pool = setup_pool().await;
        assert!(subscribe(&pool, 1, "111", 0, Utc::now()).await.is_err());
        assert!(subscribe(&pool, 1, "111", 1441, Utc::now()).await.is_err());
        assert!(get_subscription(&pool, "111").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_checked_only_moves_forward() {
        let pool = setup_pool().await;
        let now = Utc::now();
        subscribe(&pool, 1, "111", 60, now).await.unwrap();

        assert!(mark_checked(&pool, "111", now).await.unwrap());
        assert!(!mark_checked(&pool, "111", now - Duration::minutes(5)).await.unwrap());
        let sub = get_subscription(&pool, "111").await.unwrap().unwrap();
        assert_eq!(sub.last_checked_at, Some(now));

        let later = now + Duration::minutes(1);
        assert!(mark_checked(&pool, "111", later).await.unwrap());
        assert!(!mark_checked(&pool, "missing", later).await.unwrap());
    }

    #[tokio::test]
    async fn upsert_overwrites_mutable_fields() {
        let pool = setup_pool().await;
        let t0 = Utc::now();
        let mut snap = ProductSnapshot {
            artikul: "42".into(),
            name: "Kettle".into(),
            price: price_from_minor(199900),
            rating: 4.5,
            quantity: 3,
        };
        let mut tx = pool.begin().await.unwrap();
        let id = upsert_product_tx(&mut tx, &snap, t0).await.unwrap();
        tx.commit().await.unwrap();

        snap.price = price_from_minor(189900);
        snap.quantity = 7;
        let t1 = t0 + Duration::minutes(10);
        let mut tx = pool.begin().await.unwrap();
        let id2 = upsert_product_tx(&mut tx, &snap, t1).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(id, id2);

        let stored = get_product(&pool, "42").await.unwrap().unwrap();
        assert_eq!(stored.price.to_string(), "1899.00");
        assert_eq!(stored.quantity, 7);
        assert_eq!(stored.created_at, t0);
        assert_eq!(stored.updated_at, t1);
    }

    #[tokio::test]
    async fn user_subscription_view_joins_product() {
        let pool = setup_pool().await;
        let now = Utc::now();
        subscribe(&pool, 9, "1", 60, now).await.unwrap();
        subscribe(&pool, 9, "2", 120, now).await.unwrap();
        let mut tx = pool.begin().await.unwrap();
        upsert_product_tx(
            &mut tx,
            &ProductSnapshot {
                artikul: "1".into(),
                name: "Mug".into(),
                price: price_from_minor(50000),
                rating: 0.0,
                quantity: 1,
            },
            now,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let views = list_user_subscriptions(&pool, 9).await.unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].name.as_deref(), Some("Mug"));
        assert_eq!(views[0].price, Some(price_from_minor(50000)));
        assert_eq!(views[1].artikul, "2");
        assert_eq!(views[1].frequency_minutes, 120);
        assert!(views[1].name.is_none());
    }
}
