//! Fan-out of change events to subscribed chats.
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use teloxide::prelude::*;
use tracing::{debug, info, instrument, warn};

use crate::db::{self, Pool};
use crate::model::ChangeEvent;

/// Send-message capability addressed by an opaque chat id.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()>;
}

#[async_trait]
impl Messenger for Bot {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()> {
        self.send_message(ChatId(chat_id), text).await?;
        Ok(())
    }
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMessenger;

#[async_trait]
impl Messenger for LogMessenger {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()> {
        info!(chat_id, %text, "notification (not delivered)");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub recipients: usize,
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Dispatcher {
    pool: Pool,
    messenger: Arc<dyn Messenger>,
}

impl Dispatcher {
    pub fn new(pool: Pool, messenger: Arc<dyn Messenger>) -> Self {
        Self { pool, messenger }
    }

    /// Deliver `event` to every chat subscribed to `artikul`.
    ///
    /// Zero recipients is not an error, and a failed delivery only bumps
    /// `failed`. The only error returned is a failed recipient lookup.
    #[instrument(skip(self, event, product_name), fields(event = event.as_str()))]
    pub async fn dispatch(
        &self,
        event: &ChangeEvent,
        artikul: &str,
        product_name: &str,
    ) -> Result<DeliveryReport> {
        let recipients = db::list_recipients(&self.pool, artikul).await?;
        let text = format_event(event, artikul, product_name);
        let mut report = DeliveryReport {
            recipients: recipients.len(),
            ..Default::default()
        };

        for chat_id in recipients {
            match self.messenger.send_text(chat_id, &text).await {
                Ok(()) => {
                    report.delivered += 1;
                    debug!(chat_id, "notification delivered");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(?err, chat_id, "notification delivery failed");
                }
            }
        }

        info!(
            recipients = report.recipients,
            delivered = report.delivered,
            failed = report.failed,
            "notifications dispatched"
        );
        Ok(report)
    }
}

pub fn format_event(event: &ChangeEvent, artikul: &str, product_name: &str) -> String {
    match *event {
        ChangeEvent::PriceChanged { old, new } => {
            format_price_message(artikul, product_name, old, new)
        }
        ChangeEvent::QuantityChanged { old, new } => {
            format_quantity_message(artikul, product_name, old, new)
        }
    }
}

pub fn format_price_message(artikul: &str, name: &str, old: Decimal, new: Decimal) -> String {
    let delta = new - old;
    let direction = if delta < Decimal::ZERO { "dropped" } else { "rose" };
    format!(
        "💰 Price change for {name}!\n\n\
         Artikul: {artikul}\n\
         Old price: {old} ₽\n\
         New price: {new} ₽\n\
         Price {direction} by {delta} ₽ ({pct:.1}%)\n\n\
         🔗 {link}",
        name = name,
        artikul = artikul,
        old = group_amount(old),
        new = group_amount(new),
        direction = direction,
        delta = group_amount(delta.abs()),
        pct = percent_change(old, delta),
        link = product_link(artikul),
    )
}

pub fn format_quantity_message(artikul: &str, name: &str, old: i64, new: i64) -> String {
    let delta = new - old;
    let direction = if delta > 0 { "increased" } else { "decreased" };
    format!(
        "📦 Stock change for {name}!\n\n\
         Artikul: {artikul}\n\
         Old quantity: {old} pcs\n\
         New quantity: {new} pcs\n\
         Quantity {direction} by {delta} pcs ({pct:.1}%)\n\n\
         🔗 {link}",
        name = name,
        artikul = artikul,
        old = group_digits(old),
        new = group_digits(new),
        direction = direction,
        delta = group_digits(delta.abs()),
        pct = percent_change(Decimal::from(old), Decimal::from(delta)),
        link = product_link(artikul),
    )
}

pub fn product_link(artikul: &str) -> String {
    format!("https://www.wildberries.ru/catalog/{}/detail.aspx", artikul)
}

/// Absolute change relative to `old`, one decimal; 100% when `old` is zero.
fn percent_change(old: Decimal, delta: Decimal) -> Decimal {
    if old.is_zero() {
        return Decimal::ONE_HUNDRED;
    }
    (delta.abs() / old.abs() * Decimal::ONE_HUNDRED).round_dp(1)
}

/// `1234567.5` -> `1,234,567.50`
fn group_amount(value: Decimal) -> String {
    let rendered = format!("{:.2}", value.round_dp(2));
    let (int_part, frac_part) = rendered.split_once('.').unwrap_or((rendered.as_str(), "00"));
    let (sign, digits) = match int_part.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", int_part),
    };
    format!("{}{}.{}", sign, group_str(digits), frac_part)
}

fn group_digits(value: i64) -> String {
    let sign = if value < 0 { "-" } else { "" };
    format!("{}{}", sign, group_str(&value.unsigned_abs().to_string()))
}

fn group_str(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
