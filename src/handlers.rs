use crate::db::{self, Pool, UserSubscriptionView};
use crate::pipeline::{RunOutcome, UpdatePipeline};
use crate::ratelimit::RateLimiter;
use anyhow::Result;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use teloxide::prelude::*;
use thiserror::Error;
use tracing::{info, instrument, warn};

static ARTIKUL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,15}$").expect("valid regex"));

pub const HELP_TEXT: &str = "Wildberries price watcher.\n\n\
/subscribe <artikul> [minutes] - watch a product (default interval if omitted)\n\
/unsubscribe <artikul> - stop watching a product\n\
/list - your subscriptions\n\
/product <artikul> - fetch a product now\n\
/ping - health check";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Ping,
    Subscribe {
        artikul: String,
        frequency_minutes: Option<i64>,
    },
    Unsubscribe {
        artikul: String,
    },
    List,
    Product {
        artikul: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Not a command. Send /help for the list of commands.")]
    NotACommand,
    #[error("Unknown command /{0}. Send /help for the list of commands.")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("Invalid artikul {0:?}: expected 1 to 15 digits.")]
    InvalidArtikul(String),
    #[error("Invalid interval {0:?}: expected whole minutes between 1 and 1440.")]
    InvalidFrequency(String),
}

/// Parse a message text into a command. A `@botname` suffix on the command
/// word is ignored.
pub fn parse_command(text: &str) -> Result<Command, CommandError> {
    let mut parts = text.split_whitespace();
    let head = parts.next().ok_or(CommandError::NotACommand)?;
    let name = head.strip_prefix('/').ok_or(CommandError::NotACommand)?;
    let name = name.split_once('@').map_or(name, |(n, _)| n).to_lowercase();
    let args: Vec<&str> = parts.collect();

    match name.as_str() {
        "start" => Ok(Command::Start),
        "help" => Ok(Command::Help),
        "ping" => Ok(Command::Ping),
        "list" => Ok(Command::List),
        "subscribe" => match args.as_slice() {
            [artikul] => Ok(Command::Subscribe {
                artikul: parse_artikul(artikul)?,
                frequency_minutes: None,
            }),
            [artikul, minutes] => Ok(Command::Subscribe {
                artikul: parse_artikul(artikul)?,
                frequency_minutes: Some(parse_frequency(minutes)?),
            }),
            _ => Err(CommandError::Usage("/subscribe <artikul> [minutes]")),
        },
        "unsubscribe" => match args.as_slice() {
            [artikul] => Ok(Command::Unsubscribe {
                artikul: parse_artikul(artikul)?,
            }),
            _ => Err(CommandError::Usage("/unsubscribe <artikul>")),
        },
        "product" => match args.as_slice() {
            [artikul] => Ok(Command::Product {
                artikul: parse_artikul(artikul)?,
            }),
            _ => Err(CommandError::Usage("/product <artikul>")),
        },
        other => Err(CommandError::Unknown(other.to_string())),
    }
}

fn parse_artikul(raw: &str) -> Result<String, CommandError> {
    if ARTIKUL_RE.is_match(raw) {
        Ok(raw.to_string())
    } else {
        Err(CommandError::InvalidArtikul(raw.to_string()))
    }
}

fn parse_frequency(raw: &str) -> Result<i64, CommandError> {
    raw.parse::<i64>()
        .ok()
        .filter(|m| {
            (crate::model::MIN_FREQUENCY_MINUTES..=crate::model::MAX_FREQUENCY_MINUTES).contains(m)
        })
        .ok_or_else(|| CommandError::InvalidFrequency(raw.to_string()))
}

/// Everything a command needs besides the bot itself.
#[derive(Clone)]
pub struct BotContext {
    pub pool: Pool,
    pub pipeline: Arc<UpdatePipeline>,
    pub allowed_users: Arc<Vec<i64>>,
    pub default_frequency_minutes: i64,
    pub limiter: Arc<RateLimiter<i64>>,
}

/// Telegram user ids are unsigned; ids beyond `i64` range are never allowed.
fn user_allowed(allowed: &[i64], raw_user_id: u64) -> bool {
    match i64::try_from(raw_user_id) {
        Ok(user_id) => allowed.is_empty() || allowed.contains(&user_id),
        Err(_) => false,
    }
}

#[instrument(skip_all, fields(chat_id = msg.chat.id.0))]
pub async fn handle_update(bot: &Bot, ctx: &BotContext, msg: &Message) -> Result<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let chat_id = msg.chat.id.0;
    let user_id = user.id.0;

    let reply = if !user_allowed(&ctx.allowed_users, user_id) {
        warn!(user_id, "refusing user outside allow list");
        "Sorry, you are not allowed to use this bot.".to_string()
    } else if let Err(wait) = ctx.limiter.check(&chat_id, Instant::now()) {
        format!(
            "Too many requests, slow down. Retry in {} s.",
            wait.as_secs().max(1)
        )
    } else {
        match parse_command(text) {
            Ok(cmd) => execute(ctx, chat_id, cmd).await.unwrap_or_else(|err| {
                warn!(?err, "command failed");
                "Something went wrong, please try again later.".to_string()
            }),
            Err(err) => err.to_string(),
        }
    };

    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

/// Run a parsed command for `chat_id` and produce the reply text.
pub async fn execute(ctx: &BotContext, chat_id: i64, cmd: Command) -> Result<String> {
    match cmd {
        Command::Start | Command::Help => Ok(HELP_TEXT.to_string()),
        Command::Ping => Ok("PONG".to_string()),
        Command::Subscribe {
            artikul,
            frequency_minutes,
        } => {
            let minutes = frequency_minutes.unwrap_or(ctx.default_frequency_minutes);
            db::subscribe(&ctx.pool, chat_id, &artikul, minutes, Utc::now()).await?;
            info!(chat_id, %artikul, minutes, "subscribed");
            Ok(format!(
                "Subscribed to {}. Checking every {} min.",
                artikul, minutes
            ))
        }
        Command::Unsubscribe { artikul } => {
            if db::unsubscribe(&ctx.pool, chat_id, &artikul).await? {
                info!(chat_id, %artikul, "unsubscribed");
                Ok(format!("Unsubscribed from {}.", artikul))
            } else {
                Ok(format!("You are not subscribed to {}.", artikul))
            }
        }
        Command::List => {
            let subs = db::list_user_subscriptions(&ctx.pool, chat_id).await?;
            Ok(render_list(&subs))
        }
        Command::Product { artikul } => product_reply(ctx, &artikul).await,
    }
}

async fn product_reply(ctx: &BotContext, artikul: &str) -> Result<String> {
    match ctx.pipeline.run(artikul, Utc::now()).await {
        RunOutcome::FetchFailed { kind, .. } if kind == "not_found" => {
            Ok(format!("Product {} was not found on Wildberries.", artikul))
        }
        RunOutcome::FetchFailed { kind, .. } => Ok(format!(
            "Could not fetch product {} right now ({}). Try again later.",
            artikul, kind
        )),
        RunOutcome::Failed { stage, .. } => Ok(format!(
            "Fetched product {} but {} failed. Try again later.",
            artikul, stage
        )),
        RunOutcome::Updated { .. } | RunOutcome::Skipped => {
            match db::get_product(&ctx.pool, artikul).await? {
                Some(p) => Ok(format!(
                    "{}\nArtikul: {}\nPrice: {} ₽\nRating: {:.1}\nIn stock: {} pcs\n{}",
                    p.name,
                    p.artikul,
                    p.price.round_dp(2),
                    p.rating,
                    p.quantity,
                    crate::notifier::product_link(&p.artikul)
                )),
                None => Ok(format!(
                    "Product {} is being checked already. Try again shortly.",
                    artikul
                )),
            }
        }
    }
}

fn render_list(subs: &[UserSubscriptionView]) -> String {
    if subs.is_empty() {
        return "You have no subscriptions. Use /subscribe <artikul>.".to_string();
    }
    let mut out = String::from("Your subscriptions:\n");
    for s in subs {
        let name = s.name.as_deref().unwrap_or("(not fetched yet)");
        out.push_str(&format!(
            "\n• {} {} every {} min",
            s.artikul, name, s.frequency_minutes
        ));
        if let Some(price) = s.price {
            out.push_str(&format!(", {} ₽", price.round_dp(2)));
        }
        if let Some(qty) = s.quantity {
            out.push_str(&format!(", {} pcs", qty));
        }
    }
    out
}
