//! Wildberries price and stock watcher: polls subscribed products, records
//! changes, and notifies subscribers over Telegram.

pub mod config;
pub mod db;
pub mod detector;
pub mod handlers;
pub mod model;
pub mod notifier;
pub mod pipeline;
pub mod ratelimit;
pub mod retention;
pub mod scheduler;
pub mod selector;
pub mod wb;
