//! Database module: view models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: view models returned by join queries.
//! - `repo`: SQL-only functions that map rows into entities from `crate::model`.
//!
//! External modules should import from `wb_pricewatch::db`; the repository API
//! is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::UserSubscriptionView;
