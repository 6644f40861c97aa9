//! PlanSync Shared Types and Utilities
//!
//! This crate contains the domain types, errors, and database helpers shared
//! by the entitlement library and the background worker.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
