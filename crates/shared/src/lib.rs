#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Makerbox Shared Crate
//!
//! Domain types and database plumbing used by the API server, the
//! reconciliation engine, and the background worker.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{ItemKind, MembershipStatus, MembershipTier, PurchaseStatus};
