//! Payment reconciliation engine.
//!
//! Turns payment-provider events into durable purchases, entitlements, and
//! membership state. Two ingestion paths feed one pipeline: signed webhook
//! deliveries and client-initiated verification after checkout redirect.
//! Every stage is idempotent so the paths can overlap freely.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod catalog;
pub mod client;
pub mod error;
pub mod event_store;
pub mod identity;
pub mod materializer;
pub mod membership;
pub mod orchestrator;
pub mod record;
pub mod verifier;

#[cfg(test)]
mod edge_case_tests;

pub use catalog::{Catalog, Item};
pub use client::{StripeClient, StripeConfig};
pub use error::{ReconcileError, ReconcileResult};
pub use event_store::{ClaimOutcome, EventStore, StoredEvent};
pub use identity::{IdentityResolver, ResolvedUser, ResolvedVia};
pub use materializer::{purchase_id, MaterializedPurchase, Materializer};
pub use membership::{MembershipChange, MembershipService};
pub use orchestrator::{
    ClientVerification, ReconcileService, ReplaySummary, RetryPolicy, WebhookOutcome,
};
pub use record::{BuyerSignals, ItemSignals, PaymentRecord, PaymentState, ProviderObjectType};
pub use verifier::Verifier;
