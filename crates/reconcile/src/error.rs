//! Error taxonomy for the reconciliation engine.
//!
//! Components return typed errors; only the orchestrator decides whether an
//! error is retried or terminal. The split that matters operationally is
//! `is_transient()`: transient infrastructure failures are retried with
//! backoff, logical failures (bad signature, unresolvable user, missing
//! provider object) are terminal and surfaced for manual follow-up.

use thiserror::Error;

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Webhook signature mismatch, expired timestamp, or malformed payload.
    /// Terminal: redelivery of a forged or mangled event cannot succeed.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// The provider object (session/invoice/subscription) could not be
    /// retrieved from any account context. Terminal.
    #[error("provider object not found: {0}")]
    ObjectNotFound(String),

    /// No application user could be resolved from the payment's buyer
    /// signals. Terminal for automatic processing; queued for manual
    /// reconciliation, since retrying cannot fill a metadata gap.
    #[error("user not resolved: {0}")]
    UserNotResolved(String),

    /// The purchased item referenced by the payment does not exist in the
    /// catalog. Terminal.
    #[error("item not found: {0}")]
    ItemNotFound(String),

    /// Durable store unavailable or failed mid-write. Transient: retried
    /// with backoff, then escalated.
    #[error("store failure: {0}")]
    TransientStore(String),

    /// Stripe API error or bounded-timeout expiry on a provider call.
    /// Transient.
    #[error("provider API failure: {0}")]
    ProviderApi(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ReconcileError {
    /// Whether the orchestrator should retry this failure.
    ///
    /// Blindly retrying logical failures risks infinite redelivery loops
    /// from the provider; not retrying infrastructure failures risks
    /// silently losing a paid purchase.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReconcileError::TransientStore(_) | ReconcileError::ProviderApi(_)
        )
    }

    /// Short machine-readable tag stored in the event record and returned
    /// by the webhook endpoint.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::InvalidEvent(_) => "invalid_event",
            ReconcileError::ObjectNotFound(_) => "object_not_found",
            ReconcileError::UserNotResolved(_) => "user_not_resolved",
            ReconcileError::ItemNotFound(_) => "item_not_found",
            ReconcileError::TransientStore(_) => "transient_store",
            ReconcileError::ProviderApi(_) => "provider_api",
            ReconcileError::Config(_) => "config",
        }
    }
}

impl From<sqlx::Error> for ReconcileError {
    fn from(e: sqlx::Error) -> Self {
        ReconcileError::TransientStore(e.to_string())
    }
}

impl From<stripe::StripeError> for ReconcileError {
    fn from(e: stripe::StripeError) -> Self {
        ReconcileError::ProviderApi(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ReconcileError::TransientStore("pool closed".into()).is_transient());
        assert!(ReconcileError::ProviderApi("timeout".into()).is_transient());
        assert!(!ReconcileError::InvalidEvent("bad sig".into()).is_transient());
        assert!(!ReconcileError::UserNotResolved("no signals".into()).is_transient());
        assert!(!ReconcileError::ObjectNotFound("cs_x".into()).is_transient());
        assert!(!ReconcileError::ItemNotFound("item_x".into()).is_transient());
    }

    #[test]
    fn sqlx_errors_map_to_transient() {
        let e: ReconcileError = sqlx::Error::PoolTimedOut.into();
        assert!(e.is_transient());
        assert_eq!(e.kind(), "transient_store");
    }
}
