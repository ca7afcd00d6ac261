//! Stripe client wrapper.
//!
//! Clients are constructed explicitly by the process entry point and passed
//! in; there are no lazily-initialized module-level singletons. The wrapper
//! also knows how to scope itself to a connected account, which the verifier
//! needs for marketplace charges that settled on a creator's account.

use std::time::Duration;

use crate::error::{ReconcileError, ReconcileResult};

/// Stripe configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Bound on every outbound provider call. A timeout is treated as a
    /// transient failure, eligible for the infra-retry path.
    pub request_timeout: Duration,
}

impl StripeConfig {
    pub fn from_env() -> ReconcileResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| ReconcileError::Config("STRIPE_SECRET_KEY not set".into()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| ReconcileError::Config("STRIPE_WEBHOOK_SECRET not set".into()))?;
        let request_timeout = std::env::var("STRIPE_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(15));

        Ok(Self {
            secret_key,
            webhook_secret,
            request_timeout,
        })
    }
}

/// Cloneable handle around the async-stripe client plus our config.
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> ReconcileResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    /// Platform-account client.
    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// A client scoped to a connected account via the Stripe-Account header.
    /// Session ids from connected-account charges are not retrievable from
    /// the platform account context.
    pub fn for_account(&self, account_id: &str) -> ReconcileResult<stripe::Client> {
        let parsed: stripe::AccountId = account_id.parse().map_err(|_| {
            ReconcileError::Config(format!("invalid connected account id: {account_id}"))
        })?;
        Ok(self.inner.clone().with_stripe_account(parsed))
    }

    /// Run a provider call with the configured bound. A timeout maps to the
    /// transient `ProviderApi` class; the provider's own error is handed
    /// back so the caller can tell a 404 from an outage.
    pub async fn bounded<T, F>(
        &self,
        what: &str,
        fut: F,
    ) -> ReconcileResult<Result<T, stripe::StripeError>>
    where
        F: std::future::Future<Output = Result<T, stripe::StripeError>>,
    {
        match tokio::time::timeout(self.config.request_timeout, fut).await {
            Ok(result) => Ok(result),
            Err(_) => Err(ReconcileError::ProviderApi(format!(
                "{what}: timed out after {:?}",
                self.config.request_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_maps_to_transient_provider_error() {
        let config = StripeConfig {
            secret_key: "sk_test_x".into(),
            webhook_secret: "whsec_x".into(),
            request_timeout: Duration::from_millis(10),
        };
        let client = StripeClient::new(config);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let err = rt
            .block_on(client.bounded("sleep", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), stripe::StripeError>(())
            }))
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn bounded_hands_back_provider_result() {
        let client = StripeClient::new(StripeConfig {
            secret_key: "sk_test_x".into(),
            webhook_secret: "whsec_x".into(),
            request_timeout: Duration::from_secs(1),
        });

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let inner = rt
            .block_on(client.bounded("quick", async { Ok::<i64, stripe::StripeError>(7) }))
            .unwrap();
        assert_eq!(inner.unwrap(), 7);
    }

    #[test]
    fn invalid_connected_account_rejected() {
        let client = StripeClient::new(StripeConfig {
            secret_key: "sk_test_x".into(),
            webhook_secret: "whsec_x".into(),
            request_timeout: Duration::from_secs(1),
        });
        assert!(client.for_account("not an account id").is_err());
    }
}
