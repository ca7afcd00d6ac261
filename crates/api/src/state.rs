//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use makerbox_reconcile::{ReconcileService, RetryPolicy, StripeClient};

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub reconcile: Arc<ReconcileService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let client = StripeClient::from_env()?;
        let reconcile = Arc::new(ReconcileService::new(
            client,
            pool.clone(),
            RetryPolicy::default(),
        ));
        tracing::info!("reconciliation service initialized");

        Ok(Self {
            pool,
            config,
            reconcile,
        })
    }
}
