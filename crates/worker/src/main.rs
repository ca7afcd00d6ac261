//! Makerbox Background Worker
//!
//! Scheduled reconciliation jobs:
//! - Replay of failed provider events (every 5 minutes)
//! - Maintenance sweep: reset abandoned claims, re-derive missing
//!   entitlements (every 15 minutes)
//! - Heartbeat (every 5 minutes)
//!
//! Every job runs operations that are idempotent in the engine, so the
//! worker can overlap freely with webhook processing and client
//! verification.

use std::sync::Arc;
use std::time::Duration;

use makerbox_reconcile::{ReconcileService, RetryPolicy, StripeClient};
use makerbox_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Failed events replayed per pass. Small on purpose: the job runs often
/// and each replay may hit the provider API.
const REPLAY_BATCH: i64 = 25;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting Makerbox Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let reconcile = match StripeClient::from_env() {
        Ok(client) => Arc::new(ReconcileService::new(client, pool, RetryPolicy::default())),
        Err(e) => {
            // Without provider credentials no replay can verify anything.
            warn!(error = %e, "Stripe not configured - running in heartbeat-only mode");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Replay failed events (every 5 minutes)
    let replay_service = reconcile.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let service = replay_service.clone();
            Box::pin(async move {
                info!("Running failed-event replay");
                match service.replay_failed(REPLAY_BATCH).await {
                    Ok(summary) => info!(
                        replayed = summary.replayed,
                        succeeded = summary.succeeded,
                        failed = summary.failed,
                        "Replay pass complete"
                    ),
                    Err(e) => error!(error = %e, "Replay pass failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Failed-event replay (every 5 minutes)");

    // Job 2: Maintenance sweep (every 15 minutes)
    let sweep_service = reconcile.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let service = sweep_service.clone();
            Box::pin(async move {
                info!("Running maintenance sweep");
                if let Err(e) = service.maintenance_sweep().await {
                    error!(error = %e, "Maintenance sweep failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Maintenance sweep (every 15 minutes)");

    // Job 3: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Makerbox Worker started with 3 scheduled jobs");

    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
