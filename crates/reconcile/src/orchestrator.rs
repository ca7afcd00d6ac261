//! Reconciliation orchestrator.
//!
//! Single entry point for every path that turns provider events into
//! purchases: webhook deliveries, client-initiated verification, and replay
//! of failed events. The pipeline is claim, verify, normalize, resolve,
//! materialize; every step is idempotent, so overlapping paths for the same
//! payment converge instead of conflicting.
//!
//! Failure handling is differentiated: transient infrastructure errors are
//! retried here with backoff and then escalated to the caller (the webhook
//! endpoint answers 503 so the provider redelivers), while logical failures
//! are recorded as terminal and acknowledged (200) so the provider stops
//! redelivering something that can never succeed.

use std::time::Duration;

use sqlx::PgPool;
use stripe::{Event, EventObject, EventType};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::client::StripeClient;
use crate::error::{ReconcileError, ReconcileResult};
use crate::event_store::{event_key_from_raw, ClaimOutcome, EventStore};
use crate::identity::{IdentityResolver, ResolvedVia};
use crate::materializer::{MaterializedPurchase, Materializer};
use crate::membership::{MembershipChange, MembershipService};
use crate::record::PaymentRecord;
use crate::verifier::Verifier;

/// Retry policy for transient failures inside one processing attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Terminal outcome of one webhook delivery. All variants are acknowledged
/// to the provider; transient failures surface as `Err` instead.
#[derive(Debug, Clone)]
pub enum WebhookOutcome {
    Processed { event_id: String },
    Duplicate { event_id: String, prior_result: String },
    Ignored { event_id: String, event_type: String },
    Rejected { event_id: String, kind: &'static str, message: String },
}

/// Outcome of client-initiated purchase verification.
#[derive(Debug, Clone)]
pub enum ClientVerification {
    /// Payment confirmed and the purchase is materialized.
    Completed { purchase_id: Uuid },
    /// Payment confirmed, but no user could be resolved automatically; the
    /// event record is queued for manual reconciliation.
    AccessPending,
    /// The provider does not consider this session paid.
    NotPaid,
}

#[derive(Debug, Clone, Default)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// What a processed payment actually changed.
#[derive(Debug, Default)]
struct PaymentEffects {
    purchase: Option<MaterializedPurchase>,
    membership_applied: bool,
}

/// Aggregate service owning the full reconciliation pipeline.
#[derive(Clone)]
pub struct ReconcileService {
    events: EventStore,
    verifier: Verifier,
    identity: IdentityResolver,
    catalog: Catalog,
    materializer: Materializer,
    membership: MembershipService,
    retry: RetryPolicy,
}

impl ReconcileService {
    pub fn new(client: StripeClient, pool: PgPool, retry: RetryPolicy) -> Self {
        Self {
            events: EventStore::new(pool.clone()),
            verifier: Verifier::new(client, pool.clone()),
            identity: IdentityResolver::new(pool.clone()),
            catalog: Catalog::new(pool.clone()),
            materializer: Materializer::new(pool.clone()),
            membership: MembershipService::new(pool),
            retry,
        }
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    pub fn materializer(&self) -> &Materializer {
        &self.materializer
    }

    pub fn membership(&self) -> &MembershipService {
        &self.membership
    }

    /// Process one webhook delivery.
    ///
    /// The raw payload is recorded and claimed before signature
    /// verification so that even rejected deliveries leave an audit row.
    /// `Err` is returned only for transient failures after retries; every
    /// logical decision comes back as a `WebhookOutcome`.
    pub async fn process_webhook(
        &self,
        body: &str,
        signature_header: &str,
    ) -> ReconcileResult<WebhookOutcome> {
        let (event_id, event_type, payload) = event_key_from_raw(body);

        match self
            .with_retry("record and claim event", || {
                self.events.record_and_claim(&event_id, &event_type, &payload)
            })
            .await?
        {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::Duplicate { prior_result } => {
                return Ok(WebhookOutcome::Duplicate {
                    event_id,
                    prior_result,
                });
            }
        }

        let event = match self.verifier.verify_signature(body, signature_header) {
            Ok(event) => event,
            Err(e) => return self.reject(&event_id, e).await,
        };

        match self.route_event(&event).await {
            Ok(Some(_effects)) => {
                self.with_retry("mark event succeeded", || {
                    self.events.mark_succeeded(&event_id)
                })
                .await?;
                Ok(WebhookOutcome::Processed { event_id })
            }
            Ok(None) => {
                self.with_retry("mark event succeeded", || {
                    self.events.mark_succeeded(&event_id)
                })
                .await?;
                tracing::debug!(event_id, event_type, "event type not reconciled");
                Ok(WebhookOutcome::Ignored {
                    event_id,
                    event_type,
                })
            }
            Err(e) if e.is_transient() => {
                // Leave a failed row so redelivery can reclaim immediately,
                // then escalate so the endpoint answers 503.
                self.events
                    .mark_failed(&event_id, e.kind(), &e.to_string())
                    .await
                    .ok();
                tracing::error!(event_id, error = %e, "transient failure exhausted retries");
                Err(e)
            }
            Err(e) => self.reject(&event_id, e).await,
        }
    }

    /// Client-pull verification of a checkout session. Always re-fetches
    /// provider state; the client's claim of success is never trusted.
    ///
    /// Once the provider has confirmed payment, reconciliation gaps
    /// (stripped metadata, unknown item, unresolvable buyer) come back as
    /// `AccessPending` instead of an error. The buyer has paid; only
    /// infrastructure failures surface as `Err`.
    pub async fn verify_client_session(
        &self,
        session_id: &str,
        claimed_item_id: Option<Uuid>,
    ) -> ReconcileResult<ClientVerification> {
        // A purchase already materialized for this (session, item) pair
        // needs no provider round trip.
        if let Some(item_id) = claimed_item_id {
            let status = self
                .with_retry("check existing purchase", || {
                    self.materializer.purchase_status(session_id, item_id)
                })
                .await?;
            if status == Some(makerbox_shared::PurchaseStatus::Completed) {
                return Ok(ClientVerification::Completed {
                    purchase_id: crate::materializer::purchase_id(session_id, item_id),
                });
            }
        }

        let hint = self.catalog.account_hint(claimed_item_id).await?;
        let (session, account) = self
            .with_retry("fetch session for client verification", || {
                self.verifier.fetch_session(session_id, hint.as_deref())
            })
            .await?;

        let mut record = PaymentRecord::from_checkout_session(&session, None, account);
        if record.item.item_id.is_none() {
            // Provider metadata wins; the client's item id only fills a gap.
            record.item.item_id = claimed_item_id;
        }

        if !record.is_actionable() {
            return Ok(ClientVerification::NotPaid);
        }

        match self.handle_payment(&record).await {
            Ok(effects) => match effects.purchase {
                Some(purchase) => Ok(ClientVerification::Completed {
                    purchase_id: purchase.purchase_id,
                }),
                None => Ok(ClientVerification::AccessPending),
            },
            Err(e) => {
                if pending_on_terminal(&e) {
                    tracing::warn!(
                        session_id,
                        error = %e,
                        "paid session not reconcilable yet, queued for manual review"
                    );
                    Ok(ClientVerification::AccessPending)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Re-run processing for stored failed events, oldest first.
    pub async fn replay_failed(&self, limit: i64) -> ReconcileResult<ReplaySummary> {
        let mut summary = ReplaySummary::default();

        for stored in self.events.list_failed(limit).await? {
            // Rows rejected at signature verification were never
            // authenticated; replaying them would process untrusted data.
            if stored.processing_result == "failed:invalid_event" {
                continue;
            }
            let event_id = stored.stripe_event_id.clone();
            match self
                .events
                .record_and_claim(&event_id, &stored.event_type, &stored.raw_payload)
                .await?
            {
                ClaimOutcome::Claimed => {}
                ClaimOutcome::Duplicate { .. } => continue,
            }
            summary.replayed += 1;

            let event: Event = match serde_json::from_value(stored.raw_payload.clone()) {
                Ok(event) => event,
                Err(e) => {
                    // Typically a payload stored under a digest key after a
                    // signature failure; it will never parse.
                    self.events
                        .mark_failed(&event_id, "invalid_event", &format!("unparsable: {e}"))
                        .await?;
                    summary.failed += 1;
                    continue;
                }
            };

            match self.route_event(&event).await {
                Ok(_) => {
                    self.events.mark_succeeded(&event_id).await?;
                    summary.succeeded += 1;
                }
                Err(e) => {
                    self.events
                        .mark_failed(&event_id, e.kind(), &e.to_string())
                        .await?;
                    summary.failed += 1;
                }
            }
        }

        if summary.replayed > 0 {
            tracing::info!(
                replayed = summary.replayed,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "replay pass finished"
            );
        }
        Ok(summary)
    }

    /// Maintenance sweep: reset abandoned claims and re-derive any
    /// entitlements missing for completed purchases.
    pub async fn maintenance_sweep(&self) -> ReconcileResult<()> {
        self.events.reset_stuck().await?;
        self.materializer.grant_missing_entitlements().await?;
        Ok(())
    }

    /// Route a verified event to its handler. `Ok(None)` means the event
    /// type is not reconciled.
    async fn route_event(&self, event: &Event) -> ReconcileResult<Option<PaymentEffects>> {
        match event.type_ {
            EventType::CheckoutSessionCompleted => {
                let record = self.authoritative_session_record(event).await?;
                self.handle_paid_record(record).await.map(Some)
            }
            EventType::InvoicePaid | EventType::InvoicePaymentSucceeded => {
                let record = self.authoritative_invoice_record(event).await?;
                self.handle_paid_record(record).await.map(Some)
            }
            EventType::CustomerSubscriptionCreated
            | EventType::CustomerSubscriptionUpdated
            | EventType::CustomerSubscriptionDeleted => {
                self.handle_subscription_event(event).await.map(Some)
            }
            EventType::ChargeRefunded => self.handle_refund(event).await.map(Some),
            _ => Ok(None),
        }
    }

    /// Re-fetch the session named by the event and normalize it. The event
    /// payload is only trusted for the object id and the account scope.
    async fn authoritative_session_record(&self, event: &Event) -> ReconcileResult<PaymentRecord> {
        let EventObject::CheckoutSession(payload_session) = &event.data.object else {
            return Err(ReconcileError::InvalidEvent(
                "checkout event without session object".into(),
            ));
        };

        let hinted = PaymentRecord::from_checkout_session(payload_session, None, None);
        let account = match &event.account {
            Some(account) => Some(account.clone()),
            None => self.catalog.account_hint(hinted.item.item_id).await?,
        };

        let session_id = payload_session.id.to_string();
        let (session, found_account) = self
            .with_retry("fetch session", || {
                self.verifier.fetch_session(&session_id, account.as_deref())
            })
            .await?;

        Ok(PaymentRecord::from_checkout_session(
            &session,
            Some(event.id.to_string()),
            session_account(found_account, event.account.as_deref()),
        ))
    }

    async fn authoritative_invoice_record(&self, event: &Event) -> ReconcileResult<PaymentRecord> {
        let EventObject::Invoice(payload_invoice) = &event.data.object else {
            return Err(ReconcileError::InvalidEvent(
                "invoice event without invoice object".into(),
            ));
        };

        let invoice_id = payload_invoice.id.to_string();
        let invoice = self
            .with_retry("fetch invoice", || {
                self.verifier.fetch_invoice(&invoice_id, event.account.as_deref())
            })
            .await?;

        Ok(PaymentRecord::from_invoice(
            &invoice,
            Some(event.id.to_string()),
            event.account.clone(),
        ))
    }

    /// Paid session or invoice: resolve the buyer, then materialize the
    /// purchase and/or apply the membership change the payment implies.
    async fn handle_paid_record(&self, record: PaymentRecord) -> ReconcileResult<PaymentEffects> {
        if !record.is_actionable() {
            tracing::info!(
                provider_object_id = %record.provider_object_id,
                state = ?record.payment_state,
                "payment not in paid state, nothing to materialize"
            );
            return Ok(PaymentEffects::default());
        }
        self.handle_payment(&record).await
    }

    async fn handle_payment(&self, record: &PaymentRecord) -> ReconcileResult<PaymentEffects> {
        let resolved = self
            .with_retry("resolve buyer", || self.identity.resolve(&record.buyer))
            .await?;

        tracing::info!(
            provider_object_id = %record.provider_object_id,
            user_id = %resolved.user_id,
            via = resolved.via.as_str(),
            "buyer resolved"
        );

        if resolved.via != ResolvedVia::CustomerId {
            if let Some(customer_id) = &record.buyer.customer_id {
                self.with_retry("link customer id", || {
                    self.identity.link_customer(resolved.user_id, customer_id)
                })
                .await?;
            }
        }

        let mut effects = PaymentEffects::default();

        if let Some(item_id) = record.item.item_id {
            let item = self
                .with_retry("load item", || self.catalog.get(item_id))
                .await?;
            let purchase = self
                .with_retry("materialize purchase", || {
                    self.materializer.materialize(record, resolved.user_id, &item)
                })
                .await?;
            effects.purchase = Some(purchase);

            if item.kind == makerbox_shared::ItemKind::SubscriptionPlan {
                effects.membership_applied = self
                    .apply_membership_from_linked_subscription(record, resolved.user_id)
                    .await?;
            }
        } else if record.subscription_id.is_some() {
            effects.membership_applied = self
                .apply_membership_from_linked_subscription(record, resolved.user_id)
                .await?;
        } else {
            return Err(ReconcileError::InvalidEvent(format!(
                "payment {} carries neither item metadata nor a subscription",
                record.provider_object_id
            )));
        }

        Ok(effects)
    }

    /// Fetch the subscription linked to a session or invoice and apply the
    /// membership change it dictates. All upgrade paths converge here.
    async fn apply_membership_from_linked_subscription(
        &self,
        record: &PaymentRecord,
        user_id: Uuid,
    ) -> ReconcileResult<bool> {
        let Some(subscription_id) = &record.subscription_id else {
            return Ok(false);
        };

        let subscription = self
            .with_retry("fetch linked subscription", || {
                self.verifier
                    .fetch_subscription(subscription_id, record.connected_account_id.as_deref())
            })
            .await?;

        let change = MembershipChange::from_subscription(&subscription)?;
        self.with_retry("apply membership", || {
            self.membership.apply(user_id, &change)
        })
        .await?;
        Ok(true)
    }

    /// Subscription lifecycle events drive membership only, never purchase
    /// rows. Demotion on past_due or canceled is immediate.
    async fn handle_subscription_event(&self, event: &Event) -> ReconcileResult<PaymentEffects> {
        let EventObject::Subscription(payload_sub) = &event.data.object else {
            return Err(ReconcileError::InvalidEvent(
                "subscription event without subscription object".into(),
            ));
        };

        // Deleted subscriptions cannot be re-fetched as current state; the
        // payload is authoritative for them.
        let record = if event.type_ == EventType::CustomerSubscriptionDeleted {
            PaymentRecord::from_subscription(
                payload_sub,
                Some(event.id.to_string()),
                event.account.clone(),
            )?
        } else {
            let sub_id = payload_sub.id.to_string();
            let subscription = self
                .with_retry("fetch subscription", || {
                    self.verifier
                        .fetch_subscription(&sub_id, event.account.as_deref())
                })
                .await?;
            PaymentRecord::from_subscription(
                &subscription,
                Some(event.id.to_string()),
                event.account.clone(),
            )?
        };

        let resolved = self
            .with_retry("resolve subscriber", || self.identity.resolve(&record.buyer))
            .await?;

        let change = MembershipChange::from_record(&record).ok_or_else(|| {
            ReconcileError::InvalidEvent("subscription record without status".into())
        })?;
        self.with_retry("apply membership", || {
            self.membership.apply(resolved.user_id, &change)
        })
        .await?;

        Ok(PaymentEffects {
            purchase: None,
            membership_applied: true,
        })
    }

    /// A refunded charge flips the purchases of the payment object it
    /// settled and revokes their entitlements.
    async fn handle_refund(&self, event: &Event) -> ReconcileResult<PaymentEffects> {
        let EventObject::Charge(charge) = &event.data.object else {
            return Err(ReconcileError::InvalidEvent(
                "refund event without charge object".into(),
            ));
        };

        // Invoice-backed charges key purchases by invoice id; one-time
        // session charges key by the payment intent persisted at
        // materialization time.
        let flipped = if let Some(invoice) = &charge.invoice {
            let invoice_id = crate::record::expandable_id(invoice);
            self.with_retry("mark refunded", || {
                self.materializer.mark_refunded(&invoice_id)
            })
            .await?
        } else if let Some(pi) = &charge.payment_intent {
            let pi_id = crate::record::expandable_id(pi);
            self.with_retry("mark refunded", || {
                self.materializer.mark_refunded_by_payment_intent(&pi_id)
            })
            .await?
        } else {
            return Err(ReconcileError::InvalidEvent(format!(
                "refunded charge {} has no invoice or payment intent",
                charge.id
            )));
        };

        if flipped == 0 {
            tracing::info!(charge_id = %charge.id, "refund with no completed purchases to flip");
        }
        Ok(PaymentEffects::default())
    }

    async fn reject(
        &self,
        event_id: &str,
        error: ReconcileError,
    ) -> ReconcileResult<WebhookOutcome> {
        let kind = error.kind();
        let message = error.to_string();
        self.with_retry("mark event failed", || {
            self.events.mark_failed(event_id, kind, &message)
        })
        .await?;
        tracing::warn!(event_id, kind, reason = %message, "event rejected terminally");
        Ok(WebhookOutcome::Rejected {
            event_id: event_id.to_string(),
            kind,
            message,
        })
    }

    /// Retry transient failures with jittered exponential backoff; logical
    /// failures abort immediately.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut action: F) -> ReconcileResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ReconcileResult<T>>,
    {
        let strategy = ExponentialBackoff::from_millis(self.retry.base_delay.as_millis() as u64)
            .max_delay(self.retry.max_delay)
            .map(jitter)
            .take(self.retry.max_attempts);

        let mut attempt = 0usize;
        RetryIf::spawn(
            strategy,
            || {
                attempt += 1;
                if attempt > 1 {
                    tracing::debug!(what, attempt, "retrying after transient failure");
                }
                action()
            },
            |e: &ReconcileError| e.is_transient(),
        )
        .await
        .map_err(|e| {
            if e.is_transient() {
                tracing::warn!(what, attempts = attempt, error = %e, "retries exhausted");
            }
            e
        })
    }
}

/// Account context stored on a session-derived record: the context the
/// fetch actually succeeded under wins over the event's account header.
fn session_account(found: Option<String>, event_account: Option<&str>) -> Option<String> {
    found.or_else(|| event_account.map(str::to_string))
}

/// Whether a failure after the provider confirmed payment should surface to
/// the buyer as "access pending" rather than an error. Logical gaps qualify;
/// infrastructure failures never do, they escalate for retry.
fn pending_on_terminal(error: &ReconcileError) -> bool {
    !error.is_transient()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retry_policy_is_bounded() {
        let policy = RetryPolicy::default();
        assert!(policy.max_attempts >= 1);
        assert!(policy.base_delay < policy.max_delay);
    }

    #[test]
    fn connected_account_context_survives_into_the_record() {
        // A session found on a connected account must carry that account,
        // even when the triggering path had no account header (client pull)
        // or the platform probe missed.
        assert_eq!(
            session_account(Some("acct_creator".into()), None),
            Some("acct_creator".to_string())
        );
        assert_eq!(
            session_account(Some("acct_creator".into()), Some("acct_header")),
            Some("acct_creator".to_string())
        );
        assert_eq!(
            session_account(None, Some("acct_header")),
            Some("acct_header".to_string())
        );
        assert_eq!(session_account(None, None), None);
    }

    #[test]
    fn paid_buyer_reconciliation_gaps_become_pending_not_errors() {
        // Stripped metadata or an unknown item on a confirmed-paid session
        // must not bounce the buyer with a 4xx.
        let gaps = [
            ReconcileError::InvalidEvent("no item metadata, no subscription".into()),
            ReconcileError::ItemNotFound("item withdrawn".into()),
            ReconcileError::UserNotResolved("ambiguous email".into()),
            ReconcileError::ObjectNotFound("linked subscription gone".into()),
        ];
        for e in gaps {
            assert!(pending_on_terminal(&e), "{e} should read as pending");
        }

        let infra = [
            ReconcileError::TransientStore("pool timeout".into()),
            ReconcileError::ProviderApi("502".into()),
        ];
        for e in infra {
            assert!(!pending_on_terminal(&e), "{e} must escalate");
        }
    }
}
