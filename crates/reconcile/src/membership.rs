//! Membership tier maintenance.
//!
//! All three subscription-bearing event shapes (checkout session, invoice,
//! subscription lifecycle) converge on one `MembershipChange` and one
//! `apply` write path. Tier is derived from status, never set directly, so
//! the invariant "creator_pro implies active or trialing" holds by
//! construction. Demotion on past_due or canceled is immediate.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use makerbox_shared::{MembershipStatus, MembershipTier};

use crate::error::ReconcileResult;
use crate::record::{PaymentRecord, ProviderObjectType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub status: MembershipStatus,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
}

impl MembershipChange {
    /// The tier this change lands the user on. Derived, never stored
    /// independently of status.
    pub fn tier(&self) -> MembershipTier {
        if self.status.supports_pro_tier() {
            MembershipTier::CreatorPro
        } else {
            MembershipTier::Free
        }
    }

    /// Build from an authoritative subscription object. The other event
    /// shapes reach this constructor after the orchestrator re-fetches the
    /// linked subscription.
    pub fn from_subscription(sub: &stripe::Subscription) -> ReconcileResult<Self> {
        let record = PaymentRecord::from_subscription(sub, None, None)?;
        Ok(Self {
            // from_subscription always sets the status
            status: record
                .subscription_status
                .unwrap_or(MembershipStatus::Canceled),
            stripe_customer_id: record.buyer.customer_id.clone(),
            stripe_subscription_id: record.subscription_id.clone(),
            current_period_end: record.current_period_end,
        })
    }

    /// Build directly from a normalized subscription-shaped record.
    pub fn from_record(record: &PaymentRecord) -> Option<Self> {
        if record.object_type != ProviderObjectType::Subscription {
            return None;
        }
        Some(Self {
            status: record.subscription_status?,
            stripe_customer_id: record.buyer.customer_id.clone(),
            stripe_subscription_id: record.subscription_id.clone(),
            current_period_end: record.current_period_end,
        })
    }
}

#[derive(Clone)]
pub struct MembershipService {
    pool: PgPool,
}

impl MembershipService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply a membership change for a user. Upgrades and demotions go
    /// through this same upsert; the latest provider state wins.
    pub async fn apply(&self, user_id: Uuid, change: &MembershipChange) -> ReconcileResult<()> {
        let tier = change.tier();

        sqlx::query(
            r#"
            INSERT INTO memberships
                (user_id, tier, status, stripe_customer_id,
                 stripe_subscription_id, current_period_end, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (user_id) DO UPDATE
                SET tier = EXCLUDED.tier,
                    status = EXCLUDED.status,
                    stripe_customer_id = COALESCE(EXCLUDED.stripe_customer_id,
                                                  memberships.stripe_customer_id),
                    stripe_subscription_id = COALESCE(EXCLUDED.stripe_subscription_id,
                                                      memberships.stripe_subscription_id),
                    current_period_end = EXCLUDED.current_period_end,
                    updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(tier.as_str())
        .bind(change.status.as_str())
        .bind(&change.stripe_customer_id)
        .bind(&change.stripe_subscription_id)
        .bind(change.current_period_end)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            %user_id,
            tier = tier.as_str(),
            status = change.status.as_str(),
            "membership applied"
        );
        Ok(())
    }

    pub async fn current_tier(&self, user_id: Uuid) -> ReconcileResult<MembershipTier> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT tier FROM memberships WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row
            .and_then(|(t,)| MembershipTier::parse(&t))
            .unwrap_or(MembershipTier::Free))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(status: MembershipStatus) -> MembershipChange {
        MembershipChange {
            status,
            stripe_customer_id: Some("cus_1".into()),
            stripe_subscription_id: Some("sub_1".into()),
            current_period_end: None,
        }
    }

    #[test]
    fn tier_follows_status() {
        assert_eq!(change(MembershipStatus::Active).tier(), MembershipTier::CreatorPro);
        assert_eq!(
            change(MembershipStatus::Trialing).tier(),
            MembershipTier::CreatorPro
        );
        assert_eq!(change(MembershipStatus::PastDue).tier(), MembershipTier::Free);
        assert_eq!(change(MembershipStatus::Canceled).tier(), MembershipTier::Free);
    }

    #[test]
    fn from_record_requires_subscription_shape() {
        use crate::record::{BuyerSignals, ItemSignals, PaymentState};

        let session_record = PaymentRecord {
            provider_event_id: None,
            provider_object_id: "cs_1".into(),
            object_type: ProviderObjectType::Session,
            payment_state: PaymentState::Paid,
            amount_cents: 900,
            currency: "usd".into(),
            connected_account_id: None,
            buyer: BuyerSignals::default(),
            item: ItemSignals::default(),
            payment_intent_id: None,
            subscription_id: Some("sub_1".into()),
            subscription_status: None,
            current_period_end: None,
        };
        assert!(MembershipChange::from_record(&session_record).is_none());

        let sub_record = PaymentRecord {
            object_type: ProviderObjectType::Subscription,
            subscription_status: Some(MembershipStatus::Active),
            ..session_record
        };
        let change = MembershipChange::from_record(&sub_record).unwrap();
        assert_eq!(change.tier(), MembershipTier::CreatorPro);
    }
}
