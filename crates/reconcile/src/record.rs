//! Canonical payment record.
//!
//! Stripe hands us three differently-shaped objects (checkout session,
//! invoice, subscription). Everything downstream of the verifier works on
//! the single `PaymentRecord` shape normalized here.

use stripe::{CheckoutSession, Invoice, Subscription};
use time::OffsetDateTime;
use uuid::Uuid;

use makerbox_shared::{ItemKind, MembershipStatus};

use crate::error::{ReconcileError, ReconcileResult};

/// Which provider object this record was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderObjectType {
    Session,
    Invoice,
    Subscription,
}

impl ProviderObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderObjectType::Session => "session",
            ProviderObjectType::Invoice => "invoice",
            ProviderObjectType::Subscription => "subscription",
        }
    }
}

/// Normalized payment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    Paid,
    Unpaid,
    NoPaymentRequired,
}

/// Signals that may identify the buying user, in decreasing trust order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuyerSignals {
    /// Set by our checkout flow in provider metadata. Most trustworthy.
    pub explicit_user_id: Option<String>,
    /// Set by our checkout flow as the session's client_reference_id.
    pub client_reference_id: Option<String>,
    /// Provider customer id, mapped through the user directory.
    pub customer_id: Option<String>,
    /// Buyer email. Least trustworthy: collisions are possible.
    pub email: Option<String>,
}

impl BuyerSignals {
    pub fn is_empty(&self) -> bool {
        self.explicit_user_id.is_none()
            && self.client_reference_id.is_none()
            && self.customer_id.is_none()
            && self.email.is_none()
    }
}

/// Signals identifying the purchased item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemSignals {
    pub item_id: Option<Uuid>,
    pub item_kind: Option<ItemKind>,
}

/// Canonical, ephemeral view of a verified provider payment object.
/// Re-derived from provider data each time verification runs.
#[derive(Debug, Clone)]
pub struct PaymentRecord {
    /// Present for webhook-origin records.
    pub provider_event_id: Option<String>,
    pub provider_object_id: String,
    pub object_type: ProviderObjectType,
    pub payment_state: PaymentState,
    pub amount_cents: i64,
    pub currency: String,
    /// Set when the charge settled on a creator's connected account.
    pub connected_account_id: Option<String>,
    pub buyer: BuyerSignals,
    pub item: ItemSignals,
    /// Payment intent backing the charge. Refund events reference this,
    /// not the session or invoice id.
    pub payment_intent_id: Option<String>,
    /// Linked subscription, when the object participates in a recurring
    /// purchase. Drives the membership upgrade path.
    pub subscription_id: Option<String>,
    pub subscription_status: Option<MembershipStatus>,
    pub current_period_end: Option<OffsetDateTime>,
}

impl PaymentRecord {
    /// A record is only actionable for materialization when the provider
    /// confirms payment.
    pub fn is_actionable(&self) -> bool {
        self.payment_state == PaymentState::Paid
    }

    pub fn from_checkout_session(
        session: &CheckoutSession,
        provider_event_id: Option<String>,
        connected_account_id: Option<String>,
    ) -> PaymentRecord {
        let metadata = session.metadata.clone().unwrap_or_default();

        let buyer = BuyerSignals {
            explicit_user_id: metadata.get("user_id").cloned(),
            client_reference_id: session.client_reference_id.clone(),
            customer_id: session.customer.as_ref().map(expandable_id),
            email: session
                .customer_details
                .as_ref()
                .and_then(|d| d.email.clone())
                .or_else(|| session.customer_email.clone()),
        };

        let item = item_signals_from_metadata(&metadata);

        PaymentRecord {
            provider_event_id,
            provider_object_id: session.id.to_string(),
            object_type: ProviderObjectType::Session,
            payment_state: match session.payment_status {
                stripe::CheckoutSessionPaymentStatus::Paid => PaymentState::Paid,
                stripe::CheckoutSessionPaymentStatus::Unpaid => PaymentState::Unpaid,
                stripe::CheckoutSessionPaymentStatus::NoPaymentRequired => {
                    PaymentState::NoPaymentRequired
                }
            },
            amount_cents: session.amount_total.unwrap_or(0),
            currency: currency_or_default(session.currency),
            connected_account_id,
            buyer,
            item,
            payment_intent_id: session.payment_intent.as_ref().map(expandable_id),
            subscription_id: session.subscription.as_ref().map(expandable_id),
            subscription_status: None,
            current_period_end: None,
        }
    }

    pub fn from_invoice(
        invoice: &Invoice,
        provider_event_id: Option<String>,
        connected_account_id: Option<String>,
    ) -> PaymentRecord {
        let metadata = invoice.metadata.clone().unwrap_or_default();

        let paid = invoice.paid.unwrap_or(false)
            || matches!(invoice.status, Some(stripe::InvoiceStatus::Paid));

        let buyer = BuyerSignals {
            explicit_user_id: metadata.get("user_id").cloned(),
            client_reference_id: None,
            customer_id: invoice.customer.as_ref().map(expandable_id),
            email: invoice.customer_email.clone(),
        };

        PaymentRecord {
            provider_event_id,
            provider_object_id: invoice.id.to_string(),
            object_type: ProviderObjectType::Invoice,
            payment_state: if paid {
                PaymentState::Paid
            } else {
                PaymentState::Unpaid
            },
            amount_cents: invoice.amount_paid.unwrap_or(0),
            currency: currency_or_default(invoice.currency),
            connected_account_id,
            buyer,
            item: item_signals_from_metadata(&metadata),
            payment_intent_id: invoice.payment_intent.as_ref().map(expandable_id),
            subscription_id: invoice.subscription.as_ref().map(expandable_id),
            subscription_status: None,
            current_period_end: None,
        }
    }

    pub fn from_subscription(
        sub: &Subscription,
        provider_event_id: Option<String>,
        connected_account_id: Option<String>,
    ) -> ReconcileResult<PaymentRecord> {
        let status = map_subscription_status(sub.status);

        let period_end = OffsetDateTime::from_unix_timestamp(sub.current_period_end)
            .map_err(|e| ReconcileError::InvalidEvent(format!("bad period end: {e}")))?;

        let buyer = BuyerSignals {
            explicit_user_id: sub.metadata.get("user_id").cloned(),
            client_reference_id: None,
            customer_id: Some(expandable_id(&sub.customer)),
            email: None,
        };

        Ok(PaymentRecord {
            provider_event_id,
            provider_object_id: sub.id.to_string(),
            object_type: ProviderObjectType::Subscription,
            // A subscription object does not carry a payment of its own; the
            // linked invoice does. Active/trialing is treated as paid so the
            // upgrade path can proceed regardless of event arrival order.
            payment_state: if status.supports_pro_tier() {
                PaymentState::Paid
            } else {
                PaymentState::Unpaid
            },
            amount_cents: 0,
            currency: "usd".to_string(),
            connected_account_id,
            buyer,
            item: item_signals_from_metadata(&sub.metadata),
            payment_intent_id: None,
            subscription_id: Some(sub.id.to_string()),
            subscription_status: Some(status),
            current_period_end: Some(period_end),
        })
    }
}

/// Map the provider's subscription status onto our four membership states.
pub fn map_subscription_status(status: stripe::SubscriptionStatus) -> MembershipStatus {
    #[allow(unreachable_patterns)]
    match status {
        stripe::SubscriptionStatus::Active => MembershipStatus::Active,
        stripe::SubscriptionStatus::Trialing => MembershipStatus::Trialing,
        stripe::SubscriptionStatus::PastDue
        | stripe::SubscriptionStatus::Incomplete
        | stripe::SubscriptionStatus::Unpaid
        | stripe::SubscriptionStatus::Paused => MembershipStatus::PastDue,
        stripe::SubscriptionStatus::Canceled | stripe::SubscriptionStatus::IncompleteExpired => {
            MembershipStatus::Canceled
        }
        other => {
            tracing::warn!(status = ?other, "unmapped subscription status, treating as canceled");
            MembershipStatus::Canceled
        }
    }
}

pub(crate) fn currency_or_default(currency: Option<stripe::Currency>) -> String {
    currency
        .map(|c| c.to_string())
        .unwrap_or_else(|| "usd".to_string())
}

pub(crate) fn expandable_id<T>(e: &stripe::Expandable<T>) -> String
where
    T: stripe::Object,
    T::Id: std::fmt::Display,
{
    match e {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(obj) => obj.id().to_string(),
    }
}

fn item_signals_from_metadata(metadata: &std::collections::HashMap<String, String>) -> ItemSignals {
    ItemSignals {
        item_id: metadata.get("item_id").and_then(|s| Uuid::parse_str(s).ok()),
        item_kind: metadata.get("item_kind").and_then(|s| ItemKind::parse(s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actionable_only_when_paid() {
        let record = PaymentRecord {
            provider_event_id: None,
            provider_object_id: "cs_test".into(),
            object_type: ProviderObjectType::Session,
            payment_state: PaymentState::Unpaid,
            amount_cents: 1500,
            currency: "usd".into(),
            connected_account_id: None,
            buyer: BuyerSignals::default(),
            item: ItemSignals::default(),
            payment_intent_id: None,
            subscription_id: None,
            subscription_status: None,
            current_period_end: None,
        };
        assert!(!record.is_actionable());

        let paid = PaymentRecord {
            payment_state: PaymentState::Paid,
            ..record
        };
        assert!(paid.is_actionable());
    }

    #[test]
    fn subscription_status_mapping() {
        assert_eq!(
            map_subscription_status(stripe::SubscriptionStatus::Active),
            MembershipStatus::Active
        );
        assert_eq!(
            map_subscription_status(stripe::SubscriptionStatus::Trialing),
            MembershipStatus::Trialing
        );
        assert_eq!(
            map_subscription_status(stripe::SubscriptionStatus::PastDue),
            MembershipStatus::PastDue
        );
        assert_eq!(
            map_subscription_status(stripe::SubscriptionStatus::Canceled),
            MembershipStatus::Canceled
        );
        assert_eq!(
            map_subscription_status(stripe::SubscriptionStatus::IncompleteExpired),
            MembershipStatus::Canceled
        );
    }

    #[test]
    fn expandable_id_extracts_plain_id() {
        let id: stripe::CustomerId = "cus_123".parse().unwrap();
        let e: stripe::Expandable<stripe::Customer> = stripe::Expandable::Id(id);
        assert_eq!(expandable_id(&e), "cus_123");
    }

    #[test]
    fn empty_buyer_signals() {
        assert!(BuyerSignals::default().is_empty());
        let with_email = BuyerSignals {
            email: Some("buyer@example.com".into()),
            ..Default::default()
        };
        assert!(!with_email.is_empty());
    }

    #[test]
    fn item_signals_parse_from_metadata() {
        let mut metadata = std::collections::HashMap::new();
        let item_id = Uuid::new_v4();
        metadata.insert("item_id".to_string(), item_id.to_string());
        metadata.insert("item_kind".to_string(), "product_box".to_string());

        let signals = item_signals_from_metadata(&metadata);
        assert_eq!(signals.item_id, Some(item_id));
        assert_eq!(signals.item_kind, Some(ItemKind::ProductBox));

        metadata.insert("item_id".to_string(), "not-a-uuid".to_string());
        assert_eq!(item_signals_from_metadata(&metadata).item_id, None);
    }
}
