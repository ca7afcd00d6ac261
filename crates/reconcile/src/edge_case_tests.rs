//! Cross-module edge cases: duplicate delivery convergence, forged
//! payloads, demotion, and retry classification at the pipeline seams.

use uuid::Uuid;

use makerbox_shared::{MembershipStatus, MembershipTier};

use crate::error::ReconcileError;
use crate::event_store::event_key_from_raw;
use crate::materializer::purchase_id;
use crate::membership::MembershipChange;
use crate::record::{BuyerSignals, ItemSignals, PaymentRecord, PaymentState, ProviderObjectType};

fn paid_session_record(object_id: &str, item_id: Uuid) -> PaymentRecord {
    PaymentRecord {
        provider_event_id: Some("evt_1".into()),
        provider_object_id: object_id.into(),
        object_type: ProviderObjectType::Session,
        payment_state: PaymentState::Paid,
        amount_cents: 4900,
        currency: "usd".into(),
        connected_account_id: None,
        buyer: BuyerSignals {
            explicit_user_id: Some(Uuid::new_v4().to_string()),
            ..Default::default()
        },
        item: ItemSignals {
            item_id: Some(item_id),
            item_kind: None,
        },
        payment_intent_id: Some("pi_live_42".into()),
        subscription_id: None,
        subscription_status: None,
        current_period_end: None,
    }
}

#[test]
fn webhook_and_client_paths_derive_the_same_purchase() {
    // The webhook path works from the event, the client path from the
    // session id; both must land on one purchase row.
    let item_id = Uuid::new_v4();
    let from_webhook = paid_session_record("cs_live_42", item_id);
    let from_client = PaymentRecord {
        provider_event_id: None,
        ..paid_session_record("cs_live_42", item_id)
    };

    assert_eq!(
        purchase_id(&from_webhook.provider_object_id, item_id),
        purchase_id(&from_client.provider_object_id, item_id),
    );
}

#[test]
fn same_object_different_items_are_distinct_purchases() {
    // One checkout can cover multiple items; each gets its own purchase.
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    assert_ne!(purchase_id("cs_live_42", a), purchase_id("cs_live_42", b));
}

#[test]
fn forged_payload_still_gets_an_audit_key() {
    // A delivery that fails signature verification must still be
    // recordable; a body with no id falls back to a stable digest.
    let (first, _, _) = event_key_from_raw("forged body, not json");
    let (second, _, _) = event_key_from_raw("forged body, not json");
    assert_eq!(first, second);
    assert!(first.starts_with("raw_"));

    let (other, _, _) = event_key_from_raw("different forged body");
    assert_ne!(first, other);
}

#[test]
fn unpaid_session_is_never_actionable() {
    // `checkout.session.completed` fires for async payment methods before
    // funds settle; completion alone must not grant anything.
    let item_id = Uuid::new_v4();
    let mut record = paid_session_record("cs_async", item_id);
    record.payment_state = PaymentState::Unpaid;
    assert!(!record.is_actionable());

    record.payment_state = PaymentState::NoPaymentRequired;
    assert!(!record.is_actionable());
}

#[test]
fn canceled_subscription_demotes_immediately() {
    let change = MembershipChange {
        status: MembershipStatus::Canceled,
        stripe_customer_id: Some("cus_9".into()),
        stripe_subscription_id: Some("sub_9".into()),
        current_period_end: None,
    };
    assert_eq!(change.tier(), MembershipTier::Free);

    let past_due = MembershipChange {
        status: MembershipStatus::PastDue,
        ..change
    };
    assert_eq!(past_due.tier(), MembershipTier::Free);
}

#[test]
fn only_infrastructure_failures_are_retryable() {
    // Each pipeline stage maps its failures into the taxonomy; the webhook
    // endpoint turns transient into 503 (provider redelivers) and terminal
    // into 200 (provider stops). Misclassification either loses purchases
    // or loops forever.
    let terminal = [
        ReconcileError::InvalidEvent("bad signature".into()),
        ReconcileError::ObjectNotFound("cs_x".into()),
        ReconcileError::UserNotResolved("ambiguous email".into()),
        ReconcileError::ItemNotFound("gone".into()),
    ];
    for e in terminal {
        assert!(!e.is_transient(), "{e} must be terminal");
    }

    let transient = [
        ReconcileError::TransientStore("pool timeout".into()),
        ReconcileError::ProviderApi("502 from provider".into()),
    ];
    for e in transient {
        assert!(e.is_transient(), "{e} must be retryable");
    }
}

#[test]
fn membership_upgrade_is_order_independent_across_event_shapes() {
    // `checkout.session.completed` and `invoice.payment_succeeded` may
    // arrive in either order. Neither shape can produce a membership change
    // directly; both converge on the re-fetched subscription snapshot, so
    // arrival order cannot affect the final state.
    let via_checkout = PaymentRecord {
        subscription_id: Some("sub_77".into()),
        ..paid_session_record("cs_live_77", Uuid::new_v4())
    };
    let via_invoice = PaymentRecord {
        provider_object_id: "in_77".into(),
        object_type: ProviderObjectType::Invoice,
        subscription_id: Some("sub_77".into()),
        ..paid_session_record("cs_live_77", Uuid::new_v4())
    };

    assert!(MembershipChange::from_record(&via_checkout).is_none());
    assert!(MembershipChange::from_record(&via_invoice).is_none());
    assert_eq!(via_checkout.subscription_id, via_invoice.subscription_id);

    // One authoritative snapshot, one change, whichever event fetched it.
    let snapshot = PaymentRecord {
        provider_object_id: "sub_77".into(),
        object_type: ProviderObjectType::Subscription,
        subscription_status: Some(MembershipStatus::Active),
        ..via_checkout
    };
    let first = MembershipChange::from_record(&snapshot).unwrap();
    let second = MembershipChange::from_record(&snapshot).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.tier(), MembershipTier::CreatorPro);
}

#[test]
fn event_key_survives_missing_type_field() {
    let (id, event_type, _) = event_key_from_raw(r#"{"id":"evt_only_id"}"#);
    assert_eq!(id, "evt_only_id");
    assert_eq!(event_type, "unknown");
}
