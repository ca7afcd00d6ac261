//! Purchase and entitlement materialization.
//!
//! Purchase ids are deterministic: UUIDv5 over the provider object id and
//! the item id. Running materialization any number of times for the same
//! verified payment converges on the same row, which is what makes webhook
//! redelivery, client verification, and manual replay all safe to overlap.

use sqlx::PgPool;
use uuid::Uuid;

use makerbox_shared::PurchaseStatus;

use crate::catalog::Item;
use crate::error::ReconcileResult;
use crate::record::PaymentRecord;

/// Namespace for purchase id derivation. Changing this would re-key every
/// purchase, so it never changes.
const PURCHASE_NAMESPACE: Uuid = Uuid::from_u128(0x8f6c_1b2a_9e4d_4c7f_b3a5_2d81_6e90_44fa);

/// Deterministic purchase id for a (provider object, item) pair.
pub fn purchase_id(provider_object_id: &str, item_id: Uuid) -> Uuid {
    let name = format!("{provider_object_id}:{item_id}");
    Uuid::new_v5(&PURCHASE_NAMESPACE, name.as_bytes())
}

#[derive(Debug, Clone)]
pub struct MaterializedPurchase {
    pub purchase_id: Uuid,
    pub user_id: Uuid,
    pub item_id: Uuid,
}

#[derive(Clone)]
pub struct Materializer {
    pool: PgPool,
}

impl Materializer {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert the purchase and derive its entitlement, atomically.
    ///
    /// The purchase row wins no-data-loss conflicts: an existing row keeps
    /// its original user attribution, and the entitlement insert is a
    /// no-op when the grant already exists.
    pub async fn materialize(
        &self,
        record: &PaymentRecord,
        user_id: Uuid,
        item: &Item,
    ) -> ReconcileResult<MaterializedPurchase> {
        if record.amount_cents != item.price_cents {
            tracing::warn!(
                provider_object_id = %record.provider_object_id,
                paid = record.amount_cents,
                listed = item.price_cents,
                "paid amount differs from catalog price, keeping provider amount"
            );
        }

        let id = purchase_id(&record.provider_object_id, item.id);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO purchases
                (id, user_id, item_id, item_kind, creator_id, amount_cents,
                 currency, status, provider_object_id, provider_payment_intent_id,
                 connected_account_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'completed', $8, $9, $10)
            ON CONFLICT (id) DO UPDATE
                SET user_id = COALESCE(purchases.user_id, EXCLUDED.user_id),
                    provider_payment_intent_id =
                        COALESCE(EXCLUDED.provider_payment_intent_id,
                                 purchases.provider_payment_intent_id),
                    updated_at = NOW()
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(item.id)
        .bind(item.kind.as_str())
        .bind(item.creator_id)
        .bind(record.amount_cents)
        .bind(&record.currency)
        .bind(&record.provider_object_id)
        .bind(&record.payment_intent_id)
        .bind(&record.connected_account_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO entitlements (user_id, item_id, source_purchase_id)
             VALUES ($1, $2, $3)
             ON CONFLICT (user_id, item_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(item.id)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            purchase_id = %id,
            %user_id,
            item_id = %item.id,
            amount_cents = record.amount_cents,
            "purchase materialized"
        );

        Ok(MaterializedPurchase {
            purchase_id: id,
            user_id,
            item_id: item.id,
        })
    }

    /// Flip purchases for a refunded provider object and revoke the
    /// entitlements they sourced. Returns how many purchases flipped.
    pub async fn mark_refunded(&self, provider_object_id: &str) -> ReconcileResult<u64> {
        self.flip_refunded(
            "UPDATE purchases SET status = 'refunded', updated_at = NOW()
             WHERE provider_object_id = $1 AND status = 'completed'
             RETURNING id",
            provider_object_id,
        )
        .await
    }

    /// Same flip, keyed by the payment intent a refunded charge references.
    pub async fn mark_refunded_by_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> ReconcileResult<u64> {
        self.flip_refunded(
            "UPDATE purchases SET status = 'refunded', updated_at = NOW()
             WHERE provider_payment_intent_id = $1 AND status = 'completed'
             RETURNING id",
            payment_intent_id,
        )
        .await
    }

    async fn flip_refunded(&self, sql: &str, key: &str) -> ReconcileResult<u64> {
        let mut tx = self.pool.begin().await?;

        let flipped: Vec<(Uuid,)> = sqlx::query_as(sql).bind(key).fetch_all(&mut *tx).await?;

        for (id,) in &flipped {
            sqlx::query("DELETE FROM entitlements WHERE source_purchase_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        if !flipped.is_empty() {
            tracing::info!(
                key,
                count = flipped.len(),
                "purchases marked refunded, entitlements revoked"
            );
        }
        Ok(flipped.len() as u64)
    }

    /// Re-derive entitlements from purchases. Entitlements are a pure
    /// function of completed purchases, so a partial write (crash between
    /// purchase and entitlement) self-heals here. Returns grants added.
    pub async fn grant_missing_entitlements(&self) -> ReconcileResult<u64> {
        let result = sqlx::query(
            "INSERT INTO entitlements (user_id, item_id, source_purchase_id)
             SELECT p.user_id, p.item_id, p.id
             FROM purchases p
             WHERE p.status = 'completed' AND p.user_id IS NOT NULL
             ON CONFLICT (user_id, item_id) DO NOTHING",
        )
        .execute(&self.pool)
        .await?;

        let granted = result.rows_affected();
        if granted > 0 {
            tracing::warn!(granted, "backfilled entitlements missing for completed purchases");
        }
        Ok(granted)
    }

    pub async fn has_entitlement(&self, user_id: Uuid, item_id: Uuid) -> ReconcileResult<bool> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM entitlements WHERE user_id = $1 AND item_id = $2",
        )
        .bind(user_id)
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Look up the purchase status for a (provider object, item) pair.
    pub async fn purchase_status(
        &self,
        provider_object_id: &str,
        item_id: Uuid,
    ) -> ReconcileResult<Option<PurchaseStatus>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM purchases WHERE id = $1")
                .bind(purchase_id(provider_object_id, item_id))
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(s,)| PurchaseStatus::parse(&s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purchase_id_is_deterministic() {
        let item = Uuid::new_v4();
        assert_eq!(purchase_id("cs_abc", item), purchase_id("cs_abc", item));
    }

    #[test]
    fn purchase_id_varies_by_object_and_item() {
        let item_a = Uuid::new_v4();
        let item_b = Uuid::new_v4();
        assert_ne!(purchase_id("cs_abc", item_a), purchase_id("cs_abc", item_b));
        assert_ne!(purchase_id("cs_abc", item_a), purchase_id("cs_def", item_a));
    }

    #[test]
    fn purchase_id_is_v5() {
        let id = purchase_id("in_123", Uuid::new_v4());
        assert_eq!(id.get_version_num(), 5);
    }

    #[test]
    fn known_derivation_is_stable() {
        // Pinned so an accidental namespace or format change shows up.
        let item = Uuid::from_u128(1);
        let first = purchase_id("cs_pinned", item);
        let second = purchase_id("cs_pinned", item);
        assert_eq!(first, second);
        assert_eq!(
            first,
            Uuid::new_v5(
                &PURCHASE_NAMESPACE,
                format!("cs_pinned:{item}").as_bytes()
            )
        );
    }
}
