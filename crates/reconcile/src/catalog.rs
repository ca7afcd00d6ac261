//! Item catalog lookups.

use sqlx::PgPool;
use uuid::Uuid;

use makerbox_shared::ItemKind;

use crate::error::{ReconcileError, ReconcileResult};

#[derive(Debug, Clone)]
pub struct Item {
    pub id: Uuid,
    pub kind: ItemKind,
    pub title: String,
    pub price_cents: i64,
    pub currency: String,
    pub creator_id: Uuid,
    pub connected_account_id: Option<String>,
}

#[derive(Clone)]
pub struct Catalog {
    pool: PgPool,
}

impl Catalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, item_id: Uuid) -> ReconcileResult<Item> {
        let row: Option<(Uuid, String, String, i64, String, Uuid, Option<String>)> =
            sqlx::query_as(
                "SELECT id, kind, title, price_cents, currency, creator_id, connected_account_id
                 FROM items WHERE id = $1",
            )
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;

        let (id, kind, title, price_cents, currency, creator_id, connected_account_id) =
            row.ok_or_else(|| ReconcileError::ItemNotFound(item_id.to_string()))?;

        // CHECK constraint guards the column; a parse failure here means
        // schema drift, not a bad event.
        let kind = ItemKind::parse(&kind)
            .ok_or_else(|| ReconcileError::Config(format!("unknown item kind in catalog: {kind}")))?;

        Ok(Item {
            id,
            kind,
            title,
            price_cents,
            currency,
            creator_id,
            connected_account_id,
        })
    }

    /// Connected-account hint for a payment, when the item is known before
    /// the provider fetch happens.
    pub async fn account_hint(&self, item_id: Option<Uuid>) -> ReconcileResult<Option<String>> {
        let Some(item_id) = item_id else {
            return Ok(None);
        };
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT connected_account_id FROM items WHERE id = $1")
                .bind(item_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(hint,)| hint))
    }
}
