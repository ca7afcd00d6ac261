//! Buyer identity resolution.
//!
//! A payment's buyer signals are tried strictly in decreasing trust order:
//! explicit metadata user id, then the checkout client reference, then the
//! provider customer mapping, then a unique email match. The first signal
//! that resolves wins; later signals are never consulted to second-guess an
//! earlier hit. An ambiguous email (historical duplicate signups) never
//! resolves.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{ReconcileError, ReconcileResult};
use crate::record::BuyerSignals;

/// Which signal produced the resolution. Stored in logs for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    ExplicitMetadata,
    ClientReference,
    CustomerId,
    Email,
}

impl ResolvedVia {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolvedVia::ExplicitMetadata => "explicit_metadata",
            ResolvedVia::ClientReference => "client_reference",
            ResolvedVia::CustomerId => "customer_id",
            ResolvedVia::Email => "email",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolvedUser {
    pub user_id: Uuid,
    pub via: ResolvedVia,
}

#[derive(Clone)]
pub struct IdentityResolver {
    pool: PgPool,
}

impl IdentityResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolve the buying user from the record's signals.
    ///
    /// Lookups run against the user directory, then the pure precedence
    /// walk in [`pick_resolution`] decides. A signal that is present but
    /// does not check out (unparsable id, unknown user) falls through to
    /// the next signal with a warning rather than failing the whole
    /// resolution; provider metadata survives test payloads and manual
    /// replays in odd states.
    pub async fn resolve(&self, buyer: &BuyerSignals) -> ReconcileResult<ResolvedUser> {
        let matches = self.fetch_matches(buyer).await?;
        pick_resolution(buyer, &matches)
    }

    async fn fetch_matches(&self, buyer: &BuyerSignals) -> ReconcileResult<SignalMatches> {
        let mut matches = SignalMatches::default();

        if let Some(raw) = &buyer.explicit_user_id {
            matches.explicit = self.lookup_by_id(raw).await?;
        }
        if let Some(raw) = &buyer.client_reference_id {
            matches.client_reference = self.lookup_by_id(raw).await?;
        }
        if let Some(customer_id) = &buyer.customer_id {
            let row: Option<(Uuid,)> =
                sqlx::query_as("SELECT id FROM users WHERE stripe_customer_id = $1")
                    .bind(customer_id)
                    .fetch_optional(&self.pool)
                    .await?;
            matches.customer = row.map(|(id,)| id);
        }
        if let Some(email) = &buyer.email {
            // Two ids, not two rows: duplicate signups under one account
            // still count as a unique match.
            let rows: Vec<(Uuid,)> =
                sqlx::query_as("SELECT DISTINCT id FROM users WHERE email = $1 LIMIT 2")
                    .bind(email)
                    .fetch_all(&self.pool)
                    .await?;
            matches.email = rows.into_iter().map(|(id,)| id).collect();
        }

        Ok(matches)
    }

    /// Backfill the provider customer mapping after a resolution that came
    /// from a stronger signal, so future payments for this customer resolve
    /// without metadata. Never overwrites an existing mapping.
    pub async fn link_customer(&self, user_id: Uuid, customer_id: &str) -> ReconcileResult<()> {
        let result = sqlx::query(
            "UPDATE users SET stripe_customer_id = $2
             WHERE id = $1 AND stripe_customer_id IS NULL",
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::info!(%user_id, customer_id, "linked provider customer to user");
        }
        Ok(())
    }

    async fn lookup_by_id(&self, raw: &str) -> ReconcileResult<Option<Uuid>> {
        let Some(candidate) = parse_user_ref(raw) else {
            return Ok(None);
        };
        let row: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE id = $1")
            .bind(candidate)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(id,)| id))
    }
}

/// Directory lookup results for each buyer signal, fetched up front so the
/// precedence decision itself stays pure.
#[derive(Debug, Clone, Default)]
pub(crate) struct SignalMatches {
    pub explicit: Option<Uuid>,
    pub client_reference: Option<Uuid>,
    pub customer: Option<Uuid>,
    /// At most two ids are fetched; two means ambiguous.
    pub email: Vec<Uuid>,
}

/// The precedence walk. Signals are consulted strictly in decreasing trust
/// order and the first hit wins; a present signal whose lookup came back
/// empty falls through. An ambiguous email is only an error when no
/// stronger signal resolved first.
fn pick_resolution(buyer: &BuyerSignals, matches: &SignalMatches) -> ReconcileResult<ResolvedUser> {
    if let Some(raw) = &buyer.explicit_user_id {
        match matches.explicit {
            Some(user_id) => {
                return Ok(ResolvedUser {
                    user_id,
                    via: ResolvedVia::ExplicitMetadata,
                })
            }
            None => tracing::warn!(raw, "metadata user id did not resolve, falling through"),
        }
    }

    if let Some(raw) = &buyer.client_reference_id {
        match matches.client_reference {
            Some(user_id) => {
                return Ok(ResolvedUser {
                    user_id,
                    via: ResolvedVia::ClientReference,
                })
            }
            None => tracing::warn!(raw, "client reference did not resolve, falling through"),
        }
    }

    if let Some(user_id) = matches.customer {
        return Ok(ResolvedUser {
            user_id,
            via: ResolvedVia::CustomerId,
        });
    }

    if let Some(email) = &buyer.email {
        match matches.email.as_slice() {
            [user_id] => {
                return Ok(ResolvedUser {
                    user_id: *user_id,
                    via: ResolvedVia::Email,
                })
            }
            [] => {}
            _ => {
                return Err(ReconcileError::UserNotResolved(format!(
                    "email {email} matches multiple users"
                )))
            }
        }
    }

    Err(ReconcileError::UserNotResolved(describe_signals(buyer)))
}

/// Parse a user reference from provider metadata. Tolerates surrounding
/// whitespace but nothing else.
pub(crate) fn parse_user_ref(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw.trim()).ok()
}

fn describe_signals(buyer: &BuyerSignals) -> String {
    if buyer.is_empty() {
        return "no buyer signals present".to_string();
    }
    let mut present = Vec::new();
    if buyer.explicit_user_id.is_some() {
        present.push("explicit_user_id");
    }
    if buyer.client_reference_id.is_some() {
        present.push("client_reference_id");
    }
    if buyer.customer_id.is_some() {
        present.push("customer_id");
    }
    if buyer.email.is_some() {
        present.push("email");
    }
    format!("no signal resolved (present: {})", present.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_ref_parsing() {
        let id = Uuid::new_v4();
        assert_eq!(parse_user_ref(&id.to_string()), Some(id));
        assert_eq!(parse_user_ref(&format!("  {id} ")), Some(id));
        assert_eq!(parse_user_ref("user_42"), None);
        assert_eq!(parse_user_ref(""), None);
    }

    fn full_signals() -> BuyerSignals {
        BuyerSignals {
            explicit_user_id: Some(Uuid::new_v4().to_string()),
            client_reference_id: Some(Uuid::new_v4().to_string()),
            customer_id: Some("cus_1".into()),
            email: Some("buyer@example.com".into()),
        }
    }

    #[test]
    fn explicit_id_beats_every_other_match() {
        let explicit = Uuid::new_v4();
        let other = Uuid::new_v4();
        let matches = SignalMatches {
            explicit: Some(explicit),
            client_reference: Some(other),
            customer: Some(other),
            email: vec![other],
        };

        let resolved = pick_resolution(&full_signals(), &matches).unwrap();
        assert_eq!(resolved.user_id, explicit);
        assert_eq!(resolved.via, ResolvedVia::ExplicitMetadata);
    }

    #[test]
    fn unresolved_explicit_id_falls_through() {
        let via_customer = Uuid::new_v4();
        let matches = SignalMatches {
            explicit: None,
            client_reference: None,
            customer: Some(via_customer),
            email: vec![Uuid::new_v4()],
        };

        let resolved = pick_resolution(&full_signals(), &matches).unwrap();
        assert_eq!(resolved.user_id, via_customer);
        assert_eq!(resolved.via, ResolvedVia::CustomerId);
    }

    #[test]
    fn unique_email_is_the_last_resort() {
        let via_email = Uuid::new_v4();
        let matches = SignalMatches {
            email: vec![via_email],
            ..Default::default()
        };

        let resolved = pick_resolution(&full_signals(), &matches).unwrap();
        assert_eq!(resolved.user_id, via_email);
        assert_eq!(resolved.via, ResolvedVia::Email);
    }

    #[test]
    fn ambiguous_email_never_resolves() {
        let matches = SignalMatches {
            email: vec![Uuid::new_v4(), Uuid::new_v4()],
            ..Default::default()
        };

        let err = pick_resolution(&full_signals(), &matches).unwrap_err();
        assert_eq!(err.kind(), "user_not_resolved");
        assert!(!err.is_transient());
    }

    #[test]
    fn stronger_signal_shadows_ambiguous_email() {
        let explicit = Uuid::new_v4();
        let matches = SignalMatches {
            explicit: Some(explicit),
            email: vec![Uuid::new_v4(), Uuid::new_v4()],
            ..Default::default()
        };

        let resolved = pick_resolution(&full_signals(), &matches).unwrap();
        assert_eq!(resolved.user_id, explicit);
    }

    #[test]
    fn no_matches_is_not_resolved() {
        let err = pick_resolution(&full_signals(), &SignalMatches::default()).unwrap_err();
        assert_eq!(err.kind(), "user_not_resolved");
    }

    #[test]
    fn signal_description_lists_present_signals() {
        assert_eq!(
            describe_signals(&BuyerSignals::default()),
            "no buyer signals present"
        );

        let buyer = BuyerSignals {
            customer_id: Some("cus_1".into()),
            email: Some("a@example.com".into()),
            ..Default::default()
        };
        assert_eq!(
            describe_signals(&buyer),
            "no signal resolved (present: customer_id, email)"
        );
    }
}
