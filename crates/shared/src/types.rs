//! Core domain enums shared across crates.
//!
//! These map 1:1 to the TEXT columns in Postgres; `as_str`/`parse` are the
//! canonical conversions so the string spelling lives in exactly one place.

use serde::{Deserialize, Serialize};

/// Kind of purchasable item in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// A one-time purchase of bundled creator content.
    ProductBox,
    /// A recurring subscription plan (upgrades the buyer's membership).
    SubscriptionPlan,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::ProductBox => "product_box",
            ItemKind::SubscriptionPlan => "subscription_plan",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "product_box" => Some(ItemKind::ProductBox),
            "subscription_plan" => Some(ItemKind::SubscriptionPlan),
            _ => None,
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Account tier for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipTier {
    Free,
    CreatorPro,
}

impl MembershipTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipTier::Free => "free",
            MembershipTier::CreatorPro => "creator_pro",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(MembershipTier::Free),
            "creator_pro" => Some(MembershipTier::CreatorPro),
            _ => None,
        }
    }
}

impl std::fmt::Display for MembershipTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a subscription-backed membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
}

impl MembershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::Active => "active",
            MembershipStatus::Trialing => "trialing",
            MembershipStatus::PastDue => "past_due",
            MembershipStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(MembershipStatus::Active),
            "trialing" => Some(MembershipStatus::Trialing),
            "past_due" => Some(MembershipStatus::PastDue),
            "canceled" => Some(MembershipStatus::Canceled),
            _ => None,
        }
    }

    /// Whether this status is allowed to carry the CreatorPro tier.
    /// Invariant: `tier == creator_pro` implies `status` is active or trialing.
    pub fn supports_pro_tier(&self) -> bool {
        matches!(self, MembershipStatus::Active | MembershipStatus::Trialing)
    }
}

impl std::fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a materialized purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Completed,
    Refunded,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStatus::Completed => "completed",
            PurchaseStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(PurchaseStatus::Completed),
            "refunded" => Some(PurchaseStatus::Refunded),
            _ => None,
        }
    }
}

impl std::fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_kind_round_trips() {
        for kind in [ItemKind::ProductBox, ItemKind::SubscriptionPlan] {
            assert_eq!(ItemKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ItemKind::parse("bundle"), None);
    }

    #[test]
    fn membership_status_pro_support() {
        assert!(MembershipStatus::Active.supports_pro_tier());
        assert!(MembershipStatus::Trialing.supports_pro_tier());
        assert!(!MembershipStatus::PastDue.supports_pro_tier());
        assert!(!MembershipStatus::Canceled.supports_pro_tier());
    }

    #[test]
    fn status_strings_match_db_spelling() {
        assert_eq!(MembershipStatus::PastDue.as_str(), "past_due");
        assert_eq!(MembershipTier::CreatorPro.as_str(), "creator_pro");
        assert_eq!(PurchaseStatus::Refunded.as_str(), "refunded");
    }
}
