//! Billing entity projections shared across crates

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Identifier used for tiers synthesized from a typed-in quantity
pub const CUSTOM_MANUAL_TIER_ID: &str = "custom_manual";

/// A priced capacity level of the plan
///
/// Capacity is the number of passengers with automated billing ("franquia")
/// the tier permits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub id: String,
    pub capacity: u32,
    pub monthly_price: Decimal,
    #[serde(default)]
    pub is_custom: bool,
    #[serde(default)]
    pub promotional_price: Option<Decimal>,
    #[serde(default)]
    pub promotion_active: bool,
    /// Marked by the catalog as the suggested choice
    #[serde(default)]
    pub recommended: bool,
}

impl Tier {
    /// Standard catalog tier
    pub fn standard(id: impl Into<String>, capacity: u32, monthly_price: Decimal) -> Self {
        Self {
            id: id.into(),
            capacity,
            monthly_price,
            is_custom: false,
            promotional_price: None,
            promotion_active: false,
            recommended: false,
        }
    }

    /// Tier synthesized for a manually typed quantity, priced later by preview
    pub fn custom_manual(capacity: u32, monthly_price: Decimal) -> Self {
        Self {
            id: CUSTOM_MANUAL_TIER_ID.to_string(),
            capacity,
            monthly_price,
            is_custom: true,
            promotional_price: None,
            promotion_active: false,
            recommended: false,
        }
    }

    pub fn with_promotion(mut self, promotional_price: Decimal) -> Self {
        self.promotional_price = Some(promotional_price);
        self.promotion_active = true;
        self
    }

    pub fn recommended(mut self) -> Self {
        self.recommended = true;
        self
    }

    /// Price actually billed per month (promotional price while the promotion runs)
    pub fn effective_price(&self) -> Decimal {
        match self.promotional_price {
            Some(price) if self.promotion_active => price,
            _ => self.monthly_price,
        }
    }
}

/// Payment state of a charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChargeStatus {
    Pending,
    Paid,
}

impl ChargeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeStatus::Pending => "PENDING",
            ChargeStatus::Paid => "PAID",
        }
    }

    pub fn is_paid(&self) -> bool {
        matches!(self, ChargeStatus::Paid)
    }
}

impl std::fmt::Display for ChargeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Client-side projection of a backend charge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charge {
    pub id: String,
    pub amount: Decimal,
    /// Opaque instant-transfer payload, rendered as-is and never parsed
    pub payload_for_payment: String,
    pub status: ChargeStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Charge {
    pub fn pending(
        id: impl Into<String>,
        amount: Decimal,
        payload_for_payment: impl Into<String>,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: id.into(),
            amount,
            payload_for_payment: payload_for_payment.into(),
            status: ChargeStatus::Pending,
            created_at,
        }
    }

    /// Move to PAID. Returns false when the charge was already paid.
    pub fn mark_paid(&mut self) -> bool {
        if self.status.is_paid() {
            return false;
        }
        self.status = ChargeStatus::Paid;
        true
    }
}

/// What the upgrade intends to buy; the id is the backend idempotency key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeIntent {
    pub id: String,
    pub tier_id: String,
    pub quantity: u32,
    pub amount_due: Decimal,
}

impl ChargeIntent {
    /// Intent id for a choice made against the given subscription state
    ///
    /// The id is stable while the choice, the contracted capacity, the billing
    /// cycle and the amount stay the same. A new cycle or a repriced amount
    /// yields a new id.
    pub fn for_selection(tier: &Tier, subscription: &Subscription, amount_due: Decimal) -> Self {
        let cycle = match subscription.renewal_date {
            Some(renewal) => renewal.date().to_string(),
            None => subscription.status.as_str().to_ascii_lowercase(),
        };
        Self {
            id: format!(
                "upgrade:{}:{}:from:{}:{}:{:.2}",
                tier.id, tier.capacity, subscription.contracted_capacity, cycle, amount_due
            ),
            tier_id: tier.id.clone(),
            quantity: tier.capacity,
            amount_due,
        }
    }
}

/// Lifecycle status of the subscriber's plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Trial,
    Active,
    Expired,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Trial => "TRIAL",
            PlanStatus::Active => "ACTIVE",
            PlanStatus::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subscription read model, mutated only by backend settlement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub contracted_capacity: u32,
    pub used_automation_slots: u32,
    pub monthly_price_applied: Decimal,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub renewal_date: Option<OffsetDateTime>,
    pub status: PlanStatus,
}

impl Subscription {
    /// Capacity of the tier the subscriber has actually paid for
    ///
    /// Trial and expired plans hold no paid tier.
    pub fn paid_capacity(&self) -> Option<u32> {
        match self.status {
            PlanStatus::Active if self.contracted_capacity > 0 => Some(self.contracted_capacity),
            _ => None,
        }
    }

    pub fn has_running_cycle(&self) -> bool {
        self.status == PlanStatus::Active
    }
}
