#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Franquia Shared Types
//!
//! Read projections of the backend-owned billing entities used by the
//! upgrade flow: capacity tiers, subscriptions and payment charges.

pub mod money;
pub mod types;

pub use money::{round_currency, CURRENCY_SCALE};
pub use types::{
    Charge, ChargeIntent, ChargeStatus, PlanStatus, Subscription, Tier, CUSTOM_MANUAL_TIER_ID,
};
