//! Franchise quota rules
//!
//! Computes the floor for custom quantities and decides which tier the
//! current selection actually sells.

use franquia_shared::Tier;
use rust_decimal::Decimal;

use crate::catalog::TierCatalog;
use crate::error::{BillingError, BillingResult};

/// Smallest quantity a custom selection may request
///
/// While usage fits the catalog, the floor sits one above the largest
/// standard tier. Once usage has outgrown every standard tier, the floor
/// follows usage.
pub fn min_allowed_quantity(catalog: &TierCatalog, current_active_usage: u32) -> u32 {
    let max_standard = catalog.max_standard_capacity();
    if current_active_usage <= max_standard {
        max_standard.saturating_add(1)
    } else {
        current_active_usage
    }
}

/// Reject custom quantities below the floor
pub fn validate_custom_quantity(quantity: u32, minimum: u32) -> BillingResult<u32> {
    if quantity < minimum {
        return Err(BillingError::QuantityBelowMinimum {
            requested: quantity,
            minimum,
        });
    }
    Ok(quantity)
}

/// Raise a typed quantity to the floor, for inputs that clamp instead of rejecting
pub fn clamp_to_floor(quantity: u32, minimum: u32) -> u32 {
    quantity.max(minimum)
}

/// Tier the current selection resolves to
///
/// A selected id present in the eligible set always wins over the raw typed
/// quantity, so a quantity snapped to a standard tier sells that tier. In
/// custom mode the typed quantity becomes an unpriced custom tier. Otherwise
/// the first eligible tier is used.
pub fn resolve_current_tier(
    selected_tier_id: Option<&str>,
    eligible: &[Tier],
    is_custom_mode: bool,
    manual_quantity: Option<u32>,
) -> Option<Tier> {
    if let Some(tier) =
        selected_tier_id.and_then(|id| eligible.iter().find(|t| t.id == id))
    {
        return Some(tier.clone());
    }

    if is_custom_mode {
        if let Some(quantity) = manual_quantity {
            return Some(Tier::custom_manual(quantity, Decimal::ZERO));
        }
    }

    eligible.first().cloned()
}
