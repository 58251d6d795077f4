//! Tier catalog and target-capacity resolution
//!
//! The catalog is the read-only list of standard capacity tiers for the plan.
//! Resolution filters it down to the tiers that can hold a target capacity
//! and picks the default choice, or switches the flow to custom quantity mode
//! when no standard tier is large enough.

use franquia_shared::Tier;
use serde::Serialize;

/// Read-only set of standard tiers, ordered by capacity
#[derive(Debug, Clone, Default)]
pub struct TierCatalog {
    tiers: Vec<Tier>,
}

/// Outcome of resolving a target capacity against the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TierResolution {
    /// At least one standard tier fits
    Standard {
        eligible: Vec<Tier>,
        default_tier_id: String,
    },
    /// Target exceeds every standard tier; custom mode seeded with a quantity
    CustomQuantity { seed_quantity: u32 },
}

impl TierCatalog {
    /// Build a catalog from standard tiers. Custom tiers are ignored.
    pub fn new(tiers: Vec<Tier>) -> Self {
        let mut tiers: Vec<Tier> = tiers.into_iter().filter(|t| !t.is_custom).collect();
        tiers.sort_by(|a, b| a.capacity.cmp(&b.capacity).then_with(|| a.id.cmp(&b.id)));
        Self { tiers }
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn find(&self, tier_id: &str) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.id == tier_id)
    }

    /// Largest standard capacity, 0 for an empty catalog
    pub fn max_standard_capacity(&self) -> u32 {
        self.tiers.iter().map(|t| t.capacity).max().unwrap_or(0)
    }

    /// Tiers able to hold `target_capacity`
    ///
    /// When the subscriber already holds a paid tier, only strictly larger
    /// tiers remain.
    pub fn eligible_tiers(&self, target_capacity: u32, held_capacity: Option<u32>) -> Vec<Tier> {
        self.tiers
            .iter()
            .filter(|t| t.capacity >= target_capacity)
            .filter(|t| held_capacity.map_or(true, |held| t.capacity > held))
            .cloned()
            .collect()
    }

    /// Resolve a target capacity into eligible tiers and a default choice
    pub fn resolve(
        &self,
        target_capacity: u32,
        held_capacity: Option<u32>,
        current_active_usage: u32,
    ) -> TierResolution {
        let eligible = self.eligible_tiers(target_capacity, held_capacity);

        match default_tier(&eligible).map(|t| t.id.clone()) {
            Some(default_tier_id) => TierResolution::Standard {
                eligible,
                default_tier_id,
            },
            None => TierResolution::CustomQuantity {
                seed_quantity: current_active_usage.saturating_add(1),
            },
        }
    }
}

/// Default selection: the recommended tier if present, else the cheapest
pub fn default_tier(eligible: &[Tier]) -> Option<&Tier> {
    eligible.iter().find(|t| t.recommended).or_else(|| {
        eligible
            .iter()
            .min_by(|a, b| {
                a.effective_price()
                    .cmp(&b.effective_price())
                    .then_with(|| a.capacity.cmp(&b.capacity))
            })
    })
}
