// Billing crate clippy configuration
#![allow(clippy::type_complexity)] // Callback and slot map types in the watcher and generator
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Franquia Billing Module
//!
//! Client side of plan-tier upgrades paid by instant bank transfer.
//!
//! ## Features
//!
//! - **Tier Resolution**: Eligible tiers for a target capacity, default choice, custom mode
//! - **Quota Floor**: Minimum custom quantity derived from the catalog and current usage
//! - **Pro-Rata Pricing**: Amount due today for a mid-cycle change, debounced custom previews
//! - **Charge Generation**: One charge per upgrade intent, payment QR rendering
//! - **Payment Watching**: Push plus adaptive polling, confirmation fires exactly once
//! - **Upgrade Flow**: Select, confirm, generate, watch and finalize in one orchestrator

pub mod backend;
pub mod catalog;
pub mod charge;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod proration;
pub mod push;
pub mod quota;
pub mod watcher;

#[cfg(test)]
mod test_support;

// Backend
pub use backend::{ApiCredential, ChargeBackend, CreatedCharge, HttpChargeBackend, SubscriptionProfile};

// Catalog
pub use catalog::{default_tier, TierCatalog, TierResolution};

// Charge
pub use charge::{render_charge, ChargeDisplay, PaymentChargeGenerator};

// Config
pub use config::{BackendConfig, BillingConfig, PricingConfig, WatcherConfig};

// Error
pub use error::{BillingError, BillingResult};

// Orchestrator
pub use orchestrator::{FlowStep, TierChoice, UpgradeOffer, UpgradeOrchestrator, UpgradeOutcome, UpgradeQuote};

// Proration
pub use proration::{
    days_remaining_in_cycle, due_today, CustomPricePreview, DueToday, PreviewState,
    ProRataPricingEngine,
};

// Push
pub use push::{charge_topic, DisabledPushChannel, PushChannel, PushEvent, PushHub, PushSubscription};

// Quota
pub use quota::{clamp_to_floor, min_allowed_quantity, resolve_current_tier, validate_custom_quantity};

// Watcher
pub use watcher::{
    ConfirmationArbiter, ObservationSource, PaymentConfirmation, PaymentStatusWatcher, PushState,
    WatchHandle, WatchStart, WatchState,
};

/// Lock a std mutex, recovering the data if a previous holder panicked
pub(crate) fn lock_unpoisoned<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
