//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

/// Errors raised by the upgrade flow and its collaborators
///
/// Only generation and pricing failures are meant for the user; see
/// [`BillingError::is_user_visible`]. Push and poll problems are absorbed by
/// the watcher and only logged.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Charge generation failed: {0}")]
    GenerationFailed(String),

    #[error("Cannot price a quantity of {quantity}")]
    PricingUnavailable { quantity: u32 },

    #[error("Price is still being calculated")]
    PricingPending,

    #[error("Could not reach pricing for a quantity of {quantity}")]
    PricingFailed { quantity: u32 },

    #[error("Renewal date unknown, cannot compute the amount due today")]
    PricingUnknown,

    #[error("Quantity {requested} is below the minimum allowed of {minimum}")]
    QuantityBelowMinimum { requested: u32, minimum: u32 },

    #[error("Tier not available: {0}")]
    UnknownTier(String),

    #[error("No tier selected")]
    NoSelection,

    #[error("Invalid flow state: {0}")]
    InvalidFlowState(String),

    #[error("Push channel unavailable: {0}")]
    PushUnavailable(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Payment code rendering failed: {0}")]
    PaymentCode(String),
}

impl BillingError {
    /// Whether the error should be shown to the user rather than only logged
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            BillingError::GenerationFailed(_)
                | BillingError::PricingUnavailable { .. }
                | BillingError::PricingPending
                | BillingError::PricingFailed { .. }
                | BillingError::PricingUnknown
                | BillingError::QuantityBelowMinimum { .. }
        )
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return BillingError::InvalidResponse(err.to_string());
        }
        BillingError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::InvalidResponse(err.to_string())
    }
}
