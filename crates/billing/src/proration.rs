//! Pro-rata pricing
//!
//! Computes what a mid-cycle upgrade costs today, and prices custom
//! quantities through a debounced backend preview where only the response
//! for the most recent quantity is ever applied.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use franquia_shared::{round_currency, Subscription};
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::backend::ChargeBackend;
use crate::config::PricingConfig;
use crate::error::{BillingError, BillingResult};

/// Amount owed today for a plan change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "amount", rename_all = "snake_case")]
pub enum DueToday {
    Amount(Decimal),
    /// Renewal date unknown; the upgrade must wait until pricing resolves
    Unknown,
}

impl DueToday {
    pub fn amount(&self) -> Option<Decimal> {
        match self {
            DueToday::Amount(amount) => Some(*amount),
            DueToday::Unknown => None,
        }
    }
}

/// Partial-period charge: `price * days_remaining / cycle_length`, half-up to cents
///
/// Non-positive remaining days owe nothing.
pub fn due_today(new_monthly_price: Decimal, days_remaining: i64, cycle_length_days: u32) -> Decimal {
    if days_remaining <= 0 || cycle_length_days == 0 {
        return round_currency(Decimal::ZERO);
    }
    let prorated =
        new_monthly_price * Decimal::from(days_remaining) / Decimal::from(cycle_length_days);
    round_currency(prorated)
}

/// Whole calendar days between `now` and the renewal date
pub fn days_remaining_in_cycle(renewal_date: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let renewal = renewal_date.to_offset(now.offset()).date();
    (renewal - now.date()).whole_days()
}

/// Prices plan changes against the subscriber's current cycle
#[derive(Debug, Clone)]
pub struct ProRataPricingEngine {
    cycle_length_days: u32,
}

impl ProRataPricingEngine {
    pub fn new(config: &PricingConfig) -> Self {
        Self {
            cycle_length_days: config.cycle_length_days,
        }
    }

    pub fn cycle_length_days(&self) -> u32 {
        self.cycle_length_days
    }

    /// Amount due today for moving to `new_monthly_price`
    ///
    /// Trial and expired plans have no running cycle and pay the full month.
    pub fn quote(
        &self,
        new_monthly_price: Decimal,
        subscription: &Subscription,
        now: OffsetDateTime,
    ) -> DueToday {
        if !subscription.has_running_cycle() {
            return DueToday::Amount(round_currency(new_monthly_price));
        }

        match subscription.renewal_date {
            Some(renewal_date) => {
                let days = days_remaining_in_cycle(renewal_date, now);
                DueToday::Amount(due_today(new_monthly_price, days, self.cycle_length_days))
            }
            None => DueToday::Unknown,
        }
    }
}

/// State of the custom quantity price preview
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PreviewState {
    Idle,
    Pending { quantity: u32 },
    Priced { quantity: u32, price: Decimal },
    Unavailable { quantity: u32 },
    /// The backend could not be reached; the quantity may still be priceable
    Failed { quantity: u32 },
}

/// Debounced, latest-wins price preview for custom quantities
///
/// Every quantity change takes a new sequence number. A request only reaches
/// the backend if no newer change arrived during the debounce window, and a
/// response is only applied if its sequence number is still the latest.
#[derive(Clone)]
pub struct CustomPricePreview {
    backend: Arc<dyn ChargeBackend>,
    debounce: Duration,
    latest_seq: Arc<AtomicU64>,
    state: Arc<watch::Sender<PreviewState>>,
}

impl CustomPricePreview {
    pub fn new(backend: Arc<dyn ChargeBackend>, config: &PricingConfig) -> Self {
        let (state, _) = watch::channel(PreviewState::Idle);
        Self {
            backend,
            debounce: config.preview_debounce,
            latest_seq: Arc::new(AtomicU64::new(0)),
            state: Arc::new(state),
        }
    }

    /// Schedule a preview for `quantity`, superseding any earlier one
    ///
    /// Must be called from within a tokio runtime.
    pub fn request(&self, quantity: u32) -> u64 {
        let mut seq = 0;
        self.state.send_modify(|state| {
            seq = self.latest_seq.fetch_add(1, Ordering::SeqCst) + 1;
            *state = PreviewState::Pending { quantity };
        });

        let backend = Arc::clone(&self.backend);
        let latest_seq = Arc::clone(&self.latest_seq);
        let state = Arc::clone(&self.state);
        let debounce = self.debounce;

        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if latest_seq.load(Ordering::SeqCst) != seq {
                return;
            }

            let next = match backend.preview_custom_tier_price(quantity).await {
                Ok(Some(price)) => PreviewState::Priced { quantity, price },
                Ok(None) => PreviewState::Unavailable { quantity },
                Err(e) => {
                    tracing::warn!(quantity = quantity, error = %e, "Custom tier price preview failed");
                    PreviewState::Failed { quantity }
                }
            };

            let applied = state.send_if_modified(|current| {
                if latest_seq.load(Ordering::SeqCst) != seq {
                    return false;
                }
                *current = next;
                true
            });
            if !applied {
                tracing::debug!(quantity = quantity, seq = seq, "Discarded stale custom price preview");
            }
        });

        seq
    }

    /// Abandon any pending preview and return to idle
    pub fn reset(&self) {
        self.state.send_modify(|state| {
            self.latest_seq.fetch_add(1, Ordering::SeqCst);
            *state = PreviewState::Idle;
        });
    }

    /// Re-issue the preview if the last attempt failed to reach the backend
    ///
    /// Must be called from within a tokio runtime.
    pub fn retry(&self) -> Option<u64> {
        match self.current() {
            PreviewState::Failed { quantity } => Some(self.request(quantity)),
            _ => None,
        }
    }

    /// True while a preview is debouncing or awaiting the backend
    pub fn is_pending(&self) -> bool {
        matches!(*self.state.borrow(), PreviewState::Pending { .. })
    }

    pub fn current(&self) -> PreviewState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PreviewState> {
        self.state.subscribe()
    }

    /// Monthly price resolved for `quantity`
    pub fn price_for(&self, quantity: u32) -> BillingResult<Decimal> {
        match self.current() {
            PreviewState::Priced { quantity: q, price } if q == quantity => Ok(price),
            PreviewState::Unavailable { quantity: q } if q == quantity => {
                Err(BillingError::PricingUnavailable { quantity })
            }
            PreviewState::Failed { quantity: q } if q == quantity => {
                Err(BillingError::PricingFailed { quantity })
            }
            _ => Err(BillingError::PricingPending),
        }
    }

    /// Wait until the preview for the latest quantity settles
    pub async fn settled(&self) -> PreviewState {
        let mut rx = self.state.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if !matches!(current, PreviewState::Pending { .. }) {
                return current;
            }
            if rx.changed().await.is_err() {
                return self.current();
            }
        }
    }
}
