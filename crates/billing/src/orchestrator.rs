//! Upgrade flow orchestration
//!
//! SELECT_TIER -> CONFIRM -> GENERATE_CHARGE -> WATCH_PAYMENT -> FINALIZE.
//!
//! The user may close the flow at any step. Closing while the payment is being
//! watched tears the watcher down without finalizing; the charge stays pending
//! on the backend and the generator hands it back if the same choice is
//! confirmed again. Finalization runs once per flow even when push and poll
//! both report the payment.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use franquia_shared::{Charge, ChargeIntent, Subscription, Tier};
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use crate::backend::{ChargeBackend, SubscriptionProfile};
use crate::catalog::{TierCatalog, TierResolution};
use crate::charge::PaymentChargeGenerator;
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::lock_unpoisoned;
use crate::proration::{CustomPricePreview, DueToday, ProRataPricingEngine};
use crate::push::PushChannel;
use crate::quota::{clamp_to_floor, min_allowed_quantity, resolve_current_tier, validate_custom_quantity};
use crate::watcher::{PaymentConfirmation, PaymentStatusWatcher, WatchHandle, WatchStart};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStep {
    SelectTier,
    Confirm,
    GenerateCharge,
    WatchPayment,
    Finalize,
    Closed,
}

/// A standard tier id or a typed custom quantity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierChoice {
    Standard(String),
    Custom(u32),
}

impl FromStr for TierChoice {
    type Err = BillingError;

    /// `custom:<qty>` selects a custom quantity, anything else is a tier id
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(BillingError::NoSelection);
        }
        match s.strip_prefix("custom:") {
            Some(quantity) => quantity
                .trim()
                .parse::<u32>()
                .map(TierChoice::Custom)
                .map_err(|_| BillingError::UnknownTier(s.to_string())),
            None => Ok(TierChoice::Standard(s.to_string())),
        }
    }
}

/// What the flow offers for a target capacity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeOffer {
    pub tiers: Vec<Tier>,
    pub min_allowed_quantity: u32,
    pub default_tier_id: Option<String>,
    pub custom_mode: bool,
    /// Quantity pre-filled in custom mode, already raised to `min_allowed_quantity`
    pub seed_quantity: Option<u32>,
}

/// Priced selection ready for confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeQuote {
    pub tier: Tier,
    pub monthly_price: Decimal,
    pub due_today: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    Paid(Charge),
    Cancelled,
}

enum FlowSignal {
    Paid(PaymentConfirmation),
    Cancelled,
}

struct FlowState {
    flow_id: Option<Uuid>,
    step: FlowStep,
    subscription: Option<Subscription>,
    eligible: Vec<Tier>,
    min_allowed: u32,
    custom_mode: bool,
    selected_tier_id: Option<String>,
    manual_quantity: Option<u32>,
    intent_id: Option<String>,
    watch: Option<WatchHandle>,
    signal_tx: Option<oneshot::Sender<FlowSignal>>,
    finalized: bool,
}

impl FlowState {
    fn closed() -> Self {
        Self {
            flow_id: None,
            step: FlowStep::Closed,
            subscription: None,
            eligible: Vec::new(),
            min_allowed: 0,
            custom_mode: false,
            selected_tier_id: None,
            manual_quantity: None,
            intent_id: None,
            watch: None,
            signal_tx: None,
            finalized: false,
        }
    }

    fn current_tier(&self) -> Option<Tier> {
        resolve_current_tier(
            self.selected_tier_id.as_deref(),
            &self.eligible,
            self.custom_mode,
            self.manual_quantity,
        )
    }
}

/// Drives one upgrade at a time from tier selection to payment confirmation
pub struct UpgradeOrchestrator {
    catalog: TierCatalog,
    profile: Arc<dyn SubscriptionProfile>,
    generator: PaymentChargeGenerator,
    watcher: PaymentStatusWatcher,
    pricing: ProRataPricingEngine,
    preview: CustomPricePreview,
    state: Arc<Mutex<FlowState>>,
    charge_tx: watch::Sender<Option<Charge>>,
}

impl UpgradeOrchestrator {
    pub fn new(
        catalog: TierCatalog,
        backend: Arc<dyn ChargeBackend>,
        push: Arc<dyn PushChannel>,
        profile: Arc<dyn SubscriptionProfile>,
        config: &BillingConfig,
    ) -> Self {
        let (charge_tx, _) = watch::channel(None);
        Self {
            catalog,
            profile,
            generator: PaymentChargeGenerator::new(Arc::clone(&backend)),
            watcher: PaymentStatusWatcher::new(
                Arc::clone(&backend),
                push,
                config.watcher.clone(),
            ),
            pricing: ProRataPricingEngine::new(&config.pricing),
            preview: CustomPricePreview::new(backend, &config.pricing),
            state: Arc::new(Mutex::new(FlowState::closed())),
            charge_tx,
        }
    }

    pub fn step(&self) -> FlowStep {
        lock_unpoisoned(&self.state).step
    }

    /// Correlation id of the current flow, set when it starts
    pub fn flow_id(&self) -> Option<Uuid> {
        lock_unpoisoned(&self.state).flow_id
    }

    pub fn preview(&self) -> &CustomPricePreview {
        &self.preview
    }

    pub fn generator(&self) -> &PaymentChargeGenerator {
        &self.generator
    }

    /// Charge being paid in the current flow, updated when one is generated
    pub fn charge_updates(&self) -> watch::Receiver<Option<Charge>> {
        self.charge_tx.subscribe()
    }

    /// Tier the current selection resolves to
    pub fn selection(&self) -> Option<Tier> {
        lock_unpoisoned(&self.state).current_tier()
    }

    /// Open the flow for `target_capacity`
    pub async fn start_upgrade_flow(&self, target_capacity: u32) -> BillingResult<UpgradeOffer> {
        {
            let state = lock_unpoisoned(&self.state);
            if matches!(
                state.step,
                FlowStep::GenerateCharge | FlowStep::WatchPayment | FlowStep::Finalize
            ) {
                return Err(BillingError::InvalidFlowState(
                    "an upgrade is already in progress".to_string(),
                ));
            }
        }

        // Usage moves between flows, so the floor is derived from a fresh read
        let subscription = self.profile.refresh().await?;
        let usage = subscription.used_automation_slots;
        let min_allowed = min_allowed_quantity(&self.catalog, usage);
        let resolution = self
            .catalog
            .resolve(target_capacity, subscription.paid_capacity(), usage);

        self.preview.reset();
        self.charge_tx.send_replace(None);

        let offer = match resolution {
            TierResolution::Standard {
                eligible,
                default_tier_id,
            } => UpgradeOffer {
                tiers: eligible,
                min_allowed_quantity: min_allowed,
                default_tier_id: Some(default_tier_id),
                custom_mode: false,
                seed_quantity: None,
            },
            TierResolution::CustomQuantity { seed_quantity } => UpgradeOffer {
                tiers: Vec::new(),
                min_allowed_quantity: min_allowed,
                default_tier_id: None,
                custom_mode: true,
                seed_quantity: Some(clamp_to_floor(seed_quantity, min_allowed)),
            },
        };

        let manual_quantity = offer.seed_quantity;

        let flow_id = Uuid::new_v4();
        {
            let mut state = lock_unpoisoned(&self.state);
            *state = FlowState {
                flow_id: Some(flow_id),
                step: FlowStep::SelectTier,
                subscription: Some(subscription),
                eligible: offer.tiers.clone(),
                min_allowed,
                custom_mode: offer.custom_mode,
                selected_tier_id: offer.default_tier_id.clone(),
                manual_quantity,
                ..FlowState::closed()
            };
        }

        if let Some(quantity) = manual_quantity {
            self.preview.request(quantity);
        }

        tracing::info!(
            flow_id = %flow_id,
            target_capacity = target_capacity,
            eligible = offer.tiers.len(),
            min_allowed_quantity = min_allowed,
            custom_mode = offer.custom_mode,
            "Upgrade flow started"
        );
        Ok(offer)
    }

    /// Select a standard tier or a custom quantity
    ///
    /// Must be called from within a tokio runtime.
    pub fn select_tier(&self, choice: TierChoice) -> BillingResult<Tier> {
        let mut state = lock_unpoisoned(&self.state);
        if !matches!(state.step, FlowStep::SelectTier | FlowStep::Confirm) {
            return Err(BillingError::InvalidFlowState(format!(
                "cannot select a tier during {:?}",
                state.step
            )));
        }

        match choice {
            TierChoice::Standard(tier_id) => {
                if !state.eligible.iter().any(|t| t.id == tier_id) {
                    return Err(BillingError::UnknownTier(tier_id));
                }
                state.custom_mode = false;
                state.manual_quantity = None;
                state.selected_tier_id = Some(tier_id);
                self.preview.reset();
            }
            TierChoice::Custom(quantity) => {
                let quantity = validate_custom_quantity(quantity, state.min_allowed)?;
                state.custom_mode = true;
                state.manual_quantity = Some(quantity);
                state.selected_tier_id = None;
                self.preview.request(quantity);
            }
        }

        state.step = FlowStep::Confirm;
        let tier = state.current_tier().ok_or(BillingError::NoSelection)?;
        tracing::debug!(tier_id = %tier.id, capacity = tier.capacity, "Tier selected");
        Ok(tier)
    }

    /// Price the current selection as of now
    ///
    /// A custom price that failed to load is requested again and reported as pending.
    pub fn quote(&self) -> BillingResult<UpgradeQuote> {
        self.quote_at(OffsetDateTime::now_utc())
    }

    fn quote_at(&self, now: OffsetDateTime) -> BillingResult<UpgradeQuote> {
        let (tier, subscription) = {
            let state = lock_unpoisoned(&self.state);
            let subscription = state
                .subscription
                .clone()
                .ok_or_else(|| BillingError::InvalidFlowState("flow not started".to_string()))?;
            (state.current_tier().ok_or(BillingError::NoSelection)?, subscription)
        };

        let monthly_price = if tier.is_custom {
            match self.preview.price_for(tier.capacity) {
                Err(BillingError::PricingFailed { quantity }) => {
                    tracing::debug!(quantity = quantity, "Retrying custom tier price preview");
                    self.preview.retry();
                    return Err(BillingError::PricingPending);
                }
                price => price?,
            }
        } else {
            tier.effective_price()
        };

        match self.pricing.quote(monthly_price, &subscription, now) {
            DueToday::Amount(due_today) => Ok(UpgradeQuote {
                tier: Tier {
                    monthly_price,
                    ..tier
                },
                monthly_price,
                due_today,
            }),
            DueToday::Unknown => Err(BillingError::PricingUnknown),
        }
    }

    /// Generate the charge for the selection and wait until it is paid or the flow is cancelled
    pub async fn confirm_upgrade(&self) -> BillingResult<UpgradeOutcome> {
        let (quote, subscription) = {
            let (step, subscription) = {
                let state = lock_unpoisoned(&self.state);
                (state.step, state.subscription.clone())
            };
            if !matches!(step, FlowStep::SelectTier | FlowStep::Confirm) {
                return Err(BillingError::InvalidFlowState(format!(
                    "cannot confirm during {:?}",
                    step
                )));
            }
            let subscription = subscription
                .ok_or_else(|| BillingError::InvalidFlowState("flow not started".to_string()))?;
            (self.quote()?, subscription)
        };

        let intent = ChargeIntent::for_selection(&quote.tier, &subscription, quote.due_today);
        let (signal_tx, signal_rx) = oneshot::channel();
        let flow_id = {
            let mut state = lock_unpoisoned(&self.state);
            if !matches!(state.step, FlowStep::SelectTier | FlowStep::Confirm) {
                return Err(BillingError::InvalidFlowState(
                    "flow changed while confirming".to_string(),
                ));
            }
            state.step = FlowStep::GenerateCharge;
            state.intent_id = Some(intent.id.clone());
            state.signal_tx = Some(signal_tx);
            state.finalized = false;
            state.flow_id.unwrap_or_default()
        };

        tracing::info!(
            flow_id = %flow_id,
            intent_id = %intent.id,
            tier_id = %intent.tier_id,
            quantity = intent.quantity,
            amount_due = %intent.amount_due,
            "Confirming upgrade"
        );

        let charge = match self.generator.generate(&intent).await {
            Ok(charge) => charge,
            Err(e) => {
                let mut state = lock_unpoisoned(&self.state);
                if state.step == FlowStep::GenerateCharge {
                    state.step = FlowStep::Confirm;
                    state.signal_tx = None;
                }
                return Err(e);
            }
        };

        {
            let mut state = lock_unpoisoned(&self.state);
            if state.step != FlowStep::GenerateCharge {
                tracing::info!(charge_id = %charge.id, "Flow closed during charge generation");
                return Ok(UpgradeOutcome::Cancelled);
            }
            state.step = FlowStep::WatchPayment;
        }

        let flow_state = Arc::clone(&self.state);
        let started = self.watcher.watch(&charge.id, move |confirmation| {
            let signal_tx = lock_unpoisoned(&flow_state).signal_tx.take();
            if let Some(signal_tx) = signal_tx {
                // The receiver only goes away when confirm_upgrade was dropped
                let _ = signal_tx.send(FlowSignal::Paid(confirmation));
            }
        });

        match started {
            WatchStart::Started(handle) => {
                let mut state = lock_unpoisoned(&self.state);
                if state.step == FlowStep::WatchPayment {
                    state.watch = Some(handle);
                } else {
                    handle.stop();
                }
            }
            WatchStart::AlreadyWatching => {
                tracing::warn!(charge_id = %charge.id, "Charge already watched by another flow");
                let mut state = lock_unpoisoned(&self.state);
                if state.step == FlowStep::WatchPayment {
                    state.step = FlowStep::Confirm;
                    state.signal_tx = None;
                }
                return Err(BillingError::InvalidFlowState(
                    "charge is already being watched".to_string(),
                ));
            }
        }
        self.charge_tx.send_replace(Some(charge.clone()));

        match signal_rx.await {
            Ok(FlowSignal::Paid(confirmation)) => {
                Ok(self.finalize(&intent.id, charge, confirmation).await)
            }
            Ok(FlowSignal::Cancelled) | Err(_) => Ok(UpgradeOutcome::Cancelled),
        }
    }

    async fn finalize(
        &self,
        intent_id: &str,
        charge: Charge,
        confirmation: PaymentConfirmation,
    ) -> UpgradeOutcome {
        {
            let mut state = lock_unpoisoned(&self.state);
            if state.finalized {
                return UpgradeOutcome::Paid(charge);
            }
            state.finalized = true;
            state.step = FlowStep::Finalize;
            state.watch = None;
        }

        let subscription = match self.profile.refresh().await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                tracing::warn!(error = %e, "Subscription refresh after payment failed");
                None
            }
        };

        let paid = self.generator.settle(intent_id).unwrap_or_else(|| {
            let mut charge = charge;
            charge.mark_paid();
            charge
        });

        {
            let mut state = lock_unpoisoned(&self.state);
            if subscription.is_some() {
                state.subscription = subscription;
            }
            state.step = FlowStep::Closed;
        }
        self.charge_tx.send_replace(Some(paid.clone()));

        tracing::info!(
            flow_id = ?self.flow_id(),
            charge_id = %paid.id,
            intent_id = %intent_id,
            source = %confirmation.source,
            "Upgrade finalized"
        );
        UpgradeOutcome::Paid(paid)
    }

    /// Close the flow. Returns false when it was already closed or finalizing.
    pub fn cancel_upgrade(&self) -> bool {
        let (watch, signal_tx) = {
            let mut state = lock_unpoisoned(&self.state);
            if matches!(state.step, FlowStep::Closed | FlowStep::Finalize) {
                return false;
            }
            tracing::info!(flow_id = ?state.flow_id, step = ?state.step, "Upgrade flow cancelled");
            state.step = FlowStep::Closed;
            (state.watch.take(), state.signal_tx.take())
        };

        if let Some(watch) = watch {
            watch.stop();
        }
        self.preview.reset();
        if let Some(signal_tx) = signal_tx {
            let _ = signal_tx.send(FlowSignal::Cancelled);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proration::PreviewState;
    use crate::push::{charge_topic, PushEvent, PushHub};
    use crate::test_support::{active_subscription, FakeBackend, FakeProfile};
    use franquia_shared::{ChargeStatus, PlanStatus};

    struct Harness {
        backend: Arc<FakeBackend>,
        hub: Arc<PushHub>,
        profile: Arc<FakeProfile>,
        flow: Arc<UpgradeOrchestrator>,
    }

    fn harness(subscription: Subscription) -> Harness {
        let backend = Arc::new(FakeBackend::new());
        let hub = Arc::new(PushHub::new());
        let profile = Arc::new(FakeProfile::new(subscription));
        let catalog = TierCatalog::new(vec![
            Tier::standard("t10", 10, Decimal::new(60, 0)),
            Tier::standard("t20", 20, Decimal::new(100, 0)),
            Tier::standard("t30", 30, Decimal::new(150, 0)),
        ]);
        let flow = Arc::new(UpgradeOrchestrator::new(
            catalog,
            backend.clone(),
            hub.clone(),
            profile.clone(),
            &BillingConfig::default(),
        ));
        Harness {
            backend,
            hub,
            profile,
            flow,
        }
    }

    async fn wait_for_charge(flow: &UpgradeOrchestrator) -> Charge {
        let mut rx = flow.charge_updates();
        loop {
            if let Some(charge) = rx.borrow_and_update().clone() {
                return charge;
            }
            rx.changed().await.unwrap();
        }
    }

    async fn wait_for_push(hub: &PushHub, charge_id: &str) {
        while hub.subscriber_count(&charge_topic(charge_id)) == 0 {
            tokio::task::yield_now().await;
        }
    }

    fn paid(charge_id: &str) -> PushEvent {
        PushEvent {
            charge_id: charge_id.to_string(),
            new_status: ChargeStatus::Paid,
        }
    }

    #[test]
    fn test_tier_choice_parsing() {
        assert_eq!("t30".parse::<TierChoice>().unwrap(), TierChoice::Standard("t30".into()));
        assert_eq!("custom:42".parse::<TierChoice>().unwrap(), TierChoice::Custom(42));
        assert!("custom:abc".parse::<TierChoice>().is_err());
        assert!(matches!("".parse::<TierChoice>(), Err(BillingError::NoSelection)));
    }

    #[tokio::test]
    async fn test_start_flow_offers_strict_upgrades() {
        let h = harness(active_subscription(OffsetDateTime::now_utc()));
        let offer = h.flow.start_upgrade_flow(15).await.unwrap();

        let ids: Vec<_> = offer.tiers.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t30"]);
        assert_eq!(offer.default_tier_id.as_deref(), Some("t30"));
        assert_eq!(offer.min_allowed_quantity, 31);
        assert!(!offer.custom_mode);
        assert_eq!(h.flow.step(), FlowStep::SelectTier);
    }

    #[tokio::test]
    async fn test_start_flow_beyond_catalog_enters_custom_mode() {
        let h = harness(active_subscription(OffsetDateTime::now_utc()));
        let offer = h.flow.start_upgrade_flow(45).await.unwrap();

        assert!(offer.custom_mode);
        assert!(offer.tiers.is_empty());
        // usage + 1 = 13 sits below the floor, so the pre-fill starts at the floor
        assert_eq!(offer.seed_quantity, Some(31));
        let selection = h.flow.selection().unwrap();
        assert!(selection.is_custom);
        assert_eq!(selection.capacity, 31);
        assert!(h.flow.preview().is_pending());

        let seeded = h.flow.select_tier(TierChoice::Custom(31)).unwrap();
        assert_eq!(seeded.capacity, 31);
    }

    #[tokio::test]
    async fn test_reopened_flow_reads_current_usage() {
        let now = OffsetDateTime::now_utc();
        let h = harness(active_subscription(now));
        let offer = h.flow.start_upgrade_flow(45).await.unwrap();
        assert_eq!(offer.min_allowed_quantity, 31);
        assert!(h.flow.cancel_upgrade());

        let mut grown = active_subscription(now);
        grown.used_automation_slots = 40;
        h.profile.set_subscription(grown);

        let offer = h.flow.start_upgrade_flow(45).await.unwrap();
        assert_eq!(offer.min_allowed_quantity, 40);
        assert_eq!(offer.seed_quantity, Some(41));
        assert_eq!(h.profile.refreshes(), 2);
    }

    #[tokio::test]
    async fn test_custom_quantity_below_floor_rejected() {
        let h = harness(active_subscription(OffsetDateTime::now_utc()));
        h.flow.start_upgrade_flow(15).await.unwrap();

        let err = h.flow.select_tier(TierChoice::Custom(15)).unwrap_err();
        assert!(matches!(
            err,
            BillingError::QuantityBelowMinimum {
                requested: 15,
                minimum: 31
            }
        ));
        assert!(err.is_user_visible());
        assert!(matches!(
            h.flow.select_tier(TierChoice::Standard("t10".into())),
            Err(BillingError::UnknownTier(_))
        ));
    }

    #[tokio::test]
    async fn test_quote_prorates_selected_tier() {
        let now = OffsetDateTime::now_utc();
        let h = harness(active_subscription(now));
        h.flow.start_upgrade_flow(15).await.unwrap();
        h.flow.select_tier(TierChoice::Standard("t30".into())).unwrap();

        let quote = h.flow.quote_at(now).unwrap();
        assert_eq!(quote.monthly_price, Decimal::new(150, 0));
        // 150 * 15 / 30
        assert_eq!(quote.due_today, Decimal::new(7500, 2));
    }

    #[tokio::test]
    async fn test_confirm_blocked_while_renewal_unknown() {
        let mut subscription = active_subscription(OffsetDateTime::now_utc());
        subscription.renewal_date = None;
        let h = harness(subscription);
        h.flow.start_upgrade_flow(15).await.unwrap();

        let err = h.flow.confirm_upgrade().await.unwrap_err();
        assert!(matches!(err, BillingError::PricingUnknown));
        assert_eq!(h.backend.create_calls(), 0);
        assert_eq!(h.flow.step(), FlowStep::SelectTier);
    }

    #[tokio::test]
    async fn test_trial_plan_pays_full_month() {
        let mut subscription = active_subscription(OffsetDateTime::now_utc());
        subscription.status = PlanStatus::Trial;
        let h = harness(subscription);
        let offer = h.flow.start_upgrade_flow(5).await.unwrap();

        // No paid tier held, every tier that fits is offered
        assert_eq!(offer.tiers.len(), 3);
        assert_eq!(offer.default_tier_id.as_deref(), Some("t10"));
        assert_eq!(h.flow.quote().unwrap().due_today, Decimal::new(60, 0));
    }

    #[tokio::test]
    async fn test_paid_push_finalizes_once() {
        let h = harness(active_subscription(OffsetDateTime::now_utc()));
        h.flow.start_upgrade_flow(15).await.unwrap();

        let confirm = {
            let flow = h.flow.clone();
            tokio::spawn(async move { flow.confirm_upgrade().await })
        };

        let charge = wait_for_charge(&h.flow).await;
        wait_for_push(&h.hub, &charge.id).await;
        assert_eq!(h.flow.step(), FlowStep::WatchPayment);

        h.backend.set_status(ChargeStatus::Paid);
        h.hub.publish(&charge_topic(&charge.id), paid(&charge.id));

        let outcome = confirm.await.unwrap().unwrap();
        match outcome {
            UpgradeOutcome::Paid(paid) => {
                assert_eq!(paid.id, charge.id);
                assert_eq!(paid.status, ChargeStatus::Paid);
            }
            UpgradeOutcome::Cancelled => panic!("expected payment"),
        }
        // One read when the flow opened, one after payment
        assert_eq!(h.profile.refreshes(), 2);
        assert_eq!(h.flow.step(), FlowStep::Closed);
        assert_eq!(h.hub.subscriber_count(&charge_topic(&charge.id)), 0);
        assert!(!h.flow.cancel_upgrade());
    }

    #[tokio::test]
    async fn test_cancel_during_watch_keeps_charge_for_reentry() {
        let h = harness(active_subscription(OffsetDateTime::now_utc()));
        h.flow.start_upgrade_flow(15).await.unwrap();

        let confirm = {
            let flow = h.flow.clone();
            tokio::spawn(async move { flow.confirm_upgrade().await })
        };
        let charge = wait_for_charge(&h.flow).await;
        wait_for_push(&h.hub, &charge.id).await;

        assert!(h.flow.cancel_upgrade());
        assert_eq!(confirm.await.unwrap().unwrap(), UpgradeOutcome::Cancelled);

        // Late event after teardown reaches nobody
        assert_eq!(h.hub.publish(&charge_topic(&charge.id), paid(&charge.id)), 0);
        assert_eq!(h.profile.refreshes(), 1);
        let intent_id = h.backend.created_intents()[0].id.clone();
        assert!(h.flow.generator().pending_charge(&intent_id).is_some());

        // Reopening for the same choice hands back the pending charge
        h.flow.start_upgrade_flow(15).await.unwrap();
        let confirm = {
            let flow = h.flow.clone();
            tokio::spawn(async move { flow.confirm_upgrade().await })
        };
        let again = wait_for_charge(&h.flow).await;
        assert_eq!(again.id, charge.id);
        assert_eq!(h.backend.create_calls(), 1);

        wait_for_push(&h.hub, &charge.id).await;
        h.hub.publish(&charge_topic(&charge.id), paid(&charge.id));
        assert!(matches!(confirm.await.unwrap().unwrap(), UpgradeOutcome::Paid(_)));
        assert_eq!(h.profile.refreshes(), 3);
    }

    async fn pay_through_push(h: &Harness) -> Charge {
        let confirm = {
            let flow = h.flow.clone();
            tokio::spawn(async move { flow.confirm_upgrade().await })
        };
        let charge = wait_for_charge(&h.flow).await;
        wait_for_push(&h.hub, &charge.id).await;
        h.hub.publish(&charge_topic(&charge.id), paid(&charge.id));
        assert!(matches!(confirm.await.unwrap().unwrap(), UpgradeOutcome::Paid(_)));
        charge
    }

    #[tokio::test]
    async fn test_same_tier_in_a_later_cycle_gets_a_new_charge() {
        let now = OffsetDateTime::now_utc();
        let h = harness(active_subscription(now));
        h.flow.start_upgrade_flow(15).await.unwrap();
        let first = pay_through_push(&h).await;

        // Back on 20 slots one cycle later, upgrading to the same tier again
        let mut next_cycle = active_subscription(now);
        next_cycle.renewal_date = Some(now + time::Duration::days(45));
        h.profile.set_subscription(next_cycle);

        h.flow.start_upgrade_flow(15).await.unwrap();
        let second = pay_through_push(&h).await;

        let intents = h.backend.created_intents();
        assert_eq!(intents.len(), 2);
        assert_eq!(intents[0].tier_id, intents[1].tier_id);
        assert_ne!(intents[0].id, intents[1].id);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_charge_watched_elsewhere_returns_flow_to_confirm() {
        let h = harness(active_subscription(OffsetDateTime::now_utc()));
        h.flow.start_upgrade_flow(15).await.unwrap();

        // The fake backend names its first charge ch_1
        let other = match h.flow.watcher.watch("ch_1", |_: PaymentConfirmation| {}) {
            WatchStart::Started(handle) => handle,
            WatchStart::AlreadyWatching => panic!("expected a new session"),
        };

        let err = h.flow.confirm_upgrade().await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidFlowState(_)));
        assert_eq!(h.flow.step(), FlowStep::Confirm);

        // Once the other session ends the same pending charge can be watched here
        assert!(other.stop());
        let confirm = {
            let flow = h.flow.clone();
            tokio::spawn(async move { flow.confirm_upgrade().await })
        };
        let charge = wait_for_charge(&h.flow).await;
        assert_eq!(charge.id, "ch_1");
        assert_eq!(h.backend.create_calls(), 1);

        wait_for_push(&h.hub, &charge.id).await;
        h.hub.publish(&charge_topic(&charge.id), paid(&charge.id));
        assert!(matches!(confirm.await.unwrap().unwrap(), UpgradeOutcome::Paid(_)));
    }

    #[tokio::test]
    async fn test_generation_failure_returns_to_confirm() {
        let h = harness(active_subscription(OffsetDateTime::now_utc()));
        h.flow.start_upgrade_flow(15).await.unwrap();
        h.backend.fail_next_create("rejected by provider");

        let err = h.flow.confirm_upgrade().await.unwrap_err();
        assert!(matches!(err, BillingError::GenerationFailed(_)));
        assert!(err.is_user_visible());
        assert_eq!(h.flow.step(), FlowStep::Confirm);
        assert_eq!(h.backend.status_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_selection_waits_for_preview() {
        let h = harness(active_subscription(OffsetDateTime::now_utc()));
        h.flow.start_upgrade_flow(15).await.unwrap();
        h.backend.set_preview_price(40, Some(Decimal::new(180, 0)));

        let tier = h.flow.select_tier(TierChoice::Custom(40)).unwrap();
        assert!(tier.is_custom);
        assert!(matches!(h.flow.quote(), Err(BillingError::PricingPending)));

        h.flow.preview().settled().await;
        let quote = h.flow.quote().unwrap();
        assert_eq!(quote.monthly_price, Decimal::new(180, 0));
        assert_eq!(quote.tier.id, "custom_manual");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_custom_preview_is_requested_again() {
        let h = harness(active_subscription(OffsetDateTime::now_utc()));
        h.flow.start_upgrade_flow(15).await.unwrap();
        h.backend.set_preview_price(40, Some(Decimal::new(180, 0)));
        h.backend.fail_preview(true);

        h.flow.select_tier(TierChoice::Custom(40)).unwrap();
        assert_eq!(h.flow.preview().settled().await, PreviewState::Failed { quantity: 40 });

        h.backend.fail_preview(false);
        assert!(matches!(h.flow.quote(), Err(BillingError::PricingPending)));
        assert!(h.flow.preview().is_pending());

        h.flow.preview().settled().await;
        assert_eq!(h.flow.quote().unwrap().monthly_price, Decimal::new(180, 0));
        assert_eq!(h.backend.preview_calls(), vec![40, 40]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpriceable_custom_quantity_blocks_confirm() {
        let h = harness(active_subscription(OffsetDateTime::now_utc()));
        h.flow.start_upgrade_flow(15).await.unwrap();
        h.backend.set_preview_price(35, None);

        h.flow.select_tier(TierChoice::Custom(35)).unwrap();
        h.flow.preview().settled().await;

        let err = h.flow.confirm_upgrade().await.unwrap_err();
        assert!(matches!(err, BillingError::PricingUnavailable { quantity: 35 }));
        assert_eq!(h.backend.create_calls(), 0);
    }
}
