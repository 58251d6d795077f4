//! In-memory fakes for the backend, profile and push contracts

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use franquia_shared::{ChargeIntent, ChargeStatus, PlanStatus, Subscription};
use rust_decimal::Decimal;
use time::OffsetDateTime;
use tokio::sync::Notify;

use crate::backend::{ChargeBackend, CreatedCharge, SubscriptionProfile};
use crate::error::{BillingError, BillingResult};
use crate::push::{PushChannel, PushHub, PushSubscription, SubscriptionId};

#[derive(Default)]
pub struct FakeBackend {
    create_calls: AtomicUsize,
    create_intents: Mutex<Vec<ChargeIntent>>,
    create_gate: Mutex<Option<Arc<Notify>>>,
    create_failure: Mutex<Option<String>>,
    status: Mutex<Option<ChargeStatus>>,
    status_calls: AtomicUsize,
    status_fails: AtomicBool,
    status_gate: Mutex<Option<Arc<Notify>>>,
    preview_prices: Mutex<HashMap<u32, Option<Decimal>>>,
    preview_gates: Mutex<HashMap<u32, Arc<Notify>>>,
    preview_calls: Mutex<Vec<u32>>,
    preview_fails: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every create call until the returned notify fires
    pub fn gate_create(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.create_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn fail_next_create(&self, message: &str) {
        *self.create_failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn created_intents(&self) -> Vec<ChargeIntent> {
        self.create_intents.lock().unwrap().clone()
    }

    pub fn set_status(&self, status: ChargeStatus) {
        *self.status.lock().unwrap() = Some(status);
    }

    pub fn fail_status(&self, fail: bool) {
        self.status_fails.store(fail, Ordering::SeqCst);
    }

    /// Hold status checks until the returned notify fires; the status is read after release
    pub fn gate_status(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.status_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn set_preview_price(&self, quantity: u32, price: Option<Decimal>) {
        self.preview_prices.lock().unwrap().insert(quantity, price);
    }

    /// Hold previews for `quantity` until the returned notify fires
    pub fn gate_preview(&self, quantity: u32) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.preview_gates
            .lock()
            .unwrap()
            .insert(quantity, Arc::clone(&gate));
        gate
    }

    pub fn fail_preview(&self, fail: bool) {
        self.preview_fails.store(fail, Ordering::SeqCst);
    }

    pub fn preview_calls(&self) -> Vec<u32> {
        self.preview_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChargeBackend for FakeBackend {
    async fn create_charge(&self, intent: &ChargeIntent) -> BillingResult<CreatedCharge> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.create_intents.lock().unwrap().push(intent.clone());

        let gate = self.create_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(message) = self.create_failure.lock().unwrap().take() {
            return Err(BillingError::Backend(message));
        }

        Ok(CreatedCharge {
            id: format!("ch_{}", n),
            payload_for_payment: format!("PIX-PAYLOAD-{}", intent.id),
            amount: intent.amount_due,
        })
    }

    async fn get_charge_status(&self, _charge_id: &str) -> BillingResult<ChargeStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.status_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.status_fails.load(Ordering::SeqCst) {
            return Err(BillingError::Http("connection reset".to_string()));
        }
        Ok(self.status.lock().unwrap().unwrap_or(ChargeStatus::Pending))
    }

    async fn preview_custom_tier_price(&self, quantity: u32) -> BillingResult<Option<Decimal>> {
        self.preview_calls.lock().unwrap().push(quantity);

        let gate = self.preview_gates.lock().unwrap().get(&quantity).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.preview_fails.load(Ordering::SeqCst) {
            return Err(BillingError::Http("preview timed out".to_string()));
        }
        Ok(self
            .preview_prices
            .lock()
            .unwrap()
            .get(&quantity)
            .cloned()
            .unwrap_or_else(|| Some(Decimal::from(quantity) * Decimal::new(5, 0))))
    }
}

pub struct FakeProfile {
    subscription: Mutex<Subscription>,
    refreshes: AtomicUsize,
}

impl FakeProfile {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription: Mutex::new(subscription),
            refreshes: AtomicUsize::new(0),
        }
    }

    /// Replace what the backend reports, as settlement or usage changes would
    pub fn set_subscription(&self, subscription: Subscription) {
        *self.subscription.lock().unwrap() = subscription;
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubscriptionProfile for FakeProfile {
    async fn current(&self) -> BillingResult<Subscription> {
        Ok(self.subscription.lock().unwrap().clone())
    }

    async fn refresh(&self) -> BillingResult<Subscription> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(self.subscription.lock().unwrap().clone())
    }
}

/// Active plan: 20 slots contracted, 12 in use, renewing in 15 days
pub fn active_subscription(now: OffsetDateTime) -> Subscription {
    Subscription {
        contracted_capacity: 20,
        used_automation_slots: 12,
        monthly_price_applied: Decimal::new(100, 0),
        renewal_date: Some(now + time::Duration::days(15)),
        status: PlanStatus::Active,
    }
}

/// Push channel whose subscribe always fails
pub struct FailingPush;

#[async_trait]
impl PushChannel for FailingPush {
    async fn subscribe(&self, _topic: &str) -> BillingResult<PushSubscription> {
        Err(BillingError::PushUnavailable("socket closed".to_string()))
    }

    fn unsubscribe(&self, _id: SubscriptionId) {}
}

/// Hub wrapper whose subscription confirms only after a delay
pub struct SlowPush {
    pub hub: Arc<PushHub>,
    pub delay: Duration,
}

#[async_trait]
impl PushChannel for SlowPush {
    async fn subscribe(&self, topic: &str) -> BillingResult<PushSubscription> {
        tokio::time::sleep(self.delay).await;
        self.hub.subscribe(topic).await
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.hub.unsubscribe(id)
    }
}
