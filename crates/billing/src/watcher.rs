//! Payment status watcher
//!
//! Detects the PENDING -> PAID transition of a charge through two event
//! sources feeding one [`ConfirmationArbiter`]:
//!
//! - **Push**: a topic subscription scoped to the charge. Delivery may stop
//!   silently, so a confirmed push channel never replaces polling.
//! - **Poll**: a status request every 5s while push is unconfirmed or failed,
//!   every 30s once the provider confirmed the subscription.
//!
//! The arbiter owns the only `Watching` guard. It is checked before any side
//! effect, so a push event and a poll response landing in the same tick
//! confirm once. Teardown (confirmation or stop) aborts the poll timer and
//! unsubscribes push synchronously; requests already in flight finish but are
//! ignored by the guard. There is no overall timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use franquia_shared::ChargeStatus;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backend::ChargeBackend;
use crate::config::WatcherConfig;
use crate::lock_unpoisoned;
use crate::push::{charge_topic, PushChannel, SubscriptionId};

/// Lifecycle of one watch session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    Idle,
    Watching,
    Confirmed,
    Stopped,
}

impl WatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WatchState::Confirmed | WatchState::Stopped)
    }
}

/// Push subscription progress, drives the poll cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushState {
    Connecting,
    Confirmed,
    Unavailable,
}

/// Where a status observation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationSource {
    InitialCheck,
    Poll,
    Push,
}

impl std::fmt::Display for ObservationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ObservationSource::InitialCheck => "initial_check",
            ObservationSource::Poll => "poll",
            ObservationSource::Push => "push",
        };
        write!(f, "{}", s)
    }
}

/// Passed to the completion callback when a charge is confirmed paid
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentConfirmation {
    pub charge_id: String,
    pub source: ObservationSource,
    #[serde(with = "time::serde::rfc3339")]
    pub confirmed_at: OffsetDateTime,
}

pub type ConfirmationCallback = Box<dyn FnOnce(PaymentConfirmation) + Send>;

/// Timer tasks and the push subscription owned by a session
#[derive(Default)]
struct SessionResources {
    tasks: Vec<JoinHandle<()>>,
    push_subscription: Option<(SubscriptionId, Arc<dyn PushChannel>)>,
}

impl SessionResources {
    fn release(self) {
        for task in self.tasks {
            task.abort();
        }
        if let Some((id, channel)) = self.push_subscription {
            channel.unsubscribe(id);
        }
    }
}

struct ArbiterInner {
    state: WatchState,
    on_paid: Option<ConfirmationCallback>,
    resources: SessionResources,
}

/// Single arbitration point for one charge's watch session
pub struct ConfirmationArbiter {
    charge_id: String,
    inner: Mutex<ArbiterInner>,
    state_tx: watch::Sender<WatchState>,
}

impl ConfirmationArbiter {
    pub fn new(charge_id: impl Into<String>, on_paid: ConfirmationCallback) -> Self {
        let (state_tx, _) = watch::channel(WatchState::Idle);
        Self {
            charge_id: charge_id.into(),
            inner: Mutex::new(ArbiterInner {
                state: WatchState::Idle,
                on_paid: Some(on_paid),
                resources: SessionResources::default(),
            }),
            state_tx,
        }
    }

    pub fn charge_id(&self) -> &str {
        &self.charge_id
    }

    pub fn state(&self) -> WatchState {
        lock_unpoisoned(&self.inner).state
    }

    pub fn is_watching(&self) -> bool {
        self.state() == WatchState::Watching
    }

    /// IDLE -> WATCHING
    pub fn begin(&self) -> bool {
        let mut inner = lock_unpoisoned(&self.inner);
        if inner.state != WatchState::Idle {
            return false;
        }
        inner.state = WatchState::Watching;
        drop(inner);
        self.state_tx.send_replace(WatchState::Watching);
        true
    }

    /// Feed one status observation. Returns true only for the observation that confirmed.
    pub fn observe(&self, source: ObservationSource, status: ChargeStatus) -> bool {
        if !status.is_paid() {
            return false;
        }

        let (callback, resources) = {
            let mut inner = lock_unpoisoned(&self.inner);
            if inner.state != WatchState::Watching {
                return false;
            }
            inner.state = WatchState::Confirmed;
            (
                inner.on_paid.take(),
                std::mem::take(&mut inner.resources),
            )
        };

        resources.release();
        tracing::info!(charge_id = %self.charge_id, source = %source, "Payment confirmed");
        self.state_tx.send_replace(WatchState::Confirmed);

        if let Some(callback) = callback {
            callback(PaymentConfirmation {
                charge_id: self.charge_id.clone(),
                source,
                confirmed_at: OffsetDateTime::now_utc(),
            });
        }
        true
    }

    /// WATCHING (or IDLE) -> STOPPED. The callback is dropped unfired.
    pub fn stop(&self) -> bool {
        let resources = {
            let mut inner = lock_unpoisoned(&self.inner);
            if inner.state.is_terminal() {
                return false;
            }
            inner.state = WatchState::Stopped;
            inner.on_paid = None;
            std::mem::take(&mut inner.resources)
        };

        resources.release();
        tracing::info!(charge_id = %self.charge_id, "Payment watch stopped");
        self.state_tx.send_replace(WatchState::Stopped);
        true
    }

    /// Hand a timer task to the session; aborted at once if the session already ended
    fn attach_task(&self, task: JoinHandle<()>) {
        let mut inner = lock_unpoisoned(&self.inner);
        if inner.state == WatchState::Watching {
            inner.resources.tasks.push(task);
        } else {
            task.abort();
        }
    }

    /// Record the push subscription; false if the session already ended
    fn attach_push_subscription(&self, id: SubscriptionId, channel: Arc<dyn PushChannel>) -> bool {
        let mut inner = lock_unpoisoned(&self.inner);
        if inner.state != WatchState::Watching {
            return false;
        }
        inner.resources.push_subscription = Some((id, channel));
        true
    }

    /// Wait for CONFIRMED or STOPPED
    pub async fn finished(&self) -> WatchState {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }
}

/// Control handle for a running watch session
#[derive(Clone)]
pub struct WatchHandle {
    arbiter: Arc<ConfirmationArbiter>,
    push_state: watch::Receiver<PushState>,
}

impl WatchHandle {
    pub fn charge_id(&self) -> &str {
        self.arbiter.charge_id()
    }

    pub fn state(&self) -> WatchState {
        self.arbiter.state()
    }

    pub fn push_state(&self) -> PushState {
        *self.push_state.borrow()
    }

    /// Tear down both channels; no callback fires afterwards
    pub fn stop(&self) -> bool {
        self.arbiter.stop()
    }

    pub async fn finished(&self) -> WatchState {
        self.arbiter.finished().await
    }
}

/// Result of a watch request
pub enum WatchStart {
    Started(WatchHandle),
    /// A session for this charge is already watching; the request was a no-op
    AlreadyWatching,
}

/// Watches charges until paid or stopped, one session per charge
#[derive(Clone)]
pub struct PaymentStatusWatcher {
    backend: Arc<dyn ChargeBackend>,
    push: Arc<dyn PushChannel>,
    config: WatcherConfig,
    sessions: Arc<Mutex<HashMap<String, Arc<ConfirmationArbiter>>>>,
}

impl PaymentStatusWatcher {
    pub fn new(
        backend: Arc<dyn ChargeBackend>,
        push: Arc<dyn PushChannel>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            backend,
            push,
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start watching `charge_id`; `on_paid` runs at most once
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch<F>(&self, charge_id: &str, on_paid: F) -> WatchStart
    where
        F: FnOnce(PaymentConfirmation) + Send + 'static,
    {
        let arbiter = {
            let mut sessions = lock_unpoisoned(&self.sessions);
            sessions.retain(|_, session| !session.state().is_terminal());
            if sessions.contains_key(charge_id) {
                tracing::debug!(charge_id = %charge_id, "Charge already being watched");
                return WatchStart::AlreadyWatching;
            }

            let arbiter = Arc::new(ConfirmationArbiter::new(charge_id, Box::new(on_paid)));
            sessions.insert(charge_id.to_string(), Arc::clone(&arbiter));
            arbiter.begin();
            arbiter
        };

        let initial_push = if self.config.push_enabled {
            PushState::Connecting
        } else {
            PushState::Unavailable
        };
        let (push_tx, push_rx) = watch::channel(initial_push);

        tracing::info!(
            charge_id = %charge_id,
            push_enabled = self.config.push_enabled,
            "Watching charge for payment"
        );

        // Covers a payment that settled before the watcher attached
        spawn_status_check(
            Arc::clone(&arbiter),
            Arc::clone(&self.backend),
            ObservationSource::InitialCheck,
        );

        if self.config.push_enabled {
            tokio::spawn(run_push(
                Arc::clone(&arbiter),
                Arc::clone(&self.push),
                push_tx,
            ));
        }

        let poller = tokio::spawn(run_poller(
            Arc::clone(&arbiter),
            Arc::clone(&self.backend),
            push_rx.clone(),
            self.config.clone(),
        ));
        arbiter.attach_task(poller);

        WatchStart::Started(WatchHandle {
            arbiter,
            push_state: push_rx,
        })
    }

    /// Stop the session for `charge_id`, if one is watching
    pub fn stop(&self, charge_id: &str) -> bool {
        let session = lock_unpoisoned(&self.sessions).remove(charge_id);
        session.map_or(false, |arbiter| arbiter.stop())
    }

    pub fn is_watching(&self, charge_id: &str) -> bool {
        lock_unpoisoned(&self.sessions)
            .get(charge_id)
            .map_or(false, |arbiter| arbiter.is_watching())
    }
}

fn spawn_status_check(
    arbiter: Arc<ConfirmationArbiter>,
    backend: Arc<dyn ChargeBackend>,
    source: ObservationSource,
) {
    tokio::spawn(async move {
        match backend.get_charge_status(arbiter.charge_id()).await {
            Ok(status) => {
                arbiter.observe(source, status);
            }
            Err(e) => {
                tracing::debug!(
                    charge_id = %arbiter.charge_id(),
                    source = %source,
                    error = %e,
                    "Charge status check failed, retrying next tick"
                );
            }
        }
    });
}

async fn run_poller(
    arbiter: Arc<ConfirmationArbiter>,
    backend: Arc<dyn ChargeBackend>,
    mut push_state: watch::Receiver<PushState>,
    config: WatcherConfig,
) {
    let mut last_tick = Instant::now();
    let mut push_alive = true;

    loop {
        let cadence = match *push_state.borrow_and_update() {
            PushState::Confirmed => config.safety_poll_interval,
            PushState::Connecting | PushState::Unavailable => config.fast_poll_interval,
        };

        tokio::select! {
            _ = tokio::time::sleep_until(last_tick + cadence) => {
                if !arbiter.is_watching() {
                    return;
                }
                last_tick = Instant::now();
                // Ticks do not wait for earlier requests
                spawn_status_check(Arc::clone(&arbiter), Arc::clone(&backend), ObservationSource::Poll);
            }
            changed = push_state.changed(), if push_alive => {
                if changed.is_err() {
                    push_alive = false;
                }
            }
        }
    }
}

async fn run_push(
    arbiter: Arc<ConfirmationArbiter>,
    channel: Arc<dyn PushChannel>,
    push_state: watch::Sender<PushState>,
) {
    let charge_id = arbiter.charge_id().to_string();
    let topic = charge_topic(&charge_id);

    let mut subscription = match channel.subscribe(&topic).await {
        Ok(subscription) => subscription,
        Err(e) => {
            push_state.send_replace(PushState::Unavailable);
            tracing::warn!(
                charge_id = %charge_id,
                error = %e,
                "Push subscription failed, polling every fast interval"
            );
            return;
        }
    };

    if !arbiter.attach_push_subscription(subscription.id, Arc::clone(&channel)) {
        // Session ended while the subscription was being confirmed
        channel.unsubscribe(subscription.id);
        return;
    }

    push_state.send_replace(PushState::Confirmed);
    tracing::debug!(charge_id = %charge_id, "Push subscription confirmed, polling as safety net");

    while let Some(event) = subscription.events.recv().await {
        if event.charge_id != charge_id {
            continue;
        }
        if arbiter.observe(ObservationSource::Push, event.new_status) || !arbiter.is_watching() {
            return;
        }
    }

    if arbiter.is_watching() {
        push_state.send_replace(PushState::Unavailable);
        tracing::warn!(charge_id = %charge_id, "Push stream closed, falling back to fast polling");
    }
}
