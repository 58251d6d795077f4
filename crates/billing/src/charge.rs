//! Charge generation
//!
//! One charge per upgrade intent. Concurrent calls for the same intent join
//! the request already in flight instead of creating a second charge, and a
//! charge that is still pending is handed back as-is when the flow reopens.
//! Failures are reported to every waiting caller and never retried here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::Engine;
use franquia_shared::{Charge, ChargeIntent};
use qrcode::render::svg;
use qrcode::QrCode;
use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::backend::ChargeBackend;
use crate::error::{BillingError, BillingResult};
use crate::lock_unpoisoned;

/// Result shared with callers that joined an in-flight generation
type InFlightResult = Result<Charge, String>;

enum IntentSlot {
    InFlight(broadcast::Sender<InFlightResult>),
    Pending(Charge),
}

type IntentSlots = Arc<Mutex<HashMap<String, IntentSlot>>>;

/// Removes an abandoned in-flight slot so joiners are released
struct InFlightGuard {
    slots: IntentSlots,
    intent_id: String,
    armed: bool,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = lock_unpoisoned(&self.slots);
        if matches!(slots.get(&self.intent_id), Some(IntentSlot::InFlight(_))) {
            slots.remove(&self.intent_id);
            tracing::warn!(intent_id = %self.intent_id, "Charge generation abandoned before completion");
        }
    }
}

/// Creates at most one charge per intent while it is pending
#[derive(Clone)]
pub struct PaymentChargeGenerator {
    backend: Arc<dyn ChargeBackend>,
    slots: IntentSlots,
}

impl PaymentChargeGenerator {
    pub fn new(backend: Arc<dyn ChargeBackend>) -> Self {
        Self {
            backend,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Generate the charge for an intent, or return the one already pending or in flight
    pub async fn generate(&self, intent: &ChargeIntent) -> BillingResult<Charge> {
        let mut rx_opt = None;

        {
            let mut slots = lock_unpoisoned(&self.slots);
            match slots.get(&intent.id) {
                Some(IntentSlot::Pending(charge)) => {
                    tracing::debug!(
                        intent_id = %intent.id,
                        charge_id = %charge.id,
                        "Reusing pending charge for intent"
                    );
                    return Ok(charge.clone());
                }
                Some(IntentSlot::InFlight(tx)) => {
                    rx_opt = Some(tx.subscribe());
                    tracing::debug!(intent_id = %intent.id, "Joining in-flight charge generation");
                }
                None => {
                    let (tx, _) = broadcast::channel(1);
                    slots.insert(intent.id.clone(), IntentSlot::InFlight(tx));
                    tracing::debug!(intent_id = %intent.id, "Starting charge generation");
                }
            }
        }

        if let Some(mut rx) = rx_opt {
            return match rx.recv().await {
                Ok(Ok(charge)) => Ok(charge),
                Ok(Err(message)) => Err(BillingError::GenerationFailed(message)),
                Err(_) => Err(BillingError::GenerationFailed(
                    "generation was abandoned".to_string(),
                )),
            };
        }

        let mut guard = InFlightGuard {
            slots: Arc::clone(&self.slots),
            intent_id: intent.id.clone(),
            armed: true,
        };

        let result = self
            .backend
            .create_charge(intent)
            .await
            .map(|created| {
                Charge::pending(
                    created.id,
                    created.amount,
                    created.payload_for_payment,
                    OffsetDateTime::now_utc(),
                )
            })
            .map_err(|e| e.to_string());

        {
            let mut slots = lock_unpoisoned(&self.slots);
            let tx = match slots.remove(&intent.id) {
                Some(IntentSlot::InFlight(tx)) => Some(tx),
                _ => None,
            };
            if let Ok(charge) = &result {
                slots.insert(intent.id.clone(), IntentSlot::Pending(charge.clone()));
            }
            guard.armed = false;
            if let Some(tx) = tx {
                // Receivers may have been dropped
                let _ = tx.send(result.clone());
            }
        }

        match result {
            Ok(charge) => {
                tracing::info!(
                    intent_id = %intent.id,
                    charge_id = %charge.id,
                    amount = %charge.amount,
                    "Charge generated"
                );
                Ok(charge)
            }
            Err(message) => {
                tracing::error!(intent_id = %intent.id, error = %message, "Charge generation failed");
                Err(BillingError::GenerationFailed(message))
            }
        }
    }

    /// Pending charge held for an intent, if any
    pub fn pending_charge(&self, intent_id: &str) -> Option<Charge> {
        match lock_unpoisoned(&self.slots).get(intent_id) {
            Some(IntentSlot::Pending(charge)) => Some(charge.clone()),
            _ => None,
        }
    }

    /// Drop the pending charge of an intent once it was paid
    pub fn settle(&self, intent_id: &str) -> Option<Charge> {
        let mut slots = lock_unpoisoned(&self.slots);
        match slots.remove(intent_id) {
            Some(IntentSlot::Pending(mut charge)) => {
                charge.mark_paid();
                Some(charge)
            }
            Some(other) => {
                slots.insert(intent_id.to_string(), other);
                None
            }
            None => None,
        }
    }
}

/// What the user needs to pay a charge
#[derive(Debug, Clone, Serialize)]
pub struct ChargeDisplay {
    pub charge_id: String,
    pub amount: Decimal,
    /// Payload exactly as received, for copy and paste
    pub copy_paste_code: String,
    pub qr_svg: String,
    pub qr_data_uri: String,
}

/// Render the scannable code for a charge; the charge itself is untouched
pub fn render_charge(charge: &Charge) -> BillingResult<ChargeDisplay> {
    if charge.payload_for_payment.is_empty() {
        return Err(BillingError::PaymentCode("empty payment payload".to_string()));
    }

    let code = QrCode::new(charge.payload_for_payment.as_bytes())
        .map_err(|e| BillingError::PaymentCode(e.to_string()))?;
    let qr_svg = code
        .render::<svg::Color<'_>>()
        .min_dimensions(240, 240)
        .build();
    let qr_data_uri = format!(
        "data:image/svg+xml;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(qr_svg.as_bytes())
    );

    Ok(ChargeDisplay {
        charge_id: charge.id.clone(),
        amount: charge.amount,
        copy_paste_code: charge.payload_for_payment.clone(),
        qr_svg,
        qr_data_uri,
    })
}
