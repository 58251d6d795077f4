//! Charge backend and subscription profile contracts
//!
//! The settlement engine lives server-side. The flow talks to it only through
//! [`ChargeBackend`] and reads the subscriber's plan through
//! [`SubscriptionProfile`]. [`HttpChargeBackend`] implements both over JSON.

use async_trait::async_trait;
use franquia_shared::{ChargeIntent, ChargeStatus, Subscription, Tier};
use reqwest::{Client, Response};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::BackendConfig;
use crate::error::{BillingError, BillingResult};

/// Backend answer to a charge creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedCharge {
    pub id: String,
    pub payload_for_payment: String,
    pub amount: Decimal,
}

#[async_trait]
pub trait ChargeBackend: Send + Sync {
    /// Create the charge for an intent. The backend is expected to be idempotent on `intent.id`.
    async fn create_charge(&self, intent: &ChargeIntent) -> BillingResult<CreatedCharge>;

    async fn get_charge_status(&self, charge_id: &str) -> BillingResult<ChargeStatus>;

    /// Monthly price for a custom quantity, `None` when the quantity cannot be priced
    async fn preview_custom_tier_price(&self, quantity: u32) -> BillingResult<Option<Decimal>>;
}

/// Read model of the subscriber's plan
#[async_trait]
pub trait SubscriptionProfile: Send + Sync {
    async fn current(&self) -> BillingResult<Subscription>;

    /// Re-read after settlement changed the subscription
    async fn refresh(&self) -> BillingResult<Subscription>;
}

/// Bearer credential handed to the HTTP backend by its owner
#[derive(Clone)]
pub struct ApiCredential(String);

impl ApiCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiCredential(***)")
    }
}

#[derive(Debug, Serialize)]
struct CreateChargeRequest<'a> {
    intent_id: &'a str,
    tier_id: &'a str,
    quantity: u32,
    amount_due: Decimal,
}

#[derive(Debug, Deserialize)]
struct ChargeStatusResponse {
    status: ChargeStatus,
}

#[derive(Debug, Serialize)]
struct PreviewRequest {
    quantity: u32,
}

#[derive(Debug, Deserialize)]
struct PreviewResponse {
    price: Option<Decimal>,
}

/// JSON-over-HTTP client for the charge backend
pub struct HttpChargeBackend {
    client: Client,
    base_url: String,
    credential: Option<ApiCredential>,
    subscription: RwLock<Option<Subscription>>,
}

impl HttpChargeBackend {
    pub fn new(config: &BackendConfig, credential: Option<ApiCredential>) -> BillingResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credential,
            subscription: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credential {
            Some(credential) => request.bearer_auth(credential.expose()),
            None => request,
        }
    }

    async fn check(response: Response) -> BillingResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BillingError::Backend(format!("{}: {}", status, body)))
    }

    /// Check the status, then decode the JSON body
    async fn decode<T: DeserializeOwned>(response: Response) -> BillingResult<T> {
        let body = Self::check(response).await?.text().await?;
        parse_body(&body)
    }

    /// Standard tiers offered for the subscriber's plan
    pub async fn fetch_tiers(&self) -> BillingResult<Vec<Tier>> {
        let response = self.authorize(self.client.get(self.url("/tiers"))).send().await?;
        let tiers: Vec<Tier> = Self::decode(response).await?;
        tracing::debug!(count = tiers.len(), "Fetched tier catalog");
        Ok(tiers)
    }

    async fn fetch_subscription(&self) -> BillingResult<Subscription> {
        let response = self
            .authorize(self.client.get(self.url("/subscription")))
            .send()
            .await?;
        let subscription: Subscription = Self::decode(response).await?;
        *self.subscription.write().await = Some(subscription.clone());
        Ok(subscription)
    }
}

/// Malformed bodies surface as [`BillingError::InvalidResponse`], not transport errors
fn parse_body<T: DeserializeOwned>(body: &str) -> BillingResult<T> {
    Ok(serde_json::from_str(body)?)
}

#[async_trait]
impl ChargeBackend for HttpChargeBackend {
    async fn create_charge(&self, intent: &ChargeIntent) -> BillingResult<CreatedCharge> {
        let body = CreateChargeRequest {
            intent_id: &intent.id,
            tier_id: &intent.tier_id,
            quantity: intent.quantity,
            amount_due: intent.amount_due,
        };
        let response = self
            .authorize(self.client.post(self.url("/charges")))
            .json(&body)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn get_charge_status(&self, charge_id: &str) -> BillingResult<ChargeStatus> {
        let path = format!("/charges/{}/status", charge_id);
        let response = self.authorize(self.client.get(self.url(&path))).send().await?;
        let body: ChargeStatusResponse = Self::decode(response).await?;
        Ok(body.status)
    }

    async fn preview_custom_tier_price(&self, quantity: u32) -> BillingResult<Option<Decimal>> {
        let response = self
            .authorize(self.client.post(self.url("/tiers/custom/preview")))
            .json(&PreviewRequest { quantity })
            .send()
            .await?;
        let body: PreviewResponse = Self::decode(response).await?;
        Ok(body.price)
    }
}

#[async_trait]
impl SubscriptionProfile for HttpChargeBackend {
    async fn current(&self) -> BillingResult<Subscription> {
        if let Some(subscription) = self.subscription.read().await.clone() {
            return Ok(subscription);
        }
        self.fetch_subscription().await
    }

    async fn refresh(&self) -> BillingResult<Subscription> {
        self.fetch_subscription().await
    }
}
