//! Upgrade flow configuration

use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Poll cadence while push delivery is not confirmed
pub const FAST_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Poll cadence once the push provider confirmed the subscription
pub const SAFETY_POLL_INTERVAL: Duration = Duration::from_secs(30);

pub const DEFAULT_CYCLE_LENGTH_DAYS: u32 = 30;

pub const DEFAULT_PREVIEW_DEBOUNCE: Duration = Duration::from_millis(400);

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Payment status watcher timing
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub fast_poll_interval: Duration,
    pub safety_poll_interval: Duration,
    pub push_enabled: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            fast_poll_interval: FAST_POLL_INTERVAL,
            safety_poll_interval: SAFETY_POLL_INTERVAL,
            push_enabled: true,
        }
    }
}

/// Pro-rata and custom tier preview settings
#[derive(Debug, Clone)]
pub struct PricingConfig {
    pub cycle_length_days: u32,
    pub preview_debounce: Duration,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            cycle_length_days: DEFAULT_CYCLE_LENGTH_DAYS,
            preview_debounce: DEFAULT_PREVIEW_DEBOUNCE,
        }
    }
}

/// Charge backend connection settings
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct BillingConfig {
    pub backend: Option<BackendConfig>,
    pub watcher: WatcherConfig,
    pub pricing: PricingConfig,
}

impl BillingConfig {
    /// Load configuration from environment variables
    ///
    /// The backend section is only present when `FRANQUIA_API_URL` is set.
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> BillingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = match lookup("FRANQUIA_API_URL").filter(|v| !v.trim().is_empty()) {
            Some(base_url) => Some(BackendConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                api_token: lookup("FRANQUIA_API_TOKEN").filter(|v| !v.is_empty()),
                request_timeout: Duration::from_secs(parse_or(
                    &lookup,
                    "FRANQUIA_HTTP_TIMEOUT_SECS",
                    DEFAULT_HTTP_TIMEOUT.as_secs(),
                )?),
            }),
            None => None,
        };

        let watcher = WatcherConfig {
            fast_poll_interval: Duration::from_secs(parse_or(
                &lookup,
                "FRANQUIA_FAST_POLL_SECS",
                FAST_POLL_INTERVAL.as_secs(),
            )?),
            safety_poll_interval: Duration::from_secs(parse_or(
                &lookup,
                "FRANQUIA_SAFETY_POLL_SECS",
                SAFETY_POLL_INTERVAL.as_secs(),
            )?),
            push_enabled: parse_or(&lookup, "FRANQUIA_PUSH_ENABLED", true)?,
        };

        if watcher.fast_poll_interval.is_zero() || watcher.safety_poll_interval.is_zero() {
            return Err(BillingError::Config(
                "poll intervals must be greater than zero".to_string(),
            ));
        }

        let pricing = PricingConfig {
            cycle_length_days: parse_or(
                &lookup,
                "FRANQUIA_CYCLE_LENGTH_DAYS",
                DEFAULT_CYCLE_LENGTH_DAYS,
            )?,
            preview_debounce: Duration::from_millis(parse_or(
                &lookup,
                "FRANQUIA_PREVIEW_DEBOUNCE_MS",
                DEFAULT_PREVIEW_DEBOUNCE.as_millis() as u64,
            )?),
        };

        if pricing.cycle_length_days == 0 {
            return Err(BillingError::Config(
                "FRANQUIA_CYCLE_LENGTH_DAYS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            backend,
            watcher,
            pricing,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> BillingResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| BillingError::Config(format!("invalid {}: {}", key, e))),
        None => Ok(default),
    }
}
