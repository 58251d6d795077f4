//! Franquia Worker
//!
//! Headless driver for the upgrade flow against a live backend:
//! - `watch <charge_id>`: resume watching a pending charge until it is paid
//! - `upgrade <target_capacity> [tier_id | custom:<qty>]`: run the full upgrade
//!
//! Ctrl-C cancels the flow; a pending charge stays open on the backend.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use franquia_billing::{
    render_charge, ApiCredential, BillingConfig, BillingError, DisabledPushChannel, HttpChargeBackend,
    PaymentStatusWatcher, PushChannel, TierCatalog, TierChoice, UpgradeOrchestrator,
    UpgradeOutcome, WatchStart, WatchState,
};
use franquia_shared::{Charge, ChargeStatus};
use tracing::{info, warn};

const USAGE: &str = "usage: franquia-worker watch <charge_id> | upgrade <target_capacity> [tier_id | custom:<qty>]";

fn print_charge(charge: &Charge) {
    match render_charge(charge) {
        Ok(display) => {
            println!("Charge {} for {}", display.charge_id, display.amount);
            println!("Copy and paste to pay:\n{}", display.copy_paste_code);
            println!("QR code: {}", display.qr_data_uri);
        }
        Err(e) => warn!(charge_id = %charge.id, error = %e, "Failed to render payment code"),
    }
}

async fn watch_charge(
    backend: Arc<HttpChargeBackend>,
    push: Arc<dyn PushChannel>,
    config: &BillingConfig,
    charge_id: &str,
) -> anyhow::Result<()> {
    let watcher = PaymentStatusWatcher::new(backend, push, config.watcher.clone());
    let handle = match watcher.watch(charge_id, |confirmation| {
        info!(
            charge_id = %confirmation.charge_id,
            source = %confirmation.source,
            "Charge paid"
        );
    }) {
        WatchStart::Started(handle) => handle,
        WatchStart::AlreadyWatching => bail!("charge {} is already being watched", charge_id),
    };

    let state = tokio::select! {
        state = handle.finished() => state,
        _ = tokio::signal::ctrl_c() => {
            handle.stop();
            WatchState::Stopped
        }
    };

    match state {
        WatchState::Confirmed => println!("Charge {} paid", charge_id),
        _ => println!("Stopped watching {}; the charge stays pending", charge_id),
    }
    Ok(())
}

async fn run_upgrade(
    backend: Arc<HttpChargeBackend>,
    push: Arc<dyn PushChannel>,
    config: &BillingConfig,
    target_capacity: u32,
    choice: Option<TierChoice>,
) -> anyhow::Result<()> {
    let catalog = TierCatalog::new(backend.fetch_tiers().await?);
    let flow = Arc::new(UpgradeOrchestrator::new(
        catalog,
        backend.clone(),
        push,
        backend,
        config,
    ));

    let offer = flow.start_upgrade_flow(target_capacity).await?;
    println!("{}", serde_json::to_string_pretty(&offer)?);

    if let Some(choice) = choice {
        flow.select_tier(choice)?;
    }
    if flow.preview().is_pending() {
        flow.preview().settled().await;
    }

    // A failed preview is requested again by quote(), so give it one more settle
    let quote = match flow.quote() {
        Err(BillingError::PricingPending) => {
            flow.preview().settled().await;
            flow.quote()?
        }
        quote => quote?,
    };
    println!("{}", serde_json::to_string_pretty(&quote)?);

    let mut charges = flow.charge_updates();
    let printer = tokio::spawn(async move {
        while charges.changed().await.is_ok() {
            let charge = charges.borrow_and_update().clone();
            if let Some(charge) = charge.filter(|c| c.status == ChargeStatus::Pending) {
                print_charge(&charge);
            }
        }
    });

    let canceller = {
        let flow = Arc::clone(&flow);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                flow.cancel_upgrade();
            }
        })
    };

    let outcome = flow.confirm_upgrade().await;
    canceller.abort();
    printer.abort();

    match outcome? {
        UpgradeOutcome::Paid(charge) => println!("Upgrade paid with charge {}", charge.id),
        UpgradeOutcome::Cancelled => println!("Upgrade cancelled; the charge stays pending"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,franquia_billing=debug")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let mut config = BillingConfig::from_env()?;
    let backend_config = config
        .backend
        .clone()
        .ok_or_else(|| anyhow!("FRANQUIA_API_URL must be set"))?;
    let credential = backend_config.api_token.clone().map(ApiCredential::new);
    let backend = Arc::new(HttpChargeBackend::new(&backend_config, credential)?);

    // No realtime provider is wired into this binary
    if config.watcher.push_enabled {
        info!("No push provider configured, watching by polling only");
        config.watcher.push_enabled = false;
    }
    let push: Arc<dyn PushChannel> = Arc::new(DisabledPushChannel);

    info!(base_url = %backend_config.base_url, "Starting Franquia Worker");

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["watch", charge_id] => watch_charge(backend, push, &config, charge_id).await,
        ["upgrade", target] | ["upgrade", target, _] => {
            let target_capacity: u32 = target
                .parse()
                .with_context(|| format!("invalid target capacity: {}", target))?;
            let choice = args.get(2).map(|s| s.parse::<TierChoice>()).transpose()?;
            run_upgrade(backend, push, &config, target_capacity, choice).await
        }
        _ => bail!(USAGE),
    }
}
