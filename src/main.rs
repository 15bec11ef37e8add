// =============================================================================
// Meridian Trading Engine — Main Entry Point
// =============================================================================
//
// Bootstraps the engine room: event bus, risk manager, strategy runtime,
// signal pipeline, exchange adapters, reconciliation loop, and the internal
// admin API. Bots are created and started by the surrounding platform
// through the admin API; nothing trades until told to.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod audit;
mod bot;
mod bus;
mod config;
mod engine;
mod exchange;
mod orders;
mod pipeline;
mod positions;
mod reconcile;
mod risk;
mod strategy;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::Settings;
use crate::engine::EngineState;
use crate::exchange::binance::BinanceAdapter;
use crate::exchange::bybit::BybitAdapter;
use crate::exchange::{AdapterKey, ExchangeAdapter};
use crate::types::MarketType;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & settings ────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Trading Engine — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let settings = Settings::load("settings.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load settings, using defaults");
        Settings::default()
    });
    info!(
        environment = %settings.environment,
        use_testnet = settings.use_testnet,
        "settings resolved"
    );

    // ── 2. Build engine state (bus -> risk -> registries -> pipeline) ───
    let engine = EngineState::new(settings.clone());

    // ── 3. Register exchange adapters from environment credentials ──────
    let request_timeout = Duration::from_secs(settings.request_timeout_secs);

    if let (Ok(api_key), Ok(api_secret)) = (
        std::env::var("MERIDIAN_BINANCE_API_KEY"),
        std::env::var("MERIDIAN_BINANCE_API_SECRET"),
    ) {
        let credential_id = credential_id_from_env("MERIDIAN_BINANCE_CREDENTIAL_ID");
        for market_type in [MarketType::Spot, MarketType::Futures] {
            let adapter: Arc<dyn ExchangeAdapter> = Arc::new(BinanceAdapter::new(
                api_key.clone(),
                api_secret.clone(),
                market_type,
                settings.use_testnet,
                request_timeout,
                settings.max_retries,
            ));
            let key = AdapterKey {
                exchange: "binance".to_string(),
                credential_id,
                market_type,
            };
            if let Err(e) = engine.register_adapter(key, adapter).await {
                error!(market_type = %market_type, error = %e, "binance adapter registration failed");
            }
        }
    } else {
        info!("no binance credentials in environment — adapter not registered");
    }

    if let (Ok(api_key), Ok(api_secret)) = (
        std::env::var("MERIDIAN_BYBIT_API_KEY"),
        std::env::var("MERIDIAN_BYBIT_API_SECRET"),
    ) {
        let credential_id = credential_id_from_env("MERIDIAN_BYBIT_CREDENTIAL_ID");
        for market_type in [MarketType::Spot, MarketType::Futures] {
            let adapter: Arc<dyn ExchangeAdapter> = Arc::new(BybitAdapter::new(
                api_key.clone(),
                api_secret.clone(),
                market_type,
                settings.use_testnet,
                request_timeout,
                settings.max_retries,
            ));
            let key = AdapterKey {
                exchange: "bybit".to_string(),
                credential_id,
                market_type,
            };
            if let Err(e) = engine.register_adapter(key, adapter).await {
                error!(market_type = %market_type, error = %e, "bybit adapter registration failed");
            }
        }
    } else {
        info!("no bybit credentials in environment — adapter not registered");
    }

    // ── 4. Reconciliation loop ───────────────────────────────────────────
    let reconcile_handle = engine.spawn_reconcile_loop();
    info!(
        interval_secs = settings.reconcile_interval_secs,
        "reconciliation loop running"
    );

    // ── 5. Internal admin API ────────────────────────────────────────────
    let api_engine = engine.clone();
    let bind_addr = settings.bind_addr.clone();
    let api_handle = tokio::spawn(async move {
        let app = api::rest::router(api_engine);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "failed to bind admin API");
                return;
            }
        };
        info!(addr = %bind_addr, "admin API listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "admin API failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown (reverse of init) ───────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    api_handle.abort();
    reconcile_handle.abort();
    engine.shutdown().await;

    info!("Meridian Trading Engine shut down complete.");
    Ok(())
}

/// Stable credential id for adapters configured via environment. Falls back
/// to a random id when unset (single-run deployments).
fn credential_id_from_env(var: &str) -> Uuid {
    std::env::var(var)
        .ok()
        .and_then(|raw| Uuid::parse_str(&raw).ok())
        .unwrap_or_else(Uuid::new_v4)
}
