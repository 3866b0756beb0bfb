// =============================================================================
// trailguard — Main Entry Point
// =============================================================================
//
// Wires the lifecycle engine to its order gateway (paper in Demo mode,
// Binance USDⓈ-M futures in Live mode), the mark price feeds, the exchange
// fill stream and the REST API. Everything except the engine only enqueues
// events.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod binance;
mod direction;
mod error;
mod exit;
mod gateway;
mod health;
mod leverage;
mod market_data;
mod position_engine;
mod runtime_config;
mod trade_journal;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::rest::ApiState;
use crate::binance::BinanceFuturesClient;
use crate::exit::LifecycleEngine;
use crate::gateway::{BinanceFuturesGateway, ExitOrderGateway, PaperGateway};
use crate::runtime_config::RuntimeConfig;
use crate::trade_journal::TradeJournal;
use crate::types::AccountMode;

const CONFIG_PATH: &str = "runtime_config.json";
const RECONNECT_SECS: u64 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        trailguard exit engine — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // An invalid file stops startup; a missing one means defaults.
    let mut config = RuntimeConfig::load_or_default(CONFIG_PATH)?;

    if let Ok(syms) = std::env::var("TRAILGUARD_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    info!(
        symbols = ?config.symbols,
        account_mode = %config.account_mode,
        default_leverage = config.default_leverage,
        default_tier = %config.default_tier,
        "configuration ready"
    );

    // ── 2. Order gateway ─────────────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();

    let (gateway, live_client): (Arc<dyn ExitOrderGateway>, Option<Arc<BinanceFuturesClient>>) =
        match config.account_mode {
            AccountMode::Demo => (Arc::new(PaperGateway::new()), None),
            AccountMode::Live => {
                if api_key.is_empty() || api_secret.is_empty() {
                    anyhow::bail!("Live mode requires BINANCE_API_KEY and BINANCE_API_SECRET");
                }
                let client = Arc::new(
                    BinanceFuturesClient::new(api_key, api_secret, config.binance_base_url.clone())
                        .context("failed to build Binance futures client")?,
                );
                warn!("LIVE mode: protective orders will be sent to Binance futures");
                (Arc::new(BinanceFuturesGateway::new(client.clone())), Some(client))
            }
        };

    // ── 3. Lifecycle engine ──────────────────────────────────────────────
    let journal = config.trade_log_path.as_ref().map(TradeJournal::new);
    let engine = LifecycleEngine::new(config.clone(), gateway).spawn();

    // ── 4. Mark price streams ────────────────────────────────────────────
    for symbol in &config.symbols {
        let events = engine.sender();
        let sym = symbol.clone();
        let base = config.stream_base_url.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    market_data::run_mark_price_stream(&base, &sym, &events).await
                {
                    error!(symbol = %sym, error = %e, "mark price stream error, reconnecting in 5s");
                }
                if events.is_closed() {
                    break;
                }
                sleep(Duration::from_secs(RECONNECT_SECS)).await;
            }
        });
    }
    info!(count = config.symbols.len(), "mark price streams launched");

    // ── 5. Exchange fill stream (Live only) ──────────────────────────────
    if let Some(client) = live_client {
        let fills = engine.clone();
        let base = config.stream_base_url.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    binance::user_stream::run_user_stream(client.clone(), &base, &fills).await
                {
                    error!(error = %e, "user data stream error, reconnecting in 5s");
                }
                if fills.is_stopped() {
                    break;
                }
                sleep(Duration::from_secs(RECONNECT_SECS)).await;
            }
        });
    }

    // ── 6. API server ────────────────────────────────────────────────────
    let api_state = Arc::new(ApiState {
        engine: engine.clone(),
        direction: config.direction,
        journal,
    });
    let bind_addr =
        std::env::var("TRAILGUARD_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api::rest::router(api_state)).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping gracefully");

    let open = engine.list_open_positions();
    if !open.is_empty() {
        warn!(
            count = open.len(),
            symbols = ?open.iter().map(|p| p.symbol.as_str()).collect::<Vec<_>>(),
            "positions remain open; exchange-side protection stays in place"
        );
    }
    engine.shutdown().await;

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("trailguard shut down complete.");
    Ok(())
}
