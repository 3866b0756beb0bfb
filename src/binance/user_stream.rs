// =============================================================================
// Binance Futures user data stream — fill notifications for our orders
// =============================================================================
//
// Only fully FILLED orders are forwarded; partial executions of a reduce-only
// stop are reported once the order completes. Binance does not number fills
// per position, so events carry no sequence.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::time::{interval, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use super::client::{parse_str_f64, BinanceFuturesClient};
use crate::exit::monitor::EngineHandle;
use crate::types::{FillEvent, OrderHandle};

const KEEPALIVE_SECS: u64 = 30 * 60;

/// Stream fills into the engine until the socket closes.
pub async fn run_user_stream(
    client: Arc<BinanceFuturesClient>,
    stream_base_url: &str,
    engine: &EngineHandle,
) -> Result<()> {
    let listen_key = client.start_user_stream().await?;
    let url = format!("{}/ws/{}", stream_base_url.trim_end_matches('/'), listen_key);
    info!("connecting to futures user data stream");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to user data WebSocket")?;
    let (_write, mut read) = ws_stream.split();

    let mut keepalive = interval(Duration::from_secs(KEEPALIVE_SECS));
    keepalive.tick().await;

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                if let Err(e) = client.keepalive_user_stream().await {
                    warn!(error = %e, "listenKey keepalive failed");
                }
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => match parse_order_update(&text) {
                    Ok(Some(fill)) => {
                        info!(handle = %fill.handle, price = fill.fill_price, size = fill.filled_size, "exchange fill received");
                        if engine.fill(fill).await.is_err() {
                            warn!("engine queue closed, stopping user data stream");
                            return Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "failed to parse user data message"),
                },
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "user data WebSocket read error");
                    return Err(e.into());
                }
                None => {
                    warn!("user data WebSocket stream ended");
                    return Ok(());
                }
            }
        }
    }
}

/// Parse an `ORDER_TRADE_UPDATE`; other event types and non-final order
/// states yield `None`.
///
/// ```json
/// { "e": "ORDER_TRADE_UPDATE", "T": 1568879465651,
///   "o": { "s": "BTCUSDT", "i": 8886774, "X": "FILLED", "ap": "98000", "z": "0.25" } }
/// ```
fn parse_order_update(text: &str) -> Result<Option<FillEvent>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse user data JSON")?;
    if root["e"].as_str() != Some("ORDER_TRADE_UPDATE") {
        return Ok(None);
    }
    let order = &root["o"];
    if order["X"].as_str() != Some("FILLED") {
        return Ok(None);
    }

    let symbol = order["s"].as_str().context("missing field o.s")?;
    let order_id = order["i"]
        .as_u64()
        .map(|i| i.to_string())
        .context("missing field o.i")?;
    let fill_price = parse_str_f64(&order["ap"]).context("bad field o.ap")?;
    let filled_size = parse_str_f64(&order["z"]).context("bad field o.z")?;
    let timestamp = root["T"].as_i64().unwrap_or_default();

    Ok(Some(FillEvent {
        handle: OrderHandle::new(symbol, order_id),
        fill_price,
        filled_size,
        timestamp,
        sequence: None,
    }))
}
