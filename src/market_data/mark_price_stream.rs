// =============================================================================
// Mark Price Stream — per-symbol price ticks for the lifecycle engine
// =============================================================================
//
// Protective orders on the exchange trigger on MARK_PRICE, so local trigger
// detection follows the same feed. Each 1s mark price update becomes a point
// tick on the engine queue.
// =============================================================================

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::binance::client::parse_str_f64;
use crate::exit::monitor::EngineEvent;
use crate::types::PriceTick;

/// Connect to `{symbol}@markPrice@1s` and forward ticks until the socket
/// closes. Returns so that the caller can reconnect.
pub async fn run_mark_price_stream(
    stream_base_url: &str,
    symbol: &str,
    events: &mpsc::Sender<EngineEvent>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{}/ws/{lower}@markPrice@1s", stream_base_url.trim_end_matches('/'));
    info!(url = %url, symbol = %symbol, "connecting to mark price WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to mark price WebSocket")?;

    info!(symbol = %symbol, "mark price WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match parse_mark_price(&text) {
                Ok(tick) => {
                    if events.send(EngineEvent::Tick(tick)).await.is_err() {
                        warn!(symbol = %symbol, "engine queue closed, stopping mark price stream");
                        return Ok(());
                    }
                }
                Err(e) => warn!(error = %e, "failed to parse markPriceUpdate message"),
            },
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "mark price WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "mark price WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a futures markPriceUpdate event.
///
/// ```json
/// { "e": "markPriceUpdate", "E": 1562305380000, "s": "BTCUSDT", "p": "11794.15" }
/// ```
pub fn parse_mark_price(text: &str) -> Result<PriceTick> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse markPriceUpdate JSON")?;

    let symbol = root["s"].as_str().context("missing field s")?;
    let price = parse_str_f64(&root["p"]).context("bad mark price")?;
    let timestamp = root["E"].as_i64().context("missing field E")?;

    let tick = PriceTick::point(symbol, price, timestamp);
    if !tick.is_valid() {
        anyhow::bail!("non-positive mark price {price} for {symbol}");
    }
    Ok(tick)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mark_price_update() {
        let text = r#"{"e":"markPriceUpdate","E":1562305380000,"s":"BTCUSDT","p":"11794.15000000","i":"11784.62659091","r":"0.00038167","T":1562306400000}"#;
        let tick = parse_mark_price(text).unwrap();
        assert_eq!(tick.symbol, "BTCUSDT");
        assert_eq!(tick.price, 11_794.15);
        assert_eq!(tick.low, tick.high);
        assert_eq!(tick.timestamp, 1_562_305_380_000);
    }

    #[test]
    fn rejects_malformed_updates() {
        assert!(parse_mark_price(r#"{"e":"markPriceUpdate","E":1,"s":"BTCUSDT","p":"0"}"#).is_err());
        assert!(parse_mark_price(r#"{"e":"markPriceUpdate","s":"BTCUSDT","p":"1.0"}"#).is_err());
        assert!(parse_mark_price("not json").is_err());
    }
}
