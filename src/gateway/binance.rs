// =============================================================================
// Binance Futures Gateway — live protective orders on USDⓈ-M perpetuals
// =============================================================================
//
// Order mapping (all reduce-only, triggered on mark price):
//   stop-loss      STOP_MARKET           stopPrice
//   take-profit    TAKE_PROFIT_MARKET    stopPrice
//   trailing stop  TRAILING_STOP_MARKET  callbackRate (%) [+ activationPrice]
//   manual close   MARKET
//
// Every placement carries our `newClientOrderId`. When a retry hits an id
// Binance already accepted, the order booked by the earlier attempt is looked
// up and returned.
//
// The trailing stop is placed when the mark has just crossed TP1. Binance
// rejects an activationPrice the mark has already passed (-2021), so it is
// only sent while the mark is still short of it; otherwise the order
// activates at the current mark.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use super::ExitOrderGateway;
use crate::binance::client::BinanceFuturesClient;
use crate::types::{OrderHandle, Side};

/// Accepted callbackRate range, in percent.
const MIN_CALLBACK_PCT: f64 = 0.1;
const MAX_CALLBACK_PCT: f64 = 10.0;

pub struct BinanceFuturesGateway {
    client: Arc<BinanceFuturesClient>,
}

impl BinanceFuturesGateway {
    pub fn new(client: Arc<BinanceFuturesClient>) -> Self {
        Self { client }
    }

    async fn submit(&self, symbol: &str, params: String, client_id: &str) -> Result<OrderHandle> {
        let body = match self.client.place_order(&params).await? {
            Some(body) => body,
            None => {
                let body = self
                    .client
                    .query_order(symbol, client_id)
                    .await
                    .with_context(|| format!("failed to look up order {client_id}"))?;
                info!(symbol, client_id, "order already placed by an earlier attempt");
                body
            }
        };
        let handle = OrderHandle::new(symbol, order_id(&body)?);
        info!(handle = %handle, client_id, "futures order placed");
        Ok(handle)
    }
}

fn order_id(body: &serde_json::Value) -> Result<String> {
    body["orderId"]
        .as_u64()
        .map(|id| id.to_string())
        .or_else(|| body["orderId"].as_str().map(str::to_string))
        .context("order response missing 'orderId'")
}

/// Plain decimal rendering without exponent or trailing zeros.
fn format_decimal(value: f64) -> String {
    let s = format!("{value:.8}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    s.to_string()
}

/// Check that a callback fraction is expressible as a Binance callbackRate:
/// a percentage with one decimal between 0.1 and 10.
pub fn validate_callback_fraction(fraction: f64) -> Result<()> {
    let pct = fraction * 100.0;
    if !pct.is_finite() || !(MIN_CALLBACK_PCT..=MAX_CALLBACK_PCT).contains(&pct) {
        anyhow::bail!(
            "callback {fraction} is {pct}%, outside the {MIN_CALLBACK_PCT}%..{MAX_CALLBACK_PCT}% Binance accepts"
        );
    }
    let rounded = (pct * 10.0).round() / 10.0;
    if (rounded - pct).abs() > 1e-9 {
        anyhow::bail!("callback {fraction} is {pct}%, Binance only accepts one decimal");
    }
    Ok(())
}

/// Binance expects the callback as a percentage with one decimal.
fn callback_rate(fraction: f64) -> Result<String> {
    validate_callback_fraction(fraction)?;
    Ok(format!("{:.1}", fraction * 100.0))
}

/// Whether the mark has already reached the activation level.
fn activation_reached(side: Side, activation: f64, mark: f64) -> bool {
    match side {
        Side::Long => mark >= activation,
        Side::Short => mark <= activation,
    }
}

fn conditional_params(
    symbol: &str,
    side: Side,
    order_type: &str,
    stop_price: f64,
    size: f64,
    client_id: &str,
) -> String {
    format!(
        "symbol={symbol}&side={}&type={order_type}&stopPrice={}&quantity={}&reduceOnly=true&workingType=MARK_PRICE&newClientOrderId={client_id}",
        side.closing_order_side(),
        format_decimal(stop_price),
        format_decimal(size),
    )
}

/// `mark` is the current mark price if it could be fetched.
fn trailing_params(
    symbol: &str,
    side: Side,
    activation: f64,
    callback_fraction: f64,
    size: f64,
    client_id: &str,
    mark: Option<f64>,
) -> Result<String> {
    let mut params = format!(
        "symbol={symbol}&side={}&type=TRAILING_STOP_MARKET&callbackRate={}&quantity={}&reduceOnly=true&workingType=MARK_PRICE&newClientOrderId={client_id}",
        side.closing_order_side(),
        callback_rate(callback_fraction)?,
        format_decimal(size),
    );
    if let Some(mark) = mark {
        if !activation_reached(side, activation, mark) {
            params.push_str(&format!("&activationPrice={}", format_decimal(activation)));
        }
    }
    Ok(params)
}

#[async_trait]
impl ExitOrderGateway for BinanceFuturesGateway {
    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: Side,
        trigger_price: f64,
        size: f64,
        client_id: &str,
    ) -> Result<OrderHandle> {
        let params =
            conditional_params(symbol, side, "STOP_MARKET", trigger_price, size, client_id);
        self.submit(symbol, params, client_id).await
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: Side,
        trigger_price: f64,
        size: f64,
        client_id: &str,
    ) -> Result<OrderHandle> {
        let params =
            conditional_params(symbol, side, "TAKE_PROFIT_MARKET", trigger_price, size, client_id);
        self.submit(symbol, params, client_id).await
    }

    async fn place_trailing_stop(
        &self,
        symbol: &str,
        side: Side,
        trigger_price: f64,
        callback_fraction: f64,
        size: f64,
        client_id: &str,
    ) -> Result<OrderHandle> {
        let mark = match self.client.mark_price(symbol).await {
            Ok(mark) => Some(mark),
            Err(e) => {
                warn!(symbol, error = %e, "mark price unavailable, trailing stop activates immediately");
                None
            }
        };
        let params = trailing_params(
            symbol,
            side,
            trigger_price,
            callback_fraction,
            size,
            client_id,
            mark,
        )?;
        self.submit(symbol, params, client_id).await
    }

    async fn place_market_close(
        &self,
        symbol: &str,
        side: Side,
        size: f64,
        client_id: &str,
    ) -> Result<OrderHandle> {
        let params = format!(
            "symbol={symbol}&side={}&type=MARKET&quantity={}&reduceOnly=true&newClientOrderId={client_id}",
            side.closing_order_side(),
            format_decimal(size),
        );
        self.submit(symbol, params, client_id).await
    }

    async fn cancel(&self, handle: &OrderHandle) -> Result<bool> {
        let cancelled = self
            .client
            .cancel_order(&handle.symbol, &handle.order_id)
            .await?;
        Ok(cancelled.is_some())
    }

    fn name(&self) -> &'static str {
        "binance-futures"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimals_render_without_noise() {
        assert_eq!(format_decimal(98_000.0), "98000");
        assert_eq!(format_decimal(0.25), "0.25");
        assert_eq!(format_decimal(1.58831), "1.58831");
    }

    #[test]
    fn callback_is_percent() {
        assert_eq!(callback_rate(0.03).unwrap(), "3.0");
        assert_eq!(callback_rate(0.015).unwrap(), "1.5");
        assert_eq!(callback_rate(0.001).unwrap(), "0.1");
        assert_eq!(callback_rate(0.1).unwrap(), "10.0");
    }

    #[test]
    fn callback_outside_binance_precision_or_range_is_rejected() {
        // 1.25 % would silently become 1.2 % or 1.3 %.
        assert!(callback_rate(0.0125).is_err());
        assert!(callback_rate(0.2).is_err());
        assert!(callback_rate(0.0005).is_err());
        assert!(validate_callback_fraction(f64::NAN).is_err());
    }

    #[test]
    fn stop_params_reduce_the_position() {
        let p = conditional_params("BTCUSDT", Side::Long, "STOP_MARKET", 98_000.0, 0.25, "tg-1");
        assert!(p.contains("side=SELL"));
        assert!(p.contains("type=STOP_MARKET"));
        assert!(p.contains("stopPrice=98000"));
        assert!(p.contains("quantity=0.25"));
        assert!(p.contains("reduceOnly=true"));
        assert!(p.contains("newClientOrderId=tg-1"));

        let p = conditional_params("BTCUSDT", Side::Short, "TAKE_PROFIT_MARKET", 99_900.0, 1.0, "tg-2");
        assert!(p.contains("side=BUY"));
    }

    #[test]
    fn trailing_activation_is_dropped_once_the_mark_has_passed_it() {
        // Long: TP1 at 100 100 already crossed by the mark.
        let p = trailing_params("BTCUSDT", Side::Long, 100_100.0, 0.03, 0.25, "tg-3", Some(100_150.0))
            .unwrap();
        assert!(p.contains("type=TRAILING_STOP_MARKET"));
        assert!(p.contains("callbackRate=3.0"));
        assert!(!p.contains("activationPrice"));

        // Short: mark already below the activation level.
        let p = trailing_params("BTCUSDT", Side::Short, 99_900.0, 0.03, 0.25, "tg-4", Some(99_850.0))
            .unwrap();
        assert!(p.contains("side=BUY"));
        assert!(!p.contains("activationPrice"));
    }

    #[test]
    fn trailing_activation_is_sent_while_the_mark_is_short_of_it() {
        let p = trailing_params("BTCUSDT", Side::Long, 100_100.0, 0.03, 0.25, "tg-5", Some(100_050.0))
            .unwrap();
        assert!(p.contains("activationPrice=100100"));

        let p = trailing_params("BTCUSDT", Side::Short, 99_900.0, 0.03, 0.25, "tg-6", Some(99_950.0))
            .unwrap();
        assert!(p.contains("activationPrice=99900"));

        let p = trailing_params("BTCUSDT", Side::Long, 100_100.0, 0.03, 0.25, "tg-7", None).unwrap();
        assert!(!p.contains("activationPrice"));
    }

    #[test]
    fn trailing_with_unsupported_callback_is_not_sent() {
        assert!(
            trailing_params("BTCUSDT", Side::Long, 100_100.0, 0.0125, 0.25, "tg-8", None).is_err()
        );
    }

    #[test]
    fn order_id_accepts_number_or_string() {
        assert_eq!(order_id(&serde_json::json!({ "orderId": 42 })).unwrap(), "42");
        assert_eq!(order_id(&serde_json::json!({ "orderId": "43" })).unwrap(), "43");
        assert!(order_id(&serde_json::json!({})).is_err());
    }
}
