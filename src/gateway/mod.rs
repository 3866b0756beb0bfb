// =============================================================================
// Exit Order Gateway — exchange-side protective orders
// =============================================================================
//
// The lifecycle engine never calls an exchange directly. It turns ledger
// protection commands into calls on this trait, wrapped in the bounded retry
// from `retry`.
//
// Implementations:
//   - `PaperGateway`          demo mode, in-memory order book of our own orders
//   - `BinanceFuturesGateway` live mode, signed USDⓈ-M futures REST
// =============================================================================

pub mod binance;
pub mod paper;
pub mod retry;

use anyhow::Result;
use async_trait::async_trait;

use crate::position_engine::OrderRequest;
use crate::types::{OrderHandle, OrderKind, Side};

pub use binance::BinanceFuturesGateway;
pub use paper::PaperGateway;
pub use retry::{with_retry, RetryPolicy};

/// Exchange operations needed to protect and close a position.
///
/// `side` is always the side of the POSITION being protected; implementations
/// send the reducing order side. `client_id` stays the same across retries of
/// one placement, so a retry after a lost acknowledgement finds the order the
/// first attempt created instead of booking a second one.
#[async_trait]
pub trait ExitOrderGateway: Send + Sync {
    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: Side,
        trigger_price: f64,
        size: f64,
        client_id: &str,
    ) -> Result<OrderHandle>;

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: Side,
        trigger_price: f64,
        size: f64,
        client_id: &str,
    ) -> Result<OrderHandle>;

    async fn place_trailing_stop(
        &self,
        symbol: &str,
        side: Side,
        trigger_price: f64,
        callback_fraction: f64,
        size: f64,
        client_id: &str,
    ) -> Result<OrderHandle>;

    /// Reduce-only market order closing `size` of the position.
    async fn place_market_close(
        &self,
        symbol: &str,
        side: Side,
        size: f64,
        client_id: &str,
    ) -> Result<OrderHandle>;

    /// Returns `false` if the order was no longer live.
    async fn cancel(&self, handle: &OrderHandle) -> Result<bool>;

    fn name(&self) -> &'static str;
}

/// Dispatch a ledger placement request to the matching gateway call.
pub async fn place(gateway: &dyn ExitOrderGateway, req: &OrderRequest) -> Result<OrderHandle> {
    match req.kind {
        OrderKind::StopLoss => {
            gateway
                .place_stop_loss(&req.symbol, req.side, req.trigger_price, req.size, &req.client_id)
                .await
        }
        OrderKind::TakeProfit => {
            gateway
                .place_take_profit(&req.symbol, req.side, req.trigger_price, req.size, &req.client_id)
                .await
        }
        OrderKind::TrailingStop => {
            let callback = req.callback_fraction.ok_or_else(|| {
                anyhow::anyhow!("trailing stop for {} without callback fraction", req.symbol)
            })?;
            gateway
                .place_trailing_stop(
                    &req.symbol,
                    req.side,
                    req.trigger_price,
                    callback,
                    req.size,
                    &req.client_id,
                )
                .await
        }
    }
}
