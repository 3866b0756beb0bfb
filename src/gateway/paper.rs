// =============================================================================
// Paper Gateway — demo-mode protective orders held in memory
// =============================================================================
//
// No request leaves the process. Orders are acknowledged immediately with a
// synthetic id and kept in a local book so cancels behave like the exchange
// (a second cancel of the same order reports `false`). A placement that
// reuses a client id gets the order already booked under it. Fills are
// detected by the engine from price ticks, so this gateway never emits them.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use super::ExitOrderGateway;
use crate::types::{OrderHandle, OrderKind, Side};

/// What a paper order was placed as.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum PaperOrderKind {
    Protective(OrderKind),
    MarketClose,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaperOrder {
    pub handle: OrderHandle,
    pub client_id: String,
    pub kind: PaperOrderKind,
    pub side: Side,
    pub trigger_price: Option<f64>,
    pub callback_fraction: Option<f64>,
    pub size: f64,
    pub placed_at: String,
    pub live: bool,
}

pub struct PaperGateway {
    next_id: AtomicU64,
    orders: RwLock<HashMap<OrderHandle, PaperOrder>>,
    /// Artificial round-trip delay.
    latency: Option<Duration>,
    /// Number of upcoming placements to reject.
    reject_next: AtomicU32,
    /// Number of upcoming placements booked whose acknowledgement is lost.
    drop_ack_next: AtomicU32,
}

impl PaperGateway {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            orders: RwLock::new(HashMap::new()),
            latency: None,
            reject_next: AtomicU32::new(0),
            drop_ack_next: AtomicU32::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Reject the next `n` placement calls.
    pub fn reject_next_placements(&self, n: u32) {
        self.reject_next.store(n, Ordering::SeqCst);
    }

    /// Book the next `n` placements but report them as failed.
    pub fn drop_next_acks(&self, n: u32) {
        self.drop_ack_next.store(n, Ordering::SeqCst);
    }

    pub fn live_orders(&self) -> Vec<PaperOrder> {
        let mut live: Vec<PaperOrder> = self
            .orders
            .read()
            .values()
            .filter(|o| o.live)
            .cloned()
            .collect();
        live.sort_by(|a, b| a.placed_at.cmp(&b.placed_at).then(a.handle.order_id.cmp(&b.handle.order_id)));
        live
    }

    pub fn live_orders_for(&self, symbol: &str, kind: OrderKind) -> Vec<PaperOrder> {
        self.live_orders()
            .into_iter()
            .filter(|o| o.handle.symbol == symbol && o.kind == PaperOrderKind::Protective(kind))
            .collect()
    }

    pub fn market_closes(&self) -> Vec<PaperOrder> {
        self.orders
            .read()
            .values()
            .filter(|o| o.kind == PaperOrderKind::MarketClose)
            .cloned()
            .collect()
    }

    async fn simulate_round_trip(&self) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let rejected = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            anyhow::bail!("paper exchange rejected the order");
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        symbol: &str,
        kind: PaperOrderKind,
        side: Side,
        trigger_price: Option<f64>,
        callback_fraction: Option<f64>,
        size: f64,
        client_id: &str,
    ) -> Result<OrderHandle> {
        self.simulate_round_trip().await?;
        if !size.is_finite() || size <= 0.0 {
            anyhow::bail!("invalid order size {size}");
        }

        let mut orders = self.orders.write();
        if let Some(existing) = orders
            .values()
            .find(|o| o.handle.symbol == symbol && o.client_id == client_id)
        {
            debug!(handle = %existing.handle, client_id, "paper order already booked");
            return Ok(existing.handle.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = OrderHandle::new(symbol, format!("paper-{id}"));
        let order = PaperOrder {
            handle: handle.clone(),
            client_id: client_id.to_string(),
            kind,
            side,
            trigger_price,
            callback_fraction,
            size,
            placed_at: Utc::now().to_rfc3339(),
            live: kind != PaperOrderKind::MarketClose,
        };
        debug!(
            handle = %handle,
            kind = ?kind,
            order_side = side.closing_order_side(),
            trigger_price = ?trigger_price,
            size,
            "paper order placed"
        );
        orders.insert(handle.clone(), order);
        drop(orders);

        let ack_lost = self
            .drop_ack_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if ack_lost {
            anyhow::bail!("paper exchange acknowledgement lost");
        }
        Ok(handle)
    }
}

impl Default for PaperGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExitOrderGateway for PaperGateway {
    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: Side,
        trigger_price: f64,
        size: f64,
        client_id: &str,
    ) -> Result<OrderHandle> {
        let kind = PaperOrderKind::Protective(OrderKind::StopLoss);
        self.record(symbol, kind, side, Some(trigger_price), None, size, client_id)
            .await
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: Side,
        trigger_price: f64,
        size: f64,
        client_id: &str,
    ) -> Result<OrderHandle> {
        let kind = PaperOrderKind::Protective(OrderKind::TakeProfit);
        self.record(symbol, kind, side, Some(trigger_price), None, size, client_id)
            .await
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
        let kind = PaperOrderKind::Protective(OrderKind::TrailingStop);
        self.record(
            symbol,
            kind,
            side,
            Some(trigger_price),
            Some(callback_fraction),
            size,
            client_id,
        )
        .await
    }

    async fn place_market_close(
        &self,
        symbol: &str,
        side: Side,
        size: f64,
        client_id: &str,
    ) -> Result<OrderHandle> {
        let handle = self
            .record(symbol, PaperOrderKind::MarketClose, side, None, None, size, client_id)
            .await?;
        info!(handle = %handle, size, "paper market close filled");
        Ok(handle)
    }

    async fn cancel(&self, handle: &OrderHandle) -> Result<bool> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut orders = self.orders.write();
        match orders.get_mut(handle) {
            Some(order) if order.live => {
                order.live = false;
                debug!(handle = %handle, "paper order cancelled");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn name(&self) -> &'static str {
        "paper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn orders_are_booked_and_cancelled_once() {
        let gw = PaperGateway::new();
        let sl = gw.place_stop_loss("BTCUSDT", Side::Long, 98_000.0, 1.0, "c-1").await.unwrap();
        let tp = gw.place_take_profit("BTCUSDT", Side::Long, 100_100.0, 1.0, "c-2").await.unwrap();
        assert_ne!(sl, tp);
        assert_eq!(gw.live_orders().len(), 2);

        assert!(gw.cancel(&sl).await.unwrap());
        assert!(!gw.cancel(&sl).await.unwrap());
        assert_eq!(gw.live_orders_for("BTCUSDT", OrderKind::TakeProfit).len(), 1);
        assert!(gw.live_orders_for("BTCUSDT", OrderKind::StopLoss).is_empty());
    }

    #[tokio::test]
    async fn rejections_are_consumed() {
        let gw = PaperGateway::new();
        gw.reject_next_placements(1);
        assert!(gw.place_stop_loss("BTCUSDT", Side::Short, 102_000.0, 1.0, "c-1").await.is_err());
        assert!(gw.place_stop_loss("BTCUSDT", Side::Short, 102_000.0, 1.0, "c-1").await.is_ok());
    }

    #[tokio::test]
    async fn market_close_is_not_resting() {
        let gw = PaperGateway::new();
        gw.place_market_close("ETHUSDT", Side::Long, 0.5, "c-1").await.unwrap();
        assert!(gw.live_orders().is_empty());
        assert_eq!(gw.market_closes().len(), 1);
    }

    #[tokio::test]
    async fn repeated_client_id_returns_the_booked_order() {
        let gw = PaperGateway::new();
        gw.drop_next_acks(1);
        assert!(gw.place_stop_loss("BTCUSDT", Side::Long, 98_000.0, 1.0, "c-7").await.is_err());
        assert_eq!(gw.live_orders().len(), 1);

        let retried = gw.place_stop_loss("BTCUSDT", Side::Long, 98_000.0, 1.0, "c-7").await.unwrap();
        let live = gw.live_orders();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].handle, retried);
        assert_eq!(live[0].client_id, "c-7");

        let other = gw.place_stop_loss("BTCUSDT", Side::Long, 98_000.0, 1.0, "c-8").await.unwrap();
        assert_ne!(other, retried);
        assert_eq!(gw.live_orders().len(), 2);
    }
}
