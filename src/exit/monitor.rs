// =============================================================================
// Position Lifecycle Engine — single-consumer event loop driving every exit
// =============================================================================
//
// One Tokio task owns this engine and takes events off a bounded queue:
//
//   Tick   -> trigger evaluation (SL / TP1 / trailing) -> ledger transition
//   Fill   -> fill sequencer -> ledger transition
//   Open   -> exit plan -> ledger open -> protective orders
//   Close  -> market close -> ledger close
//
// Every transition, including its gateway round trips, completes before the
// next event is taken, so mutations of a position are strictly serialized.
// Readers go straight to the ledger through `EngineHandle`.
//
// Local trigger detection runs in demo mode only. In live mode the exchange's
// own protective orders fire and their fills drive the transitions; ticks
// still advance the trailing extreme and feed health.
//
// A protective order that cannot be placed after all retries leaves the
// position UNPROTECTED: logged at error level, flagged in health, never
// auto-closed.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::exit::planner::{ExitPlanner, PerformanceTier};
use crate::exit::sequencer::FillSequencer;
use crate::exit::triggers::{self, ExitTrigger};
use crate::gateway::{self, with_retry, ExitOrderGateway, RetryPolicy};
use crate::health::{EngineHealth, HealthMonitor};
use crate::position_engine::{
    new_client_id, Position, PositionLedger, ProtectionCommand, Transition,
};
use crate::runtime_config::RuntimeConfig;
use crate::trade_journal::TradeJournal;
use crate::types::{AccountMode, FillEvent, OrderKind, PriceTick, Side, Stage};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Request to open a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRequest {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub size: f64,
    /// Falls back to `default_leverage`.
    #[serde(default)]
    pub leverage: Option<u32>,
    /// Falls back to the symbol's configured tier.
    #[serde(default)]
    pub tier: Option<PerformanceTier>,
    /// Volatility in price units for the ATR-adjusted targets.
    #[serde(default)]
    pub atr: Option<f64>,
}

pub type Reply = oneshot::Sender<EngineResult<Position>>;

#[derive(Debug)]
pub enum EngineEvent {
    Tick(PriceTick),
    Fill(FillEvent),
    Open { request: OpenRequest, reply: Reply },
    /// `price` overrides the last seen tick as the recorded exit price.
    Close { symbol: String, price: Option<f64>, reply: Reply },
    Shutdown,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct LifecycleEngine {
    ledger: Arc<PositionLedger>,
    gateway: Arc<dyn ExitOrderGateway>,
    health: Arc<HealthMonitor>,
    config: RuntimeConfig,
    retry: RetryPolicy,
    local_triggers: bool,
    journal: Option<TradeJournal>,
    /// Keyed by position id.
    sequencers: HashMap<String, FillSequencer>,
    last_prices: HashMap<String, f64>,
}

impl LifecycleEngine {
    pub fn new(config: RuntimeConfig, gateway: Arc<dyn ExitOrderGateway>) -> Self {
        let journal = config.trade_log_path.as_ref().map(TradeJournal::new);
        Self {
            ledger: Arc::new(PositionLedger::new()),
            health: Arc::new(HealthMonitor::new(config.stale_tick_secs)),
            retry: config.gateway.retry_policy(),
            local_triggers: config.account_mode == AccountMode::Demo,
            gateway,
            config,
            journal,
            sequencers: HashMap::new(),
            last_prices: HashMap::new(),
        }
    }

    pub fn ledger(&self) -> Arc<PositionLedger> {
        Arc::clone(&self.ledger)
    }

    pub fn health_monitor(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.health)
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    pub async fn open_position(&mut self, request: OpenRequest) -> EngineResult<Position> {
        let leverage = request.leverage.unwrap_or(self.config.default_leverage);
        let exit_config = self
            .config
            .exit_plan_config(&request.symbol, request.tier)
            .clone();

        let plan = ExitPlanner::plan(
            request.entry_price,
            request.side,
            leverage,
            &exit_config,
            request.atr,
        )?;
        debug!(
            symbol = %request.symbol,
            sl = plan.stop_loss_price,
            sl_baseline = plan.baseline_stop_loss_price,
            tp1 = plan.take_profit_price,
            tp1_baseline = plan.baseline_take_profit_price,
            "exit plan ready"
        );
        let transition = self.ledger.open(
            &request.symbol,
            request.side,
            request.entry_price,
            leverage,
            request.size,
            &plan,
        )?;

        self.sequencers.insert(
            transition.position.id.clone(),
            FillSequencer::new(self.config.max_pending_fills),
        );
        self.apply(&transition).await?;
        self.current(&transition.position)
    }

    // -------------------------------------------------------------------------
    // Ticks
    // -------------------------------------------------------------------------

    pub async fn on_tick(&mut self, tick: PriceTick) -> EngineResult<()> {
        if !tick.is_valid() {
            warn!(symbol = %tick.symbol, price = tick.price, "invalid tick dropped");
            return Ok(());
        }
        self.health.record_tick(&tick.symbol, tick.timestamp);
        self.last_prices.insert(tick.symbol.clone(), tick.price);

        let Some(position) = self.ledger.open_position(&tick.symbol) else {
            return Ok(());
        };

        let trigger = if self.local_triggers {
            triggers::evaluate(&position, &tick)
        } else {
            None
        };

        match trigger {
            Some(ExitTrigger::StopLoss { fill_price }) => {
                info!(
                    id = %position.id,
                    symbol = %position.symbol,
                    stage = %position.stage,
                    sl = position.stop_loss_price,
                    fill_price,
                    "STOP-LOSS TRIGGERED"
                );
                let t = self.ledger.record_stop_loss_fill(&position.symbol, fill_price)?;
                self.apply(&t).await
            }
            Some(ExitTrigger::TakeProfit { fill_price }) => {
                info!(
                    id = %position.id,
                    symbol = %position.symbol,
                    tp1 = fill_price,
                    price = tick.price,
                    "TP1 TRIGGERED"
                );
                self.take_profit(&position, fill_price).await
            }
            Some(ExitTrigger::TrailingStop { fill_price, stop_price }) => {
                info!(
                    id = %position.id,
                    symbol = %position.symbol,
                    best = ?position.best_price_since_trailing,
                    stop = stop_price,
                    fill_price,
                    "TRAILING STOP TRIGGERED"
                );
                let t = self.ledger.record_trailing_fill(&position.symbol, fill_price)?;
                self.apply(&t).await
            }
            None => {
                if position.stage == Stage::TrailingActive {
                    self.ledger
                        .update_trailing_extreme(&position.symbol, tick.favorable(position.side))?;
                }
                Ok(())
            }
        }
    }

    /// OPENED -> TP1_FILLED -> TRAILING_ACTIVE within one event.
    async fn take_profit(&mut self, position: &Position, fill_price: f64) -> EngineResult<()> {
        let t = self
            .ledger
            .record_tp1_fill(&position.symbol, fill_price, position.tp1_close_fraction)?;
        let reissued = self.apply(&t).await;
        let t = self.ledger.activate_trailing(&position.symbol)?;
        let trailing = self.apply(&t).await;
        reissued.and(trailing)
    }

    // -------------------------------------------------------------------------
    // Fills
    // -------------------------------------------------------------------------

    pub async fn on_fill(&mut self, fill: FillEvent) -> EngineResult<()> {
        self.health.record_fill();
        let oref = self.ledger.resolve_fill(&fill.handle)?;
        let max_pending = self.config.max_pending_fills;
        let sequencer = self
            .sequencers
            .entry(oref.position_id)
            .or_insert_with(|| FillSequencer::new(max_pending));
        let ready = sequencer.accept(fill)?;
        if sequencer.pending_len() > 0 {
            debug!(
                symbol = %oref.symbol,
                pending = sequencer.pending_len(),
                "fills buffered awaiting earlier sequence"
            );
        }

        let mut result = Ok(());
        for fill in ready {
            match self.apply_fill(fill).await {
                Err(e) if e.is_stale() => {
                    self.health.record_stale_event();
                    info!(error = %e, "buffered fill went stale, skipped");
                }
                Err(e) if result.is_ok() => result = Err(e),
                Err(e) => warn!(error = %e, "further fill failure"),
                Ok(()) => {}
            }
        }
        result
    }

    async fn apply_fill(&mut self, fill: FillEvent) -> EngineResult<()> {
        let oref = self.ledger.resolve_fill(&fill.handle)?;
        let position = self
            .ledger
            .open_position(&oref.symbol)
            .ok_or_else(|| EngineError::PositionNotFound(oref.symbol.clone()))?;
        self.ledger.consume_order(&fill.handle)?;

        info!(
            handle = %fill.handle,
            kind = %oref.kind,
            fill_price = fill.fill_price,
            filled_size = fill.filled_size,
            sequence = ?fill.sequence,
            "applying exchange fill"
        );

        match oref.kind {
            OrderKind::StopLoss => {
                let t = self.ledger.record_stop_loss_fill(&oref.symbol, fill.fill_price)?;
                self.apply(&t).await
            }
            OrderKind::TakeProfit => self.take_profit(&position, fill.fill_price).await,
            OrderKind::TrailingStop => {
                let t = self.ledger.record_trailing_fill(&oref.symbol, fill.fill_price)?;
                self.apply(&t).await
            }
        }
    }

    // -------------------------------------------------------------------------
    // Manual close
    // -------------------------------------------------------------------------

    /// Market-close the remainder. If the exchange rejects the close the
    /// position is left exactly as it was.
    pub async fn close_position(&mut self, symbol: &str, price: Option<f64>) -> EngineResult<Position> {
        let position = match self.ledger.open_position(symbol) {
            Some(p) => p,
            None => {
                return Err(match self.ledger.get_position(symbol) {
                    Some(_) => EngineError::StaleEvent {
                        symbol: symbol.to_string(),
                        detail: "position already closed".to_string(),
                    },
                    None => EngineError::PositionNotFound(symbol.to_string()),
                })
            }
        };

        let exit_price = price
            .or_else(|| self.last_prices.get(symbol).copied())
            .ok_or_else(|| {
                EngineError::InvalidRiskParameter(format!("no price known to close {symbol}"))
            })?;

        let gw = self.gateway.as_ref();
        let (side, size) = (position.side, position.remaining_size);
        let client_id = new_client_id();
        let client_id = client_id.as_str();
        let operation = format!("market close {symbol}");
        let handle = with_retry(&self.retry, &operation, move || {
            gw.place_market_close(symbol, side, size, client_id)
        })
        .await
        .map_err(|e| {
            self.health.record_gateway_failure(&e.to_string());
            e
        })?;

        info!(handle = %handle, symbol, exit_price, size, "manual close sent");
        let t = self.ledger.record_manual_close(symbol, exit_price)?;
        self.apply(&t).await?;
        Ok(t.position)
    }

    // -------------------------------------------------------------------------
    // Protection commands
    // -------------------------------------------------------------------------

    /// Send the transition's commands to the gateway, then settle protection
    /// status (or finish the close).
    async fn apply(&mut self, transition: &Transition) -> EngineResult<()> {
        let position = &transition.position;
        let gw = self.gateway.as_ref();
        let mut failures: Vec<String> = Vec::new();

        for command in &transition.commands {
            match command {
                ProtectionCommand::Cancel { kind, handle } => {
                    let operation = format!("cancel {kind} {handle}");
                    match with_retry(&self.retry, &operation, move || gw.cancel(handle)).await {
                        Ok(true) => debug!(handle = %handle, kind = %kind, "order cancelled"),
                        Ok(false) => debug!(handle = %handle, kind = %kind, "order already gone"),
                        Err(e) => {
                            self.health.record_gateway_failure(&e.to_string());
                            warn!(handle = %handle, kind = %kind, error = %e, "cancel failed, order may still rest");
                        }
                    }
                }
                ProtectionCommand::Place(request) => {
                    let operation = format!("place {} {}", request.kind, request.symbol);
                    match with_retry(&self.retry, &operation, move || gateway::place(gw, request)).await {
                        Ok(handle) => {
                            debug!(handle = %handle, kind = %request.kind, size = request.size, "protective order confirmed");
                            if let Err(e) = self.ledger.attach_order(&position.id, request.kind, handle.clone()) {
                                warn!(handle = %handle, error = %e, "order could not be attached, cancelling");
                                match gw.cancel(&handle).await {
                                    Ok(true) => {}
                                    Ok(false) => warn!(handle = %handle, "unattached order was already gone"),
                                    Err(e) => {
                                        self.health.record_gateway_failure(&e.to_string());
                                        warn!(handle = %handle, error = %e, "unattached order may still rest on the exchange");
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            self.health.record_gateway_failure(&e.to_string());
                            failures.push(format!("{} placement failed: {e}", request.kind));
                        }
                    }
                }
            }
        }

        if position.is_closed() {
            self.finish_close(position);
            return Ok(());
        }

        // Protected only when every order the stage needs is live, including
        // ones an earlier transition failed to place.
        let missing = self
            .ledger
            .open_position(&position.symbol)
            .map(|p| p.missing_orders())
            .unwrap_or_default();
        if failures.is_empty() && missing.is_empty() {
            self.ledger.mark_protected(&position.symbol)?;
            self.health.clear_unprotected(&position.symbol);
            return Ok(());
        }

        failures.extend(
            missing
                .iter()
                .filter(|kind| {
                    !transition
                        .commands
                        .iter()
                        .any(|c| matches!(c, ProtectionCommand::Place(r) if r.kind == **kind))
                })
                .map(|kind| format!("no live {kind} order")),
        );
        let reason = failures.join("; ");
        self.ledger.mark_unprotected(&position.symbol, &reason)?;
        self.health.mark_unprotected(&position.symbol, &reason);
        error!(
            id = %position.id,
            symbol = %position.symbol,
            stage = %position.stage,
            remaining_size = position.remaining_size,
            reason = %reason,
            "UNPROTECTED — MANUAL INTERVENTION REQUIRED"
        );
        Err(EngineError::Unprotected {
            symbol: position.symbol.clone(),
            reason,
        })
    }

    fn finish_close(&mut self, position: &Position) {
        self.sequencers.remove(&position.id);
        self.health.clear_unprotected(&position.symbol);
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(position) {
                warn!(id = %position.id, error = %e, "failed to journal closed trade");
            }
        }
    }

    fn current(&self, position: &Position) -> EngineResult<Position> {
        self.ledger
            .get_position(&position.symbol)
            .filter(|p| p.id == position.id)
            .ok_or_else(|| EngineError::PositionNotFound(position.symbol.clone()))
    }

    // -------------------------------------------------------------------------
    // Event loop
    // -------------------------------------------------------------------------

    /// Consume events until `Shutdown` or until every sender is dropped.
    pub async fn run(mut self, mut events: mpsc::Receiver<EngineEvent>) {
        self.health.set_running(true);
        info!(
            gateway = self.gateway.name(),
            local_triggers = self.local_triggers,
            "lifecycle engine started"
        );

        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::Tick(tick) => {
                    let symbol = tick.symbol.clone();
                    let result = self.on_tick(tick).await;
                    self.log_outcome("tick", &symbol, result);
                }
                EngineEvent::Fill(fill) => {
                    let symbol = fill.handle.symbol.clone();
                    let result = self.on_fill(fill).await;
                    self.log_outcome("fill", &symbol, result);
                }
                EngineEvent::Open { request, reply } => {
                    let symbol = request.symbol.clone();
                    let result = self.open_position(request).await;
                    if let Err(e) = &result {
                        warn!(symbol = %symbol, error = %e, "open request failed");
                    }
                    let _ = reply.send(result);
                }
                EngineEvent::Close { symbol, price, reply } => {
                    let result = self.close_position(&symbol, price).await;
                    if let Err(e) = &result {
                        warn!(symbol = %symbol, error = %e, "close request failed");
                    }
                    let _ = reply.send(result);
                }
                EngineEvent::Shutdown => {
                    info!("lifecycle engine shutting down");
                    break;
                }
            }
        }

        self.health.set_running(false);
        info!(
            open_positions = self.ledger.list_open_positions().len(),
            "lifecycle engine stopped"
        );
    }

    fn log_outcome(&self, what: &str, symbol: &str, result: EngineResult<()>) {
        match result {
            Ok(()) => {}
            Err(e) if e.is_stale() => {
                self.health.record_stale_event();
                info!(symbol, event = what, error = %e, "stale event ignored");
            }
            Err(e @ EngineError::Unprotected { .. }) => {
                error!(symbol, event = what, error = %e, "event left position unprotected");
            }
            Err(e) => warn!(symbol, event = what, error = %e, "event rejected"),
        }
    }

    /// Spawn the loop on the Tokio runtime and return a handle to it.
    pub fn spawn(self) -> EngineHandle {
        let (tx, rx) = mpsc::channel(self.config.event_queue_capacity);
        let handle = EngineHandle {
            events: tx,
            ledger: self.ledger(),
            health: self.health_monitor(),
        };
        self.health.set_running(true);
        tokio::spawn(self.run(rx));
        handle
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cheap, cloneable front door to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    events: mpsc::Sender<EngineEvent>,
    ledger: Arc<PositionLedger>,
    health: Arc<HealthMonitor>,
}

impl EngineHandle {
    pub fn sender(&self) -> mpsc::Sender<EngineEvent> {
        self.events.clone()
    }

    async fn send(&self, event: EngineEvent) -> EngineResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| EngineError::EngineStopped)
    }

    pub async fn open(&self, request: OpenRequest) -> EngineResult<Position> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineEvent::Open { request, reply }).await?;
        rx.await.map_err(|_| EngineError::EngineStopped)?
    }

    pub async fn close(&self, symbol: &str, price: Option<f64>) -> EngineResult<Position> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineEvent::Close {
            symbol: symbol.to_string(),
            price,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::EngineStopped)?
    }

    pub async fn tick(&self, tick: PriceTick) -> EngineResult<()> {
        self.send(EngineEvent::Tick(tick)).await
    }

    pub async fn fill(&self, fill: FillEvent) -> EngineResult<()> {
        self.send(EngineEvent::Fill(fill)).await
    }

    /// True once the engine loop has exited.
    pub fn is_stopped(&self) -> bool {
        self.events.is_closed()
    }

    pub async fn shutdown(&self) {
        let _ = self.events.send(EngineEvent::Shutdown).await;
    }

    pub fn get_position(&self, symbol: &str) -> Option<Position> {
        self.ledger.get_position(symbol)
    }

    pub fn list_open_positions(&self) -> Vec<Position> {
        self.ledger.list_open_positions()
    }

    pub fn list_closed_positions(&self) -> Vec<Position> {
        self.ledger.list_closed_positions()
    }

    pub fn health(&self) -> EngineHealth {
        let open: Vec<String> = self
            .ledger
            .list_open_positions()
            .into_iter()
            .map(|p| p.symbol)
            .collect();
        let mut snapshot = self.health.snapshot(&open, Utc::now().timestamp_millis());
        snapshot.live_orders = self.ledger.live_order_count();
        snapshot
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::gateway::PaperGateway;
    use crate::health::HealthStatus;
    use crate::position_engine::{CloseReason, ProtectionStatus};
    use crate::runtime_config::GatewayConfig;
    use crate::types::OrderHandle;

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            trade_log_path: None,
            gateway: GatewayConfig {
                placement_timeout_ms: 50,
                max_attempts: 3,
                backoff_base_ms: 1,
            },
            ..RuntimeConfig::default()
        }
    }

    fn engine_with(gateway: Arc<PaperGateway>) -> LifecycleEngine {
        LifecycleEngine::new(test_config(), gateway)
    }

    fn long_btc() -> OpenRequest {
        OpenRequest {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            entry_price: 100_000.0,
            size: 1.0,
            leverage: Some(25),
            tier: None,
            atr: None,
        }
    }

    fn tick(price: f64) -> PriceTick {
        PriceTick::point("BTCUSDT", price, Utc::now().timestamp_millis())
    }

    fn handle_of(engine: &LifecycleEngine, kind: OrderKind) -> OrderHandle {
        engine
            .ledger
            .open_position("BTCUSDT")
            .and_then(|p| p.orders.get(kind).cloned())
            .expect("order attached")
    }

    #[tokio::test]
    async fn open_places_and_attaches_protection() {
        let gw = Arc::new(PaperGateway::new());
        let mut engine = engine_with(gw.clone());
        let p = engine.open_position(long_btc()).await.unwrap();

        assert_eq!(p.stage, Stage::Opened);
        assert_eq!(p.protection, ProtectionStatus::Protected);
        assert!(p.orders.stop_loss.is_some());
        assert!(p.orders.take_profit.is_some());
        assert_eq!(gw.live_orders().len(), 2);
    }

    #[tokio::test]
    async fn tp1_hands_off_to_trailing_in_one_tick() {
        let gw = Arc::new(PaperGateway::new());
        let mut engine = engine_with(gw.clone());
        engine.open_position(long_btc()).await.unwrap();

        engine.on_tick(tick(100_150.0)).await.unwrap();
        let p = engine.ledger.open_position("BTCUSDT").unwrap();
        assert_eq!(p.stage, Stage::TrailingActive);
        assert!((p.remaining_size - 0.25).abs() < 1e-12);
        assert!((p.trailing_trigger_price.unwrap() - 100_100.0).abs() < 1e-6);
        assert_eq!(p.trailing_trigger_price, p.tp1_fill_price);
        assert_eq!(p.take_profit_price, None);
        assert_eq!(p.protection, ProtectionStatus::Protected);

        // Exactly one stop-loss (on the remainder) and one trailing stop rest.
        let sl = gw.live_orders_for("BTCUSDT", OrderKind::StopLoss);
        assert_eq!(sl.len(), 1);
        assert!((sl[0].size - 0.25).abs() < 1e-12);
        assert!(gw.live_orders_for("BTCUSDT", OrderKind::TakeProfit).is_empty());
        let trail = gw.live_orders_for("BTCUSDT", OrderKind::TrailingStop);
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].callback_fraction, Some(0.03));
    }

    #[tokio::test]
    async fn trailing_stop_closes_remainder_after_reversal() {
        let gw = Arc::new(PaperGateway::new());
        let mut engine = engine_with(gw.clone());
        engine.open_position(long_btc()).await.unwrap();
        engine.on_tick(tick(100_150.0)).await.unwrap();

        engine.on_tick(tick(102_000.0)).await.unwrap();
        assert_eq!(
            engine.ledger.open_position("BTCUSDT").unwrap().best_price_since_trailing,
            Some(102_000.0)
        );

        engine.on_tick(tick(98_950.0)).await.unwrap();
        assert!(engine.ledger.open_position("BTCUSDT").is_some());

        engine.on_tick(tick(98_900.0)).await.unwrap();
        let closed = engine.ledger.list_closed_positions();
        assert_eq!(closed.len(), 1);
        let p = &closed[0];
        assert_eq!(p.close_reason, Some(CloseReason::TrailingStop));
        assert_eq!(p.remaining_size, 0.0);
        assert_eq!(p.exit_price, Some(98_900.0));
        assert!(gw.live_orders().is_empty());
    }

    #[tokio::test]
    async fn short_trailing_stop_closes_remainder_after_reversal() {
        let gw = Arc::new(PaperGateway::new());
        let mut engine = engine_with(gw.clone());
        let mut req = long_btc();
        req.side = Side::Short;
        engine.open_position(req).await.unwrap();

        engine.on_tick(tick(99_850.0)).await.unwrap();
        let p = engine.ledger.open_position("BTCUSDT").unwrap();
        assert_eq!(p.stage, Stage::TrailingActive);
        assert_eq!(p.trailing_trigger_price, p.tp1_fill_price);
        assert_eq!(p.protection, ProtectionStatus::Protected);

        engine.on_tick(tick(98_000.0)).await.unwrap();
        assert_eq!(
            engine.ledger.open_position("BTCUSDT").unwrap().best_price_since_trailing,
            Some(98_000.0)
        );

        // Stop sits at 98 000 * 1.03 = 100 940.
        engine.on_tick(tick(100_900.0)).await.unwrap();
        assert!(engine.ledger.open_position("BTCUSDT").is_some());

        engine.on_tick(tick(100_950.0)).await.unwrap();
        let closed = engine.ledger.list_closed_positions();
        assert_eq!(closed.len(), 1);
        let p = &closed[0];
        assert_eq!(p.side, Side::Short);
        assert_eq!(p.close_reason, Some(CloseReason::TrailingStop));
        assert_eq!(p.exit_price, Some(100_950.0));
        assert_eq!(p.remaining_size, 0.0);
        assert!(gw.live_orders().is_empty());
    }

    #[tokio::test]
    async fn gap_through_both_levels_closes_by_stop_loss() {
        let gw = Arc::new(PaperGateway::new());
        let mut engine = engine_with(gw.clone());
        engine.open_position(long_btc()).await.unwrap();

        let gap = PriceTick::range("BTCUSDT", 97_900.0, 100_200.0, 99_000.0, 0);
        engine.on_tick(gap).await.unwrap();

        let p = engine.ledger.get_position("BTCUSDT").unwrap();
        assert_eq!(p.stage, Stage::Closed);
        assert_eq!(p.close_reason, Some(CloseReason::StopLoss));
        assert_eq!(p.tp1_fill_price, None);
        assert!((p.realized_pnl + 2_000.0).abs() < 1e-6);
        assert!(gw.live_orders().is_empty());
    }

    #[tokio::test]
    async fn fill_after_close_is_stale_and_changes_nothing() {
        let gw = Arc::new(PaperGateway::new());
        let mut engine = engine_with(gw.clone());
        engine.open_position(long_btc()).await.unwrap();
        let tp = handle_of(&engine, OrderKind::TakeProfit);

        engine.on_tick(tick(97_000.0)).await.unwrap();
        let before = engine.ledger.get_position("BTCUSDT").unwrap();

        let err = engine
            .on_fill(FillEvent {
                handle: tp,
                fill_price: 100_100.0,
                filled_size: 1.0,
                timestamp: 0,
                sequence: Some(1),
            })
            .await
            .unwrap_err();
        assert!(err.is_stale());
        assert_eq!(engine.ledger.get_position("BTCUSDT").unwrap(), before);
    }

    #[tokio::test]
    async fn exchange_fills_are_applied_in_sequence() {
        let gw = Arc::new(PaperGateway::new());
        let mut engine = engine_with(gw.clone());
        engine.open_position(long_btc()).await.unwrap();
        let sl = handle_of(&engine, OrderKind::StopLoss);
        let tp = handle_of(&engine, OrderKind::TakeProfit);

        // The original stop reports as fill #2 before TP1 (#1) arrives.
        engine
            .on_fill(FillEvent {
                handle: sl,
                fill_price: 98_000.0,
                filled_size: 1.0,
                timestamp: 2,
                sequence: Some(2),
            })
            .await
            .unwrap();
        assert_eq!(engine.ledger.open_position("BTCUSDT").unwrap().stage, Stage::Opened);

        engine
            .on_fill(FillEvent {
                handle: tp,
                fill_price: 100_100.0,
                filled_size: 0.75,
                timestamp: 1,
                sequence: Some(1),
            })
            .await
            .unwrap();

        // TP1 applied first; the replaced full-size stop's fill is stale.
        let p = engine.ledger.open_position("BTCUSDT").unwrap();
        assert_eq!(p.stage, Stage::TrailingActive);
        assert!((p.remaining_size - 0.25).abs() < 1e-12);
    }

    #[tokio::test]
    async fn exhausted_placement_leaves_position_unprotected() {
        let gw = Arc::new(PaperGateway::new());
        let mut engine = engine_with(gw.clone());
        gw.reject_next_placements(3);

        let err = engine.open_position(long_btc()).await.unwrap_err();
        assert!(matches!(err, EngineError::Unprotected { .. }));

        let p = engine.ledger.open_position("BTCUSDT").unwrap();
        assert_eq!(p.stage, Stage::Opened);
        assert!(matches!(p.protection, ProtectionStatus::Unprotected { .. }));
        assert!(p.orders.stop_loss.is_none());
        assert!(p.orders.take_profit.is_some());

        engine.health.set_running(true);
        let snap = engine.health.snapshot(&["BTCUSDT".to_string()], 0);
        assert_eq!(snap.status, HealthStatus::Critical);
        assert_eq!(snap.unprotected[0].symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn failed_stop_reissue_at_tp1_stays_unprotected() {
        let gw = Arc::new(PaperGateway::new());
        let mut engine = engine_with(gw.clone());
        engine.open_position(long_btc()).await.unwrap();

        // The reduced stop-loss is rejected; the trailing stop still goes out.
        gw.reject_next_placements(3);
        let err = engine.on_tick(tick(100_150.0)).await.unwrap_err();
        assert!(matches!(err, EngineError::Unprotected { .. }));

        let p = engine.ledger.open_position("BTCUSDT").unwrap();
        assert_eq!(p.stage, Stage::TrailingActive);
        assert!(p.orders.trailing_stop.is_some());
        assert!(p.orders.stop_loss.is_none());
        match &p.protection {
            ProtectionStatus::Unprotected { reason } => assert!(reason.contains("SL")),
            other => panic!("unexpected {other:?}"),
        }

        let snap = engine.health.snapshot(&["BTCUSDT".to_string()], 0);
        assert_eq!(snap.status, HealthStatus::Critical);
        assert_eq!(snap.unprotected[0].symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn retry_after_lost_ack_reuses_the_booked_order() {
        let gw = Arc::new(PaperGateway::new());
        let mut engine = engine_with(gw.clone());
        gw.drop_next_acks(1);

        let p = engine.open_position(long_btc()).await.unwrap();
        assert_eq!(p.protection, ProtectionStatus::Protected);
        assert_eq!(gw.live_orders_for("BTCUSDT", OrderKind::StopLoss).len(), 1);
        assert_eq!(gw.live_orders().len(), 2);
        assert_eq!(
            gw.live_orders_for("BTCUSDT", OrderKind::StopLoss)[0].handle,
            handle_of(&engine, OrderKind::StopLoss)
        );
    }

    #[tokio::test]
    async fn slow_gateway_times_out_to_unprotected() {
        let gw = Arc::new(PaperGateway::new().with_latency(Duration::from_millis(200)));
        let mut engine = engine_with(gw);
        let err = engine.open_position(long_btc()).await.unwrap_err();
        match err {
            EngineError::Unprotected { reason, .. } => assert!(reason.contains("did not confirm")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_plan_fails_closed() {
        let gw = Arc::new(PaperGateway::new());
        let mut engine = engine_with(gw.clone());
        let mut req = long_btc();
        req.leverage = Some(0);
        assert!(engine.open_position(req).await.is_err());
        assert!(engine.ledger.get_position("BTCUSDT").is_none());
        assert!(gw.live_orders().is_empty());
    }

    #[tokio::test]
    async fn live_mode_ignores_local_triggers() {
        let gw = Arc::new(PaperGateway::new());
        let config = RuntimeConfig {
            account_mode: AccountMode::Live,
            ..test_config()
        };
        let mut engine = LifecycleEngine::new(config, gw);
        engine.open_position(long_btc()).await.unwrap();
        engine.on_tick(tick(97_000.0)).await.unwrap();
        assert_eq!(engine.ledger.open_position("BTCUSDT").unwrap().stage, Stage::Opened);
    }

    #[tokio::test]
    async fn handle_drives_a_spawned_engine() {
        let gw = Arc::new(PaperGateway::new());
        let handle = engine_with(gw.clone()).spawn();

        let p = handle.open(long_btc()).await.unwrap();
        assert_eq!(p.stage, Stage::Opened);
        assert_eq!(handle.health().live_orders, 2);
        assert!(matches!(
            handle.open(long_btc()).await,
            Err(EngineError::PositionAlreadyOpen(_))
        ));

        handle.tick(tick(100_050.0)).await.unwrap();
        let closed = handle.close("BTCUSDT", Some(100_050.0)).await.unwrap();
        assert_eq!(closed.close_reason, Some(CloseReason::Manual));
        assert!((closed.realized_pnl - 50.0).abs() < 1e-6);
        assert_eq!(gw.market_closes().len(), 1);
        assert!(gw.live_orders().is_empty());

        assert!(handle.close("BTCUSDT", None).await.unwrap_err().is_stale());
        assert!(matches!(
            handle.close("ETHUSDT", None).await,
            Err(EngineError::PositionNotFound(_))
        ));

        assert!(handle.list_open_positions().is_empty());
        assert_eq!(handle.list_closed_positions().len(), 1);
        let health = handle.health();
        assert_eq!(health.status, HealthStatus::Ok);
        assert_eq!(health.live_orders, 0);

        handle.shutdown().await;
        handle.events.closed().await;
        assert!(handle.is_stopped());
        assert!(handle.fill(FillEvent {
            handle: OrderHandle::new("BTCUSDT", "1"),
            fill_price: 1.0,
            filled_size: 1.0,
            timestamp: 0,
            sequence: None,
        })
        .await
        .is_err());
    }

    #[tokio::test]
    async fn rejected_market_close_leaves_position_open() {
        let gw = Arc::new(PaperGateway::new());
        let mut engine = engine_with(gw.clone());
        engine.open_position(long_btc()).await.unwrap();

        gw.reject_next_placements(3);
        assert!(engine.close_position("BTCUSDT", Some(100_000.0)).await.is_err());
        let p = engine.ledger.open_position("BTCUSDT").unwrap();
        assert_eq!(p.stage, Stage::Opened);
        assert_eq!(gw.live_orders().len(), 2);
    }
}
