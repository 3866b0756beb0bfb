// =============================================================================
// Position Ledger — authoritative store and stage transitions for positions
// =============================================================================
//
// Life-cycle:
//   OPENED  ->  TP1_FILLED  ->  TRAILING_ACTIVE  ->  CLOSED
//   OPENED / TP1_FILLED / TRAILING_ACTIVE  ->  CLOSED (SL / manual)
//
// Every mutator works on a copy of the stored position, validates the result
// against the position invariants and only then commits it. A rejected
// mutation leaves the stored position untouched.
//
// Mutators never talk to the exchange. They return the protection commands
// (place / cancel) the lifecycle engine has to send through the gateway.
//
// Thread-safety: all state is behind one `parking_lot::RwLock`; the engine
// task is the only writer.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::exit::planner::ExitPlan;
use crate::types::{OrderHandle, OrderKind, Side, Stage};

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// Why a position reached CLOSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    StopLoss,
    TrailingStop,
    Manual,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "StopLoss"),
            Self::TrailingStop => write!(f, "TrailingStop"),
            Self::Manual => write!(f, "Manual"),
        }
    }
}

/// Whether the exchange-side protection of a position is confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtectionStatus {
    /// Every required protective order is resting on the exchange.
    Protected,
    /// Placement commands issued, confirmation outstanding.
    Pending,
    /// Placement failed after all retries.
    Unprotected { reason: String },
}

/// Live exchange orders protecting a position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtectiveOrders {
    #[serde(default)]
    pub stop_loss: Option<OrderHandle>,
    #[serde(default)]
    pub take_profit: Option<OrderHandle>,
    #[serde(default)]
    pub trailing_stop: Option<OrderHandle>,
}

impl ProtectiveOrders {
    pub fn get(&self, kind: OrderKind) -> Option<&OrderHandle> {
        match kind {
            OrderKind::StopLoss => self.stop_loss.as_ref(),
            OrderKind::TakeProfit => self.take_profit.as_ref(),
            OrderKind::TrailingStop => self.trailing_stop.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: OrderKind) -> &mut Option<OrderHandle> {
        match kind {
            OrderKind::StopLoss => &mut self.stop_loss,
            OrderKind::TakeProfit => &mut self.take_profit,
            OrderKind::TrailingStop => &mut self.trailing_stop,
        }
    }

    fn handles(&self) -> impl Iterator<Item = &OrderHandle> {
        [&self.stop_loss, &self.take_profit, &self.trailing_stop]
            .into_iter()
            .flatten()
    }
}

/// A single tracked leveraged position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub leverage: u32,
    pub initial_size: f64,
    /// Open quantity; only ever decreases.
    pub remaining_size: f64,
    pub stage: Stage,
    pub stop_loss_price: f64,
    /// Set at OPENED, cleared once TP1 fills.
    pub take_profit_price: Option<f64>,
    /// Set on entering TRAILING_ACTIVE; equals `tp1_fill_price`.
    pub trailing_trigger_price: Option<f64>,
    pub trailing_callback_fraction: f64,
    pub tp1_close_fraction: f64,
    /// Highest (long) or lowest (short) price seen while trailing.
    pub best_price_since_trailing: Option<f64>,
    pub tp1_fill_price: Option<f64>,
    pub exit_price: Option<f64>,
    /// Quote-currency PnL of everything closed so far.
    pub realized_pnl: f64,
    pub opened_at: String,
    pub closed_at: Option<String>,
    pub close_reason: Option<CloseReason>,
    pub orders: ProtectiveOrders,
    pub protection: ProtectionStatus,
}

impl Position {
    pub fn is_closed(&self) -> bool {
        self.stage == Stage::Closed
    }

    /// Margin committed at entry.
    pub fn margin(&self) -> f64 {
        self.entry_price * self.initial_size / self.leverage as f64
    }

    fn realize(&mut self, fill_price: f64, size: f64) -> f64 {
        let pnl = self.side.sign() * (fill_price - self.entry_price) * size;
        self.realized_pnl += pnl;
        pnl
    }

    fn close_remainder(&mut self, fill_price: f64, reason: CloseReason) -> f64 {
        let pnl = self.realize(fill_price, self.remaining_size);
        self.remaining_size = 0.0;
        self.stage = Stage::Closed;
        self.exit_price = Some(fill_price);
        self.closed_at = Some(Utc::now().to_rfc3339());
        self.close_reason = Some(reason);
        pnl
    }

    /// Protective orders the current stage requires that are not live.
    pub fn missing_orders(&self) -> Vec<OrderKind> {
        let required: &[OrderKind] = match self.stage {
            Stage::Opened => &[OrderKind::StopLoss, OrderKind::TakeProfit],
            Stage::Tp1Filled => &[OrderKind::StopLoss],
            Stage::TrailingActive => &[OrderKind::StopLoss, OrderKind::TrailingStop],
            Stage::Closed => &[],
        };
        required
            .iter()
            .copied()
            .filter(|kind| self.orders.get(*kind).is_none())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Protection commands
// ---------------------------------------------------------------------------

/// Order to be placed for a position. `side` is the position's side; the
/// gateway derives the reducing order side from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub kind: OrderKind,
    pub symbol: String,
    pub side: Side,
    pub trigger_price: f64,
    pub size: f64,
    /// Only set for trailing stops.
    pub callback_fraction: Option<f64>,
    /// Client order id, fixed for every retry of this placement.
    pub client_id: String,
}

/// Exchange client order id: at most 36 chars of `[A-Za-z0-9_-]`.
pub fn new_client_id() -> String {
    format!("tg-{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtectionCommand {
    Place(OrderRequest),
    Cancel { kind: OrderKind, handle: OrderHandle },
}

/// Result of a ledger mutation: the committed position and the exchange work
/// it implies.
#[derive(Debug, Clone)]
pub struct Transition {
    pub position: Position,
    pub commands: Vec<ProtectionCommand>,
}

/// Index entry mapping a live order back to its position.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRef {
    pub position_id: String,
    pub symbol: String,
    pub kind: OrderKind,
}

// ---------------------------------------------------------------------------
// Invariants
// ---------------------------------------------------------------------------

fn violation(p: &Position, detail: impl Into<String>) -> EngineError {
    EngineError::InvariantViolation {
        symbol: p.symbol.clone(),
        detail: detail.into(),
    }
}

fn check_invariants(p: &Position) -> EngineResult<()> {
    if p.stage == Stage::Closed {
        if p.remaining_size != 0.0 {
            return Err(violation(p, format!("closed with remaining size {}", p.remaining_size)));
        }
    } else if !(p.remaining_size > 0.0 && p.remaining_size <= p.initial_size) {
        return Err(violation(
            p,
            format!("remaining size {} outside (0, {}]", p.remaining_size, p.initial_size),
        ));
    }

    if p.take_profit_price.is_some() && p.trailing_trigger_price.is_some() {
        return Err(violation(p, "take-profit and trailing trigger both set"));
    }

    let sign = p.side.sign();
    if sign * (p.entry_price - p.stop_loss_price) <= 0.0 {
        return Err(violation(
            p,
            format!("stop-loss {} on the profit side of entry {}", p.stop_loss_price, p.entry_price),
        ));
    }
    if let Some(tp) = p.take_profit_price {
        if sign * (tp - p.entry_price) <= 0.0 {
            return Err(violation(
                p,
                format!("take-profit {tp} on the loss side of entry {}", p.entry_price),
            ));
        }
    }
    if p.trailing_trigger_price.is_some() && p.trailing_trigger_price != p.tp1_fill_price {
        return Err(violation(p, "trailing trigger differs from TP1 fill price"));
    }
    Ok(())
}

fn require_stage(p: &Position, expected: Stage, action: &'static str) -> EngineResult<()> {
    if p.stage != expected {
        return Err(EngineError::InvalidStageTransition {
            symbol: p.symbol.clone(),
            from: p.stage,
            action,
        });
    }
    Ok(())
}

/// Detach a live order from the position and queue its cancellation.
fn cancel_order(p: &mut Position, kind: OrderKind, commands: &mut Vec<ProtectionCommand>) {
    if let Some(handle) = p.orders.slot_mut(kind).take() {
        commands.push(ProtectionCommand::Cancel { kind, handle });
    }
}

fn place_stop_loss(p: &Position) -> ProtectionCommand {
    ProtectionCommand::Place(OrderRequest {
        kind: OrderKind::StopLoss,
        symbol: p.symbol.clone(),
        side: p.side,
        trigger_price: p.stop_loss_price,
        size: p.remaining_size,
        callback_fraction: None,
        client_id: new_client_id(),
    })
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LedgerInner {
    open: HashMap<String, Position>,
    closed: Vec<Position>,
    orders: HashMap<OrderHandle, OrderRef>,
}

impl LedgerInner {
    fn has_history(&self, symbol: &str) -> bool {
        self.open.contains_key(symbol) || self.closed.iter().any(|p| p.symbol == symbol)
    }

    fn lookup_open(&self, symbol: &str) -> EngineResult<&Position> {
        if let Some(p) = self.open.get(symbol) {
            return Ok(p);
        }
        if self.closed.iter().any(|p| p.symbol == symbol) {
            return Err(EngineError::StaleEvent {
                symbol: symbol.to_string(),
                detail: "position already closed".to_string(),
            });
        }
        Err(EngineError::PositionNotFound(symbol.to_string()))
    }

    fn commit(&mut self, next: Position, commands: &[ProtectionCommand]) {
        for cmd in commands {
            if let ProtectionCommand::Cancel { handle, .. } = cmd {
                self.orders.remove(handle);
            }
        }
        if next.is_closed() {
            self.open.remove(&next.symbol);
            self.orders.retain(|_, r| r.position_id != next.id);
            self.closed.push(next);
        } else {
            self.open.insert(next.symbol.clone(), next);
        }
    }
}

/// Thread-safe single source of truth for positions.
pub struct PositionLedger {
    inner: RwLock<LedgerInner>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(LedgerInner::default()),
        }
    }

    /// Apply `f` to a copy of the open position for `symbol`, validate and
    /// commit it.
    fn mutate<F>(&self, symbol: &str, f: F) -> EngineResult<Transition>
    where
        F: FnOnce(&mut Position, &mut Vec<ProtectionCommand>) -> EngineResult<()>,
    {
        let mut inner = self.inner.write();
        let mut next = inner.lookup_open(symbol)?.clone();
        let mut commands = Vec::new();
        f(&mut next, &mut commands)?;
        check_invariants(&next)?;
        inner.commit(next.clone(), &commands);
        Ok(Transition {
            position: next,
            commands,
        })
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    /// Register a new position at OPENED. Returns the commands placing the
    /// full-size stop-loss and take-profit.
    pub fn open(
        &self,
        symbol: &str,
        side: Side,
        entry_price: f64,
        leverage: u32,
        size: f64,
        plan: &ExitPlan,
    ) -> EngineResult<Transition> {
        if !entry_price.is_finite() || entry_price <= 0.0 {
            return Err(EngineError::InvalidRiskParameter(format!(
                "entry price must be positive, got {entry_price}"
            )));
        }
        if !size.is_finite() || size <= 0.0 {
            return Err(EngineError::InvalidRiskParameter(format!(
                "size must be positive, got {size}"
            )));
        }
        if leverage == 0 {
            return Err(EngineError::InvalidRiskParameter(
                "leverage must be >= 1".to_string(),
            ));
        }
        if plan.side != side || plan.entry_price != entry_price || plan.leverage != leverage {
            return Err(EngineError::InvalidExitPlan(format!(
                "plan for {} {}x @ {} does not match {} {}x @ {}",
                plan.side, plan.leverage, plan.entry_price, side, leverage, entry_price
            )));
        }

        let position = Position {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            entry_price,
            leverage,
            initial_size: size,
            remaining_size: size,
            stage: Stage::Opened,
            stop_loss_price: plan.stop_loss_price,
            take_profit_price: Some(plan.take_profit_price),
            trailing_trigger_price: None,
            trailing_callback_fraction: plan.trailing_callback_fraction,
            tp1_close_fraction: plan.tp1_close_fraction,
            best_price_since_trailing: None,
            tp1_fill_price: None,
            exit_price: None,
            realized_pnl: 0.0,
            opened_at: Utc::now().to_rfc3339(),
            closed_at: None,
            close_reason: None,
            orders: ProtectiveOrders::default(),
            protection: ProtectionStatus::Pending,
        };
        check_invariants(&position)?;

        let mut inner = self.inner.write();
        if inner.open.contains_key(symbol) {
            return Err(EngineError::PositionAlreadyOpen(symbol.to_string()));
        }

        let commands = vec![
            place_stop_loss(&position),
            ProtectionCommand::Place(OrderRequest {
                kind: OrderKind::TakeProfit,
                symbol: position.symbol.clone(),
                side,
                trigger_price: plan.take_profit_price,
                size: position.initial_size,
                callback_fraction: None,
                client_id: new_client_id(),
            }),
        ];

        info!(
            id = %position.id,
            symbol,
            side = %side,
            entry_price,
            leverage,
            size,
            sl = position.stop_loss_price,
            tp1 = plan.take_profit_price,
            "position opened"
        );

        inner.open.insert(symbol.to_string(), position.clone());
        Ok(Transition { position, commands })
    }

    // -------------------------------------------------------------------------
    // Stage transitions
    // -------------------------------------------------------------------------

    /// OPENED -> TP1_FILLED. Closes `close_fraction` of the initial size and
    /// reissues the stop-loss on the remainder.
    pub fn record_tp1_fill(
        &self,
        symbol: &str,
        fill_price: f64,
        close_fraction: f64,
    ) -> EngineResult<Transition> {
        if !fill_price.is_finite() || fill_price <= 0.0 {
            return Err(EngineError::InvalidRiskParameter(format!(
                "fill price must be positive, got {fill_price}"
            )));
        }
        if !close_fraction.is_finite() || close_fraction <= 0.0 || close_fraction >= 1.0 {
            return Err(EngineError::InvalidRiskParameter(format!(
                "close fraction must lie in (0, 1), got {close_fraction}"
            )));
        }

        let transition = self.mutate(symbol, |p, commands| {
            require_stage(p, Stage::Opened, "record TP1 fill")?;

            let closed_size = p.initial_size * close_fraction;
            let would_be = p.remaining_size - closed_size;
            if would_be <= p.initial_size * 1e-12 {
                return Err(EngineError::SizeUnderflow {
                    symbol: p.symbol.clone(),
                    remaining: p.remaining_size,
                    would_be,
                });
            }

            p.realize(fill_price, closed_size);
            p.remaining_size = would_be;
            p.stage = Stage::Tp1Filled;
            p.take_profit_price = None;
            p.tp1_fill_price = Some(fill_price);
            p.protection = ProtectionStatus::Pending;

            cancel_order(p, OrderKind::StopLoss, commands);
            cancel_order(p, OrderKind::TakeProfit, commands);
            commands.push(place_stop_loss(p));
            Ok(())
        })?;

        let p = &transition.position;
        info!(
            id = %p.id,
            symbol,
            fill_price,
            remaining_size = p.remaining_size,
            realized_pnl = p.realized_pnl,
            "TP1 partial close recorded"
        );
        Ok(transition)
    }

    /// TP1_FILLED -> TRAILING_ACTIVE. The trailing trigger is the TP1 fill
    /// price itself.
    pub fn activate_trailing(&self, symbol: &str) -> EngineResult<Transition> {
        let transition = self.mutate(symbol, |p, commands| {
            require_stage(p, Stage::Tp1Filled, "activate trailing")?;
            let trigger = p
                .tp1_fill_price
                .ok_or_else(|| violation(p, "TP1 filled without a fill price"))?;

            p.trailing_trigger_price = Some(trigger);
            p.best_price_since_trailing = Some(trigger);
            p.stage = Stage::TrailingActive;
            p.protection = ProtectionStatus::Pending;

            commands.push(ProtectionCommand::Place(OrderRequest {
                kind: OrderKind::TrailingStop,
                symbol: p.symbol.clone(),
                side: p.side,
                trigger_price: trigger,
                size: p.remaining_size,
                callback_fraction: Some(p.trailing_callback_fraction),
                client_id: new_client_id(),
            }));
            Ok(())
        })?;

        let p = &transition.position;
        info!(
            id = %p.id,
            symbol,
            trigger = ?p.trailing_trigger_price,
            callback = p.trailing_callback_fraction,
            size = p.remaining_size,
            "trailing stop activated"
        );
        Ok(transition)
    }

    /// Move the best price seen while trailing. Returns `true` if it moved.
    pub fn update_trailing_extreme(&self, symbol: &str, price: f64) -> EngineResult<bool> {
        let mut inner = self.inner.write();
        let current = inner.lookup_open(symbol)?;
        require_stage(current, Stage::TrailingActive, "update trailing extreme")?;

        let side = current.side;
        let best = current.best_price_since_trailing;
        let improved = match best {
            None => true,
            Some(b) => side.sign() * (price - b) > 0.0,
        };
        if !improved || !price.is_finite() || price <= 0.0 {
            return Ok(false);
        }
        if let Some(p) = inner.open.get_mut(symbol) {
            p.best_price_since_trailing = Some(price);
            debug!(symbol, best = price, "trailing extreme moved");
        }
        Ok(true)
    }

    /// TRAILING_ACTIVE -> CLOSED by the trailing stop.
    pub fn record_trailing_fill(&self, symbol: &str, fill_price: f64) -> EngineResult<Transition> {
        let transition = self.mutate(symbol, |p, commands| {
            require_stage(p, Stage::TrailingActive, "record trailing fill")?;
            p.close_remainder(fill_price, CloseReason::TrailingStop);
            cancel_order(p, OrderKind::StopLoss, commands);
            cancel_order(p, OrderKind::TrailingStop, commands);
            Ok(())
        })?;
        log_closed(&transition.position);
        Ok(transition)
    }

    /// Any open stage -> CLOSED by the stop-loss.
    pub fn record_stop_loss_fill(&self, symbol: &str, fill_price: f64) -> EngineResult<Transition> {
        self.close_with(symbol, fill_price, CloseReason::StopLoss)
    }

    /// Any open stage -> CLOSED at market on operator request.
    pub fn record_manual_close(&self, symbol: &str, price: f64) -> EngineResult<Transition> {
        self.close_with(symbol, price, CloseReason::Manual)
    }

    fn close_with(&self, symbol: &str, price: f64, reason: CloseReason) -> EngineResult<Transition> {
        let transition = self.mutate(symbol, |p, commands| {
            p.close_remainder(price, reason);
            cancel_order(p, OrderKind::TakeProfit, commands);
            cancel_order(p, OrderKind::TrailingStop, commands);
            cancel_order(p, OrderKind::StopLoss, commands);
            Ok(())
        })?;
        log_closed(&transition.position);
        Ok(transition)
    }

    // -------------------------------------------------------------------------
    // Order bookkeeping
    // -------------------------------------------------------------------------

    /// Record a confirmed exchange order against the position it protects.
    pub fn attach_order(
        &self,
        position_id: &str,
        kind: OrderKind,
        handle: OrderHandle,
    ) -> EngineResult<()> {
        let mut inner = self.inner.write();
        let position = match inner.open.get_mut(&handle.symbol) {
            Some(p) if p.id == position_id => p,
            _ => {
                return Err(EngineError::StaleEvent {
                    symbol: handle.symbol.clone(),
                    detail: format!("position {position_id} no longer open for {kind} order"),
                })
            }
        };

        let slot = position.orders.slot_mut(kind);
        if let Some(existing) = slot.as_ref() {
            if existing != &handle {
                return Err(EngineError::InvariantViolation {
                    symbol: handle.symbol.clone(),
                    detail: format!("{kind} order {existing} already live"),
                });
            }
        }
        *slot = Some(handle.clone());

        let oref = OrderRef {
            position_id: position_id.to_string(),
            symbol: handle.symbol.clone(),
            kind,
        };
        inner.orders.insert(handle, oref);
        Ok(())
    }

    /// Look up the live order a fill refers to.
    pub fn resolve_fill(&self, handle: &OrderHandle) -> EngineResult<OrderRef> {
        let inner = self.inner.read();
        if let Some(r) = inner.orders.get(handle) {
            return Ok(r.clone());
        }
        if inner.has_history(&handle.symbol) {
            return Err(EngineError::StaleEvent {
                symbol: handle.symbol.clone(),
                detail: format!("order {handle} is no longer live"),
            });
        }
        Err(EngineError::UnknownOrder(handle.clone()))
    }

    /// Remove a filled order from the index and its position.
    pub fn consume_order(&self, handle: &OrderHandle) -> EngineResult<OrderRef> {
        let mut inner = self.inner.write();
        let oref = inner
            .orders
            .remove(handle)
            .ok_or_else(|| EngineError::UnknownOrder(handle.clone()))?;
        if let Some(p) = inner.open.get_mut(&oref.symbol) {
            let slot = p.orders.slot_mut(oref.kind);
            if slot.as_ref() == Some(handle) {
                *slot = None;
            }
        }
        Ok(oref)
    }

    pub fn mark_protected(&self, symbol: &str) -> EngineResult<()> {
        let mut inner = self.inner.write();
        inner.lookup_open(symbol)?;
        if let Some(p) = inner.open.get_mut(symbol) {
            p.protection = ProtectionStatus::Protected;
        }
        Ok(())
    }

    pub fn mark_unprotected(&self, symbol: &str, reason: &str) -> EngineResult<()> {
        let mut inner = self.inner.write();
        inner.lookup_open(symbol)?;
        if let Some(p) = inner.open.get_mut(symbol) {
            warn!(id = %p.id, symbol, reason, "position marked unprotected");
            p.protection = ProtectionStatus::Unprotected {
                reason: reason.to_string(),
            };
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Open position for `symbol`, or the most recently closed one.
    pub fn get_position(&self, symbol: &str) -> Option<Position> {
        let inner = self.inner.read();
        inner
            .open
            .get(symbol)
            .or_else(|| inner.closed.iter().rev().find(|p| p.symbol == symbol))
            .cloned()
    }

    pub fn open_position(&self, symbol: &str) -> Option<Position> {
        self.inner.read().open.get(symbol).cloned()
    }

    /// Snapshot of all open positions, ordered by symbol.
    pub fn list_open_positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.inner.read().open.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    /// Closed positions, newest first.
    pub fn list_closed_positions(&self) -> Vec<Position> {
        self.inner.read().closed.iter().rev().cloned().collect()
    }

    pub fn live_order_count(&self) -> usize {
        self.inner.read().orders.len()
    }
}

fn log_closed(p: &Position) {
    info!(
        id = %p.id,
        symbol = %p.symbol,
        reason = ?p.close_reason,
        exit_price = ?p.exit_price,
        realized_pnl = p.realized_pnl,
        "position closed"
    );
}

impl Default for PositionLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("PositionLedger")
            .field("open_positions", &inner.open.len())
            .field("closed_positions", &inner.closed.len())
            .field("live_orders", &inner.orders.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
