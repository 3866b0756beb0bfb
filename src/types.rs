// =============================================================================
// Shared types used across the trailguard exit engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a leveraged position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for longs, -1 for shorts. Multiplying a price delta by this turns it
    /// into a favourable-is-positive delta.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Exchange order side that reduces a position of this direction.
    pub fn closing_order_side(self) -> &'static str {
        match self {
            Self::Long => "SELL",
            Self::Short => "BUY",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Lifecycle stage of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Opened,
    Tp1Filled,
    TrailingActive,
    Closed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opened => write!(f, "OPENED"),
            Self::Tp1Filled => write!(f, "TP1_FILLED"),
            Self::TrailingActive => write!(f, "TRAILING_ACTIVE"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Whether we are running against real funds or simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Kind of protective order resting on the exchange for a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderKind {
    StopLoss,
    TakeProfit,
    TrailingStop,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "SL"),
            Self::TakeProfit => write!(f, "TP1"),
            Self::TrailingStop => write!(f, "TRAIL"),
        }
    }
}

/// Exchange-assigned reference to a placed order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderHandle {
    pub symbol: String,
    pub order_id: String,
}

impl OrderHandle {
    pub fn new(symbol: impl Into<String>, order_id: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            order_id: order_id.into(),
        }
    }
}

impl std::fmt::Display for OrderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.symbol, self.order_id)
    }
}

/// One price observation. `low`/`high` bound everything traded during the
/// tick; for a single mark price both equal `price`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub price: f64,
    pub low: f64,
    pub high: f64,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: i64,
}

impl PriceTick {
    pub fn point(symbol: impl Into<String>, price: f64, timestamp: i64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            low: price,
            high: price,
            timestamp,
        }
    }

    pub fn range(symbol: impl Into<String>, low: f64, high: f64, price: f64, timestamp: i64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            low,
            high,
            timestamp,
        }
    }

    pub fn is_valid(&self) -> bool {
        [self.price, self.low, self.high]
            .iter()
            .all(|p| p.is_finite() && *p > 0.0)
            && self.low <= self.price
            && self.price <= self.high
    }

    /// Most adverse price of the tick for a position on `side`.
    pub fn adverse(&self, side: Side) -> f64 {
        match side {
            Side::Long => self.low,
            Side::Short => self.high,
        }
    }

    /// Most favourable price of the tick for a position on `side`.
    pub fn favorable(&self, side: Side) -> f64 {
        match side {
            Side::Long => self.high,
            Side::Short => self.low,
        }
    }
}

/// Fill notification delivered by the exchange gateway.
///
/// `sequence`, when present, numbers the fills of one position starting at 1
/// in the order the exchange executed them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub handle: OrderHandle,
    pub fill_price: f64,
    pub filled_size: f64,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub sequence: Option<u64>,
}
