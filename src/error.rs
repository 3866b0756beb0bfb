// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// Calculation errors (risk parameters, exit plans) fail closed: the position
// never opens. Stage errors indicate an upstream logic bug and must not be
// retried blindly. Stale events are expected under at-least-once delivery and
// are dropped by the engine loop. Gateway errors are retried before being
// escalated as `Unprotected`.
// =============================================================================

use thiserror::Error;

use crate::types::{OrderHandle, Stage};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("invalid risk parameter: {0}")]
    InvalidRiskParameter(String),

    #[error("invalid exit plan: {0}")]
    InvalidExitPlan(String),

    #[error("invalid stage transition for {symbol}: cannot {action} from {from}")]
    InvalidStageTransition {
        symbol: String,
        from: Stage,
        action: &'static str,
    },

    #[error("stale event for {symbol}: {detail}")]
    StaleEvent { symbol: String, detail: String },

    #[error("gateway did not confirm {operation} after {attempts} attempts")]
    GatewayTimeout { operation: String, attempts: u32 },

    #[error("gateway error during {operation}: {message}")]
    Gateway { operation: String, message: String },

    #[error("UNPROTECTED — MANUAL INTERVENTION REQUIRED for {symbol}: {reason}")]
    Unprotected { symbol: String, reason: String },

    #[error("no position for {0}")]
    PositionNotFound(String),

    #[error("position already open for {0}")]
    PositionAlreadyOpen(String),

    #[error("unknown order handle {0}")]
    UnknownOrder(OrderHandle),

    #[error("remaining size of {symbol} would drop to {would_be} (remaining {remaining})")]
    SizeUnderflow {
        symbol: String,
        remaining: f64,
        would_be: f64,
    },

    #[error("position invariant violated for {symbol}: {detail}")]
    InvariantViolation { symbol: String, detail: String },

    #[error("engine stopped")]
    EngineStopped,
}

impl EngineError {
    /// Stale events are recovered locally as no-ops.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleEvent { .. })
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
