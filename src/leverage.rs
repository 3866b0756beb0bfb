// =============================================================================
// Leverage Conversion — capital-relative <-> price-relative percentages
// =============================================================================
//
// A price move of p against a position leveraged L× moves margin by p × L.
// To target a capital outcome the price distance is therefore the capital
// target DIVIDED by leverage. Multiplying here instead silently scales every
// stop by L², so both directions refuse bad input rather than clamping it.
//
// All percentages are fractions: 0.5 means 50 %.
// =============================================================================

use crate::error::{EngineError, EngineResult};

fn check_leverage(leverage: u32) -> EngineResult<()> {
    if leverage == 0 {
        return Err(EngineError::InvalidRiskParameter(
            "leverage must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn check_pct(name: &str, value: f64) -> EngineResult<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(EngineError::InvalidRiskParameter(format!(
            "{name} must be a positive finite fraction, got {value}"
        )));
    }
    Ok(())
}

/// Price distance (fraction of entry) that produces `capital_pct` of margin
/// at `leverage`.
pub fn capital_pct_to_price_pct(capital_pct: f64, leverage: u32) -> EngineResult<f64> {
    check_pct("capital_pct", capital_pct)?;
    check_leverage(leverage)?;
    Ok(capital_pct / leverage as f64)
}

/// Margin outcome (fraction of capital) of a `price_pct` move at `leverage`.
pub fn price_pct_to_capital_pct(price_pct: f64, leverage: u32) -> EngineResult<f64> {
    check_pct("price_pct", price_pct)?;
    check_leverage(leverage)?;
    Ok(price_pct * leverage as f64)
}
