// =============================================================================
// Exit Planner — stop-loss, TP1 and trailing parameters for a new position
// =============================================================================
//
// Targets are expressed as capital-relative fractions (share of margin) and
// converted to price distances through the leverage converter.
//
// Volatility (ATR) adjustments are one-directional:
//   - Stop-loss: an ATR candidate may only WIDEN the stop (farther from entry).
//   - Take-profit: an ATR candidate may only TIGHTEN the target (closer to
//     entry), so the realised ROI never falls below the capital baseline and a
//     target never drifts out to an ROI that rarely fills.
//
// The trailing callback is already price-relative and is stored untouched.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::leverage::capital_pct_to_price_pct;
use crate::types::Side;

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_stop_loss_capital_pct() -> f64 {
    0.5
}

fn default_take_profit_capital_pct() -> f64 {
    0.025
}

fn default_trailing_callback_fraction() -> f64 {
    0.03
}

fn default_tp1_close_fraction() -> f64 {
    0.75
}

// =============================================================================
// ExitPlanConfig
// =============================================================================

/// Risk configuration that drives the planner. Every percentage is a fraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitPlanConfig {
    /// Share of margin lost when the stop-loss fills (0.5 = 50 %).
    #[serde(default = "default_stop_loss_capital_pct")]
    pub stop_loss_capital_pct: f64,

    /// Share of margin gained when TP1 fills (0.025 = 2.5 %).
    #[serde(default = "default_take_profit_capital_pct")]
    pub take_profit_capital_pct: f64,

    /// Price-relative trailing distance (0.03 = 3 %).
    #[serde(default = "default_trailing_callback_fraction")]
    pub trailing_callback_fraction: f64,

    /// Fraction of the initial size closed at TP1.
    #[serde(default = "default_tp1_close_fraction")]
    pub tp1_close_fraction: f64,

    /// ATR multiple for the widening-only stop candidate. `None` disables it.
    #[serde(default)]
    pub sl_atr_multiplier: Option<f64>,

    /// ATR multiple for the tightening-only TP1 candidate. `None` disables it.
    #[serde(default)]
    pub tp_atr_multiplier: Option<f64>,
}

impl Default for ExitPlanConfig {
    fn default() -> Self {
        Self {
            stop_loss_capital_pct: default_stop_loss_capital_pct(),
            take_profit_capital_pct: default_take_profit_capital_pct(),
            trailing_callback_fraction: default_trailing_callback_fraction(),
            tp1_close_fraction: default_tp1_close_fraction(),
            sl_atr_multiplier: None,
            tp_atr_multiplier: None,
        }
    }
}

fn check_fraction(name: &str, value: f64) -> EngineResult<()> {
    if !value.is_finite() || value <= 0.0 || value >= 1.0 {
        return Err(EngineError::InvalidExitPlan(format!(
            "{name} must lie in (0, 1), got {value}"
        )));
    }
    Ok(())
}

fn check_positive(name: &str, value: f64) -> EngineResult<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(EngineError::InvalidExitPlan(format!(
            "{name} must be positive, got {value}"
        )));
    }
    Ok(())
}

impl ExitPlanConfig {
    /// Validate the configuration on its own (no entry context). Called at
    /// config-load time and again by the planner.
    pub fn validate(&self) -> EngineResult<()> {
        check_fraction("stop_loss_capital_pct", self.stop_loss_capital_pct)?;
        check_positive("take_profit_capital_pct", self.take_profit_capital_pct)?;
        check_fraction("trailing_callback_fraction", self.trailing_callback_fraction)?;
        check_fraction("tp1_close_fraction", self.tp1_close_fraction)?;
        if let Some(m) = self.sl_atr_multiplier {
            check_positive("sl_atr_multiplier", m)?;
        }
        if let Some(m) = self.tp_atr_multiplier {
            check_positive("tp_atr_multiplier", m)?;
        }
        Ok(())
    }
}

// =============================================================================
// Performance tiers
// =============================================================================

/// Per-symbol performance bucket selecting which exit configuration applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTier {
    Conservative,
    #[default]
    Standard,
    Aggressive,
}

impl std::fmt::Display for PerformanceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conservative => write!(f, "conservative"),
            Self::Standard => write!(f, "standard"),
            Self::Aggressive => write!(f, "aggressive"),
        }
    }
}

fn default_conservative() -> ExitPlanConfig {
    ExitPlanConfig {
        stop_loss_capital_pct: 0.3,
        take_profit_capital_pct: 0.02,
        trailing_callback_fraction: 0.02,
        ..ExitPlanConfig::default()
    }
}

fn default_aggressive() -> ExitPlanConfig {
    ExitPlanConfig {
        stop_loss_capital_pct: 0.6,
        take_profit_capital_pct: 0.05,
        trailing_callback_fraction: 0.04,
        tp1_close_fraction: 0.6,
        ..ExitPlanConfig::default()
    }
}

/// Exit configuration per tier. Lookup is pure; nothing mutates it at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierTable {
    #[serde(default = "default_conservative")]
    pub conservative: ExitPlanConfig,
    #[serde(default)]
    pub standard: ExitPlanConfig,
    #[serde(default = "default_aggressive")]
    pub aggressive: ExitPlanConfig,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            conservative: default_conservative(),
            standard: ExitPlanConfig::default(),
            aggressive: default_aggressive(),
        }
    }
}

impl TierTable {
    pub fn plan_for(&self, tier: PerformanceTier) -> &ExitPlanConfig {
        match tier {
            PerformanceTier::Conservative => &self.conservative,
            PerformanceTier::Standard => &self.standard,
            PerformanceTier::Aggressive => &self.aggressive,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        for tier in [
            PerformanceTier::Conservative,
            PerformanceTier::Standard,
            PerformanceTier::Aggressive,
        ] {
            self.plan_for(tier).validate().map_err(|e| match e {
                EngineError::InvalidExitPlan(msg) => {
                    EngineError::InvalidExitPlan(format!("tier {tier}: {msg}"))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}

// =============================================================================
// ExitPlan
// =============================================================================

/// Protective price targets computed for one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitPlan {
    pub entry_price: f64,
    pub side: Side,
    pub leverage: u32,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub trailing_callback_fraction: f64,
    pub tp1_close_fraction: f64,
    /// Capital-only targets before any ATR adjustment (kept for audit).
    pub baseline_stop_loss_price: f64,
    pub baseline_take_profit_price: f64,
}

impl ExitPlan {
    /// Geometric check: SL on the loss side, TP on the profit side, both
    /// strictly positive.
    fn assert_geometry(&self) -> EngineResult<()> {
        let (sl, tp, entry) = (self.stop_loss_price, self.take_profit_price, self.entry_price);
        if !(sl.is_finite() && tp.is_finite()) || sl <= 0.0 || tp <= 0.0 {
            return Err(EngineError::InvalidExitPlan(format!(
                "non-positive target: sl={sl} tp={tp}"
            )));
        }
        let ok = match self.side {
            Side::Long => sl < entry && entry < tp,
            Side::Short => tp < entry && entry < sl,
        };
        if !ok {
            return Err(EngineError::InvalidExitPlan(format!(
                "{} plan has targets on the wrong side of entry {entry}: sl={sl} tp={tp}",
                self.side
            )));
        }
        Ok(())
    }
}

// =============================================================================
// ExitPlanner
// =============================================================================

pub struct ExitPlanner;

impl ExitPlanner {
    /// Compute the exit plan for an entry.
    ///
    /// `atr` is in price units; it only matters if the config carries the
    /// corresponding multiplier.
    pub fn plan(
        entry_price: f64,
        side: Side,
        leverage: u32,
        config: &ExitPlanConfig,
        atr: Option<f64>,
    ) -> EngineResult<ExitPlan> {
        if !entry_price.is_finite() || entry_price <= 0.0 {
            return Err(EngineError::InvalidExitPlan(format!(
                "entry price must be positive, got {entry_price}"
            )));
        }
        if leverage < 1 {
            return Err(EngineError::InvalidExitPlan(
                "leverage must be >= 1".to_string(),
            ));
        }
        config.validate()?;
        if let Some(a) = atr {
            check_positive("atr", a)?;
        }

        let sl_price_pct = capital_pct_to_price_pct(config.stop_loss_capital_pct, leverage)?;
        let tp_price_pct = capital_pct_to_price_pct(config.take_profit_capital_pct, leverage)?;

        let sign = side.sign();
        let sl_baseline = entry_price * (1.0 - sign * sl_price_pct);
        let tp_baseline = entry_price * (1.0 + sign * tp_price_pct);

        let mut stop_loss_price = sl_baseline;
        if let (Some(atr), Some(mult)) = (atr, config.sl_atr_multiplier) {
            let candidate = entry_price - sign * mult * atr;
            if candidate <= 0.0 {
                warn!(
                    side = %side,
                    entry_price,
                    candidate,
                    "ATR stop candidate is non-positive, keeping capital baseline"
                );
            } else {
                // Farther from entry on the loss side wins.
                stop_loss_price = match side {
                    Side::Long => candidate.min(sl_baseline),
                    Side::Short => candidate.max(sl_baseline),
                };
            }
        }

        let mut take_profit_price = tp_baseline;
        if let (Some(atr), Some(mult)) = (atr, config.tp_atr_multiplier) {
            let candidate = entry_price + sign * mult * atr;
            if candidate <= 0.0 {
                warn!(
                    side = %side,
                    entry_price,
                    candidate,
                    "ATR take-profit candidate is non-positive, keeping capital baseline"
                );
            } else {
                // Closer to entry wins; never beyond the baseline.
                take_profit_price = match side {
                    Side::Long => candidate.min(tp_baseline),
                    Side::Short => candidate.max(tp_baseline),
                };
            }
        }

        let plan = ExitPlan {
            entry_price,
            side,
            leverage,
            stop_loss_price,
            take_profit_price,
            trailing_callback_fraction: config.trailing_callback_fraction,
            tp1_close_fraction: config.tp1_close_fraction,
            baseline_stop_loss_price: sl_baseline,
            baseline_take_profit_price: tp_baseline,
        };
        plan.assert_geometry()?;

        debug!(
            side = %side,
            entry_price,
            leverage,
            sl = format!("{:.6}", plan.stop_loss_price),
            tp1 = format!("{:.6}", plan.take_profit_price),
            callback = plan.trailing_callback_fraction,
            "exit plan computed"
        );

        Ok(plan)
    }
}

// =============================================================================
// Tests
// =============================================================================
