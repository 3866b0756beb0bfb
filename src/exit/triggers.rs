// =============================================================================
// Exit Triggers — which protective level a price tick crosses
// =============================================================================
//
// Evaluation order per tick:
//   1. Stop-loss on the adverse extreme of the tick (wins any tie)
//   2. OPENED:          TP1 on the favourable extreme
//   3. TRAILING_ACTIVE: trailing stop derived from the best price BEFORE this
//                       tick, checked on the adverse extreme
//
// Stops fill at the tick price or the stop level, whichever is worse for the
// position. TP1 fills at its level.
// =============================================================================

use crate::position_engine::Position;
use crate::types::{PriceTick, Side, Stage};

/// Relative tolerance when comparing a price to a level.
const CROSS_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitTrigger {
    StopLoss { fill_price: f64 },
    TakeProfit { fill_price: f64 },
    TrailingStop { fill_price: f64, stop_price: f64 },
}

/// Stop level of a trailing stop `callback` away from `best`.
pub fn trailing_stop_price(side: Side, best: f64, callback: f64) -> f64 {
    match side {
        Side::Long => best * (1.0 - callback),
        Side::Short => best * (1.0 + callback),
    }
}

/// `price` is at or beyond `level` on the loss side.
fn crossed_adverse(side: Side, price: f64, level: f64) -> bool {
    let tol = level.abs() * CROSS_EPSILON;
    match side {
        Side::Long => price <= level + tol,
        Side::Short => price >= level - tol,
    }
}

/// `price` is at or beyond `level` on the profit side.
fn crossed_favorable(side: Side, price: f64, level: f64) -> bool {
    let tol = level.abs() * CROSS_EPSILON;
    match side {
        Side::Long => price >= level - tol,
        Side::Short => price <= level + tol,
    }
}

fn worse_of(side: Side, a: f64, b: f64) -> f64 {
    match side {
        Side::Long => a.min(b),
        Side::Short => a.max(b),
    }
}

/// Evaluate one tick against an open position. `None` means nothing fired.
pub fn evaluate(position: &Position, tick: &PriceTick) -> Option<ExitTrigger> {
    if position.stage == Stage::Closed {
        return None;
    }
    let side = position.side;
    let adverse = tick.adverse(side);
    let favorable = tick.favorable(side);

    if crossed_adverse(side, adverse, position.stop_loss_price) {
        return Some(ExitTrigger::StopLoss {
            fill_price: worse_of(side, tick.price, position.stop_loss_price),
        });
    }

    match position.stage {
        Stage::Opened => {
            let tp = position.take_profit_price?;
            crossed_favorable(side, favorable, tp).then_some(ExitTrigger::TakeProfit { fill_price: tp })
        }
        Stage::TrailingActive => {
            let best = position.best_price_since_trailing?;
            let stop = trailing_stop_price(side, best, position.trailing_callback_fraction);
            crossed_adverse(side, adverse, stop).then_some(ExitTrigger::TrailingStop {
                fill_price: worse_of(side, tick.price, stop),
                stop_price: stop,
            })
        }
        Stage::Tp1Filled | Stage::Closed => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::planner::{ExitPlanConfig, ExitPlanner};
    use crate::position_engine::PositionLedger;

    fn opened(side: Side) -> (PositionLedger, Position) {
        let ledger = PositionLedger::new();
        let plan = ExitPlanner::plan(100_000.0, side, 25, &ExitPlanConfig::default(), None).unwrap();
        let p = ledger.open("BTCUSDT", side, 100_000.0, 25, 1.0, &plan).unwrap().position;
        (ledger, p)
    }

    fn trailing_long() -> (PositionLedger, Position) {
        let (ledger, _) = opened(Side::Long);
        ledger.record_tp1_fill("BTCUSDT", 100_100.0, 0.75).unwrap();
        let p = ledger.activate_trailing("BTCUSDT").unwrap().position;
        (ledger, p)
    }

    fn tick(price: f64) -> PriceTick {
        PriceTick::point("BTCUSDT", price, 0)
    }

    #[test]
    fn quiet_tick_fires_nothing() {
        let (_, p) = opened(Side::Long);
        assert_eq!(evaluate(&p, &tick(100_050.0)), None);
    }

    #[test]
    fn take_profit_fills_at_level() {
        let (_, p) = opened(Side::Long);
        match evaluate(&p, &tick(100_150.0)) {
            Some(ExitTrigger::TakeProfit { fill_price }) => {
                assert!((fill_price - 100_100.0).abs() < 1e-6)
            }
            other => panic!("expected TP1, got {other:?}"),
        }

        let (_, p) = opened(Side::Short);
        assert!(matches!(
            evaluate(&p, &tick(99_850.0)),
            Some(ExitTrigger::TakeProfit { .. })
        ));
    }

    #[test]
    fn stop_loss_fills_at_worse_price() {
        let (_, p) = opened(Side::Long);
        match evaluate(&p, &tick(97_500.0)) {
            Some(ExitTrigger::StopLoss { fill_price }) => assert_eq!(fill_price, 97_500.0),
            other => panic!("expected SL, got {other:?}"),
        }

        let (_, p) = opened(Side::Short);
        match evaluate(&p, &tick(102_500.0)) {
            Some(ExitTrigger::StopLoss { fill_price }) => assert_eq!(fill_price, 102_500.0),
            other => panic!("expected SL, got {other:?}"),
        }
    }

    #[test]
    fn gap_through_both_levels_resolves_to_stop_loss() {
        let (_, p) = opened(Side::Long);
        let gap = PriceTick::range("BTCUSDT", 97_900.0, 100_200.0, 99_000.0, 0);
        match evaluate(&p, &gap) {
            Some(ExitTrigger::StopLoss { fill_price }) => {
                assert!((fill_price - 98_000.0).abs() < 1e-6)
            }
            other => panic!("expected SL, got {other:?}"),
        }
    }

    #[test]
    fn trailing_stop_follows_best_price() {
        let (ledger, _) = trailing_long();
        ledger.update_trailing_extreme("BTCUSDT", 102_000.0).unwrap();
        let p = ledger.open_position("BTCUSDT").unwrap();

        let stop = trailing_stop_price(Side::Long, 102_000.0, 0.03);
        assert!((stop - 98_940.0).abs() < 1e-6);

        assert_eq!(evaluate(&p, &tick(98_950.0)), None);
        match evaluate(&p, &tick(98_900.0)) {
            Some(ExitTrigger::TrailingStop { fill_price, stop_price }) => {
                assert!((stop_price - 98_940.0).abs() < 1e-6);
                assert_eq!(fill_price, 98_900.0);
            }
            other => panic!("expected trailing stop, got {other:?}"),
        }
    }

    #[test]
    fn tp1_filled_is_transient_and_only_checks_stop() {
        let (ledger, _) = opened(Side::Long);
        let p = ledger.record_tp1_fill("BTCUSDT", 100_100.0, 0.75).unwrap().position;
        assert_eq!(evaluate(&p, &tick(101_000.0)), None);
        assert!(matches!(
            evaluate(&p, &tick(97_000.0)),
            Some(ExitTrigger::StopLoss { .. })
        ));
    }

    #[test]
    fn short_trailing_stop_sits_above_best() {
        assert!((trailing_stop_price(Side::Short, 99_000.0, 0.03) - 101_970.0).abs() < 1e-6);
    }
}
