// =============================================================================
// Trade Journal — one JSON line per closed position
// =============================================================================

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::position_engine::{CloseReason, Position};
use crate::types::Side;

/// Flat record of a finished trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub leverage: u32,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub tp1_fill_price: Option<f64>,
    pub initial_size: f64,
    pub tp1_close_fraction: f64,
    pub realized_pnl: f64,
    /// Realized PnL as a fraction of the margin committed at entry.
    pub roi_on_margin: f64,
    pub close_reason: Option<CloseReason>,
    pub opened_at: String,
    pub closed_at: Option<String>,
}

impl From<&Position> for TradeRecord {
    fn from(p: &Position) -> Self {
        let margin = p.margin();
        Self {
            id: p.id.clone(),
            symbol: p.symbol.clone(),
            side: p.side,
            leverage: p.leverage,
            entry_price: p.entry_price,
            exit_price: p.exit_price,
            tp1_fill_price: p.tp1_fill_price,
            initial_size: p.initial_size,
            tp1_close_fraction: p.tp1_close_fraction,
            realized_pnl: p.realized_pnl,
            roi_on_margin: if margin > 0.0 { p.realized_pnl / margin } else { 0.0 },
            close_reason: p.close_reason,
            opened_at: p.opened_at.clone(),
            closed_at: p.closed_at.clone(),
        }
    }
}

/// Append-only JSONL writer. Writes are serialized through a mutex.
pub struct TradeJournal {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TradeJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, position: &Position) -> Result<()> {
        let record = TradeRecord::from(position);
        let mut line = serde_json::to_string(&record).context("failed to serialise trade record")?;
        line.push('\n');

        let _guard = self.lock.lock();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open trade journal {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append to trade journal {}", self.path.display()))?;

        debug!(id = %record.id, symbol = %record.symbol, "trade journaled");
        Ok(())
    }

    /// Read every record back, skipping blank lines.
    pub fn read_all(&self) -> Result<Vec<TradeRecord>> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read trade journal {}", self.path.display()))?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(i, l)| {
                serde_json::from_str(l)
                    .with_context(|| format!("bad trade journal line {}", i + 1))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::planner::{ExitPlanConfig, ExitPlanner};
    use crate::position_engine::PositionLedger;

    fn closed_long() -> Position {
        let ledger = PositionLedger::new();
        let plan = ExitPlanner::plan(100_000.0, Side::Long, 25, &ExitPlanConfig::default(), None)
            .unwrap();
        ledger.open("BTCUSDT", Side::Long, 100_000.0, 25, 1.0, &plan).unwrap();
        ledger.record_tp1_fill("BTCUSDT", 100_100.0, 0.75).unwrap();
        ledger.activate_trailing("BTCUSDT").unwrap();
        ledger.record_trailing_fill("BTCUSDT", 101_000.0).unwrap().position
    }

    #[test]
    fn record_projects_roi_on_margin() {
        let p = closed_long();
        let r = TradeRecord::from(&p);
        // 75 + 250 on a 4 000 margin.
        assert!((r.realized_pnl - 325.0).abs() < 1e-6);
        assert!((r.roi_on_margin - 325.0 / 4_000.0).abs() < 1e-9);
        assert_eq!(r.close_reason, Some(CloseReason::TrailingStop));
        assert_eq!(r.exit_price, Some(101_000.0));
    }

    #[test]
    fn appends_one_line_per_trade() {
        let path = std::env::temp_dir().join(format!("trailguard-journal-{}.jsonl", uuid::Uuid::new_v4()));
        let journal = TradeJournal::new(&path);
        let p = closed_long();
        journal.append(&p).unwrap();
        journal.append(&p).unwrap();

        let records = journal.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, p.id);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
        let _ = std::fs::remove_file(&path);
    }
}
