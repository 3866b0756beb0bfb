// =============================================================================
// Engine health — counters and alarms polled by supervisors
// =============================================================================
//
// Status levels:
//   Critical  engine loop stopped, or a position is UNPROTECTED
//   Degraded  an open position's price feed has gone quiet
//   Ok        otherwise
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnprotectedEntry {
    pub symbol: String,
    pub reason: String,
}

/// Point-in-time view returned by `health()`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub status: HealthStatus,
    pub engine_running: bool,
    pub open_positions: usize,
    /// Protective orders the ledger tracks as resting on the exchange.
    pub live_orders: usize,
    pub ticks_processed: u64,
    pub fills_processed: u64,
    pub stale_events: u64,
    pub gateway_failures: u64,
    pub unprotected: Vec<UnprotectedEntry>,
    pub stale_feeds: Vec<String>,
    pub last_error: Option<String>,
    pub uptime_secs: u64,
}

pub struct HealthMonitor {
    started: Instant,
    stale_tick_ms: i64,
    engine_running: AtomicBool,
    ticks_processed: AtomicU64,
    fills_processed: AtomicU64,
    stale_events: AtomicU64,
    gateway_failures: AtomicU64,
    last_tick_ms: RwLock<HashMap<String, i64>>,
    unprotected: RwLock<HashMap<String, String>>,
    last_error: RwLock<Option<String>>,
}

impl HealthMonitor {
    pub fn new(stale_tick_secs: u64) -> Self {
        Self {
            started: Instant::now(),
            stale_tick_ms: (stale_tick_secs as i64).saturating_mul(1000),
            engine_running: AtomicBool::new(false),
            ticks_processed: AtomicU64::new(0),
            fills_processed: AtomicU64::new(0),
            stale_events: AtomicU64::new(0),
            gateway_failures: AtomicU64::new(0),
            last_tick_ms: RwLock::new(HashMap::new()),
            unprotected: RwLock::new(HashMap::new()),
            last_error: RwLock::new(None),
        }
    }

    pub fn set_running(&self, running: bool) {
        self.engine_running.store(running, Ordering::SeqCst);
    }

    pub fn record_tick(&self, symbol: &str, timestamp_ms: i64) {
        self.ticks_processed.fetch_add(1, Ordering::Relaxed);
        self.last_tick_ms.write().insert(symbol.to_string(), timestamp_ms);
    }

    pub fn record_fill(&self) {
        self.fills_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_event(&self) {
        self.stale_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gateway_failure(&self, error: &str) {
        self.gateway_failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write() = Some(error.to_string());
    }

    pub fn mark_unprotected(&self, symbol: &str, reason: &str) {
        self.unprotected
            .write()
            .insert(symbol.to_string(), reason.to_string());
        *self.last_error.write() = Some(format!("{symbol}: {reason}"));
    }

    /// Clear an alarm once the position is protected again or closed.
    pub fn clear_unprotected(&self, symbol: &str) {
        self.unprotected.write().remove(symbol);
    }

    /// Build a snapshot. `open_symbols` are the symbols with an open
    /// position; only their feeds count towards staleness.
    pub fn snapshot(&self, open_symbols: &[String], now_ms: i64) -> EngineHealth {
        let engine_running = self.engine_running.load(Ordering::SeqCst);

        let mut unprotected: Vec<UnprotectedEntry> = self
            .unprotected
            .read()
            .iter()
            .map(|(symbol, reason)| UnprotectedEntry {
                symbol: symbol.clone(),
                reason: reason.clone(),
            })
            .collect();
        unprotected.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let stale_feeds: Vec<String> = {
            let last = self.last_tick_ms.read();
            open_symbols
                .iter()
                .filter(|s| match last.get(s.as_str()) {
                    Some(ts) => now_ms - ts > self.stale_tick_ms,
                    None => true,
                })
                .cloned()
                .collect()
        };

        let status = if !engine_running || !unprotected.is_empty() {
            HealthStatus::Critical
        } else if !stale_feeds.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        };

        EngineHealth {
            status,
            engine_running,
            open_positions: open_symbols.len(),
            live_orders: 0,
            ticks_processed: self.ticks_processed.load(Ordering::Relaxed),
            fills_processed: self.fills_processed.load(Ordering::Relaxed),
            stale_events: self.stale_events.load(Ordering::Relaxed),
            gateway_failures: self.gateway_failures.load(Ordering::Relaxed),
            unprotected,
            stale_feeds,
            last_error: self.last_error.read().clone(),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("engine_running", &self.engine_running.load(Ordering::SeqCst))
            .field("unprotected", &self.unprotected.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_engine_is_critical() {
        let h = HealthMonitor::new(15);
        assert_eq!(h.snapshot(&[], 0).status, HealthStatus::Critical);
        h.set_running(true);
        assert_eq!(h.snapshot(&[], 0).status, HealthStatus::Ok);
    }

    #[test]
    fn quiet_feed_degrades_only_for_open_symbols() {
        let h = HealthMonitor::new(15);
        h.set_running(true);
        h.record_tick("BTCUSDT", 1_000);

        let open = vec!["BTCUSDT".to_string()];
        assert_eq!(h.snapshot(&open, 10_000).status, HealthStatus::Ok);
        let snap = h.snapshot(&open, 20_000);
        assert_eq!(snap.status, HealthStatus::Degraded);
        assert_eq!(snap.stale_feeds, open);

        // A symbol with no position never degrades health.
        assert_eq!(h.snapshot(&[], 20_000).status, HealthStatus::Ok);
        // An open symbol never seen on the feed does.
        let eth = vec!["ETHUSDT".to_string()];
        assert_eq!(h.snapshot(&eth, 0).status, HealthStatus::Degraded);
    }

    #[test]
    fn unprotected_position_is_critical_until_cleared() {
        let h = HealthMonitor::new(15);
        h.set_running(true);
        h.mark_unprotected("BTCUSDT", "stop-loss placement timed out");
        let snap = h.snapshot(&[], 0);
        assert_eq!(snap.status, HealthStatus::Critical);
        assert_eq!(snap.unprotected[0].symbol, "BTCUSDT");
        assert!(snap.last_error.unwrap().contains("timed out"));

        h.clear_unprotected("BTCUSDT");
        assert_eq!(h.snapshot(&[], 0).status, HealthStatus::Ok);
    }
}
