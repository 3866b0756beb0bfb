// =============================================================================
// Runtime Configuration — engine settings with validation and atomic save
// =============================================================================
//
// Every tunable lives here: the symbol list, leverage, exit-plan tiers,
// gateway retry policy and feed health limits.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry serde defaults so that adding new fields never
// breaks loading an older config file. A file that parses but fails
// validation is rejected at load: the engine refuses to start on it.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::direction::DirectionThreshold;
use crate::exit::planner::{ExitPlanConfig, PerformanceTier, TierTable};
use crate::gateway::binance::validate_callback_fraction;
use crate::gateway::RetryPolicy;
use crate::types::AccountMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_leverage() -> u32 {
    25
}

fn default_placement_timeout_ms() -> u64 {
    3_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    250
}

fn default_max_pending_fills() -> usize {
    64
}

fn default_stale_tick_secs() -> u64 {
    15
}

fn default_event_queue_capacity() -> usize {
    1024
}

fn default_trade_log_path() -> Option<String> {
    Some("trade_journal.jsonl".to_string())
}

fn default_binance_base_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_stream_base_url() -> String {
    "wss://fstream.binance.com".to_string()
}

// =============================================================================
// GatewayConfig
// =============================================================================

/// Bounded retry for every protective-order round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_placement_timeout_ms")]
    pub placement_timeout_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay; doubles per retry.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            placement_timeout_ms: default_placement_timeout_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl GatewayConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(self.placement_timeout_ms),
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the trailguard engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational modes ---------------------------------------------------

    /// Demo routes orders to the paper gateway; Live to Binance futures.
    #[serde(default)]
    pub account_mode: AccountMode,

    /// Symbols whose mark price is streamed into the engine.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Leverage used when an open request does not name one.
    #[serde(default = "default_leverage")]
    pub default_leverage: u32,

    // --- Exit plans ------------------------------------------------------------

    #[serde(default)]
    pub default_tier: PerformanceTier,

    /// Per-symbol tier overrides.
    #[serde(default)]
    pub symbol_tiers: HashMap<String, PerformanceTier>,

    #[serde(default)]
    pub tiers: TierTable,

    #[serde(default)]
    pub direction: DirectionThreshold,

    // --- Engine plumbing -------------------------------------------------------

    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Upper bound on out-of-order fills buffered per position.
    #[serde(default = "default_max_pending_fills")]
    pub max_pending_fills: usize,

    /// An open position's feed older than this degrades health.
    #[serde(default = "default_stale_tick_secs")]
    pub stale_tick_secs: u64,

    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// JSONL trade journal; `null` disables it.
    #[serde(default = "default_trade_log_path")]
    pub trade_log_path: Option<String>,

    // --- Endpoints ---------------------------------------------------------------

    #[serde(default = "default_binance_base_url")]
    pub binance_base_url: String,

    #[serde(default = "default_stream_base_url")]
    pub stream_base_url: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            account_mode: AccountMode::Demo,
            symbols: default_symbols(),
            default_leverage: default_leverage(),
            default_tier: PerformanceTier::default(),
            symbol_tiers: HashMap::new(),
            tiers: TierTable::default(),
            direction: DirectionThreshold::default(),
            gateway: GatewayConfig::default(),
            max_pending_fills: default_max_pending_fills(),
            stale_tick_secs: default_stale_tick_secs(),
            event_queue_capacity: default_event_queue_capacity(),
            trade_log_path: default_trade_log_path(),
            binance_base_url: default_binance_base_url(),
            stream_base_url: default_stream_base_url(),
        }
    }
}

impl RuntimeConfig {
    /// Tier that applies to `symbol`.
    pub fn tier_for(&self, symbol: &str) -> PerformanceTier {
        self.symbol_tiers
            .get(symbol)
            .copied()
            .unwrap_or(self.default_tier)
    }

    /// Exit configuration for `symbol`, or for an explicit tier.
    pub fn exit_plan_config(&self, symbol: &str, tier: Option<PerformanceTier>) -> &ExitPlanConfig {
        self.tiers.plan_for(tier.unwrap_or_else(|| self.tier_for(symbol)))
    }

    /// Reject settings the engine cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        if self.default_leverage == 0 {
            anyhow::bail!("default_leverage must be >= 1");
        }
        self.tiers.validate().context("invalid exit tier table")?;
        if self.account_mode == AccountMode::Live {
            for tier in [
                PerformanceTier::Conservative,
                PerformanceTier::Standard,
                PerformanceTier::Aggressive,
            ] {
                let callback = self.tiers.plan_for(tier).trailing_callback_fraction;
                validate_callback_fraction(callback)
                    .with_context(|| format!("tier {tier}: trailing_callback_fraction"))?;
            }
        }
        self.direction
            .validate()
            .context("invalid direction threshold")?;
        if self.gateway.max_attempts == 0 {
            anyhow::bail!("gateway.max_attempts must be >= 1");
        }
        if self.gateway.placement_timeout_ms == 0 {
            anyhow::bail!("gateway.placement_timeout_ms must be > 0");
        }
        if self.max_pending_fills == 0 {
            anyhow::bail!("max_pending_fills must be >= 1");
        }
        if self.event_queue_capacity == 0 {
            anyhow::bail!("event_queue_capacity must be >= 1");
        }
        Ok(())
    }

    /// Load and validate configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("runtime config {} failed validation", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            account_mode = %config.account_mode,
            default_tier = %config.default_tier,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Defaults if `path` does not exist; any other failure is an error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "runtime config not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("trailguard-{}-{name}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.symbols[0], "BTCUSDT");
        assert_eq!(cfg.default_leverage, 25);
        assert_eq!(cfg.default_tier, PerformanceTier::Standard);
        assert_eq!(cfg.gateway.max_attempts, 3);
        assert_eq!(cfg.max_pending_fills, 64);
        let plan = cfg.exit_plan_config("BTCUSDT", None);
        assert!((plan.tp1_close_fraction - 0.75).abs() < f64::EPSILON);
        assert!((plan.trailing_callback_fraction - 0.03).abs() < f64::EPSILON);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.tiers, TierTable::default());
        assert_eq!(cfg.gateway, GatewayConfig::default());
        assert_eq!(cfg.trade_log_path.as_deref(), Some("trade_journal.jsonl"));
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "account_mode": "Live",
            "symbols": ["ETHUSDT"],
            "symbol_tiers": { "ETHUSDT": "aggressive" },
            "tiers": { "standard": { "tp1_close_fraction": 0.5 } }
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.account_mode, AccountMode::Live);
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.tier_for("ETHUSDT"), PerformanceTier::Aggressive);
        assert_eq!(cfg.tier_for("BTCUSDT"), PerformanceTier::Standard);
        assert_eq!(cfg.tiers.standard.tp1_close_fraction, 0.5);
        assert_eq!(cfg.tiers.standard.trailing_callback_fraction, 0.03);
        assert_eq!(
            cfg.exit_plan_config("BTCUSDT", Some(PerformanceTier::Conservative)),
            &cfg.tiers.conservative
        );
    }

    #[test]
    fn retry_policy_from_gateway_config() {
        let policy = GatewayConfig::default().retry_policy();
        assert_eq!(policy.timeout, Duration::from_millis(3_000));
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_base, Duration::from_millis(250));
    }

    #[test]
    fn invalid_tier_fails_at_load() {
        let path = temp_path("invalid");
        std::fs::write(
            &path,
            r#"{ "tiers": { "standard": { "trailing_callback_fraction": 1.5 } } }"#,
        )
        .unwrap();
        let err = RuntimeConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("trailing_callback_fraction"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn live_mode_rejects_callbacks_binance_cannot_express() {
        let mut cfg = RuntimeConfig::default();
        cfg.tiers.aggressive.trailing_callback_fraction = 0.0125;
        assert!(cfg.validate().is_ok());

        cfg.account_mode = AccountMode::Live;
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:#}").contains("tier aggressive"));

        cfg.tiers.aggressive.trailing_callback_fraction = 0.2;
        assert!(cfg.validate().is_err());

        cfg.tiers.aggressive.trailing_callback_fraction = 0.04;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let path = temp_path("missing");
        let cfg = RuntimeConfig::load_or_default(&path).unwrap();
        assert_eq!(cfg.default_leverage, 25);
    }

    #[test]
    fn save_then_load_roundtrip() {
        let path = temp_path("roundtrip");
        let mut cfg = RuntimeConfig::default();
        cfg.default_leverage = 10;
        cfg.symbol_tiers
            .insert("SOLUSDT".to_string(), PerformanceTier::Conservative);
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.default_leverage, 10);
        assert_eq!(loaded.tier_for("SOLUSDT"), PerformanceTier::Conservative);
        assert!(!path.with_extension("json.tmp").exists());
        let _ = std::fs::remove_file(&path);
    }
}
