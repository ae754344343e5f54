//! Configuration surface for the trading engine.
//!
//! All thresholds, weights and limits are supplied as configuration, never
//! learned. Every section has a conservative `Default` so the engine can run
//! in simulation mode with no config file at all.

use crate::validator::{CheckKind, CheckWeights};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Path to the SQLite state database
    pub db_path: String,
    pub validator: ValidatorConfig,
    pub risk: RiskConfig,
    pub submission: SubmissionConfig,
    pub supervisor: SupervisorConfig,
    pub scheduler: SchedulerConfig,
    pub market: MarketConfig,
}

/// Validation checks configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Per-check score weights, normalized to 0-100 at scoring time
    pub weights: CheckWeights,
    /// Minimum aggregate score for a Pass verdict (ties pass)
    pub pass_threshold: u8,
    /// Checks whose failure disqualifies regardless of aggregate score
    pub hard_fail_checks: Vec<CheckKind>,
    /// Liquidity floor in USD
    pub min_liquidity_usd: f64,
    /// Top-N holder concentration ceiling (fraction of supply, exclusive)
    pub max_holder_concentration: f64,
    /// Volume-to-liquidity ratio band for organic trading
    pub volume_liquidity_ratio_min: f64,
    pub volume_liquidity_ratio_max: f64,
    /// Largest tolerated single-step drawdown in the observed price window
    pub max_single_candle_drawdown: f64,
    /// Distinct sources required inside the dedup window
    pub min_corroborating_sources: usize,
    /// Dedup / corroboration window in seconds
    pub dedup_window_secs: u64,
    /// Lowercase substrings that flag malicious metadata
    pub metadata_deny_list: Vec<String>,
}

/// Risk limits enforced by the ledger and the decision gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Daily realized-loss cap in lamports
    pub daily_loss_limit: u64,
    pub max_open_positions: usize,
    /// Sizing bounds in lamports
    pub min_trade_size: u64,
    pub max_trade_size: u64,
    /// Configured base size before taper and clamping
    pub base_trade_size: u64,
    /// Final fraction of the daily limit over which size tapers linearly
    pub loss_taper_fraction: f64,
    /// Minimum auxiliary score for an Accept
    pub min_auxiliary_score: u8,
    /// Substitute score when the auxiliary scorer boundary is absent
    pub default_auxiliary_score: u8,
    /// Stop-loss distance as a fraction of entry price
    pub stop_loss_pct: f64,
    /// Take-profit target as a multiple of entry price
    pub take_profit_multiplier: f64,
}

/// Tiered submission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    /// When false, every submission is a `Simulated` terminal attempt
    pub live_mode: bool,
    /// Per-tier wait bounds in milliseconds
    pub bundle_timeout_ms: u64,
    pub priority_fee_timeout_ms: u64,
    pub standard_timeout_ms: u64,
    /// Tier parameters forwarded to the network boundary
    pub priority_fee_lamports: u64,
    pub bundle_tip_lamports: u64,
}

/// Position supervision configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Bounded retries for a failed closing submission before escalation
    pub max_close_retries: u32,
    /// Base delay for the exponential close-retry backoff
    pub close_retry_base_delay_ms: u64,
}

/// Outer cadence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Validation/decision pass interval in seconds
    pub cycle_interval_secs: u64,
    /// Supervisor tick interval in seconds
    pub supervisor_interval_secs: u64,
    /// Overall deadline for one candidate, snapshot fetch included
    pub candidate_deadline_secs: u64,
    /// Candidates processed per cycle at most
    pub max_candidates_per_cycle: usize,
}

/// Market-data boundary configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub requests_per_second: u32,
    /// Bound on a single snapshot fetch inside the candidate deadline
    pub snapshot_timeout_secs: u64,
}

impl BotConfig {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist. A present-but-invalid file is a startup error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.risk.min_trade_size <= self.risk.max_trade_size,
            "min_trade_size exceeds max_trade_size"
        );
        anyhow::ensure!(self.risk.max_open_positions > 0, "max_open_positions must be positive");
        anyhow::ensure!(
            self.risk.loss_taper_fraction > 0.0 && self.risk.loss_taper_fraction <= 1.0,
            "loss_taper_fraction must be in (0, 1]"
        );
        anyhow::ensure!(self.risk.daily_loss_limit > 0, "daily_loss_limit must be positive");
        Ok(())
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            db_path: "./omni_sniper.db".to_string(),
            validator: ValidatorConfig::default(),
            risk: RiskConfig::default(),
            submission: SubmissionConfig::default(),
            supervisor: SupervisorConfig::default(),
            scheduler: SchedulerConfig::default(),
            market: MarketConfig::default(),
        }
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            weights: CheckWeights::default(),
            pass_threshold: 70,
            hard_fail_checks: vec![CheckKind::LpLockedOrBurned, CheckKind::MintAuthorityRevoked],
            min_liquidity_usd: 10_000.0,
            max_holder_concentration: 0.40,
            volume_liquidity_ratio_min: 0.02,
            volume_liquidity_ratio_max: 20.0,
            max_single_candle_drawdown: 0.30,
            min_corroborating_sources: 2,
            dedup_window_secs: 300,
            metadata_deny_list: vec![
                "honeypot".to_string(),
                "rugpull".to_string(),
                "faucet".to_string(),
            ],
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            daily_loss_limit: 500_000_000,   // 0.5 SOL
            max_open_positions: 5,
            min_trade_size: 10_000_000,      // 0.01 SOL
            max_trade_size: 100_000_000,     // 0.1 SOL
            base_trade_size: 50_000_000,     // 0.05 SOL
            loss_taper_fraction: 0.5,
            min_auxiliary_score: 60,
            default_auxiliary_score: 50,
            stop_loss_pct: 0.30,
            take_profit_multiplier: 2.0,
        }
    }
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            live_mode: false,
            bundle_timeout_ms: 1_500,
            priority_fee_timeout_ms: 3_000,
            standard_timeout_ms: 5_000,
            priority_fee_lamports: 10_000,
            bundle_tip_lamports: 10_000,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_close_retries: 3,
            close_retry_base_delay_ms: 500,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 15,
            supervisor_interval_secs: 3,
            candidate_deadline_secs: 30,
            max_candidates_per_cycle: 5,
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.dexscreener.com".to_string(),
            request_timeout_secs: 5,
            requests_per_second: 5,
            snapshot_timeout_secs: 8,
        }
    }
}
