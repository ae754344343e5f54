//! Candidate validation - the fixed battery of safety and liquidity checks.
//!
//! `CandidateValidator::validate` is deterministic given identical inputs: the
//! market snapshot and the corroborating-source count are supplied by the
//! caller, and no network call happens inside. Missing snapshot fields always
//! fail their check (fail-closed), and a failing hard-fail check forces a
//! `Fail` verdict regardless of the aggregate score.

use crate::config::ValidatorConfig;
use crate::types::{AssetId, CandidateEvent, MarketSnapshot};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use tracing::debug;

/// The validation criteria applied to every candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CheckKind {
    /// Pool liquidity at or above the configured floor
    Liquidity,
    /// LP tokens locked or burned
    LpLockedOrBurned,
    /// Mint/freeze authority revoked
    MintAuthorityRevoked,
    /// Top-N holder concentration below the configured ceiling
    HolderConcentration,
    /// Volume-to-liquidity ratio inside the organic-trading band
    VolumeLegitimacy,
    /// No single-candle drawdown beyond the configured fraction
    PriceStability,
    /// Observed from enough distinct sources inside the dedup window
    MultiSourceCorroboration,
    /// No deny-list match in the candidate metadata
    ContractSafety,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Liquidity => "liquidity",
            CheckKind::LpLockedOrBurned => "lp_locked_or_burned",
            CheckKind::MintAuthorityRevoked => "mint_authority_revoked",
            CheckKind::HolderConcentration => "holder_concentration",
            CheckKind::VolumeLegitimacy => "volume_legitimacy",
            CheckKind::PriceStability => "price_stability",
            CheckKind::MultiSourceCorroboration => "multi_source_corroboration",
            CheckKind::ContractSafety => "contract_safety",
        }
    }

    /// Returns all checks in evaluation order.
    pub fn all() -> Vec<CheckKind> {
        vec![
            CheckKind::Liquidity,
            CheckKind::LpLockedOrBurned,
            CheckKind::MintAuthorityRevoked,
            CheckKind::HolderConcentration,
            CheckKind::VolumeLegitimacy,
            CheckKind::PriceStability,
            CheckKind::MultiSourceCorroboration,
            CheckKind::ContractSafety,
        ]
    }
}

/// Per-check score weights. Normalized to 0-100 at scoring time, so they do
/// not have to sum to any particular total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckWeights {
    pub liquidity: f64,
    pub lp_locked_or_burned: f64,
    pub mint_authority_revoked: f64,
    pub holder_concentration: f64,
    pub volume_legitimacy: f64,
    pub price_stability: f64,
    pub multi_source_corroboration: f64,
    pub contract_safety: f64,
}

impl CheckWeights {
    pub fn get(&self, check: CheckKind) -> f64 {
        match check {
            CheckKind::Liquidity => self.liquidity,
            CheckKind::LpLockedOrBurned => self.lp_locked_or_burned,
            CheckKind::MintAuthorityRevoked => self.mint_authority_revoked,
            CheckKind::HolderConcentration => self.holder_concentration,
            CheckKind::VolumeLegitimacy => self.volume_legitimacy,
            CheckKind::PriceStability => self.price_stability,
            CheckKind::MultiSourceCorroboration => self.multi_source_corroboration,
            CheckKind::ContractSafety => self.contract_safety,
        }
    }

    pub fn total(&self) -> f64 {
        CheckKind::all().iter().map(|c| self.get(*c)).sum()
    }
}

impl Default for CheckWeights {
    fn default() -> Self {
        Self {
            liquidity: 20.0,
            lp_locked_or_burned: 15.0,
            mint_authority_revoked: 15.0,
            holder_concentration: 10.0,
            volume_legitimacy: 10.0,
            price_stability: 5.0,
            multi_source_corroboration: 5.0,
            contract_safety: 20.0,
        }
    }
}

/// Pass/fail verdict of the validation battery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    Fail,
}

/// Immutable result of validating one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub asset_id: AssetId,
    /// Aggregate weighted score, 0-100
    pub score: u8,
    pub passed_checks: BTreeSet<CheckKind>,
    pub failed_checks: BTreeSet<CheckKind>,
    /// Whether a configured hard-fail check failed
    pub hard_failed: bool,
    pub verdict: Verdict,
}

impl ValidationResult {
    /// Short machine-readable summary of the failing checks, for reject events.
    pub fn failed_summary(&self) -> String {
        if self.failed_checks.is_empty() {
            return "none".to_string();
        }
        self.failed_checks
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Runs the fixed battery of checks against a candidate and a fresh snapshot.
pub struct CandidateValidator {
    config: ValidatorConfig,
}

impl CandidateValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Validate a candidate against a point-in-time snapshot.
    ///
    /// `corroborating_sources` is the distinct-source count produced by
    /// [`SourceTracker`] for this asset inside the dedup window.
    pub fn validate(
        &self,
        candidate: &CandidateEvent,
        snapshot: &MarketSnapshot,
        corroborating_sources: usize,
    ) -> ValidationResult {
        let mut passed = BTreeSet::new();
        let mut failed = BTreeSet::new();

        for check in CheckKind::all() {
            let ok = match check {
                CheckKind::Liquidity => self.check_liquidity(snapshot),
                CheckKind::LpLockedOrBurned => snapshot.lp_locked_or_burned == Some(true),
                CheckKind::MintAuthorityRevoked => snapshot.mint_authority_revoked == Some(true),
                CheckKind::HolderConcentration => self.check_holder_concentration(snapshot),
                CheckKind::VolumeLegitimacy => self.check_volume_legitimacy(snapshot),
                CheckKind::PriceStability => self.check_price_stability(snapshot),
                CheckKind::MultiSourceCorroboration => {
                    corroborating_sources >= self.config.min_corroborating_sources
                }
                CheckKind::ContractSafety => self.check_contract_safety(candidate),
            };
            if ok {
                passed.insert(check);
            } else {
                failed.insert(check);
                debug!(asset = %candidate.asset_id, check = check.as_str(), "check failed");
            }
        }

        let score = self.aggregate_score(&passed);
        let hard_failed = self
            .config
            .hard_fail_checks
            .iter()
            .any(|c| failed.contains(c));
        // Corroboration gates the verdict outright: a single noisy source
        // cannot trigger action alone, whatever the score says. Ties at
        // exactly the threshold pass.
        let corroborated = !failed.contains(&CheckKind::MultiSourceCorroboration);
        let verdict = if !hard_failed && corroborated && score >= self.config.pass_threshold {
            Verdict::Pass
        } else {
            Verdict::Fail
        };

        ValidationResult {
            asset_id: candidate.asset_id.clone(),
            score,
            passed_checks: passed,
            failed_checks: failed,
            hard_failed,
            verdict,
        }
    }

    /// Weighted sum of the passed checks, normalized to 0-100.
    fn aggregate_score(&self, passed: &BTreeSet<CheckKind>) -> u8 {
        let total = self.config.weights.total();
        if total <= 0.0 {
            return 0;
        }
        let sum: f64 = passed.iter().map(|c| self.config.weights.get(*c)).sum();
        ((sum / total) * 100.0).round().min(100.0) as u8
    }

    fn check_liquidity(&self, snapshot: &MarketSnapshot) -> bool {
        match snapshot.liquidity_value {
            Some(liquidity) => liquidity >= self.config.min_liquidity_usd,
            None => false,
        }
    }

    fn check_holder_concentration(&self, snapshot: &MarketSnapshot) -> bool {
        match snapshot.holder_concentration_top_n {
            Some(concentration) => concentration < self.config.max_holder_concentration,
            None => false,
        }
    }

    /// Organic trading has a volume roughly proportional to liquidity; a ratio
    /// above the band flags wash-trading spikes, below it a dead pool.
    fn check_volume_legitimacy(&self, snapshot: &MarketSnapshot) -> bool {
        let (Some(volume), Some(liquidity)) = (snapshot.volume_recent, snapshot.liquidity_value)
        else {
            return false;
        };
        if liquidity <= 0.0 {
            return false;
        }
        let ratio = volume / liquidity;
        ratio >= self.config.volume_liquidity_ratio_min
            && ratio <= self.config.volume_liquidity_ratio_max
    }

    /// Fails when any single step in the observed window drops more than the
    /// configured fraction (post-pump dump). Fewer than two points is missing
    /// data and fails closed.
    fn check_price_stability(&self, snapshot: &MarketSnapshot) -> bool {
        if snapshot.price_history.len() < 2 {
            return false;
        }
        for pair in snapshot.price_history.windows(2) {
            let (prev, next) = (pair[0].price, pair[1].price);
            if prev > 0.0 && (prev - next) / prev > self.config.max_single_candle_drawdown {
                return false;
            }
        }
        true
    }

    fn check_contract_safety(&self, candidate: &CandidateEvent) -> bool {
        for value in candidate.raw_metadata.values() {
            let lowered = value.to_lowercase();
            if self
                .config
                .metadata_deny_list
                .iter()
                .any(|pattern| lowered.contains(pattern.as_str()))
            {
                return false;
            }
        }
        true
    }
}

/// Tracks which distinct sources mentioned an asset inside the dedup window,
/// so a single noisy source cannot trigger action alone.
pub struct SourceTracker {
    sources: Cache<AssetId, HashSet<String>>,
}

impl SourceTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            sources: Cache::builder()
                .time_to_live(window)
                .max_capacity(10_000)
                .build(),
        }
    }

    /// Record one observation and return the distinct-source count so far.
    pub async fn observe(&self, asset_id: &str, source: &str) -> usize {
        let mut set = self
            .sources
            .get(asset_id)
            .await
            .unwrap_or_default();
        set.insert(source.to_string());
        let count = set.len();
        self.sources.insert(asset_id.to_string(), set).await;
        count
    }

    /// Current distinct-source count inside the window.
    pub async fn count(&self, asset_id: &str) -> usize {
        self.sources.get(asset_id).await.map_or(0, |s| s.len())
    }
}
