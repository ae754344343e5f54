//! Decision gate - merges validation output, the auxiliary score and the
//! current risk ledger state into a sized Accept/Reject decision.

use crate::ledger::LedgerView;
use crate::config::RiskConfig;
use crate::types::{now_ms, AssetId};
use crate::validator::{ValidationResult, Verdict};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Machine-readable rejection reasons emitted to the notification boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    LowScore,
    HardFailCheck,
    SizeExceedsHeadroom,
    LossLimitReached,
    DuplicatePositionOpen,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::LowScore => "low-score",
            RejectReason::HardFailCheck => "hard-fail-check",
            RejectReason::SizeExceedsHeadroom => "size-exceeds-headroom",
            RejectReason::LossLimitReached => "loss-limit-reached",
            RejectReason::DuplicatePositionOpen => "duplicate-position-open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeAction {
    Accept,
    Reject(RejectReason),
}

/// Immutable outcome of one gate evaluation. The `decision_id` is the
/// idempotency key for the whole submission path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDecision {
    pub decision_id: String,
    pub asset_id: AssetId,
    pub action: TradeAction,
    /// Trade size in base units (lamports); zero on reject
    pub size: u64,
    /// Human-readable explanation for operators
    pub reason: String,
}

impl TradeDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self.action, TradeAction::Accept)
    }
}

/// Accept policy and trade sizing.
pub struct DecisionGate {
    config: RiskConfig,
    sequence: AtomicU64,
}

impl DecisionGate {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            sequence: AtomicU64::new(0),
        }
    }

    /// Evaluate one validated candidate against the auxiliary score and the
    /// current ledger view. `has_live_position` must reflect whether a
    /// position for this asset is already Open or Closing.
    pub fn decide(
        &self,
        validation: &ValidationResult,
        auxiliary_score: u8,
        ledger: &LedgerView,
        has_live_position: bool,
    ) -> TradeDecision {
        if has_live_position {
            return self.reject(validation, RejectReason::DuplicatePositionOpen, "position already open");
        }
        if validation.hard_failed {
            return self.reject(
                validation,
                RejectReason::HardFailCheck,
                &format!("hard-fail checks: {}", validation.failed_summary()),
            );
        }
        if validation.verdict == Verdict::Fail || auxiliary_score < self.config.min_auxiliary_score {
            return self.reject(
                validation,
                RejectReason::LowScore,
                &format!(
                    "validation {}/100, auxiliary {}/100",
                    validation.score, auxiliary_score
                ),
            );
        }
        if ledger.daily_loss_accumulated >= ledger.daily_loss_limit {
            return self.reject(validation, RejectReason::LossLimitReached, "daily loss limit reached");
        }
        if ledger.open_position_count >= ledger.max_open_positions {
            return self.reject(
                validation,
                RejectReason::SizeExceedsHeadroom,
                "open position cap reached",
            );
        }

        let Some(size) = self.sized_for_headroom(ledger) else {
            return self.reject(
                validation,
                RejectReason::SizeExceedsHeadroom,
                "tapered size below minimum trade size",
            );
        };

        let decision = TradeDecision {
            decision_id: self.next_decision_id(&validation.asset_id),
            asset_id: validation.asset_id.clone(),
            action: TradeAction::Accept,
            size,
            reason: format!(
                "validation {}/100, auxiliary {}/100, size {} lamports",
                validation.score, auxiliary_score, size
            ),
        };
        info!(
            asset = %decision.asset_id,
            decision = %decision.decision_id,
            size,
            "Candidate accepted"
        );
        decision
    }

    /// Base size clamped to the configured maximum, scaled down linearly once
    /// the remaining loss headroom enters the final taper band. This keeps a
    /// single trade from blowing through the daily cap right after a large
    /// loss. Returns None when the tapered size falls below the minimum.
    fn sized_for_headroom(&self, ledger: &LedgerView) -> Option<u64> {
        let remaining = ledger.loss_headroom() as f64;
        let band = self.config.loss_taper_fraction * self.config.daily_loss_limit as f64;
        let scale = if band > 0.0 && remaining < band {
            remaining / band
        } else {
            1.0
        };
        let size = (self.config.base_trade_size as f64 * scale) as u64;
        let size = size.min(self.config.max_trade_size);
        if size < self.config.min_trade_size {
            debug!(size, min = self.config.min_trade_size, "tapered size below floor");
            return None;
        }
        Some(size)
    }

    fn reject(
        &self,
        validation: &ValidationResult,
        reason: RejectReason,
        detail: &str,
    ) -> TradeDecision {
        debug!(asset = %validation.asset_id, reason = reason.as_str(), detail, "Candidate rejected");
        TradeDecision {
            decision_id: self.next_decision_id(&validation.asset_id),
            asset_id: validation.asset_id.clone(),
            action: TradeAction::Reject(reason),
            size: 0,
            reason: format!("{}: {}", reason.as_str(), detail),
        }
    }

    fn next_decision_id(&self, asset_id: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let prefix: String = asset_id.chars().take(8).collect();
        format!("d-{}-{}-{}", prefix, now_ms(), seq)
    }
}
