//! Error taxonomy for the trading engine.
//!
//! Per-candidate and per-position failures are contained to that candidate or
//! position and never abort the scheduler loops; only startup failures
//! (state store, risk configuration) are fatal to the process.

use crate::submission::SubmissionTier;
use crate::types::AssetId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Every tier failed; terminal for this decision only, no state mutated.
    #[error("all submission tiers failed for decision {decision_id}")]
    SubmissionAllTiersFailed { decision_id: String },

    /// A tier confirmed after another tier's confirmation was already acted
    /// on for the same intent; the surplus fill must be emergency-closed.
    #[error("late confirmation from {late_tier:?} conflicts with {winner:?} for intent {fingerprint}")]
    LateConfirmationConflict {
        fingerprint: String,
        winner: SubmissionTier,
        late_tier: SubmissionTier,
    },

    /// Closing submissions exhausted their retry budget; the position stays
    /// Closing and is flagged for operator intervention.
    #[error("close retries exhausted for {asset_id} after {attempts} attempts")]
    SupervisorCloseFailedExhausted { asset_id: AssetId, attempts: u32 },

    /// A position for the asset is already Open or Closing.
    #[error("position already open for {asset_id}")]
    DuplicatePosition { asset_id: AssetId },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
