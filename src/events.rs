//! Engine event stream.
//!
//! Every component reports material state transitions onto one channel so
//! the binary (and tests) can observe the engine without reaching into its
//! internals. Emission is drop-safe: a closed or full receiver never stalls
//! the trading loop.

use crate::decision::RejectReason;
use crate::submission::SubmissionTier;
use crate::supervisor::ExitReason;
use crate::types::AssetId;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone)]
pub enum BotEvent {
    CandidateObserved {
        asset_id: AssetId,
        source: String,
    },
    CandidateRejected {
        asset_id: AssetId,
        reason: RejectReason,
        detail: String,
    },
    ValidationFailed {
        asset_id: AssetId,
        score: u8,
        failed_checks: String,
    },
    TradeSubmitted {
        asset_id: AssetId,
        decision_id: String,
        size: u64,
    },
    PositionOpened {
        asset_id: AssetId,
        entry_price: f64,
        size: u64,
        tier: SubmissionTier,
    },
    PositionClosed {
        asset_id: AssetId,
        exit_reason: ExitReason,
        realized_pnl: i64,
    },
    CloseEscalated {
        asset_id: AssetId,
        attempts: u32,
    },
    SubmissionAbandoned {
        asset_id: AssetId,
        decision_id: String,
    },
    /// A fill confirmed for an asset that already holds a live position; the
    /// surplus exposure needs an emergency close by the operator.
    SurplusFillDetected {
        asset_id: AssetId,
        decision_id: String,
        size: u64,
    },
    LateConfirmationConflict {
        fingerprint: String,
        winner: SubmissionTier,
        late_tier: SubmissionTier,
    },
    DailyLossLimitReached {
        accumulated: u64,
        limit: u64,
    },
}

pub type EventSender = mpsc::Sender<BotEvent>;
pub type EventReceiver = mpsc::Receiver<BotEvent>;

pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(capacity)
}

/// Best-effort emit. A lagging or departed consumer must never block or
/// fail the emitting component.
pub fn emit(sender: &EventSender, event: BotEvent) {
    if let Err(e) = sender.try_send(event) {
        debug!("Event dropped: {}", e);
    }
}
