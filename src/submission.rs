//! Tiered transaction submission.
//!
//! One economic intent is driven through ordered fallback tiers, strictly
//! sequentially, each under its own wait bound. A timed-out tier is failed
//! for fallback purposes but is not aborted at the network layer - it may
//! still land, which is why every confirmation is routed through the
//! [`Reconciler`]: at most one confirmation per intent fingerprint is ever
//! acted upon, and a late confirmation from another tier is escalated, never
//! silently duplicated.

use crate::config::SubmissionConfig;
use crate::error::EngineError;
use crate::events::{emit, BotEvent, EventSender};
use crate::types::{now_ms, AssetId, TimestampMs};
use anyhow::Result;
use async_trait::async_trait;
use nonempty::NonEmpty;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// One network path for submitting a transaction, ordered by speed/cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubmissionTier {
    /// Private bundle relay (fastest, tip-paying)
    Bundle,
    /// Priority-fee-boosted direct submission
    PriorityFee,
    /// Plain submission
    Standard,
    /// No network effect; estimated fill only
    Simulated,
}

impl SubmissionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionTier::Bundle => "bundle",
            SubmissionTier::PriorityFee => "priority_fee",
            SubmissionTier::Standard => "standard",
            SubmissionTier::Simulated => "simulated",
        }
    }
}

/// Which side of a position an intent opens or closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Entry,
    Exit,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Entry => "entry",
            TradeSide::Exit => "exit",
        }
    }
}

/// A signed-transaction intent as seen by the pipeline. The fingerprint is
/// derived from the decision id and side - never from the tier - so every
/// tier attempt for one decision shares it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxIntent {
    pub decision_id: String,
    pub asset_id: AssetId,
    pub side: TradeSide,
    /// Size in base units (lamports)
    pub size: u64,
    /// Reference price at decision time, used for simulated fills
    pub reference_price: f64,
    pub fingerprint: String,
}

impl TxIntent {
    pub fn new(
        decision_id: &str,
        asset_id: &str,
        side: TradeSide,
        size: u64,
        reference_price: f64,
    ) -> Self {
        Self {
            decision_id: decision_id.to_string(),
            asset_id: asset_id.to_string(),
            side,
            size,
            reference_price,
            fingerprint: format!("{}:{}", decision_id, side.as_str()),
        }
    }
}

/// Tier-specific parameters forwarded to the network boundary.
#[derive(Debug, Clone, Copy)]
pub struct TierParams {
    pub priority_fee_lamports: u64,
    pub tip_lamports: u64,
}

/// Response contract of the network submission boundary.
#[derive(Debug, Clone)]
pub struct TierResponse {
    pub accepted: bool,
    pub confirmed: bool,
    pub tx_fingerprint: String,
}

/// Network submission boundary, one call per tier attempt. Implementations
/// are expected to wait for confirmation internally; the pipeline bounds the
/// wait from the outside.
#[async_trait]
pub trait TierClient: Send + Sync {
    async fn submit(
        &self,
        tier: SubmissionTier,
        intent: &TxIntent,
        params: &TierParams,
    ) -> Result<TierResponse>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    /// Timed out or accepted-without-confirmation; may still land
    Pending,
    Confirmed,
    Failed(String),
}

/// One tier attempt for a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionAttempt {
    pub tier: SubmissionTier,
    pub started_at: TimestampMs,
    pub outcome: AttemptOutcome,
    pub tx_fingerprint: Option<String>,
    /// Estimated fill price for Simulated attempts
    pub fill_price: Option<f64>,
}

/// The full attempt trail for one intent; the last attempt is terminal.
#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    pub fingerprint: String,
    pub attempts: Vec<SubmissionAttempt>,
}

impl SubmissionOutcome {
    /// The attempt whose confirmation was acted upon, if any.
    pub fn confirmed_attempt(&self) -> Option<&SubmissionAttempt> {
        self.attempts
            .iter()
            .find(|a| a.outcome == AttemptOutcome::Confirmed)
    }

    pub fn all_tiers_failed(&self) -> bool {
        self.confirmed_attempt().is_none()
    }
}

/// What a reported confirmation means for an intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// First confirmation for this intent; act on it
    FirstConfirmation,
    /// Same tier re-reporting; ignore
    DuplicateIgnored,
    /// A different tier already won; the surplus fill must be emergency-closed
    Conflict { winner: SubmissionTier },
}

/// Tracks which tier's confirmation was acted on per intent fingerprint.
pub struct Reconciler {
    winners: Mutex<HashMap<String, SubmissionTier>>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            winners: Mutex::new(HashMap::new()),
        }
    }

    /// Report a confirmation for an intent. The first report wins; any later
    /// report from a different tier is a conflict.
    pub async fn observe_confirmation(
        &self,
        fingerprint: &str,
        tier: SubmissionTier,
    ) -> ReconcileAction {
        let mut winners = self.winners.lock().await;
        match winners.get(fingerprint) {
            None => {
                winners.insert(fingerprint.to_string(), tier);
                ReconcileAction::FirstConfirmation
            }
            Some(winner) if *winner == tier => ReconcileAction::DuplicateIgnored,
            Some(winner) => ReconcileAction::Conflict { winner: *winner },
        }
    }

    /// Drop tracking for a settled intent.
    pub async fn forget(&self, fingerprint: &str) {
        self.winners.lock().await.remove(fingerprint);
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives an intent through the ordered fallback tiers to finality or
/// definitive failure.
pub struct SubmissionPipeline {
    client: Arc<dyn TierClient>,
    config: SubmissionConfig,
    tiers: NonEmpty<(SubmissionTier, Duration)>,
    reconciler: Arc<Reconciler>,
    events: Option<EventSender>,
}

impl SubmissionPipeline {
    pub fn new(client: Arc<dyn TierClient>, config: SubmissionConfig) -> Self {
        let tiers = NonEmpty::from((
            (
                SubmissionTier::Bundle,
                Duration::from_millis(config.bundle_timeout_ms),
            ),
            vec![
                (
                    SubmissionTier::PriorityFee,
                    Duration::from_millis(config.priority_fee_timeout_ms),
                ),
                (
                    SubmissionTier::Standard,
                    Duration::from_millis(config.standard_timeout_ms),
                ),
            ],
        ));
        Self {
            client,
            config,
            tiers,
            reconciler: Arc::new(Reconciler::new()),
            events: None,
        }
    }

    /// Attach the engine event stream for conflict reporting.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        self.reconciler.clone()
    }

    /// Submit one intent. Tiers execute strictly in priority order, never in
    /// parallel, so at most one transaction per intent can take effect. The
    /// returned trail ends in the terminal attempt; `all_tiers_failed` on the
    /// outcome means no state may be mutated by the caller.
    pub async fn submit(&self, intent: &TxIntent) -> SubmissionOutcome {
        if !self.config.live_mode {
            return self.submit_simulated(intent).await;
        }

        let params = TierParams {
            priority_fee_lamports: self.config.priority_fee_lamports,
            tip_lamports: self.config.bundle_tip_lamports,
        };
        let mut attempts = Vec::new();

        for (tier, bound) in self.tiers.iter() {
            let started_at = now_ms();
            debug!(
                intent = %intent.fingerprint,
                tier = tier.as_str(),
                bound_ms = bound.as_millis() as u64,
                "Attempting submission tier"
            );

            match timeout(*bound, self.client.submit(*tier, intent, &params)).await {
                Err(_elapsed) => {
                    // Failed for fallback purposes, but the transaction is not
                    // aborted at the network layer and may still land.
                    warn!(
                        intent = %intent.fingerprint,
                        tier = tier.as_str(),
                        waited_ms = bound.as_millis() as u64,
                        "Submission tier timed out; falling back"
                    );
                    attempts.push(SubmissionAttempt {
                        tier: *tier,
                        started_at,
                        outcome: AttemptOutcome::Pending,
                        tx_fingerprint: None,
                        fill_price: None,
                    });
                }
                Ok(Err(e)) => {
                    warn!(
                        intent = %intent.fingerprint,
                        tier = tier.as_str(),
                        error = %e,
                        "Submission tier failed; falling back"
                    );
                    attempts.push(SubmissionAttempt {
                        tier: *tier,
                        started_at,
                        outcome: AttemptOutcome::Failed(e.to_string()),
                        tx_fingerprint: None,
                        fill_price: None,
                    });
                }
                Ok(Ok(response)) if response.confirmed => {
                    self.reconciler
                        .observe_confirmation(&intent.fingerprint, *tier)
                        .await;
                    attempts.push(SubmissionAttempt {
                        tier: *tier,
                        started_at,
                        outcome: AttemptOutcome::Confirmed,
                        tx_fingerprint: Some(response.tx_fingerprint),
                        fill_price: None,
                    });
                    info!(
                        intent = %intent.fingerprint,
                        tier = tier.as_str(),
                        "Submission confirmed"
                    );
                    return SubmissionOutcome {
                        fingerprint: intent.fingerprint.clone(),
                        attempts,
                    };
                }
                Ok(Ok(response)) if response.accepted => {
                    // Accepted but unconfirmed within the bound: same handling
                    // as a timeout, reconciliation covers a late landing.
                    warn!(
                        intent = %intent.fingerprint,
                        tier = tier.as_str(),
                        "Tier accepted but did not confirm in bound; falling back"
                    );
                    attempts.push(SubmissionAttempt {
                        tier: *tier,
                        started_at,
                        outcome: AttemptOutcome::Pending,
                        tx_fingerprint: Some(response.tx_fingerprint),
                        fill_price: None,
                    });
                }
                Ok(Ok(_rejected)) => {
                    attempts.push(SubmissionAttempt {
                        tier: *tier,
                        started_at,
                        outcome: AttemptOutcome::Failed("rejected by relay".to_string()),
                        tx_fingerprint: None,
                        fill_price: None,
                    });
                }
            }
        }

        error!(
            intent = %intent.fingerprint,
            tiers = attempts.len(),
            "All submission tiers failed"
        );
        SubmissionOutcome {
            fingerprint: intent.fingerprint.clone(),
            attempts,
        }
    }

    /// Non-live mode: a single Simulated terminal attempt with an estimated
    /// fill jittered around the reference price, no network effect.
    async fn submit_simulated(&self, intent: &TxIntent) -> SubmissionOutcome {
        let slippage = rand::thread_rng().gen_range(-0.005..0.005);
        let fill_price = intent.reference_price * (1.0 + slippage);
        self.reconciler
            .observe_confirmation(&intent.fingerprint, SubmissionTier::Simulated)
            .await;
        info!(
            intent = %intent.fingerprint,
            fill_price,
            "Simulated submission confirmed"
        );
        SubmissionOutcome {
            fingerprint: intent.fingerprint.clone(),
            attempts: vec![SubmissionAttempt {
                tier: SubmissionTier::Simulated,
                started_at: now_ms(),
                outcome: AttemptOutcome::Confirmed,
                tx_fingerprint: Some(format!("sim:{}", intent.fingerprint)),
                fill_price: Some(fill_price),
            }],
        }
    }

    /// Reconcile a confirmation that arrived after the pipeline call returned
    /// (a timed-out tier landing late). A conflict means a surplus fill
    /// exists on-chain and must be emergency-closed by the caller.
    pub async fn report_late_confirmation(
        &self,
        fingerprint: &str,
        tier: SubmissionTier,
    ) -> Result<ReconcileAction, EngineError> {
        let action = self.reconciler.observe_confirmation(fingerprint, tier).await;
        if let ReconcileAction::Conflict { winner } = action {
            error!(
                intent = %fingerprint,
                late_tier = tier.as_str(),
                winner = winner.as_str(),
                "Late confirmation conflict; surplus fill flagged for emergency close"
            );
            if let Some(events) = &self.events {
                emit(
                    events,
                    BotEvent::LateConfirmationConflict {
                        fingerprint: fingerprint.to_string(),
                        winner,
                        late_tier: tier,
                    },
                );
            }
            return Err(EngineError::LateConfirmationConflict {
                fingerprint: fingerprint.to_string(),
                winner,
                late_tier: tier,
            });
        }
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted behavior per tier.
    #[derive(Clone)]
    enum Script {
        Confirm,
        Reject,
        Error,
        Hang,
    }

    struct ScriptedClient {
        scripts: HashMap<SubmissionTier, Script>,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(scripts: Vec<(SubmissionTier, Script)>) -> Arc<Self> {
            Arc::new(Self {
                scripts: scripts.into_iter().collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TierClient for ScriptedClient {
        async fn submit(
            &self,
            tier: SubmissionTier,
            intent: &TxIntent,
            _params: &TierParams,
        ) -> Result<TierResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.scripts.get(&tier).unwrap_or(&Script::Error) {
                Script::Confirm => Ok(TierResponse {
                    accepted: true,
                    confirmed: true,
                    tx_fingerprint: format!("tx:{}:{}", tier.as_str(), intent.fingerprint),
                }),
                Script::Reject => Ok(TierResponse {
                    accepted: false,
                    confirmed: false,
                    tx_fingerprint: String::new(),
                }),
                Script::Error => Err(anyhow::anyhow!("relay unavailable")),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!("hung submission should be outwaited");
                }
            }
        }
    }

    fn live_config() -> SubmissionConfig {
        SubmissionConfig {
            live_mode: true,
            bundle_timeout_ms: 20,
            priority_fee_timeout_ms: 20,
            standard_timeout_ms: 20,
            ..SubmissionConfig::default()
        }
    }

    fn intent() -> TxIntent {
        TxIntent::new("d-test-1", "Mint11111111", TradeSide::Entry, 50_000_000, 1.0)
    }

    #[tokio::test]
    async fn first_tier_confirmation_stops_the_fallback() {
        let client = ScriptedClient::new(vec![(SubmissionTier::Bundle, Script::Confirm)]);
        let pipeline = SubmissionPipeline::new(client.clone(), live_config());

        let outcome = pipeline.submit(&intent()).await;
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.attempts[0].tier, SubmissionTier::Bundle);
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::Confirmed);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_falls_through_to_next_tier() {
        let client = ScriptedClient::new(vec![
            (SubmissionTier::Bundle, Script::Hang),
            (SubmissionTier::PriorityFee, Script::Confirm),
        ]);
        let pipeline = SubmissionPipeline::new(client, live_config());

        let outcome = pipeline.submit(&intent()).await;
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::Pending);
        let terminal = outcome.attempts.last().unwrap();
        assert_eq!(terminal.tier, SubmissionTier::PriorityFee);
        assert_eq!(terminal.outcome, AttemptOutcome::Confirmed);
    }

    #[tokio::test]
    async fn all_tiers_failing_is_terminal_with_no_confirmation() {
        let client = ScriptedClient::new(vec![
            (SubmissionTier::Bundle, Script::Error),
            (SubmissionTier::PriorityFee, Script::Reject),
            (SubmissionTier::Standard, Script::Error),
        ]);
        let pipeline = SubmissionPipeline::new(client, live_config());

        let outcome = pipeline.submit(&intent()).await;
        assert!(outcome.all_tiers_failed());
        assert_eq!(outcome.attempts.len(), 3);
    }

    #[tokio::test]
    async fn late_confirmation_from_an_earlier_tier_is_a_conflict() {
        let client = ScriptedClient::new(vec![
            (SubmissionTier::Bundle, Script::Hang),
            (SubmissionTier::PriorityFee, Script::Confirm),
        ]);
        let (events_tx, mut events_rx) = crate::events::event_channel(16);
        let pipeline = SubmissionPipeline::new(client, live_config()).with_events(events_tx);

        let intent = intent();
        let outcome = pipeline.submit(&intent).await;
        assert!(outcome.confirmed_attempt().is_some());

        // The hung bundle tier lands after the priority-fee fill was acted on.
        let err = pipeline
            .report_late_confirmation(&intent.fingerprint, SubmissionTier::Bundle)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::LateConfirmationConflict {
                winner: SubmissionTier::PriorityFee,
                late_tier: SubmissionTier::Bundle,
                ..
            }
        ));

        // The winning tier re-reporting is not a conflict.
        let action = pipeline
            .report_late_confirmation(&intent.fingerprint, SubmissionTier::PriorityFee)
            .await
            .unwrap();
        assert_eq!(action, ReconcileAction::DuplicateIgnored);

        let conflict_reported = std::iter::from_fn(|| events_rx.try_recv().ok())
            .any(|e| matches!(e, BotEvent::LateConfirmationConflict { .. }));
        assert!(conflict_reported);
    }

    #[tokio::test]
    async fn non_live_mode_produces_a_single_simulated_fill() {
        let client = ScriptedClient::new(vec![]);
        let config = SubmissionConfig::default(); // live_mode: false
        let pipeline = SubmissionPipeline::new(client.clone(), config);

        let outcome = pipeline.submit(&intent()).await;
        assert_eq!(outcome.attempts.len(), 1);
        let attempt = &outcome.attempts[0];
        assert_eq!(attempt.tier, SubmissionTier::Simulated);
        assert_eq!(attempt.outcome, AttemptOutcome::Confirmed);
        let fill = attempt.fill_price.unwrap();
        assert!((fill - 1.0).abs() < 0.01, "fill {} too far from reference", fill);
        // No network call was made
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }
}
