//! Engine orchestration.
//!
//! One task owns the signal-to-entry flow: candidates arrive on a channel,
//! get deduplicated and corroboration-tracked, and each trade cycle drains a
//! bounded batch through validate -> decide -> submit. Position supervision
//! runs on its own cadence in a separate spawned task; the ledger mutex and
//! the per-asset in-flight guard serialize the two drivers where they touch
//! shared state. Every per-candidate failure is contained; nothing short of
//! the intake channel closing stops the loop.

use crate::config::BotConfig;
use crate::decision::{DecisionGate, RejectReason, TradeAction};
use crate::error::EngineError;
use crate::events::{emit, BotEvent, EventSender};
use crate::ledger::{HeadroomDenied, RiskLedger};
use crate::market::{AuxiliaryScorer, MarketDataSource};
use crate::submission::{SubmissionPipeline, TradeSide, TxIntent};
use crate::supervisor::{Position, PositionSupervisor};
use crate::types::{now_ms, AssetId, CandidateEvent, MarketSnapshot, TimestampMs};
use crate::validator::{CandidateValidator, CheckKind, SourceTracker, ValidationResult};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Dedup record for an asset that was already queued or decided.
struct SeenEntry {
    at: TimestampMs,
    /// Set when the asset was rejected solely for insufficient
    /// corroboration; the next sighting inside the window re-queues it
    /// instead of collapsing.
    rearm: bool,
}

pub struct Engine {
    config: BotConfig,
    validator: CandidateValidator,
    tracker: SourceTracker,
    gate: DecisionGate,
    ledger: Arc<RiskLedger>,
    pipeline: Arc<SubmissionPipeline>,
    supervisor: Arc<PositionSupervisor>,
    market: Arc<dyn MarketDataSource>,
    scorer: Arc<dyn AuxiliaryScorer>,
    events: EventSender,
    seen: Mutex<HashMap<AssetId, SeenEntry>>,
    queue: Mutex<VecDeque<CandidateEvent>>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BotConfig,
        ledger: Arc<RiskLedger>,
        pipeline: Arc<SubmissionPipeline>,
        supervisor: Arc<PositionSupervisor>,
        market: Arc<dyn MarketDataSource>,
        scorer: Arc<dyn AuxiliaryScorer>,
        events: EventSender,
    ) -> Self {
        let validator = CandidateValidator::new(config.validator.clone());
        let tracker = SourceTracker::new(Duration::from_secs(config.validator.dedup_window_secs));
        let gate = DecisionGate::new(config.risk.clone());
        Self {
            config,
            validator,
            tracker,
            gate,
            ledger,
            pipeline,
            supervisor,
            market,
            scorer,
            events,
            seen: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Main loop: candidate intake and the trade cycle in this task, the
    /// supervisor cadence in its own spawned task so a slow trade cycle can
    /// never delay exit ticks. Returns when the intake channel closes.
    pub async fn run(self: Arc<Self>, mut intake: mpsc::Receiver<CandidateEvent>) {
        let mut cycle = interval(Duration::from_secs(self.config.scheduler.cycle_interval_secs));
        cycle.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            cycle_secs = self.config.scheduler.cycle_interval_secs,
            supervisor_secs = self.config.scheduler.supervisor_interval_secs,
            live = self.config.submission.live_mode,
            "Engine loop started"
        );

        let supervisor = self.supervisor.clone();
        let supervisor_secs = self.config.scheduler.supervisor_interval_secs;
        let supervise_task = tokio::spawn(async move {
            let mut supervise = interval(Duration::from_secs(supervisor_secs));
            supervise.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                supervise.tick().await;
                supervisor.tick().await;
            }
        });

        loop {
            tokio::select! {
                maybe = intake.recv() => match maybe {
                    Some(candidate) => self.ingest(candidate).await,
                    None => {
                        info!("Candidate intake closed, stopping engine loop");
                        break;
                    }
                },
                _ = cycle.tick() => self.run_cycle().await,
            }
        }
        supervise_task.abort();
    }

    /// Admit a candidate sighting. Every sighting feeds the corroboration
    /// tracker; only the first sighting per dedup window (or a re-armed
    /// one) is queued for a trade cycle.
    pub async fn ingest(&self, candidate: CandidateEvent) {
        let sources = self
            .tracker
            .observe(&candidate.asset_id, &candidate.source)
            .await;
        emit(
            &self.events,
            BotEvent::CandidateObserved {
                asset_id: candidate.asset_id.clone(),
                source: candidate.source.clone(),
            },
        );

        let window_ms = self.config.validator.dedup_window_secs * 1000;
        let now = now_ms();
        let mut seen = self.seen.lock().await;
        let queue_it = match seen.get(&candidate.asset_id) {
            None => true,
            Some(entry) if now.saturating_sub(entry.at) > window_ms => true,
            Some(entry) if entry.rearm => {
                debug!(
                    asset = %candidate.asset_id,
                    sources,
                    "Re-queuing candidate after new corroborating sighting"
                );
                true
            }
            Some(_) => {
                debug!(asset = %candidate.asset_id, "Duplicate sighting collapsed");
                false
            }
        };
        if queue_it {
            seen.insert(
                candidate.asset_id.clone(),
                SeenEntry { at: now, rearm: false },
            );
            drop(seen);
            self.queue.lock().await.push_back(candidate);
        }
    }

    /// One trade cycle: drop expired dedup records, then drain a bounded
    /// batch of queued candidates.
    pub async fn run_cycle(&self) {
        self.prune_seen().await;
        let batch: Vec<CandidateEvent> = {
            let mut queue = self.queue.lock().await;
            let take = queue.len().min(self.config.scheduler.max_candidates_per_cycle);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }
        debug!(candidates = batch.len(), "Trade cycle starting");

        for candidate in batch {
            let asset_id = candidate.asset_id.clone();
            if let Err(e) = self.process_candidate(candidate).await {
                warn!(asset = %asset_id, "Candidate processing failed: {:#}", e);
            }
        }
    }

    /// Full pipeline for one candidate. Everything that can touch the
    /// network before the decision (snapshot fetch, auxiliary scoring) runs
    /// under the per-candidate deadline; submission is bounded separately by
    /// its per-tier limits, so the cycle as a whole has no unbounded wait.
    pub async fn process_candidate(&self, candidate: CandidateEvent) -> anyhow::Result<()> {
        let asset_id = candidate.asset_id.clone();
        let corroborating = self.tracker.count(&asset_id).await;
        let has_live_position = self.supervisor.book().contains(&asset_id).await;

        let deadline = Duration::from_secs(self.config.scheduler.candidate_deadline_secs);
        let (snapshot, auxiliary_score) = match timeout(deadline, self.assess(&candidate)).await {
            Ok(assessed) => assessed,
            Err(_) => {
                warn!(asset = %asset_id, "Candidate deadline hit, failing closed");
                (
                    MarketSnapshot::unavailable(&asset_id, now_ms()),
                    self.config.risk.default_auxiliary_score,
                )
            }
        };

        let validation = self.validator.validate(&candidate, &snapshot, corroborating);

        let view = self.ledger.view().await;
        let decision = self
            .gate
            .decide(&validation, auxiliary_score, &view, has_live_position);

        let reason = match &decision.action {
            TradeAction::Accept => {
                self.mark_decided(&asset_id, false).await;
                return self.execute_entry(&decision.decision_id, &asset_id, decision.size, &snapshot).await;
            }
            TradeAction::Reject(reason) => *reason,
        };

        debug!(
            asset = %asset_id,
            reason = reason.as_str(),
            score = validation.score,
            "Candidate rejected"
        );
        if reason == RejectReason::LossLimitReached {
            emit(
                &self.events,
                BotEvent::DailyLossLimitReached {
                    accumulated: view.daily_loss_accumulated,
                    limit: view.daily_loss_limit,
                },
            );
        }
        emit(
            &self.events,
            BotEvent::CandidateRejected {
                asset_id: asset_id.clone(),
                reason,
                detail: decision.reason.clone(),
            },
        );
        if validation.verdict == crate::validator::Verdict::Fail {
            emit(
                &self.events,
                BotEvent::ValidationFailed {
                    asset_id: asset_id.clone(),
                    score: validation.score,
                    failed_checks: validation.failed_summary(),
                },
            );
        }
        self.mark_decided(&asset_id, corroboration_only_failure(&validation))
            .await;
        Ok(())
    }

    /// Data-gathering phase: market snapshot plus the auxiliary opinion.
    /// Both can suspend on the network, so the caller bounds the whole
    /// phase with the candidate deadline.
    async fn assess(&self, candidate: &CandidateEvent) -> (MarketSnapshot, u8) {
        let snapshot = self.gather_snapshot(candidate).await;
        let auxiliary_score = match self.scorer.score(&snapshot).await {
            Ok(score) => score,
            Err(e) => {
                warn!(
                    asset = %candidate.asset_id,
                    "Auxiliary scorer failed, using neutral default: {:#}", e
                );
                self.config.risk.default_auxiliary_score
            }
        };
        (snapshot, auxiliary_score)
    }

    /// Fetch the market snapshot, overlaying listener-supplied facts the
    /// market API cannot answer. Any fetch failure degrades to an
    /// all-unavailable snapshot, which validation fails closed on.
    async fn gather_snapshot(&self, candidate: &CandidateEvent) -> MarketSnapshot {
        let bound = Duration::from_secs(self.config.market.snapshot_timeout_secs);
        let fetched = timeout(bound, self.market.fetch_snapshot(&candidate.asset_id)).await;
        let mut snapshot = match fetched {
            Ok(Ok(Some(snapshot))) => snapshot,
            Ok(Ok(None)) => {
                warn!(asset = %candidate.asset_id, "No market data for candidate, failing closed");
                MarketSnapshot::unavailable(&candidate.asset_id, now_ms())
            }
            Ok(Err(e)) => {
                warn!(asset = %candidate.asset_id, "Market data fetch failed, failing closed: {:#}", e);
                MarketSnapshot::unavailable(&candidate.asset_id, now_ms())
            }
            Err(_) => {
                warn!(asset = %candidate.asset_id, "Market data fetch timed out, failing closed");
                MarketSnapshot::unavailable(&candidate.asset_id, now_ms())
            }
        };

        let meta = &candidate.raw_metadata;
        if snapshot.mint_authority_revoked.is_none() {
            snapshot.mint_authority_revoked =
                meta.get("mint_authority_revoked").and_then(|v| v.parse().ok());
        }
        if snapshot.lp_locked_or_burned.is_none() {
            snapshot.lp_locked_or_burned =
                meta.get("lp_locked_or_burned").and_then(|v| v.parse().ok());
        }
        if snapshot.holder_concentration_top_n.is_none() {
            snapshot.holder_concentration_top_n =
                meta.get("holder_concentration").and_then(|v| v.parse().ok());
        }
        snapshot
    }

    /// Reserve risk capacity, submit the entry, and hand the confirmed fill
    /// to supervision. A definitive submission failure rolls the
    /// reservation back so the ledger is exactly as it was before the
    /// decision.
    async fn execute_entry(
        &self,
        decision_id: &str,
        asset_id: &str,
        size: u64,
        snapshot: &MarketSnapshot,
    ) -> anyhow::Result<()> {
        let reference_price = match snapshot.last_price() {
            Some(price) if price > 0.0 => price,
            _ => {
                warn!(asset = %asset_id, "Accepted candidate has no usable price, dropping");
                return Ok(());
            }
        };

        if let Err(denied) = self.ledger.reserve_slot(size).await {
            // The gate checked a view; another entry may have raced us.
            let reason = match denied {
                HeadroomDenied::LossLimitReached => RejectReason::LossLimitReached,
                HeadroomDenied::PositionCapReached => RejectReason::SizeExceedsHeadroom,
            };
            info!(asset = %asset_id, reason = reason.as_str(), "Reservation denied at submit time");
            emit(
                &self.events,
                BotEvent::CandidateRejected {
                    asset_id: asset_id.to_string(),
                    reason,
                    detail: "risk headroom consumed by a concurrent entry".to_string(),
                },
            );
            return Ok(());
        }

        emit(
            &self.events,
            BotEvent::TradeSubmitted {
                asset_id: asset_id.to_string(),
                decision_id: decision_id.to_string(),
                size,
            },
        );

        let intent = TxIntent::new(decision_id, asset_id, TradeSide::Entry, size, reference_price);
        let outcome = self.pipeline.submit(&intent).await;

        match outcome.confirmed_attempt() {
            Some(confirmed) => {
                let entry_price = confirmed.fill_price.unwrap_or(reference_price);
                let mut position = Position::open(
                    asset_id,
                    entry_price,
                    size,
                    self.config.risk.stop_loss_pct,
                    self.config.risk.take_profit_multiplier,
                );
                position.entry_fingerprint = Some(intent.fingerprint.clone());
                match self.supervisor.register_position(position).await {
                    Ok(()) => {
                        emit(
                            &self.events,
                            BotEvent::PositionOpened {
                                asset_id: asset_id.to_string(),
                                entry_price,
                                size,
                                tier: confirmed.tier,
                            },
                        );
                        Ok(())
                    }
                    Err(e) => {
                        // A position appeared between the gate check and the
                        // fill. The surplus exposure needs an operator.
                        error!(asset = %asset_id, "Confirmed entry could not be registered: {}", e);
                        self.ledger.release_slot(size).await;
                        emit(
                            &self.events,
                            BotEvent::SurplusFillDetected {
                                asset_id: asset_id.to_string(),
                                decision_id: decision_id.to_string(),
                                size,
                            },
                        );
                        Err(e.into())
                    }
                }
            }
            None => {
                // No tier confirmed. Roll the reservation back; the intent
                // stays registered with the reconciler in case a timed-out
                // tier lands late.
                self.ledger.release_slot(size).await;
                warn!(
                    asset = %asset_id,
                    decision = decision_id,
                    attempts = outcome.attempts.len(),
                    "All submission tiers failed, reservation rolled back"
                );
                emit(
                    &self.events,
                    BotEvent::SubmissionAbandoned {
                        asset_id: asset_id.to_string(),
                        decision_id: decision_id.to_string(),
                    },
                );
                Err(EngineError::SubmissionAllTiersFailed {
                    decision_id: decision_id.to_string(),
                }
                .into())
            }
        }
    }

    /// Drop dedup records older than the window. Without this the map grows
    /// by one entry per asset ever sighted.
    async fn prune_seen(&self) {
        let window_ms = self.config.validator.dedup_window_secs * 1000;
        let now = now_ms();
        self.seen
            .lock()
            .await
            .retain(|_, entry| now.saturating_sub(entry.at) <= window_ms);
    }

    async fn mark_decided(&self, asset_id: &str, rearm: bool) {
        self.seen.lock().await.insert(
            asset_id.to_string(),
            SeenEntry {
                at: now_ms(),
                rearm,
            },
        );
    }

    #[cfg(test)]
    pub(crate) async fn queued_len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

/// True when the only thing keeping the candidate out was corroboration;
/// a later sighting from another source can change that verdict, so the
/// asset is worth re-examining inside the dedup window.
fn corroboration_only_failure(validation: &ValidationResult) -> bool {
    !validation.hard_failed
        && validation.failed_checks.len() == 1
        && validation
            .failed_checks
            .contains(&CheckKind::MultiSourceCorroboration)
}
