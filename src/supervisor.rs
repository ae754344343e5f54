//! Position lifecycle supervision.
//!
//! Every live position moves Open -> Closing -> Closed, never backwards.
//! The supervisor ticks on its own cadence, re-evaluates stop-loss and
//! take-profit triggers against fresh prices, and drives exits through the
//! same tiered submission pipeline entries use. A close that cannot be
//! confirmed after bounded retries is escalated for operator attention
//! rather than silently dropped; the position stays Closing and the risk
//! ledger is not settled until an exit actually confirms.

use crate::config::SupervisorConfig;
use crate::error::EngineError;
use crate::events::{emit, BotEvent, EventSender};
use crate::ledger::RiskLedger;
use crate::market::MarketDataSource;
use crate::stake::{IdleCapitalStaker, NoopStaker};
use crate::storage::StateStore;
use crate::submission::{SubmissionPipeline, TradeSide, TxIntent};
use crate::types::{now_ms, AssetId, TimestampMs};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    /// Surplus fill or operator-forced exit
    Emergency,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::Emergency => "emergency",
        }
    }
}

/// A held position. Prices are quote-currency floats, size and PnL are in
/// base units (lamports).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub asset_id: AssetId,
    pub entry_price: f64,
    pub size: u64,
    pub opened_at: TimestampMs,
    pub state: PositionState,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub realized_pnl: Option<i64>,
    pub close_attempts: u32,
    pub escalated: bool,
    pub closed_at: Option<TimestampMs>,
    pub exit_reason: Option<ExitReason>,
    /// Fingerprint of the entry intent, kept so the reconciler entry can be
    /// dropped once the position is archived.
    #[serde(default)]
    pub entry_fingerprint: Option<String>,
}

impl Position {
    /// Open a position with exit triggers derived from the entry price.
    pub fn open(
        asset_id: &str,
        entry_price: f64,
        size: u64,
        stop_loss_pct: f64,
        take_profit_multiplier: f64,
    ) -> Self {
        Self {
            asset_id: asset_id.to_string(),
            entry_price,
            size,
            opened_at: now_ms(),
            state: PositionState::Open,
            stop_loss_price: entry_price * (1.0 - stop_loss_pct),
            take_profit_price: entry_price * take_profit_multiplier,
            realized_pnl: None,
            close_attempts: 0,
            escalated: false,
            closed_at: None,
            exit_reason: None,
            entry_fingerprint: None,
        }
    }

    /// Which exit trigger, if any, the given price crosses.
    pub fn exit_trigger(&self, price: f64) -> Option<ExitReason> {
        if price >= self.take_profit_price {
            Some(ExitReason::TakeProfit)
        } else if price <= self.stop_loss_price {
            Some(ExitReason::StopLoss)
        } else {
            None
        }
    }
}

/// In-memory arena of live positions, keyed by asset. At most one position
/// per asset can exist at a time.
pub struct PositionBook {
    positions: Mutex<HashMap<AssetId, Position>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            positions: Mutex::new(HashMap::new()),
        }
    }

    /// Seed the book from persisted positions at startup.
    pub async fn restore(&self, positions: Vec<Position>) {
        let mut book = self.positions.lock().await;
        for position in positions {
            book.insert(position.asset_id.clone(), position);
        }
    }

    pub async fn insert(&self, position: Position) -> Result<(), EngineError> {
        let mut book = self.positions.lock().await;
        if book.contains_key(&position.asset_id) {
            return Err(EngineError::DuplicatePosition {
                asset_id: position.asset_id,
            });
        }
        book.insert(position.asset_id.clone(), position);
        Ok(())
    }

    pub async fn contains(&self, asset_id: &str) -> bool {
        self.positions.lock().await.contains_key(asset_id)
    }

    pub async fn get(&self, asset_id: &str) -> Option<Position> {
        self.positions.lock().await.get(asset_id).cloned()
    }

    pub async fn update(&self, position: Position) {
        self.positions
            .lock()
            .await
            .insert(position.asset_id.clone(), position);
    }

    pub async fn remove(&self, asset_id: &str) -> Option<Position> {
        self.positions.lock().await.remove(asset_id)
    }

    pub async fn live_assets(&self) -> Vec<AssetId> {
        self.positions.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.positions.lock().await.len()
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}

/// Ticks over live positions and drives them to exit.
pub struct PositionSupervisor {
    book: Arc<PositionBook>,
    ledger: Arc<RiskLedger>,
    store: Arc<dyn StateStore>,
    pipeline: Arc<SubmissionPipeline>,
    market: Arc<dyn MarketDataSource>,
    config: SupervisorConfig,
    events: EventSender,
    /// Where capital freed by a settled close is parked until the next entry.
    staker: Arc<dyn IdleCapitalStaker>,
    /// Assets currently being supervised, so overlapping ticks never act on
    /// the same position twice.
    in_flight: Mutex<HashSet<AssetId>>,
}

impl PositionSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        book: Arc<PositionBook>,
        ledger: Arc<RiskLedger>,
        store: Arc<dyn StateStore>,
        pipeline: Arc<SubmissionPipeline>,
        market: Arc<dyn MarketDataSource>,
        config: SupervisorConfig,
        events: EventSender,
    ) -> Self {
        Self {
            book,
            ledger,
            store,
            pipeline,
            market,
            config,
            events,
            staker: Arc::new(NoopStaker),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Replace the default no-op staker with a real idle-capital sink.
    pub fn with_staker(mut self, staker: Arc<dyn IdleCapitalStaker>) -> Self {
        self.staker = staker;
        self
    }

    pub fn book(&self) -> Arc<PositionBook> {
        self.book.clone()
    }

    /// Admit a freshly confirmed entry into supervision and persist it.
    /// Fails without side effects if the asset already has a live position.
    pub async fn register_position(&self, position: Position) -> Result<(), EngineError> {
        self.book.insert(position.clone()).await?;
        if let Err(e) = self.store.upsert_position(&position).await {
            error!(asset = %position.asset_id, "Failed to persist new position: {:#}", e);
        }
        info!(
            asset = %position.asset_id,
            entry_price = position.entry_price,
            size = position.size,
            stop_loss = position.stop_loss_price,
            take_profit = position.take_profit_price,
            "Position opened"
        );
        Ok(())
    }

    /// One supervision pass over every live position. Per-asset failures are
    /// contained; they never abort the pass or the loop.
    pub async fn tick(&self) {
        for asset_id in self.book.live_assets().await {
            if !self.try_claim(&asset_id).await {
                debug!(asset = %asset_id, "Supervision already in flight, skipping");
                continue;
            }
            if let Err(e) = self.supervise_asset(&asset_id).await {
                warn!(asset = %asset_id, "Supervision pass failed: {:#}", e);
            }
            self.release(&asset_id).await;
        }
    }

    async fn try_claim(&self, asset_id: &str) -> bool {
        self.in_flight.lock().await.insert(asset_id.to_string())
    }

    async fn release(&self, asset_id: &str) {
        self.in_flight.lock().await.remove(asset_id);
    }

    async fn supervise_asset(&self, asset_id: &str) -> Result<(), EngineError> {
        let position = match self.book.get(asset_id).await {
            Some(p) => p,
            None => return Ok(()),
        };

        match position.state {
            PositionState::Closed => Ok(()),
            PositionState::Closing => {
                // A close that was interrupted (crash, escalation) resumes
                // with its recorded trigger; a restored position without one
                // is treated as an emergency exit.
                let reason = position.exit_reason.unwrap_or(ExitReason::Emergency);
                let price = match self.market.fetch_price(asset_id).await {
                    Ok(Some(p)) => p,
                    _ => position.entry_price,
                };
                self.close_position(position, price, reason).await
            }
            PositionState::Open => {
                let price = match self.market.fetch_price(asset_id).await {
                    Ok(Some(p)) => p,
                    Ok(None) => {
                        warn!(asset = %asset_id, "No price available, holding position");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(asset = %asset_id, "Price fetch failed, holding position: {:#}", e);
                        return Ok(());
                    }
                };
                match position.exit_trigger(price) {
                    Some(reason) => {
                        let mut closing = position;
                        closing.state = PositionState::Closing;
                        closing.exit_reason = Some(reason);
                        self.book.update(closing.clone()).await;
                        if let Err(e) = self.store.upsert_position(&closing).await {
                            error!(asset = %asset_id, "Failed to persist Closing state: {:#}", e);
                        }
                        info!(
                            asset = %asset_id,
                            price,
                            reason = reason.as_str(),
                            "Exit triggered"
                        );
                        self.close_position(closing, price, reason).await
                    }
                    None => {
                        debug!(asset = %asset_id, price, "Position within bounds");
                        Ok(())
                    }
                }
            }
        }
    }

    /// Drive the exit through the submission pipeline with bounded
    /// exponential-backoff retries. The exit intent fingerprint is derived
    /// from the asset and its open timestamp, so retried and resumed closes
    /// reconcile as one intent.
    async fn close_position(
        &self,
        mut position: Position,
        trigger_price: f64,
        reason: ExitReason,
    ) -> Result<(), EngineError> {
        let decision_id = exit_decision_id(&position.asset_id, position.opened_at);
        let intent = TxIntent::new(
            &decision_id,
            &position.asset_id,
            TradeSide::Exit,
            position.size,
            trigger_price,
        );

        let attempts = AtomicU32::new(position.close_attempts);
        let strategy = ExponentialBackoff::from_millis(self.config.close_retry_base_delay_ms)
            .max_delay(Duration::from_secs(10))
            .take(self.config.max_close_retries as usize);

        let result = Retry::spawn(strategy, || {
            let intent = intent.clone();
            attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                let outcome = self.pipeline.submit(&intent).await;
                match outcome.confirmed_attempt() {
                    Some(attempt) => Ok(attempt.clone()),
                    None => Err(()),
                }
            }
        })
        .await;

        position.close_attempts = attempts.load(Ordering::SeqCst);

        match result {
            Ok(confirmed) => {
                let exit_price = confirmed.fill_price.unwrap_or(trigger_price);
                let pnl = pnl_lamports(position.entry_price, exit_price, position.size);
                position.state = PositionState::Closed;
                position.closed_at = Some(now_ms());
                position.realized_pnl = Some(pnl);
                position.exit_reason = Some(reason);

                self.ledger.settle_close(position.size, pnl).await;
                if let Err(e) = self.store.archive_position(&position).await {
                    error!(asset = %position.asset_id, "Failed to archive closed trade: {:#}", e);
                }
                self.book.remove(&position.asset_id).await;
                let reconciler = self.pipeline.reconciler();
                reconciler.forget(&intent.fingerprint).await;
                if let Some(entry_fp) = &position.entry_fingerprint {
                    reconciler.forget(entry_fp).await;
                }

                let freed = position.size.saturating_add_signed(pnl);
                if freed > 0 {
                    if let Err(e) = self.staker.deposit(freed).await {
                        warn!(asset = %position.asset_id, "Idle-capital deposit failed: {:#}", e);
                    }
                }

                info!(
                    asset = %position.asset_id,
                    exit_price,
                    pnl_lamports = pnl,
                    reason = reason.as_str(),
                    "Position closed"
                );
                emit(
                    &self.events,
                    BotEvent::PositionClosed {
                        asset_id: position.asset_id.clone(),
                        exit_reason: reason,
                        realized_pnl: pnl,
                    },
                );
                Ok(())
            }
            Err(()) => {
                // Still exposed; escalate and keep retrying on later ticks.
                position.escalated = true;
                let attempts_made = position.close_attempts;
                self.book.update(position.clone()).await;
                if let Err(e) = self.store.upsert_position(&position).await {
                    error!(asset = %position.asset_id, "Failed to persist escalation: {:#}", e);
                }
                error!(
                    asset = %position.asset_id,
                    attempts = attempts_made,
                    "Close could not be confirmed, escalating"
                );
                emit(
                    &self.events,
                    BotEvent::CloseEscalated {
                        asset_id: position.asset_id.clone(),
                        attempts: attempts_made,
                    },
                );
                Err(EngineError::SupervisorCloseFailedExhausted {
                    asset_id: position.asset_id,
                    attempts: attempts_made,
                })
            }
        }
    }
}

/// Realized PnL in lamports for a size held from entry to exit price.
/// Deterministic exit decision id: retried and restart-resumed closes of the
/// same position produce the same intent fingerprint. The asset prefix is
/// taken in characters, not bytes, so non-ASCII ids cannot split a char.
fn exit_decision_id(asset_id: &str, opened_at: TimestampMs) -> String {
    let prefix: String = asset_id.chars().take(8).collect();
    format!("x-{}-{}", prefix, opened_at)
}

pub fn pnl_lamports(entry_price: f64, exit_price: f64, size: u64) -> i64 {
    if entry_price <= 0.0 {
        return 0;
    }
    ((exit_price / entry_price - 1.0) * size as f64).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RiskConfig, SubmissionConfig};
    use crate::events::event_channel;
    use crate::market::MarketDataSource;
    use crate::storage::memory::MemoryStateStore;
    use crate::submission::{SubmissionTier, TierClient, TierParams, TierResponse};
    use crate::types::MarketSnapshot;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct ScriptedPrices {
        prices: Mutex<VecDeque<Option<f64>>>,
    }

    impl ScriptedPrices {
        fn new(prices: Vec<Option<f64>>) -> Arc<Self> {
            Arc::new(Self {
                prices: Mutex::new(prices.into()),
            })
        }
    }

    #[async_trait]
    impl MarketDataSource for ScriptedPrices {
        async fn fetch_snapshot(&self, _asset_id: &str) -> Result<Option<MarketSnapshot>> {
            Ok(None)
        }

        async fn fetch_price(&self, _asset_id: &str) -> Result<Option<f64>> {
            Ok(self.prices.lock().await.pop_front().flatten())
        }
    }

    struct AlwaysFailClient;

    #[async_trait]
    impl TierClient for AlwaysFailClient {
        async fn submit(
            &self,
            _tier: SubmissionTier,
            _intent: &TxIntent,
            _params: &TierParams,
        ) -> Result<TierResponse> {
            Err(anyhow::anyhow!("relay down"))
        }
    }

    struct NeverCalledClient;

    #[async_trait]
    impl TierClient for NeverCalledClient {
        async fn submit(
            &self,
            _tier: SubmissionTier,
            _intent: &TxIntent,
            _params: &TierParams,
        ) -> Result<TierResponse> {
            panic!("network client must not be used in simulated mode");
        }
    }

    async fn supervisor_with(
        prices: Arc<ScriptedPrices>,
        submission: SubmissionConfig,
        supervisor_config: SupervisorConfig,
        live_client: bool,
    ) -> (Arc<PositionSupervisor>, Arc<RiskLedger>, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        let ledger = Arc::new(
            RiskLedger::load(RiskConfig::default(), store.clone(), 0)
                .await
                .unwrap(),
        );
        let client: Arc<dyn TierClient> = if live_client {
            Arc::new(AlwaysFailClient)
        } else {
            Arc::new(NeverCalledClient)
        };
        let pipeline = Arc::new(SubmissionPipeline::new(client, submission));
        let (events, _rx) = event_channel(64);
        let supervisor = Arc::new(PositionSupervisor::new(
            Arc::new(PositionBook::new()),
            ledger.clone(),
            store.clone(),
            pipeline,
            prices,
            supervisor_config,
            events,
        ));
        (supervisor, ledger, store)
    }

    fn position(entry: f64, size: u64) -> Position {
        Position::open("MintAAAA1111", entry, size, 0.30, 2.0)
    }

    #[test]
    fn exit_triggers_are_derived_from_entry_price() {
        let p = position(1.0, 50_000_000);
        assert!((p.stop_loss_price - 0.7).abs() < 1e-9);
        assert!((p.take_profit_price - 2.0).abs() < 1e-9);
        assert_eq!(p.exit_trigger(1.5), None);
        assert_eq!(p.exit_trigger(2.0), Some(ExitReason::TakeProfit));
        assert_eq!(p.exit_trigger(0.7), Some(ExitReason::StopLoss));
    }

    #[test]
    fn exit_decision_ids_survive_non_ascii_asset_ids() {
        let id = exit_decision_id("Mïnt🦀aaaa1111", 42);
        assert_eq!(id, "x-Mïnt🦀aaa-42");
        // Same position, same intent, however often the close is retried.
        assert_eq!(id, exit_decision_id("Mïnt🦀aaaa1111", 42));
    }

    #[tokio::test]
    async fn closing_a_position_drops_its_reconciler_entries() {
        use crate::submission::ReconcileAction;

        let prices = ScriptedPrices::new(vec![Some(2.1)]);
        let store = Arc::new(MemoryStateStore::new());
        let ledger = Arc::new(
            RiskLedger::load(RiskConfig::default(), store.clone(), 0)
                .await
                .unwrap(),
        );
        let pipeline = Arc::new(SubmissionPipeline::new(
            Arc::new(NeverCalledClient),
            SubmissionConfig::default(),
        ));
        let (events, _rx) = event_channel(64);
        let supervisor = Arc::new(PositionSupervisor::new(
            Arc::new(PositionBook::new()),
            ledger.clone(),
            store,
            pipeline.clone(),
            prices,
            SupervisorConfig::default(),
            events,
        ));

        let mut p = position(1.0, 50_000_000);
        let entry_fp = "d-entry-1:entry".to_string();
        p.entry_fingerprint = Some(entry_fp.clone());
        let reconciler = pipeline.reconciler();
        reconciler
            .observe_confirmation(&entry_fp, SubmissionTier::Simulated)
            .await;
        ledger.reserve_slot(p.size).await.unwrap();
        supervisor.register_position(p).await.unwrap();

        supervisor.tick().await;
        assert!(supervisor.book().get("MintAAAA1111").await.is_none());

        // The entry intent went with the position; a late landing of the
        // same fingerprint no longer matches a recorded winner.
        assert_eq!(
            reconciler
                .observe_confirmation(&entry_fp, SubmissionTier::Standard)
                .await,
            ReconcileAction::FirstConfirmation
        );
    }

    #[tokio::test]
    async fn in_bounds_price_holds_then_take_profit_closes() {
        let prices = ScriptedPrices::new(vec![Some(1.0), Some(2.1)]);
        let (supervisor, ledger, store) = supervisor_with(
            prices,
            SubmissionConfig::default(),
            SupervisorConfig::default(),
            false,
        )
        .await;

        let p = position(1.0, 50_000_000);
        ledger.reserve_slot(p.size).await.unwrap();
        supervisor.register_position(p).await.unwrap();

        supervisor.tick().await;
        assert_eq!(
            supervisor.book().get("MintAAAA1111").await.unwrap().state,
            PositionState::Open
        );

        supervisor.tick().await;
        assert!(supervisor.book().get("MintAAAA1111").await.is_none());
        assert_eq!(store.archived_count().await, 1);
        assert_eq!(ledger.view().await.open_position_count, 0);
        // Profit does not consume loss budget
        assert_eq!(ledger.view().await.daily_loss_accumulated, 0);
    }

    #[tokio::test]
    async fn stop_loss_close_settles_the_loss_into_the_ledger() {
        let prices = ScriptedPrices::new(vec![Some(0.65), Some(0.65)]);
        let (supervisor, ledger, _store) = supervisor_with(
            prices,
            SubmissionConfig::default(),
            SupervisorConfig::default(),
            false,
        )
        .await;

        let p = position(1.0, 100_000_000);
        ledger.reserve_slot(p.size).await.unwrap();
        supervisor.register_position(p).await.unwrap();

        supervisor.tick().await;

        assert!(supervisor.book().get("MintAAAA1111").await.is_none());
        let view = ledger.view().await;
        assert_eq!(view.open_position_count, 0);
        // Simulated fill jitters around the trigger price; the loss must be
        // close to 35% of size.
        let loss = view.daily_loss_accumulated as f64;
        assert!(
            (loss - 35_000_000.0).abs() < 1_500_000.0,
            "unexpected loss {}",
            loss
        );
    }

    #[tokio::test]
    async fn missing_price_holds_the_position() {
        let prices = ScriptedPrices::new(vec![None]);
        let (supervisor, ledger, _store) = supervisor_with(
            prices,
            SubmissionConfig::default(),
            SupervisorConfig::default(),
            false,
        )
        .await;

        let p = position(1.0, 50_000_000);
        ledger.reserve_slot(p.size).await.unwrap();
        supervisor.register_position(p).await.unwrap();
        supervisor.tick().await;

        assert_eq!(
            supervisor.book().get("MintAAAA1111").await.unwrap().state,
            PositionState::Open
        );
    }

    #[tokio::test]
    async fn second_position_for_the_same_asset_is_rejected() {
        let prices = ScriptedPrices::new(vec![]);
        let (supervisor, _ledger, _store) = supervisor_with(
            prices,
            SubmissionConfig::default(),
            SupervisorConfig::default(),
            false,
        )
        .await;

        supervisor
            .register_position(position(1.0, 50_000_000))
            .await
            .unwrap();
        let err = supervisor
            .register_position(position(1.1, 10_000_000))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicatePosition { .. }));
    }

    #[tokio::test]
    async fn unconfirmable_close_escalates_and_keeps_exposure_in_the_ledger() {
        let prices = ScriptedPrices::new(vec![Some(2.5)]);
        let submission = SubmissionConfig {
            live_mode: true,
            bundle_timeout_ms: 20,
            priority_fee_timeout_ms: 20,
            standard_timeout_ms: 20,
            ..SubmissionConfig::default()
        };
        let supervisor_config = SupervisorConfig {
            max_close_retries: 2,
            close_retry_base_delay_ms: 1,
        };
        let (supervisor, ledger, _store) =
            supervisor_with(prices, submission, supervisor_config, true).await;

        let p = position(1.0, 50_000_000);
        ledger.reserve_slot(p.size).await.unwrap();
        supervisor.register_position(p).await.unwrap();

        supervisor.tick().await;

        let held = supervisor.book().get("MintAAAA1111").await.unwrap();
        assert_eq!(held.state, PositionState::Closing);
        assert!(held.escalated);
        assert!(held.close_attempts >= 2);
        // The ledger still carries the exposure until an exit confirms.
        assert_eq!(ledger.view().await.open_position_count, 1);
    }

    #[tokio::test]
    async fn restored_closing_position_resumes_its_exit() {
        let prices = ScriptedPrices::new(vec![Some(1.8)]);
        let (supervisor, ledger, store) = supervisor_with(
            prices,
            SubmissionConfig::default(),
            SupervisorConfig::default(),
            false,
        )
        .await;

        let mut p = position(1.0, 50_000_000);
        p.state = PositionState::Closing;
        p.exit_reason = Some(ExitReason::TakeProfit);
        ledger.reserve_slot(p.size).await.unwrap();
        supervisor.book().restore(vec![p]).await;

        supervisor.tick().await;

        assert!(supervisor.book().get("MintAAAA1111").await.is_none());
        assert_eq!(store.archived_count().await, 1);
        assert_eq!(ledger.view().await.open_position_count, 0);
    }
}
