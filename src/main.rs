//! Omni-Sniper engine binary.
//!
//! Wires storage, risk ledger, submission pipeline, supervision and the
//! engine loop together, restores persisted state, and runs until Ctrl-C.
//! Without a live relay client compiled in, submission always runs in
//! simulated mode and candidates come from the synthetic feed.

use anyhow::{Context, Result};
use omni_sniper::config::BotConfig;
use omni_sniper::events::{event_channel, BotEvent};
use omni_sniper::ledger::RiskLedger;
use omni_sniper::market::{HeuristicScorer, HttpMarketData};
use omni_sniper::scheduler::Engine;
use omni_sniper::storage::{SqliteStateStore, StateStore};
use omni_sniper::submission::{
    SubmissionPipeline, SubmissionTier, TierClient, TierParams, TierResponse, TxIntent,
};
use omni_sniper::supervisor::{PositionBook, PositionSupervisor};
use omni_sniper::types::{now_ms, CandidateEvent};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn, Level};

/// Placeholder network boundary: live submission needs a real relay client
/// plugged in here. Until then any live-mode attempt fails fast.
struct UnconfiguredTierClient;

#[async_trait::async_trait]
impl TierClient for UnconfiguredTierClient {
    async fn submit(
        &self,
        _tier: SubmissionTier,
        _intent: &TxIntent,
        _params: &TierParams,
    ) -> Result<TierResponse> {
        anyhow::bail!("no live relay client configured")
    }
}

#[derive(Default)]
struct SessionSummary {
    candidates_observed: u64,
    candidates_rejected: u64,
    trades_opened: u64,
    trades_closed: u64,
    submissions_abandoned: u64,
    escalations: u64,
    realized_pnl: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "omni_sniper.json".to_string());
    let mut config = BotConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    if config.submission.live_mode {
        warn!("Live mode requested but no relay client is configured; forcing simulated mode");
        config.submission.live_mode = false;
    }
    info!(config = %config_path, db = %config.db_path, "Starting Omni-Sniper engine");

    // Storage failure at startup is fatal; trading blind is worse than not
    // trading.
    let store: Arc<dyn StateStore> = Arc::new(
        SqliteStateStore::new(&config.db_path)
            .await
            .context("Failed to open state store")?,
    );

    // Restore persisted positions and today's risk usage.
    let restored = store.load_open_positions().await?;
    let ledger = Arc::new(RiskLedger::load(config.risk.clone(), store.clone(), restored.len()).await?);
    for position in &restored {
        ledger.restore_commitment(position.size).await;
    }
    if !restored.is_empty() {
        info!(count = restored.len(), "Restored live positions from store");
    }
    let book = Arc::new(PositionBook::new());
    book.restore(restored).await;

    let (events_tx, mut events_rx) = event_channel(1024);
    let pipeline = Arc::new(
        SubmissionPipeline::new(Arc::new(UnconfiguredTierClient), config.submission.clone())
            .with_events(events_tx.clone()),
    );
    let market = Arc::new(HttpMarketData::new(config.market.clone())?);
    let supervisor = Arc::new(PositionSupervisor::new(
        book,
        ledger.clone(),
        store.clone(),
        pipeline.clone(),
        market.clone(),
        config.supervisor.clone(),
        events_tx.clone(),
    ));

    let engine = Arc::new(Engine::new(
        config.clone(),
        ledger.clone(),
        pipeline,
        supervisor,
        market,
        Arc::new(HeuristicScorer),
        events_tx,
    ));

    let (candidate_tx, candidate_rx) = mpsc::channel::<CandidateEvent>(256);

    // Synthetic candidate feed stands in for the on-chain listener.
    let feed_handle = tokio::spawn(synthetic_feed(
        candidate_tx,
        config.scheduler.cycle_interval_secs,
    ));

    let summary = Arc::new(Mutex::new(SessionSummary::default()));
    let summary_task = summary.clone();
    let events_handle = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let mut s = summary_task.lock().await;
            match event {
                BotEvent::CandidateObserved { .. } => s.candidates_observed += 1,
                BotEvent::CandidateRejected { .. } => s.candidates_rejected += 1,
                BotEvent::PositionOpened { .. } => s.trades_opened += 1,
                BotEvent::PositionClosed { realized_pnl, .. } => {
                    s.trades_closed += 1;
                    s.realized_pnl += realized_pnl;
                }
                BotEvent::SubmissionAbandoned { .. } => s.submissions_abandoned += 1,
                BotEvent::CloseEscalated { .. } => s.escalations += 1,
                BotEvent::SurplusFillDetected { .. } => s.escalations += 1,
                _ => {}
            }
        }
    });

    let engine_handle = tokio::spawn(engine.run(candidate_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    feed_handle.abort();
    engine_handle.abort();
    events_handle.abort();

    let s = summary.lock().await;
    let view = ledger.view().await;
    info!(
        candidates = s.candidates_observed,
        rejected = s.candidates_rejected,
        opened = s.trades_opened,
        closed = s.trades_closed,
        abandoned = s.submissions_abandoned,
        escalations = s.escalations,
        realized_pnl_lamports = s.realized_pnl,
        daily_loss_lamports = view.daily_loss_accumulated,
        open_positions = view.open_position_count,
        "Session summary"
    );

    Ok(())
}

/// Emits plausible-looking candidates from two pretend sources so the whole
/// loop can be exercised without a chain connection.
async fn synthetic_feed(sender: mpsc::Sender<CandidateEvent>, interval_secs: u64) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
    let mut counter: u64 = 0;
    loop {
        ticker.tick().await;
        counter += 1;
        let asset_id = format!("SynthMint{:04}{}", counter, random_suffix());
        for source in ["synthetic-scanner-a", "synthetic-scanner-b"] {
            let mut raw_metadata = HashMap::new();
            raw_metadata.insert("mint_authority_revoked".to_string(), "true".to_string());
            raw_metadata.insert("lp_locked_or_burned".to_string(), "true".to_string());
            raw_metadata.insert("holder_concentration".to_string(), "0.18".to_string());
            let event = CandidateEvent {
                asset_id: asset_id.clone(),
                source: source.to_string(),
                first_seen_at: now_ms(),
                raw_metadata,
            };
            if sender.send(event).await.is_err() {
                return;
            }
        }
    }
}

fn random_suffix() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ123456789";
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
