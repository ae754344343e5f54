//! Process-wide risk ledger.
//!
//! Capital committed, daily realized loss and the open-position count live
//! behind one mutex; every read-modify-write (headroom check + reserve, or
//! PnL settle) is atomic relative to all other ledger operations across both
//! cadence drivers. The ledger is owned explicitly and passed by `Arc`, never
//! an ambient global, so every mutation site is enumerable.

use crate::config::RiskConfig;
use crate::storage::{LedgerDayRecord, StateStore};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Why a slot reservation was denied. Rejections, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadroomDenied {
    LossLimitReached,
    PositionCapReached,
}

/// Read-only view of the ledger at one instant.
#[derive(Debug, Clone)]
pub struct LedgerView {
    pub daily_loss_accumulated: u64,
    pub daily_loss_limit: u64,
    pub open_position_count: usize,
    pub max_open_positions: usize,
    pub committed_capital: u64,
    pub trades_today: u32,
}

impl LedgerView {
    /// Remaining loss budget before further trades are blocked.
    pub fn loss_headroom(&self) -> u64 {
        self.daily_loss_limit
            .saturating_sub(self.daily_loss_accumulated)
    }
}

struct LedgerState {
    day: String,
    daily_loss_accumulated: u64,
    open_position_count: usize,
    committed_capital: u64,
    trades_today: u32,
}

/// Mutation-guarded risk state, persisted per UTC day.
pub struct RiskLedger {
    inner: Mutex<LedgerState>,
    config: RiskConfig,
    store: Arc<dyn StateStore>,
}

fn today_key() -> String {
    Utc::now().date_naive().to_string()
}

impl RiskLedger {
    /// Load today's ledger record from the store. `restored_open_positions`
    /// is the live-position count recovered at startup; committed capital is
    /// rebuilt from those positions by the caller via `restore_commitment`.
    pub async fn load(
        config: RiskConfig,
        store: Arc<dyn StateStore>,
        restored_open_positions: usize,
    ) -> Result<Self> {
        let day = today_key();
        let record = store.load_ledger_day(&day).await?;
        let (daily_loss_accumulated, trades_today) = match record {
            Some(r) => (r.daily_loss_accumulated, r.trades_today),
            None => (0, 0),
        };
        info!(
            day = %day,
            loss = daily_loss_accumulated,
            open_positions = restored_open_positions,
            "Risk ledger loaded"
        );
        Ok(Self {
            inner: Mutex::new(LedgerState {
                day,
                daily_loss_accumulated,
                open_position_count: restored_open_positions,
                committed_capital: 0,
                trades_today,
            }),
            config,
            store,
        })
    }

    /// Add restored position sizes to committed capital after a restart.
    pub async fn restore_commitment(&self, size: u64) {
        let mut state = self.inner.lock().await;
        state.committed_capital = state.committed_capital.saturating_add(size);
    }

    pub async fn view(&self) -> LedgerView {
        let mut state = self.inner.lock().await;
        self.rollover_if_needed(&mut state).await;
        LedgerView {
            daily_loss_accumulated: state.daily_loss_accumulated,
            daily_loss_limit: self.config.daily_loss_limit,
            open_position_count: state.open_position_count,
            max_open_positions: self.config.max_open_positions,
            committed_capital: state.committed_capital,
            trades_today: state.trades_today,
        }
    }

    /// Atomically re-check headroom and reserve one position slot plus the
    /// committed size. Called before submission; must be rolled back with
    /// [`release_slot`] if every tier fails, so a failed submission leaves no
    /// trace in the ledger.
    pub async fn reserve_slot(&self, size: u64) -> Result<(), HeadroomDenied> {
        let mut state = self.inner.lock().await;
        self.rollover_if_needed(&mut state).await;

        if state.daily_loss_accumulated >= self.config.daily_loss_limit {
            return Err(HeadroomDenied::LossLimitReached);
        }
        if state.open_position_count >= self.config.max_open_positions {
            return Err(HeadroomDenied::PositionCapReached);
        }

        state.open_position_count += 1;
        state.committed_capital = state.committed_capital.saturating_add(size);
        state.trades_today += 1;
        self.persist(&state).await;
        Ok(())
    }

    /// Roll back a reservation whose submission terminally failed.
    pub async fn release_slot(&self, size: u64) {
        let mut state = self.inner.lock().await;
        state.open_position_count = state.open_position_count.saturating_sub(1);
        state.committed_capital = state.committed_capital.saturating_sub(size);
        state.trades_today = state.trades_today.saturating_sub(1);
        self.persist(&state).await;
    }

    /// Settle a confirmed close: free the slot and the committed size, and
    /// accumulate realized losses toward the daily limit.
    pub async fn settle_close(&self, size: u64, realized_pnl: i64) {
        let mut state = self.inner.lock().await;
        self.rollover_if_needed(&mut state).await;

        state.open_position_count = state.open_position_count.saturating_sub(1);
        state.committed_capital = state.committed_capital.saturating_sub(size);
        if realized_pnl < 0 {
            state.daily_loss_accumulated = state
                .daily_loss_accumulated
                .saturating_add(realized_pnl.unsigned_abs());
            if state.daily_loss_accumulated >= self.config.daily_loss_limit {
                warn!(
                    loss = state.daily_loss_accumulated,
                    limit = self.config.daily_loss_limit,
                    "Daily loss limit reached; no further entries today"
                );
            }
        }
        self.persist(&state).await;
    }

    /// Reset accumulated loss when the UTC day changes. Callers hold the lock.
    async fn rollover_if_needed(&self, state: &mut LedgerState) {
        let today = today_key();
        if state.day != today {
            info!(from = %state.day, to = %today, "Ledger day rollover");
            state.day = today;
            state.daily_loss_accumulated = 0;
            state.trades_today = 0;
            self.persist(state).await;
        }
    }

    /// Best-effort persistence of the daily record; a write failure is logged
    /// and does not poison the in-memory ledger.
    async fn persist(&self, state: &LedgerState) {
        let record = LedgerDayRecord {
            day: state.day.clone(),
            daily_loss_accumulated: state.daily_loss_accumulated,
            trades_today: state.trades_today,
        };
        if let Err(e) = self.store.save_ledger_day(&record).await {
            warn!("Failed to persist ledger day record: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStateStore;

    fn limits() -> RiskConfig {
        RiskConfig {
            daily_loss_limit: 1_000,
            max_open_positions: 2,
            ..RiskConfig::default()
        }
    }

    async fn ledger() -> RiskLedger {
        RiskLedger::load(limits(), Arc::new(MemoryStateStore::new()), 0)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn position_cap_is_enforced() {
        let ledger = ledger().await;
        assert!(ledger.reserve_slot(100).await.is_ok());
        assert!(ledger.reserve_slot(100).await.is_ok());
        assert_eq!(
            ledger.reserve_slot(100).await,
            Err(HeadroomDenied::PositionCapReached)
        );
        let view = ledger.view().await;
        assert_eq!(view.open_position_count, 2);
        assert!(view.open_position_count <= view.max_open_positions);
    }

    #[tokio::test]
    async fn release_restores_pre_decision_state() {
        let ledger = ledger().await;
        let before = ledger.view().await;
        ledger.reserve_slot(500).await.unwrap();
        ledger.release_slot(500).await;
        let after = ledger.view().await;
        assert_eq!(before.open_position_count, after.open_position_count);
        assert_eq!(before.committed_capital, after.committed_capital);
        assert_eq!(before.trades_today, after.trades_today);
    }

    #[tokio::test]
    async fn losses_accumulate_and_block_entries() {
        let ledger = ledger().await;
        ledger.reserve_slot(400).await.unwrap();
        ledger.settle_close(400, -1_000).await;
        assert_eq!(
            ledger.reserve_slot(100).await,
            Err(HeadroomDenied::LossLimitReached)
        );
    }

    #[tokio::test]
    async fn profit_does_not_consume_loss_budget() {
        let ledger = ledger().await;
        ledger.reserve_slot(400).await.unwrap();
        ledger.settle_close(400, 250).await;
        let view = ledger.view().await;
        assert_eq!(view.daily_loss_accumulated, 0);
        assert_eq!(view.open_position_count, 0);
    }

    #[tokio::test]
    async fn daily_record_survives_reload() {
        let store = Arc::new(MemoryStateStore::new());
        let ledger = RiskLedger::load(limits(), store.clone(), 0).await.unwrap();
        ledger.reserve_slot(400).await.unwrap();
        ledger.settle_close(400, -300).await;

        let reloaded = RiskLedger::load(limits(), store, 0).await.unwrap();
        assert_eq!(reloaded.view().await.daily_loss_accumulated, 300);
    }
}
