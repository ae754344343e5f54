//! Durable state for the trading engine.
//!
//! The open-position set and the daily risk ledger must survive a process
//! restart: a restart cannot be allowed to forget an on-chain-committed
//! position. `StateStore` is the formal persistence contract; the SQLite
//! implementation creates its schema on startup and fails the process if it
//! cannot.

use crate::supervisor::Position;
use crate::types::AssetId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, FromRow, Pool, Sqlite};
use tracing::{debug, info};

/// One daily-keyed risk ledger record.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerDayRecord {
    /// UTC day key, e.g. "2026-08-26"
    pub day: String,
    /// Realized loss accumulated today, lamports
    pub daily_loss_accumulated: u64,
    /// Trades opened today
    pub trades_today: u32,
}

/// Persistence contract for positions and the daily ledger.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// All positions currently Open or Closing, for restart recovery.
    async fn load_open_positions(&self) -> Result<Vec<Position>>;

    /// Insert or update a live position, keyed by asset id.
    async fn upsert_position(&self, position: &Position) -> Result<()>;

    /// Move a closed position out of the live set into the trade archive.
    async fn archive_position(&self, position: &Position) -> Result<()>;

    /// Load the ledger record for a UTC day, if one exists.
    async fn load_ledger_day(&self, day: &str) -> Result<Option<LedgerDayRecord>>;

    /// Upsert the ledger record for its day.
    async fn save_ledger_day(&self, record: &LedgerDayRecord) -> Result<()>;

    async fn health_check(&self) -> Result<bool>;
}

#[derive(FromRow)]
struct PositionRow {
    asset_id: String,
    entry_price: f64,
    size: i64,
    opened_at: i64,
    state: String,
    stop_loss_price: f64,
    take_profit_price: f64,
    close_attempts: i64,
    escalated: bool,
    exit_reason: Option<String>,
    entry_fingerprint: Option<String>,
}

impl PositionRow {
    fn into_position(self) -> Result<Position> {
        Ok(Position {
            asset_id: self.asset_id,
            entry_price: self.entry_price,
            size: self.size as u64,
            opened_at: self.opened_at as u64,
            state: serde_json::from_str(&self.state).context("Bad position state in store")?,
            stop_loss_price: self.stop_loss_price,
            take_profit_price: self.take_profit_price,
            realized_pnl: None,
            close_attempts: self.close_attempts as u32,
            escalated: self.escalated,
            closed_at: None,
            exit_reason: match self.exit_reason {
                Some(raw) => serde_json::from_str(&raw).context("Bad exit reason in store")?,
                None => None,
            },
            entry_fingerprint: self.entry_fingerprint,
        })
    }
}

#[derive(FromRow)]
struct LedgerDayRow {
    day: String,
    daily_loss_accumulated: i64,
    trades_today: i64,
}

/// SQLite-backed state store.
pub struct SqliteStateStore {
    pool: Pool<Sqlite>,
}

impl SqliteStateStore {
    /// Connect and create the schema. Any failure here is fatal to startup.
    pub async fn new(db_path: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{}?mode=rwc", db_path))
            .await
            .context("Failed to connect to SQLite state database")?;

        Self::create_schema(&pool).await?;
        info!("SqliteStateStore initialized at {}", db_path);
        Ok(Self { pool })
    }

    async fn create_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                asset_id TEXT PRIMARY KEY,
                entry_price REAL NOT NULL,
                size INTEGER NOT NULL,
                opened_at INTEGER NOT NULL,
                state TEXT NOT NULL,
                stop_loss_price REAL NOT NULL,
                take_profit_price REAL NOT NULL,
                close_attempts INTEGER NOT NULL DEFAULT 0,
                escalated BOOLEAN NOT NULL DEFAULT FALSE,
                exit_reason TEXT,
                entry_fingerprint TEXT
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create positions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS closed_trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                asset_id TEXT NOT NULL,
                entry_price REAL NOT NULL,
                size INTEGER NOT NULL,
                opened_at INTEGER NOT NULL,
                closed_at INTEGER,
                realized_pnl INTEGER,
                exit_reason TEXT
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create closed_trades table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_days (
                day TEXT PRIMARY KEY,
                daily_loss_accumulated INTEGER NOT NULL,
                trades_today INTEGER NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create ledger_days table")?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load_open_positions(&self) -> Result<Vec<Position>> {
        let rows: Vec<PositionRow> = sqlx::query_as("SELECT * FROM positions;")
            .fetch_all(&self.pool)
            .await
            .context("Failed to load open positions")?;

        let mut positions = Vec::with_capacity(rows.len());
        for row in rows {
            positions.push(row.into_position()?);
        }
        info!("Restored {} live position(s) from store", positions.len());
        Ok(positions)
    }

    async fn upsert_position(&self, position: &Position) -> Result<()> {
        debug!("Persisting position for {}", position.asset_id);
        sqlx::query(
            r#"
            INSERT INTO positions (
                asset_id, entry_price, size, opened_at, state,
                stop_loss_price, take_profit_price, close_attempts, escalated,
                exit_reason, entry_fingerprint
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(asset_id) DO UPDATE SET
                state = excluded.state,
                close_attempts = excluded.close_attempts,
                escalated = excluded.escalated,
                exit_reason = excluded.exit_reason;
            "#,
        )
        .bind(&position.asset_id)
        .bind(position.entry_price)
        .bind(position.size as i64)
        .bind(position.opened_at as i64)
        .bind(serde_json::to_string(&position.state)?)
        .bind(position.stop_loss_price)
        .bind(position.take_profit_price)
        .bind(position.close_attempts as i64)
        .bind(position.escalated)
        .bind(match &position.exit_reason {
            Some(reason) => Some(serde_json::to_string(reason)?),
            None => None,
        })
        .bind(&position.entry_fingerprint)
        .execute(&self.pool)
        .await
        .context("Failed to upsert position")?;
        Ok(())
    }

    async fn archive_position(&self, position: &Position) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO closed_trades (
                asset_id, entry_price, size, opened_at, closed_at, realized_pnl, exit_reason
            ) VALUES (?, ?, ?, ?, ?, ?, ?);
            "#,
        )
        .bind(&position.asset_id)
        .bind(position.entry_price)
        .bind(position.size as i64)
        .bind(position.opened_at as i64)
        .bind(position.closed_at.map(|t| t as i64))
        .bind(position.realized_pnl)
        .bind(match &position.exit_reason {
            Some(reason) => Some(serde_json::to_string(reason)?),
            None => None,
        })
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM positions WHERE asset_id = ?;")
            .bind(&position.asset_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.context("Failed to archive position")?;
        debug!("Archived position for {}", position.asset_id);
        Ok(())
    }

    async fn load_ledger_day(&self, day: &str) -> Result<Option<LedgerDayRecord>> {
        let row: Option<LedgerDayRow> =
            sqlx::query_as("SELECT * FROM ledger_days WHERE day = ?;")
                .bind(day)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to load ledger day")?;

        Ok(row.map(|r| LedgerDayRecord {
            day: r.day,
            daily_loss_accumulated: r.daily_loss_accumulated.max(0) as u64,
            trades_today: r.trades_today.max(0) as u32,
        }))
    }

    async fn save_ledger_day(&self, record: &LedgerDayRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_days (day, daily_loss_accumulated, trades_today)
            VALUES (?, ?, ?)
            ON CONFLICT(day) DO UPDATE SET
                daily_loss_accumulated = excluded.daily_loss_accumulated,
                trades_today = excluded.trades_today;
            "#,
        )
        .bind(&record.day)
        .bind(record.daily_loss_accumulated as i64)
        .bind(record.trades_today as i64)
        .execute(&self.pool)
        .await
        .context("Failed to save ledger day")?;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1;").execute(&self.pool).await?;
        Ok(true)
    }
}

/// In-memory store for tests and simulation runs without a database file.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryStateStore {
        positions: Mutex<HashMap<AssetId, Position>>,
        archive: Mutex<Vec<Position>>,
        ledger_days: Mutex<HashMap<String, LedgerDayRecord>>,
    }

    impl MemoryStateStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn archived_count(&self) -> usize {
            self.archive.lock().await.len()
        }
    }

    #[async_trait]
    impl StateStore for MemoryStateStore {
        async fn load_open_positions(&self) -> Result<Vec<Position>> {
            Ok(self.positions.lock().await.values().cloned().collect())
        }

        async fn upsert_position(&self, position: &Position) -> Result<()> {
            self.positions
                .lock()
                .await
                .insert(position.asset_id.clone(), position.clone());
            Ok(())
        }

        async fn archive_position(&self, position: &Position) -> Result<()> {
            self.positions.lock().await.remove(&position.asset_id);
            self.archive.lock().await.push(position.clone());
            Ok(())
        }

        async fn load_ledger_day(&self, day: &str) -> Result<Option<LedgerDayRecord>> {
            Ok(self.ledger_days.lock().await.get(day).cloned())
        }

        async fn save_ledger_day(&self, record: &LedgerDayRecord) -> Result<()> {
            self.ledger_days
                .lock()
                .await
                .insert(record.day.clone(), record.clone());
            Ok(())
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }
}
