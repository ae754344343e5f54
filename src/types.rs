//! Core types and data structures for the omni-sniper trading engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque asset identifier (mint address as a string to avoid chain dependencies)
pub type AssetId = String;

/// Milliseconds since the Unix epoch.
pub type TimestampMs = u64;

/// A candidate asset observed on the market, delivered by the ingestion boundary.
///
/// Immutable once created; multiple events for the same asset inside the dedup
/// window collapse into a single validation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateEvent {
    /// The asset (mint) address
    pub asset_id: AssetId,
    /// Source identifier (e.g. "telegram:alpha", "dexscreener", "sniper:raydium")
    pub source: String,
    /// Unix timestamp (ms) when the source first saw this asset
    pub first_seen_at: TimestampMs,
    /// Raw metadata carried along from the source (name, symbol, description, ...)
    pub raw_metadata: HashMap<String, String>,
}

/// One observed (timestamp, price) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: TimestampMs,
    pub price: f64,
}

/// Point-in-time market data for a candidate.
///
/// Fetched fresh per validation call and never reused across candidates.
/// Fields that an upstream source may be unable to provide are `Option`;
/// a missing field always fails the corresponding check (fail-closed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub asset_id: AssetId,
    /// Pool liquidity in USD
    pub liquidity_value: Option<f64>,
    /// Recent trading volume in USD (24h window)
    pub volume_recent: Option<f64>,
    /// Fraction of supply held by the top N holders (0.0 - 1.0)
    pub holder_concentration_top_n: Option<f64>,
    /// Whether the mint/freeze authority has been revoked
    pub mint_authority_revoked: Option<bool>,
    /// Whether LP tokens are locked or burned
    pub lp_locked_or_burned: Option<bool>,
    /// Ordered price history, oldest first
    pub price_history: Vec<PricePoint>,
    /// Unix timestamp (ms) when this snapshot was taken
    pub taken_at: TimestampMs,
}

impl MarketSnapshot {
    /// An empty snapshot for an asset the market-data boundary knows nothing about.
    /// Every field-backed check fails against it.
    pub fn unavailable(asset_id: &str, now: TimestampMs) -> Self {
        Self {
            asset_id: asset_id.to_string(),
            liquidity_value: None,
            volume_recent: None,
            holder_concentration_top_n: None,
            mint_authority_revoked: None,
            lp_locked_or_burned: None,
            price_history: Vec::new(),
            taken_at: now,
        }
    }

    /// Most recent observed price, if any history is present.
    pub fn last_price(&self) -> Option<f64> {
        self.price_history.last().map(|p| p.price)
    }
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> TimestampMs {
    chrono::Utc::now().timestamp_millis() as u64
}
