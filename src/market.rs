//! Market data fetching and auxiliary scoring.
//!
//! The engine never talks to an exchange API directly; everything goes
//! through [`MarketDataSource`] so the loop can be driven by a mock in
//! tests and by the rate-limited HTTP source in production. Missing data
//! is reported as `None`, never fabricated - downstream validation treats
//! absence as failure.

use crate::config::MarketConfig;
use crate::types::{now_ms, MarketSnapshot, PricePoint};
use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, warn};

/// Read-only market data boundary.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Full snapshot for validation. `Ok(None)` means the asset is unknown
    /// to the source; fields the source cannot answer stay `None`.
    async fn fetch_snapshot(&self, asset_id: &str) -> Result<Option<MarketSnapshot>>;

    /// Current price only, for position supervision.
    async fn fetch_price(&self, asset_id: &str) -> Result<Option<f64>>;
}

#[derive(Debug, Deserialize)]
struct PairsResponse {
    pairs: Option<Vec<PairData>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairData {
    price_usd: Option<String>,
    liquidity: Option<LiquidityData>,
    volume: Option<VolumeData>,
}

#[derive(Debug, Deserialize)]
struct LiquidityData {
    usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct VolumeData {
    h1: Option<f64>,
}

/// Rate-limited HTTP market data source (DexScreener-shaped API).
pub struct HttpMarketData {
    client: Client,
    limiter: DefaultDirectRateLimiter,
    config: MarketConfig,
}

impl HttpMarketData {
    pub fn new(config: MarketConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        let quota = Quota::per_second(
            NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN),
        );
        Ok(Self {
            client,
            limiter: RateLimiter::direct(quota),
            config,
        })
    }

    async fn fetch_best_pair(&self, asset_id: &str) -> Result<Option<PairData>> {
        self.limiter.until_ready().await;
        let url = token_pairs_url(&self.config.base_url, asset_id);
        debug!(asset = %asset_id, "Fetching market data");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Market data request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("Market data API returned {}", response.status());
        }
        let body: PairsResponse = response
            .json()
            .await
            .context("Failed to decode market data response")?;
        // The API returns one entry per pool; the deepest pool is the
        // representative one.
        let best = body.pairs.unwrap_or_default().into_iter().max_by(|a, b| {
            let la = a.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
            let lb = b.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
            la.total_cmp(&lb)
        });
        Ok(best)
    }
}

/// Token-pairs endpoint for one asset. `base_url` is the API host only; the
/// `/latest/dex/tokens` path segment is appended here and nowhere else.
fn token_pairs_url(base_url: &str, asset_id: &str) -> String {
    format!(
        "{}/latest/dex/tokens/{}",
        base_url.trim_end_matches('/'),
        asset_id
    )
}

fn pair_to_snapshot(asset_id: &str, pair: PairData) -> MarketSnapshot {
    let price = pair
        .price_usd
        .as_deref()
        .and_then(|s| s.parse::<f64>().ok());
    let taken_at = now_ms();
    MarketSnapshot {
        asset_id: asset_id.to_string(),
        liquidity_value: pair.liquidity.and_then(|l| l.usd),
        volume_recent: pair.volume.and_then(|v| v.h1),
        // Not answerable from the pairs API; the intake layer overlays
        // these from listener metadata when available.
        holder_concentration_top_n: None,
        mint_authority_revoked: None,
        lp_locked_or_burned: None,
        price_history: price
            .map(|p| {
                vec![PricePoint {
                    timestamp: taken_at,
                    price: p,
                }]
            })
            .unwrap_or_default(),
        taken_at,
    }
}

#[async_trait]
impl MarketDataSource for HttpMarketData {
    async fn fetch_snapshot(&self, asset_id: &str) -> Result<Option<MarketSnapshot>> {
        match self.fetch_best_pair(asset_id).await? {
            Some(pair) => Ok(Some(pair_to_snapshot(asset_id, pair))),
            None => {
                warn!(asset = %asset_id, "Asset unknown to market data source");
                Ok(None)
            }
        }
    }

    async fn fetch_price(&self, asset_id: &str) -> Result<Option<f64>> {
        let pair = self.fetch_best_pair(asset_id).await?;
        Ok(pair
            .and_then(|p| p.price_usd)
            .and_then(|s| s.parse::<f64>().ok()))
    }
}

/// Secondary opinion on a candidate, independent of the weighted checks.
#[async_trait]
pub trait AuxiliaryScorer: Send + Sync {
    /// Score 0-100; errors are absorbed by the caller with a neutral
    /// default.
    async fn score(&self, snapshot: &MarketSnapshot) -> Result<u8>;
}

/// Deterministic banded scorer over liquidity, volume and price movement.
/// Serves as the always-available fallback opinion.
pub struct HeuristicScorer;

#[async_trait]
impl AuxiliaryScorer for HeuristicScorer {
    async fn score(&self, snapshot: &MarketSnapshot) -> Result<u8> {
        let mut score: i32 = 50;

        match snapshot.liquidity_value {
            Some(liq) if liq >= 50_000.0 => score += 20,
            Some(liq) if liq >= 10_000.0 => score += 10,
            Some(liq) if liq < 1_000.0 => score -= 20,
            Some(_) => {}
            None => score -= 10,
        }

        if let (Some(vol), Some(liq)) = (snapshot.volume_recent, snapshot.liquidity_value) {
            if liq > 0.0 {
                let ratio = vol / liq;
                if (0.1..=5.0).contains(&ratio) {
                    score += 15;
                } else if ratio > 20.0 {
                    score -= 15;
                }
            }
        }

        if snapshot.price_history.len() >= 2 {
            let first = snapshot.price_history[0].price;
            let last = snapshot.price_history[snapshot.price_history.len() - 1].price;
            if first > 0.0 {
                let change = (last - first) / first;
                if change > 0.0 && change < 0.5 {
                    score += 15;
                } else if change < -0.2 {
                    score -= 15;
                }
            }
        }

        Ok(score.clamp(0, 100) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with(liquidity: Option<f64>, volume: Option<f64>) -> MarketSnapshot {
        MarketSnapshot {
            asset_id: "MintTest1111".to_string(),
            liquidity_value: liquidity,
            volume_recent: volume,
            holder_concentration_top_n: None,
            mint_authority_revoked: None,
            lp_locked_or_burned: None,
            price_history: Vec::new(),
            taken_at: now_ms(),
        }
    }

    #[test]
    fn default_base_url_yields_a_single_tokens_path() {
        let url = token_pairs_url(&MarketConfig::default().base_url, "MintTest1111");
        assert_eq!(
            url,
            "https://api.dexscreener.com/latest/dex/tokens/MintTest1111"
        );
        assert_eq!(url.matches("/latest/dex/tokens/").count(), 1);
    }

    #[test]
    fn trailing_slash_in_base_url_is_tolerated() {
        let url = token_pairs_url("http://127.0.0.1:9999/", "MintTest1111");
        assert_eq!(url, "http://127.0.0.1:9999/latest/dex/tokens/MintTest1111");
    }

    #[test]
    fn pairs_payload_maps_onto_a_snapshot() {
        let raw = r#"{
            "pairs": [
                {
                    "priceUsd": "0.0025",
                    "liquidity": { "usd": 42000.0 },
                    "volume": { "h1": 9000.0 }
                }
            ]
        }"#;
        let parsed: PairsResponse = serde_json::from_str(raw).unwrap();
        let pair = parsed.pairs.unwrap().into_iter().next().unwrap();
        let snapshot = pair_to_snapshot("MintTest1111", pair);

        assert_eq!(snapshot.liquidity_value, Some(42000.0));
        assert_eq!(snapshot.volume_recent, Some(9000.0));
        assert_eq!(snapshot.last_price(), Some(0.0025));
        // Fields the API cannot answer stay unavailable
        assert_eq!(snapshot.mint_authority_revoked, None);
        assert_eq!(snapshot.lp_locked_or_burned, None);
    }

    #[test]
    fn empty_pairs_list_means_unknown_asset() {
        let raw = r#"{ "pairs": null }"#;
        let parsed: PairsResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.pairs.is_none());
    }

    #[tokio::test]
    async fn heuristic_scorer_rewards_deep_liquid_markets() {
        let rich = HeuristicScorer
            .score(&snapshot_with(Some(100_000.0), Some(20_000.0)))
            .await
            .unwrap();
        let thin = HeuristicScorer
            .score(&snapshot_with(Some(500.0), Some(50.0)))
            .await
            .unwrap();
        assert!(rich > thin);
        assert!(rich >= 70, "rich market scored {}", rich);
        assert!(thin <= 50, "thin market scored {}", thin);
    }

    #[tokio::test]
    async fn heuristic_scorer_is_neutral_on_missing_data() {
        let score = HeuristicScorer
            .score(&snapshot_with(None, None))
            .await
            .unwrap();
        assert_eq!(score, 40);
    }
}
