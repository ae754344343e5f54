//! Idle capital deployment boundary.
//!
//! Capital not committed to positions can be parked in a yield venue
//! between trades. The engine only ever talks to the trait; the default
//! implementation does nothing, keeping the trading loop independent of
//! any staking integration.

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait IdleCapitalStaker: Send + Sync {
    /// Park idle lamports. Must be a no-op when `amount` is zero.
    async fn deposit(&self, amount: u64) -> Result<()>;

    /// Recall lamports for an imminent entry. Implementations must return
    /// funds before the entry is submitted, not concurrently with it.
    async fn withdraw(&self, amount: u64) -> Result<()>;

    /// Currently parked amount.
    async fn staked_balance(&self) -> Result<u64>;
}

/// Default staker: keeps everything liquid.
pub struct NoopStaker;

#[async_trait]
impl IdleCapitalStaker for NoopStaker {
    async fn deposit(&self, amount: u64) -> Result<()> {
        debug!(amount, "Idle capital left liquid (no staking venue configured)");
        Ok(())
    }

    async fn withdraw(&self, _amount: u64) -> Result<()> {
        Ok(())
    }

    async fn staked_balance(&self) -> Result<u64> {
        Ok(0)
    }
}
