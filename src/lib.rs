//! Omni-Sniper - autonomous memecoin sniping engine
//!
//! This crate implements the full signal -> validate -> decide -> execute ->
//! supervise loop: multi-source candidate intake, weighted safety validation,
//! risk-capped position sizing, tiered transaction submission with
//! idempotent reconciliation, and stateful position supervision backed by a
//! durable SQLite store.

pub mod config;
pub mod decision;
pub mod error;
pub mod events;
pub mod ledger;
pub mod market;
pub mod scheduler;
pub mod stake;
pub mod storage;
pub mod submission;
pub mod supervisor;
pub mod types;
pub mod validator;

// Re-export main types for convenience
pub use config::BotConfig;
pub use error::EngineError;
pub use scheduler::Engine;
pub use types::{CandidateEvent, MarketSnapshot};
