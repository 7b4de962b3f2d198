//! launchsnipe - Solana token launch and snipe execution pipeline
//!
//! New tokens are ingested, enriched and scored; sniper users buy the ones
//! their policy accepts, creators launch tokens with a bundled fleet of bot
//! buys, and every resulting position is monitored until its exit policy
//! closes it.

pub mod api;
pub mod auth;
pub mod bot_pool;
pub mod chain;
pub mod config;
pub mod control;
pub mod enrichment;
pub mod ephemeral;
pub mod error;
pub mod ingest;
pub mod keys;
pub mod launch;
pub mod metrics;
pub mod positions;
pub mod registry;
pub mod scoring;
pub mod sniper;
pub mod storage;
pub mod types;

pub use config::EngineConfig;
pub use error::{PipelineError, PipelineResult};
