//! Enrichment: provider access and the worker that drives tokens to `scored`.

pub mod circuit_breaker;
pub mod providers;
pub mod rate_limit;
pub mod worker;

pub use providers::{
    DexScreenerClient, Gated, MarketData, MarketDataProvider, PriceQuote, PriceSource,
    ProviderGate, RiskData, RiskProvider, RpcRiskProvider, WebacyClient,
};
pub use worker::{EnrichmentStep, EnrichmentWorker};
