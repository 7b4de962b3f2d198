//! launchsnipe service entry point.

use anyhow::{Context, Result};
use nonempty::NonEmpty;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use launchsnipe::api::{self, ApiState};
use launchsnipe::auth::NonceAuthority;
use launchsnipe::bot_pool::BotWalletPool;
use launchsnipe::chain::{
    BlockBuilder, ChainClient, JitoBlockBuilder, LandingWatch, PortalSwapExecutor, PortalTransactionFactory,
    RpcChainClient, SwapExecutor, TransactionFactory,
};
use launchsnipe::control::ControlChannel;
use launchsnipe::enrichment::{
    DexScreenerClient, EnrichmentWorker, Gated, MarketDataProvider, PriceSource, ProviderGate, RiskProvider,
    RpcRiskProvider, WebacyClient,
};
use launchsnipe::ephemeral;
use launchsnipe::ingest::{AccountStreamIngestor, PoolAccountLayout, TokenIngestor};
use launchsnipe::keys::{rotate_master_key, KeyVault, MasterKey, SignerDirectory};
use launchsnipe::launch::LaunchCoordinator;
use launchsnipe::metrics::PipelineMetrics;
use launchsnipe::positions::PositionMonitor;
use launchsnipe::registry::ActiveUserRegistry;
use launchsnipe::scoring::ScoringEngine;
use launchsnipe::sniper::SniperSupervisor;
use launchsnipe::storage::{SqliteStore, Store};
use launchsnipe::EngineConfig;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = EngineConfig::load().context("Failed to load configuration")?;
    info!("Starting launchsnipe (scoring profile {})", config.scoring.profile);

    let store: Arc<dyn Store> = SqliteStore::connect(&config.database_url).await?;
    store.health_check().await.context("Database health check failed")?;

    let master = MasterKey::new(&config.master_key_bytes()?)?;
    if let Some(previous) = config.previous_master_key_bytes()? {
        let previous = MasterKey::new(&previous)?;
        let rotated = rotate_master_key(store.as_ref(), &previous, &master).await?;
        info!("Re-sealed {} signing keys under the current master key", rotated);
    }
    let vault = KeyVault::new(
        master,
        Duration::from_secs(config.registry.key_cache_ttl_secs),
        config.registry.key_cache_capacity,
    );

    let metrics = PipelineMetrics::new();
    let control = ControlChannel::from_config(&config.control);
    let ephemeral = ephemeral::connect(&config.ephemeral_store_url).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http = reqwest::Client::builder()
        .timeout(Duration::from_millis(config.providers.request_timeout_ms))
        .build()
        .context("Failed to build HTTP client")?;
    let rpc = Arc::new(RpcClient::new_with_commitment(
        config.rpc_url.clone(),
        CommitmentConfig::confirmed(),
    ));

    // Chain adapters
    let chain: Arc<dyn ChainClient> = Arc::new(RpcChainClient::new(rpc.clone()));
    let builder: Arc<dyn BlockBuilder> = Arc::new(JitoBlockBuilder::new(
        http.clone(),
        config.block_builder_url.clone(),
        config.block_builder_auth.clone(),
    ));
    let factory: Arc<dyn TransactionFactory> = Arc::new(PortalTransactionFactory::new(
        http.clone(),
        config.providers.swap_api_url.clone(),
    ));
    let swaps: Arc<dyn SwapExecutor> = Arc::new(PortalSwapExecutor::new(
        http.clone(),
        config.providers.swap_api_url.clone(),
        rpc.clone(),
        chain.clone(),
    ));

    // Providers, each behind its own gate
    let dexscreener = Arc::new(DexScreenerClient::new(http.clone(), config.providers.dexscreener_url.clone()));
    let market: Arc<dyn MarketDataProvider> = Arc::new(Gated::new(
        dexscreener.clone(),
        ProviderGate::new("dexscreener", &config.providers, metrics.clone()),
    ));
    let prices: Arc<dyn PriceSource> = Arc::new(Gated::new(
        dexscreener,
        ProviderGate::new("dexscreener_quotes", &config.providers, metrics.clone()),
    ));
    let onchain_risk: Arc<dyn RiskProvider> = Arc::new(Gated::new(
        Arc::new(RpcRiskProvider::new(rpc.clone())),
        ProviderGate::new("rpc_risk", &config.providers, metrics.clone()),
    ));
    let mut risk = NonEmpty::new(onchain_risk);
    if let Some(key) = &config.providers.webacy_api_key {
        risk.push(Arc::new(Gated::new(
            Arc::new(WebacyClient::new(http.clone(), config.providers.webacy_url.clone(), key.clone())),
            ProviderGate::new("webacy", &config.providers, metrics.clone()),
        )));
    } else {
        warn!("No Webacy API key configured; Webacy risk data disabled");
    }

    // Core components
    let ingestor = Arc::new(TokenIngestor::new(store.clone(), metrics.clone()));
    let scoring = ScoringEngine::new(config.resolve_scoring_profile()?);
    let enrichment = EnrichmentWorker::new(
        store.clone(),
        market,
        risk,
        scoring,
        config.enrichment.clone(),
        metrics.clone(),
    );
    let registry = Arc::new(ActiveUserRegistry::new(
        store.clone(),
        ephemeral.clone(),
        control.clone(),
        vault.clone(),
        chain.clone(),
        Duration::from_secs(config.registry.heartbeat_ttl_secs),
    ));
    let monitor = PositionMonitor::new(
        store.clone(),
        prices.clone(),
        swaps.clone(),
        SignerDirectory::new(store.clone(), vault.clone()),
        control.clone(),
        metrics.clone(),
        config.monitor.clone(),
        shutdown_rx.clone(),
    );
    let landing = LandingWatch::new(
        Duration::from_secs(config.launch.landing_timeout_secs),
        Duration::from_millis(config.launch.landing_poll_ms),
    );
    let pool = Arc::new(BotWalletPool::new(
        store.clone(),
        vault.clone(),
        chain.clone(),
        builder.clone(),
        factory.clone(),
        landing,
    ));
    let launches = LaunchCoordinator::new(
        store.clone(),
        pool,
        vault.clone(),
        chain.clone(),
        builder,
        factory,
        prices,
        monitor.clone(),
        control.clone(),
        metrics.clone(),
        config.launch.clone(),
    );

    let resumed = monitor.resume_open_positions(&config.launch.sell_strategies).await?;
    info!("{} positions under monitoring after restart", resumed);

    // Workers
    let scored = enrichment.subscribe();
    let mut workers = tokio::task::JoinSet::new();
    workers.spawn(enrichment.run(shutdown_rx.clone()));
    workers.spawn(control.clone().run_pruner(
        Duration::from_secs(config.control.idle_retention_secs),
        shutdown_rx.clone(),
    ));
    let supervisor = SniperSupervisor::new(
        store.clone(),
        registry.clone(),
        swaps,
        monitor.clone(),
        control.clone(),
        metrics.clone(),
        config.registry.per_user_concurrency,
    );
    workers.spawn(supervisor.run(scored, shutdown_rx.clone()));
    if let Some(filter) = AccountStreamIngestor::filter_from_config(&config.ingest)? {
        let stream = AccountStreamIngestor::new(
            config.ws_url.clone(),
            filter,
            PoolAccountLayout::from_config(&config.ingest),
            ingestor.clone(),
        );
        workers.spawn(stream.run(shutdown_rx.clone()));
    }

    let state = ApiState {
        store: store.clone(),
        ingestor,
        registry,
        auth: Arc::new(NonceAuthority::new(
            ephemeral,
            Duration::from_secs(config.api.nonce_ttl_secs),
        )),
        launches,
        control,
        metrics,
        api_key: config.indexer_api_key.clone(),
    };
    let listen = config.api.listen.clone();
    let server = tokio::spawn(api::serve(state, listen.clone(), shutdown_rx.clone()));

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    if !monitor.drain(DRAIN_TIMEOUT).await {
        warn!("Some position monitors did not finish before the drain deadline");
    }
    while let Some(done) = workers.join_next().await {
        if let Err(e) = done {
            error!("Worker ended abnormally: {}", e);
        }
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("HTTP server error: {:#}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
    }
    info!("launchsnipe stopped");
    Ok(())
}
