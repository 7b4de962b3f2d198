//! Process-level configuration.
//!
//! Loading order: built-in defaults, then an optional JSON file named by
//! `LAUNCHSNIPE_CONFIG`, then environment overrides for endpoints and secrets.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::scoring::ScoringProfile;
use crate::types::{ExitPolicy, Lamports};

pub const CONFIG_PATH_ENV: &str = "LAUNCHSNIPE_CONFIG";

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub rpc_url: String,
    pub ws_url: String,
    pub block_builder_url: String,
    #[serde(skip_serializing)]
    pub block_builder_auth: Option<String>,
    #[serde(skip_serializing)]
    pub indexer_api_key: String,
    /// Base64-encoded 32-byte AES key wrapping every signing key at rest.
    #[serde(skip_serializing)]
    pub master_key: String,
    /// Key being rotated away from; blobs sealed under it are re-sealed at startup.
    #[serde(skip_serializing)]
    pub previous_master_key: Option<String>,
    pub ephemeral_store_url: String,
    pub database_url: String,
    pub enrichment: EnrichmentConfig,
    pub scoring: ScoringConfig,
    pub launch: LaunchConfig,
    pub monitor: MonitorConfig,
    pub registry: RegistryConfig,
    pub control: ControlConfig,
    pub providers: ProviderConfig,
    pub ingest: IngestConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Maximum tokens enriched concurrently.
    pub max_concurrency: usize,
    /// Tokens pulled per scheduler tick.
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Retry ceiling (K).
    pub max_attempts: u32,
    /// Wall-clock ceiling from discovery (T).
    pub max_age_secs: u64,
    pub min_liquidity_sol: f64,
    pub min_pair_age_secs: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            batch_size: 32,
            poll_interval_ms: 1_000,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 60_000,
            max_attempts: 10,
            max_age_secs: 15 * 60,
            min_liquidity_sol: 1.0,
            min_pair_age_secs: 0,
        }
    }
}

impl EnrichmentConfig {
    /// `min(base * 2^retry, cap)`.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry_count.min(32));
        let millis = self.backoff_base_ms.saturating_mul(factor).min(self.backoff_cap_ms);
        Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Name of the active profile.
    pub profile: String,
    /// Optional JSON file holding additional profiles.
    pub profiles_path: Option<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            profile: "balanced".to_string(),
            profiles_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Extra share on top of each bot's buy when pre-funding (0.2 = 20%).
    pub pre_fund_margin: f64,
    /// Per-bot headroom used in the up-front cost estimate.
    pub pre_fund_headroom: Lamports,
    /// Fixed fees of a launch (creation rent, signatures, tips).
    pub fixed_fees: Lamports,
    pub landing_timeout_secs: u64,
    pub landing_poll_ms: u64,
    /// Maximum transactions accepted by the block builder per bundle.
    pub bundle_size_limit: usize,
    pub tip_lamports: Lamports,
    pub slippage_bps: u16,
    pub max_bot_count: u32,
    /// Sell strategy id to exit policy for bot positions.
    pub sell_strategies: HashMap<String, ExitPolicy>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        let mut sell_strategies = HashMap::new();
        sell_strategies.insert("default".to_string(), ExitPolicy::default());
        sell_strategies.insert(
            "quick_flip".to_string(),
            ExitPolicy {
                take_profit_pct: 25.0,
                stop_loss_pct: 10.0,
                trailing_stop_pct: Some(8.0),
                timeout_secs: 600,
                ..ExitPolicy::default()
            },
        );
        Self {
            pre_fund_margin: 0.2,
            pre_fund_headroom: 10_000_000,
            fixed_fees: 25_000_000,
            landing_timeout_secs: 20,
            landing_poll_ms: 500,
            bundle_size_limit: 5,
            tip_lamports: 1_000_000,
            slippage_bps: 1_000,
            max_bot_count: 4,
            sell_strategies,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Cadence used when the owner's policy has none.
    pub default_scan_interval_ms: u64,
    pub exit_max_retries: usize,
    pub exit_backoff_base_ms: u64,
    pub exit_backoff_cap_ms: u64,
    /// Deadline for one price/liquidity observation.
    pub quote_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            default_scan_interval_ms: 2_000,
            exit_max_retries: 4,
            exit_backoff_base_ms: 250,
            exit_backoff_cap_ms: 5_000,
            quote_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub heartbeat_ttl_secs: u64,
    /// Hard TTL of a decrypted signing key in memory.
    pub key_cache_ttl_secs: u64,
    pub key_cache_capacity: u64,
    /// Concurrent buys per user.
    pub per_user_concurrency: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl_secs: 90,
            key_cache_ttl_secs: 300,
            key_cache_capacity: 10_000,
            per_user_concurrency: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Events retained per user for replay on reconnect.
    pub replay_capacity: usize,
    pub channel_capacity: usize,
    /// `(type, id)` keys remembered per user; never fewer than `replay_capacity`.
    pub dedupe_capacity: usize,
    /// Channels without connections or new events for this long are dropped.
    pub idle_retention_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            replay_capacity: 256,
            channel_capacity: 1_024,
            dedupe_capacity: 4_096,
            idle_retention_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub dexscreener_url: String,
    pub webacy_url: String,
    #[serde(skip_serializing)]
    pub webacy_api_key: Option<String>,
    pub swap_api_url: String,
    /// Concurrent in-flight requests per provider.
    pub max_concurrency: usize,
    pub requests_per_second: u32,
    /// Hard deadline for one provider call.
    pub request_timeout_ms: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_secs: u64,
    pub circuit_sample_size: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            dexscreener_url: "https://api.dexscreener.com".to_string(),
            webacy_url: "https://api.webacy.com".to_string(),
            webacy_api_key: None,
            swap_api_url: "https://pumpportal.fun/api".to_string(),
            max_concurrency: 4,
            requests_per_second: 10,
            request_timeout_ms: 5_000,
            circuit_failure_threshold: 5,
            circuit_cooldown_secs: 60,
            circuit_sample_size: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Program whose account updates are turned into discovery events.
    pub stream_program: Option<String>,
    pub stream_data_size: Option<u64>,
    /// Offset of the token mint inside a pool account.
    pub stream_mint_offset: usize,
    pub stream_creator_offset: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            stream_program: None,
            stream_data_size: None,
            stream_mint_offset: 43,
            stream_creator_offset: 11,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: String,
    pub nonce_ttl_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            nonce_ttl_secs: 300,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
            ws_url: "wss://api.mainnet-beta.solana.com".to_string(),
            block_builder_url: "https://mainnet.block-engine.jito.wtf/api/v1/bundles".to_string(),
            block_builder_auth: None,
            indexer_api_key: String::new(),
            master_key: String::new(),
            previous_master_key: None,
            ephemeral_store_url: "memory://".to_string(),
            database_url: "sqlite:launchsnipe.db?mode=rwc".to_string(),
            enrichment: EnrichmentConfig::default(),
            scoring: ScoringConfig::default(),
            launch: LaunchConfig::default(),
            monitor: MonitorConfig::default(),
            registry: RegistryConfig::default(),
            control: ControlConfig::default(),
            providers: ProviderConfig::default(),
            ingest: IngestConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults, then the optional JSON file, then environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Override endpoints and secrets from the environment.
    pub fn apply_env(&mut self) {
        let mut overridden = Vec::new();
        let mut set = |name: &'static str, slot: &mut String| {
            if let Ok(value) = std::env::var(name) {
                *slot = value;
                overridden.push(name);
            }
        };
        set("RPC_URL", &mut self.rpc_url);
        set("WS_URL", &mut self.ws_url);
        set("BLOCK_BUILDER_URL", &mut self.block_builder_url);
        set("INDEXER_API_KEY", &mut self.indexer_api_key);
        set("MASTER_KEY", &mut self.master_key);
        set("EPHEMERAL_STORE_URL", &mut self.ephemeral_store_url);
        set("DATABASE_URL", &mut self.database_url);
        set("SCORING_PROFILE", &mut self.scoring.profile);
        set("HTTP_LISTEN", &mut self.api.listen);

        if let Ok(value) = std::env::var("BLOCK_BUILDER_AUTH") {
            self.block_builder_auth = Some(value);
            overridden.push("BLOCK_BUILDER_AUTH");
        }
        if let Ok(value) = std::env::var("PREVIOUS_MASTER_KEY") {
            self.previous_master_key = Some(value);
            overridden.push("PREVIOUS_MASTER_KEY");
        }
        if let Ok(value) = std::env::var("WEBACY_API_KEY") {
            self.providers.webacy_api_key = Some(value);
            overridden.push("WEBACY_API_KEY");
        }

        debug!("Environment overrides applied: {:?}", overridden);
    }

    pub fn validate(&self) -> Result<()> {
        decode_master_key(&self.master_key).context("MASTER_KEY is invalid")?;
        if let Some(previous) = &self.previous_master_key {
            decode_master_key(previous).context("PREVIOUS_MASTER_KEY is invalid")?;
        }
        if self.launch.bundle_size_limit == 0 {
            bail!("launch.bundle_size_limit must be at least 1");
        }
        if self.enrichment.backoff_base_ms > self.enrichment.backoff_cap_ms {
            bail!(
                "enrichment.backoff_base_ms ({}) exceeds backoff_cap_ms ({})",
                self.enrichment.backoff_base_ms,
                self.enrichment.backoff_cap_ms
            );
        }
        if self.enrichment.max_concurrency == 0 {
            bail!("enrichment.max_concurrency must be at least 1");
        }
        if self.launch.pre_fund_margin <= 0.0 {
            bail!("launch.pre_fund_margin must be positive so pre-funding exceeds the buy");
        }
        self.resolve_scoring_profile()?;
        Ok(())
    }

    /// Look up the configured scoring profile among built-ins and the profiles file.
    pub fn resolve_scoring_profile(&self) -> Result<ScoringProfile> {
        let mut profiles = ScoringProfile::builtin();
        if let Some(path) = &self.scoring.profiles_path {
            profiles.extend(ScoringProfile::load_file(path)?);
        }
        profiles
            .into_iter()
            .rev()
            .find(|p| p.name == self.scoring.profile)
            .with_context(|| format!("unknown scoring profile '{}'", self.scoring.profile))
    }

    pub fn master_key_bytes(&self) -> Result<[u8; 32]> {
        decode_master_key(&self.master_key)
    }

    pub fn previous_master_key_bytes(&self) -> Result<Option<[u8; 32]>> {
        self.previous_master_key
            .as_deref()
            .map(decode_master_key)
            .transpose()
    }
}

fn decode_master_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(encoded.trim())
        .context("master key is not valid base64")?;
    let key: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("master key must be 32 bytes, got {}", bytes.len()))?;
    Ok(key)
}

/// Builder for programmatic construction, mostly used by tests.
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn with_master_key(mut self, key: &[u8; 32]) -> Self {
        self.config.master_key = BASE64.encode(key);
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = url.into();
        self
    }

    pub fn with_indexer_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.indexer_api_key = key.into();
        self
    }

    pub fn with_scoring_profile(mut self, name: impl Into<String>) -> Self {
        self.config.scoring.profile = name.into();
        self
    }

    pub fn with_enrichment(mut self, enrichment: EnrichmentConfig) -> Self {
        self.config.enrichment = enrichment;
        self
    }

    pub fn with_launch(mut self, launch: LaunchConfig) -> Self {
        self.config.launch = launch;
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.config.monitor = monitor;
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        let cfg = EnrichmentConfig {
            backoff_base_ms: 1_000,
            backoff_cap_ms: 10_000,
            ..EnrichmentConfig::default()
        };
        assert_eq!(cfg.backoff_for(0), Duration::from_millis(1_000));
        assert_eq!(cfg.backoff_for(2), Duration::from_millis(4_000));
        assert_eq!(cfg.backoff_for(10), Duration::from_millis(10_000));
        assert_eq!(cfg.backoff_for(200), Duration::from_millis(10_000));
    }

    #[test]
    fn test_builder_validates_master_key() {
        let config = EngineConfigBuilder::new().with_master_key(&[7u8; 32]).build().unwrap();
        assert_eq!(config.master_key_bytes().unwrap(), [7u8; 32]);

        let mut bad = EngineConfig::default();
        bad.master_key = BASE64.encode([1u8; 16]);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_unknown_profile_rejected() {
        let result = EngineConfigBuilder::new()
            .with_master_key(&[1u8; 32])
            .with_scoring_profile("does-not-exist")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "launch": { "bundle_size_limit": 4 }, "api": { "listen": "127.0.0.1:9000" } }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.launch.bundle_size_limit, 4);
        assert_eq!(config.launch.landing_timeout_secs, 20);
        assert_eq!(config.api.listen, "127.0.0.1:9000");
        assert!(config.launch.sell_strategies.contains_key("default"));
    }

    #[test]
    fn test_backoff_base_above_cap_rejected() {
        let mut config = EngineConfigBuilder::new().with_master_key(&[2u8; 32]).build().unwrap();
        config.enrichment.backoff_base_ms = 100_000;
        assert!(config.validate().is_err());
    }
}
