//! In-memory fakes and a wired pipeline for integration tests.
#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey as SolPubkey;
use solana_sdk::system_instruction;
use solana_sdk::transaction::{Transaction, VersionedTransaction};
use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use launchsnipe::bot_pool::BotWalletPool;
use launchsnipe::chain::{
    BlockBuilder, ChainClient, FillReport, Inclusion, LandingWatch, SignedTx, SwapExecutor, SwapRequest,
    TransactionFactory,
};
use launchsnipe::config::{LaunchConfig, MonitorConfig};
use launchsnipe::control::{ControlChannel, ControlEvent};
use launchsnipe::enrichment::{PriceQuote, PriceSource};
use launchsnipe::ephemeral::MemoryEphemeralStore;
use launchsnipe::keys::{KeyVault, MasterKey, SignerDirectory, SigningKey};
use launchsnipe::launch::LaunchCoordinator;
use launchsnipe::metrics::PipelineMetrics;
use launchsnipe::positions::PositionMonitor;
use launchsnipe::registry::ActiveUserRegistry;
use launchsnipe::storage::{SqliteStore, Store};
use launchsnipe::types::{Lamports, LaunchMetadata, Role, TradeSide, User, Venue};

pub const NETWORK_FEE: Lamports = 5_000;
pub const TOKEN_DECIMALS: u8 = 6;

/// Raw token units bought with `lamports` at `price` SOL per whole token.
pub fn tokens_for(lamports: Lamports, price: f64) -> u64 {
    (lamports as f64 / (price * 1_000.0)).round() as u64
}

/// Lamports received for `tokens` raw units at `price`.
pub fn lamports_for(tokens: u64, price: f64) -> Lamports {
    (tokens as f64 * price * 1_000.0).round() as Lamports
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TxKind {
    Create,
    Buy { amount: Lamports },
    Fund,
    Tip,
}

pub struct NetState {
    pub balances: HashMap<String, Lamports>,
    pub default_balance: Lamports,
    pub bundles: Vec<Vec<SignedTx>>,
    pub kinds: HashMap<String, TxKind>,
    pub landed: HashMap<String, Inclusion>,
    pub fills: HashMap<String, FillReport>,
    pub reject_bundles: bool,
    pub land_funding: bool,
    pub land_launches: bool,
    /// Positions inside a launch bundle that never show up on chain.
    pub drop_positions: HashSet<usize>,
    pub launch_price: f64,
    pub slot: u64,
}

/// Chain, block builder and transaction factory in one scripted fake.
pub struct FakeNet {
    pub state: Mutex<NetState>,
}

impl FakeNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetState {
                balances: HashMap::new(),
                default_balance: 0,
                bundles: Vec::new(),
                kinds: HashMap::new(),
                landed: HashMap::new(),
                fills: HashMap::new(),
                reject_bundles: false,
                land_funding: true,
                land_launches: true,
                drop_positions: HashSet::new(),
                launch_price: 1.0,
                slot: 1_000,
            }),
        })
    }

    pub fn set_balance(&self, address: &str, lamports: Lamports) {
        self.state.lock().unwrap().balances.insert(address.to_string(), lamports);
    }

    pub fn bundles(&self) -> Vec<Vec<SignedTx>> {
        self.state.lock().unwrap().bundles.clone()
    }

    pub fn kind_of(&self, signature: &str) -> Option<TxKind> {
        self.state.lock().unwrap().kinds.get(signature).copied()
    }

    fn record(&self, tx: SignedTx, kind: TxKind) -> SignedTx {
        self.state.lock().unwrap().kinds.insert(tx.signature.clone(), kind);
        tx
    }
}

fn signed_transfers(signer: &SigningKey, transfers: &[(SolPubkey, Lamports)], blockhash: &str) -> Result<SignedTx> {
    let hash = Hash::from_str(blockhash)?;
    let instructions: Vec<_> = transfers
        .iter()
        .map(|(to, lamports)| system_instruction::transfer(&signer.pubkey(), to, *lamports))
        .collect();
    let tx = Transaction::new_signed_with_payer(&instructions, Some(&signer.pubkey()), &[signer.keypair()], hash);
    SignedTx::from_versioned(&VersionedTransaction::from(tx))
}

#[async_trait]
impl ChainClient for FakeNet {
    async fn balance(&self, address: &str) -> Result<Lamports> {
        let state = self.state.lock().unwrap();
        Ok(state.balances.get(address).copied().unwrap_or(state.default_balance))
    }

    async fn latest_blockhash(&self) -> Result<String> {
        Ok(Hash::new_unique().to_string())
    }

    async fn inclusions(&self, signatures: &[String]) -> Result<Vec<Option<Inclusion>>> {
        let state = self.state.lock().unwrap();
        Ok(signatures.iter().map(|s| state.landed.get(s).cloned()).collect())
    }

    async fn fill(&self, signature: &str, _owner: &str, _mint: &str) -> Result<FillReport> {
        self.state
            .lock()
            .unwrap()
            .fills
            .get(signature)
            .cloned()
            .ok_or_else(|| anyhow!("no fill recorded for {}", signature))
    }
}

#[async_trait]
impl BlockBuilder for FakeNet {
    async fn send_bundle(&self, transactions: &[SignedTx]) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.reject_bundles {
            bail!("bundle refused: simulation failed");
        }
        state.bundles.push(transactions.to_vec());
        state.slot += 1;
        let slot = state.slot;

        let funding = transactions
            .iter()
            .all(|tx| state.kinds.get(&tx.signature) == Some(&TxKind::Fund));
        let lands = if funding { state.land_funding } else { state.land_launches };
        if lands {
            for (position, tx) in transactions.iter().enumerate() {
                if !funding && state.drop_positions.contains(&position) {
                    continue;
                }
                state.landed.insert(
                    tx.signature.clone(),
                    Inclusion {
                        signature: tx.signature.clone(),
                        slot,
                        success: true,
                    },
                );
                if let Some(TxKind::Buy { amount }) = state.kinds.get(&tx.signature).copied() {
                    let tokens = tokens_for(amount, state.launch_price);
                    state.fills.insert(
                        tx.signature.clone(),
                        FillReport {
                            tx_id: tx.signature.clone(),
                            slot: Some(slot),
                            quote_amount: amount,
                            token_amount: tokens,
                            unit_price: FillReport::price_of(amount, tokens, TOKEN_DECIMALS),
                            fee: NETWORK_FEE,
                        },
                    );
                }
            }
        }
        Ok(format!("bundle-{}", state.bundles.len()))
    }
}

#[async_trait]
impl TransactionFactory for FakeNet {
    async fn create_token(
        &self,
        creator: &SigningKey,
        _mint: &SigningKey,
        _metadata: &LaunchMetadata,
        _venue: Venue,
        blockhash: &str,
    ) -> Result<SignedTx> {
        let tx = signed_transfers(creator, &[(SolPubkey::new_unique(), 1)], blockhash)?;
        Ok(self.record(tx, TxKind::Create))
    }

    async fn buy(
        &self,
        buyer: &SigningKey,
        _mint: &str,
        amount: Lamports,
        _slippage_bps: u16,
        _venue: Venue,
        blockhash: &str,
    ) -> Result<SignedTx> {
        let tx = signed_transfers(buyer, &[(SolPubkey::new_unique(), amount)], blockhash)?;
        Ok(self.record(tx, TxKind::Buy { amount }))
    }

    async fn fund(&self, payer: &SigningKey, transfers: &[(String, Lamports)], blockhash: &str) -> Result<SignedTx> {
        let transfers = transfers
            .iter()
            .map(|(to, lamports)| Ok((SolPubkey::from_str(to)?, *lamports)))
            .collect::<Result<Vec<_>>>()?;
        let tx = signed_transfers(payer, &transfers, blockhash)?;
        Ok(self.record(tx, TxKind::Fund))
    }

    async fn tip(&self, payer: &SigningKey, amount: Lamports, blockhash: &str) -> Result<SignedTx> {
        let tx = signed_transfers(payer, &[(SolPubkey::new_unique(), amount)], blockhash)?;
        Ok(self.record(tx, TxKind::Tip))
    }
}

/// Scripted price path; each quote advances one step and then holds.
pub struct FakePrices {
    path: Mutex<VecDeque<PriceQuote>>,
    current: Mutex<PriceQuote>,
}

impl FakePrices {
    pub fn new(price: f64, liquidity_sol: f64) -> Arc<Self> {
        Arc::new(Self {
            path: Mutex::new(VecDeque::new()),
            current: Mutex::new(PriceQuote { price, liquidity_sol }),
        })
    }

    pub fn push(&self, price: f64, liquidity_sol: f64) {
        self.path.lock().unwrap().push_back(PriceQuote { price, liquidity_sol });
    }

    pub fn current(&self) -> PriceQuote {
        *self.current.lock().unwrap()
    }
}

#[async_trait]
impl PriceSource for FakePrices {
    async fn quote(&self, _mint: &str) -> Result<PriceQuote> {
        let next = self.path.lock().unwrap().pop_front();
        let mut current = self.current.lock().unwrap();
        if let Some(next) = next {
            *current = next;
        }
        Ok(*current)
    }
}

/// Swaps that fill at the current fake price.
pub struct FakeSwaps {
    prices: Arc<FakePrices>,
    pub failing: AtomicBool,
    pub requests: Mutex<Vec<SwapRequest>>,
    counter: AtomicU64,
}

impl FakeSwaps {
    pub fn new(prices: Arc<FakePrices>) -> Arc<Self> {
        Arc::new(Self {
            prices,
            failing: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        })
    }

    pub fn requests(&self) -> Vec<SwapRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SwapExecutor for FakeSwaps {
    async fn swap(&self, _signer: &SigningKey, request: &SwapRequest) -> Result<FillReport> {
        self.requests.lock().unwrap().push(request.clone());
        if self.failing.load(Ordering::SeqCst) {
            bail!("swap simulation failed");
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let price = self.prices.current().price;
        let (quote_amount, token_amount) = match request.side {
            TradeSide::Buy => (request.amount, tokens_for(request.amount, price)),
            TradeSide::Sell => (lamports_for(request.amount, price), request.amount),
        };
        Ok(FillReport {
            tx_id: format!("swap-{}", n),
            slot: Some(2_000 + n),
            quote_amount,
            token_amount,
            unit_price: FillReport::price_of(quote_amount, token_amount, TOKEN_DECIMALS),
            fee: NETWORK_FEE,
        })
    }
}

/// Launch settings tuned for fast tests: no tip, a one second landing window.
pub fn launch_config() -> LaunchConfig {
    LaunchConfig {
        tip_lamports: 0,
        landing_timeout_secs: 1,
        landing_poll_ms: 10,
        ..LaunchConfig::default()
    }
}

pub fn monitor_config() -> MonitorConfig {
    MonitorConfig {
        default_scan_interval_ms: 10,
        exit_max_retries: 2,
        exit_backoff_base_ms: 2,
        exit_backoff_cap_ms: 10,
        quote_timeout_ms: 500,
    }
}

/// Every component wired against the fakes.
pub struct Harness {
    pub store: Arc<dyn Store>,
    pub net: Arc<FakeNet>,
    pub prices: Arc<FakePrices>,
    pub swaps: Arc<FakeSwaps>,
    pub vault: KeyVault,
    pub control: ControlChannel,
    pub metrics: PipelineMetrics,
    pub ephemeral: Arc<MemoryEphemeralStore>,
    pub registry: Arc<ActiveUserRegistry>,
    pub monitor: Arc<PositionMonitor>,
    pub pool: Arc<BotWalletPool>,
    pub launches: Arc<LaunchCoordinator>,
    pub shutdown: watch::Sender<bool>,
}

impl Harness {
    pub async fn new() -> Result<Self> {
        Self::with_config(launch_config(), monitor_config()).await
    }

    pub async fn with_config(launch: LaunchConfig, monitor_config: MonitorConfig) -> Result<Self> {
        let store: Arc<dyn Store> = SqliteStore::in_memory().await?;
        let net = FakeNet::new();
        let prices = FakePrices::new(1.0, 100.0);
        let swaps = FakeSwaps::new(prices.clone());
        let vault = KeyVault::new(MasterKey::new(&[9; 32])?, Duration::from_secs(60), 1_000);
        let control = ControlChannel::new(256, 256);
        let metrics = PipelineMetrics::new();
        let ephemeral = Arc::new(MemoryEphemeralStore::new(1_000));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let registry = Arc::new(ActiveUserRegistry::new(
            store.clone(),
            ephemeral.clone(),
            control.clone(),
            vault.clone(),
            net.clone(),
            Duration::from_secs(60),
        ));
        let monitor = PositionMonitor::new(
            store.clone(),
            prices.clone(),
            swaps.clone(),
            SignerDirectory::new(store.clone(), vault.clone()),
            control.clone(),
            metrics.clone(),
            monitor_config,
            shutdown_rx,
        );
        let landing = LandingWatch::new(
            Duration::from_secs(launch.landing_timeout_secs),
            Duration::from_millis(launch.landing_poll_ms),
        );
        let pool = Arc::new(BotWalletPool::new(
            store.clone(),
            vault.clone(),
            net.clone(),
            net.clone(),
            net.clone(),
            landing,
        ));
        let launches = LaunchCoordinator::new(
            store.clone(),
            pool.clone(),
            vault.clone(),
            net.clone(),
            net.clone(),
            net.clone(),
            prices.clone(),
            monitor.clone(),
            control.clone(),
            metrics.clone(),
            launch,
        );

        Ok(Self {
            store,
            net,
            prices,
            swaps,
            vault,
            control,
            metrics,
            ephemeral,
            registry,
            monitor,
            pool,
            launches,
            shutdown,
        })
    }

    /// A stored user with a sealed key and `balance` lamports on chain.
    pub async fn user(&self, role: Role, balance: Lamports) -> Result<(User, SigningKey)> {
        let (key, blob) = self.vault.generate()?;
        let mut user = User::new(key.address(), role);
        user.encrypted_key = Some(blob);
        self.store.upsert_user(&user).await?;
        self.net.set_balance(&user.wallet, balance);
        Ok((user, key))
    }

    /// Status states published to `user`, in order.
    pub fn status_states(&self, user: &str) -> Vec<String> {
        self.control
            .history(user)
            .into_iter()
            .filter_map(|event| match event {
                ControlEvent::StatusUpdate(update) => Some(update.state),
                _ => None,
            })
            .collect()
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn metadata() -> LaunchMetadata {
    LaunchMetadata {
        name: "Test Token".to_string(),
        symbol: "TEST".to_string(),
        description: "integration test token".to_string(),
        image_uri: "ipfs://image".to_string(),
        metadata_uri: "ipfs://metadata".to_string(),
    }
}
