//! Per-creator pool of one-shot bot wallets.
//!
//! Every state change is written to the store before the caller sees it.
//! Selection for a reservation happens in a single UPDATE…RETURNING, so two
//! launches can never hold the same wallet.

use anyhow::Context;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::chain::{BlockBuilder, ChainClient, LandingWatch, TransactionFactory};
use crate::error::{PipelineError, PipelineResult};
use crate::keys::{KeyVault, SigningKey};
use crate::storage::Store;
use crate::types::{BotWallet, Lamports, Pubkey, WalletState};

/// Wallets held for one launch.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub id: String,
    pub owner: Pubkey,
    pub wallets: Vec<BotWallet>,
}

impl Reservation {
    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }
}

pub struct BotWalletPool {
    store: Arc<dyn Store>,
    vault: KeyVault,
    chain: Arc<dyn ChainClient>,
    builder: Arc<dyn BlockBuilder>,
    factory: Arc<dyn TransactionFactory>,
    landing: LandingWatch,
}

impl BotWalletPool {
    pub fn new(
        store: Arc<dyn Store>,
        vault: KeyVault,
        chain: Arc<dyn ChainClient>,
        builder: Arc<dyn BlockBuilder>,
        factory: Arc<dyn TransactionFactory>,
        landing: LandingWatch,
    ) -> Self {
        Self {
            store,
            vault,
            chain,
            builder,
            factory,
            landing,
        }
    }

    async fn generate(&self, owner: &str, count: usize) -> PipelineResult<()> {
        for _ in 0..count {
            let (key, blob) = self.vault.generate()?;
            self.store.insert_bot_wallet(owner, &key.address(), &blob).await?;
        }
        info!("Generated {} bot wallets for {}", count, owner);
        Ok(())
    }

    async fn unreserve(&self, wallets: &[BotWallet]) -> PipelineResult<()> {
        let cleared: Vec<BotWallet> = wallets
            .iter()
            .cloned()
            .map(|mut w| {
                w.reservation = None;
                w
            })
            .collect();
        self.store.update_bot_wallets(&cleared).await?;
        Ok(())
    }

    /// Reserve `n` unfunded wallets for `owner`, generating missing ones.
    ///
    /// Fails without holding anything when `n` wallets cannot be secured.
    #[instrument(skip(self))]
    pub async fn reserve(&self, owner: &str, n: usize) -> PipelineResult<Reservation> {
        let id = Uuid::new_v4().to_string();
        if n == 0 {
            return Ok(Reservation {
                id,
                owner: owner.to_string(),
                wallets: Vec::new(),
            });
        }

        let available = self.store.count_reservable_wallets(owner).await?;
        if available < n {
            self.generate(owner, n - available).await?;
        }

        let wallets = self.store.reserve_bot_wallets(owner, n, &id).await?;
        if wallets.len() < n {
            // Lost a race for some of them; give back what we got.
            self.unreserve(&wallets).await?;
            return Err(PipelineError::validation(format!(
                "only {} of {} bot wallets available",
                wallets.len(),
                n
            )));
        }

        debug!("Reserved {} wallets under {}", wallets.len(), id);
        Ok(Reservation {
            id,
            owner: owner.to_string(),
            wallets,
        })
    }

    /// Fund every reserved wallet with `per_wallet` in one transaction sent as a bundle.
    ///
    /// On any failure the wallets are written back exactly as they were.
    #[instrument(skip(self, reservation, payer), fields(reservation = %reservation.id, wallets = reservation.len()))]
    pub async fn pre_fund(
        &self,
        reservation: &mut Reservation,
        payer: &SigningKey,
        per_wallet: Lamports,
        buy_amount: Lamports,
    ) -> PipelineResult<()> {
        if buy_amount == 0 || per_wallet <= buy_amount {
            return Err(PipelineError::validation(format!(
                "pre-fund {} must exceed buy amount {} and the buy must be positive",
                per_wallet, buy_amount
            )));
        }
        if reservation.is_empty() {
            return Ok(());
        }

        let snapshot = reservation.wallets.clone();
        match self.fund(reservation, payer, per_wallet, buy_amount).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Pre-funding {} failed, rolling back: {}", reservation.id, e);
                self.store.update_bot_wallets(&snapshot).await?;
                reservation.wallets = snapshot;
                Err(e)
            }
        }
    }

    async fn fund(
        &self,
        reservation: &mut Reservation,
        payer: &SigningKey,
        per_wallet: Lamports,
        buy_amount: Lamports,
    ) -> PipelineResult<()> {
        let transfers: Vec<(Pubkey, Lamports)> = reservation
            .wallets
            .iter()
            .map(|w| (w.address.clone(), per_wallet))
            .collect();
        let blockhash = self.chain.latest_blockhash().await?;
        let tx = self.factory.fund(payer, &transfers, &blockhash).await?;

        let bundle_id = self
            .builder
            .send_bundle(std::slice::from_ref(&tx))
            .await
            .map_err(|e| PipelineError::BundleRejected(format!("{:#}", e)))?;

        let landed = self
            .landing
            .wait(self.chain.as_ref(), std::slice::from_ref(&tx.signature))
            .await
            .and_then(|inclusions| inclusions.into_iter().next().flatten());
        match landed {
            Some(inclusion) if inclusion.success => {}
            Some(_) => {
                return Err(PipelineError::BundleRejected(format!(
                    "funding transaction {} failed on chain",
                    tx.signature
                )))
            }
            None => {
                return Err(PipelineError::BundleNotLanded {
                    bundle_id,
                    window_secs: self.landing.window.as_secs(),
                })
            }
        }

        for wallet in reservation.wallets.iter_mut() {
            wallet.state = WalletState::Funded;
            wallet.prefunded_amount = per_wallet;
            wallet.intended_buy = buy_amount;
            wallet.balance += per_wallet;
            wallet.funding_signature = Some(tx.signature.clone());
        }
        self.store
            .update_bot_wallets(&reservation.wallets)
            .await
            .context("Failed to persist funded wallets")?;
        info!(
            "Funded {} wallets with {} lamports each ({})",
            reservation.len(),
            per_wallet,
            tx.signature
        );
        Ok(())
    }

    /// Bind funded wallets to a launch that is about to submit.
    pub async fn consume(&self, launch_id: i64, reservation: &mut Reservation) -> PipelineResult<()> {
        if let Some(wallet) = reservation.wallets.iter().find(|w| w.state != WalletState::Funded) {
            return Err(PipelineError::validation(format!(
                "bot wallet {} is {} and cannot join a launch",
                wallet.address, wallet.state
            )));
        }
        for wallet in reservation.wallets.iter_mut() {
            wallet.launch_id = Some(launch_id);
        }
        self.store.update_bot_wallets(&reservation.wallets).await?;
        Ok(())
    }

    /// Mark wallets whose buy landed as spent. They leave the reservation.
    pub async fn mark_consumed(&self, reservation: &mut Reservation, addresses: &[Pubkey]) -> PipelineResult<()> {
        let mut spent = Vec::new();
        for wallet in reservation.wallets.iter_mut() {
            if addresses.contains(&wallet.address) {
                wallet.state = WalletState::Consumed;
                wallet.reservation = None;
                spent.push(wallet.clone());
            }
        }
        self.store.update_bot_wallets(&spent).await?;
        Ok(())
    }

    /// Undo `consume` after a failed launch. Spent wallets are detached too, so
    /// nothing keeps pointing at the failed launch.
    pub async fn unbind(&self, reservation: &mut Reservation) -> PipelineResult<()> {
        let mut changed = Vec::new();
        for wallet in reservation.wallets.iter_mut() {
            if wallet.launch_id.is_some() {
                wallet.launch_id = None;
                changed.push(wallet.clone());
            }
        }
        self.store.update_bot_wallets(&changed).await?;
        Ok(())
    }

    /// Return unspent wallets to `ready` and drop the reservation.
    ///
    /// Refuses wallets still bound to a launch; call [`Self::unbind`] first.
    #[instrument(skip(self, reservation), fields(reservation = %reservation.id))]
    pub async fn release(&self, reservation: &mut Reservation) -> PipelineResult<()> {
        if let Some(bound) = reservation
            .wallets
            .iter()
            .find(|w| w.state != WalletState::Consumed && w.launch_id.is_some())
        {
            return Err(PipelineError::validation(format!(
                "bot wallet {} is still bound to launch {:?}",
                bound.address, bound.launch_id
            )));
        }

        let mut released = Vec::new();
        for wallet in reservation.wallets.iter_mut() {
            if wallet.state == WalletState::Consumed {
                continue;
            }
            wallet.state = WalletState::Ready;
            wallet.prefunded_amount = 0;
            wallet.intended_buy = 0;
            wallet.funding_signature = None;
            wallet.reservation = None;
            released.push(wallet.clone());
        }
        self.store.update_bot_wallets(&released).await?;
        debug!("Released {} wallets", released.len());
        Ok(())
    }

    /// Decrypted key of a reserved wallet.
    pub async fn signing_key(&self, wallet: &BotWallet) -> PipelineResult<SigningKey> {
        Ok(self.vault.signing_key(&wallet.address, &wallet.encrypted_key).await?)
    }
}
