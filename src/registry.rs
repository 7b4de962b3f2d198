//! Active-user registry.
//!
//! A user is active while any of three presence signals holds: a control
//! channel connection, a recent heartbeat in the ephemeral store, or a
//! running sniper task. The registry owns the task map; nothing else keeps
//! per-user globals.

use anyhow::Result;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, instrument, warn};

use crate::chain::ChainClient;
use crate::control::ControlChannel;
use crate::ephemeral::EphemeralStore;
use crate::keys::{KeyVault, SigningKey};
use crate::storage::Store;
use crate::types::{now_naive, to_millis, Lamports, TipAccountState, User};

/// The three presence signals of one wallet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Presence {
    pub connected: bool,
    pub heartbeat: bool,
    pub task_running: bool,
}

impl Presence {
    pub fn is_active(&self) -> bool {
        self.connected || self.heartbeat || self.task_running
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityStatus {
    pub wallet: String,
    #[serde(flatten)]
    pub presence: Presence,
    pub active: bool,
    pub has_key: bool,
    pub balance: Lamports,
    pub can_snipe: bool,
}

/// An active user with everything a sniper task needs.
#[derive(Debug, Clone)]
pub struct ActiveUser {
    pub user: User,
    pub signing_key: SigningKey,
    pub balance: Lamports,
    pub tip_account: TipAccountState,
}

pub struct ActiveUserRegistry {
    store: Arc<dyn Store>,
    ephemeral: Arc<dyn EphemeralStore>,
    control: ControlChannel,
    vault: KeyVault,
    chain: Arc<dyn ChainClient>,
    heartbeat_ttl: Duration,
    tasks: DashMap<String, AbortHandle>,
}

impl ActiveUserRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        ephemeral: Arc<dyn EphemeralStore>,
        control: ControlChannel,
        vault: KeyVault,
        chain: Arc<dyn ChainClient>,
        heartbeat_ttl: Duration,
    ) -> Self {
        Self {
            store,
            ephemeral,
            control,
            vault,
            chain,
            heartbeat_ttl,
            tasks: DashMap::new(),
        }
    }

    fn heartbeat_key(wallet: &str) -> String {
        format!("active:{}", wallet)
    }

    /// Record that `wallet` is alive for the heartbeat TTL.
    pub async fn heartbeat(&self, wallet: &str) -> Result<()> {
        let now = to_millis(now_naive()).to_string();
        self.ephemeral
            .set(&Self::heartbeat_key(wallet), &now, self.heartbeat_ttl)
            .await?;
        debug!("Heartbeat from {}", wallet);
        Ok(())
    }

    pub fn register_task(&self, wallet: &str, handle: AbortHandle) {
        if let Some(previous) = self.tasks.insert(wallet.to_string(), handle) {
            previous.abort();
        }
    }

    /// Forget and abort the task of `wallet`, if any.
    pub fn remove_task(&self, wallet: &str) {
        if let Some((_, handle)) = self.tasks.remove(wallet) {
            handle.abort();
        }
    }

    pub fn has_task(&self, wallet: &str) -> bool {
        self.tasks
            .get(wallet)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub async fn presence(&self, wallet: &str) -> Presence {
        let heartbeat = match self.ephemeral.get(&Self::heartbeat_key(wallet)).await {
            Ok(value) => value.is_some(),
            Err(e) => {
                warn!("Heartbeat lookup for {} failed: {:#}", wallet, e);
                false
            }
        };
        Presence {
            connected: self.control.is_connected(wallet),
            heartbeat,
            task_running: self.has_task(wallet),
        }
    }

    async fn balance_of(&self, wallet: &str) -> Lamports {
        match self.chain.balance(wallet).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!("Balance lookup for {} failed: {:#}", wallet, e);
                0
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn check(&self, wallet: &str) -> Result<ActivityStatus> {
        let presence = self.presence(wallet).await;
        let user = self.store.get_user(wallet).await?;

        let (has_key, buy_size) = match &user {
            Some(user) => (user.encrypted_key.is_some(), user.sniper_policy.buy_amount),
            None => (false, Lamports::MAX),
        };
        let balance = if user.is_some() {
            self.balance_of(wallet).await
        } else {
            0
        };
        let active = presence.is_active();

        Ok(ActivityStatus {
            wallet: wallet.to_string(),
            presence,
            active,
            has_key,
            balance,
            can_snipe: active && has_key && balance >= buy_size,
        })
    }

    pub async fn bulk_check(&self, wallets: &[String]) -> Result<Vec<ActivityStatus>> {
        join_all(wallets.iter().map(|w| self.check(w)))
            .await
            .into_iter()
            .collect()
    }

    /// Active users holding a usable key and at least `min_balance` lamports.
    #[instrument(skip(self))]
    pub async fn list_active(&self, min_balance: Lamports) -> Result<Vec<ActiveUser>> {
        let mut active = Vec::new();
        for user in self.store.list_users().await? {
            let Some(blob) = user.encrypted_key.clone() else {
                continue;
            };
            if !self.presence(&user.wallet).await.is_active() {
                continue;
            }
            let signing_key = match self.vault.signing_key(&user.wallet, &blob).await {
                Ok(key) => key,
                Err(e) => {
                    warn!("Skipping {}: {:#}", user.wallet, e);
                    continue;
                }
            };
            let balance = self.balance_of(&user.wallet).await;
            if balance < min_balance {
                continue;
            }
            active.push(ActiveUser {
                tip_account: user.tip_account.clone(),
                user,
                signing_key,
                balance,
            });
        }
        debug!("{} active users", active.len());
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{FillReport, Inclusion};
    use crate::ephemeral::MemoryEphemeralStore;
    use crate::keys::MasterKey;
    use crate::storage::SqliteStore;
    use crate::types::Role;
    use async_trait::async_trait;

    struct FlatBalance(Lamports);

    #[async_trait]
    impl ChainClient for FlatBalance {
        async fn balance(&self, _address: &str) -> Result<Lamports> {
            Ok(self.0)
        }
        async fn latest_blockhash(&self) -> Result<String> {
            Ok(String::new())
        }
        async fn inclusions(&self, signatures: &[String]) -> Result<Vec<Option<Inclusion>>> {
            Ok(vec![None; signatures.len()])
        }
        async fn fill(&self, _signature: &str, _owner: &str, _mint: &str) -> Result<FillReport> {
            anyhow::bail!("unused")
        }
    }

    async fn setup(balance: Lamports) -> Result<(ActiveUserRegistry, ControlChannel, User)> {
        let store = SqliteStore::in_memory().await?;
        let vault = KeyVault::new(MasterKey::new(&[3; 32])?, Duration::from_secs(60), 100);
        let (key, blob) = vault.generate()?;
        let mut user = User::new(key.address(), Role::Sniper);
        user.encrypted_key = Some(blob);
        store.upsert_user(&user).await?;

        let control = ControlChannel::new(10, 10);
        let registry = ActiveUserRegistry::new(
            store,
            Arc::new(MemoryEphemeralStore::new(100)),
            control.clone(),
            vault,
            Arc::new(FlatBalance(balance)),
            Duration::from_secs(60),
        );
        Ok((registry, control, user))
    }

    #[tokio::test]
    async fn test_inactive_until_heartbeat() -> Result<()> {
        let (registry, _control, user) = setup(1_000_000_000).await?;
        let status = registry.check(&user.wallet).await?;
        assert!(!status.active);
        assert!(status.has_key);
        assert!(!status.can_snipe);
        assert!(registry.list_active(0).await?.is_empty());

        registry.heartbeat(&user.wallet).await?;
        let status = registry.check(&user.wallet).await?;
        assert!(status.presence.heartbeat && status.can_snipe);

        let active = registry.list_active(0).await?;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].signing_key.address(), user.wallet);
        Ok(())
    }

    #[tokio::test]
    async fn test_connection_counts_but_balance_gates_sniping() -> Result<()> {
        let (registry, control, user) = setup(1_000).await?;
        let _sub = control.attach(&user.wallet);
        let statuses = registry
            .bulk_check(&[user.wallet.clone(), "Unknown1111".to_string()])
            .await?;
        assert!(statuses[0].active && statuses[0].presence.connected);
        assert!(!statuses[0].can_snipe, "balance below buy size");
        assert!(!statuses[1].active && !statuses[1].has_key);

        assert!(registry.list_active(10_000).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_task_handle_marks_active() -> Result<()> {
        let (registry, _control, user) = setup(0).await?;
        let task = tokio::spawn(async { tokio::time::sleep(Duration::from_secs(60)).await });
        registry.register_task(&user.wallet, task.abort_handle());
        assert!(registry.presence(&user.wallet).await.task_running);

        registry.remove_task(&user.wallet);
        assert!(!registry.presence(&user.wallet).await.is_active());
        Ok(())
    }
}
