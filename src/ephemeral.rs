//! TTL-keyed ephemeral store for nonces, heartbeats and short-lived handoffs.
//!
//! Values are always UTF-8 strings. `memory://` selects the in-process moka
//! backend, `redis://` the shared one.

use anyhow::{Context, Result};
use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Get and delete in one step; a value can be taken at most once.
    async fn take(&self, key: &str) -> Result<Option<String>>;
}

/// Open the backend named by `url`.
pub async fn connect(url: &str) -> Result<Arc<dyn EphemeralStore>> {
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let store = RedisEphemeralStore::connect(url).await?;
        info!("Ephemeral store: redis");
        Ok(Arc::new(store))
    } else if url.starts_with("memory://") || url.is_empty() {
        info!("Ephemeral store: in-process");
        Ok(Arc::new(MemoryEphemeralStore::new(100_000)))
    } else {
        anyhow::bail!("unsupported ephemeral store url '{}'", url)
    }
}

#[derive(Clone)]
struct Entry {
    value: String,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, entry: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// In-process backend; each entry carries its own TTL.
pub struct MemoryEphemeralStore {
    cache: Cache<String, Entry>,
}

impl MemoryEphemeralStore {
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }
}

#[async_trait]
impl EphemeralStore for MemoryEphemeralStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.cache
            .insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.get(key).await.map(|e| e.value))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.remove(key).await.map(|e| e.value))
    }
}

/// Redis backend using a multiplexed connection.
pub struct RedisEphemeralStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisEphemeralStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid redis url")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl EphemeralStore for RedisEphemeralStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async::<_, ()>(&mut conn)
            .await
            .with_context(|| format!("redis SET {} failed", key))?;
        debug!("Stored ephemeral key {} for {:?}", key, ttl);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("redis GET {} failed", key))?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await
            .with_context(|| format!("redis DEL {} failed", key))?;
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GETDEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("redis GETDEL {} failed", key))?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_take_is_single_use() -> Result<()> {
        let store = MemoryEphemeralStore::new(100);
        store.set("nonce:abc", "hello", Duration::from_secs(60)).await?;
        assert_eq!(store.get("nonce:abc").await?.as_deref(), Some("hello"));
        assert_eq!(store.take("nonce:abc").await?.as_deref(), Some("hello"));
        assert_eq!(store.take("nonce:abc").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_entries_expire() -> Result<()> {
        let store = MemoryEphemeralStore::new(100);
        store.set("short", "x", Duration::from_millis(50)).await?;
        store.set("long", "y", Duration::from_secs(60)).await?;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.get("short").await?, None);
        assert_eq!(store.get("long").await?.as_deref(), Some("y"));
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        assert!(connect("ftp://nowhere").await.is_err());
        assert!(connect("memory://").await.is_ok());
    }
}
