//! Redis Store - Distributed Key-Value Backend
//!
//! The production [`KeyValueStore`]: one `ConnectionManager` (automatic
//! reconnection) for commands, and dedicated pub/sub connections from the
//! same client for subscriptions.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::traits::{KeyValueStore, StoreOp, UNLOCK_SCRIPT};

/// Redis store with `ConnectionManager` for automatic reconnection
pub struct RedisStore {
    client: Client,
    /// Redis connection manager - handles reconnection automatically
    conn_manager: ConnectionManager,
    prefix: String,
    unlock_script: Script,
}

impl RedisStore {
    /// Connect using `REDIS_URL` / `CACHE_KEY_PREFIX`
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn new() -> Result<Self> {
        Self::with_config(&StoreConfig::from_env()).await
    }

    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn with_config(config: &StoreConfig) -> Result<Self> {
        let redis_url = config.url.as_str();
        info!(
            redis_url = %redis_url,
            prefix = %config.prefix,
            "Initializing Redis Store with ConnectionManager"
        );

        let client = Client::open(redis_url)
            .with_context(|| format!("Failed to create Redis client with URL: {redis_url}"))?;

        let conn_manager = ConnectionManager::new(client.clone())
            .await
            .context("Failed to establish Redis connection manager")?;

        // Test connection
        let mut conn = conn_manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis PING health check failed")?;

        info!(
            redis_url = %redis_url,
            "Redis Store connected successfully (ConnectionManager enabled)"
        );

        Ok(Self {
            client,
            conn_manager,
            prefix: config.prefix.clone(),
            unlock_script: Script::new(UNLOCK_SCRIPT),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn_manager.clone();

        let value: Option<Vec<u8>> = conn
            .get(self.full_key(key))
            .await
            .with_context(|| format!("Redis GET failed for {key}"))?;
        Ok(value)
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Vec<u8>, Option<Duration>)>> {
        let mut conn = self.conn_manager.clone();
        let full_key = self.full_key(key);

        // GET and PTTL in one round trip so they observe the same key
        let (value, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .atomic()
            .get(&full_key)
            .cmd("PTTL")
            .arg(&full_key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Redis GET/PTTL failed for {key}"))?;

        let Some(bytes) = value else {
            return Ok(None);
        };

        // PTTL: -1 = no expiry, -2 = key doesn't exist
        let ttl = (pttl >= 0).then(|| Duration::from_millis(pttl.unsigned_abs()));
        Ok(Some((bytes, ttl)))
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.conn_manager.clone();

        // SET key value NX PX ttl -> "OK" or nil
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Redis SET NX failed for {key}"))?;

        Ok(reply.is_some())
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn_manager.clone();

        let _: () = redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Redis SET failed for {key}"))?;
        debug!(key = %key, ttl_secs = %ttl.as_secs(), "[Redis] Stored key with TTL");
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let removed: usize = conn
            .del(self.full_key(key))
            .await
            .with_context(|| format!("Redis DEL failed for {key}"))?;
        Ok(removed > 0)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let deleted: i64 = self
            .unlock_script
            .key(self.full_key(key))
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Redis unlock script failed for {key}"))?;
        Ok(deleted == 1)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn_manager.clone();
        let value: i64 = conn
            .incr(self.full_key(key), delta)
            .await
            .with_context(|| format!("Redis INCRBY failed for {key}"))?;
        Ok(value)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let _: i64 = conn
            .publish(self.full_key(channel), message)
            .await
            .with_context(|| format!("Redis PUBLISH failed on {channel}"))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("Failed to get pubsub connection")?;

        pubsub
            .subscribe(self.full_key(channel))
            .await
            .context("Failed to subscribe to channel")?;

        debug!(channel = %channel, "[Redis] Subscribed");

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(stream.boxed())
    }

    /// Uses cursor-based `SCAN`, safe for production use unlike `KEYS`
    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn_manager.clone();
        let full_pattern = self.full_key(pattern);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            // SCAN cursor MATCH pattern COUNT 100
            let result: (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&full_pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .with_context(|| format!("Redis SCAN failed for {pattern}"))?;

            cursor = result.0;
            keys.extend(
                result
                    .1
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string)),
            );

            // Cursor 0 means iteration is complete
            if cursor == 0 {
                break;
            }
        }

        debug!(pattern = %pattern, count = keys.len(), "[Redis] Scanned keys matching pattern");
        Ok(keys)
    }

    async fn transaction(&self, ops: Vec<StoreOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn_manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();

        for op in &ops {
            match op {
                StoreOp::SetEx { key, value, ttl } => {
                    pipe.cmd("SET")
                        .arg(self.full_key(key))
                        .arg(value.as_slice())
                        .arg("PX")
                        .arg(millis(*ttl))
                        .ignore();
                }
                StoreOp::Del { key } => {
                    pipe.del(self.full_key(key)).ignore();
                }
            }
        }

        let _: () = pipe
            .query_async(&mut conn)
            .await
            .context("Redis MULTI/EXEC failed")?;
        debug!(ops = ops.len(), "[Redis] Applied transaction");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let test_key = "health_check_redis";
        let test_value = vec![1, 2, 3, 4];

        match self.set_ex(test_key, &test_value, Duration::from_secs(10)).await {
            Ok(()) => match self.get(test_key).await {
                Ok(Some(retrieved)) => {
                    let _ = self.del(test_key).await;
                    retrieved == test_value
                }
                _ => false,
            },
            Err(_) => false,
        }
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}
