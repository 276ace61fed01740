use async_trait::async_trait;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Provider responses are kept for a week.
pub const SEARCH_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const IMAGE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Barcode records rarely change.
pub const BARCODE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Opaque string cache with per-entry TTL. Failures are absorbed: a broken
/// cache only costs an extra provider call.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str, ttl: Duration);
    async fn ping(&self) -> bool {
        true
    }
}

pub type SharedCache = Arc<dyn CacheStore>;

pub fn cache_key(category: &str, query: &str) -> String {
    let digest = Sha256::digest(query.as_bytes());
    format!("cache:{category}:{}", hex::encode(digest))
}

pub async fn get_json<T: serde::de::DeserializeOwned>(cache: &dyn CacheStore, key: &str) -> Option<T> {
    let raw = cache.get(key).await?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(target = "smartenrich.cache", key = key, error = %err, "cache_entry_undecodable");
            None
        }
    }
}

pub async fn set_json<T: serde::Serialize>(cache: &dyn CacheStore, key: &str, value: &T, ttl: Duration) {
    if let Ok(json) = serde_json::to_string(value) {
        cache.set(key, &json, ttl).await;
    }
}

pub struct RedisCache {
    client: redis::Client,
}

impl RedisCache {
    pub fn open(url: &str) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = match self.client.get_multiplexed_async_connection().await {
            Ok(c) => c,
            Err(err) => {
                warn!(target = "smartenrich.cache", error = %err, "redis_connect_failed");
                return None;
            }
        };
        conn.get::<_, Option<String>>(key).await.ok().flatten()
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) {
        if let Ok(mut conn) = self.client.get_multiplexed_async_connection().await {
            let result: Result<(), _> = conn.set_ex(key, value, ttl.as_secs().max(1)).await;
            if let Err(err) = result {
                warn!(target = "smartenrich.cache", key = key, error = %err, "redis_set_failed");
            }
        }
    }

    async fn ping(&self) -> bool {
        match self.client.get_multiplexed_async_connection().await {
            Ok(mut conn) => redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .is_ok(),
            Err(_) => false,
        }
    }
}

/// In-process fallback when no Redis is configured.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) {
        let expires = Instant::now() + ttl;
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), expires));
    }
}

pub fn from_url(redis_url: Option<&str>) -> SharedCache {
    match redis_url.map(RedisCache::open) {
        Some(Ok(cache)) => Arc::new(cache),
        Some(Err(err)) => {
            warn!(target = "smartenrich.cache", error = %err, "redis_url_invalid_using_memory");
            Arc::new(MemoryCache::new())
        }
        None => Arc::new(MemoryCache::new()),
    }
}
