use async_trait::async_trait;
use moka::future::Cache;
use persister::AsyncStorage;
use shared::Result;
use std::fmt::Debug;
use std::time::Duration;

/// Moka-based storage with optional size bound and TTL
/// Snapshots are kept in process memory only; an expired entry reads as absent
pub struct MokaStorage {
    cache: Cache<String, String>,
}

impl MokaStorage {
    /// Create a Moka storage from name, optional capacity and optional TTL
    pub fn new(name: &str, max_entries: Option<u64>, ttl: Option<Duration>) -> Self {
        let mut builder = Cache::builder().name(name);

        if let Some(capacity) = max_entries {
            builder = builder.max_capacity(capacity);
        }

        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }

        Self {
            cache: builder.build(),
        }
    }

    pub fn unbounded() -> Self {
        Self::new("persisted-clients", None, None)
    }
}

#[async_trait]
impl AsyncStorage for MokaStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.get(key).await)
    }

    async fn set_item(&self, key: &str, value: String) -> Result<()> {
        self.cache.insert(key.to_string(), value).await;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }
}

impl Debug for MokaStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaStorage")
            .field("entry_count", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .finish()
    }
}
