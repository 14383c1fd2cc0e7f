//! String-keyed backing store with per-entry time-to-live
//!
//! Sessions, authentication tickets and OIDC capture records all live here.
//! Expired entries behave exactly like absent ones.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Longest time-to-live an entry can get; longer requests are capped
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove and return the value in one atomic step.
    /// Of several concurrent callers at most one receives the value.
    async fn take(&self, key: &str) -> Result<Option<String>>;

    /// Extend the expiry of a live entry; returns false if it is absent
    async fn touch(&self, key: &str, ttl: Duration) -> Result<bool>;
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn expiry(now: Instant, ttl: Duration) -> Instant {
        now + ttl.min(MAX_TTL)
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process cache; the default backing store
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub async fn live_entries(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(Instant::now()))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.is_live(now));
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Entry::expiry(now, ttl),
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.write().await;
        Ok(entries
            .remove(key)
            .filter(|e| e.is_live(Instant::now()))
            .map(|e| e.value))
    }

    async fn touch(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = Entry::expiry(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
