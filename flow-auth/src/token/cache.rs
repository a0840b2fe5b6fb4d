//! Token cache with proactive refresh.
//!
//! Each cache key owns a slot guarded by its own async mutex, so a refresh for
//! one key serialises callers of that key only. Concurrent callers of the same
//! key wait for the in-progress refresh and then see its result.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::TokenSet;
use crate::clock::{Clock, SystemClock};
use crate::error::{config_error, ConfigErrorKind, Error};
use crate::storage::FlowStore;

/// Refresh once 80% of a token's lifetime has elapsed.
pub const DEFAULT_TTL_PERCENT: f64 = 0.8;

/// Lifetime assumed for tokens issued without `expires_in`.
pub const DEFAULT_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedTokenRecord {
    pub token: TokenSet,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub cache_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Freshness {
    Fresh,
    StaleButValid,
    Expired,
}

impl CachedTokenRecord {
    pub fn new(cache_key: &str, token: TokenSet) -> Self {
        let issued_at = token.issued_at;
        let expires_at = token
            .expires_at
            .unwrap_or_else(|| issued_at + Duration::seconds(DEFAULT_LIFETIME_SECS));
        Self {
            token,
            issued_at,
            expires_at,
            cache_key: cache_key.to_string(),
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.expires_at - self.issued_at
    }

    /// The instant after which the record is no longer fresh.
    pub fn refresh_at(&self, ttl_percent: f64) -> DateTime<Utc> {
        let millis = (self.lifetime().num_milliseconds() as f64 * ttl_percent) as i64;
        Duration::try_milliseconds(millis)
            .and_then(|elapsed| self.issued_at.checked_add_signed(elapsed))
            .unwrap_or(self.expires_at)
    }

    pub fn freshness(&self, ttl_percent: f64, now: DateTime<Utc>) -> Freshness {
        if now >= self.expires_at {
            Freshness::Expired
        } else if now >= self.refresh_at(ttl_percent) {
            Freshness::StaleButValid
        } else {
            Freshness::Fresh
        }
    }
}

/// Whether `record` is due for refresh at `now`.
pub fn should_refresh(record: &CachedTokenRecord, ttl_percent: f64, now: DateTime<Utc>) -> bool {
    record.freshness(ttl_percent, now) != Freshness::Fresh
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
}

type Slot = Arc<Mutex<Option<CachedTokenRecord>>>;

pub struct TokenCache {
    slots: DashMap<String, Slot>,
    store: Option<FlowStore>,
    clock: Arc<dyn Clock>,
    ttl_percent: f64,
    counters: Counters,
}

impl TokenCache {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            store: None,
            clock: Arc::new(SystemClock),
            ttl_percent: DEFAULT_TTL_PERCENT,
            counters: Counters::default(),
        }
    }

    /// Persist records through `store` and reload them on first access.
    pub fn with_store(mut self, store: FlowStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ttl_percent(mut self, ttl_percent: f64) -> Result<Self, Error> {
        validate_ttl_percent(ttl_percent)?;
        self.ttl_percent = ttl_percent;
        Ok(self)
    }

    pub fn ttl_percent(&self) -> f64 {
        self.ttl_percent
    }

    fn slot(&self, key: &str) -> Slot {
        self.slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Load the persisted record into an empty slot, then purge it if expired.
    async fn current(
        &self,
        key: &str,
        slot: &mut Option<CachedTokenRecord>,
    ) -> Result<Option<CachedTokenRecord>, Error> {
        if slot.is_none() {
            if let Some(store) = &self.store {
                *slot = store.load_tokens(key).await?;
            }
        }

        let now = self.clock.now();
        if let Some(record) = slot.as_ref() {
            if record.freshness(self.ttl_percent, now) == Freshness::Expired {
                debug!("Purging expired token for {}", key);
                *slot = None;
                if let Some(store) = &self.store {
                    store.remove_tokens(key).await?;
                }
            }
        }
        Ok(slot.clone())
    }

    /// A fresh token for `key`, if one is cached.
    pub async fn get(&self, key: &str) -> Result<Option<TokenSet>, Error> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        let record = self.current(key, &mut guard).await?;
        let now = self.clock.now();

        match record {
            Some(record) if record.freshness(self.ttl_percent, now) == Freshness::Fresh => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(record.token))
            }
            _ => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// The cached record for `key` regardless of freshness, unless expired.
    pub async fn peek(&self, key: &str) -> Result<Option<CachedTokenRecord>, Error> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        self.current(key, &mut guard).await
    }

    pub async fn set(&self, key: &str, token: TokenSet) -> Result<CachedTokenRecord, Error> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        self.store_record(key, &mut guard, token).await
    }

    async fn store_record(
        &self,
        key: &str,
        slot: &mut Option<CachedTokenRecord>,
        token: TokenSet,
    ) -> Result<CachedTokenRecord, Error> {
        let record = CachedTokenRecord::new(key, token);
        if let Some(store) = &self.store {
            store.save_tokens(key, &record).await?;
        }
        *slot = Some(record.clone());
        Ok(record)
    }

    /// Return a usable token for `key`, refreshing through `refresh_fn` when the
    /// cached one is missing or past `ttl_percent` of its lifetime.
    ///
    /// `refresh_fn` receives the current token, if any. When a due refresh fails
    /// and the cached token has not expired yet, that token is returned instead.
    pub async fn auto_refresh_if_needed<F, Fut>(
        &self,
        key: &str,
        refresh_fn: F,
        ttl_percent: f64,
    ) -> Result<TokenSet, Error>
    where
        F: FnOnce(Option<TokenSet>) -> Fut,
        Fut: Future<Output = Result<TokenSet, Error>>,
    {
        validate_ttl_percent(ttl_percent)?;

        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        let record = self.current(key, &mut guard).await?;

        if let Some(record) = &record {
            if !should_refresh(record, ttl_percent, self.clock.now()) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(record.token.clone());
            }
            debug!("Token for {} is due for refresh", key);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }

        match refresh_fn(record.as_ref().map(|r| r.token.clone())).await {
            Ok(token) => {
                self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
                let record = self.store_record(key, &mut guard, token).await?;
                Ok(record.token)
            }
            Err(e) => {
                self.counters.refresh_failures.fetch_add(1, Ordering::Relaxed);
                match record {
                    Some(stale) => {
                        warn!("Refresh for {} failed, serving cached token: {}", key, e);
                        Ok(stale.token)
                    }
                    None => Err(e),
                }
            }
        }
    }

    pub async fn remove(&self, key: &str) -> Result<(), Error> {
        if let Some((_, slot)) = self.slots.remove(key) {
            *slot.lock().await = None;
        }
        if let Some(store) = &self.store {
            store.remove_tokens(key).await?;
        }
        Ok(())
    }

    pub async fn clear_all(&self) -> Result<(), Error> {
        let keys: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.remove(&key).await?;
        }
        if let Some(store) = &self.store {
            for key in store.token_keys().await? {
                store.remove_tokens(&key).await?;
            }
        }
        Ok(())
    }

    /// Drop expired records. Returns how many were removed.
    pub async fn cleanup_expired(&self) -> Result<usize, Error> {
        let now = self.clock.now();
        let slots: Vec<(String, Slot)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut removed = 0;
        for (key, slot) in slots {
            let mut guard = slot.lock().await;
            let expired = guard
                .as_ref()
                .map(|r| r.freshness(self.ttl_percent, now) == Freshness::Expired)
                .unwrap_or(false);
            if expired {
                *guard = None;
                if let Some(store) = &self.store {
                    store.remove_tokens(&key).await?;
                }
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> CacheStats {
        let slots: Vec<Slot> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut entries = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                entries += 1;
            }
        }
        CacheStats {
            entries,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            refreshes: self.counters.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.counters.refresh_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_ttl_percent(ttl_percent: f64) -> Result<(), Error> {
    if ttl_percent > 0.0 && ttl_percent <= 1.0 {
        Ok(())
    } else {
        Err(config_error(
            ConfigErrorKind::InvalidValue("ttl_percent"),
            "ttl percent must be in (0, 1]",
        ))
    }
}
