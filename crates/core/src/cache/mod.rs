//! TTL cache in front of the data provider.
//!
//! Reads inside the kind's TTL are served from memory. Misses and expired
//! entries go to the provider; a failed refresh falls back to the last stored
//! value (tagged `Stale`) when one exists. Empty results are returned but never
//! stored, so the next read goes upstream again. Concurrent reads of one key
//! share a single upstream call.
//!
//! Per-key gates live only while a key has callers. Stored values are kept
//! for stale fallback until they are `STALE_RETENTION_FACTOR` TTLs old (at
//! least a day), then swept.

use crate::config::Settings;
use crate::ingest::provider::{Provider, ProviderError};
use crate::ingest::types::{FetchKey, ProviderData, ProviderKind};
use crate::time::Clock;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Ok,
    Stale,
    Error,
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub status: FetchStatus,
    pub data: Option<Arc<ProviderData>>,
    /// The upstream failure behind a `Stale` or `Error` status.
    pub error: Option<ProviderError>,
}

impl Fetched {
    fn ok(data: Arc<ProviderData>) -> Self {
        Self {
            status: FetchStatus::Ok,
            data: Some(data),
            error: None,
        }
    }

    fn stale(data: Arc<ProviderData>, error: ProviderError) -> Self {
        Self {
            status: FetchStatus::Stale,
            data: Some(data),
            error: Some(error),
        }
    }

    fn error(error: ProviderError) -> Self {
        Self {
            status: FetchStatus::Error,
            data: None,
            error: Some(error),
        }
    }

    /// Data usable by callers: fresh or stale.
    pub fn usable(&self) -> Option<&ProviderData> {
        match self.status {
            FetchStatus::Ok | FetchStatus::Stale => self.data.as_deref(),
            FetchStatus::Error => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub quote: Duration,
    pub analyst_ratings: Duration,
    pub consensus: Duration,
}

impl CacheTtls {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            quote: Duration::seconds(settings.cache_ttl_quote_secs),
            analyst_ratings: Duration::seconds(settings.cache_ttl_ratings_secs),
            consensus: Duration::seconds(settings.cache_ttl_consensus_secs),
        }
    }

    pub fn for_kind(&self, kind: ProviderKind) -> Duration {
        match kind {
            ProviderKind::Quote => self.quote,
            ProviderKind::AnalystRatings => self.analyst_ratings,
            ProviderKind::Consensus => self.consensus,
        }
    }
}

type CacheKey = (ProviderKind, FetchKey);

pub const STALE_RETENTION_FACTOR: i32 = 24;
const SWEEP_EVERY_INSERTS: u64 = 256;

#[derive(Debug)]
struct Entry {
    value: Arc<ProviderData>,
    fetched_at: DateTime<Utc>,
}

/// Per-key gate. `generation` bumps each time a flight completes, so a caller
/// that queued behind a flight can tell it should reuse that flight's result.
#[derive(Default)]
struct KeySlot {
    generation: AtomicU64,
    last: Mutex<Option<Fetched>>,
}

pub struct ProviderCache {
    provider: Arc<dyn Provider>,
    clock: Arc<dyn Clock>,
    ttls: CacheTtls,
    entries: Mutex<HashMap<CacheKey, Entry>>,
    slots: Mutex<HashMap<CacheKey, Arc<KeySlot>>>,
    inserts: AtomicU64,
}

impl ProviderCache {
    pub fn new(provider: Arc<dyn Provider>, clock: Arc<dyn Clock>, ttls: CacheTtls) -> Self {
        Self {
            provider,
            clock,
            ttls,
            entries: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            inserts: AtomicU64::new(0),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.provider_name()
    }

    pub async fn fetch(&self, kind: ProviderKind, key: &FetchKey) -> Fetched {
        let ck: CacheKey = (kind, key.clone());
        if let Some(hit) = self.fresh(&ck).await {
            tracing::debug!(kind = kind.as_str(), %key, "provider cache hit");
            return Fetched::ok(hit);
        }

        let slot = self.slot(&ck).await;
        let seen = slot.generation.load(Ordering::Acquire);
        let mut last = slot.last.lock().await;

        let result = match last.as_ref() {
            Some(shared) if slot.generation.load(Ordering::Acquire) != seen => {
                tracing::debug!(kind = kind.as_str(), %key, "joined in-flight provider fetch");
                shared.clone()
            }
            _ => {
                let result = self.load(&ck).await;
                *last = Some(result.clone());
                slot.generation.fetch_add(1, Ordering::Release);
                result
            }
        };
        drop(last);
        self.release_slot(&ck, slot).await;
        result
    }

    /// Drops expired-for-fallback entries and idle key gates.
    pub async fn prune(&self) {
        let now = self.clock.now();
        let removed = {
            let mut entries = self.entries.lock().await;
            let before = entries.len();
            entries.retain(|(kind, _), e| now - e.fetched_at < self.retention(*kind));
            before - entries.len()
        };
        // Gates orphaned by a cancelled fetch are held only by the map.
        self.slots
            .lock()
            .await
            .retain(|_, slot| Arc::strong_count(slot) > 1);
        if removed > 0 {
            tracing::debug!(removed, "pruned provider cache");
        }
    }

    pub async fn invalidate(&self, kind: ProviderKind, key: &FetchKey) {
        self.entries.lock().await.remove(&(kind, key.clone()));
    }

    #[cfg(test)]
    async fn sizes(&self) -> (usize, usize) {
        (self.entries.lock().await.len(), self.slots.lock().await.len())
    }

    async fn fresh(&self, ck: &CacheKey) -> Option<Arc<ProviderData>> {
        let entries = self.entries.lock().await;
        let entry = entries.get(ck)?;
        let age = self.clock.now() - entry.fetched_at;
        (age < self.ttls.for_kind(ck.0)).then(|| entry.value.clone())
    }

    fn retention(&self, kind: ProviderKind) -> Duration {
        (self.ttls.for_kind(kind) * STALE_RETENTION_FACTOR).max(Duration::days(1))
    }

    /// Clones are only taken under the map lock, so the last caller to
    /// release sees a count of one and removes the gate.
    async fn release_slot(&self, ck: &CacheKey, slot: Arc<KeySlot>) {
        let mut slots = self.slots.lock().await;
        drop(slot);
        if slots.get(ck).is_some_and(|s| Arc::strong_count(s) == 1) {
            slots.remove(ck);
        }
    }

    async fn slot(&self, ck: &CacheKey) -> Arc<KeySlot> {
        self.slots
            .lock()
            .await
            .entry(ck.clone())
            .or_default()
            .clone()
    }

    async fn load(&self, ck: &CacheKey) -> Fetched {
        let (kind, key) = ck;
        match self.provider.fetch(*kind, key).await {
            Ok(data) => {
                let data = Arc::new(data);
                if data.is_empty() {
                    tracing::debug!(kind = kind.as_str(), %key, "empty provider result; not cached");
                } else {
                    self.entries.lock().await.insert(
                        ck.clone(),
                        Entry {
                            value: data.clone(),
                            fetched_at: self.clock.now(),
                        },
                    );
                    if (self.inserts.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY_INSERTS == 0 {
                        self.prune().await;
                    }
                }
                Fetched::ok(data)
            }
            Err(err) => {
                let previous = self.entries.lock().await.get(ck).map(|e| e.value.clone());
                match previous {
                    Some(value) => {
                        tracing::warn!(kind = kind.as_str(), %key, error = %err, "provider failed; serving stale value");
                        Fetched::stale(value, err)
                    }
                    None => {
                        tracing::warn!(kind = kind.as_str(), %key, error = %err, "provider failed; no cached value");
                        Fetched::error(err)
                    }
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedProvider;
    use super::*;
    use crate::ingest::types::{Quote, RawRating};
    use crate::time::clock::ManualClock;
    use chrono::TimeZone;

    fn ttls() -> CacheTtls {
        CacheTtls {
            quote: Duration::minutes(5),
            analyst_ratings: Duration::hours(1),
            consensus: Duration::hours(1),
        }
    }

    fn quote(p: f64) -> ProviderData {
        ProviderData::Quote(Quote { price: Some(p), as_of: None })
    }

    fn setup(provider: ScriptedProvider) -> (Arc<ScriptedProvider>, Arc<ManualClock>, ProviderCache) {
        let provider = Arc::new(provider);
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 5, 15, 0, 0).unwrap()));
        let cache = ProviderCache::new(provider.clone(), clock.clone(), ttls());
        (provider, clock, cache)
    }

    #[tokio::test]
    async fn serves_hits_within_ttl_and_refreshes_after() {
        let (provider, clock, cache) = setup(ScriptedProvider::new());
        let key = FetchKey::current("AAPL");
        provider.push(ProviderKind::Quote, key.clone(), Ok(quote(200.0)));
        provider.push(ProviderKind::Quote, key.clone(), Ok(quote(201.0)));

        let a = cache.fetch(ProviderKind::Quote, &key).await;
        clock.advance(Duration::minutes(4));
        let b = cache.fetch(ProviderKind::Quote, &key).await;
        assert_eq!(provider.calls(), 1);
        assert_eq!(a.status, FetchStatus::Ok);
        assert_eq!(b.usable().and_then(|d| d.quote_price()), Some(200.0));

        clock.advance(Duration::minutes(2));
        let c = cache.fetch(ProviderKind::Quote, &key).await;
        assert_eq!(provider.calls(), 2);
        assert_eq!(c.usable().and_then(|d| d.quote_price()), Some(201.0));
    }

    #[tokio::test]
    async fn falls_back_to_stale_then_errors_without_history() {
        let (provider, clock, cache) = setup(ScriptedProvider::new());
        let key = FetchKey::current("MSFT");
        provider.push(ProviderKind::Quote, key.clone(), Ok(quote(410.0)));
        provider.push(ProviderKind::Quote, key.clone(), Err(ProviderError::RateLimited));

        cache.fetch(ProviderKind::Quote, &key).await;
        clock.advance(Duration::minutes(10));
        let stale = cache.fetch(ProviderKind::Quote, &key).await;
        assert_eq!(stale.status, FetchStatus::Stale);
        assert_eq!(stale.usable().and_then(|d| d.quote_price()), Some(410.0));
        assert_eq!(stale.error, Some(ProviderError::RateLimited));

        let other = FetchKey::current("NVDA");
        let err = cache.fetch(ProviderKind::Quote, &other).await;
        assert_eq!(err.status, FetchStatus::Error);
        assert!(err.usable().is_none());
    }

    #[tokio::test]
    async fn empty_results_are_retried_not_cached() {
        let (provider, _clock, cache) = setup(ScriptedProvider::new());
        let key = FetchKey::current("AAPL");
        provider.push(ProviderKind::AnalystRatings, key.clone(), Ok(ProviderData::Ratings(vec![])));
        provider.push(
            ProviderKind::AnalystRatings,
            key.clone(),
            Ok(ProviderData::Ratings(vec![RawRating {
                firm: Some("Citi".into()),
                action: None,
                rating: None,
                price_target: Some(190.0),
            }])),
        );

        let first = cache.fetch(ProviderKind::AnalystRatings, &key).await;
        assert_eq!(first.status, FetchStatus::Ok);
        assert!(first.usable().unwrap().is_empty());

        let second = cache.fetch(ProviderKind::AnalystRatings, &key).await;
        assert_eq!(provider.calls(), 2);
        assert_eq!(second.usable().unwrap().ratings().unwrap().len(), 1);

        cache.fetch(ProviderKind::AnalystRatings, &key).await;
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_reads_share_one_upstream_call() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let (provider, _clock, cache) = setup(ScriptedProvider::gated(gate.clone()));
        let cache = Arc::new(cache);
        let key = FetchKey::current("AAPL");
        provider.push(ProviderKind::Quote, key.clone(), Ok(quote(200.0)));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { cache.fetch(ProviderKind::Quote, &key).await }));
        }

        while provider.calls() == 0 {
            tokio::task::yield_now().await;
        }
        // Let the other callers queue on the key gate before releasing the flight.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        gate.notify_waiters();

        for h in handles {
            let f = h.await.unwrap();
            assert_eq!(f.usable().and_then(|d| d.quote_price()), Some(200.0));
        }
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block_each_other() {
        let (provider, _clock, cache) = setup(ScriptedProvider::new());
        let a = FetchKey::current("AAPL");
        let b = FetchKey::on("AAPL", chrono::NaiveDate::from_ymd_opt(2025, 1, 6).unwrap());
        provider.push(ProviderKind::Quote, a.clone(), Ok(quote(200.0)));
        provider.push(ProviderKind::Quote, b.clone(), Ok(quote(150.0)));

        let (fa, fb) = tokio::join!(
            cache.fetch(ProviderKind::Quote, &a),
            cache.fetch(ProviderKind::Quote, &b)
        );
        assert_eq!(fa.usable().and_then(|d| d.quote_price()), Some(200.0));
        assert_eq!(fb.usable().and_then(|d| d.quote_price()), Some(150.0));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn gates_are_released_and_old_entries_swept() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let (provider, clock, cache) = setup(ScriptedProvider::gated(gate.clone()));
        let cache = Arc::new(cache);
        let key = FetchKey::current("AAPL");
        provider.push(ProviderKind::Quote, key.clone(), Ok(quote(200.0)));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let cache = cache.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { cache.fetch(ProviderKind::Quote, &key).await }));
        }
        while provider.calls() == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(cache.sizes().await.1, 1);
        gate.notify_waiters();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(cache.sizes().await, (1, 0));

        // Past the TTL the value still backs stale fallback.
        clock.advance(Duration::hours(2));
        cache.prune().await;
        assert_eq!(cache.sizes().await, (1, 0));

        clock.advance(Duration::days(1));
        cache.prune().await;
        assert_eq!(cache.sizes().await, (0, 0));
    }
}
