//! Address to identity resolution over the persistent cache and the
//! identity providers.
//!
//! Callers pass addresses in priority order (the leaderboard passes them by
//! rank). When the social budget cannot cover every address that needs a
//! refresh, the earliest addresses are refreshed and the rest are served from
//! stale cache or the address-only default. The resolver never reorders.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::batch::BatchScheduler;
use crate::identity::{Address, CacheRecord, ResolvedIdentity, SocialFragment, merge_identity};
use crate::providers::{NameServiceAdapter, SocialAdapter};
use crate::rate_limiter::{RateLimitStatus, SlidingWindowLimiter};
use crate::store::IdentityCache;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 3_600);
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub cache_ttl: Duration,
    /// Refresh inline (`true`) or answer from cache/default and refresh on a
    /// background task (`false`).
    pub eager_enrichment: bool,
    /// Upper bound for one refresh chunk, provider calls and store writes
    /// included.
    pub refresh_timeout: Duration,
    pub profile_base_url: String,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            eager_enrichment: true,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            profile_base_url: "https://warpcast.com".to_string(),
        }
    }
}

/// Where a returned identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    CacheFresh,
    Refreshed,
    Stale,
    Default,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub identity: ResolvedIdentity,
    pub source: ResolutionSource,
}

#[derive(Clone)]
pub struct Resolver {
    inner: Arc<ResolverInner>,
}

struct ResolverInner {
    cache: IdentityCache,
    social: SocialAdapter,
    names: NameServiceAdapter,
    limiter: Arc<SlidingWindowLimiter>,
    scheduler: BatchScheduler,
    settings: ResolverSettings,
    cache_ttl: chrono::Duration,
}

impl Resolver {
    pub fn new(
        cache: IdentityCache,
        social: SocialAdapter,
        names: NameServiceAdapter,
        limiter: Arc<SlidingWindowLimiter>,
        scheduler: BatchScheduler,
        settings: ResolverSettings,
    ) -> Self {
        assert!(
            !settings.refresh_timeout.is_zero(),
            "Refresh timeout must be non-zero"
        );
        assert!(!settings.cache_ttl.is_zero(), "Cache TTL must be non-zero");
        let cache_ttl = chrono::Duration::from_std(settings.cache_ttl)
            .expect("Cache TTL exceeds chrono duration range");
        Self {
            inner: Arc::new(ResolverInner {
                cache,
                social,
                names,
                limiter,
                scheduler,
                settings,
                cache_ttl,
            }),
        }
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.inner.cache
    }

    pub fn social_enabled(&self) -> bool {
        self.inner.social.is_enabled()
    }

    pub fn rate_limit_status(&self) -> RateLimitStatus {
        self.inner.limiter.status()
    }

    /// Single-address path: no scheduler, same freshness and budget rules as
    /// [`Resolver::resolve_batch`].
    pub async fn resolve_one(&self, address: &Address) -> ResolvedIdentity {
        let single = std::slice::from_ref(address);
        let cached = self.inner.cache.load_many(single).await;
        if let Some(record) = cached.get(address) {
            if self.is_fresh(record) {
                return record.identity.clone();
            }
        }

        if self.reserve_budget(1) == 0 {
            return self.fallback(address, &cached).identity;
        }
        if !self.inner.settings.eager_enrichment {
            self.spawn_background_refresh(single.to_vec());
            return self.fallback(address, &cached).identity;
        }

        match self.refresh_chunk(single, &cached).await.pop() {
            Some((_, resolution)) => resolution.identity,
            None => self.fallback(address, &cached).identity,
        }
    }

    /// Resolves every address to exactly one identity. Duplicates collapse to
    /// one entry; provider and store failures degrade instead of erroring.
    pub async fn resolve_batch(&self, addresses: &[Address]) -> HashMap<Address, ResolvedIdentity> {
        self.resolve_batch_traced(addresses)
            .await
            .into_iter()
            .map(|(address, resolution)| (address, resolution.identity))
            .collect()
    }

    pub async fn resolve_batch_traced(&self, addresses: &[Address]) -> HashMap<Address, Resolution> {
        let requested = dedup_in_order(addresses);
        let cached = self.inner.cache.load_many(&requested).await;

        let mut results = HashMap::with_capacity(requested.len());
        let mut needs_refresh = Vec::new();
        for address in &requested {
            match cached.get(address) {
                Some(record) if self.is_fresh(record) => {
                    results.insert(
                        address.clone(),
                        Resolution {
                            identity: record.identity.clone(),
                            source: ResolutionSource::CacheFresh,
                        },
                    );
                }
                _ => needs_refresh.push(address.clone()),
            }
        }

        let granted = self.reserve_budget(needs_refresh.len());
        let (to_refresh, deferred) = needs_refresh.split_at(granted);
        for address in deferred {
            results.insert(address.clone(), self.fallback(address, &cached));
        }

        if !to_refresh.is_empty() {
            if self.inner.settings.eager_enrichment {
                results.extend(self.refresh_many(to_refresh, &cached).await);
            } else {
                for address in to_refresh {
                    results.insert(address.clone(), self.fallback(address, &cached));
                }
                self.spawn_background_refresh(to_refresh.to_vec());
            }
        }

        assert_eq!(
            results.len(),
            requested.len(),
            "Every requested address must resolve exactly once"
        );
        debug!(
            "Resolved {} addresses: {} fresh, {} refreshed, {} deferred",
            requested.len(),
            requested.len() - needs_refresh.len(),
            to_refresh.len(),
            deferred.len()
        );
        results
    }

    /// Refreshes up to `max_count` addresses regardless of cache age, bounded
    /// by remaining social budget. Returns how many were actually refreshed.
    pub async fn force_refresh(&self, addresses: &[Address], max_count: usize) -> usize {
        let requested = dedup_in_order(addresses);
        let wanted = requested.len().min(max_count);
        if wanted == 0 {
            return 0;
        }
        let granted = self.reserve_budget(wanted);
        if granted == 0 {
            info!(
                "Forced refresh of {wanted} addresses skipped: no rate capacity"
            );
            return 0;
        }

        let no_cache = HashMap::new();
        let refreshed = self
            .refresh_many(&requested[..granted], &no_cache)
            .await
            .into_iter()
            .filter(|(_, resolution)| resolution.source == ResolutionSource::Refreshed)
            .count();
        info!("Forced refresh completed for {refreshed}/{wanted} addresses");
        refreshed
    }

    fn is_fresh(&self, record: &CacheRecord) -> bool {
        !record.is_expired(Utc::now(), self.inner.cache_ttl)
    }

    /// Only the social provider is metered; with it disabled every refresh
    /// is name-service only and needs no budget.
    fn reserve_budget(&self, wanted: usize) -> usize {
        if wanted == 0 {
            return 0;
        }
        if !self.inner.social.is_enabled() {
            return wanted;
        }
        let granted = self.inner.limiter.try_acquire_many(wanted);
        if granted < wanted {
            debug!(
                "Social budget granted {granted}/{wanted} refreshes, next slot in {:?}",
                self.inner.limiter.time_until_capacity()
            );
        }
        granted
    }

    fn fallback(&self, address: &Address, cached: &HashMap<Address, CacheRecord>) -> Resolution {
        match cached.get(address) {
            Some(record) => Resolution {
                identity: record.identity.clone(),
                source: ResolutionSource::Stale,
            },
            None => Resolution {
                identity: ResolvedIdentity::address_only(address.clone()),
                source: ResolutionSource::Default,
            },
        }
    }

    async fn refresh_many(
        &self,
        addresses: &[Address],
        cached: &HashMap<Address, CacheRecord>,
    ) -> Vec<(Address, Resolution)> {
        let this = self;
        self.inner
            .scheduler
            .run_chunked_with(addresses, |chunk| {
                let chunk = chunk.to_vec();
                async move { this.refresh_chunk(&chunk, cached).await }
            })
            .await
    }

    /// One social batch call for the chunk, then name lookups and store
    /// writes per address, all bounded by the refresh timeout.
    async fn refresh_chunk(
        &self,
        chunk: &[Address],
        cached: &HashMap<Address, CacheRecord>,
    ) -> Vec<(Address, Resolution)> {
        let work = async {
            let mut social = self.inner.social.lookup_batch(chunk).await;
            join_all(chunk.iter().map(|address| {
                let fragment = social.remove(address).flatten();
                self.refresh_address(address, fragment)
            }))
            .await
        };

        match timeout(self.inner.settings.refresh_timeout, work).await {
            Ok(results) => results,
            Err(_) => {
                warn!(
                    "Refresh of {} addresses exceeded {:?}, serving cached or default identities",
                    chunk.len(),
                    self.inner.settings.refresh_timeout
                );
                chunk
                    .iter()
                    .map(|address| (address.clone(), self.fallback(address, cached)))
                    .collect()
            }
        }
    }

    async fn refresh_address(
        &self,
        address: &Address,
        social: Option<SocialFragment>,
    ) -> (Address, Resolution) {
        let domains = self.inner.names.lookup(address).await;
        let identity = merge_identity(
            address.clone(),
            social,
            domains,
            &self.inner.settings.profile_base_url,
        );
        let record = CacheRecord::new(identity.clone(), Utc::now());
        if let Err(err) = self.inner.cache.upsert_one(&record).await {
            warn!("Failed to persist identity for {address}: {err}");
        }
        (
            address.clone(),
            Resolution {
                identity,
                source: ResolutionSource::Refreshed,
            },
        )
    }

    fn spawn_background_refresh(&self, addresses: Vec<Address>) {
        let resolver = self.clone();
        tokio::spawn(async move {
            let no_cache = HashMap::new();
            let refreshed = resolver.refresh_many(&addresses, &no_cache).await;
            debug!("Background refresh finished for {} addresses", refreshed.len());
        });
    }
}

fn dedup_in_order(addresses: &[Address]) -> Vec<Address> {
    let mut seen = HashSet::with_capacity(addresses.len());
    addresses
        .iter()
        .filter(|address| seen.insert(*address))
        .cloned()
        .collect()
}
