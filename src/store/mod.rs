//! Persistent identity cache: the row-store seam and the access layer the
//! resolver reads through.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::DbErr;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::balance::StakerRanking;
use crate::identity::{Address, CacheRecord};

pub mod postgres;

pub use postgres::SeaOrmIdentityStore;

pub const DEFAULT_LOAD_CHUNK_SIZE: usize = 100;
pub const DEFAULT_LOAD_CHUNK_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    #[error("stored identity for {address} is corrupt: {reason}")]
    Corrupt { address: String, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedRow {
    pub rank: u32,
    pub address: Address,
    pub amount: String,
    pub record: Option<CacheRecord>,
}

/// Row store addressed by account address.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Records for the given addresses; addresses without a resolved identity
    /// are simply absent from the result.
    async fn load_chunk(&self, addresses: &[Address]) -> Result<Vec<CacheRecord>, StoreError>;

    /// Overwrites the identity columns for the record's address.
    async fn upsert(&self, record: &CacheRecord) -> Result<(), StoreError>;

    async fn record_rankings(&self, rankings: &[StakerRanking]) -> Result<(), StoreError>;

    async fn ranked_page(&self, offset: u64, limit: u64) -> Result<Vec<RankedRow>, StoreError>;
}

#[derive(Clone)]
pub struct IdentityCache {
    store: Arc<dyn IdentityStore>,
    chunk_size: usize,
    chunk_delay: Duration,
}

impl IdentityCache {
    pub fn new(store: Arc<dyn IdentityStore>, chunk_size: usize, chunk_delay: Duration) -> Self {
        assert!(chunk_size > 0, "Load chunk size must be positive");
        assert!(chunk_size <= 1_000, "Load chunk size exceeds defensive bound");
        Self {
            store,
            chunk_size,
            chunk_delay,
        }
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    /// Loads cached records in sequential chunks. A chunk that fails is logged
    /// and its addresses count as misses.
    pub async fn load_many(&self, addresses: &[Address]) -> HashMap<Address, CacheRecord> {
        let requested: HashSet<&Address> = addresses.iter().collect();
        let mut records = HashMap::with_capacity(addresses.len());
        let mut failed_chunks = 0usize;

        for (index, chunk) in addresses.chunks(self.chunk_size).enumerate() {
            if index > 0 && !self.chunk_delay.is_zero() {
                sleep(self.chunk_delay).await;
            }
            match self.store.load_chunk(chunk).await {
                Ok(found) => {
                    for record in found {
                        if requested.contains(&record.identity.address) {
                            records.insert(record.identity.address.clone(), record);
                        }
                    }
                }
                Err(err) => {
                    failed_chunks += 1;
                    warn!(
                        "Identity cache chunk {} ({} addresses) failed, treating as misses: {err}",
                        index + 1,
                        chunk.len()
                    );
                }
            }
        }

        debug!(
            "Loaded {}/{} cached identities ({failed_chunks} failed chunks)",
            records.len(),
            addresses.len()
        );
        records
    }

    pub async fn upsert_one(&self, record: &CacheRecord) -> Result<(), StoreError> {
        self.store.upsert(record).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// In-memory store with call counters and scripted failures.
    #[derive(Default)]
    pub struct MemoryStore {
        pub records: Mutex<HashMap<Address, CacheRecord>>,
        pub rankings: Mutex<Vec<StakerRanking>>,
        pub load_calls: AtomicUsize,
        pub upsert_calls: AtomicUsize,
        /// Zero-based `load_chunk` call indices that fail.
        pub failing_loads: Mutex<HashSet<usize>>,
        pub fail_upserts: AtomicBool,
    }

    impl MemoryStore {
        pub fn with_records(records: Vec<CacheRecord>) -> Self {
            let store = Self::default();
            {
                let mut map = store.records.lock().unwrap();
                for record in records {
                    map.insert(record.identity.address.clone(), record);
                }
            }
            store
        }

        pub fn get(&self, address: &Address) -> Option<CacheRecord> {
            self.records.lock().unwrap().get(address).cloned()
        }
    }

    #[async_trait]
    impl IdentityStore for MemoryStore {
        async fn load_chunk(&self, addresses: &[Address]) -> Result<Vec<CacheRecord>, StoreError> {
            let call = self.load_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing_loads.lock().unwrap().contains(&call) {
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            let records = self.records.lock().unwrap();
            Ok(addresses
                .iter()
                .filter_map(|address| records.get(address).cloned())
                .collect())
        }

        async fn upsert(&self, record: &CacheRecord) -> Result<(), StoreError> {
            self.upsert_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_upserts.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("read-only replica".to_string()));
            }
            self.records
                .lock()
                .unwrap()
                .insert(record.identity.address.clone(), record.clone());
            Ok(())
        }

        async fn record_rankings(&self, rankings: &[StakerRanking]) -> Result<(), StoreError> {
            *self.rankings.lock().unwrap() = rankings.to_vec();
            Ok(())
        }

        async fn ranked_page(&self, offset: u64, limit: u64) -> Result<Vec<RankedRow>, StoreError> {
            let rankings = self.rankings.lock().unwrap();
            let records = self.records.lock().unwrap();
            Ok(rankings
                .iter()
                .skip(offset as usize)
                .take(limit as usize)
                .map(|ranking| RankedRow {
                    rank: ranking.rank,
                    address: ranking.address.clone(),
                    amount: ranking.amount.clone(),
                    record: records.get(&ranking.address).cloned(),
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use chrono::Utc;

    use super::testing::MemoryStore;
    use super::*;
    use crate::identity::ResolvedIdentity;

    fn address(n: u16) -> Address {
        Address::parse(&format!("0x{:040x}", n)).unwrap()
    }

    #[tokio::test]
    async fn large_loads_are_chunked() {
        let store = Arc::new(MemoryStore::default());
        let cache = IdentityCache::new(store.clone(), 100, Duration::ZERO);
        let addresses: Vec<Address> = (1..=250).map(address).collect();

        let found = cache.load_many(&addresses).await;
        assert!(found.is_empty());
        assert_eq!(store.load_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_chunk_becomes_misses() {
        let now = Utc::now();
        let records: Vec<CacheRecord> = (1..=5)
            .map(|n| CacheRecord::new(ResolvedIdentity::address_only(address(n)), now))
            .collect();
        let store = Arc::new(MemoryStore::with_records(records));
        store.failing_loads.lock().unwrap().insert(1);
        let cache = IdentityCache::new(store.clone(), 2, Duration::ZERO);

        let addresses: Vec<Address> = (1..=5).map(address).collect();
        let found = cache.load_many(&addresses).await;

        assert_eq!(store.load_calls.load(Ordering::SeqCst), 3);
        assert_eq!(found.len(), 3);
        assert!(found.contains_key(&address(1)));
        assert!(!found.contains_key(&address(3)));
        assert!(!found.contains_key(&address(4)));
        assert!(found.contains_key(&address(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_are_spaced_by_delay() {
        let store = Arc::new(MemoryStore::default());
        let cache = IdentityCache::new(store, 10, Duration::from_millis(100));
        let addresses: Vec<Address> = (1..=30).map(address).collect();
        let started = tokio::time::Instant::now();
        cache.load_many(&addresses).await;
        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
