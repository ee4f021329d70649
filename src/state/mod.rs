use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use moka::future::Cache;
use sea_orm::DatabaseConnection;

use crate::config::CacheConfig;
use crate::identity::{Address, ResolvedIdentity};
use crate::resolver::Resolver;

#[derive(Clone)]
pub struct AppState {
    pub database: DatabaseConnection,
    pub resolver: Resolver,
    pub cache: Arc<ApiCache>,
    pub refresh_gate: Arc<RefreshGate>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        database: DatabaseConnection,
        resolver: Resolver,
        cache: Arc<ApiCache>,
        refresh_gate: Arc<RefreshGate>,
    ) -> Self {
        assert!(
            cache.identity_capacity >= 100,
            "Identity cache capacity must be configured"
        );
        Self {
            database,
            resolver,
            cache,
            refresh_gate,
            start_time: Instant::now(),
        }
    }
}

/// Short-lived front cache for resolved identities, keyed by canonical
/// address.
pub struct ApiCache {
    pub identities: Cache<Address, Arc<ResolvedIdentity>>,
    pub identity_capacity: u64,
}

impl ApiCache {
    pub fn new(config: &CacheConfig) -> Self {
        assert!(
            config.identities_max_capacity >= 100,
            "Identity cache capacity threshold"
        );

        let identities = Cache::builder()
            .max_capacity(config.identities_max_capacity)
            .time_to_live(Duration::from_secs(config.identities_ttl_seconds))
            .build();

        Self {
            identities,
            identity_capacity: config.identities_max_capacity,
        }
    }

    pub async fn invalidate_all_of(&self, addresses: &[Address]) {
        for address in addresses {
            self.identities.invalidate(address).await;
        }
    }
}

/// Cooldown between caller-initiated bulk refreshes.
pub struct RefreshGate {
    cooldown: Duration,
    last_started: Mutex<Option<Instant>>,
}

impl RefreshGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_started: Mutex::new(None),
        }
    }

    /// Claims the gate, or returns how long the caller still has to wait.
    pub fn try_begin(&self) -> Result<(), Duration> {
        self.try_begin_at(Instant::now())
    }

    fn try_begin_at(&self, now: Instant) -> Result<(), Duration> {
        let mut last = self
            .last_started
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(started) = *last {
            let elapsed = now.saturating_duration_since(started);
            if elapsed < self.cooldown {
                return Err(self.cooldown - elapsed);
            }
        }
        *last = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_blocks_inside_cooldown() {
        let gate = RefreshGate::new(Duration::from_secs(1_800));
        let start = Instant::now();

        assert!(gate.try_begin_at(start).is_ok());
        let wait = gate
            .try_begin_at(start + Duration::from_secs(600))
            .expect_err("inside cooldown");
        assert_eq!(wait, Duration::from_secs(1_200));
        assert!(gate.try_begin_at(start + Duration::from_secs(1_800)).is_ok());
    }

    #[test]
    fn zero_cooldown_never_blocks() {
        let gate = RefreshGate::new(Duration::ZERO);
        assert!(gate.try_begin().is_ok());
        assert!(gate.try_begin().is_ok());
    }
}
