//! Identity providers and the adapters the resolver talks to.
//!
//! Providers are raw clients and report their failures. Adapters wrap them
//! with timeouts and turn every failure into "nothing found", so resolution
//! never errors because a provider is down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::identity::{Address, DomainFragments, SocialFragment};

pub mod ens;
pub mod neynar;

pub use ens::EnsReverseRegistry;
pub use neynar::NeynarClient;

pub const DEFAULT_SOCIAL_BATCH_LIMIT: usize = 20;
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(12);

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider returned HTTP {0}")]
    Status(u16),
    #[error("malformed provider payload: {0}")]
    Payload(String),
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
}

/// Social-graph lookup by address, one round-trip per call.
#[async_trait]
pub trait SocialProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn lookup_addresses(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, SocialFragment>, ProviderError>;
}

/// Reverse name lookup against a single name registry.
#[async_trait]
pub trait ReverseRegistry: Send + Sync {
    /// Name suffix this registry issues, e.g. `.eth`.
    fn suffix(&self) -> &str;

    async fn reverse_name(&self, address: &Address) -> Result<Option<String>, ProviderError>;
}

#[derive(Clone)]
pub enum SocialAdapter {
    /// No API key configured. Every lookup is empty and performs no I/O.
    Disabled,
    Enabled {
        provider: Arc<dyn SocialProvider>,
        batch_limit: usize,
        timeout: Duration,
    },
}

impl SocialAdapter {
    pub fn enabled(provider: Arc<dyn SocialProvider>, batch_limit: usize, timeout: Duration) -> Self {
        assert!(batch_limit > 0, "Social batch limit must be positive");
        assert!(!timeout.is_zero(), "Social timeout must be non-zero");
        Self::Enabled {
            provider,
            batch_limit,
            timeout,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }

    pub async fn lookup(&self, address: &Address) -> Option<SocialFragment> {
        let mut found = self.lookup_batch(std::slice::from_ref(address)).await;
        found.remove(address).flatten()
    }

    /// Returns an entry for every requested address. Requests larger than the
    /// provider batch limit are split into several calls.
    pub async fn lookup_batch(
        &self,
        addresses: &[Address],
    ) -> HashMap<Address, Option<SocialFragment>> {
        let mut results: HashMap<Address, Option<SocialFragment>> =
            addresses.iter().map(|address| (address.clone(), None)).collect();

        let Self::Enabled {
            provider,
            batch_limit,
            timeout: limit,
        } = self
        else {
            return results;
        };

        for chunk in addresses.chunks(*batch_limit) {
            let outcome = match timeout(*limit, provider.lookup_addresses(chunk)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::Timeout(*limit)),
            };
            match outcome {
                Ok(found) => {
                    debug!(
                        "{} resolved {}/{} addresses",
                        provider.name(),
                        found.len(),
                        chunk.len()
                    );
                    for (address, fragment) in found {
                        if let Some(slot) = results.get_mut(&address) {
                            *slot = Some(fragment);
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        "{} lookup failed for {} addresses: {err}",
                        provider.name(),
                        chunk.len()
                    );
                }
            }
        }

        results
    }
}

#[derive(Clone)]
pub struct NameServiceAdapter {
    primary: Arc<dyn ReverseRegistry>,
    secondary: Arc<dyn ReverseRegistry>,
    timeout: Duration,
}

impl NameServiceAdapter {
    pub fn new(
        primary: Arc<dyn ReverseRegistry>,
        secondary: Arc<dyn ReverseRegistry>,
        timeout: Duration,
    ) -> Self {
        assert!(!timeout.is_zero(), "Name service timeout must be non-zero");
        Self {
            primary,
            secondary,
            timeout,
        }
    }

    /// Queries both registries concurrently; each side fails on its own.
    pub async fn lookup(&self, address: &Address) -> DomainFragments {
        let (primary, secondary) = tokio::join!(
            self.lookup_registry(self.primary.as_ref(), address),
            self.lookup_registry(self.secondary.as_ref(), address),
        );
        DomainFragments { primary, secondary }
    }

    async fn lookup_registry(
        &self,
        registry: &dyn ReverseRegistry,
        address: &Address,
    ) -> Option<String> {
        let outcome = match timeout(self.timeout, registry.reverse_name(address)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProviderError::Timeout(self.timeout)),
        };
        match outcome {
            Ok(Some(name)) if name.ends_with(registry.suffix()) => Some(name),
            Ok(Some(name)) => {
                debug!(
                    "Ignoring {name} for {address}: expected suffix {}",
                    registry.suffix()
                );
                None
            }
            Ok(None) => None,
            Err(err) => {
                warn!(
                    "Reverse lookup ({}) failed for {address}: {err}",
                    registry.suffix()
                );
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Scripted social provider recording which addresses it was asked for.
    #[derive(Default)]
    pub struct FakeSocial {
        pub accounts: HashMap<Address, SocialFragment>,
        pub failing: bool,
        pub stall: Option<Duration>,
        pub calls: AtomicUsize,
        pub requested: Mutex<Vec<Address>>,
    }

    impl FakeSocial {
        pub fn with_accounts(accounts: Vec<(Address, SocialFragment)>) -> Self {
            Self {
                accounts: accounts.into_iter().collect(),
                ..Self::default()
            }
        }

        pub fn requested(&self) -> Vec<Address> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SocialProvider for FakeSocial {
        fn name(&self) -> &'static str {
            "fake-social"
        }

        async fn lookup_addresses(
            &self,
            addresses: &[Address],
        ) -> Result<HashMap<Address, SocialFragment>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requested.lock().unwrap().extend_from_slice(addresses);
            if let Some(stall) = self.stall {
                tokio::time::sleep(stall).await;
            }
            if self.failing {
                return Err(ProviderError::Status(503));
            }
            Ok(addresses
                .iter()
                .filter_map(|address| {
                    self.accounts
                        .get(address)
                        .map(|fragment| (address.clone(), fragment.clone()))
                })
                .collect())
        }
    }

    pub struct FakeRegistry {
        pub suffix: &'static str,
        pub names: HashMap<Address, String>,
        pub failing: HashSet<Address>,
        pub calls: AtomicUsize,
    }

    impl FakeRegistry {
        pub fn new(suffix: &'static str, names: Vec<(Address, &str)>) -> Self {
            Self {
                suffix,
                names: names
                    .into_iter()
                    .map(|(address, name)| (address, name.to_string()))
                    .collect(),
                failing: HashSet::new(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ReverseRegistry for FakeRegistry {
        fn suffix(&self) -> &str {
            self.suffix
        }

        async fn reverse_name(&self, address: &Address) -> Result<Option<String>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(address) {
                return Err(ProviderError::Transport("connection reset".to_string()));
            }
            Ok(self.names.get(address).cloned())
        }
    }

    pub fn social_fragment(fid: u64, username: &str) -> SocialFragment {
        SocialFragment {
            fid,
            username: username.to_string(),
            display_name: Some(format!("{username} display")),
            avatar_url: Some(format!("https://img.example/{fid}.png")),
            bio: None,
            follower_count: fid * 10,
            following_count: 1,
        }
    }

    pub fn address(n: u8) -> Address {
        Address::parse(&format!("0x{}", hex::encode([n; 20]))).expect("valid test address")
    }
}
