use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::balance::{BalanceSource, MAX_TOP_STAKERS};
use crate::identity::Address;
use crate::resolver::{ResolutionSource, Resolver};

/// Keeps the identity cache warm for the current leaderboard.
pub struct CachePrimer {
    balances: Arc<dyn BalanceSource>,
    resolver: Resolver,
    top_n: u32,
    poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrimerTick {
    pub ranked: usize,
    pub fresh: usize,
    pub refreshed: usize,
    pub deferred: usize,
}

impl CachePrimer {
    pub fn new(
        balances: Arc<dyn BalanceSource>,
        resolver: Resolver,
        top_n: u32,
        poll_interval: Duration,
    ) -> Self {
        assert!(top_n > 0, "Primer must rank at least one staker");
        assert!(top_n <= MAX_TOP_STAKERS, "Primer top_n exceeds bound");
        assert!(!poll_interval.is_zero(), "Primer poll interval must be non-zero");
        Self {
            balances,
            resolver,
            top_n,
            poll_interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Starting cache primer loop (top {} every {:?})",
            self.top_n, self.poll_interval
        );
        self.tick_logged().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    match changed {
                        Ok(_) => {
                            if *shutdown.borrow() {
                                info!("Cache primer shutdown signal received");
                                break;
                            }
                        }
                        Err(_) => {
                            warn!("Shutdown channel closed unexpectedly. Exiting primer loop");
                            break;
                        }
                    }
                }
                _ = sleep(self.poll_interval) => {
                    self.tick_logged().await;
                }
            }
        }

        Ok(())
    }

    async fn tick_logged(&self) {
        match self.tick().await {
            Ok(summary) => info!(
                "Primer tick: {} ranked, {} fresh, {} refreshed, {} deferred",
                summary.ranked, summary.fresh, summary.refreshed, summary.deferred
            ),
            Err(err) => warn!("Primer tick failed: {err:#}"),
        }
    }

    /// Records the current ranking, then resolves in rank order so the
    /// highest ranks get first claim on the social budget.
    pub async fn tick(&self) -> Result<PrimerTick> {
        let rankings = self
            .balances
            .top_stakers(self.top_n)
            .await
            .context("Failed to fetch top stakers")?;
        self.resolver
            .cache()
            .store()
            .record_rankings(&rankings)
            .await
            .context("Failed to record staker rankings")?;

        let ordered: Vec<Address> = rankings
            .iter()
            .map(|ranking| ranking.address.clone())
            .collect();
        let resolved = self.resolver.resolve_batch_traced(&ordered).await;

        let mut summary = PrimerTick {
            ranked: rankings.len(),
            ..PrimerTick::default()
        };
        for resolution in resolved.values() {
            match resolution.source {
                ResolutionSource::CacheFresh => summary.fresh += 1,
                ResolutionSource::Refreshed => summary.refreshed += 1,
                ResolutionSource::Stale | ResolutionSource::Default => summary.deferred += 1,
            }
        }
        Ok(summary)
    }
}
