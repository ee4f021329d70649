use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::identity::Address;

pub const MAX_TOP_STAKERS: u32 = 10_000;

/// One leaderboard position as reported by the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StakerRanking {
    pub address: Address,
    /// Staked amount in base units, decimal.
    pub amount: String,
    pub rank: u32,
}

/// Source of ranked balances. Results are deduplicated and ordered by rank.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn top_stakers(&self, limit: u32) -> Result<Vec<StakerRanking>>;
}

#[derive(Clone)]
pub struct RpcBalanceSource {
    inner: HttpClient,
}

impl RpcBalanceSource {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        assert!(!endpoint.is_empty(), "RPC endpoint must be provided");
        assert!(
            timeout >= Duration::from_millis(100),
            "Timeout below 100ms is unsafe"
        );

        let client = HttpClientBuilder::default()
            .request_timeout(timeout)
            .build(endpoint)
            .with_context(|| format!("Failed to build RPC client for {endpoint}"))?;

        Ok(Self { inner: client })
    }
}

#[async_trait]
impl BalanceSource for RpcBalanceSource {
    async fn top_stakers(&self, limit: u32) -> Result<Vec<StakerRanking>> {
        assert!(limit > 0, "Top staker limit must be positive");
        assert!(
            limit <= MAX_TOP_STAKERS,
            "Top staker limit exceeds defensive bound"
        );
        let response: TopStakersResponse = self
            .inner
            .request("staking_topStakers", rpc_params![limit])
            .await
            .context("RPC call staking_topStakers failed")?;
        if response.stakers.len() > limit as usize {
            return Err(anyhow!(
                "RPC returned {} stakers for a limit of {limit}",
                response.stakers.len()
            ));
        }
        Ok(normalize_rankings(response.stakers))
    }
}

#[derive(Debug, Deserialize)]
struct TopStakersResponse {
    #[serde(default)]
    stakers: Vec<StakerRecord>,
}

#[derive(Debug, Deserialize)]
struct StakerRecord {
    address: String,
    amount: String,
    rank: u32,
}

/// Drops malformed and duplicate entries and orders by rank.
fn normalize_rankings(records: Vec<StakerRecord>) -> Vec<StakerRanking> {
    let mut seen = std::collections::HashSet::with_capacity(records.len());
    let mut rankings = Vec::with_capacity(records.len());
    for record in records {
        let address = match Address::parse(&record.address) {
            Ok(address) => address,
            Err(err) => {
                warn!("Skipping staker {}: {err}", record.address);
                continue;
            }
        };
        let amount = record.amount.trim();
        if amount.is_empty() || !amount.bytes().all(|byte| byte.is_ascii_digit()) {
            warn!("Skipping staker {address}: invalid amount {}", record.amount);
            continue;
        }
        if !seen.insert(address.clone()) {
            continue;
        }
        rankings.push(StakerRanking {
            address,
            amount: amount.to_string(),
            rank: record.rank,
        });
    }
    rankings.sort_by_key(|ranking| ranking.rank);
    rankings
}
