use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde::Serialize;
use sha3::{Digest, Keccak256};

use super::{ProviderError, ReverseRegistry};
use crate::identity::{ADDRESS_BYTES, Address};

/// `resolver(bytes32)` on the registry.
const RESOLVER_SELECTOR: [u8; 4] = [0x01, 0x78, 0xb8, 0xbf];
/// `name(bytes32)` on a resolver.
const NAME_SELECTOR: [u8; 4] = [0x69, 0x1f, 0x34, 0x31];
const WORD: usize = 32;
const MAX_NAME_BYTES: usize = 255;

/// ENS-style reverse registry read through `eth_call`.
///
/// The reverse node for an address is `namehash("<hex>.<namespace>")`; the
/// registry maps it to a resolver contract whose `name` call returns the
/// primary name. Mainnet ENS uses the `addr.reverse` namespace, Basenames on
/// Base uses `80002105.reverse`.
#[derive(Clone)]
pub struct EnsReverseRegistry {
    inner: HttpClient,
    registry: String,
    reverse_namespace: String,
    suffix: String,
}

impl EnsReverseRegistry {
    pub fn new(
        endpoint: &str,
        registry: &str,
        reverse_namespace: &str,
        suffix: &str,
        timeout: Duration,
    ) -> Result<Self> {
        assert!(!endpoint.is_empty(), "Registry RPC endpoint must be provided");
        assert!(
            timeout >= Duration::from_millis(100),
            "Timeout below 100ms is unsafe"
        );
        let registry = Address::parse(registry)
            .with_context(|| format!("Invalid registry contract address {registry}"))?;
        let inner = HttpClientBuilder::default()
            .request_timeout(timeout)
            .build(endpoint)
            .with_context(|| format!("Failed to build registry RPC client for {endpoint}"))?;

        Ok(Self {
            inner,
            registry: registry.to_string(),
            reverse_namespace: reverse_namespace.trim_matches('.').to_string(),
            suffix: suffix.to_string(),
        })
    }

    pub fn reverse_node(&self, address: &Address) -> [u8; 32] {
        namehash(&format!(
            "{}.{}",
            address.hex_digits(),
            self.reverse_namespace
        ))
    }

    async fn eth_call(&self, to: &str, selector: [u8; 4], node: &[u8; 32]) -> Result<Vec<u8>, ProviderError> {
        let mut calldata = Vec::with_capacity(4 + WORD);
        calldata.extend_from_slice(&selector);
        calldata.extend_from_slice(node);
        let call = CallRequest {
            to,
            data: format!("0x{}", hex::encode(calldata)),
        };

        let raw: String = self
            .inner
            .request("eth_call", rpc_params![call, "latest"])
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        let digits = raw.strip_prefix("0x").unwrap_or(&raw);
        hex::decode(digits).map_err(|err| ProviderError::Payload(err.to_string()))
    }
}

#[async_trait]
impl ReverseRegistry for EnsReverseRegistry {
    fn suffix(&self) -> &str {
        &self.suffix
    }

    async fn reverse_name(&self, address: &Address) -> Result<Option<String>, ProviderError> {
        let node = self.reverse_node(address);
        let resolver_word = self.eth_call(&self.registry, RESOLVER_SELECTOR, &node).await?;
        let Some(resolver) = decode_address_word(&resolver_word)? else {
            return Ok(None);
        };

        let name_data = self.eth_call(&resolver, NAME_SELECTOR, &node).await?;
        if name_data.is_empty() {
            return Ok(None);
        }
        let name = decode_abi_string(&name_data)?;
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        Ok(Some(trimmed.to_ascii_lowercase()))
    }
}

#[derive(Debug, Serialize)]
struct CallRequest<'a> {
    to: &'a str,
    data: String,
}

pub fn namehash(name: &str) -> [u8; 32] {
    let mut node = [0u8; 32];
    if name.is_empty() {
        return node;
    }
    for label in name.rsplit('.') {
        let label_hash = Keccak256::digest(label.as_bytes());
        let mut hasher = Keccak256::new();
        hasher.update(node);
        hasher.update(label_hash);
        node = hasher.finalize().into();
    }
    node
}

/// Right-aligned address in a 32-byte return word; zero means unset.
fn decode_address_word(data: &[u8]) -> Result<Option<String>, ProviderError> {
    if data.is_empty() {
        return Ok(None);
    }
    if data.len() < WORD {
        return Err(ProviderError::Payload(format!(
            "address word is {} bytes",
            data.len()
        )));
    }
    let bytes = &data[WORD - ADDRESS_BYTES..WORD];
    if bytes.iter().all(|byte| *byte == 0) {
        return Ok(None);
    }
    Ok(Some(format!("0x{}", hex::encode(bytes))))
}

fn decode_abi_string(data: &[u8]) -> Result<String, ProviderError> {
    let offset = read_word_usize(data, 0)?;
    let length = read_word_usize(data, offset)?;
    if length > MAX_NAME_BYTES {
        return Err(ProviderError::Payload(format!(
            "name length {length} exceeds {MAX_NAME_BYTES} bytes"
        )));
    }
    let start = offset + WORD;
    let end = start + length;
    if end > data.len() {
        return Err(ProviderError::Payload("truncated string payload".to_string()));
    }
    String::from_utf8(data[start..end].to_vec())
        .map_err(|err| ProviderError::Payload(err.to_string()))
}

fn read_word_usize(data: &[u8], at: usize) -> Result<usize, ProviderError> {
    let end = at
        .checked_add(WORD)
        .ok_or_else(|| ProviderError::Payload("word offset overflow".to_string()))?;
    if end > data.len() {
        return Err(ProviderError::Payload(format!(
            "word at {at} out of bounds for {} bytes",
            data.len()
        )));
    }
    let word = &data[at..end];
    if word[..WORD - 8].iter().any(|byte| *byte != 0) {
        return Err(ProviderError::Payload("word exceeds u64 range".to_string()));
    }
    let mut low = [0u8; 8];
    low.copy_from_slice(&word[WORD - 8..]);
    usize::try_from(u64::from_be_bytes(low))
        .map_err(|_| ProviderError::Payload("word exceeds usize range".to_string()))
}
