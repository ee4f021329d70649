use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::{ProviderError, SocialProvider};
use crate::identity::{Address, SocialFragment, canonicalize_bio, canonicalize_display_name};

const BULK_BY_ADDRESS_PATH: &str = "/v2/farcaster/user/bulk-by-address";
const API_KEY_HEADER: &str = "x-api-key";

/// Farcaster accounts through the Neynar bulk-by-address endpoint.
pub struct NeynarClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl NeynarClient {
    pub fn new(base_url: &str, api_key: String, timeout: Duration) -> Result<Self> {
        assert!(!base_url.is_empty(), "Social provider URL must be provided");
        assert!(!api_key.is_empty(), "Social provider key must be provided");
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build social provider HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl SocialProvider for NeynarClient {
    fn name(&self) -> &'static str {
        "neynar"
    }

    async fn lookup_addresses(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, SocialFragment>, ProviderError> {
        if addresses.is_empty() {
            return Ok(HashMap::new());
        }
        let joined = addresses
            .iter()
            .map(Address::as_str)
            .collect::<Vec<_>>()
            .join(",");

        let response = self
            .http
            .get(format!("{}{BULK_BY_ADDRESS_PATH}", self.base_url))
            .header(API_KEY_HEADER, &self.api_key)
            .query(&[("addresses", joined.as_str())])
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let status = response.status();
        // The endpoint answers 404 when none of the addresses has an account.
        if status == StatusCode::NOT_FOUND {
            return Ok(HashMap::new());
        }
        if !status.is_success() {
            return Err(ProviderError::Status(status.as_u16()));
        }

        let body: HashMap<String, Vec<NeynarUser>> = response
            .json()
            .await
            .map_err(|err| ProviderError::Payload(err.to_string()))?;
        Ok(parse_bulk_response(body))
    }
}

fn parse_bulk_response(body: HashMap<String, Vec<NeynarUser>>) -> HashMap<Address, SocialFragment> {
    let mut found = HashMap::with_capacity(body.len());
    for (raw_address, users) in body {
        let Ok(address) = Address::parse(&raw_address) else {
            continue;
        };
        let Some(fragment) = users.into_iter().find_map(NeynarUser::into_fragment) else {
            continue;
        };
        found.insert(address, fragment);
    }
    found
}

#[derive(Debug, Deserialize)]
struct NeynarUser {
    fid: u64,
    username: Option<String>,
    display_name: Option<String>,
    pfp_url: Option<String>,
    #[serde(default)]
    profile: Option<NeynarProfile>,
    #[serde(default)]
    follower_count: u64,
    #[serde(default)]
    following_count: u64,
}

#[derive(Debug, Deserialize)]
struct NeynarProfile {
    bio: Option<NeynarBio>,
}

#[derive(Debug, Deserialize)]
struct NeynarBio {
    text: Option<String>,
}

impl NeynarUser {
    /// Accounts without a handle cannot be linked to and are skipped.
    fn into_fragment(self) -> Option<SocialFragment> {
        let username = self.username.as_deref().and_then(canonicalize_display_name)?;
        let bio = self
            .profile
            .and_then(|profile| profile.bio)
            .and_then(|bio| bio.text)
            .and_then(|text| canonicalize_bio(&text));
        Some(SocialFragment {
            fid: self.fid,
            username,
            display_name: self.display_name.as_deref().and_then(canonicalize_display_name),
            avatar_url: self.pfp_url.filter(|url| url.starts_with("https://")),
            bio,
            follower_count: self.follower_count,
            following_count: self.following_count,
        })
    }
}
