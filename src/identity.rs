use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const ADDRESS_BYTES: usize = 20;
pub const MAX_DISPLAY_NAME_LEN: usize = 128;
pub const MAX_BIO_LEN: usize = 512;

const _: [(); 256 - MAX_DISPLAY_NAME_LEN] = [(); 256 - MAX_DISPLAY_NAME_LEN];

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AddressError {
    #[error("address cannot be empty")]
    Empty,
    #[error("address must be {expected} hex characters, got {observed}")]
    Length { expected: usize, observed: usize },
    #[error("address is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Chain account address. Always held in canonical form: `0x` followed by
/// lowercase hex, so equality and hashing are case-insensitive by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    pub fn parse(value: &str) -> Result<Self, AddressError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }
        let digits = strip_hex_prefix(trimmed);
        if digits.len() != ADDRESS_BYTES * 2 {
            return Err(AddressError::Length {
                expected: ADDRESS_BYTES * 2,
                observed: digits.len(),
            });
        }
        let bytes = hex::decode(digits)?;
        assert_eq!(bytes.len(), ADDRESS_BYTES, "Decoded address width mismatch");
        Ok(Self(format!("0x{}", hex::encode(bytes))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex digits without the `0x` prefix.
    pub fn hex_digits(&self) -> &str {
        &self.0[2..]
    }

    /// `0x1234...cdef` form used whenever no identity is known.
    pub fn short_display(&self) -> String {
        let canonical = self.as_str();
        format!("{}...{}", &canonical[..6], &canonical[canonical.len() - 4..])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Social-graph account attached to an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialFragment {
    pub fid: u64,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub follower_count: u64,
    pub following_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainFragments {
    pub primary: Option<String>,
    pub secondary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Social,
    SecondaryDomain,
    PrimaryDomain,
    AddressOnly,
}

impl IdentityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentityKind::Social => "social",
            IdentityKind::SecondaryDomain => "secondary_domain",
            IdentityKind::PrimaryDomain => "primary_domain",
            IdentityKind::AddressOnly => "address_only",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        let kind = match tag {
            "social" => IdentityKind::Social,
            "secondary_domain" => IdentityKind::SecondaryDomain,
            "primary_domain" => IdentityKind::PrimaryDomain,
            "address_only" => IdentityKind::AddressOnly,
            _ => return None,
        };
        Some(kind)
    }

    pub fn is_verified(self) -> bool {
        self != IdentityKind::AddressOnly
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub address: Address,
    pub social: Option<SocialFragment>,
    pub primary_domain: Option<String>,
    pub secondary_domain: Option<String>,
    pub display_name: String,
    pub display_avatar: Option<String>,
    pub profile_url: Option<String>,
    pub has_verified_identity: bool,
    pub identity_kind: IdentityKind,
}

impl ResolvedIdentity {
    pub fn address_only(address: Address) -> Self {
        let display_name = address.short_display();
        Self {
            address,
            social: None,
            primary_domain: None,
            secondary_domain: None,
            display_name,
            display_avatar: None,
            profile_url: None,
            has_verified_identity: false,
            identity_kind: IdentityKind::AddressOnly,
        }
    }
}

/// Pick exactly one identity for `address` from whatever fragments were found.
///
/// Priority is fixed: a social account wins over any domain name, a
/// secondary-registry name wins over a primary-registry name, and the
/// shortened address is the fallback. Fragments are never blended.
pub fn merge_identity(
    address: Address,
    social: Option<SocialFragment>,
    domains: DomainFragments,
    profile_base_url: &str,
) -> ResolvedIdentity {
    let primary_domain = domains.primary.and_then(|name| canonicalize_display_name(&name));
    let secondary_domain = domains
        .secondary
        .and_then(|name| canonicalize_display_name(&name));

    let (identity_kind, display_name, display_avatar, profile_url) = if let Some(account) = &social
    {
        let name = account
            .display_name
            .as_deref()
            .and_then(canonicalize_display_name)
            .or_else(|| canonicalize_display_name(&account.username))
            .unwrap_or_else(|| address.short_display());
        let profile = canonicalize_display_name(&account.username).map(|handle| {
            format!("{}/{}", profile_base_url.trim_end_matches('/'), handle)
        });
        (
            IdentityKind::Social,
            name,
            account.avatar_url.clone(),
            profile,
        )
    } else if let Some(name) = &secondary_domain {
        (IdentityKind::SecondaryDomain, name.clone(), None, None)
    } else if let Some(name) = &primary_domain {
        (IdentityKind::PrimaryDomain, name.clone(), None, None)
    } else {
        (IdentityKind::AddressOnly, address.short_display(), None, None)
    };

    assert!(!display_name.is_empty(), "Display name must never be empty");

    ResolvedIdentity {
        address,
        social,
        primary_domain,
        secondary_domain,
        display_name,
        display_avatar,
        profile_url,
        has_verified_identity: identity_kind.is_verified(),
        identity_kind,
    }
}

/// Persisted identity plus the moment it was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub identity: ResolvedIdentity,
    pub last_updated: DateTime<Utc>,
}

impl CacheRecord {
    pub fn new(identity: ResolvedIdentity, last_updated: DateTime<Utc>) -> Self {
        Self {
            identity,
            last_updated,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.last_updated > ttl
    }
}

/// Trimmed and length-bounded display text, `None` when blank.
pub fn canonicalize_display_name(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_DISPLAY_NAME_LEN).collect())
}

pub fn canonicalize_bio(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_BIO_LEN).collect())
}

fn strip_hex_prefix(value: &str) -> &str {
    if value.starts_with("0x") || value.starts_with("0X") {
        &value[2..]
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE_BASE: &str = "https://warpcast.com";

    fn sample_address() -> Address {
        Address::parse("0x1234567890abcdef1234567890abcdef1234cdef").expect("valid address")
    }

    fn sample_social() -> SocialFragment {
        SocialFragment {
            fid: 42,
            username: "stakooor".to_string(),
            display_name: Some("Big Staker".to_string()),
            avatar_url: Some("https://img.example/42.png".to_string()),
            bio: None,
            follower_count: 1200,
            following_count: 30,
        }
    }

    #[test]
    fn address_parse_is_case_insensitive() {
        let lower = Address::parse("0xabcdefabcdefabcdefabcdefabcdefabcdefabcd").unwrap();
        let upper = Address::parse("0XABCDEFABCDEFABCDEFABCDEFABCDEFABCDEFABCD").unwrap();
        let bare = Address::parse("AbCdEfAbCdEfAbCdEfAbCdEfAbCdEfAbCdEfAbCd").unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower, bare);
        assert_eq!(lower.as_str(), "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd");
    }

    #[test]
    fn address_parse_rejects_malformed_input() {
        assert_eq!(Address::parse("   "), Err(AddressError::Empty));
        assert!(matches!(
            Address::parse("0x1234"),
            Err(AddressError::Length { observed: 4, .. })
        ));
        assert!(matches!(
            Address::parse("0xzz34567890abcdef1234567890abcdef1234cdef"),
            Err(AddressError::Hex(_))
        ));
    }

    #[test]
    fn short_display_keeps_prefix_and_tail() {
        assert_eq!(sample_address().short_display(), "0x1234...cdef");
    }

    #[test]
    fn social_wins_over_domains() {
        let identity = merge_identity(
            sample_address(),
            Some(sample_social()),
            DomainFragments {
                primary: Some("x.eth".to_string()),
                secondary: Some("y.base.eth".to_string()),
            },
            PROFILE_BASE,
        );
        assert_eq!(identity.identity_kind, IdentityKind::Social);
        assert_eq!(identity.display_name, "Big Staker");
        assert_eq!(
            identity.profile_url.as_deref(),
            Some("https://warpcast.com/stakooor")
        );
        assert_eq!(identity.primary_domain.as_deref(), Some("x.eth"));
        assert!(identity.has_verified_identity);
    }

    #[test]
    fn social_without_display_name_uses_handle() {
        let mut social = sample_social();
        social.display_name = Some("   ".to_string());
        let identity = merge_identity(
            sample_address(),
            Some(social),
            DomainFragments::default(),
            PROFILE_BASE,
        );
        assert_eq!(identity.display_name, "stakooor");
    }

    #[test]
    fn secondary_domain_outranks_primary() {
        let identity = merge_identity(
            sample_address(),
            None,
            DomainFragments {
                primary: Some("x.eth".to_string()),
                secondary: Some("y.base.eth".to_string()),
            },
            PROFILE_BASE,
        );
        assert_eq!(identity.identity_kind, IdentityKind::SecondaryDomain);
        assert_eq!(identity.display_name, "y.base.eth");
        assert!(identity.profile_url.is_none());

        let primary_only = merge_identity(
            sample_address(),
            None,
            DomainFragments {
                primary: Some("x.eth".to_string()),
                secondary: None,
            },
            PROFILE_BASE,
        );
        assert_eq!(primary_only.identity_kind, IdentityKind::PrimaryDomain);
        assert_eq!(primary_only.display_name, "x.eth");
    }

    #[test]
    fn no_fragments_falls_back_to_short_address() {
        let identity = merge_identity(
            sample_address(),
            None,
            DomainFragments {
                primary: Some("  ".to_string()),
                secondary: None,
            },
            PROFILE_BASE,
        );
        assert_eq!(identity, ResolvedIdentity::address_only(sample_address()));
        assert_eq!(identity.display_name, "0x1234...cdef");
        assert!(!identity.has_verified_identity);
    }

    #[test]
    fn kind_tags_roundtrip() {
        for kind in [
            IdentityKind::Social,
            IdentityKind::SecondaryDomain,
            IdentityKind::PrimaryDomain,
            IdentityKind::AddressOnly,
        ] {
            assert_eq!(IdentityKind::from_tag(kind.as_str()), Some(kind));
            assert_eq!(kind.is_verified(), kind != IdentityKind::AddressOnly);
        }
        assert_eq!(IdentityKind::from_tag("ens"), None);
    }

    #[test]
    fn expiry_is_strictly_greater_than_ttl() {
        let ttl = Duration::days(7);
        let now = Utc::now();
        let identity = ResolvedIdentity::address_only(sample_address());
        assert!(!CacheRecord::new(identity.clone(), now).is_expired(now, ttl));
        assert!(!CacheRecord::new(identity.clone(), now - ttl).is_expired(now, ttl));
        assert!(
            CacheRecord::new(identity, now - ttl - Duration::seconds(1)).is_expired(now, ttl)
        );
    }
}
