use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub chain: ChainConfig,
    pub names: NamesConfig,
    #[serde(default)]
    pub social: SocialConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub primer: PrimerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl ApiConfig {
    pub fn load() -> Result<Self> {
        let configured_path =
            std::env::var("STAKER_API_CONFIG").unwrap_or_else(|_| "config/api.toml".to_string());
        assert!(
            !configured_path.is_empty(),
            "Configuration path must be non-empty"
        );
        assert!(
            configured_path.len() < 4096,
            "Configuration path length exceeds hard limit"
        );

        let mut builder = Config::builder()
            .add_source(File::new(&configured_path, FileFormat::Toml).required(true));

        if let Ok(env_override) = std::env::var("STAKER_API_ENV") {
            if !env_override.is_empty() {
                let env_file = format!("config/api.{}.toml", env_override);
                if Path::new(&env_file).exists() {
                    builder = builder.add_source(File::new(&env_file, FileFormat::Toml));
                }
            }
        }

        // Secrets such as STAKER_API__SOCIAL__API_KEY come from the environment.
        builder = builder.add_source(
            Environment::with_prefix("STAKER_API")
                .prefix_separator("__")
                .separator("__"),
        );

        let settings = builder
            .build()
            .map_err(|err| map_config_error(err, &configured_path))?;
        let mut config: Self = settings
            .try_deserialize()
            .context("Failed to deserialize API configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        ensure!(
            !self.database.url.trim().is_empty(),
            "Database URL must be specified"
        );
        ensure!(self.server.port > 0, "Server port must be greater than zero");
        ensure!(
            self.database.max_connections >= self.database.min_connections.unwrap_or(1),
            "Max connections must be >= min connections"
        );
        ensure!(
            self.database.max_connections <= 128,
            "Connection pool oversized"
        );
        ensure!(!self.chain.rpc_url.is_empty(), "Chain RPC URL must be specified");
        ensure_timeout("chain.request_timeout_ms", self.chain.request_timeout_ms)?;
        ensure_timeout("names.request_timeout_ms", self.names.request_timeout_ms)?;
        ensure_timeout("social.request_timeout_ms", self.social.request_timeout_ms)?;
        self.names.primary.ensure_bounds("names.primary")?;
        self.names.secondary.ensure_bounds("names.secondary")?;
        self.social.normalize();
        self.social.ensure_bounds()?;
        self.resolver.ensure_bounds()?;
        self.primer.ensure_bounds()?;
        self.cache.ensure_bounds()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Option<IpAddr>,
    pub port: u16,
}

impl ServerConfig {
    pub fn address(&self) -> SocketAddr {
        let host = self.host.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(self.port != 0, "HTTP port cannot be zero");
        SocketAddr::new(host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub request_timeout_ms: Option<u64>,
}

impl ChainConfig {
    pub fn request_timeout(&self) -> Duration {
        bounded_timeout(self.request_timeout_ms.unwrap_or(10_000))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamesConfig {
    pub primary: RegistryConfig,
    pub secondary: RegistryConfig,
    pub request_timeout_ms: Option<u64>,
}

impl NamesConfig {
    pub fn request_timeout(&self) -> Duration {
        bounded_timeout(
            self.request_timeout_ms
                .unwrap_or(crate::providers::DEFAULT_PROVIDER_TIMEOUT.as_millis() as u64),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    pub rpc_url: String,
    pub registry_address: String,
    pub reverse_namespace: String,
    pub suffix: String,
}

impl RegistryConfig {
    fn ensure_bounds(&self, section: &str) -> Result<()> {
        ensure!(!self.rpc_url.is_empty(), "{section}.rpc_url must be specified");
        ensure!(
            !self.reverse_namespace.is_empty(),
            "{section}.reverse_namespace must be specified"
        );
        ensure!(
            self.suffix.starts_with('.') && self.suffix.len() > 1,
            "{section}.suffix must look like .eth"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SocialConfig {
    #[serde(default = "SocialConfig::default_base_url")]
    pub base_url: String,
    /// Absent or blank disables the social provider.
    pub api_key: Option<String>,
    #[serde(default = "SocialConfig::default_batch_limit")]
    pub batch_limit: usize,
    pub request_timeout_ms: Option<u64>,
    #[serde(default = "SocialConfig::default_profile_base_url")]
    pub profile_base_url: String,
}

impl SocialConfig {
    pub fn request_timeout(&self) -> Duration {
        bounded_timeout(
            self.request_timeout_ms
                .unwrap_or(crate::providers::DEFAULT_PROVIDER_TIMEOUT.as_millis() as u64),
        )
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    fn normalize(&mut self) {
        if self.api_key.as_deref().is_some_and(|key| key.trim().is_empty()) {
            self.api_key = None;
        }
    }

    fn ensure_bounds(&self) -> Result<()> {
        ensure!(self.batch_limit > 0, "Social batch limit must be positive");
        ensure!(
            self.batch_limit <= 350,
            "Social batch limit exceeds provider maximum"
        );
        ensure!(!self.base_url.is_empty(), "Social base URL must be specified");
        Ok(())
    }

    fn default_base_url() -> String {
        "https://api.neynar.com".to_string()
    }

    const fn default_batch_limit() -> usize {
        crate::providers::DEFAULT_SOCIAL_BATCH_LIMIT
    }

    fn default_profile_base_url() -> String {
        "https://warpcast.com".to_string()
    }
}

impl Default for SocialConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            api_key: None,
            batch_limit: Self::default_batch_limit(),
            request_timeout_ms: None,
            profile_base_url: Self::default_profile_base_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub cache_ttl_seconds: u64,
    pub max_requests_per_hour: u32,
    pub eager_enrichment: bool,
    pub refresh_chunk_size: usize,
    pub inter_chunk_delay_ms: u64,
    pub load_chunk_size: usize,
    pub load_chunk_delay_ms: u64,
    pub refresh_timeout_ms: u64,
}

impl ResolverConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn inter_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.inter_chunk_delay_ms)
    }

    pub fn load_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.load_chunk_delay_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    fn ensure_bounds(&self) -> Result<()> {
        ensure!(self.cache_ttl_seconds > 0, "Cache TTL must be positive");
        ensure!(
            self.cache_ttl_seconds <= 90 * 86_400,
            "Cache TTL cannot exceed 90 days"
        );
        ensure!(
            self.max_requests_per_hour > 0,
            "Social rate limit must be positive"
        );
        ensure!(
            self.refresh_chunk_size > 0 && self.refresh_chunk_size <= 350,
            "Refresh chunk size must be within 1..=350"
        );
        ensure!(
            self.load_chunk_size > 0 && self.load_chunk_size <= 1_000,
            "Load chunk size must be within 1..=1000"
        );
        ensure!(
            self.inter_chunk_delay_ms <= 60_000,
            "Inter-chunk delay cannot exceed one minute"
        );
        ensure!(
            self.refresh_timeout_ms >= 1_000,
            "Refresh timeout must be at least one second"
        );
        Ok(())
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: crate::resolver::DEFAULT_CACHE_TTL.as_secs(),
            max_requests_per_hour: crate::rate_limiter::DEFAULT_MAX_REQUESTS,
            eager_enrichment: true,
            refresh_chunk_size: crate::batch::DEFAULT_CHUNK_SIZE,
            inter_chunk_delay_ms: crate::batch::DEFAULT_INTER_CHUNK_DELAY.as_millis() as u64,
            load_chunk_size: crate::store::DEFAULT_LOAD_CHUNK_SIZE,
            load_chunk_delay_ms: crate::store::DEFAULT_LOAD_CHUNK_DELAY.as_millis() as u64,
            refresh_timeout_ms: crate::resolver::DEFAULT_REFRESH_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrimerConfig {
    pub enabled: bool,
    pub poll_interval_seconds: u64,
    pub top_n: u32,
    pub bulk_refresh_cooldown_seconds: u64,
}

impl PrimerConfig {
    pub fn poll_interval(&self) -> Duration {
        assert!(
            self.poll_interval_seconds >= 60,
            "Poll interval must be >= 60 seconds"
        );
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn bulk_refresh_cooldown(&self) -> Duration {
        Duration::from_secs(self.bulk_refresh_cooldown_seconds)
    }

    fn ensure_bounds(&self) -> Result<()> {
        ensure!(
            self.poll_interval_seconds >= 60,
            "Primer poll interval must be at least 60 seconds"
        );
        ensure!(self.top_n > 0, "Primer top_n must be positive");
        ensure!(
            self.top_n <= crate::balance::MAX_TOP_STAKERS,
            "Primer top_n exceeds defensive limit"
        );
        Ok(())
    }
}

impl Default for PrimerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: 3_600,
            top_n: 1_000,
            bulk_refresh_cooldown_seconds: 1_800,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub identities_max_capacity: u64,
    pub identities_ttl_seconds: u64,
}

impl CacheConfig {
    fn ensure_bounds(&self) -> Result<()> {
        ensure!(
            self.identities_max_capacity >= 100,
            "Identity cache capacity must be at least 100"
        );
        ensure!(
            self.identities_ttl_seconds > 0 && self.identities_ttl_seconds <= 86_400,
            "Identity cache TTL must be within one day"
        );
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            identities_max_capacity: 10_000,
            identities_ttl_seconds: 300,
        }
    }
}

const TIMEOUT_BOUNDS_MS: std::ops::RangeInclusive<u64> = 100..=60_000;

fn ensure_timeout(field: &str, millis: Option<u64>) -> Result<()> {
    if let Some(millis) = millis {
        ensure!(
            TIMEOUT_BOUNDS_MS.contains(&millis),
            "{field} must be within 100..=60000, got {millis}"
        );
    }
    Ok(())
}

fn bounded_timeout(millis: u64) -> Duration {
    assert!(millis >= 100, "Request timeout must be at least 100ms");
    assert!(millis <= 60_000, "Request timeout cannot exceed 60 seconds");
    Duration::from_millis(millis)
}

fn map_config_error(err: ConfigError, path: &str) -> ConfigError {
    match err {
        ConfigError::NotFound(_) => ConfigError::NotFound(path.to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [server]
        port = 8080

        [database]
        url = "postgres://localhost/stakers"
        max_connections = 8

        [chain]
        rpc_url = "http://localhost:8545"

        [names]
        [names.primary]
        rpc_url = "https://eth.example"
        registry_address = "0x00000000000C2E074eC69A0dFb2997BA6C7d2e1e"
        reverse_namespace = "addr.reverse"
        suffix = ".eth"

        [names.secondary]
        rpc_url = "https://base.example"
        registry_address = "0xb94704422c2a1e396835a571837aa5ae53285a95"
        reverse_namespace = "80002105.reverse"
        suffix = ".base.eth"

        [social]
        api_key = "   "
    "#;

    fn parse(source: &str) -> Result<ApiConfig> {
        let mut config: ApiConfig = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let config = parse(SAMPLE).expect("sample config is valid");
        assert_eq!(config.resolver.max_requests_per_hour, 10);
        assert_eq!(config.resolver.cache_ttl(), Duration::from_secs(604_800));
        assert_eq!(config.resolver.load_chunk_size, 100);
        assert_eq!(config.social.batch_limit, 20);
        assert!(config.resolver.eager_enrichment);
        assert_eq!(
            config.primer.bulk_refresh_cooldown(),
            Duration::from_secs(1_800)
        );
    }

    #[test]
    fn blank_api_key_disables_social() {
        let config = parse(SAMPLE).expect("sample config is valid");
        assert!(config.social.api_key().is_none());
    }

    #[test]
    fn missing_database_url_is_fatal() {
        let broken = SAMPLE.replace("postgres://localhost/stakers", "");
        let err = parse(&broken).expect_err("empty database url rejected");
        assert!(err.to_string().contains("Database URL"));
    }

    #[test]
    fn zero_rate_limit_is_rejected() {
        let broken = format!("{SAMPLE}\n[resolver]\nmax_requests_per_hour = 0\n");
        assert!(parse(&broken).is_err());
    }

    #[test]
    fn out_of_range_request_timeouts_are_rejected() {
        let chain = SAMPLE.replace(
            "rpc_url = \"http://localhost:8545\"",
            "rpc_url = \"http://localhost:8545\"\nrequest_timeout_ms = 50",
        );
        let err = parse(&chain).expect_err("chain timeout below bound");
        assert!(err.to_string().contains("chain.request_timeout_ms"));

        let social = SAMPLE.replace("api_key = \"   \"", "request_timeout_ms = 120000");
        let err = parse(&social).expect_err("social timeout above bound");
        assert!(err.to_string().contains("social.request_timeout_ms"));

        let names = SAMPLE.replace("[names]\n", "[names]\nrequest_timeout_ms = 0\n");
        assert!(parse(&names).is_err());
    }
}
