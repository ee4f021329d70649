mod balance;
mod batch;
mod config;
mod entities;
mod http;
mod identity;
mod primer;
mod providers;
mod rate_limiter;
mod resolver;
mod state;
mod store;

use std::sync::Arc;
use std::time::Duration;

use crate::balance::RpcBalanceSource;
use crate::batch::BatchScheduler;
use crate::config::{ApiConfig, RegistryConfig};
use crate::primer::CachePrimer;
use crate::providers::{EnsReverseRegistry, NameServiceAdapter, NeynarClient, SocialAdapter};
use crate::rate_limiter::{DEFAULT_WINDOW, SlidingWindowLimiter};
use crate::resolver::{Resolver, ResolverSettings};
use crate::state::{ApiCache, AppState, RefreshGate};
use crate::store::{IdentityCache, SeaOrmIdentityStore};
use anyhow::{Context, Result};
use axum::Router;
use migration::MigratorTrait;
use sea_orm::ConnectOptions;
use sea_orm::Database;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = ApiConfig::load().context("Failed to load configuration")?;
    let database = connect_database(&config).await?;
    run_migrations(&database).await?;

    let resolver = build_resolver(&config, database.clone())?;
    let balances = RpcBalanceSource::new(&config.chain.rpc_url, config.chain.request_timeout())
        .context("Failed to initialize balance source")?;

    let cache = Arc::new(ApiCache::new(&config.cache));
    let refresh_gate = Arc::new(RefreshGate::new(config.primer.bulk_refresh_cooldown()));
    let app_state = AppState::new(database.clone(), resolver.clone(), cache, refresh_gate);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let primer_handle = if config.primer.enabled {
        let primer = CachePrimer::new(
            Arc::new(balances),
            resolver.clone(),
            config.primer.top_n,
            config.primer.poll_interval(),
        );
        Some(tokio::spawn(async move {
            if let Err(err) = primer.run(shutdown_rx).await {
                error!("Cache primer terminated with error: {err}");
            }
        }))
    } else {
        info!("Cache primer disabled by configuration");
        None
    };

    let listener = TcpListener::bind(config.server.address())
        .await
        .context("Failed to bind HTTP listener")?;
    let local_addr = listener
        .local_addr()
        .context("Failed to obtain listener address")?;
    info!("Staker identity API listening on {local_addr}");

    let router: Router = http::router(app_state);
    let server = axum::serve(listener, router.into_make_service());
    server
        .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
        .await
        .context("HTTP server exited with error")?;

    shutdown_tx.send(true).ok();
    if let Some(handle) = primer_handle {
        if let Err(join_err) = handle.await {
            error!("Cache primer task join error: {join_err}");
        }
    }

    Ok(())
}

fn init_tracing() {
    let default_filter = "info";
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());
    assert!(!filter.is_empty(), "Tracing filter must not be empty");
    assert!(filter.len() < 256, "Tracing filter length exceeds bounds");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .compact()
        .init();
}

fn build_resolver(config: &ApiConfig, database: sea_orm::DatabaseConnection) -> Result<Resolver> {
    let social = match config.social.api_key() {
        Some(api_key) => {
            let client = NeynarClient::new(
                &config.social.base_url,
                api_key.to_string(),
                config.social.request_timeout(),
            )
            .context("Failed to initialize social provider")?;
            SocialAdapter::enabled(
                Arc::new(client),
                config.social.batch_limit,
                config.social.request_timeout(),
            )
        }
        None => {
            info!("No social API key configured, resolving through name services only");
            SocialAdapter::Disabled
        }
    };

    let names_timeout = config.names.request_timeout();
    let primary = registry(&config.names.primary, names_timeout)
        .context("Failed to initialize primary name registry")?;
    let secondary = registry(&config.names.secondary, names_timeout)
        .context("Failed to initialize secondary name registry")?;
    let names = NameServiceAdapter::new(Arc::new(primary), Arc::new(secondary), names_timeout);

    let store = Arc::new(SeaOrmIdentityStore::new(database));
    let cache = IdentityCache::new(
        store,
        config.resolver.load_chunk_size,
        config.resolver.load_chunk_delay(),
    );
    let limiter = Arc::new(SlidingWindowLimiter::new(
        config.resolver.max_requests_per_hour,
        DEFAULT_WINDOW,
    ));
    let scheduler = BatchScheduler::new(
        config.resolver.refresh_chunk_size,
        config.resolver.inter_chunk_delay(),
    );
    let settings = ResolverSettings {
        cache_ttl: config.resolver.cache_ttl(),
        eager_enrichment: config.resolver.eager_enrichment,
        refresh_timeout: config.resolver.refresh_timeout(),
        profile_base_url: config.social.profile_base_url.clone(),
    };

    Ok(Resolver::new(cache, social, names, limiter, scheduler, settings))
}

fn registry(config: &RegistryConfig, timeout: Duration) -> Result<EnsReverseRegistry> {
    EnsReverseRegistry::new(
        &config.rpc_url,
        &config.registry_address,
        &config.reverse_namespace,
        &config.suffix,
        timeout,
    )
}

async fn connect_database(config: &ApiConfig) -> Result<sea_orm::DatabaseConnection> {
    let mut options = ConnectOptions::new(config.database.url.clone());
    options
        .max_connections(config.database.max_connections)
        .sqlx_logging(true)
        .sqlx_logging_level(tracing::log::LevelFilter::Debug)
        .acquire_timeout(Duration::from_secs(10));

    if let Some(min) = config.database.min_connections {
        options.min_connections(min);
    }

    Database::connect(options)
        .await
        .context("Failed to connect to PostgreSQL")
}

async fn run_migrations(database: &sea_orm::DatabaseConnection) -> Result<()> {
    migration::Migrator::up(database, None)
        .await
        .context("Database migrations failed")
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {err}");
        return;
    }
    shutdown_tx.send(true).ok();
    info!("Shutdown signal dispatched");
}
