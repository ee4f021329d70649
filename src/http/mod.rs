use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::Method;
use axum::http::StatusCode;
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::rate_limiter::RateLimitStatus;
use crate::state::AppState;

mod identities;
mod leaderboard;

pub fn router(state: AppState) -> Router {
    assert!(
        state.start_time.elapsed() < Duration::from_secs(86_400),
        "Application uptime exceeds 24 hours before router creation"
    );

    // The leaderboard frontend is served from other origins.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([ACCEPT, CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    let identity_router = identities::router().with_state(state.clone());
    Router::new()
        .route("/health", get(health_live))
        .route("/health/ready", get(health_ready))
        .nest("/identities", identity_router)
        .route("/leaderboard", get(leaderboard::leaderboard))
        .layer(cors)
        .with_state(state)
}

async fn health_live(State(state): State<AppState>) -> Result<Json<HealthResponse>, HttpError> {
    let uptime = state.start_time.elapsed().as_secs();
    let response = HealthResponse {
        status: "live",
        uptime_seconds: uptime,
    };
    Ok(Json(response))
}

async fn health_ready(State(state): State<AppState>) -> Result<Json<ReadyResponse>, HttpError> {
    state
        .database
        .ping()
        .await
        .map_err(|err| HttpError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;

    let response = ReadyResponse {
        status: "ready",
        social_enabled: state.resolver.social_enabled(),
        rate_limit: state.resolver.rate_limit_status(),
        cached_identities: state.cache.identities.entry_count(),
    };
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    status: &'static str,
    social_enabled: bool,
    rate_limit: RateLimitStatus,
    cached_identities: u64,
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: String) -> Self {
        assert!(status != StatusCode::OK, "Error status cannot be 200");
        assert!(!message.is_empty(), "Error message cannot be empty");
        Self { status, message }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message.into())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        info!("HTTP error: {}", self.message);
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use sea_orm::DatabaseConnection;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::batch::BatchScheduler;
    use crate::config::CacheConfig;
    use crate::providers::testing::{FakeRegistry, FakeSocial};
    use crate::providers::{NameServiceAdapter, SocialAdapter};
    use crate::rate_limiter::SlidingWindowLimiter;
    use crate::resolver::{Resolver, ResolverSettings};
    use crate::state::{ApiCache, RefreshGate};
    use crate::store::IdentityCache;
    use crate::store::testing::MemoryStore;

    /// State over an in-memory store with social disabled and a detached
    /// database handle.
    pub fn state_with(store: Arc<MemoryStore>, primary: FakeRegistry) -> AppState {
        state_from(
            store,
            primary,
            SocialAdapter::Disabled,
            Arc::new(SlidingWindowLimiter::default()),
        )
    }

    pub fn state_with_social(
        store: Arc<MemoryStore>,
        social: Arc<FakeSocial>,
        limiter: Arc<SlidingWindowLimiter>,
    ) -> AppState {
        state_from(
            store,
            FakeRegistry::new(".eth", Vec::new()),
            SocialAdapter::enabled(social, 20, Duration::from_secs(5)),
            limiter,
        )
    }

    fn state_from(
        store: Arc<MemoryStore>,
        primary: FakeRegistry,
        social: SocialAdapter,
        limiter: Arc<SlidingWindowLimiter>,
    ) -> AppState {
        let names = NameServiceAdapter::new(
            Arc::new(primary),
            Arc::new(FakeRegistry::new(".base.eth", Vec::new())),
            Duration::from_secs(5),
        );
        let resolver = Resolver::new(
            IdentityCache::new(store, 100, Duration::ZERO),
            social,
            names,
            limiter,
            BatchScheduler::new(20, Duration::ZERO),
            ResolverSettings::default(),
        );
        AppState::new(
            DatabaseConnection::Disconnected,
            resolver,
            Arc::new(ApiCache::new(&CacheConfig::default())),
            Arc::new(RefreshGate::new(Duration::from_secs(1_800))),
        )
    }

    pub async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(state.clone())
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body readable");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, body)
    }

    pub fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("valid request")
    }

    pub fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("valid request")
    }
}
