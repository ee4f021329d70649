use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::identity::{Address, IdentityKind, ResolvedIdentity};
use crate::rate_limiter::RateLimitStatus;
use crate::state::AppState;

use super::HttpError;

pub const MAX_BATCH_ADDRESSES: usize = 1_000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rate-limit", get(rate_limit))
        .route("/batch", post(resolve_batch))
        .route("/refresh", post(refresh))
        .route("/{address}", get(get_identity))
}

async fn get_identity(
    Path(raw): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ResolvedIdentity>, HttpError> {
    let address = Address::parse(&raw).map_err(|err| HttpError::bad_request(err.to_string()))?;

    if let Some(cached) = state.cache.identities.get(&address).await {
        return Ok(Json((*cached).clone()));
    }

    let identity = state.resolver.resolve_one(&address).await;
    // Address-only answers may just mean the budget ran out; leave them
    // uncached so a later refresh shows up immediately.
    if identity.identity_kind != IdentityKind::AddressOnly {
        state
            .cache
            .identities
            .insert(address, Arc::new(identity.clone()))
            .await;
    }
    Ok(Json(identity))
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    addresses: Vec<String>,
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    identities: Vec<ResolvedIdentity>,
}

/// Identities come back in request order with duplicates collapsed.
async fn resolve_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, HttpError> {
    let addresses = parse_addresses(&request.addresses)?;
    let mut resolved = state.resolver.resolve_batch(&addresses).await;

    let mut identities = Vec::with_capacity(addresses.len());
    for address in addresses {
        if let Some(identity) = resolved.remove(&address) {
            identities.push(identity);
        }
    }
    Ok(Json(BatchResponse { identities }))
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    addresses: Vec<String>,
    max_count: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    requested: usize,
    refreshed: usize,
}

async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, HttpError> {
    let addresses = parse_addresses(&request.addresses)?;
    if addresses.is_empty() {
        return Err(HttpError::bad_request("No addresses to refresh"));
    }
    let max_count = request.max_count.unwrap_or(addresses.len());
    if max_count == 0 {
        return Err(HttpError::bad_request("max_count must be positive"));
    }

    // Only claim the cooldown when the refresh can actually run.
    let status = state.resolver.rate_limit_status();
    if state.resolver.social_enabled() && !status.can_make_request {
        return Err(HttpError::new(
            StatusCode::TOO_MANY_REQUESTS,
            format!(
                "Social rate limit exhausted, retry in {} seconds",
                status.time_until_reset_secs.max(1)
            ),
        ));
    }

    if let Err(wait) = state.refresh_gate.try_begin() {
        return Err(HttpError::new(
            StatusCode::TOO_MANY_REQUESTS,
            format!(
                "Bulk refresh cooling down, retry in {} seconds",
                wait.as_secs().max(1)
            ),
        ));
    }

    let refreshed = state.resolver.force_refresh(&addresses, max_count).await;
    state.cache.invalidate_all_of(&addresses).await;
    info!("Bulk refresh requested for {} addresses, {refreshed} refreshed", addresses.len());

    Ok(Json(RefreshResponse {
        requested: addresses.len(),
        refreshed,
    }))
}

async fn rate_limit(State(state): State<AppState>) -> Json<RateLimitStatus> {
    Json(state.resolver.rate_limit_status())
}

fn parse_addresses(raw: &[String]) -> Result<Vec<Address>, HttpError> {
    if raw.len() > MAX_BATCH_ADDRESSES {
        return Err(HttpError::bad_request(format!(
            "At most {MAX_BATCH_ADDRESSES} addresses per request"
        )));
    }
    let mut seen = HashSet::with_capacity(raw.len());
    let mut addresses = Vec::with_capacity(raw.len());
    for value in raw {
        let address = Address::parse(value)
            .map_err(|err| HttpError::bad_request(format!("Invalid address {value}: {err}")))?;
        if seen.insert(address.clone()) {
            addresses.push(address);
        }
    }
    Ok(addresses)
}
