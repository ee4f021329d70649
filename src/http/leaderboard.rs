use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::identity::{Address, ResolvedIdentity};
use crate::state::AppState;

use super::HttpError;

const DEFAULT_PAGE_SIZE: u64 = 100;
const MAX_PAGE_SIZE: u64 = 1_000;

#[derive(Debug, Deserialize)]
pub(super) struct LeaderboardQuery {
    limit: Option<u64>,
    offset: Option<u64>,
}

#[derive(Debug, Serialize)]
struct LeaderboardEntry {
    rank: u32,
    address: Address,
    amount: String,
    identity: ResolvedIdentity,
}

#[derive(Debug, Serialize)]
pub(super) struct LeaderboardPage {
    offset: u64,
    limit: u64,
    entries: Vec<LeaderboardEntry>,
}

/// Ranked rows straight from the store. Rows the primer has not resolved yet
/// carry the address-only identity.
pub(super) async fn leaderboard(
    Query(query): Query<LeaderboardQuery>,
    State(state): State<AppState>,
) -> Result<Json<LeaderboardPage>, HttpError> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    if limit == 0 || limit > MAX_PAGE_SIZE {
        return Err(HttpError::bad_request(format!(
            "limit must be within 1..={MAX_PAGE_SIZE}"
        )));
    }
    let offset = query.offset.unwrap_or(0);

    let rows = state
        .resolver
        .cache()
        .store()
        .ranked_page(offset, limit)
        .await
        .map_err(|err| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    let entries = rows
        .into_iter()
        .map(|row| {
            let identity = match row.record {
                Some(record) => record.identity,
                None => ResolvedIdentity::address_only(row.address.clone()),
            };
            LeaderboardEntry {
                rank: row.rank,
                address: row.address,
                amount: row.amount,
                identity,
            }
        })
        .collect();

    Ok(Json(LeaderboardPage {
        offset,
        limit,
        entries,
    }))
}
