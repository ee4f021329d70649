use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    TransactionTrait,
};
use tracing::warn;

use super::{IdentityStore, RankedRow, StoreError};
use crate::balance::StakerRanking;
use crate::entities::staker_identity;
use crate::identity::{Address, CacheRecord, IdentityKind, ResolvedIdentity, SocialFragment};

const RANKING_INSERT_BATCH: usize = 500;

/// PostgreSQL-backed identity store over the `staker_identities` table.
#[derive(Clone)]
pub struct SeaOrmIdentityStore {
    database: DatabaseConnection,
}

impl SeaOrmIdentityStore {
    pub fn new(database: DatabaseConnection) -> Self {
        Self { database }
    }
}

#[async_trait]
impl IdentityStore for SeaOrmIdentityStore {
    async fn load_chunk(&self, addresses: &[Address]) -> Result<Vec<CacheRecord>, StoreError> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = addresses.iter().map(|a| a.as_str().to_string()).collect();
        let rows = staker_identity::Entity::find()
            .filter(staker_identity::Column::Address.is_in(keys))
            .filter(staker_identity::Column::LastUpdated.is_not_null())
            .all(&self.database)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match into_record(&row) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(err) => warn!("Ignoring cached identity row: {err}"),
            }
        }
        Ok(records)
    }

    async fn upsert(&self, record: &CacheRecord) -> Result<(), StoreError> {
        let identity = &record.identity;
        let social = identity
            .social
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|err| StoreError::Corrupt {
                address: identity.address.to_string(),
                reason: err.to_string(),
            })?;

        let model = staker_identity::ActiveModel {
            address: Set(identity.address.to_string()),
            rank: NotSet,
            amount: NotSet,
            display_name: Set(Some(identity.display_name.clone())),
            display_avatar: Set(identity.display_avatar.clone()),
            profile_url: Set(identity.profile_url.clone()),
            identity_kind: Set(Some(identity.identity_kind.as_str().to_string())),
            has_verified_identity: Set(identity.has_verified_identity),
            primary_domain: Set(identity.primary_domain.clone()),
            secondary_domain: Set(identity.secondary_domain.clone()),
            social: Set(social),
            last_updated: Set(Some(to_fixed_offset(record.last_updated))),
            ranked_at: NotSet,
        };

        staker_identity::Entity::insert(model)
            .on_conflict(
                OnConflict::column(staker_identity::Column::Address)
                    .update_columns([
                        staker_identity::Column::DisplayName,
                        staker_identity::Column::DisplayAvatar,
                        staker_identity::Column::ProfileUrl,
                        staker_identity::Column::IdentityKind,
                        staker_identity::Column::HasVerifiedIdentity,
                        staker_identity::Column::PrimaryDomain,
                        staker_identity::Column::SecondaryDomain,
                        staker_identity::Column::Social,
                        staker_identity::Column::LastUpdated,
                    ])
                    .to_owned(),
            )
            .exec(&self.database)
            .await?;
        Ok(())
    }

    async fn record_rankings(&self, rankings: &[StakerRanking]) -> Result<(), StoreError> {
        let ranked_at = to_fixed_offset(Utc::now());
        let txn = self.database.begin().await?;

        for batch in rankings.chunks(RANKING_INSERT_BATCH) {
            let mut models = Vec::with_capacity(batch.len());
            for ranking in batch {
                let rank = i32::try_from(ranking.rank).map_err(|_| StoreError::Corrupt {
                    address: ranking.address.to_string(),
                    reason: format!("rank {} overflows i32", ranking.rank),
                })?;
                models.push(staker_identity::ActiveModel {
                    address: Set(ranking.address.to_string()),
                    rank: Set(Some(rank)),
                    amount: Set(Some(ranking.amount.clone())),
                    has_verified_identity: Set(false),
                    ranked_at: Set(Some(ranked_at)),
                    ..Default::default()
                });
            }
            staker_identity::Entity::insert_many(models)
                .on_conflict(
                    OnConflict::column(staker_identity::Column::Address)
                        .update_columns([
                            staker_identity::Column::Rank,
                            staker_identity::Column::Amount,
                            staker_identity::Column::RankedAt,
                        ])
                        .to_owned(),
                )
                .exec(&txn)
                .await?;
        }

        // Addresses that fell out of the top list lose their rank.
        staker_identity::Entity::update_many()
            .col_expr(staker_identity::Column::Rank, Expr::value(Option::<i32>::None))
            .filter(staker_identity::Column::RankedAt.lt(ranked_at))
            .exec(&txn)
            .await?;

        txn.commit().await?;
        Ok(())
    }

    async fn ranked_page(&self, offset: u64, limit: u64) -> Result<Vec<RankedRow>, StoreError> {
        assert!(limit > 0, "Page limit must be positive");
        let rows = staker_identity::Entity::find()
            .filter(staker_identity::Column::Rank.is_not_null())
            .order_by_asc(staker_identity::Column::Rank)
            .offset(offset)
            .limit(limit)
            .all(&self.database)
            .await?;

        let mut page = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(rank) = row.rank.and_then(|rank| u32::try_from(rank).ok()) else {
                continue;
            };
            let address = Address::parse(&row.address).map_err(|err| StoreError::Corrupt {
                address: row.address.clone(),
                reason: err.to_string(),
            })?;
            let record = match into_record(&row) {
                Ok(record) => record,
                Err(err) => {
                    warn!("Ignoring cached identity row: {err}");
                    None
                }
            };
            page.push(RankedRow {
                rank,
                address,
                amount: row.amount.clone().unwrap_or_default(),
                record,
            });
        }
        Ok(page)
    }
}

/// `None` for rows that only carry ranking data.
fn into_record(row: &staker_identity::Model) -> Result<Option<CacheRecord>, StoreError> {
    let (Some(kind_tag), Some(display_name), Some(last_updated)) =
        (&row.identity_kind, &row.display_name, row.last_updated)
    else {
        return Ok(None);
    };
    let corrupt = |reason: String| StoreError::Corrupt {
        address: row.address.clone(),
        reason,
    };

    let address = Address::parse(&row.address).map_err(|err| corrupt(err.to_string()))?;
    let identity_kind = IdentityKind::from_tag(kind_tag)
        .ok_or_else(|| corrupt(format!("unknown identity kind {kind_tag}")))?;
    if display_name.is_empty() {
        return Err(corrupt("empty display name".to_string()));
    }
    if row.has_verified_identity != identity_kind.is_verified() {
        return Err(corrupt("verification flag disagrees with identity kind".to_string()));
    }
    let social = row
        .social
        .clone()
        .map(serde_json::from_value::<SocialFragment>)
        .transpose()
        .map_err(|err| corrupt(err.to_string()))?;

    let identity = ResolvedIdentity {
        address,
        social,
        primary_domain: row.primary_domain.clone(),
        secondary_domain: row.secondary_domain.clone(),
        display_name: display_name.clone(),
        display_avatar: row.display_avatar.clone(),
        profile_url: row.profile_url.clone(),
        has_verified_identity: row.has_verified_identity,
        identity_kind,
    };
    Ok(Some(CacheRecord::new(
        identity,
        last_updated.with_timezone(&Utc),
    )))
}

fn to_fixed_offset(time: DateTime<Utc>) -> DateTime<FixedOffset> {
    time.fixed_offset()
}
