use sea_orm::entity::prelude::*;

/// One row per staker address. Ranking columns are written by the cache
/// primer, identity columns by the resolver; either half may be empty.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "staker_identities")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub address: String,
    pub rank: Option<i32>,
    pub amount: Option<String>,
    pub display_name: Option<String>,
    pub display_avatar: Option<String>,
    pub profile_url: Option<String>,
    pub identity_kind: Option<String>,
    pub has_verified_identity: bool,
    pub primary_domain: Option<String>,
    pub secondary_domain: Option<String>,
    pub social: Option<Json>,
    pub last_updated: Option<DateTimeWithTimeZone>,
    pub ranked_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
