use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(StakerIdentities::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(StakerIdentities::Address)
                            .string_len(42)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(StakerIdentities::Rank).integer().null())
                    .col(ColumnDef::new(StakerIdentities::Amount).string_len(80).null())
                    .col(
                        ColumnDef::new(StakerIdentities::DisplayName)
                            .string_len(128)
                            .null(),
                    )
                    .col(ColumnDef::new(StakerIdentities::DisplayAvatar).text().null())
                    .col(ColumnDef::new(StakerIdentities::ProfileUrl).text().null())
                    .col(
                        ColumnDef::new(StakerIdentities::IdentityKind)
                            .string_len(32)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(StakerIdentities::HasVerifiedIdentity)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(StakerIdentities::PrimaryDomain)
                            .string_len(255)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(StakerIdentities::SecondaryDomain)
                            .string_len(255)
                            .null(),
                    )
                    .col(ColumnDef::new(StakerIdentities::Social).json().null())
                    .col(
                        ColumnDef::new(StakerIdentities::LastUpdated)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(StakerIdentities::RankedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_staker_identities_rank")
                    .table(StakerIdentities::Table)
                    .col(StakerIdentities::Rank)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(StakerIdentities::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum StakerIdentities {
    Table,
    Address,
    Rank,
    Amount,
    DisplayName,
    DisplayAvatar,
    ProfileUrl,
    IdentityKind,
    HasVerifiedIdentity,
    PrimaryDomain,
    SecondaryDomain,
    Social,
    LastUpdated,
    RankedAt,
}
