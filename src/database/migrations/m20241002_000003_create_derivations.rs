use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Derivations::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Derivations::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Derivations::SourceAssetId).uuid().not_null())
                    .col(ColumnDef::new(Derivations::Operation).string().not_null())
                    .col(ColumnDef::new(Derivations::IdempotencyKey).string().not_null())
                    .col(
                        ColumnDef::new(Derivations::Attempt)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(Derivations::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(Derivations::Parameters).text().not_null())
                    .col(ColumnDef::new(Derivations::OutputAssetId).uuid())
                    .col(ColumnDef::new(Derivations::OutputText).text())
                    .col(ColumnDef::new(Derivations::StagedStorageKey).string())
                    .col(ColumnDef::new(Derivations::StagedContentType).string())
                    .col(ColumnDef::new(Derivations::FailureKind).string())
                    .col(ColumnDef::new(Derivations::FailureReason).text())
                    .col(ColumnDef::new(Derivations::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Derivations::UpdatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Derivations::CompletedAt).timestamp_with_time_zone())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_derivations_source_asset_id")
                            .from(Derivations::Table, Derivations::SourceAssetId)
                            .to(Assets::Table, Assets::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_derivations_output_asset_id")
                            .from(Derivations::Table, Derivations::OutputAssetId)
                            .to(Assets::Table, Assets::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_derivations_source_operation")
                    .table(Derivations::Table)
                    .col(Derivations::SourceAssetId)
                    .col(Derivations::Operation)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_derivations_status_created_at")
                    .table(Derivations::Table)
                    .col(Derivations::Status)
                    .col(Derivations::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_derivations_key_attempt")
                    .table(Derivations::Table)
                    .col(Derivations::IdempotencyKey)
                    .col(Derivations::Attempt)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // At most one live (pending or complete) row per key
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_derivations_live_key \
                 ON derivations (idempotency_key) WHERE status <> 'failed'",
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared("DROP INDEX IF EXISTS idx_derivations_live_key")
            .await?;

        manager
            .drop_table(Table::drop().table(Derivations::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Derivations {
    Table,
    Id,
    SourceAssetId,
    Operation,
    IdempotencyKey,
    Attempt,
    Status,
    Parameters,
    OutputAssetId,
    OutputText,
    StagedStorageKey,
    StagedContentType,
    FailureKind,
    FailureReason,
    CreatedAt,
    UpdatedAt,
    CompletedAt,
}

#[derive(Iden)]
enum Assets {
    Table,
    Id,
}
