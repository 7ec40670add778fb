use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Assets::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Assets::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Assets::OwnerId).integer().not_null())
                    .col(ColumnDef::new(Assets::Bucket).string().not_null())
                    .col(
                        ColumnDef::new(Assets::StorageKey)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Assets::ContentType).string().not_null())
                    .col(ColumnDef::new(Assets::SizeBytes).big_integer().not_null())
                    .col(ColumnDef::new(Assets::Checksum).string().not_null())
                    .col(ColumnDef::new(Assets::CreatedAt).timestamp_with_time_zone().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_assets_owner_id")
                            .from(Assets::Table, Assets::OwnerId)
                            .to(Persons::Table, Persons::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_assets_owner_id")
                    .table(Assets::Table)
                    .col(Assets::OwnerId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Assets::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Assets {
    Table,
    Id,
    OwnerId,
    Bucket,
    StorageKey,
    ContentType,
    SizeBytes,
    Checksum,
    CreatedAt,
}

#[derive(Iden)]
enum Persons {
    Table,
    Id,
}
