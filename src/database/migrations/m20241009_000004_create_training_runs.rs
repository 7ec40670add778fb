use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TrainingRuns::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(TrainingRuns::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(TrainingRuns::PersonId).integer().not_null())
                    .col(ColumnDef::new(TrainingRuns::TriggerWord).string().not_null())
                    .col(
                        ColumnDef::new(TrainingRuns::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(TrainingRuns::ImageCount).integer().not_null())
                    .col(ColumnDef::new(TrainingRuns::Service).string().not_null())
                    .col(ColumnDef::new(TrainingRuns::Model).string().not_null())
                    .col(ColumnDef::new(TrainingRuns::BundleAssetId).uuid())
                    .col(ColumnDef::new(TrainingRuns::WeightsAssetId).uuid())
                    .col(ColumnDef::new(TrainingRuns::ConfigAssetId).uuid())
                    .col(ColumnDef::new(TrainingRuns::FailureReason).text())
                    .col(ColumnDef::new(TrainingRuns::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(TrainingRuns::UpdatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(TrainingRuns::CompletedAt).timestamp_with_time_zone())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_training_runs_person_id")
                            .from(TrainingRuns::Table, TrainingRuns::PersonId)
                            .to(Persons::Table, Persons::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_training_runs_person_id")
                    .table(TrainingRuns::Table)
                    .col(TrainingRuns::PersonId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TrainingRuns::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum TrainingRuns {
    Table,
    Id,
    PersonId,
    TriggerWord,
    Status,
    ImageCount,
    Service,
    Model,
    BundleAssetId,
    WeightsAssetId,
    ConfigAssetId,
    FailureReason,
    CreatedAt,
    UpdatedAt,
    CompletedAt,
}

#[derive(Iden)]
enum Persons {
    Table,
    Id,
}
