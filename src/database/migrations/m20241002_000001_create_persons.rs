use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Persons::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Persons::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Persons::FirstName).string().not_null())
                    .col(ColumnDef::new(Persons::LastName).string().not_null())
                    .col(ColumnDef::new(Persons::Ethnicity).string().not_null())
                    .col(ColumnDef::new(Persons::Gender).string().not_null())
                    .col(ColumnDef::new(Persons::Birthdate).date())
                    .col(ColumnDef::new(Persons::Age).integer())
                    .col(ColumnDef::new(Persons::TriggerWord).string())
                    .col(ColumnDef::new(Persons::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Persons::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Persons::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Persons {
    Table,
    Id,
    FirstName,
    LastName,
    Ethnicity,
    Gender,
    Birthdate,
    Age,
    TriggerWord,
    CreatedAt,
    UpdatedAt,
}
