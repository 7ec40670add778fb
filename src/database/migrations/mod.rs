use sea_orm_migration::prelude::*;

mod m20241002_000001_create_persons;
mod m20241002_000002_create_assets;
mod m20241002_000003_create_derivations;
mod m20241009_000004_create_training_runs;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20241002_000001_create_persons::Migration),
            Box::new(m20241002_000002_create_assets::Migration),
            Box::new(m20241002_000003_create_derivations::Migration),
            Box::new(m20241009_000004_create_training_runs::Migration),
        ]
    }
}
