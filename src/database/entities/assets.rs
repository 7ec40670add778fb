use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

/// An immutable stored object. Rows are only ever inserted.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "assets")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub owner_id: i32,
    pub bucket: String,
    #[sea_orm(unique)]
    pub storage_key: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::persons::Entity",
        from = "Column::OwnerId",
        to = "super::persons::Column::Id"
    )]
    Owner,
    #[sea_orm(has_many = "super::derivations::Entity")]
    Derivations,
}

impl Related<super::persons::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Owner.def()
    }
}

impl Related<super::derivations::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Derivations.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }

    /// Active model with every column set, for inserting a freshly stored asset
    pub fn to_insert_model(&self) -> ActiveModel {
        ActiveModel {
            id: Set(self.id),
            owner_id: Set(self.owner_id),
            bucket: Set(self.bucket.clone()),
            storage_key: Set(self.storage_key.clone()),
            content_type: Set(self.content_type.clone()),
            size_bytes: Set(self.size_bytes),
            checksum: Set(self.checksum.clone()),
            created_at: Set(self.created_at),
        }
    }
}
