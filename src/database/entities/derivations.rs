use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::derivation::{DerivationStatus, Operation, OperationParameters};
use crate::errors::{LedgerError, LedgerResult};

/// One attempt at deriving an output from a source asset.
///
/// At most one row per `idempotency_key` may have a status other than
/// `failed`; failed rows are kept and a retry inserts the next `attempt`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "derivations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub source_asset_id: Uuid,
    pub operation: String,
    pub idempotency_key: String,
    pub attempt: i32,
    pub status: String,
    #[sea_orm(column_type = "Text")]
    pub parameters: String,
    pub output_asset_id: Option<Uuid>,
    #[sea_orm(column_type = "Text", nullable)]
    pub output_text: Option<String>,
    pub staged_storage_key: Option<String>,
    pub staged_content_type: Option<String>,
    pub failure_kind: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub failure_reason: Option<String>,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
    pub completed_at: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::assets::Entity",
        from = "Column::SourceAssetId",
        to = "super::assets::Column::Id"
    )]
    SourceAsset,
    #[sea_orm(
        belongs_to = "super::assets::Entity",
        from = "Column::OutputAssetId",
        to = "super::assets::Column::Id"
    )]
    OutputAsset,
}

impl Related<super::assets::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SourceAsset.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn get_status(&self) -> LedgerResult<DerivationStatus> {
        self.status.parse()
    }

    pub fn get_operation(&self) -> LedgerResult<Operation> {
        self.operation.parse()
    }

    pub fn get_parameters(&self) -> LedgerResult<OperationParameters> {
        let value = serde_json::from_str(&self.parameters).map_err(|err| {
            LedgerError::InvalidState(format!(
                "Derivation {} has unreadable parameters: {}",
                self.id, err
            ))
        })?;
        OperationParameters::from_value(self.get_operation()?, value)
    }

    pub fn is_pending(&self) -> bool {
        self.status == DerivationStatus::Pending.as_str()
    }

    pub fn is_complete(&self) -> bool {
        self.status == DerivationStatus::Complete.as_str()
    }

    pub fn is_failed(&self) -> bool {
        self.status == DerivationStatus::Failed.as_str()
    }

    /// How long a pending row has been waiting, None once it has left `pending`
    pub fn stale_since(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.is_pending() {
            return None;
        }
        Some((now - self.created_at).to_std().unwrap_or(Duration::ZERO))
    }
}
