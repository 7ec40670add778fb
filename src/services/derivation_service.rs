//! The derivation ledger.
//!
//! Every state transition is a short statement or transaction against the
//! database; nothing here waits on storage or transforms.

use std::time::Duration;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder, Set, SqlErr,
    TransactionTrait,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::asset_service::record_asset;
use crate::database::entities::{assets, derivations};
use crate::derivation::{idempotency_key, DerivationStatus, FailureKind, Operation, OperationParameters};
use crate::errors::{LedgerError, LedgerResult};

/// Result of claiming a key: the live row and whether this call created it
#[derive(Debug, Clone)]
pub struct BeginOutcome {
    pub derivation: derivations::Model,
    pub created: bool,
}

#[derive(Debug, Clone)]
pub enum DerivationOutput {
    /// Asset already written to the store; its row is inserted with the completion
    NewAsset(assets::Model),
    /// Asset row that already exists
    ExistingAsset(Uuid),
    Text(String),
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
        || err.to_string().contains("UNIQUE constraint failed")
}

#[derive(Clone)]
pub struct DerivationService {
    db: DatabaseConnection,
}

impl DerivationService {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn find(&self, id: Uuid) -> LedgerResult<Option<derivations::Model>> {
        Ok(derivations::Entity::find_by_id(id).one(&self.db).await?)
    }

    pub async fn get(&self, id: Uuid) -> LedgerResult<derivations::Model> {
        self.find(id).await?.ok_or(LedgerError::DerivationNotFound(id))
    }

    /// The pending or complete row for `key`, if any
    pub async fn find_live(&self, key: &str) -> LedgerResult<Option<derivations::Model>> {
        Ok(derivations::Entity::find()
            .filter(derivations::Column::IdempotencyKey.eq(key))
            .filter(derivations::Column::Status.ne(DerivationStatus::Failed.as_str()))
            .one(&self.db)
            .await?)
    }

    /// Return the live row for this request, or insert a new pending attempt
    #[instrument(skip(self, parameters), fields(operation = %parameters.operation()))]
    pub async fn begin_derivation(
        &self,
        source_asset_id: Uuid,
        parameters: &OperationParameters,
    ) -> LedgerResult<BeginOutcome> {
        let parameters = parameters.clone().canonicalize()?;
        let key = idempotency_key(source_asset_id, &parameters)?;

        if let Some(existing) = self.find_live(&key).await? {
            debug!("Derivation {} already {} for key {}", existing.id, existing.status, key);
            return Ok(BeginOutcome {
                derivation: existing,
                created: false,
            });
        }

        if assets::Entity::find_by_id(source_asset_id).one(&self.db).await?.is_none() {
            return Err(LedgerError::AssetNotFound(source_asset_id));
        }

        let previous_attempt = derivations::Entity::find()
            .filter(derivations::Column::IdempotencyKey.eq(key.as_str()))
            .order_by_desc(derivations::Column::Attempt)
            .one(&self.db)
            .await?
            .map_or(0, |row| row.attempt);

        let now = Utc::now();
        let row = derivations::ActiveModel {
            id: Set(Uuid::new_v4()),
            source_asset_id: Set(source_asset_id),
            operation: Set(parameters.operation().as_str().to_string()),
            idempotency_key: Set(key.clone()),
            attempt: Set(previous_attempt + 1),
            status: Set(DerivationStatus::Pending.as_str().to_string()),
            parameters: Set(parameters.to_canonical_json()),
            output_asset_id: Set(None),
            output_text: Set(None),
            staged_storage_key: Set(None),
            staged_content_type: Set(None),
            failure_kind: Set(None),
            failure_reason: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            completed_at: Set(None),
        };

        match row.insert(&self.db).await {
            Ok(created) => {
                info!(
                    "Began derivation {} ({} attempt {}) on asset {}",
                    created.id, created.operation, created.attempt, source_asset_id
                );
                Ok(BeginOutcome {
                    derivation: created,
                    created: true,
                })
            }
            // Another caller claimed the key between our read and insert
            Err(err) if is_unique_violation(&err) => {
                debug!("Lost race for key {}, returning the winner", key);
                let winner = self.find_live(&key).await?.ok_or_else(|| {
                    LedgerError::InvalidState(format!("Key {} is contended, retry the request", key))
                })?;
                Ok(BeginOutcome {
                    derivation: winner,
                    created: false,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Remember the object key about to be written so a crash after the write
    /// can be recovered by reconciliation
    pub async fn stage_output(&self, id: Uuid, storage_key: &str, content_type: &str) -> LedgerResult<()> {
        let result = derivations::Entity::update_many()
            .col_expr(derivations::Column::StagedStorageKey, Expr::value(storage_key))
            .col_expr(derivations::Column::StagedContentType, Expr::value(content_type))
            .col_expr(derivations::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(derivations::Column::Id.eq(id))
            .filter(derivations::Column::Status.eq(DerivationStatus::Pending.as_str()))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 1 {
            Ok(())
        } else {
            let row = self.get(id).await?;
            Err(LedgerError::InvalidState(format!(
                "Derivation {} is {}, cannot stage output",
                id, row.status
            )))
        }
    }

    /// Atomically record the output and move `pending -> complete`
    #[instrument(skip(self, output))]
    pub async fn complete_derivation(&self, id: Uuid, output: DerivationOutput) -> LedgerResult<derivations::Model> {
        let txn = self.db.begin().await?;

        let row = derivations::Entity::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or(LedgerError::DerivationNotFound(id))?;
        if !row.is_pending() {
            return Err(LedgerError::InvalidState(format!(
                "Derivation {} is {}, not pending",
                id, row.status
            )));
        }

        let operation = row.get_operation()?;
        let (output_asset_id, output_text) = match output {
            DerivationOutput::Text(text) => {
                if !operation.produces_text() {
                    return Err(LedgerError::Validation(format!("{} produces an asset, not text", operation)));
                }
                (None, Some(text))
            }
            DerivationOutput::NewAsset(asset) => {
                if operation.produces_text() {
                    return Err(LedgerError::Validation(format!("{} produces text, not an asset", operation)));
                }
                let recorded = record_asset(&txn, &asset).await?;
                (Some(recorded.id), None)
            }
            DerivationOutput::ExistingAsset(asset_id) => {
                if operation.produces_text() {
                    return Err(LedgerError::Validation(format!("{} produces text, not an asset", operation)));
                }
                if assets::Entity::find_by_id(asset_id).one(&txn).await?.is_none() {
                    return Err(LedgerError::AssetNotFound(asset_id));
                }
                (Some(asset_id), None)
            }
        };

        let now = Utc::now();
        let result = derivations::Entity::update_many()
            .col_expr(derivations::Column::Status, Expr::value(DerivationStatus::Complete.as_str()))
            .col_expr(derivations::Column::OutputAssetId, Expr::value(output_asset_id))
            .col_expr(derivations::Column::OutputText, Expr::value(output_text))
            .col_expr(derivations::Column::StagedStorageKey, Expr::value(Option::<String>::None))
            .col_expr(derivations::Column::StagedContentType, Expr::value(Option::<String>::None))
            .col_expr(derivations::Column::UpdatedAt, Expr::value(now))
            .col_expr(derivations::Column::CompletedAt, Expr::value(Some(now)))
            .filter(derivations::Column::Id.eq(id))
            .filter(derivations::Column::Status.eq(DerivationStatus::Pending.as_str()))
            .exec(&txn)
            .await?;
        if result.rows_affected != 1 {
            return Err(LedgerError::InvalidState(format!(
                "Derivation {} left pending concurrently",
                id
            )));
        }

        let completed = derivations::Entity::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or(LedgerError::DerivationNotFound(id))?;
        txn.commit().await?;

        info!("Completed derivation {} ({})", id, completed.operation);
        Ok(completed)
    }

    /// Move `pending -> failed`. Failing an already failed row is a no-op.
    #[instrument(skip(self, reason))]
    pub async fn fail_derivation(
        &self,
        id: Uuid,
        kind: FailureKind,
        reason: &str,
    ) -> LedgerResult<derivations::Model> {
        let row = self.get(id).await?;
        if row.is_failed() {
            return Ok(row);
        }
        if row.is_complete() {
            return Err(LedgerError::InvalidState(format!(
                "Derivation {} is complete and cannot fail",
                id
            )));
        }

        let now = Utc::now();
        let result = derivations::Entity::update_many()
            .col_expr(derivations::Column::Status, Expr::value(DerivationStatus::Failed.as_str()))
            .col_expr(derivations::Column::FailureKind, Expr::value(kind.as_str()))
            .col_expr(derivations::Column::FailureReason, Expr::value(reason))
            .col_expr(derivations::Column::UpdatedAt, Expr::value(now))
            .col_expr(derivations::Column::CompletedAt, Expr::value(Some(now)))
            .filter(derivations::Column::Id.eq(id))
            .filter(derivations::Column::Status.eq(DerivationStatus::Pending.as_str()))
            .exec(&self.db)
            .await?;

        let row = self.get(id).await?;
        if result.rows_affected == 0 && !row.is_failed() {
            return Err(LedgerError::InvalidState(format!(
                "Derivation {} is {} and cannot fail",
                id, row.status
            )));
        }

        warn!("Derivation {} failed ({}): {}", id, kind, reason);
        Ok(row)
    }

    pub async fn list_derivations(
        &self,
        source_asset_id: Uuid,
        operation: Option<Operation>,
    ) -> LedgerResult<Vec<derivations::Model>> {
        let mut query = derivations::Entity::find()
            .filter(derivations::Column::SourceAssetId.eq(source_asset_id));
        if let Some(operation) = operation {
            query = query.filter(derivations::Column::Operation.eq(operation.as_str()));
        }
        Ok(query
            .order_by_asc(derivations::Column::CreatedAt)
            .order_by_asc(derivations::Column::Attempt)
            .all(&self.db)
            .await?)
    }

    /// Pending rows created at least `older_than` ago
    pub async fn reconcile_pending(&self, older_than: Duration) -> LedgerResult<Vec<derivations::Model>> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|_| LedgerError::Validation("Staleness threshold is out of range".to_string()))?;
        let cutoff = Utc::now() - older_than;

        Ok(derivations::Entity::find()
            .filter(derivations::Column::Status.eq(DerivationStatus::Pending.as_str()))
            .filter(derivations::Column::CreatedAt.lte(cutoff))
            .order_by_asc(derivations::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    /// Most recently completed derivation of `operation` on `source_asset_id`
    pub async fn latest_complete(
        &self,
        source_asset_id: Uuid,
        operation: Operation,
    ) -> LedgerResult<Option<derivations::Model>> {
        Ok(derivations::Entity::find()
            .filter(derivations::Column::SourceAssetId.eq(source_asset_id))
            .filter(derivations::Column::Operation.eq(operation.as_str()))
            .filter(derivations::Column::Status.eq(DerivationStatus::Complete.as_str()))
            .order_by_desc(derivations::Column::CompletedAt)
            .one(&self.db)
            .await?)
    }
}
