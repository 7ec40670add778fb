use std::time::Duration;

use bytes::Bytes;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::AssetStore;
use crate::database::entities::{assets, persons};
use crate::errors::{LedgerError, LedgerResult};

/// Insert the row for an object that has already been written
pub async fn record_asset<C: ConnectionTrait>(conn: &C, asset: &assets::Model) -> Result<assets::Model, DbErr> {
    asset.to_insert_model().insert(conn).await
}

#[derive(Clone)]
pub struct AssetService {
    db: DatabaseConnection,
    store: AssetStore,
}

impl AssetService {
    pub fn new(db: DatabaseConnection, store: AssetStore) -> Self {
        Self { db, store }
    }

    pub fn store(&self) -> &AssetStore {
        &self.store
    }

    /// Store an original image for `owner_id` and record it
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn upload(&self, owner_id: i32, bytes: Bytes, content_type: &str) -> LedgerResult<assets::Model> {
        let content_type = content_type.trim().to_ascii_lowercase();
        if !content_type.starts_with("image/") {
            return Err(LedgerError::Validation(format!(
                "Only image uploads are accepted, got '{}'",
                content_type
            )));
        }
        if bytes.is_empty() {
            return Err(LedgerError::Validation("Upload is empty".to_string()));
        }
        if persons::Entity::find_by_id(owner_id).one(&self.db).await?.is_none() {
            return Err(LedgerError::PersonNotFound(owner_id));
        }

        let asset = self.store.put(owner_id, bytes, &content_type).await?;
        match record_asset(&self.db, &asset).await {
            Ok(recorded) => {
                info!("Uploaded asset {} for owner {}", recorded.id, owner_id);
                Ok(recorded)
            }
            Err(err) => {
                // Nothing references the object yet, so it can go
                if let Err(cleanup) = self.store.backend().delete(&asset.storage_key).await {
                    warn!("Failed to remove unrecorded object {}: {}", asset.storage_key, cleanup);
                }
                Err(err.into())
            }
        }
    }

    pub async fn find(&self, id: Uuid) -> LedgerResult<Option<assets::Model>> {
        Ok(assets::Entity::find_by_id(id).one(&self.db).await?)
    }

    pub async fn get(&self, id: Uuid) -> LedgerResult<assets::Model> {
        self.find(id).await?.ok_or(LedgerError::AssetNotFound(id))
    }

    pub async fn list_for_owner(&self, owner_id: i32) -> LedgerResult<Vec<assets::Model>> {
        Ok(assets::Entity::find()
            .filter(assets::Column::OwnerId.eq(owner_id))
            .order_by_asc(assets::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    pub async fn signed_url(&self, id: Uuid, ttl: Duration) -> LedgerResult<String> {
        let asset = self.get(id).await?;
        Ok(self.store.signed_read_url(&asset, ttl).await?)
    }

    pub async fn read(&self, id: Uuid) -> LedgerResult<Bytes> {
        let asset = self.get(id).await?;
        Ok(self.store.get(&asset).await?)
    }
}
