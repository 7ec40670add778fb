use std::time::Duration;

use chrono::Utc;
use sea_orm::EntityTrait;
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{AssetStore, DerivationOutput, DerivationService};
use crate::database::entities::{assets, derivations};
use crate::derivation::FailureKind;
use crate::errors::{LedgerError, LedgerResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub examined: usize,
    /// Rows completed from an object that was written but never recorded
    pub adopted: Vec<Uuid>,
    pub expired: Vec<Uuid>,
}

/// Resolves derivations left pending by a crashed or abandoned caller
#[derive(Clone)]
pub struct ReconcileService {
    ledger: DerivationService,
    store: AssetStore,
}

impl ReconcileService {
    pub fn new(ledger: DerivationService, store: AssetStore) -> Self {
        Self { ledger, store }
    }

    #[instrument(skip(self))]
    pub async fn run(&self, older_than: Duration) -> LedgerResult<ReconcileReport> {
        let stale = self.ledger.reconcile_pending(older_than).await?;
        let mut report = ReconcileReport {
            examined: stale.len(),
            ..Default::default()
        };

        for row in stale {
            match self.adopt_staged(&row).await {
                Ok(true) => {
                    report.adopted.push(row.id);
                    continue;
                }
                Ok(false) => {}
                // Completed or failed since we listed it
                Err(LedgerError::InvalidState(message)) => {
                    info!("Skipping derivation {}: {}", row.id, message);
                    continue;
                }
                Err(LedgerError::Storage(err)) if err.is_transient() => {
                    warn!("Leaving derivation {} pending, store unavailable: {}", row.id, err);
                    continue;
                }
                Err(err) => {
                    warn!("Could not adopt staged output of {}: {}", row.id, err);
                }
            }

            let pending_for = row.stale_since(Utc::now()).unwrap_or_default();
            let reason = format!(
                "Expired by reconciliation: pending since {} ({}s)",
                row.created_at.to_rfc3339(),
                pending_for.as_secs()
            );
            match self.ledger.fail_derivation(row.id, FailureKind::Expired, &reason).await {
                Ok(_) => report.expired.push(row.id),
                Err(LedgerError::InvalidState(message)) => info!("Skipping derivation {}: {}", row.id, message),
                Err(err) => return Err(err),
            }
        }

        info!(
            "Reconciled {} pending derivations: {} adopted, {} expired",
            report.examined,
            report.adopted.len(),
            report.expired.len()
        );
        Ok(report)
    }

    async fn adopt_staged(&self, row: &derivations::Model) -> LedgerResult<bool> {
        let (Some(key), Some(content_type)) = (&row.staged_storage_key, &row.staged_content_type) else {
            return Ok(false);
        };
        if !self.store.backend().exists(key).await? {
            return Ok(false);
        }

        let owner_id = self.source_owner(row.source_asset_id).await?;
        let asset = self.store.adopt(owner_id, key, content_type).await?;
        self.ledger
            .complete_derivation(row.id, DerivationOutput::NewAsset(asset))
            .await?;
        info!("Adopted staged object {} for derivation {}", key, row.id);
        Ok(true)
    }

    async fn source_owner(&self, source_asset_id: Uuid) -> LedgerResult<i32> {
        assets::Entity::find_by_id(source_asset_id)
            .one(self.ledger.connection())
            .await?
            .map(|asset| asset.owner_id)
            .ok_or(LedgerError::AssetNotFound(source_asset_id))
    }
}
