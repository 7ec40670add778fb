use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::database::entities::{assets, derivations};
use crate::derivation::{FailureKind, Operation};
use crate::errors::LedgerError;
use crate::server::app::AppState;
use crate::server::error::ApiResult;
use crate::services::{DeriveOutcome, PendingPolicy, ReconcileReport};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyName {
    Wait,
    ReturnPending,
    ReattemptIfStale,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDerivationRequest {
    pub operation: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub policy: Option<PolicyName>,
    #[serde(default, alias = "timeout_secs")]
    pub timeout_secs: Option<u64>,
    /// Threshold for `reattempt_if_stale`; defaults to the configured staleness
    #[serde(default, alias = "stale_after_secs")]
    pub stale_after_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivationResponse {
    pub derivation: derivations::Model,
    pub output_asset: Option<assets::Model>,
    pub output_url: Option<String>,
    pub executed: bool,
    pub pending_for_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub operation: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct ReconcileQuery {
    pub older_than_secs: Option<u64>,
}

async fn respond(state: &AppState, outcome: DeriveOutcome) -> ApiResult<(StatusCode, Json<DerivationResponse>)> {
    let output_url = match &outcome.output_asset {
        Some(asset) => Some(
            state
                .ctx
                .store()
                .signed_read_url(asset, state.ctx.config().preview_url_ttl)
                .await?,
        ),
        None => None,
    };
    let status = if outcome.derivation.is_pending() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };

    Ok((
        status,
        Json(DerivationResponse {
            pending_for_secs: outcome.stale_since.map(|since| since.as_secs()),
            derivation: outcome.derivation,
            output_asset: outcome.output_asset,
            output_url,
            executed: outcome.executed,
        }),
    ))
}

/// Derive from an asset. Failed derivations are reported in the body with
/// their failure kind; only request and infrastructure errors are HTTP errors.
pub async fn create_derivation(
    State(state): State<AppState>,
    Path(asset_id): Path<Uuid>,
    Json(payload): Json<CreateDerivationRequest>,
) -> ApiResult<(StatusCode, Json<DerivationResponse>)> {
    let operation: Operation = payload.operation.parse()?;
    let parameters = state.ctx.parameters(operation, payload.parameters).await?;

    let mut options = state.ctx.derive_options();
    if let Some(secs) = payload.timeout_secs {
        if secs == 0 {
            return Err(LedgerError::Validation("timeoutSecs must be positive".to_string()).into());
        }
        // A worker must finish before its row can be judged stale
        let stale_after = state.ctx.config().stale_after.as_secs();
        if secs > stale_after {
            return Err(LedgerError::Validation(format!(
                "timeoutSecs must not exceed the staleness threshold of {}s",
                stale_after
            ))
            .into());
        }
        options.timeout = Duration::from_secs(secs);
    }
    match payload.policy {
        Some(PolicyName::ReturnPending) => options.pending_policy = PendingPolicy::ReturnPending,
        Some(PolicyName::ReattemptIfStale) => {
            let stale_after = payload
                .stale_after_secs
                .map(Duration::from_secs)
                .unwrap_or(state.ctx.config().stale_after);
            options.pending_policy = PendingPolicy::ReattemptIfStale { stale_after };
        }
        Some(PolicyName::Wait) | None => {}
    }

    let outcome = state
        .ctx
        .pipeline()
        .derive_by_id(asset_id, parameters, state.ctx.registry(), &options)
        .await?;
    respond(&state, outcome).await
}

pub async fn list_derivations(
    State(state): State<AppState>,
    Path(asset_id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<derivations::Model>>> {
    state.ctx.assets().get(asset_id).await?;
    let operation = query.operation.as_deref().map(str::parse::<Operation>).transpose()?;
    Ok(Json(
        state.ctx.derivations().list_derivations(asset_id, operation).await?,
    ))
}

pub async fn get_derivation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<DerivationResponse>)> {
    let derivation = state.ctx.derivations().get(id).await?;
    let output_asset = match derivation.output_asset_id {
        Some(asset_id) => state.ctx.assets().find(asset_id).await?,
        None => None,
    };
    let outcome = DeriveOutcome {
        stale_since: derivation.stale_since(chrono::Utc::now()),
        derivation,
        output_asset,
        executed: false,
    };
    respond(&state, outcome).await
}

/// Operator override: fail a pending derivation so the key can be retried
pub async fn fail_derivation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<FailRequest>,
) -> ApiResult<Json<derivations::Model>> {
    let reason = payload.reason.trim();
    if reason.is_empty() {
        return Err(LedgerError::Validation("reason is required".to_string()).into());
    }
    Ok(Json(
        state
            .ctx
            .derivations()
            .fail_derivation(id, FailureKind::Operator, reason)
            .await?,
    ))
}

pub async fn reconcile(
    State(state): State<AppState>,
    Query(query): Query<ReconcileQuery>,
) -> ApiResult<Json<ReconcileReport>> {
    let older_than = query
        .older_than_secs
        .map(Duration::from_secs)
        .unwrap_or(state.ctx.config().stale_after);
    Ok(Json(state.ctx.reconciler().run(older_than).await?))
}
