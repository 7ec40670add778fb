use axum::{
    extract::{Path, State},
    response::Json,
};
use uuid::Uuid;

use crate::database::entities::training_runs;
use crate::server::app::AppState;
use crate::server::error::ApiResult;
use crate::services::TrainingRequest;

/// Runs to completion before responding; a failed run is returned with its reason
pub async fn create_training_run(
    State(state): State<AppState>,
    Json(payload): Json<TrainingRequest>,
) -> ApiResult<Json<training_runs::Model>> {
    Ok(Json(state.ctx.training().train(payload).await?))
}

pub async fn get_training_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<training_runs::Model>> {
    Ok(Json(state.ctx.training().get(id).await?))
}
