use axum::{
    extract::{Path, State},
    response::Json,
};

use crate::database::entities::persons;
use crate::server::app::AppState;
use crate::server::error::ApiResult;
use crate::services::NewPerson;

pub async fn create_person(
    State(state): State<AppState>,
    Json(payload): Json<NewPerson>,
) -> ApiResult<Json<persons::Model>> {
    Ok(Json(state.ctx.persons().create(payload).await?))
}

pub async fn get_person(State(state): State<AppState>, Path(id): Path<i32>) -> ApiResult<Json<persons::Model>> {
    Ok(Json(state.ctx.persons().get(id).await?))
}

pub async fn list_persons(State(state): State<AppState>) -> ApiResult<Json<Vec<persons::Model>>> {
    Ok(Json(state.ctx.persons().list().await?))
}
