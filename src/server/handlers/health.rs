use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::{json, Value};

use crate::derivation::Operation;
use crate::server::app::AppState;

pub async fn health_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let operations: Vec<&str> = state.ctx.registry().operations().iter().map(Operation::as_str).collect();
    Ok(Json(json!({
        "status": "healthy",
        "service": "derivation-ledger",
        "version": env!("CARGO_PKG_VERSION"),
        "operations": operations,
    })))
}
