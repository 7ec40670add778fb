use axum::{
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::errors::StorageError;
use crate::server::app::AppState;
use crate::server::error::ApiResult;
use crate::storage::content_type_for_key;

#[derive(Debug, Deserialize)]
pub struct SignatureQuery {
    pub expires: Option<i64>,
    pub signature: Option<String>,
}

/// Serve an object named by a signed URL from `signed_read_url`
pub async fn get_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<SignatureQuery>,
) -> ApiResult<Response> {
    let (Some(expires), Some(signature)) = (query.expires, query.signature) else {
        return Err(StorageError::SignatureRejected("missing expires or signature".to_string()).into());
    };

    let backend = state.ctx.store().backend();
    if bucket != backend.bucket() {
        return Err(StorageError::NotFound(format!("{}/{}", bucket, key)).into());
    }
    backend.verify_signed_read(&key, expires, &signature)?;

    let bytes = backend.get(&key).await?;
    Ok(([(header::CONTENT_TYPE, content_type_for_key(&key))], bytes).into_response())
}
