use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::entities::assets;
use crate::errors::LedgerError;
use crate::server::app::AppState;
use crate::server::error::ApiResult;
use crate::transforms::http::decode_data_uri;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAssetRequest {
    #[serde(alias = "owner_id")]
    pub owner_id: i32,
    #[serde(default, alias = "content_type")]
    pub content_type: Option<String>,
    /// Base64 payload or a `data:` URI
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct UrlQuery {
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrlResponse {
    pub asset_id: Uuid,
    pub url: String,
    pub expires_in_secs: u64,
}

fn decode_upload(payload: &UploadAssetRequest) -> Result<(Bytes, String), LedgerError> {
    let (bytes, embedded_type) = match decode_data_uri(&payload.data) {
        Some(decoded) => {
            let fetched = decoded?;
            (fetched.bytes, fetched.content_type)
        }
        None => {
            let bytes = STANDARD
                .decode(payload.data.trim())
                .map_err(|err| LedgerError::Validation(format!("data is not valid base64: {}", err)))?;
            (Bytes::from(bytes), None)
        }
    };

    let content_type = payload
        .content_type
        .clone()
        .or(embedded_type)
        .or_else(|| {
            image::guess_format(&bytes)
                .ok()
                .map(|format| format.to_mime_type().to_string())
        })
        .ok_or_else(|| LedgerError::Validation("content type is missing and could not be detected".to_string()))?;
    Ok((bytes, content_type))
}

pub async fn upload_asset(
    State(state): State<AppState>,
    Json(payload): Json<UploadAssetRequest>,
) -> ApiResult<Json<assets::Model>> {
    let (bytes, content_type) = decode_upload(&payload)?;
    let asset = state
        .ctx
        .assets()
        .upload(payload.owner_id, bytes, &content_type)
        .await?;
    Ok(Json(asset))
}

pub async fn get_asset(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<assets::Model>> {
    Ok(Json(state.ctx.assets().get(id).await?))
}

pub async fn get_asset_url(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<UrlQuery>,
) -> ApiResult<Json<SignedUrlResponse>> {
    let ttl = query
        .ttl_secs
        .map(Duration::from_secs)
        .unwrap_or(state.ctx.config().preview_url_ttl);
    if ttl.is_zero() {
        return Err(LedgerError::Validation("ttl_secs must be positive".to_string()).into());
    }

    let url = state.ctx.assets().signed_url(id, ttl).await?;
    Ok(Json(SignedUrlResponse {
        asset_id: id,
        url,
        expires_in_secs: ttl.as_secs(),
    }))
}

pub async fn list_owner_assets(
    State(state): State<AppState>,
    Path(owner_id): Path<i32>,
) -> ApiResult<Json<Vec<assets::Model>>> {
    state.ctx.persons().get(owner_id).await?;
    Ok(Json(state.ctx.assets().list_for_owner(owner_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_data_uri_upload() {
        let payload = UploadAssetRequest {
            owner_id: 1,
            content_type: None,
            data: "data:image/png;base64,aGVsbG8=".to_string(),
        };
        let (bytes, content_type) = decode_upload(&payload).unwrap();
        assert_eq!(&bytes[..], b"hello");
        assert_eq!(content_type, "image/png");
    }

    #[test]
    fn test_plain_base64_needs_a_type() {
        let payload = UploadAssetRequest {
            owner_id: 1,
            content_type: None,
            data: STANDARD.encode(b"not an image"),
        };
        assert!(matches!(decode_upload(&payload), Err(LedgerError::Validation(_))));
    }
}
