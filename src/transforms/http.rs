//! Fetching transform results: remote URLs and inline `data:` URIs

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use tracing::debug;

use crate::errors::{TransformError, TransformResult};

/// Bytes plus the content type reported by the source, if any
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

pub fn to_data_uri(content_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", content_type, STANDARD.encode(bytes))
}

/// Decode a base64 `data:` URI; None when `uri` is not a data URI
pub fn decode_data_uri(uri: &str) -> Option<TransformResult<Fetched>> {
    let rest = uri.strip_prefix("data:")?;
    Some(parse_data_uri(rest))
}

fn parse_data_uri(rest: &str) -> TransformResult<Fetched> {
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| TransformError::InvalidInput("data URI has no payload".to_string()))?;

    let Some(media_type) = meta.strip_suffix(";base64") else {
        return Err(TransformError::InvalidInput(
            "only base64 data URIs are supported".to_string(),
        ));
    };

    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|err| TransformError::InvalidInput(format!("invalid base64 payload: {}", err)))?;

    Ok(Fetched {
        bytes: Bytes::from(bytes),
        content_type: (!media_type.is_empty()).then(|| media_type.to_string()),
    })
}

/// GET `url`, or decode it locally when it is a data URI
pub async fn fetch(client: &reqwest::Client, url: &str) -> TransformResult<Fetched> {
    if let Some(decoded) = decode_data_uri(url) {
        return decoded;
    }

    debug!("Downloading transform output from {}", url);
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(TransformError::service(
            "download",
            format!("GET {} returned {}", url, status),
        ));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());
    let bytes = response.bytes().await?;

    Ok(Fetched { bytes, content_type })
}

/// Read a JSON body, turning non-2xx statuses into `TransformError::Service`
pub async fn read_json(service: &str, response: reqwest::Response) -> TransformResult<serde_json::Value> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(TransformError::service(service, format!("{}: {}", status, text)));
    }
    serde_json::from_str(&text).map_err(|err| TransformError::malformed(service, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_uri_round_trip() {
        let uri = to_data_uri("image/png", b"\x89PNG");
        let fetched = decode_data_uri(&uri).unwrap().unwrap();
        assert_eq!(fetched.bytes, Bytes::from_static(b"\x89PNG"));
        assert_eq!(fetched.content_type.as_deref(), Some("image/png"));
    }

    #[test]
    fn test_non_data_uri_is_ignored() {
        assert!(decode_data_uri("https://example.com/a.png").is_none());
    }

    #[test]
    fn test_plain_data_uri_rejected() {
        let err = decode_data_uri("data:text/plain,hello").unwrap().unwrap_err();
        assert!(err.is_input_error());
    }

    #[tokio::test]
    async fn test_fetch_decodes_data_uri_without_network() {
        let client = reqwest::Client::new();
        let fetched = fetch(&client, "data:;base64,aGk=").await.unwrap();
        assert_eq!(fetched.bytes, Bytes::from_static(b"hi"));
        assert_eq!(fetched.content_type, None);
    }
}
