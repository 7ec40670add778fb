//! Derivation vocabulary: operations, their canonical parameters, lifecycle
//! states and the idempotency key.
//!
//! The idempotency key is the hex SHA-256 of a canonical JSON document
//! `{"operation": .., "parameters": .., "source": ..}` where object keys are
//! sorted at every level and no whitespace is emitted. Parameters are
//! normalized first, so `{"w": 100}` and `{"width": 100}` collide, as do
//! rotations of `-90` and `270` degrees.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::errors::{LedgerError, LedgerResult};

pub const DEFAULT_CAPTION_MODEL: &str = "claude-3-haiku-20240307";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Crop,
    Rotate,
    RemoveBackground,
    Caption,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Crop,
        Operation::Rotate,
        Operation::RemoveBackground,
        Operation::Caption,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Crop => "crop",
            Operation::Rotate => "rotate",
            Operation::RemoveBackground => "remove_background",
            Operation::Caption => "caption",
        }
    }

    /// Captions are recorded as text on the derivation instead of a new asset
    pub fn produces_text(&self) -> bool {
        matches!(self, Operation::Caption)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| LedgerError::Validation(format!("Unknown operation '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivationStatus {
    Pending,
    Complete,
    Failed,
}

impl DerivationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DerivationStatus::Pending => "pending",
            DerivationStatus::Complete => "complete",
            DerivationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DerivationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DerivationStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DerivationStatus::Pending),
            "complete" => Ok(DerivationStatus::Complete),
            "failed" => Ok(DerivationStatus::Failed),
            other => Err(LedgerError::InvalidState(format!(
                "Unknown derivation status '{}'",
                other
            ))),
        }
    }
}

/// Why a derivation ended up `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Transform,
    Storage,
    Timeout,
    /// Stale pending row closed by reconciliation or superseded by a reattempt
    Expired,
    /// Failed explicitly by an operator
    Operator,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transform => "transform",
            FailureKind::Storage => "storage",
            FailureKind::Timeout => "timeout",
            FailureKind::Expired => "expired",
            FailureKind::Operator => "operator",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    #[serde(alias = "w")]
    pub width: u32,
    #[serde(alias = "h")]
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rotation {
    pub degrees: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundProvider {
    #[default]
    Fal,
    Replicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackgroundRemoval {
    #[serde(default)]
    pub provider: BackgroundProvider,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptionRequest {
    #[serde(alias = "personId")]
    pub person_id: i32,
    #[serde(default = "default_caption_model")]
    pub model: String,
    /// Caption prefix the person's metadata gives at request time. Part of the
    /// key, so edited metadata or a birthday produces a fresh caption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

fn default_caption_model() -> String {
    DEFAULT_CAPTION_MODEL.to_string()
}

/// Typed parameters for each operation
#[derive(Debug, Clone, PartialEq)]
pub enum OperationParameters {
    Crop(CropRect),
    Rotate(Rotation),
    RemoveBackground(BackgroundRemoval),
    Caption(CaptionRequest),
}

impl OperationParameters {
    pub fn operation(&self) -> Operation {
        match self {
            OperationParameters::Crop(_) => Operation::Crop,
            OperationParameters::Rotate(_) => Operation::Rotate,
            OperationParameters::RemoveBackground(_) => Operation::RemoveBackground,
            OperationParameters::Caption(_) => Operation::Caption,
        }
    }

    /// Parse untyped JSON parameters for `operation`
    pub fn from_value(operation: Operation, value: Value) -> LedgerResult<Self> {
        let value = if value.is_null() { json!({}) } else { value };
        let invalid =
            |err: serde_json::Error| LedgerError::Validation(format!("Invalid {} parameters: {}", operation, err));

        let parameters = match operation {
            Operation::Crop => OperationParameters::Crop(serde_json::from_value(value).map_err(invalid)?),
            Operation::Rotate => OperationParameters::Rotate(serde_json::from_value(value).map_err(invalid)?),
            Operation::RemoveBackground => {
                OperationParameters::RemoveBackground(serde_json::from_value(value).map_err(invalid)?)
            }
            Operation::Caption => {
                OperationParameters::Caption(serde_json::from_value(value).map_err(invalid)?)
            }
        };
        Ok(parameters)
    }

    /// Validate and normalize so that equivalent requests share one key
    pub fn canonicalize(self) -> LedgerResult<Self> {
        match self {
            OperationParameters::Crop(rect) => {
                if rect.width == 0 || rect.height == 0 {
                    return Err(LedgerError::Validation(
                        "Crop rectangle must have a non-zero width and height".to_string(),
                    ));
                }
                Ok(OperationParameters::Crop(rect))
            }
            OperationParameters::Rotate(rotation) => {
                let degrees = rotation.degrees.rem_euclid(360);
                if degrees % 90 != 0 {
                    return Err(LedgerError::Validation(format!(
                        "Rotation must be a multiple of 90 degrees, got {}",
                        rotation.degrees
                    )));
                }
                Ok(OperationParameters::Rotate(Rotation { degrees }))
            }
            OperationParameters::Caption(request) => {
                let model = request.model.trim().to_string();
                if model.is_empty() {
                    return Err(LedgerError::Validation(
                        "Caption model must not be empty".to_string(),
                    ));
                }
                Ok(OperationParameters::Caption(CaptionRequest {
                    person_id: request.person_id,
                    model,
                    subject: request.subject,
                }))
            }
            other => Ok(other),
        }
    }

    pub fn to_value(&self) -> Value {
        let value = match self {
            OperationParameters::Crop(rect) => serde_json::to_value(rect),
            OperationParameters::Rotate(rotation) => serde_json::to_value(rotation),
            OperationParameters::RemoveBackground(removal) => serde_json::to_value(removal),
            OperationParameters::Caption(request) => serde_json::to_value(request),
        };
        // Plain structs of integers and strings always serialize
        value.unwrap_or(Value::Null)
    }

    pub fn to_canonical_json(&self) -> String {
        canonical_json(&self.to_value())
    }
}

/// Serialize `value` with object keys sorted at every depth and no whitespace
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Deterministic key for a (source, operation, parameters) triple
pub fn idempotency_key(source_asset_id: Uuid, parameters: &OperationParameters) -> LedgerResult<String> {
    let canonical = parameters.clone().canonicalize()?;
    let document = json!({
        "source": source_asset_id.to_string(),
        "operation": canonical.operation().as_str(),
        "parameters": canonical.to_value(),
    });
    let digest = Sha256::digest(canonical_json(&document).as_bytes());
    Ok(hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> Uuid {
        Uuid::parse_str("6f1c1f5e-52c1-4c43-9a57-3bfa2f0f7d11").unwrap()
    }

    #[test]
    fn test_key_ignores_parameter_order() {
        let a: Value = serde_json::from_str(r#"{"x":10,"y":10,"w":100,"h":100}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"h":100,"w":100,"y":10,"x":10}"#).unwrap();

        let a = OperationParameters::from_value(Operation::Crop, a).unwrap();
        let b = OperationParameters::from_value(Operation::Crop, b).unwrap();

        let key_a = idempotency_key(source(), &a).unwrap();
        assert_eq!(key_a, idempotency_key(source(), &a).unwrap());
        assert_eq!(key_a, idempotency_key(source(), &b).unwrap());
        assert_eq!(key_a.len(), 64);
    }

    #[test]
    fn test_key_accepts_long_field_names() {
        let short = OperationParameters::from_value(
            Operation::Crop,
            json!({"x": 0, "y": 0, "w": 50, "h": 50}),
        )
        .unwrap();
        let long = OperationParameters::from_value(
            Operation::Crop,
            json!({"x": 0, "y": 0, "width": 50, "height": 50}),
        )
        .unwrap();
        assert_eq!(
            idempotency_key(source(), &short).unwrap(),
            idempotency_key(source(), &long).unwrap()
        );
    }

    #[test]
    fn test_key_varies_with_source_and_parameters() {
        let crop = OperationParameters::Crop(CropRect { x: 0, y: 0, width: 50, height: 50 });
        let other_crop = OperationParameters::Crop(CropRect { x: 1, y: 0, width: 50, height: 50 });

        let base = idempotency_key(source(), &crop).unwrap();
        assert_ne!(base, idempotency_key(Uuid::new_v4(), &crop).unwrap());
        assert_ne!(base, idempotency_key(source(), &other_crop).unwrap());
    }

    #[test]
    fn test_rotation_is_normalized() {
        let negative = OperationParameters::Rotate(Rotation { degrees: -90 });
        let positive = OperationParameters::Rotate(Rotation { degrees: 270 });
        assert_eq!(
            negative.clone().canonicalize().unwrap(),
            OperationParameters::Rotate(Rotation { degrees: 270 })
        );
        assert_eq!(
            idempotency_key(source(), &negative).unwrap(),
            idempotency_key(source(), &positive).unwrap()
        );
    }

    #[test]
    fn test_rotation_rejects_arbitrary_angles() {
        let err = OperationParameters::Rotate(Rotation { degrees: 45 })
            .canonicalize()
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_FAILED");
    }

    #[test]
    fn test_empty_crop_rejected() {
        let err = OperationParameters::Crop(CropRect { x: 0, y: 0, width: 0, height: 10 })
            .canonicalize()
            .unwrap_err();
        assert!(err.to_string().contains("non-zero"));
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let err = OperationParameters::from_value(Operation::Rotate, json!({"degrees": 90, "speed": 2}))
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_FAILED");
    }

    #[test]
    fn test_remove_background_defaults_to_fal() {
        let params = OperationParameters::from_value(Operation::RemoveBackground, Value::Null).unwrap();
        assert_eq!(
            params,
            OperationParameters::RemoveBackground(BackgroundRemoval {
                provider: BackgroundProvider::Fal
            })
        );
        assert_eq!(params.to_canonical_json(), r#"{"provider":"fal"}"#);
    }

    #[test]
    fn test_caption_defaults_model() {
        let params = OperationParameters::from_value(Operation::Caption, json!({"personId": 3})).unwrap();
        assert_eq!(
            params.to_canonical_json(),
            r#"{"model":"claude-3-haiku-20240307","person_id":3}"#
        );
    }

    #[test]
    fn test_canonical_json_sorts_nested_objects() {
        let value = json!({"b": [{"z": 1, "a": 2}], "a": "x"});
        assert_eq!(canonical_json(&value), r#"{"a":"x","b":[{"a":2,"z":1}]}"#);
    }

    #[test]
    fn test_operation_round_trips_through_str() {
        for op in Operation::ALL {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
        assert!("sharpen".parse::<Operation>().is_err());
    }
}
