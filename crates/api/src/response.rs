//! Response envelope and result codes.

use axum::Json;
use serde::Serialize;
use serde_json::Value;

use mqmesh_storage::StorageError;

/// Result codes carried in the envelope's `message` field.
pub mod code {
    pub const SUCCESS: u16 = 1000;
    pub const BAD_REQUEST: u16 = 1001;
    pub const SERVER_ERROR: u16 = 1002;
    pub const DEVICE_NOT_FOUND: u16 = 1003;
    pub const MESSAGE_TOO_LARGE: u16 = 1004;
    pub const RATE_LIMITED: u16 = 1005;
    pub const FORBIDDEN_GROUP: u16 = 1006;
    pub const NOT_HTTP_MODE: u16 = 1007;
    pub const UNAUTHORIZED: u16 = 1008;
}

/// The uniform response body.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub message: u16,
    pub detail: Value,
}

/// Success with a serializable detail.
pub fn ok<T: Serialize>(detail: T) -> Json<Envelope> {
    Json(Envelope {
        message: code::SUCCESS,
        detail: serde_json::to_value(detail).unwrap_or(Value::Null),
    })
}

/// Failure with a code and a short description.
pub fn err(message: u16, detail: &str) -> Json<Envelope> {
    Json(Envelope {
        message,
        detail: Value::String(detail.to_string()),
    })
}

/// Map a store failure onto the envelope codes: constraint clashes are the
/// caller's fault, everything else is ours.
pub fn storage_err(e: StorageError) -> Json<Envelope> {
    match e {
        StorageError::UniqueViolation(_) => err(code::BAD_REQUEST, "already exists"),
        StorageError::NotFound(what) => {
            tracing::debug!("not found: {what}");
            err(code::BAD_REQUEST, "not found")
        }
        other => {
            tracing::error!("store error: {other}");
            err(code::SERVER_ERROR, "internal error")
        }
    }
}
