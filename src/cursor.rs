//! # Cursor Utilities
//!
//! Opaque keyset cursors for the task history listing. A cursor is the
//! base64 JSON of the last returned row's `(createdAt, id)`.

use axum::http::StatusCode;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

const MAX_CURSOR_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

fn invalid(message: &str) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message)
}

pub fn encode_cursor(created_at: DateTime<Utc>, id: Uuid) -> String {
    let json = serde_json::to_vec(&TaskCursor { created_at, id }).unwrap_or_default();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
}

pub fn decode_cursor(cursor: &str) -> Result<TaskCursor, ApiError> {
    if cursor.is_empty() {
        return Err(invalid("cursor cannot be empty"));
    }
    if cursor.len() > MAX_CURSOR_LEN {
        return Err(invalid("cursor is too long"));
    }
    if !cursor
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid("cursor contains invalid characters"));
    }

    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| invalid("cursor is not valid base64"))?;
    let data: TaskCursor =
        serde_json::from_slice(&decoded).map_err(|_| invalid("cursor contains invalid JSON structure"))?;

    if data.id.is_nil() {
        return Err(invalid("cursor contains invalid ID"));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trip() {
        let created_at = Utc::now();
        let id = Uuid::new_v4();
        let decoded = decode_cursor(&encode_cursor(created_at, id)).unwrap();
        assert_eq!(decoded.created_at, created_at);
        assert_eq!(decoded.id, id);
    }

    #[test]
    fn rejects_malformed_cursors() {
        assert!(decode_cursor("").unwrap_err().message.contains("cannot be empty"));
        assert!(decode_cursor(&"a".repeat(600)).unwrap_err().message.contains("too long"));
        assert!(decode_cursor("abc+/=").unwrap_err().message.contains("invalid characters"));
        let not_json = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"[1,2]");
        assert!(decode_cursor(&not_json).unwrap_err().message.contains("invalid JSON"));
    }

    #[test]
    fn rejects_nil_id() {
        let cursor = encode_cursor(Utc::now(), Uuid::nil());
        assert_eq!(decode_cursor(&cursor).unwrap_err().code, "VALIDATION_FAILED".into());
    }
}
