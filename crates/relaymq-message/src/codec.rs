use bytes::Bytes;

use crate::document::Document;
use crate::error::{CodecError, Result};

/// Content type used for every encoded document.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Encode a document as compact JSON.
///
/// Wire format:
/// ```text
/// {"id": <u64>, "type": "request" | "response" | "error", "body": <any JSON>}
/// ```
pub fn encode(document: &Document) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(document)?))
}

/// Decode a document.
///
/// A missing `body` decodes as `null`; a missing `id` or `type`, or an
/// unknown type tag, is malformed.
pub fn decode(payload: &[u8]) -> Result<Document> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(CodecError::Empty);
    }
    Ok(serde_json::from_slice(payload)?)
}
