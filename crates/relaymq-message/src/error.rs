/// Errors that can occur while encoding or decoding RPC documents.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload is not a well-formed `{id, type, body}` JSON document.
    #[error("malformed document: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The payload is empty.
    #[error("empty document payload")]
    Empty,
}

pub type Result<T> = std::result::Result<T, CodecError>;
