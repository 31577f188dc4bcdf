use relaymq_message::CodecError;
use relaymq_mux::MuxError;

/// Errors that can occur in broker-level operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// A connection or channel operation failed.
    #[error(transparent)]
    Mux(#[from] MuxError),

    /// An RPC document could not be encoded or decoded.
    #[error("rpc document: {0}")]
    Codec(#[from] CodecError),

    /// The [`Configuration`](crate::Configuration) is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A worker thread could not be started.
    #[error("failed to spawn {what} thread: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A worker or blocking task panicked.
    #[error("worker panicked: {0}")]
    Panicked(String),
}

impl BrokerError {
    /// True when the underlying connection is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Mux(err) if err.is_fatal())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mux_errors_pass_through_display() {
        let err = BrokerError::from(MuxError::ChannelLimit(4));
        assert_eq!(err.to_string(), "no free channel id (channel_max 4)");
        assert!(!err.is_fatal());
        assert!(BrokerError::from(MuxError::ConnectionClosed).is_fatal());
    }

    #[test]
    fn codec_errors_are_not_fatal() {
        let err = BrokerError::from(CodecError::Empty);
        assert!(err.to_string().starts_with("rpc document:"));
        assert!(!err.is_fatal());
    }
}
