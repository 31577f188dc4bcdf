use relaymq_transport::{ProtocolError, SessionError, TransportError};

/// Errors that can occur in connection and channel operations.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The connection configuration is unusable.
    #[error("invalid connection configuration: {0}")]
    Configuration(String),

    /// The session failed underneath an operation.
    #[error("{context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: TransportError,
    },

    /// The broker rejected an operation.
    #[error("{context}: {source}")]
    Protocol {
        context: &'static str,
        #[source]
        source: ProtocolError,
    },

    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Every channel id up to the limit is in use.
    #[error("no free channel id (channel_max {0})")]
    ChannelLimit(u16),

    /// `consume` was called on a channel that is already consuming.
    #[error("channel {0} is already consuming")]
    AlreadyConsuming(u16),

    /// A background thread could not be started.
    #[error("failed to spawn {what} thread: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl MuxError {
    pub(crate) fn session(context: &'static str, err: SessionError) -> Self {
        match err {
            SessionError::Transport(source) => Self::Transport { context, source },
            SessionError::Protocol(source) => Self::Protocol { context, source },
        }
    }

    pub(crate) fn transport(context: &'static str, source: TransportError) -> Self {
        Self::Transport { context, source }
    }

    /// True when the connection itself is unusable (transport failure or closed).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::ConnectionClosed)
    }
}

pub type Result<T> = std::result::Result<T, MuxError>;

#[cfg(test)]
mod tests {
    use relaymq_transport::REPLY_NOT_FOUND;

    use super::*;

    #[test]
    fn context_prefixes_the_source() {
        let err = MuxError::session(
            "declaring queue",
            ProtocolError::Channel {
                code: REPLY_NOT_FOUND,
                text: "NOT_FOUND - no queue 'q'".to_string(),
            }
            .into(),
        );
        assert_eq!(
            err.to_string(),
            "declaring queue: server channel error 404, message: NOT_FOUND - no queue 'q'"
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn transport_failures_are_fatal() {
        let err = MuxError::session("publishing", TransportError::Closed.into());
        assert!(matches!(err, MuxError::Transport { .. }));
        assert!(err.is_fatal());
        assert!(MuxError::ConnectionClosed.is_fatal());
    }
}
