/// Raw status code returned by fire-and-forget session operations
/// (publish, ack, nack). Negative values are failures.
pub type Status = i32;

pub const STATUS_OK: Status = 0;
/// The channel is not open on this session.
pub const STATUS_CHANNEL_CLOSED: Status = -1;
/// The target exchange does not exist.
pub const STATUS_NOT_FOUND: Status = -2;
/// The delivery tag is not outstanding on this channel.
pub const STATUS_UNKNOWN_DELIVERY_TAG: Status = -3;
/// The operation is not permitted (e.g. publishing to an internal exchange).
pub const STATUS_ACCESS_REFUSED: Status = -4;
/// The requested flag is not supported (e.g. `immediate`).
pub const STATUS_NOT_IMPLEMENTED: Status = -5;

// Reply codes carried by server channel/connection exceptions.
pub const REPLY_ACCESS_REFUSED: u16 = 403;
pub const REPLY_NOT_FOUND: u16 = 404;
pub const REPLY_RESOURCE_LOCKED: u16 = 405;
pub const REPLY_PRECONDITION_FAILED: u16 = 406;
pub const REPLY_COMMAND_INVALID: u16 = 503;
pub const REPLY_CHANNEL_ERROR: u16 = 504;
pub const REPLY_NOT_ALLOWED: u16 = 530;
pub const REPLY_NOT_IMPLEMENTED: u16 = 540;

/// Human-readable description of a status code.
pub fn status_text(status: Status) -> &'static str {
    match status {
        STATUS_OK => "ok",
        STATUS_CHANNEL_CLOSED => "channel not open",
        STATUS_NOT_FOUND => "exchange not found",
        STATUS_UNKNOWN_DELIVERY_TAG => "unknown delivery tag",
        STATUS_ACCESS_REFUSED => "access refused",
        STATUS_NOT_IMPLEMENTED => "not implemented",
        s if s > 0 => "ok",
        _ => "unknown failure",
    }
}

/// Socket-level and session-level failures. The session is unusable afterwards.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to establish the connection.
    #[error("failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    /// The broker refused the login.
    #[error("login refused: {0}")]
    Login(String),

    /// An operation was attempted before a successful login.
    #[error("session not authenticated")]
    NotAuthenticated,

    /// The connection dropped underneath the session.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The session has been closed.
    #[error("session closed")]
    Closed,

    /// An I/O error occurred on the underlying stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// `std::io::Error` is not `Clone`; copies keep its kind and message.
impl Clone for TransportError {
    fn clone(&self) -> Self {
        match self {
            Self::Connect { host, port, reason } => Self::Connect {
                host: host.clone(),
                port: *port,
                reason: reason.clone(),
            },
            Self::Login(reason) => Self::Login(reason.clone()),
            Self::NotAuthenticated => Self::NotAuthenticated,
            Self::ConnectionLost(reason) => Self::ConnectionLost(reason.clone()),
            Self::Closed => Self::Closed,
            Self::Io(err) => Self::Io(std::io::Error::new(err.kind(), err.to_string())),
        }
    }
}

/// The broker rejected an operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Server channel exception.
    #[error("server channel error {code}, message: {text}")]
    Channel { code: u16, text: String },

    /// Server connection exception.
    #[error("server connection error {code}, message: {text}")]
    Connection { code: u16, text: String },

    /// A fire-and-forget operation returned a negative status.
    #[error("status {code} ({})", status_text(*code))]
    Status { code: Status },

    /// A frame of the wrong kind arrived while assembling a delivery.
    #[error("unexpected {found} frame (expected {expected})")]
    UnexpectedFrame {
        expected: &'static str,
        found: &'static str,
    },
}

impl ProtocolError {
    pub(crate) fn channel(code: u16, text: impl Into<String>) -> Self {
        Self::Channel {
            code,
            text: text.into(),
        }
    }

    pub(crate) fn connection(code: u16, text: impl Into<String>) -> Self {
        Self::Connection {
            code,
            text: text.into(),
        }
    }

    /// Reply code, if the error came from a server exception.
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            Self::Channel { code, .. } | Self::Connection { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Either kind of failure a session operation can produce.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_covers_known_codes() {
        assert_eq!(status_text(STATUS_OK), "ok");
        assert_eq!(status_text(STATUS_UNKNOWN_DELIVERY_TAG), "unknown delivery tag");
        assert_eq!(status_text(-99), "unknown failure");
    }

    #[test]
    fn protocol_error_display_includes_code_and_text() {
        let err = ProtocolError::channel(REPLY_NOT_FOUND, "NOT_FOUND - no queue 'q'");
        assert_eq!(
            err.to_string(),
            "server channel error 404, message: NOT_FOUND - no queue 'q'"
        );
        assert_eq!(err.reply_code(), Some(404));

        let status = ProtocolError::Status {
            code: STATUS_CHANNEL_CLOSED,
        };
        assert_eq!(status.to_string(), "status -1 (channel not open)");
        assert_eq!(status.reply_code(), None);
    }

    #[test]
    fn session_error_is_transparent() {
        let err: SessionError = TransportError::Closed.into();
        assert_eq!(err.to_string(), "session closed");
    }
}
