use std::fmt;
use std::io;

use relaymq_broker::BrokerError;
use relaymq_mux::MuxError;
use relaymq_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Io(source) => io_error(context, source),
        TransportError::Login(_) | TransportError::NotAuthenticated => {
            CliError::new(PERMISSION_DENIED, format!("{context}: {err}"))
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn mux_error(context: &str, err: MuxError) -> CliError {
    match err {
        MuxError::Transport {
            context: operation,
            source,
        } => transport_error(&format!("{context}: {operation}"), source),
        MuxError::Configuration(_) => CliError::new(USAGE, format!("{context}: {err}")),
        MuxError::Protocol { .. } | MuxError::ConnectionClosed => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn broker_error(context: &str, err: BrokerError) -> CliError {
    match err {
        BrokerError::Mux(err) => mux_error(context, err),
        BrokerError::Codec(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        BrokerError::InvalidConfiguration(_) => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use relaymq_message::CodecError;

    use super::*;

    #[test]
    fn login_refusal_maps_to_permission_denied() {
        let err = broker_error(
            "connecting",
            BrokerError::Mux(MuxError::Transport {
                context: "logging in",
                source: TransportError::Login("ACCESS_REFUSED".to_string()),
            }),
        );
        assert_eq!(err.code, PERMISSION_DENIED);
        assert!(err.message.starts_with("connecting: logging in:"));
    }

    #[test]
    fn refused_connect_maps_to_transport_error() {
        let err = mux_error(
            "connecting",
            MuxError::Transport {
                context: "opening connection",
                source: TransportError::Connect {
                    host: "localhost".to_string(),
                    port: 5672,
                    reason: "connection refused".to_string(),
                },
            },
        );
        assert_eq!(err.code, TRANSPORT_ERROR);
    }

    #[test]
    fn bad_configuration_is_usage() {
        let err = mux_error("connecting", MuxError::Configuration("empty host".to_string()));
        assert_eq!(err.code, USAGE);
        let err = broker_error("serving", BrokerError::InvalidConfiguration("x".to_string()));
        assert_eq!(err.code, USAGE);
    }

    #[test]
    fn undecodable_reply_is_data_invalid() {
        let err = broker_error("calling", BrokerError::Codec(CodecError::Empty));
        assert_eq!(err.code, DATA_INVALID);
    }

    #[test]
    fn io_timeouts_map_to_timeout() {
        let err = transport_error(
            "reading",
            TransportError::Io(io::Error::new(io::ErrorKind::TimedOut, "slow")),
        );
        assert_eq!(err.code, TIMEOUT);
    }
}
