use std::fmt;
use std::time::Duration;

use percent_encoding::percent_decode_str;
use relaymq_transport::{DEFAULT_FRAME_MAX, FRAME_MIN_SIZE};
use url::{Host, Url};

use crate::error::{MuxError, Result};

/// Default broker port.
pub const DEFAULT_PORT: u16 = 5672;

/// Default upper bound for channel ids.
pub const DEFAULT_CHANNEL_MAX: u16 = 2047;

const URL_SCHEME: &str = "amqp";

/// Connection parameters.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    /// Sent at login. Never logged or printed by `Debug`.
    pub password: String,
    /// Requested frame size; 0 lets the broker choose.
    pub frame_max: u32,
    /// Highest channel id this connection hands out.
    pub channel_max: u16,
    /// How long one dispatcher poll may hold the connection lock.
    pub poll_interval: Duration,
    /// Dispatcher sleep while no channel is consuming.
    pub idle_interval: Duration,
    /// Upper bound of one inbox wait, so consume loops observe cancellation.
    pub consume_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            frame_max: DEFAULT_FRAME_MAX,
            channel_max: DEFAULT_CHANNEL_MAX,
            poll_interval: Duration::from_micros(100),
            idle_interval: Duration::from_millis(10),
            consume_interval: Duration::from_millis(50),
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("frame_max", &self.frame_max)
            .field("channel_max", &self.channel_max)
            .field("poll_interval", &self.poll_interval)
            .field("idle_interval", &self.idle_interval)
            .field("consume_interval", &self.consume_interval)
            .finish()
    }
}

impl ConnectionConfig {
    /// Defaults pointed at `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    pub fn with_channel_max(mut self, channel_max: u16) -> Self {
        self.channel_max = channel_max;
        self
    }

    /// Check the values before anything touches the network.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(MuxError::Configuration("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(MuxError::Configuration("port must not be 0".to_string()));
        }
        if self.vhost.is_empty() {
            return Err(MuxError::Configuration("vhost must not be empty".to_string()));
        }
        if self.channel_max == 0 {
            return Err(MuxError::Configuration(
                "channel_max must be at least 1".to_string(),
            ));
        }
        if self.frame_max != 0 && self.frame_max < FRAME_MIN_SIZE {
            return Err(MuxError::Configuration(format!(
                "frame_max must be 0 or at least {FRAME_MIN_SIZE}"
            )));
        }
        if self.consume_interval.is_zero() {
            return Err(MuxError::Configuration(
                "consume_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse `amqp://[user[:password]@]host[:port][/vhost]`.
    ///
    /// Missing parts keep their defaults. Credentials and the vhost are
    /// percent-decoded, so `%2f` names the `/` vhost.
    pub fn from_url(input: &str) -> Result<Self> {
        let url = Url::parse(input)
            .map_err(|err| MuxError::Configuration(format!("invalid url {input}: {err}")))?;
        if url.scheme() != URL_SCHEME {
            return Err(MuxError::Configuration(format!(
                "url scheme must be {URL_SCHEME}: {input}"
            )));
        }

        let mut config = Self::default();
        if !url.username().is_empty() {
            config.username = decode_component(url.username())?;
        }
        if let Some(password) = url.password() {
            config.password = decode_component(password)?;
        }
        match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => config.host = domain.to_string(),
            Some(Host::Ipv4(addr)) => config.host = addr.to_string(),
            Some(Host::Ipv6(addr)) => config.host = addr.to_string(),
            _ => {}
        }
        if let Some(port) = url.port() {
            config.port = port;
        }

        let vhost = url.path().strip_prefix('/').unwrap_or(url.path());
        if !vhost.is_empty() {
            config.vhost = decode_component(vhost)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn decode_component(raw: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| MuxError::Configuration(format!("url component is not UTF-8: {raw}")))
}
