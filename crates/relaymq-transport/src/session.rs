use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use relaymq_message::{Envelope, Message, Properties};

use crate::error::{Result, Status, TransportError};

/// Frame size negotiated when the caller asks for 0 (no preference).
pub const DEFAULT_FRAME_MAX: u32 = 131_072;

/// Smallest frame size a broker accepts.
pub const FRAME_MIN_SIZE: u32 = 4096;

/// Per-frame overhead: type (1) + channel (2) + size (4) + end marker (1).
pub const FRAME_OVERHEAD: usize = 8;

/// `"direct"` exchange type.
pub const EXCHANGE_TYPE_DIRECT: &str = "direct";
/// `"fanout"` exchange type.
pub const EXCHANGE_TYPE_FANOUT: &str = "fanout";
/// `"topic"` exchange type.
pub const EXCHANGE_TYPE_TOPIC: &str = "topic";

/// Routing behavior of an exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Route when the binding key equals the routing key.
    #[default]
    Direct,
    /// Route to every bound queue.
    Fanout,
    /// Route by dotted-word pattern (`*` one word, `#` zero or more).
    Topic,
}

impl ExchangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeKind::Direct => EXCHANGE_TYPE_DIRECT,
            ExchangeKind::Fanout => EXCHANGE_TYPE_FANOUT,
            ExchangeKind::Topic => EXCHANGE_TYPE_TOPIC,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An exchange type string that is not direct, fanout or topic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown exchange type '{0}'")]
pub struct UnknownExchangeKind(pub String);

impl FromStr for ExchangeKind {
    type Err = UnknownExchangeKind;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            EXCHANGE_TYPE_DIRECT => Ok(ExchangeKind::Direct),
            EXCHANGE_TYPE_FANOUT => Ok(ExchangeKind::Fanout),
            EXCHANGE_TYPE_TOPIC => Ok(ExchangeKind::Topic),
            other => Err(UnknownExchangeKind(other.to_string())),
        }
    }
}

/// Arguments of an exchange declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub name: String,
    pub kind: ExchangeKind,
    /// Only assert that the exchange exists; never create it.
    pub passive: bool,
    /// Survive a broker restart.
    pub durable: bool,
    /// Remove once the last binding is gone.
    pub auto_delete: bool,
    /// Reject direct publishes; only exchange-to-exchange bindings feed it.
    pub internal: bool,
}

impl ExchangeOptions {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            ..Self::default()
        }
    }
}

/// Arguments of a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Queue name. Empty asks the broker to generate one.
    pub name: String,
    /// Only assert that the queue exists; never create it.
    pub passive: bool,
    /// Survive a broker restart.
    pub durable: bool,
    /// Usable by the declaring connection only; deleted when it closes.
    pub exclusive: bool,
    /// Deleted once its last consumer is cancelled.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Options for an existing or to-be-created named queue.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Options for a broker-named, exclusive, auto-delete queue.
    pub fn private() -> Self {
        Self {
            exclusive: true,
            auto_delete: true,
            ..Self::default()
        }
    }
}

/// Arguments of a consumer registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Consumer tag. Empty asks the broker to generate one.
    pub consumer_tag: String,
    pub no_local: bool,
    /// Deliveries are considered acknowledged as soon as they are sent.
    pub no_ack: bool,
    /// Only this consumer may consume from the queue.
    pub exclusive: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            consumer_tag: String::new(),
            no_local: false,
            no_ack: true,
            exclusive: false,
        }
    }
}

/// `basic.deliver` method arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deliver {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// A method frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Deliver(Deliver),
    /// Any other method, by name.
    Other(String),
}

/// One inbound frame on a channel.
///
/// A delivery is a `Method(Deliver)` frame, then a `Header` frame, then
/// `Body` frames until `body_size` bytes have arrived.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Method(Method),
    Header { body_size: u64, properties: Properties },
    Body(Bytes),
}

impl Frame {
    /// Frame kind name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::Method(_) => "method",
            Frame::Header { .. } => "header",
            Frame::Body(_) => "body",
        }
    }
}

/// An authenticated conversation with a broker.
///
/// A session is not thread-safe by contract: callers must serialize every
/// call (relaymq does so behind the connection lock).
pub trait Session: Send {
    /// Authenticate. `frame_max` of 0 means no preference.
    fn login(
        &mut self,
        vhost: &str,
        username: &str,
        password: &str,
        frame_max: u32,
    ) -> std::result::Result<(), TransportError>;

    /// Frame size negotiated at login.
    fn frame_max(&self) -> u32;

    fn open_channel(&mut self, channel: u16) -> Result<()>;

    fn close_channel(&mut self, channel: u16) -> Result<()>;

    fn declare_exchange(&mut self, channel: u16, options: &ExchangeOptions) -> Result<()>;

    fn bind_exchange(
        &mut self,
        channel: u16,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<()>;

    fn unbind_exchange(
        &mut self,
        channel: u16,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<()>;

    /// Declare a queue and return its (possibly generated) name.
    fn declare_queue(&mut self, channel: u16, options: &QueueOptions) -> Result<String>;

    fn bind_queue(
        &mut self,
        channel: u16,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()>;

    fn unbind_queue(
        &mut self,
        channel: u16,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()>;

    /// Publish one message. Returns a raw status; negative is failure.
    fn publish(
        &mut self,
        channel: u16,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        mandatory: bool,
        immediate: bool,
    ) -> std::result::Result<Status, TransportError>;

    /// Register a consumer and return its tag.
    fn start_consume(
        &mut self,
        channel: u16,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<String>;

    fn cancel_consume(&mut self, channel: u16, consumer_tag: &str) -> Result<()>;

    /// Wait up to `timeout` for the next complete delivery addressed to one
    /// of `channels`. Frames for other channels stay buffered.
    fn poll_delivery(&mut self, channels: &[u16], timeout: Duration) -> Result<Option<Envelope>>;

    /// Wait up to `timeout` for the next raw frame on `channel`.
    fn wait_frame(&mut self, channel: u16, timeout: Duration) -> Result<Option<Frame>>;

    /// Drop every frame buffered for `channel` and return how many
    /// deliveries they carried. Sessions that buffer nothing return 0.
    fn discard(&mut self, _channel: u16) -> usize {
        0
    }

    fn ack(
        &mut self,
        channel: u16,
        delivery_tag: u64,
        multiple: bool,
    ) -> std::result::Result<Status, TransportError>;

    fn nack(
        &mut self,
        channel: u16,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> std::result::Result<Status, TransportError>;

    fn qos(
        &mut self,
        channel: u16,
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    ) -> Result<()>;

    /// Give back buffers held for already-consumed frames.
    fn release_buffers(&mut self) {}

    /// Close the connection. Further calls fail with [`TransportError::Closed`].
    fn close(&mut self) -> std::result::Result<(), TransportError>;
}

/// Opens sessions to a broker.
pub trait Connector: Send + Sync {
    fn open(&self, host: &str, port: u16)
        -> std::result::Result<Box<dyn Session>, TransportError>;
}
