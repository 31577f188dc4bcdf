use bytes::Bytes;

use crate::properties::Properties;

/// An opaque payload plus its properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// Message body. Never interpreted by the transport.
    pub body: Bytes,
    /// Basic-class properties.
    pub properties: Properties,
}

impl Message {
    /// Create a message with empty properties.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            properties: Properties::default(),
        }
    }

    /// Create a message with explicit properties.
    pub fn with_properties(body: impl Into<Bytes>, properties: Properties) -> Self {
        Self {
            body: body.into(),
            properties,
        }
    }

    /// The body as UTF-8 text, if it is valid UTF-8.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// One delivered message plus its delivery context.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Channel the delivery arrived on.
    pub channel: u16,
    /// The delivered message.
    pub message: Message,
    /// Tag of the consumer the broker delivered to.
    pub consumer_tag: String,
    /// Per-channel monotonic tag used for ack/nack.
    pub delivery_tag: u64,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// True if this message was delivered before and requeued.
    pub redelivered: bool,
}
