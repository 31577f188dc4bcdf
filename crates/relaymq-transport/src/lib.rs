//! Broker session abstraction.
//!
//! Provides the seam between relaymq and a broker protocol engine:
//! - [`Connector`] opens a [`Session`] to a host/port
//! - [`Session`] exposes frame-level primitives (declare, bind, publish,
//!   consume, poll, ack/nack, qos)
//! - [`loopback::MemoryBroker`] implements both in-process
//!
//! This is the lowest layer that performs I/O. Everything above it builds on
//! the [`Session`] trait.

pub mod error;
pub mod loopback;
pub mod session;

pub use error::{
    status_text, ProtocolError, Result, SessionError, Status, TransportError, REPLY_ACCESS_REFUSED,
    REPLY_CHANNEL_ERROR, REPLY_COMMAND_INVALID, REPLY_NOT_ALLOWED, REPLY_NOT_FOUND,
    REPLY_NOT_IMPLEMENTED, REPLY_PRECONDITION_FAILED, REPLY_RESOURCE_LOCKED,
    STATUS_ACCESS_REFUSED, STATUS_CHANNEL_CLOSED, STATUS_NOT_FOUND, STATUS_NOT_IMPLEMENTED,
    STATUS_OK, STATUS_UNKNOWN_DELIVERY_TAG,
};
pub use loopback::{MemoryBroker, MemorySession, DEFAULT_PASSWORD, DEFAULT_USER, DEFAULT_VHOST};
pub use session::{
    ConsumeOptions, Connector, Deliver, ExchangeKind, ExchangeOptions, Frame, Method,
    QueueOptions, Session, UnknownExchangeKind, DEFAULT_FRAME_MAX, EXCHANGE_TYPE_DIRECT,
    EXCHANGE_TYPE_FANOUT, EXCHANGE_TYPE_TOPIC, FRAME_MIN_SIZE, FRAME_OVERHEAD,
};
