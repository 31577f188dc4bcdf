//! Message and envelope model for relaymq.
//!
//! This is the lowest layer of relaymq. It defines:
//! - [`Message`]: an opaque byte body plus an optional [`Properties`] bag
//! - [`Envelope`]: one delivered message with its delivery context
//! - [`Request`]/[`Response`]: RPC messages carrying an `{id, type, body}` document
//! - [`codec`]: JSON encode/decode of that document
//!
//! Nothing here touches the network.

pub mod codec;
pub mod document;
pub mod error;
pub mod message;
pub mod properties;

pub use codec::{decode, encode, CONTENT_TYPE_JSON};
pub use document::{
    Document, MessageKind, Request, Response, MESSAGE_TYPE_ERROR, MESSAGE_TYPE_REQUEST,
    MESSAGE_TYPE_RESPONSE,
};
pub use error::{CodecError, Result};
pub use message::{Envelope, Message};
pub use properties::{Properties, DELIVERY_MODE_PERSISTENT, DELIVERY_MODE_TRANSIENT};
