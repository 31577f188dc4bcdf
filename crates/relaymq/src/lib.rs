//! Publish/subscribe and request/reply messaging over a multiplexed broker
//! connection.
//!
//! One connection carries many channels: a single lock serializes every
//! session call and a background dispatcher thread hands deliveries to the
//! channel they belong to. On top of that, [`broker::MessageBroker`] offers
//! fire-and-forget publish/subscribe and blocking RPC calls with timeouts.
//!
//! # Crate Structure
//!
//! - [`message`]: Messages, envelopes, properties and the RPC document codec
//! - [`transport`]: Broker session abstraction and the in-process loopback broker
//! - [`mux`]: Connection multiplexer and channels
//! - [`broker`]: Messaging facade and RPC (behind `broker` feature)

/// Re-export message types.
pub mod message {
    pub use relaymq_message::*;
}

/// Re-export transport types.
pub mod transport {
    pub use relaymq_transport::*;
}

/// Re-export connection and channel types.
pub mod mux {
    pub use relaymq_mux::*;
}

/// Re-export broker types (requires `broker` feature).
#[cfg(feature = "broker")]
pub mod broker {
    pub use relaymq_broker::*;
}
