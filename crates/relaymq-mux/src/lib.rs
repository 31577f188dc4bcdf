//! Connection multiplexing for relaymq.
//!
//! One [`Connection`] owns one broker session behind a single lock and one
//! background dispatcher thread. Any number of [`Channel`]s share it: each
//! outbound operation takes the lock for one session call, and the
//! dispatcher moves inbound deliveries into the inbox of the channel they
//! are addressed to, where the channel's consume loop picks them up on its
//! own thread.

pub mod channel;
pub mod config;
pub mod connection;
mod dispatcher;
pub mod error;
mod ids;
mod inbox;

pub use channel::Channel;
pub use config::{ConnectionConfig, DEFAULT_CHANNEL_MAX, DEFAULT_PORT};
pub use connection::Connection;
pub use error::{MuxError, Result};
pub use tokio_util::sync::CancellationToken;
