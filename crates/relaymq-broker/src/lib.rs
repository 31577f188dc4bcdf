//! Messaging facade for relaymq.
//!
//! [`MessageBroker`] owns one multiplexed connection and offers two
//! patterns on top of it:
//! - fire-and-forget: [`MessageBroker::publish`] and [`MessageBroker::subscribe`]
//! - request/reply: [`MessageBroker::call`] and [`MessageBroker::serve`]
//!
//! What to declare and bind before each operation is described by a
//! [`Configuration`], which can be loaded from JSON.

#[cfg(feature = "async")]
pub mod asynchronous;
pub mod broker;
pub mod config;
pub mod error;
pub mod rpc;

#[cfg(feature = "async")]
pub use asynchronous::AsyncMessageBroker;
pub use broker::{MessageBroker, SubscriptionHandle};
pub use config::{Configuration, ExchangeConfig, QueueConfig};
pub use error::{BrokerError, Result};
pub use rpc::{Delivery, Progress, Reassembly, ReassemblyError, RequestHandler};
