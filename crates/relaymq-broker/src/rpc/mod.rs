//! Request/reply over queues.
//!
//! The client side publishes a request with a private `reply_to` queue and
//! a fresh correlation id, then reads raw frames from its channel and
//! reassembles them until the matching reply arrives. The server side is a
//! consume loop that answers each request through a [`RequestHandler`].

mod client;
mod reassembly;
mod server;

pub use client::call;
pub use reassembly::{Delivery, Progress, Reassembly, ReassemblyError};
pub use server::{serve, RequestHandler};
