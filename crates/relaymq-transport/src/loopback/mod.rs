//! In-process loopback broker.
//!
//! [`MemoryBroker`] speaks the [`Session`] contract without a socket: direct,
//! fanout and topic exchanges, exchange-to-exchange bindings, broker-named
//! exclusive and auto-delete queues, round-robin consumers with prefetch,
//! manual acknowledgement with requeue, and body frames split at the
//! negotiated frame size. It is what the test suites and demos connect to.
//!
//! Cloned handles share one broker.

mod routing;
mod state;

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use relaymq_message::{Envelope, Message};
use tracing::debug;

use crate::error::{Result, Status, TransportError};
use crate::session::{
    ConsumeOptions, Connector, ExchangeOptions, Frame, QueueOptions, Session,
};
use state::BrokerState;

pub use state::{DEFAULT_PASSWORD, DEFAULT_USER, DEFAULT_VHOST};

struct Core {
    state: Mutex<BrokerState>,
    arrivals: Condvar,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to an in-process broker.
#[derive(Clone)]
pub struct MemoryBroker {
    core: Arc<Core>,
}

impl MemoryBroker {
    /// A broker with user `guest`/`guest` on vhost `/`.
    pub fn new() -> Self {
        Self {
            core: Arc::new(Core {
                state: Mutex::new(BrokerState::new()),
                arrivals: Condvar::new(),
            }),
        }
    }

    /// Accept an additional user.
    pub fn with_user(self, username: &str, password: &str) -> Self {
        self.core.lock().add_user(username, password);
        self
    }

    /// Serve `vhost` instead of `/`.
    pub fn with_vhost(self, vhost: &str) -> Self {
        self.core.lock().set_vhost(vhost);
        self
    }

    /// When false, new connection attempts are refused.
    pub fn set_reachable(&self, reachable: bool) {
        self.core.lock().reachable = reachable;
    }

    /// Drop every live session's connection.
    pub fn sever(&self) {
        self.core.lock().sever_all("connection reset by broker");
        self.core.arrivals.notify_all();
        debug!("loopback broker severed all sessions");
    }

    /// Messages waiting in `queue`, or `None` if it does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.core.lock().queue_depth(queue)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.core.lock().queue_exists(queue)
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.core.lock().exchange_exists(exchange)
    }

    /// Consumers on `queue`, or `None` if it does not exist.
    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.core.lock().consumer_count(queue)
    }

    /// Frames delivered to sessions but not read yet, over all sessions.
    pub fn buffered_frames(&self) -> usize {
        self.core.lock().buffered_frames()
    }

    /// Sessions that are open and connected.
    pub fn session_count(&self) -> usize {
        self.core.lock().session_count()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

impl Connector for MemoryBroker {
    fn open(&self, host: &str, port: u16) -> std::result::Result<Box<dyn Session>, TransportError> {
        let mut state = self.core.lock();
        if !state.reachable {
            return Err(TransportError::Connect {
                host: host.to_string(),
                port,
                reason: "connection refused".to_string(),
            });
        }
        let id = state.open_session();
        drop(state);

        debug!(host, port, session = id, "loopback session opened");
        Ok(Box::new(MemorySession {
            core: Arc::clone(&self.core),
            id,
            frame_max: 0,
            closed: false,
        }))
    }
}

/// One connection to a [`MemoryBroker`].
pub struct MemorySession {
    core: Arc<Core>,
    id: u64,
    frame_max: u32,
    closed: bool,
}

impl MemorySession {
    /// Run `op` under the broker lock, then wake waiters.
    fn apply<T>(&self, op: impl FnOnce(&mut BrokerState, u64) -> T) -> T {
        let mut state = self.core.lock();
        let out = op(&mut *state, self.id);
        drop(state);
        self.core.arrivals.notify_all();
        out
    }

    /// Retry `take` until it yields or `timeout` elapses.
    fn wait_for<T>(
        &self,
        timeout: Duration,
        mut take: impl FnMut(&mut BrokerState, u64) -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.core.lock();
        loop {
            if let Some(found) = take(&mut *state, self.id)? {
                return Ok(Some(found));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self
                .core
                .arrivals
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }
}

impl Session for MemorySession {
    fn login(
        &mut self,
        vhost: &str,
        username: &str,
        password: &str,
        frame_max: u32,
    ) -> std::result::Result<(), TransportError> {
        let negotiated =
            self.apply(|state, id| state.login(id, vhost, username, password, frame_max))?;
        self.frame_max = negotiated;
        debug!(session = self.id, vhost, frame_max = negotiated, "loopback login");
        Ok(())
    }

    fn frame_max(&self) -> u32 {
        self.frame_max
    }

    fn open_channel(&mut self, channel: u16) -> Result<()> {
        self.apply(|state, id| state.open_channel(id, channel))
    }

    fn close_channel(&mut self, channel: u16) -> Result<()> {
        self.apply(|state, id| state.close_channel(id, channel))
    }

    fn declare_exchange(&mut self, channel: u16, options: &ExchangeOptions) -> Result<()> {
        self.apply(|state, id| state.declare_exchange(id, channel, options))
    }

    fn bind_exchange(
        &mut self,
        channel: u16,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<()> {
        self.apply(|state, id| state.bind_exchange(id, channel, destination, source, routing_key))
    }

    fn unbind_exchange(
        &mut self,
        channel: u16,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<()> {
        self.apply(|state, id| {
            state.unbind_exchange(id, channel, destination, source, routing_key)
        })
    }

    fn declare_queue(&mut self, channel: u16, options: &QueueOptions) -> Result<String> {
        self.apply(|state, id| state.declare_queue(id, channel, options))
    }

    fn bind_queue(
        &mut self,
        channel: u16,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()> {
        self.apply(|state, id| state.bind_queue(id, channel, queue, exchange, routing_key))
    }

    fn unbind_queue(
        &mut self,
        channel: u16,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()> {
        self.apply(|state, id| state.unbind_queue(id, channel, queue, exchange, routing_key))
    }

    fn publish(
        &mut self,
        channel: u16,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        mandatory: bool,
        immediate: bool,
    ) -> std::result::Result<Status, TransportError> {
        self.apply(|state, id| {
            state.publish(
                id,
                channel,
                exchange,
                routing_key,
                message,
                mandatory,
                immediate,
            )
        })
    }

    fn start_consume(
        &mut self,
        channel: u16,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<String> {
        self.apply(|state, id| state.start_consume(id, channel, queue, options))
    }

    fn cancel_consume(&mut self, channel: u16, consumer_tag: &str) -> Result<()> {
        self.apply(|state, id| state.cancel_consume(id, channel, consumer_tag))
    }

    fn poll_delivery(&mut self, channels: &[u16], timeout: Duration) -> Result<Option<Envelope>> {
        self.wait_for(timeout, |state, id| state.take_delivery(id, channels))
    }

    fn wait_frame(&mut self, channel: u16, timeout: Duration) -> Result<Option<Frame>> {
        self.wait_for(timeout, |state, id| state.take_frame(id, channel))
    }

    fn discard(&mut self, channel: u16) -> usize {
        self.apply(|state, id| state.discard_inbound(id, channel))
    }

    fn ack(
        &mut self,
        channel: u16,
        delivery_tag: u64,
        multiple: bool,
    ) -> std::result::Result<Status, TransportError> {
        self.apply(|state, id| state.ack(id, channel, delivery_tag, multiple))
    }

    fn nack(
        &mut self,
        channel: u16,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> std::result::Result<Status, TransportError> {
        self.apply(|state, id| state.nack(id, channel, delivery_tag, multiple, requeue))
    }

    // Prefetch applies per channel; `global` is accepted and ignored.
    fn qos(
        &mut self,
        channel: u16,
        prefetch_size: u32,
        prefetch_count: u16,
        _global: bool,
    ) -> Result<()> {
        self.apply(|state, id| state.qos(id, channel, prefetch_size, prefetch_count))
    }

    fn close(&mut self) -> std::result::Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.apply(|state, id| state.close_session(id));
        self.closed = true;
        debug!(session = self.id, "loopback session closed");
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}
