use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relaymq_message::{Envelope, Message};
use relaymq_transport::{
    ConsumeOptions, ExchangeOptions, Frame, ProtocolError, QueueOptions, SessionError, Status,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::error::{MuxError, Result};
use crate::inbox::{Inbox, Pop};

/// A logical stream on a [`Connection`].
///
/// Every operation takes the connection lock for exactly one session call.
/// Dropping the channel deregisters it and closes it server-side.
pub struct Channel {
    id: u16,
    connection: Connection,
    inbox: Arc<Inbox>,
    consuming: AtomicBool,
}

impl Channel {
    /// Allocate an id and open the channel.
    pub fn open(connection: &Connection) -> Result<Self> {
        let id = connection.open_channel()?;
        trace!(connection = connection.id(), channel = id, "channel opened");
        Ok(Self {
            id,
            connection: connection.clone(),
            inbox: Arc::new(Inbox::new()),
            consuming: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn session<T>(
        &self,
        context: &'static str,
        op: impl FnOnce(&mut dyn relaymq_transport::Session) -> std::result::Result<T, SessionError>,
    ) -> Result<T> {
        self.connection.shared().with_session(context, op)
    }

    pub fn declare_exchange(&self, options: &ExchangeOptions) -> Result<()> {
        self.session("declaring exchange", |s| s.declare_exchange(self.id, options))?;
        debug!(channel = self.id, exchange = %options.name, kind = %options.kind, "exchange declared");
        Ok(())
    }

    pub fn bind_exchange(&self, destination: &str, source: &str, routing_key: &str) -> Result<()> {
        self.session("binding exchange", |s| {
            s.bind_exchange(self.id, destination, source, routing_key)
        })?;
        debug!(channel = self.id, destination, source, routing_key, "exchange bound");
        Ok(())
    }

    pub fn unbind_exchange(&self, destination: &str, source: &str, routing_key: &str) -> Result<()> {
        self.session("unbinding exchange", |s| {
            s.unbind_exchange(self.id, destination, source, routing_key)
        })?;
        debug!(channel = self.id, destination, source, routing_key, "exchange unbound");
        Ok(())
    }

    /// Declare a queue and, when both `exchange` and `routing_key` are
    /// non-empty, bind it. Returns the queue name (generated when
    /// `options.name` is empty).
    pub fn declare_queue(
        &self,
        options: &QueueOptions,
        exchange: &str,
        routing_key: &str,
    ) -> Result<String> {
        let name = self.session("declaring queue", |s| s.declare_queue(self.id, options))?;
        debug!(channel = self.id, queue = %name, "queue declared");
        if !exchange.is_empty() && !routing_key.is_empty() {
            self.bind_queue(&name, exchange, routing_key)?;
        }
        Ok(name)
    }

    pub fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.session("binding queue", |s| {
            s.bind_queue(self.id, queue, exchange, routing_key)
        })?;
        debug!(channel = self.id, queue, exchange, routing_key, "queue bound");
        Ok(())
    }

    pub fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.session("unbinding queue", |s| {
            s.unbind_queue(self.id, queue, exchange, routing_key)
        })?;
        debug!(channel = self.id, queue, exchange, routing_key, "queue unbound");
        Ok(())
    }

    /// Publish one message. A negative broker status is an error.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        mandatory: bool,
        immediate: bool,
    ) -> Result<()> {
        let status = self.session("publishing", |s| {
            s.publish(self.id, exchange, routing_key, message, mandatory, immediate)
                .map_err(SessionError::from)
        })?;
        check_status("publishing", status)?;
        trace!(channel = self.id, exchange, routing_key, bytes = message.body.len(), "published");
        Ok(())
    }

    /// Consume `queue`, calling `callback` for each delivery on this thread.
    ///
    /// Returns `Ok(())` once `cancel` fires or the connection is closed,
    /// `MuxError::Transport` if the connection failed, or the first error
    /// the callback returns. The consumer is cancelled and the inbox
    /// unregistered on every exit path.
    ///
    /// Deliveries received but not yet passed to `callback` when the loop
    /// stops are dropped; with `no_ack` they are already settled at the
    /// broker. A later `consume` on this channel only sees new deliveries.
    pub fn consume<F>(
        &self,
        queue: &str,
        options: &ConsumeOptions,
        cancel: &CancellationToken,
        mut callback: F,
    ) -> Result<()>
    where
        F: FnMut(&Channel, Envelope) -> Result<()>,
    {
        if self.consuming.swap(true, Ordering::AcqRel) {
            return Err(MuxError::AlreadyConsuming(self.id));
        }
        let outcome = self.consume_registered(queue, options, cancel, &mut callback);
        self.consuming.store(false, Ordering::Release);
        outcome
    }

    fn consume_registered<F>(
        &self,
        queue: &str,
        options: &ConsumeOptions,
        cancel: &CancellationToken,
        callback: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&Channel, Envelope) -> Result<()>,
    {
        let tag = self.session("starting consumer", |s| {
            s.start_consume(self.id, queue, options)
        })?;
        if let Err(err) = self
            .connection
            .register(self.id, Arc::clone(&self.inbox))
        {
            let _ = self.cancel_consumer(&tag);
            return Err(err);
        }
        debug!(channel = self.id, queue, consumer = %tag, "consuming");

        let outcome = self.pump(cancel, callback);

        if self.connection.is_open() {
            if let Err(err) = self.cancel_consumer(&tag) {
                debug!(channel = self.id, consumer = %tag, error = %err, "consumer cancel failed");
            }
        }
        self.connection.unregister(self.id);
        debug!(channel = self.id, queue, consumer = %tag, "consume finished");
        outcome
    }

    fn pump<F>(&self, cancel: &CancellationToken, callback: &mut F) -> Result<()>
    where
        F: FnMut(&Channel, Envelope) -> Result<()>,
    {
        let slice = self.connection.config().consume_interval;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.inbox.pop_timeout(slice) {
                Pop::Envelope(envelope) => callback(self, envelope)?,
                Pop::Empty => {}
                Pop::Closed => {
                    return match self.connection.failure() {
                        Some(err) => Err(MuxError::transport("consuming", err)),
                        None => Ok(()),
                    };
                }
            }
        }
    }

    /// Start a server-side consumer without registering with the dispatcher.
    ///
    /// Deliveries stay on the session until read with [`Channel::wait_frame`].
    pub fn start_consumer(&self, queue: &str, options: &ConsumeOptions) -> Result<String> {
        let tag = self.session("starting consumer", |s| {
            s.start_consume(self.id, queue, options)
        })?;
        debug!(channel = self.id, queue, consumer = %tag, "raw consumer started");
        Ok(tag)
    }

    pub fn cancel_consumer(&self, consumer_tag: &str) -> Result<()> {
        self.session("cancelling consumer", |s| {
            s.cancel_consume(self.id, consumer_tag)
        })
    }

    /// Acknowledge a delivery. Returns the raw status; negative is an error.
    pub fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<Status> {
        let status = self.session("acknowledging", |s| {
            s.ack(self.id, delivery_tag, multiple)
                .map_err(SessionError::from)
        })?;
        check_status("acknowledging", status)
    }

    /// Reject a delivery, optionally requeueing it.
    pub fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<Status> {
        let status = self.session("rejecting", |s| {
            s.nack(self.id, delivery_tag, multiple, requeue)
                .map_err(SessionError::from)
        })?;
        check_status("rejecting", status)
    }

    pub fn qos(&self, prefetch_size: u32, prefetch_count: u16, global: bool) -> Result<()> {
        self.session("setting qos", |s| {
            s.qos(self.id, prefetch_size, prefetch_count, global)
        })
    }

    /// One bounded wait for the next raw frame on this channel.
    ///
    /// Holds the connection lock for the whole wait, so keep `timeout` short.
    pub fn wait_frame(&self, timeout: Duration) -> Result<Option<Frame>> {
        self.session("waiting for frame", |s| s.wait_frame(self.id, timeout))
    }

    /// Drop every frame the session holds for this channel and return the
    /// number of deliveries among them. Used to reset a raw consumer
    /// after [`Channel::cancel_consumer`].
    pub fn discard_frames(&self) -> Result<usize> {
        self.session("discarding frames", |s| Ok(s.discard(self.id)))
    }

    /// Deregister and close. Same as dropping the channel.
    pub fn close(self) {}
}

fn check_status(context: &'static str, status: Status) -> Result<Status> {
    if status < 0 {
        return Err(MuxError::Protocol {
            context,
            source: ProtocolError::Status { code: status },
        });
    }
    Ok(status)
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.connection.release_channel(self.id);
        trace!(channel = self.id, "channel released");
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("connection", &self.connection.id())
            .field("consuming", &self.consuming.load(Ordering::Relaxed))
            .finish()
    }
}
