use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use bytes::BytesMut;
use relaymq_message::{Envelope, Message};
use tracing::{debug, trace};
use uuid::Uuid;

use super::routing::binding_matches;
use crate::error::{
    ProtocolError, Result, Status, TransportError, REPLY_ACCESS_REFUSED, REPLY_CHANNEL_ERROR,
    REPLY_COMMAND_INVALID, REPLY_NOT_ALLOWED, REPLY_NOT_FOUND, REPLY_NOT_IMPLEMENTED,
    REPLY_PRECONDITION_FAILED, REPLY_RESOURCE_LOCKED, STATUS_ACCESS_REFUSED,
    STATUS_CHANNEL_CLOSED, STATUS_NOT_FOUND, STATUS_NOT_IMPLEMENTED, STATUS_OK,
    STATUS_UNKNOWN_DELIVERY_TAG,
};
use crate::session::{
    ConsumeOptions, Deliver, ExchangeKind, ExchangeOptions, Frame, Method, QueueOptions,
    DEFAULT_FRAME_MAX, FRAME_MIN_SIZE, FRAME_OVERHEAD,
};

/// Virtual host served by a fresh broker.
pub const DEFAULT_VHOST: &str = "/";
/// User accepted by a fresh broker.
pub const DEFAULT_USER: &str = "guest";
pub const DEFAULT_PASSWORD: &str = "guest";

const PREDECLARED: [(&str, ExchangeKind); 4] = [
    ("", ExchangeKind::Direct),
    ("amq.direct", ExchangeKind::Direct),
    ("amq.fanout", ExchangeKind::Fanout),
    ("amq.topic", ExchangeKind::Topic),
];

#[derive(Debug, Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    message: Message,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    stored: Stored,
}

#[derive(Debug, Default)]
struct ChannelState {
    next_delivery_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    prefetch_count: u16,
}

#[derive(Debug)]
enum Liveness {
    Open,
    Lost(String),
}

#[derive(Debug)]
struct SessionState {
    liveness: Liveness,
    authenticated: bool,
    frame_max: u32,
    channels: HashMap<u16, ChannelState>,
    inbound: VecDeque<(u16, Frame)>,
}

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    auto_delete: bool,
    internal: bool,
}

#[derive(Debug, Clone)]
struct Consumer {
    session: u64,
    channel: u16,
    tag: String,
    no_ack: bool,
    exclusive: bool,
}

#[derive(Debug)]
struct QueueState {
    durable: bool,
    auto_delete: bool,
    exclusive_owner: Option<u64>,
    messages: VecDeque<Stored>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
    had_consumer: bool,
}

#[derive(Debug, PartialEq, Eq)]
struct Binding {
    destination: String,
    source: String,
    routing_key: String,
}

impl Binding {
    fn new(destination: &str, source: &str, routing_key: &str) -> Self {
        Self {
            destination: destination.to_string(),
            source: source.to_string(),
            routing_key: routing_key.to_string(),
        }
    }
}

/// Everything the loopback broker knows, guarded by one mutex.
#[derive(Debug)]
pub(crate) struct BrokerState {
    pub(crate) reachable: bool,
    vhost: String,
    users: HashMap<String, String>,
    next_session: u64,
    sessions: HashMap<u64, SessionState>,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    queue_bindings: Vec<Binding>,
    exchange_bindings: Vec<Binding>,
}

impl BrokerState {
    pub(crate) fn new() -> Self {
        let exchanges = PREDECLARED
            .iter()
            .map(|(name, kind)| {
                (
                    name.to_string(),
                    ExchangeState {
                        kind: *kind,
                        auto_delete: false,
                        internal: false,
                    },
                )
            })
            .collect();

        Self {
            reachable: true,
            vhost: DEFAULT_VHOST.to_string(),
            users: HashMap::from([(DEFAULT_USER.to_string(), DEFAULT_PASSWORD.to_string())]),
            next_session: 0,
            sessions: HashMap::new(),
            exchanges,
            queues: HashMap::new(),
            queue_bindings: Vec::new(),
            exchange_bindings: Vec::new(),
        }
    }

    pub(crate) fn add_user(&mut self, username: &str, password: &str) {
        self.users
            .insert(username.to_string(), password.to_string());
    }

    pub(crate) fn set_vhost(&mut self, vhost: &str) {
        self.vhost = vhost.to_string();
    }

    // ---- sessions ----

    pub(crate) fn open_session(&mut self) -> u64 {
        self.next_session += 1;
        let id = self.next_session;
        self.sessions.insert(
            id,
            SessionState {
                liveness: Liveness::Open,
                authenticated: false,
                frame_max: DEFAULT_FRAME_MAX,
                channels: HashMap::new(),
                inbound: VecDeque::new(),
            },
        );
        id
    }

    pub(crate) fn login(
        &mut self,
        id: u64,
        vhost: &str,
        username: &str,
        password: &str,
        frame_max: u32,
    ) -> std::result::Result<u32, TransportError> {
        self.alive(id)?;
        if vhost != self.vhost {
            return Err(TransportError::Login(format!(
                "NOT_ALLOWED - vhost '{vhost}' not found"
            )));
        }
        if self.users.get(username).map(String::as_str) != Some(password) {
            return Err(TransportError::Login(format!(
                "ACCESS_REFUSED - login refused for user '{username}'"
            )));
        }

        let negotiated = match frame_max {
            0 => DEFAULT_FRAME_MAX,
            requested => requested.max(FRAME_MIN_SIZE),
        };
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(TransportError::Closed)?;
        session.authenticated = true;
        session.frame_max = negotiated;
        Ok(negotiated)
    }

    /// Session exists and has not lost its connection.
    fn alive(&self, id: u64) -> std::result::Result<(), TransportError> {
        match self.sessions.get(&id) {
            None => Err(TransportError::Closed),
            Some(SessionState {
                liveness: Liveness::Lost(reason),
                ..
            }) => Err(TransportError::ConnectionLost(reason.clone())),
            Some(_) => Ok(()),
        }
    }

    /// Session is alive and authenticated.
    fn ready(&self, id: u64) -> std::result::Result<(), TransportError> {
        self.alive(id)?;
        match self.sessions.get(&id) {
            Some(session) if session.authenticated => Ok(()),
            _ => Err(TransportError::NotAuthenticated),
        }
    }

    fn channel_open(&self, id: u64, channel: u16) -> bool {
        self.sessions
            .get(&id)
            .is_some_and(|session| session.channels.contains_key(&channel))
    }

    /// Session is ready and `channel` is open on it.
    fn guard(&self, id: u64, channel: u16) -> Result<()> {
        self.ready(id)?;
        if !self.channel_open(id, channel) {
            return Err(ProtocolError::connection(
                REPLY_CHANNEL_ERROR,
                format!("CHANNEL_ERROR - expected 'channel.open' on channel {channel}"),
            )
            .into());
        }
        Ok(())
    }

    pub(crate) fn close_session(&mut self, id: u64) {
        self.teardown(id);
        self.sessions.remove(&id);
    }

    pub(crate) fn sever_all(&mut self, reason: &str) {
        let ids: Vec<u64> = self.sessions.keys().copied().collect();
        for id in ids {
            self.teardown(id);
            if let Some(session) = self.sessions.get_mut(&id) {
                session.liveness = Liveness::Lost(reason.to_string());
                session.inbound.clear();
            }
        }
    }

    fn teardown(&mut self, id: u64) {
        let channels: Vec<u16> = self
            .sessions
            .get(&id)
            .map(|session| session.channels.keys().copied().collect())
            .unwrap_or_default();
        for channel in channels {
            self.release_channel(id, channel);
        }

        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.exclusive_owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            self.delete_queue(&name);
        }
    }

    // ---- channels ----

    pub(crate) fn open_channel(&mut self, id: u64, channel: u16) -> Result<()> {
        self.ready(id)?;
        if channel == 0 {
            return Err(ProtocolError::connection(
                REPLY_COMMAND_INVALID,
                "COMMAND_INVALID - channel 0 is reserved",
            )
            .into());
        }
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(TransportError::Closed)?;
        if session.channels.contains_key(&channel) {
            return Err(ProtocolError::connection(
                REPLY_CHANNEL_ERROR,
                format!("CHANNEL_ERROR - second 'channel.open' seen on channel {channel}"),
            )
            .into());
        }
        session.channels.insert(channel, ChannelState::default());
        trace!(session = id, channel, "channel opened");
        Ok(())
    }

    pub(crate) fn close_channel(&mut self, id: u64, channel: u16) -> Result<()> {
        self.ready(id)?;
        self.release_channel(id, channel);
        trace!(session = id, channel, "channel closed");
        Ok(())
    }

    /// Drop a channel: its consumers go away, its unacked deliveries are
    /// requeued as redelivered and its buffered frames are discarded.
    fn release_channel(&mut self, id: u64, channel: u16) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        let Some(state) = session.channels.remove(&channel) else {
            return;
        };
        session.inbound.retain(|(ch, _)| *ch != channel);

        // Newest first so the oldest ends up at the head of its queue.
        for (_, unacked) in state.unacked.into_iter().rev() {
            self.requeue(unacked);
        }

        let affected = self.drop_consumers(|c| c.session == id && c.channel == channel);
        for queue in affected {
            self.after_consumer_removed(&queue);
        }
        self.dispatch_all();
    }

    // ---- exchanges ----

    pub(crate) fn declare_exchange(
        &mut self,
        id: u64,
        channel: u16,
        options: &ExchangeOptions,
    ) -> Result<()> {
        self.guard(id, channel)?;
        let name = options.name.as_str();

        if let Some(existing) = self.exchanges.get(name) {
            if !options.passive && existing.kind != options.kind {
                return Err(ProtocolError::channel(
                    REPLY_PRECONDITION_FAILED,
                    format!(
                        "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}' in vhost '{}': received '{}' but current is '{}'",
                        self.vhost, options.kind, existing.kind
                    ),
                )
                .into());
            }
            return Ok(());
        }

        if options.passive {
            return Err(self.no_exchange(name).into());
        }
        if name.is_empty() || name.starts_with("amq.") {
            return Err(ProtocolError::channel(
                REPLY_ACCESS_REFUSED,
                format!("ACCESS_REFUSED - exchange name '{name}' contains reserved prefix 'amq.*'"),
            )
            .into());
        }

        self.exchanges.insert(
            name.to_string(),
            ExchangeState {
                kind: options.kind,
                auto_delete: options.auto_delete,
                internal: options.internal,
            },
        );
        debug!(exchange = name, kind = %options.kind, "exchange declared");
        Ok(())
    }

    pub(crate) fn bind_exchange(
        &mut self,
        id: u64,
        channel: u16,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<()> {
        self.guard(id, channel)?;
        for name in [destination, source] {
            if name.is_empty() {
                return Err(default_exchange_refused().into());
            }
            if !self.exchanges.contains_key(name) {
                return Err(self.no_exchange(name).into());
            }
        }

        let binding = Binding::new(destination, source, routing_key);
        if !self.exchange_bindings.contains(&binding) {
            self.exchange_bindings.push(binding);
        }
        Ok(())
    }

    pub(crate) fn unbind_exchange(
        &mut self,
        id: u64,
        channel: u16,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<()> {
        self.guard(id, channel)?;
        let binding = Binding::new(destination, source, routing_key);
        self.exchange_bindings.retain(|b| *b != binding);
        self.maybe_delete_exchange(source);
        Ok(())
    }

    fn maybe_delete_exchange(&mut self, name: &str) {
        let auto_delete = self
            .exchanges
            .get(name)
            .is_some_and(|exchange| exchange.auto_delete);
        if !auto_delete {
            return;
        }
        let bound = self.queue_bindings.iter().any(|b| b.source == name)
            || self.exchange_bindings.iter().any(|b| b.source == name);
        if bound {
            return;
        }

        self.exchanges.remove(name);
        self.exchange_bindings.retain(|b| b.destination != name);
        debug!(exchange = name, "auto-delete exchange removed");
    }

    fn no_exchange(&self, name: &str) -> ProtocolError {
        ProtocolError::channel(
            REPLY_NOT_FOUND,
            format!("NOT_FOUND - no exchange '{name}' in vhost '{}'", self.vhost),
        )
    }

    // ---- queues ----

    pub(crate) fn declare_queue(
        &mut self,
        id: u64,
        channel: u16,
        options: &QueueOptions,
    ) -> Result<String> {
        self.guard(id, channel)?;

        if options.passive {
            self.queue_for(id, &options.name)?;
            return Ok(options.name.clone());
        }

        let name = if options.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else if options.name.starts_with("amq.") {
            return Err(ProtocolError::channel(
                REPLY_ACCESS_REFUSED,
                format!(
                    "ACCESS_REFUSED - queue name '{}' contains reserved prefix 'amq.*'",
                    options.name
                ),
            )
            .into());
        } else {
            options.name.clone()
        };

        if self.queues.contains_key(&name) {
            let existing = self.queue_for(id, &name)?;
            if existing.durable != options.durable {
                return Err(ProtocolError::channel(
                    REPLY_PRECONDITION_FAILED,
                    format!(
                        "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{name}' in vhost '{}': received '{}' but current is '{}'",
                        self.vhost, options.durable, existing.durable
                    ),
                )
                .into());
            }
            return Ok(name);
        }

        self.queues.insert(
            name.clone(),
            QueueState {
                durable: options.durable,
                auto_delete: options.auto_delete,
                exclusive_owner: options.exclusive.then_some(id),
                messages: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
                had_consumer: false,
            },
        );
        debug!(queue = %name, exclusive = options.exclusive, "queue declared");
        Ok(name)
    }

    pub(crate) fn bind_queue(
        &mut self,
        id: u64,
        channel: u16,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()> {
        self.guard(id, channel)?;
        self.queue_for(id, queue)?;
        if exchange.is_empty() {
            return Err(default_exchange_refused().into());
        }
        if !self.exchanges.contains_key(exchange) {
            return Err(self.no_exchange(exchange).into());
        }

        let binding = Binding::new(queue, exchange, routing_key);
        if !self.queue_bindings.contains(&binding) {
            self.queue_bindings.push(binding);
        }
        debug!(queue, exchange, routing_key, "queue bound");
        Ok(())
    }

    pub(crate) fn unbind_queue(
        &mut self,
        id: u64,
        channel: u16,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()> {
        self.guard(id, channel)?;
        self.queue_for(id, queue)?;
        let binding = Binding::new(queue, exchange, routing_key);
        self.queue_bindings.retain(|b| *b != binding);
        self.maybe_delete_exchange(exchange);
        Ok(())
    }

    /// Look up a queue this session may use.
    fn queue_for(&self, id: u64, name: &str) -> std::result::Result<&QueueState, ProtocolError> {
        let queue = self.queues.get(name).ok_or_else(|| {
            ProtocolError::channel(
                REPLY_NOT_FOUND,
                format!("NOT_FOUND - no queue '{name}' in vhost '{}'", self.vhost),
            )
        })?;
        if queue.exclusive_owner.is_some_and(|owner| owner != id) {
            return Err(ProtocolError::channel(
                REPLY_RESOURCE_LOCKED,
                format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{name}' in vhost '{}'",
                    self.vhost
                ),
            ));
        }
        Ok(queue)
    }

    fn delete_queue(&mut self, name: &str) {
        if self.queues.remove(name).is_none() {
            return;
        }
        let sources: Vec<String> = self
            .queue_bindings
            .iter()
            .filter(|b| b.destination == name)
            .map(|b| b.source.clone())
            .collect();
        self.queue_bindings.retain(|b| b.destination != name);
        for source in sources {
            self.maybe_delete_exchange(&source);
        }
        debug!(queue = name, "queue deleted");
    }

    // ---- publishing and routing ----

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn publish(
        &mut self,
        id: u64,
        channel: u16,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        mandatory: bool,
        immediate: bool,
    ) -> std::result::Result<Status, TransportError> {
        self.ready(id)?;
        if !self.channel_open(id, channel) {
            return Ok(STATUS_CHANNEL_CLOSED);
        }
        if immediate {
            return Ok(STATUS_NOT_IMPLEMENTED);
        }
        match self.exchanges.get(exchange) {
            None => return Ok(STATUS_NOT_FOUND),
            Some(target) if target.internal => return Ok(STATUS_ACCESS_REFUSED),
            Some(_) => {}
        }

        let targets = self.route(exchange, routing_key);
        if targets.is_empty() {
            debug!(exchange, routing_key, mandatory, "unroutable message dropped");
            return Ok(STATUS_OK);
        }

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.messages.push_back(Stored {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    message: message.clone(),
                    redelivered: false,
                });
            }
        }
        for name in &targets {
            self.dispatch(name);
        }
        Ok(STATUS_OK)
    }

    /// Queues a message published to `exchange` with `routing_key` lands in.
    fn route(&self, exchange: &str, routing_key: &str) -> BTreeSet<String> {
        let mut targets = BTreeSet::new();
        let mut visited = HashSet::new();
        self.route_into(exchange, routing_key, &mut targets, &mut visited);
        targets
    }

    fn route_into(
        &self,
        exchange: &str,
        routing_key: &str,
        targets: &mut BTreeSet<String>,
        visited: &mut HashSet<String>,
    ) {
        if !visited.insert(exchange.to_string()) {
            return;
        }
        // The default exchange routes by queue name.
        if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                targets.insert(routing_key.to_string());
            }
            return;
        }
        let Some(state) = self.exchanges.get(exchange) else {
            return;
        };

        for binding in &self.queue_bindings {
            if binding.source == exchange
                && binding_matches(state.kind, &binding.routing_key, routing_key)
            {
                targets.insert(binding.destination.clone());
            }
        }
        for binding in &self.exchange_bindings {
            if binding.source == exchange
                && binding_matches(state.kind, &binding.routing_key, routing_key)
            {
                self.route_into(&binding.destination, routing_key, targets, visited);
            }
        }
    }

    // ---- consumers ----

    pub(crate) fn start_consume(
        &mut self,
        id: u64,
        channel: u16,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<String> {
        self.guard(id, channel)?;
        let state = self.queue_for(id, queue)?;
        let locked = state.consumers.iter().any(|c| c.exclusive)
            || (options.exclusive && !state.consumers.is_empty());
        if locked {
            return Err(ProtocolError::channel(
                REPLY_ACCESS_REFUSED,
                format!(
                    "ACCESS_REFUSED - queue '{queue}' in vhost '{}' in exclusive use",
                    self.vhost
                ),
            )
            .into());
        }

        let tag = if options.consumer_tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4().simple())
        } else {
            options.consumer_tag.clone()
        };
        let in_use = self
            .queues
            .values()
            .flat_map(|q| q.consumers.iter())
            .any(|c| c.session == id && c.channel == channel && c.tag == tag);
        if in_use {
            return Err(ProtocolError::connection(
                REPLY_NOT_ALLOWED,
                format!("NOT_ALLOWED - attempt to reuse consumer tag '{tag}'"),
            )
            .into());
        }

        let state = self
            .queues
            .get_mut(queue)
            .ok_or(TransportError::Closed)?;
        state.consumers.push(Consumer {
            session: id,
            channel,
            tag: tag.clone(),
            no_ack: options.no_ack,
            exclusive: options.exclusive,
        });
        state.had_consumer = true;
        debug!(queue, consumer = %tag, no_ack = options.no_ack, "consumer started");

        self.dispatch(queue);
        Ok(tag)
    }

    pub(crate) fn cancel_consume(&mut self, id: u64, channel: u16, consumer_tag: &str) -> Result<()> {
        self.guard(id, channel)?;
        let affected =
            self.drop_consumers(|c| c.session == id && c.channel == channel && c.tag == consumer_tag);
        for queue in affected {
            self.after_consumer_removed(&queue);
        }
        debug!(consumer = consumer_tag, "consumer cancelled");
        Ok(())
    }

    /// Remove consumers matching `predicate`; returns the queues that lost one.
    fn drop_consumers(&mut self, predicate: impl Fn(&Consumer) -> bool) -> Vec<String> {
        let mut affected = Vec::new();
        for (name, queue) in &mut self.queues {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| !predicate(c));
            if queue.consumers.len() != before {
                queue.next_consumer = 0;
                affected.push(name.clone());
            }
        }
        affected
    }

    fn after_consumer_removed(&mut self, name: &str) {
        let delete = self.queues.get(name).is_some_and(|queue| {
            queue.auto_delete && queue.had_consumer && queue.consumers.is_empty()
        });
        if delete {
            self.delete_queue(name);
        }
    }

    /// Hand queued messages to consumers with capacity, round-robin.
    fn dispatch(&mut self, name: &str) {
        let BrokerState {
            queues, sessions, ..
        } = self;
        let Some(queue) = queues.get_mut(name) else {
            return;
        };

        while !queue.messages.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let mut chosen = None;
            for step in 0..count {
                let index = (queue.next_consumer + step) % count;
                if has_capacity(sessions, &queue.consumers[index]) {
                    chosen = Some(index);
                    break;
                }
            }
            let Some(index) = chosen else {
                break;
            };
            queue.next_consumer = (index + 1) % count;

            let consumer = &queue.consumers[index];
            let Some(session) = sessions.get_mut(&consumer.session) else {
                break;
            };
            let Some(channel) = session.channels.get_mut(&consumer.channel) else {
                break;
            };
            let Some(stored) = queue.messages.pop_front() else {
                break;
            };

            channel.next_delivery_tag += 1;
            let delivery_tag = channel.next_delivery_tag;
            if !consumer.no_ack {
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: name.to_string(),
                        stored: stored.clone(),
                    },
                );
            }
            trace!(queue = name, consumer = %consumer.tag, delivery_tag, "delivering");
            push_delivery(session, consumer.channel, &consumer.tag, delivery_tag, stored);
        }
    }

    fn dispatch_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut stored = unacked.stored;
            stored.redelivered = true;
            queue.messages.push_front(stored);
        }
    }

    // ---- acknowledgements and flow control ----

    pub(crate) fn ack(
        &mut self,
        id: u64,
        channel: u16,
        delivery_tag: u64,
        multiple: bool,
    ) -> std::result::Result<Status, TransportError> {
        self.settle(id, channel, delivery_tag, multiple, false)
    }

    pub(crate) fn nack(
        &mut self,
        id: u64,
        channel: u16,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> std::result::Result<Status, TransportError> {
        self.settle(id, channel, delivery_tag, multiple, requeue)
    }

    fn settle(
        &mut self,
        id: u64,
        channel: u16,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> std::result::Result<Status, TransportError> {
        self.ready(id)?;
        let Some(state) = self
            .sessions
            .get_mut(&id)
            .and_then(|session| session.channels.get_mut(&channel))
        else {
            return Ok(STATUS_CHANNEL_CLOSED);
        };

        let tags: Vec<u64> = if multiple && delivery_tag == 0 {
            state.unacked.keys().copied().collect()
        } else if multiple {
            state.unacked.range(..=delivery_tag).map(|(tag, _)| *tag).collect()
        } else if state.unacked.contains_key(&delivery_tag) {
            vec![delivery_tag]
        } else {
            Vec::new()
        };
        if tags.is_empty() {
            return Ok(STATUS_UNKNOWN_DELIVERY_TAG);
        }

        let settled: Vec<Unacked> = tags
            .iter()
            .filter_map(|tag| state.unacked.remove(tag))
            .collect();
        if requeue {
            for unacked in settled.into_iter().rev() {
                self.requeue(unacked);
            }
        }
        self.dispatch_all();
        Ok(STATUS_OK)
    }

    pub(crate) fn qos(
        &mut self,
        id: u64,
        channel: u16,
        prefetch_size: u32,
        prefetch_count: u16,
    ) -> Result<()> {
        self.guard(id, channel)?;
        if prefetch_size != 0 {
            return Err(ProtocolError::connection(
                REPLY_NOT_IMPLEMENTED,
                format!("NOT_IMPLEMENTED - prefetch_size!=0 ({prefetch_size})"),
            )
            .into());
        }
        if let Some(state) = self
            .sessions
            .get_mut(&id)
            .and_then(|session| session.channels.get_mut(&channel))
        {
            state.prefetch_count = prefetch_count;
        }
        self.dispatch_all();
        Ok(())
    }

    // ---- inbound frames ----

    /// Remove and assemble the first complete delivery addressed to one of
    /// `channels`.
    pub(crate) fn take_delivery(&mut self, id: u64, channels: &[u16]) -> Result<Option<Envelope>> {
        self.ready(id)?;
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(TransportError::Closed)?;
        let inbound = &mut session.inbound;

        let Some(start) = inbound.iter().position(|(channel, frame)| {
            channels.contains(channel) && matches!(frame, Frame::Method(Method::Deliver(_)))
        }) else {
            return Ok(None);
        };
        let Some((channel, Frame::Method(Method::Deliver(deliver)))) = inbound.remove(start) else {
            return Ok(None);
        };

        let (body_size, properties) = match take_next(inbound, start, channel) {
            Some(Frame::Header {
                body_size,
                properties,
            }) => (body_size, properties),
            other => return Err(unexpected("header", other.as_ref()).into()),
        };

        let mut body = BytesMut::with_capacity(usize::try_from(body_size).unwrap_or_default());
        while (body.len() as u64) < body_size {
            match take_next(inbound, start, channel) {
                Some(Frame::Body(piece)) => body.extend_from_slice(&piece),
                other => return Err(unexpected("body", other.as_ref()).into()),
            }
        }

        Ok(Some(Envelope {
            channel,
            message: Message::with_properties(body.freeze(), properties),
            consumer_tag: deliver.consumer_tag,
            delivery_tag: deliver.delivery_tag,
            exchange: deliver.exchange,
            routing_key: deliver.routing_key,
            redelivered: deliver.redelivered,
        }))
    }

    /// Remove the next raw frame on `channel`.
    pub(crate) fn take_frame(&mut self, id: u64, channel: u16) -> Result<Option<Frame>> {
        self.ready(id)?;
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(TransportError::Closed)?;
        Ok(take_next(&mut session.inbound, 0, channel))
    }

    /// Drop the frames buffered for `channel`; returns the deliveries they held.
    pub(crate) fn discard_inbound(&mut self, id: u64, channel: u16) -> usize {
        let Some(session) = self.sessions.get_mut(&id) else {
            return 0;
        };
        let dropped = session
            .inbound
            .iter()
            .filter(|(ch, frame)| *ch == channel && matches!(frame, Frame::Method(Method::Deliver(_))))
            .count();
        session.inbound.retain(|(ch, _)| *ch != channel);
        dropped
    }

    // ---- inspection ----

    pub(crate) fn buffered_frames(&self) -> usize {
        self.sessions.values().map(|session| session.inbound.len()).sum()
    }

    pub(crate) fn queue_depth(&self, name: &str) -> Option<usize> {
        self.queues.get(name).map(|queue| queue.messages.len())
    }

    pub(crate) fn consumer_count(&self, name: &str) -> Option<usize> {
        self.queues.get(name).map(|queue| queue.consumers.len())
    }

    pub(crate) fn queue_exists(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    pub(crate) fn exchange_exists(&self, name: &str) -> bool {
        self.exchanges.contains_key(name)
    }

    pub(crate) fn session_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|session| matches!(session.liveness, Liveness::Open))
            .count()
    }
}

fn has_capacity(sessions: &HashMap<u64, SessionState>, consumer: &Consumer) -> bool {
    let Some(session) = sessions.get(&consumer.session) else {
        return false;
    };
    if !matches!(session.liveness, Liveness::Open) {
        return false;
    }
    let Some(channel) = session.channels.get(&consumer.channel) else {
        return false;
    };
    consumer.no_ack
        || channel.prefetch_count == 0
        || channel.unacked.len() < usize::from(channel.prefetch_count)
}

/// Queue the method, header and body frames of one delivery. Bodies are split
/// so that no frame exceeds the negotiated frame size.
fn push_delivery(
    session: &mut SessionState,
    channel: u16,
    consumer_tag: &str,
    delivery_tag: u64,
    stored: Stored,
) {
    let chunk = (session.frame_max as usize)
        .saturating_sub(FRAME_OVERHEAD)
        .max(1);
    let Stored {
        exchange,
        routing_key,
        message,
        redelivered,
    } = stored;

    session.inbound.push_back((
        channel,
        Frame::Method(Method::Deliver(Deliver {
            consumer_tag: consumer_tag.to_string(),
            delivery_tag,
            redelivered,
            exchange,
            routing_key,
        })),
    ));
    session.inbound.push_back((
        channel,
        Frame::Header {
            body_size: message.body.len() as u64,
            properties: message.properties,
        },
    ));

    let mut body = message.body;
    while !body.is_empty() {
        let piece = body.split_to(chunk.min(body.len()));
        session.inbound.push_back((channel, Frame::Body(piece)));
    }
}

fn take_next(inbound: &mut VecDeque<(u16, Frame)>, from: usize, channel: u16) -> Option<Frame> {
    let offset = inbound
        .iter()
        .skip(from)
        .position(|(ch, _)| *ch == channel)?;
    inbound.remove(from + offset).map(|(_, frame)| frame)
}

fn unexpected(expected: &'static str, found: Option<&Frame>) -> ProtocolError {
    ProtocolError::UnexpectedFrame {
        expected,
        found: found.map_or("nothing", Frame::kind_name),
    }
}

fn default_exchange_refused() -> ProtocolError {
    ProtocolError::channel(
        REPLY_ACCESS_REFUSED,
        "ACCESS_REFUSED - operation not permitted on the default exchange",
    )
}
