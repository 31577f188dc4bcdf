use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use relaymq_transport::{Connector, Session, SessionError, TransportError};
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::dispatcher;
use crate::error::{MuxError, Result};
use crate::ids::ChannelIds;
use crate::inbox::Inbox;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Everything guarded by the connection lock.
pub(crate) struct ConnState {
    pub(crate) session: Option<Box<dyn Session>>,
    pub(crate) registry: HashMap<u16, Arc<Inbox>>,
    pub(crate) ids: ChannelIds,
}

/// State shared between connection handles and the dispatcher thread.
pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) config: ConnectionConfig,
    pub(crate) frame_max: u32,
    state: Mutex<ConnState>,
    /// Signalled when a channel registers or the connection shuts down.
    pub(crate) wake: Condvar,
    running: AtomicBool,
    failure: Mutex<Option<TransportError>>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn failure(&self) -> Option<TransportError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The error an operation on a stopped connection reports.
    pub(crate) fn closed_error(&self, context: &'static str) -> MuxError {
        match self.failure() {
            Some(err) => MuxError::transport(context, err),
            None => MuxError::ConnectionClosed,
        }
    }

    /// Run `op` under the connection lock while the connection is running.
    pub(crate) fn with_state<T>(
        &self,
        context: &'static str,
        op: impl FnOnce(&mut ConnState) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock();
        if !self.is_running() || state.session.is_none() {
            return Err(self.closed_error(context));
        }
        op(&mut state)
    }

    /// Run one session operation under the connection lock.
    pub(crate) fn with_session<T>(
        &self,
        context: &'static str,
        op: impl FnOnce(&mut dyn Session) -> std::result::Result<T, SessionError>,
    ) -> Result<T> {
        self.with_state(context, |state| {
            let session = state
                .session
                .as_deref_mut()
                .ok_or(MuxError::ConnectionClosed)?;
            op(session).map_err(|err| MuxError::session(context, err))
        })
    }

    /// Record a fatal transport failure. Called by the dispatcher with the
    /// lock held.
    pub(crate) fn fail(&self, state: &mut ConnState, err: TransportError) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
        self.running.store(false, Ordering::Release);
        for inbox in state.registry.values() {
            inbox.close();
        }
        state.registry.clear();
    }

    /// Stop the connection: close inboxes, flip the run flag and close the
    /// session. Safe to call more than once.
    fn shutdown(&self) {
        let mut state = self.lock();
        self.running.store(false, Ordering::Release);
        for inbox in state.registry.values() {
            inbox.close();
        }
        state.registry.clear();
        let session = state.session.take();
        drop(state);
        self.wake.notify_all();

        if let Some(mut session) = session {
            if let Err(err) = session.close() {
                debug!(connection = self.id, error = %err, "session close failed");
            }
            info!(connection = self.id, "connection closed");
        }
    }
}

struct ConnectionInner {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionInner {
    fn close(&self) {
        self.shared.shutdown();

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(connection = self.shared.id, "dispatcher thread panicked");
            }
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// A multiplexed broker connection.
///
/// Cloning yields another handle to the same connection. The session is only
/// reachable through the connection lock, and a background dispatcher
/// thread moves deliveries into the inboxes of consuming channels. The
/// connection closes on [`Connection::close`] or when the last handle
/// (including those held by channels) is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Connect, log in and start the dispatcher.
    ///
    /// Fails synchronously on invalid configuration, connect failure or
    /// login refusal. A session that failed login is closed before
    /// returning.
    pub fn open(config: &ConnectionConfig, connector: &dyn Connector) -> Result<Self> {
        config.validate()?;

        let mut session = connector
            .open(&config.host, config.port)
            .map_err(|err| MuxError::transport("opening connection", err))?;
        if let Err(err) = session.login(
            &config.vhost,
            &config.username,
            &config.password,
            config.frame_max,
        ) {
            let _ = session.close();
            return Err(MuxError::transport("logging in", err));
        }

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let frame_max = session.frame_max();
        let shared = Arc::new(Shared {
            id,
            config: config.clone(),
            frame_max,
            state: Mutex::new(ConnState {
                session: Some(session),
                registry: HashMap::new(),
                ids: ChannelIds::new(config.channel_max),
            }),
            wake: Condvar::new(),
            running: AtomicBool::new(true),
            failure: Mutex::new(None),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("relaymq-dispatch-{id}"))
            .spawn(move || dispatcher::run(&worker));
        let handle = match handle {
            Ok(handle) => handle,
            Err(source) => {
                shared.shutdown();
                return Err(MuxError::Spawn {
                    what: "dispatcher",
                    source,
                });
            }
        };

        info!(
            connection = id,
            host = %config.host,
            port = config.port,
            vhost = %config.vhost,
            frame_max,
            "connection opened"
        );
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                shared,
                dispatcher: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Close every inbox, the session and the dispatcher. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    /// True until closed or failed.
    pub fn is_open(&self) -> bool {
        self.inner.shared.is_running()
    }

    /// The transport failure that stopped the dispatcher, if any.
    pub fn failure(&self) -> Option<TransportError> {
        self.inner.shared.failure()
    }

    /// Ids of channels currently consuming, ascending.
    pub fn registered_channels(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.inner.shared.lock().registry.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Frame size negotiated at login.
    pub fn frame_max(&self) -> u32 {
        self.inner.shared.frame_max
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.shared.config
    }

    /// Process-unique connection number (also in the dispatcher thread name).
    pub fn id(&self) -> u64 {
        self.inner.shared.id
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    /// Route deliveries for `channel` into `inbox`.
    pub(crate) fn register(&self, channel: u16, inbox: Arc<Inbox>) -> Result<()> {
        let shared = self.shared();
        shared.with_state("registering channel", |state| {
            state.registry.insert(channel, inbox);
            Ok(())
        })?;
        shared.wake.notify_all();
        Ok(())
    }

    /// Stop routing deliveries for `channel` and drop what is buffered,
    /// both in its inbox and on the session.
    pub(crate) fn unregister(&self, channel: u16) {
        let shared = self.shared();
        let (inbox, mut dropped) = {
            let mut state = shared.lock();
            let inbox = state.registry.remove(&channel);
            let pending = match state.session.as_deref_mut() {
                Some(session) if shared.is_running() => session.discard(channel),
                _ => 0,
            };
            (inbox, pending)
        };
        if let Some(inbox) = inbox {
            dropped += inbox.drain();
        }
        if dropped > 0 {
            warn!(
                connection = shared.id,
                channel, dropped, "channel stopped consuming; buffered deliveries dropped"
            );
        }
    }

    /// Allocate a channel id and open it server-side.
    pub(crate) fn open_channel(&self) -> Result<u16> {
        self.shared().with_state("opening channel", |state| {
            let id = state
                .ids
                .allocate()
                .ok_or(MuxError::ChannelLimit(state.ids.max()))?;
            let opened = match state.session.as_deref_mut() {
                Some(session) => session
                    .open_channel(id)
                    .map_err(|err| MuxError::session("opening channel", err)),
                None => Err(MuxError::ConnectionClosed),
            };
            if let Err(err) = opened {
                state.ids.release(id);
                return Err(err);
            }
            Ok(id)
        })
    }

    /// Deregister, close server-side while the connection is up, and free the id.
    pub(crate) fn release_channel(&self, channel: u16) {
        let shared = self.shared();
        let mut state = shared.lock();
        state.registry.remove(&channel);
        if shared.is_running() {
            if let Some(session) = state.session.as_deref_mut() {
                if let Err(err) = session.close_channel(channel) {
                    debug!(channel, error = %err, "channel close failed");
                }
            }
        }
        state.ids.release(channel);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("open", &self.is_open())
            .field("frame_max", &self.frame_max())
            .finish_non_exhaustive()
    }
}
