use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use relaymq_message::Envelope;

/// Result of one bounded inbox wait.
#[derive(Debug)]
pub(crate) enum Pop {
    Envelope(Envelope),
    Empty,
    Closed,
}

#[derive(Debug, Default)]
struct InboxState {
    queue: VecDeque<Envelope>,
    closed: bool,
}

/// Per-channel FIFO filled by the dispatcher and drained by the consumer.
#[derive(Debug, Default)]
pub(crate) struct Inbox {
    state: Mutex<InboxState>,
    ready: Condvar,
}

impl Inbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an envelope. Returns false if the inbox is closed.
    pub(crate) fn push(&self, envelope: Envelope) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.queue.push_back(envelope);
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Wait up to `timeout` for the next envelope.
    pub(crate) fn pop_timeout(&self, timeout: Duration) -> Pop {
        let state = self.lock();
        let (mut state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |s| s.queue.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Pop::Closed;
        }
        match state.queue.pop_front() {
            Some(envelope) => Pop::Envelope(envelope),
            None => Pop::Empty,
        }
    }

    /// Discard buffered envelopes and wake every waiter with `Closed`.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.queue.clear();
        drop(state);
        self.ready.notify_all();
    }

    /// Discard buffered envelopes; returns how many were dropped.
    pub(crate) fn drain(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.queue.len();
        state.queue.clear();
        dropped
    }
}
