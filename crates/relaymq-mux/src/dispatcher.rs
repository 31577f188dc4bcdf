use std::sync::PoisonError;
use std::thread;

use relaymq_message::Envelope;
use relaymq_transport::SessionError;
use tracing::{debug, error, trace, warn};

use crate::connection::{ConnState, Shared};

/// Dispatcher thread body.
///
/// Each iteration takes the connection lock for one bounded poll. Nothing is
/// polled while no channel is registered, and the run flag is checked
/// before every session access.
pub(crate) fn run(shared: &Shared) {
    debug!(connection = shared.id, "dispatcher started");
    loop {
        let mut state = shared.lock();
        if !shared.is_running() {
            break;
        }

        if state.registry.is_empty() {
            let _idle = shared
                .wake
                .wait_timeout(state, shared.config.idle_interval)
                .unwrap_or_else(PoisonError::into_inner);
            continue;
        }

        let channels: Vec<u16> = state.registry.keys().copied().collect();
        let Some(session) = state.session.as_deref_mut() else {
            break;
        };
        session.release_buffers();

        match session.poll_delivery(&channels, shared.config.poll_interval) {
            Ok(Some(envelope)) => route(shared, &state, envelope),
            Ok(None) => {
                drop(state);
                thread::yield_now();
            }
            Err(SessionError::Protocol(err)) => {
                warn!(connection = shared.id, error = %err, "dispatcher poll rejected");
                drop(state);
                thread::yield_now();
            }
            Err(SessionError::Transport(err)) => {
                error!(connection = shared.id, error = %err, "dispatcher stopped on transport failure");
                shared.fail(&mut state, err);
                break;
            }
        }
    }
    debug!(connection = shared.id, "dispatcher exited");
}

fn route(shared: &Shared, state: &ConnState, envelope: Envelope) {
    let channel = envelope.channel;
    let delivery_tag = envelope.delivery_tag;
    match state.registry.get(&channel) {
        Some(inbox) => {
            if inbox.push(envelope) {
                trace!(connection = shared.id, channel, delivery_tag, "delivery routed");
            } else {
                debug!(channel, delivery_tag, "inbox closed; delivery dropped");
            }
        }
        None => warn!(
            connection = shared.id,
            channel,
            delivery_tag,
            "no channel registered for delivery; dropped"
        ),
    }
}
