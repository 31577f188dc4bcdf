use std::time::{Duration, Instant};

use relaymq_message::{Request, Response, CONTENT_TYPE_JSON, DELIVERY_MODE_PERSISTENT};
use relaymq_mux::{CancellationToken, Channel};
use relaymq_transport::{ConsumeOptions, QueueOptions};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::reassembly::{Progress, Reassembly};
use crate::error::Result;

/// Publish `request` and block until the correlated reply arrives.
///
/// The reply queue is private to this call and the correlation id is a
/// fresh UUID, so replies meant for other calls are skipped. Returns
/// `Ok(None)` when `timeout` expires, `cancel` fires, a frame wait fails
/// or a reply delivery is malformed. A matching reply whose body is not a
/// valid document is `Err(BrokerError::Codec)`.
///
/// The channel must not be consuming and must not be used by another call
/// at the same time. Frames still buffered for it when the call ends are
/// dropped, so the channel can be reused after a timeout. Stray frames
/// outside a delivery are skipped while waiting.
pub fn call(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    request: &Request,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<Option<Response>> {
    let deadline = Instant::now() + timeout;
    let reply_queue = channel.declare_queue(&QueueOptions::private(), "", "")?;
    let correlation_id = Uuid::new_v4().to_string();

    let mut request = request.clone();
    let properties = request.properties_mut();
    properties.reply_to = Some(reply_queue.clone());
    properties.correlation_id = Some(correlation_id.clone());
    properties.content_type = Some(CONTENT_TYPE_JSON.to_string());
    properties.delivery_mode = Some(DELIVERY_MODE_PERSISTENT);

    channel.publish(exchange, routing_key, &request.to_message()?, false, false)?;
    debug!(
        channel = channel.id(),
        exchange,
        routing_key,
        request = request.id(),
        reply_to = %reply_queue,
        correlation_id = %correlation_id,
        "request published"
    );

    let consumer = channel.start_consumer(&reply_queue, &ConsumeOptions::default())?;
    let outcome = await_reply(channel, &correlation_id, deadline, cancel);
    if channel.connection().is_open() {
        if let Err(err) = channel.cancel_consumer(&consumer) {
            debug!(channel = channel.id(), consumer = %consumer, error = %err, "reply consumer cancel failed");
        }
        match channel.discard_frames() {
            Ok(0) => {}
            Ok(dropped) => debug!(channel = channel.id(), dropped, "unread reply frames dropped"),
            Err(err) => debug!(channel = channel.id(), error = %err, "reply frame discard failed"),
        }
    }
    outcome
}

fn await_reply(
    channel: &Channel,
    correlation_id: &str,
    deadline: Instant,
    cancel: Option<&CancellationToken>,
) -> Result<Option<Response>> {
    let slice = channel.connection().config().poll_interval;
    let mut reassembly = Reassembly::new();
    loop {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            debug!(channel = channel.id(), correlation_id, "call cancelled");
            return Ok(None);
        }
        let now = Instant::now();
        if now >= deadline {
            debug!(channel = channel.id(), correlation_id, "call timed out");
            return Ok(None);
        }

        let frame = match channel.wait_frame(slice.min(deadline - now)) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(err) => {
                warn!(channel = channel.id(), error = %err, "waiting for reply failed");
                return Ok(None);
            }
        };

        let delivery = match reassembly.push(frame) {
            Ok(Progress::Pending) => continue,
            Ok(Progress::Complete(delivery)) => delivery,
            Err(err) => {
                warn!(channel = channel.id(), error = %err, "malformed reply delivery");
                return Ok(None);
            }
        };

        let received = delivery.message.properties.correlation_id.as_deref();
        if received != Some(correlation_id) {
            debug!(
                channel = channel.id(),
                expected = correlation_id,
                received = received.unwrap_or("<none>"),
                "skipping reply for another request"
            );
            continue;
        }

        let response = Response::from_message(&delivery.message)?;
        trace!(
            channel = channel.id(),
            request = response.id(),
            ok = response.ok(),
            "reply received"
        );
        return Ok(Some(response));
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use relaymq_message::{Envelope, Message, Properties};
    use relaymq_mux::{Connection, ConnectionConfig};
    use relaymq_transport::MemoryBroker;
    use serde_json::json;

    use super::*;
    use crate::error::BrokerError;

    const SERVICE: &str = "rpc-client-test";

    fn connect(broker: &MemoryBroker) -> Connection {
        Connection::open(&ConnectionConfig::default(), broker).expect("connection should open")
    }

    fn service_queue(connection: &Connection) -> Channel {
        let channel = Channel::open(connection).expect("channel should open");
        channel
            .declare_queue(&QueueOptions::named(SERVICE), "", "")
            .expect("service queue should declare");
        channel
    }

    /// Answer the first request on `SERVICE` with each of `replies`, in order.
    fn responder(
        connection: &Connection,
        replies: Vec<Box<dyn Fn(&Envelope) -> Message + Send>>,
    ) -> thread::JoinHandle<()> {
        let channel = service_queue(connection);
        thread::spawn(move || {
            let token = CancellationToken::new();
            channel
                .consume(SERVICE, &ConsumeOptions::default(), &token, |channel, envelope| {
                    let reply_to = envelope
                        .message
                        .properties
                        .reply_to
                        .clone()
                        .expect("request should carry reply_to");
                    for reply in &replies {
                        channel.publish("", &reply_to, &reply(&envelope), false, false)?;
                    }
                    token.cancel();
                    Ok(())
                })
                .expect("responder should consume");
        })
    }

    fn reply_message(correlation_id: Option<&str>, body: &str) -> Message {
        let mut properties = Properties::json();
        properties.correlation_id = correlation_id.map(str::to_string);
        Message::with_properties(body.to_string(), properties)
    }

    fn correlation_of(envelope: &Envelope) -> Option<&str> {
        envelope.message.properties.correlation_id.as_deref()
    }

    #[test]
    fn request_carries_reply_properties() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker);
        let _service = service_queue(&connection);
        let client = Channel::open(&connection).expect("channel should open");

        let outcome = call(
            &client,
            "",
            SERVICE,
            &Request::new(1, json!({"ping": true})),
            Duration::from_millis(20),
            None,
        )
        .expect("call should run");
        assert!(outcome.is_none());

        let inspector = Channel::open(&connection).expect("channel should open");
        inspector
            .start_consumer(SERVICE, &ConsumeOptions::default())
            .expect("consumer should start");
        let mut reassembly = Reassembly::new();
        let delivery = loop {
            let frame = inspector
                .wait_frame(Duration::from_secs(1))
                .expect("frame wait should succeed")
                .expect("request should be queued");
            if let Progress::Complete(delivery) = reassembly.push(frame).expect("well formed") {
                break delivery;
            }
        };
        let properties = delivery.message.properties;
        assert_eq!(properties.content_type.as_deref(), Some(CONTENT_TYPE_JSON));
        assert_eq!(properties.delivery_mode, Some(DELIVERY_MODE_PERSISTENT));
        assert_eq!(properties.msg_type.as_deref(), Some("request"));
        assert!(properties
            .reply_to
            .as_deref()
            .is_some_and(|q| q.starts_with("amq.gen-")));
        let correlation_id = properties.correlation_id.expect("correlation id is set");
        assert!(Uuid::parse_str(&correlation_id).is_ok());
    }

    #[test]
    fn skips_foreign_correlation_ids() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker);
        let server = responder(
            &connection,
            vec![
                Box::new(|_: &Envelope| {
                    reply_message(Some("not-yours"), r#"{"id":1,"type":"response","body":"wrong"}"#)
                }),
                Box::new(|_: &Envelope| {
                    reply_message(None, r#"{"id":1,"type":"response","body":"anonymous"}"#)
                }),
                Box::new(|env: &Envelope| {
                    reply_message(correlation_of(env), r#"{"id":1,"type":"response","body":"right"}"#)
                }),
            ],
        );

        let client = Channel::open(&connection).expect("channel should open");
        let response = call(
            &client,
            "",
            SERVICE,
            &Request::new(1, json!({})),
            Duration::from_secs(5),
            None,
        )
        .expect("call should succeed")
        .expect("correlated reply should arrive");
        assert_eq!(response.body(), &json!("right"));
        server.join().expect("responder should finish");
    }

    #[test]
    fn times_out_without_a_server() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker);
        let client = Channel::open(&connection).expect("channel should open");

        let timeout = Duration::from_millis(100);
        let started = Instant::now();
        let outcome = call(&client, "amq.direct", "nobody", &Request::new(1, json!({})), timeout, None)
            .expect("unroutable call still runs");
        let elapsed = started.elapsed();

        assert!(outcome.is_none());
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(500));
    }

    #[test]
    fn cancellation_returns_none() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker);
        let client = Channel::open(&connection).expect("channel should open");

        let token = CancellationToken::new();
        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            canceller.cancel();
        });

        let started = Instant::now();
        let outcome = call(
            &client,
            "amq.direct",
            "nobody",
            &Request::new(1, json!({})),
            Duration::from_secs(10),
            Some(&token),
        )
        .expect("call should run");
        assert!(outcome.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().expect("canceller should finish");
    }

    #[test]
    fn malformed_matching_reply_is_a_codec_error() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker);
        let server = responder(
            &connection,
            vec![Box::new(|env: &Envelope| {
                reply_message(correlation_of(env), "not json")
            })],
        );

        let client = Channel::open(&connection).expect("channel should open");
        let err = call(
            &client,
            "",
            SERVICE,
            &Request::new(1, json!({})),
            Duration::from_secs(5),
            None,
        )
        .expect_err("garbage reply should fail");
        assert!(matches!(err, BrokerError::Codec(_)));
        server.join().expect("responder should finish");
    }

    #[test]
    fn channel_is_reusable_across_calls() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker);
        let client = Channel::open(&connection).expect("channel should open");
        let timeout = Duration::from_millis(10);

        for id in 1..=2 {
            let outcome = call(&client, "amq.direct", "nobody", &Request::new(id, json!({})), timeout, None)
                .expect("call should run");
            assert!(outcome.is_none());
        }
        assert!(connection.registered_channels().is_empty());
    }

    #[test]
    fn reused_channel_skips_and_drops_stale_frames() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker);
        let client = Channel::open(&connection).expect("channel should open");

        let leftover = client
            .declare_queue(&QueueOptions::private(), "", "")
            .expect("queue should declare");
        client
            .publish("", &leftover, &Message::new("stale"), false, false)
            .expect("publish should succeed");
        let tag = client
            .start_consumer(&leftover, &ConsumeOptions::default())
            .expect("consumer should start");
        client
            .wait_frame(Duration::from_secs(1))
            .expect("frame wait should succeed")
            .expect("deliver frame should arrive");
        client.cancel_consumer(&tag).expect("cancel should succeed");

        let server = responder(
            &connection,
            vec![
                Box::new(|env: &Envelope| {
                    reply_message(correlation_of(env), r#"{"id":1,"type":"response","body":"fresh"}"#)
                }),
                Box::new(|_: &Envelope| {
                    reply_message(Some("late"), r#"{"id":2,"type":"response","body":"late"}"#)
                }),
            ],
        );
        let response = call(
            &client,
            "",
            SERVICE,
            &Request::new(1, json!({})),
            Duration::from_secs(5),
            None,
        )
        .expect("call should succeed")
        .expect("reply should arrive");
        assert_eq!(response.body(), &json!("fresh"));
        server.join().expect("responder should finish");
        assert_eq!(broker.buffered_frames(), 0);
    }
}
