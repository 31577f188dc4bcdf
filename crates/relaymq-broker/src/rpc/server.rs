use relaymq_message::{Envelope, Request, Response};
use relaymq_mux::{CancellationToken, Channel, MuxError};
use relaymq_transport::ConsumeOptions;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::Result;

/// Answers RPC requests.
///
/// `handle` fills in `response` and returns whether the request succeeded.
/// A `false` return tags the response as an error, whatever its body.
pub trait RequestHandler: Send + 'static {
    fn handle(&mut self, request: &Request, response: &mut Response) -> bool;
}

impl<F> RequestHandler for F
where
    F: FnMut(&Request, &mut Response) -> bool + Send + 'static,
{
    fn handle(&mut self, request: &Request, response: &mut Response) -> bool {
        self(request, response)
    }
}

/// Answer every request arriving on `queue` until `cancel` fires or the
/// connection closes.
///
/// Replies go to the default exchange with the request's `reply_to` as
/// routing key and carry its `correlation_id` unchanged.
pub fn serve<H: RequestHandler>(
    channel: &Channel,
    queue: &str,
    handler: &mut H,
    cancel: &CancellationToken,
) -> Result<()> {
    channel.consume(queue, &ConsumeOptions::default(), cancel, |channel, envelope| {
        respond(channel, handler, &envelope)
    })?;
    Ok(())
}

fn respond<H: RequestHandler>(
    channel: &Channel,
    handler: &mut H,
    envelope: &Envelope,
) -> std::result::Result<(), MuxError> {
    let inbound = &envelope.message.properties;
    let Some(reply_to) = inbound.reply_to.as_deref().filter(|queue| !queue.is_empty()) else {
        warn!(
            channel = channel.id(),
            delivery_tag = envelope.delivery_tag,
            "request without reply_to skipped"
        );
        return Ok(());
    };

    let mut response = answer(handler, envelope);
    let properties = response.properties_mut();
    properties.correlation_id = inbound.correlation_id.clone();
    properties.reply_to = Some(reply_to.to_string());

    let message = match response.to_message() {
        Ok(message) => message,
        Err(err) => {
            warn!(channel = channel.id(), error = %err, "response could not be encoded");
            return Ok(());
        }
    };
    match channel.publish("", reply_to, &message, false, false) {
        Ok(()) => {
            debug!(
                channel = channel.id(),
                request = response.id(),
                reply_to,
                ok = response.ok(),
                "reply published"
            );
            Ok(())
        }
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            warn!(channel = channel.id(), reply_to, error = %err, "reply not published");
            Ok(())
        }
    }
}

fn answer<H: RequestHandler>(handler: &mut H, envelope: &Envelope) -> Response {
    match Request::from_message(&envelope.message) {
        Ok(request) => {
            let mut response = Response::for_request(&request);
            if !handler.handle(&request, &mut response) {
                response.mark_error();
            }
            response
        }
        Err(err) => {
            warn!(delivery_tag = envelope.delivery_tag, error = %err, "undecodable request");
            let mut response = Response::new(0);
            response.set_body(json!({ "error": err.to_string() }));
            response.mark_error();
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use relaymq_message::{Message, MessageKind, Properties};
    use relaymq_mux::{Connection, ConnectionConfig};
    use relaymq_transport::{MemoryBroker, QueueOptions};
    use serde_json::Value;

    use super::*;
    use crate::rpc::{Progress, Reassembly};

    const SERVICE: &str = "rpc-server-test";

    fn connect(broker: &MemoryBroker) -> Connection {
        Connection::open(&ConnectionConfig::default(), broker).expect("connection should open")
    }

    fn start<H: RequestHandler>(connection: &Connection, mut handler: H) -> (CancellationToken, thread::JoinHandle<Result<()>>) {
        let channel = Channel::open(connection).expect("channel should open");
        channel
            .declare_queue(&QueueOptions::named(SERVICE), "", "")
            .expect("service queue should declare");
        let token = CancellationToken::new();
        let stop = token.clone();
        let handle = thread::spawn(move || serve(&channel, SERVICE, &mut handler, &stop));
        (token, handle)
    }

    /// Publish `message` to the service and read one reply from `reply_queue`.
    fn exchange_once(connection: &Connection, message: Message, reply_queue: &str) -> Option<Message> {
        let client = Channel::open(connection).expect("channel should open");
        client
            .declare_queue(&QueueOptions::named(reply_queue), "", "")
            .expect("reply queue should declare");
        client
            .publish("", SERVICE, &message, false, false)
            .expect("request should publish");
        client
            .start_consumer(reply_queue, &Default::default())
            .expect("reply consumer should start");

        let mut reassembly = Reassembly::new();
        loop {
            let frame = client
                .wait_frame(Duration::from_millis(300))
                .expect("frame wait should succeed")?;
            if let Progress::Complete(delivery) = reassembly.push(frame).expect("well formed") {
                return Some(delivery.message);
            }
        }
    }

    fn request(body: Value, correlation_id: &str, reply_to: &str) -> Message {
        let mut request = Request::new(9, body);
        *request.properties_mut() = Properties::json()
            .with_correlation_id(correlation_id)
            .with_reply_to(reply_to);
        request.to_message().expect("request should encode")
    }

    #[test]
    fn reply_copies_id_and_correlation() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker);
        let (token, server) = start(&connection, |request: &Request, response: &mut Response| {
            response.set_body(json!({ "echo": request.body().clone() }));
            true
        });

        let reply = exchange_once(&connection, request(json!(1), "corr-7", "replies-a"), "replies-a")
            .expect("reply should arrive");
        assert_eq!(reply.properties.correlation_id.as_deref(), Some("corr-7"));
        assert_eq!(reply.properties.msg_type.as_deref(), Some("response"));
        let response = Response::from_message(&reply).expect("reply should decode");
        assert_eq!(response.id(), 9);
        assert!(response.ok());
        assert_eq!(response.body(), &json!({ "echo": 1 }));

        token.cancel();
        server.join().expect("server thread").expect("serve should end cleanly");
    }

    #[test]
    fn false_return_marks_error() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker);
        let (token, server) = start(&connection, |_: &Request, response: &mut Response| {
            response.set_body(json!({ "id": 1, "name": "Alice" }));
            false
        });

        let reply = exchange_once(&connection, request(json!({}), "c", "replies-b"), "replies-b")
            .expect("reply should arrive");
        let response = Response::from_message(&reply).expect("reply should decode");
        assert!(!response.ok());
        assert_eq!(response.kind(), MessageKind::Error);

        token.cancel();
        server.join().expect("server thread").expect("serve should end cleanly");
    }

    #[test]
    fn undecodable_request_gets_error_reply() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker);
        let (token, server) = start(&connection, |_: &Request, _: &mut Response| -> bool {
            panic!("handler must not run for garbage")
        });

        let garbage = Message::with_properties(
            "{not json",
            Properties::default()
                .with_correlation_id("g")
                .with_reply_to("replies-c"),
        );
        let reply = exchange_once(&connection, garbage, "replies-c").expect("reply should arrive");
        let response = Response::from_message(&reply).expect("reply should decode");
        assert!(!response.ok());
        assert!(response.body()["error"].is_string());
        assert_eq!(reply.properties.correlation_id.as_deref(), Some("g"));

        token.cancel();
        server.join().expect("server thread").expect("serve should end cleanly");
    }

    #[test]
    fn request_without_reply_to_is_skipped() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker);
        let (token, server) = start(&connection, |_: &Request, _: &mut Response| true);

        let mut orphan = Request::new(1, json!({}));
        orphan.properties_mut().correlation_id = Some("o".to_string());
        let client = Channel::open(&connection).expect("channel should open");
        client
            .publish("", SERVICE, &orphan.to_message().expect("encode"), false, false)
            .expect("request should publish");

        let answered = exchange_once(&connection, request(json!({}), "next", "replies-d"), "replies-d")
            .expect("server should keep serving");
        assert_eq!(answered.properties.correlation_id.as_deref(), Some("next"));

        token.cancel();
        server.join().expect("server thread").expect("serve should end cleanly");
    }
}
