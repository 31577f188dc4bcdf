#![cfg(feature = "broker")]

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use relaymq::broker::{BrokerError, Configuration, MessageBroker, QueueConfig};
use relaymq::message::{MessageKind, Request, Response};
use relaymq::mux::{Channel, ConnectionConfig};
use relaymq::transport::{MemoryBroker, QueueOptions};
use serde_json::{json, Value};

fn connect(loopback: &MemoryBroker) -> MessageBroker {
    MessageBroker::connect(&ConnectionConfig::default(), loopback).expect("broker should connect")
}

fn user_query() -> Value {
    json!({ "query_name": "get-user-by-id", "query_data": { "id": 1 } })
}

#[test]
fn publish_enqueues_exactly_once() {
    let loopback = MemoryBroker::new();
    let broker = connect(&loopback);
    let cfg = Configuration::new("amq.direct", "test")
        .with_queue(QueueConfig::named("config").with_declare().with_bind());
    let body = json!({ "config": { "config_name": "ip_address", "config_value": "192.168.1.1" } });

    broker.publish(&cfg, body.to_string()).expect("publish should succeed");
    assert_eq!(loopback.queue_depth("config"), Some(1));

    let (tx, rx) = mpsc::channel();
    let subscription = broker
        .subscribe(&cfg, move |envelope| {
            let _ = tx.send(envelope);
        })
        .expect("subscribe should start");
    let envelope = rx
        .recv_timeout(Duration::from_secs(2))
        .expect("queued message should be delivered");
    let delivered: Value =
        serde_json::from_slice(&envelope.message.body).expect("body should be json");
    assert_eq!(delivered, body);
    assert_eq!(envelope.routing_key, "test");
    subscription.stop().expect("subscription should stop");
}

#[test]
fn rpc_round_trip_returns_handler_body() {
    let loopback = MemoryBroker::new();
    let broker = connect(&loopback);
    let service = Configuration::new("amq.direct", "test");
    let server = broker
        .serve(&service, |request: &Request, response: &mut Response| {
            assert_eq!(request.body()["query_name"], "get-user-by-id");
            response.set_body(json!({ "id": 1, "name": "Alice" }));
            true
        })
        .expect("serve should start");

    let response = broker
        .call(&service, user_query(), Duration::from_secs(2))
        .expect("call should succeed")
        .expect("reply should arrive");
    assert!(response.ok());
    assert_eq!(response.kind(), MessageKind::Response);
    assert_eq!(response.id(), 1);
    assert_eq!(response.body(), &json!({ "id": 1, "name": "Alice" }));
    server.stop().expect("server should stop");
}

#[test]
fn failing_handler_yields_error_response() {
    let loopback = MemoryBroker::new();
    let broker = connect(&loopback);
    let service = Configuration::new("amq.direct", "test");
    let server = broker
        .serve(&service, |_: &Request, response: &mut Response| {
            response.set_body(json!({ "id": 1, "name": "Alice" }));
            false
        })
        .expect("serve should start");

    let response = broker
        .call(&service, user_query(), Duration::from_secs(2))
        .expect("call should succeed")
        .expect("reply should arrive");
    assert!(!response.ok());
    assert_eq!(response.kind(), MessageKind::Error);
    server.stop().expect("server should stop");
}

#[test]
fn generated_queue_redeclares_passively() {
    let loopback = MemoryBroker::new();
    let broker = connect(&loopback);
    let channel = Channel::open(broker.connection()).expect("channel should open");

    let generated = channel
        .declare_queue(&QueueOptions::private(), "", "")
        .expect("private declare should succeed");
    assert!(generated.starts_with("amq.gen-"));

    let passive = QueueOptions {
        passive: true,
        ..QueueOptions::named(generated.clone())
    };
    let again = channel
        .declare_queue(&passive, "", "")
        .expect("passive declare should succeed");
    assert_eq!(again, generated);
}

#[test]
fn call_without_server_times_out() {
    let loopback = MemoryBroker::new();
    let broker = connect(&loopback);
    let service = Configuration::new("amq.direct", "nobody-home");

    let timeout = Duration::from_millis(150);
    let started = Instant::now();
    let outcome = broker
        .call(&service, json!({}), timeout)
        .expect("unanswered call still succeeds");
    assert!(outcome.is_none());
    assert!(started.elapsed() >= timeout);
}

#[test]
fn parallel_callers_receive_their_own_replies() {
    let loopback = MemoryBroker::new();
    let broker = connect(&loopback);
    let service = Configuration::new("amq.direct", "echo");
    let server = broker
        .serve(&service, |request: &Request, response: &mut Response| {
            response.set_body(request.body().clone());
            true
        })
        .expect("serve should start");

    thread::scope(|scope| {
        for worker in 0..4 {
            let (broker, service) = (&broker, &service);
            scope.spawn(move || {
                for seq in 0..10 {
                    let body = json!({ "worker": worker, "seq": seq });
                    let response = broker
                        .call(service, body.clone(), Duration::from_secs(2))
                        .expect("call should succeed")
                        .expect("reply should arrive");
                    assert_eq!(response.body(), &body);
                }
            });
        }
    });
    server.stop().expect("server should stop");
}

#[test]
fn closed_broker_rejects_operations() {
    let loopback = MemoryBroker::new();
    let broker = connect(&loopback);
    broker.close();
    assert!(!broker.is_open());

    let cfg = Configuration::new("amq.direct", "test");
    let err = broker
        .publish(&cfg, "{}")
        .expect_err("publish on a closed broker should fail");
    assert!(matches!(err, BrokerError::Mux(_)));
}
