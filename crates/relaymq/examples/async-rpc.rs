//! Async RPC example: concurrent calls from tokio tasks.
//!
//! Run with:
//!   cargo run --example async-rpc --features async

use std::time::Duration;

use relaymq::broker::{AsyncMessageBroker, Configuration, MessageBroker};
use relaymq::message::{Request, Response};
use relaymq::mux::ConnectionConfig;
use relaymq::transport::MemoryBroker;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let loopback = MemoryBroker::new();
    let broker: AsyncMessageBroker =
        MessageBroker::connect(&ConnectionConfig::default(), &loopback)?.into();
    let service = Configuration::new("amq.direct", "square");

    let server = broker.blocking().serve(&service, |request: &Request, response: &mut Response| {
        match request.body()["n"].as_i64() {
            Some(n) => {
                response.set_body(json!({ "square": n * n }));
                true
            }
            None => false,
        }
    })?;

    let mut tasks = Vec::new();
    for n in 1..=5 {
        let broker = broker.clone();
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            broker.call(service, json!({ "n": n }), Duration::from_secs(2)).await
        }));
    }
    for task in tasks {
        match task.await?? {
            Some(response) => eprintln!("reply {}: {}", response.id(), response.body()),
            None => eprintln!("no reply"),
        }
    }

    server.stop()?;
    broker.blocking().close();
    Ok(())
}
