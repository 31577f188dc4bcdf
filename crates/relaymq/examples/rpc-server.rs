//! RPC example: a user-lookup server and a client calling it.
//!
//! Run with:
//!   cargo run --example rpc-server

use std::time::Duration;

use relaymq::broker::{Configuration, MessageBroker};
use relaymq::message::{Request, Response};
use relaymq::mux::ConnectionConfig;
use relaymq::transport::MemoryBroker;
use serde_json::json;

fn lookup(request: &Request, response: &mut Response) -> bool {
    if request.body()["query_name"] != "get-user-by-id" {
        response.set_body(json!({ "error": "unknown query" }));
        return false;
    }
    match request.body()["query_data"]["id"].as_u64() {
        Some(1) => {
            response.set_body(json!({ "id": 1, "name": "Alice" }));
            true
        }
        _ => {
            response.set_body(json!({ "error": "no such user" }));
            false
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let loopback = MemoryBroker::new();
    let broker = MessageBroker::connect(&ConnectionConfig::default(), &loopback)?;
    let service = Configuration::new("amq.direct", "users");

    let server = broker.serve(&service, lookup)?;

    for id in [1, 2] {
        let query = json!({ "query_name": "get-user-by-id", "query_data": { "id": id } });
        match broker.call(&service, query, Duration::from_secs(2))? {
            Some(response) if response.ok() => eprintln!("user {id}: {}", response.body()),
            Some(response) => eprintln!("user {id} failed: {}", response.body()),
            None => eprintln!("user {id}: no reply"),
        }
    }

    server.stop()?;
    broker.close();
    Ok(())
}
