use std::time::{Duration, Instant};

use relaymq_broker::{Configuration, MessageBroker, QueueConfig};
use relaymq_message::{MessageKind, Request, Response};
use relaymq_mux::{Channel, ConnectionConfig};
use relaymq_transport::{MemoryBroker, QueueOptions};
use serde::Serialize;
use serde_json::{json, Value};

use crate::cmd::{parse_timeout, DemoArgs, Scenario};
use crate::exit::{broker_error, CliResult, FAILURE, SUCCESS};
use crate::output::{millis, print_rows, OutputFormat, Row};

#[derive(Debug, Serialize)]
struct Outcome {
    scenario: &'static str,
    passed: bool,
    detail: String,
    elapsed_ms: f64,
}

impl Row for Outcome {
    const HEADER: &'static [&'static str] = &["SCENARIO", "RESULT", "ELAPSED_MS", "DETAIL"];

    fn cells(&self) -> Vec<String> {
        vec![
            self.scenario.to_string(),
            if self.passed { "pass" } else { "FAIL" }.to_string(),
            format!("{:.2}", self.elapsed_ms),
            self.detail.clone(),
        ]
    }
}

/// Checks one scenario. `Err` carries the reason it failed.
type Check = Result<String, String>;

pub fn run(args: DemoArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_timeout(&args.timeout)?;
    let loopback = MemoryBroker::new();
    let broker = MessageBroker::connect(&ConnectionConfig::default(), &loopback)
        .map_err(|err| broker_error("connecting to loopback broker", err))?;

    let selected: &[Scenario] = match args.scenario {
        Scenario::All => &[
            Scenario::Publish,
            Scenario::Rpc,
            Scenario::RpcError,
            Scenario::Declare,
        ],
        ref one => std::slice::from_ref(one),
    };

    let outcomes: Vec<Outcome> = selected
        .iter()
        .map(|scenario| {
            let started = Instant::now();
            let check = match scenario {
                Scenario::Publish => publish(&broker, &loopback),
                Scenario::Rpc => rpc(&broker, timeout),
                Scenario::RpcError => rpc_error(&broker, timeout),
                Scenario::Declare | Scenario::All => declare(&broker, &loopback),
            };
            let elapsed_ms = millis(started.elapsed());
            let (passed, detail) = match check {
                Ok(detail) => (true, detail),
                Err(detail) => (false, detail),
            };
            tracing::info!(scenario = name(*scenario), passed, elapsed_ms, "scenario finished");
            Outcome {
                scenario: name(*scenario),
                passed,
                detail,
                elapsed_ms,
            }
        })
        .collect();

    broker.close();
    print_rows("demo", &outcomes, format);

    if outcomes.iter().all(|o| o.passed) {
        Ok(SUCCESS)
    } else {
        Ok(FAILURE)
    }
}

fn name(scenario: Scenario) -> &'static str {
    match scenario {
        Scenario::Publish => "publish",
        Scenario::Rpc => "rpc",
        Scenario::RpcError => "rpc-error",
        Scenario::Declare => "declare",
        Scenario::All => "all",
    }
}

/// Fire-and-forget publish lands in the bound queue exactly once.
fn publish(broker: &MessageBroker, loopback: &MemoryBroker) -> Check {
    let cfg = Configuration::new("amq.direct", "test")
        .with_queue(QueueConfig::named("demo.config").with_declare().with_bind());
    let body = json!({"config": {"config_name": "ip_address", "config_value": "192.168.1.1"}});

    broker
        .publish(&cfg, body.to_string())
        .map_err(|err| err.to_string())?;
    match loopback.queue_depth("demo.config") {
        Some(1) => Ok("enqueued once on amq.direct/test".to_string()),
        depth => Err(format!("expected one queued message, found {depth:?}")),
    }
}

fn lookup_user(request: &Request, response: &mut Response) -> bool {
    if request.body()["query_name"] == "get-user-by-id" {
        response.set_body(json!({"id": 1, "name": "Alice"}));
        true
    } else {
        false
    }
}

fn user_query() -> Value {
    json!({"query_name": "get-user-by-id", "query_data": {"id": 1}})
}

/// A served request comes back as a successful response with the handler's body.
fn rpc(broker: &MessageBroker, timeout: Duration) -> Check {
    let cfg = Configuration::new("amq.direct", "test");
    let server = broker.serve(&cfg, lookup_user).map_err(|err| err.to_string())?;
    let reply = broker.call(&cfg, user_query(), timeout);
    server.stop().map_err(|err| err.to_string())?;

    let response = reply
        .map_err(|err| err.to_string())?
        .ok_or_else(|| format!("no reply within {timeout:?}"))?;
    if !response.ok() {
        return Err("response tagged as error".to_string());
    }
    if response.body() != &json!({"id": 1, "name": "Alice"}) {
        return Err(format!("unexpected body {}", response.body()));
    }
    Ok(format!("reply {}", response.body()))
}

/// A handler that signals failure yields an error-tagged response.
fn rpc_error(broker: &MessageBroker, timeout: Duration) -> Check {
    let cfg = Configuration::new("amq.direct", "test.error");
    let server = broker
        .serve(&cfg, |_: &Request, response: &mut Response| {
            response.set_body(json!({"id": 1, "name": "Alice"}));
            false
        })
        .map_err(|err| err.to_string())?;
    let reply = broker.call(&cfg, user_query(), timeout);
    server.stop().map_err(|err| err.to_string())?;

    let response = reply
        .map_err(|err| err.to_string())?
        .ok_or_else(|| format!("no reply within {timeout:?}"))?;
    if response.ok() || response.kind() != MessageKind::Error {
        return Err("response not tagged as error".to_string());
    }
    Ok("response tagged as error".to_string())
}

/// A broker-named queue can be re-declared passively by its generated name.
fn declare(broker: &MessageBroker, loopback: &MemoryBroker) -> Check {
    let channel = Channel::open(broker.connection()).map_err(|err| err.to_string())?;
    let generated = channel
        .declare_queue(&QueueOptions::private(), "", "")
        .map_err(|err| err.to_string())?;
    if generated.is_empty() {
        return Err("broker returned an empty queue name".to_string());
    }

    let passive = QueueOptions {
        passive: true,
        ..QueueOptions::named(generated.clone())
    };
    let again = channel
        .declare_queue(&passive, "", "")
        .map_err(|err| err.to_string())?;
    if again != generated {
        return Err(format!("passive declare returned {again}, expected {generated}"));
    }
    if loopback.queue_depth(&generated) != Some(0) {
        return Err("passive declare changed the queue".to_string());
    }
    Ok(format!("generated {generated}"))
}
