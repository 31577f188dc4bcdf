use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use relaymq_broker::{BrokerError, Configuration, MessageBroker};
use relaymq_message::{Request, Response};
use relaymq_mux::CancellationToken;
use relaymq_transport::MemoryBroker;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::cmd::{parse_timeout, SoakArgs};
use crate::exit::{broker_error, CliError, CliResult, INTERNAL, SUCCESS, TIMEOUT, USAGE};
use crate::output::{millis, print_rows, OutputFormat, Row};

const SERVICE_ROUTING_KEY: &str = "soak";

#[derive(Debug, Serialize)]
struct Summary {
    requests: usize,
    completed: usize,
    timeouts: usize,
    errors: usize,
    min_ms: f64,
    p50_ms: f64,
    p99_ms: f64,
    max_ms: f64,
    requests_per_sec: f64,
}

impl Row for Summary {
    const HEADER: &'static [&'static str] = &[
        "REQUESTS", "COMPLETED", "TIMEOUTS", "ERRORS", "MIN_MS", "P50_MS", "P99_MS", "MAX_MS",
        "REQ/S",
    ];

    fn cells(&self) -> Vec<String> {
        vec![
            self.requests.to_string(),
            self.completed.to_string(),
            self.timeouts.to_string(),
            self.errors.to_string(),
            format!("{:.2}", self.min_ms),
            format!("{:.2}", self.p50_ms),
            format!("{:.2}", self.p99_ms),
            format!("{:.2}", self.max_ms),
            format!("{:.1}", self.requests_per_sec),
        ]
    }
}

#[derive(Default)]
struct Tally {
    latencies: Vec<Duration>,
    timeouts: usize,
    errors: usize,
    first_error: Option<BrokerError>,
    mismatched: usize,
}

pub fn run(args: SoakArgs, format: OutputFormat) -> CliResult<i32> {
    if args.requests == 0 || args.workers == 0 {
        return Err(CliError::new(USAGE, "--requests and --workers must be greater than zero"));
    }
    let timeout = parse_timeout(&args.timeout)?;

    let loopback = MemoryBroker::new();
    let broker = MessageBroker::from_url(&args.url, &loopback)
        .map_err(|err| broker_error("connecting", err))?;

    let service = Configuration::new("amq.direct", SERVICE_ROUTING_KEY);
    let server = broker
        .serve(&service, |request: &Request, response: &mut Response| {
            response.set_body(json!({ "echo": request.body().clone() }));
            true
        })
        .map_err(|err| broker_error("starting echo server", err))?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    ctrlc::set_handler(move || interrupt.cancel())
        .map_err(|err| CliError::new(INTERNAL, format!("installing interrupt handler: {err}")))?;

    info!(requests = args.requests, workers = args.workers, ?timeout, "soak started");
    let next = AtomicUsize::new(0);
    let tally = Mutex::new(Tally::default());
    let started = Instant::now();

    thread::scope(|scope| {
        for worker in 0..args.workers.min(args.requests) {
            let (broker, service, next, tally, cancel) = (&broker, &service, &next, &tally, &cancel);
            thread::Builder::new()
                .name(format!("relaymq-soak-{worker}"))
                .spawn_scoped(scope, move || {
                    drive(broker, service, args.requests, timeout, next, tally, cancel)
                })
                .map(drop)
                .unwrap_or_else(|err| warn!(worker, error = %err, "worker not started"));
        }
    });

    let elapsed = started.elapsed();
    if let Err(err) = server.stop() {
        warn!(error = %err, "echo server did not stop cleanly");
    }
    broker.close();

    let mut tally = tally.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
    tally.latencies.sort_unstable();
    let completed = tally.latencies.len();
    info!(
        completed,
        timeouts = tally.timeouts,
        errors = tally.errors,
        interrupted = cancel.is_cancelled(),
        "soak finished"
    );

    let summary = Summary {
        requests: args.requests,
        completed,
        timeouts: tally.timeouts,
        errors: tally.errors + tally.mismatched,
        min_ms: tally.latencies.first().copied().map_or(0.0, millis),
        p50_ms: percentile(&tally.latencies, 50),
        p99_ms: percentile(&tally.latencies, 99),
        max_ms: tally.latencies.last().copied().map_or(0.0, millis),
        requests_per_sec: if elapsed.is_zero() {
            0.0
        } else {
            completed as f64 / elapsed.as_secs_f64()
        },
    };
    print_rows("soak", std::slice::from_ref(&summary), format);

    if let Some(err) = tally.first_error {
        return Err(broker_error("rpc call", err));
    }
    if tally.mismatched > 0 {
        return Err(CliError::new(
            INTERNAL,
            format!("{} replies did not echo their request", tally.mismatched),
        ));
    }
    if tally.timeouts > 0 {
        return Err(CliError::new(
            TIMEOUT,
            format!("{} of {} calls timed out", tally.timeouts, args.requests),
        ));
    }
    Ok(SUCCESS)
}

fn drive(
    broker: &MessageBroker,
    service: &Configuration,
    requests: usize,
    timeout: Duration,
    next: &AtomicUsize,
    tally: &Mutex<Tally>,
    cancel: &CancellationToken,
) {
    while !cancel.is_cancelled() {
        let index = next.fetch_add(1, Ordering::Relaxed);
        if index >= requests {
            break;
        }

        let body = json!({ "seq": index });
        let sent = Instant::now();
        let outcome = broker.call_with_cancel(service, body.clone(), timeout, cancel);
        let latency = sent.elapsed();

        let mut tally = tally.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match outcome {
            Ok(Some(response)) if response.ok() && response.body()["echo"] == body => {
                tally.latencies.push(latency);
            }
            Ok(Some(response)) => {
                warn!(seq = index, body = %response.body(), "unexpected reply");
                tally.mismatched += 1;
            }
            Ok(None) if cancel.is_cancelled() => break,
            Ok(None) => tally.timeouts += 1,
            Err(err) => {
                warn!(seq = index, error = %err, "call failed");
                tally.errors += 1;
                tally.first_error.get_or_insert(err);
                if tally.first_error.as_ref().is_some_and(BrokerError::is_fatal) {
                    cancel.cancel();
                }
            }
        }
    }
}

/// Nearest-rank percentile of sorted latencies, in milliseconds.
fn percentile(sorted: &[Duration], pct: usize) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    millis(sorted[rank - 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_uses_nearest_rank() {
        let sorted: Vec<Duration> = (1..=100).map(Duration::from_millis).collect();
        assert_eq!(percentile(&sorted, 50), 50.0);
        assert_eq!(percentile(&sorted, 99), 99.0);
        assert_eq!(percentile(&sorted[..1], 99), 1.0);
        assert_eq!(percentile(&[], 50), 0.0);
    }

    #[test]
    fn rejects_zero_workers() {
        let args = SoakArgs {
            requests: 10,
            workers: 0,
            timeout: "1s".to_string(),
            url: crate::cmd::DEFAULT_URL.to_string(),
        };
        let err = run(args, OutputFormat::Json).expect_err("zero workers should fail");
        assert_eq!(err.code, USAGE);
    }
}
