//! Tokio front-end for [`MessageBroker`].
//!
//! Every operation runs the blocking implementation on the blocking thread
//! pool, so async callers never stall a runtime worker on the connection
//! lock or an RPC wait.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use relaymq_message::Response;
use relaymq_mux::CancellationToken;
use serde_json::Value;

use crate::broker::MessageBroker;
use crate::config::Configuration;
use crate::error::{BrokerError, Result};

/// Cloneable async handle to a shared [`MessageBroker`].
#[derive(Debug, Clone)]
pub struct AsyncMessageBroker {
    inner: Arc<MessageBroker>,
}

impl AsyncMessageBroker {
    pub fn new(broker: MessageBroker) -> Self {
        Self {
            inner: Arc::new(broker),
        }
    }

    /// The blocking broker, for `subscribe`, `serve` and `close`.
    pub fn blocking(&self) -> &MessageBroker {
        &self.inner
    }

    pub async fn publish(&self, configuration: Configuration, body: Bytes) -> Result<()> {
        let broker = Arc::clone(&self.inner);
        run_blocking(move || broker.publish(&configuration, body)).await
    }

    /// Dropping the returned future abandons the wait.
    pub async fn call(
        &self,
        configuration: Configuration,
        body: Value,
        timeout: Duration,
    ) -> Result<Option<Response>> {
        let broker = Arc::clone(&self.inner);
        let cancel = CancellationToken::new();
        let _abandon = cancel.clone().drop_guard();
        run_blocking(move || broker.call_with_cancel(&configuration, body, timeout, &cancel)).await
    }
}

impl From<MessageBroker> for AsyncMessageBroker {
    fn from(broker: MessageBroker) -> Self {
        Self::new(broker)
    }
}

async fn run_blocking<T, F>(op: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| BrokerError::Panicked(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use relaymq_message::{Request, Response};
    use relaymq_mux::ConnectionConfig;
    use relaymq_transport::MemoryBroker;
    use serde_json::json;

    use super::*;
    use crate::config::QueueConfig;

    fn connect(loopback: &MemoryBroker) -> AsyncMessageBroker {
        MessageBroker::connect(&ConnectionConfig::default(), loopback)
            .expect("broker should connect")
            .into()
    }

    #[tokio::test]
    async fn publish_enqueues() {
        let loopback = MemoryBroker::new();
        let broker = connect(&loopback);
        let cfg = Configuration::new("amq.direct", "async")
            .with_queue(QueueConfig::named("async").with_declare().with_bind());

        broker
            .publish(cfg, Bytes::from_static(b"{}"))
            .await
            .expect("publish should succeed");
        assert_eq!(loopback.queue_depth("async"), Some(1));
    }

    #[tokio::test]
    async fn call_round_trip() {
        let loopback = MemoryBroker::new();
        let broker = connect(&loopback);
        let service = Configuration::new("amq.direct", "async-rpc");
        let _server = broker
            .blocking()
            .serve(&service, |request: &Request, response: &mut Response| {
                response.set_body(json!({ "seen": request.id() }));
                true
            })
            .expect("serve should start");

        let response = broker
            .call(service, json!({}), Duration::from_secs(5))
            .await
            .expect("call should succeed")
            .expect("reply should arrive");
        assert!(response.ok());
        assert_eq!(response.body()["seen"], 1);
    }

    #[tokio::test]
    async fn dropped_call_is_abandoned() {
        let loopback = MemoryBroker::new();
        let broker = connect(&loopback);
        let cfg = Configuration::new("amq.direct", "nobody");

        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            broker.call(cfg, json!({}), Duration::from_secs(30)),
        )
        .await;
        assert!(outcome.is_err());
    }
}
