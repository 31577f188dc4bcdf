use relaymq_message::Properties;
use relaymq_transport::{ExchangeKind, ExchangeOptions, QueueOptions};
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};

/// Exchange part of a [`Configuration`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub name: String,
    /// `direct`, `fanout` or `topic`. Empty means `direct`.
    #[serde(rename = "type")]
    pub kind: String,
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    /// Declare the exchange before use.
    pub declare: bool,
}

impl ExchangeConfig {
    /// Use an existing exchange without declaring it.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Declare the exchange with `kind` before use.
    pub fn with_declare(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind.as_str().to_string();
        self.declare = true;
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Resolve into declaration options.
    pub fn options(&self) -> Result<ExchangeOptions> {
        let kind = if self.kind.is_empty() {
            ExchangeKind::default()
        } else {
            self.kind
                .parse::<ExchangeKind>()
                .map_err(|err| BrokerError::InvalidConfiguration(format!("exchange: {err}")))?
        };
        Ok(ExchangeOptions {
            name: self.name.clone(),
            kind,
            passive: self.passive,
            durable: self.durable,
            auto_delete: self.auto_delete,
            internal: self.internal,
        })
    }
}

/// Queue part of a [`Configuration`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Empty with `declare` asks the broker to generate a name.
    pub name: String,
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    /// Declare the queue before use.
    pub declare: bool,
    /// Bind the queue to the exchange with the routing key.
    pub bind: bool,
}

impl QueueConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_declare(mut self) -> Self {
        self.declare = true;
        self
    }

    pub fn with_bind(mut self) -> Self {
        self.bind = true;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn options(&self) -> QueueOptions {
        QueueOptions {
            name: self.name.clone(),
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
        }
    }
}

/// What to declare and bind before publishing, calling, subscribing or
/// serving, plus the routing key and message properties to use.
///
/// Every flag defaults to false: nothing is declared or bound unless asked.
///
/// ```json
/// {
///   "exchange": { "name": "amq.direct" },
///   "queue": { "name": "settings", "declare": true, "bind": true },
///   "routing_key": "test",
///   "properties": { "content_type": "application/json" }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub exchange: ExchangeConfig,
    pub queue: QueueConfig,
    pub routing_key: String,
    pub properties: Properties,
}

impl Configuration {
    /// Target an existing exchange with a routing key.
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: ExchangeConfig::named(exchange),
            routing_key: routing_key.into(),
            ..Self::default()
        }
    }

    pub fn with_exchange(mut self, exchange: ExchangeConfig) -> Self {
        self.exchange = exchange;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| BrokerError::InvalidConfiguration(err.to_string()))
    }
}
