use serde::{Deserialize, Serialize};

/// Delivery mode 1: the broker may keep the message in memory only.
pub const DELIVERY_MODE_TRANSIENT: u8 = 1;

/// Delivery mode 2: the broker should persist the message.
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Basic-class message properties. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Properties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_mode: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    /// Token copied from a request to its reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Queue a reply should be published to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

impl Properties {
    /// Properties for a persistent JSON message.
    pub fn json() -> Self {
        Self {
            content_type: Some(crate::codec::CONTENT_TYPE_JSON.to_string()),
            delivery_mode: Some(DELIVERY_MODE_PERSISTENT),
            ..Self::default()
        }
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the reply-to queue.
    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    /// Returns true if no property is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_empty() {
        assert!(Properties::default().is_empty());
        assert!(!Properties::json().is_empty());
    }

    #[test]
    fn json_properties_are_persistent() {
        let props = Properties::json();
        assert_eq!(props.content_type.as_deref(), Some("application/json"));
        assert_eq!(props.delivery_mode, Some(DELIVERY_MODE_PERSISTENT));
    }

    #[test]
    fn serializes_only_present_fields() {
        let props = Properties::default()
            .with_correlation_id("abc")
            .with_reply_to("amq.gen-1");
        let value = serde_json::to_value(&props).expect("properties should serialize");
        assert_eq!(
            value,
            serde_json::json!({"correlation_id": "abc", "reply_to": "amq.gen-1"})
        );
    }

    #[test]
    fn type_field_uses_wire_name() {
        let props: Properties =
            serde_json::from_str(r#"{"type":"error"}"#).expect("properties should parse");
        assert_eq!(props.msg_type.as_deref(), Some("error"));
    }
}
