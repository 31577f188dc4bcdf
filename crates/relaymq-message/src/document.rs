use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{decode, encode};
use crate::error::Result;
use crate::message::Message;
use crate::properties::Properties;

/// Document type tag: request.
pub const MESSAGE_TYPE_REQUEST: &str = "request";
/// Document type tag: successful response.
pub const MESSAGE_TYPE_RESPONSE: &str = "response";
/// Document type tag: application-level failure.
pub const MESSAGE_TYPE_ERROR: &str = "error";

/// Type tag of an RPC document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Error,
}

impl MessageKind {
    /// Wire name of the tag.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Request => MESSAGE_TYPE_REQUEST,
            MessageKind::Response => MESSAGE_TYPE_RESPONSE,
            MessageKind::Error => MESSAGE_TYPE_ERROR,
        }
    }
}

/// The `{id, type, body}` triplet carried by RPC messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub body: Value,
}

impl Document {
    pub fn new(id: u64, kind: MessageKind, body: Value) -> Self {
        Self { id, kind, body }
    }
}

/// An RPC request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    document: Document,
    properties: Properties,
}

impl Request {
    /// Create a request carrying `body`.
    pub fn new(id: u64, body: Value) -> Self {
        Self {
            document: Document::new(id, MessageKind::Request, body),
            properties: Properties::json(),
        }
    }

    /// Decode a request from a delivered message.
    ///
    /// The type tag is not checked: whatever arrives on a serve queue is
    /// treated as a request.
    pub fn from_message(message: &Message) -> Result<Self> {
        Ok(Self {
            document: decode(&message.body)?,
            properties: message.properties.clone(),
        })
    }

    /// Encode this request into a publishable message.
    pub fn to_message(&self) -> Result<Message> {
        to_message(&self.document, &self.properties)
    }

    pub fn id(&self) -> u64 {
        self.document.id
    }

    pub fn body(&self) -> &Value {
        &self.document.body
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }
}

/// An RPC response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    document: Document,
    properties: Properties,
}

impl Response {
    /// Create an empty successful response.
    pub fn new(id: u64) -> Self {
        Self {
            document: Document::new(id, MessageKind::Response, Value::Null),
            properties: Properties::json(),
        }
    }

    /// Create an empty successful response answering `request`.
    pub fn for_request(request: &Request) -> Self {
        Self::new(request.id())
    }

    /// Decode a response from a delivered message.
    pub fn from_message(message: &Message) -> Result<Self> {
        Ok(Self {
            document: decode(&message.body)?,
            properties: message.properties.clone(),
        })
    }

    /// Encode this response into a publishable message.
    pub fn to_message(&self) -> Result<Message> {
        to_message(&self.document, &self.properties)
    }

    /// True unless the response is tagged as an error.
    pub fn ok(&self) -> bool {
        self.document.kind != MessageKind::Error
    }

    /// Tag this response as an application-level failure.
    pub fn mark_error(&mut self) {
        self.document.kind = MessageKind::Error;
    }

    pub fn set_body(&mut self, body: Value) {
        self.document.body = body;
    }

    pub fn id(&self) -> u64 {
        self.document.id
    }

    pub fn kind(&self) -> MessageKind {
        self.document.kind
    }

    pub fn body(&self) -> &Value {
        &self.document.body
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }
}

fn to_message(document: &Document, properties: &Properties) -> Result<Message> {
    let mut properties = properties.clone();
    properties.msg_type = Some(document.kind.as_str().to_string());
    if properties.content_type.is_none() {
        properties.content_type = Some(crate::codec::CONTENT_TYPE_JSON.to_string());
    }
    Ok(Message::with_properties(encode(document)?, properties))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn response_ok_depends_only_on_type_tag() {
        let mut response = Response::new(7);
        response.set_body(json!({"id": 1, "name": "Alice"}));
        assert!(response.ok());

        response.mark_error();
        assert!(!response.ok());
        assert_eq!(response.kind(), MessageKind::Error);
        assert_eq!(response.body(), &json!({"id": 1, "name": "Alice"}));
    }

    #[test]
    fn request_message_carries_type_and_content_type() {
        let request = Request::new(3, json!({"query_name": "get-user-by-id"}));
        let message = request.to_message().expect("request should encode");

        assert_eq!(message.properties.msg_type.as_deref(), Some("request"));
        assert_eq!(
            message.properties.content_type.as_deref(),
            Some("application/json")
        );

        let decoded = Request::from_message(&message).expect("request should decode");
        assert_eq!(decoded.document(), request.document());
        assert_eq!(decoded.properties(), &message.properties);
    }

    #[test]
    fn response_for_request_copies_id() {
        let request = Request::new(42, Value::Null);
        let response = Response::for_request(&request);
        assert_eq!(response.id(), 42);
        assert_eq!(response.kind(), MessageKind::Response);
    }

    #[test]
    fn response_from_error_message() {
        let message = Message::new(r#"{"id":1,"type":"error","body":{"reason":"nope"}}"#);
        let response = Response::from_message(&message).expect("response should decode");
        assert!(!response.ok());
        assert_eq!(response.body()["reason"], "nope");
    }

    #[test]
    fn from_message_rejects_garbage() {
        let message = Message::new("not json");
        assert!(Request::from_message(&message).is_err());
    }
}
