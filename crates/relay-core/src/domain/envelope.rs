//! Envelope - すべてのパターンを流れる共通メッセージ
//!
//! # 設計原則
//! - `payload` は公開 setter を持たない。内容を変えるステージは
//!   [`Envelope::with_payload`] で新しい Envelope を作る（copy-on-write）
//! - `metadata` は横断的な注記（trace id, audit trail など）でステージ間で変更可能
//! - 派生した Envelope は同じ `id` を引き継ぐ（同一メッセージの改訂）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::TransportError;
use super::ids::MessageId;

/// Business content of an envelope.
pub type Payload = serde_json::Map<String, Value>;

/// Cross-cutting annotations of an envelope.
pub type Metadata = serde_json::Map<String, Value>;

/// Metadata key holding the topic of an Event envelope.
pub const TOPIC_KEY: &str = "topic";

/// Metadata key holding the command type of a Command envelope.
pub const COMMAND_TYPE_KEY: &str = "command_type";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Task,
    Event,
    Command,
    Query,
    Response,
}

/// Advisory only: nothing in the engines schedules by priority.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: MessageId,
    kind: MessageKind,
    source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    destination: Option<String>,
    #[serde(default)]
    priority: Priority,
    created_at: DateTime<Utc>,
    #[serde(default)]
    payload: Payload,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
}

impl Envelope {
    pub fn new(kind: MessageKind, source: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: MessageId::generate(),
            kind,
            source: source.into(),
            destination: None,
            priority: Priority::Normal,
            created_at: Utc::now(),
            payload,
            metadata: Metadata::new(),
            correlation_id: None,
        }
    }

    pub fn task(source: impl Into<String>, payload: Payload) -> Self {
        Self::new(MessageKind::Task, source, payload)
    }

    /// Event envelope; the topic is carried in `metadata.topic`.
    pub fn event(source: impl Into<String>, topic: &str, payload: Payload) -> Self {
        Self::new(MessageKind::Event, source, payload).with_metadata(TOPIC_KEY, topic)
    }

    /// Command envelope; the command type is carried in `metadata.command_type`.
    pub fn command(source: impl Into<String>, command_type: &str, parameters: Payload) -> Self {
        Self::new(MessageKind::Command, source, parameters)
            .with_metadata(COMMAND_TYPE_KEY, command_type)
    }

    /// Response linked back to this envelope.
    ///
    /// `correlation_id` is this envelope's id and the reply is addressed to
    /// this envelope's source.
    pub fn reply(&self, source: impl Into<String>, payload: Payload) -> Self {
        let mut reply = Self::new(MessageKind::Response, source, payload);
        reply.destination = Some(self.source.clone());
        reply.correlation_id = Some(self.id.to_string());
        reply.priority = self.priority;
        reply
    }

    // ---- builder ----

    /// Replaces the generated id. Only for engines minting ids through an
    /// [`IdGenerator`](crate::ports::IdGenerator).
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    pub fn to(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    // ---- copy-on-write ----

    /// New revision of this envelope carrying `payload`. `self` is untouched.
    pub fn with_payload(&self, payload: Payload) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }

    /// New revision whose payload is `f(copy of current payload)`.
    pub fn map_payload(&self, f: impl FnOnce(Payload) -> Payload) -> Self {
        self.with_payload(f(self.payload.clone()))
    }

    // ---- metadata (mutable across stages) ----

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    // ---- accessors ----

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn topic(&self) -> Option<&str> {
        self.metadata.get(TOPIC_KEY).and_then(Value::as_str)
    }

    // ---- wire body ----

    pub fn to_json(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::Codec(e.to_string()))
    }

    pub fn from_json(body: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(body).map_err(|e| TransportError::Codec(e.to_string()))
    }
}

/// Builds a [`Payload`] from a `serde_json::json!` object literal.
///
/// Non-object values are wrapped as `{"value": ...}`.
pub fn payload_from(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Payload::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn with_payload_leaves_original_untouched() {
        let original = Envelope::task("producer", payload_from(json!({"name": "joe"})));
        let revised = original.map_payload(|mut p| {
            p.insert("name".into(), json!("JOE"));
            p
        });

        assert_eq!(original.payload()["name"], "joe");
        assert_eq!(revised.payload()["name"], "JOE");
        assert_eq!(original.id(), revised.id());
    }

    #[test]
    fn reply_links_back_to_request() {
        let request = Envelope::task("producer", Payload::new()).with_priority(Priority::High);
        let reply = request.reply("worker", payload_from(json!({"result": 6})));

        assert_eq!(reply.kind(), MessageKind::Response);
        let expected = request.id().to_string();
        assert_eq!(reply.correlation_id(), Some(expected.as_str()));
        assert_eq!(reply.destination(), Some("producer"));
        assert_eq!(reply.priority(), Priority::High);
        assert_ne!(reply.id(), request.id());
    }

    #[test]
    fn event_carries_topic_in_metadata() {
        let e = Envelope::event("publisher", "orders", Payload::new());
        assert_eq!(e.kind(), MessageKind::Event);
        assert_eq!(e.topic(), Some("orders"));
    }

    #[test]
    fn priorities_are_ordered() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::High < Priority::Critical);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn wire_body_decodes_to_same_envelope() {
        let e = Envelope::task("producer", payload_from(json!({"task": "sum", "data": [1, 2, 3]})))
            .with_metadata("trace_id", "t-1");
        let body = e.to_json().unwrap();
        assert_eq!(Envelope::from_json(&body).unwrap(), e);
    }

    #[test]
    fn garbage_body_is_a_codec_error() {
        let err = Envelope::from_json(b"not json").unwrap_err();
        assert!(matches!(err, TransportError::Codec(_)));
    }

    #[test]
    fn payload_from_wraps_scalars() {
        assert_eq!(payload_from(json!(5))["value"], 5);
    }
}
