//! Event envelope and per-delivery context
//!
//! The envelope is the on-wire value for every Relay event. Field names are
//! part of the wire contract and must not change. `event_id` doubles as the
//! bus idempotency key: it is written into the `Nats-Msg-Id` header on every
//! publish so JetStream deduplicates redundant sends.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::EnvelopeError;

/// Current envelope schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Maximum encoded envelope size accepted by the main bus (1 MiB).
pub const MAX_PAYLOAD_BYTES: usize = 1_048_576;

/// Idempotency header consumed by JetStream duplicate detection.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";
/// Topic header mirrored from the envelope for header-only consumers.
pub const TOPIC_HEADER: &str = "topic";
/// Trace propagation header.
pub const TRACE_ID_HEADER: &str = "trace_id";

/// Standard event envelope wrapping every published message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event identifier (idempotency key)
    pub event_id: Uuid,

    /// Envelope schema version
    pub schema_version: u32,

    /// Logical topic the event was published under
    pub topic: String,

    /// Application that produced the event
    pub producer: String,

    /// UTC timestamp set by the producer
    pub occurred_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Event-specific payload
    pub message: Value,

    // Legacy event coordinates, present when published through the
    // domain/resource/action form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl EventEnvelope {
    /// Create an envelope with a generated event id and the current time.
    ///
    /// `resource_id` is derived from `message.id` / `message.ID` when
    /// present. The message itself is never mutated.
    pub fn new(topic: impl Into<String>, producer: impl Into<String>, message: Value) -> Self {
        let resource_id = derive_resource_id(&message);
        Self {
            event_id: Uuid::new_v4(),
            schema_version: SCHEMA_VERSION,
            topic: topic.into(),
            producer: producer.into(),
            occurred_at: Utc::now(),
            trace_id: None,
            correlation_id: None,
            message,
            domain: None,
            resource: None,
            action: None,
            resource_id,
        }
    }

    /// Override the event id (callers supplying their own idempotency key).
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    /// Override the producer-side timestamp.
    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Attach legacy event coordinates.
    pub fn with_legacy(
        mut self,
        domain: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        self.domain = Some(domain.into());
        self.resource = Some(resource.into());
        self.action = Some(action.into());
        self
    }

    /// Serialize the envelope to its wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Serialization {
            message: e.to_string(),
        })
    }

    /// Parse an envelope from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::MalformedPayload {
            message: e.to_string(),
        })
    }

    /// Build publish headers for this envelope.
    ///
    /// Always sets the bus idempotency header to the event id and mirrors
    /// the topic; propagates `trace_id` when present. `extras` are merged in
    /// first so the contract headers cannot be overridden.
    pub fn headers(&self, extras: HashMap<String, String>) -> HashMap<String, String> {
        let mut headers = extras;
        headers.insert(MSG_ID_HEADER.to_string(), self.event_id.to_string());
        headers.insert(TOPIC_HEADER.to_string(), self.topic.clone());
        if let Some(trace_id) = &self.trace_id {
            headers.insert(TRACE_ID_HEADER.to_string(), trace_id.clone());
        }
        headers
    }
}

fn derive_resource_id(message: &Value) -> Option<String> {
    let id = message.get("id").or_else(|| message.get("ID"))?;
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Immutable per-delivery metadata handed to handlers alongside the message.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub event_id: Uuid,
    pub subject: String,
    pub topic: String,
    pub trace_id: Option<String>,
    pub correlation_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    /// 1-based delivery attempt counter
    pub deliveries: u64,
    pub stream: String,
    pub stream_seq: u64,
    pub producer: String,
}

impl MessageContext {
    pub fn from_delivery(
        envelope: &EventEnvelope,
        subject: &str,
        deliveries: u64,
        stream: &str,
        stream_seq: u64,
    ) -> Self {
        Self {
            event_id: envelope.event_id,
            subject: subject.to_string(),
            topic: envelope.topic.clone(),
            trace_id: envelope.trace_id.clone(),
            correlation_id: envelope.correlation_id.clone(),
            occurred_at: envelope.occurred_at,
            deliveries,
            stream: stream.to_string(),
            stream_seq,
            producer: envelope.producer.clone(),
        }
    }
}
