//! Dead-letter routing
//!
//! Builds a DLQ envelope around the failed delivery (original bytes kept as
//! base64), stamps the `x-dlq-*` headers, and publishes to the configured
//! dead-letter subject. The DLQ stream is provisioned lazily before the
//! first publish; the latch only sets on success so a failed provision is
//! retried next time. A failed DLQ publish returns `false` and never
//! raises; the processor falls back to nak/term.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{error, warn};

use relay_domain::envelope::EventEnvelope;
use relay_ports::{BusClient, DeliveryInfo, Headers, Metrics};

use crate::topology::TopologyManager;

/// Marker header on every dead-lettered message.
pub const DEAD_LETTER_HEADER: &str = "x-dead-letter";
/// Why the message was dead-lettered.
pub const DLQ_REASON_HEADER: &str = "x-dlq-reason";
/// Delivery attempts at the time of routing.
pub const DLQ_DELIVERIES_HEADER: &str = "x-deliveries";
/// Original envelope JSON, when it was parseable.
pub const DLQ_CONTEXT_HEADER: &str = "x-dlq-context";

/// Why a message ended up on the dead-letter stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    MalformedPayload,
    Unrecoverable,
    MaxDeliverExceeded,
    HandlerError,
}

impl DlqReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedPayload => "malformed_payload",
            Self::Unrecoverable => "unrecoverable",
            Self::MaxDeliverExceeded => "max_deliver_exceeded",
            Self::HandlerError => "handler_error",
        }
    }
}

/// On-wire value published to the dead-letter subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEnvelope {
    pub reason: DlqReason,
    pub error_class: String,
    pub error_message: String,
    pub deliveries: u64,
    pub original_subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    pub published_at: DateTime<Utc>,
    /// Original delivery bytes, base64-encoded
    pub raw_base64: String,
    /// Parsed original envelope, when decoding succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<EventEnvelope>,
}

/// Routes poisoned deliveries to the dead-letter stream.
pub struct DlqRouter {
    bus: Arc<dyn BusClient>,
    topology: Arc<TopologyManager>,
    subject: String,
    metrics: Arc<dyn Metrics>,
    stream_ready: OnceCell<()>,
}

impl DlqRouter {
    pub fn new(
        bus: Arc<dyn BusClient>,
        topology: Arc<TopologyManager>,
        subject: String,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            bus,
            topology,
            subject,
            metrics,
            stream_ready: OnceCell::new(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Publish one failed delivery to the dead-letter subject.
    ///
    /// Returns `true` when the DLQ now holds the message. Never raises: any
    /// failure is logged and reported as `false` so the caller can fall
    /// back to nak/term.
    pub async fn route(
        &self,
        raw_payload: &[u8],
        original_subject: &str,
        envelope: Option<&EventEnvelope>,
        info: &DeliveryInfo,
        reason: DlqReason,
        error_class: &str,
        error_message: &str,
    ) -> bool {
        if !self.ensure_stream().await {
            return false;
        }

        let dlq_envelope = DlqEnvelope {
            reason,
            error_class: error_class.to_string(),
            error_message: error_message.to_string(),
            deliveries: info.delivered,
            original_subject: original_subject.to_string(),
            stream: Some(info.stream.clone()),
            consumer: Some(info.consumer.clone()),
            sequence: Some(info.stream_sequence),
            published_at: Utc::now(),
            raw_base64: BASE64.encode(raw_payload),
            envelope: envelope.cloned(),
        };

        let payload = match serde_json::to_vec(&dlq_envelope) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, subject = %original_subject, "Failed to serialize DLQ envelope");
                return false;
            }
        };

        let mut headers = Headers::new();
        headers.insert(DEAD_LETTER_HEADER.to_string(), "true".to_string());
        headers.insert(DLQ_REASON_HEADER.to_string(), reason.as_str().to_string());
        headers.insert(
            DLQ_DELIVERIES_HEADER.to_string(),
            info.delivered.to_string(),
        );
        if let Some(envelope) = envelope {
            if let Ok(context) = serde_json::to_string(envelope) {
                headers.insert(DLQ_CONTEXT_HEADER.to_string(), context);
            }
        }

        match self.bus.publish(&self.subject, headers, payload).await {
            Ok(_) => {
                self.metrics.dead_lettered();
                warn!(
                    subject = %original_subject,
                    reason = reason.as_str(),
                    deliveries = info.delivered,
                    error = %error_message,
                    "Message routed to DLQ"
                );
                true
            }
            Err(e) => {
                error!(
                    subject = %original_subject,
                    reason = reason.as_str(),
                    error = %e,
                    "DLQ publish failed; message stays in the stream"
                );
                false
            }
        }
    }

    /// Provision the DLQ stream once; later calls skip the check. The latch
    /// only sets when provisioning succeeded.
    async fn ensure_stream(&self) -> bool {
        let result = self
            .stream_ready
            .get_or_try_init(|| async {
                self.topology.ensure_dlq_stream().await.map(|_| ())
            })
            .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Failed to provision DLQ stream");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reason_labels() {
        assert_eq!(DlqReason::MalformedPayload.as_str(), "malformed_payload");
        assert_eq!(DlqReason::Unrecoverable.as_str(), "unrecoverable");
        assert_eq!(
            DlqReason::MaxDeliverExceeded.as_str(),
            "max_deliver_exceeded"
        );
        assert_eq!(DlqReason::HandlerError.as_str(), "handler_error");
    }

    #[test]
    fn test_reason_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&DlqReason::MaxDeliverExceeded).unwrap(),
            "\"max_deliver_exceeded\""
        );
    }

    #[test]
    fn test_envelope_round_trip_with_raw_bytes() {
        let original = EventEnvelope::new("orders.created", "svc-a", json!({"id": "o-1"}));
        let raw = original.encode().unwrap();

        let dlq = DlqEnvelope {
            reason: DlqReason::HandlerError,
            error_class: "handler_error".to_string(),
            error_message: "boom".to_string(),
            deliveries: 3,
            original_subject: "test.svc-a.orders.created".to_string(),
            stream: Some("test-events".to_string()),
            consumer: Some("svc-a-orders".to_string()),
            sequence: Some(12),
            published_at: Utc::now(),
            raw_base64: BASE64.encode(&raw),
            envelope: Some(original.clone()),
        };

        let bytes = serde_json::to_vec(&dlq).unwrap();
        let parsed: DlqEnvelope = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(parsed.reason, DlqReason::HandlerError);
        assert_eq!(parsed.deliveries, 3);
        let recovered = BASE64.decode(parsed.raw_base64).unwrap();
        assert_eq!(recovered, raw);
        assert_eq!(parsed.envelope.unwrap(), original);
    }
}
