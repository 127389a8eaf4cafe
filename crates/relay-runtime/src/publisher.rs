//! Publisher: envelope construction and delivery
//!
//! Builds the envelope, enforces the payload limit before any bus call,
//! and sends either directly or through the outbox when one is attached.
//! Transport failures come back inside the result so fan-out and batch
//! publishing never short-circuit; only pre-send validation
//! (oversize payload, serialization) raises.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use relay_domain::envelope::{EventEnvelope, MAX_PAYLOAD_BYTES};
use relay_domain::errors::PublishError;
use relay_domain::SubjectBuilder;
use relay_ports::{BusClient, Clock, Headers, Metrics, NewOutboxRecord, PublishReceipt};

use crate::outbox::{OutboxEngine, OutboxOutcome};

/// Per-publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Caller-supplied idempotency key; generated when unset. Ignored by
    /// fan-out and batch publishes, where every item needs its own key.
    pub event_id: Option<Uuid>,
    /// Caller-supplied timestamp; now-UTC when unset
    pub occurred_at: Option<DateTime<Utc>>,
    pub trace_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Extra headers merged under the contract headers
    pub headers: Headers,
}

impl PublishOptions {
    /// Overlay `other` on top of self: set fields win, headers merge.
    pub fn merged_with(mut self, other: PublishOptions) -> Self {
        if other.event_id.is_some() {
            self.event_id = other.event_id;
        }
        if other.occurred_at.is_some() {
            self.occurred_at = other.occurred_at;
        }
        if other.trace_id.is_some() {
            self.trace_id = other.trace_id;
        }
        if other.correlation_id.is_some() {
            self.correlation_id = other.correlation_id;
        }
        self.headers.extend(other.headers);
        self
    }
}

/// How one publish ended.
#[derive(Debug)]
pub enum PublishOutcome {
    /// The bus acknowledged the message (possibly as a duplicate).
    Published(PublishReceipt),
    /// The outbox had already sent this event id; nothing was published.
    AlreadyPublished,
    /// The send failed. With an outbox attached the event is stored and
    /// will be retried by the drain.
    Failed { reason: String },
}

/// Result of one publish.
#[derive(Debug)]
pub struct PublishResult {
    pub event_id: Uuid,
    pub topic: String,
    pub subject: String,
    pub outcome: PublishOutcome,
}

impl PublishResult {
    pub fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            PublishOutcome::Published(_) | PublishOutcome::AlreadyPublished
        )
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.outcome {
            PublishOutcome::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Aggregated result of a batch publish.
#[derive(Debug)]
pub struct BatchResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<(String, Result<PublishResult, PublishError>)>,
}

/// Event publisher bound to one `{env}.{app}` deployment.
pub struct Publisher {
    bus: Arc<dyn BusClient>,
    outbox: Option<Arc<OutboxEngine>>,
    subjects: SubjectBuilder,
    metrics: Arc<dyn Metrics>,
    clock: Arc<dyn Clock>,
}

impl Publisher {
    pub fn new(
        bus: Arc<dyn BusClient>,
        outbox: Option<Arc<OutboxEngine>>,
        subjects: SubjectBuilder,
        metrics: Arc<dyn Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bus,
            outbox,
            subjects,
            metrics,
            clock,
        }
    }

    pub fn subjects(&self) -> &SubjectBuilder {
        &self.subjects
    }

    /// Publish one event under its canonical topic subject.
    #[instrument(skip(self, message, opts), fields(topic = %topic))]
    pub async fn publish(
        &self,
        topic: &str,
        message: Value,
        opts: PublishOptions,
    ) -> Result<PublishResult, PublishError> {
        let envelope = self.build_envelope(topic, message, &opts);
        let subject = self.subjects.topic_subject(topic);
        self.send(subject, envelope, opts.headers).await
    }

    /// Publish a legacy `{domain}.{resource}.{action}` event.
    #[instrument(skip(self, message, opts), fields(domain = %domain, resource = %resource, action = %action))]
    pub async fn publish_event(
        &self,
        domain: &str,
        resource: &str,
        action: &str,
        message: Value,
        opts: PublishOptions,
    ) -> Result<PublishResult, PublishError> {
        let topic = format!("{domain}.{resource}.{action}");
        let envelope = self
            .build_envelope(&topic, message, &opts)
            .with_legacy(domain, resource, action);
        let subject = self.subjects.legacy_subject(domain, resource, action);
        self.send(subject, envelope, opts.headers).await
    }

    /// Publish the same message under several topics concurrently. Each
    /// topic gets its own event id and an independent result.
    pub async fn publish_many(
        &self,
        topics: &[&str],
        message: &Value,
        opts: &PublishOptions,
    ) -> Vec<(String, Result<PublishResult, PublishError>)> {
        let sends = topics.iter().map(|topic| {
            let per_topic = PublishOptions {
                event_id: None,
                ..opts.clone()
            };
            async move {
                (
                    topic.to_string(),
                    self.publish(topic, message.clone(), per_topic).await,
                )
            }
        });
        join_all(sends).await
    }

    /// Start a fluent batch.
    pub fn batch(&self) -> PublishBatch<'_> {
        PublishBatch {
            publisher: self,
            items: Vec::new(),
            options: PublishOptions::default(),
        }
    }

    fn build_envelope(&self, topic: &str, message: Value, opts: &PublishOptions) -> EventEnvelope {
        let mut envelope = EventEnvelope::new(topic, self.subjects.app(), message)
            .with_occurred_at(opts.occurred_at.unwrap_or_else(|| self.clock.now()))
            .with_trace_id(opts.trace_id.clone())
            .with_correlation_id(opts.correlation_id.clone());
        if let Some(event_id) = opts.event_id {
            envelope = envelope.with_event_id(event_id);
        }
        envelope
    }

    async fn send(
        &self,
        subject: String,
        envelope: EventEnvelope,
        extra_headers: Headers,
    ) -> Result<PublishResult, PublishError> {
        let event_id = envelope.event_id;
        let topic = envelope.topic.clone();
        let payload = envelope.encode()?;

        if payload.len() > MAX_PAYLOAD_BYTES {
            self.metrics.publish_failed();
            return Err(PublishError::PayloadTooLarge {
                size: payload.len(),
                limit: MAX_PAYLOAD_BYTES,
            });
        }

        let headers = envelope.headers(extra_headers);

        let outcome = match &self.outbox {
            Some(outbox) => {
                let record = NewOutboxRecord {
                    event_id,
                    subject: subject.clone(),
                    payload: payload.clone(),
                    headers: headers.clone(),
                };
                let bus = self.bus.clone();
                let send_subject = subject.clone();
                let result = outbox
                    .publish(record, move || async move {
                        bus.publish(&send_subject, headers, payload).await
                    })
                    .await;
                match result {
                    Ok(OutboxOutcome::Sent { receipt, .. }) => PublishOutcome::Published(receipt),
                    Ok(OutboxOutcome::AlreadySent) => PublishOutcome::AlreadyPublished,
                    Ok(OutboxOutcome::Failed { reason }) => PublishOutcome::Failed { reason },
                    Err(e) => PublishOutcome::Failed {
                        reason: e.to_string(),
                    },
                }
            }
            None => match self.bus.publish(&subject, headers, payload).await {
                Ok(receipt) => PublishOutcome::Published(receipt),
                Err(e) => PublishOutcome::Failed {
                    reason: e.to_string(),
                },
            },
        };

        match &outcome {
            PublishOutcome::Published(receipt) => {
                self.metrics.published();
                debug!(
                    event_id = %event_id,
                    subject = %subject,
                    sequence = receipt.sequence,
                    duplicate = receipt.duplicate,
                    "Event published"
                );
            }
            PublishOutcome::AlreadyPublished => {
                debug!(event_id = %event_id, subject = %subject, "Event already published");
            }
            PublishOutcome::Failed { reason } => {
                self.metrics.publish_failed();
                warn!(event_id = %event_id, subject = %subject, error = %reason, "Publish failed");
            }
        }

        Ok(PublishResult {
            event_id,
            topic,
            subject,
            outcome,
        })
    }
}

/// Fluent builder collecting items for one parallel batch publish.
pub struct PublishBatch<'a> {
    publisher: &'a Publisher,
    items: Vec<(String, Value)>,
    options: PublishOptions,
}

impl PublishBatch<'_> {
    /// Append one item.
    pub fn add(mut self, topic: impl Into<String>, message: Value) -> Self {
        self.items.push((topic.into(), message));
        self
    }

    /// Merge options applied to every item.
    pub fn with_options(mut self, opts: PublishOptions) -> Self {
        self.options = self.options.merged_with(opts);
        self
    }

    /// Send every item in parallel. Individual failures never stop the
    /// batch; the aggregate carries one result per item in input order.
    pub async fn publish(self) -> BatchResult {
        let total = self.items.len();
        let sends = self.items.into_iter().map(|(topic, message)| {
            let per_item = PublishOptions {
                event_id: None,
                ..self.options.clone()
            };
            let publisher = self.publisher;
            async move {
                let result = publisher.publish(&topic, message, per_item).await;
                (topic, result)
            }
        });

        let results: Vec<(String, Result<PublishResult, PublishError>)> = join_all(sends).await;
        let succeeded = results
            .iter()
            .filter(|(_, r)| r.as_ref().map(|p| p.is_success()).unwrap_or(false))
            .count();

        BatchResult {
            total,
            succeeded,
            failed: total - succeeded,
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_adapters::{MemoryBusClient, MemoryOutboxRepository};
    use relay_domain::envelope::{MSG_ID_HEADER, TOPIC_HEADER};
    use relay_domain::records::OutboxStatus;
    use relay_ports::{NoopMetrics, Retention, Storage, StreamDesc, SystemClock};
    use serde_json::json;
    use std::time::Duration;

    async fn bus_with_stream() -> Arc<MemoryBusClient> {
        let bus = Arc::new(MemoryBusClient::new());
        bus.create_stream(&StreamDesc {
            name: "test-events".to_string(),
            subjects: vec!["test.events.>".to_string(), "test.svc-a.>".to_string()],
            retention: Retention::Limits,
            storage: Storage::File,
            max_age: Duration::from_secs(3600),
            discard_old: true,
        })
        .await
        .unwrap();
        bus
    }

    fn publisher(bus: Arc<MemoryBusClient>, outbox: Option<Arc<OutboxEngine>>) -> Publisher {
        Publisher::new(
            bus,
            outbox,
            SubjectBuilder::new("test", "svc-a"),
            Arc::new(NoopMetrics),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn test_publish_sets_subject_and_idempotency_header() {
        let bus = bus_with_stream().await;
        let publisher = publisher(bus.clone(), None);

        let event_id = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        let result = publisher
            .publish(
                "orders.created",
                json!({"id": "o-1", "total": 10}),
                PublishOptions {
                    event_id: Some(event_id),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.subject, "test.svc-a.orders.created");
        assert_eq!(result.event_id, event_id);

        let messages = bus.messages("test-events");
        assert_eq!(messages.len(), 1);
        let (subject, headers, payload) = &messages[0];
        assert_eq!(subject, "test.svc-a.orders.created");
        assert_eq!(headers[MSG_ID_HEADER], event_id.to_string());
        assert_eq!(headers[TOPIC_HEADER], "orders.created");

        let envelope = EventEnvelope::decode(payload).unwrap();
        assert_eq!(envelope.message, json!({"id": "o-1", "total": 10}));
        assert_eq!(envelope.producer, "svc-a");
    }

    #[tokio::test]
    async fn test_same_event_id_republish_is_duplicate_success() {
        let bus = bus_with_stream().await;
        let publisher = publisher(bus.clone(), None);

        let opts = PublishOptions {
            event_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        let first = publisher
            .publish("orders.created", json!({}), opts.clone())
            .await
            .unwrap();
        let second = publisher
            .publish("orders.created", json!({}), opts)
            .await
            .unwrap();

        assert!(first.is_success());
        assert!(second.is_success());
        match second.outcome {
            PublishOutcome::Published(receipt) => assert!(receipt.duplicate),
            other => panic!("expected duplicate publish ack, got {other:?}"),
        }
        assert_eq!(bus.message_count("test-events"), 1);
    }

    #[tokio::test]
    async fn test_oversize_payload_rejected_before_send() {
        let bus = bus_with_stream().await;
        let publisher = publisher(bus.clone(), None);

        let big = json!({"blob": "x".repeat(MAX_PAYLOAD_BYTES + 1)});
        let err = publisher
            .publish("orders.created", big, PublishOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::PayloadTooLarge { .. }));
        assert_eq!(bus.message_count("test-events"), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_returns_result_not_error() {
        // No stream provisioned, so the bus rejects the publish.
        let bus = Arc::new(MemoryBusClient::new());
        let publisher = publisher(bus, None);

        let result = publisher
            .publish("orders.created", json!({}), PublishOptions::default())
            .await
            .unwrap();
        assert!(!result.is_success());
        assert!(result.failure_reason().is_some());
    }

    #[tokio::test]
    async fn test_legacy_event_subject_and_fields() {
        let bus = bus_with_stream().await;
        let publisher = publisher(bus.clone(), None);

        let result = publisher
            .publish_event(
                "billing",
                "invoice",
                "paid",
                json!({"id": "inv-1"}),
                PublishOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.subject, "test.events.billing.invoice.paid");
        assert_eq!(result.topic, "billing.invoice.paid");

        let messages = bus.messages("test-events");
        let envelope = EventEnvelope::decode(&messages[0].2).unwrap();
        assert_eq!(envelope.domain.as_deref(), Some("billing"));
        assert_eq!(envelope.resource.as_deref(), Some("invoice"));
        assert_eq!(envelope.action.as_deref(), Some("paid"));
        assert_eq!(envelope.resource_id.as_deref(), Some("inv-1"));
    }

    #[tokio::test]
    async fn test_publish_many_independent_results() {
        let bus = bus_with_stream().await;
        let publisher = publisher(bus.clone(), None);

        let results = publisher
            .publish_many(
                &["orders.created", "orders.audited"],
                &json!({"id": "o-1"}),
                &PublishOptions::default(),
            )
            .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.as_ref().unwrap().is_success()));
        assert_eq!(bus.message_count("test-events"), 2);

        // Each topic got its own event id.
        let ids: Vec<Uuid> = results
            .iter()
            .map(|(_, r)| r.as_ref().unwrap().event_id)
            .collect();
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_batch_aggregates_and_never_short_circuits() {
        let bus = bus_with_stream().await;
        let publisher = publisher(bus.clone(), None);

        let batch = publisher
            .batch()
            .add("orders.created", json!({"id": "o-1"}))
            .add("orders.failed", json!({"blob": "x".repeat(MAX_PAYLOAD_BYTES + 1)}))
            .add("orders.shipped", json!({"id": "o-1"}))
            .publish()
            .await;

        assert_eq!(batch.total, 3);
        assert_eq!(batch.succeeded, 2);
        assert_eq!(batch.failed, 1);
        assert_eq!(bus.message_count("test-events"), 2);

        // The oversize item failed; the later item still went out.
        assert!(batch.results[1].1.is_err());
        assert!(batch.results[2].1.as_ref().unwrap().is_success());
    }

    #[tokio::test]
    async fn test_outbox_path_records_sent_row() {
        let bus = bus_with_stream().await;
        let repo = Arc::new(MemoryOutboxRepository::new());
        let outbox = Arc::new(OutboxEngine::new(repo.clone(), Arc::new(NoopMetrics)));
        let publisher = publisher(bus.clone(), Some(outbox));

        let result = publisher
            .publish("orders.created", json!({"id": "o-1"}), PublishOptions::default())
            .await
            .unwrap();
        assert!(result.is_success());

        let row = repo.get(&result.event_id).unwrap();
        assert_eq!(row.status, OutboxStatus::Sent);
        assert_eq!(row.subject, "test.svc-a.orders.created");
        assert_eq!(bus.message_count("test-events"), 1);
    }
}
