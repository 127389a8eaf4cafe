//! Relay Port Traits
//!
//! This crate defines the interfaces the runtime consumes and adapters
//! implement:
//! - `BusClient` / `BusDelivery`: the narrow surface of the message bus
//!   (publish with headers, stream admin, durable pull consumers, ack/nak/term)
//! - `OutboxRepository` / `InboxRepository`: persistence for the
//!   store-then-publish and check-then-process patterns
//! - `Metrics`: a fixed set of counters with a no-op default
//! - `Clock`: current time, swappable for deterministic tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use relay_domain::records::{InboxRecord, OutboxRecord};

// ============================================================================
// Bus value types
// ============================================================================

/// Message headers as carried on the wire (single value per key).
pub type Headers = HashMap<String, String>;

/// Acknowledgement returned by the bus for a successful publish.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub stream: String,
    pub sequence: u64,
    /// True when the bus deduplicated this publish by message id
    pub duplicate: bool,
}

/// Stream retention policy. Relay only provisions `Limits` streams; the
/// other variants exist so existing-stream configs can be read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    Limits,
    Interest,
    WorkQueue,
}

/// Stream storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    File,
    Memory,
}

/// Desired stream configuration, owned by the topology manager.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDesc {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: Retention,
    pub storage: Storage,
    pub max_age: Duration,
    /// Discard the oldest messages when limits are hit
    pub discard_old: bool,
}

/// Observed stream configuration.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: Retention,
    pub storage: Storage,
    pub max_age: Duration,
    pub messages: u64,
}

/// Desired durable pull-consumer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSpec {
    pub stream: String,
    pub durable_name: String,
    pub filter_subject: String,
    pub max_deliver: i64,
    pub ack_wait: Duration,
    pub backoff: Vec<Duration>,
}

/// Per-delivery bus metadata.
#[derive(Debug, Clone)]
pub struct DeliveryInfo {
    pub stream: String,
    pub consumer: String,
    pub stream_sequence: u64,
    /// 1-based delivery attempt counter
    pub delivered: u64,
}

/// Connection state of the underlying bus client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Pending,
    Disconnected,
}

/// Lag snapshot for one durable consumer.
#[derive(Debug, Clone)]
pub struct ConsumerLag {
    pub name: String,
    pub pending: u64,
    pub delivered: u64,
    pub ack_pending: u64,
}

/// Bus errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("stream not found: {name}")]
    StreamNotFound { name: String },

    #[error("consumer not found: {stream}/{name}")]
    ConsumerNotFound { stream: String, name: String },

    #[error("subject overlap: {message}")]
    SubjectOverlap { message: String },

    #[error("connection error: {message}")]
    Connection { message: String },

    #[error("publish error: {message}")]
    Publish { message: String },

    #[error("request timed out: {message}")]
    Timeout { message: String },

    #[error("bus error: {message}")]
    Internal { message: String },
}

impl BusError {
    /// Errors a worker loop can recover from by re-provisioning topology and
    /// resubscribing.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::StreamNotFound { .. } | Self::ConsumerNotFound { .. }
        )
    }

    /// Errors worth a plain retry after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Connection { .. })
    }
}

// ============================================================================
// Bus ports
// ============================================================================

/// One delivered message, with explicit acknowledgement control.
#[async_trait]
pub trait BusDelivery: Send + Sync {
    fn subject(&self) -> &str;
    fn payload(&self) -> &[u8];
    fn headers(&self) -> Headers;
    fn info(&self) -> DeliveryInfo;

    /// Acknowledge successful processing.
    async fn ack(&self) -> Result<(), BusError>;

    /// Request redelivery, optionally after a delay.
    async fn nak(&self, delay: Option<Duration>) -> Result<(), BusError>;

    /// Terminate: never redeliver.
    async fn term(&self) -> Result<(), BusError>;
}

/// Narrow interface to the message bus consumed by the runtime.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Publish a message and wait for the bus acknowledgement.
    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> Result<PublishReceipt, BusError>;

    /// Look up a stream; `Ok(None)` when it does not exist.
    async fn stream_info(&self, name: &str) -> Result<Option<StreamInfo>, BusError>;

    async fn create_stream(&self, desc: &StreamDesc) -> Result<(), BusError>;

    /// Update an existing stream's subjects/storage. Retention is never
    /// changed through this call.
    async fn update_stream(&self, desc: &StreamDesc) -> Result<(), BusError>;

    async fn list_streams(&self) -> Result<Vec<StreamInfo>, BusError>;

    /// Look up a durable consumer; `Ok(None)` when it does not exist.
    async fn consumer_info(
        &self,
        stream: &str,
        durable: &str,
    ) -> Result<Option<ConsumerSpec>, BusError>;

    async fn create_consumer(&self, spec: &ConsumerSpec) -> Result<(), BusError>;

    async fn delete_consumer(&self, stream: &str, durable: &str) -> Result<(), BusError>;

    /// Fetch up to `batch` messages from a durable pull consumer, waiting at
    /// most `expires` for the first one.
    async fn fetch(
        &self,
        stream: &str,
        durable: &str,
        batch: usize,
        expires: Duration,
    ) -> Result<Vec<Box<dyn BusDelivery>>, BusError>;

    fn connection_state(&self) -> ConnectionState;

    /// Servers the client knows about, for health reporting.
    fn server_names(&self) -> Vec<String>;

    async fn consumer_lag(&self, stream: &str) -> Result<Vec<ConsumerLag>, BusError>;

    /// Drain the connection: stop new work, flush in-flight acks, close.
    async fn drain(&self) -> Result<(), BusError>;
}

// ============================================================================
// Repository ports
// ============================================================================

/// Repository errors.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("database error: {message}")]
    Database { message: String },

    #[error("serialization error: {message}")]
    Serialization { message: String },

    #[error("record not found: {event_id}")]
    NotFound { event_id: Uuid },
}

/// Insert payload for an outbox row.
#[derive(Debug, Clone)]
pub struct NewOutboxRecord {
    pub event_id: Uuid,
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

/// Insert payload for an inbox row.
#[derive(Debug, Clone)]
pub struct NewInboxRecord {
    pub event_id: Uuid,
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub stream: Option<String>,
    pub stream_seq: Option<u64>,
    pub deliveries: u32,
}

/// Persistence for the store-then-publish pattern. `event_id` is unique;
/// inserting an existing id returns the stored row untouched.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    async fn find_or_create(&self, record: &NewOutboxRecord)
        -> Result<OutboxRecord, RepositoryError>;

    /// Transition to PUBLISHING and increment the attempt counter.
    async fn mark_publishing(&self, event_id: &Uuid) -> Result<OutboxRecord, RepositoryError>;

    async fn mark_sent(&self, event_id: &Uuid) -> Result<(), RepositoryError>;

    async fn mark_failed(&self, event_id: &Uuid, error: &str) -> Result<(), RepositoryError>;

    /// PENDING rows in enqueue order.
    async fn list_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, RepositoryError>;

    /// Make interrupted work drainable again: FAILED rows go back to
    /// PENDING immediately, PUBLISHING rows only once `updated_at` is older
    /// than `older_than_minutes` (a crash mid-publish). Returns the number
    /// of rows reset.
    async fn reset_stale(&self, older_than_minutes: i64) -> Result<u64, RepositoryError>;

    /// Delete SENT rows with `sent_at` before the cutoff, oldest first,
    /// bounded by `limit`. Returns the number of rows deleted.
    async fn delete_sent_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, RepositoryError>;

    async fn pending_count(&self) -> Result<u64, RepositoryError>;
}

/// Persistence for the check-then-process pattern. At most one row exists
/// per `event_id`; the boolean reports whether the row already existed.
#[async_trait]
pub trait InboxRepository: Send + Sync {
    async fn find_or_create(
        &self,
        record: &NewInboxRecord,
    ) -> Result<(InboxRecord, bool), RepositoryError>;

    async fn mark_processing(&self, event_id: &Uuid) -> Result<(), RepositoryError>;

    async fn mark_processed(&self, event_id: &Uuid) -> Result<(), RepositoryError>;

    async fn mark_failed(&self, event_id: &Uuid, error: &str) -> Result<(), RepositoryError>;

    /// Flip PROCESSING rows older than `older_than_minutes` back to FAILED
    /// so a crashed worker's rows become retryable. Returns the number of
    /// rows reset.
    async fn reset_stale(&self, older_than_minutes: i64) -> Result<u64, RepositoryError>;

    /// Delete PROCESSED rows with `processed_at` before the cutoff, bounded
    /// by `limit`. Returns the number of rows deleted.
    async fn delete_processed_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, RepositoryError>;
}

// ============================================================================
// Metrics port
// ============================================================================

/// Fixed counter set exposed by the runtime.
pub trait Metrics: Send + Sync {
    fn published(&self);
    fn publish_failed(&self);
    fn received(&self);
    fn processed(&self);
    fn failed(&self);
    fn dead_lettered(&self);
    fn outbox_pending(&self, depth: u64);
}

/// Default metrics sink that records nothing.
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn published(&self) {}
    fn publish_failed(&self) {}
    fn received(&self) {}
    fn processed(&self) {}
    fn failed(&self) {}
    fn dead_lettered(&self) {}
    fn outbox_pending(&self, _depth: u64) {}
}

/// Atomic counter implementation, used by tests and small deployments.
#[derive(Default)]
pub struct CountingMetrics {
    published: AtomicU64,
    publish_failed: AtomicU64,
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    outbox_pending: AtomicU64,
}

/// Point-in-time counter values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub publish_failed: u64,
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub outbox_pending: u64,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_failed: self.publish_failed.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            outbox_pending: self.outbox_pending.load(Ordering::Relaxed),
        }
    }
}

impl Metrics for CountingMetrics {
    fn published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    fn publish_failed(&self) {
        self.publish_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    fn processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    fn outbox_pending(&self, depth: u64) {
        self.outbox_pending.store(depth, Ordering::Relaxed);
    }
}

// ============================================================================
// Clock port
// ============================================================================

/// Clock port for deterministic time handling.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System clock implementation.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_metrics() {
        let metrics = CountingMetrics::new();
        metrics.published();
        metrics.published();
        metrics.received();
        metrics.dead_lettered();
        metrics.outbox_pending(7);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.published, 2);
        assert_eq!(snapshot.received, 1);
        assert_eq!(snapshot.dead_lettered, 1);
        assert_eq!(snapshot.outbox_pending, 7);
        assert_eq!(snapshot.processed, 0);
    }

    #[test]
    fn test_bus_error_classification() {
        assert!(BusError::StreamNotFound {
            name: "events".into()
        }
        .is_recoverable());
        assert!(BusError::Timeout {
            message: "fetch".into()
        }
        .is_transient());
        assert!(!BusError::Publish {
            message: "boom".into()
        }
        .is_transient());
    }
}
