//! In-memory bus and repositories for dev/test
//!
//! `MemoryBusClient` implements the same `BusClient` port as the NATS
//! adapter against process-local state: streams with subject filters,
//! durable pull consumers with per-message delivery counters, nak
//! redelivery (with optional delay), term, and `Nats-Msg-Id` dedupe.
//! Stream creation enforces the same cross-stream subject-overlap rule the
//! server does, so topology tests behave like production.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use relay_domain::envelope::MSG_ID_HEADER;
use relay_domain::records::{InboxRecord, InboxStatus, OutboxRecord, OutboxStatus};
use relay_domain::subject;
use relay_ports::{
    BusClient, BusDelivery, BusError, ConnectionState, ConsumerLag, ConsumerSpec, DeliveryInfo,
    Headers, InboxRepository, NewInboxRecord, NewOutboxRecord, OutboxRepository, PublishReceipt,
    RepositoryError, StreamDesc, StreamInfo,
};

#[derive(Clone)]
struct StoredMessage {
    subject: String,
    headers: Headers,
    payload: Vec<u8>,
    sequence: u64,
}

struct MemConsumer {
    spec: ConsumerSpec,
    queue: VecDeque<u64>,
    delivery_counts: HashMap<u64, u64>,
    in_flight: HashSet<u64>,
    delivered_total: u64,
}

impl MemConsumer {
    fn new(spec: ConsumerSpec) -> Self {
        Self {
            spec,
            queue: VecDeque::new(),
            delivery_counts: HashMap::new(),
            in_flight: HashSet::new(),
            delivered_total: 0,
        }
    }

    fn accepts(&self, subject_name: &str) -> bool {
        self.spec.filter_subject.is_empty()
            || subject::matches(&self.spec.filter_subject, subject_name)
    }
}

struct MemStream {
    desc: StreamDesc,
    last_sequence: u64,
    messages: HashMap<u64, StoredMessage>,
    msg_ids: HashMap<String, u64>,
    consumers: HashMap<String, MemConsumer>,
}

impl MemStream {
    fn new(desc: StreamDesc) -> Self {
        Self {
            desc,
            last_sequence: 0,
            messages: HashMap::new(),
            msg_ids: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    fn info(&self) -> StreamInfo {
        StreamInfo {
            name: self.desc.name.clone(),
            subjects: self.desc.subjects.clone(),
            retention: self.desc.retention,
            storage: self.desc.storage,
            max_age: self.desc.max_age,
            messages: self.messages.len() as u64,
        }
    }
}

#[derive(Default)]
struct BusState {
    streams: HashMap<String, MemStream>,
    connected: bool,
}

/// In-process bus with JetStream-like pull semantics.
#[derive(Clone)]
pub struct MemoryBusClient {
    state: Arc<Mutex<BusState>>,
}

impl Default for MemoryBusClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBusClient {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                streams: HashMap::new(),
                connected: true,
            })),
        }
    }

    /// Flip the reported connection state (for health-probe tests).
    pub fn set_connected(&self, connected: bool) {
        self.state.lock().expect("bus state lock").connected = connected;
    }

    /// Stored message count for a stream.
    pub fn message_count(&self, stream: &str) -> usize {
        let state = self.state.lock().expect("bus state lock");
        state
            .streams
            .get(stream)
            .map(|s| s.messages.len())
            .unwrap_or(0)
    }

    /// Stored messages for a stream in sequence order, as
    /// `(subject, headers, payload)` (test inspection).
    pub fn messages(&self, stream: &str) -> Vec<(String, Headers, Vec<u8>)> {
        let state = self.state.lock().expect("bus state lock");
        let Some(mem_stream) = state.streams.get(stream) else {
            return Vec::new();
        };
        let mut stored: Vec<&StoredMessage> = mem_stream.messages.values().collect();
        stored.sort_by_key(|m| m.sequence);
        stored
            .into_iter()
            .map(|m| (m.subject.clone(), m.headers.clone(), m.payload.clone()))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().expect("bus state lock")
    }
}

#[async_trait]
impl BusClient for MemoryBusClient {
    async fn publish(
        &self,
        subject_name: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> Result<PublishReceipt, BusError> {
        let mut state = self.lock();

        let stream_name = state
            .streams
            .values()
            .find(|s| subject::covered(&s.desc.subjects, subject_name))
            .map(|s| s.desc.name.clone())
            .ok_or_else(|| BusError::Publish {
                message: format!("no stream matches subject {subject_name}"),
            })?;

        let stream = state
            .streams
            .get_mut(&stream_name)
            .expect("stream just resolved");

        if let Some(msg_id) = headers.get(MSG_ID_HEADER) {
            if let Some(first_seq) = stream.msg_ids.get(msg_id) {
                return Ok(PublishReceipt {
                    stream: stream_name,
                    sequence: *first_seq,
                    duplicate: true,
                });
            }
        }

        stream.last_sequence += 1;
        let sequence = stream.last_sequence;
        if let Some(msg_id) = headers.get(MSG_ID_HEADER) {
            stream.msg_ids.insert(msg_id.clone(), sequence);
        }

        stream.messages.insert(
            sequence,
            StoredMessage {
                subject: subject_name.to_string(),
                headers,
                payload,
                sequence,
            },
        );

        for consumer in stream.consumers.values_mut() {
            if consumer.accepts(subject_name) {
                consumer.queue.push_back(sequence);
            }
        }

        Ok(PublishReceipt {
            stream: stream_name,
            sequence,
            duplicate: false,
        })
    }

    async fn stream_info(&self, name: &str) -> Result<Option<StreamInfo>, BusError> {
        let state = self.lock();
        Ok(state.streams.get(name).map(|s| s.info()))
    }

    async fn create_stream(&self, desc: &StreamDesc) -> Result<(), BusError> {
        let mut state = self.lock();

        if state.streams.contains_key(&desc.name) {
            return Ok(());
        }

        // Same rule the server enforces: subjects may not overlap with any
        // other stream.
        for other in state.streams.values() {
            for new_subject in &desc.subjects {
                for existing in &other.desc.subjects {
                    if subject::overlap(new_subject, existing) {
                        return Err(BusError::SubjectOverlap {
                            message: format!(
                                "subject {new_subject} overlaps with {existing} on stream {}",
                                other.desc.name
                            ),
                        });
                    }
                }
            }
        }

        state
            .streams
            .insert(desc.name.clone(), MemStream::new(desc.clone()));
        Ok(())
    }

    async fn update_stream(&self, desc: &StreamDesc) -> Result<(), BusError> {
        let mut state = self.lock();

        for other in state.streams.values() {
            if other.desc.name == desc.name {
                continue;
            }
            for new_subject in &desc.subjects {
                for existing in &other.desc.subjects {
                    if subject::overlap(new_subject, existing) {
                        return Err(BusError::SubjectOverlap {
                            message: format!(
                                "subject {new_subject} overlaps with {existing} on stream {}",
                                other.desc.name
                            ),
                        });
                    }
                }
            }
        }

        let stream = state
            .streams
            .get_mut(&desc.name)
            .ok_or_else(|| BusError::StreamNotFound {
                name: desc.name.clone(),
            })?;

        // Retention is immutable; subjects, storage, and age limits follow
        // the new descriptor.
        stream.desc.subjects = desc.subjects.clone();
        stream.desc.storage = desc.storage;
        stream.desc.max_age = desc.max_age;
        Ok(())
    }

    async fn list_streams(&self) -> Result<Vec<StreamInfo>, BusError> {
        let state = self.lock();
        let mut infos: Vec<StreamInfo> = state.streams.values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn consumer_info(
        &self,
        stream: &str,
        durable: &str,
    ) -> Result<Option<ConsumerSpec>, BusError> {
        let state = self.lock();
        let mem_stream = state
            .streams
            .get(stream)
            .ok_or_else(|| BusError::StreamNotFound {
                name: stream.to_string(),
            })?;
        Ok(mem_stream
            .consumers
            .get(durable)
            .map(|c| c.spec.clone()))
    }

    async fn create_consumer(&self, spec: &ConsumerSpec) -> Result<(), BusError> {
        let mut state = self.lock();
        let mem_stream =
            state
                .streams
                .get_mut(&spec.stream)
                .ok_or_else(|| BusError::StreamNotFound {
                    name: spec.stream.clone(),
                })?;

        if mem_stream.consumers.contains_key(&spec.durable_name) {
            return Ok(());
        }

        // Deliver-all: a new durable starts with the whole backlog.
        let mut consumer = MemConsumer::new(spec.clone());
        let mut backlog: Vec<u64> = mem_stream
            .messages
            .values()
            .filter(|m| consumer.accepts(&m.subject))
            .map(|m| m.sequence)
            .collect();
        backlog.sort_unstable();
        consumer.queue.extend(backlog);

        mem_stream
            .consumers
            .insert(spec.durable_name.clone(), consumer);
        Ok(())
    }

    async fn delete_consumer(&self, stream: &str, durable: &str) -> Result<(), BusError> {
        let mut state = self.lock();
        let mem_stream = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| BusError::StreamNotFound {
                name: stream.to_string(),
            })?;
        mem_stream
            .consumers
            .remove(durable)
            .ok_or_else(|| BusError::ConsumerNotFound {
                stream: stream.to_string(),
                name: durable.to_string(),
            })?;
        Ok(())
    }

    async fn fetch(
        &self,
        stream: &str,
        durable: &str,
        batch: usize,
        expires: Duration,
    ) -> Result<Vec<Box<dyn BusDelivery>>, BusError> {
        let deadline = tokio::time::Instant::now() + expires;

        loop {
            let deliveries = {
                let mut state = self.lock();
                let mem_stream =
                    state
                        .streams
                        .get_mut(stream)
                        .ok_or_else(|| BusError::StreamNotFound {
                            name: stream.to_string(),
                        })?;

                let messages: Vec<StoredMessage> = {
                    let consumer = mem_stream.consumers.get(durable).ok_or_else(|| {
                        BusError::ConsumerNotFound {
                            stream: stream.to_string(),
                            name: durable.to_string(),
                        }
                    })?;
                    let mut picked = Vec::new();
                    for seq in consumer.queue.iter().take(batch) {
                        if let Some(message) = mem_stream.messages.get(seq) {
                            picked.push(message.clone());
                        }
                    }
                    picked
                };

                let consumer = mem_stream
                    .consumers
                    .get_mut(durable)
                    .expect("consumer just resolved");

                let mut out: Vec<Box<dyn BusDelivery>> = Vec::with_capacity(messages.len());
                for message in messages {
                    consumer.queue.pop_front();
                    consumer.in_flight.insert(message.sequence);
                    consumer.delivered_total += 1;
                    let count = consumer
                        .delivery_counts
                        .entry(message.sequence)
                        .and_modify(|c| *c += 1)
                        .or_insert(1);

                    out.push(Box::new(MemoryDelivery {
                        state: self.state.clone(),
                        stream: stream.to_string(),
                        durable: durable.to_string(),
                        subject: message.subject.clone(),
                        headers: message.headers.clone(),
                        payload: message.payload.clone(),
                        info: DeliveryInfo {
                            stream: stream.to_string(),
                            consumer: durable.to_string(),
                            stream_sequence: message.sequence,
                            delivered: *count,
                        },
                    }));
                }
                out
            };

            if !deliveries.is_empty() || tokio::time::Instant::now() >= deadline {
                return Ok(deliveries);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn connection_state(&self) -> ConnectionState {
        if self.lock().connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn server_names(&self) -> Vec<String> {
        vec!["memory".to_string()]
    }

    async fn consumer_lag(&self, stream: &str) -> Result<Vec<ConsumerLag>, BusError> {
        let state = self.lock();
        let mem_stream = state
            .streams
            .get(stream)
            .ok_or_else(|| BusError::StreamNotFound {
                name: stream.to_string(),
            })?;
        let mut lags: Vec<ConsumerLag> = mem_stream
            .consumers
            .values()
            .map(|c| ConsumerLag {
                name: c.spec.durable_name.clone(),
                pending: c.queue.len() as u64,
                delivered: c.delivered_total,
                ack_pending: c.in_flight.len() as u64,
            })
            .collect();
        lags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(lags)
    }

    async fn drain(&self) -> Result<(), BusError> {
        Ok(())
    }
}

// ============================================================================
// Delivery handle
// ============================================================================

struct MemoryDelivery {
    state: Arc<Mutex<BusState>>,
    stream: String,
    durable: String,
    subject: String,
    headers: Headers,
    payload: Vec<u8>,
    info: DeliveryInfo,
}

impl MemoryDelivery {
    fn with_consumer<R>(&self, f: impl FnOnce(&mut MemConsumer) -> R) -> Option<R> {
        let mut state = self.state.lock().expect("bus state lock");
        state
            .streams
            .get_mut(&self.stream)
            .and_then(|s| s.consumers.get_mut(&self.durable))
            .map(f)
    }
}

#[async_trait]
impl BusDelivery for MemoryDelivery {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn headers(&self) -> Headers {
        self.headers.clone()
    }

    fn info(&self) -> DeliveryInfo {
        self.info.clone()
    }

    async fn ack(&self) -> Result<(), BusError> {
        let sequence = self.info.stream_sequence;
        self.with_consumer(|c| {
            c.in_flight.remove(&sequence);
        });
        Ok(())
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), BusError> {
        let sequence = self.info.stream_sequence;

        let redeliverable = self
            .with_consumer(|c| {
                c.in_flight.remove(&sequence);
                let delivered = c.delivery_counts.get(&sequence).copied().unwrap_or(0);
                c.spec.max_deliver <= 0 || delivered < c.spec.max_deliver as u64
            })
            .unwrap_or(false);

        if !redeliverable {
            debug!(sequence = sequence, "Nak dropped: delivery limit reached");
            return Ok(());
        }

        let state = self.state.clone();
        let stream = self.stream.clone();
        let durable = self.durable.clone();
        let requeue = move || {
            let mut state = state.lock().expect("bus state lock");
            if let Some(consumer) = state
                .streams
                .get_mut(&stream)
                .and_then(|s| s.consumers.get_mut(&durable))
            {
                consumer.queue.push_back(sequence);
            }
        };

        match delay {
            Some(delay) if !delay.is_zero() => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    requeue();
                });
            }
            _ => requeue(),
        }
        Ok(())
    }

    async fn term(&self) -> Result<(), BusError> {
        let sequence = self.info.stream_sequence;
        self.with_consumer(|c| {
            c.in_flight.remove(&sequence);
        });
        debug!(sequence = sequence, "Message terminated");
        Ok(())
    }
}

// ============================================================================
// In-memory repositories
// ============================================================================

#[derive(Default)]
struct OutboxStore {
    order: Vec<Uuid>,
    rows: HashMap<Uuid, OutboxRecord>,
}

/// Outbox repository backed by process memory.
#[derive(Default)]
pub struct MemoryOutboxRepository {
    store: Mutex<OutboxStore>,
}

impl MemoryOutboxRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a stored row (test inspection).
    pub fn get(&self, event_id: &Uuid) -> Option<OutboxRecord> {
        self.store
            .lock()
            .expect("outbox store lock")
            .rows
            .get(event_id)
            .cloned()
    }
}

#[async_trait]
impl OutboxRepository for MemoryOutboxRepository {
    async fn find_or_create(
        &self,
        record: &NewOutboxRecord,
    ) -> Result<OutboxRecord, RepositoryError> {
        let mut store = self.store.lock().expect("outbox store lock");
        if let Some(existing) = store.rows.get(&record.event_id) {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let row = OutboxRecord {
            event_id: record.event_id,
            subject: record.subject.clone(),
            payload: record.payload.clone(),
            headers: record.headers.clone(),
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            enqueued_at: now,
            sent_at: None,
            created_at: now,
            updated_at: now,
        };
        store.order.push(record.event_id);
        store.rows.insert(record.event_id, row.clone());
        Ok(row)
    }

    async fn mark_publishing(&self, event_id: &Uuid) -> Result<OutboxRecord, RepositoryError> {
        let mut store = self.store.lock().expect("outbox store lock");
        let row = store
            .rows
            .get_mut(event_id)
            .ok_or(RepositoryError::NotFound {
                event_id: *event_id,
            })?;
        row.status = OutboxStatus::Publishing;
        row.attempts += 1;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn mark_sent(&self, event_id: &Uuid) -> Result<(), RepositoryError> {
        let mut store = self.store.lock().expect("outbox store lock");
        let row = store
            .rows
            .get_mut(event_id)
            .ok_or(RepositoryError::NotFound {
                event_id: *event_id,
            })?;
        row.status = OutboxStatus::Sent;
        row.sent_at = Some(Utc::now());
        row.last_error = None;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(&self, event_id: &Uuid, error: &str) -> Result<(), RepositoryError> {
        let mut store = self.store.lock().expect("outbox store lock");
        let row = store
            .rows
            .get_mut(event_id)
            .ok_or(RepositoryError::NotFound {
                event_id: *event_id,
            })?;
        row.status = OutboxStatus::Failed;
        row.last_error = Some(error.to_string());
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, RepositoryError> {
        let store = self.store.lock().expect("outbox store lock");
        Ok(store
            .order
            .iter()
            .filter_map(|id| store.rows.get(id))
            .filter(|r| r.status == OutboxStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn reset_stale(&self, older_than_minutes: i64) -> Result<u64, RepositoryError> {
        let cutoff = Utc::now() - chrono::Duration::minutes(older_than_minutes);
        let mut store = self.store.lock().expect("outbox store lock");
        let mut reset = 0;
        for row in store.rows.values_mut() {
            let stale_publishing =
                row.status == OutboxStatus::Publishing && row.updated_at <= cutoff;
            if row.status == OutboxStatus::Failed || stale_publishing {
                row.status = OutboxStatus::Pending;
                row.updated_at = Utc::now();
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn delete_sent_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, RepositoryError> {
        let mut store = self.store.lock().expect("outbox store lock");
        let mut victims: Vec<(DateTime<Utc>, Uuid)> = store
            .rows
            .values()
            .filter(|r| r.status == OutboxStatus::Sent)
            .filter_map(|r| r.sent_at.filter(|t| *t < cutoff).map(|t| (t, r.event_id)))
            .collect();
        victims.sort();
        victims.truncate(limit);

        for (_, id) in &victims {
            store.rows.remove(id);
            store.order.retain(|o| o != id);
        }
        Ok(victims.len() as u64)
    }

    async fn pending_count(&self) -> Result<u64, RepositoryError> {
        let store = self.store.lock().expect("outbox store lock");
        Ok(store
            .rows
            .values()
            .filter(|r| r.status == OutboxStatus::Pending)
            .count() as u64)
    }
}

/// Inbox repository backed by process memory.
#[derive(Default)]
pub struct MemoryInboxRepository {
    rows: Mutex<HashMap<Uuid, InboxRecord>>,
}

impl MemoryInboxRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a stored row (test inspection).
    pub fn get(&self, event_id: &Uuid) -> Option<InboxRecord> {
        self.rows
            .lock()
            .expect("inbox store lock")
            .get(event_id)
            .cloned()
    }
}

#[async_trait]
impl InboxRepository for MemoryInboxRepository {
    async fn find_or_create(
        &self,
        record: &NewInboxRecord,
    ) -> Result<(InboxRecord, bool), RepositoryError> {
        let mut rows = self.rows.lock().expect("inbox store lock");

        if let Some(existing) = rows.get_mut(&record.event_id) {
            existing.deliveries = existing.deliveries.max(record.deliveries);
            existing.updated_at = Utc::now();
            return Ok((existing.clone(), true));
        }

        // Secondary dedupe key when stream coordinates are present.
        if let (Some(stream), Some(seq)) = (&record.stream, record.stream_seq) {
            let collision = rows
                .values()
                .find(|r| r.stream.as_deref() == Some(stream.as_str()) && r.stream_seq == Some(seq))
                .cloned();
            if let Some(existing) = collision {
                return Ok((existing, true));
            }
        }

        let now = Utc::now();
        let row = InboxRecord {
            event_id: record.event_id,
            subject: record.subject.clone(),
            payload: record.payload.clone(),
            headers: record.headers.clone(),
            stream: record.stream.clone(),
            stream_seq: record.stream_seq,
            deliveries: record.deliveries.max(1),
            status: InboxStatus::Processing,
            last_error: None,
            received_at: now,
            processed_at: None,
            created_at: now,
            updated_at: now,
        };
        rows.insert(record.event_id, row.clone());
        Ok((row, false))
    }

    async fn mark_processing(&self, event_id: &Uuid) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().expect("inbox store lock");
        let row = rows.get_mut(event_id).ok_or(RepositoryError::NotFound {
            event_id: *event_id,
        })?;
        if row.status != InboxStatus::Processed {
            row.status = InboxStatus::Processing;
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_processed(&self, event_id: &Uuid) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().expect("inbox store lock");
        let row = rows.get_mut(event_id).ok_or(RepositoryError::NotFound {
            event_id: *event_id,
        })?;
        row.status = InboxStatus::Processed;
        row.processed_at = Some(Utc::now());
        row.last_error = None;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(&self, event_id: &Uuid, error: &str) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().expect("inbox store lock");
        let row = rows.get_mut(event_id).ok_or(RepositoryError::NotFound {
            event_id: *event_id,
        })?;
        if row.status != InboxStatus::Processed {
            row.status = InboxStatus::Failed;
            row.last_error = Some(error.to_string());
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reset_stale(&self, older_than_minutes: i64) -> Result<u64, RepositoryError> {
        let cutoff = Utc::now() - chrono::Duration::minutes(older_than_minutes);
        let mut rows = self.rows.lock().expect("inbox store lock");
        let mut reset = 0;
        for row in rows.values_mut() {
            if row.status == InboxStatus::Processing && row.updated_at <= cutoff {
                row.status = InboxStatus::Failed;
                row.last_error = Some("stale processing record".to_string());
                row.updated_at = Utc::now();
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn delete_processed_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, RepositoryError> {
        let mut rows = self.rows.lock().expect("inbox store lock");
        let mut victims: Vec<(DateTime<Utc>, Uuid)> = rows
            .values()
            .filter(|r| r.status == InboxStatus::Processed)
            .filter_map(|r| {
                r.processed_at
                    .filter(|t| *t < cutoff)
                    .map(|t| (t, r.event_id))
            })
            .collect();
        victims.sort();
        victims.truncate(limit);

        for (_, id) in &victims {
            rows.remove(id);
        }
        Ok(victims.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_ports::{Retention, Storage};

    fn desc(name: &str, subjects: &[&str]) -> StreamDesc {
        StreamDesc {
            name: name.to_string(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            retention: Retention::Limits,
            storage: Storage::File,
            max_age: Duration::from_secs(3600),
            discard_old: true,
        }
    }

    fn spec(stream: &str, durable: &str, filter: &str) -> ConsumerSpec {
        ConsumerSpec {
            stream: stream.to_string(),
            durable_name: durable.to_string(),
            filter_subject: filter.to_string(),
            max_deliver: 5,
            ack_wait: Duration::from_secs(30),
            backoff: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_publish_requires_matching_stream() {
        let bus = MemoryBusClient::new();
        let err = bus
            .publish("test.orphan", Headers::new(), b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Publish { .. }));
    }

    #[tokio::test]
    async fn test_publish_fetch_ack() {
        let bus = MemoryBusClient::new();
        bus.create_stream(&desc("events", &["test.>"])).await.unwrap();
        bus.create_consumer(&spec("events", "worker", "test.>"))
            .await
            .unwrap();

        bus.publish("test.orders", Headers::new(), b"one".to_vec())
            .await
            .unwrap();

        let batch = bus
            .fetch("events", "worker", 10, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].subject(), "test.orders");
        assert_eq!(batch[0].info().delivered, 1);
        batch[0].ack().await.unwrap();

        let empty = bus
            .fetch("events", "worker", 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_nak_redelivers_with_bumped_count() {
        let bus = MemoryBusClient::new();
        bus.create_stream(&desc("events", &["test.>"])).await.unwrap();
        bus.create_consumer(&spec("events", "worker", "test.>"))
            .await
            .unwrap();
        bus.publish("test.orders", Headers::new(), b"one".to_vec())
            .await
            .unwrap();

        let first = bus
            .fetch("events", "worker", 1, Duration::from_millis(50))
            .await
            .unwrap();
        first[0].nak(None).await.unwrap();

        let second = bus
            .fetch("events", "worker", 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(second[0].info().delivered, 2);
    }

    #[tokio::test]
    async fn test_term_stops_redelivery() {
        let bus = MemoryBusClient::new();
        bus.create_stream(&desc("events", &["test.>"])).await.unwrap();
        bus.create_consumer(&spec("events", "worker", "test.>"))
            .await
            .unwrap();
        bus.publish("test.orders", Headers::new(), b"one".to_vec())
            .await
            .unwrap();

        let batch = bus
            .fetch("events", "worker", 1, Duration::from_millis(50))
            .await
            .unwrap();
        batch[0].term().await.unwrap();

        let empty = bus
            .fetch("events", "worker", 1, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_msg_id_detected() {
        let bus = MemoryBusClient::new();
        bus.create_stream(&desc("events", &["test.>"])).await.unwrap();

        let mut headers = Headers::new();
        headers.insert(MSG_ID_HEADER.to_string(), "evt-1".to_string());

        let first = bus
            .publish("test.orders", headers.clone(), b"one".to_vec())
            .await
            .unwrap();
        assert!(!first.duplicate);

        let second = bus
            .publish("test.orders", headers, b"one".to_vec())
            .await
            .unwrap();
        assert!(second.duplicate);
        assert_eq!(second.sequence, first.sequence);
        assert_eq!(bus.message_count("events"), 1);
    }

    #[tokio::test]
    async fn test_create_stream_rejects_overlap() {
        let bus = MemoryBusClient::new();
        bus.create_stream(&desc("users", &["test.events.users.>"]))
            .await
            .unwrap();

        let err = bus
            .create_stream(&desc("all", &["test.events.>"]))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::SubjectOverlap { .. }));
    }

    #[tokio::test]
    async fn test_new_durable_receives_backlog() {
        let bus = MemoryBusClient::new();
        bus.create_stream(&desc("events", &["test.>"])).await.unwrap();
        bus.publish("test.a", Headers::new(), b"1".to_vec()).await.unwrap();
        bus.publish("test.b", Headers::new(), b"2".to_vec()).await.unwrap();

        bus.create_consumer(&spec("events", "late", "test.>"))
            .await
            .unwrap();
        let batch = bus
            .fetch("events", "late", 10, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn test_outbox_repository_transitions() {
        let repo = MemoryOutboxRepository::new();
        let record = NewOutboxRecord {
            event_id: Uuid::new_v4(),
            subject: "test.orders".to_string(),
            payload: b"{}".to_vec(),
            headers: Headers::new(),
        };

        let row = repo.find_or_create(&record).await.unwrap();
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.attempts, 0);

        let row = repo.mark_publishing(&record.event_id).await.unwrap();
        assert_eq!(row.status, OutboxStatus::Publishing);
        assert_eq!(row.attempts, 1);

        repo.mark_sent(&record.event_id).await.unwrap();
        let row = repo.get(&record.event_id).unwrap();
        assert_eq!(row.status, OutboxStatus::Sent);
        assert!(row.sent_at.is_some());
    }

    #[tokio::test]
    async fn test_inbox_repository_dedupe() {
        let repo = MemoryInboxRepository::new();
        let record = NewInboxRecord {
            event_id: Uuid::new_v4(),
            subject: "test.orders".to_string(),
            payload: b"{}".to_vec(),
            headers: Headers::new(),
            stream: Some("events".to_string()),
            stream_seq: Some(4),
            deliveries: 1,
        };

        let (_, existed) = repo.find_or_create(&record).await.unwrap();
        assert!(!existed);

        let redelivery = NewInboxRecord {
            deliveries: 2,
            ..record.clone()
        };
        let (row, existed) = repo.find_or_create(&redelivery).await.unwrap();
        assert!(existed);
        assert_eq!(row.deliveries, 2);

        // Different event id, same stream coordinates.
        let coordinate_dup = NewInboxRecord {
            event_id: Uuid::new_v4(),
            ..record.clone()
        };
        let (row, existed) = repo.find_or_create(&coordinate_dup).await.unwrap();
        assert!(existed);
        assert_eq!(row.event_id, record.event_id);
    }
}
