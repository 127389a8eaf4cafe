//! NATS JetStream bus client
//!
//! Implements the `BusClient` port on top of async-nats:
//! - JetStream publishes with the `Nats-Msg-Id` idempotency header
//! - Stream create/update/list for topology provisioning
//! - Durable pull consumers with explicit ack and redelivery handling
//! - Connection drain for graceful shutdown
//!
//! Consumer handles are cached per `(stream, durable)` so repeated fetches
//! do not re-resolve the consumer on every pull.

use std::collections::HashMap;
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull::Config as PullConsumerConfig, AckPolicy, DeliverPolicy, ReplayPolicy},
    stream::{
        Config as StreamConfig, DiscardPolicy, RetentionPolicy as NatsRetention,
        StorageType as NatsStorage,
    },
    AckKind, Context as JetStreamContext,
};
use async_nats::Client as NatsClient;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use relay_ports::{
    BusClient, BusDelivery, BusError, ConnectionState, ConsumerLag, ConsumerSpec, DeliveryInfo,
    Headers, PublishReceipt, Retention, Storage, StreamDesc, StreamInfo,
};

type PullConsumer = jetstream::consumer::Consumer<PullConsumerConfig>;

/// Production bus client backed by NATS JetStream.
pub struct NatsBusClient {
    client: NatsClient,
    jetstream: JetStreamContext,
    consumers: RwLock<HashMap<(String, String), PullConsumer>>,
}

impl NatsBusClient {
    /// Connect to the given servers and initialize the JetStream context.
    pub async fn connect(urls: &[String]) -> Result<Self, BusError> {
        let address = urls.join(",");
        info!(servers = %address, "Connecting to NATS");

        let client = async_nats::connect(address)
            .await
            .map_err(|e| BusError::Connection {
                message: format!("failed to connect to NATS: {e}"),
            })?;

        Ok(Self::new(client))
    }

    /// Wrap an already-connected client.
    pub fn new(client: NatsClient) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            consumers: RwLock::new(HashMap::new()),
        }
    }

    /// Direct access to the underlying client for embedders that need NATS
    /// features outside the port surface.
    pub fn client(&self) -> &NatsClient {
        &self.client
    }

    async fn pull_handle(&self, stream: &str, durable: &str) -> Result<PullConsumer, BusError> {
        let key = (stream.to_string(), durable.to_string());
        {
            let cache = self.consumers.read().await;
            if let Some(consumer) = cache.get(&key) {
                return Ok(consumer.clone());
            }
        }

        let js_stream = self.get_stream(stream).await?;
        let consumer: PullConsumer = js_stream
            .get_consumer(durable)
            .await
            .map_err(|e| classify_consumer_error(stream, durable, &e.to_string()))?;

        let mut cache = self.consumers.write().await;
        cache.insert(key, consumer.clone());
        Ok(consumer)
    }

    async fn invalidate_consumer(&self, stream: &str, durable: &str) {
        let mut cache = self.consumers.write().await;
        cache.remove(&(stream.to_string(), durable.to_string()));
    }

    async fn get_stream(&self, name: &str) -> Result<jetstream::stream::Stream, BusError> {
        self.jetstream.get_stream(name).await.map_err(|e| {
            let message = e.to_string();
            if is_not_found(&message) {
                BusError::StreamNotFound {
                    name: name.to_string(),
                }
            } else {
                BusError::Internal { message }
            }
        })
    }
}

#[async_trait]
impl BusClient for NatsBusClient {
    #[instrument(skip(self, headers, payload), fields(subject = %subject))]
    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> Result<PublishReceipt, BusError> {
        let mut header_map = async_nats::HeaderMap::new();
        for (key, value) in &headers {
            header_map.insert(key.as_str(), value.as_str());
        }

        let ack_future = self
            .jetstream
            .publish_with_headers(subject.to_string(), header_map, payload.into())
            .await
            .map_err(|e| BusError::Publish {
                message: format!("failed to publish: {e}"),
            })?;

        let ack = ack_future.await.map_err(|e| BusError::Publish {
            message: format!("failed to get publish ack: {e}"),
        })?;

        debug!(
            subject = %subject,
            stream = %ack.stream,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "Message published to JetStream"
        );

        Ok(PublishReceipt {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    async fn stream_info(&self, name: &str) -> Result<Option<StreamInfo>, BusError> {
        match self.get_stream(name).await {
            Ok(stream) => Ok(Some(stream_info_from(stream.cached_info()))),
            Err(BusError::StreamNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, desc), fields(stream = %desc.name))]
    async fn create_stream(&self, desc: &StreamDesc) -> Result<(), BusError> {
        let config = stream_config_from(desc);
        self.jetstream.create_stream(config).await.map_err(|e| {
            let message = e.to_string();
            if is_overlap(&message) {
                BusError::SubjectOverlap { message }
            } else {
                BusError::Internal { message }
            }
        })?;

        info!(stream = %desc.name, subjects = ?desc.subjects, "Stream created");
        Ok(())
    }

    #[instrument(skip(self, desc), fields(stream = %desc.name))]
    async fn update_stream(&self, desc: &StreamDesc) -> Result<(), BusError> {
        // Read back the live config so retention is carried over untouched.
        let stream = self.get_stream(&desc.name).await?;
        let mut config = stream.cached_info().config.clone();
        config.subjects = desc.subjects.clone();
        config.storage = storage_to_nats(desc.storage);
        config.max_age = desc.max_age;

        self.jetstream.update_stream(config).await.map_err(|e| {
            let message = e.to_string();
            if is_overlap(&message) {
                BusError::SubjectOverlap { message }
            } else {
                BusError::Internal { message }
            }
        })?;

        debug!(stream = %desc.name, subjects = ?desc.subjects, "Stream updated");
        Ok(())
    }

    async fn list_streams(&self) -> Result<Vec<StreamInfo>, BusError> {
        let mut streams = self.jetstream.streams();
        let mut result = Vec::new();
        while let Some(info) = streams.try_next().await.map_err(|e| BusError::Internal {
            message: e.to_string(),
        })? {
            result.push(stream_info_from(&info));
        }
        Ok(result)
    }

    async fn consumer_info(
        &self,
        stream: &str,
        durable: &str,
    ) -> Result<Option<ConsumerSpec>, BusError> {
        let js_stream = self.get_stream(stream).await?;
        match js_stream.get_consumer::<PullConsumerConfig>(durable).await {
            Ok(consumer) => {
                let info = consumer.cached_info();
                Ok(Some(ConsumerSpec {
                    stream: stream.to_string(),
                    durable_name: durable.to_string(),
                    filter_subject: info.config.filter_subject.clone(),
                    max_deliver: info.config.max_deliver,
                    ack_wait: info.config.ack_wait,
                    backoff: info.config.backoff.clone(),
                }))
            }
            Err(e) => {
                let message = e.to_string();
                if is_not_found(&message) {
                    Ok(None)
                } else {
                    Err(BusError::Internal { message })
                }
            }
        }
    }

    #[instrument(skip(self, spec), fields(stream = %spec.stream, durable = %spec.durable_name))]
    async fn create_consumer(&self, spec: &ConsumerSpec) -> Result<(), BusError> {
        let js_stream = self.get_stream(&spec.stream).await?;

        let config = PullConsumerConfig {
            durable_name: Some(spec.durable_name.clone()),
            ack_policy: AckPolicy::Explicit,
            deliver_policy: DeliverPolicy::All,
            replay_policy: ReplayPolicy::Instant,
            filter_subject: spec.filter_subject.clone(),
            max_deliver: spec.max_deliver,
            ack_wait: spec.ack_wait,
            backoff: spec.backoff.clone(),
            ..Default::default()
        };

        let consumer = js_stream
            .create_consumer(config)
            .await
            .map_err(|e| BusError::Internal {
                message: format!("failed to create consumer: {e}"),
            })?;

        let mut cache = self.consumers.write().await;
        cache.insert(
            (spec.stream.clone(), spec.durable_name.clone()),
            consumer,
        );

        info!(
            stream = %spec.stream,
            durable = %spec.durable_name,
            filter = %spec.filter_subject,
            "Consumer created"
        );
        Ok(())
    }

    async fn delete_consumer(&self, stream: &str, durable: &str) -> Result<(), BusError> {
        self.invalidate_consumer(stream, durable).await;
        let js_stream = self.get_stream(stream).await?;
        js_stream
            .delete_consumer(durable)
            .await
            .map_err(|e| classify_consumer_error(stream, durable, &e.to_string()))?;
        debug!(stream = %stream, durable = %durable, "Consumer deleted");
        Ok(())
    }

    async fn fetch(
        &self,
        stream: &str,
        durable: &str,
        batch: usize,
        expires: Duration,
    ) -> Result<Vec<Box<dyn BusDelivery>>, BusError> {
        let consumer = self.pull_handle(stream, durable).await?;

        let messages = consumer
            .fetch()
            .max_messages(batch)
            .expires(expires)
            .messages()
            .await
            .map_err(|e| {
                let message = e.to_string();
                if is_not_found(&message) {
                    classify_consumer_error(stream, durable, &message)
                } else if is_timeout(&message) {
                    BusError::Timeout { message }
                } else {
                    BusError::Internal { message }
                }
            })?;

        let collected: Vec<_> = messages.take(batch).collect().await;

        let mut deliveries: Vec<Box<dyn BusDelivery>> = Vec::with_capacity(collected.len());
        for result in collected {
            match result {
                Ok(message) => match NatsDelivery::new(message) {
                    Ok(delivery) => deliveries.push(Box::new(delivery)),
                    Err(e) => warn!(error = %e, "Skipping message with unreadable delivery info"),
                },
                Err(e) => {
                    warn!(error = %e, stream = %stream, durable = %durable, "Failed to receive message");
                }
            }
        }

        Ok(deliveries)
    }

    fn connection_state(&self) -> ConnectionState {
        match self.client.connection_state() {
            async_nats::connection::State::Connected => ConnectionState::Connected,
            async_nats::connection::State::Pending => ConnectionState::Pending,
            async_nats::connection::State::Disconnected => ConnectionState::Disconnected,
        }
    }

    fn server_names(&self) -> Vec<String> {
        let info = self.client.server_info();
        let mut servers = vec![format!("{}:{}", info.host, info.port)];
        servers.extend(info.connect_urls);
        servers
    }

    async fn consumer_lag(&self, stream: &str) -> Result<Vec<ConsumerLag>, BusError> {
        let js_stream = self.get_stream(stream).await?;
        let mut consumers = js_stream.consumers();
        let mut lags = Vec::new();
        while let Some(info) = consumers.try_next().await.map_err(|e| BusError::Internal {
            message: e.to_string(),
        })? {
            lags.push(ConsumerLag {
                name: info.name,
                pending: info.num_pending,
                delivered: info.delivered.consumer_sequence,
                ack_pending: info.num_ack_pending as u64,
            });
        }
        Ok(lags)
    }

    async fn drain(&self) -> Result<(), BusError> {
        self.client.drain().await.map_err(|e| BusError::Connection {
            message: format!("failed to drain connection: {e}"),
        })
    }
}

// ============================================================================
// Delivery wrapper
// ============================================================================

/// One JetStream delivery with explicit ack control.
struct NatsDelivery {
    message: jetstream::Message,
    info: DeliveryInfo,
}

impl NatsDelivery {
    fn new(message: jetstream::Message) -> Result<Self, BusError> {
        let info = {
            let raw = message.info().map_err(|e| BusError::Internal {
                message: format!("failed to parse delivery info: {e}"),
            })?;
            DeliveryInfo {
                stream: raw.stream.to_string(),
                consumer: raw.consumer.to_string(),
                stream_sequence: raw.stream_sequence,
                delivered: raw.delivered.max(1) as u64,
            }
        };
        Ok(Self { message, info })
    }
}

#[async_trait]
impl BusDelivery for NatsDelivery {
    fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn headers(&self) -> Headers {
        let mut headers = HashMap::new();
        if let Some(nats_headers) = &self.message.headers {
            for (key, values) in nats_headers.iter() {
                if let Some(value) = values.first() {
                    headers.insert(key.to_string(), value.to_string());
                }
            }
        }
        headers
    }

    fn info(&self) -> DeliveryInfo {
        self.info.clone()
    }

    async fn ack(&self) -> Result<(), BusError> {
        self.message.ack().await.map_err(|e| BusError::Internal {
            message: format!("failed to ack: {e}"),
        })
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), BusError> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| BusError::Internal {
                message: format!("failed to nak: {e}"),
            })
    }

    async fn term(&self) -> Result<(), BusError> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| BusError::Internal {
                message: format!("failed to term: {e}"),
            })
    }
}

// ============================================================================
// Config mapping
// ============================================================================

fn stream_config_from(desc: &StreamDesc) -> StreamConfig {
    StreamConfig {
        name: desc.name.clone(),
        subjects: desc.subjects.clone(),
        retention: retention_to_nats(desc.retention),
        storage: storage_to_nats(desc.storage),
        max_age: desc.max_age,
        discard: if desc.discard_old {
            DiscardPolicy::Old
        } else {
            DiscardPolicy::New
        },
        ..Default::default()
    }
}

fn stream_info_from(info: &jetstream::stream::Info) -> StreamInfo {
    StreamInfo {
        name: info.config.name.clone(),
        subjects: info.config.subjects.clone(),
        retention: retention_from_nats(info.config.retention),
        storage: storage_from_nats(info.config.storage),
        max_age: info.config.max_age,
        messages: info.state.messages,
    }
}

fn retention_to_nats(retention: Retention) -> NatsRetention {
    match retention {
        Retention::Limits => NatsRetention::Limits,
        Retention::Interest => NatsRetention::Interest,
        Retention::WorkQueue => NatsRetention::WorkQueue,
    }
}

fn retention_from_nats(retention: NatsRetention) -> Retention {
    match retention {
        NatsRetention::Limits => Retention::Limits,
        NatsRetention::Interest => Retention::Interest,
        NatsRetention::WorkQueue => Retention::WorkQueue,
    }
}

fn storage_to_nats(storage: Storage) -> NatsStorage {
    match storage {
        Storage::File => NatsStorage::File,
        Storage::Memory => NatsStorage::Memory,
    }
}

fn storage_from_nats(storage: NatsStorage) -> Storage {
    match storage {
        NatsStorage::File => Storage::File,
        NatsStorage::Memory => Storage::Memory,
    }
}

// ============================================================================
// Error classification
// ============================================================================

fn is_not_found(message: &str) -> bool {
    message.to_lowercase().contains("not found")
}

fn is_overlap(message: &str) -> bool {
    message.to_lowercase().contains("overlap")
}

fn is_timeout(message: &str) -> bool {
    message.to_lowercase().contains("timed out") || message.to_lowercase().contains("timeout")
}

fn classify_consumer_error(stream: &str, durable: &str, message: &str) -> BusError {
    if is_not_found(message) {
        BusError::ConsumerNotFound {
            stream: stream.to_string(),
            name: durable.to_string(),
        }
    } else {
        BusError::Internal {
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_config_mapping() {
        let desc = StreamDesc {
            name: "test-events".to_string(),
            subjects: vec!["test.events.>".to_string(), "test.svc-a.>".to_string()],
            retention: Retention::Limits,
            storage: Storage::File,
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            discard_old: true,
        };

        let config = stream_config_from(&desc);
        assert_eq!(config.name, "test-events");
        assert_eq!(config.subjects.len(), 2);
        assert_eq!(config.retention, NatsRetention::Limits);
        assert_eq!(config.storage, NatsStorage::File);
        assert_eq!(config.discard, DiscardPolicy::Old);
    }

    #[test]
    fn test_error_classification() {
        assert!(is_not_found("jetstream error: stream not found (code 404)"));
        assert!(is_overlap("subjects overlap with an existing stream"));
        assert!(is_timeout("request timed out"));
        assert!(!is_not_found("permission denied"));
    }

    #[test]
    fn test_classify_consumer_error() {
        let err = classify_consumer_error("events", "svc-a-orders", "consumer not found");
        assert!(matches!(err, BusError::ConsumerNotFound { .. }));

        let err = classify_consumer_error("events", "svc-a-orders", "boom");
        assert!(matches!(err, BusError::Internal { .. }));
    }
}
