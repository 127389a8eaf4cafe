//! Relay Test Harness
//!
//! In-process facility for exercising the runtime without a server:
//! - captures every publish (dead-letter traffic kept separately queryable)
//! - inline mode: publishing dispatches synchronously to matching
//!   subscribers through the real message processor
//! - tracks handler invocations by subscriber name
//! - injects simulated failures keyed by subscriber name
//! - `wait_for` polls a predicate under a timeout
//! - `cleanup` stops the runtime and clears all captured state
//!
//! Each test builds its own harness; nothing is shared between tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use relay_domain::envelope::MSG_ID_HEADER;
use relay_domain::errors::{HandlerError, PublishError};
use relay_domain::RelayConfig;
use relay_ports::{
    BusClient, BusDelivery, BusError, ConnectionState, ConsumerLag, ConsumerSpec, CountingMetrics,
    DeliveryInfo, Headers, MetricsSnapshot, PublishReceipt, StreamDesc, StreamInfo,
};
use relay_adapters::{MemoryInboxRepository, MemoryOutboxRepository};
use relay_runtime::{
    Disposition, EventRuntime, MessageProcessor, PublishOptions, PublishResult, Publisher,
    RuntimeError, Subscriber,
};

/// One publish captured by the harness bus.
#[derive(Debug, Clone)]
pub struct CapturedMessage {
    pub subject: String,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

struct FailurePlan {
    error: HandlerError,
    /// `None` fails every invocation; `Some(n)` fails the next n
    remaining: Option<u32>,
}

struct StoredDelivery {
    subject: String,
    headers: Headers,
    payload: Vec<u8>,
    deliveries: u64,
}

#[derive(Default)]
struct HarnessState {
    invocations: Mutex<HashMap<String, u64>>,
    failures: Mutex<HashMap<String, FailurePlan>>,
    deliveries: Mutex<HashMap<Uuid, StoredDelivery>>,
    dispositions: Mutex<HashMap<Uuid, Disposition>>,
}

impl HarnessState {
    fn record_invocation(&self, name: &str) {
        *self
            .invocations
            .lock()
            .expect("invocations lock")
            .entry(name.to_string())
            .or_insert(0) += 1;
    }

    fn take_failure(&self, name: &str) -> Option<HandlerError> {
        let mut failures = self.failures.lock().expect("failures lock");
        let plan = failures.get_mut(name)?;
        let error = plan.error.clone();
        let (fail_now, exhausted) = match &mut plan.remaining {
            None => (true, false),
            Some(0) => (false, true),
            Some(n) => {
                *n -= 1;
                (true, *n == 0)
            }
        };
        if exhausted {
            failures.remove(name);
        }
        fail_now.then_some(error)
    }

    fn clear(&self) {
        self.invocations.lock().expect("invocations lock").clear();
        self.failures.lock().expect("failures lock").clear();
        self.deliveries.lock().expect("deliveries lock").clear();
        self.dispositions.lock().expect("dispositions lock").clear();
    }
}

// ============================================================================
// Capture bus
// ============================================================================

/// Bus double that records publishes and, in inline mode, feeds each one
/// straight through the message processor.
struct CaptureBus {
    dlq_subject: String,
    published: Mutex<Vec<CapturedMessage>>,
    streams: Mutex<Vec<StreamDesc>>,
    sequence: Mutex<u64>,
    processor: OnceCell<Arc<MessageProcessor>>,
    state: Arc<HarnessState>,
}

impl CaptureBus {
    fn new(dlq_subject: String, state: Arc<HarnessState>) -> Self {
        Self {
            dlq_subject,
            published: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
            sequence: Mutex::new(0),
            processor: OnceCell::new(),
            state,
        }
    }

    fn next_sequence(&self) -> u64 {
        let mut seq = self.sequence.lock().expect("sequence lock");
        *seq += 1;
        *seq
    }

    async fn dispatch(
        &self,
        event_id: Uuid,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
        sequence: u64,
    ) -> Option<Disposition> {
        let processor = self.processor.get()?.clone();

        let deliveries = {
            let mut stored = self.state.deliveries.lock().expect("deliveries lock");
            let entry = stored.entry(event_id).or_insert_with(|| StoredDelivery {
                subject: subject.to_string(),
                headers: headers.clone(),
                payload: payload.clone(),
                deliveries: 0,
            });
            entry.deliveries += 1;
            entry.deliveries
        };

        let delivery = HarnessDelivery {
            subject: subject.to_string(),
            headers,
            payload,
            info: DeliveryInfo {
                stream: "harness".to_string(),
                consumer: "inline".to_string(),
                stream_sequence: sequence,
                delivered: deliveries,
            },
        };

        let disposition = processor.process(&delivery).await;
        self.state
            .dispositions
            .lock()
            .expect("dispositions lock")
            .insert(event_id, disposition);
        Some(disposition)
    }
}

#[async_trait]
impl BusClient for CaptureBus {
    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> Result<PublishReceipt, BusError> {
        let sequence = self.next_sequence();
        self.published
            .lock()
            .expect("published lock")
            .push(CapturedMessage {
                subject: subject.to_string(),
                headers: headers.clone(),
                payload: payload.clone(),
            });

        // Dead-letter traffic is captured, never dispatched.
        if subject != self.dlq_subject {
            let event_id = headers
                .get(MSG_ID_HEADER)
                .and_then(|id| Uuid::parse_str(id).ok())
                .unwrap_or_else(Uuid::new_v4);
            self.dispatch(event_id, subject, headers, payload, sequence)
                .await;
        }

        Ok(PublishReceipt {
            stream: "harness".to_string(),
            sequence,
            duplicate: false,
        })
    }

    async fn stream_info(&self, name: &str) -> Result<Option<StreamInfo>, BusError> {
        let streams = self.streams.lock().expect("streams lock");
        Ok(streams.iter().find(|s| s.name == name).map(|s| StreamInfo {
            name: s.name.clone(),
            subjects: s.subjects.clone(),
            retention: s.retention,
            storage: s.storage,
            max_age: s.max_age,
            messages: 0,
        }))
    }

    async fn create_stream(&self, desc: &StreamDesc) -> Result<(), BusError> {
        let mut streams = self.streams.lock().expect("streams lock");
        if !streams.iter().any(|s| s.name == desc.name) {
            streams.push(desc.clone());
        }
        Ok(())
    }

    async fn update_stream(&self, desc: &StreamDesc) -> Result<(), BusError> {
        let mut streams = self.streams.lock().expect("streams lock");
        if let Some(existing) = streams.iter_mut().find(|s| s.name == desc.name) {
            *existing = desc.clone();
        }
        Ok(())
    }

    async fn list_streams(&self) -> Result<Vec<StreamInfo>, BusError> {
        let streams = self.streams.lock().expect("streams lock");
        Ok(streams
            .iter()
            .map(|s| StreamInfo {
                name: s.name.clone(),
                subjects: s.subjects.clone(),
                retention: s.retention,
                storage: s.storage,
                max_age: s.max_age,
                messages: 0,
            })
            .collect())
    }

    async fn consumer_info(
        &self,
        _stream: &str,
        _durable: &str,
    ) -> Result<Option<ConsumerSpec>, BusError> {
        Ok(None)
    }

    async fn create_consumer(&self, _spec: &ConsumerSpec) -> Result<(), BusError> {
        Ok(())
    }

    async fn delete_consumer(&self, _stream: &str, _durable: &str) -> Result<(), BusError> {
        Ok(())
    }

    async fn fetch(
        &self,
        _stream: &str,
        _durable: &str,
        _batch: usize,
        _expires: Duration,
    ) -> Result<Vec<Box<dyn BusDelivery>>, BusError> {
        Ok(Vec::new())
    }

    fn connection_state(&self) -> ConnectionState {
        ConnectionState::Connected
    }

    fn server_names(&self) -> Vec<String> {
        vec!["harness".to_string()]
    }

    async fn consumer_lag(&self, _stream: &str) -> Result<Vec<ConsumerLag>, BusError> {
        Ok(Vec::new())
    }

    async fn drain(&self) -> Result<(), BusError> {
        Ok(())
    }
}

/// Synthetic delivery fed to the processor in inline mode. The processor's
/// decision is recorded by the harness; acknowledgements here are no-ops.
struct HarnessDelivery {
    subject: String,
    headers: Headers,
    payload: Vec<u8>,
    info: DeliveryInfo,
}

#[async_trait]
impl BusDelivery for HarnessDelivery {
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
        Ok(())
    }

    async fn nak(&self, _delay: Option<Duration>) -> Result<(), BusError> {
        Ok(())
    }

    async fn term(&self) -> Result<(), BusError> {
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

/// In-process harness wrapping a private `EventRuntime`.
pub struct TestHarness {
    runtime: EventRuntime,
    bus: Arc<CaptureBus>,
    state: Arc<HarnessState>,
    metrics: Arc<CountingMetrics>,
    outbox_repo: Arc<MemoryOutboxRepository>,
    inbox_repo: Arc<MemoryInboxRepository>,
    dlq_subject: String,
}

impl TestHarness {
    /// Harness over a default `test`/`svc-a` configuration.
    pub fn new() -> Self {
        Self::with_config(RelayConfig {
            env: "test".to_string(),
            app_name: "svc-a".to_string(),
            ..Default::default()
        })
    }

    /// Harness over an explicit configuration.
    pub fn with_config(config: RelayConfig) -> Self {
        let state = Arc::new(HarnessState::default());
        let dlq_subject = config.dlq_subject();
        let bus = Arc::new(CaptureBus::new(dlq_subject.clone(), state.clone()));
        let metrics = Arc::new(CountingMetrics::new());
        let outbox_repo = Arc::new(MemoryOutboxRepository::new());
        let inbox_repo = Arc::new(MemoryInboxRepository::new());

        let runtime = EventRuntime::builder(config, bus.clone())
            .outbox_repository(outbox_repo.clone())
            .inbox_repository(inbox_repo.clone())
            .metrics(metrics.clone())
            .build()
            .expect("harness runtime assembly");

        Self {
            runtime,
            bus,
            state,
            metrics,
            outbox_repo,
            inbox_repo,
            dlq_subject,
        }
    }

    pub fn runtime(&self) -> &EventRuntime {
        &self.runtime
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        self.runtime.publisher()
    }

    pub fn outbox_repository(&self) -> &Arc<MemoryOutboxRepository> {
        &self.outbox_repo
    }

    pub fn inbox_repository(&self) -> &Arc<MemoryInboxRepository> {
        &self.inbox_repo
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Register a subscriber wrapped with invocation tracking and failure
    /// injection. Must happen before the first publish.
    pub fn subscribe(&self, subscriber: Subscriber) -> Result<(), RuntimeError> {
        let original = Arc::new(subscriber);
        let name = original.name().to_string();

        let mut builder = Subscriber::builder(original.name())
            .patterns(original.patterns().iter().cloned());
        if let Some(timeout_ms) = original.options().timeout_ms {
            builder = builder.timeout_ms(timeout_ms);
        }

        let state = self.state.clone();
        let inner = original.clone();
        let tracked_name = name.clone();
        builder = builder.handler(move |message: Value, ctx| {
            let state = state.clone();
            let inner = inner.clone();
            let name = tracked_name.clone();
            async move {
                state.record_invocation(&name);
                if let Some(error) = state.take_failure(&name) {
                    debug!(subscriber = %name, "Injecting simulated failure");
                    return Err(error);
                }
                inner.handle(message, ctx).await
            }
        });

        let decider = original.clone();
        builder = builder.on_error(move |ctx| decider.on_error(ctx));

        self.runtime
            .subscribe(builder.build().expect("wrapped subscriber"))
    }

    /// Publish through the real publisher; in inline mode this dispatches
    /// synchronously to every matching subscriber.
    pub async fn publish(
        &self,
        topic: &str,
        message: Value,
        opts: PublishOptions,
    ) -> Result<PublishResult, PublishError> {
        self.ensure_inline();
        self.publisher().publish(topic, message, opts).await
    }

    /// Feed raw bytes through the processor as a delivery on `subject`.
    pub async fn deliver_raw(&self, subject: &str, payload: Vec<u8>) -> Disposition {
        self.ensure_inline();
        let event_id = Uuid::new_v4();
        let sequence = self.bus.next_sequence();
        self.bus
            .dispatch(event_id, subject, Headers::new(), payload, sequence)
            .await
            .expect("inline processor installed")
    }

    /// Redeliver a previously published event with a bumped delivery
    /// counter, as the bus would after a nak.
    pub async fn redeliver(&self, event_id: Uuid) -> Option<Disposition> {
        self.ensure_inline();
        let (subject, headers, payload) = {
            let stored = self.state.deliveries.lock().expect("deliveries lock");
            let delivery = stored.get(&event_id)?;
            (
                delivery.subject.clone(),
                delivery.headers.clone(),
                delivery.payload.clone(),
            )
        };
        let sequence = self.bus.next_sequence();
        self.bus
            .dispatch(event_id, &subject, headers, payload, sequence)
            .await
    }

    /// Everything published, in order.
    pub fn published(&self) -> Vec<CapturedMessage> {
        self.bus.published.lock().expect("published lock").clone()
    }

    /// Dead-letter traffic only.
    pub fn dlq_messages(&self) -> Vec<CapturedMessage> {
        self.bus
            .published
            .lock()
            .expect("published lock")
            .iter()
            .filter(|m| m.subject == self.dlq_subject)
            .cloned()
            .collect()
    }

    /// Times a subscriber's handler ran.
    pub fn invocations(&self, subscriber: &str) -> u64 {
        self.state
            .invocations
            .lock()
            .expect("invocations lock")
            .get(subscriber)
            .copied()
            .unwrap_or(0)
    }

    /// The processor's decision for the latest delivery of an event.
    pub fn disposition(&self, event_id: Uuid) -> Option<Disposition> {
        self.state
            .dispositions
            .lock()
            .expect("dispositions lock")
            .get(&event_id)
            .copied()
    }

    /// Fail every invocation of a subscriber with this error.
    pub fn fail_handler(&self, subscriber: &str, error: HandlerError) {
        self.state.failures.lock().expect("failures lock").insert(
            subscriber.to_string(),
            FailurePlan {
                error,
                remaining: None,
            },
        );
    }

    /// Fail only the next `times` invocations of a subscriber.
    pub fn fail_handler_times(&self, subscriber: &str, times: u32, error: HandlerError) {
        self.state.failures.lock().expect("failures lock").insert(
            subscriber.to_string(),
            FailurePlan {
                error,
                remaining: Some(times),
            },
        );
    }

    /// Remove any failure plan for a subscriber.
    pub fn clear_failures(&self, subscriber: &str) {
        self.state
            .failures
            .lock()
            .expect("failures lock")
            .remove(subscriber);
    }

    /// Poll `predicate` every few milliseconds until it holds or the
    /// timeout elapses. Returns whether it held.
    pub async fn wait_for<F>(&self, predicate: F, timeout: Duration) -> bool
    where
        F: Fn(&TestHarness) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop any background work and clear all captured state.
    pub async fn cleanup(&self) {
        self.runtime.stop().await;
        self.state.clear();
        self.bus.published.lock().expect("published lock").clear();
    }

    fn ensure_inline(&self) {
        self.bus
            .processor
            .get_or_init(|| self.runtime.build_processor());
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
