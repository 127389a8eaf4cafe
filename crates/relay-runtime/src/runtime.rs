//! Runtime assembly
//!
//! One `EventRuntime` value owns everything: config, bus, repositories,
//! registry, engines, publisher, consumer, and the health probe. Services
//! build it once at startup and pass it by reference; tests build a
//! private one through the harness. There are no globals.

use std::sync::Arc;

use tracing::info;

use relay_domain::{BackoffPolicy, RelayConfig, SubjectBuilder};
use relay_ports::{
    BusClient, Clock, InboxRepository, Metrics, NoopMetrics, OutboxRepository, SystemClock,
};

use crate::consumer::{Consumer, ConsumerError};
use crate::dlq::DlqRouter;
use crate::health::HealthProbe;
use crate::inbox::InboxEngine;
use crate::middleware::{Middleware, MiddlewareChain};
use crate::outbox::OutboxEngine;
use crate::processor::MessageProcessor;
use crate::publisher::Publisher;
use crate::registry::{Registry, RegistryError};
use crate::shutdown::ShutdownSupervisor;
use crate::subscriber::Subscriber;
use crate::topology::TopologyManager;

/// Runtime assembly errors.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("use_outbox is enabled but no outbox repository was provided")]
    MissingOutboxRepository,

    #[error("use_inbox is enabled but no inbox repository was provided")]
    MissingInboxRepository,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Consumer(#[from] ConsumerError),
}

/// Builder for `EventRuntime`.
pub struct EventRuntimeBuilder {
    config: RelayConfig,
    bus: Arc<dyn BusClient>,
    outbox_repo: Option<Arc<dyn OutboxRepository>>,
    inbox_repo: Option<Arc<dyn InboxRepository>>,
    metrics: Arc<dyn Metrics>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl EventRuntimeBuilder {
    pub fn new(config: RelayConfig, bus: Arc<dyn BusClient>) -> Self {
        Self {
            config,
            bus,
            outbox_repo: None,
            inbox_repo: None,
            metrics: Arc::new(NoopMetrics),
            clock: Arc::new(SystemClock),
            backoff: BackoffPolicy::default(),
            middlewares: Vec::new(),
        }
    }

    pub fn outbox_repository(mut self, repo: Arc<dyn OutboxRepository>) -> Self {
        self.outbox_repo = Some(repo);
        self
    }

    pub fn inbox_repository(mut self, repo: Arc<dyn InboxRepository>) -> Self {
        self.inbox_repo = Some(repo);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Append one interceptor; ordering follows insertion.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn build(self) -> Result<EventRuntime, RuntimeError> {
        let config = self.config;

        let outbox = match (config.use_outbox, self.outbox_repo) {
            (true, Some(repo)) => Some(Arc::new(OutboxEngine::new(repo, self.metrics.clone()))),
            (true, None) => return Err(RuntimeError::MissingOutboxRepository),
            (false, _) => None,
        };

        let inbox = match (config.use_inbox, self.inbox_repo) {
            (true, Some(repo)) => Some(Arc::new(InboxEngine::new(repo))),
            (true, None) => return Err(RuntimeError::MissingInboxRepository),
            (false, _) => None,
        };

        let topology = Arc::new(TopologyManager::new(self.bus.clone(), config.clone()));

        let dlq = config.use_dlq.then(|| {
            Arc::new(DlqRouter::new(
                self.bus.clone(),
                topology.clone(),
                config.dlq_subject(),
                self.metrics.clone(),
            ))
        });

        let subjects = SubjectBuilder::new(&config.env, &config.app_name);
        let publisher = Arc::new(Publisher::new(
            self.bus.clone(),
            outbox.clone(),
            subjects,
            self.metrics.clone(),
            self.clock.clone(),
        ));

        let consumer = Arc::new(Consumer::new(
            self.bus.clone(),
            topology.clone(),
            config.clone(),
        ));

        let health = HealthProbe::new(self.bus.clone(), config.clone(), self.clock.clone());

        Ok(EventRuntime {
            config,
            bus: self.bus,
            registry: Arc::new(Registry::new()),
            chain: MiddlewareChain::new(self.middlewares),
            backoff: self.backoff,
            metrics: self.metrics,
            topology,
            dlq,
            outbox,
            inbox,
            publisher,
            consumer,
            health,
        })
    }
}

/// Process-wide runtime object owning every Relay component.
pub struct EventRuntime {
    config: RelayConfig,
    bus: Arc<dyn BusClient>,
    registry: Arc<Registry>,
    chain: MiddlewareChain,
    backoff: BackoffPolicy,
    metrics: Arc<dyn Metrics>,
    topology: Arc<TopologyManager>,
    dlq: Option<Arc<DlqRouter>>,
    outbox: Option<Arc<OutboxEngine>>,
    inbox: Option<Arc<InboxEngine>>,
    publisher: Arc<Publisher>,
    consumer: Arc<Consumer>,
    health: HealthProbe,
}

impl EventRuntime {
    pub fn builder(config: RelayConfig, bus: Arc<dyn BusClient>) -> EventRuntimeBuilder {
        EventRuntimeBuilder::new(config, bus)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<dyn BusClient> {
        &self.bus
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn outbox(&self) -> Option<&Arc<OutboxEngine>> {
        self.outbox.as_ref()
    }

    pub fn inbox(&self) -> Option<&Arc<InboxEngine>> {
        self.inbox.as_ref()
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    pub fn health(&self) -> &HealthProbe {
        &self.health
    }

    pub fn consumer(&self) -> &Arc<Consumer> {
        &self.consumer
    }

    /// Register a subscriber; only valid before `start()`.
    pub fn subscribe(&self, subscriber: Subscriber) -> Result<(), RuntimeError> {
        Ok(self.registry.register(Arc::new(subscriber))?)
    }

    /// Build the processor over the frozen registry (also used by the test
    /// harness for inline dispatch).
    pub fn build_processor(&self) -> Arc<MessageProcessor> {
        Arc::new(MessageProcessor::new(
            self.registry.freeze(),
            self.chain.clone(),
            self.dlq.clone(),
            self.inbox.clone(),
            self.backoff.clone(),
            self.metrics.clone(),
            &self.config,
        ))
    }

    /// Freeze the registry, provision topology, start consuming.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let frozen = self.registry.freeze();
        let processor = self.build_processor();
        self.consumer.start(frozen, processor).await?;
        info!(
            env = %self.config.env,
            app = %self.config.app_name,
            "Relay runtime started"
        );
        Ok(())
    }

    /// Stop consuming and drain the connection.
    pub async fn stop(&self) {
        self.consumer.stop().await;
    }

    /// Supervisor wiring for the process signal trap.
    pub fn shutdown_supervisor(&self) -> ShutdownSupervisor {
        ShutdownSupervisor::new(self.consumer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_adapters::{MemoryBusClient, MemoryInboxRepository, MemoryOutboxRepository};

    fn config() -> RelayConfig {
        RelayConfig {
            env: "test".to_string(),
            app_name: "svc-a".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_outbox_requires_repository() {
        let bus = Arc::new(MemoryBusClient::new());
        let result = EventRuntime::builder(
            RelayConfig {
                use_outbox: true,
                ..config()
            },
            bus,
        )
        .build();
        assert!(matches!(result, Err(RuntimeError::MissingOutboxRepository)));
    }

    #[test]
    fn test_inbox_requires_repository() {
        let bus = Arc::new(MemoryBusClient::new());
        let result = EventRuntime::builder(
            RelayConfig {
                use_inbox: true,
                ..config()
            },
            bus,
        )
        .build();
        assert!(matches!(result, Err(RuntimeError::MissingInboxRepository)));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let bus = Arc::new(MemoryBusClient::new());
        let runtime = EventRuntime::builder(config(), bus).build().unwrap();

        runtime.start().await.unwrap();
        let err = runtime.start().await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Consumer(ConsumerError::AlreadyRunning)
        ));
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_full_assembly_builds() {
        let bus = Arc::new(MemoryBusClient::new());
        let runtime = EventRuntime::builder(
            RelayConfig {
                use_outbox: true,
                use_inbox: true,
                ..config()
            },
            bus,
        )
        .outbox_repository(Arc::new(MemoryOutboxRepository::new()))
        .inbox_repository(Arc::new(MemoryInboxRepository::new()))
        .build()
        .unwrap();

        assert!(runtime.outbox().is_some());
        assert!(runtime.inbox().is_some());
    }

    #[tokio::test]
    async fn test_subscribe_after_start_rejected() {
        let bus = Arc::new(MemoryBusClient::new());
        let runtime = EventRuntime::builder(config(), bus).build().unwrap();
        runtime.start().await.unwrap();

        let subscriber = Subscriber::builder("late")
            .pattern("test.svc-a.orders.*")
            .handler(|_m, _c| async { Ok(()) })
            .build()
            .unwrap();
        let err = runtime.subscribe(subscriber).unwrap_err();
        assert!(matches!(err, RuntimeError::Registry(RegistryError::Frozen)));
        runtime.stop().await;
    }
}
