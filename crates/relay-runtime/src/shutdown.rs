//! Graceful shutdown
//!
//! Waits for a termination signal, then stops the consumer under a
//! deadline: new pulls cease immediately, in-flight handlers finish, the
//! connection drains. When the deadline elapses the supervisor gives up
//! waiting and reports a non-zero exit code. Re-entering `shutdown()` is a
//! no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{error, info, warn};

use crate::consumer::Consumer;

/// Default time allowed for the drain before force-stopping.
pub const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Owns the signal trap and the bounded drain on shutdown.
pub struct ShutdownSupervisor {
    consumer: Arc<Consumer>,
    deadline: Duration,
    shutting_down: AtomicBool,
}

impl ShutdownSupervisor {
    pub fn new(consumer: Arc<Consumer>) -> Self {
        Self::with_deadline(consumer, DEFAULT_SHUTDOWN_DEADLINE)
    }

    pub fn with_deadline(consumer: Arc<Consumer>, deadline: Duration) -> Self {
        Self {
            consumer,
            deadline,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Block until SIGINT or SIGTERM.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    /// Drain the consumer under the deadline. Returns `true` when the stop
    /// completed in time. Subsequent calls are no-ops returning `true`.
    pub async fn shutdown(&self) -> bool {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return true;
        }

        info!(deadline_secs = self.deadline.as_secs(), "Shutting down");

        match tokio::time::timeout(self.deadline, self.consumer.stop()).await {
            Ok(()) => {
                info!("Shutdown complete");
                true
            }
            Err(_) => {
                warn!(
                    deadline_secs = self.deadline.as_secs(),
                    "Shutdown deadline elapsed; abandoning in-flight work"
                );
                false
            }
        }
    }

    /// Wait for a signal, then shut down. Returns the process exit code.
    pub async fn run(&self) -> i32 {
        self.wait_for_signal().await;
        if self.shutdown().await {
            0
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::topology::TopologyManager;
    use relay_adapters::MemoryBusClient;
    use relay_domain::RelayConfig;

    fn supervisor(deadline: Duration) -> ShutdownSupervisor {
        let bus = Arc::new(MemoryBusClient::new());
        let config = RelayConfig {
            env: "test".to_string(),
            app_name: "svc-a".to_string(),
            ..Default::default()
        };
        let topology = Arc::new(TopologyManager::new(bus.clone(), config.clone()));
        let consumer = Arc::new(Consumer::new(bus, topology, config));
        ShutdownSupervisor::with_deadline(consumer, deadline)
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let supervisor = supervisor(Duration::from_secs(1));
        assert!(!supervisor.is_shutting_down());

        assert!(supervisor.shutdown().await);
        assert!(supervisor.is_shutting_down());

        // Second entry does nothing and stays successful.
        assert!(supervisor.shutdown().await);
    }

    #[tokio::test]
    async fn test_shutdown_with_stopped_consumer_is_quick() {
        let supervisor = supervisor(Duration::from_millis(100));
        let done = tokio::time::timeout(Duration::from_secs(1), supervisor.shutdown()).await;
        assert_eq!(done.unwrap(), true);
    }

    #[tokio::test]
    async fn test_started_consumer_drains_before_deadline() {
        let bus = Arc::new(MemoryBusClient::new());
        let config = RelayConfig {
            env: "test".to_string(),
            app_name: "svc-a".to_string(),
            ..Default::default()
        };
        let topology = Arc::new(TopologyManager::new(bus.clone(), config.clone()));
        let consumer = Arc::new(Consumer::new(bus, topology, config));

        // No subscribers: start provisions topology and runs publish-only.
        let registry = Registry::new();
        let frozen = registry.freeze();
        let processor = Arc::new(crate::processor::MessageProcessor::new(
            frozen.clone(),
            crate::middleware::MiddlewareChain::default(),
            None,
            None,
            relay_domain::BackoffPolicy::default(),
            Arc::new(relay_ports::NoopMetrics),
            &RelayConfig::default(),
        ));
        consumer.start(frozen, processor).await.unwrap();
        assert!(consumer.is_running().await);

        let supervisor = ShutdownSupervisor::with_deadline(consumer.clone(), Duration::from_secs(5));
        assert!(supervisor.shutdown().await);
        assert!(!consumer.is_running().await);
    }
}
