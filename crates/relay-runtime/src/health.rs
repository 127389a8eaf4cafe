//! Health probe
//!
//! Snapshot of the bus connection and topology for readiness reporting.
//! `quick_check` is connection-only and cheap; `check` also verifies the
//! main stream is reachable; `consumer_lag` reports per-durable backlog.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use relay_domain::RelayConfig;
use relay_ports::{BusClient, BusError, Clock, ConnectionState, ConsumerLag};

/// Bus connection portion of the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BusHealth {
    pub connected: bool,
    pub servers: Vec<String>,
}

/// Topology portion of the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TopologyHealth {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Component section of the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthComponents {
    pub bus: BusHealth,
    pub topology: TopologyHealth,
}

/// Full health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HealthComponents,
    pub timestamp: DateTime<Utc>,
}

/// Status snapshots of the connection and topology.
pub struct HealthProbe {
    bus: Arc<dyn BusClient>,
    config: RelayConfig,
    clock: Arc<dyn Clock>,
}

impl HealthProbe {
    pub fn new(bus: Arc<dyn BusClient>, config: RelayConfig, clock: Arc<dyn Clock>) -> Self {
        Self { bus, config, clock }
    }

    /// Connection state only.
    pub fn quick_check(&self) -> bool {
        self.bus.connection_state() == ConnectionState::Connected
    }

    /// Connection plus main-stream reachability.
    pub async fn check(&self) -> HealthStatus {
        let connected = self.quick_check();
        let servers = self.bus.server_names();

        let (available, last_error) = match self.bus.stream_info(&self.config.stream_name()).await {
            Ok(Some(_)) => (true, None),
            Ok(None) => (
                false,
                Some(format!("stream {} not found", self.config.stream_name())),
            ),
            Err(e) => (false, Some(e.to_string())),
        };

        HealthStatus {
            healthy: connected && available,
            components: HealthComponents {
                bus: BusHealth { connected, servers },
                topology: TopologyHealth {
                    available,
                    last_error,
                },
            },
            timestamp: self.clock.now(),
        }
    }

    /// Per-consumer lag for the given stream (main stream by default).
    pub async fn consumer_lag(&self, stream: Option<&str>) -> Result<Vec<ConsumerLag>, BusError> {
        let name = stream
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.config.stream_name());
        self.bus.consumer_lag(&name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_adapters::MemoryBusClient;
    use relay_ports::{Retention, Storage, StreamDesc, SystemClock};
    use std::time::Duration;

    fn config() -> RelayConfig {
        RelayConfig {
            env: "test".to_string(),
            app_name: "svc-a".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_check_reports_missing_stream() {
        let bus = Arc::new(MemoryBusClient::new());
        let probe = HealthProbe::new(bus, config(), Arc::new(SystemClock));

        let status = probe.check().await;
        assert!(!status.healthy);
        assert!(status.components.bus.connected);
        assert!(!status.components.topology.available);
        assert!(status
            .components
            .topology
            .last_error
            .as_deref()
            .unwrap()
            .contains("test-events"));
    }

    #[tokio::test]
    async fn test_check_healthy_with_stream() {
        let bus = Arc::new(MemoryBusClient::new());
        bus.create_stream(&StreamDesc {
            name: "test-events".to_string(),
            subjects: vec!["test.>".to_string()],
            retention: Retention::Limits,
            storage: Storage::File,
            max_age: Duration::from_secs(3600),
            discard_old: true,
        })
        .await
        .unwrap();

        let probe = HealthProbe::new(bus.clone(), config(), Arc::new(SystemClock));
        let status = probe.check().await;
        assert!(status.healthy);
        assert!(status.components.topology.last_error.is_none());

        bus.set_connected(false);
        assert!(!probe.quick_check());
        let status = probe.check().await;
        assert!(!status.healthy);
    }
}
