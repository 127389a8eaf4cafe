//! Consumer lifecycle
//!
//! `start()` provisions topology, creates one durable pull consumer per
//! distinct subject pattern, and launches `concurrency` worker tasks per
//! durable. Workers fetch batches and hand each delivery to the message
//! processor; recoverable bus errors (stream/consumer gone) re-provision
//! and resubscribe, anything else backs off and retries until `stop()`.
//!
//! Durable names are `{app}-{sanitized pattern}` with wildcards replaced
//! and length capped; over-long names keep a digest suffix so distinct
//! patterns cannot collide after truncation.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use relay_domain::RelayConfig;
use relay_ports::{BusClient, BusError, ConsumerSpec};

use crate::processor::MessageProcessor;
use crate::registry::FrozenRegistry;
use crate::topology::{TopologyError, TopologyManager};

/// Messages requested per pull.
const PULL_BATCH_SIZE: usize = 25;
/// How long a pull waits for the first message.
const FETCH_EXPIRES: Duration = Duration::from_secs(5);
/// Pause after an unexpected worker error.
const WORKER_ERROR_BACKOFF: Duration = Duration::from_secs(5);
/// Durable name length cap.
const MAX_DURABLE_NAME_LEN: usize = 100;

/// Consumer lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("consumer is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Default)]
struct ConsumerState {
    running: bool,
    shutdown: Option<watch::Sender<bool>>,
    workers: Vec<JoinHandle<()>>,
}

/// Pull-subscription lifecycle and worker pool.
pub struct Consumer {
    bus: Arc<dyn BusClient>,
    topology: Arc<TopologyManager>,
    config: RelayConfig,
    state: Mutex<ConsumerState>,
}

impl Consumer {
    pub fn new(bus: Arc<dyn BusClient>, topology: Arc<TopologyManager>, config: RelayConfig) -> Self {
        Self {
            bus,
            topology,
            config,
            state: Mutex::new(ConsumerState::default()),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// Provision topology, create durables, launch workers.
    #[instrument(skip(self, registry, processor))]
    pub async fn start(
        &self,
        registry: Arc<FrozenRegistry>,
        processor: Arc<MessageProcessor>,
    ) -> Result<(), ConsumerError> {
        let mut state = self.state.lock().await;
        if state.running {
            return Err(ConsumerError::AlreadyRunning);
        }

        self.topology.provision().await?;

        let patterns = registry.patterns();
        if patterns.is_empty() {
            info!("No subscribers registered; consumer running publish-only");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::new();

        for pattern in patterns {
            let spec = ConsumerSpec {
                stream: self.config.stream_name(),
                durable_name: durable_name(&self.config.app_name, &pattern),
                filter_subject: pattern.clone(),
                max_deliver: self.config.max_deliver.min(i64::MAX as u64) as i64,
                ack_wait: self.config.ack_wait(),
                backoff: self.config.backoff(),
            };
            self.ensure_durable(&spec).await?;

            info!(
                durable = %spec.durable_name,
                pattern = %pattern,
                workers = self.config.concurrency,
                "Subscription started"
            );

            for _ in 0..self.config.concurrency.max(1) {
                workers.push(tokio::spawn(run_worker(
                    self.bus.clone(),
                    self.topology.clone(),
                    processor.clone(),
                    spec.clone(),
                    self.config.per_message_concurrency.max(1),
                    shutdown_rx.clone(),
                )));
            }
        }

        state.running = true;
        state.shutdown = Some(shutdown_tx);
        state.workers = workers;
        Ok(())
    }

    /// Signal workers, drain the connection, await workers.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if !state.running {
            return;
        }

        if let Some(shutdown) = &state.shutdown {
            let _ = shutdown.send(true);
        }

        // Bus-side drain flushes in-flight acks before the close.
        if let Err(e) = self.bus.drain().await {
            warn!(error = %e, "Connection drain failed during stop");
        }

        for worker in state.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker ended abnormally");
            }
        }

        state.running = false;
        state.shutdown = None;
        info!("Consumer stopped");
    }

    /// Create the durable, replacing it when the existing configuration
    /// differs. Delete failures are logged and recreation proceeds.
    async fn ensure_durable(&self, spec: &ConsumerSpec) -> Result<(), ConsumerError> {
        match self
            .bus
            .consumer_info(&spec.stream, &spec.durable_name)
            .await?
        {
            Some(existing) if existing == *spec => {
                debug!(durable = %spec.durable_name, "Durable consumer up to date");
                Ok(())
            }
            Some(_) => {
                warn!(
                    durable = %spec.durable_name,
                    "Durable consumer config differs; recreating"
                );
                if let Err(e) = self
                    .bus
                    .delete_consumer(&spec.stream, &spec.durable_name)
                    .await
                {
                    warn!(
                        durable = %spec.durable_name,
                        error = %e,
                        "Failed to delete mismatched consumer; attempting recreate anyway"
                    );
                }
                Ok(self.bus.create_consumer(spec).await?)
            }
            None => Ok(self.bus.create_consumer(spec).await?),
        }
    }
}

/// One worker: pull, process, repeat until shutdown.
async fn run_worker(
    bus: Arc<dyn BusClient>,
    topology: Arc<TopologyManager>,
    processor: Arc<MessageProcessor>,
    spec: ConsumerSpec,
    per_message_concurrency: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let fetched = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // Sender gone: the consumer was dropped.
                    break;
                }
                continue;
            }
            result = bus.fetch(
                &spec.stream,
                &spec.durable_name,
                PULL_BATCH_SIZE,
                FETCH_EXPIRES,
            ) => result,
        };

        match fetched {
            Ok(deliveries) => {
                if deliveries.is_empty() {
                    continue;
                }
                futures::stream::iter(deliveries)
                    .for_each_concurrent(per_message_concurrency, |delivery| {
                        let processor = processor.clone();
                        async move {
                            processor.process(delivery.as_ref()).await;
                        }
                    })
                    .await;
            }
            Err(e) if e.is_recoverable() => {
                // Stream or consumer disappeared under us: re-provision and
                // resubscribe, then carry on.
                warn!(
                    durable = %spec.durable_name,
                    error = %e,
                    "Subscription lost; re-provisioning"
                );
                if let Err(e) = topology.provision().await {
                    error!(error = %e, "Re-provisioning failed");
                }
                if let Err(e) = bus.create_consumer(&spec).await {
                    error!(
                        durable = %spec.durable_name,
                        error = %e,
                        "Failed to recreate consumer"
                    );
                    sleep_or_shutdown(WORKER_ERROR_BACKOFF, &mut shutdown).await;
                }
            }
            Err(e) if e.is_transient() => {
                // Empty pulls time out routinely; not worth a warning.
                debug!(durable = %spec.durable_name, error = %e, "Pull timed out");
            }
            Err(e) => {
                error!(
                    durable = %spec.durable_name,
                    error = %e,
                    "Worker fetch failed; backing off"
                );
                sleep_or_shutdown(WORKER_ERROR_BACKOFF, &mut shutdown).await;
            }
        }
    }

    debug!(durable = %spec.durable_name, "Worker exited");
}

async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.changed() => {}
    }
}

/// Durable name for one subject pattern: `{app}-{sanitized}`, wildcards
/// replaced, capped at 100 characters with a digest suffix on truncation.
pub fn durable_name(app: &str, pattern: &str) -> String {
    let name = format!("{}-{}", sanitize(app), sanitize_pattern(pattern));
    if name.len() <= MAX_DURABLE_NAME_LEN {
        return name;
    }

    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let keep = MAX_DURABLE_NAME_LEN - 9;
    format!("{}-{}", &name[..keep], &digest[..8])
}

fn sanitize_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '>' => out.push_str("all"),
            '*' => out.push_str("any"),
            '.' => out.push('-'),
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => out.push(c),
            _ => out.push('_'),
        }
    }
    out
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durable_name_replaces_wildcards() {
        assert_eq!(
            durable_name("svc-a", "test.svc-a.orders.*"),
            "svc-a-test-svc-a-orders-any"
        );
        assert_eq!(durable_name("svc-a", "test.events.>"), "svc-a-test-events-all");
    }

    #[test]
    fn test_durable_name_is_valid_for_the_bus() {
        let name = durable_name("svc-a", "test.svc-a.orders.created");
        assert!(!name.contains('.'));
        assert!(!name.contains('*'));
        assert!(!name.contains('>'));
    }

    #[test]
    fn test_durable_name_capped_at_limit() {
        let long_pattern = format!("test.{}.>", "segment.".repeat(30));
        let name = durable_name("svc-a", &long_pattern);
        assert_eq!(name.len(), MAX_DURABLE_NAME_LEN);
    }

    #[test]
    fn test_truncated_names_stay_distinct() {
        let a = durable_name("svc-a", &format!("test.{}.alpha.>", "segment.".repeat(30)));
        let b = durable_name("svc-a", &format!("test.{}.beta.>", "segment.".repeat(30)));
        assert_ne!(a, b);
    }
}
