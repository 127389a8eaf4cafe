//! Outbox engine: store-then-publish
//!
//! Contract: for a given `event_id`, at-least-once publish to the bus plus
//! at-most-one terminal SENT row. The row is written first (or found, on a
//! retry), flipped to PUBLISHING, then the caller-supplied send runs;
//! success marks SENT, failure marks FAILED and the row stays drainable.
//!
//! Transactional use: the caller opens a database transaction, inserts its
//! business rows, writes the outbox row through the repository as the only
//! other write, and commits. A crash between commit and send leaves a
//! PENDING row the background drain retries. Republishing an already
//! published row is harmless because the bus deduplicates on `event_id`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use relay_domain::records::{OutboxRecord, OutboxStatus};
use relay_ports::{
    BusClient, BusError, Metrics, NewOutboxRecord, OutboxRepository, PublishReceipt,
    RepositoryError,
};

/// Outbox engine errors.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Result of pushing one record through the outbox.
#[derive(Debug)]
pub enum OutboxOutcome {
    /// Stored and published; the row is SENT.
    Sent {
        receipt: PublishReceipt,
        attempts: u32,
    },
    /// The row was already SENT; nothing was published.
    AlreadySent,
    /// The send failed; the row is FAILED and remains recoverable.
    Failed { reason: String },
}

impl OutboxOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Sent { .. } | Self::AlreadySent)
    }
}

/// Counters from one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub attempted: usize,
    pub published: usize,
    pub failed: usize,
}

/// Store-first publisher over an outbox repository.
pub struct OutboxEngine {
    repo: Arc<dyn OutboxRepository>,
    metrics: Arc<dyn Metrics>,
}

impl OutboxEngine {
    pub fn new(repo: Arc<dyn OutboxRepository>, metrics: Arc<dyn Metrics>) -> Self {
        Self { repo, metrics }
    }

    /// Store a record without publishing. The drain worker picks it up.
    pub async fn enqueue(&self, record: NewOutboxRecord) -> Result<OutboxRecord, OutboxError> {
        Ok(self.repo.find_or_create(&record).await?)
    }

    /// Store several records without publishing.
    pub async fn enqueue_many(
        &self,
        records: Vec<NewOutboxRecord>,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        let mut stored = Vec::with_capacity(records.len());
        for record in &records {
            stored.push(self.repo.find_or_create(record).await?);
        }
        Ok(stored)
    }

    /// Store-then-publish one record.
    #[instrument(skip(self, record, publish_fn), fields(event_id = %record.event_id))]
    pub async fn publish<F, Fut>(
        &self,
        record: NewOutboxRecord,
        publish_fn: F,
    ) -> Result<OutboxOutcome, OutboxError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PublishReceipt, BusError>>,
    {
        let event_id = record.event_id;
        let stored = self.repo.find_or_create(&record).await?;

        if stored.status == OutboxStatus::Sent {
            debug!(event_id = %event_id, "Outbox record already sent, skipping publish");
            return Ok(OutboxOutcome::AlreadySent);
        }

        let stored = self.repo.mark_publishing(&event_id).await?;

        match publish_fn().await {
            Ok(receipt) => {
                self.repo.mark_sent(&event_id).await?;
                debug!(
                    event_id = %event_id,
                    stream = %receipt.stream,
                    sequence = receipt.sequence,
                    duplicate = receipt.duplicate,
                    "Outbox record published"
                );
                Ok(OutboxOutcome::Sent {
                    receipt,
                    attempts: stored.attempts,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                self.repo.mark_failed(&event_id, &reason).await?;
                error!(event_id = %event_id, error = %reason, "Outbox publish failed");
                Ok(OutboxOutcome::Failed { reason })
            }
        }
    }

    /// Drain up to `limit` PENDING records in enqueue order.
    #[instrument(skip(self, publish_fn))]
    pub async fn publish_pending<F, Fut>(
        &self,
        limit: usize,
        publish_fn: F,
    ) -> Result<DrainStats, OutboxError>
    where
        F: Fn(OutboxRecord) -> Fut,
        Fut: Future<Output = Result<PublishReceipt, BusError>>,
    {
        let pending = self.repo.list_pending(limit).await?;
        let mut stats = DrainStats {
            attempted: pending.len(),
            ..Default::default()
        };

        if pending.is_empty() {
            return Ok(stats);
        }

        info!(count = pending.len(), "Draining outbox batch");

        for record in pending {
            let event_id = record.event_id;
            let record = self.repo.mark_publishing(&event_id).await?;
            match publish_fn(record).await {
                Ok(_) => {
                    self.repo.mark_sent(&event_id).await?;
                    stats.published += 1;
                }
                Err(e) => {
                    // One bad record never stops the batch.
                    self.repo.mark_failed(&event_id, &e.to_string()).await?;
                    error!(event_id = %event_id, error = %e, "Failed to drain outbox record");
                    stats.failed += 1;
                }
            }
        }

        self.refresh_depth_gauge().await;
        Ok(stats)
    }

    /// Flip PUBLISHING rows older than the threshold back to PENDING,
    /// recovering work lost to a crash mid-publish.
    pub async fn reset_stale(&self, older_than_minutes: i64) -> Result<u64, OutboxError> {
        Ok(self.repo.reset_stale(older_than_minutes).await?)
    }

    /// Delete SENT rows older than the retention, oldest first.
    pub async fn cleanup(&self, retention_days: i64, batch: usize) -> Result<u64, OutboxError> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        Ok(self.repo.delete_sent_before(cutoff, batch).await?)
    }

    /// Current PENDING depth; also refreshes the metrics gauge.
    pub async fn pending_count(&self) -> Result<u64, OutboxError> {
        let depth = self.repo.pending_count().await?;
        self.metrics.outbox_pending(depth);
        Ok(depth)
    }

    async fn refresh_depth_gauge(&self) {
        if let Ok(depth) = self.repo.pending_count().await {
            self.metrics.outbox_pending(depth);
        }
    }

    /// Periodic drain driven by a ticker until shutdown flips. Failed rows
    /// are reset to PENDING by the stale sweep each pass, so transient
    /// publish errors retry on the next tick.
    pub async fn run_drain(
        self: Arc<Self>,
        bus: Arc<dyn BusClient>,
        interval: Duration,
        limit: usize,
        stale_after_minutes: i64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        info!(interval_ms = interval.as_millis() as u64, "Outbox drain started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.reset_stale(stale_after_minutes).await {
                error!(error = %e, "Outbox stale sweep failed");
            }

            let bus = bus.clone();
            let result = self
                .publish_pending(limit, move |record| {
                    let bus = bus.clone();
                    async move {
                        bus.publish(&record.subject, record.headers.clone(), record.payload.clone())
                            .await
                    }
                })
                .await;

            match result {
                Ok(stats) if stats.attempted > 0 => {
                    debug!(
                        attempted = stats.attempted,
                        published = stats.published,
                        failed = stats.failed,
                        "Outbox drain pass complete"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Outbox drain pass failed"),
            }
        }

        info!("Outbox drain stopped");
    }
}
