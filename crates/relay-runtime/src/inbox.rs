//! Inbox engine: check-then-process
//!
//! Contract: for a given `event_id`, the handler runs at most once even
//! under redelivery. The record is created (or found) first; a PROCESSED
//! row short-circuits, anything else runs the handler and records the
//! outcome. Handler errors are re-raised so the outer loop naks the
//! delivery and the bus retries it.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};

use relay_domain::errors::HandlerError;
use relay_ports::{InboxRepository, NewInboxRecord, RepositoryError};

/// Inbox engine errors.
#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Handler(HandlerError),
}

/// Dedupe-then-process guard over an inbox repository.
pub struct InboxEngine {
    repo: Arc<dyn InboxRepository>,
}

impl InboxEngine {
    pub fn new(repo: Arc<dyn InboxRepository>) -> Self {
        Self { repo }
    }

    /// Run `handler` at most once for this record's `event_id`.
    ///
    /// Returns `Ok(true)` when the handler ran and succeeded, `Ok(false)`
    /// when the event was already processed (duplicate delivery). A handler
    /// failure marks the row FAILED and surfaces as `InboxError::Handler`.
    #[instrument(skip(self, record, handler), fields(event_id = %record.event_id))]
    pub async fn process<F, Fut>(
        &self,
        record: NewInboxRecord,
        handler: F,
    ) -> Result<bool, InboxError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), HandlerError>>,
    {
        let event_id = record.event_id;
        let (stored, already_exists) = self.repo.find_or_create(&record).await?;

        if already_exists && stored.is_terminal() {
            debug!(event_id = %event_id, "Duplicate delivery ignored (already processed)");
            return Ok(false);
        }

        self.repo.mark_processing(&event_id).await?;

        match handler().await {
            Ok(()) => {
                self.repo.mark_processed(&event_id).await?;
                debug!(event_id = %event_id, "Event processed");
                Ok(true)
            }
            Err(e) => {
                self.repo.mark_failed(&event_id, &e.to_string()).await?;
                Err(InboxError::Handler(e))
            }
        }
    }

    /// Flip stale PROCESSING rows so a crashed worker's events become
    /// retryable.
    pub async fn reset_stale(&self, older_than_minutes: i64) -> Result<u64, InboxError> {
        Ok(self.repo.reset_stale(older_than_minutes).await?)
    }

    /// Delete PROCESSED rows older than the retention.
    pub async fn cleanup(&self, retention_days: i64, batch: usize) -> Result<u64, InboxError> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        Ok(self.repo.delete_processed_before(cutoff, batch).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_domain::records::{InboxRecord, InboxStatus};
    use relay_ports::Headers;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct FakeRepo {
        rows: Mutex<HashMap<Uuid, InboxRecord>>,
    }

    #[async_trait::async_trait]
    impl InboxRepository for FakeRepo {
        async fn find_or_create(
            &self,
            record: &NewInboxRecord,
        ) -> Result<(InboxRecord, bool), RepositoryError> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.get(&record.event_id) {
                return Ok((row.clone(), true));
            }
            let now = Utc::now();
            let row = InboxRecord {
                event_id: record.event_id,
                subject: record.subject.clone(),
                payload: record.payload.clone(),
                headers: record.headers.clone(),
                stream: record.stream.clone(),
                stream_seq: record.stream_seq,
                deliveries: record.deliveries,
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
            let mut rows = self.rows.lock().unwrap();
            let row = rows.get_mut(event_id).unwrap();
            if row.status != InboxStatus::Processed {
                row.status = InboxStatus::Processing;
            }
            Ok(())
        }

        async fn mark_processed(&self, event_id: &Uuid) -> Result<(), RepositoryError> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.get_mut(event_id).unwrap();
            row.status = InboxStatus::Processed;
            row.processed_at = Some(Utc::now());
            Ok(())
        }

        async fn mark_failed(&self, event_id: &Uuid, error: &str) -> Result<(), RepositoryError> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.get_mut(event_id).unwrap();
            row.status = InboxStatus::Failed;
            row.last_error = Some(error.to_string());
            Ok(())
        }

        async fn reset_stale(&self, _older_than_minutes: i64) -> Result<u64, RepositoryError> {
            Ok(0)
        }

        async fn delete_processed_before(
            &self,
            _cutoff: chrono::DateTime<Utc>,
            _limit: usize,
        ) -> Result<u64, RepositoryError> {
            Ok(0)
        }
    }

    fn new_record(event_id: Uuid) -> NewInboxRecord {
        NewInboxRecord {
            event_id,
            subject: "test.svc.orders.created".to_string(),
            payload: b"{}".to_vec(),
            headers: Headers::new(),
            stream: Some("test-events".to_string()),
            stream_seq: Some(1),
            deliveries: 1,
        }
    }

    #[tokio::test]
    async fn test_handler_runs_once_under_redelivery() {
        let repo = Arc::new(FakeRepo::default());
        let engine = InboxEngine::new(repo.clone());
        let event_id = Uuid::new_v4();
        let counter = Arc::new(AtomicUsize::new(0));

        for delivery in 0..3 {
            let counter = counter.clone();
            let processed = engine
                .process(new_record(event_id), || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
            assert_eq!(processed, delivery == 0);
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let row = repo.rows.lock().unwrap()[&event_id].clone();
        assert_eq!(row.status, InboxStatus::Processed);
        assert!(row.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_failure_marks_failed_and_reraises() {
        let repo = Arc::new(FakeRepo::default());
        let engine = InboxEngine::new(repo.clone());
        let event_id = Uuid::new_v4();

        let result = engine
            .process(new_record(event_id), || async {
                Err(HandlerError::failed("boom"))
            })
            .await;
        assert!(matches!(result, Err(InboxError::Handler(_))));

        let row = repo.rows.lock().unwrap()[&event_id].clone();
        assert_eq!(row.status, InboxStatus::Failed);
        assert_eq!(row.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_failed_row_is_retried() {
        let repo = Arc::new(FakeRepo::default());
        let engine = InboxEngine::new(repo.clone());
        let event_id = Uuid::new_v4();

        let _ = engine
            .process(new_record(event_id), || async {
                Err(HandlerError::failed("boom"))
            })
            .await;

        // A redelivery of a FAILED row runs the handler again.
        let processed = engine
            .process(new_record(event_id), || async { Ok(()) })
            .await
            .unwrap();
        assert!(processed);
        assert_eq!(
            repo.rows.lock().unwrap()[&event_id].status,
            InboxStatus::Processed
        );
    }
}
