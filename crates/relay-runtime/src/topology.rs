//! Stream topology provisioning
//!
//! Creates and updates the main and dead-letter streams idempotently. The
//! overlap guard compares desired subjects against every other stream on
//! the server and keeps conflicting subjects out of create/update calls, so
//! provisioning never trips the server's cross-stream overlap rule.
//!
//! Retention is immutable once a stream exists: a mismatch is logged and
//! left alone. Subjects can be added and storage updated.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use relay_domain::{subject, RelayConfig, SubjectBuilder};
use relay_ports::{BusClient, BusError, Retention, Storage, StreamDesc, StreamInfo};

/// Age limit for the main event stream.
pub const MAIN_STREAM_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Age limit for the dead-letter stream.
pub const DLQ_STREAM_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Pause before retrying a create that lost an overlap race.
const OVERLAP_RACE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// One (desired subject, existing stream subject) collision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapConflict {
    pub desired_subject: String,
    pub stream: String,
    pub existing_subject: String,
}

impl std::fmt::Display for OverlapConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, {} on stream {})",
            self.desired_subject, self.existing_subject, self.stream
        )
    }
}

/// Topology errors.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("topology conflict: {}", format_conflicts(.conflicts))]
    Conflict { conflicts: Vec<OverlapConflict> },

    #[error(transparent)]
    Bus(#[from] BusError),
}

fn format_conflicts(conflicts: &[OverlapConflict]) -> String {
    conflicts
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Snapshot of every other stream's subjects, used to keep new subjects
/// from colliding.
pub struct OverlapGuard {
    existing: Vec<StreamInfo>,
}

impl OverlapGuard {
    /// List all streams except `exclude` (the one being provisioned).
    pub async fn collect(bus: &dyn BusClient, exclude: &str) -> Result<Self, BusError> {
        let existing = bus
            .list_streams()
            .await?
            .into_iter()
            .filter(|s| s.name != exclude)
            .collect();
        Ok(Self { existing })
    }

    /// Every pair where a desired subject overlaps an existing one.
    pub fn conflicts(&self, desired: &[String]) -> Vec<OverlapConflict> {
        let mut conflicts = Vec::new();
        for desired_subject in desired {
            for stream in &self.existing {
                for existing_subject in &stream.subjects {
                    if subject::overlap(desired_subject, existing_subject) {
                        conflicts.push(OverlapConflict {
                            desired_subject: desired_subject.clone(),
                            stream: stream.name.clone(),
                            existing_subject: existing_subject.clone(),
                        });
                    }
                }
            }
        }
        conflicts
    }

    /// Fail on any conflict.
    pub fn check(&self, desired: &[String]) -> Result<(), TopologyError> {
        let conflicts = self.conflicts(desired);
        if conflicts.is_empty() {
            Ok(())
        } else {
            Err(TopologyError::Conflict { conflicts })
        }
    }

    /// Split desired subjects into the non-conflicting subset and the
    /// conflicts that keep the rest out.
    pub fn partition(&self, desired: &[String]) -> (Vec<String>, Vec<OverlapConflict>) {
        let conflicts = self.conflicts(desired);
        let allowed = desired
            .iter()
            .filter(|d| !conflicts.iter().any(|c| &c.desired_subject == *d))
            .cloned()
            .collect();
        (allowed, conflicts)
    }
}

/// Provisions the main and dead-letter streams.
pub struct TopologyManager {
    bus: Arc<dyn BusClient>,
    config: RelayConfig,
}

impl TopologyManager {
    pub fn new(bus: Arc<dyn BusClient>, config: RelayConfig) -> Self {
        Self { bus, config }
    }

    /// Descriptor for the main event stream.
    pub fn main_stream_desc(&self) -> StreamDesc {
        let subjects = SubjectBuilder::new(&self.config.env, &self.config.app_name);
        StreamDesc {
            name: self.config.stream_name(),
            subjects: vec![subjects.legacy_pattern(), subjects.app_pattern()],
            retention: Retention::Limits,
            storage: Storage::File,
            max_age: MAIN_STREAM_MAX_AGE,
            discard_old: true,
        }
    }

    /// Descriptor for the dead-letter stream.
    pub fn dlq_stream_desc(&self) -> StreamDesc {
        StreamDesc {
            name: self.config.dlq_stream_name(),
            subjects: vec![self.config.dlq_subject()],
            retention: Retention::Limits,
            storage: Storage::File,
            max_age: DLQ_STREAM_MAX_AGE,
            discard_old: true,
        }
    }

    /// Ensure the main stream (and the DLQ stream when enabled) exist with
    /// the declared configuration.
    pub async fn provision(&self) -> Result<(), TopologyError> {
        self.ensure_stream(&self.main_stream_desc()).await?;
        if self.config.use_dlq {
            self.ensure_dlq_stream().await?;
        }
        Ok(())
    }

    /// Ensure only the dead-letter stream exists.
    pub async fn ensure_dlq_stream(&self) -> Result<(), TopologyError> {
        self.ensure_stream(&self.dlq_stream_desc()).await
    }

    /// Create or update one stream idempotently.
    #[instrument(skip(self, desc), fields(stream = %desc.name))]
    pub async fn ensure_stream(&self, desc: &StreamDesc) -> Result<(), TopologyError> {
        match self.bus.stream_info(&desc.name).await? {
            None => self.create_stream(desc).await,
            Some(existing) => self.update_stream(desc, existing).await,
        }
    }

    async fn create_stream(&self, desc: &StreamDesc) -> Result<(), TopologyError> {
        let guard = OverlapGuard::collect(self.bus.as_ref(), &desc.name).await?;
        let (allowed, blocked) = guard.partition(&desc.subjects);
        warn_blocked(&desc.name, &blocked);

        if allowed.is_empty() {
            warn!(
                stream = %desc.name,
                "No non-overlapping subjects remain; stream not created"
            );
            return Ok(());
        }

        let create = StreamDesc {
            subjects: allowed,
            ..desc.clone()
        };
        match self.bus.create_stream(&create).await {
            Ok(()) => Ok(()),
            Err(BusError::SubjectOverlap { message }) => {
                // Another stream grabbed a subject between the guard snapshot
                // and the create. Re-snapshot once and retry.
                warn!(stream = %desc.name, error = %message, "Create lost an overlap race, retrying");
                tokio::time::sleep(OVERLAP_RACE_RETRY_DELAY).await;

                let guard = OverlapGuard::collect(self.bus.as_ref(), &desc.name).await?;
                let (allowed, blocked) = guard.partition(&desc.subjects);
                warn_blocked(&desc.name, &blocked);
                if allowed.is_empty() {
                    warn!(
                        stream = %desc.name,
                        "No non-overlapping subjects remain after retry; stream not created"
                    );
                    return Ok(());
                }
                let retry = StreamDesc {
                    subjects: allowed,
                    ..desc.clone()
                };
                self.bus.create_stream(&retry).await.map_err(Into::into)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_stream(
        &self,
        desc: &StreamDesc,
        existing: StreamInfo,
    ) -> Result<(), TopologyError> {
        if existing.retention != desc.retention {
            warn!(
                stream = %desc.name,
                existing = ?existing.retention,
                desired = ?desc.retention,
                "Stream retention differs from desired; retention is immutable and left unchanged"
            );
        }

        let missing: Vec<String> = desc
            .subjects
            .iter()
            .filter(|d| !subject::covered(&existing.subjects, d))
            .cloned()
            .collect();

        let guard = OverlapGuard::collect(self.bus.as_ref(), &desc.name).await?;
        let (allowed, blocked) = guard.partition(&missing);
        warn_blocked(&desc.name, &blocked);

        let storage_changed = existing.storage != desc.storage;
        if allowed.is_empty() && !storage_changed {
            debug!(stream = %desc.name, "Stream already up to date");
            return Ok(());
        }

        let mut subjects = existing.subjects.clone();
        subjects.extend(allowed.iter().cloned());

        info!(
            stream = %desc.name,
            added = ?allowed,
            storage_changed = storage_changed,
            "Updating stream"
        );
        self.bus
            .update_stream(&StreamDesc {
                name: desc.name.clone(),
                subjects,
                retention: existing.retention,
                storage: desc.storage,
                max_age: desc.max_age,
                discard_old: desc.discard_old,
            })
            .await
            .map_err(Into::into)
    }
}

fn warn_blocked(stream: &str, blocked: &[OverlapConflict]) {
    for conflict in blocked {
        warn!(
            stream = %stream,
            desired = %conflict.desired_subject,
            conflicting_stream = %conflict.stream,
            conflicting_subject = %conflict.existing_subject,
            "Subject overlaps an existing stream and was excluded"
        );
    }
}
