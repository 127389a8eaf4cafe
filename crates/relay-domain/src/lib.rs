//! Relay Core Domain
//!
//! Pure domain types and logic for the Relay event runtime:
//! - NATS-style subject matching, overlap detection, and wire-subject building
//! - Event envelope construction and codec
//! - Per-delivery message context
//! - Bounded exponential backoff policy
//! - Error taxonomy shared across the runtime
//! - Enumerated runtime configuration
//! - Outbox/inbox record types
//!
//! Nothing in this crate performs I/O.

pub mod backoff;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod records;
pub mod subject;

pub use backoff::BackoffPolicy;
pub use config::RelayConfig;
pub use envelope::{EventEnvelope, MessageContext, SCHEMA_VERSION};
pub use errors::{EnvelopeError, HandlerError, PublishError};
pub use records::{InboxRecord, InboxStatus, OutboxRecord, OutboxStatus};
pub use subject::SubjectBuilder;
