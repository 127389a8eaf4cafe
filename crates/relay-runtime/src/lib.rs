//! Relay Runtime
//!
//! The reliability layer over a JetStream-style bus: declarative
//! publish/subscribe with exactly-once-effect processing, retry with
//! backoff, dead-lettering, and transactional send/receive.
//!
//! Publish side: `Publisher` builds envelopes, enforces the payload limit,
//! and either sends directly or stores through `OutboxEngine` first.
//!
//! Consume side: `Consumer` runs durable pull subscriptions; each delivery
//! flows through `MessageProcessor` (parse, registry lookup, middleware,
//! bounded concurrent handlers with timeout) and is resolved to
//! ack/nak/term or routed to the DLQ.
//!
//! Everything is owned by an `EventRuntime` value assembled at startup;
//! there are no process-wide singletons.

pub mod consumer;
pub mod dlq;
pub mod health;
pub mod inbox;
pub mod middleware;
pub mod outbox;
pub mod processor;
pub mod publisher;
pub mod registry;
pub mod runtime;
pub mod shutdown;
pub mod subscriber;
pub mod topology;

pub use consumer::{Consumer, ConsumerError};
pub use dlq::{DlqEnvelope, DlqReason, DlqRouter};
pub use health::{HealthProbe, HealthStatus};
pub use inbox::{InboxEngine, InboxError};
pub use middleware::{Middleware, MiddlewareChain, Next};
pub use outbox::{OutboxEngine, OutboxError, OutboxOutcome};
pub use processor::{Disposition, MessageProcessor};
pub use publisher::{
    BatchResult, PublishBatch, PublishOptions, PublishOutcome, PublishResult, Publisher,
};
pub use registry::{FrozenRegistry, Registry, RegistryError};
pub use runtime::{EventRuntime, EventRuntimeBuilder, RuntimeError};
pub use shutdown::ShutdownSupervisor;
pub use subscriber::{ErrorContext, ErrorDecision, Subscriber, SubscriberError, SubscriberOptions};
pub use topology::{TopologyError, TopologyManager};
