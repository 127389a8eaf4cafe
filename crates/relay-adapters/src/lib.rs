//! Relay Adapter Implementations
//!
//! This crate provides adapter implementations for the ports defined in
//! relay-ports:
//! - NATS JetStream bus client
//! - PostgreSQL outbox/inbox repositories
//! - In-memory bus and repositories for dev/test

pub mod memory;
pub mod nats;
pub mod postgres;

pub use memory::{MemoryBusClient, MemoryInboxRepository, MemoryOutboxRepository};
pub use nats::NatsBusClient;
pub use postgres::{PostgresInboxRepository, PostgresOutboxRepository};
