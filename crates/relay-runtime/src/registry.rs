//! Subscriber registry
//!
//! Registration happens before the consumer starts and is serialized by a
//! mutex. `freeze()` snapshots the registrations into an immutable
//! `FrozenRegistry` that readers share without locking; registration after
//! the freeze is rejected.

use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;
use tracing::debug;

use relay_domain::subject;

use crate::subscriber::Subscriber;

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry is frozen; register subscribers before start")]
    Frozen,
}

/// Mutable registration surface.
pub struct Registry {
    pending: Mutex<Vec<Arc<Subscriber>>>,
    frozen: OnceCell<Arc<FrozenRegistry>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            frozen: OnceCell::new(),
        }
    }

    /// Register a subscriber under each of its declared patterns.
    /// Registering the same subscriber value twice is a no-op.
    pub fn register(&self, subscriber: Arc<Subscriber>) -> Result<(), RegistryError> {
        if self.frozen.get().is_some() {
            return Err(RegistryError::Frozen);
        }
        let mut pending = self.pending.lock().expect("registry lock");
        if pending.iter().any(|s| Arc::ptr_eq(s, &subscriber)) {
            return Ok(());
        }
        debug!(
            subscriber = subscriber.name(),
            patterns = ?subscriber.patterns(),
            "Subscriber registered"
        );
        pending.push(subscriber);
        Ok(())
    }

    /// Snapshot registrations into the read-only form. Idempotent; the
    /// first call wins.
    pub fn freeze(&self) -> Arc<FrozenRegistry> {
        self.frozen
            .get_or_init(|| {
                let pending = self.pending.lock().expect("registry lock");
                Arc::new(FrozenRegistry::new(pending.clone()))
            })
            .clone()
    }

    /// The frozen snapshot, if `freeze` has run.
    pub fn snapshot(&self) -> Option<Arc<FrozenRegistry>> {
        self.frozen.get().cloned()
    }
}

/// Immutable pattern -> subscriber mapping shared by workers.
pub struct FrozenRegistry {
    /// (pattern, subscribers under that pattern) in registration order
    entries: Vec<(String, Vec<Arc<Subscriber>>)>,
}

impl FrozenRegistry {
    fn new(subscribers: Vec<Arc<Subscriber>>) -> Self {
        let mut entries: Vec<(String, Vec<Arc<Subscriber>>)> = Vec::new();
        for subscriber in &subscribers {
            for pattern in subscriber.patterns() {
                match entries.iter_mut().find(|(p, _)| p == pattern) {
                    Some((_, subs)) => {
                        if !subs.iter().any(|s| Arc::ptr_eq(s, subscriber)) {
                            subs.push(subscriber.clone());
                        }
                    }
                    None => entries.push((pattern.clone(), vec![subscriber.clone()])),
                }
            }
        }
        Self { entries }
    }

    /// All subscribers whose patterns match the wire subject, in
    /// registration order, without duplicates.
    pub fn subscribers_for(&self, wire_subject: &str) -> Vec<Arc<Subscriber>> {
        let mut result: Vec<Arc<Subscriber>> = Vec::new();
        for (pattern, subs) in &self.entries {
            if subject::matches(pattern, wire_subject) {
                for sub in subs {
                    if !result.iter().any(|s| Arc::ptr_eq(s, sub)) {
                        result.push(sub.clone());
                    }
                }
            }
        }
        result
    }

    /// Distinct subject patterns in registration order; each becomes one
    /// durable pull consumer.
    pub fn patterns(&self) -> Vec<String> {
        self.entries.iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
