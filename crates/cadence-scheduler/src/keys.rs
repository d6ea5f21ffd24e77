use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Source of unique names for triggers created without an explicit key.
///
/// Injected into [`crate::handle::SchedulerHandle`] so tests can swap in a
/// deterministic sequence.
pub trait KeyGenerator: Send + Sync {
    fn unique_name(&self) -> String;
}

/// Random UUID v4 names. The production default.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidKeyGenerator;

impl KeyGenerator for UuidKeyGenerator {
    fn unique_name(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// `<prefix>-<n>` names from a process-local counter.
#[derive(Debug)]
pub struct SequenceKeyGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequenceKeyGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl KeyGenerator for SequenceKeyGenerator {
    fn unique_name(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }
}
