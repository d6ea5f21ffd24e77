use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

/// What changed in the store since the engine last looked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingChange {
    /// Something changed; the earliest fire time is unknown.
    Unknown,
    /// A trigger may now fire as early as this.
    At(DateTime<Utc>),
}

impl SchedulingChange {
    fn merge(self, other: SchedulingChange) -> SchedulingChange {
        match (self, other) {
            (SchedulingChange::At(a), SchedulingChange::At(b)) => SchedulingChange::At(a.min(b)),
            _ => SchedulingChange::Unknown,
        }
    }

    /// Whether the change could move a firing ahead of `time`.
    pub fn is_earlier_than(self, time: DateTime<Utc>) -> bool {
        match self {
            SchedulingChange::Unknown => true,
            SchedulingChange::At(at) => at < time,
        }
    }
}

/// Wakes a sleeping engine when triggers are added or changed.
///
/// Changes signalled while nobody waits are merged and kept until the engine
/// takes them.
#[derive(Debug, Clone, Default)]
pub struct SchedulerSignal {
    inner: Arc<SignalInner>,
}

#[derive(Debug, Default)]
struct SignalInner {
    pending: Mutex<Option<SchedulingChange>>,
    notify: Notify,
}

impl SchedulerSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change. `None` means the earliest affected time is unknown.
    pub fn scheduling_changed(&self, candidate: Option<DateTime<Utc>>) {
        let change = candidate.map_or(SchedulingChange::Unknown, SchedulingChange::At);
        {
            let mut pending = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *pending = Some(match *pending {
                Some(existing) => existing.merge(change),
                None => change,
            });
        }
        self.inner.notify.notify_one();
    }

    /// Wait for the next change and take it.
    pub async fn changed(&self) -> Option<SchedulingChange> {
        self.inner.notify.notified().await;
        self.take()
    }

    /// Take the pending change without waiting.
    pub fn take(&self) -> Option<SchedulingChange> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
