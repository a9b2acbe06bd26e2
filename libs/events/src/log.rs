//! Bounded recent-history buffer for health events.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::HealthEvent;

/// Default number of events retained.
pub const DEFAULT_CAPACITY: usize = 256;

/// A bounded, thread-safe ring buffer of recent health events.
///
/// When full, the oldest event is dropped. This is deliberately not a
/// persistent log; collaborators that want durable history must consume
/// events as they are emitted.
pub struct EventLog {
    inner: Mutex<VecDeque<HealthEvent>>,
    capacity: usize,
}

impl EventLog {
    /// Create a log with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a log with an explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Record an event, evicting the oldest if at capacity.
    pub fn record(&self, event: HealthEvent) {
        let mut inner = self.inner.lock().expect("event log poisoned");
        if inner.len() == self.capacity {
            inner.pop_front();
        }
        inner.push_back(event);
    }

    /// Events with a timestamp strictly after `since`, oldest first.
    pub fn since(&self, since: DateTime<Utc>) -> Vec<HealthEvent> {
        let inner = self.inner.lock().expect("event log poisoned");
        inner
            .iter()
            .filter(|e| e.timestamp > since)
            .cloned()
            .collect()
    }

    /// All retained events, oldest first.
    pub fn all(&self) -> Vec<HealthEvent> {
        let inner = self.inner.lock().expect("event log poisoned");
        inner.iter().cloned().collect()
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("event log poisoned").len()
    }

    /// True if no events are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventKind, EventSubject, Severity};

    fn event(id: u32) -> HealthEvent {
        HealthEvent::now(
            EventSubject::Replica(id),
            EventKind::ProbeFailed,
            Severity::Info,
            "test",
        )
    }

    #[test]
    fn test_capacity_eviction() {
        let log = EventLog::with_capacity(3);
        for id in 0..5 {
            log.record(event(id));
        }

        let all = log.all();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].subject, EventSubject::Replica(2));
        assert_eq!(all[2].subject, EventSubject::Replica(4));
    }

    #[test]
    fn test_since_filters_older_events() {
        let log = EventLog::new();
        log.record(event(1));
        let cut = Utc::now();
        log.record(event(2));

        let recent = log.since(cut);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].subject, EventSubject::Replica(2));
    }

    #[test]
    fn test_empty() {
        let log = EventLog::new();
        assert!(log.is_empty());
        log.record(event(1));
        assert!(!log.is_empty());
        assert_eq!(log.len(), 1);
    }
}
