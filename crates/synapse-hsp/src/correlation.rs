//! # Correlation Table
//!
//! The single table linking in-flight `TaskRequest` correlation ids to the
//! task/step waiting on them, with the deadline each one must resolve by.
//! Explicit insert / resolve / forget operations; late arrivals are simply
//! absent from the table. The connector's sweeper drains expired entries
//! through [`CorrelationTable::take_expired`], so step timeouts have exactly
//! one source of truth.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use uuid::Uuid;

/// What a correlated `TaskResult` routes back to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationEntry {
    pub task_id: String,
    pub step_id: String,
}

#[derive(Debug)]
struct TrackedEntry {
    entry: CorrelationEntry,
    deadline: Instant,
}

/// Correlation bookkeeping owned by the envelope layer
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<Uuid, TrackedEntry>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh correlation with its timeout deadline
    pub fn insert(&self, correlation_id: Uuid, task_id: String, step_id: String, deadline: Instant) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(
            correlation_id,
            TrackedEntry {
                entry: CorrelationEntry { task_id, step_id },
                deadline,
            },
        );
    }

    /// Resolve and remove a correlation. `None` means late, unknown, or
    /// superseded — the caller discards the message.
    pub fn resolve(&self, correlation_id: &Uuid) -> Option<CorrelationEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.remove(correlation_id).map(|t| t.entry)
    }

    /// Drop a correlation without resolving it (task abandoned or superseded)
    pub fn forget(&self, correlation_id: &Uuid) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.remove(correlation_id).is_some()
    }

    /// Remove and return every correlation whose deadline has passed.
    ///
    /// Removal happens under the same lock as selection, so a result arriving
    /// concurrently either resolves first (and is absent here) or loses the
    /// race and is discarded as late by `resolve`.
    pub fn take_expired(&self, now: Instant) -> Vec<(Uuid, CorrelationEntry)> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let expired: Vec<Uuid> = entries
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| entries.remove(&id).map(|t| (id, t.entry)))
            .collect()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_insert_resolve_removes() {
        let table = CorrelationTable::new();
        let id = Uuid::new_v4();
        table.insert(id, "t1".into(), "s1".into(), Instant::now() + Duration::from_secs(5));

        let entry = table.resolve(&id).unwrap();
        assert_eq!(entry.task_id, "t1");
        assert_eq!(entry.step_id, "s1");

        // Second resolve is a late arrival: absent
        assert!(table.resolve(&id).is_none());
    }

    #[test]
    fn test_forget() {
        let table = CorrelationTable::new();
        let id = Uuid::new_v4();
        table.insert(id, "t1".into(), "s1".into(), Instant::now() + Duration::from_secs(5));

        assert!(table.forget(&id));
        assert!(!table.forget(&id));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_take_expired_removes_only_overdue_entries() {
        let table = CorrelationTable::new();
        let past = Uuid::new_v4();
        let future = Uuid::new_v4();
        let now = Instant::now();

        table.insert(past, "t1".into(), "s1".into(), now - Duration::from_millis(1));
        table.insert(future, "t1".into(), "s2".into(), now + Duration::from_secs(60));

        let expired = table.take_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, past);
        assert_eq!(expired[0].1.step_id, "s1");

        // Expired entries are gone; the live one remains
        assert!(table.take_expired(now).is_empty());
        assert_eq!(table.len(), 1);
        assert!(table.resolve(&future).is_some());
    }
}
