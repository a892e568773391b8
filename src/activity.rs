//! Bounded log of lifecycle events with a live broadcast feed

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Upper bound on entries returned by a single query
pub const MAX_QUERY_LIMIT: usize = 100;
pub const DEFAULT_QUERY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// Traffic or backend-side work
    Activity,
    /// Start, readiness and configuration events
    System,
    /// The target was stopped
    Shutdown,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub message: String,
}

pub struct ActivityLog {
    entries: Mutex<VecDeque<ActivityEntry>>,
    capacity: usize,
    events: broadcast::Sender<ActivityEntry>,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (events, _) = broadcast::channel(64);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            events,
        }
    }

    /// Append an entry, evicting the oldest when full. Also logged through tracing.
    pub fn record(&self, kind: ActivityKind, message: impl Into<String>) {
        let entry = ActivityEntry {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
        };

        match kind {
            ActivityKind::Error => error!(kind = "error", "{}", entry.message),
            ActivityKind::Shutdown => warn!(kind = "shutdown", "{}", entry.message),
            ActivityKind::System => info!(kind = "system", "{}", entry.message),
            ActivityKind::Activity => info!(kind = "activity", "{}", entry.message),
        }

        {
            let mut entries = self.entries.lock();
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }

        // No subscribers is fine
        let _ = self.events.send(entry);
    }

    /// Most recent entries, newest first. `limit` is clamped to 1..=100.
    pub fn recent(&self, limit: usize) -> Vec<ActivityEntry> {
        let limit = limit.clamp(1, MAX_QUERY_LIMIT);
        self.entries.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEntry> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_is_newest_first() {
        let log = ActivityLog::new(10);
        log.record(ActivityKind::System, "first");
        log.record(ActivityKind::Activity, "second");
        log.record(ActivityKind::Shutdown, "third");

        let recent = log.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "third");
        assert_eq!(recent[0].kind, ActivityKind::Shutdown);
        assert_eq!(recent[1].message, "second");
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let log = ActivityLog::new(3);
        for i in 0..5 {
            log.record(ActivityKind::Activity, format!("event {}", i));
        }
        assert_eq!(log.len(), 3);
        let recent = log.recent(10);
        assert_eq!(recent.last().unwrap().message, "event 2");
        assert_eq!(recent.first().unwrap().message, "event 4");
    }

    #[test]
    fn test_limit_is_clamped() {
        let log = ActivityLog::new(200);
        for i in 0..150 {
            log.record(ActivityKind::Activity, format!("event {}", i));
        }
        assert_eq!(log.recent(0).len(), 1);
        assert_eq!(log.recent(500).len(), MAX_QUERY_LIMIT);
    }

    #[test]
    fn test_entry_serializes_kind_as_type() {
        let log = ActivityLog::new(5);
        log.record(ActivityKind::Error, "boom");
        let json = serde_json::to_value(&log.recent(1)[0]).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "boom");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_subscribers_receive_entries() {
        let log = ActivityLog::new(5);
        let mut rx = log.subscribe();
        log.record(ActivityKind::System, "started");
        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.message, "started");
    }
}
