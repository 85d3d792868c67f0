//! Bounded ring buffer of per-handler event outcomes.
//!
//! Answers "has event X been processed by handler Y / by all handlers" and
//! feeds the bus's `wait` mechanism through a broadcast of every write.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Outcome of one handler invocation for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum HandlerResult {
    Ok,
    Error { kind: String, message: String },
}

impl HandlerResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// One handler's recorded outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerRecord {
    pub handler: String,
    pub result: HandlerResult,
}

/// All recorded outcomes for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub event_id: String,
    pub event_name: String,
    /// Handlers expected to process this event.
    pub expected: Vec<String>,
    pub results: Vec<HandlerRecord>,
}

impl HistoryEntry {
    /// Whether every expected handler has a recorded outcome.
    pub fn is_complete(&self) -> bool {
        self.expected
            .iter()
            .all(|h| self.results.iter().any(|r| &r.handler == h))
    }

    pub fn result_for(&self, handler: &str) -> Option<&HandlerRecord> {
        self.results.iter().find(|r| r.handler == handler)
    }
}

/// Broadcast payload for every history write.
#[derive(Debug, Clone)]
pub struct HistoryUpdate {
    pub event_id: String,
    pub record: HandlerRecord,
    /// Whether the entry became complete with this write.
    pub complete: bool,
}

/// Fixed-capacity event history; the oldest entry is evicted on overflow.
pub struct EventHistory {
    entries: Mutex<VecDeque<HistoryEntry>>,
    capacity: usize,
    updates: broadcast::Sender<HistoryUpdate>,
}

impl EventHistory {
    pub fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            updates,
        }
    }

    /// Open an entry for an event about to be dispatched.
    pub fn open(&self, event_id: &str, event_name: &str, expected: Vec<String>) {
        let mut entries = self.entries.lock().expect("history lock poisoned");
        if entries.iter().any(|e| e.event_id == event_id) {
            return;
        }
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(HistoryEntry {
            event_id: event_id.to_owned(),
            event_name: event_name.to_owned(),
            expected,
            results: Vec::new(),
        });
    }

    /// Record one handler outcome. Each `(event, handler)` pair is recorded
    /// at most once; a repeat write is dropped and returns `false`. Writes
    /// against an evicted (or never-opened) entry are also dropped.
    pub fn record(&self, event_id: &str, handler: &str, result: HandlerResult) -> bool {
        let update = {
            let mut entries = self.entries.lock().expect("history lock poisoned");
            let Some(entry) = entries.iter_mut().find(|e| e.event_id == event_id) else {
                return false;
            };
            if entry.result_for(handler).is_some() {
                return false;
            }
            let record = HandlerRecord {
                handler: handler.to_owned(),
                result,
            };
            entry.results.push(record.clone());
            HistoryUpdate {
                event_id: event_id.to_owned(),
                record,
                complete: entry.is_complete(),
            }
        };
        // Send after releasing the lock; no receivers is fine.
        let _ = self.updates.send(update);
        true
    }

    pub fn entry(&self, event_id: &str) -> Option<HistoryEntry> {
        self.entries
            .lock()
            .expect("history lock poisoned")
            .iter()
            .find(|e| e.event_id == event_id)
            .cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistoryUpdate> {
        self.updates.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("history lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(history: &EventHistory, event: &str, handler: &str) -> bool {
        history.record(event, handler, HandlerResult::Ok)
    }

    #[test]
    fn records_at_most_once_per_event_handler_pair() {
        let history = EventHistory::new(8);
        history.open("e1", "incoming-text", vec!["a".into(), "b".into()]);

        assert!(ok(&history, "e1", "a"));
        assert!(!ok(&history, "e1", "a"));

        let entry = history.entry("e1").expect("entry");
        assert_eq!(entry.results.len(), 1);
    }

    #[test]
    fn completeness_requires_all_expected_handlers() {
        let history = EventHistory::new(8);
        history.open("e1", "say", vec!["a".into(), "b".into()]);
        ok(&history, "e1", "a");
        assert!(!history.entry("e1").expect("entry").is_complete());
        ok(&history, "e1", "b");
        assert!(history.entry("e1").expect("entry").is_complete());
    }

    #[test]
    fn oldest_entry_evicted_at_capacity() {
        let history = EventHistory::new(2);
        history.open("e1", "say", vec![]);
        history.open("e2", "say", vec![]);
        history.open("e3", "say", vec![]);

        assert_eq!(history.len(), 2);
        assert!(history.entry("e1").is_none());
        assert!(history.entry("e3").is_some());
    }

    #[test]
    fn writes_to_evicted_entries_are_dropped() {
        let history = EventHistory::new(1);
        history.open("e1", "say", vec!["a".into()]);
        history.open("e2", "say", vec!["a".into()]);
        assert!(!ok(&history, "e1", "a"));
        assert!(ok(&history, "e2", "a"));
    }

    #[tokio::test]
    async fn record_broadcasts_completion() {
        let history = EventHistory::new(8);
        history.open("e1", "continue", vec!["only".into()]);
        let mut updates = history.subscribe();

        ok(&history, "e1", "only");

        let update = updates.recv().await.expect("update");
        assert_eq!(update.event_id, "e1");
        assert_eq!(update.record.handler, "only");
        assert!(update.complete);
    }

    #[test]
    fn error_results_are_preserved() {
        let history = EventHistory::new(8);
        history.open("e1", "say", vec!["gen".into()]);
        history.record(
            "e1",
            "gen",
            HandlerResult::Error {
                kind: "upstream".into(),
                message: "model unavailable".into(),
            },
        );
        let entry = history.entry("e1").expect("entry");
        let record = entry.result_for("gen").expect("record");
        assert!(!record.result.is_ok());
    }
}
