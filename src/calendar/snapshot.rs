//! Snapshot canonicalization and delta computation.
//!
//! A snapshot is the minimal ordered projection of a range's events:
//! `(external_event_id, start_at, end_at, content_hash)`. Deltas compare by
//! external id so a moved event reads as changed, not removed-plus-added.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::db::DbCalendarEvent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub external_event_id: String,
    pub start_at: String,
    pub end_at: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedEntry {
    pub external_event_id: String,
    pub time_changed: bool,
    pub content_changed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<ChangedEntry>,
}

/// Project events into the canonical ordered sequence (by start, then id).
pub fn canonical_entries(events: &[DbCalendarEvent]) -> Vec<SnapshotEntry> {
    let mut entries: Vec<SnapshotEntry> = events
        .iter()
        .map(|e| SnapshotEntry {
            external_event_id: e.external_event_id.clone(),
            start_at: e.start_at.clone(),
            end_at: e.end_at.clone(),
            content_hash: e.content_hash.clone(),
        })
        .collect();
    entries.sort_by(|a, b| {
        a.start_at
            .cmp(&b.start_at)
            .then_with(|| a.external_event_id.cmp(&b.external_event_id))
    });
    entries
}

pub fn encode_entries(entries: &[SnapshotEntry]) -> String {
    serde_json::to_string(entries).unwrap_or_else(|_| "[]".to_string())
}

/// Tolerant decode: an unreadable stored payload degrades to "no previous
/// snapshot", which only costs an over-reported delta.
pub fn decode_entries(payload: &str) -> Vec<SnapshotEntry> {
    serde_json::from_str(payload).unwrap_or_default()
}

/// Diff two snapshots by external event id.
pub fn compute_delta(previous: &[SnapshotEntry], current: &[SnapshotEntry]) -> SnapshotDelta {
    let prev_by_id: HashMap<&str, &SnapshotEntry> = previous
        .iter()
        .map(|e| (e.external_event_id.as_str(), e))
        .collect();
    let current_by_id: HashMap<&str, &SnapshotEntry> = current
        .iter()
        .map(|e| (e.external_event_id.as_str(), e))
        .collect();

    let mut delta = SnapshotDelta::default();

    for entry in current {
        match prev_by_id.get(entry.external_event_id.as_str()) {
            None => delta.added.push(entry.external_event_id.clone()),
            Some(prev) => {
                let time_changed =
                    prev.start_at != entry.start_at || prev.end_at != entry.end_at;
                let content_changed = prev.content_hash != entry.content_hash;
                if time_changed || content_changed {
                    delta.changed.push(ChangedEntry {
                        external_event_id: entry.external_event_id.clone(),
                        time_changed,
                        content_changed,
                    });
                }
            }
        }
    }

    for entry in previous {
        if !current_by_id.contains_key(entry.external_event_id.as_str()) {
            delta.removed.push(entry.external_event_id.clone());
        }
    }

    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, start: &str, end: &str, hash: &str) -> SnapshotEntry {
        SnapshotEntry {
            external_event_id: id.to_string(),
            start_at: start.to_string(),
            end_at: end.to_string(),
            content_hash: hash.to_string(),
        }
    }

    #[test]
    fn empty_previous_means_everything_added() {
        let current = vec![entry("a", "s", "e", "h")];
        let delta = compute_delta(&[], &current);
        assert_eq!(delta.added, vec!["a"]);
        assert!(delta.removed.is_empty());
        assert!(delta.changed.is_empty());
    }

    #[test]
    fn identical_snapshots_produce_empty_delta() {
        let entries = vec![entry("a", "s", "e", "h"), entry("b", "s2", "e2", "h2")];
        let delta = compute_delta(&entries, &entries);
        assert!(delta.added.is_empty());
        assert!(delta.removed.is_empty());
        assert!(delta.changed.is_empty());
    }

    #[test]
    fn time_and_content_changes_are_distinguished() {
        let previous = vec![
            entry("moved", "09:00", "10:00", "h1"),
            entry("edited", "11:00", "12:00", "h2"),
            entry("both", "13:00", "14:00", "h3"),
        ];
        let current = vec![
            entry("moved", "09:30", "10:30", "h1"),
            entry("edited", "11:00", "12:00", "h2-new"),
            entry("both", "13:30", "14:30", "h3-new"),
        ];

        let delta = compute_delta(&previous, &current);
        let by_id: HashMap<&str, &ChangedEntry> = delta
            .changed
            .iter()
            .map(|c| (c.external_event_id.as_str(), c))
            .collect();

        assert!(by_id["moved"].time_changed && !by_id["moved"].content_changed);
        assert!(!by_id["edited"].time_changed && by_id["edited"].content_changed);
        assert!(by_id["both"].time_changed && by_id["both"].content_changed);
    }

    #[test]
    fn removed_events_are_reported() {
        let previous = vec![entry("gone", "s", "e", "h"), entry("kept", "s", "e", "h")];
        let current = vec![entry("kept", "s", "e", "h")];
        let delta = compute_delta(&previous, &current);
        assert_eq!(delta.removed, vec!["gone"]);
    }

    #[test]
    fn canonical_order_is_start_then_id() {
        let events_json = [
            entry("b", "2026-03-02T15:00:00Z", "x", "h"),
            entry("a", "2026-03-02T15:00:00Z", "x", "h"),
            entry("c", "2026-03-02T14:00:00Z", "x", "h"),
        ];
        let encoded = encode_entries(&events_json);
        let decoded = decode_entries(&encoded);
        assert_eq!(decoded.len(), 3);

        // canonical_entries sorts; encode/decode preserves order.
        let mut entries = events_json.to_vec();
        entries.sort_by(|a, b| {
            a.start_at
                .cmp(&b.start_at)
                .then_with(|| a.external_event_id.cmp(&b.external_event_id))
        });
        assert_eq!(entries[0].external_event_id, "c");
        assert_eq!(entries[1].external_event_id, "a");
    }

    #[test]
    fn decode_tolerates_garbage() {
        assert!(decode_entries("not json").is_empty());
    }
}
