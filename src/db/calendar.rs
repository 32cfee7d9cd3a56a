use chrono::{Duration, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::types::CalendarSource;

use super::*;

const EVENT_COLUMNS: &str = "id, owner_id, source, external_event_id, title, body_preview, \
     meeting_context, start_at, end_at, is_all_day, content_hash, removed_at, created_at, \
     updated_at";

/// One event as handed to the ingest path (already sanitized).
#[derive(Debug, Clone)]
pub struct IngestEvent {
    pub external_event_id: String,
    pub title: String,
    pub body_preview: String,
    pub start_at: String,
    pub end_at: String,
    pub is_all_day: bool,
    pub content_hash: String,
}

impl Store {
    // =====================================================================
    // Calendar events
    // =====================================================================

    /// Idempotent upsert keyed by `(owner, source, external_event_id,
    /// start_at)`. A changed content hash updates the row in place; a
    /// previously soft-removed event resurrects.
    pub fn upsert_calendar_event(
        &self,
        owner_id: &str,
        source: CalendarSource,
        event: &IngestEvent,
    ) -> Result<(), StoreError> {
        let now = now_iso();
        self.conn.execute(
            "INSERT INTO calendar_events (id, owner_id, source, external_event_id, title,
                 body_preview, start_at, end_at, is_all_day, content_hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
             ON CONFLICT(owner_id, source, external_event_id, start_at) DO UPDATE SET
                 title = excluded.title,
                 body_preview = excluded.body_preview,
                 end_at = excluded.end_at,
                 is_all_day = excluded.is_all_day,
                 content_hash = excluded.content_hash,
                 removed_at = NULL,
                 updated_at = excluded.updated_at",
            params![
                Uuid::new_v4().to_string(),
                owner_id,
                source.as_str(),
                event.external_event_id,
                event.title,
                event.body_preview,
                event.start_at,
                event.end_at,
                event.is_all_day,
                event.content_hash,
                now,
            ],
        )?;
        Ok(())
    }

    /// Active events overlapping `[start, end)`, ordered by start.
    pub fn list_events_between(
        &self,
        owner_id: &str,
        start_iso: &str,
        end_iso: &str,
    ) -> Result<Vec<DbCalendarEvent>, StoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM calendar_events
             WHERE owner_id = ?1 AND removed_at IS NULL
               AND start_at < ?3 AND end_at > ?2
             ORDER BY start_at ASC, external_event_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![owner_id, start_iso, end_iso], Self::map_event_row)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    pub fn get_calendar_event(
        &self,
        owner_id: &str,
        id: &str,
    ) -> Result<Option<DbCalendarEvent>, StoreError> {
        let sql =
            format!("SELECT {EVENT_COLUMNS} FROM calendar_events WHERE owner_id = ?1 AND id = ?2");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![owner_id, id], Self::map_event_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Soft-remove events of `source` starting within `[start, end)` whose
    /// `(external_event_id, start_at)` pair was absent from the latest
    /// ingest. Keying on the pair means a moved event retires its old slot.
    pub fn soft_remove_missing_events(
        &self,
        owner_id: &str,
        source: CalendarSource,
        start_iso: &str,
        end_iso: &str,
        keep: &[(String, String)],
    ) -> Result<usize, StoreError> {
        let now = now_iso();
        // Small ranges (≤31 days); fetching ids then updating avoids building
        // a variable-length IN clause.
        let mut stmt = self.conn.prepare(
            "SELECT id, external_event_id, start_at FROM calendar_events
             WHERE owner_id = ?1 AND source = ?2 AND removed_at IS NULL
               AND start_at >= ?3 AND start_at < ?4",
        )?;
        let rows = stmt.query_map(
            params![owner_id, source.as_str(), start_iso, end_iso],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )?;

        let mut removed = 0;
        let mut to_remove = Vec::new();
        for row in rows {
            let (id, external_id, start_at) = row?;
            let kept = keep
                .iter()
                .any(|(keep_id, keep_start)| *keep_id == external_id && *keep_start == start_at);
            if !kept {
                to_remove.push(id);
            }
        }
        drop(stmt);

        for id in to_remove {
            removed += self.conn.execute(
                "UPDATE calendar_events SET removed_at = ?1, updated_at = ?1
                 WHERE owner_id = ?2 AND id = ?3",
                params![now, owner_id, id],
            )?;
        }
        Ok(removed)
    }

    /// Write per-event meeting context (≤ 8000 chars, validated upstream).
    pub fn set_meeting_context(
        &self,
        owner_id: &str,
        event_id: &str,
        context: Option<&str>,
    ) -> Result<bool, StoreError> {
        let n = self.conn.execute(
            "UPDATE calendar_events SET meeting_context = ?1, updated_at = ?2
             WHERE owner_id = ?3 AND id = ?4",
            params![context, now_iso(), owner_id, event_id],
        )?;
        Ok(n > 0)
    }

    fn map_event_row(row: &rusqlite::Row) -> rusqlite::Result<DbCalendarEvent> {
        let source: String = row.get(2)?;
        Ok(DbCalendarEvent {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            source: CalendarSource::parse(&source).unwrap_or(CalendarSource::Local),
            external_event_id: row.get(3)?,
            title: row.get(4)?,
            body_preview: row.get(5)?,
            meeting_context: row.get(6)?,
            start_at: row.get(7)?,
            end_at: row.get(8)?,
            is_all_day: row.get(9)?,
            content_hash: row.get(10)?,
            removed_at: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    // =====================================================================
    // Calendar snapshots
    // =====================================================================

    pub fn insert_calendar_snapshot(
        &self,
        owner_id: &str,
        range_start: &str,
        range_end: &str,
        payload_min: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO calendar_snapshots (id, owner_id, range_start, range_end, payload_min,
                                             created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                owner_id,
                range_start,
                range_end,
                payload_min,
                now_iso()
            ],
        )?;
        Ok(())
    }

    pub fn latest_calendar_snapshot(
        &self,
        owner_id: &str,
        range_start: &str,
        range_end: &str,
    ) -> Result<Option<DbCalendarSnapshot>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, owner_id, range_start, range_end, payload_min, created_at
             FROM calendar_snapshots
             WHERE owner_id = ?1 AND range_start = ?2 AND range_end = ?3
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![owner_id, range_start, range_end], |row| {
            Ok(DbCalendarSnapshot {
                id: row.get(0)?,
                owner_id: row.get(1)?,
                range_start: row.get(2)?,
                range_end: row.get(3)?,
                payload_min: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Lazy retention: drop snapshots older than `horizon_days`.
    pub fn prune_calendar_snapshots(
        &self,
        owner_id: &str,
        horizon_days: i64,
    ) -> Result<usize, StoreError> {
        let cutoff = (Utc::now() - Duration::days(horizon_days))
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let n = self.conn.execute(
            "DELETE FROM calendar_snapshots WHERE owner_id = ?1 AND created_at < ?2",
            params![owner_id, cutoff],
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn event(id: &str, start: &str, end: &str, hash: &str) -> IngestEvent {
        IngestEvent {
            external_event_id: id.to_string(),
            title: "Standup".to_string(),
            body_preview: String::new(),
            start_at: start.to_string(),
            end_at: end.to_string(),
            is_all_day: false,
            content_hash: hash.to_string(),
        }
    }

    #[test]
    fn ingest_is_idempotent_by_key() {
        let store = store();
        let e = event("ev1", "2026-03-02T14:00:00Z", "2026-03-02T15:00:00Z", "h1");
        store
            .upsert_calendar_event("o1", CalendarSource::Ical, &e)
            .unwrap();
        store
            .upsert_calendar_event("o1", CalendarSource::Ical, &e)
            .unwrap();

        let events = store
            .list_events_between("o1", "2026-03-02T00:00:00Z", "2026-03-03T00:00:00Z")
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn new_content_hash_updates_in_place() {
        let store = store();
        store
            .upsert_calendar_event(
                "o1",
                CalendarSource::Ical,
                &event("ev1", "2026-03-02T14:00:00Z", "2026-03-02T15:00:00Z", "h1"),
            )
            .unwrap();
        let mut changed = event("ev1", "2026-03-02T14:00:00Z", "2026-03-02T15:30:00Z", "h2");
        changed.title = "Standup (moved)".to_string();
        store
            .upsert_calendar_event("o1", CalendarSource::Ical, &changed)
            .unwrap();

        let events = store
            .list_events_between("o1", "2026-03-02T00:00:00Z", "2026-03-03T00:00:00Z")
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content_hash, "h2");
        assert_eq!(events[0].end_at, "2026-03-02T15:30:00Z");
    }

    #[test]
    fn soft_remove_hides_missing_events() {
        let store = store();
        for id in ["ev1", "ev2"] {
            store
                .upsert_calendar_event(
                    "o1",
                    CalendarSource::Ical,
                    &event(id, "2026-03-02T14:00:00Z", "2026-03-02T15:00:00Z", "h"),
                )
                .unwrap();
        }

        let removed = store
            .soft_remove_missing_events(
                "o1",
                CalendarSource::Ical,
                "2026-03-02T00:00:00Z",
                "2026-03-03T00:00:00Z",
                &[("ev1".to_string(), "2026-03-02T14:00:00Z".to_string())],
            )
            .unwrap();
        assert_eq!(removed, 1);

        let events = store
            .list_events_between("o1", "2026-03-02T00:00:00Z", "2026-03-03T00:00:00Z")
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].external_event_id, "ev1");

        // Re-ingesting ev2 resurrects it.
        store
            .upsert_calendar_event(
                "o1",
                CalendarSource::Ical,
                &event("ev2", "2026-03-02T14:00:00Z", "2026-03-02T15:00:00Z", "h"),
            )
            .unwrap();
        let events = store
            .list_events_between("o1", "2026-03-02T00:00:00Z", "2026-03-03T00:00:00Z")
            .unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn meeting_context_write_is_owner_scoped() {
        let store = store();
        store
            .upsert_calendar_event(
                "o1",
                CalendarSource::Local,
                &event("ev1", "2026-03-02T14:00:00Z", "2026-03-02T15:00:00Z", "h"),
            )
            .unwrap();
        let row = &store
            .list_events_between("o1", "2026-03-02T00:00:00Z", "2026-03-03T00:00:00Z")
            .unwrap()[0];

        assert!(store
            .set_meeting_context("o1", &row.id, Some("bring the cutover checklist"))
            .unwrap());
        assert!(!store.set_meeting_context("o2", &row.id, Some("nope")).unwrap());
    }

    #[test]
    fn snapshots_round_trip_latest() {
        let store = store();
        store
            .insert_calendar_snapshot("o1", "2026-03-02", "2026-03-02", "[]")
            .unwrap();
        store
            .insert_calendar_snapshot("o1", "2026-03-02", "2026-03-02", "[1]")
            .unwrap();

        let latest = store
            .latest_calendar_snapshot("o1", "2026-03-02", "2026-03-02")
            .unwrap()
            .unwrap();
        assert_eq!(latest.payload_min, "[1]");

        assert!(store
            .latest_calendar_snapshot("o1", "2026-03-03", "2026-03-03")
            .unwrap()
            .is_none());
    }

    #[test]
    fn prune_only_touches_old_snapshots() {
        let store = store();
        store
            .insert_calendar_snapshot("o1", "2026-03-02", "2026-03-02", "[]")
            .unwrap();
        // Fresh snapshot survives a 14-day horizon.
        assert_eq!(store.prune_calendar_snapshots("o1", 14).unwrap(), 0);
        // A zero-day horizon only removes entries strictly older than now;
        // the row written this second may or may not fall under it, so age
        // it explicitly.
        store
            .conn_ref()
            .execute(
                "UPDATE calendar_snapshots SET created_at = '2020-01-01T00:00:00Z'",
                [],
            )
            .unwrap();
        assert_eq!(store.prune_calendar_snapshots("o1", 14).unwrap(), 1);
    }
}
