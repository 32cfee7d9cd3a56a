use rusqlite::params;
use uuid::Uuid;

use crate::types::TriageState;

use super::*;

const INBOX_COLUMNS: &str = "id, owner_id, dedupe_key, subject, from_email, from_name, \
     received_at, message_id, source_url, triage_state, extraction_json, extraction_model, \
     extraction_confidence, processing_error, created_at, updated_at";

/// Metadata-only inbox insert. Body snippets are transient and never reach
/// the store.
#[derive(Debug, Clone)]
pub struct NewInboxItem {
    pub dedupe_key: String,
    pub subject: String,
    pub from_email: String,
    pub from_name: Option<String>,
    pub received_at: String,
    pub message_id: Option<String>,
    pub source_url: Option<String>,
}

impl Store {
    // =====================================================================
    // Inbox items
    // =====================================================================

    pub fn find_inbox_item_by_key(
        &self,
        owner_id: &str,
        dedupe_key: &str,
    ) -> Result<Option<DbInboxItem>, StoreError> {
        let sql = format!(
            "SELECT {INBOX_COLUMNS} FROM inbox_items WHERE owner_id = ?1 AND dedupe_key = ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![owner_id, dedupe_key], Self::map_inbox_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn get_inbox_item(
        &self,
        owner_id: &str,
        id: &str,
    ) -> Result<Option<DbInboxItem>, StoreError> {
        let sql = format!("SELECT {INBOX_COLUMNS} FROM inbox_items WHERE owner_id = ?1 AND id = ?2");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![owner_id, id], Self::map_inbox_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn create_inbox_item(
        &self,
        owner_id: &str,
        new: &NewInboxItem,
    ) -> Result<DbInboxItem, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = now_iso();
        self.conn.execute(
            "INSERT INTO inbox_items (id, owner_id, dedupe_key, subject, from_email, from_name,
                 received_at, message_id, source_url, triage_state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'new', ?10, ?10)",
            params![
                id,
                owner_id,
                new.dedupe_key,
                new.subject,
                new.from_email,
                new.from_name,
                new.received_at,
                new.message_id,
                new.source_url,
                now,
            ],
        )?;
        self.get_inbox_item(owner_id, &id)?
            .ok_or_else(|| StoreError::Conflict("inbox item vanished after insert".into()))
    }

    /// Persist a successful extraction and flip to Processed.
    pub fn mark_inbox_processed(
        &self,
        owner_id: &str,
        id: &str,
        extraction_json: &str,
        extraction_model: Option<&str>,
        extraction_confidence: Option<f64>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE inbox_items
             SET triage_state = 'processed', extraction_json = ?1, extraction_model = ?2,
                 extraction_confidence = ?3, processing_error = NULL, updated_at = ?4
             WHERE owner_id = ?5 AND id = ?6",
            params![
                extraction_json,
                extraction_model,
                extraction_confidence,
                now_iso(),
                owner_id,
                id
            ],
        )?;
        Ok(())
    }

    /// Record a failed extraction; the item stays around for retry/audit.
    pub fn mark_inbox_error(
        &self,
        owner_id: &str,
        id: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE inbox_items
             SET triage_state = 'error', processing_error = ?1, updated_at = ?2
             WHERE owner_id = ?3 AND id = ?4",
            params![error, now_iso(), owner_id, id],
        )?;
        Ok(())
    }

    fn map_inbox_row(row: &rusqlite::Row) -> rusqlite::Result<DbInboxItem> {
        let triage: String = row.get(9)?;
        Ok(DbInboxItem {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            dedupe_key: row.get(2)?,
            subject: row.get(3)?,
            from_email: row.get(4)?,
            from_name: row.get(5)?,
            received_at: row.get(6)?,
            message_id: row.get(7)?,
            source_url: row.get(8)?,
            triage_state: TriageState::parse(&triage).unwrap_or(TriageState::New),
            extraction_json: row.get(10)?,
            extraction_model: row.get(11)?,
            extraction_confidence: row.get(12)?,
            processing_error: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    // =====================================================================
    // Ingestion events (append-only audit trail)
    // =====================================================================

    pub fn log_ingestion_event(
        &self,
        owner_id: &str,
        inbox_item_id: Option<&str>,
        event_type: &str,
        detail: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO ingestion_events (owner_id, inbox_item_id, event_type, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![owner_id, inbox_item_id, event_type, detail, now_iso()],
        )?;
        Ok(())
    }

    pub fn list_ingestion_events(
        &self,
        owner_id: &str,
        inbox_item_id: &str,
    ) -> Result<Vec<DbIngestionEvent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, owner_id, inbox_item_id, event_type, detail, created_at
             FROM ingestion_events
             WHERE owner_id = ?1 AND inbox_item_id = ?2
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![owner_id, inbox_item_id], |row| {
            Ok(DbIngestionEvent {
                id: row.get(0)?,
                owner_id: row.get(1)?,
                inbox_item_id: row.get(2)?,
                event_type: row.get(3)?,
                detail: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }
}
