//! Shared type definitions for the store layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{
    CalendarSource, DirectiveStrength, EstimateSource, FocusScope, Phase, PlanStatus, Rag,
    TaskStatus, TaskType, TriageState,
};
use crate::util::parse_utc;

/// Errors raised by store accessors.
///
/// Schema drift is a first-class variant rather than a string to grep:
/// business code branches on `MissingRelation`/`MissingColumn` to degrade
/// instead of failing the whole request.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("missing relation: {name}")]
    MissingRelation { name: String },

    #[error("missing column: {name}")]
    MissingColumn { name: String },

    #[error("{0}")]
    Conflict(String),

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        let message = err.to_string();
        if let Some(idx) = message.find("no such table: ") {
            let name = message[idx + "no such table: ".len()..]
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_string();
            return Self::MissingRelation { name };
        }
        if let Some(idx) = message.find("no such column: ") {
            let name = message[idx + "no such column: ".len()..]
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_string();
            return Self::MissingColumn { name };
        }
        if message.contains("UNIQUE constraint failed") {
            return Self::Conflict(message);
        }
        Self::Sqlite(err)
    }
}

impl StoreError {
    /// True when the error means "the schema is behind", not "the data is bad".
    pub fn is_missing_relation(&self) -> bool {
        matches!(
            self,
            Self::MissingRelation { .. } | Self::MissingColumn { .. }
        )
    }
}

/// A row from the `tasks` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbTask {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub description: Option<String>,
    pub implementation_id: Option<String>,
    pub project_id: Option<String>,
    pub status: TaskStatus,
    pub task_type: TaskType,
    pub priority_score: f64,
    pub estimated_minutes: u32,
    pub estimate_source: EstimateSource,
    pub due_at: Option<String>,
    pub needs_review: bool,
    pub blocker: bool,
    pub waiting_on: Option<String>,
    pub follow_up_at: Option<String>,
    pub stakeholder_mentions: Vec<String>,
    pub source_type: Option<String>,
    pub source_url: Option<String>,
    pub inbox_item_id: Option<String>,
    pub pinned_excerpt: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl DbTask {
    pub fn due_at_utc(&self) -> Option<DateTime<Utc>> {
        self.due_at.as_deref().and_then(parse_utc)
    }

    pub fn follow_up_at_utc(&self) -> Option<DateTime<Utc>> {
        self.follow_up_at.as_deref().and_then(parse_utc)
    }

    pub fn updated_at_utc(&self) -> DateTime<Utc> {
        parse_utc(&self.updated_at).unwrap_or_else(Utc::now)
    }
}

/// A row from the `implementations` table (an application workstream).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbApplication {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub phase: Phase,
    pub rag: Rag,
    pub priority_weight: f64,
    pub portfolio_rank: Option<i64>,
    pub stakeholders: Vec<String>,
    pub keywords: Vec<String>,
    pub status_summary: Option<String>,
    pub next_milestone: Option<String>,
    pub target_date: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbChecklistItem {
    pub id: String,
    pub owner_id: String,
    pub task_id: String,
    pub label: String,
    pub done: bool,
    pub sort_order: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbDependency {
    pub id: String,
    pub owner_id: String,
    pub task_id: String,
    pub depends_on_task_id: Option<String>,
    pub depends_on_commitment_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCommitment {
    pub id: String,
    pub owner_id: String,
    pub stakeholder: String,
    pub direction: String,
    pub description: Option<String>,
    pub status: String,
    pub due_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbInboxItem {
    pub id: String,
    pub owner_id: String,
    pub dedupe_key: String,
    pub subject: String,
    pub from_email: String,
    pub from_name: Option<String>,
    pub received_at: String,
    pub message_id: Option<String>,
    pub source_url: Option<String>,
    pub triage_state: TriageState,
    pub extraction_json: Option<String>,
    pub extraction_model: Option<String>,
    pub extraction_confidence: Option<f64>,
    pub processing_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbIngestionEvent {
    pub id: i64,
    pub owner_id: String,
    pub inbox_item_id: Option<String>,
    pub event_type: String,
    pub detail: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbFocusDirective {
    pub id: String,
    pub owner_id: String,
    pub directive_text: String,
    pub scope_type: FocusScope,
    pub scope_id: Option<String>,
    pub scope_value: Option<String>,
    pub strength: DirectiveStrength,
    pub is_active: bool,
    pub starts_at: Option<String>,
    pub ends_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl DbFocusDirective {
    /// Whether the directive's optional window admits `now`.
    pub fn window_admits(&self, now: DateTime<Utc>) -> bool {
        let starts_ok = self
            .starts_at
            .as_deref()
            .and_then(parse_utc)
            .map(|at| at <= now)
            .unwrap_or(true);
        let ends_ok = self
            .ends_at
            .as_deref()
            .and_then(parse_utc)
            .map(|at| at > now)
            .unwrap_or(true);
        starts_ok && ends_ok
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbPlan {
    pub id: String,
    pub owner_id: String,
    pub plan_date: String,
    pub source: String,
    pub inputs_snapshot: String,
    pub plan_json: String,
    pub reasons_json: String,
    pub status: PlanStatus,
    pub applied_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCalendarEvent {
    pub id: String,
    pub owner_id: String,
    pub source: CalendarSource,
    pub external_event_id: String,
    pub title: String,
    pub body_preview: String,
    pub meeting_context: Option<String>,
    pub start_at: String,
    pub end_at: String,
    pub is_all_day: bool,
    pub content_hash: String,
    pub removed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl DbCalendarEvent {
    pub fn start_at_utc(&self) -> Option<DateTime<Utc>> {
        parse_utc(&self.start_at)
    }

    pub fn end_at_utc(&self) -> Option<DateTime<Utc>> {
        parse_utc(&self.end_at)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCalendarSnapshot {
    pub id: String,
    pub owner_id: String,
    pub range_start: String,
    pub range_end: String,
    pub payload_min: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCatalogModel {
    pub id: String,
    pub provider: String,
    pub model_id: String,
    pub display_name: String,
    pub input_price_per_mtok: Option<f64>,
    pub output_price_per_mtok: Option<f64>,
    pub tier: Option<String>,
    pub enabled: bool,
    pub pricing_is_placeholder: bool,
    pub sort_order: i64,
}

/// One LLM invocation attempt (including cache hits and skips), append-only.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbUsageEvent {
    pub id: i64,
    pub owner_id: String,
    pub feature: String,
    pub provider: String,
    pub model_id: String,
    pub model_source: String,
    pub status: String,
    pub latency_ms: i64,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub estimated_cost_usd: Option<f64>,
    pub cache_status: Option<String>,
    pub request_fingerprint: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbStatusUpdate {
    pub id: String,
    pub owner_id: String,
    pub implementation_id: String,
    pub snippet: String,
    pub created_at: String,
}

/// Decode a JSON string-array column, tolerating NULL/garbage as empty.
pub(crate) fn decode_string_list(raw: Option<String>) -> Vec<String> {
    raw.as_deref()
        .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_relation_is_probed_from_sqlite_message() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err = conn
            .prepare("SELECT * FROM not_a_table")
            .map(|_| ())
            .unwrap_err();
        let store_err = StoreError::from(err);
        assert!(
            matches!(store_err, StoreError::MissingRelation { ref name } if name == "not_a_table"),
            "got {store_err:?}"
        );
        assert!(store_err.is_missing_relation());
    }

    #[test]
    fn missing_column_is_probed_from_sqlite_message() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a TEXT);").unwrap();
        let err = conn.prepare("SELECT b FROM t").map(|_| ()).unwrap_err();
        let store_err = StoreError::from(err);
        assert!(matches!(store_err, StoreError::MissingColumn { ref name } if name == "b"));
    }

    #[test]
    fn unique_violation_becomes_conflict() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a TEXT UNIQUE); INSERT INTO t VALUES ('x');")
            .unwrap();
        let err = conn.execute("INSERT INTO t VALUES ('x')", []).unwrap_err();
        assert!(matches!(StoreError::from(err), StoreError::Conflict(_)));
    }

    #[test]
    fn directive_window_gating() {
        let now = chrono::Utc::now();
        let mut directive = DbFocusDirective {
            id: "f1".into(),
            owner_id: "o1".into(),
            directive_text: "focus".into(),
            scope_type: FocusScope::Stakeholder,
            scope_id: None,
            scope_value: Some("nancy".into()),
            strength: DirectiveStrength::Strong,
            is_active: true,
            starts_at: None,
            ends_at: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert!(directive.window_admits(now));

        directive.starts_at = Some((now + chrono::Duration::hours(1)).to_rfc3339());
        assert!(!directive.window_admits(now));

        directive.starts_at = Some((now - chrono::Duration::hours(2)).to_rfc3339());
        directive.ends_at = Some((now - chrono::Duration::hours(1)).to_rfc3339());
        assert!(!directive.window_admits(now));
    }

    #[test]
    fn string_list_decoding_tolerates_garbage() {
        assert_eq!(
            decode_string_list(Some("[\"a\",\"b\"]".into())),
            vec!["a", "b"]
        );
        assert!(decode_string_list(Some("not json".into())).is_empty());
        assert!(decode_string_list(None).is_empty());
    }
}
