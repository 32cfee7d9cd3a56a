//! HTTP command surface.
//!
//! One file, one handler per operation, teacher-style: handlers validate,
//! call the owning subsystem, and serialize. No business logic lives here
//! beyond field whitelisting and status-code mapping.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};

use crate::auth;
use crate::briefing::{self, narrative, BriefingMode};
use crate::briefing::narrative::NarrativeCache;
use crate::calendar::{self, WorkdaySpec};
use crate::config::{Config, DEFAULT_PRIORITY_STAKEHOLDERS};
use crate::db::{
    ApplicationPatch, DbApplication, DbTask, DirectivePatch, NewDirective, NewTask, Store,
    StoreError, TaskFilter, TaskPatch,
};
use crate::error::ApiError;
use crate::intake::{self, IntakeError, IntakePayload, IntakeResult};
use crate::llm::{LlmDispatcher, LlmFeature};
use crate::planner::{self, PlanMode, PlanRequest};
use crate::priority::{intake_priority_boosts, ScoreContext};
use crate::types::{
    CalendarSource, DirectiveStrength, EstimateSource, FocusScope, Phase, Rag, TaskStatus,
    TaskType,
};
use crate::util::{clamp_f64, parse_date, parse_utc};

const MEETING_CONTEXT_MAX_CHARS: usize = 8000;
const STATUS_SNIPPET_BLOCKER_CAP: usize = 3;

pub struct AppState {
    pub config: Config,
    pub db_path: PathBuf,
    pub dispatcher: LlmDispatcher,
    pub narrative_cache: NarrativeCache,
}

impl AppState {
    pub fn new(config: Config, dispatcher: LlmDispatcher) -> Self {
        let db_path = config.db_path.clone();
        Self {
            config,
            db_path,
            dispatcher,
            narrative_cache: NarrativeCache::new(),
        }
    }

    /// Per-request store handle against the migrated database.
    pub fn store(&self) -> Result<Store, ApiError> {
        Store::open_existing(&self.db_path).map_err(ApiError::from)
    }

    pub fn workday_spec(&self) -> WorkdaySpec {
        WorkdaySpec {
            tz: self.config.workday_tz,
            focus_start: self.config.focus_start,
            focus_end: self.config.focus_end,
        }
    }
}

/// Admitted owner id; extraction is the 401 gate for every route.
pub struct AuthedOwner(pub String);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthedOwner {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let store = state.store()?;
        auth::admit(&store, &state.config, &parts.headers, parts.uri.query())
            .map(AuthedOwner)
            .ok_or(ApiError::Unauthorized)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", get(list_tasks).post(create_task))
        .route(
            "/tasks/:id",
            get(get_task).patch(patch_task).delete(delete_task),
        )
        .route(
            "/tasks/:id/dependencies",
            get(list_dependencies).post(create_dependency),
        )
        .route("/tasks/:id/dependencies/:dep_id", axum::routing::delete(delete_dependency))
        .route(
            "/tasks/:id/checklist",
            get(list_checklist).post(add_checklist_item),
        )
        .route(
            "/tasks/:id/checklist/:item_id",
            axum::routing::patch(patch_checklist_item).delete(delete_checklist_item),
        )
        .route("/applications", get(list_applications).post(create_application))
        .route("/applications/:id", axum::routing::patch(patch_application))
        .route("/applications/reorder", post(reorder_applications))
        .route("/implementations/:id/copy-update", post(copy_update))
        .route("/implementations/:id/status-updates", get(list_status_updates))
        .route("/commitments", post(create_commitment))
        .route("/commitments/:id", axum::routing::patch(patch_commitment))
        .route("/focus", get(list_focus).post(create_focus))
        .route("/focus/clear", post(clear_focus))
        .route("/focus/:id", axum::routing::patch(patch_focus))
        .route("/planner/plan", get(plan_get).post(plan_post))
        .route("/calendar", get(calendar_get).patch(calendar_patch))
        .route("/calendar/ingest", post(calendar_ingest))
        .route("/intake/email", post(intake_email))
        .route("/intake/events", get(intake_events))
        .route("/briefing", get(briefing_get))
        .route("/briefing/narrative", post(briefing_narrative))
        .route("/llm/catalog", get(llm_catalog))
        .route(
            "/llm/preferences",
            get(llm_preferences_get).put(llm_preferences_put),
        )
        .route("/llm/usage", get(llm_usage))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

// =========================================================================
// Tasks
// =========================================================================

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;

    let status = match params.get("status") {
        Some(raw) => Some(
            TaskStatus::parse(raw)
                .ok_or_else(|| ApiError::validation(format!("invalid status: {raw}")))?,
        ),
        None => None,
    };

    let filter = TaskFilter {
        status,
        needs_review: params.get("needs_review").map(|v| v == "true" || v == "1"),
        implementation_id: params.get("implementation_id").cloned(),
        due_soon_hours: params
            .get("due_soon")
            .map(|v| v.parse::<i64>().map_err(|_| ApiError::validation("invalid due_soon")))
            .transpose()?,
        include_done: params
            .get("include_done")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false),
        limit: params.get("limit").and_then(|v| v.parse().ok()),
        offset: params.get("offset").and_then(|v| v.parse().ok()),
    };

    let tasks = store.list_tasks(&owner, &filter)?;
    Ok(Json(json!({ "tasks": tasks })))
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let store = state.store()?;

    let title = body
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::validation("title is required"))?;

    let new = NewTask {
        title: title.to_string(),
        description: string_field(&body, "description")?,
        implementation_id: string_field(&body, "implementation_id")?,
        project_id: string_field(&body, "project_id")?,
        status: parse_enum_field(&body, "status", TaskStatus::parse)?,
        task_type: parse_enum_field(&body, "task_type", TaskType::parse)?,
        priority_score: body.get("priority_score").and_then(Value::as_f64),
        estimated_minutes: minutes_field(&body, "estimated_minutes")?,
        estimate_source: parse_enum_field(&body, "estimate_source", EstimateSource::parse)?,
        due_at: datetime_field(&body, "due_at")?,
        needs_review: body
            .get("needs_review")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        blocker: body.get("blocker").and_then(Value::as_bool).unwrap_or(false),
        waiting_on: string_field(&body, "waiting_on")?,
        follow_up_at: datetime_field(&body, "follow_up_at")?,
        stakeholder_mentions: string_list_field(&body, "stakeholder_mentions"),
        source_type: string_field(&body, "source_type")?,
        source_url: string_field(&body, "source_url")?,
        inbox_item_id: None,
        pinned_excerpt: string_field(&body, "pinned_excerpt")?,
    };

    let task = store.create_task(&owner, &new)?;

    // Priority is recomputed on insert: deterministic boosts on top of the
    // submitted base.
    let ctx = ScoreContext::new(Utc::now(), DEFAULT_PRIORITY_STAKEHOLDERS);
    let boosts = intake_priority_boosts(
        &task.stakeholder_mentions,
        task.due_at_utc(),
        &task.title,
        task.status,
        &ctx,
    );
    let final_priority = clamp_f64(task.priority_score + boosts, 0.0, 100.0);
    store.set_task_priority(&owner, &task.id, final_priority)?;
    let task = store
        .get_task(&owner, &task.id)?
        .ok_or(ApiError::NotFound)?;

    Ok((StatusCode::CREATED, Json(json!({ "task": task }))).into_response())
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    let task = store.get_task(&owner, &id)?.ok_or(ApiError::NotFound)?;
    let checklist = store.list_checklist(&owner, &id)?;
    let dependencies = store.list_dependencies(&owner, &id)?;
    let blocked_by_dependencies = store.has_unresolved_dependencies(&owner, &id)?;
    Ok(Json(json!({
        "task": task,
        "checklist": checklist,
        "dependencies": dependencies,
        "blocked_by_dependencies": blocked_by_dependencies,
    })))
}

async fn patch_task(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    let before = store.get_task(&owner, &id)?.ok_or(ApiError::NotFound)?;

    let patch = TaskPatch {
        title: body
            .get("title")
            .and_then(Value::as_str)
            .map(str::trim)
            .map(|t| {
                if t.is_empty() {
                    Err(ApiError::validation("title must be non-empty"))
                } else {
                    Ok(t.to_string())
                }
            })
            .transpose()?,
        description: nullable_string_field(&body, "description")?,
        implementation_id: nullable_string_field(&body, "implementation_id")?,
        status: parse_enum_field(&body, "status", TaskStatus::parse)?,
        task_type: parse_enum_field(&body, "task_type", TaskType::parse)?,
        priority_score: body
            .get("priority_score")
            .and_then(Value::as_f64)
            .map(|p| clamp_f64(p, 0.0, 100.0)),
        estimated_minutes: minutes_field(&body, "estimated_minutes")?,
        estimate_source: parse_enum_field(&body, "estimate_source", EstimateSource::parse)?,
        due_at: nullable_datetime_field(&body, "due_at")?,
        needs_review: body.get("needs_review").and_then(Value::as_bool),
        blocker: body.get("blocker").and_then(Value::as_bool),
        waiting_on: nullable_string_field(&body, "waiting_on")?,
        follow_up_at: nullable_datetime_field(&body, "follow_up_at")?,
        pinned_excerpt: nullable_string_field(&body, "pinned_excerpt")?,
    };

    if patch.is_empty() {
        return Err(ApiError::validation("no recognized fields to update"));
    }

    let after = store
        .apply_task_patch(&owner, &id, &patch)?
        .ok_or(ApiError::NotFound)?;

    // Status or due-at movement recomputes the stored priority: subtract the
    // boosts the old state earned, add the new state's.
    let status_or_due_changed = before.status != after.status || before.due_at != after.due_at;
    let after = if status_or_due_changed && patch.priority_score.is_none() {
        let ctx = ScoreContext::new(Utc::now(), DEFAULT_PRIORITY_STAKEHOLDERS);
        let old_boosts = intake_priority_boosts(
            &before.stakeholder_mentions,
            before.due_at_utc(),
            &before.title,
            before.status,
            &ctx,
        );
        let new_boosts = intake_priority_boosts(
            &after.stakeholder_mentions,
            after.due_at_utc(),
            &after.title,
            after.status,
            &ctx,
        );
        let rescored = clamp_f64(after.priority_score - old_boosts + new_boosts, 0.0, 100.0);
        store.set_task_priority(&owner, &id, rescored)?;
        store.get_task(&owner, &id)?.ok_or(ApiError::NotFound)?
    } else {
        after
    };

    Ok(Json(json!({ "task": after })))
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    if !store.delete_task(&owner, &id)? {
        return Err(ApiError::NotFound);
    }
    Ok(Json(json!({ "deleted": true })))
}

// =========================================================================
// Dependencies
// =========================================================================

async fn list_dependencies(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    store.get_task(&owner, &id)?.ok_or(ApiError::NotFound)?;
    let dependencies = store.list_dependencies(&owner, &id)?;
    Ok(Json(json!({ "dependencies": dependencies })))
}

async fn create_dependency(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let store = state.store()?;
    store.get_task(&owner, &id)?.ok_or(ApiError::NotFound)?;

    let task_target = body.get("depends_on_task_id").and_then(Value::as_str);
    let commitment_target = body.get("depends_on_commitment_id").and_then(Value::as_str);

    let dependency = match (task_target, commitment_target) {
        (Some(_), Some(_)) | (None, None) => {
            return Err(ApiError::validation(
                "exactly one of depends_on_task_id or depends_on_commitment_id is required",
            ));
        }
        (Some(target), None) => {
            if target == id {
                return Err(ApiError::validation("a task cannot depend on itself"));
            }
            store.get_task(&owner, target)?.ok_or(ApiError::NotFound)?;
            match store.add_task_dependency(&owner, &id, target) {
                Ok(dep) => dep,
                Err(StoreError::Conflict(msg)) if msg.contains("circular") => {
                    return Err(ApiError::validation("Cannot create circular dependency"));
                }
                Err(e) => return Err(e.into()),
            }
        }
        (None, Some(target)) => {
            store
                .get_commitment(&owner, target)?
                .ok_or(ApiError::NotFound)?;
            store.add_commitment_dependency(&owner, &id, target)?
        }
    };

    Ok((StatusCode::CREATED, Json(json!({ "dependency": dependency }))).into_response())
}

async fn delete_dependency(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Path((id, dep_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    if !store.delete_dependency(&owner, &id, &dep_id)? {
        return Err(ApiError::NotFound);
    }
    Ok(Json(json!({ "deleted": true })))
}

// =========================================================================
// Checklist
// =========================================================================

async fn list_checklist(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    store.get_task(&owner, &id)?.ok_or(ApiError::NotFound)?;
    let items = store.list_checklist(&owner, &id)?;
    Ok(Json(json!({ "items": items })))
}

async fn add_checklist_item(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let store = state.store()?;
    store.get_task(&owner, &id)?.ok_or(ApiError::NotFound)?;

    let label = body
        .get("label")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| ApiError::validation("label is required"))?;
    let sort_order = body
        .get("sort_order")
        .and_then(Value::as_i64)
        .unwrap_or_else(|| {
            store
                .list_checklist(&owner, &id)
                .map(|items| items.len() as i64)
                .unwrap_or(0)
        });

    let item = store.add_checklist_item(&owner, &id, label, sort_order)?;
    Ok((StatusCode::CREATED, Json(json!({ "item": item }))).into_response())
}

async fn patch_checklist_item(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Path((id, item_id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    let label = body.get("label").and_then(Value::as_str);
    let done = body.get("done").and_then(Value::as_bool);
    if label.is_none() && done.is_none() {
        return Err(ApiError::validation("nothing to update"));
    }
    if !store.update_checklist_item(&owner, &id, &item_id, label, done)? {
        return Err(ApiError::NotFound);
    }
    Ok(Json(json!({ "updated": true })))
}

async fn delete_checklist_item(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Path((id, item_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    if !store.delete_checklist_item(&owner, &id, &item_id)? {
        return Err(ApiError::NotFound);
    }
    Ok(Json(json!({ "deleted": true })))
}

// =========================================================================
// Applications
// =========================================================================

async fn list_applications(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    let applications = store.list_applications(&owner)?;
    Ok(Json(json!({ "applications": applications })))
}

async fn create_application(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let store = state.store()?;
    let name = body
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::validation("name is required"))?;
    let phase = parse_enum_field(&body, "phase", Phase::parse)?.unwrap_or(Phase::Intake);
    let rag = parse_enum_field(&body, "rag", Rag::parse)?.unwrap_or(Rag::Green);

    let application = store.create_application(
        &owner,
        name,
        phase,
        rag,
        &string_list_field(&body, "stakeholders"),
        &string_list_field(&body, "keywords"),
    )?;
    Ok((StatusCode::CREATED, Json(json!({ "application": application }))).into_response())
}

async fn patch_application(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;

    let patch = ApplicationPatch {
        name: body
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(ToString::to_string),
        phase: parse_enum_field(&body, "phase", Phase::parse)?,
        rag: parse_enum_field(&body, "rag", Rag::parse)?,
        priority_weight: body.get("priority_weight").and_then(Value::as_f64),
        stakeholders: body
            .get("stakeholders")
            .map(|_| string_list_field(&body, "stakeholders")),
        keywords: body
            .get("keywords")
            .map(|_| string_list_field(&body, "keywords")),
        status_summary: nullable_string_field(&body, "status_summary")?,
        next_milestone: nullable_string_field(&body, "next_milestone")?,
        target_date: nullable_string_field(&body, "target_date")?,
    };

    let application = store
        .apply_application_patch(&owner, &id, &patch)?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(json!({ "application": application })))
}

async fn reorder_applications(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;

    let ordered_ids: Vec<String> = body
        .get("ordered_ids")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .ok_or_else(|| ApiError::validation("ordered_ids must be an array of ids"))?;

    let existing = store.list_applications(&owner)?;
    let mut expected: Vec<&str> = existing.iter().map(|a| a.id.as_str()).collect();
    let mut presented: Vec<&str> = ordered_ids.iter().map(String::as_str).collect();
    expected.sort_unstable();
    presented.sort_unstable();
    if expected != presented {
        return Err(ApiError::validation(
            "ordered_ids must be a permutation of the owner's applications",
        ));
    }

    let applications = store.reorder_applications(&owner, &ordered_ids)?;
    Ok(Json(json!({ "applications": applications })))
}

// =========================================================================
// Copy-update and status log
// =========================================================================

/// Teams-ready status snippet for an application.
fn build_status_snippet(app: &DbApplication, blocker_titles: &[String]) -> String {
    let summary = app
        .status_summary
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("Status update pending.");
    let summary = if summary.ends_with(['.', '!', '?']) {
        summary.to_string()
    } else {
        format!("{summary}.")
    };

    let milestone = app
        .next_milestone
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or("TBD");
    let next = match app.target_date.as_deref().filter(|d| !d.is_empty()) {
        Some(date) => format!("{milestone} ({date})"),
        None => milestone.to_string(),
    };

    let blockers = if blocker_titles.is_empty() {
        "None".to_string()
    } else {
        let mut joined = blocker_titles
            .iter()
            .take(STATUS_SNIPPET_BLOCKER_CAP)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("; ");
        if blocker_titles.len() > STATUS_SNIPPET_BLOCKER_CAP {
            joined.push_str("...");
        }
        joined
    };

    format!(
        "{} — {} ({}). {} Next: {}. Blocker(s): {}.",
        app.name,
        app.phase.display(),
        app.rag.display(),
        summary,
        next,
        blockers
    )
}

async fn copy_update(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Path(id): Path<String>,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    let app = store.get_application(&owner, &id)?.ok_or(ApiError::NotFound)?;

    let blockers: Vec<DbTask> = store
        .list_tasks(
            &owner,
            &TaskFilter {
                implementation_id: Some(id.clone()),
                ..TaskFilter::default()
            },
        )?
        .into_iter()
        .filter(|t| t.blocker)
        .collect();
    let blocker_titles: Vec<String> = blockers.iter().map(|t| t.title.clone()).collect();
    let related_task_ids: Vec<&str> = blockers.iter().map(|t| t.id.as_str()).collect();

    let snippet = build_status_snippet(&app, &blocker_titles);

    let save = body
        .as_ref()
        .and_then(|Json(b)| b.get("saveToLog"))
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let saved = if save {
        store.add_status_update(&owner, &id, &snippet)?;
        true
    } else {
        false
    };

    Ok(Json(json!({
        "snippet": snippet,
        "related_task_ids": related_task_ids,
        "saved": saved,
    })))
}

async fn list_status_updates(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    store.get_application(&owner, &id)?.ok_or(ApiError::NotFound)?;
    let limit = params
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(20);
    let updates = store.list_status_updates(&owner, &id, limit)?;
    Ok(Json(json!({ "status_updates": updates })))
}

// =========================================================================
// Commitments
// =========================================================================

async fn create_commitment(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let store = state.store()?;
    let stakeholder = body
        .get("stakeholder")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::validation("stakeholder is required"))?;
    let direction = body
        .get("direction")
        .and_then(Value::as_str)
        .unwrap_or("theirs");
    if !matches!(direction, "ours" | "theirs") {
        return Err(ApiError::validation("direction must be ours or theirs"));
    }

    let commitment = store.create_commitment(
        &owner,
        stakeholder,
        direction,
        body.get("description").and_then(Value::as_str),
        body.get("due_at").and_then(Value::as_str),
    )?;
    Ok((StatusCode::CREATED, Json(json!({ "commitment": commitment }))).into_response())
}

async fn patch_commitment(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    let status = body
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::validation("status is required"))?;
    if !matches!(status, "open" | "closed") {
        return Err(ApiError::validation("status must be open or closed"));
    }
    if !store.set_commitment_status(&owner, &id, status)? {
        return Err(ApiError::NotFound);
    }
    let commitment = store.get_commitment(&owner, &id)?.ok_or(ApiError::NotFound)?;
    Ok(Json(json!({ "commitment": commitment })))
}

// =========================================================================
// Focus directives
// =========================================================================

async fn list_focus(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    let include_history = params
        .get("include_history")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    let directives = store.list_directives(&owner, include_history)?;
    Ok(Json(json!({ "directives": directives })))
}

async fn create_focus(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let store = state.store()?;

    let directive_text = body
        .get("directive_text")
        .or_else(|| body.get("text"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::validation("directive_text is required"))?;
    let scope_type = body
        .get("scope_type")
        .and_then(Value::as_str)
        .and_then(FocusScope::parse)
        .ok_or_else(|| ApiError::validation("scope_type must be one of application, stakeholder, task_type, query"))?;
    let strength = body
        .get("strength")
        .and_then(Value::as_str)
        .and_then(DirectiveStrength::parse)
        .unwrap_or(DirectiveStrength::Nudge);

    let scope_id = body.get("scope_id").and_then(Value::as_str).map(str::trim);
    let scope_value = body
        .get("scope_value")
        .and_then(Value::as_str)
        .map(str::trim);

    match scope_type {
        FocusScope::Application => {
            let id = scope_id
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ApiError::validation("application scope requires scope_id"))?;
            store
                .get_application(&owner, id)?
                .ok_or_else(|| ApiError::validation("scope_id does not reference one of your applications"))?;
        }
        _ => {
            scope_value
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ApiError::validation("this scope requires a non-empty scope_value"))?;
        }
    }

    let starts_at = datetime_field(&body, "starts_at")?;
    let ends_at = datetime_field(&body, "ends_at")?;
    if let (Some(s), Some(e)) = (starts_at.as_deref(), ends_at.as_deref()) {
        let (s, e) = (parse_utc(s), parse_utc(e));
        if let (Some(s), Some(e)) = (s, e) {
            if e <= s {
                return Err(ApiError::validation("ends_at must be after starts_at"));
            }
        }
    }

    let directive = store.create_directive(
        &owner,
        &NewDirective {
            directive_text: directive_text.to_string(),
            scope_type,
            scope_id: scope_id.filter(|s| !s.is_empty()).map(ToString::to_string),
            scope_value: scope_value.filter(|v| !v.is_empty()).map(ToString::to_string),
            strength,
            starts_at,
            ends_at,
        },
    )?;
    Ok((StatusCode::CREATED, Json(json!({ "directive": directive }))).into_response())
}

async fn patch_focus(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;

    let patch = DirectivePatch {
        directive_text: body
            .get("directive_text")
            .or_else(|| body.get("text"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string),
        strength: body
            .get("strength")
            .and_then(Value::as_str)
            .and_then(DirectiveStrength::parse),
        is_active: body.get("is_active").and_then(Value::as_bool),
        starts_at: nullable_datetime_field(&body, "starts_at")?,
        ends_at: nullable_datetime_field(&body, "ends_at")?,
    };

    let directive = store
        .patch_directive(&owner, &id, &patch)?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(json!({ "directive": directive })))
}

async fn clear_focus(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    let cleared = store.clear_directives(&owner)?;
    Ok(Json(json!({ "cleared": cleared })))
}

// =========================================================================
// Planner
// =========================================================================

fn plan_request_from(params: &HashMap<String, String>, body: Option<&Value>) -> Result<PlanRequest, ApiError> {
    let raw_date = body
        .and_then(|b| {
            b.get("planDate")
                .or_else(|| b.get("plan_date"))
                .and_then(Value::as_str)
        })
        .map(ToString::to_string)
        .or_else(|| params.get("planDate").or_else(|| params.get("plan_date")).cloned());

    let plan_date = raw_date
        .map(|raw| {
            parse_date(&raw).ok_or_else(|| ApiError::validation(format!("invalid plan date: {raw}")))
        })
        .transpose()?;

    let mode = body
        .and_then(|b| b.get("mode").and_then(Value::as_str).map(ToString::to_string))
        .or_else(|| params.get("mode").cloned())
        .map(|raw| {
            PlanMode::parse(&raw).ok_or_else(|| ApiError::validation(format!("invalid mode: {raw}")))
        })
        .transpose()?
        .unwrap_or(PlanMode::Today);

    Ok(PlanRequest { plan_date, mode })
}

async fn plan_get(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    let request = plan_request_from(&params, None)?;
    let plan = planner::build_plan(&store, &owner, &state.workday_spec(), &request, Utc::now())?;
    Ok(Json(json!({ "plan": plan })))
}

async fn plan_post(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    let body = body.map(|Json(b)| b);
    let request = plan_request_from(&HashMap::new(), body.as_ref())?;
    let plan = planner::build_plan(&store, &owner, &state.workday_spec(), &request, Utc::now())?;
    Ok(Json(json!({ "plan": plan })))
}

// =========================================================================
// Calendar
// =========================================================================

async fn calendar_get(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    let range_start = params
        .get("rangeStart")
        .ok_or_else(|| ApiError::validation("rangeStart is required"))?;
    let range_end = params
        .get("rangeEnd")
        .ok_or_else(|| ApiError::validation("rangeEnd is required"))?;
    let (start, end) =
        calendar::normalize_range(range_start, range_end).map_err(ApiError::Validation)?;

    let result = calendar::query_range(
        &store,
        &owner,
        &state.workday_spec(),
        start,
        end,
        Utc::now(),
    )?;
    Ok(Json(serde_json::to_value(result).unwrap_or_default()))
}

async fn calendar_patch(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    let event_id = body
        .get("event_id")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::validation("event_id is required"))?;

    let context = match body.get("meeting_context") {
        None => return Err(ApiError::validation("meeting_context is required (string or null)")),
        Some(Value::Null) => None,
        Some(Value::String(s)) => {
            if s.chars().count() > MEETING_CONTEXT_MAX_CHARS {
                return Err(ApiError::validation(format!(
                    "meeting_context exceeds {MEETING_CONTEXT_MAX_CHARS} characters"
                )));
            }
            Some(s.as_str())
        }
        Some(_) => return Err(ApiError::validation("meeting_context must be a string or null")),
    };

    if !store.set_meeting_context(&owner, event_id, context)? {
        return Err(ApiError::NotFound);
    }
    Ok(Json(json!({ "updated": true })))
}

async fn calendar_ingest(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;

    let source = body
        .get("source")
        .and_then(Value::as_str)
        .and_then(CalendarSource::parse)
        .ok_or_else(|| ApiError::validation("source must be one of local, ical, graph"))?;
    let range_start = body
        .get("rangeStart")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::validation("rangeStart is required"))?;
    let range_end = body
        .get("rangeEnd")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::validation("rangeEnd is required"))?;
    let (start, end) =
        calendar::normalize_range(range_start, range_end).map_err(ApiError::Validation)?;

    let events = if let Some(ics) = body.get("ics").and_then(Value::as_str) {
        calendar::ical::parse_ics(ics)
    } else if let Some(raw) = body.get("events") {
        serde_json::from_value(raw.clone())
            .map_err(|e| ApiError::validation(format!("invalid events payload: {e}")))?
    } else {
        return Err(ApiError::validation("provide either events or ics"));
    };

    let summary = calendar::ingest_events(
        &store,
        &owner,
        source,
        &state.workday_spec(),
        start,
        end,
        &events,
    )?;
    Ok(Json(serde_json::to_value(summary).unwrap_or_default()))
}

// =========================================================================
// Intake
// =========================================================================

async fn intake_email(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let store = state.store()?;
    let payload: IntakePayload = serde_json::from_value(body)
        .map_err(|e| ApiError::validation(format!("invalid intake payload: {e}")))?;
    if payload.subject.trim().is_empty() && payload.message_id.is_none() {
        return Err(ApiError::validation("subject or message_id is required"));
    }

    match intake::process_email_intake(&store, &state.dispatcher, &owner, &payload).await {
        Ok(IntakeResult::Created {
            inbox_item_id,
            task_id,
            needs_review,
            checklist_items,
        }) => Ok((
            StatusCode::CREATED,
            Json(json!({
                "message": "Task created",
                "inbox_item_id": inbox_item_id,
                "task_id": task_id,
                "needs_review": needs_review,
                "checklist_items": checklist_items,
            })),
        )
            .into_response()),
        Ok(IntakeResult::Duplicate { inbox_item_id }) => Ok((
            StatusCode::OK,
            Json(json!({
                "message": "Duplicate email, already processed",
                "inbox_item_id": inbox_item_id,
            })),
        )
            .into_response()),
        Err(IntakeError::Extraction { inbox_item_id }) => Ok((
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "error": "Extraction failed",
                "inbox_item_id": inbox_item_id,
            })),
        )
            .into_response()),
        Err(IntakeError::Store(e)) => Err(e.into()),
    }
}

async fn intake_events(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    let inbox_item_id = params
        .get("inbox_item_id")
        .ok_or_else(|| ApiError::validation("inbox_item_id is required"))?;
    store
        .get_inbox_item(&owner, inbox_item_id)?
        .ok_or(ApiError::NotFound)?;
    let events = store.list_ingestion_events(&owner, inbox_item_id)?;
    Ok(Json(json!({ "events": events })))
}

// =========================================================================
// Briefing
// =========================================================================

async fn briefing_get(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    let date = params
        .get("date")
        .map(|raw| parse_date(raw).ok_or_else(|| ApiError::validation(format!("invalid date: {raw}"))))
        .transpose()?;
    let mode = params
        .get("mode")
        .map(|raw| {
            BriefingMode::parse(raw)
                .ok_or_else(|| ApiError::validation(format!("invalid mode: {raw}")))
        })
        .transpose()?
        .unwrap_or(BriefingMode::Auto);

    let briefing = briefing::compose_briefing(
        &store,
        &owner,
        &state.workday_spec(),
        mode,
        date,
        Utc::now(),
    )?;
    Ok(Json(serde_json::to_value(briefing).unwrap_or_default()))
}

async fn briefing_narrative(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    let briefing_value = body
        .get("briefing")
        .cloned()
        .ok_or_else(|| ApiError::validation("briefing payload is required"))?;
    let briefing: briefing::Briefing = serde_json::from_value(briefing_value)
        .map_err(|e| ApiError::validation(format!("invalid briefing payload: {e}")))?;

    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let (text, meta) = narrative::narrative_for_briefing(
        &store,
        &state.dispatcher,
        &state.narrative_cache,
        &owner,
        &briefing,
        now_ms,
    )
    .await;

    Ok(Json(json!({
        "mode": briefing.mode,
        "narrative": text,
        "llm": meta,
    })))
}

// =========================================================================
// LLM admin
// =========================================================================

async fn llm_catalog(
    State(state): State<Arc<AppState>>,
    AuthedOwner(_owner): AuthedOwner,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    let models = store.list_catalog_models(true)?;
    Ok(Json(json!({ "models": models })))
}

async fn llm_preferences_get(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    let prefs = store.list_model_preferences(&owner)?;
    let prefs: Vec<Value> = prefs
        .into_iter()
        .map(|(feature, catalog_id)| json!({ "feature": feature, "catalog_id": catalog_id }))
        .collect();
    Ok(Json(json!({ "preferences": prefs })))
}

async fn llm_preferences_put(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    let feature = body
        .get("feature")
        .and_then(Value::as_str)
        .and_then(LlmFeature::parse)
        .ok_or_else(|| {
            ApiError::validation(
                "feature must be one of global_default, briefing_narrative, intake_extraction",
            )
        })?;

    let catalog_id = match body.get("catalog_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) => {
            let row = store
                .get_catalog_model(id)?
                .ok_or_else(|| ApiError::validation("unknown catalog_id"))?;
            if !row.enabled {
                return Err(ApiError::validation("catalog model is disabled"));
            }
            Some(id.clone())
        }
        Some(_) => return Err(ApiError::validation("catalog_id must be a string or null")),
    };

    store.set_model_preference(&owner, feature.as_str(), catalog_id.as_deref())?;
    Ok(Json(json!({ "feature": feature, "catalog_id": catalog_id })))
}

async fn llm_usage(
    State(state): State<Arc<AppState>>,
    AuthedOwner(owner): AuthedOwner,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store()?;
    let limit = params
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(50)
        .min(500);
    let events = store.list_usage_events(&owner, limit)?;
    Ok(Json(json!({ "events": events })))
}

// =========================================================================
// Body-field helpers
// =========================================================================

/// Absent → None. Present string → Some(trimmed). Null/other → error-free None.
fn string_field(body: &Value, key: &str) -> Result<Option<String>, ApiError> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string()).filter(|s| !s.is_empty())),
        Some(_) => Err(ApiError::validation(format!("{key} must be a string"))),
    }
}

/// Absent → None (leave alone). Null → Some(None) (clear). String → set.
fn nullable_string_field(body: &Value, key: &str) -> Result<Option<Option<String>>, ApiError> {
    match body.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(Value::String(s)) => Ok(Some(Some(s.trim().to_string()))),
        Some(_) => Err(ApiError::validation(format!("{key} must be a string or null"))),
    }
}

fn datetime_field(body: &Value, key: &str) -> Result<Option<String>, ApiError> {
    match string_field(body, key)? {
        None => Ok(None),
        Some(raw) => {
            let parsed = parse_utc(&raw)
                .ok_or_else(|| ApiError::validation(format!("{key} must be ISO-8601")))?;
            Ok(Some(parsed.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)))
        }
    }
}

fn nullable_datetime_field(body: &Value, key: &str) -> Result<Option<Option<String>>, ApiError> {
    match body.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(Value::String(raw)) => {
            let parsed = parse_utc(raw)
                .ok_or_else(|| ApiError::validation(format!("{key} must be ISO-8601 or null")))?;
            Ok(Some(Some(
                parsed.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            )))
        }
        Some(_) => Err(ApiError::validation(format!("{key} must be a string or null"))),
    }
}

fn minutes_field(body: &Value, key: &str) -> Result<Option<u32>, ApiError> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            let minutes = value
                .as_u64()
                .filter(|m| (1..=480).contains(m))
                .ok_or_else(|| {
                    ApiError::validation(format!("{key} must be an integer between 1 and 480"))
                })?;
            Ok(Some(minutes as u32))
        }
    }
}

fn parse_enum_field<T>(
    body: &Value,
    key: &str,
    parse: fn(&str) -> Option<T>,
) -> Result<Option<T>, ApiError> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => parse(raw)
            .map(Some)
            .ok_or_else(|| ApiError::validation(format!("invalid {key}: {raw}"))),
        Some(_) => Err(ApiError::validation(format!("{key} must be a string"))),
    }
}

fn string_list_field(body: &Value, key: &str) -> Vec<String> {
    body.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::MockProvider;
    use crate::llm::Provider;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    fn test_state_with(dispatcher: LlmDispatcher) -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        Store::open_and_migrate(&db_path).unwrap();

        let mut config = Config::for_tests();
        config.db_path = db_path;
        (Arc::new(AppState::new(config, dispatcher)), dir)
    }

    fn test_state() -> (Arc<AppState>, tempfile::TempDir) {
        test_state_with(LlmDispatcher::empty())
    }

    fn request(method: &str, path: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(path)
            .header(auth::API_KEY_HEADER, "test-key");
        match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(state: &Arc<AppState>, req: Request<Body>) -> (StatusCode, Value) {
        let response = router(state.clone()).oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn admission_is_required() {
        let (state, _dir) = test_state();
        let req = Request::builder()
            .method("GET")
            .uri("/tasks")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn owner_scoped_miss_is_404_not_403() {
        let (state, _dir) = test_state();
        // Seed a task under a different owner via a session.
        {
            let store = state.store().unwrap();
            store.create_session("other-session", "other-owner").unwrap();
            store
                .create_task(
                    "other-owner",
                    &NewTask {
                        title: "foreign".into(),
                        ..NewTask::default()
                    },
                )
                .unwrap();
        }
        let foreign_id = {
            let store = state.store().unwrap();
            store.open_tasks("other-owner", 10).unwrap()[0].id.clone()
        };

        let (status, body) = send(&state, request("GET", &format!("/tasks/{foreign_id}"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.get("error").is_some());
    }

    #[tokio::test]
    async fn task_create_recomputes_priority_and_lists() {
        let (state, _dir) = test_state();
        let due_soon = (Utc::now() + chrono::Duration::hours(6)).to_rfc3339();
        let (status, body) = send(
            &state,
            request(
                "POST",
                "/tasks",
                Some(json!({
                    "title": "Call Nancy about cutover",
                    "status": "planned",
                    "priority_score": 50,
                    "due_at": due_soon,
                    "stakeholder_mentions": ["Nancy"],
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        // 50 base + 15 urgency + 10 stakeholder = 75.
        let score = body["task"]["priorityScore"].as_f64().unwrap();
        assert_eq!(score, 75.0);

        let (status, body) = send(&state, request("GET", "/tasks", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tasks"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn patch_title_requires_content() {
        let (state, _dir) = test_state();
        let (_, created) = send(
            &state,
            request("POST", "/tasks", Some(json!({ "title": "ok" }))),
        )
        .await;
        let id = created["task"]["id"].as_str().unwrap().to_string();

        let (status, _) = send(
            &state,
            request("PATCH", &format!("/tasks/{id}"), Some(json!({ "title": "  " }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn dependency_cycle_returns_400() {
        let (state, _dir) = test_state();
        let (_, t1) = send(&state, request("POST", "/tasks", Some(json!({ "title": "T1" })))).await;
        let (_, t2) = send(&state, request("POST", "/tasks", Some(json!({ "title": "T2" })))).await;
        let id1 = t1["task"]["id"].as_str().unwrap().to_string();
        let id2 = t2["task"]["id"].as_str().unwrap().to_string();

        let (status, _) = send(
            &state,
            request(
                "POST",
                &format!("/tasks/{id1}/dependencies"),
                Some(json!({ "depends_on_task_id": id2 })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        // Duplicate → 409.
        let (status, _) = send(
            &state,
            request(
                "POST",
                &format!("/tasks/{id1}/dependencies"),
                Some(json!({ "depends_on_task_id": id2 })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        // Cycle → 400 with the canonical message.
        let (status, body) = send(
            &state,
            request(
                "POST",
                &format!("/tasks/{id2}/dependencies"),
                Some(json!({ "depends_on_task_id": id1 })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Cannot create circular dependency");

        // Self-dependency → 400.
        let (status, _) = send(
            &state,
            request(
                "POST",
                &format!("/tasks/{id1}/dependencies"),
                Some(json!({ "depends_on_task_id": id1 })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reorder_sets_ranks_and_weights() {
        let (state, _dir) = test_state();
        let mut ids = HashMap::new();
        for name in ["P", "Q", "R", "S"] {
            let (_, body) = send(
                &state,
                request("POST", "/applications", Some(json!({ "name": name }))),
            )
            .await;
            ids.insert(name, body["application"]["id"].as_str().unwrap().to_string());
        }

        let ordered = json!({ "ordered_ids": [ids["S"], ids["P"], ids["R"], ids["Q"]] });
        let (status, body) = send(&state, request("POST", "/applications/reorder", Some(ordered))).await;
        assert_eq!(status, StatusCode::OK);

        let apps = body["applications"].as_array().unwrap();
        let find = |id: &str| {
            apps.iter()
                .find(|a| a["id"].as_str() == Some(id))
                .unwrap()
                .clone()
        };
        assert_eq!(find(&ids["S"])["portfolioRank"], 1);
        assert_eq!(find(&ids["S"])["priorityWeight"], 10.0);
        assert_eq!(find(&ids["P"])["priorityWeight"], 7.0);
        assert_eq!(find(&ids["R"])["priorityWeight"], 3.0);
        assert_eq!(find(&ids["Q"])["priorityWeight"], 0.0);

        // Not a permutation → 400.
        let bad = json!({ "ordered_ids": [ids["S"], ids["P"]] });
        let (status, _) = send(&state, request("POST", "/applications/reorder", Some(bad))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn copy_update_produces_snippet_shape() {
        let (state, _dir) = test_state();
        let (_, app) = send(
            &state,
            request("POST", "/applications", Some(json!({ "name": "Workday" }))),
        )
        .await;
        let app_id = app["application"]["id"].as_str().unwrap().to_string();
        send(
            &state,
            request(
                "PATCH",
                &format!("/applications/{app_id}"),
                Some(json!({
                    "phase": "go_live",
                    "rag": "yellow",
                    "status_summary": "UAT exit pending",
                    "next_milestone": "Cutover rehearsal",
                    "target_date": "2026-04-01",
                })),
            ),
        )
        .await;

        let (status, body) = send(
            &state,
            request(
                "POST",
                &format!("/implementations/{app_id}/copy-update"),
                Some(json!({ "saveToLog": true })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["snippet"],
            "Workday — Go-Live (Yellow). UAT exit pending. Next: Cutover rehearsal (2026-04-01). Blocker(s): None."
        );
        assert_eq!(body["saved"], true);

        let (_, log) = send(
            &state,
            request(
                "GET",
                &format!("/implementations/{app_id}/status-updates"),
                None,
            ),
        )
        .await;
        assert_eq!(log["status_updates"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn intake_dedupe_round_trip() {
        let extraction = json!({
            "title": "Fix payroll mapping",
            "confidence": 0.9,
            "needs_review": false,
            "stakeholder_mentions": [],
            "suggested_checklist": []
        })
        .to_string();
        let dispatcher = LlmDispatcher::empty().with_provider(
            Provider::Openai,
            MockProvider::new(vec![
                Ok(crate::llm::ProviderResponse {
                    text: extraction.clone(),
                    input_tokens: Some(10),
                    output_tokens: Some(10),
                }),
                Ok(crate::llm::ProviderResponse {
                    text: extraction,
                    input_tokens: Some(10),
                    output_tokens: Some(10),
                }),
            ]),
        );
        let (state, _dir) = test_state_with(dispatcher);

        let payload = json!({
            "subject": "Payroll cutover",
            "from_email": "nancy@client.example",
            "received_at": "2026-03-02T14:00:00Z",
            "message_id": "<abc@x>",
        });

        let (status, first) = send(
            &state,
            request("POST", "/intake/email", Some(payload.clone())),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let inbox_id = first["inbox_item_id"].as_str().unwrap().to_string();

        let (status, second) = send(&state, request("POST", "/intake/email", Some(payload))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["message"], "Duplicate email, already processed");
        assert_eq!(second["inbox_item_id"], inbox_id.as_str());
    }

    #[tokio::test]
    async fn narrative_rejects_bulleted_output() {
        let dispatcher = LlmDispatcher::empty().with_provider(
            Provider::Anthropic,
            MockProvider::replying("- point one\n- point two\n- point three"),
        );
        let (state, _dir) = test_state_with(dispatcher);

        // Compose a briefing through the API, then feed it back.
        let (status, briefing) = send(
            &state,
            request("GET", "/briefing?date=2026-03-02&mode=morning", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &state,
            request("POST", "/briefing/narrative", Some(json!({ "briefing": briefing }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["narrative"], "");
        assert!(body["llm"].is_null());
    }

    #[tokio::test]
    async fn narrative_requires_briefing_payload() {
        let (state, _dir) = test_state();
        let (status, _) = send(
            &state,
            request("POST", "/briefing/narrative", Some(json!({ "nope": 1 }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn planner_plan_round_trips_over_http() {
        let (state, _dir) = test_state();
        send(
            &state,
            request("POST", "/tasks", Some(json!({ "title": "only task" }))),
        )
        .await;

        let (status, body) = send(&state, request("GET", "/planner/plan", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["plan"]["queue"].as_array().unwrap().len(), 1);
        assert_eq!(body["plan"]["persisted"]["saved"], true);
        assert!(body["plan"]["exceptions"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn calendar_requires_valid_range() {
        let (state, _dir) = test_state();
        let (status, _) = send(
            &state,
            request(
                "GET",
                "/calendar?rangeStart=2026-03-05&rangeEnd=2026-03-02",
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &state,
            request(
                "GET",
                "/calendar?rangeStart=2026-03-02&rangeEnd=2026-03-02",
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
}
