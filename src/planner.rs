//! Planner: rank every open task into a now/next/queue/exceptions plan.
//!
//! Scoring is one pass over the owner's non-terminal tasks (capped), pure
//! arithmetic per task, then a sort. Everything that influenced a score is
//! emitted in the reasons payload so a plan can be audited offline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;

use crate::calendar::WorkdaySpec;
use crate::config::DEFAULT_PRIORITY_STAKEHOLDERS;
use crate::db::{DbFocusDirective, DbTask, Store, StoreError};
use crate::priority::{
    implementation_multiplier, score_task, ScoreBreakdown, ScoreContext, ScoreInput,
    NEXT_WINDOW_MINUTES,
};
use crate::types::{FocusScope, TaskStatus, TaskType};

pub const PLANNER_SOURCE: &str = "planner_v1.1";

const TASK_CAP: u32 = 1000;
const QUEUE_CAP: usize = 50;
const EXCEPTIONS_CAP: usize = 10;
const NEXT_COUNT: usize = 3;

/// Window-fit bonus/penalty against the 60-minute next window.
const FIT_BONUS: f64 = 5.0;
const FIT_PENALTY: f64 = -10.0;

const DEFAULT_PRIORITY_WEIGHT: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    Today,
    Now,
}

impl PlanMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "today" => Some(Self::Today),
            "now" => Some(Self::Now),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanRequest {
    /// Defaults to today in the workday timezone.
    pub plan_date: Option<NaiveDate>,
    pub mode: PlanMode,
}

impl Default for PlanRequest {
    fn default() -> Self {
        Self {
            plan_date: None,
            mode: PlanMode::Today,
        }
    }
}

/// One ranked task on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEntry {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub task_type: TaskType,
    pub implementation_id: Option<String>,
    pub due_at: Option<String>,
    pub estimated_minutes: u32,
    pub suggested_minutes: u32,
    /// deep ≥ 45, shallow ≥ 20, else prep.
    pub mode_label: &'static str,
    pub final_score: f64,
    pub directive_match: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub rank: usize,
    #[serde(flatten)]
    pub entry: PlanEntry,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionEntry {
    pub task_id: String,
    pub title: String,
    pub reason: &'static str,
    pub final_score: f64,
}

/// The planner is window-capable but emits a single stub window today;
/// concrete window selection arrives with calendar-driven planning.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanWindow {
    pub minutes: u32,
    pub label: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Persisted {
    pub saved: bool,
    pub plan_id: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOutput {
    pub plan_date: String,
    pub mode: PlanMode,
    pub source: &'static str,
    pub now_next: Option<PlanEntry>,
    pub next3: Vec<PlanEntry>,
    pub queue: Vec<QueueEntry>,
    pub windows: Vec<PlanWindow>,
    pub exceptions: Vec<ExceptionEntry>,
    pub inputs_snapshot: serde_json::Value,
    pub persisted: Persisted,
}

struct Scored {
    task: DbTask,
    breakdown: ScoreBreakdown,
    directive_match: bool,
    implementation_multiplier: f64,
    directive_multiplier: f64,
}

/// Directive matching rules. `query` scope is reserved and never matches.
fn directive_matches(directive: &DbFocusDirective, task: &DbTask) -> bool {
    match directive.scope_type {
        FocusScope::Application => {
            directive.scope_id.is_some() && directive.scope_id == task.implementation_id
        }
        FocusScope::Stakeholder => {
            let Some(value) = directive.scope_value.as_deref() else {
                return false;
            };
            let needle = value.to_lowercase();
            task.stakeholder_mentions
                .iter()
                .any(|m| m.to_lowercase().contains(&needle))
        }
        FocusScope::TaskType => directive
            .scope_value
            .as_deref()
            .and_then(TaskType::parse)
            .is_some_and(|t| t == task.task_type),
        FocusScope::Query => false,
    }
}

/// Build (and best-effort persist) the plan for one owner.
pub fn build_plan(
    store: &Store,
    owner_id: &str,
    spec: &WorkdaySpec,
    request: &PlanRequest,
    now: DateTime<Utc>,
) -> Result<PlanOutput, StoreError> {
    let plan_date = request
        .plan_date
        .unwrap_or_else(|| spec.local_date(now))
        .to_string();

    // 1. Working set.
    let tasks = store.open_tasks(owner_id, TASK_CAP)?;

    // 2. Portfolio weights; a missing column/table ranks everything at the
    //    default weight instead of failing the plan.
    let (weights, weights_note) = match store.application_weight_map(owner_id) {
        Ok(map) => (map, None),
        Err(e) if e.is_missing_relation() => {
            tracing::warn!("planner ranking without priority_weight: {e}");
            (Default::default(), Some("ranked without priority_weight"))
        }
        Err(e) => return Err(e),
    };

    // 3. Active directive, gated by its window.
    let directive = store
        .active_directive(owner_id)?
        .filter(|d| d.window_admits(now));

    // 4–5. Score and sort.
    let mut scored: Vec<Scored> = tasks
        .into_iter()
        .map(|task| {
            let weight = task
                .implementation_id
                .as_deref()
                .and_then(|id| weights.get(id).copied())
                .unwrap_or(DEFAULT_PRIORITY_WEIGHT);
            let imp_mult = implementation_multiplier(weight);

            let (matched, dir_mult) = match directive.as_ref() {
                None => (false, 1.0),
                Some(d) => {
                    let matched = directive_matches(d, &task);
                    let (match_mult, non_match_mult) = d.strength.multipliers();
                    (matched, if matched { match_mult } else { non_match_mult })
                }
            };

            let fit_bonus = if task.estimated_minutes <= NEXT_WINDOW_MINUTES {
                FIT_BONUS
            } else {
                FIT_PENALTY
            };

            let mut ctx = ScoreContext::new(now, DEFAULT_PRIORITY_STAKEHOLDERS);
            ctx.fit_bonus = fit_bonus;
            ctx.implementation_multiplier = imp_mult;
            ctx.directive_multiplier = dir_mult;

            let input = ScoreInput {
                priority_score_base: task.priority_score,
                due_at: task.due_at_utc(),
                follow_up_at: task.follow_up_at_utc(),
                blocker: task.blocker,
                status: task.status,
                updated_at: task.updated_at_utc(),
                stakeholder_mentions: &task.stakeholder_mentions,
            };
            let breakdown = score_task(&input, &ctx);

            Scored {
                task,
                breakdown,
                directive_match: matched,
                implementation_multiplier: imp_mult,
                directive_multiplier: dir_mult,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.breakdown
            .final_score
            .partial_cmp(&a.breakdown.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| compare_due(a.task.due_at_utc(), b.task.due_at_utc()))
            .then_with(|| a.task.title.cmp(&b.task.title))
    });

    // 6. now/next and friends.
    let now_next_idx = scored
        .iter()
        .position(|s| s.task.estimated_minutes <= NEXT_WINDOW_MINUTES)
        .or(if scored.is_empty() { None } else { Some(0) });

    let now_next = now_next_idx.map(|i| plan_entry(&scored[i]));
    let next3: Vec<PlanEntry> = scored
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != now_next_idx)
        .take(NEXT_COUNT)
        .map(|(_, s)| plan_entry(s))
        .collect();

    let queue: Vec<QueueEntry> = scored
        .iter()
        .take(QUEUE_CAP)
        .enumerate()
        .map(|(rank, s)| QueueEntry {
            rank: rank + 1,
            entry: plan_entry(s),
        })
        .collect();

    let windows = vec![PlanWindow {
        minutes: NEXT_WINDOW_MINUTES,
        label: "next",
    }];

    // 7. Exceptions exist only under an active directive.
    let exceptions: Vec<ExceptionEntry> = match directive.as_ref() {
        None => Vec::new(),
        Some(_) => scored
            .iter()
            .filter(|s| !s.directive_match)
            .filter(|s| exception_eligible(s, now))
            .take(EXCEPTIONS_CAP)
            .map(|s| ExceptionEntry {
                task_id: s.task.id.clone(),
                title: s.task.title.clone(),
                reason: if s.task.blocker && s.breakdown.follow_up_due {
                    "Blocked and follow-up is due"
                } else {
                    "Due within 24 hours"
                },
                final_score: s.breakdown.final_score,
            })
            .collect(),
    };

    // 9. Snapshot + best-effort persistence.
    let inputs_snapshot = json!({
        "now": now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "taskCount": scored.len(),
        "priorityStakeholders": DEFAULT_PRIORITY_STAKEHOLDERS,
        "directive": directive.as_ref().map(|d| json!({
            "id": d.id,
            "scopeType": d.scope_type,
            "scopeId": d.scope_id,
            "scopeValue": d.scope_value,
            "strength": d.strength,
        })),
        "note": weights_note,
    });

    let reasons: serde_json::Value = scored
        .iter()
        .map(|s| {
            (
                s.task.id.clone(),
                json!({
                    "breakdown": s.breakdown,
                    "implementationMultiplier": s.implementation_multiplier,
                    "directiveMultiplier": s.directive_multiplier,
                    "directiveMatch": s.directive_match,
                }),
            )
        })
        .collect::<serde_json::Map<String, serde_json::Value>>()
        .into();

    let mut output = PlanOutput {
        plan_date: plan_date.clone(),
        mode: request.mode,
        source: PLANNER_SOURCE,
        now_next,
        next3,
        queue,
        windows,
        exceptions,
        inputs_snapshot: inputs_snapshot.clone(),
        persisted: Persisted {
            saved: false,
            plan_id: None,
            note: None,
        },
    };

    let plan_json = serde_json::to_string(&json!({
        "nowNext": output.now_next,
        "next3": output.next3,
        "queue": output.queue,
        "windows": output.windows,
        "exceptions": output.exceptions,
    }))
    .unwrap_or_else(|_| "{}".to_string());
    let reasons_json = serde_json::to_string(&reasons).unwrap_or_else(|_| "{}".to_string());
    let snapshot_json =
        serde_json::to_string(&inputs_snapshot).unwrap_or_else(|_| "{}".to_string());

    match store.insert_plan(
        owner_id,
        &plan_date,
        PLANNER_SOURCE,
        &snapshot_json,
        &plan_json,
        &reasons_json,
    ) {
        Ok(plan) => {
            output.persisted = Persisted {
                saved: true,
                plan_id: Some(plan.id),
                note: None,
            };
        }
        Err(e) if e.is_missing_relation() => {
            tracing::warn!("plan persistence degraded: {e}");
            output.persisted = Persisted {
                saved: false,
                plan_id: None,
                note: Some(e.to_string()),
            };
        }
        Err(e) => return Err(e),
    }

    Ok(output)
}

fn exception_eligible(scored: &Scored, now: DateTime<Utc>) -> bool {
    let due_soon = scored
        .task
        .due_at_utc()
        .is_some_and(|due| due <= now + chrono::Duration::hours(24));
    due_soon || (scored.task.blocker && scored.breakdown.follow_up_due)
}

fn compare_due(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> std::cmp::Ordering {
    // Earlier dates rank higher. Missing dates rank last.
    match (a, b) {
        (Some(da), Some(db)) => da.cmp(&db),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
}

fn plan_entry(scored: &Scored) -> PlanEntry {
    let minutes = scored.task.estimated_minutes;
    PlanEntry {
        task_id: scored.task.id.clone(),
        title: scored.task.title.clone(),
        status: scored.task.status,
        task_type: scored.task.task_type,
        implementation_id: scored.task.implementation_id.clone(),
        due_at: scored.task.due_at.clone(),
        estimated_minutes: minutes,
        suggested_minutes: minutes.min(NEXT_WINDOW_MINUTES),
        mode_label: if minutes >= 45 {
            "deep"
        } else if minutes >= 20 {
            "shallow"
        } else {
            "prep"
        },
        final_score: scored.breakdown.final_score,
        directive_match: scored.directive_match,
    }
}
