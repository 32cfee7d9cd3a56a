//! Daily briefing composer.
//!
//! Deterministic aggregation of calendar windows, task partitions, progress
//! and capacity for today, plus tomorrow's prep picture at end of day.
//! The LLM narrative on top lives in [`narrative`] and is strictly optional:
//! the briefing is complete without it.

pub mod narrative;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::{build_day, DayCalendar, WorkdaySpec};
use crate::db::{DbCalendarEvent, DbTask, Store, StoreError};
use crate::types::{Rag, TaskStatus, TaskType};
use crate::util::title_tokens;

const LUNCH_MINUTES: i64 = 30;
const OVERHEAD_MINUTES: i64 = 30;
const PER_TASK_BUFFER_MINUTES: i64 = 5;

/// Rolled-over threshold: open tasks at or above this priority stay on the
/// radar for tomorrow even without a due date.
const ROLLOVER_PRIORITY: f64 = 70.0;

/// Rule-3 prep detection: big tasks due tomorrow.
const PREP_BIG_TASK_MINUTES: u32 = 60;

/// Minimum share of a task's tokens that must appear in an event title for
/// a title match.
const TITLE_MATCH_RATIO: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BriefingMode {
    Morning,
    Midday,
    Eod,
    Auto,
}

impl BriefingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "morning" => Some(Self::Morning),
            "midday" => Some(Self::Midday),
            "eod" => Some(Self::Eod),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Morning => "morning",
            Self::Midday => "midday",
            Self::Eod => "eod",
            Self::Auto => "auto",
        }
    }
}

/// `auto` resolution by local hour: morning before 12, midday 12–14,
/// eod from 15.
pub fn auto_mode_for_hour(hour: u32) -> BriefingMode {
    if hour < 12 {
        BriefingMode::Morning
    } else if hour <= 14 {
        BriefingMode::Midday
    } else {
        BriefingMode::Eod
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub estimated_minutes: u32,
    pub due_at: Option<String>,
    pub priority_score: f64,
}

impl TaskSummary {
    fn from_task(task: &DbTask) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            status: task.status,
            estimated_minutes: task.estimated_minutes,
            due_at: task.due_at.clone(),
            priority_score: task.priority_score,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub completed_count: usize,
    pub total_count: usize,
    pub completed_minutes: u32,
    pub remaining_minutes: u32,
    pub percent_complete: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capacity {
    pub available_minutes: i64,
    pub required_minutes: i64,
    pub rag: Rag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    pub title: String,
    pub start_at: String,
    pub end_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodayBriefing {
    pub calendar: DayCalendar,
    pub meetings: Vec<EventSummary>,
    pub planned: Vec<TaskSummary>,
    pub completed: Vec<TaskSummary>,
    pub remaining: Vec<TaskSummary>,
    pub progress: Progress,
    pub capacity: Capacity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepTask {
    pub task_id: String,
    pub title: String,
    pub reason: String,
    pub matched_event_title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TomorrowBriefing {
    pub calendar: DayCalendar,
    pub meetings: Vec<EventSummary>,
    pub prep_tasks: Vec<PrepTask>,
    pub rolled_over: Vec<TaskSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Briefing {
    pub requested_date: String,
    pub mode: BriefingMode,
    pub auto_detected_mode: BriefingMode,
    pub current_time_et: String,
    pub today: TodayBriefing,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tomorrow: Option<TomorrowBriefing>,
}

/// Compose the briefing for `date` (default: today in the workday tz).
pub fn compose_briefing(
    store: &Store,
    owner_id: &str,
    spec: &WorkdaySpec,
    requested_mode: BriefingMode,
    date: Option<NaiveDate>,
    now: DateTime<Utc>,
) -> Result<Briefing, StoreError> {
    let local_now = now.with_timezone(&spec.tz);
    let date = date.unwrap_or_else(|| local_now.date_naive());

    let auto_detected = auto_mode_for_hour(local_now.hour());
    let mode = match requested_mode {
        BriefingMode::Auto => auto_detected,
        explicit => explicit,
    };

    let today = compose_today(store, owner_id, spec, date, now)?;
    let tomorrow = if mode == BriefingMode::Eod {
        Some(compose_tomorrow(store, owner_id, spec, date, now)?)
    } else {
        None
    };

    Ok(Briefing {
        requested_date: date.to_string(),
        mode,
        auto_detected_mode: auto_detected,
        current_time_et: local_now.format("%H:%M").to_string(),
        today,
        tomorrow,
    })
}

fn day_bounds(spec: &WorkdaySpec, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = spec
        .tz
        .from_local_datetime(&date.and_time(NaiveTime::MIN))
        .earliest()
        .map(|dt| dt.to_utc())
        .unwrap_or_else(Utc::now);
    (start, start + Duration::days(1))
}

fn load_day(
    store: &Store,
    owner_id: &str,
    spec: &WorkdaySpec,
    date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<(DayCalendar, Vec<DbCalendarEvent>), StoreError> {
    let (day_start, day_end) = day_bounds(spec, date);
    let events = store.list_events_between(
        owner_id,
        &day_start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        &day_end.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    )?;

    let intervals: Vec<(DateTime<Utc>, DateTime<Utc>)> = events
        .iter()
        .filter(|e| !e.is_all_day)
        .filter_map(|e| Some((e.start_at_utc()?, e.end_at_utc()?)))
        .collect();
    let today_now = (spec.local_date(now) == date).then_some(now);

    Ok((build_day(spec, date, &intervals, today_now), events))
}

fn event_summaries(events: &[DbCalendarEvent]) -> Vec<EventSummary> {
    events
        .iter()
        .filter(|e| !e.is_all_day)
        .map(|e| EventSummary {
            title: e.title.clone(),
            start_at: e.start_at.clone(),
            end_at: e.end_at.clone(),
        })
        .collect()
}

fn compose_today(
    store: &Store,
    owner_id: &str,
    spec: &WorkdaySpec,
    date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<TodayBriefing, StoreError> {
    let (calendar, events) = load_day(store, owner_id, spec, date, now)?;

    let (day_start, day_end) = day_bounds(spec, date);
    let open = store.open_tasks(owner_id, 1000)?;
    let completed_tasks = store.done_tasks_updated_between(
        owner_id,
        &day_start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        &day_end.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    )?;

    let planned: Vec<TaskSummary> = open
        .iter()
        .filter(|t| matches!(t.status, TaskStatus::Planned | TaskStatus::InProgress))
        .map(TaskSummary::from_task)
        .collect();
    let remaining: Vec<TaskSummary> = open.iter().map(TaskSummary::from_task).collect();
    let completed: Vec<TaskSummary> =
        completed_tasks.iter().map(TaskSummary::from_task).collect();

    let completed_minutes: u32 = completed.iter().map(|t| t.estimated_minutes).sum();
    let remaining_minutes: u32 = remaining.iter().map(|t| t.estimated_minutes).sum();
    let percent_complete = if completed_minutes + remaining_minutes == 0 {
        0
    } else {
        (100.0 * completed_minutes as f64 / (completed_minutes + remaining_minutes) as f64).round()
            as u32
    };

    let progress = Progress {
        completed_count: completed.len(),
        total_count: completed.len() + remaining.len(),
        completed_minutes,
        remaining_minutes,
        percent_complete,
    };

    let workday_minutes = (spec.focus_end - spec.focus_start).num_minutes();
    let available_minutes =
        (workday_minutes - LUNCH_MINUTES - OVERHEAD_MINUTES - calendar.busy_minutes).max(0);
    let required_minutes =
        remaining_minutes as i64 + PER_TASK_BUFFER_MINUTES * remaining.len() as i64;

    let rag = if (required_minutes as f64) <= 0.8 * available_minutes as f64 {
        Rag::Green
    } else if (required_minutes as f64) <= 1.1 * available_minutes as f64 {
        Rag::Yellow
    } else {
        Rag::Red
    };

    Ok(TodayBriefing {
        meetings: event_summaries(&events),
        calendar,
        planned,
        completed,
        remaining,
        progress,
        capacity: Capacity {
            available_minutes,
            required_minutes,
            rag,
        },
    })
}

fn compose_tomorrow(
    store: &Store,
    owner_id: &str,
    spec: &WorkdaySpec,
    date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<TomorrowBriefing, StoreError> {
    let tomorrow = date + Duration::days(1);
    let (calendar, events) = load_day(store, owner_id, spec, tomorrow, now)?;
    let open = store.open_tasks(owner_id, 1000)?;

    let prep_tasks = detect_prep_tasks(&open, &events, spec, tomorrow);

    let (_, today_end) = day_bounds(spec, date);
    let rolled_over: Vec<TaskSummary> = open
        .iter()
        .filter(|t| {
            let due_by_tonight = t.due_at_utc().is_some_and(|due| due <= today_end);
            let high_priority_active = t.priority_score >= ROLLOVER_PRIORITY
                && matches!(t.status, TaskStatus::Planned | TaskStatus::InProgress);
            due_by_tonight || high_priority_active
        })
        .map(TaskSummary::from_task)
        .collect();

    Ok(TomorrowBriefing {
        meetings: event_summaries(&events),
        calendar,
        prep_tasks,
        rolled_over,
    })
}

/// Three detection rules, first hit wins per task:
/// 1. MeetingPrep-typed tasks (keyword-matched to an event when possible);
/// 2. title overlap with a tomorrow event (≥1 shared token, ≥30% of the
///    task's tokens);
/// 3. due tomorrow with a large estimate.
fn detect_prep_tasks(
    open: &[DbTask],
    events: &[DbCalendarEvent],
    spec: &WorkdaySpec,
    tomorrow: NaiveDate,
) -> Vec<PrepTask> {
    let event_tokens: Vec<(&DbCalendarEvent, Vec<String>)> = events
        .iter()
        .filter(|e| !e.is_all_day)
        .map(|e| (e, title_tokens(&e.title)))
        .collect();

    let mut prep = Vec::new();

    for task in open {
        let tokens = title_tokens(&task.title);

        if task.task_type == TaskType::MeetingPrep {
            let matched = best_overlap(&tokens, &event_tokens).map(|e| e.title.clone());
            prep.push(PrepTask {
                task_id: task.id.clone(),
                title: task.title.clone(),
                reason: match matched.as_deref() {
                    Some(title) => format!("Prep for \"{title}\""),
                    None => "Meeting preparation task".to_string(),
                },
                matched_event_title: matched,
            });
            continue;
        }

        if !tokens.is_empty() {
            if let Some(event) = event_tokens
                .iter()
                .find(|(_, etoks)| {
                    let shared = tokens.iter().filter(|t| etoks.contains(t)).count();
                    shared >= 1 && shared as f64 >= TITLE_MATCH_RATIO * tokens.len() as f64
                })
                .map(|(e, _)| *e)
            {
                prep.push(PrepTask {
                    task_id: task.id.clone(),
                    title: task.title.clone(),
                    reason: format!("Title matches \"{}\"", event.title),
                    matched_event_title: Some(event.title.clone()),
                });
                continue;
            }
        }

        let due_tomorrow = task
            .due_at_utc()
            .map(|due| spec.local_date(due) == tomorrow)
            .unwrap_or(false);
        if due_tomorrow && task.estimated_minutes >= PREP_BIG_TASK_MINUTES {
            prep.push(PrepTask {
                task_id: task.id.clone(),
                title: task.title.clone(),
                reason: "Due tomorrow with a large estimate".to_string(),
                matched_event_title: None,
            });
        }
    }

    prep
}

fn best_overlap<'a>(
    tokens: &[String],
    event_tokens: &[(&'a DbCalendarEvent, Vec<String>)],
) -> Option<&'a DbCalendarEvent> {
    event_tokens
        .iter()
        .map(|(event, etoks)| {
            let shared = tokens.iter().filter(|t| etoks.contains(t)).count();
            (*event, shared)
        })
        .filter(|(_, shared)| *shared >= 1)
        .max_by_key(|(_, shared)| *shared)
        .map(|(event, _)| event)
}
