//! Calendar engine: workday windows, busy merging, focus blocks, and the
//! snapshot/delta cycle.
//!
//! Dates in and out of this module are `YYYY-MM-DD` in the workday timezone;
//! instants are UTC. All interval arithmetic happens after conversion to UTC
//! so DST transitions only matter when a window is constructed.

pub mod ical;
pub mod snapshot;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::db::{DbCalendarEvent, IngestEvent, Store, StoreError};
use crate::sanitize::sanitize_body;
use crate::types::CalendarSource;
use crate::util::sha256_key;

/// Longest queryable range.
pub const MAX_RANGE_DAYS: i64 = 31;

/// A gap must be at least this long to count as a focus block.
pub const MIN_FOCUS_GAP_MINUTES: i64 = 10;

const DEEP_BLOCK_MINUTES: i64 = 45;
const SHALLOW_BLOCK_MINUTES: i64 = 20;

/// Sanitized preview budget for stored event bodies.
const BODY_PREVIEW_MAX_CHARS: usize = 600;

/// Calendar snapshots older than this are pruned lazily on ingest.
pub const SNAPSHOT_RETENTION_DAYS: i64 = 14;

/// The user's local focus window, applied to every day in a range.
#[derive(Debug, Clone, Copy)]
pub struct WorkdaySpec {
    pub tz: Tz,
    pub focus_start: NaiveTime,
    pub focus_end: NaiveTime,
}

impl WorkdaySpec {
    /// UTC bounds of the workday window on `date`.
    pub fn window(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            resolve_local(&self.tz, date, self.focus_start),
            resolve_local(&self.tz, date, self.focus_end),
        )
    }

    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.tz).date_naive()
    }
}

/// Resolve a local date + time to UTC, handling DST gaps.
///
/// During a spring-forward gap `earliest()` returns `None`; fall back to
/// `latest()` (the post-transition instant), and as a last resort interpret
/// the wall-clock as UTC.
fn resolve_local(tz: &Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let naive = NaiveDateTime::new(date, time);

    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return dt.to_utc();
    }
    if let Some(dt) = tz.from_local_datetime(&naive).latest() {
        tracing::warn!("DST gap for {naive} in {tz}; using post-transition time");
        return dt.to_utc();
    }

    tracing::warn!("could not resolve {naive} in {tz}; treating as UTC");
    Utc.with_ymd_and_hms(
        date.year(),
        date.month(),
        date.day(),
        0,
        0,
        0,
    )
    .single()
    .map(|midnight| midnight + (time - NaiveTime::MIN))
    .unwrap_or_else(Utc::now)
}

/// Validate a `rangeStart..rangeEnd` pair (inclusive dates, ≤ 31 days).
pub fn normalize_range(range_start: &str, range_end: &str) -> Result<(NaiveDate, NaiveDate), String> {
    let start = NaiveDate::parse_from_str(range_start.trim(), "%Y-%m-%d")
        .map_err(|_| format!("invalid rangeStart: {range_start:?} (expected YYYY-MM-DD)"))?;
    let end = NaiveDate::parse_from_str(range_end.trim(), "%Y-%m-%d")
        .map_err(|_| format!("invalid rangeEnd: {range_end:?} (expected YYYY-MM-DD)"))?;

    if start > end {
        return Err("rangeStart must not be after rangeEnd".to_string());
    }
    let span = (end - start).num_days() + 1;
    if span > MAX_RANGE_DAYS {
        return Err(format!("range too long: {span} days (max {MAX_RANGE_DAYS})"));
    }
    Ok((start, end))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusBlockKind {
    Deep,
    Shallow,
    Prep,
}

/// Classify a gap by its length.
pub fn classify_block(minutes: i64) -> FocusBlockKind {
    if minutes >= DEEP_BLOCK_MINUTES {
        FocusBlockKind::Deep
    } else if minutes >= SHALLOW_BLOCK_MINUTES {
        FocusBlockKind::Shallow
    } else {
        FocusBlockKind::Prep
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusyBlock {
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusBlock {
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub minutes: i64,
    pub kind: FocusBlockKind,
}

/// One day's derived calendar state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayCalendar {
    pub date: NaiveDate,
    pub busy_blocks: Vec<BusyBlock>,
    pub busy_minutes: i64,
    pub blocks: usize,
    pub largest_focus_block_minutes: i64,
    pub focus_blocks: Vec<FocusBlock>,
}

/// Clip intervals to the window, sort by start, merge overlapping/touching.
pub fn merge_busy(
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    intervals: &[(DateTime<Utc>, DateTime<Utc>)],
) -> Vec<BusyBlock> {
    let mut clipped: Vec<(DateTime<Utc>, DateTime<Utc>)> = intervals
        .iter()
        .filter_map(|&(start, end)| {
            let s = start.max(window_start);
            let e = end.min(window_end);
            (e > s).then_some((s, e))
        })
        .collect();

    clipped.sort_by_key(|&(start, _)| start);

    let mut merged: Vec<BusyBlock> = Vec::new();
    for (start, end) in clipped {
        if let Some(last) = merged.last_mut() {
            if last.end_at >= start {
                if end > last.end_at {
                    last.end_at = end;
                }
                continue;
            }
        }
        merged.push(BusyBlock {
            start_at: start,
            end_at: end,
        });
    }
    merged
}

/// Gaps ≥ 10 minutes between merged blocks and the window edges. When `now`
/// falls inside the window, gaps already behind it are dropped and a gap
/// straddling it is trimmed to start at `now`.
pub fn focus_blocks(
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    busy: &[BusyBlock],
    now: Option<DateTime<Utc>>,
) -> Vec<FocusBlock> {
    let mut gaps = Vec::new();
    let mut cursor = window_start;

    for block in busy {
        if block.start_at > cursor {
            gaps.push((cursor, block.start_at));
        }
        if block.end_at > cursor {
            cursor = block.end_at;
        }
    }
    if window_end > cursor {
        gaps.push((cursor, window_end));
    }

    let cutoff = now.filter(|n| *n > window_start && *n < window_end);

    gaps.into_iter()
        .filter_map(|(mut start, end)| {
            if let Some(cutoff) = cutoff {
                if end <= cutoff {
                    return None;
                }
                if start < cutoff {
                    start = cutoff;
                }
            }
            let minutes = (end - start).num_minutes();
            (minutes >= MIN_FOCUS_GAP_MINUTES).then(|| FocusBlock {
                start_at: start,
                end_at: end,
                minutes,
                kind: classify_block(minutes),
            })
        })
        .collect()
}

/// Derive one day's busy/focus summary from UTC event intervals.
pub fn build_day(
    spec: &WorkdaySpec,
    date: NaiveDate,
    intervals: &[(DateTime<Utc>, DateTime<Utc>)],
    now: Option<DateTime<Utc>>,
) -> DayCalendar {
    let (window_start, window_end) = spec.window(date);
    let busy = merge_busy(window_start, window_end, intervals);

    let busy_minutes: i64 = busy
        .iter()
        .map(|b| (b.end_at - b.start_at).num_minutes())
        .sum();

    let blocks = focus_blocks(window_start, window_end, &busy, now);
    let largest = blocks.iter().map(|b| b.minutes).max().unwrap_or(0);

    DayCalendar {
        date,
        blocks: busy.len(),
        busy_blocks: busy,
        busy_minutes,
        largest_focus_block_minutes: largest,
        focus_blocks: blocks,
    }
}

/// Content hash over the canonicalized identity of an event.
pub fn event_content_hash(title: &str, start_at: &str, end_at: &str, sanitized_body: &str) -> String {
    sha256_key(&[title.trim(), start_at, end_at, sanitized_body])
}

/// Raw inbound event, pre-sanitization.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub external_event_id: String,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    #[serde(default)]
    pub is_all_day: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub ingested: usize,
    pub removed: usize,
    pub pruned_snapshots: usize,
}

/// Idempotent ingest of a batch of events for `[range_start, range_end]`.
///
/// Bodies pass through the sanitizer before storage; events no longer
/// present in the batch are soft-removed; snapshot retention is applied
/// lazily here.
pub fn ingest_events(
    store: &Store,
    owner_id: &str,
    source: CalendarSource,
    spec: &WorkdaySpec,
    range_start: NaiveDate,
    range_end: NaiveDate,
    raw_events: &[RawEvent],
) -> Result<IngestSummary, StoreError> {
    // Soft-removal scans whole days, not just focus hours.
    let day_start = resolve_local(&spec.tz, range_start, NaiveTime::MIN);
    let day_end = resolve_local(&spec.tz, range_end, NaiveTime::MIN) + Duration::days(1);

    let mut keep: Vec<(String, String)> = Vec::with_capacity(raw_events.len());
    let mut ingested = 0;

    for raw in raw_events {
        let body_preview = raw
            .body
            .as_deref()
            .map(|b| sanitize_body(b, BODY_PREVIEW_MAX_CHARS))
            .unwrap_or_default();
        let start_at = iso_utc(raw.start_at);
        let end_at = iso_utc(raw.end_at);
        let content_hash = event_content_hash(&raw.title, &start_at, &end_at, &body_preview);

        store.upsert_calendar_event(
            owner_id,
            source,
            &IngestEvent {
                external_event_id: raw.external_event_id.clone(),
                title: raw.title.clone(),
                body_preview,
                start_at: start_at.clone(),
                end_at,
                is_all_day: raw.is_all_day,
                content_hash,
            },
        )?;
        keep.push((raw.external_event_id.clone(), start_at));
        ingested += 1;
    }

    let removed = store.soft_remove_missing_events(
        owner_id,
        source,
        &iso_utc(day_start),
        &iso_utc(day_end),
        &keep,
    )?;

    let pruned_snapshots = match store.prune_calendar_snapshots(owner_id, SNAPSHOT_RETENTION_DAYS) {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!("snapshot prune failed: {e}");
            0
        }
    };

    Ok(IngestSummary {
        ingested,
        removed,
        pruned_snapshots,
    })
}

/// The full `GET /calendar` aggregation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarQuery {
    pub range_start: NaiveDate,
    pub range_end: NaiveDate,
    pub events: Vec<WireEvent>,
    pub days: Vec<DayCalendar>,
    pub changes_since: snapshot::SnapshotDelta,
}

/// Event as exposed on the wire: sanitized preview only, no raw body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    pub id: String,
    pub source: CalendarSource,
    pub external_event_id: String,
    pub title: String,
    pub body_preview: String,
    pub meeting_context: Option<String>,
    pub start_at: String,
    pub end_at: String,
    pub is_all_day: bool,
}

impl WireEvent {
    fn from_db(event: &DbCalendarEvent) -> Self {
        Self {
            id: event.id.clone(),
            source: event.source,
            external_event_id: event.external_event_id.clone(),
            title: event.title.clone(),
            body_preview: event.body_preview.clone(),
            meeting_context: event.meeting_context.clone(),
            start_at: event.start_at.clone(),
            end_at: event.end_at.clone(),
            is_all_day: event.is_all_day,
        }
    }
}

/// Run the range query: busy merge per day, focus blocks, delta against the
/// previous snapshot. The new snapshot is written strictly after the delta
/// is computed.
pub fn query_range(
    store: &Store,
    owner_id: &str,
    spec: &WorkdaySpec,
    range_start: NaiveDate,
    range_end: NaiveDate,
    now: DateTime<Utc>,
) -> Result<CalendarQuery, StoreError> {
    let day_start = resolve_local(&spec.tz, range_start, NaiveTime::MIN);
    let day_end = resolve_local(&spec.tz, range_end, NaiveTime::MIN) + Duration::days(1);

    let events = store.list_events_between(owner_id, &iso_utc(day_start), &iso_utc(day_end))?;

    let mut days = Vec::new();
    let mut date = range_start;
    while date <= range_end {
        let intervals: Vec<(DateTime<Utc>, DateTime<Utc>)> = events
            .iter()
            .filter(|e| !e.is_all_day)
            .filter_map(|e| Some((e.start_at_utc()?, e.end_at_utc()?)))
            .collect();
        let today_now = (spec.local_date(now) == date).then_some(now);
        days.push(build_day(spec, date, &intervals, today_now));
        date += Duration::days(1);
    }

    let current_entries = snapshot::canonical_entries(&events);
    let range_start_str = range_start.to_string();
    let range_end_str = range_end.to_string();

    let previous = store.latest_calendar_snapshot(owner_id, &range_start_str, &range_end_str)?;
    let previous_entries = previous
        .as_ref()
        .map(|s| snapshot::decode_entries(&s.payload_min))
        .unwrap_or_default();

    let changes_since = snapshot::compute_delta(&previous_entries, &current_entries);

    // Snapshot write happens after the delta; a crash in between only costs
    // one redundant delta next time.
    store.insert_calendar_snapshot(
        owner_id,
        &range_start_str,
        &range_end_str,
        &snapshot::encode_entries(&current_entries),
    )?;

    Ok(CalendarQuery {
        range_start,
        range_end,
        events: events.iter().map(WireEvent::from_db).collect(),
        days,
        changes_since,
    })
}

pub(crate) fn iso_utc(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
