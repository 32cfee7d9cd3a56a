//! Minimal iCalendar (RFC 5545) VEVENT parser.
//!
//! Handles the subset real calendar feeds exercise: folded lines, UTC and
//! TZID-qualified datetimes, all-day `VALUE=DATE` events, and escaped text
//! values. Anything unrecognized is skipped, never fatal; a feed with one
//! malformed event still ingests the rest.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use super::RawEvent;

/// Fallback span for timed events without DTEND.
const DEFAULT_EVENT_MINUTES: i64 = 30;

/// Parse an ICS document into raw events ready for ingest.
pub fn parse_ics(text: &str) -> Vec<RawEvent> {
    let lines = unfold_lines(text);
    let mut events = Vec::new();
    let mut current: Option<VEventBuilder> = None;

    for line in lines {
        if line.eq_ignore_ascii_case("BEGIN:VEVENT") {
            current = Some(VEventBuilder::default());
            continue;
        }
        if line.eq_ignore_ascii_case("END:VEVENT") {
            if let Some(builder) = current.take() {
                match builder.build() {
                    Some(event) => events.push(event),
                    None => tracing::debug!("skipping VEVENT without usable DTSTART/UID"),
                }
            }
            continue;
        }

        let Some(builder) = current.as_mut() else {
            continue;
        };
        let Some((name, params, value)) = split_property(&line) else {
            continue;
        };

        match name.to_ascii_uppercase().as_str() {
            "UID" => builder.uid = Some(value.to_string()),
            "SUMMARY" => builder.summary = Some(unescape_text(value)),
            "DESCRIPTION" => builder.description = Some(value.to_string()),
            "DTSTART" => builder.start = parse_datetime(&params, value),
            "DTEND" => builder.end = parse_datetime(&params, value),
            _ => {}
        }
    }

    events
}

#[derive(Default)]
struct VEventBuilder {
    uid: Option<String>,
    summary: Option<String>,
    description: Option<String>,
    start: Option<ParsedTime>,
    end: Option<ParsedTime>,
}

impl VEventBuilder {
    fn build(self) -> Option<RawEvent> {
        let uid = self.uid?;
        let start = self.start?;

        let end_at = match self.end {
            Some(end) => end.instant,
            None if start.all_day => start.instant + Duration::days(1),
            None => start.instant + Duration::minutes(DEFAULT_EVENT_MINUTES),
        };
        if end_at <= start.instant {
            return None;
        }

        Some(RawEvent {
            external_event_id: uid,
            title: self.summary.unwrap_or_default(),
            body: self.description,
            start_at: start.instant,
            end_at,
            is_all_day: start.all_day,
        })
    }
}

struct ParsedTime {
    instant: DateTime<Utc>,
    all_day: bool,
}

/// RFC 5545 line unfolding: a line starting with space or tab continues the
/// previous line.
fn unfold_lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.lines() {
        if (raw.starts_with(' ') || raw.starts_with('\t')) && !lines.is_empty() {
            if let Some(last) = lines.last_mut() {
                last.push_str(&raw[1..]);
            }
        } else {
            lines.push(raw.trim_end_matches('\r').to_string());
        }
    }
    lines
}

/// Split `NAME;PARAM=V;PARAM2=W:value` into (name, params, value).
fn split_property(line: &str) -> Option<(String, Vec<(String, String)>, &str)> {
    let colon = line.find(':')?;
    let (head, value) = line.split_at(colon);
    let value = &value[1..];

    let mut parts = head.split(';');
    let name = parts.next()?.to_string();
    let params = parts
        .filter_map(|p| {
            let (k, v) = p.split_once('=')?;
            Some((k.to_ascii_uppercase(), v.to_string()))
        })
        .collect();
    Some((name, params, value))
}

fn parse_datetime(params: &[(String, String)], value: &str) -> Option<ParsedTime> {
    let value = value.trim();
    let is_date_only = params
        .iter()
        .any(|(k, v)| k == "VALUE" && v.eq_ignore_ascii_case("DATE"))
        || (value.len() == 8 && !value.contains('T'));

    if is_date_only {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        return Some(ParsedTime {
            instant: Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?),
            all_day: true,
        });
    }

    if let Some(stripped) = value.strip_suffix('Z') {
        let naive = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S").ok()?;
        return Some(ParsedTime {
            instant: Utc.from_utc_datetime(&naive),
            all_day: false,
        });
    }

    let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").ok()?;

    if let Some((_, tzid)) = params.iter().find(|(k, _)| k == "TZID") {
        if let Ok(tz) = tzid.parse::<Tz>() {
            if let Some(local) = tz.from_local_datetime(&naive).earliest() {
                return Some(ParsedTime {
                    instant: local.to_utc(),
                    all_day: false,
                });
            }
        }
        tracing::warn!("unresolvable TZID {tzid:?}; treating as UTC");
    }

    // Floating time: treat as UTC.
    Some(ParsedTime {
        instant: Utc.from_utc_datetime(&naive),
        all_day: false,
    })
}

/// Unescape the RFC 5545 TEXT productions that matter for titles.
fn unescape_text(value: &str) -> String {
    value
        .replace("\\n", " ")
        .replace("\\N", " ")
        .replace("\\,", ",")
        .replace("\\;", ";")
        .replace("\\\\", "\\")
}
