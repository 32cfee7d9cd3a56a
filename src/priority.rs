//! Pure task-scoring kernel.
//!
//! Everything here is deterministic arithmetic over a task row plus a
//! planner-supplied context; no I/O. The planner owns multiplier selection
//! (portfolio weight, focus directive) and window-fit; the kernel owns the
//! additive boosts and the final clamp.

use chrono::{DateTime, Utc};

use crate::types::TaskStatus;
use crate::util::{clamp_f64, round2};

/// The "next window" the planner fits tasks into when no concrete calendar
/// window has been selected.
pub const NEXT_WINDOW_MINUTES: u32 = 60;

/// Portfolio weight → score multiplier, indexed by `clamp(round(weight), 0, 10)`.
pub const WEIGHT_TABLE: [f64; 11] = [
    0.6, 0.7, 0.8, 0.9, 0.95, 1.0, 1.1, 1.25, 1.4, 1.6, 1.8,
];

/// Ceiling for the multiplied score.
pub const FINAL_SCORE_CAP: f64 = 300.0;

const URGENCY_CAP: f64 = 25.0;

/// Per-task scoring inputs, reproducible from the task row alone.
#[derive(Debug, Clone)]
pub struct ScoreInput<'a> {
    pub priority_score_base: f64,
    pub due_at: Option<DateTime<Utc>>,
    pub follow_up_at: Option<DateTime<Utc>>,
    pub blocker: bool,
    pub status: TaskStatus,
    pub updated_at: DateTime<Utc>,
    pub stakeholder_mentions: &'a [String],
}

/// Planner-supplied context shared across one scoring pass.
#[derive(Debug, Clone)]
pub struct ScoreContext {
    pub now: DateTime<Utc>,
    /// Lowercased high-priority stakeholder names.
    pub priority_stakeholders: Vec<String>,
    /// `+5` when the estimate fits the next window, `-10` otherwise.
    pub fit_bonus: f64,
    pub implementation_multiplier: f64,
    pub directive_multiplier: f64,
}

impl ScoreContext {
    pub fn new(now: DateTime<Utc>, priority_stakeholders: &[&str]) -> Self {
        Self {
            now,
            priority_stakeholders: priority_stakeholders
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            fit_bonus: 0.0,
            implementation_multiplier: 1.0,
            directive_multiplier: 1.0,
        }
    }
}

/// Every component of a scored task, emitted into plan reasons so a score is
/// reproducible after the fact.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub priority_blend: f64,
    pub urgency_boost: f64,
    pub stakeholder_boost: f64,
    pub staleness_boost: f64,
    pub status_adjust: f64,
    pub fit_bonus: f64,
    pub follow_up_due: bool,
    pub pre_multiplier_score: f64,
    pub final_score: f64,
}

/// Score one task.
pub fn score_task(input: &ScoreInput, ctx: &ScoreContext) -> ScoreBreakdown {
    let priority_blend = clamp_f64(input.priority_score_base, 0.0, 100.0);
    let urgency_boost = urgency_boost(input.due_at, ctx.now);
    let stakeholder_boost =
        stakeholder_boost(input.stakeholder_mentions, &ctx.priority_stakeholders);
    let staleness_boost = staleness_boost(input.updated_at, ctx.now);

    let follow_up_due = input.status == TaskStatus::BlockedWaiting
        && input.follow_up_at.is_some_and(|at| at <= ctx.now);

    let status_adjust = match input.status {
        TaskStatus::InProgress => 5.0,
        // A blocked task whose follow-up has come due stops being penalized:
        // it is exception-eligible instead.
        TaskStatus::BlockedWaiting if follow_up_due => 0.0,
        TaskStatus::BlockedWaiting => -15.0,
        TaskStatus::Backlog => -5.0,
        _ => 0.0,
    };

    let pre_multiplier_score = priority_blend
        + urgency_boost
        + stakeholder_boost
        + staleness_boost
        + status_adjust
        + ctx.fit_bonus;

    let final_score = round2(clamp_f64(
        pre_multiplier_score * ctx.implementation_multiplier * ctx.directive_multiplier,
        0.0,
        FINAL_SCORE_CAP,
    ));

    ScoreBreakdown {
        priority_blend,
        urgency_boost,
        stakeholder_boost,
        staleness_boost,
        status_adjust,
        fit_bonus: ctx.fit_bonus,
        follow_up_due,
        pre_multiplier_score,
        final_score,
    }
}

fn urgency_boost(due_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(due) = due_at else {
        return 0.0;
    };
    let boost: f64 = if due <= now {
        25.0
    } else {
        let hours = (due - now).num_minutes() as f64 / 60.0;
        if hours <= 24.0 {
            15.0
        } else if hours <= 72.0 {
            7.0
        } else {
            0.0
        }
    };
    boost.min(URGENCY_CAP)
}

fn stakeholder_boost(mentions: &[String], priority_stakeholders: &[String]) -> f64 {
    let hit = mentions.iter().any(|mention| {
        let lower = mention.to_lowercase();
        priority_stakeholders.iter().any(|name| lower.contains(name))
    });
    if hit {
        10.0
    } else {
        0.0
    }
}

fn staleness_boost(updated_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let hours = (now - updated_at).num_hours();
    if hours >= 168 {
        6.0
    } else if hours >= 72 {
        3.0
    } else {
        0.0
    }
}

/// Portfolio-weight multiplier lookup: `clamp(round(weight), 0, 10)` into
/// [`WEIGHT_TABLE`].
pub fn implementation_multiplier(weight: f64) -> f64 {
    let idx = clamp_f64(weight.round(), 0.0, 10.0) as usize;
    WEIGHT_TABLE[idx]
}

/// Deterministic priority boost applied at intake, before a task first hits
/// the planner. Reuses the kernel's urgency and stakeholder rules against
/// the extractor's due guess, plus a small bump for urgency-flagged titles.
pub fn intake_priority_boosts(
    stakeholder_mentions: &[String],
    due_at: Option<DateTime<Utc>>,
    title: &str,
    initial_status: TaskStatus,
    ctx: &ScoreContext,
) -> f64 {
    const TITLE_URGENCY_MARKERS: &[&str] = &["urgent", "asap", "critical", "eod", "blocker"];

    let urgency = urgency_boost(due_at, ctx.now);
    let stakeholder = stakeholder_boost(stakeholder_mentions, &ctx.priority_stakeholders);

    let title_lower = title.to_lowercase();
    let title_bump = if TITLE_URGENCY_MARKERS
        .iter()
        .any(|marker| title_lower.contains(marker))
    {
        5.0
    } else {
        0.0
    };

    let status_adjust = match initial_status {
        TaskStatus::InProgress => 5.0,
        TaskStatus::Backlog => -5.0,
        _ => 0.0,
    };

    urgency + stakeholder + title_bump + status_adjust
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap()
    }

    fn base_input(status: TaskStatus) -> ScoreInput<'static> {
        ScoreInput {
            priority_score_base: 50.0,
            due_at: None,
            follow_up_at: None,
            blocker: false,
            status,
            updated_at: now(),
            stakeholder_mentions: &[],
        }
    }

    #[test]
    fn urgency_steps_follow_deadline_distance() {
        let ctx = ScoreContext::new(now(), &[]);

        let mut input = base_input(TaskStatus::Planned);
        input.due_at = Some(now() - Duration::hours(1));
        assert_eq!(score_task(&input, &ctx).urgency_boost, 25.0);

        input.due_at = Some(now() + Duration::hours(12));
        assert_eq!(score_task(&input, &ctx).urgency_boost, 15.0);

        input.due_at = Some(now() + Duration::hours(48));
        assert_eq!(score_task(&input, &ctx).urgency_boost, 7.0);

        input.due_at = Some(now() + Duration::hours(100));
        assert_eq!(score_task(&input, &ctx).urgency_boost, 0.0);

        input.due_at = None;
        assert_eq!(score_task(&input, &ctx).urgency_boost, 0.0);
    }

    #[test]
    fn stakeholder_match_is_case_insensitive_substring() {
        let ctx = ScoreContext::new(now(), &["nancy", "heath"]);
        let mentions = vec!["Nancy Alvarez".to_string()];
        let mut input = base_input(TaskStatus::Planned);
        input.stakeholder_mentions = &mentions;
        assert_eq!(score_task(&input, &ctx).stakeholder_boost, 10.0);

        let other = vec!["Jordan".to_string()];
        input.stakeholder_mentions = &other;
        assert_eq!(score_task(&input, &ctx).stakeholder_boost, 0.0);
    }

    #[test]
    fn staleness_steps_at_72_and_168_hours() {
        let ctx = ScoreContext::new(now(), &[]);
        let mut input = base_input(TaskStatus::Planned);

        input.updated_at = now() - Duration::hours(10);
        assert_eq!(score_task(&input, &ctx).staleness_boost, 0.0);

        input.updated_at = now() - Duration::hours(80);
        assert_eq!(score_task(&input, &ctx).staleness_boost, 3.0);

        input.updated_at = now() - Duration::hours(200);
        assert_eq!(score_task(&input, &ctx).staleness_boost, 6.0);
    }

    #[test]
    fn blocked_waiting_penalty_lifts_when_follow_up_due() {
        let ctx = ScoreContext::new(now(), &[]);
        let mut input = base_input(TaskStatus::BlockedWaiting);

        input.follow_up_at = Some(now() + Duration::hours(4));
        let pending = score_task(&input, &ctx);
        assert_eq!(pending.status_adjust, -15.0);
        assert!(!pending.follow_up_due);

        input.follow_up_at = Some(now() - Duration::hours(1));
        let due = score_task(&input, &ctx);
        assert_eq!(due.status_adjust, 0.0);
        assert!(due.follow_up_due);
    }

    #[test]
    fn status_adjustments() {
        let ctx = ScoreContext::new(now(), &[]);
        assert_eq!(
            score_task(&base_input(TaskStatus::InProgress), &ctx).status_adjust,
            5.0
        );
        assert_eq!(
            score_task(&base_input(TaskStatus::Backlog), &ctx).status_adjust,
            -5.0
        );
        assert_eq!(
            score_task(&base_input(TaskStatus::Planned), &ctx).status_adjust,
            0.0
        );
    }

    #[test]
    fn final_score_multiplies_then_clamps() {
        let mut ctx = ScoreContext::new(now(), &[]);
        ctx.fit_bonus = 5.0;
        ctx.implementation_multiplier = 1.8;
        ctx.directive_multiplier = 2.0;

        let mut input = base_input(TaskStatus::InProgress);
        input.priority_score_base = 100.0;
        input.due_at = Some(now() - Duration::hours(2));

        let score = score_task(&input, &ctx);
        // 100 + 25 + 0 + 0 + 5 + 5 = 135; 135 * 1.8 * 2.0 = 486 → capped.
        assert_eq!(score.pre_multiplier_score, 135.0);
        assert_eq!(score.final_score, FINAL_SCORE_CAP);
    }

    #[test]
    fn final_score_never_negative() {
        let mut ctx = ScoreContext::new(now(), &[]);
        ctx.fit_bonus = -10.0;
        let mut input = base_input(TaskStatus::BlockedWaiting);
        input.priority_score_base = 0.0;
        let score = score_task(&input, &ctx);
        assert_eq!(score.final_score, 0.0);
    }

    #[test]
    fn weight_table_lookup_clamps_and_rounds() {
        assert_eq!(implementation_multiplier(5.0), 1.0);
        assert_eq!(implementation_multiplier(4.6), 1.0);
        assert_eq!(implementation_multiplier(0.0), 0.6);
        assert_eq!(implementation_multiplier(-3.0), 0.6);
        assert_eq!(implementation_multiplier(10.0), 1.8);
        assert_eq!(implementation_multiplier(14.0), 1.8);
        assert_eq!(implementation_multiplier(7.0), 1.25);
    }

    #[test]
    fn intake_boosts_combine_urgency_and_mentions() {
        let ctx = ScoreContext::new(now(), &["nancy"]);
        let mentions = vec!["nancy".to_string()];
        let boost = intake_priority_boosts(
            &mentions,
            Some(now() + Duration::hours(6)),
            "Urgent: payroll cutover",
            TaskStatus::Planned,
            &ctx,
        );
        // 15 urgency + 10 stakeholder + 5 title marker.
        assert_eq!(boost, 30.0);
    }
}
