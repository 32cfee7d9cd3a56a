//! Shared domain types.
//!
//! Enums carry their wire spelling (snake_case) in both serde and the
//! `as_str`/`parse` pairs used by the store layer, so a value round-trips
//! identically through the database and the JSON surface.

use serde::{Deserialize, Serialize};

/// Task lifecycle. `Done` is the only terminal state; terminal tasks are
/// excluded from every ranking collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Planned,
    InProgress,
    BlockedWaiting,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Planned => "planned",
            Self::InProgress => "in_progress",
            Self::BlockedWaiting => "blocked_waiting",
            Self::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match normalize_token(s).as_str() {
            "backlog" => Some(Self::Backlog),
            "planned" => Some(Self::Planned),
            "inprogress" => Some(Self::InProgress),
            "blockedwaiting" => Some(Self::BlockedWaiting),
            "done" => Some(Self::Done),
            _ => None,
        }
    }

    /// A task is terminal iff it is `Done`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Task,
    Ticket,
    MeetingPrep,
    FollowUp,
    Admin,
    Build,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Ticket => "ticket",
            Self::MeetingPrep => "meeting_prep",
            Self::FollowUp => "follow_up",
            Self::Admin => "admin",
            Self::Build => "build",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match normalize_token(s).as_str() {
            "task" => Some(Self::Task),
            "ticket" => Some(Self::Ticket),
            "meetingprep" => Some(Self::MeetingPrep),
            "followup" => Some(Self::FollowUp),
            "admin" => Some(Self::Admin),
            "build" => Some(Self::Build),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateSource {
    Default,
    Llm,
    Manual,
}

impl EstimateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Llm => "llm",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match normalize_token(s).as_str() {
            "default" => Some(Self::Default),
            "llm" => Some(Self::Llm),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Application (long-running workstream) delivery phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Intake,
    Discovery,
    Design,
    Build,
    Test,
    Training,
    GoLive,
    Hypercare,
    SteadyState,
    Sundown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Discovery => "discovery",
            Self::Design => "design",
            Self::Build => "build",
            Self::Test => "test",
            Self::Training => "training",
            Self::GoLive => "go_live",
            Self::Hypercare => "hypercare",
            Self::SteadyState => "steady_state",
            Self::Sundown => "sundown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match normalize_token(s).as_str() {
            "intake" => Some(Self::Intake),
            "discovery" => Some(Self::Discovery),
            "design" => Some(Self::Design),
            "build" => Some(Self::Build),
            "test" => Some(Self::Test),
            "training" => Some(Self::Training),
            "golive" => Some(Self::GoLive),
            "hypercare" => Some(Self::Hypercare),
            "steadystate" => Some(Self::SteadyState),
            "sundown" => Some(Self::Sundown),
            _ => None,
        }
    }

    /// Human label for status snippets ("Go-Live", "Steady State").
    pub fn display(&self) -> &'static str {
        match self {
            Self::Intake => "Intake",
            Self::Discovery => "Discovery",
            Self::Design => "Design",
            Self::Build => "Build",
            Self::Test => "Test",
            Self::Training => "Training",
            Self::GoLive => "Go-Live",
            Self::Hypercare => "Hypercare",
            Self::SteadyState => "Steady State",
            Self::Sundown => "Sundown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rag {
    Green,
    Yellow,
    Red,
}

impl Rag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Green => "green",
            Self::Yellow => "yellow",
            Self::Red => "red",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match normalize_token(s).as_str() {
            "green" => Some(Self::Green),
            "yellow" => Some(Self::Yellow),
            "red" => Some(Self::Red),
            _ => None,
        }
    }

    pub fn display(&self) -> &'static str {
        match self {
            Self::Green => "Green",
            Self::Yellow => "Yellow",
            Self::Red => "Red",
        }
    }
}

/// What a focus directive re-weights against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusScope {
    Application,
    Stakeholder,
    TaskType,
    /// Reserved: stored and surfaced but never matched by the planner.
    Query,
}

impl FocusScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Stakeholder => "stakeholder",
            Self::TaskType => "task_type",
            Self::Query => "query",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match normalize_token(s).as_str() {
            "application" => Some(Self::Application),
            "stakeholder" => Some(Self::Stakeholder),
            "tasktype" => Some(Self::TaskType),
            "query" => Some(Self::Query),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveStrength {
    Nudge,
    Strong,
    Hard,
}

impl DirectiveStrength {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nudge => "nudge",
            Self::Strong => "strong",
            Self::Hard => "hard",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match normalize_token(s).as_str() {
            "nudge" => Some(Self::Nudge),
            "strong" => Some(Self::Strong),
            "hard" => Some(Self::Hard),
            _ => None,
        }
    }

    /// `(match, non_match)` score multipliers per strength.
    pub fn multipliers(&self) -> (f64, f64) {
        match self {
            Self::Nudge => (1.2, 0.95),
            Self::Strong => (1.6, 0.85),
            Self::Hard => (2.0, 0.7),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageState {
    New,
    Processed,
    Error,
}

impl TriageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Processed => "processed",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match normalize_token(s).as_str() {
            "new" => Some(Self::New),
            "processed" => Some(Self::Processed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarSource {
    Local,
    Ical,
    Graph,
}

impl CalendarSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Ical => "ical",
            Self::Graph => "graph",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match normalize_token(s).as_str() {
            "local" => Some(Self::Local),
            "ical" => Some(Self::Ical),
            "graph" => Some(Self::Graph),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Proposed,
    Applied,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Applied => "applied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match normalize_token(s).as_str() {
            "proposed" => Some(Self::Proposed),
            "applied" => Some(Self::Applied),
            _ => None,
        }
    }
}

/// Lowercase and drop separators so "MeetingPrep", "meeting_prep" and
/// "meeting-prep" all parse to the same variant.
fn normalize_token(s: &str) -> String {
    s.trim()
        .chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(|c| c.to_lowercase())
        .collect()
}
