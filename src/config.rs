//! Runtime configuration loaded from the environment at startup.

use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::NaiveTime;
use chrono_tz::Tz;

/// High-priority stakeholders whose mention boosts a task.
pub const DEFAULT_PRIORITY_STAKEHOLDERS: &[&str] = &["nancy", "heath"];

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    /// Shared secret for API-key admission. `None` disables that mode.
    pub api_key: Option<String>,
    /// Owner id paired with the shared API key.
    pub api_owner: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    /// Workday timezone for plan dates and briefing windows.
    pub workday_tz: Tz,
    /// Local start of the focus window.
    pub focus_start: NaiveTime,
    /// Local end of the focus window.
    pub focus_end: NaiveTime,
}

impl Config {
    /// Load from environment variables, falling back to defaults.
    ///
    /// Only malformed values error; absent ones default.
    pub fn from_env() -> Result<Self, String> {
        let bind = match std::env::var("MISSION_CONTROL_BIND") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| format!("invalid MISSION_CONTROL_BIND {raw:?}: {e}"))?,
            Err(_) => SocketAddr::from(([127, 0, 0, 1], 8700)),
        };

        let db_path = match std::env::var("MISSION_CONTROL_DB") {
            Ok(raw) => PathBuf::from(raw),
            Err(_) => default_db_path()?,
        };

        let workday_tz = match std::env::var("MISSION_CONTROL_TZ") {
            Ok(raw) => raw
                .parse::<Tz>()
                .map_err(|e| format!("invalid MISSION_CONTROL_TZ {raw:?}: {e}"))?,
            Err(_) => chrono_tz::America::New_York,
        };

        let focus_start = parse_focus_time("MISSION_CONTROL_FOCUS_START", 8, 0)?;
        let focus_end = parse_focus_time("MISSION_CONTROL_FOCUS_END", 16, 30)?;
        if focus_end <= focus_start {
            return Err(format!(
                "focus window is empty: start {focus_start} >= end {focus_end}"
            ));
        }

        Ok(Self {
            bind,
            db_path,
            api_key: non_empty_env("MISSION_CONTROL_API_KEY"),
            api_owner: non_empty_env("MISSION_CONTROL_API_OWNER"),
            anthropic_api_key: non_empty_env("ANTHROPIC_API_KEY"),
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            workday_tz,
            focus_start,
            focus_end,
        })
    }

    /// Config for tests: in-memory-ish defaults, no provider keys.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            db_path: PathBuf::from(":memory:"),
            api_key: Some("test-key".to_string()),
            api_owner: Some("owner-1".to_string()),
            anthropic_api_key: None,
            openai_api_key: None,
            workday_tz: chrono_tz::America::New_York,
            focus_start: NaiveTime::from_hms_opt(8, 0, 0).expect("valid time"),
            focus_end: NaiveTime::from_hms_opt(16, 30, 0).expect("valid time"),
        }
    }

    /// Minutes in the focus window (workday capacity before subtractions).
    pub fn workday_minutes(&self) -> u32 {
        (self.focus_end - self.focus_start).num_minutes().max(0) as u32
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_focus_time(key: &str, default_h: u32, default_m: u32) -> Result<NaiveTime, String> {
    match std::env::var(key) {
        Ok(raw) => NaiveTime::parse_from_str(raw.trim(), "%H:%M")
            .map_err(|e| format!("invalid {key} {raw:?} (expected HH:MM): {e}")),
        Err(_) => {
            Ok(NaiveTime::from_hms_opt(default_h, default_m, 0).expect("default focus time"))
        }
    }
}

fn default_db_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("home directory not found")?;
    Ok(home.join(".mission-control").join("mission-control.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_focus_window_is_510_minutes() {
        let config = Config::for_tests();
        assert_eq!(config.workday_minutes(), 510);
    }
}
