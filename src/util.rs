use chrono::{DateTime, NaiveDate, Utc};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 over `|`-joined parts.
///
/// Used for intake dedupe keys, calendar content hashes, and LLM request
/// fingerprints, so every derived key in the system shares one canonical
/// construction.
pub fn sha256_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Clamp a float into `[lo, hi]`.
pub fn clamp_f64(value: f64, lo: f64, hi: f64) -> f64 {
    value.max(lo).min(hi)
}

/// Round to two decimal places (score precision on the wire).
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Parse an ISO-8601 timestamp with offset into UTC.
///
/// Accepts a bare `YYYY-MM-DDTHH:MM:SS` as UTC for tolerance with
/// extraction output.
pub fn parse_utc(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

/// Tokenize a title for overlap matching: lowercase, strip non-alphanumerics,
/// drop stopwords (including scheduling noise so "weekly sync" doesn't match
/// every recurring meeting).
pub fn title_tokens(title: &str) -> Vec<String> {
    const STOPWORDS: &[&str] = &[
        "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "into", "is", "it",
        "of", "on", "or", "our", "that", "the", "this", "to", "with", "your",
        // scheduling noise
        "meeting", "sync", "weekly", "biweekly", "monthly", "daily", "standup", "prep", "call",
        "review", "checkin", "check",
    ];

    title
        .split(|c: char| !c.is_alphanumeric())
        .filter_map(|raw| {
            let token: String = raw.to_lowercase();
            if token.len() < 2 || STOPWORDS.contains(&token.as_str()) {
                None
            } else {
                Some(token)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_key_is_stable_and_delimited() {
        let a = sha256_key(&["owner", "msg-1"]);
        let b = sha256_key(&["owner", "msg-1"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        // Delimiter prevents boundary collisions
        assert_ne!(sha256_key(&["ab", "c"]), sha256_key(&["a", "bc"]));
    }

    #[test]
    fn round2_truncates_noise() {
        assert_eq!(round2(12.345), 12.35);
        assert_eq!(round2(12.344), 12.34);
        assert_eq!(round2(100.0), 100.0);
    }

    #[test]
    fn parse_utc_accepts_offset_and_bare() {
        let with_offset = parse_utc("2026-03-02T09:00:00-05:00").unwrap();
        assert_eq!(with_offset.to_rfc3339(), "2026-03-02T14:00:00+00:00");
        assert!(parse_utc("2026-03-02T14:00:00").is_some());
        assert!(parse_utc("not a date").is_none());
    }

    #[test]
    fn title_tokens_drop_scheduling_noise() {
        let tokens = title_tokens("Weekly Sync: Payroll Cutover Review");
        assert_eq!(tokens, vec!["payroll", "cutover"]);
    }

    #[test]
    fn title_tokens_strip_punctuation() {
        let tokens = title_tokens("Finalize SOW (v2) — Acme");
        assert_eq!(tokens, vec!["finalize", "sow", "v2", "acme"]);
    }
}
