//! Meeting-body sanitizer.
//!
//! Strips untrusted HTML, conference join boilerplate, and anything
//! PII-shaped (URLs, emails, phone numbers, long numeric ids) from calendar
//! bodies before they are stored or shown to a model. The stage order is
//! load-bearing: entities are decoded before the regex scrub, otherwise an
//! encoded address survives as `john&#64;acme.com`.
//!
//! Always returns a string (possibly empty); never errors. Idempotent:
//! running the pipeline on its own output is a no-op.

use std::sync::OnceLock;

use regex::{Captures, Regex, RegexBuilder};

/// Lines containing any of these (case-insensitive) are deleted together
/// with the line before and the two after; join blocks come with framing
/// text on both sides.
const JOIN_MARKERS: &[&str] = &[
    "join microsoft teams meeting",
    "click here to join",
    "meeting id",
    "passcode",
    "dial-in",
    "conference id",
    "join teams meeting",
    "join zoom meeting",
    "one tap mobile",
    "call in",
];

struct Patterns {
    style_script: Regex,
    structural_tag: Regex,
    numeric_entity: Regex,
    any_tag: Regex,
    url: Regex,
    email: Regex,
    phone: Regex,
    long_id: Regex,
    spaces: Regex,
    newline_runs: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        style_script: RegexBuilder::new(r"<(style|script)\b[^>]*>.*?</(style|script)\s*>")
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
            .expect("style/script pattern"),
        structural_tag: RegexBuilder::new(r"<br\s*/?>|</p\s*>|</div\s*>|</li\s*>|</h[1-6]\s*>")
            .case_insensitive(true)
            .build()
            .expect("structural tag pattern"),
        numeric_entity: Regex::new(r"&#(x[0-9a-fA-F]{1,6}|[0-9]{1,7});").expect("entity pattern"),
        any_tag: Regex::new(r"<[^>]*>").expect("tag pattern"),
        url: RegexBuilder::new(r"(https?://\S+|www\.\S+|mailto:\S+)")
            .case_insensitive(true)
            .build()
            .expect("url pattern"),
        email: Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}")
            .expect("email pattern"),
        phone: Regex::new(r"\+?[0-9][0-9 ().\-]{5,}[0-9]").expect("phone pattern"),
        long_id: Regex::new(r"\b[0-9]{6,}\b").expect("long id pattern"),
        spaces: Regex::new(r"[ \t\r\x0b\x0c]+").expect("spaces pattern"),
        newline_runs: Regex::new(r"\n{2,}").expect("newline runs pattern"),
    })
}

/// Sanitize a raw HTML or plaintext body down to a bounded preview.
pub fn sanitize_body(input: &str, max_chars: usize) -> String {
    let p = patterns();

    // 1. Drop style/script blocks wholesale.
    let text = p.style_script.replace_all(input, " ");

    // 2. Structural tags become line breaks so join-block detection still
    //    sees the original line structure.
    let text = p.structural_tag.replace_all(&text, "\n");

    // 3. Entity decode, to fixpoint (double-encoded bodies exist in the wild
    //    and idempotence requires a stable output).
    let mut text = text.into_owned();
    for _ in 0..4 {
        let decoded = decode_entities(&text, &p.numeric_entity);
        if decoded == text {
            break;
        }
        text = decoded;
    }

    // 4. Remaining tags vanish.
    let text = p.any_tag.replace_all(&text, " ");

    // 5. Escaped iCal sequences.
    let text = text.replace("\\n", "\n").replace("\\,", ",").replace("\\;", ";");

    // 6. Join blocks.
    let text = delete_join_blocks(&text);

    // 7. URL / email / phone / long-id scrub.
    let text = p.url.replace_all(&text, " ");
    let text = p.email.replace_all(&text, " ");
    let text = p.phone.replace_all(&text, |caps: &Captures| {
        // Only phone-shaped runs: at least 7 digits in the match. Shorter
        // digit groups ("v2 2024 10") stay untouched.
        let digits = caps[0].chars().filter(char::is_ascii_digit).count();
        if digits >= 7 {
            " ".to_string()
        } else {
            caps[0].to_string()
        }
    });
    let text = p.long_id.replace_all(&text, " ");

    // 8. Whitespace collapse: runs of spaces to one space, tidy newlines.
    let text = p.spaces.replace_all(&text, " ");
    let text = text
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n");
    let text = p.newline_runs.replace_all(&text, "\n");
    let text = text.trim();

    // 9. Truncate (char-based) and strip trailing whitespace.
    let truncated: String = text.chars().take(max_chars).collect();
    truncated.trim_end().to_string()
}

fn decode_entities(input: &str, numeric: &Regex) -> String {
    let named = input
        .replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&");

    numeric
        .replace_all(&named, |caps: &Captures| {
            let body = &caps[1];
            let code = if let Some(hex) = body.strip_prefix('x') {
                u32::from_str_radix(hex, 16).ok()
            } else {
                body.parse::<u32>().ok()
            };
            code.and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_else(|| " ".to_string())
        })
        .into_owned()
}

fn delete_join_blocks(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut drop = vec![false; lines.len()];

    for (i, line) in lines.iter().enumerate() {
        let lower = line.to_lowercase();
        if JOIN_MARKERS.iter().any(|m| lower.contains(m)) {
            if i > 0 {
                drop[i - 1] = true;
            }
            drop[i] = true;
            for offset in 1..=2 {
                if i + offset < lines.len() {
                    drop[i + offset] = true;
                }
            }
        }
    }

    lines
        .iter()
        .zip(&drop)
        .filter(|(_, dropped)| !**dropped)
        .map(|(line, _)| *line)
        .collect::<Vec<_>>()
        .join("\n")
}
