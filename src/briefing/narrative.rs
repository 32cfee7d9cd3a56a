//! Narrative generation over a composed briefing.
//!
//! A narrative is sugar: two or three plain sentences over the structured
//! payload. Responses are cached per `(owner, date, mode, model scope,
//! context hash)` for 30 minutes; output that breaks the format contract is
//! discarded rather than repaired.

use dashmap::DashMap;
use serde_json::json;

use crate::db::Store;
use crate::llm::{GenerateMeta, GenerateRequest, LlmDispatcher, LlmFeature};
use crate::util::sha256_key;

use super::{Briefing, BriefingMode};

/// Verbatim contract with the model.
pub const NARRATIVE_SYSTEM_PROMPT: &str = "You are a concise executive assistant. Write exactly \
     2-3 sentences. Be direct and specific, mentioning concrete task names, meeting titles, and \
     times. Do not use bullet points. Do not use motivational language. Only use details present \
     in the provided context.";

pub const NARRATIVE_TTL_MS: u64 = 30 * 60 * 1000;

const NARRATIVE_TIMEOUT_MS: u64 = 4_500;
const MAX_SENTENCES: usize = 3;

struct CacheEntry {
    text: String,
    meta: GenerateMeta,
    expires_at_ms: u64,
}

/// Process-wide narrative cache. Non-persistent: lost on restart, which
/// only costs one regeneration.
#[derive(Default)]
pub struct NarrativeCache {
    entries: DashMap<String, CacheEntry>,
}

impl NarrativeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &str, now_ms: u64) -> Option<(String, GenerateMeta)> {
        let entry = self.entries.get(key)?;
        if entry.expires_at_ms <= now_ms {
            return None;
        }
        Some((entry.text.clone(), entry.meta.clone()))
    }

    fn put(&self, key: String, text: String, meta: GenerateMeta, now_ms: u64) {
        self.entries.insert(
            key,
            CacheEntry {
                text,
                meta,
                expires_at_ms: now_ms + NARRATIVE_TTL_MS,
            },
        );
    }

    /// Opportunistic expiry sweep, run on every narrative request.
    fn prune(&self, now_ms: u64) {
        self.entries.retain(|_, entry| entry.expires_at_ms > now_ms);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Format contract: non-empty, no bullets, no line breaks, at most three
/// sentences.
pub fn validate_narrative(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.contains('\n') {
        return false;
    }
    if trimmed
        .lines()
        .any(|line| matches!(line.trim_start().chars().next(), Some('-' | '*' | '•')))
    {
        return false;
    }
    let sentences = trimmed
        .split(['.', '!', '?'])
        .filter(|s| !s.trim().is_empty())
        .count();
    sentences <= MAX_SENTENCES
}

/// Mode-specific context fed to the model. Only material already in the
/// briefing payload appears here.
pub fn build_context(briefing: &Briefing) -> serde_json::Value {
    let today = &briefing.today;
    let meetings: Vec<_> = today
        .meetings
        .iter()
        .map(|m| json!({ "title": m.title, "startAt": m.start_at }))
        .collect();

    match briefing.mode {
        BriefingMode::Midday => json!({
            "mode": "midday",
            "date": briefing.requested_date,
            "progress": today.progress,
            "remainingTop": today.remaining.iter().take(5).map(|t| &t.title).collect::<Vec<_>>(),
            "meetings": meetings,
        }),
        BriefingMode::Eod => {
            let tomorrow = briefing.tomorrow.as_ref();
            json!({
                "mode": "eod",
                "date": briefing.requested_date,
                "progress": today.progress,
                "tomorrowMeetings": tomorrow.map(|t| t.meetings.iter()
                    .map(|m| json!({ "title": m.title, "startAt": m.start_at }))
                    .collect::<Vec<_>>()),
                "prepTasks": tomorrow.map(|t| t.prep_tasks.iter()
                    .map(|p| &p.title).collect::<Vec<_>>()),
                "rolledOver": tomorrow.map(|t| t.rolled_over.iter()
                    .map(|r| &r.title).collect::<Vec<_>>()),
            })
        }
        // morning (auto has been resolved by composition time)
        _ => json!({
            "mode": "morning",
            "date": briefing.requested_date,
            "meetings": meetings,
            "plannedTop": today.planned.iter().take(5).map(|t| &t.title).collect::<Vec<_>>(),
            "capacity": today.capacity,
            "focusBlocks": today.calendar.focus_blocks.len(),
        }),
    }
}

fn cache_key(owner_id: &str, briefing: &Briefing, model_scope: &str, context_hash: &str) -> String {
    format!(
        "{owner_id}|{}|{}|{model_scope}|{context_hash}",
        briefing.requested_date,
        briefing.mode.as_str()
    )
}

/// Produce (narrative, meta) for a briefing. Empty narrative + `None` meta
/// means the model was unavailable or its output failed validation; the
/// briefing itself is unaffected.
pub async fn narrative_for_briefing(
    store: &Store,
    dispatcher: &LlmDispatcher,
    cache: &NarrativeCache,
    owner_id: &str,
    briefing: &Briefing,
    now_ms: u64,
) -> (String, Option<GenerateMeta>) {
    cache.prune(now_ms);

    let context = build_context(briefing);
    let context_json = context.to_string();
    let context_hash = sha256_key(&[&context_json]);

    let model_scope = store
        .get_model_preference(owner_id, LlmFeature::BriefingNarrative.as_str())
        .ok()
        .flatten()
        .unwrap_or_else(|| "default".to_string());

    let key = cache_key(owner_id, briefing, &model_scope, &context_hash);

    let request = GenerateRequest {
        feature: LlmFeature::BriefingNarrative,
        system_prompt: NARRATIVE_SYSTEM_PROMPT.to_string(),
        user_prompt: format!("Context:\n{context_json}"),
        temperature: 0.4,
        max_tokens: 256,
        timeout_ms: NARRATIVE_TIMEOUT_MS,
        request_fingerprint: sha256_key(&[&key]),
    };

    if let Some((text, cached_meta)) = cache.get(&key, now_ms) {
        dispatcher.log_cache_hit(store, owner_id, &request);
        let meta = GenerateMeta {
            latency_ms: 0,
            cache_status: "hit".to_string(),
            ..cached_meta
        };
        return (text, Some(meta));
    }

    let Some((text, meta)) = dispatcher.generate_text(store, owner_id, &request).await else {
        return (String::new(), None);
    };

    if !validate_narrative(&text) {
        tracing::debug!("narrative failed validation; dropping");
        return (String::new(), None);
    }

    cache.put(key, text.clone(), meta.clone(), now_ms);
    (text, Some(meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::briefing::{compose_briefing, BriefingMode};
    use crate::calendar::WorkdaySpec;
    use crate::llm::testing::MockProvider;
    use crate::llm::Provider;
    use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};

    fn spec() -> WorkdaySpec {
        WorkdaySpec {
            tz: chrono_tz::America::New_York,
            focus_start: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            focus_end: NaiveTime::from_hms_opt(16, 30, 0).unwrap(),
        }
    }

    fn briefing(store: &Store) -> Briefing {
        compose_briefing(
            store,
            "o1",
            &spec(),
            BriefingMode::Morning,
            Some(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()),
            Utc.with_ymd_and_hms(2026, 3, 2, 13, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn validation_rejects_bullets_newlines_and_rambles() {
        assert!(validate_narrative(
            "Two meetings this morning. Ship the cutover fix by 2 PM."
        ));
        assert!(!validate_narrative(""));
        assert!(!validate_narrative("   "));
        assert!(!validate_narrative("- point one\n- point two\n- point three"));
        assert!(!validate_narrative("• lead bullet"));
        assert!(!validate_narrative("Line one.\nLine two."));
        assert!(!validate_narrative("One. Two. Three. Four."));
        assert!(validate_narrative("One. Two. Three."));
    }

    #[test]
    fn context_varies_by_mode() {
        let store = Store::open_in_memory().unwrap();
        let morning = briefing(&store);
        let ctx = build_context(&morning);
        assert_eq!(ctx["mode"], "morning");
        assert!(ctx.get("plannedTop").is_some());

        let eod = compose_briefing(
            &store,
            "o1",
            &spec(),
            BriefingMode::Eod,
            Some(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()),
            Utc.with_ymd_and_hms(2026, 3, 2, 21, 0, 0).unwrap(),
        )
        .unwrap();
        let ctx = build_context(&eod);
        assert_eq!(ctx["mode"], "eod");
        assert!(ctx.get("prepTasks").is_some());
    }

    #[tokio::test]
    async fn second_identical_request_hits_cache() {
        let store = Store::open_in_memory().unwrap();
        let cache = NarrativeCache::new();
        // One canned reply only: a second provider call would fail.
        let dispatcher = crate::llm::LlmDispatcher::empty().with_provider(
            Provider::Anthropic,
            MockProvider::replying("Quiet calendar. Start with the cutover fix."),
        );
        let briefing = briefing(&store);

        let (first, first_meta) =
            narrative_for_briefing(&store, &dispatcher, &cache, "o1", &briefing, 1_000).await;
        assert_eq!(first, "Quiet calendar. Start with the cutover fix.");
        assert_eq!(first_meta.as_ref().unwrap().cache_status, "miss");

        let (second, second_meta) =
            narrative_for_briefing(&store, &dispatcher, &cache, "o1", &briefing, 2_000).await;
        assert_eq!(second, first, "cache returns identical text");
        let meta = second_meta.unwrap();
        assert_eq!(meta.cache_status, "hit");
        assert_eq!(meta.latency_ms, 0);

        // Usage log shows one success then one cache_hit.
        let events = store.list_usage_events("o1", 10).unwrap();
        assert_eq!(events[0].status, "cache_hit");
        assert_eq!(events[0].latency_ms, 0);
        assert_eq!(events[1].status, "success");
    }

    #[tokio::test]
    async fn cache_expires_after_ttl() {
        let store = Store::open_in_memory().unwrap();
        let cache = NarrativeCache::new();
        let dispatcher = crate::llm::LlmDispatcher::empty().with_provider(
            Provider::Anthropic,
            MockProvider::new(vec![
                Ok(crate::llm::ProviderResponse {
                    text: "First answer.".into(),
                    input_tokens: None,
                    output_tokens: None,
                }),
                Ok(crate::llm::ProviderResponse {
                    text: "Second answer.".into(),
                    input_tokens: None,
                    output_tokens: None,
                }),
            ]),
        );
        let briefing = briefing(&store);

        let (first, _) =
            narrative_for_briefing(&store, &dispatcher, &cache, "o1", &briefing, 0).await;
        assert_eq!(first, "First answer.");

        let after_ttl = NARRATIVE_TTL_MS + 1;
        let (second, _) =
            narrative_for_briefing(&store, &dispatcher, &cache, "o1", &briefing, after_ttl).await;
        assert_eq!(second, "Second answer.");
        assert_eq!(cache.len(), 1, "expired entry was pruned");
    }

    #[tokio::test]
    async fn invalid_output_returns_empty_and_skips_cache() {
        let store = Store::open_in_memory().unwrap();
        let cache = NarrativeCache::new();
        let dispatcher = crate::llm::LlmDispatcher::empty().with_provider(
            Provider::Anthropic,
            MockProvider::replying("- point one\n- point two\n- point three"),
        );
        let briefing = briefing(&store);

        let (text, meta) =
            narrative_for_briefing(&store, &dispatcher, &cache, "o1", &briefing, 0).await;
        assert_eq!(text, "");
        assert!(meta.is_none());
        assert_eq!(cache.len(), 0, "no cache entry for rejected output");
    }

    #[tokio::test]
    async fn unavailable_model_degrades_to_empty() {
        let store = Store::open_in_memory().unwrap();
        let cache = NarrativeCache::new();
        let dispatcher = crate::llm::LlmDispatcher::empty();
        let briefing = briefing(&store);

        let (text, meta) =
            narrative_for_briefing(&store, &dispatcher, &cache, "o1", &briefing, 0).await;
        assert_eq!(text, "");
        assert!(meta.is_none());
    }
}
