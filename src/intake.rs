//! Task intake and extraction pipeline.
//!
//! Email-shaped events arrive, are deduplicated by a stable key, logged as
//! inbox items, run through LLM field extraction, and turned into tasks with
//! checklists and deterministic priority boosts. The body snippet is
//! transient: it feeds the extractor prompt and is never stored.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_PRIORITY_STAKEHOLDERS;
use crate::db::{NewInboxItem, NewTask, Store, StoreError};
use crate::llm::{GenerateRequest, LlmDispatcher, LlmFeature};
use crate::priority::{intake_priority_boosts, ScoreContext};
use crate::sanitize::sanitize_body;
use crate::types::{EstimateSource, TaskStatus, TaskType};
use crate::util::{clamp_f64, parse_utc, sha256_key};

/// Sanitized body budget fed to the extractor prompt.
const BODY_SNIPPET_MAX_CHARS: usize = 4000;

/// Extraction confidence below this forces `needs_review` and blocks
/// application auto-linking.
const CONFIDENCE_FLOOR: f64 = 0.7;

const EXTRACTION_TIMEOUT_MS: u64 = 8_000;

/// Inbound email-shaped intake payload.
#[derive(Debug, Clone, Deserialize)]
pub struct IntakePayload {
    pub subject: String,
    pub from_email: String,
    #[serde(default)]
    pub from_name: Option<String>,
    pub received_at: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub body_snippet: Option<String>,
}

/// Compute the stable dedupe key for an intake event.
///
/// A message id pins identity exactly; without one, the composite
/// `(subject, from, received_at)` stands in, and two events sharing it are
/// duplicates by design.
pub fn dedupe_key(owner_id: &str, payload: &IntakePayload) -> String {
    match payload.message_id.as_deref().filter(|m| !m.trim().is_empty()) {
        Some(message_id) => sha256_key(&[owner_id, message_id]),
        None => sha256_key(&[
            owner_id,
            &payload.subject,
            &payload.from_email,
            &payload.received_at,
        ]),
    }
}

/// Fields the extractor is asked to produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Extraction {
    pub title: String,
    pub description: Option<String>,
    pub task_type: Option<String>,
    pub implementation_guess: Option<String>,
    pub implementation_confidence: Option<f64>,
    pub due_guess_iso: Option<String>,
    pub estimated_minutes: Option<u32>,
    pub priority_score: Option<f64>,
    pub stakeholder_mentions: Vec<String>,
    pub suggested_checklist: Vec<String>,
    pub needs_review: bool,
    pub confidence: f64,
}

impl Default for Extraction {
    fn default() -> Self {
        Self {
            title: String::new(),
            description: None,
            task_type: None,
            implementation_guess: None,
            implementation_confidence: None,
            due_guess_iso: None,
            estimated_minutes: None,
            priority_score: None,
            stakeholder_mentions: Vec::new(),
            suggested_checklist: Vec::new(),
            needs_review: false,
            confidence: 0.0,
        }
    }
}

/// Parse and normalize the extractor's reply. Tolerates code fences and
/// clamps numeric fields into their contract ranges; an empty title is the
/// one unrecoverable shape.
pub fn parse_extraction(raw: &str) -> Result<Extraction, String> {
    let trimmed = strip_code_fences(raw);
    let mut extraction: Extraction =
        serde_json::from_str(&trimmed).map_err(|e| format!("extraction JSON invalid: {e}"))?;

    extraction.title = extraction.title.trim().to_string();
    if extraction.title.is_empty() {
        return Err("extraction produced an empty title".to_string());
    }

    extraction.confidence = clamp_f64(extraction.confidence, 0.0, 1.0);
    if let Some(c) = extraction.implementation_confidence {
        extraction.implementation_confidence = Some(clamp_f64(c, 0.0, 1.0));
    }
    if let Some(m) = extraction.estimated_minutes {
        extraction.estimated_minutes = Some(m.clamp(1, 480));
    }
    if let Some(p) = extraction.priority_score {
        extraction.priority_score = Some(clamp_f64(p, 0.0, 100.0));
    }

    // Set semantics with stable order.
    let mut seen = std::collections::HashSet::new();
    extraction
        .stakeholder_mentions
        .retain(|m| seen.insert(m.trim().to_lowercase()));

    Ok(extraction)
}

fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.trim_end_matches('`').trim().to_string()
}

/// Resolve the extractor's application guess against the owner's portfolio:
/// confident guesses substring-match names case-insensitively, first match
/// wins.
pub fn resolve_implementation(
    guess: Option<&str>,
    guess_confidence: Option<f64>,
    applications: &[(String, String)],
) -> Option<String> {
    let guess = guess?.trim().to_lowercase();
    if guess.is_empty() || guess_confidence.unwrap_or(0.0) < CONFIDENCE_FLOOR {
        return None;
    }
    applications
        .iter()
        .find(|(_, name)| {
            let name = name.to_lowercase();
            name.contains(&guess) || guess.contains(&name)
        })
        .map(|(id, _)| id.clone())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IntakeResult {
    /// Same dedupe key seen before; nothing new was created.
    Duplicate { inbox_item_id: String },
    /// Task (and checklist) created from a fresh extraction.
    Created {
        inbox_item_id: String,
        task_id: String,
        needs_review: bool,
        checklist_items: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Extraction failed after fallback; the inbox item carries the error.
    #[error("extraction failed for inbox item {inbox_item_id}")]
    Extraction { inbox_item_id: String },
}

/// Run the full intake pipeline for one inbound event.
pub async fn process_email_intake(
    store: &Store,
    dispatcher: &LlmDispatcher,
    owner_id: &str,
    payload: &IntakePayload,
) -> Result<IntakeResult, IntakeError> {
    let key = dedupe_key(owner_id, payload);

    // 1. Dedupe before any insert.
    if let Some(existing) = store.find_inbox_item_by_key(owner_id, &key)? {
        log_event(store, owner_id, Some(&existing.id), "deduped", None);
        return Ok(IntakeResult::Duplicate {
            inbox_item_id: existing.id,
        });
    }

    // 2. Inbox item first; everything downstream hangs off its id. A lost
    //    insert race resolves to the dedupe path.
    let item = match store.create_inbox_item(
        owner_id,
        &NewInboxItem {
            dedupe_key: key.clone(),
            subject: payload.subject.clone(),
            from_email: payload.from_email.clone(),
            from_name: payload.from_name.clone(),
            received_at: payload.received_at.clone(),
            message_id: payload.message_id.clone(),
            source_url: payload.source_url.clone(),
        },
    ) {
        Ok(item) => item,
        Err(StoreError::Conflict(_)) => {
            if let Some(existing) = store.find_inbox_item_by_key(owner_id, &key)? {
                log_event(store, owner_id, Some(&existing.id), "deduped", None);
                return Ok(IntakeResult::Duplicate {
                    inbox_item_id: existing.id,
                });
            }
            return Err(StoreError::Conflict("inbox insert race lost twice".into()).into());
        }
        Err(e) => return Err(e.into()),
    };
    log_event(store, owner_id, Some(&item.id), "received", None);

    // 3. Portfolio context for the extractor.
    let applications = store.list_applications(owner_id)?;
    let app_context: Vec<(String, String)> = applications
        .iter()
        .map(|a| (a.id.clone(), a.name.clone()))
        .collect();

    // 4. Extraction via dispatch.
    let request = GenerateRequest {
        feature: LlmFeature::IntakeExtraction,
        system_prompt: extraction_system_prompt(),
        user_prompt: extraction_user_prompt(payload, &applications),
        temperature: 0.1,
        max_tokens: 1200,
        timeout_ms: EXTRACTION_TIMEOUT_MS,
        request_fingerprint: sha256_key(&[owner_id, "intake_extraction", &key]),
    };

    let generated = dispatcher.generate_text(store, owner_id, &request).await;
    let extraction = match generated
        .as_ref()
        .ok_or_else(|| "no provider available".to_string())
        .and_then(|(text, _)| parse_extraction(text))
    {
        Ok(extraction) => extraction,
        Err(reason) => {
            store.mark_inbox_error(owner_id, &item.id, &reason)?;
            log_event(store, owner_id, Some(&item.id), "error", Some(&reason));
            return Err(IntakeError::Extraction {
                inbox_item_id: item.id,
            });
        }
    };

    // 5. Persist extraction, flip to Processed.
    let extraction_json =
        serde_json::to_string(&extraction).unwrap_or_else(|_| "{}".to_string());
    let model_used = generated.as_ref().map(|(_, meta)| meta.model_id.clone());
    store.mark_inbox_processed(
        owner_id,
        &item.id,
        &extraction_json,
        model_used.as_deref(),
        Some(extraction.confidence),
    )?;
    log_event(store, owner_id, Some(&item.id), "extracted", None);

    // 6. Application link.
    let implementation_id = resolve_implementation(
        extraction.implementation_guess.as_deref(),
        extraction.implementation_confidence,
        &app_context,
    );

    // 7. Deterministic priority boosts on top of the extracted base.
    let due_at = extraction.due_guess_iso.as_deref().and_then(parse_utc);
    let ctx = ScoreContext::new(Utc::now(), DEFAULT_PRIORITY_STAKEHOLDERS);
    let boosts = intake_priority_boosts(
        &extraction.stakeholder_mentions,
        due_at,
        &extraction.title,
        TaskStatus::Planned,
        &ctx,
    );
    let final_priority = clamp_f64(extraction.priority_score.unwrap_or(50.0) + boosts, 0.0, 100.0);

    // 8. Task creation.
    let needs_review = extraction.needs_review || extraction.confidence < CONFIDENCE_FLOOR;
    let task = store.create_task(
        owner_id,
        &NewTask {
            title: extraction.title.clone(),
            description: extraction.description.clone(),
            implementation_id,
            status: Some(TaskStatus::Planned),
            task_type: extraction.task_type.as_deref().and_then(TaskType::parse),
            priority_score: Some(final_priority),
            estimated_minutes: extraction.estimated_minutes,
            estimate_source: Some(EstimateSource::Llm),
            due_at: due_at.map(|d| d.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            needs_review,
            stakeholder_mentions: extraction.stakeholder_mentions.clone(),
            source_type: Some("email".to_string()),
            source_url: payload.source_url.clone(),
            inbox_item_id: Some(item.id.clone()),
            ..NewTask::default()
        },
    )?;

    // 9. Checklist, preserving extractor order.
    let mut checklist_items = 0;
    for (index, label) in extraction.suggested_checklist.iter().enumerate() {
        let label = label.trim();
        if label.is_empty() {
            continue;
        }
        store.add_checklist_item(owner_id, &task.id, label, index as i64)?;
        checklist_items += 1;
    }

    log_event(store, owner_id, Some(&item.id), "task_created", Some(&task.id));

    Ok(IntakeResult::Created {
        inbox_item_id: item.id,
        task_id: task.id,
        needs_review,
        checklist_items,
    })
}

/// Audit logging never interrupts the pipeline.
fn log_event(store: &Store, owner_id: &str, item_id: Option<&str>, kind: &str, detail: Option<&str>) {
    if let Err(e) = store.log_ingestion_event(owner_id, item_id, kind, detail) {
        tracing::warn!("ingestion event write failed: {e}");
    }
}

fn extraction_system_prompt() -> String {
    "You extract actionable work items from emails. Reply with a single JSON object and \
     nothing else, using these fields: title (string, required), description (string), \
     task_type (one of task, ticket, meeting_prep, follow_up, admin, build), \
     implementation_guess (string), implementation_confidence (0-1), due_guess_iso \
     (ISO-8601), estimated_minutes (1-480), priority_score (0-100), stakeholder_mentions \
     (array of names), suggested_checklist (array of short steps, in execution order), \
     needs_review (boolean), confidence (0-1). Use null for anything you cannot infer."
        .to_string()
}

fn extraction_user_prompt(
    payload: &IntakePayload,
    applications: &[crate::db::DbApplication],
) -> String {
    let app_lines: Vec<String> = applications
        .iter()
        .map(|a| {
            if a.keywords.is_empty() {
                format!("- {}", a.name)
            } else {
                format!("- {} (keywords: {})", a.name, a.keywords.join(", "))
            }
        })
        .collect();

    let body = payload
        .body_snippet
        .as_deref()
        .map(|b| sanitize_body(b, BODY_SNIPPET_MAX_CHARS))
        .unwrap_or_default();

    format!(
        "Subject: {subject}\nFrom: {from_name} <{from_email}>\nReceived: {received}\n\n\
         Known applications:\n{apps}\n\nBody:\n{body}",
        subject = payload.subject,
        from_name = payload.from_name.as_deref().unwrap_or(""),
        from_email = payload.from_email,
        received = payload.received_at,
        apps = if app_lines.is_empty() {
            "(none)".to_string()
        } else {
            app_lines.join("\n")
        },
        body = body,
    )
}
