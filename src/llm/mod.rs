//! LLM dispatch layer.
//!
//! Policy (which model, in what order) is separated from I/O (calling a
//! provider): [`resolve_candidates`] turns stored preferences plus the
//! built-in chains into an ordered candidate list, and [`LlmDispatcher`]
//! walks that list until one provider succeeds. Every attempt (success,
//! timeout, error, skip) lands in the usage log.

pub mod anthropic;
pub mod catalog;
pub mod openai;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;

use crate::config::Config;
use crate::db::{Store, UsageEventInput};

pub use catalog::{default_chain, ChainEntry, LlmFeature, ModelSource, Provider};

/// Usage events older than this are pruned.
pub const USAGE_RETENTION_DAYS: i64 = 30;

/// Minimum interval between best-effort usage prunes, per process.
const PRUNE_INTERVAL_SECS: u64 = 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Provider contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model_id: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider timed out")]
    Timeout,
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("provider returned status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("provider response parse error: {0}")]
    Parse(String),
}

impl ProviderError {
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err.to_string())
        }
    }

    /// Failure taxonomy bucket for the usage log.
    fn status_label(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            other => {
                // Some transports report timeouts as plain errors.
                if other.to_string().to_lowercase().contains("timeout") {
                    "timeout"
                } else {
                    "error"
                }
            }
        }
    }
}

/// Check status and return the body, scrubbing anything secret-shaped from
/// error payloads before they can reach logs.
pub(crate) async fn check_http_response(
    response: reqwest::Response,
) -> Result<String, ProviderError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(ProviderError::from_reqwest)?;
    if !status.is_success() {
        return Err(ProviderError::HttpStatus {
            status: status.as_u16(),
            body: sanitize_error_body(&body),
        });
    }
    Ok(body)
}

fn sanitize_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [r"sk-ant-[A-Za-z0-9_\-]{10,}", r"sk-[A-Za-z0-9]{32,}"] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }
    sanitized
}

/// One model backend. Implementations must be `Send + Sync`; the dispatcher
/// owns the timeout, adapters only propagate cancellation.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}

// ---------------------------------------------------------------------------
// Candidate resolution (pure policy over store rows)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCandidate {
    pub provider: Provider,
    pub model_id: String,
    pub source: ModelSource,
    pub input_price_per_mtok: Option<f64>,
    pub output_price_per_mtok: Option<f64>,
}

/// Resolution order: enabled feature override, else enabled global default,
/// else the built-in chain; the remaining chain (deduplicated by
/// provider × model) always trails as fallback.
pub fn resolve_candidates(
    store: &Store,
    owner_id: &str,
    feature: LlmFeature,
) -> Vec<ResolvedCandidate> {
    let mut candidates: Vec<ResolvedCandidate> = Vec::new();

    let mut try_pref = |pref_feature: LlmFeature, source: ModelSource| {
        let catalog_id = store
            .get_model_preference(owner_id, pref_feature.as_str())
            .ok()
            .flatten()?;
        let row = store.get_catalog_model(&catalog_id).ok().flatten()?;
        if !row.enabled {
            return None;
        }
        let provider = Provider::parse(&row.provider)?;
        Some(ResolvedCandidate {
            provider,
            model_id: row.model_id,
            source,
            input_price_per_mtok: row.input_price_per_mtok,
            output_price_per_mtok: row.output_price_per_mtok,
        })
    };

    if let Some(primary) = try_pref(feature, ModelSource::FeatureOverride) {
        candidates.push(primary);
    } else if feature != LlmFeature::GlobalDefault {
        if let Some(primary) = try_pref(LlmFeature::GlobalDefault, ModelSource::GlobalDefault) {
            candidates.push(primary);
        }
    }

    for entry in default_chain(feature) {
        let duplicate = candidates
            .iter()
            .any(|c| c.provider == entry.provider && c.model_id == entry.model_id);
        if duplicate {
            continue;
        }
        let row = store
            .find_catalog_model(entry.provider.as_str(), entry.model_id)
            .ok()
            .flatten();
        candidates.push(ResolvedCandidate {
            provider: entry.provider,
            model_id: entry.model_id.to_string(),
            source: ModelSource::Default,
            input_price_per_mtok: row.as_ref().and_then(|r| r.input_price_per_mtok),
            output_price_per_mtok: row.as_ref().and_then(|r| r.output_price_per_mtok),
        });
    }

    candidates
}

/// `tokens × $/1M`, only when both prices are known.
pub fn estimate_cost_usd(
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    input_price_per_mtok: Option<f64>,
    output_price_per_mtok: Option<f64>,
) -> Option<f64> {
    let (input_price, output_price) = (input_price_per_mtok?, output_price_per_mtok?);
    let input = input_tokens? as f64;
    let output = output_tokens? as f64;
    Some(input * input_price / 1e6 + output * output_price / 1e6)
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub feature: LlmFeature,
    pub system_prompt: String,
    pub user_prompt: String,
    /// Clamped to [0, 1].
    pub temperature: f64,
    /// Clamped to [32, 4000].
    pub max_tokens: u32,
    /// Clamped to [500, 30000].
    pub timeout_ms: u64,
    pub request_fingerprint: String,
}

/// Telemetry for a successful generation, echoed to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateMeta {
    pub provider: String,
    pub model_id: String,
    pub model_source: ModelSource,
    pub latency_ms: i64,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub estimated_cost_usd: Option<f64>,
    pub cache_status: String,
}

pub struct LlmDispatcher {
    providers: HashMap<Provider, Arc<dyn ModelProvider>>,
}

impl LlmDispatcher {
    /// Build real adapters for every configured API key.
    pub fn from_config(config: &Config) -> Self {
        let mut providers: HashMap<Provider, Arc<dyn ModelProvider>> = HashMap::new();
        if let Some(ref key) = config.anthropic_api_key {
            providers.insert(
                Provider::Anthropic,
                Arc::new(anthropic::AnthropicProvider::new(key.clone())),
            );
        }
        if let Some(ref key) = config.openai_api_key {
            providers.insert(
                Provider::Openai,
                Arc::new(openai::OpenAiProvider::new(key.clone())),
            );
        }
        Self { providers }
    }

    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Swap in a backend (tests, alternate transports).
    pub fn with_provider(mut self, provider: Provider, backend: Arc<dyn ModelProvider>) -> Self {
        self.providers.insert(provider, backend);
        self
    }

    /// Walk the candidate chain; first success wins. Returns `None` when
    /// the chain is exhausted. Every attempt writes one usage event.
    pub async fn generate_text(
        &self,
        store: &Store,
        owner_id: &str,
        request: &GenerateRequest,
    ) -> Option<(String, GenerateMeta)> {
        let temperature = request.temperature.clamp(0.0, 1.0);
        let max_tokens = request.max_tokens.clamp(32, 4000);
        let timeout_ms = request.timeout_ms.clamp(500, 30_000);

        let candidates = resolve_candidates(store, owner_id, request.feature);

        for candidate in candidates {
            let Some(backend) = self.providers.get(&candidate.provider) else {
                self.log_attempt(store, owner_id, request, &candidate, "skipped_unconfigured", 0, None, None);
                continue;
            };

            let provider_request = ProviderRequest {
                model_id: candidate.model_id.clone(),
                system_prompt: request.system_prompt.clone(),
                user_prompt: request.user_prompt.clone(),
                temperature,
                max_tokens,
                timeout: Duration::from_millis(timeout_ms),
            };

            let started = std::time::Instant::now();
            // The dispatcher owns cancellation: when the deadline fires the
            // in-flight future is dropped, which aborts the request.
            let outcome = tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                backend.generate(&provider_request),
            )
            .await;
            let latency_ms = started.elapsed().as_millis() as i64;

            match outcome {
                Ok(Ok(response)) => {
                    let text = collapse_result_text(&response.text);
                    let cost = estimate_cost_usd(
                        response.input_tokens,
                        response.output_tokens,
                        candidate.input_price_per_mtok,
                        candidate.output_price_per_mtok,
                    );
                    self.log_attempt(
                        store,
                        owner_id,
                        request,
                        &candidate,
                        "success",
                        latency_ms,
                        response.input_tokens,
                        response.output_tokens,
                    );
                    maybe_prune_usage(store);
                    let meta = GenerateMeta {
                        provider: candidate.provider.as_str().to_string(),
                        model_id: candidate.model_id.clone(),
                        model_source: candidate.source,
                        latency_ms,
                        input_tokens: response.input_tokens,
                        output_tokens: response.output_tokens,
                        estimated_cost_usd: cost,
                        cache_status: "miss".to_string(),
                    };
                    return Some((text, meta));
                }
                Ok(Err(err)) => {
                    tracing::warn!(
                        provider = candidate.provider.as_str(),
                        model = %candidate.model_id,
                        "llm attempt failed: {err}"
                    );
                    self.log_attempt(
                        store,
                        owner_id,
                        request,
                        &candidate,
                        err.status_label(),
                        latency_ms,
                        None,
                        None,
                    );
                }
                Err(_elapsed) => {
                    tracing::warn!(
                        provider = candidate.provider.as_str(),
                        model = %candidate.model_id,
                        "llm attempt timed out after {timeout_ms}ms"
                    );
                    self.log_attempt(
                        store,
                        owner_id,
                        request,
                        &candidate,
                        "timeout",
                        latency_ms,
                        None,
                        None,
                    );
                }
            }
        }

        None
    }

    /// Record a cache hit against the feature's primary candidate.
    pub fn log_cache_hit(&self, store: &Store, owner_id: &str, request: &GenerateRequest) {
        if let Some(candidate) = resolve_candidates(store, owner_id, request.feature).into_iter().next()
        {
            let event = UsageEventInput {
                feature: request.feature.as_str().to_string(),
                provider: candidate.provider.as_str().to_string(),
                model_id: candidate.model_id,
                model_source: candidate.source.as_str().to_string(),
                status: "cache_hit".to_string(),
                latency_ms: 0,
                input_tokens: None,
                output_tokens: None,
                estimated_cost_usd: None,
                cache_status: Some("hit".to_string()),
                request_fingerprint: Some(request.request_fingerprint.clone()),
            };
            if let Err(e) = store.insert_usage_event(owner_id, &event) {
                tracing::warn!("usage event write failed: {e}");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn log_attempt(
        &self,
        store: &Store,
        owner_id: &str,
        request: &GenerateRequest,
        candidate: &ResolvedCandidate,
        status: &str,
        latency_ms: i64,
        input_tokens: Option<i64>,
        output_tokens: Option<i64>,
    ) {
        let estimated_cost_usd = if status == "success" {
            estimate_cost_usd(
                input_tokens,
                output_tokens,
                candidate.input_price_per_mtok,
                candidate.output_price_per_mtok,
            )
        } else {
            None
        };
        let event = UsageEventInput {
            feature: request.feature.as_str().to_string(),
            provider: candidate.provider.as_str().to_string(),
            model_id: candidate.model_id.clone(),
            model_source: candidate.source.as_str().to_string(),
            status: status.to_string(),
            latency_ms,
            input_tokens,
            output_tokens,
            estimated_cost_usd,
            cache_status: if status == "success" {
                Some("miss".to_string())
            } else {
                None
            },
            request_fingerprint: Some(request.request_fingerprint.clone()),
        };
        if let Err(e) = store.insert_usage_event(owner_id, &event) {
            tracing::warn!("usage event write failed: {e}");
        }
    }
}

/// Trim and collapse horizontal whitespace; newlines survive so downstream
/// validation can still see them.
fn collapse_result_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (i, line) in text.lines().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&line.split_whitespace().collect::<Vec<_>>().join(" "));
    }
    out.trim().to_string()
}

static LAST_PRUNE_EPOCH: AtomicU64 = AtomicU64::new(0);

/// Best-effort usage prune, at most once per 24h per process. Correctness
/// never depends on it.
fn maybe_prune_usage(store: &Store) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let last = LAST_PRUNE_EPOCH.load(Ordering::Relaxed);
    if now.saturating_sub(last) < PRUNE_INTERVAL_SECS {
        return;
    }
    if LAST_PRUNE_EPOCH
        .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
        .is_err()
    {
        return;
    }
    match store.prune_usage_events(USAGE_RETENTION_DAYS) {
        Ok(n) if n > 0 => tracing::info!("pruned {n} usage events"),
        Ok(_) => {}
        Err(e) => tracing::warn!("usage prune failed: {e}"),
    }
}
