//! Anthropic messages-API adapter.

use serde_json::{json, Value};

use super::{ModelProvider, ProviderError, ProviderRequest, ProviderResponse};

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl ModelProvider for AnthropicProvider {
    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let body = json!({
            "model": request.model_id,
            "system": request.system_prompt,
            "messages": [{ "role": "user", "content": request.user_prompt }],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        let response = self
            .client
            .post(ANTHROPIC_API_BASE)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let payload = super::check_http_response(response).await?;
        let parsed: Value =
            serde_json::from_str(&payload).map_err(|e| ProviderError::Parse(e.to_string()))?;

        let text = parse_content_text(&parsed)?;
        let (input_tokens, output_tokens) = parse_usage(&parsed);

        Ok(ProviderResponse {
            text,
            input_tokens,
            output_tokens,
        })
    }
}

fn parse_content_text(value: &Value) -> Result<String, ProviderError> {
    let Some(content_items) = value.get("content").and_then(Value::as_array) else {
        return Err(ProviderError::Parse("missing content array".to_owned()));
    };

    let mut text = String::new();
    for item in content_items {
        if item.get("type").and_then(Value::as_str) == Some("text") {
            text.push_str(item.get("text").and_then(Value::as_str).unwrap_or_default());
        }
    }
    Ok(text)
}

fn parse_usage(value: &Value) -> (Option<i64>, Option<i64>) {
    let usage = value.get("usage");
    let input = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(Value::as_i64);
    let output = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(Value::as_i64);
    (input, output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_and_usage_from_messages_response() {
        let payload = json!({
            "content": [
                { "type": "text", "text": "First block. " },
                { "type": "text", "text": "Second block." }
            ],
            "usage": { "input_tokens": 812, "output_tokens": 44 }
        });
        assert_eq!(
            parse_content_text(&payload).unwrap(),
            "First block. Second block."
        );
        assert_eq!(parse_usage(&payload), (Some(812), Some(44)));
    }

    #[test]
    fn missing_content_is_a_parse_error() {
        let payload = json!({ "usage": {} });
        assert!(matches!(
            parse_content_text(&payload),
            Err(ProviderError::Parse(_))
        ));
    }
}
