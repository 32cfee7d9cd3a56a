//! OpenAI chat-completions adapter.

use serde_json::{json, Value};

use super::{ModelProvider, ProviderError, ProviderRequest, ProviderResponse};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl ModelProvider for OpenAiProvider {
    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let body = json!({
            "model": request.model_id,
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.user_prompt }
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        let response = self
            .client
            .post(OPENAI_API_BASE)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let payload = super::check_http_response(response).await?;
        let parsed: Value =
            serde_json::from_str(&payload).map_err(|e| ProviderError::Parse(e.to_string()))?;

        let text = parse_choice_text(&parsed)?;
        let (input_tokens, output_tokens) = parse_usage(&parsed);

        Ok(ProviderResponse {
            text,
            input_tokens,
            output_tokens,
        })
    }
}

fn parse_choice_text(value: &Value) -> Result<String, ProviderError> {
    value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| ProviderError::Parse("missing choices[0].message.content".to_owned()))
}

fn parse_usage(value: &Value) -> (Option<i64>, Option<i64>) {
    let usage = value.get("usage");
    let input = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(Value::as_i64);
    let output = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(Value::as_i64);
    (input, output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat_completion_response() {
        let payload = json!({
            "choices": [
                { "message": { "role": "assistant", "content": "Three tasks today." } }
            ],
            "usage": { "prompt_tokens": 640, "completion_tokens": 28 }
        });
        assert_eq!(parse_choice_text(&payload).unwrap(), "Three tasks today.");
        assert_eq!(parse_usage(&payload), (Some(640), Some(28)));
    }

    #[test]
    fn empty_choices_is_a_parse_error() {
        let payload = json!({ "choices": [] });
        assert!(matches!(
            parse_choice_text(&payload),
            Err(ProviderError::Parse(_))
        ));
    }
}
