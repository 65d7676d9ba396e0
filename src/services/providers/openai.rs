use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{CompletionRequest, LlmCompletion, LlmProvider, ModelTier, ProviderError};

/// Client for an OpenAI-compatible chat completions API.
pub struct OpenAiProvider {
    http: Client,
    base_url: String,
    api_key: String,
    light_model: String,
    heavy_model: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    total_tokens: u64,
}

impl OpenAiProvider {
    pub fn new(
        base_url: String,
        api_key: String,
        light_model: String,
        heavy_model: String,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url,
            api_key,
            light_model,
            heavy_model,
        }
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Light => &self.light_model,
            ModelTier::Heavy => &self.heavy_model,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<LlmCompletion, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);

        let body = serde_json::json!({
            "model": self.model_for(request.tier),
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let chat: ChatResponse = response.json().await?;
        let choice = chat
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Malformed("response contains no choices".to_string()))?;

        // Usage is reported by the API; fall back to a length estimate when absent.
        let tokens_used = chat
            .usage
            .map(|u| u.total_tokens)
            .unwrap_or_else(|| estimate_tokens(&choice.message.content, &request.prompt));

        Ok(LlmCompletion {
            text: choice.message.content,
            tokens_used,
        })
    }
}

/// Rough 4-chars-per-token estimate used when the API omits usage.
pub(super) fn estimate_tokens(completion: &str, prompt: &str) -> u64 {
    ((completion.len() + prompt.len()) / 4) as u64
}
