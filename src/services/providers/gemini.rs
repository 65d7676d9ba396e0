use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::openai::estimate_tokens;
use super::{CompletionRequest, LlmCompletion, LlmProvider, ModelTier, ProviderError};

/// Client for the Gemini generateContent API.
pub struct GeminiProvider {
    http: Client,
    base_url: String,
    api_key: String,
    light_model: String,
    heavy_model: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    total_token_count: u64,
}

impl GeminiProvider {
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
impl LlmProvider for GeminiProvider {
    fn id(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<LlmCompletion, ProviderError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url,
            self.model_for(request.tier)
        );

        let body = serde_json::json!({
            "contents": [{"parts": [{"text": request.prompt}]}],
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_tokens,
            },
        });

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
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

        let generated: GenerateResponse = response.json().await?;
        let text = generated
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| {
                ProviderError::Malformed("response contains no candidates".to_string())
            })?;

        let tokens_used = generated
            .usage_metadata
            .map(|u| u.total_token_count)
            .unwrap_or_else(|| estimate_tokens(&text, &request.prompt));

        Ok(LlmCompletion { text, tokens_used })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_model_by_tier() {
        let provider = GeminiProvider::new(
            "https://generativelanguage.googleapis.com/v1beta".to_string(),
            "key".to_string(),
            "gemini-1.5-flash".to_string(),
            "gemini-2.0-flash".to_string(),
        );
        assert_eq!(provider.model_for(ModelTier::Light), "gemini-1.5-flash");
        assert_eq!(provider.model_for(ModelTier::Heavy), "gemini-2.0-flash");
        assert_eq!(provider.id(), "gemini");
    }

    #[test]
    fn parses_generate_response() {
        let raw = r#"{
            "candidates": [{"content": {"parts": [{"text": "result text"}], "role": "model"}}],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 3, "totalTokenCount": 10}
        }"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.candidates[0].content.parts[0].text, "result text");
        assert_eq!(parsed.usage_metadata.unwrap().total_token_count, 10);
    }
}
