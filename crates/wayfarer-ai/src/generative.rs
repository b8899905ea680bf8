//! Remote generative replies over the Gemini `generateContent` REST API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use wayfarer_core::config::GenerativeConfig;
use wayfarer_db::Origin;

use crate::error::{AssistantError, AssistantResult};
use crate::source::ReplySource;
use crate::types::{CandidateSource, ConversationContext, ReplyCandidate};

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
}

#[derive(Debug, Deserialize)]
struct ResponseCandidate {
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Generative responder backed by a remote model. Never retries; a failed
/// call is reported once and the caller decides what to do.
pub struct GeminiResponder {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    max_output_tokens: u32,
    temperature: f32,
    deadline: Duration,
}

impl GeminiResponder {
    pub fn new(config: &GenerativeConfig, api_key: Option<String>, deadline: Duration) -> Self {
        let base = config.base_url.trim_end_matches('/');
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{base}/v1beta/models/{}:generateContent", config.model),
            api_key,
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            deadline,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Generate one reply for `prompt` given the preceding turns in `context`.
    /// The call is abandoned once `deadline` elapses; dropping the returned
    /// future cancels the request.
    pub async fn generate(
        &self,
        context: &ConversationContext,
        prompt: &str,
        deadline: Duration,
    ) -> AssistantResult<ReplyCandidate> {
        let history = &context.turns[..context.turns.len().saturating_sub(1)];
        let mut contents: Vec<Content<'_>> = history
            .iter()
            .map(|turn| Content {
                role: match turn.origin {
                    Origin::User => "user",
                    Origin::Assistant => "model",
                },
                parts: vec![Part { text: &turn.text }],
            })
            .collect();
        contents.push(Content {
            role: "user",
            parts: vec![Part { text: prompt }],
        });
        let body = GenerateRequest {
            contents,
            generation_config: GenerationConfig {
                max_output_tokens: self.max_output_tokens,
                temperature: self.temperature,
            },
        };

        // One budget covers the headers and the body.
        let expires = tokio::time::Instant::now() + deadline;
        let mut request = self.client.post(&self.endpoint).timeout(deadline).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("x-goog-api-key", key);
        }

        let response = tokio::time::timeout_at(expires, request.send())
            .await
            .map_err(|_| AssistantError::RemoteUnavailable("request timed out".into()))?
            .map_err(|e| AssistantError::RemoteUnavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(AssistantError::RateLimited { retry_after });
        }

        let text = tokio::time::timeout_at(expires, response.text())
            .await
            .map_err(|_| AssistantError::RemoteUnavailable("response body timed out".into()))?
            .map_err(|e| AssistantError::RemoteUnavailable(e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| text.chars().take(200).collect());
            return Err(AssistantError::RemoteUnavailable(format!("HTTP {status}: {message}")));
        }

        parse_reply(&text)
    }
}

fn parse_reply(body: &str) -> AssistantResult<ReplyCandidate> {
    let parsed: GenerateResponse =
        serde_json::from_str(body).map_err(|e| AssistantError::InvalidResponse(e.to_string()))?;
    let text = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .and_then(|c| c.parts.into_iter().next())
        .and_then(|p| p.text)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AssistantError::InvalidResponse("no candidate text in response".into()))?;
    Ok(ReplyCandidate::new(text, CandidateSource::Generative, 1.0))
}

#[async_trait]
impl ReplySource for GeminiResponder {
    fn kind(&self) -> CandidateSource {
        CandidateSource::Generative
    }

    async fn candidates(
        &self,
        context: &ConversationContext,
        _max_candidates: usize,
    ) -> AssistantResult<Vec<ReplyCandidate>> {
        let prompt = context
            .latest_user_text()
            .ok_or_else(|| AssistantError::InvalidInput("context has no user turn".into()))?;
        let reply = self.generate(context, prompt, self.deadline).await?;
        Ok(vec![reply])
    }
}
