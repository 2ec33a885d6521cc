//! OpenAI-compatible transcription and chat clients.
//!
//! Two thin HTTP clients against the `/audio/transcriptions` (multipart)
//! and `/chat/completions` (JSON) endpoints. Base URL is configurable so
//! any OpenAI-compatible host works.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use super::{Analyst, ServiceError, SpeechToText};

/// Default per-call timeout for transcription uploads; chunks are capped in
/// size, so a stuck call is a network problem, not a big file.
const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(300);

/// Chat completions are text-only and should return well inside this.
const CHAT_TIMEOUT: Duration = Duration::from_secs(180);

/// Whisper transcription client
pub struct WhisperClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl WhisperClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/audio/transcriptions", self.base_url)
    }
}

#[async_trait]
impl SpeechToText for WhisperClient {
    async fn transcribe(&self, audio: &Path) -> Result<String, ServiceError> {
        let file_name = audio
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "chunk.mp3".to_string());

        let bytes = tokio::fs::read(audio)
            .await
            .map_err(|e| ServiceError::Fatal(format!("failed to read chunk file: {}", e)))?;

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/mpeg")
            .map_err(|e| ServiceError::Fatal(e.to_string()))?;

        let form = Form::new()
            .text("model", self.model.clone())
            .part("file", part);

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .timeout(TRANSCRIBE_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorEnvelope>(&body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| e.message)
                .unwrap_or(body);
            return Err(ServiceError::from_status(status, message));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::Fatal(format!("malformed transcription response: {}", e)))?;

        Ok(parsed.text)
    }
}

/// Chat completion client for the analysis prompt
pub struct ChatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl Analyst for ChatClient {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, ServiceError> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .timeout(CHAT_TIMEOUT)
            .json(&serde_json::json!({
                "model": self.model,
                "messages": [{"role": "user", "content": prompt}],
                "max_tokens": max_tokens,
                "temperature": 0.1,
            }))
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::from_status(status, body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::Fatal(format!("malformed chat response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ServiceError::Fatal("chat response had no choices".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_building() {
        let whisper = WhisperClient::new("https://api.openai.com/v1/", "key", "whisper-1");
        assert_eq!(
            whisper.endpoint(),
            "https://api.openai.com/v1/audio/transcriptions"
        );

        let chat = ChatClient::new("https://api.openai.com/v1", "key", "gpt-4o");
        assert_eq!(chat.endpoint(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn test_status_classification() {
        let err = ServiceError::from_status(reqwest::StatusCode::BAD_GATEWAY, String::new());
        assert!(err.is_transient());

        let err = ServiceError::from_status(reqwest::StatusCode::UNAUTHORIZED, String::new());
        assert!(!err.is_transient());
    }
}
