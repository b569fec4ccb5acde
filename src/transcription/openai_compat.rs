//! OpenAI-compatible `/audio/transcriptions` providers (OpenAI Whisper, Groq).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};

use super::{AudioInput, SpeechToText};
use crate::error::TranscriptionError;

const OPENAI_ENDPOINT: &str = "https://api.openai.com/v1/audio/transcriptions";
const GROQ_ENDPOINT: &str = "https://api.groq.com/openai/v1/audio/transcriptions";

#[derive(serde::Deserialize)]
struct TranscriptionResponse {
    text: String,
}

pub struct OpenAiCompatibleStt {
    name: &'static str,
    endpoint: String,
    model: &'static str,
    api_key: SecretString,
    client: reqwest::Client,
}

impl OpenAiCompatibleStt {
    pub fn openai(api_key: SecretString, timeout: Duration) -> Self {
        Self::new("openai", OPENAI_ENDPOINT, "whisper-1", api_key, timeout)
    }

    pub fn groq(api_key: SecretString, timeout: Duration) -> Self {
        Self::new("groq", GROQ_ENDPOINT, "whisper-large-v3", api_key, timeout)
    }

    fn new(
        name: &'static str,
        endpoint: &str,
        model: &'static str,
        api_key: SecretString,
        timeout: Duration,
    ) -> Self {
        Self {
            name,
            endpoint: endpoint.to_string(),
            model,
            api_key,
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    fn failed(&self, reason: impl Into<String>) -> TranscriptionError {
        TranscriptionError::RequestFailed {
            provider: self.name.to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl SpeechToText for OpenAiCompatibleStt {
    fn name(&self) -> &str {
        self.name
    }

    async fn transcribe(
        &self,
        audio: &AudioInput,
        language: &str,
    ) -> Result<String, TranscriptionError> {
        let part = Part::bytes(audio.bytes.clone())
            .file_name(audio.file_name.clone())
            .mime_str(&audio.mime_type)
            .map_err(|e| self.failed(e.to_string()))?;

        let form = Form::new()
            .part("file", part)
            .text("model", self.model)
            .text("language", language.to_string())
            .text("response_format", "json");

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.failed(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(self.failed(format!("HTTP {status}: {body}")));
        }

        let parsed: TranscriptionResponse =
            resp.json().await.map_err(|e| TranscriptionError::InvalidResponse {
                provider: self.name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(parsed.text)
    }
}
