//! Deepgram pre-recorded transcription (raw audio body).

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::{AudioInput, SpeechToText};
use crate::error::TranscriptionError;

const DEEPGRAM_ENDPOINT: &str = "https://api.deepgram.com/v1/listen";
const DEEPGRAM_MODEL: &str = "nova-2";

pub struct DeepgramStt {
    endpoint: String,
    api_key: SecretString,
    client: reqwest::Client,
}

impl DeepgramStt {
    pub fn new(api_key: SecretString, timeout: Duration) -> Self {
        Self {
            endpoint: DEEPGRAM_ENDPOINT.to_string(),
            api_key,
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

/// Pull the first alternative's transcript out of a `/v1/listen` response.
fn extract_transcript(body: &serde_json::Value) -> Option<String> {
    body.pointer("/results/channels/0/alternatives/0/transcript")?
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl SpeechToText for DeepgramStt {
    fn name(&self) -> &str {
        "deepgram"
    }

    async fn transcribe(
        &self,
        audio: &AudioInput,
        language: &str,
    ) -> Result<String, TranscriptionError> {
        let failed = |reason: String| TranscriptionError::RequestFailed {
            provider: "deepgram".to_string(),
            reason,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .query(&[
                ("model", DEEPGRAM_MODEL),
                ("language", language),
                ("smart_format", "true"),
            ])
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Token {}", self.api_key.expose_secret()),
            )
            .header(reqwest::header::CONTENT_TYPE, audio.mime_type.as_str())
            .body(audio.bytes.clone())
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(failed(format!("HTTP {status}: {body}")));
        }

        let body: serde_json::Value =
            resp.json().await.map_err(|e| TranscriptionError::InvalidResponse {
                provider: "deepgram".to_string(),
                reason: e.to_string(),
            })?;

        extract_transcript(&body).ok_or_else(|| TranscriptionError::InvalidResponse {
            provider: "deepgram".to_string(),
            reason: "missing results.channels[0].alternatives[0].transcript".to_string(),
        })
    }
}
