//! Speech-to-text for voice notes.
//!
//! A [`TranscriptionChain`] tries each configured provider once, in fixed
//! priority order (OpenAI, Groq, Deepgram), and returns the first non-empty
//! transcript. There are no retries.

mod deepgram;
mod openai_compat;

pub use deepgram::DeepgramStt;
pub use openai_compat::OpenAiCompatibleStt;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::TranscriptionConfig;
use crate::error::TranscriptionError;

/// MIME type used when the URL carries no recognizable extension.
pub const DEFAULT_AUDIO_MIME: &str = "audio/mpeg";

/// Audio bytes plus the naming metadata providers need.
#[derive(Debug, Clone)]
pub struct AudioInput {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub mime_type: String,
}

impl AudioInput {
    /// Build an input for audio fetched from `url`; the MIME type comes from
    /// the URL's extension.
    pub fn from_url(url: &str, bytes: Vec<u8>) -> Self {
        let extension = audio_extension(url);
        let mime_type = extension
            .as_deref()
            .and_then(audio_mime_for_extension)
            .unwrap_or(DEFAULT_AUDIO_MIME)
            .to_string();
        let file_name = match extension {
            Some(ext) => format!("audio.{ext}"),
            None => "audio.mp3".to_string(),
        };
        Self {
            bytes,
            file_name,
            mime_type,
        }
    }
}

/// Lower-cased extension of the URL path, ignoring query string and fragment.
pub fn audio_extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let last = path.rsplit('/').next()?;
    let (_, ext) = last.rsplit_once('.')?;
    (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
}

pub fn audio_mime_for_extension(ext: &str) -> Option<&'static str> {
    let mime = match ext {
        "m4a" | "mp4" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" | "oga" | "opus" => "audio/ogg",
        "webm" => "audio/webm",
        "aac" => "audio/aac",
        "amr" => "audio/amr",
        "3gp" => "audio/3gpp",
        "flac" => "audio/flac",
        "caf" => "audio/x-caf",
        _ => return None,
    };
    Some(mime)
}

/// A speech-to-text provider.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    fn name(&self) -> &str;

    /// Transcribe once. An empty string is a valid (if useless) answer.
    async fn transcribe(
        &self,
        audio: &AudioInput,
        language: &str,
    ) -> Result<String, TranscriptionError>;
}

/// Ordered fallback chain of providers.
pub struct TranscriptionChain {
    providers: Vec<Arc<dyn SpeechToText>>,
    language: String,
}

impl TranscriptionChain {
    pub fn new(providers: Vec<Arc<dyn SpeechToText>>, language: impl Into<String>) -> Self {
        Self {
            providers,
            language: language.into(),
        }
    }

    /// Build the chain from configuration, including only keyed providers.
    pub fn from_config(config: &TranscriptionConfig, timeout: Duration) -> Self {
        let mut providers: Vec<Arc<dyn SpeechToText>> = Vec::new();
        if let Some(key) = &config.openai_api_key {
            providers.push(Arc::new(OpenAiCompatibleStt::openai(key.clone(), timeout)));
        }
        if let Some(key) = &config.groq_api_key {
            providers.push(Arc::new(OpenAiCompatibleStt::groq(key.clone(), timeout)));
        }
        if let Some(key) = &config.deepgram_api_key {
            providers.push(Arc::new(DeepgramStt::new(key.clone(), timeout)));
        }
        info!(
            providers = ?providers.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
            "Transcription chain configured"
        );
        Self::new(providers, config.language.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Run the chain; the first non-empty trimmed transcript wins.
    ///
    /// The transcript is returned verbatim (not trimmed).
    pub async fn transcribe(&self, audio: &AudioInput) -> Result<String, TranscriptionError> {
        let mut last_error = "no transcription providers configured".to_string();

        for provider in &self.providers {
            match provider.transcribe(audio, &self.language).await {
                Ok(text) if !text.trim().is_empty() => {
                    info!(provider = provider.name(), chars = text.len(), "Audio transcribed");
                    return Ok(text);
                }
                Ok(_) => {
                    let err = TranscriptionError::EmptyTranscript {
                        provider: provider.name().to_string(),
                    };
                    warn!(provider = provider.name(), "Empty transcript, trying next provider");
                    last_error = err.to_string();
                }
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "Transcription failed, trying next provider");
                    last_error = e.to_string();
                }
            }
        }

        Err(TranscriptionError::Failed { last_error })
    }
}
