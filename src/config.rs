//! Configuration types, built from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct InboxConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub transcription: TranscriptionConfig,
    pub intake: IntakeConfig,
    /// Directory for daily-rolling log files; stdout only when unset.
    pub log_dir: Option<PathBuf>,
}

/// HTTP surface and local persistence.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    pub storage_dir: PathBuf,
    /// Base URL under which stored artifacts are served (`/files`).
    pub public_base_url: String,
}

/// Speech-to-text provider credentials. A provider joins the chain only when
/// its key is present.
#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    pub openai_api_key: Option<SecretString>,
    pub groq_api_key: Option<SecretString>,
    pub deepgram_api_key: Option<SecretString>,
    pub language: String,
}

/// Webhook and media-fetch settings.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Artisan used when a webhook carries no resolvable artisan.
    pub default_artisan_id: Option<Uuid>,
    /// Twilio account SID for media basic auth.
    pub whatsapp_account_sid: Option<String>,
    pub whatsapp_auth_token: Option<SecretString>,
    pub media_timeout: Duration,
    pub max_media_bytes: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            default_artisan_id: None,
            whatsapp_account_sid: None,
            whatsapp_auth_token: None,
            media_timeout: Duration::from_secs(20),
            max_media_bytes: 25 * 1024 * 1024,
        }
    }
}

impl InboxConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let secret = |key: &str| get(key).map(SecretString::from);

        let bind: SocketAddr = parse_or(&get, "INBOX_BIND", "0.0.0.0:8080".parse().ok())?;
        let server = ServerConfig {
            bind,
            db_path: get("INBOX_DB_PATH")
                .unwrap_or_else(|| "./data/trade-inbox.db".to_string())
                .into(),
            storage_dir: get("INBOX_STORAGE_DIR")
                .unwrap_or_else(|| "./data/artifacts".to_string())
                .into(),
            public_base_url: get("INBOX_PUBLIC_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8080/files".to_string())
                .trim_end_matches('/')
                .to_string(),
        };

        let (backend, api_key) = if let Some(key) = secret("ANTHROPIC_API_KEY") {
            (LlmBackend::Anthropic, key)
        } else if let Some(key) = secret("OPENAI_API_KEY") {
            (LlmBackend::OpenAi, key)
        } else {
            return Err(ConfigError::MissingRequired {
                key: "ANTHROPIC_API_KEY".to_string(),
                hint: "Set ANTHROPIC_API_KEY (or OPENAI_API_KEY) for the classifier".to_string(),
            });
        };
        let llm = LlmConfig {
            backend,
            api_key,
            model: get("INBOX_MODEL").unwrap_or_else(|| backend.default_model().to_string()),
        };

        let transcription = TranscriptionConfig {
            openai_api_key: secret("OPENAI_API_KEY"),
            groq_api_key: secret("GROQ_API_KEY"),
            deepgram_api_key: secret("DEEPGRAM_API_KEY"),
            language: get("INBOX_TRANSCRIPTION_LANGUAGE").unwrap_or_else(|| "it".to_string()),
        };

        let defaults = IntakeConfig::default();
        let intake = IntakeConfig {
            default_artisan_id: get("INBOX_DEFAULT_ARTISAN_ID")
                .map(|v| {
                    Uuid::parse_str(&v).map_err(|e| ConfigError::InvalidValue {
                        key: "INBOX_DEFAULT_ARTISAN_ID".to_string(),
                        message: e.to_string(),
                    })
                })
                .transpose()?,
            whatsapp_account_sid: get("TWILIO_ACCOUNT_SID"),
            whatsapp_auth_token: secret("TWILIO_AUTH_TOKEN"),
            media_timeout: Duration::from_secs(parse_or(
                &get,
                "INBOX_MEDIA_TIMEOUT_SECS",
                Some(defaults.media_timeout.as_secs()),
            )?),
            max_media_bytes: parse_or(&get, "INBOX_MAX_MEDIA_BYTES", Some(defaults.max_media_bytes))?,
        };

        Ok(Self {
            server,
            llm,
            transcription,
            intake,
            log_dir: get("INBOX_LOG_DIR").map(PathBuf::from),
        })
    }
}

/// Parse `key` if set, else fall back to `default`.
fn parse_or<T, G>(get: &G, key: &str, default: Option<T>) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => default.ok_or_else(|| ConfigError::MissingRequired {
            key: key.to_string(),
            hint: String::new(),
        }),
    }
}
