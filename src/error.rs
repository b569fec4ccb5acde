//! Error types for Trade Inbox.

use uuid::Uuid;

use crate::inbox::model::InboxStatus;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transcription error: {0}")]
    Transcription(#[from] TranscriptionError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Object store errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to write {path}: {reason}")]
    Write { path: String, reason: String },

    #[error("Failed to read {url}: {reason}")]
    Read { url: String, reason: String },

    #[error("Failed to remove {path}: {reason}")]
    Remove { path: String, reason: String },

    #[error("Invalid storage path: {0}")]
    InvalidPath(String),
}

/// Speech-to-text errors.
#[derive(Debug, thiserror::Error)]
pub enum TranscriptionError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} returned an empty transcript")]
    EmptyTranscript { provider: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    /// Every provider in the chain failed; carries the last provider's error.
    #[error("Transcription failed: {last_error}")]
    Failed { last_error: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Intake (ingestion) errors.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Artisan not found: {0}")]
    ArtisanNotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Media fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Classification / service-level pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Inbox item {0} not found")]
    NotFound(Uuid),

    #[error("Inbox item {id} is {status}, expected {expected}")]
    InvalidState {
        id: Uuid,
        status: InboxStatus,
        expected: &'static str,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),
}

/// Routing engine errors.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("Inbox item {0} not found")]
    NotFound(Uuid),

    #[error("Inbox item {0} is already routed (pass force to re-route)")]
    AlreadyRouted(Uuid),

    #[error("Inbox item {0} is already being routed")]
    AlreadyRouting(Uuid),

    #[error("Inbox item {id} is {status}, cannot be routed")]
    InvalidState { id: Uuid, status: InboxStatus },

    #[error("Inbox item {0} has no classification")]
    Unclassified(Uuid),

    #[error("Downstream record creation failed: {0}")]
    Downstream(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
