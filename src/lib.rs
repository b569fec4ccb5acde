//! Trade Inbox — intake, classification and routing of an artisan's inbox.

pub mod config;
pub mod error;
pub mod inbox;
pub mod intake;
pub mod llm;
pub mod pipeline;
pub mod records;
pub mod storage;
pub mod store;
pub mod transcription;
