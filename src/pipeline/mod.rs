//! Inbox processing pipeline.
//!
//! Every item created by intake flows through:
//! 1. `Classifier::classify()` — transcription (audio) and LLM classification
//! 2. `InboxRouter::route()` — owner-triggered materialization into a record
//!
//! `InboxService` is the entry point the HTTP surface calls.

pub mod classifier;
pub mod router;
pub mod service;

pub use classifier::{ClassifyOutcome, Classifier};
pub use router::{InboxRouter, RouteRequest, RoutingResult};
pub use service::InboxService;
