//! Inbox item data model — statuses, classifications, and the item record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IntakeError;

/// Lifecycle status of an inbox item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    /// Created by intake, waiting for classification.
    New,
    /// Claimed by exactly one classification pass.
    Classifying,
    /// AI output persisted, ready for routing.
    Classified,
    /// Materialized into a downstream record (or acknowledged).
    Routed,
    /// A pipeline stage failed; see `error_message`.
    Error,
}

impl InboxStatus {
    /// Wire/database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Classifying => "classifying",
            Self::Classified => "classified",
            Self::Routed => "routed",
            Self::Error => "error",
        }
    }

    /// Whether `self → next` is one of the allowed lifecycle edges.
    ///
    /// Transitions are monotonic except the explicit `error → new` retry.
    pub fn can_transition_to(&self, next: InboxStatus) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Classifying)
                | (Self::Classifying, Self::Classified)
                | (Self::Classifying, Self::Error)
                | (Self::Classified, Self::Routed)
                | (Self::Classified, Self::Error)
                | (Self::Error, Self::New)
        )
    }
}

impl std::fmt::Display for InboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InboxStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "classifying" => Ok(Self::Classifying),
            "classified" => Ok(Self::Classified),
            "routed" => Ok(Self::Routed),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown inbox status: {}", s)),
        }
    }
}

/// Business category assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// A work request from a (prospective) client.
    Job,
    /// A supplier invoice the artisan has to pay.
    InvoicePassive,
    /// Contact details of a client.
    ClientInfo,
    /// A purchase receipt.
    Receipt,
    /// Anything else.
    Other,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::InvoicePassive => "invoice_passive",
            Self::ClientInfo => "client_info",
            Self::Receipt => "receipt",
            Self::Other => "other",
        }
    }

    /// Parse a classifier tag, falling back to `Other` for anything unknown.
    pub fn from_tag_lenient(tag: &str) -> Self {
        tag.trim()
            .to_lowercase()
            .parse()
            .unwrap_or(Self::Other)
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Classification {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "job" => Ok(Self::Job),
            "invoice_passive" => Ok(Self::InvoicePassive),
            "client_info" => Ok(Self::ClientInfo),
            "receipt" => Ok(Self::Receipt),
            "other" => Ok(Self::Other),
            _ => Err(format!("Unknown classification: {}", s)),
        }
    }
}

/// Channel an item arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxSource {
    Manual,
    Email,
    Whatsapp,
}

impl InboxSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Email => "email",
            Self::Whatsapp => "whatsapp",
        }
    }
}

impl std::str::FromStr for InboxSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "email" => Ok(Self::Email),
            "whatsapp" => Ok(Self::Whatsapp),
            _ => Err(format!("Unknown inbox source: {}", s)),
        }
    }
}

/// Kind of artifact attached to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Image,
    Pdf,
    Audio,
    Text,
    Document,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Pdf => "pdf",
            Self::Audio => "audio",
            Self::Text => "text",
            Self::Document => "document",
        }
    }

    /// Infer the file type of a stored attachment from its MIME type.
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.trim().to_lowercase();
        if mime.starts_with("image/") {
            Self::Image
        } else if mime == "application/pdf" {
            Self::Pdf
        } else if mime.starts_with("audio/") {
            Self::Audio
        } else {
            Self::Document
        }
    }
}

impl std::str::FromStr for FileType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(Self::Image),
            "pdf" => Ok(Self::Pdf),
            "audio" => Ok(Self::Audio),
            "text" => Ok(Self::Text),
            "document" => Ok(Self::Document),
            _ => Err(format!("Unknown file type: {}", s)),
        }
    }
}

/// Kind of downstream record an item was routed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutedKind {
    Job,
    ExpenseInvoice,
    Client,
    Expense,
}

impl RoutedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::ExpenseInvoice => "expense_invoice",
            Self::Client => "client",
            Self::Expense => "expense",
        }
    }
}

impl std::str::FromStr for RoutedKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "job" => Ok(Self::Job),
            "expense_invoice" => Ok(Self::ExpenseInvoice),
            "client" => Ok(Self::Client),
            "expense" => Ok(Self::Expense),
            _ => Err(format!("Unknown routed kind: {}", s)),
        }
    }
}

/// Reference to the record a routed item produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedEntity {
    pub kind: RoutedKind,
    pub id: Uuid,
}

/// Structured classifier output, persisted onto the item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub classification: Classification,
    pub summary: String,
    /// Always within [0, 1].
    pub confidence: f32,
    pub extracted_data: serde_json::Map<String, serde_json::Value>,
}

/// One ingested artifact and its pipeline state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxItem {
    pub id: Uuid,
    pub artisan_id: Uuid,
    pub source: InboxSource,
    /// Phone number or email address the artifact came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_sender: Option<String>,
    /// Present iff `file_type != Text`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    pub file_type: FileType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    pub classification: Option<Classification>,
    pub ai_summary: Option<String>,
    #[serde(default)]
    pub ai_extracted_data: serde_json::Map<String, serde_json::Value>,
    pub confidence: Option<f32>,
    pub status: InboxStatus,
    pub error_message: Option<String>,
    pub routed_entity: Option<RoutedEntity>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InboxItem {
    /// Create a new item at status `new`.
    ///
    /// Fails when the file URL presence does not match the file type.
    pub fn new(
        artisan_id: Uuid,
        source: InboxSource,
        file_type: FileType,
        file_url: Option<String>,
    ) -> Result<Self, IntakeError> {
        let file_url = file_url.filter(|u| !u.trim().is_empty());
        match (file_type, &file_url) {
            (FileType::Text, Some(_)) => {
                return Err(IntakeError::Validation(
                    "text items must not carry a file URL".into(),
                ));
            }
            (FileType::Text, None) => {}
            (other, None) => {
                return Err(IntakeError::Validation(format!(
                    "{} items require a file URL",
                    other.as_str()
                )));
            }
            _ => {}
        }

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            artisan_id,
            source,
            source_sender: None,
            file_url,
            file_type,
            file_name: None,
            raw_text: None,
            classification: None,
            ai_summary: None,
            ai_extracted_data: serde_json::Map::new(),
            confidence: None,
            status: InboxStatus::New,
            error_message: None,
            routed_entity: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        let sender = sender.into();
        if !sender.trim().is_empty() {
            self.source_sender = Some(sender);
        }
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        let name = file_name.into();
        if !name.trim().is_empty() {
            self.file_name = Some(name);
        }
        self
    }

    pub fn with_raw_text(mut self, raw_text: impl Into<String>) -> Self {
        let text = raw_text.into();
        if !text.trim().is_empty() {
            self.raw_text = Some(text);
        }
        self
    }

    /// The classification result currently stored on the item, if any.
    pub fn classification_result(&self) -> Option<ClassificationResult> {
        let classification = self.classification?;
        Some(ClassificationResult {
            classification,
            summary: self.ai_summary.clone().unwrap_or_default(),
            confidence: self.confidence.unwrap_or(0.0),
            extracted_data: self.ai_extracted_data.clone(),
        })
    }
}
