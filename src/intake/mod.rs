//! Intake gateway — normalizes manual uploads, email and WhatsApp webhooks
//! into inbox items.
//!
//! Every channel is reduced to an [`IngestRequest`] and goes through the same
//! sequential loop: each attachment is fetched (if remote), stored, and turned
//! into one `new` inbox item. A failing attachment is skipped, never aborting
//! the rest. Classification is triggered by the caller for every created id.

pub mod email;
pub mod whatsapp;

use std::collections::HashMap;
use std::sync::Arc;

use secrecy::ExposeSecret;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::IntakeConfig;
use crate::error::IntakeError;
use crate::inbox::feed::InboxFeed;
use crate::inbox::model::{FileType, InboxItem, InboxSource};
use crate::storage::{IngestionKey, ObjectStore, artifact_path, extension_for};
use crate::store::Database;

pub use email::EmailWebhook;

/// Where an attachment's bytes come from.
#[derive(Debug, Clone)]
pub enum AttachmentSource {
    /// Hosted elsewhere; fetched with one bounded HTTP GET.
    Remote {
        url: String,
        content_type: Option<String>,
        file_name: Option<String>,
    },
    /// Already in hand (parsed out of a raw email).
    Inline {
        bytes: Vec<u8>,
        content_type: Option<String>,
        file_name: Option<String>,
    },
}

/// Canonical, channel-independent ingestion request.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub artisan_id: Uuid,
    pub source: InboxSource,
    pub sender: Option<String>,
    pub attachments: Vec<AttachmentSource>,
    /// Caption / message body, copied onto every item as raw text.
    pub body_text: Option<String>,
}

/// An attachment that could not be turned into an item.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedAttachment {
    pub index: usize,
    pub reason: String,
}

/// Result of one ingestion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestOutcome {
    pub created: Vec<Uuid>,
    pub skipped: Vec<SkippedAttachment>,
}

/// A manual upload from the owner.
#[derive(Debug, Clone)]
pub struct ManualUpload {
    pub artisan_id: Uuid,
    pub file_type: FileType,
    pub bytes: Option<Vec<u8>>,
    /// Remote `http(s)` URI to fetch, or an already stored artifact URL.
    pub file_uri: Option<String>,
    pub file_name: Option<String>,
    pub raw_text: Option<String>,
    pub mime_type: Option<String>,
}

impl ManualUpload {
    pub fn text(artisan_id: Uuid, raw_text: impl Into<String>) -> Self {
        Self {
            artisan_id,
            file_type: FileType::Text,
            bytes: None,
            file_uri: None,
            file_name: None,
            raw_text: Some(raw_text.into()),
            mime_type: None,
        }
    }
}

fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty())
}

pub struct IntakeGateway {
    db: Arc<dyn Database>,
    store: Arc<dyn ObjectStore>,
    feed: Arc<InboxFeed>,
    http: reqwest::Client,
    config: IntakeConfig,
}

impl IntakeGateway {
    pub fn new(
        db: Arc<dyn Database>,
        store: Arc<dyn ObjectStore>,
        feed: Arc<InboxFeed>,
        config: IntakeConfig,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.media_timeout)
            .build()
            .unwrap_or_default();
        Self {
            db,
            store,
            feed,
            http,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    // ── Channels ────────────────────────────────────────────────────

    /// Store one manually uploaded artifact and create its item.
    ///
    /// Unlike webhooks, a storage failure here is returned to the caller.
    pub async fn upload_manual(&self, upload: ManualUpload) -> Result<InboxItem, IntakeError> {
        let artisan_id = upload.artisan_id;
        self.require_artisan(artisan_id).await?;

        let raw_text = non_blank(upload.raw_text);
        let file_name = non_blank(upload.file_name);

        let item = if upload.file_type == FileType::Text {
            let text = raw_text.ok_or_else(|| {
                IntakeError::Validation("text uploads require non-empty raw_text".into())
            })?;
            InboxItem::new(artisan_id, InboxSource::Manual, FileType::Text, None)?
                .with_raw_text(text)
        } else {
            let key = IngestionKey::now();
            let mime = non_blank(upload.mime_type);
            let url = match (upload.bytes, non_blank(upload.file_uri)) {
                (Some(bytes), _) if !bytes.is_empty() => {
                    self.put_artifact(artisan_id, key, 0, bytes, mime.as_deref(), file_name.as_deref())
                        .await?
                }
                (_, Some(uri)) if self.store.path_for_url(&uri).is_some() => {
                    // Each item owns its artifact: copy under the uploader's key.
                    let stored_name = self.store.path_for_url(&uri);
                    let bytes = self.store.get(&uri).await?;
                    let name = file_name.as_deref().or(stored_name.as_deref());
                    self.put_artifact(artisan_id, key, 0, bytes, mime.as_deref(), name)
                        .await?
                }
                (_, Some(uri)) if is_http(&uri) => {
                    let (bytes, fetched_type) = self.fetch_media(&uri, false).await?;
                    let mime = mime.or(fetched_type);
                    self.put_artifact(artisan_id, key, 0, bytes, mime.as_deref(), file_name.as_deref())
                        .await?
                }
                (_, Some(uri)) => {
                    return Err(IntakeError::Validation(format!(
                        "unsupported file URI: {uri}"
                    )));
                }
                _ => {
                    return Err(IntakeError::Validation(format!(
                        "{} uploads require file bytes or a file URI",
                        upload.file_type.as_str()
                    )));
                }
            };

            let mut item =
                InboxItem::new(artisan_id, InboxSource::Manual, upload.file_type, Some(url))?;
            if let Some(name) = file_name {
                item = item.with_file_name(name);
            }
            if let Some(text) = raw_text {
                item = item.with_raw_text(text);
            }
            item
        };

        self.persist(&item).await?;
        Ok(item)
    }

    /// Handle an email webhook payload.
    pub async fn ingest_email(
        &self,
        payload: &EmailWebhook,
        query_artisan: Option<&str>,
    ) -> Result<IngestOutcome, IntakeError> {
        let parsed = payload
            .parse()
            .ok_or_else(|| IntakeError::Validation("could not parse raw email".into()))?;

        let plus_tag = email::plus_address_artisan(&parsed.recipients);
        let artisan_id = self
            .resolve_artisan(&[payload.artisan_id.as_deref(), plus_tag.as_deref(), query_artisan])
            .await?;

        Ok(self
            .ingest(IngestRequest {
                artisan_id,
                source: InboxSource::Email,
                sender: parsed.sender,
                attachments: parsed.attachments,
                body_text: parsed.body_text,
            })
            .await)
    }

    /// Handle a WhatsApp webhook (form or flattened JSON fields).
    pub async fn ingest_whatsapp(
        &self,
        fields: &HashMap<String, String>,
        query_artisan: Option<&str>,
    ) -> Result<IngestOutcome, IntakeError> {
        let message = whatsapp::parse_fields(fields);
        let artisan_id = self
            .resolve_artisan(&[message.artisan_hint.as_deref(), query_artisan])
            .await?;

        Ok(self
            .ingest(IngestRequest {
                artisan_id,
                source: InboxSource::Whatsapp,
                sender: message.sender,
                attachments: message.media,
                body_text: message.body,
            })
            .await)
    }

    // ── Shared loop ─────────────────────────────────────────────────

    /// Process attachments sequentially; one item per stored attachment.
    ///
    /// When no media item was created and there is body text, a single
    /// text item is created instead.
    pub async fn ingest(&self, request: IngestRequest) -> IngestOutcome {
        let IngestRequest {
            artisan_id,
            source,
            sender,
            attachments,
            body_text,
        } = request;
        let body_text = non_blank(body_text);
        let key = IngestionKey::now();
        let mut outcome = IngestOutcome::default();

        for (index, attachment) in attachments.into_iter().enumerate() {
            let result = self
                .ingest_attachment(
                    artisan_id,
                    source,
                    sender.as_deref(),
                    body_text.as_deref(),
                    key,
                    index,
                    attachment,
                )
                .await;
            match result {
                Ok(item) => outcome.created.push(item.id),
                Err(e) => {
                    warn!(
                        artisan_id = %artisan_id,
                        source = source.as_str(),
                        index,
                        error = %e,
                        "Skipping attachment"
                    );
                    outcome.skipped.push(SkippedAttachment {
                        index,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if outcome.created.is_empty()
            && let Some(text) = body_text
        {
            let result = async {
                let mut item = InboxItem::new(artisan_id, source, FileType::Text, None)?
                    .with_raw_text(text);
                if let Some(sender) = sender.as_deref() {
                    item = item.with_sender(sender);
                }
                self.persist(&item).await?;
                Ok::<_, IntakeError>(item.id)
            }
            .await;
            match result {
                Ok(id) => outcome.created.push(id),
                Err(e) => warn!(artisan_id = %artisan_id, error = %e, "Failed to create text item"),
            }
        }

        info!(
            artisan_id = %artisan_id,
            source = source.as_str(),
            created = outcome.created.len(),
            skipped = outcome.skipped.len(),
            "Ingestion complete"
        );
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn ingest_attachment(
        &self,
        artisan_id: Uuid,
        source: InboxSource,
        sender: Option<&str>,
        body_text: Option<&str>,
        key: IngestionKey,
        index: usize,
        attachment: AttachmentSource,
    ) -> Result<InboxItem, IntakeError> {
        let (bytes, content_type, file_name) = match attachment {
            AttachmentSource::Remote {
                url,
                content_type,
                file_name,
            } => {
                let (bytes, fetched_type) =
                    self.fetch_media(&url, source == InboxSource::Whatsapp).await?;
                (bytes, content_type.or(fetched_type), file_name)
            }
            AttachmentSource::Inline {
                bytes,
                content_type,
                file_name,
            } => (bytes, content_type, file_name),
        };
        if bytes.is_empty() {
            return Err(IntakeError::Validation("attachment is empty".into()));
        }

        let file_type = content_type
            .as_deref()
            .map(FileType::from_mime)
            .unwrap_or(FileType::Document);
        let url = self
            .put_artifact(
                artisan_id,
                key,
                index,
                bytes,
                content_type.as_deref(),
                file_name.as_deref(),
            )
            .await?;

        let mut item = InboxItem::new(artisan_id, source, file_type, Some(url))?;
        if let Some(sender) = sender {
            item = item.with_sender(sender);
        }
        if let Some(name) = file_name {
            item = item.with_file_name(name);
        }
        if let Some(text) = body_text {
            item = item.with_raw_text(text);
        }

        self.persist(&item).await?;
        Ok(item)
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn put_artifact(
        &self,
        artisan_id: Uuid,
        key: IngestionKey,
        index: usize,
        bytes: Vec<u8>,
        content_type: Option<&str>,
        file_name: Option<&str>,
    ) -> Result<String, IntakeError> {
        let extension = extension_for(file_name, content_type);
        let path = artifact_path(artisan_id, key, index, &extension);
        let url = self
            .store
            .put(
                &path,
                bytes,
                content_type.unwrap_or("application/octet-stream"),
            )
            .await?;
        Ok(url)
    }

    async fn persist(&self, item: &InboxItem) -> Result<(), IntakeError> {
        self.db.insert_inbox_item(item).await?;
        self.feed.publish_insert(item);
        info!(
            item_id = %item.id,
            artisan_id = %item.artisan_id,
            source = item.source.as_str(),
            file_type = item.file_type.as_str(),
            "Inbox item created"
        );
        Ok(())
    }

    async fn require_artisan(&self, artisan_id: Uuid) -> Result<(), IntakeError> {
        match self.db.get_artisan(artisan_id).await? {
            Some(_) => Ok(()),
            None => Err(IntakeError::ArtisanNotFound(artisan_id.to_string())),
        }
    }

    /// Pick the first present candidate, else the configured default, and
    /// check that the artisan exists.
    pub async fn resolve_artisan(&self, candidates: &[Option<&str>]) -> Result<Uuid, IntakeError> {
        let chosen = candidates
            .iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty());

        let artisan_id = match chosen {
            Some(raw) => {
                Uuid::parse_str(raw).map_err(|_| IntakeError::ArtisanNotFound(raw.to_string()))?
            }
            None => self.config.default_artisan_id.ok_or_else(|| {
                IntakeError::ArtisanNotFound(
                    "no artisan id in payload or query, and no default configured".into(),
                )
            })?,
        };

        self.require_artisan(artisan_id).await?;
        Ok(artisan_id)
    }

    /// Single bounded GET for a media URL.
    ///
    /// With `authenticated`, basic auth is sent only when both the account SID
    /// and the auth token are configured.
    pub async fn fetch_media(
        &self,
        url: &str,
        authenticated: bool,
    ) -> Result<(Vec<u8>, Option<String>), IntakeError> {
        let fetch_err = |reason: String| IntakeError::Fetch {
            url: url.to_string(),
            reason,
        };
        if !is_http(url) {
            return Err(fetch_err("missing or non-HTTP media URL".into()));
        }

        let mut request = self.http.get(url);
        if authenticated
            && let (Some(sid), Some(token)) = (
                self.config.whatsapp_account_sid.as_deref(),
                self.config.whatsapp_auth_token.as_ref(),
            )
        {
            request = request.basic_auth(sid, Some(token.expose_secret()));
        }

        let resp = request.send().await.map_err(|e| fetch_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(fetch_err(format!("HTTP {}", resp.status())));
        }

        let max = self.config.max_media_bytes;
        if resp.content_length().is_some_and(|len| len as usize > max) {
            return Err(fetch_err(format!("media exceeds {max} bytes")));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await.map_err(|e| fetch_err(e.to_string()))?;
        if bytes.len() > max {
            return Err(fetch_err(format!("media exceeds {max} bytes")));
        }

        Ok((bytes.to_vec(), content_type))
    }
}
