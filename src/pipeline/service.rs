//! Inbox service — the operations the HTTP surface exposes, wired over the
//! intake gateway, classifier and router.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::classifier::{Classifier, ClassifyOutcome};
use super::router::{InboxRouter, RouteRequest, RoutingResult};
use crate::config::IntakeConfig;
use crate::error::PipelineError;
use crate::inbox::feed::InboxFeed;
use crate::inbox::model::{InboxItem, InboxStatus};
use crate::intake::{EmailWebhook, IngestOutcome, IntakeGateway, ManualUpload};
use crate::llm::LlmProvider;
use crate::records::Artisan;
use crate::storage::ObjectStore;
use crate::store::Database;
use crate::transcription::TranscriptionChain;

/// Default page size for inbox listings.
pub const DEFAULT_LIST_LIMIT: usize = 100;

pub struct InboxService {
    db: Arc<dyn Database>,
    store: Arc<dyn ObjectStore>,
    feed: Arc<InboxFeed>,
    gateway: IntakeGateway,
    classifier: Arc<Classifier>,
    router: InboxRouter,
}

impl InboxService {
    pub fn new(
        db: Arc<dyn Database>,
        feed: Arc<InboxFeed>,
        gateway: IntakeGateway,
        classifier: Arc<Classifier>,
        router: InboxRouter,
    ) -> Self {
        Self {
            db,
            store: gateway.store().clone(),
            feed,
            gateway,
            classifier,
            router,
        }
    }

    /// Wire gateway, classifier and router over shared components with a
    /// fresh feed.
    pub fn assemble(
        db: Arc<dyn Database>,
        store: Arc<dyn ObjectStore>,
        transcriber: Arc<TranscriptionChain>,
        llm: Arc<dyn LlmProvider>,
        intake: IntakeConfig,
    ) -> Self {
        let feed = InboxFeed::new();
        let gateway = IntakeGateway::new(db.clone(), store.clone(), feed.clone(), intake);
        let classifier = Arc::new(Classifier::new(
            db.clone(),
            store,
            transcriber,
            llm,
            feed.clone(),
        ));
        let router = InboxRouter::new(db.clone(), feed.clone());
        Self::new(db, feed, gateway, classifier, router)
    }

    pub fn feed(&self) -> &Arc<InboxFeed> {
        &self.feed
    }

    // ── Intake ──────────────────────────────────────────────────────

    /// Create an item from a manual upload and start classifying it.
    pub async fn upload_and_classify(&self, upload: ManualUpload) -> Result<Uuid, PipelineError> {
        let item = self.gateway.upload_manual(upload).await?;
        self.spawn_classification(item.id);
        Ok(item.id)
    }

    pub async fn ingest_email(
        &self,
        payload: &EmailWebhook,
        query_artisan: Option<&str>,
    ) -> Result<IngestOutcome, PipelineError> {
        let outcome = self.gateway.ingest_email(payload, query_artisan).await?;
        self.classify_created(&outcome);
        Ok(outcome)
    }

    pub async fn ingest_whatsapp(
        &self,
        fields: &HashMap<String, String>,
        query_artisan: Option<&str>,
    ) -> Result<IngestOutcome, PipelineError> {
        let outcome = self.gateway.ingest_whatsapp(fields, query_artisan).await?;
        self.classify_created(&outcome);
        Ok(outcome)
    }

    fn classify_created(&self, outcome: &IngestOutcome) {
        for id in &outcome.created {
            self.spawn_classification(*id);
        }
    }

    /// Classify in the background. The handle resolves to `None` when the
    /// pass hit a persistence error.
    pub fn spawn_classification(&self, id: Uuid) -> JoinHandle<Option<ClassifyOutcome>> {
        let classifier = Arc::clone(&self.classifier);
        tokio::spawn(async move {
            match classifier.classify(id).await {
                Ok(outcome) => {
                    debug!(item_id = %id, outcome = ?outcome, "Classification pass finished");
                    Some(outcome)
                }
                Err(e) => {
                    error!(item_id = %id, error = %e, "Classification pass aborted");
                    None
                }
            }
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Reset an `error` item to `new` and classify it again.
    ///
    /// Returns once the reset is persisted; classification runs on the
    /// returned task.
    pub async fn retry_classify(&self, id: Uuid) -> Result<JoinHandle<Option<ClassifyOutcome>>, PipelineError> {
        let item = self
            .db
            .get_inbox_item(id)
            .await?
            .ok_or(PipelineError::NotFound(id))?;
        if item.status != InboxStatus::Error {
            return Err(PipelineError::InvalidState {
                id,
                status: item.status,
                expected: "error",
            });
        }

        if !self
            .db
            .transition_inbox_status(id, InboxStatus::Error, InboxStatus::New)
            .await?
        {
            let status = self
                .db
                .get_inbox_item(id)
                .await?
                .map(|i| i.status)
                .ok_or(PipelineError::NotFound(id))?;
            return Err(PipelineError::InvalidState {
                id,
                status,
                expected: "error",
            });
        }

        if let Some(reset) = self.db.get_inbox_item(id).await? {
            self.feed.publish_update(&reset);
        }
        info!(item_id = %id, "Retrying classification");
        Ok(self.spawn_classification(id))
    }

    pub async fn route_item(&self, id: Uuid, request: RouteRequest) -> Result<RoutingResult, PipelineError> {
        Ok(self.router.route(id, request).await?)
    }

    /// Delete an item and its stored artifact. A failed artifact removal is
    /// logged and does not block the delete.
    pub async fn delete_item(&self, id: Uuid) -> Result<(), PipelineError> {
        let item = self
            .db
            .get_inbox_item(id)
            .await?
            .ok_or(PipelineError::NotFound(id))?;

        if let Some(path) = item
            .file_url
            .as_deref()
            .and_then(|url| self.store.path_for_url(url))
            && let Err(e) = self.store.remove(&path).await
        {
            warn!(item_id = %id, path = %path, error = %e, "Failed to remove artifact");
        }

        if !self.db.delete_inbox_item(id).await? {
            return Err(PipelineError::NotFound(id));
        }
        self.feed.publish_delete(item.artisan_id, id);
        info!(item_id = %id, "Inbox item deleted");
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn get_item(&self, id: Uuid) -> Result<InboxItem, PipelineError> {
        self.db
            .get_inbox_item(id)
            .await?
            .ok_or(PipelineError::NotFound(id))
    }

    pub async fn list_items(&self, artisan_id: Uuid, limit: Option<usize>) -> Result<Vec<InboxItem>, PipelineError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 500);
        Ok(self.db.list_inbox_items(artisan_id, limit).await?)
    }

    pub async fn upsert_artisan(&self, artisan: &Artisan) -> Result<(), PipelineError> {
        if artisan.name.trim().is_empty() {
            return Err(PipelineError::Validation("artisan name is required".into()));
        }
        self.db.upsert_artisan(artisan).await?;
        Ok(())
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }
}
