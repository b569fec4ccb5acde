//! WebSocket feed + REST endpoints for the inbox.

use std::collections::HashMap;
use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Form, FromRequest, Multipart, Path, Query, Request, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::feed::FeedMessage;
use super::model::{FileType, InboxItem};
use crate::error::{IntakeError, PipelineError, RoutingError};
use crate::intake::whatsapp::fields_from_json;
use crate::intake::{EmailWebhook, IngestOutcome, ManualUpload, SkippedAttachment};
use crate::pipeline::{InboxService, RouteRequest};
use crate::records::Artisan;

/// Upper bound for multipart uploads.
const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<InboxService>,
}

/// Build the Axum router with inbox REST, webhook, feed and file routes.
pub fn inbox_routes(service: Arc<InboxService>, storage_dir: &FsPath) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/health", get(health))
        .route("/api/inbox", get(list_items).post(create_item))
        .route("/api/inbox/upload", post(upload_item))
        .route("/api/inbox/{id}", get(get_item).delete(delete_item))
        .route("/api/inbox/{id}/retry", post(retry_item))
        .route("/api/inbox/{id}/route", post(route_item))
        .route("/api/artisans/{id}", put(upsert_artisan))
        .route("/webhooks/whatsapp", post(whatsapp_webhook))
        .route("/webhooks/email", post(email_webhook))
        .route("/ws/inbox/{artisan_id}", get(ws_handler))
        .nest_service("/files", ServeDir::new(storage_dir))
        .layer(
            ServiceBuilder::new()
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// An error rendered as `{"error": "..."}` with a mapped status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn new(status: StatusCode, message: impl ToString) -> Self {
        Self {
            status,
            message: message.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "Request failed");
        }
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}

impl From<IntakeError> for ApiError {
    fn from(e: IntakeError) -> Self {
        let status = match &e {
            IntakeError::Validation(_) => StatusCode::BAD_REQUEST,
            IntakeError::ArtisanNotFound(_) => StatusCode::NOT_FOUND,
            IntakeError::Storage(_) | IntakeError::Fetch { .. } => StatusCode::BAD_GATEWAY,
            IntakeError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e)
    }
}

impl From<RoutingError> for ApiError {
    fn from(e: RoutingError) -> Self {
        let status = match &e {
            RoutingError::NotFound(_) => StatusCode::NOT_FOUND,
            RoutingError::AlreadyRouted(_)
            | RoutingError::AlreadyRouting(_)
            | RoutingError::InvalidState { .. }
            | RoutingError::Unclassified(_) => StatusCode::CONFLICT,
            RoutingError::Downstream(_) => StatusCode::BAD_GATEWAY,
            RoutingError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e)
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Intake(inner) => inner.into(),
            PipelineError::Routing(inner) => inner.into(),
            PipelineError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, e),
            PipelineError::InvalidState { .. } => Self::new(StatusCode::CONFLICT, e),
            PipelineError::Validation(_) => Self::new(StatusCode::BAD_REQUEST, e),
            PipelineError::Database(_) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, e),
        }
    }
}

fn parse_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::bad_request(format!("Invalid id: {id}")))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "trade-inbox"
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(artisan_id): Path<String>,
) -> Result<Response, ApiError> {
    let artisan_id = parse_id(&artisan_id)?;
    info!(artisan_id = %artisan_id, "Inbox feed client connecting");
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state.service, artisan_id))
        .into_response())
}

async fn handle_socket(socket: WebSocket, service: Arc<InboxService>, artisan_id: Uuid) {
    // Subscribe before the snapshot so no change falls between the two.
    let mut feed = service.feed().subscribe(artisan_id);
    let (mut sender, mut receiver) = socket.split();

    if !send_snapshot(&mut sender, &service, artisan_id).await {
        warn!(artisan_id = %artisan_id, "Failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = feed.recv() => {
                match result {
                    Ok(msg) => {
                        if !send_json(&mut sender, &msg).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(artisan_id = %artisan_id, missed = n, "Inbox feed client lagged, re-syncing");
                        if !send_snapshot(&mut sender, &service, artisan_id).await {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            result = receiver.next() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(artisan_id = %artisan_id, "Inbox feed client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!(artisan_id = %artisan_id, "Inbox feed connection closed");
}

type WsSender = futures::stream::SplitSink<WebSocket, Message>;

async fn send_snapshot(sender: &mut WsSender, service: &InboxService, artisan_id: Uuid) -> bool {
    let items = match service.list_items(artisan_id, None).await {
        Ok(items) => items,
        Err(e) => {
            warn!(artisan_id = %artisan_id, error = %e, "Failed to load inbox snapshot");
            Vec::new()
        }
    };
    send_json(sender, &FeedMessage::InboxSync { items }).await
}

async fn send_json(sender: &mut WsSender, msg: &FeedMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize feed message");
            true
        }
    }
}

// ── Inbox REST ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ListQuery {
    artisan_id: Uuid,
    limit: Option<usize>,
}

async fn list_items(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<InboxItem>>, ApiError> {
    let items = state
        .service
        .list_items(query.artisan_id, query.limit)
        .await?;
    Ok(Json(items))
}

async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InboxItem>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.service.get_item(id).await?))
}

#[derive(Deserialize)]
struct CreateItemRequest {
    artisan_id: Uuid,
    file_type: FileType,
    #[serde(default)]
    file_uri: Option<String>,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    raw_text: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

async fn create_item(
    State(state): State<AppState>,
    Json(body): Json<CreateItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state
        .service
        .upload_and_classify(ManualUpload {
            artisan_id: body.artisan_id,
            file_type: body.file_type,
            bytes: None,
            file_uri: body.file_uri,
            file_name: body.file_name,
            raw_text: body.raw_text,
            mime_type: body.mime_type,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({"id": id}))))
}

/// Multipart upload: a `file` part plus `artisan_id`, optional `file_type`
/// and `raw_text` fields.
async fn upload_item(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut artisan_id = None;
    let mut file_type = None;
    let mut raw_text = None;
    let mut file: Option<(Vec<u8>, Option<String>, Option<String>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(e.body_text()))?;
                file = Some((bytes.to_vec(), file_name, content_type));
            }
            "artisan_id" | "file_type" | "raw_text" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(e.body_text()))?;
                match name.as_str() {
                    "artisan_id" => artisan_id = Some(parse_id(value.trim())?),
                    "file_type" => {
                        file_type = Some(
                            value
                                .trim()
                                .parse::<FileType>()
                                .map_err(ApiError::bad_request)?,
                        )
                    }
                    _ => raw_text = Some(value),
                }
            }
            other => debug!(field = other, "Ignoring unknown multipart field"),
        }
    }

    let artisan_id = artisan_id.ok_or_else(|| ApiError::bad_request("artisan_id is required"))?;
    let upload = match file {
        Some((bytes, file_name, mime_type)) => ManualUpload {
            artisan_id,
            file_type: file_type.unwrap_or_else(|| {
                mime_type
                    .as_deref()
                    .map(FileType::from_mime)
                    .unwrap_or(FileType::Document)
            }),
            bytes: Some(bytes),
            file_uri: None,
            file_name,
            raw_text,
            mime_type,
        },
        None => ManualUpload {
            raw_text,
            file_type: file_type.unwrap_or(FileType::Text),
            ..ManualUpload::text(artisan_id, String::new())
        },
    };

    let id = state.service.upload_and_classify(upload).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({"id": id}))))
}

async fn retry_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    // Classification continues on its own task.
    let _pass = state.service.retry_classify(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"id": id, "status": "new"})),
    ))
}

async fn route_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let request: RouteRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RouteRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("Invalid route request: {e}")))?
    };
    let result = state.service.route_item(id, request).await?;
    Ok(Json(result))
}

async fn delete_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    state.service.delete_item(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ArtisanRequest {
    name: String,
    #[serde(default)]
    trade: String,
}

async fn upsert_artisan(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ArtisanRequest>,
) -> Result<Json<Artisan>, ApiError> {
    let id = parse_id(&id)?;
    let created_at = state
        .service
        .database()
        .get_artisan(id)
        .await
        .map_err(PipelineError::from)?
        .map(|a| a.created_at)
        .unwrap_or_else(Utc::now);
    let artisan = Artisan {
        id,
        name: body.name.trim().to_string(),
        trade: body.trade.trim().to_string(),
        created_at,
    };
    state.service.upsert_artisan(&artisan).await?;
    info!(artisan_id = %id, trade = %artisan.trade, "Artisan registered");
    Ok(Json(artisan))
}

// ── Webhooks ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WebhookQuery {
    artisan_id: Option<String>,
}

#[derive(Serialize)]
struct WebhookResponse {
    created: usize,
    ids: Vec<Uuid>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    skipped: Vec<SkippedAttachment>,
}

impl From<IngestOutcome> for WebhookResponse {
    fn from(outcome: IngestOutcome) -> Self {
        Self {
            created: outcome.created.len(),
            ids: outcome.created,
            skipped: outcome.skipped,
        }
    }
}

/// Twilio posts form-encoded bodies; JSON bodies are accepted too.
async fn whatsapp_webhook(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    request: Request,
) -> Result<Json<WebhookResponse>, ApiError> {
    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));

    let fields: HashMap<String, String> = if is_json {
        let Json(value) = Json::<serde_json::Value>::from_request(request, &())
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        fields_from_json(&value)
    } else {
        let Form(fields) = Form::<HashMap<String, String>>::from_request(request, &())
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        fields
    };

    let outcome = state
        .service
        .ingest_whatsapp(&fields, query.artisan_id.as_deref())
        .await?;
    Ok(Json(outcome.into()))
}

async fn email_webhook(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    Json(payload): Json<EmailWebhook>,
) -> Result<Json<WebhookResponse>, ApiError> {
    let outcome = state
        .service
        .ingest_email(&payload, query.artisan_id.as_deref())
        .await?;
    Ok(Json(outcome.into()))
}
