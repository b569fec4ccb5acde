//! Integration tests for the inbox REST, webhook and feed surface.
//!
//! Each test spins up an Axum server on a random port with stub LLM and
//! speech-to-text providers, then exercises the real HTTP / WS contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::Path as AxumPath;
use axum::http::{StatusCode as AxumStatus, header};
use axum::routing::get;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use trade_inbox::config::IntakeConfig;
use trade_inbox::error::{LlmError, TranscriptionError};
use trade_inbox::inbox::inbox_routes;
use trade_inbox::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
};
use trade_inbox::pipeline::InboxService;
use trade_inbox::storage::{LocalObjectStore, ObjectStore};
use trade_inbox::store::{Database, LibSqlBackend};
use trade_inbox::transcription::{AudioInput, SpeechToText, TranscriptionChain};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Stub LLM that classifies everything as a job.
struct StubLlm;

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Ok(CompletionResponse {
            content: r#"{"classification": "job", "summary": "Rifacimento bagno", "confidence": 0.88,
                         "extracted_data": {"work_type": "piastrelle", "client_phone": "+39 333 1112222"}}"#
                .to_string(),
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

/// Speech-to-text stub with a fixed answer.
struct StubStt {
    name: &'static str,
    reply: Option<&'static str>,
}

#[async_trait]
impl SpeechToText for StubStt {
    fn name(&self) -> &str {
        self.name
    }

    async fn transcribe(
        &self,
        _audio: &AudioInput,
        _language: &str,
    ) -> Result<String, TranscriptionError> {
        self.reply
            .map(str::to_string)
            .ok_or_else(|| TranscriptionError::RequestFailed {
                provider: self.name.to_string(),
                reason: "HTTP 500".to_string(),
            })
    }
}

struct TestServer {
    base: String,
    port: u16,
    media: String,
    _dir: tempfile::TempDir,
}

/// Start the inbox server and a media host on random ports.
async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(
        dir.path(),
        &format!("http://127.0.0.1:{port}/files"),
        Duration::from_secs(5),
    ));
    let transcriber = Arc::new(TranscriptionChain::new(
        vec![
            Arc::new(StubStt {
                name: "openai",
                reply: None,
            }),
            Arc::new(StubStt {
                name: "groq",
                reply: Some("taglio piastrelle bagno"),
            }),
        ],
        "it",
    ));
    let service = Arc::new(InboxService::assemble(
        db,
        store,
        transcriber,
        Arc::new(StubLlm),
        IntakeConfig::default(),
    ));
    let app = inbox_routes(service, dir.path());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let media = start_media_server().await;

    // Give the servers a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base: format!("http://127.0.0.1:{port}"),
        port,
        media,
        _dir: dir,
    }
}

/// `/media/0` is a JPEG, `/media/voice` an OGG note, everything else 404.
async fn start_media_server() -> String {
    let app = Router::new().route(
        "/media/{name}",
        get(|AxumPath(name): AxumPath<String>| async move {
            match name.as_str() {
                "0" => Ok(([(header::CONTENT_TYPE, "image/jpeg")], b"JPEG".to_vec())),
                "voice.ogg" => Ok(([(header::CONTENT_TYPE, "audio/ogg")], b"OggS".to_vec())),
                _ => Err(AxumStatus::NOT_FOUND),
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://127.0.0.1:{port}/media")
}

async fn register_artisan(client: &reqwest::Client, server: &TestServer) -> Uuid {
    let id = Uuid::new_v4();
    let resp = client
        .put(format!("{}/api/artisans/{id}", server.base))
        .json(&json!({"name": "Marco Neri", "trade": "piastrellista"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    id
}

async fn get_item(client: &reqwest::Client, server: &TestServer, id: &str) -> Value {
    client
        .get(format!("{}/api/inbox/{id}", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn wait_for_status(client: &reqwest::Client, server: &TestServer, id: &str, status: &str) -> Value {
    loop {
        let item = get_item(client, server, id).await;
        if item["status"] == status {
            return item;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Parse a WS text frame into a serde_json::Value.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

// ── REST ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_ok() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let json: Value = reqwest::get(format!("{}/health", server.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(json["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn text_upload_is_classified_and_routed_once() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();
        let artisan = register_artisan(&client, &server).await;

        let resp = client
            .post(format!("{}/api/inbox", server.base))
            .json(&json!({"artisan_id": artisan, "file_type": "text", "raw_text": "Vorrei rifare il bagno"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        let id = body["id"].as_str().unwrap().to_string();

        let item = wait_for_status(&client, &server, &id, "classified").await;
        assert_eq!(item["classification"], "job");
        assert_eq!(item["ai_extracted_data"]["work_type"], "piastrelle");

        let resp = client
            .post(format!("{}/api/inbox/{id}/route", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let result: Value = resp.json().await.unwrap();
        assert_eq!(result["routed_entity"]["kind"], "job");

        let again = client
            .post(format!("{}/api/inbox/{id}/route", server.base))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(again.status(), 409);

        let retry = client
            .post(format!("{}/api/inbox/{id}/retry", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(retry.status(), 409);

        let list: Value = client
            .get(format!("{}/api/inbox?artisan_id={artisan}", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["status"], "routed");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn upload_validation_and_unknown_artisan() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();
        let artisan = register_artisan(&client, &server).await;

        let resp = client
            .post(format!("{}/api/inbox", server.base))
            .json(&json!({"artisan_id": artisan, "file_type": "text", "raw_text": "  "}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .post(format!("{}/api/inbox", server.base))
            .json(&json!({"artisan_id": Uuid::new_v4(), "file_type": "text", "raw_text": "ciao"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client
            .get(format!("{}/api/inbox/not-a-uuid", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn multipart_upload_is_served_and_deleted() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();
        let artisan = register_artisan(&client, &server).await;

        let form = reqwest::multipart::Form::new()
            .text("artisan_id", artisan.to_string())
            .part(
                "file",
                reqwest::multipart::Part::bytes(b"%PDF-1.4".to_vec())
                    .file_name("fattura.pdf")
                    .mime_str("application/pdf")
                    .unwrap(),
            );
        let resp = client
            .post(format!("{}/api/inbox/upload", server.base))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let id = resp.json::<Value>().await.unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string();

        let item = get_item(&client, &server, &id).await;
        assert_eq!(item["file_type"], "pdf");
        let file_url = item["file_url"].as_str().unwrap().to_string();
        assert!(file_url.starts_with(&format!("http://127.0.0.1:{}/files/{artisan}/", server.port)));
        assert!(file_url.ends_with("_0.pdf"));

        let served = reqwest::get(&file_url).await.unwrap();
        assert_eq!(served.status(), 200);
        assert_eq!(served.bytes().await.unwrap().as_ref(), b"%PDF-1.4");

        wait_for_status(&client, &server, &id, "classified").await;
        let resp = client
            .delete(format!("{}/api/inbox/{id}", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);

        let resp = client
            .get(format!("{}/api/inbox/{id}", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        assert_eq!(reqwest::get(&file_url).await.unwrap().status(), 404);
    })
    .await
    .expect("test timed out");
}

// ── Webhooks ─────────────────────────────────────────────────────────

#[tokio::test]
async fn whatsapp_failed_media_is_skipped() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();
        let artisan = register_artisan(&client, &server).await;

        let resp = client
            .post(format!("{}/webhooks/whatsapp?artisan_id={artisan}", server.base))
            .form(&[
                ("From", "whatsapp:+393331112222".to_string()),
                ("Body", "Foto del bagno".to_string()),
                ("NumMedia", "2".to_string()),
                ("MediaUrl0", format!("{}/0", server.media)),
                ("MediaContentType0", "image/jpeg".to_string()),
                ("MediaUrl1", format!("{}/1", server.media)),
                ("MediaContentType1", "image/jpeg".to_string()),
            ])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["created"], 1);
        assert_eq!(body["skipped"][0]["index"], 1);

        let id = body["ids"][0].as_str().unwrap();
        let item = get_item(&client, &server, id).await;
        assert_eq!(item["source"], "whatsapp");
        assert_eq!(item["file_type"], "image");
        assert_eq!(item["source_sender"], "+393331112222");
        assert_eq!(item["raw_text"], "Foto del bagno");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn whatsapp_voice_note_is_transcribed_with_fallback() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();
        let artisan = register_artisan(&client, &server).await;

        let resp = client
            .post(format!("{}/webhooks/whatsapp", server.base))
            .json(&json!({
                "From": "whatsapp:+393331112222",
                "ArtisanId": artisan.to_string(),
                "NumMedia": 1,
                "MediaUrl0": format!("{}/voice.ogg", server.media),
                "MediaContentType0": "audio/ogg"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        let id = body["ids"][0].as_str().unwrap().to_string();

        let item = wait_for_status(&client, &server, &id, "classified").await;
        assert_eq!(item["file_type"], "audio");
        assert_eq!(item["raw_text"], "taglio piastrelle bagno");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn webhook_without_artisan_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/webhooks/whatsapp", server.base))
            .form(&[("From", "whatsapp:+39"), ("Body", "ciao")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("Artisan"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn email_webhook_creates_text_item() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();
        let artisan = register_artisan(&client, &server).await;

        let resp = client
            .post(format!("{}/webhooks/email", server.base))
            .json(&json!({
                "from": "Anna Verdi <anna@example.it>",
                "to": format!("inbox+{artisan}@trade-inbox.it"),
                "subject": "Preventivo",
                "text": "Buongiorno, mi serve un preventivo.\n\n> vecchio messaggio"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["created"], 1);

        let item = get_item(&client, &server, body["ids"][0].as_str().unwrap()).await;
        assert_eq!(item["source"], "email");
        assert_eq!(item["file_type"], "text");
        assert_eq!(item["source_sender"], "anna@example.it");
        assert_eq!(item["raw_text"], "Preventivo\n\nBuongiorno, mi serve un preventivo.");
    })
    .await
    .expect("test timed out");
}

// ── WebSocket feed ───────────────────────────────────────────────────

#[tokio::test]
async fn feed_syncs_then_streams_changes() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();
        let artisan = register_artisan(&client, &server).await;

        let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{}/ws/inbox/{artisan}", server.port))
            .await
            .expect("WS connect failed");

        let sync = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(sync["type"], "inbox_sync");
        assert!(sync["items"].as_array().unwrap().is_empty());

        // Items of other artisans never reach this feed.
        let other = register_artisan(&client, &server).await;
        client
            .post(format!("{}/api/inbox", server.base))
            .json(&json!({"artisan_id": other, "file_type": "text", "raw_text": "altro"}))
            .send()
            .await
            .unwrap();

        let resp = client
            .post(format!("{}/api/inbox", server.base))
            .json(&json!({"artisan_id": artisan, "file_type": "text", "raw_text": "Perdita in cucina"}))
            .send()
            .await
            .unwrap();
        let id = resp.json::<Value>().await.unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string();

        let insert = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(insert["type"], "inbox_insert");
        assert_eq!(insert["item"]["id"], id.as_str());
        assert_eq!(insert["item"]["status"], "new");

        let mut statuses = Vec::new();
        while statuses.last().map(String::as_str) != Some("classified") {
            let msg = parse_ws_json(&ws.next().await.unwrap().unwrap());
            assert_eq!(msg["type"], "inbox_update");
            assert_eq!(msg["item"]["id"], id.as_str());
            statuses.push(msg["item"]["status"].as_str().unwrap().to_string());
        }
        assert_eq!(statuses, vec!["classifying", "classified"]);

        client
            .delete(format!("{}/api/inbox/{id}", server.base))
            .send()
            .await
            .unwrap();
        let delete = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(delete["type"], "inbox_delete");
        assert_eq!(delete["id"], id.as_str());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn feed_rejects_invalid_artisan_id() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let result = connect_async(format!("ws://127.0.0.1:{}/ws/inbox/nope", server.port)).await;
        assert!(result.is_err());
    })
    .await
    .expect("test timed out");
}
