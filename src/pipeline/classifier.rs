//! Classification orchestrator — claims `new` items, transcribes audio, asks
//! the LLM for a category and persists the result.
//!
//! Flow per item:
//! 1. Claim `new → classifying` (conditional update; losers exit quietly)
//! 2. Audio only: fetch artifact, run the transcription chain, store transcript
//! 3. LLM classification → strict `ClassificationResult`
//! 4. Persist and move to `classified`; any failure moves to `error`

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::inbox::feed::InboxFeed;
use crate::inbox::model::{Classification, ClassificationResult, FileType, InboxItem, InboxStatus};
use crate::llm::provider::{ChatMessage, CompletionRequest, FinishReason, LlmProvider};
use crate::storage::ObjectStore;
use crate::store::Database;
use crate::transcription::{AudioInput, TranscriptionChain};

/// Max tokens for the classification call.
const CLASSIFY_MAX_TOKENS: u32 = 1024;

/// Temperature for classification (deterministic-ish).
const CLASSIFY_TEMPERATURE: f32 = 0.1;

/// Characters of raw text sent to the model.
const MAX_PROMPT_TEXT_CHARS: usize = 4000;

/// Error message recorded when the model output does not parse.
pub const INVALID_AI_RESPONSE: &str = "invalid AI response";

/// Result of one classification pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifyOutcome {
    Classified(ClassificationResult),
    /// The item moved to `error` with this message.
    Failed(String),
    /// Another pass owns the item (or it is no longer `new`).
    AlreadyClaimed,
}

pub struct Classifier {
    db: Arc<dyn Database>,
    store: Arc<dyn ObjectStore>,
    transcriber: Arc<TranscriptionChain>,
    llm: Arc<dyn LlmProvider>,
    feed: Arc<InboxFeed>,
}

impl Classifier {
    pub fn new(
        db: Arc<dyn Database>,
        store: Arc<dyn ObjectStore>,
        transcriber: Arc<TranscriptionChain>,
        llm: Arc<dyn LlmProvider>,
        feed: Arc<InboxFeed>,
    ) -> Self {
        Self {
            db,
            store,
            transcriber,
            llm,
            feed,
        }
    }

    /// Run one classification pass on a `new` item.
    ///
    /// Provider failures are recorded on the item and reported as
    /// `ClassifyOutcome::Failed`; only persistence errors surface as `Err`.
    pub async fn classify(&self, id: Uuid) -> Result<ClassifyOutcome, PipelineError> {
        let claimed = self
            .db
            .transition_inbox_status(id, InboxStatus::New, InboxStatus::Classifying)
            .await?;
        if !claimed {
            return match self.db.get_inbox_item(id).await? {
                Some(item) => {
                    debug!(item_id = %id, status = %item.status, "Classification already claimed");
                    Ok(ClassifyOutcome::AlreadyClaimed)
                }
                None => Err(PipelineError::NotFound(id)),
            };
        }

        let mut item = self
            .db
            .get_inbox_item(id)
            .await?
            .ok_or(PipelineError::NotFound(id))?;
        self.feed.publish_update(&item);
        info!(item_id = %id, file_type = item.file_type.as_str(), "Classifying inbox item");

        match self.run(&mut item).await {
            Ok(result) => {
                if !self.db.save_classification(id, &result).await? {
                    warn!(item_id = %id, "Item left classifying before result was saved");
                    return Ok(ClassifyOutcome::AlreadyClaimed);
                }
                self.publish_current(id).await?;
                info!(
                    item_id = %id,
                    classification = %result.classification,
                    confidence = result.confidence,
                    "Inbox item classified"
                );
                Ok(ClassifyOutcome::Classified(result))
            }
            Err(message) => {
                error!(item_id = %id, error = %message, "Classification failed");
                self.db
                    .mark_inbox_error(id, InboxStatus::Classifying, &message)
                    .await?;
                self.publish_current(id).await?;
                Ok(ClassifyOutcome::Failed(message))
            }
        }
    }

    async fn run(&self, item: &mut InboxItem) -> Result<ClassificationResult, String> {
        if item.file_type == FileType::Audio {
            let transcript = self.transcribe(item).await?;
            self.db
                .set_inbox_raw_text(item.id, &transcript)
                .await
                .map_err(|e| e.to_string())?;
            item.raw_text = Some(transcript);
            self.feed.publish_update(item);
        }

        let trade = self
            .db
            .get_artisan(item.artisan_id)
            .await
            .map_err(|e| e.to_string())?
            .map(|a| a.trade)
            .filter(|t| !t.trim().is_empty());

        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_classify_system_prompt()),
            ChatMessage::user(build_classify_user_prompt(item, trade.as_deref())),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|e| format!("AI classification failed: {e}"))?;

        parse_classification_response(&response.content).map_err(|e| {
            warn!(
                item_id = %item.id,
                raw_response = %response.content,
                truncated = response.finish_reason == FinishReason::Length,
                error = %e,
                "Failed to parse classification response"
            );
            INVALID_AI_RESPONSE.to_string()
        })
    }

    async fn transcribe(&self, item: &InboxItem) -> Result<String, String> {
        let url = item
            .file_url
            .as_deref()
            .ok_or_else(|| "audio item has no file URL".to_string())?;
        let bytes = self.store.get(url).await.map_err(|e| e.to_string())?;
        self.transcriber
            .transcribe(&AudioInput::from_url(url, bytes))
            .await
            .map_err(|e| e.to_string())
    }

    async fn publish_current(&self, id: Uuid) -> Result<(), PipelineError> {
        if let Some(item) = self.db.get_inbox_item(id).await? {
            self.feed.publish_update(&item);
        }
        Ok(())
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_classify_system_prompt() -> String {
    "You sort the inbox of an Italian tradesperson (plumber, electrician, tiler, ...). \
     Classify each item into exactly one category and extract structured fields.\n\n\
     Categories:\n\
     - \"job\": a client asks for work, a quote or an intervention. Fields: title, description, \
       work_type, materials, urgency (bassa|media|alta), client_name, client_phone, client_email, \
       address, notes.\n\
     - \"invoice_passive\": an invoice the tradesperson must pay to a supplier. Fields: \
       supplier_name, invoice_number, amount, issue_date (YYYY-MM-DD).\n\
     - \"client_info\": contact details of a client. Fields: name, phone, email, address, notes.\n\
     - \"receipt\": a purchase receipt or till slip. Fields: vendor, description, amount, \
       date (YYYY-MM-DD), category.\n\
     - \"other\": anything else.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"classification\": \"...\", \"summary\": \"...\", \"confidence\": 0.0, \"extracted_data\": {}}\n\n\
     Rules:\n\
     - summary: one short sentence in Italian\n\
     - confidence between 0.0 and 1.0\n\
     - omit fields you cannot read; never invent phone numbers, emails or amounts"
        .to_string()
}

fn build_classify_user_prompt(item: &InboxItem, trade: Option<&str>) -> String {
    let mut prompt = String::with_capacity(512);

    if let Some(trade) = trade {
        prompt.push_str(&format!("Trade: {trade}\n"));
    }
    prompt.push_str(&format!("Source: {}\n", item.source.as_str()));
    if let Some(ref sender) = item.source_sender {
        prompt.push_str(&format!("Sender: {sender}\n"));
    }
    prompt.push_str(&format!("File type: {}\n", item.file_type.as_str()));
    if let Some(ref name) = item.file_name {
        prompt.push_str(&format!("File name: {name}\n"));
    }

    match item.raw_text.as_deref().filter(|t| !t.trim().is_empty()) {
        Some(text) => {
            let preview: String = text.chars().take(MAX_PROMPT_TEXT_CHARS).collect();
            prompt.push_str(&format!("\nContent:\n{preview}"));
        }
        None => prompt.push_str("\nContent: (no text available, classify from the metadata)"),
    }

    prompt
}

// ── Response parsing ────────────────────────────────────────────────

/// Parse the model output into a strict `ClassificationResult`.
///
/// Unknown tags fall back to `other`; confidence is clamped into [0, 1].
pub fn parse_classification_response(raw: &str) -> Result<ClassificationResult, String> {
    let json_str = extract_json_object(raw);
    let value: Value =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;
    let obj = value.as_object().ok_or("response is not a JSON object")?;

    let tag = obj
        .get("classification")
        .and_then(Value::as_str)
        .ok_or("missing or non-string classification")?;
    let summary = obj
        .get("summary")
        .and_then(Value::as_str)
        .ok_or("missing or non-string summary")?;
    let confidence = obj
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or("missing or non-numeric confidence")?;
    let extracted_data = match obj.get("extracted_data") {
        Some(Value::Object(map)) => map.clone(),
        None | Some(Value::Null) => serde_json::Map::new(),
        Some(_) => return Err("extracted_data is not an object".into()),
    };

    Ok(ClassificationResult {
        classification: Classification::from_tag_lenient(tag),
        summary: summary.trim().to_string(),
        confidence: (confidence as f32).clamp(0.0, 1.0),
        extracted_data,
    })
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::error::{LlmError, TranscriptionError};
    use crate::inbox::model::InboxSource;
    use crate::llm::provider::{CompletionResponse, FinishReason};
    use crate::records::Artisan;
    use crate::storage::LocalObjectStore;
    use crate::store::LibSqlBackend;
    use crate::transcription::SpeechToText;

    // ── Parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_valid_response() {
        let result = parse_classification_response(
            r#"{"classification": "job", "summary": "Rifare bagno", "confidence": 0.82,
                "extracted_data": {"work_type": "piastrelle", "urgency": "alta"}}"#,
        )
        .unwrap();
        assert_eq!(result.classification, Classification::Job);
        assert_eq!(result.summary, "Rifare bagno");
        assert!((result.confidence - 0.82).abs() < 0.001);
        assert_eq!(result.extracted_data["urgency"], "alta");
    }

    #[test]
    fn parse_wrapped_in_markdown() {
        let raw = "Ecco:\n```json\n{\"classification\": \"receipt\", \"summary\": \"s\", \"confidence\": 1}\n```";
        let result = parse_classification_response(raw).unwrap();
        assert_eq!(result.classification, Classification::Receipt);
        assert!(result.extracted_data.is_empty());
    }

    #[test]
    fn parse_clamps_confidence_and_defaults_unknown_tag() {
        let result = parse_classification_response(
            r#"{"classification": "quote", "summary": "s", "confidence": 1.7}"#,
        )
        .unwrap();
        assert_eq!(result.classification, Classification::Other);
        assert_eq!(result.confidence, 1.0);

        let result = parse_classification_response(
            r#"{"classification": "other", "summary": "s", "confidence": -3}"#,
        )
        .unwrap();
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn parse_rejects_malformed_structures() {
        for raw in [
            "not json at all",
            r#"{"summary": "s", "confidence": 0.5}"#,
            r#"{"classification": 3, "summary": "s", "confidence": 0.5}"#,
            r#"{"classification": "job", "confidence": 0.5}"#,
            r#"{"classification": "job", "summary": "s", "confidence": "high"}"#,
            r#"{"classification": "job", "summary": "s", "confidence": 0.5, "extracted_data": []}"#,
        ] {
            assert!(parse_classification_response(raw).is_err(), "{raw}");
        }
    }

    #[test]
    fn user_prompt_includes_context() {
        let item = InboxItem::new(Uuid::new_v4(), InboxSource::Whatsapp, FileType::Text, None)
            .unwrap()
            .with_sender("+39333")
            .with_raw_text("Perdita sotto il lavello");
        let prompt = build_classify_user_prompt(&item, Some("idraulico"));
        assert!(prompt.contains("Trade: idraulico"));
        assert!(prompt.contains("Source: whatsapp"));
        assert!(prompt.contains("Sender: +39333"));
        assert!(prompt.contains("Perdita sotto il lavello"));
    }

    // ── Orchestration with mocks ────────────────────────────────────

    /// Mock LLM that returns a fixed response and records user prompts.
    struct MockClassifierLlm {
        response: Result<String, ()>,
        delay: Duration,
        prompts: Mutex<Vec<String>>,
    }

    impl MockClassifierLlm {
        fn replying(response: &str) -> Arc<Self> {
            Arc::new(Self {
                response: Ok(response.to_string()),
                delay: Duration::ZERO,
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for MockClassifierLlm {
        fn model_name(&self) -> &str {
            "mock-classifier"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            if let Some(last) = request.messages.last() {
                self.prompts.lock().unwrap().push(last.content.clone());
            }
            tokio::time::sleep(self.delay).await;
            match &self.response {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 100,
                    output_tokens: 50,
                    finish_reason: FinishReason::Stop,
                    response_id: None,
                }),
                Err(()) => Err(LlmError::RequestFailed {
                    provider: "mock".into(),
                    reason: "503".into(),
                }),
            }
        }
    }

    struct FixedStt {
        name: &'static str,
        reply: Result<&'static str, &'static str>,
    }

    #[async_trait]
    impl SpeechToText for FixedStt {
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
                .map_err(|reason| TranscriptionError::RequestFailed {
                    provider: self.name.into(),
                    reason: reason.into(),
                })
        }
    }

    struct Harness {
        classifier: Arc<Classifier>,
        db: Arc<dyn Database>,
        store: Arc<dyn ObjectStore>,
        artisan_id: Uuid,
        _dir: tempfile::TempDir,
    }

    async fn harness(llm: Arc<MockClassifierLlm>, stt: Vec<Arc<dyn SpeechToText>>) -> Harness {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let artisan = Artisan::new(Uuid::new_v4(), "Marco Neri", "piastrellista");
        db.upsert_artisan(&artisan).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(
            dir.path(),
            "http://localhost:8080/files",
            Duration::from_secs(5),
        ));
        let classifier = Arc::new(Classifier::new(
            db.clone(),
            store.clone(),
            Arc::new(TranscriptionChain::new(stt, "it")),
            llm,
            InboxFeed::new(),
        ));
        Harness {
            classifier,
            db,
            store,
            artisan_id: artisan.id,
            _dir: dir,
        }
    }

    async fn text_item(h: &Harness, text: &str) -> InboxItem {
        let item = InboxItem::new(h.artisan_id, InboxSource::Manual, FileType::Text, None)
            .unwrap()
            .with_raw_text(text);
        h.db.insert_inbox_item(&item).await.unwrap();
        item
    }

    async fn audio_item(h: &Harness) -> InboxItem {
        let path = format!("{}/1_0.ogg", h.artisan_id);
        let url = h.store.put(&path, b"OggS".to_vec(), "audio/ogg").await.unwrap();
        let item =
            InboxItem::new(h.artisan_id, InboxSource::Whatsapp, FileType::Audio, Some(url)).unwrap();
        h.db.insert_inbox_item(&item).await.unwrap();
        item
    }

    const JOB_RESPONSE: &str = r#"{"classification": "job", "summary": "Posa piastrelle bagno", "confidence": 0.9, "extracted_data": {"work_type": "piastrelle"}}"#;

    #[tokio::test]
    async fn classifies_text_item() {
        let llm = MockClassifierLlm::replying(JOB_RESPONSE);
        let h = harness(llm.clone(), vec![]).await;
        let item = text_item(&h, "Vorrei posare le piastrelle in bagno").await;

        let outcome = h.classifier.classify(item.id).await.unwrap();
        assert!(matches!(outcome, ClassifyOutcome::Classified(ref r) if r.classification == Classification::Job));

        let stored = h.db.get_inbox_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InboxStatus::Classified);
        assert_eq!(stored.ai_summary.as_deref(), Some("Posa piastrelle bagno"));
        assert_eq!(stored.ai_extracted_data["work_type"], "piastrelle");
        assert!(llm.prompts.lock().unwrap()[0].contains("Trade: piastrellista"));
    }

    #[tokio::test]
    async fn invalid_response_moves_to_error() {
        let h = harness(MockClassifierLlm::replying("Non so."), vec![]).await;
        let item = text_item(&h, "???").await;

        let outcome = h.classifier.classify(item.id).await.unwrap();
        assert_eq!(outcome, ClassifyOutcome::Failed(INVALID_AI_RESPONSE.to_string()));

        let stored = h.db.get_inbox_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InboxStatus::Error);
        assert_eq!(stored.error_message.as_deref(), Some(INVALID_AI_RESPONSE));
        assert!(stored.classification.is_none());
    }

    #[tokio::test]
    async fn llm_failure_moves_to_error() {
        let llm = Arc::new(MockClassifierLlm {
            response: Err(()),
            delay: Duration::ZERO,
            prompts: Mutex::new(Vec::new()),
        });
        let h = harness(llm, vec![]).await;
        let item = text_item(&h, "x").await;

        let outcome = h.classifier.classify(item.id).await.unwrap();
        assert!(matches!(outcome, ClassifyOutcome::Failed(ref m) if m.contains("503")));
    }

    #[tokio::test]
    async fn concurrent_claims_let_exactly_one_proceed() {
        let llm = Arc::new(MockClassifierLlm {
            response: Ok(JOB_RESPONSE.to_string()),
            delay: Duration::from_millis(50),
            prompts: Mutex::new(Vec::new()),
        });
        let h = harness(llm.clone(), vec![]).await;
        let item = text_item(&h, "lavoro").await;

        let (a, b) = tokio::join!(h.classifier.classify(item.id), h.classifier.classify(item.id));
        let outcomes = [a.unwrap(), b.unwrap()];
        let classified = outcomes
            .iter()
            .filter(|o| matches!(o, ClassifyOutcome::Classified(_)))
            .count();
        let claimed = outcomes
            .iter()
            .filter(|o| matches!(o, ClassifyOutcome::AlreadyClaimed))
            .count();
        assert_eq!((classified, claimed), (1, 1));
        assert_eq!(llm.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn audio_is_transcribed_with_fallback_before_classification() {
        let llm = MockClassifierLlm::replying(JOB_RESPONSE);
        let stt: Vec<Arc<dyn SpeechToText>> = vec![
            Arc::new(FixedStt { name: "openai", reply: Err("timeout") }),
            Arc::new(FixedStt { name: "groq", reply: Ok("taglio piastrelle bagno") }),
        ];
        let h = harness(llm.clone(), stt).await;
        let item = audio_item(&h).await;

        let outcome = h.classifier.classify(item.id).await.unwrap();
        assert!(matches!(outcome, ClassifyOutcome::Classified(_)));

        let stored = h.db.get_inbox_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.raw_text.as_deref(), Some("taglio piastrelle bagno"));
        assert!(llm.prompts.lock().unwrap()[0].contains("taglio piastrelle bagno"));
    }

    #[tokio::test]
    async fn transcription_failure_skips_llm() {
        let llm = MockClassifierLlm::replying(JOB_RESPONSE);
        let stt: Vec<Arc<dyn SpeechToText>> =
            vec![Arc::new(FixedStt { name: "openai", reply: Err("quota exceeded") })];
        let h = harness(llm.clone(), stt).await;
        let item = audio_item(&h).await;

        let outcome = h.classifier.classify(item.id).await.unwrap();
        assert!(matches!(outcome, ClassifyOutcome::Failed(ref m) if m.contains("quota exceeded")));
        assert!(llm.prompts.lock().unwrap().is_empty());

        let stored = h.db.get_inbox_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InboxStatus::Error);
        assert!(stored.raw_text.is_none());
    }

    #[tokio::test]
    async fn non_new_items_are_not_reclassified() {
        let h = harness(MockClassifierLlm::replying(JOB_RESPONSE), vec![]).await;
        let item = text_item(&h, "x").await;
        h.classifier.classify(item.id).await.unwrap();

        let again = h.classifier.classify(item.id).await.unwrap();
        assert_eq!(again, ClassifyOutcome::AlreadyClaimed);

        let missing = h.classifier.classify(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(PipelineError::NotFound(_))));
    }
}
