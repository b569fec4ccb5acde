//! Bridges rig-core's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel, Message};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

/// Anthropic rejects requests without an explicit token budget.
const DEFAULT_MAX_TOKENS: u64 = 1024;

/// Wraps any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

/// Split our flat message list into rig's preamble / history / prompt triple.
///
/// System messages are joined into the preamble; the last user message is the
/// prompt and everything before it is chat history.
fn split_messages(
    messages: Vec<ChatMessage>,
) -> Result<(Option<String>, Vec<Message>, Message), String> {
    let mut preamble: Vec<String> = Vec::new();
    let mut turns: Vec<ChatMessage> = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => preamble.push(msg.content),
            _ => turns.push(msg),
        }
    }

    let last = turns.pop().ok_or("request has no user message")?;
    if last.role != Role::User {
        return Err("last message must come from the user".into());
    }

    let history = turns
        .into_iter()
        .map(|m| match m.role {
            Role::Assistant => Message::assistant(m.content),
            _ => Message::user(m.content),
        })
        .collect();

    let preamble = (!preamble.is_empty()).then(|| preamble.join("\n\n"));
    Ok((preamble, history, Message::user(last.content)))
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (preamble, history, prompt) =
            split_messages(request.messages).map_err(|reason| LlmError::InvalidResponse {
                provider: self.model_name.clone(),
                reason,
            })?;

        let max_tokens = request.max_tokens.map(u64::from).unwrap_or(DEFAULT_MAX_TOKENS);
        let mut builder = self
            .model
            .completion_request(prompt)
            .messages(history)
            .max_tokens(max_tokens);
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }

        let response = builder.send().await.map_err(|e| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason: e.to_string(),
        })?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        tracing::debug!(
            model = %self.model_name,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "LLM completion finished"
        );

        Ok(CompletionResponse {
            content,
            input_tokens: response.usage.input_tokens as u32,
            output_tokens: response.usage.output_tokens as u32,
            finish_reason: finish_reason(response.usage.output_tokens, max_tokens),
            response_id: None,
        })
    }
}

/// rig does not surface the provider's stop reason; a completion that used
/// the whole budget is reported as truncated.
fn finish_reason(output_tokens: u64, max_tokens: u64) -> FinishReason {
    if output_tokens >= max_tokens {
        FinishReason::Length
    } else {
        FinishReason::Stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_budget_reports_length() {
        assert_eq!(finish_reason(1024, 1024), FinishReason::Length);
        assert_eq!(finish_reason(300, 1024), FinishReason::Stop);
    }

    #[test]
    fn split_joins_system_messages_into_preamble() {
        let (preamble, history, _prompt) = split_messages(vec![
            ChatMessage::system("a"),
            ChatMessage::system("b"),
            ChatMessage::user("question"),
        ])
        .unwrap();
        assert_eq!(preamble.as_deref(), Some("a\n\nb"));
        assert!(history.is_empty());
    }

    #[test]
    fn split_keeps_prior_turns_as_history() {
        let (preamble, history, _prompt) = split_messages(vec![
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("second"),
        ])
        .unwrap();
        assert!(preamble.is_none());
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn split_rejects_missing_user_prompt() {
        assert!(split_messages(vec![ChatMessage::system("only")]).is_err());
        assert!(split_messages(vec![
            ChatMessage::user("q"),
            ChatMessage::assistant("a"),
        ])
        .is_err());
    }
}
