//! Request orchestration: classify, route, run the chosen agent, and
//! checkpoint the conversation around the whole thing.
//!
//! Built once per process (the agents and their shared artifacts are
//! expensive to assemble) and reentrant across concurrent conversations:
//! all per-request state lives in locals and the pipeline record.
//! Checkpoint history is loaded and merged *before* the pipeline starts,
//! because the classifier and sub-agents need the full context.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::actors::conversation_store::{
    is_version_conflict, Checkpoint, ConversationHandle,
};
use crate::actors::llm_gateway::{CompletionRequest, LlmHandle};
use crate::error::EngineError;
use crate::general_agent::GeneralAgent;
use crate::prompts;
use crate::protocol::{
    token_budget_view, truncated_view, AgentRoute, ChatRequest, EventEmitter, Message,
    StreamEvent,
};
use crate::rag_agent::RagAgent;
use crate::sql_agent::{AgentOutcome, SqlAgent};

pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Normalize a question for routing so casing/whitespace variants
/// classify identically.
pub fn normalize_for_routing(question: &str) -> String {
    question
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Parse the classifier's reply into a route. Unrecognized replies fall
/// back to the general agent.
pub fn parse_route(reply: &str) -> AgentRoute {
    let lowered = reply.to_lowercase();
    if lowered.contains("sql") {
        AgentRoute::Sql
    } else if lowered.contains("rag") {
        AgentRoute::Rag
    } else {
        AgentRoute::General
    }
}

pub struct Orchestrator {
    llm: LlmHandle,
    sql_agent: SqlAgent,
    rag_agent: RagAgent,
    general_agent: GeneralAgent,
    conversations: ConversationHandle,
    max_conversation_messages: usize,
    max_context_tokens: usize,
    pipeline_timeout_secs: u64,
}

impl Orchestrator {
    pub fn new(
        llm: LlmHandle,
        sql_agent: SqlAgent,
        rag_agent: RagAgent,
        general_agent: GeneralAgent,
        conversations: ConversationHandle,
        max_conversation_messages: usize,
        pipeline_timeout_secs: u64,
    ) -> Self {
        Self {
            llm,
            sql_agent,
            rag_agent,
            general_agent,
            conversations,
            max_conversation_messages,
            max_context_tokens: 8000,
            pipeline_timeout_secs,
        }
    }

    pub fn with_max_context_tokens(mut self, max_context_tokens: usize) -> Self {
        self.max_context_tokens = max_context_tokens;
        self
    }

    /// Validate the request body. Failures here happen before any event
    /// is emitted, so the front door can answer with a plain 4xx.
    pub fn validate_request(request: &ChatRequest) -> Result<(), EngineError> {
        let length = request.message.chars().count();
        if length == 0 || length > MAX_MESSAGE_CHARS {
            return Err(EngineError::Config(format!(
                "message length must be 1..={} characters",
                MAX_MESSAGE_CHARS
            )));
        }
        if request.conversation.id.is_empty() {
            return Err(EngineError::Config(
                "conversation id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Handle one request end to end, emitting semantic events on
    /// `event_tx`. Exactly one terminal event is emitted unless the
    /// client disconnects or cancels mid-stream.
    pub async fn handle_request(
        &self,
        request: ChatRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        Self::validate_request(&request)?;

        let mut emitter = EventEmitter::new(event_tx);
        let deadline = Duration::from_secs(self.pipeline_timeout_secs);

        let outcome = timeout(
            deadline,
            self.run_pipeline(&request, &mut emitter, &cancel_rx),
        )
        .await;

        let cancelled = *cancel_rx.borrow() || emitter.client_gone();
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(error = %e, code = e.stable_code(), "pipeline failed");
                if !cancelled {
                    emitter.error(format!("{}: {}", e.stable_code(), e.user_message()));
                }
            }
            Err(_elapsed) => {
                tracing::warn!("whole-pipeline timeout");
                if !cancelled {
                    let timeout_error = EngineError::Timeout {
                        component: "pipeline",
                    };
                    emitter.error(format!(
                        "{}: {}",
                        timeout_error.stable_code(),
                        timeout_error.user_message()
                    ));
                }
            }
        }
        Ok(())
    }

    async fn run_pipeline(
        &self,
        request: &ChatRequest,
        emitter: &mut EventEmitter,
        cancel_rx: &watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        let conversation_id = request.conversation.id.clone();
        let question = request.message.trim().to_string();

        // Load and merge checkpoint history before anything else.
        let (mut history, loaded_version) = match self.conversations.get(&conversation_id).await {
            Ok(Some(versioned)) => (versioned.checkpoint.messages, versioned.version),
            Ok(None) => (Vec::new(), 0),
            Err(e) => {
                tracing::warn!(error = %e, "checkpoint load failed, starting fresh");
                (Vec::new(), 0)
            }
        };
        let truncated: Vec<Message> = token_budget_view(
            truncated_view(&history, self.max_conversation_messages),
            self.max_context_tokens,
        )
        .to_vec();

        // Classify.
        let route = self.classify(&truncated, &question).await?;
        emitter.route_decision(route);
        emitter.tool_start(route.tool());
        tracing::info!(?route, conversation = %conversation_id, "route decided");

        // Run the chosen agent.
        let result = match route {
            AgentRoute::Sql => {
                self.sql_agent
                    .run(&question, &truncated, &request.scopes, emitter, cancel_rx)
                    .await
            }
            AgentRoute::Rag => {
                self.rag_agent
                    .run(&question, &truncated, emitter, cancel_rx)
                    .await
            }
            AgentRoute::General => {
                self.general_agent
                    .run(&question, &truncated, emitter, cancel_rx)
                    .await
            }
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            // An unconnectable selection is not a stream error: the user
            // gets an apologetic final answer.
            Err(e @ EngineError::PathNotFound { .. }) => {
                tracing::info!(error = %e, "no join path, answering apologetically");
                let answer = e.user_message();
                emitter.token(crate::protocol::TokenChannel::Final, answer.clone());
                AgentOutcome {
                    answer,
                    structured: None,
                }
            }
            Err(e) => return Err(e),
        };

        // Persist the checkpoint, unless the client went away.
        if !*cancel_rx.borrow() && !emitter.client_gone() {
            history.push(Message::user(question.clone()));
            history.push(Message::assistant(outcome.answer.clone()));
            self.persist(&conversation_id, history, loaded_version).await;
            emitter.complete(&conversation_id);
        }

        Ok(())
    }

    async fn classify(
        &self,
        history: &[Message],
        question: &str,
    ) -> Result<AgentRoute, EngineError> {
        let normalized = normalize_for_routing(question);
        let messages = prompts::build_classify_prompt(history, &normalized);
        let reply = self.llm.complete(CompletionRequest::new(messages)).await?;
        Ok(parse_route(&reply))
    }

    /// CAS write with a single reload-and-retry on conflict: the later
    /// writer wins.
    async fn persist(&self, conversation_id: &str, messages: Vec<Message>, version: i64) {
        let checkpoint = Checkpoint::new(messages);
        match self
            .conversations
            .put(conversation_id, checkpoint.clone(), version)
            .await
        {
            Ok(_) => {}
            Err(e) if is_version_conflict(&e) => {
                tracing::debug!("checkpoint conflict, merging onto latest");
                let latest = self.conversations.get(conversation_id).await;
                if let Ok(Some(current)) = latest {
                    let mut merged = current.checkpoint.messages;
                    let new_tail: Vec<Message> = checkpoint
                        .messages
                        .iter()
                        .rev()
                        .take(2)
                        .rev()
                        .cloned()
                        .collect();
                    merged.extend(new_tail);
                    if let Err(e) = self
                        .conversations
                        .put(conversation_id, Checkpoint::new(merged), current.version)
                        .await
                    {
                        tracing::warn!(error = %e, "checkpoint retry failed, dropping turn");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "checkpoint write failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route() {
        assert_eq!(parse_route("sql"), AgentRoute::Sql);
        assert_eq!(parse_route("  SQL\n"), AgentRoute::Sql);
        assert_eq!(parse_route("route: rag"), AgentRoute::Rag);
        assert_eq!(parse_route("general"), AgentRoute::General);
        assert_eq!(parse_route("no idea"), AgentRoute::General);
    }

    #[test]
    fn test_normalize_for_routing_is_case_and_space_insensitive() {
        assert_eq!(
            normalize_for_routing("How many  Active employees?"),
            normalize_for_routing("  how many active EMPLOYEES?  ")
        );
    }

    #[test]
    fn test_request_validation() {
        let mut request = ChatRequest {
            message: "hello".to_string(),
            conversation: crate::protocol::ConversationRef {
                id: "c1".to_string(),
                user_id: "u1".to_string(),
                company_id: "co1".to_string(),
            },
            scopes: Default::default(),
        };
        assert!(Orchestrator::validate_request(&request).is_ok());

        request.message = String::new();
        assert!(Orchestrator::validate_request(&request).is_err());

        request.message = "x".repeat(MAX_MESSAGE_CHARS + 1);
        assert!(Orchestrator::validate_request(&request).is_err());
    }
}
