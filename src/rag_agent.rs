//! Retrieval-augmented agent.
//!
//! The retriever itself is a black box behind a trait: population of the
//! vector store and the chunking/embedding pipeline live outside this
//! engine. The agent grounds one model call in whatever the retriever
//! returns and streams the answer.

use std::sync::Arc;

use tokio::sync::watch;

use crate::actors::llm_gateway::{stream_to_emitter, CompletionRequest, LlmHandle};
use crate::error::EngineError;
use crate::prompts;
use crate::protocol::{EventEmitter, Message, TokenChannel};
use crate::sql_agent::AgentOutcome;

const RETRIEVE_LIMIT: usize = 5;

/// Black-box retriever contract.
pub trait Retriever: Send + Sync {
    fn retrieve(&self, question: &str, limit: usize) -> Vec<String>;
}

/// Retriever used when no backend is wired: returns nothing, and the
/// agent answers honestly that no documents were found.
#[derive(Debug, Default)]
pub struct NullRetriever;

impl Retriever for NullRetriever {
    fn retrieve(&self, _question: &str, _limit: usize) -> Vec<String> {
        Vec::new()
    }
}

/// Naive in-memory retriever, ranked by shared-word overlap. Good
/// enough for tests and local runs.
#[derive(Debug, Default)]
pub struct KeywordRetriever {
    chunks: Vec<String>,
}

impl KeywordRetriever {
    pub fn new(chunks: Vec<String>) -> Self {
        Self { chunks }
    }
}

impl Retriever for KeywordRetriever {
    fn retrieve(&self, question: &str, limit: usize) -> Vec<String> {
        let needles: Vec<String> = question
            .to_lowercase()
            .split_whitespace()
            .filter(|w| w.len() > 3)
            .map(String::from)
            .collect();

        let mut scored: Vec<(usize, &String)> = self
            .chunks
            .iter()
            .map(|chunk| {
                let haystack = chunk.to_lowercase();
                let score = needles.iter().filter(|n| haystack.contains(*n)).count();
                (score, chunk)
            })
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(limit)
            .map(|(_, chunk)| chunk.clone())
            .collect()
    }
}

pub struct RagAgent {
    llm: LlmHandle,
    retriever: Arc<dyn Retriever>,
}

impl RagAgent {
    pub fn new(llm: LlmHandle, retriever: Arc<dyn Retriever>) -> Self {
        Self { llm, retriever }
    }

    pub async fn run(
        &self,
        question: &str,
        history: &[Message],
        emitter: &mut EventEmitter,
        cancel_rx: &watch::Receiver<bool>,
    ) -> Result<AgentOutcome, EngineError> {
        let chunks = self.retriever.retrieve(question, RETRIEVE_LIMIT);
        tracing::debug!(chunks = chunks.len(), "rag retrieval complete");

        let messages = prompts::build_rag_prompt(question, &chunks, history);
        let answer = stream_to_emitter(
            &self.llm,
            CompletionRequest::new(messages),
            TokenChannel::Final,
            emitter,
            cancel_rx,
        )
        .await
        .map_err(EngineError::from)?;

        Ok(AgentOutcome {
            answer,
            structured: None,
        })
    }
}
