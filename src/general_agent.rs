//! Pass-through general agent: one model call over the conversation,
//! streamed straight to the user.

use tokio::sync::watch;

use crate::actors::llm_gateway::{stream_to_emitter, CompletionRequest, LlmHandle};
use crate::error::EngineError;
use crate::prompts;
use crate::protocol::{EventEmitter, Message, TokenChannel};
use crate::sql_agent::AgentOutcome;

pub struct GeneralAgent {
    llm: LlmHandle,
}

impl GeneralAgent {
    pub fn new(llm: LlmHandle) -> Self {
        Self { llm }
    }

    pub async fn run(
        &self,
        question: &str,
        history: &[Message],
        emitter: &mut EventEmitter,
        cancel_rx: &watch::Receiver<bool>,
    ) -> Result<AgentOutcome, EngineError> {
        let messages = prompts::build_general_prompt(question, history);
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
