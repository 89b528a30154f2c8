//! Shared request/response types and the semantic event protocol.
//!
//! The event schema here is the public boundary for anything the user
//! might see: the front door frames these events as SSE, the BFF maps
//! them to UI tokens. Keeping them UI-free is a hard requirement.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// ============ Conversation Messages ============

/// A single conversation message, persisted in checkpoints and replayed
/// into model calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Return a truncated view of the history for model calls. The persisted
/// history is never mutated; truncation is a view.
pub fn truncated_view(messages: &[Message], max_messages: usize) -> &[Message] {
    if messages.len() <= max_messages {
        messages
    } else {
        &messages[messages.len() - max_messages..]
    }
}

/// Further trim a history view to a rough token budget (4 chars/token),
/// keeping the most recent messages.
pub fn token_budget_view(messages: &[Message], max_tokens: usize) -> &[Message] {
    let budget_chars = max_tokens.saturating_mul(4);
    let mut used = 0usize;
    let mut start = messages.len();
    for (index, message) in messages.iter().enumerate().rev() {
        used += message.content.len();
        if used > budget_chars {
            break;
        }
        start = index;
    }
    &messages[start..]
}

// ============ Chat Request ============

/// Conversation identity as carried by the front door.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRef {
    pub id: String,
    pub user_id: String,
    pub company_id: String,
}

/// Optional tenant scoping carried by the request. Session variables are
/// only set for scopes that are present; the BFF decides whether to wire
/// them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantScopes {
    #[serde(default)]
    pub customer_ids: Vec<String>,
    #[serde(default)]
    pub work_order_ids: Vec<String>,
    #[serde(default)]
    pub service_location_ids: Vec<String>,
}

impl TenantScopes {
    pub fn is_empty(&self) -> bool {
        self.customer_ids.is_empty()
            && self.work_order_ids.is_empty()
            && self.service_location_ids.is_empty()
    }
}

/// A chat request as handed over by the front door.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub conversation: ConversationRef,
    #[serde(default)]
    pub scopes: TenantScopes,
}

// ============ Semantic Events ============

/// Agent routes the classifier can choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRoute {
    Sql,
    Rag,
    General,
}

impl AgentRoute {
    pub fn tool(&self) -> AgentTool {
        match self {
            AgentRoute::Sql => AgentTool::SqlAgent,
            AgentRoute::Rag => AgentTool::RagAgent,
            AgentRoute::General => AgentTool::GeneralAgent,
        }
    }
}

/// Tool identifiers carried on `tool_start` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTool {
    SqlAgent,
    RagAgent,
    GeneralAgent,
}

/// Token channels. Tokens on `final` belong to the user-visible answer;
/// everything else is reasoning the consumer may hide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenChannel {
    Classify,
    SqlAgent,
    RagAgent,
    General,
    Final,
}

/// Stats payload on the terminal `complete` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionStats {
    pub tokens: u64,
    pub conversation_id: String,
}

/// Semantic events carried in order on a single stream per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    RouteDecision { route: AgentRoute },
    ToolStart { tool: AgentTool },
    Token { channel: TokenChannel, content: String },
    Complete { stats: CompletionStats },
    Error { error: String },
}

// ============ Event Emitter ============

/// Per-request event emitter enforcing the stream invariants: at least
/// one `tool_start` before any `token`, and exactly one terminal event.
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<StreamEvent>,
    tool_started: bool,
    terminal_sent: bool,
    tokens_emitted: u64,
    client_gone: bool,
}

impl EventEmitter {
    pub fn new(tx: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self {
            tx,
            tool_started: false,
            terminal_sent: false,
            tokens_emitted: 0,
            client_gone: false,
        }
    }

    /// Whether the consumer has gone away. The producer should abandon
    /// work at the next suspension point when this turns true.
    pub fn client_gone(&self) -> bool {
        self.client_gone
    }

    pub fn tokens_emitted(&self) -> u64 {
        self.tokens_emitted
    }

    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent
    }

    fn send(&mut self, event: StreamEvent) {
        if self.terminal_sent {
            tracing::warn!("event dropped after terminal: {:?}", event);
            return;
        }
        if self.tx.send(event).is_err() {
            self.client_gone = true;
        }
    }

    pub fn route_decision(&mut self, route: AgentRoute) {
        self.send(StreamEvent::RouteDecision { route });
    }

    pub fn tool_start(&mut self, tool: AgentTool) {
        self.tool_started = true;
        self.send(StreamEvent::ToolStart { tool });
    }

    pub fn token(&mut self, channel: TokenChannel, content: impl Into<String>) {
        if !self.tool_started {
            tracing::warn!("token emitted before tool_start; dropping");
            return;
        }
        self.tokens_emitted += 1;
        self.send(StreamEvent::Token {
            channel,
            content: content.into(),
        });
    }

    /// Emit the successful terminal event. No-op if a terminal was
    /// already sent or the client disconnected.
    pub fn complete(&mut self, conversation_id: &str) {
        if self.client_gone {
            return;
        }
        let stats = CompletionStats {
            tokens: self.tokens_emitted,
            conversation_id: conversation_id.to_string(),
        };
        self.send(StreamEvent::Complete { stats });
        self.terminal_sent = true;
    }

    /// Emit the failing terminal event. No-op if a terminal was already
    /// sent or the client disconnected.
    pub fn error(&mut self, error: impl Into<String>) {
        if self.client_gone {
            return;
        }
        self.send(StreamEvent::Error {
            error: error.into(),
        });
        self.terminal_sent = true;
    }
}
