//! Scripted actor doubles and fixtures shared by the integration tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::actors::conversation_store::ConversationHandle;
use crate::actors::llm_gateway::{CompletionRequest, LlmHandle, LlmMsg};
use crate::actors::query_executor::{ExecError, ExecutorHandle, ExecutorMsg, QueryOutput};
use crate::display_attributes::DisplayAttributes;
use crate::domain_registry::DomainRegistry;
use crate::general_agent::GeneralAgent;
use crate::join_graph::test_graphs::demo_graph;
use crate::orchestrator::Orchestrator;
use crate::protocol::{ChatRequest, ConversationRef, StreamEvent};
use crate::rag_agent::{NullRetriever, RagAgent};
use crate::secure_views::SecureViewMap;
use crate::settings::{test_settings, ConversationSettings};
use crate::sql_agent::SqlAgent;

/// Spawn a task servicing the LLM channel from a fixed reply queue.
/// Streaming requests emit the reply word by word. Every request is
/// recorded for prompt assertions.
pub fn scripted_llm(replies: &[&str]) -> (LlmHandle, Arc<Mutex<Vec<CompletionRequest>>>) {
    let (tx, mut rx) = mpsc::channel(32);
    let requests: Arc<Mutex<Vec<CompletionRequest>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = requests.clone();
    let mut queue: VecDeque<String> = replies.iter().map(|s| s.to_string()).collect();

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let reply = queue.pop_front().unwrap_or_default();
            match msg {
                LlmMsg::Complete {
                    request,
                    respond_to,
                } => {
                    recorded.lock().unwrap().push(request);
                    let _ = respond_to.send(Ok(reply));
                }
                LlmMsg::CompleteStreaming {
                    request,
                    token_tx,
                    respond_to,
                    ..
                } => {
                    recorded.lock().unwrap().push(request);
                    for word in reply.split_inclusive(' ') {
                        let _ = token_tx.send(word.to_string());
                    }
                    drop(token_tx);
                    let _ = respond_to.send(Ok(reply));
                }
            }
        }
    });

    (LlmHandle::from_channel(tx), requests)
}

/// An LLM double that never answers, for timeout tests.
pub fn silent_llm() -> LlmHandle {
    let (tx, mut rx) = mpsc::channel::<LlmMsg>(32);
    tokio::spawn(async move {
        let mut parked = Vec::new();
        while let Some(msg) = rx.recv().await {
            parked.push(msg);
        }
    });
    LlmHandle::from_channel(tx)
}

/// Spawn a task servicing the executor channel from a fixed result
/// queue. Executed SQL is recorded for assertions; sample-row and
/// discovery requests answer empty.
pub fn scripted_executor(
    results: Vec<Result<QueryOutput, ExecError>>,
) -> (ExecutorHandle, Arc<Mutex<Vec<String>>>) {
    let (tx, mut rx) = mpsc::channel(32);
    let executed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = executed.clone();
    let mut queue: VecDeque<Result<QueryOutput, ExecError>> = results.into_iter().collect();

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                ExecutorMsg::Execute {
                    sql, respond_to, ..
                } => {
                    recorded.lock().unwrap().push(sql);
                    let result = queue
                        .pop_front()
                        .unwrap_or_else(|| Ok(QueryOutput::default()));
                    let _ = respond_to.send(result);
                }
                ExecutorMsg::SampleRows { respond_to, .. } => {
                    let _ = respond_to.send(Ok(QueryOutput::default()));
                }
                ExecutorMsg::DiscoverSecureViews { respond_to } => {
                    let _ = respond_to.send(Ok(Vec::new()));
                }
            }
        }
    });

    (ExecutorHandle::from_channel(tx), executed)
}

pub fn single_row_output() -> QueryOutput {
    QueryOutput {
        columns: vec!["firstName".to_string(), "startedAt".to_string()],
        rows: vec![vec![
            serde_json::json!("Dana"),
            serde_json::json!("2026-10-06 08:00:00"),
        ]],
    }
}

pub struct TestHarness {
    pub orchestrator: Orchestrator,
    pub conversations: ConversationHandle,
    // Keeps the store directory alive for the duration of the test.
    _store_dir: tempfile::TempDir,
}

pub struct HarnessOptions {
    pub llm: LlmHandle,
    pub executor: ExecutorHandle,
    pub views: SecureViewMap,
    pub registry: Option<DomainRegistry>,
    pub pipeline_timeout_secs: u64,
}

pub fn build_harness(options: HarnessOptions) -> TestHarness {
    let settings = test_settings();
    let graph = Arc::new(demo_graph());
    let registry = options.registry.map(Arc::new).unwrap_or_default();
    let extraction_enabled = !registry.is_empty();

    let store_dir = tempfile::tempdir().expect("tempdir");
    let conversations = ConversationHandle::spawn(ConversationSettings {
        db_path: store_dir.path().join("conversations.db"),
        ..settings.conversation.clone()
    });

    let sql_agent = SqlAgent::new(
        graph,
        registry,
        Arc::new(DisplayAttributes::default()),
        Arc::new(options.views),
        options.llm.clone(),
        options.executor,
        settings.sql.clone(),
        extraction_enabled,
    );
    let rag_agent = RagAgent::new(options.llm.clone(), Arc::new(NullRetriever));
    let general_agent = GeneralAgent::new(options.llm.clone());

    let orchestrator = Orchestrator::new(
        options.llm,
        sql_agent,
        rag_agent,
        general_agent,
        conversations.clone(),
        settings.conversation.max_messages,
        options.pipeline_timeout_secs,
    );

    TestHarness {
        orchestrator,
        conversations,
        _store_dir: store_dir,
    }
}

pub fn request(message: &str, conversation_id: &str) -> ChatRequest {
    ChatRequest {
        message: message.to_string(),
        conversation: ConversationRef {
            id: conversation_id.to_string(),
            user_id: "u-test".to_string(),
            company_id: "co-test".to_string(),
        },
        scopes: Default::default(),
    }
}

/// Run one request to completion and return the emitted events.
pub async fn run_request(harness: &TestHarness, request: ChatRequest) -> Vec<StreamEvent> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    harness
        .orchestrator
        .handle_request(request, event_tx, cancel_rx)
        .await
        .expect("request validation");

    let mut events = Vec::new();
    while let Ok(event) = event_rx.try_recv() {
        events.push(event);
    }
    events
}

/// Stream invariants every request must satisfy: ordering, a tool_start
/// before any token, exactly one terminal event at the end.
pub fn assert_stream_invariants(events: &[StreamEvent]) {
    assert!(!events.is_empty(), "stream must not be empty");

    let mut saw_tool_start = false;
    let mut terminals = 0;
    for event in events {
        match event {
            StreamEvent::ToolStart { .. } => saw_tool_start = true,
            StreamEvent::Token { .. } => {
                assert!(saw_tool_start, "token emitted before tool_start")
            }
            StreamEvent::Complete { .. } | StreamEvent::Error { .. } => terminals += 1,
            StreamEvent::RouteDecision { .. } => {}
        }
    }
    assert_eq!(terminals, 1, "exactly one terminal event expected");
    assert!(
        matches!(
            events.last().unwrap(),
            StreamEvent::Complete { .. } | StreamEvent::Error { .. }
        ),
        "terminal event must be last"
    );
}
