//! fieldquery - a natural-language-to-SQL query engine.
//!
//! A question enters the orchestrator, a classifier routes it to the
//! SQL, RAG, or general agent, and the answer streams back as semantic
//! events grounded in freshly executed SQL. The join graph, domain
//! registry, display attributes, and secure-view map are loaded once at
//! startup and shared read-only; the conversation store is the only
//! shared mutable resource.

pub mod actors;
pub mod bridge_discovery;
pub mod cli;
pub mod display_attributes;
pub mod domain_registry;
pub mod error;
pub mod general_agent;
pub mod join_graph;
pub mod join_planner;
pub mod orchestrator;
pub mod path_finder;
pub mod prompts;
pub mod protocol;
pub mod rag_agent;
pub mod secure_views;
pub mod settings;
pub mod sql_agent;
pub mod sql_text;
pub mod sql_validator;
pub mod table_selector;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::{mpsc, watch};

use crate::actors::conversation_store::{spawn_cleanup_task, ConversationHandle};
use crate::actors::llm_gateway::LlmHandle;
use crate::actors::query_executor::ExecutorHandle;
use crate::display_attributes::DisplayAttributes;
use crate::domain_registry::DomainRegistry;
use crate::error::EngineError;
use crate::general_agent::GeneralAgent;
use crate::join_graph::JoinGraph;
use crate::orchestrator::Orchestrator;
use crate::protocol::{ChatRequest, StreamEvent};
use crate::rag_agent::{NullRetriever, RagAgent};
use crate::secure_views::SecureViewMap;
use crate::settings::EngineSettings;
use crate::sql_agent::SqlAgent;

/// One in-flight chat: the event stream plus its cancellation signal.
/// Dropping `cancel` (or sending `true`) abandons the request at the
/// next suspension point.
pub struct ChatStream {
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
    pub cancel: watch::Sender<bool>,
}

/// The assembled engine. Built once per process; cheap to share.
pub struct Engine {
    orchestrator: Arc<Orchestrator>,
}

impl Engine {
    /// Load artifacts, spawn the actors, and assemble the orchestrator.
    /// Any invalid artifact or environment is fatal here.
    pub async fn bootstrap(settings: EngineSettings) -> Result<Self, EngineError> {
        settings.validate()?;

        let graph = Arc::new(JoinGraph::load(&settings.join_graph_path).await?);
        let display =
            Arc::new(DisplayAttributes::load(&settings.display_attributes_path, &graph).await?);
        let registry = if settings.domain.extraction_enabled {
            Arc::new(DomainRegistry::load(&settings.domain.registry_path, &graph).await?)
        } else {
            Arc::new(DomainRegistry::default())
        };

        let llm = LlmHandle::spawn(settings.llm.clone());
        let executor =
            ExecutorHandle::spawn(settings.database.clone(), settings.sql.max_query_rows);

        let views = if settings.database.secure_base_tables.is_empty() {
            Arc::new(SecureViewMap::default())
        } else {
            let discovered = executor.discover_secure_views().await.map_err(|e| {
                EngineError::Config(format!("secure view discovery failed: {}", e))
            })?;
            let map =
                SecureViewMap::from_discovered(&discovered, &settings.database.secure_base_tables);
            tracing::info!(views = map.len(), "secure views discovered");
            Arc::new(map)
        };

        let conversations = ConversationHandle::spawn(settings.conversation.clone());
        spawn_cleanup_task(
            conversations.clone(),
            settings.conversation.cleanup_interval_hours,
        );

        let sql_agent = SqlAgent::new(
            graph,
            registry,
            display,
            views,
            llm.clone(),
            executor,
            settings.sql.clone(),
            settings.domain.extraction_enabled,
        );
        let rag_agent = RagAgent::new(llm.clone(), Arc::new(NullRetriever));
        let general_agent = GeneralAgent::new(llm.clone());

        let orchestrator = Arc::new(
            Orchestrator::new(
                llm,
                sql_agent,
                rag_agent,
                general_agent,
                conversations,
                settings.conversation.max_messages,
                settings.pipeline_timeout_secs,
            )
            .with_max_context_tokens(settings.max_context_tokens),
        );

        Ok(Self { orchestrator })
    }

    /// Start one chat request. Request-body validation happens before
    /// any event exists, so the front door can reject with a plain 4xx;
    /// after that, all failures arrive as `error` events on the stream.
    pub fn chat(&self, request: ChatRequest) -> Result<ChatStream, EngineError> {
        Orchestrator::validate_request(&request)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            // Validation already passed, so any Err here is unreachable;
            // stream failures are events, not results.
            let _ = orchestrator
                .handle_request(request, event_tx, cancel_rx)
                .await;
        });

        Ok(ChatStream {
            events: event_rx,
            cancel: cancel_tx,
        })
    }
}

/// Binary entry point.
pub fn run() {
    let args = cli::CliArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(cli::run(args)) {
        tracing::error!(error = %e, "fatal");
        std::process::exit(1);
    }
}
