//! Engine error taxonomy.
//!
//! Every component returns errors as values; recoverable errors
//! (validation, execution, hallucinated identifiers) stay inside the SQL
//! pipeline's correction loop, everything else surfaces as a single
//! `error` event on the stream.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Invalid artifacts or environment at startup. Fatal.
    #[error("configuration error: {0}")]
    Config(String),

    /// The pre-execution validator rejected the SQL.
    #[error("SQL validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// The database returned an error for the generated SQL.
    #[error("query execution failed: {0}")]
    Execution(String),

    /// The secure-view rewriter found an identifier that is neither a
    /// known table nor a declared secure view.
    #[error("unknown table: {0}")]
    Hallucination(String),

    /// The path finder could not connect the selected tables.
    #[error("no join path between {from} and {to} within {max_hops} hops")]
    PathNotFound {
        from: String,
        to: String,
        max_hops: usize,
    },

    /// A component-level timeout (LLM call, DB query, or whole pipeline).
    #[error("{component} timed out")]
    Timeout { component: &'static str },

    /// The language model or database is unreachable.
    #[error("upstream unavailable: {0}")]
    Upstream(String),
}

impl EngineError {
    /// Stable machine-readable code, carried on `error` events.
    pub fn stable_code(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config_error",
            EngineError::Validation(_) => "validation_error",
            EngineError::Execution(_) => "execution_error",
            EngineError::Hallucination(_) => "unknown_table",
            EngineError::PathNotFound { .. } => "path_not_found",
            EngineError::Timeout { component } => match *component {
                "pipeline" => "pipeline_timeout",
                "llm" => "llm_timeout",
                "database" => "db_timeout",
                _ => "timeout",
            },
            EngineError::Upstream(_) => "upstream_unavailable",
        }
    }

    /// Whether the SQL pipeline may recover from this error by entering
    /// the correction loop.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_)
                | EngineError::Execution(_)
                | EngineError::Hallucination(_)
        )
    }

    /// Plain-language message shown to the user on unrecovered failure.
    /// Never leaks SQL, schema details, or stack traces.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::PathNotFound { .. } => {
                "I could not find a way to connect the data needed to answer \
                 that question. Could you rephrase it or narrow it down?"
                    .to_string()
            }
            EngineError::Timeout { .. } => {
                "That took longer than expected and was cancelled. Please try \
                 again."
                    .to_string()
            }
            EngineError::Upstream(_) => {
                "A backing service is currently unavailable. Please try again \
                 in a moment."
                    .to_string()
            }
            _ => "I was unable to answer that question from the data. Please \
                  try rephrasing it."
                .to_string(),
        }
    }
}
