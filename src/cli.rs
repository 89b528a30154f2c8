//! Command-line argument parsing and launch configuration.
//!
//! Every recognized environment option maps to a clap argument with an
//! `env` attribute, so the engine can be configured either way. The
//! parsed arguments are assembled into typed `EngineSettings`.

use std::path::PathBuf;

use clap::Parser;

use crate::settings::{
    ConversationSettings, DatabaseSettings, DomainSettings, EngineSettings, LlmProvider,
    LlmSettings, SqlPipelineSettings,
};

/// CLI arguments for the fieldquery engine.
#[derive(Parser, Debug, Clone)]
#[command(name = "fieldquery", about = "Natural-language-to-SQL query engine")]
pub struct CliArgs {
    // ============ Database ============
    #[arg(long, value_name = "HOST", env = "DB_HOST", default_value = "localhost")]
    pub db_host: String,
    #[arg(long, value_name = "PORT", env = "DB_PORT", default_value_t = 3306)]
    pub db_port: u16,
    #[arg(long, value_name = "USER", env = "DB_USER", default_value = "")]
    pub db_user: String,
    #[arg(long, value_name = "PWD", env = "DB_PWD", default_value = "")]
    pub db_pwd: String,
    #[arg(long, value_name = "NAME", env = "DB_NAME", default_value = "")]
    pub db_name: String,
    /// Session encryption key, set as `@aesKey` on every pooled connection
    #[arg(long, value_name = "KEY", env = "DB_ENCRYPT_KEY")]
    pub db_encrypt_key: Option<String>,
    /// Logical tables whose secure_* views are discovered at startup
    #[arg(
        long,
        value_name = "TABLE[,TABLE...]",
        env = "SECURE_BASE_TABLES",
        value_delimiter = ','
    )]
    pub secure_base_tables: Option<Vec<String>>,
    #[arg(long, value_name = "INT", env = "DB_POOL_MAX", default_value_t = 10)]
    pub db_pool_max: usize,
    #[arg(long, value_name = "SECS", env = "DB_ACQUIRE_TIMEOUT_SECS", default_value_t = 5)]
    pub db_acquire_timeout_secs: u64,
    #[arg(long, value_name = "SECS", env = "DB_QUERY_TIMEOUT_SECS", default_value_t = 30)]
    pub db_query_timeout_secs: u64,

    // ============ Language model provider ============
    #[arg(long, value_name = "PROVIDER", env = "LLM_PROVIDER", default_value = "ollama")]
    pub llm_provider: LlmProvider,
    #[arg(long, value_name = "KEY", env = "OPENAI_API_KEY")]
    pub openai_api_key: Option<String>,
    #[arg(
        long,
        value_name = "URL",
        env = "OPENAI_BASE_URL",
        default_value = "https://api.openai.com"
    )]
    pub openai_base_url: String,
    #[arg(long, value_name = "MODEL", env = "OPENAI_MODEL", default_value = "gpt-4o-mini")]
    pub openai_model: String,
    #[arg(long, value_name = "FLOAT", env = "OPENAI_TEMPERATURE", default_value_t = 0.0)]
    pub openai_temperature: f32,
    #[arg(
        long,
        value_name = "URL",
        env = "OLLAMA_BASE_URL",
        default_value = "http://localhost:11434"
    )]
    pub ollama_base_url: String,
    #[arg(long, value_name = "MODEL", env = "OLLAMA_MODEL", default_value = "llama3.1")]
    pub ollama_model: String,
    #[arg(
        long,
        value_name = "MODEL",
        env = "OLLAMA_EMBEDDING_MODEL",
        default_value = "nomic-embed-text"
    )]
    pub ollama_embedding_model: String,
    #[arg(long, value_name = "SECS", env = "LLM_REQUEST_TIMEOUT_SECS", default_value_t = 60)]
    pub llm_request_timeout_secs: u64,

    // ============ SQL pipeline ============
    #[arg(long, value_name = "INT", env = "SQL_MAX_TABLES_IN_SELECTION_PROMPT", default_value_t = 40)]
    pub sql_max_tables_in_selection_prompt: usize,
    #[arg(long, value_name = "INT", env = "SQL_MAX_FALLBACK_TABLES", default_value_t = 5)]
    pub sql_max_fallback_tables: usize,
    #[arg(long, value_name = "FLOAT", env = "SQL_CONFIDENCE_THRESHOLD", default_value_t = 0.70)]
    pub sql_confidence_threshold: f64,
    #[arg(long, value_name = "INT", env = "SQL_CORRECTION_MAX_ATTEMPTS", default_value_t = 3)]
    pub sql_correction_max_attempts: u32,
    #[arg(
        long,
        value_name = "BOOL",
        env = "SQL_PRE_VALIDATION_ENABLED",
        default_value_t = true,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub sql_pre_validation_enabled: bool,
    #[arg(long, value_name = "INT", env = "SQL_SAMPLE_ROWS", default_value_t = 0)]
    pub sql_sample_rows: usize,
    #[arg(long, value_name = "INT", env = "SQL_MAX_RELATIONSHIPS_IN_PROMPT", default_value_t = 30)]
    pub sql_max_relationships_in_prompt: usize,
    #[arg(long, value_name = "INT", env = "SQL_MAX_COLUMNS_IN_SCHEMA", default_value_t = 25)]
    pub sql_max_columns_in_schema: usize,
    #[arg(long, value_name = "INT", env = "SQL_MAX_COLUMNS_IN_VALIDATION", default_value_t = 40)]
    pub sql_max_columns_in_validation: usize,
    #[arg(long, value_name = "INT", env = "SQL_MAX_COLUMNS_IN_CORRECTION", default_value_t = 20)]
    pub sql_max_columns_in_correction: usize,
    #[arg(long, value_name = "INT", env = "SQL_MAX_SUGGESTED_PATHS", default_value_t = 3)]
    pub sql_max_suggested_paths: usize,
    #[arg(long, value_name = "INT", env = "SQL_MAX_JOIN_HOPS", default_value_t = 4)]
    pub sql_max_join_hops: usize,
    #[arg(long, value_name = "INT", env = "MAX_QUERY_ROWS", default_value_t = 100)]
    pub max_query_rows: usize,
    #[arg(long, value_name = "INT", env = "MAX_CONTEXT_TOKENS", default_value_t = 8000)]
    pub max_context_tokens: usize,
    #[arg(long, value_name = "INT", env = "MAX_OUTPUT_TOKENS", default_value_t = 2000)]
    pub max_output_tokens: u32,

    // ============ Domain ============
    #[arg(
        long,
        value_name = "PATH",
        env = "DOMAIN_REGISTRY_PATH",
        default_value = "domain_registry.json"
    )]
    pub domain_registry_path: PathBuf,
    #[arg(
        long,
        value_name = "BOOL",
        env = "DOMAIN_EXTRACTION_ENABLED",
        default_value_t = true,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub domain_extraction_enabled: bool,

    // ============ Conversation ============
    #[arg(
        long,
        value_name = "PATH",
        env = "CONVERSATION_DB_PATH",
        default_value = "conversations.db"
    )]
    pub conversation_db_path: PathBuf,
    #[arg(long, value_name = "HOURS", env = "CONVERSATION_MAX_AGE_HOURS", default_value_t = 24)]
    pub conversation_max_age_hours: i64,
    #[arg(
        long,
        value_name = "HOURS",
        env = "CONVERSATION_CLEANUP_INTERVAL_HOURS",
        default_value_t = 1
    )]
    pub conversation_cleanup_interval_hours: u64,
    #[arg(long, value_name = "INT", env = "MAX_CONVERSATION_MESSAGES", default_value_t = 20)]
    pub max_conversation_messages: usize,
    #[arg(long, value_name = "INT", env = "CONVERSATION_DB_RETRY_ATTEMPTS", default_value_t = 3)]
    pub conversation_db_retry_attempts: u32,
    #[arg(long, value_name = "MS", env = "CONVERSATION_DB_RETRY_DELAY", default_value_t = 100)]
    pub conversation_db_retry_delay: u64,

    // ============ Artifacts / runtime ============
    #[arg(
        long,
        value_name = "PATH",
        env = "JOIN_GRAPH_PATH",
        default_value = "join_graph_merged.json"
    )]
    pub join_graph_path: PathBuf,
    #[arg(
        long,
        value_name = "PATH",
        env = "DISPLAY_ATTRIBUTES_PATH",
        default_value = "display_attributes_registry.json"
    )]
    pub display_attributes_path: PathBuf,
    #[arg(long, value_name = "SECS", env = "PIPELINE_TIMEOUT_SECS", default_value_t = 120)]
    pub pipeline_timeout_secs: u64,

    // ============ One-shot mode ============
    /// Ask a single question and print the event stream as JSON lines
    #[arg(long, value_name = "QUESTION")]
    pub ask: Option<String>,
    /// Conversation id to use (defaults to a fresh UUID)
    #[arg(long, value_name = "ID")]
    pub conversation: Option<String>,
}

impl CliArgs {
    /// Assemble typed engine settings from the parsed arguments.
    pub fn to_settings(&self) -> EngineSettings {
        EngineSettings {
            database: DatabaseSettings {
                host: self.db_host.clone(),
                port: self.db_port,
                user: self.db_user.clone(),
                password: self.db_pwd.clone(),
                database: self.db_name.clone(),
                encrypt_key: self.db_encrypt_key.clone(),
                secure_base_tables: self.secure_base_tables.clone().unwrap_or_default(),
                pool_max: self.db_pool_max,
                acquire_timeout_secs: self.db_acquire_timeout_secs,
                query_timeout_secs: self.db_query_timeout_secs,
            },
            llm: LlmSettings {
                provider: self.llm_provider,
                openai_api_key: self.openai_api_key.clone(),
                openai_base_url: self.openai_base_url.clone(),
                openai_model: self.openai_model.clone(),
                openai_temperature: self.openai_temperature,
                ollama_base_url: self.ollama_base_url.clone(),
                ollama_model: self.ollama_model.clone(),
                ollama_embedding_model: self.ollama_embedding_model.clone(),
                request_timeout_secs: self.llm_request_timeout_secs,
                max_output_tokens: self.max_output_tokens,
            },
            sql: SqlPipelineSettings {
                max_tables_in_selection_prompt: self.sql_max_tables_in_selection_prompt,
                max_fallback_tables: self.sql_max_fallback_tables,
                confidence_threshold: self.sql_confidence_threshold,
                correction_max_attempts: self.sql_correction_max_attempts,
                pre_validation_enabled: self.sql_pre_validation_enabled,
                sample_rows: self.sql_sample_rows,
                max_relationships_in_prompt: self.sql_max_relationships_in_prompt,
                max_columns_in_schema: self.sql_max_columns_in_schema,
                max_columns_in_validation: self.sql_max_columns_in_validation,
                max_columns_in_correction: self.sql_max_columns_in_correction,
                max_suggested_paths: self.sql_max_suggested_paths,
                max_query_rows: self.max_query_rows,
                max_join_hops: self.sql_max_join_hops,
            },
            domain: DomainSettings {
                registry_path: self.domain_registry_path.clone(),
                extraction_enabled: self.domain_extraction_enabled,
            },
            conversation: ConversationSettings {
                db_path: self.conversation_db_path.clone(),
                max_age_hours: self.conversation_max_age_hours,
                cleanup_interval_hours: self.conversation_cleanup_interval_hours,
                max_messages: self.max_conversation_messages,
                db_retry_attempts: self.conversation_db_retry_attempts,
                db_retry_delay_ms: self.conversation_db_retry_delay,
            },
            join_graph_path: self.join_graph_path.clone(),
            display_attributes_path: self.display_attributes_path.clone(),
            pipeline_timeout_secs: self.pipeline_timeout_secs,
            max_context_tokens: self.max_context_tokens,
        }
    }
}

/// Drive the engine from the terminal: one-shot `--ask`, or a
/// line-per-question loop on stdin. Events print as JSON lines - the
/// same payloads the front door would frame as SSE.
pub async fn run(args: CliArgs) -> Result<(), crate::error::EngineError> {
    let settings = args.to_settings();
    let engine = crate::Engine::bootstrap(settings).await?;

    let conversation_id = args
        .conversation
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    if let Some(question) = &args.ask {
        return ask_once(&engine, &conversation_id, question).await;
    }

    use tokio::io::{AsyncBufReadExt, BufReader};
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    tracing::info!(conversation = %conversation_id, "reading questions from stdin");
    while let Ok(Some(line)) = lines.next_line().await {
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if let Err(e) = ask_once(&engine, &conversation_id, question).await {
            tracing::warn!(error = %e, "request rejected");
        }
    }
    Ok(())
}

async fn ask_once(
    engine: &crate::Engine,
    conversation_id: &str,
    question: &str,
) -> Result<(), crate::error::EngineError> {
    let request = crate::protocol::ChatRequest {
        message: question.to_string(),
        conversation: crate::protocol::ConversationRef {
            id: conversation_id.to_string(),
            user_id: "cli".to_string(),
            company_id: "cli".to_string(),
        },
        scopes: Default::default(),
    };

    let mut stream = engine.chat(request)?;
    while let Some(event) = stream.events.recv().await {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!(error = %e, "event serialization failed"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse() {
        let args = CliArgs::parse_from(["fieldquery"]);
        assert_eq!(args.db_port, 3306);
        assert_eq!(args.sql_correction_max_attempts, 3);
        assert!(args.sql_pre_validation_enabled);
        assert_eq!(args.llm_provider, LlmProvider::Ollama);
    }

    #[test]
    fn test_secure_base_tables_delimiter() {
        let args = CliArgs::parse_from([
            "fieldquery",
            "--secure-base-tables",
            "employee,customer,serviceLocation",
        ]);
        let settings = args.to_settings();
        assert_eq!(
            settings.database.secure_base_tables,
            vec!["employee", "customer", "serviceLocation"]
        );
    }

    #[test]
    fn test_settings_assembly() {
        let args = CliArgs::parse_from([
            "fieldquery",
            "--db-user",
            "app",
            "--db-name",
            "fieldops",
            "--max-query-rows",
            "50",
        ]);
        let settings = args.to_settings();
        assert_eq!(settings.database.user, "app");
        assert_eq!(settings.sql.max_query_rows, 50);
        assert!(settings.validate().is_ok());
    }
}
