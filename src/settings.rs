//! Typed engine settings, assembled from CLI/environment options.
//!
//! All tunables recognized by the engine live here with their defaults.
//! Settings are validated once at startup; invalid configuration is a
//! fatal `ConfigError`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// ============ LLM Provider ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    Ollama,
}

impl FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "ollama" => Ok(LlmProvider::Ollama),
            other => Err(format!("unknown LLM provider: {}", other)),
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmProvider::OpenAi => write!(f, "openai"),
            LlmProvider::Ollama => write!(f, "ollama"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: LlmProvider,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub openai_temperature: f32,
    pub ollama_base_url: String,
    pub ollama_model: String,
    pub ollama_embedding_model: String,
    pub request_timeout_secs: u64,
    pub max_output_tokens: u32,
}

// ============ Database ============

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Session encryption key, set as `@aesKey` on every connection.
    pub encrypt_key: Option<String>,
    /// Logical tables whose `secure_*` view is discovered at startup.
    pub secure_base_tables: Vec<String>,
    pub pool_max: usize,
    pub acquire_timeout_secs: u64,
    pub query_timeout_secs: u64,
}

// ============ SQL Pipeline ============

#[derive(Debug, Clone)]
pub struct SqlPipelineSettings {
    pub max_tables_in_selection_prompt: usize,
    pub max_fallback_tables: usize,
    pub confidence_threshold: f64,
    pub correction_max_attempts: u32,
    pub pre_validation_enabled: bool,
    pub sample_rows: usize,
    pub max_relationships_in_prompt: usize,
    pub max_columns_in_schema: usize,
    pub max_columns_in_validation: usize,
    pub max_columns_in_correction: usize,
    pub max_suggested_paths: usize,
    pub max_query_rows: usize,
    pub max_join_hops: usize,
}

// ============ Domain ============

#[derive(Debug, Clone)]
pub struct DomainSettings {
    pub registry_path: PathBuf,
    pub extraction_enabled: bool,
}

// ============ Conversation ============

#[derive(Debug, Clone)]
pub struct ConversationSettings {
    pub db_path: PathBuf,
    pub max_age_hours: i64,
    pub cleanup_interval_hours: u64,
    pub max_messages: usize,
    pub db_retry_attempts: u32,
    pub db_retry_delay_ms: u64,
}

// ============ Engine ============

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub database: DatabaseSettings,
    pub llm: LlmSettings,
    pub sql: SqlPipelineSettings,
    pub domain: DomainSettings,
    pub conversation: ConversationSettings,
    pub join_graph_path: PathBuf,
    pub display_attributes_path: PathBuf,
    pub pipeline_timeout_secs: u64,
    pub max_context_tokens: usize,
}

impl EngineSettings {
    /// Fail-fast validation of the assembled settings.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.llm.provider == LlmProvider::OpenAi && self.llm.openai_api_key.is_none() {
            return Err(EngineError::Config(
                "OPENAI_API_KEY is required when LLM_PROVIDER=openai".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.sql.confidence_threshold) {
            return Err(EngineError::Config(format!(
                "SQL_CONFIDENCE_THRESHOLD must be in [0,1], got {}",
                self.sql.confidence_threshold
            )));
        }
        if self.sql.correction_max_attempts == 0 {
            return Err(EngineError::Config(
                "SQL_CORRECTION_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.sql.max_query_rows == 0 {
            return Err(EngineError::Config(
                "MAX_QUERY_ROWS must be at least 1".to_string(),
            ));
        }
        if self.database.user.is_empty() || self.database.database.is_empty() {
            return Err(EngineError::Config(
                "DB_USER and DB_NAME must be set".to_string(),
            ));
        }
        if self.conversation.max_messages == 0 {
            return Err(EngineError::Config(
                "MAX_CONVERSATION_MESSAGES must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
pub fn test_settings() -> EngineSettings {
    EngineSettings {
        database: DatabaseSettings {
            host: "localhost".to_string(),
            port: 3306,
            user: "test".to_string(),
            password: String::new(),
            database: "test".to_string(),
            encrypt_key: None,
            secure_base_tables: Vec::new(),
            pool_max: 4,
            acquire_timeout_secs: 5,
            query_timeout_secs: 30,
        },
        llm: LlmSettings {
            provider: LlmProvider::Ollama,
            openai_api_key: None,
            openai_base_url: "https://api.openai.com".to_string(),
            openai_model: "gpt-4o-mini".to_string(),
            openai_temperature: 0.0,
            ollama_base_url: "http://localhost:11434".to_string(),
            ollama_model: "llama3.1".to_string(),
            ollama_embedding_model: "nomic-embed-text".to_string(),
            request_timeout_secs: 60,
            max_output_tokens: 2000,
        },
        sql: SqlPipelineSettings {
            max_tables_in_selection_prompt: 40,
            max_fallback_tables: 5,
            confidence_threshold: 0.70,
            correction_max_attempts: 3,
            pre_validation_enabled: true,
            sample_rows: 0,
            max_relationships_in_prompt: 30,
            max_columns_in_schema: 25,
            max_columns_in_validation: 40,
            max_columns_in_correction: 20,
            max_suggested_paths: 3,
            max_query_rows: 100,
            max_join_hops: 4,
        },
        domain: DomainSettings {
            registry_path: PathBuf::from("domain_registry.json"),
            extraction_enabled: true,
        },
        conversation: ConversationSettings {
            db_path: PathBuf::from("conversations.db"),
            max_age_hours: 24,
            cleanup_interval_hours: 1,
            max_messages: 20,
            db_retry_attempts: 3,
            db_retry_delay_ms: 100,
        },
        join_graph_path: PathBuf::from("join_graph_merged.json"),
        display_attributes_path: PathBuf::from("display_attributes_registry.json"),
        pipeline_timeout_secs: 120,
        max_context_tokens: 8000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_from_str() {
        assert_eq!("openai".parse::<LlmProvider>().unwrap(), LlmProvider::OpenAi);
        assert_eq!("Ollama".parse::<LlmProvider>().unwrap(), LlmProvider::Ollama);
        assert!("gemini".parse::<LlmProvider>().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut settings = test_settings();
        settings.sql.confidence_threshold = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_requires_openai_key() {
        let mut settings = test_settings();
        settings.llm.provider = LlmProvider::OpenAi;
        settings.llm.openai_api_key = None;
        assert!(settings.validate().is_err());
        settings.llm.openai_api_key = Some("sk-test".to_string());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(test_settings().validate().is_ok());
    }
}
