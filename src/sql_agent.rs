//! The SQL agent: an explicit state machine over a typed pipeline
//! record.
//!
//! Stages run `Generate -> Validate -> Execute -> Finalize`, with repair
//! edges into `Correct` from failed validation or execution. The
//! correction loop is bounded and deliberately narrow: the model sees
//! only the failing SQL, the exact error, the schemas of tables present
//! in that SQL, the relationships among them, and the attempt history.
//! All per-request state lives in `PipelineState`; the agent itself is
//! shared read-only across concurrent requests.

use std::sync::Arc;

use tokio::sync::watch;

use crate::actors::llm_gateway::{CompletionRequest, LlmHandle};
use crate::actors::query_executor::{ExecError, ExecutorHandle};
use crate::bridge_discovery;
use crate::display_attributes::DisplayAttributes;
use crate::domain_registry::{DomainRegistry, DomainResolution};
use crate::error::EngineError;
use crate::join_graph::{JoinGraph, Relationship};
use crate::join_planner;
use crate::path_finder::PathFinder;
use crate::prompts;
use crate::protocol::{EventEmitter, Message, TenantScopes, TokenChannel};
use crate::secure_views::SecureViewMap;
use crate::settings::SqlPipelineSettings;
use crate::sql_text;
use crate::sql_validator;
use crate::table_selector;

/// Rows included verbatim in the final-answer prompt.
const ANSWER_PREVIEW_ROWS: usize = 50;

// ============ Pipeline State ============

#[derive(Debug, Clone)]
pub struct CorrectionAttempt {
    pub sql: String,
    pub error: String,
}

/// The record threaded through the pipeline. Fields are monotonically
/// populated; the correction loop resets `sql` and `validation_errors`
/// per retry but only appends to `correction_history`.
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    pub question: String,
    pub messages: Vec<Message>,
    pub domain_terms: Vec<String>,
    pub domain_resolutions: Vec<DomainResolution>,
    pub selected_tables: Vec<String>,
    pub allowed_relationships: Vec<Relationship>,
    pub join_plan: String,
    pub sql: String,
    pub validation_errors: Vec<String>,
    pub last_error: Option<String>,
    pub correction_attempts: u32,
    pub correction_history: Vec<CorrectionAttempt>,
    pub result_rows: Option<Vec<Vec<serde_json::Value>>>,
    pub column_names: Option<Vec<String>>,
    pub final_answer: Option<String>,
    pub final_structured: Option<Vec<serde_json::Map<String, serde_json::Value>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Generate,
    Validate,
    Execute,
    Correct,
    Finalize,
}

/// What the orchestrator needs from a finished agent run.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub answer: String,
    pub structured: Option<Vec<serde_json::Map<String, serde_json::Value>>>,
}

// ============ SQL Agent ============

pub struct SqlAgent {
    graph: Arc<JoinGraph>,
    registry: Arc<DomainRegistry>,
    display: Arc<DisplayAttributes>,
    views: Arc<SecureViewMap>,
    llm: LlmHandle,
    executor: ExecutorHandle,
    settings: SqlPipelineSettings,
    domain_extraction_enabled: bool,
}

impl SqlAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: Arc<JoinGraph>,
        registry: Arc<DomainRegistry>,
        display: Arc<DisplayAttributes>,
        views: Arc<SecureViewMap>,
        llm: LlmHandle,
        executor: ExecutorHandle,
        settings: SqlPipelineSettings,
        domain_extraction_enabled: bool,
    ) -> Self {
        Self {
            graph,
            registry,
            display,
            views,
            llm,
            executor,
            settings,
            domain_extraction_enabled,
        }
    }

    /// Run the full pipeline for one question. Emits reasoning tokens on
    /// the `sql_agent` channel and the answer on `final`.
    pub async fn run(
        &self,
        question: &str,
        history: &[Message],
        scopes: &TenantScopes,
        emitter: &mut EventEmitter,
        cancel_rx: &watch::Receiver<bool>,
    ) -> Result<AgentOutcome, EngineError> {
        let mut state = PipelineState {
            question: question.to_string(),
            messages: history.to_vec(),
            ..Default::default()
        };

        self.annotate_domain(&mut state).await?;
        self.check_cancelled(cancel_rx, emitter)?;

        let required: Vec<String> = {
            let mut tables = Vec::new();
            for resolution in &state.domain_resolutions {
                for table in &resolution.tables {
                    if !tables.contains(table) {
                        tables.push(table.clone());
                    }
                }
            }
            tables
        };

        state.selected_tables = table_selector::select_tables(
            &self.llm,
            &self.graph,
            &self.settings,
            question,
            &required,
            history,
        )
        .await?;
        self.check_cancelled(cancel_rx, emitter)?;

        let mut finder = PathFinder::new(&self.graph, self.settings.confidence_threshold);
        let (augmented, decisions) = bridge_discovery::discover_bridges(
            &self.graph,
            &mut finder,
            &state.selected_tables,
            self.settings.max_join_hops,
            self.settings.confidence_threshold,
        );
        tracing::debug!(?decisions, "bridge discovery complete");
        state.selected_tables = augmented;

        let plan = join_planner::plan_joins(
            &mut finder,
            &state.selected_tables,
            self.settings.max_join_hops,
            self.settings.max_suggested_paths,
        )?;
        state.allowed_relationships = plan.allowed;
        state.join_plan = plan.summary;

        let samples = self.fetch_samples(&state.selected_tables).await;
        let display_hints = self.display_hints(&state.selected_tables);

        // ========== Generate / Validate / Execute / Correct ==========

        let mut stage = Stage::Generate;
        let mut last_failure: Option<EngineError> = None;
        loop {
            self.check_cancelled(cancel_rx, emitter)?;
            match stage {
                Stage::Generate => {
                    let messages = prompts::build_sql_generation_prompt(
                        &self.graph,
                        &state.selected_tables,
                        self.settings.max_columns_in_schema,
                        &state.join_plan,
                        &state.domain_resolutions,
                        &display_hints,
                        &samples,
                        &state.messages,
                        question,
                        self.settings.max_query_rows,
                    );
                    let reply = self
                        .streamed_completion(
                            CompletionRequest::new(messages),
                            TokenChannel::SqlAgent,
                            emitter,
                            cancel_rx,
                        )
                        .await?;
                    stage = self.accept_draft(&mut state, &reply, &mut last_failure);
                }
                Stage::Validate => {
                    stage = self.validate_stage(&mut state, &mut last_failure);
                }
                Stage::Execute => {
                    match self.executor.execute(state.sql.clone(), scopes.clone()).await {
                        Ok(output) => {
                            state.column_names = Some(output.columns.clone());
                            state.result_rows = Some(output.rows.clone());
                            state.final_structured = Some(output.rows_as_objects());
                            stage = Stage::Finalize;
                        }
                        Err(ExecError::Query(message)) => {
                            tracing::debug!(error = %message, "execution failed, entering correction");
                            state.last_error = Some(message.clone());
                            last_failure = Some(EngineError::Execution(message));
                            stage = Stage::Correct;
                        }
                        Err(other) => return Err(other.into()),
                    }
                }
                Stage::Correct => {
                    if state.correction_attempts >= self.settings.correction_max_attempts {
                        return Err(last_failure.unwrap_or_else(|| {
                            EngineError::Validation(vec![
                                "correction attempts exhausted".to_string()
                            ])
                        }));
                    }
                    state.correction_attempts += 1;
                    stage = self
                        .correct_stage(&mut state, &mut finder, &mut last_failure)
                        .await?;
                }
                Stage::Finalize => break,
            }
        }

        // ========== Finalize ==========

        let answer = self
            .finalize_answer(&state, emitter, cancel_rx)
            .await?;
        state.final_answer = Some(answer.clone());

        tracing::info!(
            tables = ?state.selected_tables,
            corrections = state.correction_attempts,
            rows = state.result_rows.as_ref().map(|r| r.len()).unwrap_or(0),
            "sql pipeline finished"
        );

        Ok(AgentOutcome {
            answer,
            structured: state.final_structured,
        })
    }

    // ========== Stage Helpers ==========

    async fn annotate_domain(&self, state: &mut PipelineState) -> Result<(), EngineError> {
        if !self.domain_extraction_enabled || self.registry.is_empty() {
            return Ok(());
        }
        let messages =
            prompts::build_domain_extraction_prompt(&self.registry.term_names(), &state.question);
        let reply = self.llm.complete(CompletionRequest::new(messages)).await?;
        state.domain_terms = self.registry.match_terms_in_reply(&reply);
        state.domain_resolutions = self
            .registry
            .resolve_terms(&state.domain_terms, &self.graph);
        tracing::debug!(terms = ?state.domain_terms, "domain terms resolved");
        Ok(())
    }

    /// Normalize a model reply into pipeline SQL: strip the fence,
    /// append the row cap, rewrite to secure views. A rewrite failure is
    /// recoverable and routes into correction.
    fn accept_draft(
        &self,
        state: &mut PipelineState,
        reply: &str,
        last_failure: &mut Option<EngineError>,
    ) -> Stage {
        let draft = sql_text::extract_sql(reply);
        let capped = sql_text::enforce_limit(&draft, self.settings.max_query_rows);
        match self.views.rewrite(&capped) {
            Ok(rewritten) => {
                state.sql = rewritten;
                state.validation_errors.clear();
                Stage::Validate
            }
            Err(e) => {
                state.sql = capped;
                state.last_error = Some(e.to_string());
                *last_failure = Some(e);
                Stage::Correct
            }
        }
    }

    fn validate_stage(
        &self,
        state: &mut PipelineState,
        last_failure: &mut Option<EngineError>,
    ) -> Stage {
        // Hallucinated identifiers are caught even when pre-validation
        // is disabled; they carry an explicit "unknown table" message.
        if let Err(e) = self.views.validate_from_join(&state.sql, &self.graph) {
            let message = e.to_string();
            state.validation_errors = vec![message.clone()];
            state.last_error = Some(message);
            *last_failure = Some(e);
            return Stage::Correct;
        }

        if !self.settings.pre_validation_enabled {
            return Stage::Execute;
        }

        match sql_validator::validate(
            &state.sql,
            &state.selected_tables,
            &state.allowed_relationships,
            &self.graph,
            &self.views,
            self.settings.max_columns_in_validation,
        ) {
            Ok(()) => {
                state.validation_errors.clear();
                Stage::Execute
            }
            Err(errors) => {
                tracing::debug!(?errors, "pre-validation rejected SQL");
                state.last_error = Some(errors.join("; "));
                state.validation_errors = errors.clone();
                *last_failure = Some(EngineError::Validation(errors));
                Stage::Correct
            }
        }
    }

    async fn correct_stage(
        &self,
        state: &mut PipelineState,
        finder: &mut PathFinder<'_>,
        last_failure: &mut Option<EngineError>,
    ) -> Result<Stage, EngineError> {
        let error = state
            .last_error
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        state.correction_history.push(CorrectionAttempt {
            sql: state.sql.clone(),
            error: error.clone(),
        });

        // Narrow context: only the tables present in the failing SQL.
        let failing_tables: Vec<String> = sql_text::from_join_tables(&state.sql)
            .into_iter()
            .map(|r| {
                self.views
                    .logical_for(&r.table)
                    .unwrap_or(r.table.as_str())
                    .to_string()
            })
            .filter(|t| self.graph.get_table(t).is_some())
            .collect();
        let slice_tables = if failing_tables.is_empty() {
            state.selected_tables.clone()
        } else {
            failing_tables
        };

        let schema_slice: Vec<String> = slice_tables
            .iter()
            .map(|t| {
                prompts::format_table_schema(&self.graph, t, self.settings.max_columns_in_correction)
            })
            .collect();

        let relationship_summary = {
            let lines: Vec<String> = self
                .graph
                .relationships()
                .iter()
                .filter(|rel| {
                    slice_tables.iter().any(|t| t == &rel.from_table)
                        && slice_tables.iter().any(|t| t == &rel.to_table)
                })
                .take(self.settings.max_relationships_in_prompt)
                .map(|rel| {
                    format!(
                        "- {}.{} = {}.{}",
                        rel.from_table, rel.from_column, rel.to_table, rel.to_column
                    )
                })
                .collect();
            if lines.is_empty() {
                String::new()
            } else {
                format!("Relationships:\n{}", lines.join("\n"))
            }
        };

        let history: Vec<(String, String)> = state
            .correction_history
            .iter()
            .map(|a| (a.sql.clone(), a.error.clone()))
            .collect();

        let messages = prompts::build_correction_prompt(
            &state.question,
            &state.sql,
            &error,
            &schema_slice,
            &relationship_summary,
            &history,
        );
        let reply = self.llm.complete(CompletionRequest::new(messages)).await?;
        let corrected = sql_text::extract_sql(&reply);
        if corrected.trim().is_empty() {
            tracing::warn!("correction produced no SQL, terminating loop");
            return Err(last_failure.clone().unwrap_or_else(|| {
                EngineError::Validation(vec!["correction produced no SQL".to_string()])
            }));
        }

        let capped = sql_text::enforce_limit(&corrected, self.settings.max_query_rows);
        match self.views.rewrite(&capped) {
            Ok(rewritten) => {
                // Identical-to-previous SQL (compared after capping and
                // rewriting) means the model is stuck; terminate.
                if rewritten.trim() == state.sql.trim() {
                    tracing::warn!("correction produced no change, terminating loop");
                    return Err(last_failure.clone().unwrap_or_else(|| {
                        EngineError::Validation(vec![
                            "correction produced no change".to_string()
                        ])
                    }));
                }
                // A correction may introduce a table the validator
                // suggested; widen the selection and replan so it can
                // pass validation.
                self.absorb_new_tables(state, finder, &rewritten);
                state.sql = rewritten;
                state.validation_errors.clear();
                Ok(Stage::Validate)
            }
            Err(e) => {
                state.sql = capped;
                state.last_error = Some(e.to_string());
                *last_failure = Some(e);
                Ok(Stage::Correct)
            }
        }
    }

    /// Add graph tables referenced by the corrected SQL to the selected
    /// set and refresh the allowed relationship pool.
    fn absorb_new_tables(
        &self,
        state: &mut PipelineState,
        finder: &mut PathFinder<'_>,
        sql: &str,
    ) {
        let mut grew = false;
        for table_ref in sql_text::from_join_tables(sql) {
            let logical = self
                .views
                .logical_for(&table_ref.table)
                .unwrap_or(table_ref.table.as_str())
                .to_string();
            if self.graph.get_table(&logical).is_some()
                && !state.selected_tables.contains(&logical)
            {
                tracing::debug!(table = %logical, "correction introduced table");
                state.selected_tables.push(logical);
                grew = true;
            }
        }
        if grew {
            state.allowed_relationships =
                finder.expand(&state.selected_tables, self.settings.max_join_hops);
        }
    }

    async fn finalize_answer(
        &self,
        state: &PipelineState,
        emitter: &mut EventEmitter,
        cancel_rx: &watch::Receiver<bool>,
    ) -> Result<String, EngineError> {
        let columns = state.column_names.clone().unwrap_or_default();
        let rows = state.result_rows.clone().unwrap_or_default();

        if rows.is_empty() {
            let answer = "No matching records were found for that question.".to_string();
            emitter.token(TokenChannel::Final, answer.clone());
            return Ok(answer);
        }

        let preview: Vec<String> = state
            .final_structured
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .take(ANSWER_PREVIEW_ROWS)
            .filter_map(|row| serde_json::to_string(row).ok())
            .collect();

        let messages = prompts::build_final_answer_prompt(
            &state.question,
            &columns,
            &preview.join("\n"),
            rows.len(),
        );
        self.streamed_completion(
            CompletionRequest::new(messages),
            TokenChannel::Final,
            emitter,
            cancel_rx,
        )
        .await
    }

    /// Stream one completion, forwarding tokens to the emitter as they
    /// arrive.
    async fn streamed_completion(
        &self,
        request: CompletionRequest,
        channel: TokenChannel,
        emitter: &mut EventEmitter,
        cancel_rx: &watch::Receiver<bool>,
    ) -> Result<String, EngineError> {
        crate::actors::llm_gateway::stream_to_emitter(&self.llm, request, channel, emitter, cancel_rx)
            .await
            .map_err(EngineError::from)
    }

    async fn fetch_samples(&self, tables: &[String]) -> Vec<String> {
        if self.settings.sample_rows == 0 {
            return Vec::new();
        }
        let mut samples = Vec::new();
        for table in tables {
            match self
                .executor
                .sample_rows(table.clone(), self.settings.sample_rows)
                .await
            {
                Ok(output) if !output.rows.is_empty() => {
                    let rendered: Vec<String> = output
                        .rows_as_objects()
                        .iter()
                        .filter_map(|row| serde_json::to_string(row).ok())
                        .collect();
                    samples.push(format!("{}:\n{}", table, rendered.join("\n")));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(table = %table, error = %e, "sample fetch skipped");
                }
            }
        }
        samples
    }

    fn display_hints(&self, tables: &[String]) -> Vec<String> {
        tables
            .iter()
            .filter_map(|table| {
                self.display
                    .display_columns(table)
                    .map(|columns| format!("- {}: {}", table, columns.join(", ")))
            })
            .collect()
    }

    fn check_cancelled(
        &self,
        cancel_rx: &watch::Receiver<bool>,
        emitter: &EventEmitter,
    ) -> Result<(), EngineError> {
        if *cancel_rx.borrow() || emitter.client_gone() {
            Err(EngineError::Upstream("request cancelled".to_string()))
        } else {
            Ok(())
        }
    }
}
