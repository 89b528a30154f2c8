//! Table selection: a bounded model call plus deterministic repair.
//!
//! The model sees capped table headers, the domain-required set, and the
//! question, and must return 3 to 8 tables. The repair rules are pure
//! and tested directly: required tables are always included, unknown
//! names are dropped, short selections are widened with the
//! highest-confidence neighbors, and an unusable selection falls back to
//! the domain-required tables or fails the step.

use crate::actors::llm_gateway::{CompletionRequest, LlmHandle};
use crate::error::EngineError;
use crate::join_graph::JoinGraph;
use crate::prompts;
use crate::protocol::Message;
use crate::settings::SqlPipelineSettings;

pub const MIN_TABLES: usize = 3;
pub const MAX_TABLES: usize = 8;

/// Parse the model reply into known table names, preserving order.
pub fn parse_table_list(reply: &str, graph: &JoinGraph) -> Vec<String> {
    let names: Vec<String> = serde_json::from_str::<Vec<String>>(reply.trim())
        .ok()
        .or_else(|| {
            // Tolerate a JSON array embedded in prose.
            let start = reply.find('[')?;
            let end = reply[start..].find(']')? + start;
            serde_json::from_str(&reply[start..=end]).ok()
        })
        .unwrap_or_else(|| {
            reply
                .split(|c: char| c == ',' || c == '\n')
                .map(|s| s.trim().trim_matches('"').trim_matches('`').to_string())
                .collect()
        });

    let mut seen = std::collections::HashSet::new();
    names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| graph.get_table(n).is_some())
        .filter(|n| seen.insert(n.clone()))
        .collect()
}

/// Neighbors of the current selection ranked by edge confidence (then
/// name), used to widen short selections.
fn ranked_neighbors(graph: &JoinGraph, selection: &[String]) -> Vec<String> {
    let mut candidates: Vec<(String, f64)> = Vec::new();
    for table in selection {
        for rel in graph.relationships_of(table) {
            let Some(other) = rel.other_end(table) else {
                continue;
            };
            if selection.iter().any(|t| t == other) {
                continue;
            }
            match candidates.iter_mut().find(|(name, _)| name == other) {
                Some((_, conf)) => *conf = conf.max(rel.confidence),
                None => candidates.push((other.to_string(), rel.confidence)),
            }
        }
    }
    candidates.sort_by(|(name_a, conf_a), (name_b, conf_b)| {
        conf_b.total_cmp(conf_a).then_with(|| name_a.cmp(name_b))
    });
    candidates.into_iter().map(|(name, _)| name).collect()
}

/// Apply the selection rules to the model's (possibly empty) choice.
pub fn finalize_selection(
    chosen: Vec<String>,
    required: &[String],
    graph: &JoinGraph,
    settings: &SqlPipelineSettings,
) -> Result<Vec<String>, EngineError> {
    // A model that picked nothing falls back to the first N
    // domain-required tables, or fails the step outright.
    if chosen.is_empty() {
        let mut fallback: Vec<String> = Vec::new();
        for table in required {
            if graph.get_table(table).is_some() && !fallback.contains(table) {
                fallback.push(table.clone());
            }
        }
        fallback.truncate(settings.max_fallback_tables);
        if fallback.is_empty() {
            return Err(EngineError::Validation(vec![
                "table selection produced no usable tables".to_string(),
            ]));
        }
        tracing::debug!(?fallback, "empty selection, using domain-required fallback");
        return widen_and_cap(fallback, graph);
    }

    // Required tables first, then the model's picks.
    let mut selection: Vec<String> = Vec::new();
    for table in required.iter().chain(chosen.iter()) {
        if graph.get_table(table).is_some() && !selection.contains(table) {
            selection.push(table.clone());
        }
    }
    if selection.is_empty() {
        return Err(EngineError::Validation(vec![
            "table selection produced no usable tables".to_string(),
        ]));
    }
    widen_and_cap(selection, graph)
}

/// Enforce the 3..8 bound: cap long selections, widen short ones with
/// the highest-confidence neighbors.
fn widen_and_cap(
    mut selection: Vec<String>,
    graph: &JoinGraph,
) -> Result<Vec<String>, EngineError> {
    if selection.len() > MAX_TABLES {
        tracing::debug!(
            dropped = selection.len() - MAX_TABLES,
            "selection capped at {} tables",
            MAX_TABLES
        );
        selection.truncate(MAX_TABLES);
    }

    if selection.len() < MIN_TABLES {
        for neighbor in ranked_neighbors(graph, &selection) {
            if selection.len() >= MIN_TABLES {
                break;
            }
            selection.push(neighbor);
        }
    }

    if selection.len() < MIN_TABLES {
        return Err(EngineError::Validation(vec![format!(
            "table selection could not be widened to {} tables",
            MIN_TABLES
        )]));
    }

    Ok(selection)
}

/// Run the selection model call and repair its output.
pub async fn select_tables(
    llm: &LlmHandle,
    graph: &JoinGraph,
    settings: &SqlPipelineSettings,
    question: &str,
    required: &[String],
    history: &[Message],
) -> Result<Vec<String>, EngineError> {
    let messages = prompts::build_table_selection_prompt(
        graph,
        settings.max_tables_in_selection_prompt,
        required,
        history,
        question,
    );
    let reply = llm
        .complete(CompletionRequest::new(messages))
        .await
        .map_err(EngineError::from)?;

    let chosen = parse_table_list(&reply, graph);
    tracing::debug!(?chosen, ?required, "table selection reply parsed");
    finalize_selection(chosen, required, graph, settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join_graph::test_graphs::demo_graph;
    use crate::settings::test_settings;

    fn sql_settings() -> SqlPipelineSettings {
        test_settings().sql
    }

    #[test]
    fn test_parse_json_array_reply() {
        let graph = demo_graph();
        let parsed = parse_table_list(r#"["employee", "workTime", "ghost"]"#, &graph);
        assert_eq!(parsed, vec!["employee", "workTime"]);
    }

    #[test]
    fn test_parse_array_embedded_in_prose() {
        let graph = demo_graph();
        let parsed = parse_table_list(
            "The relevant tables are: [\"asset\", \"inspection\"] as requested.",
            &graph,
        );
        assert_eq!(parsed, vec!["asset", "inspection"]);
    }

    #[test]
    fn test_parse_comma_list_reply() {
        let graph = demo_graph();
        let parsed = parse_table_list("employee, workTime, workTimeType", &graph);
        assert_eq!(parsed, vec!["employee", "workTime", "workTimeType"]);
    }

    #[test]
    fn test_required_tables_always_included() {
        let graph = demo_graph();
        let selection = finalize_selection(
            vec!["workTime".to_string(), "workTimeType".to_string()],
            &["employee".to_string()],
            &graph,
            &sql_settings(),
        )
        .unwrap();
        assert_eq!(selection[0], "employee");
        assert!(selection.contains(&"workTime".to_string()));
    }

    #[test]
    fn test_short_selection_widens_with_neighbors() {
        let graph = demo_graph();
        let selection = finalize_selection(
            vec!["employee".to_string()],
            &[],
            &graph,
            &sql_settings(),
        )
        .unwrap();
        assert!(selection.len() >= MIN_TABLES);
        assert_eq!(selection[0], "employee");
        // Widening only pulls direct neighbors of the selection.
        for table in &selection[1..] {
            assert!(graph
                .relationships_of("employee")
                .iter()
                .any(|r| r.touches(table)));
        }
    }

    #[test]
    fn test_empty_choice_falls_back_to_required() {
        let graph = demo_graph();
        let selection = finalize_selection(
            Vec::new(),
            &["asset".to_string(), "inspection".to_string()],
            &graph,
            &sql_settings(),
        )
        .unwrap();
        assert_eq!(selection[0], "asset");
        assert!(selection.len() >= MIN_TABLES);
    }

    #[test]
    fn test_empty_choice_fallback_is_capped() {
        let graph = demo_graph();
        let required: Vec<String> = [
            "employee",
            "workTime",
            "workTimeType",
            "crew",
            "asset",
            "inspection",
            "inspectionQuestionAnswer",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let selection =
            finalize_selection(Vec::new(), &required, &graph, &sql_settings()).unwrap();
        // An empty model pick takes only the first N required tables.
        assert_eq!(selection.len(), sql_settings().max_fallback_tables);
        assert_eq!(selection, required[..sql_settings().max_fallback_tables]);
    }

    #[test]
    fn test_no_tables_at_all_fails_the_step() {
        let graph = demo_graph();
        let err = finalize_selection(Vec::new(), &[], &graph, &sql_settings()).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_selection_capped_at_eight() {
        let graph = demo_graph();
        let everything: Vec<String> = graph.table_names().map(String::from).collect();
        let selection =
            finalize_selection(everything, &[], &graph, &sql_settings()).unwrap();
        assert_eq!(selection.len(), MAX_TABLES);
    }
}
