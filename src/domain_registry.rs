//! Domain ontology: business vocabulary mapped to schema locations.
//!
//! The registry is a JSON artifact mapping terms ("crane", "action
//! item") to resolution sets. Term extraction itself is a constrained
//! language-model call owned by the SQL pipeline; this module provides
//! the pure halves: validating the registry against the join graph,
//! normalizing the model's reply back to known terms, and rendering
//! resolutions into `(tables, filters, confidence)`.

use std::collections::HashMap;
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::join_graph::JoinGraph;

lazy_static! {
    static ref JSON_ARRAY: Regex = Regex::new(r"(?s)\[.*?\]").unwrap();
}

// ============ Registry Records ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    TextSearch,
    Boolean,
    Exact,
    Structural,
    Semantic,
}

/// One way to resolve a term. Accepts both singular and plural spellings
/// for tables/columns to keep artifacts forgiving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionSpec {
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    pub match_type: MatchType,
    #[serde(default)]
    pub value: Option<Value>,
    pub confidence: f64,
}

impl ResolutionSpec {
    pub fn all_tables(&self) -> Vec<&str> {
        self.table
            .iter()
            .map(|s| s.as_str())
            .chain(self.tables.iter().map(|s| s.as_str()))
            .collect()
    }

    pub fn all_columns(&self) -> Vec<&str> {
        self.column
            .iter()
            .map(|s| s.as_str())
            .chain(self.columns.iter().map(|s| s.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermEntry {
    pub primary: ResolutionSpec,
    #[serde(default)]
    pub secondary: Option<ResolutionSpec>,
    #[serde(default)]
    pub fallback: Option<ResolutionSpec>,
}

impl TermEntry {
    fn candidates(&self) -> impl Iterator<Item = &ResolutionSpec> {
        std::iter::once(&self.primary)
            .chain(self.secondary.iter())
            .chain(self.fallback.iter())
    }
}

/// A resolved term, ready for the table selector and SQL generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainResolution {
    pub term: String,
    pub tables: Vec<String>,
    /// Conjunctive WHERE fragments, qualified by table name.
    pub filters: Vec<String>,
    pub confidence: f64,
}

// ============ Registry ============

#[derive(Debug, Clone, Default)]
pub struct DomainRegistry {
    terms: HashMap<String, TermEntry>,
}

impl DomainRegistry {
    pub fn from_json(json: &str, graph: &JoinGraph) -> Result<Self, EngineError> {
        let raw: HashMap<String, TermEntry> = serde_json::from_str(json)
            .map_err(|e| EngineError::Config(format!("domain registry artifact: {}", e)))?;

        let mut terms = HashMap::new();
        for (term, entry) in raw {
            for spec in entry.candidates() {
                for table in spec.all_tables() {
                    let columns = graph.columns_of(table).ok_or_else(|| {
                        EngineError::Config(format!(
                            "domain registry `{}` references unknown table `{}`",
                            term, table
                        ))
                    })?;
                    for column in spec.all_columns() {
                        if !columns.iter().any(|c| c == column) {
                            return Err(EngineError::Config(format!(
                                "domain registry `{}` references unknown column `{}.{}`",
                                term, table, column
                            )));
                        }
                    }
                }
                if spec.match_type == MatchType::Structural && spec.value.is_some() {
                    return Err(EngineError::Config(format!(
                        "domain registry `{}`: structural match must not carry a value",
                        term
                    )));
                }
                if spec.match_type == MatchType::Boolean && spec.value.is_none() {
                    return Err(EngineError::Config(format!(
                        "domain registry `{}`: boolean match requires a value",
                        term
                    )));
                }
                if !(0.0..=1.0).contains(&spec.confidence) {
                    return Err(EngineError::Config(format!(
                        "domain registry `{}`: confidence out of range",
                        term
                    )));
                }
            }
            terms.insert(term.to_lowercase(), entry);
        }
        Ok(Self { terms })
    }

    pub async fn load(path: &Path, graph: &JoinGraph) -> Result<Self, EngineError> {
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            EngineError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let registry = Self::from_json(&json, graph)?;
        tracing::info!(terms = registry.terms.len(), "domain registry loaded");
        Ok(registry)
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn term_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.terms.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Normalize a free-form mention back to a registry term: lowercase,
    /// trimmed, with a naive plural fold.
    pub fn normalize_term(&self, raw: &str) -> Option<String> {
        let lowered = raw.trim().trim_matches('"').to_lowercase();
        if lowered.is_empty() {
            return None;
        }
        if self.terms.contains_key(&lowered) {
            return Some(lowered);
        }
        let singular = lowered.strip_suffix('s')?;
        if self.terms.contains_key(singular) {
            return Some(singular.to_string());
        }
        None
    }

    /// Parse the extraction model's reply into known terms. Accepts a
    /// JSON array or a comma/newline separated list; unknown mentions
    /// are dropped. An empty result is legal.
    pub fn match_terms_in_reply(&self, reply: &str) -> Vec<String> {
        let mentions: Vec<String> = JSON_ARRAY
            .find(reply)
            .and_then(|m| serde_json::from_str::<Vec<String>>(m.as_str()).ok())
            .unwrap_or_else(|| {
                reply
                    .split(|c| c == ',' || c == '\n')
                    .map(|s| s.to_string())
                    .collect()
            });

        let mut seen = std::collections::HashSet::new();
        let mut terms = Vec::new();
        for mention in mentions {
            if let Some(term) = self.normalize_term(&mention) {
                if seen.insert(term.clone()) {
                    terms.push(term);
                }
            }
        }
        terms
    }

    /// Resolve a term to the highest-confidence candidate whose tables
    /// all exist in the join graph.
    pub fn resolve_term(&self, term: &str, graph: &JoinGraph) -> Option<DomainResolution> {
        let entry = self.terms.get(term)?;
        let best = entry
            .candidates()
            .filter(|spec| {
                let tables = spec.all_tables();
                !tables.is_empty() && tables.iter().all(|t| graph.get_table(t).is_some())
            })
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))?;

        Some(DomainResolution {
            term: term.to_string(),
            tables: best.all_tables().iter().map(|t| t.to_string()).collect(),
            filters: render_filters(term, best),
            confidence: best.confidence,
        })
    }

    pub fn resolve_terms(&self, terms: &[String], graph: &JoinGraph) -> Vec<DomainResolution> {
        terms
            .iter()
            .filter_map(|term| self.resolve_term(term, graph))
            .collect()
    }
}

// ============ Filter Rendering ============

fn escape_like_needle(term: &str) -> String {
    term.replace('\'', "''")
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

fn render_filters(term: &str, spec: &ResolutionSpec) -> Vec<String> {
    match spec.match_type {
        // Structural and semantic matches only force table inclusion.
        MatchType::Structural | MatchType::Semantic => Vec::new(),
        MatchType::TextSearch => {
            let needle = escape_like_needle(&term.to_lowercase());
            let mut clauses = Vec::new();
            for table in spec.all_tables() {
                for column in spec.all_columns() {
                    clauses.push(format!("LOWER({}.{}) LIKE '%{}%'", table, column, needle));
                }
            }
            if clauses.is_empty() {
                Vec::new()
            } else {
                vec![format!("({})", clauses.join(" OR "))]
            }
        }
        MatchType::Boolean | MatchType::Exact => {
            let Some(value) = &spec.value else {
                return Vec::new();
            };
            let rendered = render_value(value);
            spec.all_tables()
                .iter()
                .flat_map(|table| {
                    spec.all_columns()
                        .iter()
                        .map(|column| format!("{}.{} = {}", table, column, rendered))
                        .collect::<Vec<_>>()
                })
                .collect()
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_registries::demo_registry;
    use super::*;
    use crate::join_graph::test_graphs::demo_graph;
    use serde_json::json;

    #[test]
    fn test_text_search_filter() {
        let graph = demo_graph();
        let registry = demo_registry(&graph);
        let resolution = registry.resolve_term("crane", &graph).unwrap();
        assert_eq!(resolution.tables, vec!["asset"]);
        assert_eq!(resolution.filters.len(), 1);
        assert!(resolution.filters[0].contains("LOWER(asset.name) LIKE '%crane%'"));
        assert!(resolution.filters[0].contains(" OR "));
    }

    #[test]
    fn test_boolean_filter() {
        let graph = demo_graph();
        let registry = demo_registry(&graph);
        let resolution = registry.resolve_term("action item", &graph).unwrap();
        assert_eq!(
            resolution.filters,
            vec!["inspectionQuestionAnswer.isActionItem = TRUE".to_string()]
        );
    }

    #[test]
    fn test_structural_emits_no_filter() {
        let graph = demo_graph();
        let registry = demo_registry(&graph);
        let resolution = registry.resolve_term("inspection", &graph).unwrap();
        assert_eq!(resolution.tables, vec!["inspection"]);
        assert!(resolution.filters.is_empty());
    }

    #[test]
    fn test_match_terms_from_json_reply() {
        let graph = demo_graph();
        let registry = demo_registry(&graph);
        let terms = registry.match_terms_in_reply(r#"["crane", "action item", "unknown thing"]"#);
        assert_eq!(terms, vec!["crane", "action item"]);
    }

    #[test]
    fn test_match_terms_folds_plurals_and_case() {
        let graph = demo_graph();
        let registry = demo_registry(&graph);
        let terms = registry.match_terms_in_reply("Cranes, INSPECTIONS");
        assert_eq!(terms, vec!["crane", "inspection"]);
    }

    #[test]
    fn test_empty_extraction_is_legal() {
        let graph = demo_graph();
        let registry = demo_registry(&graph);
        assert!(registry.match_terms_in_reply("[]").is_empty());
        assert!(registry.match_terms_in_reply("nothing recognized").is_empty());
    }

    #[test]
    fn test_rejects_unknown_table() {
        let graph = demo_graph();
        let artifact = json!({
            "ghost": {"primary": {"table": "ghost", "match_type": "structural", "confidence": 0.5}}
        });
        assert!(DomainRegistry::from_json(&artifact.to_string(), &graph).is_err());
    }

    #[test]
    fn test_rejects_boolean_without_value() {
        let graph = demo_graph();
        let artifact = json!({
            "broken": {"primary": {"table": "employee", "column": "active", "match_type": "boolean", "confidence": 0.5}}
        });
        assert!(DomainRegistry::from_json(&artifact.to_string(), &graph).is_err());
    }

    #[test]
    fn test_rejects_structural_with_value() {
        let graph = demo_graph();
        let artifact = json!({
            "broken": {"primary": {"table": "employee", "match_type": "structural", "value": 1, "confidence": 0.5}}
        });
        assert!(DomainRegistry::from_json(&artifact.to_string(), &graph).is_err());
    }

    #[test]
    fn test_higher_confidence_candidate_wins() {
        let graph = demo_graph();
        let artifact = json!({
            "worker": {
                "primary": {"table": "employee", "match_type": "structural", "confidence": 0.6},
                "secondary": {"table": "crew", "match_type": "structural", "confidence": 0.9}
            }
        });
        let registry = DomainRegistry::from_json(&artifact.to_string(), &graph).unwrap();
        let resolution = registry.resolve_term("worker", &graph).unwrap();
        assert_eq!(resolution.tables, vec!["crew"]);
    }
}
