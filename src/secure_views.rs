//! Secure-view map and the deterministic identifier rewriter.
//!
//! Encrypted base tables are exposed through `secure_<base>` views
//! created outside this engine. Generated SQL always references logical
//! table names; before execution every logical name present in the map
//! is rewritten to its view, whole-identifier only and alias-preserving.
//! Identifiers that are neither graph tables nor declared views are
//! hallucinations and are rejected by name.

use std::collections::{HashMap, HashSet};

use crate::error::EngineError;
use crate::join_graph::JoinGraph;
use crate::sql_text;

#[derive(Debug, Clone, Default)]
pub struct SecureViewMap {
    /// logical table -> secure view name
    views: HashMap<String, String>,
    /// secure view name -> logical table
    logical: HashMap<String, String>,
}

impl SecureViewMap {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut views = HashMap::new();
        let mut logical = HashMap::new();
        for (base, view) in pairs {
            logical.insert(view.clone(), base.clone());
            views.insert(base, view);
        }
        Self { views, logical }
    }

    /// Build from the discovered view names, keeping only views whose
    /// suffix matches a configured base table.
    pub fn from_discovered(view_names: &[String], base_tables: &[String]) -> Self {
        let pairs = view_names.iter().filter_map(|view| {
            let base = view.strip_prefix("secure_")?;
            if base_tables.iter().any(|t| t == base) {
                Some((base.to_string(), view.clone()))
            } else {
                None
            }
        });
        Self::from_pairs(pairs)
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn view_for(&self, logical_table: &str) -> Option<&str> {
        self.views.get(logical_table).map(|s| s.as_str())
    }

    pub fn logical_for(&self, view: &str) -> Option<&str> {
        self.logical.get(view).map(|s| s.as_str())
    }

    pub fn is_secure_view(&self, name: &str) -> bool {
        self.logical.contains_key(name)
    }

    /// Rewrite every mapped logical table reference in FROM/JOIN position
    /// to its secure view. Whole-identifier only, deterministic, and
    /// idempotent: already-rewritten names are not map keys and pass
    /// through untouched.
    pub fn rewrite(&self, sql: &str) -> Result<String, EngineError> {
        if self.views.is_empty() {
            return Ok(sql.to_string());
        }

        let spans = sql_text::from_join_spans(sql);

        // Identifiers already present in the statement; a rewrite target
        // clashing with one of these would silently merge two tables.
        let mut existing: HashSet<&str> = HashSet::new();
        for span in &spans {
            existing.insert(span.table.as_str());
            if let Some(alias) = &span.alias {
                existing.insert(alias.as_str());
            }
        }

        let mut out = String::with_capacity(sql.len());
        let mut cursor = 0usize;
        for span in &spans {
            let Some(view) = self.views.get(&span.table) else {
                continue;
            };
            if existing.contains(view.as_str()) {
                return Err(EngineError::Validation(vec![format!(
                    "cannot rewrite `{}` to `{}`: identifier already present in statement",
                    span.table, view
                )]));
            }
            out.push_str(&sql[cursor..span.range.start]);
            out.push_str(view);
            cursor = span.range.end;
        }
        out.push_str(&sql[cursor..]);

        if out != sql {
            tracing::debug!(rewritten = %out, "secure view rewrite applied");
        }
        Ok(out)
    }

    /// Post-rewrite check: every FROM/JOIN identifier must exist as a
    /// table in the join graph or as a declared secure view. Unknown
    /// identifiers carry the hallucinated name.
    pub fn validate_from_join(&self, sql: &str, graph: &JoinGraph) -> Result<(), EngineError> {
        for table_ref in sql_text::from_join_tables(sql) {
            let name = &table_ref.table;
            if graph.get_table(name).is_none() && !self.is_secure_view(name) {
                return Err(EngineError::Hallucination(name.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join_graph::test_graphs::demo_graph;

    fn employee_map() -> SecureViewMap {
        SecureViewMap::from_pairs([("employee".to_string(), "secure_employee".to_string())])
    }

    #[test]
    fn test_rewrite_two_table_query() {
        let map = employee_map();
        let sql = "SELECT e.firstName FROM employee e JOIN workTime w ON w.employeeId = e.id";
        let rewritten = map.rewrite(sql).unwrap();
        assert_eq!(
            rewritten,
            "SELECT e.firstName FROM secure_employee e JOIN workTime w ON w.employeeId = e.id"
        );
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let map = employee_map();
        let sql = "SELECT e.firstName FROM employee e JOIN workTime w ON w.employeeId = e.id";
        let once = map.rewrite(sql).unwrap();
        let twice = map.rewrite(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_rewrite_is_whole_identifier_only() {
        let map = employee_map();
        // employeeCrew must not be touched by the employee mapping.
        let sql = "SELECT c.isLead FROM employeeCrew c JOIN employee e ON c.employeeId = e.id";
        let rewritten = map.rewrite(sql).unwrap();
        assert_eq!(
            rewritten,
            "SELECT c.isLead FROM employeeCrew c JOIN secure_employee e ON c.employeeId = e.id"
        );
    }

    #[test]
    fn test_rewrite_collision_fails_fast() {
        let map = employee_map();
        let sql = "SELECT 1 FROM employee e JOIN secure_employee s ON s.id = e.id";
        assert!(map.rewrite(sql).is_err());
    }

    #[test]
    fn test_unmapped_tables_pass_through() {
        let map = employee_map();
        let sql = "SELECT w.id FROM workTime w";
        assert_eq!(map.rewrite(sql).unwrap(), sql);
    }

    #[test]
    fn test_validate_accepts_tables_and_views() {
        let graph = demo_graph();
        let map = employee_map();
        let sql = "SELECT e.firstName FROM secure_employee e JOIN workTime w ON w.employeeId = e.id";
        assert!(map.validate_from_join(sql, &graph).is_ok());
    }

    #[test]
    fn test_validate_rejects_hallucinated_view() {
        let graph = demo_graph();
        let map = employee_map();
        let sql = "SELECT * FROM secure_inspection";
        let err = map.validate_from_join(sql, &graph).unwrap_err();
        match err {
            EngineError::Hallucination(name) => assert_eq!(name, "secure_inspection"),
            other => panic!("expected hallucination error, got {:?}", other),
        }
    }

    #[test]
    fn test_from_discovered_filters_by_base_list() {
        let discovered = vec![
            "secure_employee".to_string(),
            "secure_customer".to_string(),
            "secure_unrelated".to_string(),
            "reporting_view".to_string(),
        ];
        let bases = vec!["employee".to_string(), "customer".to_string()];
        let map = SecureViewMap::from_discovered(&discovered, &bases);
        assert_eq!(map.len(), 2);
        assert_eq!(map.view_for("employee"), Some("secure_employee"));
        assert!(map.view_for("unrelated").is_none());
    }
}
