//! Pre-execution SQL validation.
//!
//! Deterministic and pure: checks identifier existence, join legality
//! against the allowed relationship set, and statement shape without
//! ever touching the database. Error messages are written for the
//! correction loop: a missing column names the tables that actually
//! carry it.

use std::collections::HashMap;

use crate::join_graph::{JoinGraph, Relationship};
use crate::secure_views::SecureViewMap;
use crate::sql_text;

pub fn validate(
    sql: &str,
    selected_tables: &[String],
    allowed_relationships: &[Relationship],
    graph: &JoinGraph,
    views: &SecureViewMap,
    max_suggestions: usize,
) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if let Err(shape) = sql_text::check_read_only_select(sql) {
        // A malformed statement makes identifier checks meaningless.
        return Err(vec![shape]);
    }

    // qualifier (alias or table-as-written) -> logical table
    let mut qualifiers: HashMap<String, String> = HashMap::new();
    for table_ref in sql_text::from_join_tables(sql) {
        let logical = views
            .logical_for(&table_ref.table)
            .unwrap_or(table_ref.table.as_str())
            .to_string();

        if graph.get_table(&logical).is_none() {
            errors.push(format!("unknown table `{}`", table_ref.table));
            continue;
        }
        if !selected_tables.iter().any(|t| t == &logical) {
            errors.push(format!(
                "table `{}` is not in the selected set [{}]",
                logical,
                selected_tables.join(", ")
            ));
        }
        qualifiers.insert(table_ref.table.clone(), logical.clone());
        if let Some(alias) = table_ref.alias {
            qualifiers.insert(alias, logical);
        }
    }

    for (qualifier, column) in sql_text::qualified_column_refs(sql) {
        let Some(logical) = qualifiers.get(&qualifier) else {
            errors.push(format!("unknown table or alias `{}`", qualifier));
            continue;
        };
        let columns = graph
            .columns_of(logical)
            .expect("qualifier map only holds known tables");
        if !columns.iter().any(|c| c == &column) {
            let mut owners = graph.tables_with_column(&column, logical);
            owners.truncate(max_suggestions.max(1));
            if owners.is_empty() {
                errors.push(format!(
                    "column `{}` not found in table `{}`",
                    column, logical
                ));
            } else {
                errors.push(format!(
                    "column `{}` not found in table `{}`; found in: {}",
                    column,
                    logical,
                    owners.join(", ")
                ));
            }
        }
    }

    for join in sql_text::join_equalities(sql) {
        let (Some(left_table), Some(right_table)) = (
            qualifiers.get(&join.left.0),
            qualifiers.get(&join.right.0),
        ) else {
            // Unknown qualifiers were already reported above.
            continue;
        };
        if left_table == right_table {
            continue;
        }
        let legal = allowed_relationships.iter().any(|rel| {
            rel.matches_join(left_table, &join.left.1, right_table, &join.right.1)
        });
        if !legal {
            errors.push(format!(
                "join `{}.{} = {}.{}` does not correspond to a declared relationship",
                left_table, join.left.1, right_table, join.right.1
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join_graph::test_graphs::demo_graph;
    use crate::path_finder::PathFinder;

    fn allowed_for(graph: &JoinGraph, tables: &[&str]) -> Vec<Relationship> {
        let selected: Vec<String> = tables.iter().map(|s| s.to_string()).collect();
        PathFinder::new(graph, 0.70).expand(&selected, 4)
    }

    fn selected(tables: &[&str]) -> Vec<String> {
        tables.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_valid_two_table_join() {
        let graph = demo_graph();
        let views = SecureViewMap::default();
        let sql = "SELECT e.firstName, w.startedAt FROM employee e JOIN workTime w ON w.employeeId = e.id LIMIT 100";
        let allowed = allowed_for(&graph, &["employee", "workTime"]);
        assert!(validate(sql, &selected(&["employee", "workTime"]), &allowed, &graph, &views, 5).is_ok());
    }

    #[test]
    fn test_wrong_column_suggests_owner() {
        let graph = demo_graph();
        let views = SecureViewMap::default();
        let sql = "SELECT c.isLead FROM crew c";
        let errors = validate(sql, &selected(&["crew"]), &[], &graph, &views, 5).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("column `isLead` not found in table `crew`"));
        assert!(errors[0].contains("employeeCrew"));
    }

    #[test]
    fn test_undeclared_join_rejected() {
        let graph = demo_graph();
        let views = SecureViewMap::default();
        // employee.id = crew.id is not a declared relationship.
        let sql = "SELECT 1 FROM employee e JOIN crew c ON e.id = c.id";
        let allowed = allowed_for(&graph, &["employee", "crew"]);
        let errors = validate(sql, &selected(&["employee", "crew"]), &allowed, &graph, &views, 5)
            .unwrap_err();
        assert!(errors.iter().any(|e| e.contains("declared relationship")));
    }

    #[test]
    fn test_table_outside_selection_rejected() {
        let graph = demo_graph();
        let views = SecureViewMap::default();
        let sql = "SELECT a.name FROM asset a";
        let errors = validate(sql, &selected(&["employee"]), &[], &graph, &views, 5).unwrap_err();
        assert!(errors[0].contains("not in the selected set"));
    }

    #[test]
    fn test_unknown_alias_reported() {
        let graph = demo_graph();
        let views = SecureViewMap::default();
        let sql = "SELECT x.name FROM employee e";
        let errors = validate(sql, &selected(&["employee"]), &[], &graph, &views, 5).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("unknown table or alias `x`")));
    }

    #[test]
    fn test_secure_view_resolves_to_logical_columns() {
        let graph = demo_graph();
        let views =
            SecureViewMap::from_pairs([("employee".to_string(), "secure_employee".to_string())]);
        let sql = "SELECT e.firstName FROM secure_employee e LIMIT 10";
        assert!(validate(sql, &selected(&["employee"]), &[], &graph, &views, 5).is_ok());
    }

    #[test]
    fn test_non_select_fails_shape_check() {
        let graph = demo_graph();
        let views = SecureViewMap::default();
        let errors =
            validate("UPDATE employee SET active = 0", &selected(&["employee"]), &[], &graph, &views, 5)
                .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("SELECT"));
    }
}
