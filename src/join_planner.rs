//! Join planning over the augmented selected set.
//!
//! The planner never invents relationships: `allowed_relationships` is
//! exactly the union of pairwise shortest paths between the selected
//! tables, and the textual join plan handed to the generator is a
//! rendering of those edges.

use crate::error::EngineError;
use crate::join_graph::{Relationship, RelationshipType};
use crate::path_finder::PathFinder;

#[derive(Debug, Clone)]
pub struct JoinPlan {
    /// Graph edges permissible to appear as joins.
    pub allowed: Vec<Relationship>,
    /// Human-readable summary, used only for model prompting.
    pub summary: String,
}

fn type_label(rel_type: RelationshipType) -> &'static str {
    match rel_type {
        RelationshipType::ForeignKey => "foreign_key",
        RelationshipType::Business => "business",
        RelationshipType::Manual => "manual",
        RelationshipType::Heuristic => "heuristic",
    }
}

pub fn plan_joins(
    finder: &mut PathFinder,
    selected: &[String],
    max_hops: usize,
    max_suggested_paths: usize,
) -> Result<JoinPlan, EngineError> {
    if let Some((from, to)) = finder.unreachable_pairs(selected, max_hops).into_iter().next() {
        return Err(EngineError::PathNotFound { from, to, max_hops });
    }

    let allowed = finder.expand(selected, max_hops);

    let mut lines = Vec::new();
    if allowed.is_empty() {
        lines.push("Single table query, no joins required.".to_string());
    } else {
        lines.push("Allowed joins:".to_string());
        for rel in &allowed {
            lines.push(format!(
                "- {}.{} = {}.{}  ({}, confidence {:.2})",
                rel.from_table,
                rel.from_column,
                rel.to_table,
                rel.to_column,
                type_label(rel.rel_type),
                rel.confidence
            ));
        }
    }

    // A few concrete pairwise chains help the model order its joins.
    let mut suggested = 0usize;
    for i in 0..selected.len() {
        for j in (i + 1)..selected.len() {
            if suggested >= max_suggested_paths {
                break;
            }
            let Some(path) = finder.shortest_path(&selected[i], &selected[j], max_hops) else {
                continue;
            };
            if path.len() < 2 {
                continue;
            }
            let mut chain = vec![selected[i].clone()];
            let mut current = selected[i].clone();
            for rel in &path {
                let next = rel
                    .other_end(&current)
                    .unwrap_or(rel.to_table.as_str())
                    .to_string();
                chain.push(next.clone());
                current = next;
            }
            if suggested == 0 {
                lines.push("Suggested join paths:".to_string());
            }
            lines.push(format!("- {}", chain.join(" -> ")));
            suggested += 1;
        }
    }

    Ok(JoinPlan {
        allowed,
        summary: lines.join("\n"),
    })
}
