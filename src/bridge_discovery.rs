//! Bridge-table discovery.
//!
//! Decides whether a junction table must be added so the selected set is
//! connectable. Three-layer defense against spurious many-to-many hops:
//! role filter first (satellite/assignment/configuration are never
//! bridges), then the per-table blocklist, and finally a direct-path
//! check so a bridge is only introduced when a pair is otherwise
//! unreachable within the hop cap.

use std::collections::HashSet;

use crate::join_graph::{JoinGraph, TableRole};
use crate::path_finder::PathFinder;

/// Why a candidate was (not) introduced. One entry per considered pair
/// or candidate, for the log.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeDecision {
    Added {
        bridge: String,
        connects: (String, String),
    },
    SkippedDirectPath {
        a: String,
        b: String,
    },
    ExcludedByRole {
        candidate: String,
        role: TableRole,
    },
    ExcludedByBlocklist {
        candidate: String,
        conflicting: String,
    },
    Unresolvable {
        a: String,
        b: String,
    },
}

/// Augment the selected set with at most one bridge per disconnected
/// pair. Returns the augmented set plus the decision log.
pub fn discover_bridges(
    graph: &JoinGraph,
    finder: &mut PathFinder,
    selected: &[String],
    max_hops: usize,
    confidence_threshold: f64,
) -> (Vec<String>, Vec<BridgeDecision>) {
    let mut augmented: Vec<String> = selected.to_vec();
    let mut decisions = Vec::new();

    for i in 0..selected.len() {
        for j in (i + 1)..selected.len() {
            let (a, b) = (&selected[i], &selected[j]);

            if finder.shortest_path(a, b, max_hops).is_some() {
                decisions.push(BridgeDecision::SkippedDirectPath {
                    a: a.clone(),
                    b: b.clone(),
                });
                continue;
            }

            match pick_bridge(graph, selected, a, b, confidence_threshold, &mut decisions) {
                Some(bridge) => {
                    tracing::info!(bridge = %bridge, a = %a, b = %b, "bridge table added");
                    if !augmented.contains(&bridge) {
                        augmented.push(bridge.clone());
                    }
                    decisions.push(BridgeDecision::Added {
                        bridge,
                        connects: (a.clone(), b.clone()),
                    });
                }
                None => {
                    tracing::warn!(a = %a, b = %b, "no eligible bridge connects pair");
                    decisions.push(BridgeDecision::Unresolvable {
                        a: a.clone(),
                        b: b.clone(),
                    });
                }
            }
        }
    }

    (augmented, decisions)
}

/// Candidates adjacent to both endpoints, filtered by role and
/// blocklist; best candidate by (min edge confidence, then name).
fn pick_bridge(
    graph: &JoinGraph,
    selected: &[String],
    a: &str,
    b: &str,
    confidence_threshold: f64,
    decisions: &mut Vec<BridgeDecision>,
) -> Option<String> {
    let neighbors = |table: &str| -> Vec<(String, f64)> {
        graph
            .relationships_of(table)
            .into_iter()
            .filter(|rel| rel.confidence >= confidence_threshold)
            .filter_map(|rel| {
                rel.other_end(table)
                    .map(|other| (other.to_string(), rel.confidence))
            })
            .collect()
    };

    let a_neighbors = neighbors(a);
    let b_neighbors = neighbors(b);
    let b_set: HashSet<&str> = b_neighbors.iter().map(|(t, _)| t.as_str()).collect();

    let mut candidates: Vec<(String, f64)> = Vec::new();
    let mut considered: HashSet<String> = HashSet::new();
    for (candidate, conf_a) in &a_neighbors {
        if !b_set.contains(candidate.as_str())
            || selected.contains(candidate)
            || !considered.insert(candidate.clone())
        {
            continue;
        }

        // Layer 1: role filter.
        let role = graph.role_of(candidate);
        if !role.bridge_eligible() {
            decisions.push(BridgeDecision::ExcludedByRole {
                candidate: candidate.clone(),
                role,
            });
            continue;
        }

        // Layer 2: blocklist.
        if let Some(metadata) = graph.metadata_of(candidate) {
            if let Some(conflicting) = metadata
                .exclude_as_bridge_for
                .iter()
                .find(|t| selected.contains(t))
            {
                decisions.push(BridgeDecision::ExcludedByBlocklist {
                    candidate: candidate.clone(),
                    conflicting: conflicting.clone(),
                });
                continue;
            }
        }

        let conf_b = b_neighbors
            .iter()
            .filter(|(t, _)| t == candidate)
            .map(|(_, c)| *c)
            .fold(f64::MIN, f64::max);
        candidates.push((candidate.clone(), conf_a.min(conf_b)));
    }

    candidates
        .into_iter()
        .max_by(|(name_a, conf_a), (name_b, conf_b)| {
            conf_a
                .total_cmp(conf_b)
                .then_with(|| name_b.cmp(name_a))
        })
        .map(|(name, _)| name)
}
