//! Shortest-join-path search over the relationship graph.
//!
//! Dijkstra over an undirected projection of the join graph. Edge weight
//! is `1 / max(confidence, eps) + hop_penalty`; edges below the
//! confidence threshold are excluded entirely. The frontier is pruned at
//! the hop cap, and exceeding it yields *no path* rather than an error.
//!
//! Tie-breaks, in order: fewer hops, then highest minimum edge
//! confidence, then lexicographic table-name sequence. Results are
//! cached by `(src, dst, max_hops)` for the lifetime of the finder,
//! which is one request.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::join_graph::{JoinGraph, Relationship};

const CONFIDENCE_EPS: f64 = 1e-6;
const HOP_PENALTY: f64 = 0.1;

pub struct PathFinder<'g> {
    graph: &'g JoinGraph,
    confidence_threshold: f64,
    cache: HashMap<(String, String, usize), Option<Vec<Relationship>>>,
}

/// A frontier entry. Ordering encodes the full tie-break chain so the
/// first pop of the destination is the canonical best path.
struct Candidate {
    cost: f64,
    hops: usize,
    min_conf: f64,
    /// Table-name sequence from the source, for the final tie-break.
    seq: Vec<String>,
    edges: Vec<usize>,
    table: String,
}

impl Candidate {
    fn cmp_key(&self, other: &Self) -> Ordering {
        self.cost
            .total_cmp(&other.cost)
            .then(self.hops.cmp(&other.hops))
            .then(other.min_conf.total_cmp(&self.min_conf))
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_key(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // Reversed so the std max-heap pops the smallest key first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_key(other).reverse()
    }
}

impl<'g> PathFinder<'g> {
    pub fn new(graph: &'g JoinGraph, confidence_threshold: f64) -> Self {
        Self {
            graph,
            confidence_threshold,
            cache: HashMap::new(),
        }
    }

    /// Shortest join path between two tables, or `None` when they cannot
    /// be connected within `max_hops`.
    pub fn shortest_path(
        &mut self,
        src: &str,
        dst: &str,
        max_hops: usize,
    ) -> Option<Vec<Relationship>> {
        if self.graph.get_table(src).is_none() || self.graph.get_table(dst).is_none() {
            return None;
        }
        if src == dst {
            return Some(Vec::new());
        }
        if max_hops == 0 {
            return None;
        }

        let key = (src.to_string(), dst.to_string(), max_hops);
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }

        let result = self.search(src, dst, max_hops);
        self.cache.insert(key, result.clone());
        result
    }

    fn search(&self, src: &str, dst: &str, max_hops: usize) -> Option<Vec<Relationship>> {
        let relationships = self.graph.relationships();
        let mut heap = BinaryHeap::new();
        // First pop of a (table, hops) state is its best label.
        let mut settled: HashSet<(String, usize)> = HashSet::new();

        heap.push(Candidate {
            cost: 0.0,
            hops: 0,
            min_conf: 1.0,
            seq: vec![src.to_string()],
            edges: Vec::new(),
            table: src.to_string(),
        });

        while let Some(candidate) = heap.pop() {
            if candidate.table == dst {
                return Some(
                    candidate
                        .edges
                        .iter()
                        .map(|&i| relationships[i].clone())
                        .collect(),
                );
            }
            if !settled.insert((candidate.table.clone(), candidate.hops)) {
                continue;
            }
            if candidate.hops == max_hops {
                continue;
            }

            for &edge_index in self.graph.relationship_indices_of(&candidate.table) {
                let rel = &relationships[edge_index];
                if rel.confidence < self.confidence_threshold {
                    continue;
                }
                let next = match rel.other_end(&candidate.table) {
                    Some(t) => t,
                    None => continue,
                };
                // No revisits within one path.
                if candidate.seq.iter().any(|t| t == next) {
                    continue;
                }
                let mut seq = candidate.seq.clone();
                seq.push(next.to_string());
                let mut edges = candidate.edges.clone();
                edges.push(edge_index);

                heap.push(Candidate {
                    cost: candidate.cost
                        + 1.0 / rel.confidence.max(CONFIDENCE_EPS)
                        + HOP_PENALTY,
                    hops: candidate.hops + 1,
                    min_conf: candidate.min_conf.min(rel.confidence),
                    seq,
                    edges,
                    table: next.to_string(),
                });
            }
        }

        None
    }

    /// Union of pairwise shortest paths between all selected tables,
    /// deduplicated. Seeds the join planner.
    pub fn expand(&mut self, selected: &[String], max_hops: usize) -> Vec<Relationship> {
        let mut seen = HashSet::new();
        let mut edges = Vec::new();
        for i in 0..selected.len() {
            for j in (i + 1)..selected.len() {
                if let Some(path) = self.shortest_path(&selected[i], &selected[j], max_hops) {
                    for rel in path {
                        if seen.insert(rel.key()) {
                            edges.push(rel);
                        }
                    }
                }
            }
        }
        edges
    }

    /// Pairs in the selected set that cannot be connected within the hop
    /// cap. Drives bridge discovery.
    pub fn unreachable_pairs(
        &mut self,
        selected: &[String],
        max_hops: usize,
    ) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for i in 0..selected.len() {
            for j in (i + 1)..selected.len() {
                if self
                    .shortest_path(&selected[i], &selected[j], max_hops)
                    .is_none()
                {
                    pairs.push((selected[i].clone(), selected[j].clone()));
                }
            }
        }
        pairs
    }
}
