//! Join Graph - the authoritative map of tables, columns, and typed
//! relationships.
//!
//! Loaded once from the merged artifact at process start, validated, and
//! shared read-only across concurrent requests. The in-memory layout is
//! plain value records addressable by string keys: O(1) table lookup and
//! O(deg) neighbor enumeration via an adjacency index into the
//! relationship list.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// ============ Artifact Records ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique_columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    ForeignKey,
    Business,
    Manual,
    Heuristic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    #[serde(rename = "1:1")]
    OneToOne,
    #[serde(rename = "1:N")]
    OneToMany,
    #[serde(rename = "N:1")]
    ManyToOne,
    #[serde(rename = "N:N")]
    ManyToMany,
}

/// A declared relationship. Undirected for pathfinding; the declared
/// direction is kept for join rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    #[serde(rename = "type")]
    pub rel_type: RelationshipType,
    pub confidence: f64,
    pub cardinality: Cardinality,
}

impl Relationship {
    /// Whether this edge touches the given table.
    pub fn touches(&self, table: &str) -> bool {
        self.from_table == table || self.to_table == table
    }

    /// The table on the other end, if this edge touches `table`.
    pub fn other_end(&self, table: &str) -> Option<&str> {
        if self.from_table == table {
            Some(&self.to_table)
        } else if self.to_table == table {
            Some(&self.from_table)
        } else {
            None
        }
    }

    /// Whether the join condition `(a.c1 = b.c2)` matches this edge in
    /// either direction.
    pub fn matches_join(&self, a: &str, c1: &str, b: &str, c2: &str) -> bool {
        (self.from_table == a
            && self.from_column == c1
            && self.to_table == b
            && self.to_column == c2)
            || (self.from_table == b
                && self.from_column == c2
                && self.to_table == a
                && self.to_column == c1)
    }

    /// Stable identity used for dedup when unioning paths.
    pub fn key(&self) -> (String, String, String, String) {
        (
            self.from_table.clone(),
            self.from_column.clone(),
            self.to_table.clone(),
            self.to_column.clone(),
        )
    }
}

/// Per-table semantic role. Governs whether the table may be introduced
/// as a bridge during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableRole {
    Instance,
    Template,
    Bridge,
    ContentChild,
    Satellite,
    Assignment,
    Configuration,
}

impl TableRole {
    /// Satellite, assignment, and configuration tables are never used as
    /// bridges.
    pub fn bridge_eligible(&self) -> bool {
        !matches!(
            self,
            TableRole::Satellite | TableRole::Assignment | TableRole::Configuration
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMetadata {
    pub role: TableRole,
    #[serde(default)]
    pub exclude_as_bridge_for: Vec<String>,
    #[serde(default)]
    pub note: Option<String>,
}

/// On-disk shape of `join_graph_merged.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinGraphArtifact {
    pub tables: Vec<Table>,
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub table_metadata: HashMap<String, TableMetadata>,
}

// ============ Join Graph ============

#[derive(Debug)]
pub struct JoinGraph {
    tables: HashMap<String, Table>,
    relationships: Vec<Relationship>,
    metadata: HashMap<String, TableMetadata>,
    /// table name -> indices into `relationships`
    adjacency: HashMap<String, Vec<usize>>,
}

impl JoinGraph {
    /// Build and validate the graph from a parsed artifact. Rejects
    /// malformed artifacts with a fatal error.
    pub fn from_artifact(artifact: JoinGraphArtifact) -> Result<Self, EngineError> {
        let mut tables = HashMap::new();
        for table in artifact.tables {
            for unique in &table.unique_columns {
                if !table.columns.contains(unique) {
                    return Err(EngineError::Config(format!(
                        "join graph: unique column `{}` not in columns of table `{}`",
                        unique, table.name
                    )));
                }
            }
            if tables.insert(table.name.clone(), table).is_some() {
                return Err(EngineError::Config(
                    "join graph: duplicate table name".to_string(),
                ));
            }
        }

        let mut adjacency: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, rel) in artifact.relationships.iter().enumerate() {
            for (table, column) in [
                (&rel.from_table, &rel.from_column),
                (&rel.to_table, &rel.to_column),
            ] {
                let known = tables.get(table).ok_or_else(|| {
                    EngineError::Config(format!(
                        "join graph: relationship references unknown table `{}`",
                        table
                    ))
                })?;
                if !known.columns.contains(column) {
                    return Err(EngineError::Config(format!(
                        "join graph: relationship references unknown column `{}.{}`",
                        table, column
                    )));
                }
            }
            if !(0.0..=1.0).contains(&rel.confidence) {
                return Err(EngineError::Config(format!(
                    "join graph: confidence {} out of range on {} -> {}",
                    rel.confidence, rel.from_table, rel.to_table
                )));
            }
            adjacency
                .entry(rel.from_table.clone())
                .or_default()
                .push(idx);
            if rel.from_table != rel.to_table {
                adjacency.entry(rel.to_table.clone()).or_default().push(idx);
            }
        }

        for name in artifact.table_metadata.keys() {
            if !tables.contains_key(name) {
                return Err(EngineError::Config(format!(
                    "join graph: metadata for unknown table `{}`",
                    name
                )));
            }
        }

        Ok(Self {
            tables,
            relationships: artifact.relationships,
            metadata: artifact.table_metadata,
            adjacency,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let artifact: JoinGraphArtifact = serde_json::from_str(json)
            .map_err(|e| EngineError::Config(format!("join graph artifact: {}", e)))?;
        Self::from_artifact(artifact)
    }

    pub async fn load(path: &Path) -> Result<Self, EngineError> {
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            EngineError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let graph = Self::from_json(&json)?;
        tracing::info!(
            tables = graph.tables.len(),
            relationships = graph.relationships.len(),
            "join graph loaded"
        );
        Ok(graph)
    }

    pub fn get_table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn columns_of(&self, name: &str) -> Option<&[String]> {
        self.tables.get(name).map(|t| t.columns.as_slice())
    }

    /// Edges touching the given table, in declaration order.
    pub fn relationships_of(&self, name: &str) -> Vec<&Relationship> {
        self.adjacency
            .get(name)
            .map(|indices| indices.iter().map(|&i| &self.relationships[i]).collect())
            .unwrap_or_default()
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    /// Indices into `relationships()` for edges touching the table.
    pub fn relationship_indices_of(&self, name: &str) -> &[usize] {
        self.adjacency
            .get(name)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(|s| s.as_str())
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn metadata_of(&self, name: &str) -> Option<&TableMetadata> {
        self.metadata.get(name)
    }

    /// Role of a table; tables without metadata default to `instance`.
    pub fn role_of(&self, name: &str) -> TableRole {
        self.metadata
            .get(name)
            .map(|m| m.role)
            .unwrap_or(TableRole::Instance)
    }

    /// Whether the table may be introduced as a bridge.
    pub fn is_bridge_candidate(&self, name: &str) -> bool {
        self.tables.contains_key(name) && self.role_of(name).bridge_eligible()
    }

    /// Tables (other than `except`) carrying a column with this name.
    /// Used by the validator to suggest the right table on a miss.
    pub fn tables_with_column(&self, column: &str, except: &str) -> Vec<&str> {
        let mut found: Vec<&str> = self
            .tables
            .values()
            .filter(|t| t.name != except && t.columns.iter().any(|c| c == column))
            .map(|t| t.name.as_str())
            .collect();
        found.sort_unstable();
        found
    }
}

#[cfg(test)]
pub(crate) mod test_graphs {
    use super::*;
    use serde_json::json;

    /// A small field-operations graph shared by unit tests.
    pub fn demo_graph() -> JoinGraph {
        let artifact = json!({
            "tables": [
                {"name": "employee", "columns": ["id", "firstName", "lastName", "email", "active"], "unique_columns": ["id", "email"]},
                {"name": "workTime", "columns": ["id", "employeeId", "workTimeTypeId", "startedAt", "endedAt"], "unique_columns": ["id"]},
                {"name": "workTimeType", "columns": ["id", "name"], "unique_columns": ["id"]},
                {"name": "crew", "columns": ["id", "name"], "unique_columns": ["id"]},
                {"name": "employeeCrew", "columns": ["id", "employeeId", "crewId", "isLead"], "unique_columns": ["id"]},
                {"name": "employeeRoleWorkTimeType", "columns": ["id", "employeeId", "workTimeTypeId"], "unique_columns": ["id"]},
                {"name": "asset", "columns": ["id", "name", "manufacturer", "modelNumber", "serviceLocationId"], "unique_columns": ["id"]},
                {"name": "inspection", "columns": ["id", "assetId", "inspectedAt"], "unique_columns": ["id"]},
                {"name": "inspectionQuestionAnswer", "columns": ["id", "inspectionId", "answer", "isActionItem"], "unique_columns": ["id"]},
                {"name": "assetNote", "columns": ["id", "assetId", "body"], "unique_columns": ["id"]}
            ],
            "relationships": [
                {"from_table": "workTime", "from_column": "employeeId", "to_table": "employee", "to_column": "id", "type": "foreign_key", "confidence": 1.0, "cardinality": "N:1"},
                {"from_table": "workTime", "from_column": "workTimeTypeId", "to_table": "workTimeType", "to_column": "id", "type": "foreign_key", "confidence": 1.0, "cardinality": "N:1"},
                {"from_table": "employeeCrew", "from_column": "employeeId", "to_table": "employee", "to_column": "id", "type": "foreign_key", "confidence": 1.0, "cardinality": "N:1"},
                {"from_table": "employeeCrew", "from_column": "crewId", "to_table": "crew", "to_column": "id", "type": "foreign_key", "confidence": 1.0, "cardinality": "N:1"},
                {"from_table": "employeeRoleWorkTimeType", "from_column": "employeeId", "to_table": "employee", "to_column": "id", "type": "foreign_key", "confidence": 1.0, "cardinality": "N:1"},
                {"from_table": "employeeRoleWorkTimeType", "from_column": "workTimeTypeId", "to_table": "workTimeType", "to_column": "id", "type": "foreign_key", "confidence": 1.0, "cardinality": "N:1"},
                {"from_table": "inspection", "from_column": "assetId", "to_table": "asset", "to_column": "id", "type": "foreign_key", "confidence": 1.0, "cardinality": "N:1"},
                {"from_table": "inspectionQuestionAnswer", "from_column": "inspectionId", "to_table": "inspection", "to_column": "id", "type": "foreign_key", "confidence": 1.0, "cardinality": "N:1"},
                {"from_table": "assetNote", "from_column": "assetId", "to_table": "asset", "to_column": "id", "type": "foreign_key", "confidence": 0.95, "cardinality": "N:1"}
            ],
            "table_metadata": {
                "employeeCrew": {"role": "assignment"},
                "employeeRoleWorkTimeType": {"role": "configuration"},
                "assetNote": {"role": "content_child"},
                "employee": {"role": "instance"},
                "asset": {"role": "instance"}
            }
        });
        JoinGraph::from_json(&artifact.to_string()).expect("demo graph must be valid")
    }
}
