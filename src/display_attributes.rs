//! Per-table display attributes: default projection lists and
//! human-readable labels, consumed by the SQL generator and the result
//! formatter.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::join_graph::JoinGraph;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayEntry {
    /// Projection used when the question does not demand specific columns.
    pub display_columns: Vec<String>,
    /// Columns concatenated left-to-right (space separated) to form a
    /// human identifier for one row.
    #[serde(default)]
    pub primary_label: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DisplayAttributes {
    entries: HashMap<String, DisplayEntry>,
}

impl DisplayAttributes {
    pub fn from_json(json: &str, graph: &JoinGraph) -> Result<Self, EngineError> {
        let entries: HashMap<String, DisplayEntry> = serde_json::from_str(json)
            .map_err(|e| EngineError::Config(format!("display attributes artifact: {}", e)))?;

        for (table, entry) in &entries {
            let columns = graph.columns_of(table).ok_or_else(|| {
                EngineError::Config(format!(
                    "display attributes reference unknown table `{}`",
                    table
                ))
            })?;
            for column in entry.display_columns.iter().chain(&entry.primary_label) {
                if !columns.contains(column) {
                    return Err(EngineError::Config(format!(
                        "display attributes reference unknown column `{}.{}`",
                        table, column
                    )));
                }
            }
        }
        Ok(Self { entries })
    }

    pub async fn load(path: &Path, graph: &JoinGraph) -> Result<Self, EngineError> {
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            EngineError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json, graph)
    }

    pub fn entry(&self, table: &str) -> Option<&DisplayEntry> {
        self.entries.get(table)
    }

    pub fn display_columns(&self, table: &str) -> Option<&[String]> {
        self.entries
            .get(table)
            .map(|e| e.display_columns.as_slice())
    }

    /// SQL expression producing the human label for one row of `table`,
    /// e.g. `CONCAT(e.firstName, ' ', e.lastName)`.
    pub fn label_expression(&self, table: &str, qualifier: &str) -> Option<String> {
        let entry = self.entries.get(table)?;
        match entry.primary_label.as_slice() {
            [] => None,
            [single] => Some(format!("{}.{}", qualifier, single)),
            many => Some(format!(
                "CONCAT({})",
                many.iter()
                    .map(|c| format!("{}.{}", qualifier, c))
                    .collect::<Vec<_>>()
                    .join(", ' ', ")
            )),
        }
    }
}
