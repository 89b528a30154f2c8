//! Lightweight SQL text utilities shared by the generator, rewriter, and
//! validator.
//!
//! This is deliberately not a full SQL parser: the pipeline only ever
//! deals with single read-only SELECT statements it generated itself, so
//! word-boundary scanning over literal-masked text is sufficient and
//! keeps validation deterministic and pure.

use lazy_static::lazy_static;
use regex::Regex;
use std::ops::Range;

lazy_static! {
    static ref FENCED_SQL: Regex = Regex::new(r"(?s)```(?:sql)?\s*(.*?)```").unwrap();
    static ref SELECT_START: Regex = Regex::new(r"(?i)\bSELECT\b").unwrap();
    static ref FROM_JOIN: Regex = Regex::new(
        r"(?i)\b(?:FROM|JOIN)\s+([A-Za-z_][A-Za-z0-9_]*)(?:\s+(?:AS\s+)?([A-Za-z_][A-Za-z0-9_]*))?"
    )
    .unwrap();
    static ref QUALIFIED_COLUMN: Regex =
        Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\b").unwrap();
    static ref JOIN_EQUALITY: Regex = Regex::new(
        r"\b([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\s*=\s*([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\b"
    )
    .unwrap();
    static ref LIMIT_CLAUSE: Regex = Regex::new(r"(?i)\bLIMIT\s+(\d+)").unwrap();
    static ref FORBIDDEN_STATEMENT: Regex = Regex::new(
        r"(?i)\b(INSERT|UPDATE|DELETE|DROP|ALTER|CREATE|TRUNCATE|REPLACE|GRANT|REVOKE|MERGE|CALL|LOAD|OUTFILE|INFILE|SET)\b"
    )
    .unwrap();
}

/// SQL keywords that must not be mistaken for table aliases.
const NON_ALIAS_KEYWORDS: &[&str] = &[
    "ON", "WHERE", "GROUP", "ORDER", "LIMIT", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "OUTER",
    "CROSS", "USING", "HAVING", "UNION", "AND", "OR", "SET", "AS",
];

fn is_alias_keyword(word: &str) -> bool {
    let upper = word.to_uppercase();
    NON_ALIAS_KEYWORDS.iter().any(|k| *k == upper)
}

/// A table reference found in a FROM or JOIN clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub table: String,
    pub alias: Option<String>,
}

/// Same, with the byte range of the table identifier in the original
/// text. Used by the secure-view rewriter to splice replacements.
#[derive(Debug, Clone)]
pub struct TableSpan {
    pub range: Range<usize>,
    pub table: String,
    pub alias: Option<String>,
}

/// Mask single-quoted string literals with spaces, preserving length so
/// byte offsets computed on the masked text are valid on the original.
pub fn mask_string_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_string = false;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if in_string {
            if c == '\'' {
                // Doubled quote is an escaped quote inside the literal.
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    out.push(' ');
                    out.push(' ');
                    continue;
                }
                in_string = false;
                out.push('\'');
            } else {
                for _ in 0..c.len_utf8() {
                    out.push(' ');
                }
            }
        } else {
            if c == '\'' {
                in_string = true;
            }
            out.push(c);
        }
    }
    out
}

/// Extract the SQL statement from a model reply: prefer a fenced block,
/// otherwise take everything from the first SELECT. Trailing semicolons
/// and prose after a terminating semicolon are dropped.
pub fn extract_sql(reply: &str) -> String {
    let body = FENCED_SQL
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| match SELECT_START.find(reply) {
            Some(m) => reply[m.start()..].to_string(),
            None => reply.to_string(),
        });

    let masked = mask_string_literals(&body);
    let cut = masked.find(';').unwrap_or(body.len());
    body[..cut].trim().to_string()
}

/// Check that the statement is a single read-only SELECT: fails closed on
/// DML/DDL keywords, multiple statements, and non-SELECT shapes.
pub fn check_read_only_select(sql: &str) -> Result<(), String> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err("statement is empty".to_string());
    }
    let masked = mask_string_literals(trimmed);
    if !masked.trim_start().to_uppercase().starts_with("SELECT") {
        return Err("only SELECT statements are allowed".to_string());
    }
    if let Some(pos) = masked.find(';') {
        if !masked[pos + 1..].trim().is_empty() {
            return Err("multiple statements are not allowed".to_string());
        }
    }
    if let Some(found) = FORBIDDEN_STATEMENT.find(&masked) {
        return Err(format!(
            "forbidden keyword `{}` in statement",
            found.as_str().to_uppercase()
        ));
    }
    Ok(())
}

/// Table identifiers (with spans) in FROM/JOIN position.
pub fn from_join_spans(sql: &str) -> Vec<TableSpan> {
    let masked = mask_string_literals(sql);
    FROM_JOIN
        .captures_iter(&masked)
        .map(|cap| {
            let table = cap.get(1).unwrap();
            let alias = cap
                .get(2)
                .map(|m| m.as_str())
                .filter(|a| !is_alias_keyword(a))
                .map(|a| a.to_string());
            TableSpan {
                range: table.range(),
                table: table.as_str().to_string(),
                alias,
            }
        })
        .collect()
}

/// Table references in FROM/JOIN position.
pub fn from_join_tables(sql: &str) -> Vec<TableRef> {
    from_join_spans(sql)
        .into_iter()
        .map(|span| TableRef {
            table: span.table,
            alias: span.alias,
        })
        .collect()
}

/// All `qualifier.column` references, deduplicated in order of first
/// appearance.
pub fn qualified_column_refs(sql: &str) -> Vec<(String, String)> {
    let masked = mask_string_literals(sql);
    let mut seen = std::collections::HashSet::new();
    let mut refs = Vec::new();
    for cap in QUALIFIED_COLUMN.captures_iter(&masked) {
        let pair = (cap[1].to_string(), cap[2].to_string());
        if seen.insert(pair.clone()) {
            refs.push(pair);
        }
    }
    refs
}

/// A join condition `left = right` between two qualified columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinEquality {
    pub left: (String, String),
    pub right: (String, String),
}

pub fn join_equalities(sql: &str) -> Vec<JoinEquality> {
    let masked = mask_string_literals(sql);
    JOIN_EQUALITY
        .captures_iter(&masked)
        .map(|cap| JoinEquality {
            left: (cap[1].to_string(), cap[2].to_string()),
            right: (cap[3].to_string(), cap[4].to_string()),
        })
        .collect()
}

/// Append a LIMIT when absent, clamp a user-supplied one to the cap.
pub fn enforce_limit(sql: &str, max_rows: usize) -> String {
    let masked = mask_string_literals(sql);
    if let Some(cap) = LIMIT_CLAUSE.captures(&masked) {
        let number = cap.get(1).unwrap();
        let requested: usize = number.as_str().parse().unwrap_or(max_rows);
        if requested > max_rows {
            let mut clamped = String::with_capacity(sql.len());
            clamped.push_str(&sql[..number.start()]);
            clamped.push_str(&max_rows.to_string());
            clamped.push_str(&sql[number.end()..]);
            return clamped;
        }
        return sql.to_string();
    }
    format!("{} LIMIT {}", sql.trim_end(), max_rows)
}
