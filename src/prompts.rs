//! Centralized prompt generation for the engine.
//!
//! Single source of truth for all LLM prompt content. Builders are pure
//! and take already-capped inputs; the caps themselves come from
//! settings so prompt size stays bounded regardless of schema size.

use crate::domain_registry::DomainResolution;
use crate::join_graph::JoinGraph;
use crate::protocol::Message;

// ============ Classification ============

pub const CLASSIFY_RULES: &str = "\
You route user questions to exactly one agent. Reply with a single word:
- sql: the question asks about operational data (counts, lists, filters, dates, people, assets, inspections, time records)
- rag: the question asks about documentation, manuals, or policies
- general: greetings, small talk, or anything else

Reply with exactly one of: sql, rag, general. No other text.";

pub fn build_classify_prompt(history: &[Message], question: &str) -> Vec<Message> {
    let mut messages = vec![Message::system(CLASSIFY_RULES)];
    messages.extend(history.iter().cloned());
    messages.push(Message::user(format!("Route this question: {}", question)));
    messages
}

// ============ Domain Extraction ============

pub const DOMAIN_EXTRACTION_RULES: &str = "\
You identify business vocabulary in a question. You are given the full
list of known terms. Return a JSON array containing ONLY the known terms
the question mentions (synonyms and plurals count as mentions). Return []
if none apply. No other text.";

pub fn build_domain_extraction_prompt(known_terms: &[&str], question: &str) -> Vec<Message> {
    vec![
        Message::system(DOMAIN_EXTRACTION_RULES),
        Message::user(format!(
            "Known terms: {}\n\nQuestion: {}",
            serde_json::to_string(known_terms).unwrap_or_else(|_| "[]".to_string()),
            question
        )),
    ]
}

// ============ Table Selection ============

pub const TABLE_SELECTION_RULES: &str = "\
You select the minimal set of tables needed to answer a question.
- Return a JSON array of 3 to 8 table names from the list provided
- ALWAYS include every required table
- Prefer the smallest set that can answer the question
- Only use table names exactly as listed. No other text.";

pub fn build_table_selection_prompt(
    graph: &JoinGraph,
    max_tables: usize,
    required: &[String],
    history: &[Message],
    question: &str,
) -> Vec<Message> {
    let mut names: Vec<&str> = graph.table_names().collect();
    names.sort_unstable();
    let headers: Vec<String> = names
        .iter()
        .take(max_tables)
        .map(|name| format_table_header(graph, name))
        .collect();

    let mut messages = vec![Message::system(TABLE_SELECTION_RULES)];
    messages.extend(history.iter().cloned());
    messages.push(Message::user(format!(
        "Available tables:\n{}\n\nRequired tables: {}\n\nQuestion: {}",
        headers.join("\n"),
        if required.is_empty() {
            "(none)".to_string()
        } else {
            required.join(", ")
        },
        question
    )));
    messages
}

/// One line per table: name plus a short column list.
pub fn format_table_header(graph: &JoinGraph, table: &str) -> String {
    const HEADER_COLUMNS: usize = 8;
    match graph.columns_of(table) {
        Some(columns) => {
            let shown: Vec<&str> = columns.iter().take(HEADER_COLUMNS).map(|c| c.as_str()).collect();
            let ellipsis = if columns.len() > HEADER_COLUMNS { ", ..." } else { "" };
            format!("- {} ({}{})", table, shown.join(", "), ellipsis)
        }
        None => format!("- {}", table),
    }
}

// ============ SQL Generation ============

pub const SQL_GENERATION_RULES: &str = "\
You write a single read-only MySQL SELECT statement.
- ONLY use the tables and columns listed in the schema - if it is not listed, it does not exist
- ONLY join along the allowed joins; never invent a join condition
- Use logical table names exactly as given; view mapping is handled elsewhere
- Apply every mandatory filter verbatim (aliases may be substituted)
- Prefer the display columns unless the question asks for specific columns
- No INSERT/UPDATE/DELETE/DDL, no subquery tricks to write data
- Return only the SQL, in a ```sql fenced block";

#[allow(clippy::too_many_arguments)]
pub fn build_sql_generation_prompt(
    graph: &JoinGraph,
    selected: &[String],
    max_columns: usize,
    join_summary: &str,
    resolutions: &[DomainResolution],
    display_hints: &[String],
    samples: &[String],
    history: &[Message],
    question: &str,
    row_cap: usize,
) -> Vec<Message> {
    let schemas: Vec<String> = selected
        .iter()
        .map(|table| format_table_schema(graph, table, max_columns))
        .collect();

    let filters: Vec<String> = resolutions
        .iter()
        .flat_map(|r| r.filters.iter().cloned())
        .collect();

    let mut sections = vec![format!("Schema:\n{}", schemas.join("\n"))];
    sections.push(join_summary.to_string());
    if !filters.is_empty() {
        sections.push(format!("Mandatory filters (AND them all):\n- {}", filters.join("\n- ")));
    }
    if !display_hints.is_empty() {
        sections.push(format!("Display columns:\n{}", display_hints.join("\n")));
    }
    if !samples.is_empty() {
        sections.push(format!("Sample rows:\n{}", samples.join("\n")));
    }
    sections.push(format!("Row cap: LIMIT {} at most.", row_cap));
    sections.push(format!("Question: {}", question));

    let mut messages = vec![Message::system(SQL_GENERATION_RULES)];
    messages.extend(history.iter().cloned());
    messages.push(Message::user(sections.join("\n\n")));
    messages
}

/// Multi-line schema block for one table, column list capped.
pub fn format_table_schema(graph: &JoinGraph, table: &str, max_columns: usize) -> String {
    match graph.columns_of(table) {
        Some(columns) => {
            let shown: Vec<&str> = columns.iter().take(max_columns).map(|c| c.as_str()).collect();
            let ellipsis = if columns.len() > max_columns {
                format!(" (+{} more)", columns.len() - max_columns)
            } else {
                String::new()
            };
            format!("{}: {}{}", table, shown.join(", "), ellipsis)
        }
        None => table.to_string(),
    }
}

// ============ Correction ============

pub const CORRECTION_RULES: &str = "\
You fix a failing MySQL SELECT statement. You are given the question, the
failing SQL, and the exact error. Use ONLY the tables and columns in the
schema slice below; the error message often names the right table.
Return only the corrected SQL, in a ```sql fenced block. Do not repeat
the failing SQL unchanged.";

pub fn build_correction_prompt(
    question: &str,
    failing_sql: &str,
    error: &str,
    schema_slice: &[String],
    relationship_summary: &str,
    history: &[(String, String)],
) -> Vec<Message> {
    let mut sections = vec![
        format!("Question: {}", question),
        format!("Failing SQL:\n{}", failing_sql),
        format!("Error: {}", error),
        format!("Schema slice:\n{}", schema_slice.join("\n")),
    ];
    if !relationship_summary.is_empty() {
        sections.push(relationship_summary.to_string());
    }
    if !history.is_empty() {
        let attempts: Vec<String> = history
            .iter()
            .map(|(sql, err)| format!("SQL: {}\nError: {}", sql, err))
            .collect();
        sections.push(format!("Previously failed attempts:\n{}", attempts.join("\n---\n")));
    }

    vec![
        Message::system(CORRECTION_RULES),
        Message::user(sections.join("\n\n")),
    ]
}

// ============ Final Answer ============

pub const FINAL_ANSWER_RULES: &str = "\
You answer the user's question from query results.
- Use ONLY the rows provided; never invent values
- Be direct and concise; aggregate when it answers the question better
- Plain language only: no SQL, no table names, no schema talk";

pub fn build_final_answer_prompt(
    question: &str,
    columns: &[String],
    rows_preview: &str,
    row_count: usize,
) -> Vec<Message> {
    vec![
        Message::system(FINAL_ANSWER_RULES),
        Message::user(format!(
            "Question: {}\n\nColumns: {}\nRows returned: {}\n\nResults:\n{}",
            question,
            columns.join(", "),
            row_count,
            rows_preview
        )),
    ]
}

// ============ RAG / General ============

pub const RAG_ANSWER_RULES: &str = "\
You answer from the retrieved context below. If the context does not
contain the answer, say so; never invent facts.";

pub fn build_rag_prompt(question: &str, chunks: &[String], history: &[Message]) -> Vec<Message> {
    let mut messages = vec![Message::system(RAG_ANSWER_RULES)];
    messages.extend(history.iter().cloned());
    messages.push(Message::user(format!(
        "Context:\n{}\n\nQuestion: {}",
        if chunks.is_empty() {
            "(no relevant documents found)".to_string()
        } else {
            chunks.join("\n---\n")
        },
        question
    )));
    messages
}

pub const GENERAL_RULES: &str = "\
You are a helpful assistant for a field-operations team. Be direct and
concise. When you don't know something, say so rather than guessing.";

pub fn build_general_prompt(question: &str, history: &[Message]) -> Vec<Message> {
    let mut messages = vec![Message::system(GENERAL_RULES)];
    messages.extend(history.iter().cloned());
    messages.push(Message::user(question.to_string()));
    messages
}
