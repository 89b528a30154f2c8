//! End-to-end pipeline scenarios over scripted doubles.

use super::support::*;
use crate::actors::query_executor::{ExecError, QueryOutput};
use crate::domain_registry::test_registries::demo_registry;
use crate::join_graph::test_graphs::demo_graph;
use crate::protocol::{AgentRoute, StreamEvent, TokenChannel};
use crate::secure_views::SecureViewMap;

fn final_text(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Token {
                channel: TokenChannel::Final,
                content,
            } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_direct_foreign_key_flow() {
    let (llm, _requests) = scripted_llm(&[
        "sql",
        r#"["employee", "workTime", "workTimeType"]"#,
        "```sql\nSELECT e.firstName, w.startedAt FROM employee e JOIN workTime w ON w.employeeId = e.id WHERE w.startedAt BETWEEN '2026-10-06' AND '2026-10-12'\n```",
        "Dana logged work time that week.",
    ]);
    let (executor, executed) = scripted_executor(vec![Ok(single_row_output())]);
    let harness = build_harness(HarnessOptions {
        llm,
        executor,
        views: SecureViewMap::default(),
        registry: None,
        pipeline_timeout_secs: 30,
    });

    let events = run_request(&harness, request("employees with work time between 2026-10-06 and 2026-10-12", "conv-s1")).await;
    assert_stream_invariants(&events);

    assert!(matches!(
        events[0],
        StreamEvent::RouteDecision {
            route: AgentRoute::Sql
        }
    ));
    assert!(matches!(events[1], StreamEvent::ToolStart { .. }));
    assert!(final_text(&events).contains("Dana"));

    let executed = executed.lock().unwrap();
    assert_eq!(executed.len(), 1);
    // The direct foreign key is used; the assignment/configuration
    // tables never appear; the row cap is appended.
    assert!(executed[0].contains("w.employeeId = e.id"));
    assert!(!executed[0].contains("employeeCrew"));
    assert!(!executed[0].contains("employeeRoleWorkTimeType"));
    assert!(executed[0].trim_end().ends_with("LIMIT 100"));
}

#[tokio::test]
async fn test_domain_terms_force_tables_and_filters() {
    let graph = demo_graph();
    let (llm, requests) = scripted_llm(&[
        "sql",
        r#"["crane", "action item"]"#,
        r#"["asset"]"#,
        "```sql\nSELECT a.name FROM asset a JOIN inspection i ON i.assetId = a.id JOIN inspectionQuestionAnswer q ON q.inspectionId = i.id WHERE LOWER(a.name) LIKE '%crane%' AND q.isActionItem = TRUE\n```",
        "One crane has open action items.",
    ]);
    let (executor, executed) = scripted_executor(vec![Ok(QueryOutput {
        columns: vec!["name".to_string()],
        rows: vec![vec![serde_json::json!("Crane 7")]],
    })]);
    let harness = build_harness(HarnessOptions {
        llm,
        executor,
        views: SecureViewMap::default(),
        registry: Some(demo_registry(&graph)),
        pipeline_timeout_secs: 30,
    });

    let events = run_request(&harness, request("cranes with action items", "conv-s2")).await;
    assert_stream_invariants(&events);
    assert!(final_text(&events).contains("action items"));

    // The generation prompt carries the mandatory domain filters.
    let requests = requests.lock().unwrap();
    let generation_prompt = &requests[3].messages.last().unwrap().content;
    assert!(generation_prompt.contains("LOWER(asset.name) LIKE '%crane%'"));
    assert!(generation_prompt.contains("inspectionQuestionAnswer.isActionItem = TRUE"));

    // Both domain-required tables made it into the executed SQL.
    let executed = executed.lock().unwrap();
    assert!(executed[0].contains("FROM asset"));
    assert!(executed[0].contains("inspectionQuestionAnswer"));
}

#[tokio::test]
async fn test_correction_loop_recovers_from_wrong_column() {
    let (llm, requests) = scripted_llm(&[
        "sql",
        r#"["crew", "employee", "employeeCrew"]"#,
        "```sql\nSELECT c.isLead FROM crew c\n```",
        "```sql\nSELECT ec.isLead FROM employeeCrew ec JOIN crew c ON ec.crewId = c.id\n```",
        "The crew leads are listed.",
    ]);
    let (executor, executed) = scripted_executor(vec![Ok(QueryOutput {
        columns: vec!["isLead".to_string()],
        rows: vec![vec![serde_json::json!(1)]],
    })]);
    let harness = build_harness(HarnessOptions {
        llm,
        executor,
        views: SecureViewMap::default(),
        registry: None,
        pipeline_timeout_secs: 30,
    });

    let events = run_request(&harness, request("which crew members are leads?", "conv-s3")).await;
    assert_stream_invariants(&events);
    assert!(matches!(events.last().unwrap(), StreamEvent::Complete { .. }));

    // Exactly one execution: the draft never reached the database.
    let executed = executed.lock().unwrap();
    assert_eq!(executed.len(), 1);
    assert!(executed[0].contains("employeeCrew"));

    // The correction prompt carried the pointed validator message.
    let requests = requests.lock().unwrap();
    let correction_prompt = &requests[3].messages.last().unwrap().content;
    assert!(correction_prompt.contains("column `isLead` not found in table `crew`"));
    assert!(correction_prompt.contains("employeeCrew"));
}

#[tokio::test]
async fn test_correction_cap_terminates_with_error_event() {
    let (llm, _requests) = scripted_llm(&[
        "sql",
        r#"["employee", "workTime", "workTimeType"]"#,
        "```sql\nSELECT e.firstName FROM employee e\n```",
        "```sql\nSELECT e.lastName FROM employee e\n```",
        "```sql\nSELECT e.email FROM employee e\n```",
        "```sql\nSELECT e.active FROM employee e\n```",
    ]);
    let failure = || Err(ExecError::Query("Unknown error in storage engine".to_string()));
    let (executor, executed) =
        scripted_executor(vec![failure(), failure(), failure(), failure()]);
    let harness = build_harness(HarnessOptions {
        llm,
        executor,
        views: SecureViewMap::default(),
        registry: None,
        pipeline_timeout_secs: 30,
    });

    let events = run_request(&harness, request("list employees", "conv-cap")).await;
    assert_stream_invariants(&events);

    match events.last().unwrap() {
        StreamEvent::Error { error } => {
            assert!(error.starts_with("execution_error"));
            // No SQL or schema details leak to the user.
            assert!(!error.contains("SELECT"));
            assert!(!error.contains("storage engine"));
        }
        other => panic!("expected error terminal, got {:?}", other),
    }

    // Initial execution plus one per correction attempt.
    assert_eq!(executed.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn test_secure_view_rewrite_reaches_executor() {
    let (llm, _requests) = scripted_llm(&[
        "sql",
        r#"["employee", "workTime", "workTimeType"]"#,
        "```sql\nSELECT e.firstName FROM employee e JOIN workTime w ON w.employeeId = e.id\n```",
        "Here are the names.",
    ]);
    let (executor, executed) = scripted_executor(vec![Ok(single_row_output())]);
    let harness = build_harness(HarnessOptions {
        llm,
        executor,
        views: SecureViewMap::from_pairs([(
            "employee".to_string(),
            "secure_employee".to_string(),
        )]),
        registry: None,
        pipeline_timeout_secs: 30,
    });

    let events = run_request(&harness, request("employee names with work time", "conv-s4")).await;
    assert_stream_invariants(&events);

    let executed = executed.lock().unwrap();
    assert!(executed[0].contains("FROM secure_employee e JOIN workTime w"));
    assert!(!executed[0].contains("FROM employee"));
}

#[tokio::test]
async fn test_hallucinated_secure_view_rejected() {
    let (llm, _requests) = scripted_llm(&[
        "sql",
        r#"["employee", "workTime", "workTimeType"]"#,
        "SELECT * FROM secure_inspection",
        // The correction repeats the same statement, so the loop
        // terminates as stuck.
        "SELECT * FROM secure_inspection",
    ]);
    let (executor, executed) = scripted_executor(vec![]);
    let harness = build_harness(HarnessOptions {
        llm,
        executor,
        views: SecureViewMap::from_pairs([(
            "employee".to_string(),
            "secure_employee".to_string(),
        )]),
        registry: None,
        pipeline_timeout_secs: 30,
    });

    let events = run_request(&harness, request("show inspections", "conv-s5")).await;
    assert_stream_invariants(&events);

    match events.last().unwrap() {
        StreamEvent::Error { error } => assert!(error.starts_with("unknown_table")),
        other => panic!("expected error terminal, got {:?}", other),
    }
    // Nothing hallucinated ever reached the database.
    assert!(executed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unconnectable_selection_answers_apologetically() {
    let (llm, _requests) = scripted_llm(&[
        "sql",
        r#"["employee", "asset"]"#,
    ]);
    let (executor, executed) = scripted_executor(vec![]);
    let harness = build_harness(HarnessOptions {
        llm,
        executor,
        views: SecureViewMap::default(),
        registry: None,
        pipeline_timeout_secs: 30,
    });

    let events = run_request(&harness, request("employees and their assets", "conv-nopath")).await;
    assert_stream_invariants(&events);

    // A missing join path is a polite final answer, not a stream error.
    assert!(matches!(events.last().unwrap(), StreamEvent::Complete { .. }));
    assert!(final_text(&events).contains("connect"));
    assert!(executed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_conversation_history_reaches_second_request() {
    let (llm, requests) = scripted_llm(&[
        "general",
        "There are 42 active employees.",
        "general",
        "Their emails are on file.",
    ]);
    let (executor, _executed) = scripted_executor(vec![]);
    let harness = build_harness(HarnessOptions {
        llm,
        executor,
        views: SecureViewMap::default(),
        registry: None,
        pipeline_timeout_secs: 30,
    });

    let first = run_request(&harness, request("How many active employees?", "conv-s6")).await;
    assert_stream_invariants(&first);

    let stored = harness.conversations.get("conv-s6").await.unwrap().unwrap();
    assert_eq!(stored.checkpoint.messages.len(), 2);
    assert_eq!(stored.checkpoint.messages[1].content, "There are 42 active employees.");

    let second = run_request(&harness, request("Show me their emails.", "conv-s6")).await;
    assert_stream_invariants(&second);

    // The second request's classifier saw the merged history.
    let requests = requests.lock().unwrap();
    let classify_prompt = &requests[2];
    assert!(requests.len() >= 3);
    assert!(classify_prompt
        .messages
        .iter()
        .any(|m| m.content == "How many active employees?"));
    assert!(classify_prompt
        .messages
        .iter()
        .any(|m| m.content == "There are 42 active employees."));

    // Both turns are persisted, append-only.
    let stored = harness.conversations.get("conv-s6").await.unwrap().unwrap();
    assert_eq!(stored.checkpoint.messages.len(), 4);
    assert_eq!(stored.version, 2);
}

#[tokio::test]
async fn test_whole_pipeline_timeout_emits_stable_code() {
    let (executor, _executed) = scripted_executor(vec![]);
    let harness = build_harness(HarnessOptions {
        llm: silent_llm(),
        executor,
        views: SecureViewMap::default(),
        registry: None,
        pipeline_timeout_secs: 0,
    });

    let events = run_request(&harness, request("anything", "conv-timeout")).await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::Error { error } => assert!(error.starts_with("pipeline_timeout")),
        other => panic!("expected timeout error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rag_route_answers_on_final_channel() {
    let (llm, _requests) = scripted_llm(&["rag", "The manual says to inspect weekly."]);
    let (executor, _executed) = scripted_executor(vec![]);
    let harness = build_harness(HarnessOptions {
        llm,
        executor,
        views: SecureViewMap::default(),
        registry: None,
        pipeline_timeout_secs: 30,
    });

    let events = run_request(&harness, request("what does the manual say?", "conv-rag")).await;
    assert_stream_invariants(&events);
    assert!(matches!(
        events[0],
        StreamEvent::RouteDecision {
            route: AgentRoute::Rag
        }
    ));
    assert!(final_text(&events).contains("inspect weekly"));
}
