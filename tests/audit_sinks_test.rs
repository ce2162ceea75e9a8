use askwarehouse::execution_loop::ErrorKind;
use askwarehouse::observability::{
    AuditEmitter, AuditEvent, AuditEventKind, AuditSink, AuditTables, EventScope, JsonlAuditSink,
    SqliteAuditSink, ZeroResultEvent,
};
use askwarehouse::session::{ConversationSession, Turn, Vote, VoteValue};
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tempfile::TempDir;

fn zero_result_at(day: u32) -> AuditEvent {
    AuditEvent::ZeroResult(ZeroResultEvent {
        timestamp: Utc.with_ymd_and_hms(2025, 3, day, 12, 0, 0).unwrap(),
        question_id: format!("q-{}", day),
        user_id: "analyst".into(),
        session_id: "s-1".into(),
        question: "sales of unicorn milk".into(),
        sql: "SELECT * FROM fct_sales WHERE sku_name = 'unicorn milk'".into(),
        attempt: 1,
        app_version: "test".into(),
        metadata: serde_json::json!({}),
    })
}

#[tokio::test]
async fn test_jsonl_sink_partitions_by_table_and_date() {
    let dir = TempDir::new().unwrap();
    let sink = JsonlAuditSink::new(dir.path().to_path_buf(), AuditTables::default());

    sink.record(&zero_result_at(7)).await.unwrap();
    sink.record(&zero_result_at(7)).await.unwrap();
    sink.record(&zero_result_at(8)).await.unwrap();

    let day7 = dir.path().join("chatbot_zero_result_log").join("2025-03-07.jsonl");
    let lines: Vec<serde_json::Value> = std::fs::read_to_string(&day7)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["event_date"], "2025-03-07");
    assert_eq!(lines[0]["question_text"], "sales of unicorn milk");
    assert_eq!(lines[0]["attempt_number"], 1);

    assert!(dir.path().join("chatbot_zero_result_log").join("2025-03-08.jsonl").exists());
}

#[tokio::test]
async fn test_sqlite_sink_counts_per_table_and_date() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("audit").join("audit.db");
    let sink = SqliteAuditSink::open(&path, AuditTables::default()).unwrap();

    sink.record(&zero_result_at(7)).await.unwrap();
    sink.record(&zero_result_at(7)).await.unwrap();
    sink.record(&zero_result_at(8)).await.unwrap();

    assert_eq!(sink.count("chatbot_zero_result_log", "2025-03-07").unwrap(), 2);
    assert_eq!(sink.count("chatbot_zero_result_log", "2025-03-08").unwrap(), 1);
    assert_eq!(sink.count("chatbot_error_log", "2025-03-07").unwrap(), 0);
    assert!(sink.count("chatbot_error_log; DROP TABLE x", "2025-03-07").is_err());

    // reopening keeps existing rows
    drop(sink);
    let reopened = SqliteAuditSink::open(&path, AuditTables::default()).unwrap();
    assert_eq!(reopened.count("chatbot_zero_result_log", "2025-03-07").unwrap(), 2);
}

#[tokio::test]
async fn test_sqlite_rejects_bad_table_names() {
    let tables = AuditTables {
        vote: "votes; DROP".into(),
        ..AuditTables::default()
    };
    assert!(SqliteAuditSink::in_memory(tables).is_err());
}

#[tokio::test]
async fn test_emitter_writes_every_kind() {
    let sink = Arc::new(SqliteAuditSink::in_memory(AuditTables::default()).unwrap());
    let emitter = AuditEmitter::new(sink.clone(), "0.3.0");

    let session = ConversationSession::with_ids("analyst", "s-42");
    let turn = Turn::new("revenue by store", false).with_sql("SELECT 1").with_summary("ANSWER: 1");
    let scope = EventScope::new(&session, &turn);

    emitter.question(&scope, &turn, "").await;
    emitter
        .error(&scope, Some("SELEC 1"), "Syntax error", ErrorKind::SyntaxError, 1, None)
        .await;
    emitter.zero_result(&scope, "SELECT 1 WHERE FALSE", 2).await;

    let vote = Vote {
        turn_id: turn.id(),
        value: VoteValue::Up,
        question: turn.question().to_string(),
        summary: turn.summary().to_string(),
        reason: None,
        voted_at: Utc::now(),
    };
    emitter.vote(&session, &vote).await;

    let today = Utc::now().format("%Y-%m-%d").to_string();
    let tables = AuditTables::default();
    for kind in [
        AuditEventKind::Question,
        AuditEventKind::Error,
        AuditEventKind::ZeroResult,
        AuditEventKind::Vote,
    ] {
        assert_eq!(sink.count(tables.table_for(kind), &today).unwrap(), 1, "{}", kind.as_str());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sinks_accept_concurrent_writes() {
    let dir = TempDir::new().unwrap();
    let jsonl = Arc::new(JsonlAuditSink::new(dir.path().join("jsonl"), AuditTables::default()));
    let sqlite = Arc::new(SqliteAuditSink::open(dir.path().join("audit.db"), AuditTables::default()).unwrap());

    let mut handles = Vec::new();
    for _ in 0..16 {
        let jsonl = Arc::clone(&jsonl);
        let sqlite = Arc::clone(&sqlite);
        handles.push(tokio::spawn(async move {
            jsonl.record(&zero_result_at(9)).await.unwrap();
            sqlite.record(&zero_result_at(9)).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let written = std::fs::read_to_string(
        dir.path().join("jsonl").join("chatbot_zero_result_log").join("2025-03-09.jsonl"),
    )
    .unwrap();
    assert_eq!(written.lines().count(), 16);
    assert!(written.lines().all(|l| serde_json::from_str::<serde_json::Value>(l).is_ok()));
    assert_eq!(sqlite.count("chatbot_zero_result_log", "2025-03-09").unwrap(), 16);
}
