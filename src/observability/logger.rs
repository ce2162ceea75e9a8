//! Audit Logger
//!
//! `AuditSink` is the logging collaborator; `AuditEmitter` builds events from
//! turn state and forwards them. Sink failures are logged and dropped so an
//! audit outage never changes what the user sees.

use crate::error::{ChatError, Result};
use crate::execution_loop::error_classifier::ErrorKind;
use crate::observability::events::{
    AuditEvent, AuditTables, ErrorEvent, QuestionEvent, VoteEvent, ZeroResultEvent,
};
use crate::session::{ConversationSession, Turn, Vote};
use async_trait::async_trait;
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

#[async_trait]
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// JSON-lines files at `<dir>/<table>/<YYYY-MM-DD>.jsonl`
pub struct JsonlAuditSink {
    dir: PathBuf,
    tables: AuditTables,
    write_lock: Arc<Mutex<()>>,
}

impl JsonlAuditSink {
    pub fn new(dir: PathBuf, tables: AuditTables) -> Self {
        Self {
            dir,
            tables,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path_for(&self, event: &AuditEvent) -> PathBuf {
        self.dir
            .join(self.tables.table_for(event.kind()))
            .join(format!("{}.jsonl", event.event_date().format("%Y-%m-%d")))
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn record(&self, event: &AuditEvent) -> Result<()> {
        let path = self.path_for(event);
        let line = serde_json::to_string(&event.to_row()?)?;
        let write_lock = Arc::clone(&self.write_lock);
        tokio::task::spawn_blocking(move || append_line(&write_lock, &path, &line))
            .await
            .map_err(|e| ChatError::Audit(format!("JSONL writer failed: {}", e)))?
    }
}

fn append_line(write_lock: &Mutex<()>, path: &Path, line: &str) -> Result<()> {
    let _guard = write_lock
        .lock()
        .map_err(|_| ChatError::Audit("JSONL sink lock poisoned".to_string()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Keeps events in memory; used by tests and dry runs
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn record(&self, event: &AuditEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| ChatError::Audit("memory sink lock poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }
}

pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn record(&self, _event: &AuditEvent) -> Result<()> {
        Ok(())
    }
}

/// Identifies the turn an event belongs to
#[derive(Debug, Clone)]
pub struct EventScope {
    pub question_id: String,
    pub user_id: String,
    pub session_id: String,
    pub question: String,
}

impl EventScope {
    pub fn new(session: &ConversationSession, turn: &Turn) -> Self {
        Self {
            question_id: turn.id().to_string(),
            user_id: session.user_id().to_string(),
            session_id: session.session_id().to_string(),
            question: turn.question().to_string(),
        }
    }
}

#[derive(Clone)]
pub struct AuditEmitter {
    sink: Arc<dyn AuditSink>,
    app_version: String,
    metadata: serde_json::Value,
}

impl AuditEmitter {
    pub fn new(sink: Arc<dyn AuditSink>, app_version: impl Into<String>) -> Self {
        Self {
            sink,
            app_version: app_version.into(),
            metadata: serde_json::json!({}),
        }
    }

    /// Static metadata merged into every event (environment, engine, ...)
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    fn metadata_with(&self, extra: serde_json::Value) -> serde_json::Value {
        let mut merged = self.metadata.clone();
        if let (serde_json::Value::Object(base), serde_json::Value::Object(extra)) = (&mut merged, extra) {
            base.extend(extra);
        }
        merged
    }

    pub async fn emit(&self, event: AuditEvent) {
        let kind = event.kind().as_str();
        match self.sink.record(&event).await {
            Ok(()) => debug!("Recorded {} for {} via {}", kind, event.question_id(), self.sink.name()),
            Err(e) => warn!("Audit sink {} failed to record {}: {}", self.sink.name(), kind, e),
        }
    }

    pub async fn question(&self, scope: &EventScope, turn: &Turn, context: &str) {
        self.emit(AuditEvent::Question(QuestionEvent {
            timestamp: Utc::now(),
            question_id: scope.question_id.clone(),
            user_id: scope.user_id.clone(),
            session_id: scope.session_id.clone(),
            is_follow_up: turn.is_follow_up(),
            previous_question: turn.previous_question().map(str::to_string),
            question: scope.question.clone(),
            generated_sql: turn.sql().to_string(),
            summary: turn.summary().to_string(),
            context: context.to_string(),
            row_count: turn.result().row_count() as u64,
            attempt_count: turn.attempt_count(),
            latency_seconds: turn.duration().as_secs(),
            app_version: self.app_version.clone(),
            metadata: self.metadata_with(serde_json::json!({ "status": turn.status().to_string() })),
        }))
        .await
    }

    pub async fn error(
        &self,
        scope: &EventScope,
        sql: Option<&str>,
        message: &str,
        kind: ErrorKind,
        attempt: u32,
        trace: Option<String>,
    ) {
        self.emit(AuditEvent::Error(ErrorEvent {
            timestamp: Utc::now(),
            question_id: scope.question_id.clone(),
            user_id: scope.user_id.clone(),
            session_id: scope.session_id.clone(),
            question: scope.question.clone(),
            sql: sql.map(str::to_string),
            error_message: message.to_string(),
            error_type: kind,
            attempt,
            trace,
            app_version: self.app_version.clone(),
            metadata: self.metadata.clone(),
        }))
        .await
    }

    pub async fn zero_result(&self, scope: &EventScope, sql: &str, attempt: u32) {
        self.emit(AuditEvent::ZeroResult(ZeroResultEvent {
            timestamp: Utc::now(),
            question_id: scope.question_id.clone(),
            user_id: scope.user_id.clone(),
            session_id: scope.session_id.clone(),
            question: scope.question.clone(),
            sql: sql.to_string(),
            attempt,
            app_version: self.app_version.clone(),
            metadata: self.metadata.clone(),
        }))
        .await
    }

    pub async fn vote(&self, session: &ConversationSession, vote: &Vote) {
        self.emit(AuditEvent::Vote(VoteEvent {
            timestamp: vote.voted_at,
            question_id: vote.turn_id.to_string(),
            user_id: session.user_id().to_string(),
            session_id: session.session_id().to_string(),
            vote: vote.value,
            question: vote.question.clone(),
            summary: vote.summary.clone(),
            reason: vote.reason.clone(),
            app_version: self.app_version.clone(),
            metadata: self.metadata.clone(),
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn record(&self, _event: &AuditEvent) -> Result<()> {
            Err(ChatError::Audit("insert rejected".into()))
        }
    }

    fn scope() -> EventScope {
        EventScope {
            question_id: "q1".into(),
            user_id: "u1".into(),
            session_id: "s1".into(),
            question: "top skus".into(),
        }
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        let emitter = AuditEmitter::new(Arc::new(FailingSink), "0.3.0");
        emitter.zero_result(&scope(), "SELECT 1", 1).await;
    }

    #[tokio::test]
    async fn test_metadata_is_merged() {
        let sink = Arc::new(MemoryAuditSink::new());
        let emitter = AuditEmitter::new(sink.clone(), "0.3.0")
            .with_metadata(serde_json::json!({ "engine": "polars" }));
        let turn = Turn::new("top skus", false);
        emitter.question(&scope(), &turn, "").await;

        let events = sink.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            AuditEvent::Question(e) => {
                assert_eq!(e.metadata["engine"], "polars");
                assert!(e.metadata.get("status").is_some());
                assert_eq!(e.app_version, "0.3.0");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
