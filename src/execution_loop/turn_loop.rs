//! Turn Loop
//!
//! Bounded retry loop for one question. Each attempt assembles the prompt
//! with every failure note gathered so far, generates SQL, runs it through
//! the query guards and the execution adapter, and classifies the outcome.
//! Unsafe SQL ends the turn immediately; empty results and errors are
//! retried until the attempt budget runs out.

use crate::context::{build_prompt, history_context, FailureNotes, Filters, DEFAULT_MAX_TRACE_CHARS, HISTORY_WINDOW};
use crate::error::Result;
use crate::execution::adapter::ExecutionAdapter;
use crate::execution::result::{ResultTable, TabularResult};
use crate::execution_loop::error_classifier::{ErrorClassifier, ErrorKind};
use crate::gateway::SqlGateway;
use crate::observability::logger::{AuditEmitter, EventScope};
use crate::security::QueryGuards;
use crate::session::{ConversationSession, Turn, TurnStatus, Vote, VoteValue};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Placeholder SQL recorded in traces when generation itself failed
pub const NO_SQL_GENERATED: &str = "<no SQL generated>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub max_attempts: u32,
    pub max_trace_chars: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_trace_chars: DEFAULT_MAX_TRACE_CHARS,
        }
    }
}

/// One user question as it arrives from the display surface
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub question: String,
    pub is_follow_up: bool,
    pub filters: Filters,
}

impl TurnRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }

    pub fn follow_up(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            is_follow_up: true,
            ..Self::default()
        }
    }

    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success { rows: usize },
    Empty,
    ExecutionError { message: String },
    BlockedUnsafe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based, restarts every turn
    pub index: u32,
    pub prompt: String,
    pub sql: String,
    pub outcome: AttemptOutcome,
}

/// Finalized turn plus the trail of attempts that produced it
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub turn: Arc<Turn>,
    pub status: TurnStatus,
    pub attempts: Vec<Attempt>,
    /// Flattened conversational context recorded on the question event
    pub context: String,
}

pub fn blocked_summary(question: &str) -> String {
    format!(
        "🚫 **Query blocked for safety**\n\n**Your question:** {}\n\n**Reason:** Unsafe SQL detected.",
        question
    )
}

pub fn exhausted_empty_summary(question: &str, attempts: u32) -> String {
    format!(
        "### ⚠️ No results found for your question after {} attempts:\n> **{}**\n\n\
         Try:\n- Relaxing filters like store, department, channel, or date range\n",
        attempts, question
    )
}

pub fn exhausted_error_summary(question: &str, attempts: u32, trace: &str) -> String {
    format!(
        "❌ **Query failed after {} attempts.**\n\n**Your question:** {}\n\n**Error details:**\n{}",
        attempts, question, trace
    )
}

fn summary_fallback(rows: usize) -> String {
    format!(
        "ANSWER: The query returned {} row(s); see the table below.\n\n\
         LOGIC USED: A narrative summary could not be generated for this result.",
        rows
    )
}

/// Terminal data gathered by the loop before the turn is frozen
struct Finish {
    status: TurnStatus,
    attempt_count: u32,
    sql: String,
    summary: String,
    result: ResultTable,
}

pub struct TurnOrchestrator {
    gateway: Arc<dyn SqlGateway>,
    executor: ExecutionAdapter,
    guards: QueryGuards,
    classifier: ErrorClassifier,
    audit: Option<AuditEmitter>,
    config: OrchestratorConfig,
}

impl TurnOrchestrator {
    pub fn new(gateway: Arc<dyn SqlGateway>, executor: ExecutionAdapter) -> Self {
        Self {
            gateway,
            executor,
            guards: QueryGuards::new(),
            classifier: ErrorClassifier::new(),
            audit: None,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_audit(mut self, audit: AuditEmitter) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = OrchestratorConfig {
            max_attempts: config.max_attempts.max(1),
            ..config
        };
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    async fn audit_error(
        &self,
        scope: &EventScope,
        sql: Option<&str>,
        message: &str,
        kind: ErrorKind,
        attempt: u32,
        trace: Option<String>,
    ) {
        if let Some(audit) = &self.audit {
            audit.error(scope, sql, message, kind, attempt, trace).await;
        }
    }

    /// Runs one question to a finalized turn and appends it to the session's
    /// history. Per-attempt failures never escape; they shape the outcome.
    pub async fn run_turn(
        &self,
        mut session: ConversationSession,
        request: TurnRequest,
    ) -> (ConversationSession, TurnOutcome) {
        let start = Instant::now();
        let TurnRequest {
            question,
            is_follow_up,
            filters,
        } = request;

        let previous_question = if is_follow_up {
            session.last_turn().map(|t| t.question().to_string())
        } else {
            None
        };
        let draft = Turn::new(question.clone(), is_follow_up).with_previous_question(previous_question);
        let scope = EventScope::new(&session, &draft);
        let context = history_context(is_follow_up, session.history());

        let mut notes = FailureNotes::new(self.config.max_trace_chars);
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut schemas: Option<Vec<String>> = None;
        let mut finish: Option<Finish> = None;
        let mut last_sql = String::new();

        for n in 1..=self.config.max_attempts {
            info!("Turn {} attempt {} of {}", scope.question_id, n, self.config.max_attempts);
            let prompt = build_prompt(&question, is_follow_up, session.history(), &filters, &notes);

            let generated = self.generate(&question, &prompt, &mut schemas).await;
            let sql = match generated {
                Ok(sql) => sql,
                Err(e) => {
                    let message = e.to_string();
                    warn!("SQL generation failed on attempt {}: {}", n, message);
                    notes.record_error(n, NO_SQL_GENERATED, &message);
                    let trace = notes.errors().last().cloned();
                    self.audit_error(&scope, None, &message, ErrorKind::GenerationFailure, n, trace)
                        .await;
                    attempts.push(Attempt {
                        index: n,
                        prompt,
                        sql: String::new(),
                        outcome: AttemptOutcome::ExecutionError { message },
                    });
                    continue;
                }
            };
            last_sql = sql.clone();

            if !self.guards.is_safe(&sql) {
                warn!("Blocked unsafe SQL on attempt {}", n);
                self.audit_error(
                    &scope,
                    Some(&sql),
                    "Unsafe SQL detected",
                    ErrorKind::UnsafeSql,
                    n,
                    None,
                )
                .await;
                attempts.push(Attempt {
                    index: n,
                    prompt,
                    sql,
                    outcome: AttemptOutcome::BlockedUnsafe,
                });
                finish = Some(Finish {
                    status: TurnStatus::BlockedUnsafe,
                    attempt_count: n,
                    sql: String::new(),
                    summary: blocked_summary(&question),
                    result: ResultTable::empty(),
                });
                break;
            }

            match self.executor.execute(&sql).await {
                TabularResult::Success(table) if !table.is_empty() => {
                    let rows = table.row_count();
                    info!("✅ Attempt {} returned {} rows", n, rows);
                    let summary = self
                        .summarize(&scope, &table, &question, is_follow_up, &session, &sql, n)
                        .await;
                    attempts.push(Attempt {
                        index: n,
                        prompt,
                        sql: sql.clone(),
                        outcome: AttemptOutcome::Success { rows },
                    });
                    finish = Some(Finish {
                        status: TurnStatus::Succeeded,
                        attempt_count: n,
                        sql,
                        summary,
                        result: table,
                    });
                    break;
                }
                TabularResult::Success(_) => {
                    info!("Attempt {} returned no rows", n);
                    notes.record_zero_result(n, &sql);
                    if let Some(audit) = &self.audit {
                        audit.zero_result(&scope, &sql, n).await;
                    }
                    attempts.push(Attempt {
                        index: n,
                        prompt,
                        sql,
                        outcome: AttemptOutcome::Empty,
                    });
                }
                TabularResult::Failure { message } => {
                    notes.record_error(n, &sql, &message);
                    let trace = notes.errors().last().cloned();
                    let kind = self.classifier.classify(&message);
                    self.audit_error(&scope, Some(&sql), &message, kind, n, trace).await;
                    attempts.push(Attempt {
                        index: n,
                        prompt,
                        sql,
                        outcome: AttemptOutcome::ExecutionError { message },
                    });
                }
            }
        }

        let finish = finish.unwrap_or_else(|| {
            let attempt_count = attempts.len() as u32;
            match attempts.last().map(|a| &a.outcome) {
                Some(AttemptOutcome::Empty) => Finish {
                    status: TurnStatus::ExhaustedEmpty,
                    attempt_count,
                    sql: last_sql.clone(),
                    summary: exhausted_empty_summary(&question, attempt_count),
                    result: ResultTable::empty(),
                },
                _ => Finish {
                    status: TurnStatus::ExhaustedError,
                    attempt_count,
                    sql: last_sql.clone(),
                    summary: exhausted_error_summary(&question, attempt_count, &notes.error_trace()),
                    result: ResultTable::empty(),
                },
            }
        });

        let turn = Arc::new(
            draft
                .with_sql(finish.sql)
                .with_summary(finish.summary)
                .with_result(finish.result)
                .with_attempts(finish.attempt_count)
                .with_status(finish.status)
                .with_duration(start.elapsed()),
        );
        info!(
            "Turn {} finished as {} after {} attempt(s) in {:.1}s",
            turn.id(),
            finish.status,
            finish.attempt_count,
            turn.duration().as_secs_f64()
        );

        if finish.status != TurnStatus::BlockedUnsafe {
            if let Some(audit) = &self.audit {
                audit.question(&scope, &turn, &context).await;
            }
        }
        session.push_turn(Arc::clone(&turn));

        let outcome = TurnOutcome {
            turn,
            status: finish.status,
            attempts,
            context,
        };
        (session, outcome)
    }

    /// Schema selection runs once per turn; a failed selection or generation
    /// both cost the current attempt.
    async fn generate(
        &self,
        question: &str,
        prompt: &str,
        schemas: &mut Option<Vec<String>>,
    ) -> Result<String> {
        if schemas.is_none() {
            *schemas = Some(self.gateway.choose_relevant_schemas(question).await?);
        }
        let ids = schemas.as_deref().unwrap_or_default();
        self.gateway.generate_sql(prompt, ids).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn summarize(
        &self,
        scope: &EventScope,
        table: &ResultTable,
        question: &str,
        is_follow_up: bool,
        session: &ConversationSession,
        sql: &str,
        attempt: u32,
    ) -> String {
        let history: &[Arc<Turn>] = if is_follow_up {
            session.history().recent(HISTORY_WINDOW)
        } else {
            &[]
        };
        match self.gateway.summarize(table, question, history, sql).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!("Summarization failed: {}", e);
                self.audit_error(
                    scope,
                    Some(sql),
                    &e.to_string(),
                    ErrorKind::SummarizationFailure,
                    attempt,
                    None,
                )
                .await;
                summary_fallback(table.row_count())
            }
        }
    }

    /// Records a vote on a finalized turn and writes the vote event
    pub async fn record_vote(
        &self,
        session: &mut ConversationSession,
        turn_id: Uuid,
        value: VoteValue,
        reason: Option<String>,
    ) -> Result<Vote> {
        let vote = session.record_vote(turn_id, value, reason)?;
        if let Some(audit) = &self.audit {
            audit.vote(session, &vote).await;
        }
        Ok(vote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summaries() {
        assert!(blocked_summary("drop it").contains("blocked for safety"));
        assert!(exhausted_empty_summary("q", 5).contains("after 5 attempts"));
        let s = exhausted_error_summary("q", 5, "[Attempt 1]\nSQL:\nSELECT 1\nError:\nboom");
        assert!(s.ends_with("Error:\nboom"));
    }
}
