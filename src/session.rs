//! Conversation Session
//!
//! Conversation-scoped state: the append-only history of finalized turns and
//! the votes cast on them. The caller owns the session value and threads it
//! through each turn; nothing here is shared between conversations.

use crate::error::{ChatError, Result};
use crate::execution::result::ResultTable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Terminal state of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Succeeded,
    BlockedUnsafe,
    ExhaustedEmpty,
    ExhaustedError,
}

impl fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnStatus::Succeeded => write!(f, "succeeded"),
            TurnStatus::BlockedUnsafe => write!(f, "blocked_unsafe"),
            TurnStatus::ExhaustedEmpty => write!(f, "exhausted_empty"),
            TurnStatus::ExhaustedError => write!(f, "exhausted_error"),
        }
    }
}

/// One question/answer exchange. Built up by the orchestrator and frozen
/// once it lands in the history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    id: Uuid,
    question: String,
    is_follow_up: bool,
    previous_question: Option<String>,
    sql: String,
    summary: String,
    result: ResultTable,
    attempt_count: u32,
    duration: Duration,
    status: TurnStatus,
    asked_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(question: impl Into<String>, is_follow_up: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            question: question.into(),
            is_follow_up,
            previous_question: None,
            sql: String::new(),
            summary: String::new(),
            result: ResultTable::empty(),
            attempt_count: 0,
            duration: Duration::ZERO,
            status: TurnStatus::ExhaustedError,
            asked_at: Utc::now(),
        }
    }

    pub fn with_previous_question(mut self, previous: Option<String>) -> Self {
        self.previous_question = previous;
        self
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = sql.into();
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_result(mut self, result: ResultTable) -> Self {
        self.result = result;
        self
    }

    pub fn with_attempts(mut self, attempt_count: u32) -> Self {
        self.attempt_count = attempt_count;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_status(mut self, status: TurnStatus) -> Self {
        self.status = status;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn is_follow_up(&self) -> bool {
        self.is_follow_up
    }

    pub fn previous_question(&self) -> Option<&str> {
        self.previous_question.as_deref()
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn result(&self) -> &ResultTable {
        &self.result
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn status(&self) -> TurnStatus {
        self.status
    }

    pub fn asked_at(&self) -> DateTime<Utc> {
        self.asked_at
    }
}

/// Append-only sequence of finalized turns, oldest first
#[derive(Debug, Clone, Default)]
pub struct History {
    turns: Vec<Arc<Turn>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Turn>> {
        self.turns.iter()
    }

    pub fn last(&self) -> Option<&Arc<Turn>> {
        self.turns.last()
    }

    /// The most recent `k` turns (fewer when the history is shorter), oldest first
    pub fn recent(&self, k: usize) -> &[Arc<Turn>] {
        let start = self.turns.len().saturating_sub(k);
        &self.turns[start..]
    }

    pub fn find(&self, turn_id: Uuid) -> Option<&Arc<Turn>> {
        self.turns.iter().find(|t| t.id() == turn_id)
    }

    pub(crate) fn append(&mut self, turn: Arc<Turn>) {
        self.turns.push(turn);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VoteValue {
    Up,
    Down,
}

impl fmt::Display for VoteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteValue::Up => write!(f, "UP"),
            VoteValue::Down => write!(f, "DOWN"),
        }
    }
}

/// Feedback on a finalized turn; question and summary are copied in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub turn_id: Uuid,
    pub value: VoteValue,
    pub question: String,
    pub summary: String,
    pub reason: Option<String>,
    pub voted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ConversationSession {
    session_id: String,
    user_id: String,
    history: History,
    votes: Vec<Vote>,
}

impl ConversationSession {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self::with_ids(user_id, Uuid::new_v4().to_string())
    }

    pub fn with_ids(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            history: History::new(),
            votes: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn votes(&self) -> &[Vote] {
        &self.votes
    }

    pub fn last_turn(&self) -> Option<&Arc<Turn>> {
        self.history.last()
    }

    pub(crate) fn push_turn(&mut self, turn: Arc<Turn>) {
        self.history.append(turn);
    }

    /// Record a vote on a finalized turn of this conversation
    pub fn record_vote(
        &mut self,
        turn_id: Uuid,
        value: VoteValue,
        reason: Option<String>,
    ) -> Result<Vote> {
        let turn = self
            .history
            .find(turn_id)
            .ok_or_else(|| ChatError::Session(format!("Unknown turn {} in session {}", turn_id, self.session_id)))?;

        let vote = Vote {
            turn_id,
            value,
            question: turn.question().to_string(),
            summary: turn.summary().to_string(),
            reason: reason.filter(|r| !r.trim().is_empty()),
            voted_at: Utc::now(),
        };
        self.votes.push(vote.clone());
        Ok(vote)
    }
}
