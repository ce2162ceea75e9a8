//! Audit Events
//!
//! Append-only records written for every question, failed attempt,
//! zero-result attempt and vote. Each event is partitioned by the UTC date
//! of its timestamp. Field names follow the warehouse log tables'
//! columns so rows can be streamed into them as-is.

use crate::execution_loop::error_classifier::ErrorKind;
use crate::session::VoteValue;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionEvent {
    #[serde(rename = "event_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub question_id: String,
    pub user_id: String,
    pub session_id: String,
    pub is_follow_up: bool,
    pub previous_question: Option<String>,
    #[serde(rename = "question_text")]
    pub question: String,
    pub generated_sql: String,
    #[serde(rename = "summary_md")]
    pub summary: String,
    #[serde(rename = "context_history")]
    pub context: String,
    #[serde(rename = "rows_returned")]
    pub row_count: u64,
    pub attempt_count: u32,
    pub latency_seconds: u64,
    pub app_version: String,
    #[serde(rename = "extra_metadata")]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(rename = "event_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub question_id: String,
    pub user_id: String,
    pub session_id: String,
    #[serde(rename = "question_text")]
    pub question: String,
    #[serde(rename = "generated_sql")]
    pub sql: Option<String>,
    pub error_message: String,
    pub error_type: ErrorKind,
    #[serde(rename = "attempt_number")]
    pub attempt: u32,
    #[serde(rename = "stack_trace")]
    pub trace: Option<String>,
    pub app_version: String,
    #[serde(rename = "extra_metadata")]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZeroResultEvent {
    #[serde(rename = "event_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub question_id: String,
    pub user_id: String,
    pub session_id: String,
    #[serde(rename = "question_text")]
    pub question: String,
    #[serde(rename = "generated_sql")]
    pub sql: String,
    #[serde(rename = "attempt_number")]
    pub attempt: u32,
    pub app_version: String,
    #[serde(rename = "extra_metadata")]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteEvent {
    #[serde(rename = "event_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub question_id: String,
    pub user_id: String,
    pub session_id: String,
    pub vote: VoteValue,
    #[serde(rename = "question_text")]
    pub question: String,
    #[serde(rename = "summary_md")]
    pub summary: String,
    #[serde(rename = "reason_free_text")]
    pub reason: Option<String>,
    pub app_version: String,
    #[serde(rename = "extra_metadata")]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditEventKind {
    Question,
    Error,
    ZeroResult,
    Vote,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::Question => "question_event",
            AuditEventKind::Error => "error_event",
            AuditEventKind::ZeroResult => "zero_result_event",
            AuditEventKind::Vote => "vote_event",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuditEvent {
    Question(QuestionEvent),
    Error(ErrorEvent),
    ZeroResult(ZeroResultEvent),
    Vote(VoteEvent),
}

impl AuditEvent {
    pub fn kind(&self) -> AuditEventKind {
        match self {
            AuditEvent::Question(_) => AuditEventKind::Question,
            AuditEvent::Error(_) => AuditEventKind::Error,
            AuditEvent::ZeroResult(_) => AuditEventKind::ZeroResult,
            AuditEvent::Vote(_) => AuditEventKind::Vote,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AuditEvent::Question(e) => e.timestamp,
            AuditEvent::Error(e) => e.timestamp,
            AuditEvent::ZeroResult(e) => e.timestamp,
            AuditEvent::Vote(e) => e.timestamp,
        }
    }

    pub fn question_id(&self) -> &str {
        match self {
            AuditEvent::Question(e) => &e.question_id,
            AuditEvent::Error(e) => &e.question_id,
            AuditEvent::ZeroResult(e) => &e.question_id,
            AuditEvent::Vote(e) => &e.question_id,
        }
    }

    /// Partition key
    pub fn event_date(&self) -> NaiveDate {
        self.timestamp().date_naive()
    }

    /// Flat JSON row including the `event_date` partition column
    pub fn to_row(&self) -> serde_json::Result<serde_json::Value> {
        let mut row = serde_json::to_value(self)?;
        if let serde_json::Value::Object(map) = &mut row {
            map.insert(
                "event_date".to_string(),
                serde_json::Value::String(self.event_date().format("%Y-%m-%d").to_string()),
            );
        }
        Ok(row)
    }
}

/// Destination table (or directory) name per event kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditTables {
    pub question: String,
    pub error: String,
    pub zero_result: String,
    pub vote: String,
}

impl Default for AuditTables {
    fn default() -> Self {
        Self {
            question: "chatbot_question_log".to_string(),
            error: "chatbot_error_log".to_string(),
            zero_result: "chatbot_zero_result_log".to_string(),
            vote: "chatbot_vote_feedback".to_string(),
        }
    }
}

impl AuditTables {
    pub fn table_for(&self, kind: AuditEventKind) -> &str {
        match kind {
            AuditEventKind::Question => &self.question,
            AuditEventKind::Error => &self.error,
            AuditEventKind::ZeroResult => &self.zero_result,
            AuditEventKind::Vote => &self.vote,
        }
    }

    pub fn all(&self) -> [&str; 4] {
        [&self.question, &self.error, &self.zero_result, &self.vote]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_row_carries_event_date() {
        let event = AuditEvent::ZeroResult(ZeroResultEvent {
            timestamp: Utc.with_ymd_and_hms(2025, 9, 7, 23, 59, 0).unwrap(),
            question_id: "q1".into(),
            user_id: "u".into(),
            session_id: "s".into(),
            question: "top skus".into(),
            sql: "SELECT 1".into(),
            attempt: 2,
            app_version: "0.3.0".into(),
            metadata: serde_json::json!({}),
        });
        let row = event.to_row().unwrap();
        assert_eq!(row["event_date"], "2025-09-07");
        assert_eq!(row["attempt_number"], 2);
        assert_eq!(row["generated_sql"], "SELECT 1");
        assert_eq!(event.kind().as_str(), "zero_result_event");
        assert_eq!(AuditTables::default().table_for(event.kind()), "chatbot_zero_result_log");
    }
}
