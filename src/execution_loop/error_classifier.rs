//! Error Classifier
//!
//! Maps failure messages onto the tag taxonomy recorded on error events.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error-type tag carried by every error event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsafeSql,
    GenerationFailure,
    Timeout,
    ColumnNotFound,
    TableNotFound,
    SyntaxError,
    PermissionDenied,
    QuotaExceeded,
    SummarizationFailure,
    ExecutionError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnsafeSql => "unsafe_sql",
            ErrorKind::GenerationFailure => "generation_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ColumnNotFound => "column_not_found",
            ErrorKind::TableNotFound => "table_not_found",
            ErrorKind::SyntaxError => "syntax_error",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::SummarizationFailure => "summarization_failure",
            ErrorKind::ExecutionError => "execution_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error classifier for warehouse failure messages
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify an execution failure message
    pub fn classify(&self, message: &str) -> ErrorKind {
        let msg = message.to_lowercase();

        if msg.contains("timeout") || msg.contains("timed out") || msg.contains("deadline exceeded") {
            return ErrorKind::Timeout;
        }

        if msg.contains("unrecognized name")
            || (msg.contains("column") && (msg.contains("not found") || msg.contains("does not exist")))
            || msg.contains("no such column")
        {
            return ErrorKind::ColumnNotFound;
        }

        if (msg.contains("table") && (msg.contains("not found") || msg.contains("does not exist")))
            || msg.contains("no such table")
        {
            return ErrorKind::TableNotFound;
        }

        if msg.contains("syntax error") || msg.contains("parse error") || msg.contains("sql parser error") {
            return ErrorKind::SyntaxError;
        }

        if msg.contains("access denied") || msg.contains("permission") || msg.contains("403") {
            return ErrorKind::PermissionDenied;
        }

        if msg.contains("quota") || msg.contains("bytes billed") || msg.contains("rate limit") {
            return ErrorKind::QuotaExceeded;
        }

        ErrorKind::ExecutionError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_bigquery_messages() {
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier.classify("Unrecognized name: revenue at [3:5]"),
            ErrorKind::ColumnNotFound
        );
        assert_eq!(
            classifier.classify("Not found: Table acme:grocery.fct_sales was not found in location US"),
            ErrorKind::TableNotFound
        );
        assert_eq!(
            classifier.classify("Syntax error: Expected end of input but got keyword FROM"),
            ErrorKind::SyntaxError
        );
        assert_eq!(
            classifier.classify("Query exceeded limit for bytes billed: 1000000000"),
            ErrorKind::QuotaExceeded
        );
        assert_eq!(
            classifier.classify("Access Denied: Project acme: User does not have bigquery.jobs.create permission"),
            ErrorKind::PermissionDenied
        );
        assert_eq!(classifier.classify("Query timeout: execution exceeded 180s"), ErrorKind::Timeout);
        assert_eq!(classifier.classify("division by zero"), ErrorKind::ExecutionError);
    }

    #[test]
    fn test_tag_strings() {
        assert_eq!(ErrorKind::UnsafeSql.to_string(), "unsafe_sql");
        assert_eq!(serde_json::to_string(&ErrorKind::SummarizationFailure).unwrap(), "\"summarization_failure\"");
    }
}
