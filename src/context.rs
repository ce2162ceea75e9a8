//! Context Assembler
//!
//! Builds the conversational part of the SQL-generation prompt: recent
//! history for follow-ups, the current question, the advisory filters and
//! the failure notes gathered by earlier attempts of the same turn.

use crate::session::{History, Turn};
use chrono::NaiveDate;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Number of prior turns carried into a follow-up prompt
pub const HISTORY_WINDOW: usize = 2;

/// Number of rows of a prior result shown in the preview
pub const PREVIEW_ROWS: usize = 5;

pub const CONTEXT_DELIMITER: &str = "---";

pub const DEFAULT_MAX_TRACE_CHARS: usize = 4000;

const FOLLOW_UP_INSTRUCTION: &str = "Please generate SQL to answer this question. \
This is a follow-up question: give weight to the previous questions, answers, SQL and results above, \
and carry forward their filters, time periods and entities unless the current question overrides them.";

const INITIAL_INSTRUCTION: &str = "Please generate SQL to answer this question. \
Treat it as a new question and ignore any earlier conversation.";

const ZERO_RESULT_LABEL: &str = "[PRIOR ZERO-RESULT ATTEMPTS]";
const ERROR_LABEL: &str = "[PRIOR EXECUTION ERRORS]";

const CORRECTIVE_INSTRUCTION: &str = "Revise the SQL: avoid the patterns that failed above, \
relax overly narrow conditions that returned nothing, and do not reference columns or tables \
that are not declared in the schema.";

const TRUNCATION_MARKER: &str = " ... [truncated]";

/// Advisory filters chosen by the user. Only passed into prompts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filters {
    pub store: Option<String>,
    pub department: Option<String>,
    pub channel: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl Filters {
    pub fn is_empty(&self) -> bool {
        self.lines().is_empty()
    }

    /// One `- name: value` line per set filter
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(store) = non_blank(&self.store) {
            lines.push(format!("- store: {}", store));
        }
        if let Some(dept) = non_blank(&self.department) {
            lines.push(format!("- department: {}", dept));
        }
        if let Some(channel) = non_blank(&self.channel) {
            lines.push(format!("- channel: {}", channel));
        }
        if self.date_from.is_some() || self.date_to.is_some() {
            let show = |d: Option<NaiveDate>| {
                d.map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "unspecified".to_string())
            };
            lines.push(format!("- date_range: {} → {}", show(self.date_from), show(self.date_to)));
        }
        lines
    }
}

/// Per-turn record of what went wrong in earlier attempts
#[derive(Debug, Clone)]
pub struct FailureNotes {
    zero_results: Vec<String>,
    errors: Vec<String>,
    max_trace_chars: usize,
}

impl Default for FailureNotes {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRACE_CHARS)
    }
}

impl FailureNotes {
    pub fn new(max_trace_chars: usize) -> Self {
        Self {
            zero_results: Vec::new(),
            errors: Vec::new(),
            max_trace_chars,
        }
    }

    pub fn record_zero_result(&mut self, attempt: u32, sql: &str) {
        let trace = format!("[Attempt {}] {}", attempt, sql);
        self.zero_results.push(self.truncate(trace));
    }

    pub fn record_error(&mut self, attempt: u32, sql: &str, message: &str) {
        let trace = format!("[Attempt {}]\nSQL:\n{}\nError:\n{}", attempt, sql, message);
        self.errors.push(self.truncate(trace));
    }

    pub fn is_empty(&self) -> bool {
        self.zero_results.is_empty() && self.errors.is_empty()
    }

    pub fn zero_results(&self) -> &[String] {
        &self.zero_results
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// All error traces, oldest first, as surfaced in an exhausted-error summary
    pub fn error_trace(&self) -> String {
        self.errors.join("\n\n")
    }

    fn truncate(&self, trace: String) -> String {
        if trace.chars().count() <= self.max_trace_chars {
            return trace;
        }
        let mut cut: String = trace.chars().take(self.max_trace_chars).collect();
        cut.push_str(TRUNCATION_MARKER);
        cut
    }
}

fn render_turn(out: &mut String, turn: &Turn) {
    let _ = writeln!(out, "Previous user query: '{}'", turn.question());
    let _ = writeln!(out, "Assistant's previous answer: '{}'", turn.summary());
    let _ = writeln!(out, "Assistant's previous SQL:\n```sql\n{}\n```", turn.sql());

    if !turn.result().is_empty() {
        out.push_str("Previous results (structured):\n");
        for row in turn.result().head(PREVIEW_ROWS) {
            out.push_str(&row.iter().map(|(col, val)| format!("{}: {}", col, val)).join(", "));
            out.push('\n');
        }
    }
    out.push('\n');
}

/// History section of a follow-up prompt; empty for an initial question or
/// an empty history.
pub fn history_context(is_follow_up: bool, history: &History) -> String {
    let mut out = String::new();
    if !is_follow_up || history.is_empty() {
        return out;
    }
    for turn in history.recent(HISTORY_WINDOW) {
        render_turn(&mut out, turn);
    }
    out.push_str(CONTEXT_DELIMITER);
    out.push('\n');
    out
}

/// Full conversational prompt for one attempt
pub fn build_prompt(
    question: &str,
    is_follow_up: bool,
    history: &History,
    filters: &Filters,
    failure_notes: &FailureNotes,
) -> String {
    let uses_history = is_follow_up && !history.is_empty();
    let mut prompt = history_context(is_follow_up, history);

    let _ = write!(prompt, "The user's CURRENT question: '{}'\n\n", question);
    prompt.push_str(if uses_history {
        FOLLOW_UP_INSTRUCTION
    } else {
        INITIAL_INSTRUCTION
    });

    let filter_lines = filters.lines();
    if !filter_lines.is_empty() {
        prompt.push_str("\n\nFilters selected by the user:\n");
        prompt.push_str(&filter_lines.join("\n"));
    }

    if !failure_notes.is_empty() {
        if !failure_notes.zero_results().is_empty() {
            let _ = write!(prompt, "\n\n{}\n{}", ZERO_RESULT_LABEL, failure_notes.zero_results().join("\n"));
        }
        if !failure_notes.errors().is_empty() {
            let _ = write!(prompt, "\n\n{}\n{}", ERROR_LABEL, failure_notes.error_trace());
        }
        let _ = write!(prompt, "\n\n{}", CORRECTIVE_INSTRUCTION);
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::result::{CellValue, ResultTable};
    use std::sync::Arc;

    fn turn_with_rows(question: &str, rows: usize) -> Arc<Turn> {
        let table = ResultTable::new(
            vec!["sku_name".into(), "revenue".into()],
            (0..rows)
                .map(|i| vec![CellValue::Text(format!("sku{}", i)), CellValue::Int(i as i64)])
                .collect(),
        );
        Arc::new(
            Turn::new(question, false)
                .with_sql(format!("SELECT /* {} */ 1", question))
                .with_summary(format!("answer to {}", question))
                .with_result(table),
        )
    }

    #[test]
    fn test_initial_prompt_has_no_history() {
        let mut history = History::new();
        history.append(turn_with_rows("earlier question", 3));
        let prompt = build_prompt("top skus", false, &history, &Filters::default(), &FailureNotes::default());

        assert!(!prompt.contains("earlier question"));
        assert!(!prompt.contains(CONTEXT_DELIMITER));
        assert!(prompt.contains("The user's CURRENT question: 'top skus'"));
        assert!(prompt.contains(INITIAL_INSTRUCTION));
        assert!(!prompt.contains("Filters selected"));
    }

    #[test]
    fn test_follow_up_uses_last_two_turns() {
        let mut history = History::new();
        for i in 1..=5 {
            history.append(turn_with_rows(&format!("question {}", i), 1));
        }
        let prompt = build_prompt("and by store?", true, &history, &Filters::default(), &FailureNotes::default());

        assert_eq!(prompt.matches("Previous user query:").count(), 2);
        assert!(prompt.contains("question 4"));
        assert!(prompt.contains("question 5"));
        assert!(!prompt.contains("question 3"));
        assert!(prompt.contains(FOLLOW_UP_INSTRUCTION));
    }

    #[test]
    fn test_preview_capped_at_five_rows() {
        let mut history = History::new();
        history.append(turn_with_rows("big result", 8));
        let prompt = build_prompt("drill in", true, &history, &Filters::default(), &FailureNotes::default());

        assert_eq!(prompt.matches("sku_name: sku").count(), 5);
        assert!(prompt.contains("sku_name: sku0, revenue: 0\n"));
        assert!(!prompt.contains("sku5"));
    }

    #[test]
    fn test_empty_prior_result_has_no_preview() {
        let mut history = History::new();
        history.append(turn_with_rows("nothing found", 0));
        let prompt = build_prompt("try again", true, &history, &Filters::default(), &FailureNotes::default());
        assert!(!prompt.contains("Previous results (structured)"));
    }

    #[test]
    fn test_filter_lines() {
        let filters = Filters {
            store: Some("Store 12".into()),
            department: Some("  ".into()),
            channel: None,
            date_from: NaiveDate::from_ymd_opt(2025, 9, 1),
            date_to: None,
        };
        assert_eq!(
            filters.lines(),
            vec!["- store: Store 12".to_string(), "- date_range: 2025-09-01 → unspecified".to_string()]
        );
        let prompt = build_prompt("q", false, &History::new(), &filters, &FailureNotes::default());
        assert!(prompt.contains("- store: Store 12\n- date_range: 2025-09-01 → unspecified"));
    }

    #[test]
    fn test_failure_notes_sections() {
        let mut notes = FailureNotes::default();
        notes.record_zero_result(1, "SELECT a FROM t WHERE x = 'none'");
        notes.record_error(2, "SELECT b FROM t", "Unrecognized name: b");
        let prompt = build_prompt("q", false, &History::new(), &Filters::default(), &notes);

        assert!(prompt.contains("[PRIOR ZERO-RESULT ATTEMPTS]\n[Attempt 1] SELECT a FROM t WHERE x = 'none'"));
        assert!(prompt.contains("[PRIOR EXECUTION ERRORS]\n[Attempt 2]\nSQL:\nSELECT b FROM t\nError:\nUnrecognized name: b"));
        assert!(prompt.ends_with(CORRECTIVE_INSTRUCTION));
    }

    #[test]
    fn test_trace_truncation() {
        let mut notes = FailureNotes::new(20);
        notes.record_error(1, "SELECT 1", &"x".repeat(100));
        assert_eq!(notes.errors()[0].chars().count(), 20 + TRUNCATION_MARKER.len());
    }
}
