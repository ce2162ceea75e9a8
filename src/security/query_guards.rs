//! Query Guards
//!
//! Classifies candidate SQL as safe (a single read-only query) or unsafe.
//! Comments and quoted literals are blanked out first so keywords inside
//! them neither trigger nor hide a match. Anything the guard cannot read
//! with confidence is rejected.

use lazy_static::lazy_static;
use regex::Regex;
use sqlparser::ast::Statement;
use sqlparser::dialect::BigQueryDialect;
use sqlparser::parser::Parser;
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, warn};

lazy_static! {
    static ref WORD: Regex = Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap();
}

/// Keywords that mutate data or schema, or drive procedural execution.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "MERGE", "CREATE", "GRANT",
    "REVOKE", "EXECUTE", "EXEC", "IMMEDIATE", "CALL", "DECLARE", "SET", "BEGIN", "COMMIT",
    "ROLLBACK", "TRANSACTION", "LOOP", "WHILE", "RAISE", "EXPORT", "LOAD", "RENAME", "UNDROP",
];

/// Why a statement was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsafeReason {
    Empty,
    UnterminatedLiteral,
    ForbiddenKeyword(String),
    MultipleStatements(usize),
    NotAQuery,
}

impl fmt::Display for UnsafeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsafeReason::Empty => write!(f, "empty statement"),
            UnsafeReason::UnterminatedLiteral => write!(f, "unterminated comment or quoted literal"),
            UnsafeReason::ForbiddenKeyword(k) => write!(f, "forbidden keyword {}", k),
            UnsafeReason::MultipleStatements(n) => write!(f, "{} statements in one request", n),
            UnsafeReason::NotAQuery => write!(f, "statement is not a read-only query"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Safe,
    Unsafe(UnsafeReason),
}

impl SafetyVerdict {
    pub fn is_safe(&self) -> bool {
        matches!(self, SafetyVerdict::Safe)
    }
}

/// Read-only query guard
#[derive(Debug, Clone)]
pub struct QueryGuards {
    forbidden: HashSet<&'static str>,
}

impl Default for QueryGuards {
    fn default() -> Self {
        Self {
            forbidden: FORBIDDEN_KEYWORDS.iter().copied().collect(),
        }
    }
}

impl QueryGuards {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, sql: &str) -> SafetyVerdict {
        let stripped = match strip_comments_and_literals(sql) {
            Some(s) => s,
            None => return SafetyVerdict::Unsafe(UnsafeReason::UnterminatedLiteral),
        };

        let statements: Vec<&str> = stripped
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        match statements.len() {
            0 => return SafetyVerdict::Unsafe(UnsafeReason::Empty),
            1 => {}
            n => return SafetyVerdict::Unsafe(UnsafeReason::MultipleStatements(n)),
        }

        for word in WORD.find_iter(&stripped) {
            let upper = word.as_str().to_ascii_uppercase();
            if self.forbidden.contains(upper.as_str()) {
                return SafetyVerdict::Unsafe(UnsafeReason::ForbiddenKeyword(upper));
            }
        }

        let body = statements[0];
        let leads_with_query = body.starts_with('(')
            || WORD
                .find(body)
                .filter(|m| m.start() == 0)
                .map(|m| matches!(m.as_str().to_ascii_uppercase().as_str(), "SELECT" | "WITH"))
                .unwrap_or(false);
        if !leads_with_query {
            return SafetyVerdict::Unsafe(UnsafeReason::NotAQuery);
        }

        // The keyword scan already passed; a parse failure alone does not reject.
        match Parser::parse_sql(&BigQueryDialect {}, sql) {
            Ok(parsed) => {
                if parsed.iter().any(|stmt| !matches!(stmt, Statement::Query(_))) {
                    return SafetyVerdict::Unsafe(UnsafeReason::NotAQuery);
                }
            }
            Err(e) => debug!("Query guard could not parse statement, keeping keyword verdict: {}", e),
        }

        SafetyVerdict::Safe
    }

    pub fn is_safe(&self, sql: &str) -> bool {
        let verdict = self.check(sql);
        if let SafetyVerdict::Unsafe(reason) = &verdict {
            warn!("Rejected SQL ({}): {}", reason, sql);
        }
        verdict.is_safe()
    }
}

/// Convenience wrapper over a default guard
pub fn is_safe(sql: &str) -> bool {
    QueryGuards::default().is_safe(sql)
}

/// Blanks out comments and quoted literals. `None` when one is unterminated.
fn strip_comments_and_literals(sql: &str) -> Option<String> {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '-' if chars.peek() == Some(&'-') => {
                skip_line(&mut chars);
                out.push(' ');
            }
            '#' => {
                skip_line(&mut chars);
                out.push(' ');
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    if c == '*' && chars.peek() == Some(&'/') {
                        chars.next();
                        closed = true;
                        break;
                    }
                }
                if !closed {
                    return None;
                }
                out.push(' ');
            }
            '\'' | '"' | '`' => {
                let quote = c;
                let mut closed = false;
                while let Some(c) = chars.next() {
                    if c == '\\' {
                        chars.next();
                    } else if c == quote {
                        if chars.peek() == Some(&quote) {
                            chars.next();
                        } else {
                            closed = true;
                            break;
                        }
                    }
                }
                if !closed {
                    return None;
                }
                // keep a placeholder so `FROM \`t\`` still reads as an identifier
                out.push_str(" x ");
            }
            other => out.push(other),
        }
    }

    Some(out)
}

fn skip_line(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    for c in chars.by_ref() {
        if c == '\n' {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutating_statements_rejected() {
        for sql in [
            "INSERT INTO t VALUES (1)",
            "update t set a = 1",
            "DELETE FROM t WHERE 1=1",
            "DROP TABLE x",
            "ALTER TABLE t ADD COLUMN c INT64",
            "TRUNCATE TABLE t",
            "MERGE t USING s ON t.id = s.id WHEN MATCHED THEN DELETE",
            "CREATE TABLE t AS SELECT 1",
        ] {
            assert!(!is_safe(sql), "expected unsafe: {}", sql);
        }
    }

    #[test]
    fn test_read_only_queries_accepted() {
        for sql in [
            "SELECT 1",
            "select sku_name, sum(net_amount) as revenue from `p.grocery.fct_store_sales` group by 1 order by 2 desc limit 10;",
            "WITH w AS (SELECT store_id, SUM(qty) q FROM fct_store_sales GROUP BY store_id) SELECT * FROM w",
            "SELECT store_id, RANK() OVER (PARTITION BY region ORDER BY revenue DESC) AS rnk FROM (SELECT * FROM s)",
            "(SELECT 1) UNION ALL (SELECT 2)",
            "SELECT created_at, updated_by FROM t",
            "SELECT REPLACE(sku_name, 'a', 'b') FROM t",
        ] {
            assert!(is_safe(sql), "expected safe: {}", sql);
        }
    }

    #[test]
    fn test_keywords_inside_literals_and_comments() {
        assert!(is_safe("SELECT 'drop table x' AS note"));
        assert!(is_safe("SELECT 1 -- delete everything\n"));
        assert!(!is_safe("SELECT 1 /* unterminated"));
        assert!(!is_safe("SELECT 'unterminated"));
    }

    #[test]
    fn test_multiple_statements_rejected() {
        let guards = QueryGuards::new();
        assert_eq!(
            guards.check("SELECT 1; SELECT 2"),
            SafetyVerdict::Unsafe(UnsafeReason::MultipleStatements(2))
        );
        assert!(!is_safe("SELECT 1; DROP TABLE x"));
    }

    #[test]
    fn test_non_query_and_empty_rejected() {
        let guards = QueryGuards::new();
        assert_eq!(guards.check("   "), SafetyVerdict::Unsafe(UnsafeReason::Empty));
        assert_eq!(guards.check("SHOW TABLES"), SafetyVerdict::Unsafe(UnsafeReason::NotAQuery));
        assert_eq!(
            guards.check("EXECUTE IMMEDIATE 'SELECT 1'"),
            SafetyVerdict::Unsafe(UnsafeReason::ForbiddenKeyword("EXECUTE".into()))
        );
    }
}
