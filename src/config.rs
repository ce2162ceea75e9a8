//! Application configuration, read from environment variables
//! (after `.env` is loaded by the binary).

use crate::error::{ChatError, Result};
use crate::execution::engine::ExecutionContext;
use crate::execution_loop::turn_loop::OrchestratorConfig;
use crate::llm::DEFAULT_BASE_URL;
use crate::observability::events::{AuditEventKind, AuditTables};
use crate::prompts::qualified_table_name;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Local,
    Prod,
}

impl fmt::Display for AppEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppEnv::Local => write!(f, "local"),
            AppEnv::Prod => write!(f, "prod"),
        }
    }
}

impl FromStr for AppEnv {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(AppEnv::Local),
            "prod" => Ok(AppEnv::Prod),
            other => Err(ChatError::Config(format!("APP_ENV must be local or prod, got {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditSinkKind {
    BigQuery,
    Jsonl,
    Sqlite,
    None,
}

impl FromStr for AuditSinkKind {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "bigquery" => Ok(AuditSinkKind::BigQuery),
            "jsonl" => Ok(AuditSinkKind::Jsonl),
            "sqlite" => Ok(AuditSinkKind::Sqlite),
            "none" => Ok(AuditSinkKind::None),
            other => Err(ChatError::Config(format!(
                "AUDIT_SINK must be one of bigquery, jsonl, sqlite, none; got {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_env: AppEnv,
    pub app_version: String,
    pub gcp_project: Option<String>,
    pub bq_dataset: String,
    pub bq_log_dataset: String,
    pub audit_tables: AuditTables,
    pub bigquery_access_token: Option<String>,
    pub query_timeout: Duration,
    pub max_bytes_billed: Option<u64>,
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_summary_model: String,
    pub openai_base_url: String,
    pub max_attempts: u32,
    pub max_trace_chars: usize,
    pub audit_sink: AuditSinkKind,
    pub audit_path: PathBuf,
}

fn parse_number<T: FromStr>(name: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse::<T>()
            .map_err(|_| ChatError::Config(format!("{} must be a number, got {:?}", name, v))),
    }
}

/// Where the analytical tables live. Resolving it needs no credentials, so
/// commands that only describe the catalog can run without a full config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseLocation {
    pub gcp_project: Option<String>,
    pub bq_dataset: String,
}

impl WarehouseLocation {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            gcp_project: non_empty(&lookup, "GOOGLE_CLOUD_PROJECT"),
            bq_dataset: non_empty(&lookup, "BQ_DATASET").unwrap_or_else(|| "grocery".to_string()),
        }
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|v| !v.trim().is_empty())
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_empty(&lookup, key);
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let defaults = AuditTables::default();
        let audit_tables = AuditTables {
            question: or("BQ_LOG_TABLE_QUESTION", &defaults.question),
            error: or("BQ_LOG_TABLE_ERROR", &defaults.error),
            zero_result: or("BQ_LOG_TABLE_ZERO", &defaults.zero_result),
            vote: or("BQ_LOG_TABLE_VOTE", &defaults.vote),
        };

        let openai_api_key = get("OPENAI_API_KEY")
            .ok_or_else(|| ChatError::Config("OPENAI_API_KEY is not set".to_string()))?;

        let max_bytes_billed = match get("BQ_MAX_BYTES_BILLED") {
            None => None,
            Some(raw) => Some(parse_number("BQ_MAX_BYTES_BILLED", Some(raw), 0u64)?),
        };

        let max_attempts = parse_number("CHAT_MAX_ATTEMPTS", get("CHAT_MAX_ATTEMPTS"), 5u32)?;
        if max_attempts == 0 {
            return Err(ChatError::Config("CHAT_MAX_ATTEMPTS must be at least 1".to_string()));
        }

        let location = WarehouseLocation::from_lookup(&lookup);

        Ok(Self {
            app_env: or("APP_ENV", "prod").parse()?,
            app_version: or("APP_VERSION", env!("CARGO_PKG_VERSION")),
            gcp_project: location.gcp_project,
            bq_dataset: location.bq_dataset,
            bq_log_dataset: or("BQ_LOG_DATASET", "app_logs"),
            audit_tables,
            bigquery_access_token: get("BIGQUERY_ACCESS_TOKEN"),
            query_timeout: Duration::from_secs(parse_number(
                "BQ_QUERY_TIMEOUT_SECS",
                get("BQ_QUERY_TIMEOUT_SECS"),
                180u64,
            )?),
            max_bytes_billed,
            openai_api_key,
            openai_model: or("OPENAI_MODEL", "gpt-4"),
            openai_summary_model: or("OPENAI_SUMMARY_MODEL", "gpt-4o"),
            openai_base_url: or("OPENAI_BASE_URL", DEFAULT_BASE_URL),
            max_attempts,
            max_trace_chars: parse_number("CHAT_MAX_TRACE_CHARS", get("CHAT_MAX_TRACE_CHARS"), 4000usize)?,
            audit_sink: or("AUDIT_SINK", "jsonl").parse()?,
            audit_path: PathBuf::from(or("AUDIT_PATH", "audit_logs")),
        })
    }

    /// Project and token needed by anything that talks to BigQuery
    pub fn require_bigquery(&self) -> Result<(String, String)> {
        let project = self
            .gcp_project
            .clone()
            .ok_or_else(|| ChatError::Config("GOOGLE_CLOUD_PROJECT is not set".to_string()))?;
        let token = self
            .bigquery_access_token
            .clone()
            .ok_or_else(|| ChatError::Config("BIGQUERY_ACCESS_TOKEN is not set".to_string()))?;
        Ok((project, token))
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_attempts: self.max_attempts,
            max_trace_chars: self.max_trace_chars,
        }
    }

    pub fn execution_context(&self) -> ExecutionContext {
        let mut labels = HashMap::new();
        labels.insert("app".to_string(), "askwarehouse".to_string());
        labels.insert("env".to_string(), self.app_env.to_string());
        ExecutionContext {
            timeout: self.query_timeout,
            max_bytes_billed: self.max_bytes_billed,
            labels,
            dry_run: false,
        }
    }

    pub fn audit_table_name(&self, kind: AuditEventKind) -> String {
        qualified_table_name(
            self.gcp_project.as_deref(),
            Some(&self.bq_log_dataset),
            self.audit_tables.table_for(kind),
        )
    }

    /// Non-secret settings, for startup logging
    pub fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "APP_ENV": self.app_env.to_string(),
            "APP_VERSION": self.app_version,
            "GOOGLE_CLOUD_PROJECT": self.gcp_project,
            "BQ_DATASET": self.bq_dataset,
            "BQ_CHATBOT_QUESTION_LOG": self.audit_table_name(AuditEventKind::Question),
            "BQ_CHATBOT_ERROR_LOG": self.audit_table_name(AuditEventKind::Error),
            "BQ_CHATBOT_ZERO_RESULT_LOG": self.audit_table_name(AuditEventKind::ZeroResult),
            "BQ_CHATBOT_VOTE_FEEDBACK": self.audit_table_name(AuditEventKind::Vote),
            "OPENAI_MODEL": self.openai_model,
            "OPENAI_SUMMARY_MODEL": self.openai_summary_model,
            "CHAT_MAX_ATTEMPTS": self.max_attempts,
        })
    }
}
