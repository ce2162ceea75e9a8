//! Execution Engine Trait - core contract for warehouse backends
//!
//! Engines are pluggable: the BigQuery REST engine for production, the
//! Polars engine for local files. Both are wrapped by the execution adapter,
//! which turns their errors into failure values.

use crate::error::Result;
use crate::execution::result::ResultTable;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Caller-supplied caps forwarded to the engine. The orchestrator passes
/// them through and does not enforce them itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Timeout for the whole execution call
    pub timeout: Duration,

    /// Maximum bytes the warehouse may scan (None = backend default)
    pub max_bytes_billed: Option<u64>,

    /// Job labels for auditing on the warehouse side
    pub labels: HashMap<String, String>,

    /// Validate and estimate only
    pub dry_run: bool,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            max_bytes_billed: None,
            labels: HashMap::new(),
            dry_run: false,
        }
    }
}

/// Execution engine trait - all engines must implement this
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Engine name (e.g., "bigquery", "polars")
    fn name(&self) -> &'static str;

    /// Execute a SQL query and return the raw table (column names as the
    /// backend reported them)
    async fn execute(&self, sql: &str, ctx: &ExecutionContext) -> Result<ResultTable>;

    /// Check if engine is available/healthy
    async fn health_check(&self) -> Result<bool>;
}
