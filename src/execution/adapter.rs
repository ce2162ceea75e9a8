//! Execution Adapter
//!
//! Wraps an engine so that every call ends in a `TabularResult`: errors and
//! timeouts become failure values, successful tables get normalized column
//! names.

use crate::execution::engine::{ExecutionContext, ExecutionEngine};
use crate::execution::result::TabularResult;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ExecutionAdapter {
    engine: Arc<dyn ExecutionEngine>,
    ctx: ExecutionContext,
}

impl ExecutionAdapter {
    pub fn new(engine: Arc<dyn ExecutionEngine>, ctx: ExecutionContext) -> Self {
        Self { engine, ctx }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub async fn execute(&self, sql: &str) -> TabularResult {
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.ctx.timeout, self.engine.execute(sql, &self.ctx)).await;

        match outcome {
            Ok(Ok(table)) => {
                let table = table.normalize_columns();
                info!(
                    "{} returned {} rows in {}ms",
                    self.engine.name(),
                    table.row_count(),
                    start.elapsed().as_millis()
                );
                TabularResult::Success(table)
            }
            Ok(Err(e)) => {
                warn!("{} execution failed: {}", self.engine.name(), e);
                TabularResult::failure(e.to_string())
            }
            Err(_) => {
                warn!("{} execution timed out after {}s", self.engine.name(), self.ctx.timeout.as_secs());
                TabularResult::failure(format!(
                    "Query timeout: execution exceeded {}s",
                    self.ctx.timeout.as_secs()
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ChatError, Result};
    use crate::execution::result::{CellValue, ResultTable};
    use async_trait::async_trait;
    use std::time::Duration;

    enum Behavior {
        Table,
        Fail,
        Hang,
    }

    struct StubEngine(Behavior);

    #[async_trait]
    impl ExecutionEngine for StubEngine {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn execute(&self, _sql: &str, _ctx: &ExecutionContext) -> Result<ResultTable> {
            match self.0 {
                Behavior::Table => Ok(ResultTable::new(
                    vec!["storeId".into(), "Net Revenue".into()],
                    vec![vec![CellValue::Int(1), CellValue::Float(2.0)]],
                )),
                Behavior::Fail => Err(ChatError::Execution("Unrecognized name: revenue".into())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(ResultTable::empty())
                }
            }
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    fn adapter(behavior: Behavior, timeout: Duration) -> ExecutionAdapter {
        let ctx = ExecutionContext {
            timeout,
            ..ExecutionContext::default()
        };
        ExecutionAdapter::new(Arc::new(StubEngine(behavior)), ctx)
    }

    #[tokio::test]
    async fn test_success_normalizes_columns() {
        match adapter(Behavior::Table, Duration::from_secs(5)).execute("SELECT 1").await {
            TabularResult::Success(table) => assert_eq!(table.columns, vec!["store_id", "net_revenue"]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_becomes_failure_value() {
        let result = adapter(Behavior::Fail, Duration::from_secs(5)).execute("SELECT 1").await;
        assert_eq!(
            result,
            TabularResult::failure("Execution error: Unrecognized name: revenue")
        );
    }

    #[tokio::test]
    async fn test_timeout_becomes_failure_value() {
        let result = adapter(Behavior::Hang, Duration::from_millis(20)).execute("SELECT 1").await;
        match result {
            TabularResult::Failure { message } => assert!(message.contains("timeout")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
