//! Polars Execution Engine (local files)
//!
//! Every `.csv` / `.parquet` file in the data directory is registered as a
//! table named after its file stem, then the SQL runs through Polars' SQL
//! context. Used for offline runs against extracts of the warehouse tables.

use crate::error::{ChatError, Result};
use crate::execution::engine::{ExecutionContext, ExecutionEngine};
use crate::execution::result::ResultTable;
use async_trait::async_trait;
use polars::prelude::*;
use polars::sql::SQLContext;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Polars execution engine
pub struct PolarsEngine {
    data_dir: PathBuf,
}

impl PolarsEngine {
    /// Create a new Polars engine
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    /// Table files found in the data directory, as (table name, path)
    pub fn discover_tables(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut tables = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            let is_table = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("csv") | Some("parquet")
            );
            if !is_table {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                tables.push((stem.to_string(), path.clone()));
            }
        }
        tables.sort();
        Ok(tables)
    }
}

fn scan_table(path: &Path) -> Result<LazyFrame> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("parquet") => LazyFrame::scan_parquet(path, ScanArgsParquet::default())
            .map_err(|e| ChatError::Execution(format!("Failed to load Parquet {}: {}", path.display(), e))),
        _ => LazyCsvReader::new(path)
            .with_has_header(true)
            .finish()
            .map_err(|e| ChatError::Execution(format!("Failed to load CSV {}: {}", path.display(), e))),
    }
}

fn run_sql(tables: Vec<(String, PathBuf)>, sql: String) -> Result<ResultTable> {
    let mut ctx = SQLContext::new();
    for (name, path) in &tables {
        debug!("Registering table {} from {}", name, path.display());
        ctx.register(name, scan_table(path)?);
    }

    let df = ctx
        .execute(sql.trim().trim_end_matches(';'))
        .and_then(|lf| lf.collect())
        .map_err(|e| ChatError::Execution(e.to_string()))?;

    ResultTable::from_dataframe(&df)
}

#[async_trait]
impl ExecutionEngine for PolarsEngine {
    fn name(&self) -> &'static str {
        "polars"
    }

    async fn execute(&self, sql: &str, ctx: &ExecutionContext) -> Result<ResultTable> {
        info!("Executing query with Polars: {}", sql);
        let tables = self.discover_tables()?;
        if tables.is_empty() {
            return Err(ChatError::Execution(format!(
                "No CSV or Parquet tables found in {}",
                self.data_dir.display()
            )));
        }

        if ctx.dry_run {
            return Ok(ResultTable::new(
                vec!["dry_run".to_string()],
                vec![vec![crate::execution::result::CellValue::Bool(true)]],
            ));
        }

        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || run_sql(tables, sql))
            .await
            .map_err(|e| ChatError::Execution(format!("Polars worker failed: {}", e)))?
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.data_dir.is_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::result::CellValue;

    fn write_sales(dir: &Path) {
        std::fs::write(
            dir.join("fct_store_sales.csv"),
            "sku_name,net_amount,qty\napples,10.5,3\npears,4.0,1\napples,2.5,1\n",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_polars_engine_runs_sql_over_csv() {
        let dir = tempfile::tempdir().unwrap();
        write_sales(dir.path());
        let engine = PolarsEngine::new(dir.path().to_path_buf());

        let table = engine
            .execute(
                "SELECT sku_name, SUM(net_amount) AS revenue FROM fct_store_sales GROUP BY sku_name ORDER BY revenue DESC;",
                &ExecutionContext::default(),
            )
            .await
            .unwrap();

        assert_eq!(table.columns, vec!["sku_name", "revenue"]);
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.rows[0][0], CellValue::Text("apples".into()));
        assert_eq!(table.rows[0][1], CellValue::Float(13.0));
    }

    #[tokio::test]
    async fn test_polars_engine_reports_unknown_table() {
        let dir = tempfile::tempdir().unwrap();
        write_sales(dir.path());
        let engine = PolarsEngine::new(dir.path().to_path_buf());

        let err = engine
            .execute("SELECT * FROM fct_inventory_daily", &ExecutionContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Execution(_)));
    }
}
