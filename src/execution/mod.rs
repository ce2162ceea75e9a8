//! Execution Module - warehouse access behind pluggable engines
//!
//! - ExecutionEngine trait implemented by the BigQuery and Polars engines
//! - ExecutionAdapter turning engine calls into TabularResult values
//! - ResultTable shared by every engine

pub mod adapter;
pub mod engine;
pub mod result;

// Engine implementations
pub mod bigquery_engine;
pub mod polars_engine;

pub use adapter::ExecutionAdapter;
pub use bigquery_engine::{BigQueryClient, BigQueryEngine};
pub use engine::{ExecutionContext, ExecutionEngine};
pub use polars_engine::PolarsEngine;
pub use result::{CellValue, ResultTable, TabularResult};
