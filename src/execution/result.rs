//! Query Result - schema-less tabular result shared by every execution engine

use crate::error::{ChatError, Result};
use lazy_static::lazy_static;
use polars::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;

lazy_static! {
    static ref CAMEL_BOUNDARY: Regex = Regex::new(r"([a-z0-9])([A-Z])").unwrap();
    static ref NON_ALNUM_RUN: Regex = Regex::new(r"[^A-Za-z0-9]+").unwrap();
}

/// A single cell. Column sets vary per query, so cells carry their own type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => write!(f, "null"),
            CellValue::Bool(b) => write!(f, "{}", b),
            CellValue::Int(i) => write!(f, "{}", i),
            CellValue::Float(x) => write!(f, "{}", x),
            CellValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Ordered named columns and ordered rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl ResultTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<CellValue>>) -> Self {
        Self { columns, rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First `n` rows paired with their column names.
    pub fn head(&self, n: usize) -> impl Iterator<Item = Vec<(&str, &CellValue)>> + '_ {
        self.rows.iter().take(n).map(move |row| {
            self.columns
                .iter()
                .map(String::as_str)
                .zip(row.iter())
                .collect()
        })
    }

    /// Rewrites column names into lower snake case, suffixing duplicates.
    pub fn normalize_columns(mut self) -> Self {
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut normalized = Vec::with_capacity(self.columns.len());
        for (idx, name) in self.columns.iter().enumerate() {
            let mut col = normalize_column_name(name);
            if col.is_empty() {
                col = format!("col_{}", idx + 1);
            }
            let count = seen.entry(col.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                col = format!("{}_{}", col, count);
            }
            normalized.push(col);
        }
        self.columns = normalized;
        self
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(&self.columns)
            .map_err(|e| ChatError::Execution(format!("Failed to write CSV header: {}", e)))?;
        for row in &self.rows {
            let record: Vec<String> = row
                .iter()
                .map(|cell| match cell {
                    CellValue::Null => String::new(),
                    other => other.to_string(),
                })
                .collect();
            wtr.write_record(&record)
                .map_err(|e| ChatError::Execution(format!("Failed to write CSV row: {}", e)))?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Converts a collected DataFrame into a result table.
    pub fn from_dataframe(df: &DataFrame) -> Result<Self> {
        let columns: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
        let series = df.get_columns();
        let mut rows = Vec::with_capacity(df.height());

        for row_idx in 0..df.height() {
            let mut row = Vec::with_capacity(series.len());
            for s in series {
                row.push(series_to_cell(s, row_idx)?);
            }
            rows.push(row);
        }

        Ok(Self { columns, rows })
    }
}

/// Lower snake case: camel boundaries split, non-alphanumeric runs collapsed.
pub fn normalize_column_name(name: &str) -> String {
    let split = CAMEL_BOUNDARY.replace_all(name.trim(), "${1}_${2}");
    let collapsed = NON_ALNUM_RUN.replace_all(&split, "_");
    collapsed.trim_matches('_').to_lowercase()
}

fn series_to_cell(series: &Series, row_idx: usize) -> Result<CellValue> {
    let any_val = series
        .get(row_idx)
        .map_err(|e| ChatError::Execution(format!("Failed to get value: {}", e)))?;

    let cell = match any_val {
        AnyValue::Null => CellValue::Null,
        AnyValue::Boolean(b) => CellValue::Bool(b),
        AnyValue::String(s) => CellValue::Text(s.to_string()),
        AnyValue::StringOwned(s) => CellValue::Text(s.to_string()),
        AnyValue::Int8(i) => CellValue::Int(i as i64),
        AnyValue::Int16(i) => CellValue::Int(i as i64),
        AnyValue::Int32(i) => CellValue::Int(i as i64),
        AnyValue::Int64(i) => CellValue::Int(i),
        AnyValue::UInt8(u) => CellValue::Int(u as i64),
        AnyValue::UInt16(u) => CellValue::Int(u as i64),
        AnyValue::UInt32(u) => CellValue::Int(u as i64),
        AnyValue::UInt64(u) => match i64::try_from(u) {
            Ok(i) => CellValue::Int(i),
            Err(_) => CellValue::Text(u.to_string()),
        },
        AnyValue::Float32(f) => CellValue::Float(f as f64),
        AnyValue::Float64(f) => CellValue::Float(f),
        other => CellValue::Text(other.to_string()),
    };

    Ok(cell)
}

/// Outcome of one execution call: success carries the table (possibly
/// zero rows), failure carries the backend's message.
#[derive(Debug, Clone, PartialEq)]
pub enum TabularResult {
    Success(ResultTable),
    Failure { message: String },
}

impl TabularResult {
    pub fn failure(message: impl Into<String>) -> Self {
        TabularResult::Failure {
            message: message.into(),
        }
    }

    pub fn row_count(&self) -> usize {
        match self {
            TabularResult::Success(table) => table.row_count(),
            TabularResult::Failure { .. } => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_column_name() {
        assert_eq!(normalize_column_name("revenueUSD"), "revenue_usd");
        assert_eq!(normalize_column_name("Total Revenue ($)"), "total_revenue");
        assert_eq!(normalize_column_name("sku-name"), "sku_name");
        assert_eq!(normalize_column_name("storeId"), "store_id");
        assert_eq!(normalize_column_name("already_snake"), "already_snake");
        assert_eq!(normalize_column_name("  a   b  "), "a_b");
    }

    #[test]
    fn test_normalize_columns_dedupes_and_fills_blanks() {
        let table = ResultTable::new(
            vec!["Store ID".into(), "store_id".into(), "$$".into()],
            vec![],
        )
        .normalize_columns();
        assert_eq!(table.columns, vec!["store_id", "store_id_2", "col_3"]);
    }

    #[test]
    fn test_write_csv() {
        let table = ResultTable::new(
            vec!["sku_name".into(), "revenue".into(), "promo".into()],
            vec![
                vec![CellValue::Text("Gala, 3lb".into()), CellValue::Float(12.5), CellValue::Null],
                vec![CellValue::Text("Milk".into()), CellValue::Int(4), CellValue::Bool(true)],
            ],
        );
        let mut buf = Vec::new();
        table.write_csv(&mut buf).unwrap();
        let out = String::from_utf8(buf).unwrap();
        assert_eq!(out, "sku_name,revenue,promo\n\"Gala, 3lb\",12.5,\nMilk,4,true\n");
    }

    #[test]
    fn test_from_dataframe() {
        let df = df![
            "sku_name" => ["apples", "pears"],
            "units" => [3i64, 5],
        ]
        .unwrap();
        let table = ResultTable::from_dataframe(&df).unwrap();
        assert_eq!(table.columns, vec!["sku_name", "units"]);
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.rows[1], vec![CellValue::Text("pears".into()), CellValue::Int(5)]);
    }
}
