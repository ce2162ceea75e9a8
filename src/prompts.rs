//! Schema catalog and prompt templates for the text-generation service.

use crate::error::{ChatError, Result};
use crate::execution::result::ResultTable;
use crate::session::Turn;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Token replaced by the table's qualified name inside documentation text
pub const TABLE_PLACEHOLDER: &str = "{table}";

const SALES_SUMMARY: &str = "Transactional line-item sales (one row per item per transaction). \
Use for revenue, units, baskets, promos, categories, and store/channel splits.";

const INVENTORY_SUMMARY: &str = "Daily inventory snapshots by store and SKU. \
Use for on-hand, on-order, stockouts, shrink, and days-of-supply.";

const SALES_DOC: &str = r#"Table fct_store_sales:
`{table}`
Transactional line-item sales (one row per item sold per transaction).

Important columns:
- transaction_id: Unique ID for a customer transaction
- transaction_ts: POS timestamp (UTC)
- business_date: Local store date (DATE)
- store_id / store_name: Store identifiers
- channel: 'in_store', 'curbside', 'delivery', etc.
- register_id / cashier_id: POS register and associate (nullable for e-comm)
- customer_id: Loyalty/customer identifier (nullable)
- basket_gross_amount / basket_net_amount: Basket totals, repeated on each line
- line_number: Line sequence within the transaction
- sku_id / upc / sku_name / brand_name: Item identifiers and description
- dept_name / category_name / subcategory_name: Merchandise rollups
- unit_size: Pack/size text (e.g., '16 oz')
- qty: Units sold on the line (decimal for weighed items)
- unit_price: Regular price per unit
- promo_flag / promo_code / discount_amount: Promotion details
- net_amount: Line total after discount
- tax_amount: Sales tax on the line
- tender_type: 'credit', 'debit', 'ebt', 'cash'
- zipcode: Store ZIP

Starter queries:

-- Top 10 SKUs by revenue last 7 days
SELECT sku_id, sku_name, SUM(net_amount) AS revenue_7d, SUM(qty) AS units_7d
FROM `{table}`
WHERE business_date >= DATE_SUB(CURRENT_DATE(), INTERVAL 7 DAY)
GROUP BY sku_id, sku_name
ORDER BY revenue_7d DESC
LIMIT 10;

-- Basket metrics for last 30 days
WITH baskets AS (
  SELECT transaction_id, ANY_VALUE(channel) AS channel,
         MAX(basket_net_amount) AS basket_net, SUM(qty) AS items
  FROM `{table}`
  WHERE business_date >= DATE_SUB(CURRENT_DATE(), INTERVAL 30 DAY)
  GROUP BY transaction_id
)
SELECT channel, AVG(basket_net) AS avg_order_value, AVG(items) AS avg_items_per_basket
FROM baskets
GROUP BY channel;

Notes:
- Use business_date for daily rollups; use transaction_ts for intraday.
- For basket-level metrics, aggregate per transaction_id first.
- Do not infer category from sku_name; use dept/category fields."#;

const INVENTORY_DOC: &str = r#"Table fct_inventory_daily:
`{table}`
Daily end-of-day inventory snapshots by store and SKU.

Important columns:
- snapshot_date: Inventory date (DATE, end-of-day)
- store_id / store_name: Store identifiers
- sku_id / upc / sku_name: Item identifiers and description
- dept_name / category_name / subcategory_name: Merchandise rollups
- on_hand_units / on_order_units / in_transit_units: Stock positions
- safety_stock_units: Target buffer stock
- forecast_units_7d: Rolling 7-day demand forecast
- shrink_units: Period-to-date shrink/theft/damage units
- last_receipt_date / last_sale_date: Last receipt and last sale
- cost_per_unit / retail_price: Weighted average cost and list price
- supplier_id / supplier_name: Primary supplier (nullable)

Derived metrics:
- days_of_supply = SAFE_DIVIDE(on_hand_units, NULLIF(forecast_units_7d/7, 0))
- stockout_flag = on_hand_units <= 0
- low_stock_flag = on_hand_units < safety_stock_units

Starter queries:

-- Items at stockout or below safety stock today
SELECT store_id, sku_id, sku_name, on_hand_units, safety_stock_units
FROM `{table}`
WHERE snapshot_date = CURRENT_DATE()
  AND (on_hand_units <= 0 OR on_hand_units < safety_stock_units)
ORDER BY on_hand_units ASC;

Notes:
- Use snapshot_date for point-in-time inventory state.
- Join to sales only on (store_id, sku_id) and date ranges; avoid name-based joins.
- For chain-level views, aggregate across stores before computing days_of_supply."#;

const GROCERY_GUIDELINES: &str = r#"- Prefer DATE columns (business_date, snapshot_date) for daily rollups.
- Aggregate to basket level for AOV/items-per-basket metrics before grouping.
- Use department/category fields for merchandising analysis; avoid parsing sku_name.
- For promo analysis, use promo_flag/discount_amount.
- Guard divides with NULLIF or SAFE_DIVIDE.
- Be explicit about grain when mixing tables: sales is (transaction_id, line_number), inventory is (store_id, sku_id, snapshot_date).
- For chain summaries, SUM across stores first, then compute ratios."#;

/// `project.dataset.table`, dropping whichever qualifiers are absent
pub fn qualified_table_name(project: Option<&str>, dataset: Option<&str>, table: &str) -> String {
    [project, dataset, Some(table)]
        .iter()
        .flatten()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(".")
}

fn resolve_placeholders(
    schemas: Vec<SchemaEntry>,
    project: Option<&str>,
    dataset: Option<&str>,
) -> Vec<SchemaEntry> {
    schemas
        .into_iter()
        .map(|mut entry| {
            let fqn = qualified_table_name(project, dataset, &entry.id);
            entry.documentation = entry.documentation.replace(TABLE_PLACEHOLDER, &fqn);
            entry
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub id: String,
    pub summary: String,
    pub documentation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    guidelines: String,
    schemas: Vec<SchemaEntry>,
}

/// The set of tables the assistant may query, with their prompt material
#[derive(Debug, Clone)]
pub struct SchemaCatalog {
    schemas: Vec<SchemaEntry>,
    guidelines: String,
}

impl SchemaCatalog {
    /// Builds a catalog, resolving `{table}` in each entry's documentation
    pub fn new(
        schemas: Vec<SchemaEntry>,
        guidelines: impl Into<String>,
        project: Option<&str>,
        dataset: Option<&str>,
    ) -> Result<Self> {
        if schemas.is_empty() {
            return Err(ChatError::Catalog("catalog has no schemas".to_string()));
        }
        let mut seen = HashSet::new();
        for entry in &schemas {
            if entry.id.trim().is_empty() {
                return Err(ChatError::Catalog("schema with empty id".to_string()));
            }
            if !seen.insert(entry.id.clone()) {
                return Err(ChatError::Catalog(format!("duplicate schema id {}", entry.id)));
            }
        }

        Ok(Self {
            schemas: resolve_placeholders(schemas, project, dataset),
            guidelines: guidelines.into(),
        })
    }

    /// Built-in grocery warehouse catalog
    pub fn grocery(project: Option<&str>, dataset: Option<&str>) -> Self {
        let entries = vec![
            SchemaEntry {
                id: "fct_store_sales".to_string(),
                summary: SALES_SUMMARY.to_string(),
                documentation: SALES_DOC.to_string(),
            },
            SchemaEntry {
                id: "fct_inventory_daily".to_string(),
                summary: INVENTORY_SUMMARY.to_string(),
                documentation: INVENTORY_DOC.to_string(),
            },
        ];
        Self {
            schemas: resolve_placeholders(entries, project, dataset),
            guidelines: GROCERY_GUIDELINES.to_string(),
        }
    }

    /// Loads `{"guidelines": "...", "schemas": [{"id", "summary", "documentation"}]}`
    pub fn from_json_file(path: &Path, project: Option<&str>, dataset: Option<&str>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: CatalogFile = serde_json::from_str(&content)
            .map_err(|e| ChatError::Catalog(format!("Failed to parse {}: {}", path.display(), e)))?;
        info!("Loaded {} schemas from {}", file.schemas.len(), path.display());
        Self::new(file.schemas, file.guidelines, project, dataset)
    }

    pub fn ids(&self) -> Vec<String> {
        self.schemas.iter().map(|s| s.id.clone()).collect()
    }

    pub fn entries(&self) -> &[SchemaEntry] {
        &self.schemas
    }

    pub fn get(&self, id: &str) -> Option<&SchemaEntry> {
        self.schemas.iter().find(|s| s.id == id)
    }

    pub fn guidelines(&self) -> &str {
        &self.guidelines
    }
}

pub fn schema_selection_prompt(catalog: &SchemaCatalog, question: &str) -> String {
    let mut prompt = format!(
        "The user asked: \"{}\"\n\nYou are selecting tables for a retail analytics question.\nAvailable tables (summaries):\n",
        question
    );
    for entry in catalog.entries() {
        let _ = writeln!(prompt, "- {}: {}", entry.id, entry.summary);
    }
    prompt.push_str(
        "\nReturn 1 (ideally) or 2 (if necessary) table names ONLY, comma-separated.\n\
         - Choose the table that directly answers the question.\n\
         - If two tables are genuinely needed, list both.\n\
         - Output only table names, nothing else.",
    );
    prompt
}

pub fn sql_generation_prompt(catalog: &SchemaCatalog, schema_ids: &[String], context_prompt: &str) -> String {
    let docs: Vec<&str> = schema_ids
        .iter()
        .filter_map(|id| catalog.get(id))
        .map(|e| e.documentation.as_str())
        .collect();

    format!(
        "You are a SQL assistant for a retail data warehouse in BigQuery.\n\
         Use Standard SQL compatible with Google BigQuery.\n\
         - Prefer fully-qualified table names (project.dataset.table) when given below.\n\
         - Use SAFE_* functions when dividing or casting.\n\
         - Use DATE_TRUNC/DATE_SUB/DATE_DIFF for date logic.\n\
         - Write a single read-only SELECT or WITH query.\n\n\
         {}\n\n{}\n\n{}\n\n\
         TASK:\nReturn ONLY a valid BigQuery SQL query (no explanations, no markdown).",
        catalog.guidelines(),
        docs.join("\n\n"),
        context_prompt
    )
}

/// One sentence per row: `col: value. col: value.`
pub fn rows_as_sentences(table: &ResultTable) -> String {
    table
        .head(table.row_count())
        .map(|row| {
            let parts: Vec<String> = row.iter().map(|(c, v)| format!("{}: {}", c, v)).collect();
            format!("{}.", parts.join(". "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn summary_prompt(table: &ResultTable, question: &str, history: &[Arc<Turn>], sql: &str) -> String {
    let mut history_block = String::new();
    for turn in history {
        let _ = writeln!(history_block, "Previous user query: '{}'", turn.question());
        let _ = writeln!(history_block, "Previous assistant answer: '{}'", turn.summary());
        history_block.push_str("---\n");
    }

    format!(
        "You are an assistant specializing in retail analytics summaries.\n\n\
         {}Current user question: \"{}\"\n\n\
         Here is the SQL that produced the results:\n```sql\n{}\n```\n\n\
         Here are the query results as sentences (row-wise):\n{}\n\n\
         CONTEXT RULES\n\
         - If prior conversation applied filters (dates, stores, channels, departments, SKUs), carry them forward unless the new question overrides them.\n\
         - Do NOT invent filters.\n\n\
         OUTPUT FORMAT (Markdown):\n\
         ANSWER: A 1-3 sentence plain, analytical summary focused on business takeaways.\n\n\
         LOGIC USED: 1-2 sentences explaining at a high level how the SQL answered the question (filters, groupings, date periods, metrics).\n\n\
         Bold SKU names, store identifiers, department/category names, explicit dates and key figures. Keep it concise.",
        history_block,
        question,
        sql,
        rows_as_sentences(table)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::result::CellValue;

    #[test]
    fn test_qualified_names() {
        assert_eq!(qualified_table_name(Some("p"), Some("grocery"), "t"), "p.grocery.t");
        assert_eq!(qualified_table_name(None, Some("grocery"), "t"), "grocery.t");
        assert_eq!(qualified_table_name(None, None, "t"), "t");

        let catalog = SchemaCatalog::grocery(Some("acme"), Some("grocery"));
        let doc = &catalog.get("fct_store_sales").unwrap().documentation;
        assert!(doc.contains("`acme.grocery.fct_store_sales`"));
        assert!(!doc.contains(TABLE_PLACEHOLDER));
    }

    #[test]
    fn test_catalog_rejects_duplicates() {
        let entry = SchemaEntry {
            id: "t".into(),
            summary: "s".into(),
            documentation: "d".into(),
        };
        let err = SchemaCatalog::new(vec![entry.clone(), entry], "", None, None).unwrap_err();
        assert!(matches!(err, ChatError::Catalog(_)));
    }

    #[test]
    fn test_catalog_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"{"guidelines": "- be terse", "schemas": [{"id": "fct_orders", "summary": "orders", "documentation": "FROM `{table}`"}]}"#,
        )
        .unwrap();
        let catalog = SchemaCatalog::from_json_file(&path, Some("p"), Some("d")).unwrap();
        assert_eq!(catalog.ids(), vec!["fct_orders"]);
        assert_eq!(catalog.get("fct_orders").unwrap().documentation, "FROM `p.d.fct_orders`");
    }

    #[test]
    fn test_rows_as_sentences() {
        let table = ResultTable::new(
            vec!["store_id".into(), "revenue".into()],
            vec![vec![CellValue::Int(12), CellValue::Float(99.5)]],
        );
        assert_eq!(rows_as_sentences(&table), "store_id: 12. revenue: 99.5.");
    }

    #[test]
    fn test_sql_prompt_includes_only_chosen_docs() {
        let catalog = SchemaCatalog::grocery(None, None);
        let prompt = sql_generation_prompt(&catalog, &["fct_inventory_daily".to_string()], "CTX");
        assert!(prompt.contains("Table fct_inventory_daily"));
        assert!(!prompt.contains("Table fct_store_sales"));
        assert!(prompt.contains("CTX"));
    }
}
