//! Text-Generation Gateway
//!
//! Schema selection, SQL generation and result summarization behind one
//! interface. No retries happen here; every transport or protocol failure
//! comes back as an `Err`, never as empty text.

use crate::error::{ChatError, Result};
use crate::execution::result::ResultTable;
use crate::llm::{strip_code_fences, TextCompletion};
use crate::prompts::{schema_selection_prompt, sql_generation_prompt, summary_prompt, SchemaCatalog};
use crate::session::Turn;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"[A-Za-z0-9_]+").unwrap();
}

#[async_trait]
pub trait SqlGateway: Send + Sync {
    /// Schema ids relevant to the question; all known ids when none is recognized
    async fn choose_relevant_schemas(&self, question: &str) -> Result<Vec<String>>;

    /// SQL text for the assembled conversational prompt, fences stripped
    async fn generate_sql(&self, context_prompt: &str, schema_ids: &[String]) -> Result<String>;

    /// Two-part narrative (answer + logic used) for a successful result
    async fn summarize(
        &self,
        table: &ResultTable,
        question: &str,
        history: &[Arc<Turn>],
        sql: &str,
    ) -> Result<String>;
}

/// Identifiers in `response` that name known schemas, in catalog order.
/// Matching is case-insensitive and tolerates qualification and quoting
/// (`project.dataset.fct_x`, `` `fct_x` ``).
pub fn match_schema_ids(response: &str, known: &[String]) -> Vec<String> {
    let tokens: HashSet<String> = IDENTIFIER
        .find_iter(response)
        .map(|m| m.as_str().to_ascii_lowercase())
        .collect();
    known
        .iter()
        .filter(|id| tokens.contains(&id.to_ascii_lowercase()))
        .cloned()
        .collect()
}

/// Gateway backed by a text-completion service. SQL and summaries may use
/// different models.
pub struct TextGenerationGateway {
    sql_model: Arc<dyn TextCompletion>,
    summary_model: Arc<dyn TextCompletion>,
    catalog: SchemaCatalog,
}

impl TextGenerationGateway {
    pub fn new(
        sql_model: Arc<dyn TextCompletion>,
        summary_model: Arc<dyn TextCompletion>,
        catalog: SchemaCatalog,
    ) -> Self {
        Self {
            sql_model,
            summary_model,
            catalog,
        }
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }
}

#[async_trait]
impl SqlGateway for TextGenerationGateway {
    async fn choose_relevant_schemas(&self, question: &str) -> Result<Vec<String>> {
        let prompt = schema_selection_prompt(&self.catalog, question);
        let response = self.sql_model.complete(&prompt).await?;
        let known = self.catalog.ids();
        let selected = match_schema_ids(&response, &known);

        if selected.is_empty() {
            warn!("No known schema in selection response {:?}; using all {}", response, known.len());
            return Ok(known);
        }
        info!("Selected schemas: {}", selected.join(", "));
        Ok(selected)
    }

    async fn generate_sql(&self, context_prompt: &str, schema_ids: &[String]) -> Result<String> {
        let prompt = sql_generation_prompt(&self.catalog, schema_ids, context_prompt);
        let response = self.sql_model.complete(&prompt).await?;
        let sql = strip_code_fences(&response);
        if sql.is_empty() {
            return Err(ChatError::Llm("SQL generation returned no SQL".to_string()));
        }
        debug!("Generated SQL: {}", sql);
        Ok(sql)
    }

    async fn summarize(
        &self,
        table: &ResultTable,
        question: &str,
        history: &[Arc<Turn>],
        sql: &str,
    ) -> Result<String> {
        let prompt = summary_prompt(table, question, history, sql);
        self.summary_model.complete(&prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned completions and records the prompts it saw
    struct ScriptedCompletion {
        replies: Mutex<VecDeque<Result<String>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedCompletion {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TextCompletion for ScriptedCompletion {
        async fn complete(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ChatError::Llm("script exhausted".into())))
        }
    }

    fn gateway(replies: Vec<Result<String>>) -> (TextGenerationGateway, Arc<ScriptedCompletion>) {
        let model = ScriptedCompletion::new(replies);
        let gw = TextGenerationGateway::new(model.clone(), model.clone(), SchemaCatalog::grocery(None, None));
        (gw, model)
    }

    #[test]
    fn test_match_schema_ids_is_permissive() {
        let known = vec!["fct_store_sales".to_string(), "fct_inventory_daily".to_string()];
        assert_eq!(
            match_schema_ids("`acme.grocery.FCT_INVENTORY_DAILY`, fct_store_sales", &known),
            vec!["fct_store_sales", "fct_inventory_daily"]
        );
        assert!(match_schema_ids("fct_store_sales_v2", &known).is_empty());
    }

    #[tokio::test]
    async fn test_schema_selection_fails_open() {
        let (gw, _) = gateway(vec![Ok("I am not sure which table.".into())]);
        let ids = gw.choose_relevant_schemas("how are we doing?").await.unwrap();
        assert_eq!(ids, vec!["fct_store_sales", "fct_inventory_daily"]);
    }

    #[tokio::test]
    async fn test_schema_selection_picks_named_table() {
        let (gw, model) = gateway(vec![Ok("fct_inventory_daily".into())]);
        let ids = gw.choose_relevant_schemas("what is out of stock?").await.unwrap();
        assert_eq!(ids, vec!["fct_inventory_daily"]);
        assert!(model.prompts.lock().unwrap()[0].contains("- fct_store_sales: "));
    }

    #[tokio::test]
    async fn test_generate_sql_strips_fences() {
        let (gw, _) = gateway(vec![Ok("```sql\nSELECT 1\n```".into())]);
        let sql = gw
            .generate_sql("The user's CURRENT question: 'x'", &["fct_store_sales".to_string()])
            .await
            .unwrap();
        assert_eq!(sql, "SELECT 1");
    }

    #[tokio::test]
    async fn test_transport_failure_is_an_error() {
        let (gw, _) = gateway(vec![Err(ChatError::Llm("connection reset".into()))]);
        assert!(gw.generate_sql("q", &[]).await.is_err());

        let (gw, _) = gateway(vec![Ok("```sql\n```".into())]);
        assert!(matches!(gw.generate_sql("q", &[]).await, Err(ChatError::Llm(_))));
    }
}
