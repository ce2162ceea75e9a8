//! BigQuery Execution Engine
//!
//! Talks to the BigQuery REST API directly: `jobs.query` to submit, then
//! `jobs.getQueryResults` to poll and page. Credentials are an OAuth bearer
//! token handed in by the caller; loading it is not this module's concern.

use crate::error::{ChatError, Result};
use crate::execution::engine::{ExecutionContext, ExecutionEngine};
use crate::execution::result::{CellValue, ResultTable};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const DEFAULT_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";
const MAX_POLLS: usize = 10_000;
const MAX_PAGES: usize = 1_000;

// BigQuery REST API: POST /projects/{project}/queries with a QueryRequest body,
// then GET /projects/{project}/queries/{jobId} until jobComplete.

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    use_query_cache: bool,
    dry_run: bool,
    timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    maximum_bytes_billed: Option<String>,
    #[serde(skip_serializing_if = "std::collections::HashMap::is_empty")]
    labels: &'a std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    job_reference: Option<JobReference>,
    #[serde(default)]
    job_complete: bool,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
    total_bytes_processed: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct FieldSchema {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    message: String,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: Option<u16>,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<serde_json::Value>,
}

/// Authenticated handle on the BigQuery REST API. Cheap to clone and safe
/// for sequential reuse across turns.
#[derive(Clone)]
pub struct BigQueryClient {
    client: Client,
    project_id: String,
    access_token: String,
    base_url: String,
}

impl BigQueryClient {
    pub fn new(project_id: String, access_token: String) -> Result<Self> {
        if project_id.trim().is_empty() {
            return Err(ChatError::Config("BigQuery project id is empty".to_string()));
        }
        if access_token.trim().is_empty() {
            return Err(ChatError::Config("BigQuery access token is empty".to_string()));
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| ChatError::Config(format!("Failed to create HTTP client for BigQuery: {}", e)))?;

        Ok(Self {
            client,
            project_id,
            access_token,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| ChatError::Execution(format!("BigQuery request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ChatError::Execution(format!("Failed to read BigQuery response: {}", e)))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|env| match env.error.code {
                    Some(code) => format!("{} (code {})", env.error.message, code),
                    None => env.error.message,
                })
                .unwrap_or(text);
            return Err(ChatError::Execution(format!("BigQuery error ({}): {}", status, message)));
        }

        serde_json::from_str(&text)
            .map_err(|e| ChatError::Execution(format!("Failed to parse BigQuery response: {}", e)))
    }

    async fn submit_query(&self, sql: &str, ctx: &ExecutionContext) -> Result<QueryResponse> {
        let url = format!("{}/projects/{}/queries", self.base_url, self.project_id);
        let body = QueryRequest {
            query: sql,
            use_legacy_sql: false,
            use_query_cache: true,
            dry_run: ctx.dry_run,
            timeout_ms: ctx.timeout.as_millis() as u64,
            maximum_bytes_billed: ctx.max_bytes_billed.map(|b| b.to_string()),
            labels: &ctx.labels,
        };
        let response: QueryResponse = self.send(self.client.post(&url).json(&body)).await?;
        check_job_errors(&response)?;
        Ok(response)
    }

    async fn fetch_results(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
        timeout: Duration,
    ) -> Result<QueryResponse> {
        let url = format!("{}/projects/{}/queries/{}", self.base_url, self.project_id, job.job_id);
        let mut query: Vec<(&str, String)> = vec![("timeoutMs", timeout.as_millis().to_string())];
        if let Some(location) = &job.location {
            query.push(("location", location.clone()));
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        let response: QueryResponse = self.send(self.client.get(&url).query(&query)).await?;
        check_job_errors(&response)?;
        Ok(response)
    }

    /// Streaming insert into `dataset.table` (tabledata.insertAll).
    pub async fn insert_rows(
        &self,
        dataset: &str,
        table: &str,
        rows: Vec<(String, serde_json::Value)>,
    ) -> Result<()> {
        let url = format!(
            "{}/projects/{}/datasets/{}/tables/{}/insertAll",
            self.base_url, self.project_id, dataset, table
        );
        // event_date is a local partition helper, not a column of the log tables
        let body = serde_json::json!({
            "ignoreUnknownValues": true,
            "rows": rows
                .into_iter()
                .map(|(insert_id, json)| serde_json::json!({ "insertId": insert_id, "json": json }))
                .collect::<Vec<_>>(),
        });
        let response: InsertAllResponse = self.send(self.client.post(&url).json(&body)).await?;
        if !response.insert_errors.is_empty() {
            return Err(ChatError::Audit(format!(
                "BigQuery rejected rows for {}.{}: {}",
                dataset,
                table,
                serde_json::to_string(&response.insert_errors)?
            )));
        }
        Ok(())
    }
}

fn check_job_errors(response: &QueryResponse) -> Result<()> {
    if response.job_complete && !response.errors.is_empty() {
        let messages: Vec<String> = response
            .errors
            .iter()
            .map(|e| match &e.reason {
                Some(reason) => format!("{} ({})", e.message, reason),
                None => e.message.clone(),
            })
            .collect();
        return Err(ChatError::Execution(messages.join("; ")));
    }
    Ok(())
}

/// Convert one JSON-encoded BigQuery cell according to its declared type
fn convert_cell(value: &serde_json::Value, field: &FieldSchema) -> CellValue {
    if value.is_null() {
        return CellValue::Null;
    }
    let repeated = field.mode.as_deref() == Some("REPEATED");
    let raw = match value.as_str() {
        Some(s) if !repeated => s,
        _ => return CellValue::Text(value.to_string()),
    };

    match field.field_type.as_str() {
        "INTEGER" | "INT64" => raw
            .parse::<i64>()
            .map(CellValue::Int)
            .unwrap_or_else(|_| CellValue::Text(raw.to_string())),
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => raw
            .parse::<f64>()
            .map(CellValue::Float)
            .unwrap_or_else(|_| CellValue::Text(raw.to_string())),
        "BOOLEAN" | "BOOL" => match raw {
            "true" | "TRUE" => CellValue::Bool(true),
            "false" | "FALSE" => CellValue::Bool(false),
            other => CellValue::Text(other.to_string()),
        },
        "TIMESTAMP" => raw
            .parse::<f64>()
            .ok()
            .and_then(|secs| {
                let whole = secs.floor();
                let nanos = ((secs - whole) * 1e9).round() as u32;
                DateTime::<Utc>::from_timestamp(whole as i64, nanos.min(999_999_999))
            })
            .map(|ts| CellValue::Text(ts.to_rfc3339()))
            .unwrap_or_else(|| CellValue::Text(raw.to_string())),
        _ => CellValue::Text(raw.to_string()),
    }
}

fn append_rows(rows: &mut Vec<Vec<CellValue>>, response: &QueryResponse, fields: &[FieldSchema]) {
    for row in &response.rows {
        let converted = fields
            .iter()
            .enumerate()
            .map(|(idx, field)| {
                row.f
                    .get(idx)
                    .map(|cell| convert_cell(&cell.v, field))
                    .unwrap_or(CellValue::Null)
            })
            .collect();
        rows.push(converted);
    }
}

/// BigQuery execution engine
pub struct BigQueryEngine {
    client: BigQueryClient,
}

impl BigQueryEngine {
    pub fn new(client: BigQueryClient) -> Self {
        Self { client }
    }

    fn remaining(start: Instant, timeout: Duration) -> Result<Duration> {
        timeout
            .checked_sub(start.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or_else(|| {
                ChatError::Execution(format!("BigQuery query timeout after {}s", timeout.as_secs()))
            })
    }
}

#[async_trait]
impl ExecutionEngine for BigQueryEngine {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    async fn execute(&self, sql: &str, ctx: &ExecutionContext) -> Result<ResultTable> {
        let start = Instant::now();
        info!("Executing query with BigQuery: {}", sql);

        let mut response = self.client.submit_query(sql, ctx).await?;

        if ctx.dry_run {
            let estimated = response
                .total_bytes_processed
                .as_deref()
                .and_then(|b| b.parse::<i64>().ok())
                .map(CellValue::Int)
                .unwrap_or(CellValue::Null);
            return Ok(ResultTable::new(
                vec!["dry_run".to_string(), "estimated_bytes_processed".to_string()],
                vec![vec![CellValue::Bool(true), estimated]],
            ));
        }

        let job = response
            .job_reference
            .clone()
            .ok_or_else(|| ChatError::Execution("BigQuery response has no job reference".to_string()))?;
        debug!("BigQuery job submitted: {}", job.job_id);

        let mut polls = 0;
        while !response.job_complete {
            polls += 1;
            if polls > MAX_POLLS {
                return Err(ChatError::Execution(format!(
                    "BigQuery query exceeded max polls ({})",
                    MAX_POLLS
                )));
            }
            let remaining = Self::remaining(start, ctx.timeout)?;
            let delay = Duration::from_millis((100 * polls.min(10)) as u64).min(remaining);
            tokio::time::sleep(delay).await;
            let remaining = Self::remaining(start, ctx.timeout)?;
            response = self.client.fetch_results(&job, None, remaining).await?;
        }

        let fields = response
            .schema
            .take()
            .map(|s| s.fields)
            .ok_or_else(|| ChatError::Execution("No schema in BigQuery response".to_string()))?;
        let columns: Vec<String> = fields.iter().map(|f| f.name.clone()).collect();

        let mut rows = Vec::new();
        append_rows(&mut rows, &response, &fields);

        let mut pages = 0;
        let mut page_token = response.page_token.take();
        while let Some(token) = page_token {
            pages += 1;
            if pages > MAX_PAGES {
                warn!("BigQuery result truncated after {} pages", MAX_PAGES);
                break;
            }
            let remaining = Self::remaining(start, ctx.timeout)?;
            let page = self.client.fetch_results(&job, Some(&token), remaining).await?;
            append_rows(&mut rows, &page, &fields);
            page_token = page.page_token;
        }

        info!(
            "BigQuery job {} returned {} rows in {}ms",
            job.job_id,
            rows.len(),
            start.elapsed().as_millis()
        );
        Ok(ResultTable::new(columns, rows))
    }

    async fn health_check(&self) -> Result<bool> {
        match self.execute("SELECT 1", &ExecutionContext::default()).await {
            Ok(_) => Ok(true),
            Err(e) => {
                error!("BigQuery health check failed: {}", e);
                Ok(false)
            }
        }
    }
}
