//! BigQuery audit sink: streaming inserts into the log dataset.

use crate::error::Result;
use crate::execution::bigquery_engine::BigQueryClient;
use crate::observability::events::{AuditEvent, AuditTables};
use crate::observability::logger::AuditSink;
use async_trait::async_trait;
use uuid::Uuid;

pub struct BigQueryAuditSink {
    client: BigQueryClient,
    dataset: String,
    tables: AuditTables,
}

impl BigQueryAuditSink {
    pub fn new(client: BigQueryClient, dataset: impl Into<String>, tables: AuditTables) -> Self {
        Self {
            client,
            dataset: dataset.into(),
            tables,
        }
    }
}

#[async_trait]
impl AuditSink for BigQueryAuditSink {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    async fn record(&self, event: &AuditEvent) -> Result<()> {
        let table = self.tables.table_for(event.kind());
        // insertId lets BigQuery drop duplicates on client retries
        let insert_id = Uuid::new_v4().to_string();
        self.client
            .insert_rows(&self.dataset, table, vec![(insert_id, event.to_row()?)])
            .await
    }
}
