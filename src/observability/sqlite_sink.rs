//! SQLite audit sink
//!
//! One table per event kind. Common columns are broken out for querying;
//! the full event row is kept as JSON in `payload`.

use crate::error::{ChatError, Result};
use crate::observability::events::{AuditEvent, AuditTables};
use crate::observability::logger::AuditSink;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

lazy_static! {
    static ref TABLE_NAME: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

pub struct SqliteAuditSink {
    db: Arc<Mutex<Connection>>,
    tables: AuditTables,
}

impl SqliteAuditSink {
    pub fn open(path: impl AsRef<Path>, tables: AuditTables) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(path)
            .map_err(|e| ChatError::Audit(format!("Failed to open audit database {}: {}", path.display(), e)))?;
        Self::with_connection(db, tables)
    }

    pub fn in_memory(tables: AuditTables) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, tables)
    }

    fn with_connection(db: Connection, tables: AuditTables) -> Result<Self> {
        for table in tables.all() {
            if !TABLE_NAME.is_match(table) {
                return Err(ChatError::Config(format!("Invalid audit table name: {}", table)));
            }
        }
        let sink = Self {
            db: Arc::new(Mutex::new(db)),
            tables,
        };
        sink.init_schema()?;
        Ok(sink)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        lock_connection(&self.db)
    }

    fn init_schema(&self) -> Result<()> {
        let db = self.lock()?;
        for table in self.tables.all() {
            db.execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_date TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    question_id TEXT NOT NULL,
                    user_id TEXT,
                    session_id TEXT,
                    payload TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_event_date ON {table}(event_date);
                "#,
                table = table
            ))?;
        }
        info!("SQLite audit schema ready ({} tables)", self.tables.all().len());
        Ok(())
    }

    /// Number of rows recorded in `table` for `event_date` (YYYY-MM-DD)
    pub fn count(&self, table: &str, event_date: &str) -> Result<i64> {
        if !TABLE_NAME.is_match(table) {
            return Err(ChatError::Audit(format!("Invalid audit table name: {}", table)));
        }
        let db = self.lock()?;
        let count = db.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE event_date = ?1", table),
            params![event_date],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[async_trait]
impl AuditSink for SqliteAuditSink {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn record(&self, event: &AuditEvent) -> Result<()> {
        let row = event.to_row()?;
        let field = |name: &str| row.get(name).and_then(|v| v.as_str()).map(str::to_string);
        let insert = format!(
            "INSERT INTO {} (event_date, timestamp, question_id, user_id, session_id, payload) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            self.tables.table_for(event.kind())
        );
        let event_date = event.event_date().format("%Y-%m-%d").to_string();
        let timestamp = event.timestamp().to_rfc3339();
        let question_id = event.question_id().to_string();
        let (user_id, session_id) = (field("user_id"), field("session_id"));
        let payload = serde_json::to_string(&row)?;
        let db = Arc::clone(&self.db);

        tokio::task::spawn_blocking(move || -> Result<()> {
            let db = lock_connection(&db)?;
            db.execute(
                &insert,
                params![event_date, timestamp, question_id, user_id, session_id, payload],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| ChatError::Audit(format!("SQLite writer failed: {}", e)))?
    }
}

fn lock_connection(db: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    db.lock()
        .map_err(|_| ChatError::Audit("SQLite sink lock poisoned".to_string()))
}
