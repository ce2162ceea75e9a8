//! Observability Module
//!
//! Audit events and the sinks that persist them.

pub mod bigquery_sink;
pub mod events;
pub mod logger;
pub mod sqlite_sink;

pub use bigquery_sink::BigQueryAuditSink;
pub use events::*;
pub use logger::*;
pub use sqlite_sink::SqliteAuditSink;
