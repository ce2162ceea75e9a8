pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod execution_loop;
pub mod gateway;
pub mod llm;
pub mod observability;
pub mod prompts;
pub mod security;
pub mod session;

pub use config::{AppConfig, AppEnv, AuditSinkKind, WarehouseLocation};
pub use context::{build_prompt, FailureNotes, Filters};
pub use error::{ChatError, Result};
pub use execution::{ExecutionAdapter, ExecutionContext, ExecutionEngine, ResultTable, TabularResult};
pub use execution_loop::{
    Attempt, AttemptOutcome, ErrorKind, OrchestratorConfig, TurnOrchestrator, TurnOutcome, TurnRequest,
};
pub use gateway::{SqlGateway, TextGenerationGateway};
pub use llm::{LlmClient, TextCompletion};
pub use observability::{AuditEmitter, AuditEvent, AuditSink};
pub use prompts::SchemaCatalog;
pub use security::{is_safe, QueryGuards};
pub use session::{ConversationSession, History, Turn, TurnStatus, Vote, VoteValue};
