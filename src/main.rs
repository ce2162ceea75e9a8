use anyhow::{Context, Result};
use askwarehouse::config::{AppConfig, AppEnv, AuditSinkKind, WarehouseLocation};
use askwarehouse::context::Filters;
use askwarehouse::execution::{
    BigQueryClient, BigQueryEngine, ExecutionAdapter, ExecutionEngine, PolarsEngine, ResultTable,
};
use askwarehouse::execution_loop::{TurnOrchestrator, TurnOutcome, TurnRequest};
use askwarehouse::gateway::TextGenerationGateway;
use askwarehouse::llm::LlmClient;
use askwarehouse::observability::{
    AuditEmitter, AuditSink, BigQueryAuditSink, JsonlAuditSink, NoopAuditSink, SqliteAuditSink,
};
use askwarehouse::prompts::SchemaCatalog;
use askwarehouse::security::{QueryGuards, SafetyVerdict};
use askwarehouse::session::{ConversationSession, VoteValue};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use itertools::Itertools;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Rows above which the result is flagged as large
const LARGE_RESULT_ROWS: usize = 7;

/// Rows printed to the terminal; the rest goes to --export
const MAX_PRINTED_ROWS: usize = 50;

#[derive(Parser)]
#[command(name = "askwarehouse")]
#[command(about = "Ask questions about the warehouse in plain language")]
struct Cli {
    /// Warehouse backend (default: local when APP_ENV=local, otherwise bigquery)
    #[arg(long, value_enum, global = true)]
    engine: Option<EngineKind>,

    /// Directory of CSV/Parquet tables for the local engine
    #[arg(long, default_value = "data", global = true)]
    data_dir: PathBuf,

    /// Schema catalog JSON (default: built-in grocery catalog)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// User id recorded on audit events
    #[arg(long, default_value = "cli", global = true)]
    user_id: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum EngineKind {
    Bigquery,
    Local,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a single question
    Ask {
        question: String,

        #[command(flatten)]
        filters: FilterArgs,

        /// Write the result table to a CSV file
        #[arg(long)]
        export: Option<PathBuf>,

        /// Print the final SQL
        #[arg(long)]
        show_sql: bool,
    },
    /// Interactive conversation with follow-ups and votes
    Chat {
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// List the tables the assistant can query
    Schemas,
    /// Run the safety filter on a SQL statement
    CheckSql { sql: String },
}

#[derive(Args, Clone, Default)]
struct FilterArgs {
    #[arg(long)]
    store: Option<String>,
    #[arg(long)]
    department: Option<String>,
    #[arg(long)]
    channel: Option<String>,
    /// Start of the date range (YYYY-MM-DD)
    #[arg(long)]
    from: Option<NaiveDate>,
    /// End of the date range (YYYY-MM-DD)
    #[arg(long)]
    to: Option<NaiveDate>,
}

impl From<FilterArgs> for Filters {
    fn from(args: FilterArgs) -> Self {
        Filters {
            store: args.store,
            department: args.department,
            channel: args.channel,
            date_from: args.from,
            date_to: args.to,
        }
    }
}

fn load_catalog(path: Option<&Path>, project: Option<&str>, dataset: Option<&str>) -> Result<SchemaCatalog> {
    match path {
        Some(p) => SchemaCatalog::from_json_file(p, project, dataset)
            .with_context(|| format!("loading catalog {}", p.display())),
        None => Ok(SchemaCatalog::grocery(project, dataset)),
    }
}

fn build_engine(cfg: &AppConfig, kind: EngineKind, data_dir: &Path) -> Result<Arc<dyn ExecutionEngine>> {
    match kind {
        EngineKind::Local => Ok(Arc::new(PolarsEngine::new(data_dir.to_path_buf()))),
        EngineKind::Bigquery => {
            let (project, token) = cfg.require_bigquery()?;
            Ok(Arc::new(BigQueryEngine::new(BigQueryClient::new(project, token)?)))
        }
    }
}

fn build_audit_sink(cfg: &AppConfig) -> Result<Arc<dyn AuditSink>> {
    let sink: Arc<dyn AuditSink> = match cfg.audit_sink {
        AuditSinkKind::BigQuery => {
            let (project, token) = cfg.require_bigquery()?;
            Arc::new(BigQueryAuditSink::new(
                BigQueryClient::new(project, token)?,
                cfg.bq_log_dataset.clone(),
                cfg.audit_tables.clone(),
            ))
        }
        AuditSinkKind::Jsonl => Arc::new(JsonlAuditSink::new(cfg.audit_path.clone(), cfg.audit_tables.clone())),
        AuditSinkKind::Sqlite => {
            let path = if cfg.audit_path.extension().is_some() {
                cfg.audit_path.clone()
            } else {
                cfg.audit_path.join("audit.db")
            };
            Arc::new(SqliteAuditSink::open(path, cfg.audit_tables.clone())?)
        }
        AuditSinkKind::None => Arc::new(NoopAuditSink),
    };
    Ok(sink)
}

/// Everything needed to run turns, built once before the first question
fn build_orchestrator(cli: &Cli, cfg: &AppConfig) -> Result<TurnOrchestrator> {
    let kind = cli.engine.unwrap_or(match cfg.app_env {
        AppEnv::Local => EngineKind::Local,
        AppEnv::Prod => EngineKind::Bigquery,
    });

    let catalog = match kind {
        EngineKind::Local => load_catalog(cli.catalog.as_deref(), None, None)?,
        EngineKind::Bigquery => load_catalog(
            cli.catalog.as_deref(),
            cfg.gcp_project.as_deref(),
            Some(&cfg.bq_dataset),
        )?,
    };

    let sql_model = LlmClient::new(cfg.openai_api_key.clone(), cfg.openai_model.clone())?
        .with_base_url(cfg.openai_base_url.clone());
    let summary_model = LlmClient::new(cfg.openai_api_key.clone(), cfg.openai_summary_model.clone())?
        .with_base_url(cfg.openai_base_url.clone())
        .with_temperature(0.2);
    let gateway = TextGenerationGateway::new(Arc::new(sql_model), Arc::new(summary_model), catalog);

    let engine = build_engine(cfg, kind, &cli.data_dir)?;
    let engine_name = engine.name();
    let executor = ExecutionAdapter::new(engine, cfg.execution_context());

    let audit = AuditEmitter::new(build_audit_sink(cfg)?, cfg.app_version.clone()).with_metadata(
        serde_json::json!({ "app_env": cfg.app_env.to_string(), "engine": engine_name }),
    );

    info!("Using {} engine, {:?} audit sink", engine_name, cfg.audit_sink);
    Ok(TurnOrchestrator::new(Arc::new(gateway), executor)
        .with_audit(audit)
        .with_config(cfg.orchestrator_config()))
}

fn print_table(table: &ResultTable) {
    if table.columns.is_empty() {
        return;
    }
    println!("{}", table.columns.iter().join(" | "));
    println!("{}", table.columns.iter().map(|c| "-".repeat(c.len().max(3))).join("-|-"));
    for row in table.rows.iter().take(MAX_PRINTED_ROWS) {
        println!("{}", row.iter().join(" | "));
    }
    if table.row_count() > MAX_PRINTED_ROWS {
        println!("... {} more rows", table.row_count() - MAX_PRINTED_ROWS);
    }
}

fn print_outcome(outcome: &TurnOutcome, show_sql: bool) {
    let turn = &outcome.turn;
    println!("\n{}\n", turn.summary());
    print_table(turn.result());
    println!(
        "\n[{}] {} attempt(s), {}s, {} row(s)",
        outcome.status,
        turn.attempt_count(),
        turn.duration().as_secs(),
        turn.result().row_count()
    );
    if turn.result().row_count() > LARGE_RESULT_ROWS {
        println!(
            "⚠️  Large result ({} rows). Consider narrowing the question or exporting with --export.",
            turn.result().row_count()
        );
    }
    if show_sql && !turn.sql().is_empty() {
        println!("\n```sql\n{}\n```", turn.sql());
    }
}

fn export_csv(table: &ResultTable, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    table.write_csv(file)?;
    println!("Exported {} row(s) to {}", table.row_count(), path.display());
    Ok(())
}

async fn chat(orchestrator: &TurnOrchestrator, user_id: &str, filters: Filters) -> Result<()> {
    let mut session = ConversationSession::new(user_id);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    println!("Ask a question. Commands: /follow <q>, /up [reason], /down [reason], /sql, /history, /quit");
    loop {
        stdout.write_all(b"\n> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, rest) = match line.split_once(' ') {
            Some((c, r)) if c.starts_with('/') => (c, r.trim()),
            _ if line.starts_with('/') => (line, ""),
            _ => ("", line),
        };

        match command {
            "/quit" | "/exit" => break,
            "/sql" => match session.last_turn() {
                Some(turn) if !turn.sql().is_empty() => println!("```sql\n{}\n```", turn.sql()),
                _ => println!("No SQL yet."),
            },
            "/history" => {
                for (i, turn) in session.history().iter().enumerate() {
                    let marker = if turn.is_follow_up() { "↳" } else { "•" };
                    println!(
                        "{} {}. {} [{}; {} rows]",
                        marker,
                        i + 1,
                        turn.question(),
                        turn.status(),
                        turn.result().row_count()
                    );
                }
            }
            "/up" | "/down" => {
                let value = if command == "/up" { VoteValue::Up } else { VoteValue::Down };
                let Some(turn_id) = session.last_turn().map(|t| t.id()) else {
                    println!("Nothing to vote on yet.");
                    continue;
                };
                let reason = Some(rest.to_string()).filter(|r| !r.is_empty());
                match orchestrator.record_vote(&mut session, turn_id, value, reason).await {
                    Ok(_) => println!("Thanks for the feedback ({}).", value),
                    Err(e) => error!("Vote failed: {}", e),
                }
            }
            "/follow" | "" => {
                if rest.is_empty() {
                    println!("Usage: /follow <question>");
                    continue;
                }
                let request = if command == "/follow" {
                    TurnRequest::follow_up(rest)
                } else {
                    TurnRequest::new(rest)
                }
                .with_filters(filters.clone());
                let (next, outcome) = orchestrator.run_turn(session, request).await;
                session = next;
                print_outcome(&outcome, false);
            }
            other => println!("Unknown command {}", other),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Command::Schemas => {
            let location = WarehouseLocation::from_env();
            let catalog = load_catalog(
                cli.catalog.as_deref(),
                location.gcp_project.as_deref(),
                Some(&location.bq_dataset),
            )?;
            for entry in catalog.entries() {
                println!("{}\n    {}", entry.id, entry.summary);
            }
        }
        Command::CheckSql { sql } => match QueryGuards::new().check(sql) {
            SafetyVerdict::Safe => println!("safe"),
            SafetyVerdict::Unsafe(reason) => {
                println!("unsafe: {}", reason);
                std::process::exit(1);
            }
        },
        Command::Ask {
            question,
            filters,
            export,
            show_sql,
        } => {
            let cfg = AppConfig::from_env()?;
            info!("Config: {}", cfg.describe());
            let orchestrator = build_orchestrator(&cli, &cfg)?;
            let session = ConversationSession::new(cli.user_id.clone());
            let request = TurnRequest::new(question.clone()).with_filters(filters.clone().into());
            let (_session, outcome) = orchestrator.run_turn(session, request).await;
            print_outcome(&outcome, *show_sql);
            if let Some(path) = export {
                export_csv(outcome.turn.result(), path)?;
            }
        }
        Command::Chat { filters } => {
            let cfg = AppConfig::from_env()?;
            info!("Config: {}", cfg.describe());
            let orchestrator = build_orchestrator(&cli, &cfg)?;
            chat(&orchestrator, &cli.user_id, filters.clone().into()).await?;
        }
    }

    Ok(())
}
