use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use access_gate_api::{
    AccessGateApi, HttpKnowledgeIndexer, HttpRiskScorer, JsonDirectory, KnowledgeIndexer,
    RiskScorer, SubmitQueryRequest,
};
use access_gate_core::{
    AccessRequestId, GateError, PolicyConfig, ResourceContext, ResourceSensitivity, ReviewOutcome,
    RiskSignals, TicketId, TicketStatus,
};
use access_gate_store_sqlite::SqliteStore;
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "agate")]
#[command(about = "Access Gate CLI")]
struct Cli {
    #[arg(long, default_value = "./access_gate.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Submit(Box<SubmitArgs>),
    Tickets {
        #[command(subcommand)]
        command: Box<TicketCommand>,
    },
    Requests {
        #[command(subcommand)]
        command: Box<RequestCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct SubmitArgs {
    #[arg(long)]
    requester_id: String,
    #[arg(long)]
    query_text: String,
    #[arg(long)]
    resource_type: String,
    #[arg(long)]
    sensitivity: SensitivityArg,
    #[arg(long)]
    request_reason: Option<String>,
    /// JSON file of requester profiles.
    #[arg(long)]
    directory: PathBuf,
    #[arg(long, default_value = "http://127.0.0.1:5001/score")]
    scorer_url: String,
    #[arg(long, default_value_t = 2000)]
    scorer_timeout_ms: u64,
    /// Score from a fixed signals JSON file instead of the HTTP scorer.
    #[arg(long)]
    signals_file: Option<PathBuf>,
    /// Knowledge index endpoint; offers are skipped when unset.
    #[arg(long)]
    kb_url: Option<String>,
    /// Policy config overrides as JSON; defaults apply when unset.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum TicketCommand {
    List(TicketListArgs),
    Show(TicketShowArgs),
    Review(TicketReviewArgs),
}

#[derive(Debug, Args)]
struct TicketListArgs {
    #[arg(long)]
    status: Option<StatusArg>,
}

#[derive(Debug, Args)]
struct TicketShowArgs {
    #[arg(long)]
    ticket_id: String,
}

#[derive(Debug, Args)]
struct TicketReviewArgs {
    #[arg(long)]
    ticket_id: String,
    #[arg(long)]
    outcome: OutcomeArg,
    #[arg(long)]
    admin_id: String,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Subcommand)]
enum RequestCommand {
    List,
    Show(RequestShowArgs),
}

#[derive(Debug, Args)]
struct RequestShowArgs {
    #[arg(long)]
    access_request_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SensitivityArg {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Pending,
    Approved,
    Denied,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutcomeArg {
    Approved,
    Denied,
}

impl SensitivityArg {
    fn into_sensitivity(self) -> ResourceSensitivity {
        match self {
            Self::Low => ResourceSensitivity::Low,
            Self::Medium => ResourceSensitivity::Medium,
            Self::High => ResourceSensitivity::High,
        }
    }
}

impl StatusArg {
    fn into_status(self) -> TicketStatus {
        match self {
            Self::Pending => TicketStatus::Pending,
            Self::Approved => TicketStatus::Approved,
            Self::Denied => TicketStatus::Denied,
        }
    }
}

impl OutcomeArg {
    fn into_outcome(self) -> ReviewOutcome {
        match self {
            Self::Approved => ReviewOutcome::Approved,
            Self::Denied => ReviewOutcome::Denied,
        }
    }
}

/// Replays signals from a JSON file, standing in for the HTTP scorer during
/// offline runs.
struct FileScorer {
    path: PathBuf,
}

impl RiskScorer for FileScorer {
    fn score(
        &self,
        _requester_id: &str,
        _query_text: &str,
        _resource: &ResourceContext,
    ) -> Result<RiskSignals, GateError> {
        let raw = fs::read_to_string(&self.path).map_err(|err| {
            GateError::ScorerUnavailable(format!(
                "failed to read signals file {}: {err}",
                self.path.display()
            ))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            GateError::ScorerMalformedOutput(format!(
                "failed to parse signals file {}: {err}",
                self.path.display()
            ))
        })
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &mut store)
        }
        Command::Submit(args) => run_submit(&cli.db, *args),
        Command::Tickets { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            store.migrate()?;
            run_tickets(*command, &mut store)
        }
        Command::Requests { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            store.migrate()?;
            run_requests(*command, &store)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let before = store.schema_status()?;
            if args.dry_run {
                return emit_json(serde_json::json!({
                    "dry_run": true,
                    "current_version": before.current_version,
                    "target_version": before.target_version,
                    "would_apply_versions": before.pending_versions
                }));
            }

            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "dry_run": false,
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "target_version": after.target_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            store.restore_database(&args.input)?;
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            store.migrate()?;
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_submit(db: &Path, args: SubmitArgs) -> Result<()> {
    let config = match args.config.as_deref() {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read policy config {}", path.display()))?;
            serde_json::from_str::<PolicyConfig>(&raw)
                .with_context(|| format!("failed to parse policy config {}", path.display()))?
        }
        None => PolicyConfig::default(),
    };

    let timeout = Duration::from_millis(args.scorer_timeout_ms);
    let directory = Arc::new(JsonDirectory::from_file(&args.directory)?);
    let scorer: Arc<dyn RiskScorer + Send + Sync> = match args.signals_file {
        Some(path) => Arc::new(FileScorer { path }),
        None => Arc::new(HttpRiskScorer::new(args.scorer_url, timeout)),
    };
    let indexer = args.kb_url.map(|url| {
        Arc::new(HttpKnowledgeIndexer::new(url, timeout))
            as Arc<dyn KnowledgeIndexer + Send + Sync>
    });

    let api = AccessGateApi::new(db.to_path_buf(), config, directory, scorer, indexer)?;
    let decision = api.submit_query(SubmitQueryRequest {
        requester_id: args.requester_id,
        query_text: args.query_text,
        resource: ResourceContext {
            resource_type: args.resource_type,
            sensitivity: args.sensitivity.into_sensitivity(),
            request_reason: args.request_reason,
        },
    })?;

    emit_json(serde_json::to_value(&decision).context("failed to serialize query decision")?)
}

fn run_tickets(command: TicketCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        TicketCommand::List(args) => {
            let tickets = store.list_tickets(args.status.map(StatusArg::into_status))?;
            emit_json(serde_json::json!({ "tickets": tickets }))
        }
        TicketCommand::Show(args) => {
            let ticket_id = parse_ticket_id(&args.ticket_id)?;
            let ticket = store
                .get_ticket(ticket_id)?
                .ok_or_else(|| anyhow!("review ticket not found: {ticket_id}"))?;
            emit_json(serde_json::to_value(&ticket).context("failed to serialize ticket")?)
        }
        TicketCommand::Review(args) => {
            let ticket_id = parse_ticket_id(&args.ticket_id)?;
            let reviewed = store.review_ticket(
                ticket_id,
                args.outcome.into_outcome(),
                &args.admin_id,
                args.notes.as_deref(),
                OffsetDateTime::now_utc(),
            )?;
            emit_json(serde_json::to_value(&reviewed).context("failed to serialize ticket")?)
        }
    }
}

fn run_requests(command: RequestCommand, store: &SqliteStore) -> Result<()> {
    match command {
        RequestCommand::List => {
            let requests = store.list_access_requests()?;
            emit_json(serde_json::json!({ "access_requests": requests }))
        }
        RequestCommand::Show(args) => {
            let access_request_id = parse_access_request_id(&args.access_request_id)?;
            let request = store
                .get_access_request(access_request_id)?
                .ok_or_else(|| anyhow!("access request not found: {access_request_id}"))?;
            emit_json(serde_json::to_value(&request).context("failed to serialize access request")?)
        }
    }
}

fn parse_ticket_id(value: &str) -> Result<TicketId> {
    let parsed = Ulid::from_string(value).with_context(|| format!("invalid ULID: {value}"))?;
    Ok(TicketId(parsed))
}

fn parse_access_request_id(value: &str) -> Result<AccessRequestId> {
    let parsed = Ulid::from_string(value).with_context(|| format!("invalid ULID: {value}"))?;
    Ok(AccessRequestId(parsed))
}
