use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use access_gate_api::{
    AccessGateApi, HttpKnowledgeIndexer, HttpRiskScorer, MigrateResult, QueryDecision,
    ReviewRequest, SubmitQueryRequest, API_CONTRACT_VERSION,
};
use access_gate_core::{
    AccessRequest, AccessRequestId, GateError, PolicyConfig, ReviewOutcome, ReviewTicket,
    TicketId, TicketStatus,
};
use access_gate_store_sqlite::SchemaStatus;
use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Clone)]
struct ServiceState {
    api: AccessGateApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ReviewBody {
    outcome: ReviewOutcome,
    admin_id: String,
    notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TicketListParams {
    status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "access-gate-service")]
#[command(about = "Local HTTP service for the access gate")]
struct Args {
    #[arg(long, default_value = "./access_gate.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// JSON file of requester profiles.
    #[arg(long)]
    directory: PathBuf,
    #[arg(long, default_value = "http://127.0.0.1:5001/score")]
    scorer_url: String,
    #[arg(long, default_value_t = 2000)]
    scorer_timeout_ms: u64,
    /// Knowledge index endpoint; offers are skipped when unset.
    #[arg(long)]
    kb_url: Option<String>,
    /// Policy config overrides as JSON; defaults apply when unset.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

fn service_error(err: &anyhow::Error) -> ServiceError {
    let status = match err.downcast_ref::<GateError>() {
        Some(
            GateError::ProfileNotFound { .. }
            | GateError::RequestNotFound { .. }
            | GateError::TicketNotFound { .. },
        ) => StatusCode::NOT_FOUND,
        Some(GateError::InvalidTransition { .. }) => StatusCode::CONFLICT,
        Some(GateError::Validation(_) | GateError::Config(_)) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    ServiceError {
        status,
        service_contract_version: SERVICE_CONTRACT_VERSION,
        error: err.to_string(),
    }
}

fn bad_request(message: impl Into<String>) -> ServiceError {
    ServiceError {
        status: StatusCode::BAD_REQUEST,
        service_contract_version: SERVICE_CONTRACT_VERSION,
        error: message.into(),
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/query/submit", post(query_submit))
        .route("/v1/tickets", get(tickets_list))
        .route("/v1/tickets/:ticket_id", get(ticket_show))
        .route("/v1/tickets/:ticket_id/review", post(ticket_review))
        .route("/v1/access-requests", get(requests_list))
        .route("/v1/access-requests/:access_request_id", get(request_show))
        .with_state(state)
}

fn load_policy_config(path: Option<&std::path::Path>) -> Result<PolicyConfig> {
    let Some(path) = path else {
        return Ok(PolicyConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read policy config {}", path.display()))?;
    let config: PolicyConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse policy config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_policy_config(args.config.as_deref())?;
    let scorer_timeout = Duration::from_millis(args.scorer_timeout_ms);

    let directory = Arc::new(access_gate_api::JsonDirectory::from_file(&args.directory)?);
    let scorer = Arc::new(HttpRiskScorer::new(args.scorer_url, scorer_timeout));
    let indexer = args.kb_url.map(|url| {
        Arc::new(HttpKnowledgeIndexer::new(url, scorer_timeout))
            as Arc<dyn access_gate_api::KnowledgeIndexer + Send + Sync>
    });

    let api = AccessGateApi::new(args.db, config, directory, scorer, indexer)?;
    let state = ServiceState { api };

    tracing::info!(bind = %args.bind, "access gate service listening");
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| service_error(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn query_submit(
    State(state): State<ServiceState>,
    Json(request): Json<SubmitQueryRequest>,
) -> Result<Json<ServiceEnvelope<QueryDecision>>, ServiceError> {
    let decision = state.api.submit_query(request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(decision)))
}

async fn tickets_list(
    State(state): State<ServiceState>,
    Query(params): Query<TicketListParams>,
) -> Result<Json<ServiceEnvelope<Vec<ReviewTicket>>>, ServiceError> {
    let status = match params.status.as_deref() {
        None => None,
        Some(raw) => Some(
            TicketStatus::parse(raw)
                .ok_or_else(|| bad_request(format!("unknown ticket status: {raw}")))?,
        ),
    };
    let tickets = state.api.list_tickets(status).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(tickets)))
}

async fn ticket_show(
    State(state): State<ServiceState>,
    Path(ticket_id): Path<String>,
) -> Result<Json<ServiceEnvelope<ReviewTicket>>, ServiceError> {
    let ticket_id = parse_ticket_id(&ticket_id)?;
    let ticket = state.api.get_ticket(ticket_id).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(ticket)))
}

async fn ticket_review(
    State(state): State<ServiceState>,
    Path(ticket_id): Path<String>,
    Json(body): Json<ReviewBody>,
) -> Result<Json<ServiceEnvelope<ReviewTicket>>, ServiceError> {
    let ticket_id = parse_ticket_id(&ticket_id)?;
    let reviewed = state
        .api
        .review_ticket(ReviewRequest {
            ticket_id,
            outcome: body.outcome,
            admin_id: body.admin_id,
            notes: body.notes,
        })
        .map_err(|err| service_error(&err))?;
    Ok(Json(envelope(reviewed)))
}

async fn requests_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<AccessRequest>>>, ServiceError> {
    let requests = state.api.list_access_requests().map_err(|err| service_error(&err))?;
    Ok(Json(envelope(requests)))
}

async fn request_show(
    State(state): State<ServiceState>,
    Path(access_request_id): Path<String>,
) -> Result<Json<ServiceEnvelope<AccessRequest>>, ServiceError> {
    let parsed = Ulid::from_string(&access_request_id)
        .map_err(|err| bad_request(format!("invalid access_request_id: {err}")))?;
    let request = state
        .api
        .get_access_request(AccessRequestId(parsed))
        .map_err(|err| service_error(&err))?;
    Ok(Json(envelope(request)))
}

fn parse_ticket_id(raw: &str) -> Result<TicketId, ServiceError> {
    let parsed =
        Ulid::from_string(raw).map_err(|err| bad_request(format!("invalid ticket_id: {err}")))?;
    Ok(TicketId(parsed))
}
