use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use access_gate_core::{
    classify_risk, decide, AccessRequest, AccessRequestId, Decision, DecisionOutcome, GateError,
    PolicyConfig, RequesterProfile, ResourceContext, ReviewOutcome, ReviewTicket, RiskSignals,
    RiskTier, TicketId, TicketStatus, Verdict,
};
use access_gate_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Source of requester profiles. The gate never stores profiles itself; it
/// snapshots whatever the directory returns at decision time.
pub trait IdentityDirectory {
    /// # Errors
    /// Returns [`GateError`] when the directory backend fails.
    fn lookup(&self, requester_id: &str) -> Result<Option<RequesterProfile>, GateError>;
}

/// External model service producing per-query risk signals.
pub trait RiskScorer {
    /// # Errors
    /// Returns [`GateError::ScorerUnavailable`] when the scorer cannot be
    /// reached and [`GateError::ScorerMalformedOutput`] for unusable replies.
    fn score(
        &self,
        requester_id: &str,
        query_text: &str,
        resource: &ResourceContext,
    ) -> Result<RiskSignals, GateError>;
}

/// Optional downstream index fed with approved requests. Strictly best
/// effort: offer failures never affect the decision or the stored record.
pub trait KnowledgeIndexer {
    /// # Errors
    /// Returns an error when the index backend rejects the offer.
    fn offer(&self, request: &AccessRequest) -> Result<()>;
}

/// Caller-supplied submission payload. Timestamps are deliberately absent:
/// the gate assigns `created_at` itself, so a requester can never backdate a
/// submission past the training-recency check or forge the audit timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitQueryRequest {
    pub requester_id: String,
    pub query_text: String,
    pub resource: ResourceContext,
}

/// Full outcome of one gated submission, for trusted callers. The embedded
/// [`Verdict`] is the only part relayed to the requester.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryDecision {
    pub access_request_id: AccessRequestId,
    pub ticket_id: TicketId,
    pub risk_tier: Option<RiskTier>,
    pub verdict: Verdict,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewRequest {
    pub ticket_id: TicketId,
    pub outcome: ReviewOutcome,
    pub admin_id: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Clone)]
pub struct AccessGateApi {
    db_path: PathBuf,
    config: PolicyConfig,
    directory: Arc<dyn IdentityDirectory + Send + Sync>,
    scorer: Arc<dyn RiskScorer + Send + Sync>,
    indexer: Option<Arc<dyn KnowledgeIndexer + Send + Sync>>,
    clock: fn() -> OffsetDateTime,
}

impl AccessGateApi {
    /// # Errors
    /// Returns [`GateError::Config`] when the policy config is invalid.
    pub fn new(
        db_path: PathBuf,
        config: PolicyConfig,
        directory: Arc<dyn IdentityDirectory + Send + Sync>,
        scorer: Arc<dyn RiskScorer + Send + Sync>,
        indexer: Option<Arc<dyn KnowledgeIndexer + Send + Sync>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self { db_path, config, directory, scorer, indexer, clock: OffsetDateTime::now_utc })
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: fn() -> OffsetDateTime) -> Self {
        self.clock = clock;
        self
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Gate one query end to end: look up the requester, score the query,
    /// decide, persist the access request together with its Pending ticket,
    /// and return the decision with a sanitized verdict.
    ///
    /// `created_at` comes from the gate's own clock and doubles as the
    /// reference time for the training-recency rule.
    ///
    /// Scorer failures never surface to the caller: after one retry the gate
    /// denies fail-closed and records the request with no signals attached.
    ///
    /// # Errors
    /// Returns [`GateError::Validation`] for empty inputs,
    /// [`GateError::ProfileNotFound`] for unknown requesters, and an opaque
    /// error when persistence fails.
    pub fn submit_query(&self, input: SubmitQueryRequest) -> Result<QueryDecision> {
        if input.requester_id.trim().is_empty() {
            return Err(anyhow::Error::new(GateError::Validation(
                "requester_id MUST be non-empty".to_string(),
            )));
        }
        if input.query_text.trim().is_empty() {
            return Err(anyhow::Error::new(GateError::Validation(
                "query_text MUST be non-empty".to_string(),
            )));
        }

        let profile = self
            .directory
            .lookup(&input.requester_id)
            .map_err(anyhow::Error::new)?
            .ok_or_else(|| {
                anyhow::Error::new(GateError::ProfileNotFound {
                    requester_id: input.requester_id.clone(),
                })
            })?;

        let created_at = (self.clock)();

        let (risk_signals, risk_tier, decision) =
            match self.fetch_signals(&input.requester_id, &input.query_text, &input.resource) {
                Ok(signals) => {
                    let assessment = classify_risk(&signals, &self.config);
                    let decision = decide(
                        &profile,
                        assessment.tier,
                        &input.resource,
                        &signals,
                        &self.config,
                        created_at,
                    );
                    (Some(signals), Some(assessment.tier), decision)
                }
                Err(err) => {
                    tracing::warn!(
                        requester_id = %input.requester_id,
                        error = %err,
                        "risk scorer failed after retry; denying fail-closed"
                    );
                    (None, None, Decision::denied_unavailable())
                }
            };

        let request = AccessRequest {
            access_request_id: AccessRequestId::new(),
            requester_id: input.requester_id,
            query_text: input.query_text,
            requester_snapshot: profile,
            resource: input.resource,
            risk_signals,
            decision,
            created_at,
        };

        let mut store = self.open_migrated_store()?;
        let ticket = store.record_request(&request)?;

        tracing::info!(
            access_request_id = %request.access_request_id,
            ticket_id = %ticket.ticket_id,
            outcome = request.decision.outcome.as_str(),
            reason_code = request.decision.reason_code.as_str(),
            "access request recorded"
        );

        let verdict = match request.decision.outcome {
            DecisionOutcome::Approved => {
                self.offer_to_index(&request);
                Verdict::Approved { proceed_token: request.access_request_id.to_string() }
            }
            DecisionOutcome::Denied => {
                Verdict::Denied { reason: request.decision.reason_text.clone() }
            }
        };

        Ok(QueryDecision {
            access_request_id: request.access_request_id,
            ticket_id: ticket.ticket_id,
            risk_tier,
            verdict,
            created_at,
        })
    }

    fn fetch_signals(
        &self,
        requester_id: &str,
        query_text: &str,
        resource: &ResourceContext,
    ) -> Result<RiskSignals, GateError> {
        let signals = match self.scorer.score(requester_id, query_text, resource) {
            Ok(signals) => signals,
            Err(first_err) => {
                tracing::warn!(
                    requester_id = %requester_id,
                    error = %first_err,
                    "risk scorer failed; retrying once"
                );
                self.scorer.score(requester_id, query_text, resource)?
            }
        };
        signals.validate()?;
        Ok(signals)
    }

    /// Offer an approved request to the knowledge index on a detached
    /// thread. The record is already durable by the time this runs, and the
    /// verdict return never waits on the index.
    fn offer_to_index(&self, request: &AccessRequest) {
        let Some(indexer) = self.indexer.clone() else {
            return;
        };
        let request = request.clone();
        std::thread::spawn(move || {
            if let Err(err) = indexer.offer(&request) {
                tracing::warn!(
                    access_request_id = %request.access_request_id,
                    error = %err,
                    "knowledge index offer failed; continuing"
                );
            }
        });
    }

    /// Apply an administrator verdict to a pending ticket.
    ///
    /// # Errors
    /// Returns [`GateError::TicketNotFound`] for unknown tickets and
    /// [`GateError::InvalidTransition`] when the ticket already left Pending.
    pub fn review_ticket(&self, input: ReviewRequest) -> Result<ReviewTicket> {
        let mut store = self.open_migrated_store()?;
        let reviewed = store.review_ticket(
            input.ticket_id,
            input.outcome,
            &input.admin_id,
            input.notes.as_deref(),
            (self.clock)(),
        )?;

        tracing::info!(
            ticket_id = %reviewed.ticket_id,
            status = reviewed.status.as_str(),
            reviewed_by = input.admin_id,
            "review ticket resolved"
        );
        Ok(reviewed)
    }

    /// # Errors
    /// Returns [`GateError::TicketNotFound`] when no such ticket exists.
    pub fn get_ticket(&self, ticket_id: TicketId) -> Result<ReviewTicket> {
        let store = self.open_migrated_store()?;
        store
            .get_ticket(ticket_id)?
            .ok_or_else(|| anyhow::Error::new(GateError::TicketNotFound { ticket_id }))
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_tickets(&self, status: Option<TicketStatus>) -> Result<Vec<ReviewTicket>> {
        let store = self.open_migrated_store()?;
        store.list_tickets(status)
    }

    /// # Errors
    /// Returns [`GateError::RequestNotFound`] when no such access request exists.
    pub fn get_access_request(&self, access_request_id: AccessRequestId) -> Result<AccessRequest> {
        let store = self.open_migrated_store()?;
        store
            .get_access_request(access_request_id)?
            .ok_or_else(|| anyhow::Error::new(GateError::RequestNotFound { access_request_id }))
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_access_requests(&self) -> Result<Vec<AccessRequest>> {
        let store = self.open_migrated_store()?;
        store.list_access_requests()
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        let store = self.open_migrated_store()?;
        store.backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when the restore or post-restore migration fails.
    pub fn restore_database(&self, in_file: &Path) -> Result<()> {
        let mut store = self.open_store()?;
        store.restore_database(in_file)
    }

    /// # Errors
    /// Returns an error when an integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_migrated_store()?;
        store.integrity_check()
    }
}

/// Directory backed by a JSON file of requester profiles, loaded once at
/// startup. Mirrors the operational shape of an HR feed export.
#[derive(Debug, Clone, Default)]
pub struct JsonDirectory {
    profiles: HashMap<String, RequesterProfile>,
}

impl JsonDirectory {
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read directory file {}", path.display()))?;
        let profiles: Vec<RequesterProfile> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse directory file {}", path.display()))?;
        Ok(Self::from_profiles(profiles))
    }

    #[must_use]
    pub fn from_profiles(profiles: Vec<RequesterProfile>) -> Self {
        let profiles = profiles
            .into_iter()
            .map(|profile| (profile.requester_id.clone(), profile))
            .collect();
        Self { profiles }
    }
}

impl IdentityDirectory for JsonDirectory {
    fn lookup(&self, requester_id: &str) -> Result<Option<RequesterProfile>, GateError> {
        Ok(self.profiles.get(requester_id).cloned())
    }
}

#[derive(Debug, Serialize)]
struct ScoreRequestBody<'a> {
    requester_id: &'a str,
    query_text: &'a str,
    resource_type: &'a str,
    sensitivity: &'a str,
}

/// Risk scorer over HTTP: one POST per query, bounded by a request timeout so
/// a wedged model service degrades into the fail-closed path instead of
/// stalling submissions.
pub struct HttpRiskScorer {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpRiskScorer {
    #[must_use]
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { endpoint, agent }
    }
}

impl RiskScorer for HttpRiskScorer {
    fn score(
        &self,
        requester_id: &str,
        query_text: &str,
        resource: &ResourceContext,
    ) -> Result<RiskSignals, GateError> {
        let response = self
            .agent
            .post(&self.endpoint)
            .send_json(ScoreRequestBody {
                requester_id,
                query_text,
                resource_type: &resource.resource_type,
                sensitivity: resource.sensitivity.as_str(),
            })
            .map_err(|err| GateError::ScorerUnavailable(err.to_string()))?;

        response
            .into_json::<RiskSignals>()
            .map_err(|err| GateError::ScorerMalformedOutput(err.to_string()))
    }
}

/// Knowledge index client over HTTP. Offers are fire-and-forget from the
/// caller's point of view; errors are reported upward only for logging.
pub struct HttpKnowledgeIndexer {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpKnowledgeIndexer {
    #[must_use]
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { endpoint, agent }
    }
}

impl KnowledgeIndexer for HttpKnowledgeIndexer {
    fn offer(&self, request: &AccessRequest) -> Result<()> {
        self.agent
            .post(&self.endpoint)
            .send_json(request)
            .map(|_| ())
            .with_context(|| format!("knowledge index offer failed for {}", self.endpoint))
    }
}
