use std::fs;
use std::path::Path;

use access_gate_core::{
    AccessRequest, AccessRequestId, Decision, DecisionOutcome, EmploymentStatus, GateError,
    ReasonCode, RequesterProfile, ResourceContext, ResourceSensitivity, ReviewOutcome,
    ReviewTicket, RiskSignals, TicketId, TicketStatus,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS access_requests (
  access_request_id TEXT PRIMARY KEY,
  requester_id TEXT NOT NULL,
  query_text TEXT NOT NULL,
  department TEXT NOT NULL,
  role TEXT NOT NULL,
  employment_status TEXT NOT NULL CHECK (employment_status IN ('active','suspended','terminated')),
  joined_at TEXT NOT NULL,
  time_in_position TEXT NOT NULL,
  past_violations INTEGER NOT NULL CHECK (past_violations >= 0),
  last_security_training TEXT,
  resource_type TEXT NOT NULL,
  resource_sensitivity TEXT NOT NULL CHECK (resource_sensitivity IN ('low','medium','high')),
  request_reason TEXT,
  anomaly_score REAL,
  anomaly_prediction INTEGER,
  classifier_probability REAL,
  classifier_prediction INTEGER,
  decision_outcome TEXT NOT NULL CHECK (decision_outcome IN ('approved','denied')),
  reason_code TEXT NOT NULL CHECK (reason_code IN (
    'inactive_employment','high_risk_sensitive_resource','violation_history',
    'training_not_current','risk_probability_exceeded','risk_assessment_unavailable',
    'no_disqualifying_signal'
  )),
  reason_text TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS review_tickets (
  ticket_id TEXT PRIMARY KEY,
  access_request_id TEXT NOT NULL UNIQUE,
  status TEXT NOT NULL CHECK (status IN ('pending','approved','denied')),
  admin_notes TEXT,
  reviewed_by TEXT,
  reviewed_at TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (access_request_id) REFERENCES access_requests(access_request_id)
);

CREATE INDEX IF NOT EXISTS idx_access_requests_created_at ON access_requests(created_at);
CREATE INDEX IF NOT EXISTS idx_access_requests_requester ON access_requests(requester_id);
CREATE INDEX IF NOT EXISTS idx_review_tickets_status ON review_tickets(status);
CREATE INDEX IF NOT EXISTS idx_review_tickets_created_at ON review_tickets(created_at);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed gate store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration_1()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 1")?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![1_i64, now_rfc3339()?],
        )
        .context("failed to record migration version 1")?;
        tx.commit().context("failed to commit migration 1")?;
        Ok(())
    }

    /// Persist one access request and its Pending review ticket in a single
    /// transaction. Exactly one ticket exists per request from the instant the
    /// request becomes durable.
    ///
    /// # Errors
    /// Returns an error when validation fails or any write in the transaction fails.
    pub fn record_request(&mut self, request: &AccessRequest) -> Result<ReviewTicket> {
        request.validate().map_err(|err| anyhow!("access request validation failed: {err}"))?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        Self::insert_request_tx(&tx, request)?;
        let ticket = ReviewTicket::pending(request.access_request_id, request.created_at);
        Self::insert_ticket_tx(&tx, &ticket)?;
        tx.commit().context("failed to commit access request transaction")?;
        Ok(ticket)
    }

    /// Idempotent ticket creation for retry paths: when a ticket already
    /// exists for the request it is returned unchanged (duplicate creation is
    /// a no-op, not an error).
    ///
    /// # Errors
    /// Returns an error when the access request does not exist or writes fail.
    pub fn create_ticket(&mut self, access_request_id: AccessRequestId) -> Result<ReviewTicket> {
        let tx = self.conn.transaction().context("failed to start transaction")?;

        if let Some(existing) = Self::ticket_for_request_tx(&tx, access_request_id)? {
            return Ok(existing);
        }

        let request_created_at: Option<String> = tx
            .query_row(
                "SELECT created_at FROM access_requests WHERE access_request_id = ?1",
                params![access_request_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up access request for ticket creation")?;
        let Some(request_created_at) = request_created_at else {
            return Err(anyhow!("access request not found: {access_request_id}"));
        };

        let ticket =
            ReviewTicket::pending(access_request_id, parse_rfc3339(&request_created_at)?);
        Self::insert_ticket_tx(&tx, &ticket)?;
        tx.commit().context("failed to commit ticket creation")?;
        Ok(ticket)
    }

    /// Transition a Pending ticket to its terminal state, exactly once.
    ///
    /// The UPDATE is a compare-and-swap: it only matches while the observed
    /// status is still `pending`, so of two concurrent review attempts exactly
    /// one succeeds and the loser observes `InvalidTransition` with every
    /// audit field untouched.
    ///
    /// # Errors
    /// Returns [`GateError::TicketNotFound`] for unknown tickets,
    /// [`GateError::InvalidTransition`] for already-terminal tickets, and an
    /// opaque error when persistence itself fails.
    pub fn review_ticket(
        &mut self,
        ticket_id: TicketId,
        outcome: ReviewOutcome,
        admin_id: &str,
        notes: Option<&str>,
        reviewed_at: OffsetDateTime,
    ) -> Result<ReviewTicket> {
        if admin_id.trim().is_empty() {
            return Err(anyhow!("admin_id MUST be provided for every review"));
        }

        let tx = self.conn.transaction().context("failed to start transaction")?;
        let updated = tx
            .execute(
                "UPDATE review_tickets
                 SET status = ?1, admin_notes = ?2, reviewed_by = ?3, reviewed_at = ?4
                 WHERE ticket_id = ?5 AND status = 'pending'",
                params![
                    outcome.ticket_status().as_str(),
                    notes,
                    admin_id,
                    rfc3339(reviewed_at)?,
                    ticket_id.to_string(),
                ],
            )
            .context("failed to apply ticket transition")?;

        if updated == 0 {
            let status: Option<String> = tx
                .query_row(
                    "SELECT status FROM review_tickets WHERE ticket_id = ?1",
                    params![ticket_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to inspect ticket status")?;

            return match status {
                None => Err(anyhow::Error::new(GateError::TicketNotFound { ticket_id })),
                Some(raw) => {
                    let status = TicketStatus::parse(&raw)
                        .ok_or_else(|| anyhow!("unknown ticket status: {raw}"))?;
                    Err(anyhow::Error::new(GateError::InvalidTransition { ticket_id, status }))
                }
            };
        }

        tx.commit().context("failed to commit ticket transition")?;
        self.get_ticket(ticket_id)?
            .ok_or_else(|| anyhow!("reviewed ticket vanished: {ticket_id}"))
    }

    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_ticket(&self, ticket_id: TicketId) -> Result<Option<ReviewTicket>> {
        let mut stmt = self.conn.prepare(
            "SELECT ticket_id, access_request_id, status, admin_notes, reviewed_by, reviewed_at, created_at
             FROM review_tickets WHERE ticket_id = ?1",
        )?;
        let mut rows = stmt.query(params![ticket_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(decode_ticket_row(row)?)),
            None => Ok(None),
        }
    }

    /// List review tickets, newest first, optionally filtered by status.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_tickets(&self, status: Option<TicketStatus>) -> Result<Vec<ReviewTicket>> {
        let base = "SELECT ticket_id, access_request_id, status, admin_notes, reviewed_by, reviewed_at, created_at
             FROM review_tickets";
        let order = " ORDER BY created_at DESC, ticket_id ASC";

        let mut tickets = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = self.conn.prepare(&format!("{base} WHERE status = ?1{order}"))?;
                let mut rows = stmt.query(params![status.as_str()])?;
                while let Some(row) = rows.next()? {
                    tickets.push(decode_ticket_row(row)?);
                }
            }
            None => {
                let mut stmt = self.conn.prepare(&format!("{base}{order}"))?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    tickets.push(decode_ticket_row(row)?);
                }
            }
        }
        Ok(tickets)
    }

    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_access_request(
        &self,
        access_request_id: AccessRequestId,
    ) -> Result<Option<AccessRequest>> {
        let mut stmt = self.conn.prepare(&format!(
            "{ACCESS_REQUEST_COLUMNS} WHERE access_request_id = ?1"
        ))?;
        let mut rows = stmt.query(params![access_request_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(decode_request_row(row)?)),
            None => Ok(None),
        }
    }

    /// List all access requests, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_access_requests(&self) -> Result<Vec<AccessRequest>> {
        let mut stmt = self.conn.prepare(&format!(
            "{ACCESS_REQUEST_COLUMNS} ORDER BY created_at DESC, access_request_id ASC"
        ))?;
        let mut rows = stmt.query([])?;
        let mut requests = Vec::new();
        while let Some(row) = rows.next()? {
            requests.push(decode_request_row(row)?);
        }
        Ok(requests)
    }

    /// Write a consistent online backup of the database to `out_file`.
    ///
    /// # Errors
    /// Returns an error when the backup cannot be created.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a SQLite backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    fn insert_request_tx(tx: &rusqlite::Transaction<'_>, request: &AccessRequest) -> Result<()> {
        let snapshot = &request.requester_snapshot;
        tx.execute(
            "INSERT INTO access_requests(
                access_request_id, requester_id, query_text,
                department, role, employment_status, joined_at, time_in_position,
                past_violations, last_security_training,
                resource_type, resource_sensitivity, request_reason,
                anomaly_score, anomaly_prediction, classifier_probability, classifier_prediction,
                decision_outcome, reason_code, reason_text, created_at
            ) VALUES (
                ?1, ?2, ?3,
                ?4, ?5, ?6, ?7, ?8,
                ?9, ?10,
                ?11, ?12, ?13,
                ?14, ?15, ?16, ?17,
                ?18, ?19, ?20, ?21
            )",
            params![
                request.access_request_id.to_string(),
                request.requester_id,
                request.query_text,
                snapshot.department,
                snapshot.role,
                snapshot.employment_status.as_str(),
                rfc3339(snapshot.joined_at)?,
                snapshot.time_in_position,
                i64::from(snapshot.past_violations),
                snapshot.last_security_training.map(rfc3339).transpose()?,
                request.resource.resource_type,
                request.resource.sensitivity.as_str(),
                request.resource.request_reason,
                request.risk_signals.as_ref().map(|signals| signals.anomaly_score),
                request.risk_signals.as_ref().map(|signals| signals.anomaly_prediction),
                request.risk_signals.as_ref().map(|signals| signals.classifier_probability),
                request.risk_signals.as_ref().map(|signals| signals.classifier_prediction),
                request.decision.outcome.as_str(),
                request.decision.reason_code.as_str(),
                request.decision.reason_text,
                rfc3339(request.created_at)?,
            ],
        )
        .context("failed to insert access request")?;
        Ok(())
    }

    fn insert_ticket_tx(tx: &rusqlite::Transaction<'_>, ticket: &ReviewTicket) -> Result<()> {
        tx.execute(
            "INSERT INTO review_tickets(
                ticket_id, access_request_id, status, admin_notes, reviewed_by, reviewed_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                ticket.ticket_id.to_string(),
                ticket.access_request_id.to_string(),
                ticket.status.as_str(),
                ticket.admin_notes,
                ticket.reviewed_by,
                ticket.reviewed_at.map(rfc3339).transpose()?,
                rfc3339(ticket.created_at)?,
            ],
        )
        .context("failed to insert review ticket")?;
        Ok(())
    }

    fn ticket_for_request_tx(
        tx: &rusqlite::Transaction<'_>,
        access_request_id: AccessRequestId,
    ) -> Result<Option<ReviewTicket>> {
        let mut stmt = tx.prepare(
            "SELECT ticket_id, access_request_id, status, admin_notes, reviewed_by, reviewed_at, created_at
             FROM review_tickets WHERE access_request_id = ?1",
        )?;
        let mut rows = stmt.query(params![access_request_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(decode_ticket_row(row)?)),
            None => Ok(None),
        }
    }
}

const ACCESS_REQUEST_COLUMNS: &str = "SELECT
    access_request_id, requester_id, query_text,
    department, role, employment_status, joined_at, time_in_position,
    past_violations, last_security_training,
    resource_type, resource_sensitivity, request_reason,
    anomaly_score, anomaly_prediction, classifier_probability, classifier_prediction,
    decision_outcome, reason_code, reason_text, created_at
 FROM access_requests";

fn decode_request_row(row: &rusqlite::Row<'_>) -> Result<AccessRequest> {
    let access_request_id_raw: String = row.get(0)?;
    let employment_status_raw: String = row.get(5)?;
    let sensitivity_raw: String = row.get(11)?;
    let outcome_raw: String = row.get(17)?;
    let reason_code_raw: String = row.get(18)?;

    let requester_id: String = row.get(1)?;
    let snapshot = RequesterProfile {
        requester_id: requester_id.clone(),
        department: row.get(3)?,
        role: row.get(4)?,
        employment_status: EmploymentStatus::parse(&employment_status_raw)
            .ok_or_else(|| anyhow!("unknown employment_status: {employment_status_raw}"))?,
        joined_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
        time_in_position: row.get(7)?,
        past_violations: row.get::<_, u32>(8)?,
        last_security_training: row
            .get::<_, Option<String>>(9)?
            .map(|raw| parse_rfc3339(&raw))
            .transpose()?,
    };

    let anomaly_score: Option<f64> = row.get(13)?;
    let risk_signals = match anomaly_score {
        Some(anomaly_score) => Some(RiskSignals {
            anomaly_score,
            anomaly_prediction: row
                .get::<_, Option<bool>>(14)?
                .ok_or_else(|| anyhow!("anomaly_prediction missing alongside anomaly_score"))?,
            classifier_probability: row
                .get::<_, Option<f64>>(15)?
                .ok_or_else(|| anyhow!("classifier_probability missing alongside anomaly_score"))?,
            classifier_prediction: row
                .get::<_, Option<bool>>(16)?
                .ok_or_else(|| anyhow!("classifier_prediction missing alongside anomaly_score"))?,
        }),
        None => None,
    };

    Ok(AccessRequest {
        access_request_id: parse_access_request_id(&access_request_id_raw)?,
        requester_id,
        query_text: row.get(2)?,
        requester_snapshot: snapshot,
        resource: ResourceContext {
            resource_type: row.get(10)?,
            sensitivity: ResourceSensitivity::parse(&sensitivity_raw)
                .ok_or_else(|| anyhow!("unknown resource_sensitivity: {sensitivity_raw}"))?,
            request_reason: row.get(12)?,
        },
        risk_signals,
        decision: Decision {
            outcome: DecisionOutcome::parse(&outcome_raw)
                .ok_or_else(|| anyhow!("unknown decision_outcome: {outcome_raw}"))?,
            reason_code: ReasonCode::parse(&reason_code_raw)
                .ok_or_else(|| anyhow!("unknown reason_code: {reason_code_raw}"))?,
            reason_text: row.get(19)?,
        },
        created_at: parse_rfc3339(&row.get::<_, String>(20)?)?,
    })
}

fn decode_ticket_row(row: &rusqlite::Row<'_>) -> Result<ReviewTicket> {
    let ticket_id_raw: String = row.get(0)?;
    let access_request_id_raw: String = row.get(1)?;
    let status_raw: String = row.get(2)?;

    Ok(ReviewTicket {
        ticket_id: parse_ticket_id(&ticket_id_raw)?,
        access_request_id: parse_access_request_id(&access_request_id_raw)?,
        status: TicketStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown ticket status: {status_raw}"))?,
        admin_notes: row.get(3)?,
        reviewed_by: row.get(4)?,
        reviewed_at: row
            .get::<_, Option<String>>(5)?
            .map(|raw| parse_rfc3339(&raw))
            .transpose()?,
        created_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
    })
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format rfc3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid rfc3339 timestamp: {value}"))
}

fn parse_access_request_id(raw: &str) -> Result<AccessRequestId> {
    let parsed = Ulid::from_string(raw)
        .map_err(|err| anyhow!("invalid access_request_id {raw}: {err}"))?;
    Ok(AccessRequestId(parsed))
}

fn parse_ticket_id(raw: &str) -> Result<TicketId> {
    let parsed = Ulid::from_string(raw).map_err(|err| anyhow!("invalid ticket_id {raw}: {err}"))?;
    Ok(TicketId(parsed))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")?;
    Ok(version.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::thread;

    use access_gate_core::{ReasonCode, ReviewOutcome};
    use time::Duration;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn unique_temp_db_path(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("accessgate-{prefix}-{}.sqlite3", Ulid::new()))
    }

    fn open_migrated(path: &Path) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    fn mk_request(decision: Decision, signals: Option<RiskSignals>) -> AccessRequest {
        AccessRequest {
            access_request_id: AccessRequestId::new(),
            requester_id: "emp-1042".to_string(),
            query_text: "total payroll by department".to_string(),
            requester_snapshot: RequesterProfile {
                requester_id: "emp-1042".to_string(),
                department: "finance".to_string(),
                role: "analyst".to_string(),
                employment_status: EmploymentStatus::Active,
                joined_at: fixture_time() - Duration::days(900),
                time_in_position: "2 years".to_string(),
                past_violations: 0,
                last_security_training: Some(fixture_time() - Duration::days(30)),
            },
            resource: ResourceContext {
                resource_type: "payroll_database".to_string(),
                sensitivity: ResourceSensitivity::High,
                request_reason: Some("quarterly audit".to_string()),
            },
            risk_signals: signals,
            decision,
            created_at: fixture_time(),
        }
    }

    fn approved_request() -> AccessRequest {
        mk_request(
            Decision::approved(),
            Some(RiskSignals {
                anomaly_score: 0.4,
                anomaly_prediction: false,
                classifier_probability: 0.2,
                classifier_prediction: false,
            }),
        )
    }

    fn cleanup(path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let candidate = if suffix.is_empty() {
                path.to_path_buf()
            } else {
                PathBuf::from(format!("{}{suffix}", path.display()))
            };
            if candidate.exists() {
                let _ = fs::remove_file(&candidate);
            }
        }
    }

    #[test]
    fn migrate_reaches_latest_and_reports_clean_status() -> Result<()> {
        let db_path = unique_temp_db_path("migrate");
        let store = open_migrated(&db_path)?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn record_request_creates_pending_ticket_and_round_trips() -> Result<()> {
        let db_path = unique_temp_db_path("roundtrip");
        let mut store = open_migrated(&db_path)?;

        let request = approved_request();
        let ticket = store.record_request(&request)?;
        assert_eq!(ticket.status, TicketStatus::Pending);
        assert_eq!(ticket.access_request_id, request.access_request_id);
        assert_eq!(ticket.created_at, request.created_at);

        let loaded = store
            .get_access_request(request.access_request_id)?
            .ok_or_else(|| anyhow!("request missing after write"))?;
        assert_eq!(loaded, request);

        let loaded_ticket = store
            .get_ticket(ticket.ticket_id)?
            .ok_or_else(|| anyhow!("ticket missing after write"))?;
        assert_eq!(loaded_ticket, ticket);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn signal_less_fail_closed_request_round_trips() -> Result<()> {
        let db_path = unique_temp_db_path("failclosed");
        let mut store = open_migrated(&db_path)?;

        let request = mk_request(Decision::denied_unavailable(), None);
        store.record_request(&request)?;

        let loaded = store
            .get_access_request(request.access_request_id)?
            .ok_or_else(|| anyhow!("request missing after write"))?;
        assert!(loaded.risk_signals.is_none());
        assert_eq!(loaded.decision.reason_code, ReasonCode::RiskAssessmentUnavailable);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn duplicate_ticket_creation_returns_existing_ticket() -> Result<()> {
        let db_path = unique_temp_db_path("dup-ticket");
        let mut store = open_migrated(&db_path)?;

        let request = approved_request();
        let ticket = store.record_request(&request)?;
        let again = store.create_ticket(request.access_request_id)?;
        assert_eq!(again, ticket);

        assert_eq!(store.list_tickets(None)?.len(), 1);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn create_ticket_rejects_unknown_request() -> Result<()> {
        let db_path = unique_temp_db_path("orphan-ticket");
        let mut store = open_migrated(&db_path)?;

        assert!(store.create_ticket(AccessRequestId::new()).is_err());

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn review_sets_audit_fields_and_blocks_re_review() -> Result<()> {
        let db_path = unique_temp_db_path("review");
        let mut store = open_migrated(&db_path)?;

        let request = approved_request();
        let ticket = store.record_request(&request)?;

        let reviewed = store.review_ticket(
            ticket.ticket_id,
            ReviewOutcome::Approved,
            "admin-7",
            Some("verified manually"),
            fixture_time() + Duration::hours(1),
        )?;
        assert_eq!(reviewed.status, TicketStatus::Approved);
        assert_eq!(reviewed.reviewed_by.as_deref(), Some("admin-7"));
        assert_eq!(reviewed.admin_notes.as_deref(), Some("verified manually"));
        assert!(reviewed.reviewed_at.is_some());
        reviewed.validate().map_err(|err| anyhow!("reviewed ticket invalid: {err}"))?;

        let err = match store.review_ticket(
            ticket.ticket_id,
            ReviewOutcome::Denied,
            "admin-8",
            None,
            fixture_time() + Duration::hours(2),
        ) {
            Ok(_) => return Err(anyhow!("re-review must fail")),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<GateError>(),
            Some(GateError::InvalidTransition { status: TicketStatus::Approved, .. })
        ));

        // The losing attempt must not have touched any field.
        let unchanged = store
            .get_ticket(ticket.ticket_id)?
            .ok_or_else(|| anyhow!("ticket missing after failed re-review"))?;
        assert_eq!(unchanged, reviewed);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn review_of_unknown_ticket_is_typed_not_found() -> Result<()> {
        let db_path = unique_temp_db_path("review-missing");
        let mut store = open_migrated(&db_path)?;

        let err = match store.review_ticket(
            TicketId::new(),
            ReviewOutcome::Approved,
            "admin-7",
            None,
            fixture_time(),
        ) {
            Ok(_) => return Err(anyhow!("review of unknown ticket must fail")),
            Err(err) => err,
        };
        assert!(matches!(err.downcast_ref::<GateError>(), Some(GateError::TicketNotFound { .. })));

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn list_tickets_filters_by_status_and_orders_newest_first() -> Result<()> {
        let db_path = unique_temp_db_path("list");
        let mut store = open_migrated(&db_path)?;

        let mut older = approved_request();
        older.created_at = fixture_time() - Duration::hours(3);
        let older_ticket = store.record_request(&older)?;

        let newer = approved_request();
        let newer_ticket = store.record_request(&newer)?;

        store.review_ticket(
            older_ticket.ticket_id,
            ReviewOutcome::Denied,
            "admin-7",
            Some("escalated"),
            fixture_time(),
        )?;

        let all = store.list_tickets(None)?;
        assert_eq!(
            all.iter().map(|ticket| ticket.ticket_id).collect::<Vec<_>>(),
            vec![newer_ticket.ticket_id, older_ticket.ticket_id]
        );

        let pending = store.list_tickets(Some(TicketStatus::Pending))?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].ticket_id, newer_ticket.ticket_id);

        let denied = store.list_tickets(Some(TicketStatus::Denied))?;
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].ticket_id, older_ticket.ticket_id);

        let requests = store.list_access_requests()?;
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].access_request_id, newer.access_request_id);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn sqlite_rejects_second_ticket_for_same_request() -> Result<()> {
        let db_path = unique_temp_db_path("unique");
        let mut store = open_migrated(&db_path)?;

        let request = approved_request();
        store.record_request(&request)?;

        let result = store.conn.execute(
            "INSERT INTO review_tickets(ticket_id, access_request_id, status, created_at)
             VALUES (?1, ?2, 'pending', ?3)",
            params![
                TicketId::new().to_string(),
                request.access_request_id.to_string(),
                now_rfc3339()?
            ],
        );
        assert!(result.is_err());

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn concurrent_reviews_of_one_ticket_succeed_exactly_once() -> Result<()> {
        let db_path = unique_temp_db_path("race");
        let ticket_id = {
            let mut store = open_migrated(&db_path)?;
            store.record_request(&approved_request())?.ticket_id
        };

        let mut handles = Vec::new();
        for index in 0..4_u32 {
            let path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<bool> {
                let mut store = SqliteStore::open(&path)?;
                let outcome =
                    if index % 2 == 0 { ReviewOutcome::Approved } else { ReviewOutcome::Denied };
                match store.review_ticket(
                    ticket_id,
                    outcome,
                    &format!("admin-{index}"),
                    None,
                    OffsetDateTime::now_utc(),
                ) {
                    Ok(_) => Ok(true),
                    Err(err) => {
                        if matches!(
                            err.downcast_ref::<GateError>(),
                            Some(GateError::InvalidTransition { .. })
                        ) {
                            Ok(false)
                        } else {
                            Err(err)
                        }
                    }
                }
            }));
        }

        let mut wins = 0;
        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("review thread panicked"));
            };
            if thread_result? {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);

        let store = SqliteStore::open(&db_path)?;
        let ticket = store
            .get_ticket(ticket_id)?
            .ok_or_else(|| anyhow!("ticket missing after race"))?;
        assert!(ticket.status.is_terminal());
        ticket.validate().map_err(|err| anyhow!("raced ticket invalid: {err}"))?;

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn backup_and_restore_round_trip_preserves_records() -> Result<()> {
        let db_path = unique_temp_db_path("backup");
        let backup_path = unique_temp_db_path("backup-copy");
        let request = approved_request();

        {
            let mut store = open_migrated(&db_path)?;
            store.record_request(&request)?;
            store.backup_database(&backup_path)?;
        }

        let restore_path = unique_temp_db_path("restored");
        let mut restored = SqliteStore::open(&restore_path)?;
        restored.restore_database(&backup_path)?;

        let loaded = restored
            .get_access_request(request.access_request_id)?
            .ok_or_else(|| anyhow!("request missing after restore"))?;
        assert_eq!(loaded, request);
        assert_eq!(restored.list_tickets(Some(TicketStatus::Pending))?.len(), 1);

        let report = restored.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());

        cleanup(&db_path);
        cleanup(&backup_path);
        cleanup(&restore_path);
        Ok(())
    }
}
