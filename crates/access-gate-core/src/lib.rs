use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

pub const REASON_TEXT_INACTIVE: &str = "inactive employment status";
pub const REASON_TEXT_HIGH_RISK_SENSITIVE: &str = "high anomaly risk against sensitive resource";
pub const REASON_TEXT_VIOLATIONS: &str = "policy violation history exceeds limit";
pub const REASON_TEXT_TRAINING: &str = "security training not current";
pub const REASON_TEXT_PROBABILITY: &str = "model risk probability exceeds threshold";
pub const REASON_TEXT_NO_SIGNAL: &str = "no disqualifying signal";
pub const REASON_TEXT_UNAVAILABLE: &str = "risk assessment unavailable";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum GateError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("policy config error: {0}")]
    Config(String),
    #[error("requester profile not found: {requester_id}")]
    ProfileNotFound { requester_id: String },
    #[error("risk scorer unavailable: {0}")]
    ScorerUnavailable(String),
    #[error("risk scorer returned malformed output: {0}")]
    ScorerMalformedOutput(String),
    #[error("access request not found: {access_request_id}")]
    RequestNotFound { access_request_id: AccessRequestId },
    #[error("review ticket not found: {ticket_id}")]
    TicketNotFound { ticket_id: TicketId },
    #[error("invalid transition: ticket {ticket_id} is already {status}")]
    InvalidTransition { ticket_id: TicketId, status: TicketStatus },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AccessRequestId(pub Ulid);

impl AccessRequestId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for AccessRequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AccessRequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TicketId(pub Ulid);

impl TicketId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TicketId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TicketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EmploymentStatus {
    Active,
    Suspended,
    Terminated,
}

impl EmploymentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Terminated => "terminated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "suspended" => Some(Self::Suspended),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceSensitivity {
    Low,
    Medium,
    High,
}

impl ResourceSensitivity {
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Point-in-time view of one requester, owned by the identity collaborator.
/// The gate copies it by value into every [`AccessRequest`] so later profile
/// edits never alter a past decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequesterProfile {
    pub requester_id: String,
    pub department: String,
    pub role: String,
    pub employment_status: EmploymentStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
    pub time_in_position: String,
    pub past_violations: u32,
    /// `None` means the requester has never completed security training.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_security_training: Option<OffsetDateTime>,
}

/// Opaque model outputs for one query, immutable once attached to a request.
/// Lower `anomaly_score` means more anomalous.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RiskSignals {
    pub anomaly_score: f64,
    pub anomaly_prediction: bool,
    pub classifier_probability: f64,
    pub classifier_prediction: bool,
}

impl RiskSignals {
    /// Reject signal shapes the classifier must never see: non-finite scores
    /// or probabilities outside [0, 1]. The Query Gate routes failures here
    /// to the fail-closed path, which keeps the classifier itself total.
    ///
    /// # Errors
    /// Returns [`GateError::ScorerMalformedOutput`] for out-of-range values.
    pub fn validate(&self) -> Result<(), GateError> {
        if !self.anomaly_score.is_finite() {
            return Err(GateError::ScorerMalformedOutput(format!(
                "anomaly_score must be finite, got {}",
                self.anomaly_score
            )));
        }
        if !self.classifier_probability.is_finite()
            || !(0.0..=1.0).contains(&self.classifier_probability)
        {
            return Err(GateError::ScorerMalformedOutput(format!(
                "classifier_probability must be within [0, 1], got {}",
                self.classifier_probability
            )));
        }
        Ok(())
    }
}

/// Every threshold the classifier and decision policy consult, loaded once at
/// process start. Defaults mirror the documented policy; deployments override
/// them via a JSON config file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfig {
    /// Anomaly scores below this are High risk.
    #[serde(default = "PolicyConfig::default_high_anomaly_threshold")]
    pub high_anomaly_threshold: f64,
    /// Anomaly scores below this (and at or above the high threshold) are Medium.
    #[serde(default = "PolicyConfig::default_medium_anomaly_threshold")]
    pub medium_anomaly_threshold: f64,
    /// Past violation counts strictly above this deny.
    #[serde(default = "PolicyConfig::default_violation_limit")]
    pub violation_limit: u32,
    /// Security training older than this window is stale for sensitive resources.
    #[serde(default = "PolicyConfig::default_training_recency_days")]
    pub training_recency_days: i64,
    /// Classifier risk probabilities strictly above this deny.
    #[serde(default = "PolicyConfig::default_risk_probability_ceiling")]
    pub risk_probability_ceiling: f64,
}

impl PolicyConfig {
    fn default_high_anomaly_threshold() -> f64 {
        -0.3
    }

    fn default_medium_anomaly_threshold() -> f64 {
        0.0
    }

    fn default_violation_limit() -> u32 {
        3
    }

    fn default_training_recency_days() -> i64 {
        365
    }

    fn default_risk_probability_ceiling() -> f64 {
        0.85
    }

    /// # Errors
    /// Returns [`GateError::Config`] when thresholds are inverted or out of range.
    pub fn validate(&self) -> Result<(), GateError> {
        if !self.high_anomaly_threshold.is_finite() || !self.medium_anomaly_threshold.is_finite() {
            return Err(GateError::Config("anomaly thresholds must be finite".to_string()));
        }
        if self.high_anomaly_threshold >= self.medium_anomaly_threshold {
            return Err(GateError::Config(format!(
                "high_anomaly_threshold ({}) must be below medium_anomaly_threshold ({})",
                self.high_anomaly_threshold, self.medium_anomaly_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.risk_probability_ceiling) {
            return Err(GateError::Config(format!(
                "risk_probability_ceiling must be within [0, 1], got {}",
                self.risk_probability_ceiling
            )));
        }
        if self.training_recency_days <= 0 {
            return Err(GateError::Config(format!(
                "training_recency_days must be positive, got {}",
                self.training_recency_days
            )));
        }
        Ok(())
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            high_anomaly_threshold: Self::default_high_anomaly_threshold(),
            medium_anomaly_threshold: Self::default_medium_anomaly_threshold(),
            violation_limit: Self::default_violation_limit(),
            training_recency_days: Self::default_training_recency_days(),
            risk_probability_ceiling: Self::default_risk_probability_ceiling(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RiskAssessment {
    pub tier: RiskTier,
    /// Normalized [0, 1] value for sorting and display only; the approve/deny
    /// decision never reads it.
    pub severity: f64,
}

/// Discretize raw model signals into a risk tier and a ranking severity.
/// Pure and total over finite inputs; malformed signals are rejected upstream
/// by [`RiskSignals::validate`].
#[must_use]
pub fn classify_risk(signals: &RiskSignals, config: &PolicyConfig) -> RiskAssessment {
    let tier = if signals.anomaly_score < config.high_anomaly_threshold {
        RiskTier::High
    } else if signals.anomaly_score < config.medium_anomaly_threshold {
        RiskTier::Medium
    } else {
        RiskTier::Low
    };

    // Equal-weight blend of (1 - probability) and the anomaly score mapped
    // from [-1, 1] into [0, 1]; monotonic in both inputs.
    let anomaly_component = (signals.anomaly_score.clamp(-1.0, 1.0) + 1.0) / 2.0;
    let severity = ((1.0 - signals.classifier_probability) + anomaly_component) / 2.0;

    RiskAssessment { tier, severity }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Approved,
    Denied,
}

impl DecisionOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Denied => "denied",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    InactiveEmployment,
    HighRiskSensitiveResource,
    ViolationHistory,
    TrainingNotCurrent,
    RiskProbabilityExceeded,
    RiskAssessmentUnavailable,
    NoDisqualifyingSignal,
}

impl ReasonCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InactiveEmployment => "inactive_employment",
            Self::HighRiskSensitiveResource => "high_risk_sensitive_resource",
            Self::ViolationHistory => "violation_history",
            Self::TrainingNotCurrent => "training_not_current",
            Self::RiskProbabilityExceeded => "risk_probability_exceeded",
            Self::RiskAssessmentUnavailable => "risk_assessment_unavailable",
            Self::NoDisqualifyingSignal => "no_disqualifying_signal",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inactive_employment" => Some(Self::InactiveEmployment),
            "high_risk_sensitive_resource" => Some(Self::HighRiskSensitiveResource),
            "violation_history" => Some(Self::ViolationHistory),
            "training_not_current" => Some(Self::TrainingNotCurrent),
            "risk_probability_exceeded" => Some(Self::RiskProbabilityExceeded),
            "risk_assessment_unavailable" => Some(Self::RiskAssessmentUnavailable),
            "no_disqualifying_signal" => Some(Self::NoDisqualifyingSignal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Decision {
    pub outcome: DecisionOutcome,
    pub reason_code: ReasonCode,
    pub reason_text: String,
}

impl Decision {
    #[must_use]
    pub fn approved() -> Self {
        Self {
            outcome: DecisionOutcome::Approved,
            reason_code: ReasonCode::NoDisqualifyingSignal,
            reason_text: REASON_TEXT_NO_SIGNAL.to_string(),
        }
    }

    #[must_use]
    pub fn denied(reason_code: ReasonCode, reason_text: &str) -> Self {
        Self { outcome: DecisionOutcome::Denied, reason_code, reason_text: reason_text.to_string() }
    }

    /// The canonical fail-closed decision for any scorer failure.
    #[must_use]
    pub fn denied_unavailable() -> Self {
        Self::denied(ReasonCode::RiskAssessmentUnavailable, REASON_TEXT_UNAVAILABLE)
    }

    /// # Errors
    /// Returns [`GateError::Validation`] when a denial carries no reason text.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.outcome == DecisionOutcome::Denied && self.reason_text.trim().is_empty() {
            return Err(GateError::Validation(
                "denied decision MUST carry a non-empty reason_text".to_string(),
            ));
        }
        Ok(())
    }
}

/// What the query targets, supplied by the caller alongside the query text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceContext {
    pub resource_type: String,
    pub sensitivity: ResourceSensitivity,
    pub request_reason: Option<String>,
}

/// Evaluate the ordered rule list. First match wins, so any denial reason is
/// reproducible by re-running the same checks against the same inputs. The
/// only time dependence is the training-recency check against `as_of`, which
/// callers fix to the request's `created_at`.
#[must_use]
pub fn decide(
    profile: &RequesterProfile,
    tier: RiskTier,
    resource: &ResourceContext,
    signals: &RiskSignals,
    config: &PolicyConfig,
    as_of: OffsetDateTime,
) -> Decision {
    if profile.employment_status != EmploymentStatus::Active {
        return Decision::denied(ReasonCode::InactiveEmployment, REASON_TEXT_INACTIVE);
    }

    let sensitive = resource.sensitivity == ResourceSensitivity::High;

    if tier == RiskTier::High && sensitive {
        return Decision::denied(
            ReasonCode::HighRiskSensitiveResource,
            REASON_TEXT_HIGH_RISK_SENSITIVE,
        );
    }

    if profile.past_violations > config.violation_limit {
        return Decision::denied(ReasonCode::ViolationHistory, REASON_TEXT_VIOLATIONS);
    }

    if sensitive && !training_is_current(profile.last_security_training, config, as_of) {
        return Decision::denied(ReasonCode::TrainingNotCurrent, REASON_TEXT_TRAINING);
    }

    if signals.classifier_probability > config.risk_probability_ceiling {
        return Decision::denied(ReasonCode::RiskProbabilityExceeded, REASON_TEXT_PROBABILITY);
    }

    Decision::approved()
}

fn training_is_current(
    last_training: Option<OffsetDateTime>,
    config: &PolicyConfig,
    as_of: OffsetDateTime,
) -> bool {
    let Some(trained_at) = last_training else {
        return false;
    };
    as_of - trained_at <= Duration::days(config.training_recency_days)
}

/// Durable record of one query-time decision. Immutable after creation: the
/// snapshot, signals, and decision are historical facts, never recomputed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessRequest {
    pub access_request_id: AccessRequestId,
    pub requester_id: String,
    pub query_text: String,
    pub requester_snapshot: RequesterProfile,
    pub resource: ResourceContext,
    /// `None` exactly when the scorer failed and the gate denied fail-closed.
    pub risk_signals: Option<RiskSignals>,
    pub decision: Decision,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl AccessRequest {
    /// Validate one access-request record against its creation invariants.
    ///
    /// # Errors
    /// Returns [`GateError::Validation`] when identity fields are empty, the
    /// decision invariant is violated, or the signals/reason pairing is
    /// inconsistent.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.requester_id.trim().is_empty() {
            return Err(GateError::Validation("requester_id MUST be non-empty".to_string()));
        }
        if self.query_text.trim().is_empty() {
            return Err(GateError::Validation("query_text MUST be non-empty".to_string()));
        }
        if self.requester_snapshot.requester_id != self.requester_id {
            return Err(GateError::Validation(
                "requester_snapshot MUST belong to the requester on the record".to_string(),
            ));
        }
        self.decision.validate()?;

        match &self.risk_signals {
            Some(signals) => {
                signals.validate()?;
                if self.decision.reason_code == ReasonCode::RiskAssessmentUnavailable {
                    return Err(GateError::Validation(
                        "risk signals MUST be absent when the scorer was unavailable".to_string(),
                    ));
                }
            }
            None => {
                if self.decision.reason_code != ReasonCode::RiskAssessmentUnavailable {
                    return Err(GateError::Validation(
                        "missing risk signals are only valid for a fail-closed denial".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Approved,
    Denied,
}

impl TicketStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Denied)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            _ => None,
        }
    }
}

impl Display for TicketStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Administrator verdict on a pending ticket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReviewOutcome {
    Approved,
    Denied,
}

impl ReviewOutcome {
    #[must_use]
    pub fn ticket_status(self) -> TicketStatus {
        match self {
            Self::Approved => TicketStatus::Approved,
            Self::Denied => TicketStatus::Denied,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Denied => "denied",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            _ => None,
        }
    }
}

/// Workflow object derived from an access request. Created Pending at the
/// same instant as its request; leaves Pending exactly once, by administrator
/// action, and terminal states are final.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewTicket {
    pub ticket_id: TicketId,
    pub access_request_id: AccessRequestId,
    pub status: TicketStatus,
    pub admin_notes: Option<String>,
    pub reviewed_by: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub reviewed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ReviewTicket {
    #[must_use]
    pub fn pending(access_request_id: AccessRequestId, created_at: OffsetDateTime) -> Self {
        Self {
            ticket_id: TicketId::new(),
            access_request_id,
            status: TicketStatus::Pending,
            admin_notes: None,
            reviewed_by: None,
            reviewed_at: None,
            created_at,
        }
    }

    /// # Errors
    /// Returns [`GateError::Validation`] when audit fields disagree with the
    /// lifecycle state: terminal tickets carry reviewer and timestamp, pending
    /// tickets carry neither.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.status.is_terminal() {
            if self.reviewed_by.as_deref().unwrap_or("").trim().is_empty() {
                return Err(GateError::Validation(
                    "reviewed tickets MUST record reviewed_by".to_string(),
                ));
            }
            if self.reviewed_at.is_none() {
                return Err(GateError::Validation(
                    "reviewed tickets MUST record reviewed_at".to_string(),
                ));
            }
        } else if self.reviewed_by.is_some() || self.reviewed_at.is_some() {
            return Err(GateError::Validation(
                "pending tickets MUST NOT carry review audit fields".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sanitized caller-facing result of a gated query. A denial exposes only the
/// reason text; raw risk signals stay in the persisted record for admins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Approved { proceed_token: String },
    Denied { reason: String },
}

impl Verdict {
    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn active_profile() -> RequesterProfile {
        RequesterProfile {
            requester_id: "emp-1042".to_string(),
            department: "finance".to_string(),
            role: "analyst".to_string(),
            employment_status: EmploymentStatus::Active,
            joined_at: fixture_time() - Duration::days(900),
            time_in_position: "2 years".to_string(),
            past_violations: 0,
            last_security_training: Some(fixture_time() - Duration::days(30)),
        }
    }

    fn calm_signals() -> RiskSignals {
        RiskSignals {
            anomaly_score: 0.5,
            anomaly_prediction: false,
            classifier_probability: 0.1,
            classifier_prediction: false,
        }
    }

    fn low_resource() -> ResourceContext {
        ResourceContext {
            resource_type: "sales_report".to_string(),
            sensitivity: ResourceSensitivity::Low,
            request_reason: None,
        }
    }

    fn high_resource() -> ResourceContext {
        ResourceContext {
            resource_type: "payroll_database".to_string(),
            sensitivity: ResourceSensitivity::High,
            request_reason: Some("quarterly audit".to_string()),
        }
    }

    #[test]
    fn classifier_maps_anomaly_score_to_tiers_at_thresholds() {
        let config = PolicyConfig::default();
        let tier_for = |score: f64| {
            classify_risk(&RiskSignals { anomaly_score: score, ..calm_signals() }, &config).tier
        };

        assert_eq!(tier_for(-0.31), RiskTier::High);
        assert_eq!(tier_for(-0.3), RiskTier::Medium);
        assert_eq!(tier_for(-0.01), RiskTier::Medium);
        assert_eq!(tier_for(0.0), RiskTier::Low);
        assert_eq!(tier_for(0.7), RiskTier::Low);
    }

    #[test]
    fn severity_stays_normalized_and_ranks_anomalies() {
        let config = PolicyConfig::default();
        let quiet = classify_risk(&calm_signals(), &config);
        let anomalous = classify_risk(
            &RiskSignals {
                anomaly_score: -0.8,
                anomaly_prediction: true,
                classifier_probability: 0.1,
                classifier_prediction: true,
            },
            &config,
        );

        assert!((0.0..=1.0).contains(&quiet.severity));
        assert!((0.0..=1.0).contains(&anomalous.severity));
        assert!(anomalous.severity < quiet.severity);
    }

    proptest! {
        #[test]
        fn any_score_below_high_threshold_classifies_high(
            score in -100.0_f64..-0.300_001,
            probability in 0.0_f64..=1.0,
        ) {
            let signals = RiskSignals {
                anomaly_score: score,
                anomaly_prediction: true,
                classifier_probability: probability,
                classifier_prediction: false,
            };
            let assessment = classify_risk(&signals, &PolicyConfig::default());
            prop_assert_eq!(assessment.tier, RiskTier::High);
            prop_assert!((0.0..=1.0).contains(&assessment.severity));
        }

        #[test]
        fn inactive_status_denies_regardless_of_risk(
            violations in 0_u32..10,
            probability in 0.0_f64..=1.0,
            suspended in proptest::bool::ANY,
        ) {
            let mut profile = active_profile();
            profile.employment_status = if suspended {
                EmploymentStatus::Suspended
            } else {
                EmploymentStatus::Terminated
            };
            profile.past_violations = violations;

            let signals = RiskSignals { classifier_probability: probability, ..calm_signals() };
            for tier in [RiskTier::Low, RiskTier::Medium, RiskTier::High] {
                let decision = decide(
                    &profile,
                    tier,
                    &high_resource(),
                    &signals,
                    &PolicyConfig::default(),
                    fixture_time(),
                );
                prop_assert_eq!(decision.outcome, DecisionOutcome::Denied);
                prop_assert_eq!(decision.reason_code, ReasonCode::InactiveEmployment);
            }
        }

        #[test]
        fn decision_is_deterministic_for_identical_inputs(
            score in -1.0_f64..=1.0,
            probability in 0.0_f64..=1.0,
            violations in 0_u32..8,
        ) {
            let mut profile = active_profile();
            profile.past_violations = violations;
            let signals = RiskSignals {
                anomaly_score: score,
                anomaly_prediction: score < 0.0,
                classifier_probability: probability,
                classifier_prediction: probability > 0.5,
            };
            let config = PolicyConfig::default();
            let tier = classify_risk(&signals, &config).tier;

            let first = decide(&profile, tier, &high_resource(), &signals, &config, fixture_time());
            let second = decide(&profile, tier, &high_resource(), &signals, &config, fixture_time());
            prop_assert_eq!(first, second);
        }
    }

    #[test]
    fn clean_requester_on_low_sensitivity_resource_is_approved() {
        let decision = decide(
            &active_profile(),
            classify_risk(&calm_signals(), &PolicyConfig::default()).tier,
            &low_resource(),
            &calm_signals(),
            &PolicyConfig::default(),
            fixture_time(),
        );

        assert_eq!(decision.outcome, DecisionOutcome::Approved);
        assert_eq!(decision.reason_text, REASON_TEXT_NO_SIGNAL);
    }

    #[test]
    fn high_anomaly_against_sensitive_resource_is_denied() {
        let signals = RiskSignals { anomaly_score: -0.5, ..calm_signals() };
        let config = PolicyConfig::default();
        let tier = classify_risk(&signals, &config).tier;
        assert_eq!(tier, RiskTier::High);

        let decision =
            decide(&active_profile(), tier, &high_resource(), &signals, &config, fixture_time());
        assert_eq!(decision.outcome, DecisionOutcome::Denied);
        assert_eq!(decision.reason_text, REASON_TEXT_HIGH_RISK_SENSITIVE);
    }

    #[test]
    fn high_anomaly_against_low_sensitivity_resource_passes_rule_two() {
        let signals = RiskSignals { anomaly_score: -0.5, ..calm_signals() };
        let config = PolicyConfig::default();

        let decision = decide(
            &active_profile(),
            RiskTier::High,
            &low_resource(),
            &signals,
            &config,
            fixture_time(),
        );
        assert_eq!(decision.outcome, DecisionOutcome::Approved);
    }

    #[test]
    fn violation_history_above_limit_is_denied() {
        let mut profile = active_profile();
        profile.past_violations = 4;

        let decision = decide(
            &profile,
            RiskTier::Low,
            &low_resource(),
            &calm_signals(),
            &PolicyConfig::default(),
            fixture_time(),
        );
        assert_eq!(decision.reason_code, ReasonCode::ViolationHistory);

        profile.past_violations = 3;
        let decision = decide(
            &profile,
            RiskTier::Low,
            &low_resource(),
            &calm_signals(),
            &PolicyConfig::default(),
            fixture_time(),
        );
        assert_eq!(decision.outcome, DecisionOutcome::Approved);
    }

    #[test]
    fn stale_or_missing_training_denies_only_for_sensitive_resources() {
        let config = PolicyConfig::default();

        let mut never_trained = active_profile();
        never_trained.last_security_training = None;
        let decision = decide(
            &never_trained,
            RiskTier::Low,
            &high_resource(),
            &calm_signals(),
            &config,
            fixture_time(),
        );
        assert_eq!(decision.reason_code, ReasonCode::TrainingNotCurrent);
        assert_eq!(decision.reason_text, REASON_TEXT_TRAINING);

        let mut stale = active_profile();
        stale.last_security_training = Some(fixture_time() - Duration::days(400));
        let decision =
            decide(&stale, RiskTier::Low, &high_resource(), &calm_signals(), &config, fixture_time());
        assert_eq!(decision.reason_code, ReasonCode::TrainingNotCurrent);

        // Low sensitivity never consults the training window.
        let decision =
            decide(&stale, RiskTier::Low, &low_resource(), &calm_signals(), &config, fixture_time());
        assert_eq!(decision.outcome, DecisionOutcome::Approved);
    }

    #[test]
    fn classifier_probability_above_ceiling_is_denied() {
        let signals = RiskSignals { classifier_probability: 0.9, ..calm_signals() };

        let decision = decide(
            &active_profile(),
            RiskTier::Low,
            &low_resource(),
            &signals,
            &PolicyConfig::default(),
            fixture_time(),
        );
        assert_eq!(decision.reason_code, ReasonCode::RiskProbabilityExceeded);
        assert_eq!(decision.reason_text, REASON_TEXT_PROBABILITY);
    }

    #[test]
    fn rule_order_puts_employment_before_risk_and_violations() {
        let mut profile = active_profile();
        profile.employment_status = EmploymentStatus::Terminated;
        profile.past_violations = 9;
        let signals = RiskSignals { anomaly_score: -0.9, classifier_probability: 0.99, ..calm_signals() };

        let decision = decide(
            &profile,
            RiskTier::High,
            &high_resource(),
            &signals,
            &PolicyConfig::default(),
            fixture_time(),
        );
        assert_eq!(decision.reason_code, ReasonCode::InactiveEmployment);
        assert_eq!(decision.reason_text, REASON_TEXT_INACTIVE);
    }

    #[test]
    fn denied_decision_requires_reason_text() {
        let decision = Decision {
            outcome: DecisionOutcome::Denied,
            reason_code: ReasonCode::ViolationHistory,
            reason_text: "  ".to_string(),
        };
        assert!(decision.validate().is_err());
        assert!(Decision::denied_unavailable().validate().is_ok());
    }

    #[test]
    fn signal_validation_rejects_out_of_range_probability() {
        let bad = RiskSignals { classifier_probability: 1.2, ..calm_signals() };
        assert!(matches!(bad.validate(), Err(GateError::ScorerMalformedOutput(_))));

        let nan = RiskSignals { anomaly_score: f64::NAN, ..calm_signals() };
        assert!(matches!(nan.validate(), Err(GateError::ScorerMalformedOutput(_))));

        assert!(calm_signals().validate().is_ok());
    }

    #[test]
    fn access_request_ties_missing_signals_to_fail_closed_reason() {
        let approved = AccessRequest {
            access_request_id: AccessRequestId::new(),
            requester_id: "emp-1042".to_string(),
            query_text: "show payroll totals".to_string(),
            requester_snapshot: active_profile(),
            resource: high_resource(),
            risk_signals: Some(calm_signals()),
            decision: Decision::approved(),
            created_at: fixture_time(),
        };
        assert!(approved.validate().is_ok());

        let mut signal_less = approved.clone();
        signal_less.risk_signals = None;
        assert!(signal_less.validate().is_err());

        signal_less.decision = Decision::denied_unavailable();
        assert!(signal_less.validate().is_ok());

        let mut contradictory = approved;
        contradictory.decision = Decision::denied_unavailable();
        assert!(contradictory.validate().is_err());
    }

    #[test]
    fn ticket_validation_matches_lifecycle_state() {
        let pending = ReviewTicket::pending(AccessRequestId::new(), fixture_time());
        assert!(pending.validate().is_ok());

        let mut half_reviewed = pending.clone();
        half_reviewed.reviewed_by = Some("admin-7".to_string());
        assert!(half_reviewed.validate().is_err());

        let mut reviewed = pending;
        reviewed.status = TicketStatus::Approved;
        assert!(reviewed.validate().is_err());
        reviewed.reviewed_by = Some("admin-7".to_string());
        reviewed.reviewed_at = Some(fixture_time());
        assert!(reviewed.validate().is_ok());
    }

    #[test]
    fn policy_config_rejects_inverted_thresholds() {
        let inverted = PolicyConfig { high_anomaly_threshold: 0.5, ..PolicyConfig::default() };
        assert!(matches!(inverted.validate(), Err(GateError::Config(_))));

        let bad_ceiling = PolicyConfig { risk_probability_ceiling: 1.5, ..PolicyConfig::default() };
        assert!(bad_ceiling.validate().is_err());

        assert!(PolicyConfig::default().validate().is_ok());
    }

    #[test]
    fn policy_config_deserializes_partial_overrides() {
        let parsed: PolicyConfig = match serde_json::from_str(r#"{"violation_limit": 1}"#) {
            Ok(config) => config,
            Err(err) => panic!("config should parse: {err}"),
        };
        assert_eq!(parsed.violation_limit, 1);
        assert!((parsed.high_anomaly_threshold - (-0.3)).abs() < f64::EPSILON);
    }
}
