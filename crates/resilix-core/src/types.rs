use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Severity / classification enums ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Strictness rank; higher means more severe.
    pub fn rank(self) -> u8 {
        match self {
            Severity::Critical => 4,
            Severity::High => 3,
            Severity::Medium => 2,
            Severity::Low => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "critical" => Some(Severity::Critical),
            "high" => Some(Severity::High),
            "medium" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootCauseCategory {
    CodeBug,
    ConfigError,
    DependencyFailure,
    ResourceExhaustion,
}

impl RootCauseCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            RootCauseCategory::CodeBug => "code_bug",
            RootCauseCategory::ConfigError => "config_error",
            RootCauseCategory::DependencyFailure => "dependency_failure",
            RootCauseCategory::ResourceExhaustion => "resource_exhaustion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        // Tolerates enum-repr noise like "RootCauseCategory.CODE_BUG".
        let token = s.trim().to_lowercase();
        let token = token.rsplit('.').next().unwrap_or(&token);
        match token {
            "code_bug" => Some(RootCauseCategory::CodeBug),
            "config_error" => Some(RootCauseCategory::ConfigError),
            "dependency_failure" => Some(RootCauseCategory::DependencyFailure),
            "resource_exhaustion" => Some(RootCauseCategory::ResourceExhaustion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    FixCode,
    Rollback,
    ScaleUp,
    ConfigChange,
}

impl RecommendedAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RecommendedAction::FixCode => "fix_code",
            RecommendedAction::Rollback => "rollback",
            RecommendedAction::ScaleUp => "scale_up",
            RecommendedAction::ConfigChange => "config_change",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let token = s.trim().to_lowercase();
        let token = token.rsplit('.').next().unwrap_or(&token);
        match token {
            "fix_code" => Some(RecommendedAction::FixCode),
            "rollback" => Some(RecommendedAction::Rollback),
            "scale_up" => Some(RecommendedAction::ScaleUp),
            "config_change" => Some(RecommendedAction::ConfigChange),
            _ => None,
        }
    }
}

// ── Sentinel output ──────────────────────────────────────────────────────

/// Known signal counters used by deterministic Sentinel scoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalScores {
    #[serde(default)]
    pub error_rate_high: u32,
    #[serde(default)]
    pub health_flapping: u32,
    #[serde(default)]
    pub backlog_growth: u32,
    #[serde(default)]
    pub dependency_timeout: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertEnrichment {
    #[serde(default)]
    pub signal_scores: SignalScores,
    #[serde(default)]
    pub weighted_score: f64,
    #[serde(default)]
    pub used_llm_fallback: bool,
    #[serde(default)]
    pub deterministic_confidence: f64,
}

/// Validated and enriched alert produced by Sentinel triage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedAlert {
    pub alert_id: String,
    pub is_actionable: bool,
    pub severity: Severity,
    pub service_name: String,
    pub error_type: String,
    pub error_rate: f64,
    #[serde(default)]
    pub affected_endpoints: Vec<String>,
    pub triggered_at: DateTime<Utc>,
    #[serde(default)]
    pub enrichment: AlertEnrichment,
    pub triage_reason: String,
}

/// Diagnostic companion to a `ValidatedAlert`, kept out of the alert itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SentinelTrace {
    pub signal_scores: SignalScores,
    pub weighted_score: f64,
    pub ambiguous: bool,
    pub used_llm_fallback: bool,
    pub deterministic_confidence: f64,
}

// ── Root-cause signature ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    /// logs | traces | metrics | deployment
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub relevance: String,
}

/// Structured root-cause hypothesis that drives remediation targeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThoughtSignature {
    pub incident_id: String,
    pub root_cause: String,
    pub root_cause_category: RootCauseCategory,
    #[serde(default)]
    pub evidence_chain: Vec<Evidence>,
    #[serde(default)]
    pub affected_services: Vec<String>,
    pub confidence_score: f64,
    pub recommended_action: RecommendedAction,
    pub target_repository: Option<String>,
    pub target_file: Option<String>,
    pub target_line: Option<i64>,
    #[serde(default)]
    pub related_commits: Vec<String>,
    pub investigation_summary: String,
    pub investigation_duration_seconds: f64,
}

// ── External references ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketRecord {
    pub ticket_key: String,
    pub ticket_url: String,
    pub summary: String,
    pub priority: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationResult {
    pub success: bool,
    pub action_taken: RecommendedAction,
    pub branch_name: Option<String>,
    pub pr_number: Option<i64>,
    pub pr_url: Option<String>,
    #[serde(default)]
    pub pr_merged: bool,
    pub target_file: Option<String>,
    pub diff_old_line: Option<String>,
    pub diff_new_line: Option<String>,
    #[serde(default)]
    pub execution_time_seconds: f64,
    pub error_message: Option<String>,
}

impl RemediationResult {
    pub fn failed(action: RecommendedAction, error_message: impl Into<String>) -> Self {
        Self {
            success: false,
            action_taken: action,
            branch_name: None,
            pr_number: None,
            pr_url: None,
            pr_merged: false,
            target_file: None,
            diff_old_line: None,
            diff_new_line: None,
            execution_time_seconds: 0.0,
            error_message: Some(error_message.into()),
        }
    }

    pub fn has_pr(&self) -> bool {
        self.pr_number.is_some() || self.pr_url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// Outcome of a single ticket transition attempt. Failures are data, not
/// errors, unless strict mode is enabled at the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub ok: bool,
    pub from_status: Option<String>,
    pub to_status: String,
    pub applied_transition_id: Option<String>,
    pub reason: Option<String>,
}

/// Merge-gate snapshot fetched from the code provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeGateStatus {
    pub ci_passed: bool,
    pub codeowner_reviewed: bool,
    /// Raw provider payload, retained verbatim for observability.
    pub details: Value,
}

// ── Remediation request (code provider input) ────────────────────────────

/// Context passed alongside a remediation request so providers can render
/// meaningful patches without re-deriving the signature.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemediationContext {
    pub service_name: String,
    pub root_cause_category: String,
    pub recommended_action: String,
    #[serde(default)]
    pub related_commits: Vec<String>,
    pub investigation_summary: String,
    pub confidence_score: f64,
}

#[derive(Debug, Clone)]
pub struct RemediationRequest {
    pub incident_id: String,
    pub repository: String,
    pub target_file: String,
    pub action: RecommendedAction,
    pub summary: String,
    pub context: RemediationContext,
}

// ── Timeline ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventType {
    IncidentCreated,
    AlertValidated,
    InvestigationStarted,
    EvidenceCollected,
    RootCauseIdentified,
    TicketCreated,
    TicketMovedTodo,
    TicketMovedInProgress,
    TicketMovedInReview,
    TicketMovedDone,
    TicketTransitionFailed,
    FixGenerated,
    PrCreated,
    PrMerged,
    IncidentResolved,
    EscalatedToHuman,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub event_type: TimelineEventType,
    pub timestamp: DateTime<Utc>,
    pub agent: Option<String>,
    #[serde(default)]
    pub details: serde_json::Map<String, Value>,
    pub duration_ms: Option<i64>,
}

// ── Gate policy / approval ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatePolicy {
    pub require_ci_pass: bool,
    pub require_codeowner_review: bool,
    pub merge_method: String,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            require_ci_pass: true,
            require_codeowner_review: true,
            merge_method: "squash".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Approval {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub approved: bool,
    pub approved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    #[default]
    Pending,
    CiPassed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    Pending,
    Approved,
}

// ── Integration trace ────────────────────────────────────────────────────

/// Additive diagnostic record written throughout the pipeline. Every run
/// finishes with `execution_path`, `execution_reason` and `runner_policy`
/// populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationTrace {
    pub ticket_provider: String,
    pub code_provider: String,
    #[serde(default)]
    pub fallback_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_path: Option<String>,
    pub execution_path: String,
    pub execution_reason: String,
    pub runner_policy: String,
    pub service_revision: Option<String>,
    pub service_service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adk_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_processor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_processor_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_details: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jira_transitions: Vec<TransitionOutcome>,
}

impl Default for IntegrationTrace {
    fn default() -> Self {
        Self {
            ticket_provider: "unknown".into(),
            code_provider: "unknown".into(),
            fallback_used: false,
            fallback_path: None,
            execution_path: "pending".into(),
            execution_reason: "accepted_for_processing".into(),
            runner_policy: "adk_only".into(),
            service_revision: None,
            service_service: None,
            adk_error: None,
            provider_error: None,
            post_processor: None,
            post_processor_error: None,
            gate_details: None,
            jira_transitions: Vec::new(),
        }
    }
}

// ── Incident state ───────────────────────────────────────────────────────

/// The whole per-incident durable record, keyed by `incident_id` in the
/// session store. Saved as one JSON document; all writes are whole-record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncidentState {
    #[serde(default)]
    pub incident_id: String,
    #[serde(default)]
    pub raw_alert: Value,
    pub created_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub validated_alert: Option<ValidatedAlert>,
    pub sentinel_trace: Option<SentinelTrace>,
    pub thought_signature: Option<ThoughtSignature>,
    pub jira_ticket: Option<TicketRecord>,
    pub remediation_result: Option<RemediationResult>,
    #[serde(default)]
    pub approval: Approval,
    #[serde(default)]
    pub policy: GatePolicy,
    #[serde(default)]
    pub ci_status: CiStatus,
    #[serde(default)]
    pub codeowner_review_status: ReviewStatus,
    #[serde(default)]
    pub integration_trace: IntegrationTrace,
    #[serde(default)]
    pub timeline: Vec<TimelineEvent>,
}

// ── Externally visible projections ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Processing,
    AwaitingApproval,
    Merging,
    Resolved,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    NotRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrStatus {
    NotCreated,
    PendingCi,
    CiPassed,
    Merged,
}

#[derive(Debug, Clone, Serialize)]
pub struct IncidentSummary {
    pub incident_id: String,
    pub status: IncidentStatus,
    pub severity: Severity,
    pub service_name: String,
    pub created_at: DateTime<Utc>,
    pub mttr_seconds: Option<f64>,
    pub approval_status: ApprovalStatus,
    pub pr_status: PrStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct IncidentDetail {
    pub incident_id: String,
    pub status: IncidentStatus,
    pub severity: Severity,
    pub service_name: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub mttr_seconds: Option<f64>,
    pub approval_status: ApprovalStatus,
    pub pr_status: PrStatus,
    pub validated_alert: Option<ValidatedAlert>,
    pub thought_signature: Option<ThoughtSignature>,
    pub jira_ticket: Option<TicketRecord>,
    pub remediation_result: Option<RemediationResult>,
    pub timeline: Vec<TimelineEvent>,
    pub integration_trace: IntegrationTrace,
}
