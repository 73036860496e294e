use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::config::Config;
use crate::mapper::append_timeline_event;
use crate::policy::{apply_approval_and_merge, evaluate_approval_request, evaluate_merge_eligibility, MergeDecision};
use crate::provider::{ReasoningRunner, ResolvedProviders};
use crate::sentinel::{evaluate_alert, parse_dt, FallbackContext, FallbackVerdict, SignalFallback};
use crate::types::{
    CiStatus, Evidence, IncidentState, RecommendedAction, RemediationContext,
    RemediationRequest, RemediationResult, ReviewStatus, RootCauseCategory, Severity,
    ThoughtSignature, TicketRecord, TimelineEventType, ValidatedAlert,
};

pub const RUNNER_POLICY: &str = "adk_only";

const PLACEHOLDER_API_KEYS: &[&str] = &[
    "your_key",
    "your_api_key",
    "changeme",
    "replace_me",
    "replace-with-real-key",
];

// ── Runtime status (health surface) ──────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct AdkRuntimeStatus {
    pub adk_mode: String,
    pub adk_ready: bool,
    pub adk_last_error: Option<String>,
    pub runner_available: bool,
    pub mock_fallback_allowed: bool,
    pub adk_session_backend: String,
    pub runner_policy: String,
    pub service_revision: Option<String>,
    pub service_service: Option<String>,
}

// ── Outcome of an approve-merge request ──────────────────────────────────

#[derive(Debug, Clone)]
pub enum ApprovalOutcome {
    /// Policy rejection; the boundary maps `code`/`message` onto a 409.
    Rejected(MergeDecision),
    /// The provider refused the merge call.
    MergeFailed,
    Approved,
}

// ── Deterministic stand-in for the ambiguous-triage fallback ─────────────

pub struct DeterministicFallback;

impl SignalFallback for DeterministicFallback {
    fn assess(&self, ctx: &FallbackContext) -> Option<FallbackVerdict> {
        let severity = if ctx.score >= 1.5 {
            Severity::High
        } else {
            Severity::Medium
        };
        Some(FallbackVerdict {
            severity: Some(severity),
            is_actionable: Some(true),
            triage_reason: Some(
                "Low-confidence deterministic triage; fallback model confirmed actionability."
                    .to_string(),
            ),
            confidence_score: Some(0.72),
        })
    }
}

// ── Small helpers ────────────────────────────────────────────────────────

fn usable_api_key(key: &str) -> bool {
    let trimmed = key.trim();
    !trimmed.is_empty() && !PLACEHOLDER_API_KEYS.contains(&trimmed.to_lowercase().as_str())
}

fn flatten_error_messages(err: &anyhow::Error) -> String {
    let mut seen: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        if !text.is_empty() && !seen.contains(&text) {
            seen.push(text);
        }
    }
    if seen.is_empty() {
        err.to_string()
    } else {
        seen.join(" | ")
    }
}

fn is_missing_tool_error(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("tool '") && lowered.contains("not found")
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn priority_for_severity(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "P1",
        Severity::High => "P2",
        Severity::Medium => "P3",
        Severity::Low => "P4",
    }
}

fn detail_map(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
    let mut map = serde_json::Map::new();
    for (key, value) in pairs {
        map.insert((*key).to_string(), value.clone());
    }
    map
}

// ── Deterministic signature builders ─────────────────────────────────────

pub fn infer_root_cause_category(
    validated: &ValidatedAlert,
) -> (RootCauseCategory, RecommendedAction) {
    let scores = &validated.enrichment.signal_scores;
    if scores.health_flapping > 0 && scores.backlog_growth > 0 {
        return (RootCauseCategory::ConfigError, RecommendedAction::ConfigChange);
    }
    if scores.dependency_timeout > 0 {
        return (
            RootCauseCategory::DependencyFailure,
            RecommendedAction::ConfigChange,
        );
    }
    if scores.error_rate_high > 0 {
        return (RootCauseCategory::CodeBug, RecommendedAction::FixCode);
    }
    (RootCauseCategory::ResourceExhaustion, RecommendedAction::ScaleUp)
}

pub fn artifact_path_for_category(category: RootCauseCategory) -> &'static str {
    match category {
        RootCauseCategory::ConfigError => "infra/service-config.yaml",
        RootCauseCategory::DependencyFailure => "infra/dependencies.yaml",
        RootCauseCategory::CodeBug => "src/app/handlers.py",
        RootCauseCategory::ResourceExhaustion => "k8s/deployment.yaml",
    }
}

fn root_cause_for_category(category: RootCauseCategory) -> &'static str {
    match category {
        RootCauseCategory::ConfigError => {
            "Propagation configuration drift caused unstable health transitions."
        }
        RootCauseCategory::DependencyFailure => {
            "Dependency communications degraded under timeout conditions."
        }
        RootCauseCategory::CodeBug => {
            "Application logic error increased failing request volume."
        }
        RootCauseCategory::ResourceExhaustion => {
            "Service capacity limits were exceeded under incident load."
        }
    }
}

fn build_evidence_chain(raw_alert: &Value) -> Vec<Evidence> {
    let mut chain = Vec::new();
    if let Some(entries) = raw_alert.get("log_entries").and_then(Value::as_array) {
        for entry in entries.iter().filter(|e| e.is_object()).take(3) {
            chain.push(Evidence {
                source: "logs".into(),
                timestamp: parse_dt(entry.get("timestamp")),
                content: entry
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("observed anomalous behavior")
                    .to_string(),
                relevance: entry
                    .get("event")
                    .and_then(Value::as_str)
                    .unwrap_or("signal correlation")
                    .to_string(),
            });
        }
    }
    if !chain.is_empty() {
        return chain;
    }
    // No log entries in the payload; fall back to the alerts themselves.
    if let Some(alerts) = raw_alert.get("alerts").and_then(Value::as_array) {
        for alert in alerts.iter().filter(|a| a.is_object()).take(3) {
            let annotations = alert.get("annotations");
            let content = annotations
                .and_then(|a| a.get("summary"))
                .or_else(|| annotations.and_then(|a| a.get("description")))
                .or_else(|| alert.get("labels").and_then(|l| l.get("alertname")))
                .and_then(Value::as_str)
                .unwrap_or("observed anomalous behavior");
            chain.push(Evidence {
                source: "alerts".into(),
                timestamp: parse_dt(alert.get("startsAt")),
                content: content.to_string(),
                relevance: "signal correlation".into(),
            });
        }
    }
    chain
}

fn repository_from_alert(raw_alert: &Value, config: &Config) -> String {
    raw_alert
        .get("repository")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            raw_alert
                .get("alerts")
                .and_then(Value::as_array)
                .and_then(|a| a.first())
                .and_then(|a| a.get("labels"))
                .and_then(|l| l.get("repository"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("{}/resilix-demo-app", config.github_owner))
}

pub fn build_fallback_thought_signature(
    incident_id: &str,
    raw_alert: &Value,
    validated: &ValidatedAlert,
    config: &Config,
) -> ThoughtSignature {
    let (category, action) = infer_root_cause_category(validated);
    let weighted_score = validated.enrichment.weighted_score;
    let confidence = (0.62 + weighted_score * 0.04).min(0.98);

    ThoughtSignature {
        incident_id: incident_id.to_string(),
        root_cause: root_cause_for_category(category).to_string(),
        root_cause_category: category,
        evidence_chain: build_evidence_chain(raw_alert),
        affected_services: vec![validated.service_name.clone()],
        confidence_score: round3(confidence),
        recommended_action: action,
        target_repository: Some(repository_from_alert(raw_alert, config)),
        target_file: Some(artifact_path_for_category(category).to_string()),
        target_line: Some(1),
        related_commits: Vec::new(),
        investigation_summary: "Correlated incident signals and evidence indicate a primary \
                                failure mode in a single remediation artifact."
            .to_string(),
        investigation_duration_seconds: 4.5,
    }
}

/// Ticket summary and priority derived from the signature.
pub fn ticket_summary_and_priority(
    signature: &ThoughtSignature,
    severity: Severity,
) -> (String, &'static str) {
    let summary = format!(
        "[AUTO] {}: {}",
        signature.root_cause_category.as_str(),
        signature.root_cause
    );
    (summary, priority_for_severity(severity))
}

// ── Runner-state normalization ───────────────────────────────────────────
//
// The external reasoning runner emits schema-lenient JSON; these accept
// whatever shape it produced and pull out well-typed records with safe
// defaults. Untyped values never travel past this boundary.

fn clamp_unit(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

pub fn normalize_runner_validated_alert(
    value: Option<&Value>,
    incident_id: &str,
) -> Option<ValidatedAlert> {
    let value = value?.as_object()?;
    let get_str = |key: &str| value.get(key).and_then(Value::as_str);
    let get_u32 = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_f64)
            .map(|v| v.max(0.0) as u32)
            .unwrap_or(0)
    };

    let severity = get_str("severity")
        .and_then(Severity::parse)
        .unwrap_or(Severity::High);
    let confidence = value
        .get("deterministic_confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    Some(ValidatedAlert {
        alert_id: get_str("alert_id")
            .filter(|s| !s.is_empty())
            .unwrap_or(incident_id)
            .to_string(),
        is_actionable: value
            .get("is_actionable")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        severity,
        service_name: get_str("service_name")
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown-service")
            .to_string(),
        error_type: get_str("error_type")
            .filter(|s| !s.is_empty())
            .unwrap_or("UnknownAlert")
            .to_string(),
        error_rate: value.get("error_rate").and_then(Value::as_f64).unwrap_or(0.0),
        affected_endpoints: value
            .get("affected_endpoints")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        triggered_at: parse_dt(value.get("triggered_at")),
        enrichment: crate::types::AlertEnrichment {
            signal_scores: crate::types::SignalScores {
                error_rate_high: get_u32("signal_error_rate_high"),
                health_flapping: get_u32("signal_health_flapping"),
                backlog_growth: get_u32("signal_backlog_growth"),
                dependency_timeout: get_u32("signal_dependency_timeout"),
            },
            weighted_score: value
                .get("weighted_score")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            used_llm_fallback: value
                .get("used_llm_fallback")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            deterministic_confidence: clamp_unit(confidence),
        },
        triage_reason: get_str("triage_reason")
            .filter(|s| !s.is_empty())
            .unwrap_or("No triage reason provided")
            .to_string(),
    })
}

pub fn normalize_runner_thought_signature(
    value: Option<&Value>,
    incident_id: &str,
) -> Option<ThoughtSignature> {
    let value = value?.as_object()?;
    let get_str = |key: &str| value.get(key).and_then(Value::as_str);

    let mut evidence_chain = Vec::new();
    if let Some(items) = value.get("evidence_chain").and_then(Value::as_array) {
        for item in items {
            match item {
                Value::Object(obj) => {
                    let content = obj
                        .get("content")
                        .or_else(|| obj.get("text"))
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .unwrap_or("");
                    if content.is_empty() {
                        continue;
                    }
                    evidence_chain.push(Evidence {
                        source: obj
                            .get("source")
                            .and_then(Value::as_str)
                            .unwrap_or("logs")
                            .to_string(),
                        timestamp: parse_dt(obj.get("timestamp")),
                        content: content.to_string(),
                        relevance: obj
                            .get("relevance")
                            .and_then(Value::as_str)
                            .unwrap_or("signal correlation")
                            .to_string(),
                    });
                }
                Value::String(text) if !text.trim().is_empty() => {
                    evidence_chain.push(Evidence {
                        source: "logs".into(),
                        timestamp: Utc::now(),
                        content: text.trim().to_string(),
                        relevance: "signal correlation".into(),
                    });
                }
                _ => {}
            }
        }
    }

    let category = get_str("root_cause_category")
        .and_then(RootCauseCategory::parse)
        .unwrap_or(RootCauseCategory::CodeBug);
    let action = get_str("recommended_action")
        .and_then(RecommendedAction::parse)
        .unwrap_or(RecommendedAction::FixCode);
    let confidence = value
        .get("confidence_score")
        .and_then(Value::as_f64)
        .unwrap_or(0.7);

    Some(ThoughtSignature {
        incident_id: get_str("incident_id")
            .filter(|s| !s.is_empty())
            .unwrap_or(incident_id)
            .to_string(),
        root_cause: get_str("root_cause")
            .filter(|s| !s.is_empty())
            .unwrap_or("Root cause not provided")
            .to_string(),
        root_cause_category: category,
        evidence_chain,
        affected_services: value
            .get("affected_services")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        confidence_score: clamp_unit(confidence),
        recommended_action: action,
        target_repository: get_str("target_repository").map(str::to_string),
        target_file: get_str("target_file").map(str::to_string),
        target_line: value.get("target_line").and_then(Value::as_i64),
        related_commits: value
            .get("related_commits")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        investigation_summary: get_str("investigation_summary")
            .filter(|s| !s.is_empty())
            .unwrap_or("Investigation summary unavailable")
            .to_string(),
        investigation_duration_seconds: value
            .get("investigation_duration_seconds")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
    })
}

// ── Orchestrator ─────────────────────────────────────────────────────────

pub struct Orchestrator {
    config: Arc<Config>,
    runner: Option<Arc<dyn ReasoningRunner>>,
    last_error: Mutex<Option<String>>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, runner: Option<Arc<dyn ReasoningRunner>>) -> Self {
        Self {
            config,
            runner,
            last_error: Mutex::new(None),
        }
    }

    fn set_last_error(&self, error: Option<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = error;
        }
    }

    pub fn adk_runtime_status(&self) -> AdkRuntimeStatus {
        let usable_key = usable_api_key(&self.config.gemini_api_key);
        let use_mock = self.config.effective_use_mock_providers();
        let runner_available = self.runner.is_some();
        AdkRuntimeStatus {
            adk_mode: "strict".into(),
            adk_ready: runner_available && usable_key && !use_mock,
            adk_last_error: self.last_error.lock().ok().and_then(|g| g.clone()),
            runner_available,
            mock_fallback_allowed: self.config.allow_mock_fallback,
            adk_session_backend: self.config.adk_session_backend.clone(),
            runner_policy: RUNNER_POLICY.into(),
            service_revision: self.config.service_revision.clone(),
            service_service: self.config.service_service.clone(),
        }
    }

    fn finalize_execution_trace(
        &self,
        state: &mut IncidentState,
        path: &str,
        reason: &str,
        adk_error: Option<&str>,
    ) {
        let trace = &mut state.integration_trace;
        trace.execution_path = path.to_string();
        trace.execution_reason = if reason.is_empty() {
            "adk_runtime_exception".to_string()
        } else {
            reason.to_string()
        };
        trace.runner_policy = RUNNER_POLICY.to_string();
        trace.service_revision = self.config.service_revision.clone();
        trace.service_service = self.config.service_service.clone();
        trace.adk_error = adk_error.map(str::to_string);
    }

    // ── Pipeline entry point ─────────────────────────────────────────────

    /// Run the full per-incident pipeline. Never errors: failures are
    /// contained in the returned state's remediation record and trace.
    pub async fn run(
        &self,
        raw_alert: &Value,
        incident_id: &str,
        providers: &ResolvedProviders,
    ) -> IncidentState {
        if self.config.is_legacy_mock_flag_used() {
            warn!("deprecated env USE_MOCK_MCP is in use; migrate to USE_MOCK_PROVIDERS");
        }

        if self.config.effective_use_mock_providers() {
            let error = "USE_MOCK_PROVIDERS is true";
            self.set_last_error(Some(error.into()));
            let mut state = self
                .run_deterministic(raw_alert, incident_id, providers)
                .await;
            self.finalize_execution_trace(&mut state, "mock_runner", "mock_flag_enabled", None);
            self.maybe_auto_merge(&mut state, providers).await;
            return state;
        }

        if !usable_api_key(&self.config.gemini_api_key) {
            let error = "Gemini API key is missing or placeholder";
            self.set_last_error(Some(error.into()));
            error!(incident_id, "runner policy rejects unusable reasoning API key");
            return self.build_adk_unavailable_state(
                raw_alert,
                incident_id,
                "missing_or_placeholder_api_key",
                error,
            );
        }

        let attempt = self
            .run_reasoning_path(raw_alert, incident_id, providers)
            .await;
        match attempt {
            Ok(mut state) => {
                self.set_last_error(None);
                self.finalize_execution_trace(&mut state, "adk", "adk_success", None);
                self.maybe_auto_merge(&mut state, providers).await;
                state
            }
            Err(err) => {
                let error = flatten_error_messages(&err);
                self.set_last_error(Some(error.clone()));
                if is_missing_tool_error(&error) {
                    match self
                        .run_recovery_path(raw_alert, incident_id, providers)
                        .await
                    {
                        Ok(mut state) => {
                            warn!(
                                incident_id,
                                error = %error,
                                "reasoning run failed on missing tool; recovered via direct integrations"
                            );
                            self.finalize_execution_trace(
                                &mut state,
                                "adk_recovered",
                                "adk_missing_tool_recovered",
                                Some(&error),
                            );
                            self.maybe_auto_merge(&mut state, providers).await;
                            return state;
                        }
                        Err(recovery_err) => {
                            error!(
                                incident_id,
                                error = %error,
                                recovery_error = %flatten_error_messages(&recovery_err),
                                "missing-tool recovery failed"
                            );
                        }
                    }
                }
                error!(incident_id, error = %error, "reasoning orchestration failed");
                self.build_adk_unavailable_state(
                    raw_alert,
                    incident_id,
                    "adk_runtime_exception",
                    &error,
                )
            }
        }
    }

    async fn run_reasoning_path(
        &self,
        raw_alert: &Value,
        incident_id: &str,
        providers: &ResolvedProviders,
    ) -> Result<IncidentState> {
        let Some(runner) = &self.runner else {
            bail!("reasoning runner is not configured");
        };
        let emitted = runner.run(raw_alert, incident_id).await?;

        let mut state = IncidentState {
            raw_alert: raw_alert.clone(),
            ..IncidentState::default()
        };
        state.validated_alert =
            normalize_runner_validated_alert(emitted.get("validated_alert"), incident_id);
        state.thought_signature =
            normalize_runner_thought_signature(emitted.get("thought_signature"), incident_id);

        self.apply_direct_integrations(&mut state, raw_alert, incident_id, providers)
            .await?;
        Ok(state)
    }

    async fn run_recovery_path(
        &self,
        raw_alert: &Value,
        incident_id: &str,
        providers: &ResolvedProviders,
    ) -> Result<IncidentState> {
        let mut state = IncidentState {
            raw_alert: raw_alert.clone(),
            ..IncidentState::default()
        };
        self.apply_direct_integrations(&mut state, raw_alert, incident_id, providers)
            .await?;
        Ok(state)
    }

    /// Deterministic pipeline used under the mock-provider flag: sentinel
    /// triage with the built-in fallback, then the same direct integrations.
    async fn run_deterministic(
        &self,
        raw_alert: &Value,
        incident_id: &str,
        providers: &ResolvedProviders,
    ) -> IncidentState {
        let mut state = IncidentState {
            raw_alert: raw_alert.clone(),
            ..IncidentState::default()
        };
        let (validated, trace) =
            evaluate_alert(raw_alert, incident_id, Some(&DeterministicFallback));
        let actionable = validated.is_actionable;
        state.sentinel_trace = Some(trace);
        state.validated_alert = Some(validated);
        if !actionable {
            return state;
        }
        append_timeline_event(
            &mut state,
            TimelineEventType::AlertValidated,
            Some("Sentinel"),
            None,
        );

        if let Err(e) = self
            .apply_direct_integrations(&mut state, raw_alert, incident_id, providers)
            .await
        {
            let message = flatten_error_messages(&e);
            error!(incident_id, error = %message, "direct integrations failed");
            state.integration_trace.post_processor_error = Some(message);
        }
        state
    }

    // ── Direct integrations ──────────────────────────────────────────────

    /// The integration stage: ticket creation, transition cascade, PR
    /// creation and gate fetch. Always executed by the core after any
    /// external reasoning. Provider failures are contained; the api-mode
    /// backend contract violation is the one hard error.
    pub async fn apply_direct_integrations(
        &self,
        state: &mut IncidentState,
        raw_alert: &Value,
        incident_id: &str,
        providers: &ResolvedProviders,
    ) -> Result<()> {
        {
            let trace = &mut state.integration_trace;
            trace.ticket_provider = providers.ticket_backend.clone();
            trace.code_provider = providers.code_backend.clone();
            trace.fallback_used = providers.ticket_backend.ends_with("mock")
                || providers.code_backend.ends_with("mock");
            trace.post_processor = Some("direct_integrations".into());
        }

        // Strict mode: an api-mode provider must never silently resolve to
        // its mock twin. The mock flag bypasses the contract wholesale.
        if !self.config.effective_use_mock_providers() {
            if self.config.jira_integration_mode.eq_ignore_ascii_case("api")
                && providers.ticket_backend != "jira_api"
            {
                bail!("jira_api_requested_but_mock_provider_resolved");
            }
            if self.config.github_integration_mode.eq_ignore_ascii_case("api")
                && providers.code_backend != "github_api"
            {
                bail!("github_api_requested_but_mock_provider_resolved");
            }
        }

        if state.validated_alert.is_none() {
            let (validated, trace) = evaluate_alert(raw_alert, incident_id, None);
            state.sentinel_trace = Some(trace);
            state.validated_alert = Some(validated);
            append_timeline_event(
                state,
                TimelineEventType::AlertValidated,
                Some("Sentinel"),
                None,
            );
        }
        let validated = state
            .validated_alert
            .clone()
            .unwrap_or_else(|| unreachable_validated(incident_id));

        if state.thought_signature.is_none() {
            state.thought_signature = Some(build_fallback_thought_signature(
                incident_id,
                raw_alert,
                &validated,
                &self.config,
            ));
            append_timeline_event(
                state,
                TimelineEventType::RootCauseIdentified,
                Some("Sherlock"),
                None,
            );
        }

        // Payload-supplied remediation targets override the signature.
        if let Some(signature) = state.thought_signature.as_mut() {
            if let Some(repository) = raw_alert.get("repository").and_then(Value::as_str) {
                signature.target_repository = Some(repository.to_string());
            }
            if let Some(target_file) = raw_alert.get("target_file").and_then(Value::as_str) {
                signature.target_file = Some(target_file.to_string());
            }
        }
        let signature = state
            .thought_signature
            .clone()
            .unwrap_or_else(|| unreachable_signature(incident_id));

        let (summary, priority) = ticket_summary_and_priority(&signature, validated.severity);

        let ticket = match providers
            .ticket
            .create_incident_ticket(
                incident_id,
                &summary,
                &signature.investigation_summary,
                priority,
            )
            .await
        {
            Ok(ticket) => {
                append_timeline_event(
                    state,
                    TimelineEventType::TicketCreated,
                    Some("Administrator"),
                    None,
                );
                ticket
            }
            Err(e) => {
                let message = flatten_error_messages(&e);
                state.jira_ticket = None;
                state.remediation_result = Some(RemediationResult::failed(
                    signature.recommended_action,
                    format!("Jira provider failure: {message}"),
                ));
                state.ci_status = CiStatus::Pending;
                state.codeowner_review_status = ReviewStatus::Pending;
                state.integration_trace.post_processor_error =
                    Some(format!("jira_error: {message}"));
                return Ok(());
            }
        };

        // TODO and IN_PROGRESS must land before the PR exists.
        self.cascade_transition(
            state,
            providers,
            &ticket,
            &self.config.jira_status_todo.clone(),
            TimelineEventType::TicketMovedTodo,
        )
        .await?;
        self.cascade_transition(
            state,
            providers,
            &ticket,
            &self.config.jira_status_in_progress.clone(),
            TimelineEventType::TicketMovedInProgress,
        )
        .await?;

        let request = RemediationRequest {
            incident_id: incident_id.to_string(),
            repository: signature
                .target_repository
                .clone()
                .unwrap_or_else(|| format!("{}/resilix-demo-app", self.config.github_owner)),
            target_file: signature
                .target_file
                .clone()
                .unwrap_or_else(|| "README.md".to_string()),
            action: signature.recommended_action,
            summary: signature.root_cause.clone(),
            context: RemediationContext {
                service_name: validated.service_name.clone(),
                root_cause_category: signature.root_cause_category.as_str().to_string(),
                recommended_action: signature.recommended_action.as_str().to_string(),
                related_commits: signature.related_commits.clone(),
                investigation_summary: signature.investigation_summary.clone(),
                confidence_score: signature.confidence_score,
            },
        };

        let remediation = match providers.code.create_remediation_pr(&request).await {
            Ok(remediation) => {
                if remediation.has_pr() {
                    append_timeline_event(
                        state,
                        TimelineEventType::PrCreated,
                        Some("Mechanic"),
                        None,
                    );
                }
                remediation
            }
            Err(e) => {
                let message = flatten_error_messages(&e);
                state.jira_ticket = Some(ticket);
                state.remediation_result = Some(RemediationResult::failed(
                    signature.recommended_action,
                    format!("GitHub provider failure: {message}"),
                ));
                state.ci_status = CiStatus::Pending;
                state.codeowner_review_status = ReviewStatus::Pending;
                state.integration_trace.post_processor_error =
                    Some(format!("github_error: {message}"));
                return Ok(());
            }
        };

        state.jira_ticket = Some(ticket.clone());
        state.remediation_result = Some(remediation.clone());

        match (remediation.pr_number, signature.target_repository.as_deref()) {
            (Some(pr_number), Some(repository)) => {
                match providers
                    .code
                    .get_merge_gate_status(repository, pr_number)
                    .await
                {
                    Ok(gate) => {
                        state.ci_status = if gate.ci_passed {
                            CiStatus::CiPassed
                        } else {
                            CiStatus::Pending
                        };
                        state.codeowner_review_status = if gate.codeowner_reviewed {
                            ReviewStatus::Approved
                        } else {
                            ReviewStatus::Pending
                        };
                        state.integration_trace.gate_details = Some(gate.details);
                    }
                    Err(e) => {
                        let message = flatten_error_messages(&e);
                        warn!(incident_id, error = %message, "merge-gate fetch failed");
                        state.ci_status = CiStatus::Pending;
                        state.codeowner_review_status = ReviewStatus::Pending;
                        state.integration_trace.provider_error =
                            Some(format!("gate_error: {message}"));
                    }
                }
            }
            _ => {
                state.ci_status = CiStatus::CiPassed;
                state.codeowner_review_status = ReviewStatus::Pending;
            }
        }

        // IN_REVIEW strictly after the PR exists.
        self.cascade_transition(
            state,
            providers,
            &ticket,
            &self.config.jira_status_in_review.clone(),
            TimelineEventType::TicketMovedInReview,
        )
        .await?;

        Ok(())
    }

    async fn cascade_transition(
        &self,
        state: &mut IncidentState,
        providers: &ResolvedProviders,
        ticket: &TicketRecord,
        target_status: &str,
        event_type: TimelineEventType,
    ) -> Result<()> {
        if ticket.ticket_key.is_empty() {
            warn!(target_status, "skipping ticket transition: missing ticket key");
            return Ok(());
        }

        let outcome = providers
            .ticket
            .transition_ticket(&ticket.ticket_key, target_status)
            .await?;
        let ok = outcome.ok;
        let reason = outcome.reason.clone();
        state.integration_trace.jira_transitions.push(outcome);

        if ok {
            append_timeline_event(
                state,
                event_type,
                Some("Administrator"),
                Some(detail_map(&[
                    ("to_status", json!(target_status)),
                    ("ticket_key", json!(ticket.ticket_key)),
                ])),
            );
            return Ok(());
        }

        append_timeline_event(
            state,
            TimelineEventType::TicketTransitionFailed,
            Some("Administrator"),
            Some(detail_map(&[
                ("to_status", json!(target_status)),
                ("reason", json!(reason)),
                ("ticket_key", json!(ticket.ticket_key)),
            ])),
        );
        warn!(
            ticket_key = %ticket.ticket_key,
            target_status,
            reason = reason.as_deref().unwrap_or(""),
            "ticket transition failed"
        );
        Ok(())
    }

    // ── Auto-merge (approval not required) ───────────────────────────────

    async fn maybe_auto_merge(&self, state: &mut IncidentState, providers: &ResolvedProviders) {
        if self.config.require_pr_approval {
            return;
        }
        if !evaluate_merge_eligibility(state).eligible {
            return;
        }

        let pr_number = state.remediation_result.as_ref().and_then(|r| r.pr_number);
        let repository = state
            .thought_signature
            .as_ref()
            .and_then(|s| s.target_repository.clone());
        if let (Some(pr_number), Some(repository)) = (pr_number, repository) {
            match providers
                .code
                .merge_pr(&repository, pr_number, &self.config.merge_method)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(pr_number, "auto-merge refused by code provider");
                    return;
                }
                Err(e) => {
                    let message = flatten_error_messages(&e);
                    warn!(pr_number, error = %message, "auto-merge call failed");
                    state.integration_trace.provider_error =
                        Some(format!("merge_error: {message}"));
                    return;
                }
            }
        }

        if let Some(remediation) = state.remediation_result.as_mut() {
            remediation.pr_merged = true;
        }
        state.resolved_at = Some(Utc::now());
        append_timeline_event(state, TimelineEventType::PrMerged, Some("Mechanic"), None);
        append_timeline_event(
            state,
            TimelineEventType::IncidentResolved,
            Some("System"),
            None,
        );
    }

    // ── Unavailable-runner fallback state ────────────────────────────────

    fn build_adk_unavailable_state(
        &self,
        raw_alert: &Value,
        incident_id: &str,
        reason: &str,
        error: &str,
    ) -> IncidentState {
        let mut state = IncidentState {
            raw_alert: raw_alert.clone(),
            ..IncidentState::default()
        };

        let (validated, sentinel_trace) =
            evaluate_alert(raw_alert, incident_id, Some(&DeterministicFallback));
        let signature =
            build_fallback_thought_signature(incident_id, raw_alert, &validated, &self.config);
        let action = signature.recommended_action;
        state.sentinel_trace = Some(sentinel_trace);
        state.validated_alert = Some(validated);
        state.thought_signature = Some(signature);
        state.integration_trace.fallback_used = true;
        state.integration_trace.fallback_path = Some("deterministic".into());

        state.remediation_result = Some(RemediationResult::failed(
            action,
            if error.is_empty() { reason } else { error },
        ));
        self.finalize_execution_trace(&mut state, "adk_unavailable", reason, Some(error));
        state
    }

    // ── Approve-merge ────────────────────────────────────────────────────

    /// Approve-merge core: refresh runtime gate policy and gate status,
    /// evaluate the approval policy, merge and drive the ticket to DONE.
    pub async fn approve_merge(
        &self,
        state: &mut IncidentState,
        providers: &ResolvedProviders,
    ) -> Result<ApprovalOutcome> {
        // Operator changes to the gate take effect on the next request.
        state.policy = self.config.runtime_gate_policy();

        let pr_number = state.remediation_result.as_ref().and_then(|r| r.pr_number);
        let repository = state
            .thought_signature
            .as_ref()
            .and_then(|s| s.target_repository.clone());

        if providers.code_backend == "github_api" {
            if let (Some(pr_number), Some(repository)) = (pr_number, repository.as_deref()) {
                let gate = providers
                    .code
                    .get_merge_gate_status(repository, pr_number)
                    .await?;
                state.ci_status = if gate.ci_passed {
                    CiStatus::CiPassed
                } else {
                    CiStatus::Pending
                };
                state.codeowner_review_status = if gate.codeowner_reviewed {
                    ReviewStatus::Approved
                } else {
                    ReviewStatus::Pending
                };
                state.integration_trace.code_provider = providers.code_backend.clone();
                state.integration_trace.gate_details = Some(gate.details);
            }
        }

        let decision = evaluate_approval_request(state);
        if !decision.eligible {
            return Ok(ApprovalOutcome::Rejected(decision));
        }

        let merge_ok = match (pr_number, repository.as_deref()) {
            (Some(pr_number), Some(repository)) => {
                providers
                    .code
                    .merge_pr(repository, pr_number, &state.policy.merge_method)
                    .await?
            }
            _ => true,
        };
        if !merge_ok {
            return Ok(ApprovalOutcome::MergeFailed);
        }

        apply_approval_and_merge(state);
        append_timeline_event(state, TimelineEventType::PrMerged, Some("Mechanic"), None);

        if let Some(ticket) = state.jira_ticket.clone() {
            self.cascade_transition(
                state,
                providers,
                &ticket,
                &self.config.jira_status_done.clone(),
                TimelineEventType::TicketMovedDone,
            )
            .await?;
        }

        append_timeline_event(
            state,
            TimelineEventType::IncidentResolved,
            Some("System"),
            None,
        );
        Ok(ApprovalOutcome::Approved)
    }
}

// ── Pipeline/initial state merge ─────────────────────────────────────────

/// Overlay a pipeline-produced state on the initial webhook state: the
/// pipeline wins field-by-field, timelines concatenate, identity and
/// approval/policy snapshots stay with the initial record, and a merged PR
/// never becomes unmerged.
pub fn merge_pipeline_state(initial: IncidentState, pipeline: IncidentState) -> IncidentState {
    let initially_merged = initial
        .remediation_result
        .as_ref()
        .is_some_and(|r| r.pr_merged);

    let mut merged = pipeline;
    merged.incident_id = initial.incident_id;
    merged.created_at = initial.created_at;
    if merged.raw_alert.is_null() {
        merged.raw_alert = initial.raw_alert;
    }
    merged.approval = initial.approval;
    merged.policy = initial.policy;
    merged.resolved_at = merged.resolved_at.or(initial.resolved_at);
    merged.validated_alert = merged.validated_alert.or(initial.validated_alert);
    merged.sentinel_trace = merged.sentinel_trace.or(initial.sentinel_trace);
    merged.thought_signature = merged.thought_signature.or(initial.thought_signature);
    merged.jira_ticket = merged.jira_ticket.or(initial.jira_ticket);

    if initially_merged {
        match merged.remediation_result.as_mut() {
            Some(remediation) => remediation.pr_merged = true,
            None => merged.remediation_result = initial.remediation_result.clone(),
        }
    } else {
        merged.remediation_result = merged.remediation_result.or(initial.remediation_result);
    }

    let mut timeline = initial.timeline;
    timeline.extend(merged.timeline);
    merged.timeline = timeline;
    merged
}

// Placeholder records for fields that are always populated before these run.
fn unreachable_validated(incident_id: &str) -> ValidatedAlert {
    ValidatedAlert {
        alert_id: incident_id.to_string(),
        is_actionable: true,
        severity: Severity::High,
        service_name: "unknown-service".into(),
        error_type: "UnknownAlert".into(),
        error_rate: 0.0,
        affected_endpoints: Vec::new(),
        triggered_at: Utc::now(),
        enrichment: crate::types::AlertEnrichment::default(),
        triage_reason: "No triage reason provided".into(),
    }
}

fn unreachable_signature(incident_id: &str) -> ThoughtSignature {
    ThoughtSignature {
        incident_id: incident_id.to_string(),
        root_cause: "Root cause not provided".into(),
        root_cause_category: RootCauseCategory::CodeBug,
        evidence_chain: Vec::new(),
        affected_services: Vec::new(),
        confidence_score: 0.7,
        recommended_action: RecommendedAction::FixCode,
        target_repository: None,
        target_file: None,
        target_line: None,
        related_commits: Vec::new(),
        investigation_summary: "Investigation summary unavailable".into(),
        investigation_duration_seconds: 0.0,
    }
}
