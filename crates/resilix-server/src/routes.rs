use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use resilix_core::{
    mapper::{append_timeline_event, state_to_incident_detail, state_to_incident_summary},
    orchestrator::{merge_pipeline_state, ApprovalOutcome, RUNNER_POLICY},
    types::{Approval, IncidentState, TimelineEventType},
};
use resilix_providers::router::{get_provider_readiness, resolve_providers, ProviderConfigError};

use crate::AppState;

// ── Error helpers ─────────────────────────────────────────────────────────

pub(crate) type ApiError = (StatusCode, Json<Value>);

pub(crate) fn internal(e: impl std::fmt::Display) -> ApiError {
    tracing::error!("internal error: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "detail": "internal error" })),
    )
}

fn bad_request(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "detail": message })))
}

fn not_found() -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "detail": "Incident not found" })),
    )
}

fn conflict(code: &str, message: &str) -> ApiError {
    (
        StatusCode::CONFLICT,
        Json(json!({ "detail": { "code": code, "message": message } })),
    )
}

fn provider_not_ready(details: Value) -> ApiError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "detail": { "code": "provider_not_ready", "details": details } })),
    )
}

fn provider_config_error(err: &ProviderConfigError) -> ApiError {
    provider_not_ready(serde_json::to_value(err).unwrap_or(Value::Null))
}

// ── Webhook helpers ───────────────────────────────────────────────────────

fn validate_prometheus_payload(payload: &Value) -> Result<(), ApiError> {
    let Some(obj) = payload.as_object() else {
        return Err(bad_request("Invalid payload"));
    };
    if !obj.contains_key("alerts") && !obj.contains_key("status") {
        return Err(bad_request("Missing alerts/status in payload"));
    }
    Ok(())
}

fn extract_simulation_context(payload: &Value) -> Option<&serde_json::Map<String, Value>> {
    let simulation = payload.get("simulation")?.as_object()?;
    let source = simulation.get("source")?.as_str()?.trim();
    let scenario = simulation
        .get("scenario")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("")
        .trim();
    if source != "resilix-simulator" || scenario.is_empty() {
        return None;
    }
    Some(simulation)
}

fn emit_simulation_cascade_logs(
    incident_id: &str,
    simulation: &serde_json::Map<String, Value>,
    log_entries: Option<&Value>,
) {
    let entries = log_entries.and_then(serde_json::Value::as_array);
    let scenario = simulation
        .get("scenario")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("");
    info!(
        incident_id,
        simulation_scenario = scenario,
        simulation_seed = simulation.get("seed").and_then(serde_json::Value::as_i64),
        log_entry_count = entries.map(Vec::len).unwrap_or(0),
        "simulation cascade payload received"
    );
    for (sequence, entry) in entries
        .map(|e| e.as_slice())
        .unwrap_or_default()
        .iter()
        .filter(|e| e.is_object())
        .take(20)
        .enumerate()
    {
        info!(
            incident_id,
            simulation_scenario = scenario,
            sequence,
            cascade_event = entry.get("event").and_then(serde_json::Value::as_str).unwrap_or(""),
            service = entry.get("service").and_then(serde_json::Value::as_str).unwrap_or(""),
            component = entry.get("component").and_then(serde_json::Value::as_str).unwrap_or(""),
            message = entry.get("message").and_then(serde_json::Value::as_str).unwrap_or(""),
            "simulation cascade log"
        );
    }
}

/// Admission check: under the strict runner policy, an api-mode provider
/// that is not ready (or an unknown mode) rejects the webhook with a
/// structured 503 before any state is written.
fn check_provider_admission(state: &AppState) -> Result<(), ApiError> {
    if RUNNER_POLICY != "adk_only" {
        return Ok(());
    }
    let readiness = get_provider_readiness(&state.config);
    let checks = [
        ("jira", &state.config.jira_integration_mode, &readiness.jira),
        (
            "github",
            &state.config.github_integration_mode,
            &readiness.github,
        ),
    ];
    for (provider, mode, provider_readiness) in checks {
        let mode = mode.trim().to_lowercase();
        if mode == "api" && !provider_readiness.ready {
            return Err(provider_not_ready(json!({
                "provider": provider,
                "reason": provider_readiness.reason,
                "missing_fields": provider_readiness.missing_fields,
            })));
        }
        if mode != "api" && mode != "mock" {
            return Err(provider_not_ready(json!({
                "provider": provider,
                "reason": "invalid_mode",
                "missing_fields": [format!("{}_INTEGRATION_MODE", provider.to_uppercase())],
            })));
        }
    }
    Ok(())
}

// ── Handlers ──────────────────────────────────────────────────────────────

pub(crate) async fn prometheus_webhook(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    validate_prometheus_payload(&payload)?;
    check_provider_admission(&state)?;

    let incident_id = format!("INC-{:08x}", rand::random::<u32>());

    if let Some(simulation) = extract_simulation_context(&payload) {
        emit_simulation_cascade_logs(&incident_id, simulation, payload.get("log_entries"));
    }

    let mut initial = IncidentState {
        incident_id: incident_id.clone(),
        raw_alert: payload.clone(),
        created_at: Some(Utc::now()),
        approval: Approval {
            required: state.config.require_pr_approval,
            approved: false,
            approved_at: None,
        },
        policy: state.config.gate_policy(),
        ..IncidentState::default()
    };
    initial.integration_trace.service_revision = state.config.service_revision.clone();
    initial.integration_trace.service_service = state.config.service_service.clone();
    let mut created_details = serde_json::Map::new();
    created_details.insert("source".into(), json!("prometheus_webhook"));
    append_timeline_event(
        &mut initial,
        TimelineEventType::IncidentCreated,
        Some("System"),
        Some(created_details),
    );

    state
        .store
        .save(&incident_id, &initial)
        .await
        .map_err(internal)?;

    let providers =
        resolve_providers(&state.config).map_err(|e| provider_config_error(&e))?;
    let pipeline_state = state
        .orchestrator
        .run(&payload, &incident_id, &providers)
        .await;

    let merged = merge_pipeline_state(initial, pipeline_state);
    state
        .store
        .save(&incident_id, &merged)
        .await
        .map_err(internal)?;

    let (actionable, severity) = match &merged.validated_alert {
        Some(validated) => (validated.is_actionable, validated.severity.as_str()),
        None => (true, "unknown"),
    };
    Ok(Json(json!({
        "status": "accepted",
        "incident_id": incident_id,
        "actionable": actionable,
        "severity": severity,
    })))
}

pub(crate) async fn list_incidents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let items = state.store.list_items().await.map_err(internal)?;
    let mut summaries: Vec<_> = items
        .iter()
        .map(|(incident_id, incident)| state_to_incident_summary(incident_id, incident))
        .collect();
    summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    summaries.truncate(100);
    Ok(Json(json!({ "items": summaries })))
}

pub(crate) async fn get_incident(
    State(state): State<Arc<AppState>>,
    Path(incident_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let incident = state
        .store
        .get(&incident_id)
        .await
        .map_err(internal)?
        .ok_or_else(not_found)?;
    let detail = state_to_incident_detail(&incident_id, &incident);
    Ok(Json(serde_json::to_value(detail).map_err(internal)?))
}

pub(crate) async fn approve_merge(
    State(state): State<Arc<AppState>>,
    Path(incident_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let mut incident = state
        .store
        .get(&incident_id)
        .await
        .map_err(internal)?
        .ok_or_else(not_found)?;

    let providers =
        resolve_providers(&state.config).map_err(|e| provider_config_error(&e))?;

    let outcome = state
        .orchestrator
        .approve_merge(&mut incident, &providers)
        .await
        .map_err(internal)?;

    match outcome {
        ApprovalOutcome::Rejected(decision) => {
            warn!(
                incident_id = %incident_id,
                code = decision.code,
                "approve-merge rejected by policy"
            );
            Err(conflict(decision.code, decision.message))
        }
        ApprovalOutcome::MergeFailed => Err(conflict("merge_failed", "Merge attempt failed")),
        ApprovalOutcome::Approved => {
            state
                .store
                .save(&incident_id, &incident)
                .await
                .map_err(internal)?;
            let detail = state_to_incident_detail(&incident_id, &incident);
            Ok(Json(serde_json::to_value(detail).map_err(internal)?))
        }
    }
}

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    let readiness = get_provider_readiness(config);
    let effective_use_mock_providers = config.effective_use_mock_providers();
    let adk = state.orchestrator.adk_runtime_status();

    let frontend_served = (!config.frontend_dist_dir.is_empty()
        && std::path::Path::new(&config.frontend_dist_dir).exists())
        || std::path::Path::new("/app/frontend/dist").exists();

    let jira_mode = config.jira_integration_mode.trim().to_lowercase();
    let github_mode = config.github_integration_mode.trim().to_lowercase();
    let mut provider_contract_ok = true;
    match jira_mode.as_str() {
        "api" => provider_contract_ok = provider_contract_ok && readiness.jira.ready,
        "mock" => {}
        _ => provider_contract_ok = false,
    }
    match github_mode.as_str() {
        "api" => provider_contract_ok = provider_contract_ok && readiness.github.ready,
        "mock" => {}
        _ => provider_contract_ok = false,
    }

    let readiness_value = serde_json::to_value(&readiness).unwrap_or(Value::Null);

    Json(json!({
        "status": "ok",
        "provider_mode": if effective_use_mock_providers { "mock" } else { "api" },
        "legacy_flag_in_use": config.is_legacy_mock_flag_used(),
        "effective_use_mock_providers": effective_use_mock_providers,
        "allow_mock_fallback": config.allow_mock_fallback,
        "runner_policy": adk.runner_policy,
        "service_revision": adk.service_revision,
        "service_service": adk.service_service,
        "frontend_served": frontend_served,
        "app_version": config.app_version,
        "build_sha": config.build_sha,
        "adk_mode": adk.adk_mode,
        "adk_ready": adk.adk_ready,
        "adk_last_error": adk.adk_last_error,
        "adk_session_backend": adk.adk_session_backend,
        "mock_fallback_allowed": adk.mock_fallback_allowed,
        "provider_contract_ok": provider_contract_ok,
        "provider_readiness": readiness_value,
        "integration_backends": {
            "jira": readiness.jira.resolved_backend,
            "github": readiness.github.resolved_backend,
            "mode": {
                "jira": config.jira_integration_mode,
                "github": config.github_integration_mode,
            },
        },
    }))
}
