use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::types::{
    ApprovalStatus, CiStatus, IncidentDetail, IncidentState, IncidentStatus, IncidentSummary,
    PrStatus, Severity, TimelineEvent, TimelineEventType,
};

// ── Field extraction ─────────────────────────────────────────────────────

fn extract_severity(state: &IncidentState) -> Severity {
    state
        .validated_alert
        .as_ref()
        .map(|v| v.severity)
        .unwrap_or(Severity::High)
}

fn extract_service_name(state: &IncidentState) -> String {
    state
        .validated_alert
        .as_ref()
        .map(|v| v.service_name.clone())
        .unwrap_or_else(|| "unknown-service".to_string())
}

fn extract_created_at(state: &IncidentState) -> DateTime<Utc> {
    if let Some(validated) = &state.validated_alert {
        return validated.triggered_at;
    }
    state.created_at.unwrap_or_else(Utc::now)
}

// ── Status projection ────────────────────────────────────────────────────

/// Pure projection of `(approval, ci_status, remediation_result)` onto the
/// externally visible status triple. Highest decision-table row wins.
pub fn derive_status_fields(state: &IncidentState) -> (IncidentStatus, ApprovalStatus, PrStatus) {
    let Some(remediation) = &state.remediation_result else {
        return (
            IncidentStatus::Processing,
            ApprovalStatus::NotRequired,
            PrStatus::NotCreated,
        );
    };

    if !remediation.has_pr() {
        if remediation.success {
            return (
                IncidentStatus::Resolved,
                ApprovalStatus::NotRequired,
                PrStatus::NotCreated,
            );
        }
        return (
            IncidentStatus::Processing,
            ApprovalStatus::NotRequired,
            PrStatus::NotCreated,
        );
    }

    if remediation.pr_merged {
        return (
            IncidentStatus::Resolved,
            ApprovalStatus::Approved,
            PrStatus::Merged,
        );
    }

    let required = state.approval.required;
    let approved = state.approval.approved;

    if state.ci_status == CiStatus::CiPassed {
        if required && !approved {
            return (
                IncidentStatus::AwaitingApproval,
                ApprovalStatus::Pending,
                PrStatus::CiPassed,
            );
        }
        if required && approved {
            return (
                IncidentStatus::Merging,
                ApprovalStatus::Approved,
                PrStatus::CiPassed,
            );
        }
        return (
            IncidentStatus::Merging,
            ApprovalStatus::NotRequired,
            PrStatus::CiPassed,
        );
    }

    if required {
        return (
            IncidentStatus::Processing,
            ApprovalStatus::Pending,
            PrStatus::PendingCi,
        );
    }
    (
        IncidentStatus::Processing,
        ApprovalStatus::NotRequired,
        PrStatus::PendingCi,
    )
}

/// Seconds between creation and resolution; undefined (None) when the
/// resolution timestamp precedes creation.
pub fn compute_mttr(
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
) -> Option<f64> {
    let resolved = resolved_at?;
    if resolved < created_at {
        return None;
    }
    let secs = (resolved - created_at).num_milliseconds() as f64 / 1000.0;
    Some((secs * 1000.0).round() / 1000.0)
}

// ── Timeline ─────────────────────────────────────────────────────────────

/// Single writer for the append-only timeline.
pub fn append_timeline_event(
    state: &mut IncidentState,
    event_type: TimelineEventType,
    agent: Option<&str>,
    details: Option<serde_json::Map<String, Value>>,
) {
    state.timeline.push(TimelineEvent {
        event_type,
        timestamp: Utc::now(),
        agent: agent.map(str::to_string),
        details: details.unwrap_or_default(),
        duration_ms: None,
    });
}

/// A legacy state saved before timeline tracking gets a synthesized one
/// derived from the fields that are present.
fn synthesize_timeline(state: &IncidentState, created_at: DateTime<Utc>) -> Vec<TimelineEvent> {
    let mut details = serde_json::Map::new();
    details.insert("source".into(), Value::String("synthesized".into()));
    let mut events = vec![TimelineEvent {
        event_type: TimelineEventType::IncidentCreated,
        timestamp: created_at,
        agent: Some("System".into()),
        details,
        duration_ms: None,
    }];

    let mut push = |event_type: TimelineEventType, agent: &str| {
        events.push(TimelineEvent {
            event_type,
            timestamp: created_at,
            agent: Some(agent.to_string()),
            details: serde_json::Map::new(),
            duration_ms: None,
        });
    };

    if state.validated_alert.is_some() {
        push(TimelineEventType::AlertValidated, "Sentinel");
    }
    if state.thought_signature.is_some() {
        push(TimelineEventType::RootCauseIdentified, "Sherlock");
    }
    if state.jira_ticket.is_some() {
        push(TimelineEventType::TicketCreated, "Administrator");
    }
    if let Some(remediation) = &state.remediation_result {
        if remediation.has_pr() {
            push(TimelineEventType::PrCreated, "Mechanic");
        }
        if remediation.pr_merged {
            push(TimelineEventType::PrMerged, "Mechanic");
            push(TimelineEventType::IncidentResolved, "System");
        }
    }
    events
}

// ── Projections ──────────────────────────────────────────────────────────

pub fn state_to_incident_detail(incident_id: &str, state: &IncidentState) -> IncidentDetail {
    let created_at = extract_created_at(state);
    let (status, approval_status, pr_status) = derive_status_fields(state);

    let mut resolved_at = state.resolved_at;
    if resolved_at.is_none()
        && state
            .remediation_result
            .as_ref()
            .is_some_and(|r| r.pr_merged)
    {
        resolved_at = Some(Utc::now());
    }

    let timeline = if state.timeline.is_empty() {
        synthesize_timeline(state, created_at)
    } else {
        state.timeline.clone()
    };

    IncidentDetail {
        incident_id: incident_id.to_string(),
        status,
        severity: extract_severity(state),
        service_name: extract_service_name(state),
        created_at,
        resolved_at,
        mttr_seconds: compute_mttr(created_at, resolved_at),
        approval_status,
        pr_status,
        validated_alert: state.validated_alert.clone(),
        thought_signature: state.thought_signature.clone(),
        jira_ticket: state.jira_ticket.clone(),
        remediation_result: state.remediation_result.clone(),
        timeline,
        integration_trace: state.integration_trace.clone(),
    }
}

pub fn state_to_incident_summary(incident_id: &str, state: &IncidentState) -> IncidentSummary {
    let detail = state_to_incident_detail(incident_id, state);
    IncidentSummary {
        incident_id: detail.incident_id,
        status: detail.status,
        severity: detail.severity,
        service_name: detail.service_name,
        created_at: detail.created_at,
        mttr_seconds: detail.mttr_seconds,
        approval_status: detail.approval_status,
        pr_status: detail.pr_status,
    }
}
