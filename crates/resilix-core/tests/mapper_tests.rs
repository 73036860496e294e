use chrono::{Duration, Utc};
use serde_json::json;

use resilix_core::mapper::{
    compute_mttr, derive_status_fields, state_to_incident_detail, state_to_incident_summary,
};
use resilix_core::types::{
    AlertEnrichment, Approval, ApprovalStatus, CiStatus, IncidentState, IncidentStatus, PrStatus,
    RecommendedAction, RemediationResult, Severity, TimelineEventType, ValidatedAlert,
};

// ── helpers ──────────────────────────────────────────────────────────────

fn validated_alert() -> ValidatedAlert {
    ValidatedAlert {
        alert_id: "INC-00000010".into(),
        is_actionable: true,
        severity: Severity::High,
        service_name: "checkout-api".into(),
        error_type: "HighErrorRate".into(),
        error_rate: 4.0,
        affected_endpoints: vec![],
        triggered_at: Utc::now(),
        enrichment: AlertEnrichment::default(),
        triage_reason: "Signals detected: error_rate_high:1".into(),
    }
}

fn remediation(pr: bool, merged: bool) -> RemediationResult {
    RemediationResult {
        success: true,
        action_taken: RecommendedAction::FixCode,
        branch_name: pr.then(|| "fix/resilix-inc-00000010".to_string()),
        pr_number: pr.then_some(1234),
        pr_url: pr.then(|| "https://github.com/acme/demo/pull/1234".to_string()),
        pr_merged: merged,
        target_file: Some("src/app/handlers.py".into()),
        diff_old_line: None,
        diff_new_line: None,
        execution_time_seconds: 1.0,
        error_message: None,
    }
}

fn state(
    remediation_result: Option<RemediationResult>,
    required: bool,
    approved: bool,
    ci: CiStatus,
) -> IncidentState {
    IncidentState {
        incident_id: "INC-00000010".into(),
        created_at: Some(Utc::now()),
        validated_alert: Some(validated_alert()),
        remediation_result,
        approval: Approval {
            required,
            approved,
            approved_at: None,
        },
        ci_status: ci,
        ..IncidentState::default()
    }
}

// ── decision table ───────────────────────────────────────────────────────

#[test]
fn test_no_remediation_is_processing() {
    let s = state(None, true, false, CiStatus::Pending);
    assert_eq!(
        derive_status_fields(&s),
        (
            IncidentStatus::Processing,
            ApprovalStatus::NotRequired,
            PrStatus::NotCreated
        )
    );
}

#[test]
fn test_merged_pr_is_resolved() {
    let s = state(Some(remediation(true, true)), true, false, CiStatus::CiPassed);
    assert_eq!(
        derive_status_fields(&s),
        (
            IncidentStatus::Resolved,
            ApprovalStatus::Approved,
            PrStatus::Merged
        )
    );
}

#[test]
fn test_ci_passed_awaiting_approval() {
    let s = state(Some(remediation(true, false)), true, false, CiStatus::CiPassed);
    assert_eq!(
        derive_status_fields(&s),
        (
            IncidentStatus::AwaitingApproval,
            ApprovalStatus::Pending,
            PrStatus::CiPassed
        )
    );
}

#[test]
fn test_ci_passed_approved_is_merging() {
    let s = state(Some(remediation(true, false)), true, true, CiStatus::CiPassed);
    assert_eq!(
        derive_status_fields(&s),
        (
            IncidentStatus::Merging,
            ApprovalStatus::Approved,
            PrStatus::CiPassed
        )
    );
}

#[test]
fn test_ci_passed_approval_not_required_is_merging() {
    let s = state(Some(remediation(true, false)), false, false, CiStatus::CiPassed);
    assert_eq!(
        derive_status_fields(&s),
        (
            IncidentStatus::Merging,
            ApprovalStatus::NotRequired,
            PrStatus::CiPassed
        )
    );
}

#[test]
fn test_pending_ci_is_processing() {
    let s = state(Some(remediation(true, false)), true, false, CiStatus::Pending);
    assert_eq!(
        derive_status_fields(&s),
        (
            IncidentStatus::Processing,
            ApprovalStatus::Pending,
            PrStatus::PendingCi
        )
    );

    let s = state(Some(remediation(true, false)), false, false, CiStatus::Pending);
    assert_eq!(
        derive_status_fields(&s),
        (
            IncidentStatus::Processing,
            ApprovalStatus::NotRequired,
            PrStatus::PendingCi
        )
    );
}

#[test]
fn test_successful_remediation_without_pr_is_resolved() {
    let s = state(Some(remediation(false, false)), true, false, CiStatus::Pending);
    assert_eq!(
        derive_status_fields(&s),
        (
            IncidentStatus::Resolved,
            ApprovalStatus::NotRequired,
            PrStatus::NotCreated
        )
    );
}

#[test]
fn test_status_is_pure_function_of_state() {
    let s = state(Some(remediation(true, false)), true, false, CiStatus::CiPassed);
    assert_eq!(derive_status_fields(&s), derive_status_fields(&s));
}

// ── MTTR ─────────────────────────────────────────────────────────────────

#[test]
fn test_mttr_positive() {
    let created = Utc::now();
    let resolved = created + Duration::seconds(90);
    assert_eq!(compute_mttr(created, Some(resolved)), Some(90.0));
}

#[test]
fn test_mttr_undefined_without_resolution() {
    assert_eq!(compute_mttr(Utc::now(), None), None);
}

#[test]
fn test_mttr_undefined_when_resolution_precedes_creation() {
    let created = Utc::now();
    let resolved = created - Duration::seconds(5);
    assert_eq!(compute_mttr(created, Some(resolved)), None);
}

// ── projections ──────────────────────────────────────────────────────────

#[test]
fn test_detail_carries_merged_invariant() {
    let mut s = state(Some(remediation(true, true)), true, true, CiStatus::CiPassed);
    s.resolved_at = Some(Utc::now());
    let detail = state_to_incident_detail("INC-00000010", &s);

    assert_eq!(detail.status, IncidentStatus::Resolved);
    assert_eq!(detail.pr_status, PrStatus::Merged);
    assert_eq!(detail.approval_status, ApprovalStatus::Approved);
    assert!(detail.mttr_seconds.is_some_and(|v| v >= 0.0));
}

#[test]
fn test_summary_matches_detail_projection() {
    let s = state(Some(remediation(true, false)), true, false, CiStatus::CiPassed);
    let detail = state_to_incident_detail("INC-00000010", &s);
    let summary = state_to_incident_summary("INC-00000010", &s);

    assert_eq!(summary.status, detail.status);
    assert_eq!(summary.pr_status, detail.pr_status);
    assert_eq!(summary.severity, detail.severity);
    assert_eq!(summary.service_name, detail.service_name);
}

#[test]
fn test_empty_timeline_is_synthesized() {
    let s = state(Some(remediation(true, true)), true, true, CiStatus::CiPassed);
    let detail = state_to_incident_detail("INC-00000010", &s);

    let kinds: Vec<_> = detail.timeline.iter().map(|e| e.event_type).collect();
    assert_eq!(kinds.first(), Some(&TimelineEventType::IncidentCreated));
    assert!(kinds.contains(&TimelineEventType::AlertValidated));
    assert!(kinds.contains(&TimelineEventType::PrMerged));
    assert!(kinds.contains(&TimelineEventType::IncidentResolved));
}

// ── serde round-trip ─────────────────────────────────────────────────────

#[test]
fn test_state_roundtrip_through_json() {
    let mut s = state(Some(remediation(true, false)), true, false, CiStatus::CiPassed);
    s.raw_alert = json!({"alerts": [{"labels": {"alertname": "HighErrorRate"}}]});

    let encoded = serde_json::to_string(&s).unwrap();
    let decoded: IncidentState = serde_json::from_str(&encoded).unwrap();

    assert_eq!(decoded.incident_id, s.incident_id);
    assert_eq!(decoded.ci_status, s.ci_status);
    assert_eq!(decoded.approval.required, s.approval.required);
    assert_eq!(
        decoded.remediation_result.as_ref().unwrap().pr_number,
        Some(1234)
    );
    assert_eq!(
        decoded.validated_alert.as_ref().unwrap().severity,
        Severity::High
    );
    assert_eq!(decoded.raw_alert, s.raw_alert);
}

#[test]
fn test_enums_serialize_as_snake_case_strings() {
    let s = state(Some(remediation(true, false)), true, false, CiStatus::CiPassed);
    let value = serde_json::to_value(&s).unwrap();

    assert_eq!(value["ci_status"], json!("ci_passed"));
    assert_eq!(value["validated_alert"]["severity"], json!("high"));
    assert_eq!(
        value["remediation_result"]["action_taken"],
        json!("fix_code")
    );
}
