use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use resilix_core::provider::{CodeProvider, TicketProvider};
use resilix_core::types::{
    MergeGateStatus, RemediationRequest, RemediationResult, TicketRecord, TransitionOutcome,
};

use crate::patch;

/// Deterministic per-incident number so re-drives resolve to the same
/// mock ticket/PR identifiers.
fn stable_hash(input: &str) -> u32 {
    input
        .bytes()
        .fold(2166136261u32, |hash, byte| {
            (hash ^ u32::from(byte)).wrapping_mul(16777619)
        })
}

// ── Mock ticket provider ─────────────────────────────────────────────────

#[derive(Debug)]
pub struct MockTicketProvider;

#[async_trait]
impl TicketProvider for MockTicketProvider {
    async fn create_incident_ticket(
        &self,
        incident_id: &str,
        summary: &str,
        _description: &str,
        priority: &str,
    ) -> Result<TicketRecord> {
        let ticket_num = stable_hash(incident_id) % 100_000;
        let ticket_key = format!("SRE-{ticket_num:05}");
        Ok(TicketRecord {
            ticket_url: format!("https://example.atlassian.net/browse/{ticket_key}"),
            ticket_key,
            summary: summary.to_string(),
            priority: priority.to_string(),
            status: "Open".to_string(),
            created_at: Utc::now(),
        })
    }

    async fn transition_ticket(
        &self,
        _ticket_key: &str,
        target_status: &str,
    ) -> Result<TransitionOutcome> {
        Ok(TransitionOutcome {
            ok: true,
            from_status: None,
            to_status: target_status.to_string(),
            applied_transition_id: Some("mock-transition".to_string()),
            reason: None,
        })
    }
}

// ── Mock code provider ───────────────────────────────────────────────────

#[derive(Debug)]
pub struct MockCodeProvider;

#[async_trait]
impl CodeProvider for MockCodeProvider {
    async fn create_remediation_pr(
        &self,
        request: &RemediationRequest,
    ) -> Result<RemediationResult> {
        let pr_number = i64::from(stable_hash(&request.incident_id) % 9000) + 1000;
        // Run the real patch engine over an empty file so the preview is
        // the same shape an api-backed PR would carry.
        let outcome = patch::render_remediation(&request.target_file, None, request);
        Ok(RemediationResult {
            success: true,
            action_taken: request.action,
            branch_name: Some(format!(
                "fix/resilix-{}",
                request.incident_id.to_lowercase()
            )),
            pr_number: Some(pr_number),
            pr_url: Some(format!(
                "https://github.com/{}/pull/{pr_number}",
                request.repository
            )),
            pr_merged: false,
            target_file: Some(request.target_file.clone()),
            diff_old_line: outcome.diff_old_line,
            diff_new_line: outcome.diff_new_line,
            execution_time_seconds: 1.0,
            error_message: None,
        })
    }

    async fn get_merge_gate_status(
        &self,
        repository: &str,
        pr_number: i64,
    ) -> Result<MergeGateStatus> {
        Ok(MergeGateStatus {
            ci_passed: true,
            codeowner_reviewed: true,
            details: json!({
                "provider": "mock",
                "repository": repository,
                "pr_number": pr_number,
            }),
        })
    }

    async fn merge_pr(&self, _repository: &str, _pr_number: i64, _method: &str) -> Result<bool> {
        Ok(true)
    }
}
