use chrono::Utc;

use crate::types::{
    CiStatus, IncidentState, RecommendedAction, RemediationResult, ReviewStatus,
};

/// Decision produced by the gate policy. Never an error; ineligibility is a
/// `code` the boundary maps onto a 409.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeDecision {
    pub eligible: bool,
    pub code: &'static str,
    pub message: &'static str,
}

impl MergeDecision {
    fn rejected(code: &'static str, message: &'static str) -> Self {
        Self {
            eligible: false,
            code,
            message,
        }
    }

    fn eligible(message: &'static str) -> Self {
        Self {
            eligible: true,
            code: "eligible",
            message,
        }
    }
}

fn has_pr(state: &IncidentState) -> bool {
    state
        .remediation_result
        .as_ref()
        .is_some_and(RemediationResult::has_pr)
}

fn is_merged(state: &IncidentState) -> bool {
    state
        .remediation_result
        .as_ref()
        .is_some_and(|r| r.pr_merged)
}

/// Shared gate predicates: PR exists, not merged, CI and code-owner review
/// satisfied under the state's policy snapshot.
fn check_gate(state: &IncidentState) -> Option<MergeDecision> {
    if !has_pr(state) {
        return Some(MergeDecision::rejected("pr_not_created", "PR not created"));
    }
    if is_merged(state) {
        return Some(MergeDecision::rejected("already_merged", "PR already merged"));
    }
    if state.policy.require_ci_pass && state.ci_status != CiStatus::CiPassed {
        return Some(MergeDecision::rejected(
            "ci_not_passed",
            "Merge approval requires CI passed",
        ));
    }
    if state.policy.require_codeowner_review
        && state.codeowner_review_status != ReviewStatus::Approved
    {
        return Some(MergeDecision::rejected(
            "codeowner_review_required",
            "Merge approval requires a code-owner review",
        ));
    }
    None
}

/// Gate evaluation for the human approve-merge endpoint.
pub fn evaluate_approval_request(state: &IncidentState) -> MergeDecision {
    if let Some(rejection) = check_gate(state) {
        return rejection;
    }
    if !state.approval.required {
        return MergeDecision::rejected(
            "approval_not_required",
            "Approval is not required for this incident",
        );
    }
    if state.approval.approved {
        return MergeDecision::rejected("already_approved", "PR already approved");
    }
    MergeDecision::eligible("PR can be approved and merged")
}

/// Gate evaluation for the auto-merge path taken when approval is not
/// required. Same predicates minus the approval-endpoint ones.
pub fn evaluate_merge_eligibility(state: &IncidentState) -> MergeDecision {
    if let Some(rejection) = check_gate(state) {
        return rejection;
    }
    if state.approval.required && !state.approval.approved {
        return MergeDecision::rejected("approval_pending", "Manual approval is pending");
    }
    MergeDecision::eligible("PR merge is allowed")
}

/// Terminal success mutation: stamp approval, mark the PR merged and record
/// the resolution time. `pr_merged` never transitions back to false after
/// this point.
pub fn apply_approval_and_merge(state: &mut IncidentState) {
    let now = Utc::now();
    state.approval.approved = true;
    state.approval.approved_at = Some(now);

    let remediation = state.remediation_result.get_or_insert_with(|| RemediationResult {
        success: true,
        action_taken: RecommendedAction::FixCode,
        branch_name: None,
        pr_number: None,
        pr_url: None,
        pr_merged: false,
        target_file: None,
        diff_old_line: None,
        diff_new_line: None,
        execution_time_seconds: 0.0,
        error_message: None,
    });
    remediation.pr_merged = true;
    state.resolved_at = Some(now);
}
