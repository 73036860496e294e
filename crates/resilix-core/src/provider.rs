use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::types::{
    MergeGateStatus, RemediationRequest, RemediationResult, TicketRecord, TransitionOutcome,
};

// ── Provider capability surfaces ─────────────────────────────────────────
//
// Exactly two variants exist for each capability (api, mock); selection is
// by configuration in the provider router, never by global state.

#[async_trait]
pub trait TicketProvider: Send + Sync + std::fmt::Debug {
    async fn create_incident_ticket(
        &self,
        incident_id: &str,
        summary: &str,
        description: &str,
        priority: &str,
    ) -> Result<TicketRecord>;

    /// Apply a named status transition. Selection misses and transport
    /// failures come back as a failure record unless the provider is in
    /// strict mode, in which case they propagate.
    async fn transition_ticket(
        &self,
        ticket_key: &str,
        target_status: &str,
    ) -> Result<TransitionOutcome>;
}

#[async_trait]
pub trait CodeProvider: Send + Sync + std::fmt::Debug {
    async fn create_remediation_pr(&self, request: &RemediationRequest)
        -> Result<RemediationResult>;

    async fn get_merge_gate_status(
        &self,
        repository: &str,
        pr_number: i64,
    ) -> Result<MergeGateStatus>;

    /// True on a completed merge, false when the provider refuses the merge
    /// (method not allowed / conflict / not mergeable), error otherwise.
    async fn merge_pr(&self, repository: &str, pr_number: i64, method: &str) -> Result<bool>;
}

/// External reasoning runner that may produce triage and signature state.
/// Its emitted state is schema-lenient; the orchestrator always normalizes
/// it and re-runs the deterministic integration steps.
#[async_trait]
pub trait ReasoningRunner: Send + Sync {
    async fn run(&self, raw_alert: &Value, incident_id: &str) -> Result<Value>;
}

/// A ticket/code provider pair as resolved by the router, together with the
/// backend labels the strict-mode contract is checked against.
#[derive(Clone)]
pub struct ResolvedProviders {
    pub ticket: Arc<dyn TicketProvider>,
    pub ticket_backend: String,
    pub code: Arc<dyn CodeProvider>,
    pub code_backend: String,
}
