use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use resilix_core::config::Config;
use resilix_core::provider::{CodeProvider, ResolvedProviders, TicketProvider};

use crate::github::GithubApiProvider;
use crate::jira::JiraApiProvider;
use crate::mock::{MockCodeProvider, MockTicketProvider};

// ── Placeholder detection ────────────────────────────────────────────────

const PLACEHOLDERS: &[&str] = &[
    "",
    "placeholder",
    "placeholder_github_token",
    "placeholder_jira_api_token",
    "placeholder_jira_url",
    "placeholder_jira_username",
    "placeholder_jira_project_key",
    "placeholder_owner",
];

fn usable(value: &str) -> bool {
    !PLACEHOLDERS.contains(&value.trim().to_lowercase().as_str())
}

// ── Structured config error ──────────────────────────────────────────────

/// Raised when an api-mode provider is requested without usable
/// credentials. The router never silently falls back to mock in api mode.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{provider} provider not usable in {mode} mode ({reason_code}; missing: {missing_fields:?})")]
pub struct ProviderConfigError {
    pub provider: String,
    pub mode: String,
    pub reason_code: String,
    pub missing_fields: Vec<String>,
}

impl ProviderConfigError {
    fn new(provider: &str, mode: &str, reason_code: &str, missing_fields: Vec<String>) -> Self {
        Self {
            provider: provider.to_string(),
            mode: mode.to_string(),
            reason_code: reason_code.to_string(),
            missing_fields,
        }
    }
}

// ── Readiness ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ProviderReadiness {
    pub ready: bool,
    pub resolved_backend: String,
    /// ok | mock_mode | missing_or_invalid_config | invalid_mode
    pub reason: String,
    pub missing_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvidersReadiness {
    pub jira: ProviderReadiness,
    pub github: ProviderReadiness,
}

fn jira_missing_fields(config: &Config) -> Vec<String> {
    let mut missing = Vec::new();
    if !usable(&config.jira_url) {
        missing.push("JIRA_URL".to_string());
    }
    if !usable(&config.jira_username) {
        missing.push("JIRA_USERNAME".to_string());
    }
    if !usable(&config.jira_api_token) {
        missing.push("JIRA_API_TOKEN".to_string());
    }
    missing
}

fn github_missing_fields(config: &Config) -> Vec<String> {
    let mut missing = Vec::new();
    if !usable(&config.github_token) {
        missing.push("GITHUB_TOKEN".to_string());
    }
    if !usable(&config.github_owner) {
        missing.push("GITHUB_OWNER".to_string());
    }
    missing
}

fn readiness_for(
    provider: &str,
    mode: &str,
    mock_forced: bool,
    missing_fields: Vec<String>,
) -> ProviderReadiness {
    let mode = mode.trim().to_lowercase();
    if mock_forced || mode == "mock" {
        return ProviderReadiness {
            ready: true,
            resolved_backend: format!("{provider}_mock"),
            reason: "mock_mode".into(),
            missing_fields: Vec::new(),
        };
    }
    if mode != "api" {
        return ProviderReadiness {
            ready: false,
            resolved_backend: format!("{provider}_mock"),
            reason: "invalid_mode".into(),
            missing_fields: vec![format!("{}_INTEGRATION_MODE", provider.to_uppercase())],
        };
    }
    if missing_fields.is_empty() {
        ProviderReadiness {
            ready: true,
            resolved_backend: format!("{provider}_api"),
            reason: "ok".into(),
            missing_fields: Vec::new(),
        }
    } else {
        ProviderReadiness {
            ready: false,
            resolved_backend: format!("{provider}_api"),
            reason: "missing_or_invalid_config".into(),
            missing_fields,
        }
    }
}

/// Structured readiness report; a pure function of configuration.
pub fn get_provider_readiness(config: &Config) -> ProvidersReadiness {
    let mock_forced = config.effective_use_mock_providers();
    ProvidersReadiness {
        jira: readiness_for(
            "jira",
            &config.jira_integration_mode,
            mock_forced,
            jira_missing_fields(config),
        ),
        github: readiness_for(
            "github",
            &config.github_integration_mode,
            mock_forced,
            github_missing_fields(config),
        ),
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

pub fn get_ticket_provider(
    config: &Config,
) -> Result<(Arc<dyn TicketProvider>, String), ProviderConfigError> {
    if config.effective_use_mock_providers() {
        return Ok((Arc::new(MockTicketProvider), "jira_mock".into()));
    }
    match config.jira_integration_mode.trim().to_lowercase().as_str() {
        "mock" => Ok((Arc::new(MockTicketProvider), "jira_mock".into())),
        "api" => {
            let missing = jira_missing_fields(config);
            if !missing.is_empty() {
                return Err(ProviderConfigError::new(
                    "jira",
                    "api",
                    "missing_or_invalid_config",
                    missing,
                ));
            }
            let provider = JiraApiProvider::new(
                &config.jira_url,
                &config.jira_username,
                &config.jira_api_token,
                &config.jira_project_key,
                &config.jira_issue_type,
                config.jira_transition_strict,
                &config.jira_transition_aliases,
                config.jira_timeout_secs,
            )
            .map_err(|_| {
                ProviderConfigError::new(
                    "jira",
                    "api",
                    "missing_or_invalid_config",
                    vec!["JIRA_URL".into()],
                )
            })?;
            Ok((Arc::new(provider), "jira_api".into()))
        }
        other => Err(ProviderConfigError::new(
            "jira",
            other,
            "invalid_mode",
            vec!["JIRA_INTEGRATION_MODE".into()],
        )),
    }
}

pub fn get_code_provider(
    config: &Config,
) -> Result<(Arc<dyn CodeProvider>, String), ProviderConfigError> {
    if config.effective_use_mock_providers() {
        return Ok((Arc::new(MockCodeProvider), "github_mock".into()));
    }
    match config
        .github_integration_mode
        .trim()
        .to_lowercase()
        .as_str()
    {
        "mock" => Ok((Arc::new(MockCodeProvider), "github_mock".into())),
        "api" => {
            let missing = github_missing_fields(config);
            if !missing.is_empty() {
                return Err(ProviderConfigError::new(
                    "github",
                    "api",
                    "missing_or_invalid_config",
                    missing,
                ));
            }
            let provider = GithubApiProvider::new(
                &config.github_token,
                &config.github_owner,
                &config.github_default_base_branch,
                config.github_timeout_secs,
            )
            .map_err(|_| {
                ProviderConfigError::new(
                    "github",
                    "api",
                    "missing_or_invalid_config",
                    vec!["GITHUB_TOKEN".into()],
                )
            })?;
            Ok((Arc::new(provider), "github_api".into()))
        }
        other => Err(ProviderConfigError::new(
            "github",
            other,
            "invalid_mode",
            vec!["GITHUB_INTEGRATION_MODE".into()],
        )),
    }
}

/// Resolve the full provider pair for one pipeline run.
pub fn resolve_providers(config: &Config) -> Result<ResolvedProviders, ProviderConfigError> {
    let (ticket, ticket_backend) = get_ticket_provider(config)?;
    let (code, code_backend) = get_code_provider(config)?;
    Ok(ResolvedProviders {
        ticket,
        ticket_backend,
        code,
        code_backend,
    })
}
